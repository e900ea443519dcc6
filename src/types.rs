use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Ids ────────────────────────────────────────────────────────────────

pub type TournamentId = u64;
pub type ParticipantId = u32;
pub type MatchId = u64;
pub type ReportId = u64;

// ── Participants ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub tournament_id: TournamentId,
    pub name: String,
    pub seed: u32,
    pub checked_in: bool,
}

// ── Bracket enums ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BracketFormat {
    SingleElimination,
    DoubleElimination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Partition {
    Winners,
    Losers,
    Finals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Pending,
    Ready,
    InProgress,
    Reported,
    Verified,
    Canceled,
}

impl MatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchStatus::Verified | MatchStatus::Canceled)
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MatchStatus::Pending => "PENDING",
            MatchStatus::Ready => "READY",
            MatchStatus::InProgress => "IN_PROGRESS",
            MatchStatus::Reported => "REPORTED",
            MatchStatus::Verified => "VERIFIED",
            MatchStatus::Canceled => "CANCELED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Slot {
    P1,
    P2,
}

impl Slot {
    pub fn index(self) -> usize {
        match self {
            Slot::P1 => 0,
            Slot::P2 => 1,
        }
    }

    pub fn other(self) -> Slot {
        match self {
            Slot::P1 => Slot::P2,
            Slot::P2 => Slot::P1,
        }
    }

    /// Slot fed by the match at `slot_index` (1-based) of the previous round.
    pub fn from_slot_index(slot_index: u32) -> Slot {
        if slot_index % 2 == 1 {
            Slot::P1
        } else {
            Slot::P2
        }
    }

    pub const BOTH: [Slot; 2] = [Slot::P1, Slot::P2];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReviewStatus::Pending => "PENDING",
            ReviewStatus::Approved => "APPROVED",
            ReviewStatus::Rejected => "REJECTED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

// ── Matches ────────────────────────────────────────────────────────────

/// Where a decided winner or loser lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotTarget {
    pub match_id: MatchId,
    pub slot: Slot,
}

/// Activation rule that is not expressed as a forward pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum MatchCondition {
    GrandFinalReset { gf1_id: MatchId, losers_slot: Slot },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scores {
    pub p1: i32,
    pub p2: i32,
}

impl Scores {
    pub fn new(p1: i32, p2: i32) -> Self {
        Scores { p1, p2 }
    }

    pub fn get(&self, slot: Slot) -> i32 {
        match slot {
            Slot::P1 => self.p1,
            Slot::P2 => self.p2,
        }
    }

    /// Slot holding the higher score; `None` on a tie.
    pub fn leading_slot(&self) -> Option<Slot> {
        if self.p1 > self.p2 {
            Some(Slot::P1)
        } else if self.p2 > self.p1 {
            Some(Slot::P2)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub id: MatchId,
    pub tournament_id: TournamentId,
    pub partition: Partition,
    pub round: u32,
    pub slot_index: u32,
    pub label: String,
    pub occupants: [Option<ParticipantId>; 2],
    pub checked_in: [bool; 2],
    pub winner: Option<ParticipantId>,
    pub scores: Option<Scores>,
    pub status: MatchStatus,
    pub winner_next: Option<SlotTarget>,
    pub loser_next: Option<SlotTarget>,
    pub condition: Option<MatchCondition>,
    pub bye: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Match {
    pub fn occupant(&self, slot: Slot) -> Option<ParticipantId> {
        self.occupants[slot.index()]
    }

    pub fn occupied_count(&self) -> usize {
        self.occupants.iter().filter(|o| o.is_some()).count()
    }

    pub fn slot_of(&self, participant: ParticipantId) -> Option<Slot> {
        Slot::BOTH
            .into_iter()
            .find(|slot| self.occupant(*slot) == Some(participant))
    }

    /// The occupant who did not win, once a winner is recorded and both slots are filled.
    pub fn loser(&self) -> Option<ParticipantId> {
        let winner = self.winner?;
        let slot = self.slot_of(winner)?;
        self.occupant(slot.other())
    }

    /// Any played outcome, provisional or final. Bye resolutions are not results.
    pub fn has_result(&self) -> bool {
        if self.bye {
            return false;
        }
        self.winner.is_some() || self.scores.is_some() || self.completed_at.is_some()
    }

    /// Clears winner, scores and timing, returning the match to `PENDING`.
    pub fn clear_result(&mut self, now: DateTime<Utc>) {
        self.winner = None;
        self.scores = None;
        self.scheduled_at = None;
        self.started_at = None;
        self.completed_at = None;
        self.bye = false;
        self.status = MatchStatus::Pending;
        self.updated_at = now;
    }

    pub fn is_grand_final_reset(&self) -> bool {
        matches!(self.condition, Some(MatchCondition::GrandFinalReset { .. }))
    }
}

// ── Reports ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchReport {
    pub id: ReportId,
    pub match_id: MatchId,
    pub reporter: String,
    pub scores: Scores,
    pub winner: ParticipantId,
    pub review: ReviewStatus,
    pub reviewer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl MatchReport {
    pub fn is_active(&self) -> bool {
        self.review != ReviewStatus::Rejected
    }
}

#[derive(Debug, Clone)]
pub struct NewReport {
    pub match_id: MatchId,
    pub reporter: String,
    pub scores: Scores,
    pub winner: ParticipantId,
    pub review: ReviewStatus,
    pub reviewer: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

// ── Actors ─────────────────────────────────────────────────────────────

/// Capability handed to every mutating operation. Authorization happens
/// upstream; the engine only honours the verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub authorized: bool,
}

impl Actor {
    pub fn authorized(id: impl Into<String>) -> Self {
        Actor { id: id.into(), authorized: true }
    }

    pub fn denied(id: impl Into<String>) -> Self {
        Actor { id: id.into(), authorized: false }
    }
}

// ── Projections ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketView {
    pub tournament_id: TournamentId,
    pub matches: Vec<Match>,
    pub champion: Option<ParticipantId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOutcome {
    pub report: MatchReport,
    pub updated: Vec<Match>,
}
