//! Persistence boundary for bracket records.
//!
//! The engine never holds records between calls; every operation opens a
//! transaction scoped to one tournament, reads and writes rows through
//! [`BracketTx`], and the store commits only when the closure succeeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use crate::error::{EngineError, Result};
use crate::types::{
    Match, MatchCondition, MatchId, MatchReport, MatchStatus, NewReport, Participant,
    ParticipantId, Partition, ReportId, ReviewStatus, Slot, SlotTarget, TournamentId,
};

// ── Row specs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewMatch {
    pub partition: Partition,
    pub round: u32,
    pub slot_index: u32,
    pub label: String,
    pub occupants: [Option<ParticipantId>; 2],
}

#[derive(Debug, Clone)]
pub struct ForwardPointers {
    pub match_id: MatchId,
    pub winner_next: Option<SlotTarget>,
    pub loser_next: Option<SlotTarget>,
    pub condition: Option<MatchCondition>,
}

// ── Boundary traits ────────────────────────────────────────────────────

/// Row access inside one tournament-scoped transaction.
pub trait BracketTx {
    fn tournament_id(&self) -> TournamentId;

    /// Checked-in participants ordered by seed.
    fn load_participants(&self) -> Vec<Participant>;

    fn create_matches(&mut self, specs: Vec<NewMatch>, now: DateTime<Utc>) -> Result<Vec<MatchId>>;

    fn wire_forward_pointers(&mut self, wiring: Vec<ForwardPointers>) -> Result<()>;

    /// Removes every match of the tournament. Reports stay as audit history.
    fn delete_matches(&mut self) -> usize;

    fn get_match(&self, id: MatchId) -> Result<Match>;

    fn update_match(&mut self, updated: &Match) -> Result<()>;

    fn find_matches(&self) -> Vec<Match>;

    /// True when a non-terminal match can still deliver an occupant into `slot`.
    fn has_pending_inbound(&self, id: MatchId, slot: Slot) -> bool;

    fn create_report(&mut self, report: NewReport, now: DateTime<Utc>) -> Result<MatchReport>;

    fn get_report(&self, id: ReportId) -> Result<MatchReport>;

    fn update_report(&mut self, updated: &MatchReport) -> Result<()>;

    /// Marks every non-rejected report of the match as rejected.
    fn reject_active_reports(&mut self, match_id: MatchId, reviewer: &str, now: DateTime<Utc>) -> Vec<ReportId>;

    fn reports_for_match(&self, match_id: MatchId) -> Vec<MatchReport>;
}

pub trait BracketStore: Send + Sync {
    fn locate_match(&self, id: MatchId) -> Result<TournamentId>;

    fn locate_report(&self, id: ReportId) -> Result<TournamentId>;

    /// Runs `f` with exclusive access to the tournament's rows. Nothing is
    /// persisted unless `f` returns `Ok`.
    fn transaction<R, F>(&self, tournament: TournamentId, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn BracketTx) -> Result<R>;

    /// Read-only access. An unknown tournament reads as empty and is not
    /// created.
    fn read<R, F>(&self, tournament: TournamentId, f: F) -> Result<R>
    where
        F: FnOnce(&dyn BracketTx) -> Result<R>;
}

// ── In-memory store ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentTables {
    pub participants: Vec<Participant>,
    pub matches: BTreeMap<MatchId, Match>,
    pub reports: BTreeMap<ReportId, MatchReport>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    next_participant_id: u32,
    next_match_id: u64,
    next_report_id: u64,
    tournaments: BTreeMap<TournamentId, TournamentTables>,
}

type SharedTables = Arc<Mutex<TournamentTables>>;

#[derive(Default)]
pub struct MemoryStore {
    tournaments: Mutex<HashMap<TournamentId, SharedTables>>,
    match_index: Mutex<HashMap<MatchId, TournamentId>>,
    report_index: Mutex<HashMap<ReportId, TournamentId>>,
    next_participant_id: AtomicU32,
    next_match_id: AtomicU64,
    next_report_id: AtomicU64,
    snapshot_lock: Mutex<()>,
}

fn poisoned<E: std::fmt::Display>(err: E) -> EngineError {
    EngineError::Storage(err.to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn tables(&self, tournament: TournamentId) -> Result<SharedTables> {
        let mut guard = self.tournaments.lock().map_err(poisoned)?;
        Ok(guard.entry(tournament).or_default().clone())
    }

    /// Registration stand-in for the roster service.
    pub fn register_participant(
        &self,
        tournament: TournamentId,
        name: impl Into<String>,
        seed: u32,
        checked_in: bool,
    ) -> Result<Participant> {
        if seed == 0 {
            return Err(EngineError::InvalidInput("seed must be a positive integer".to_string()));
        }
        let tables = self.tables(tournament)?;
        let mut guard = tables.lock().map_err(poisoned)?;
        let participant = Participant {
            id: self.next_participant_id.fetch_add(1, Ordering::SeqCst) + 1,
            tournament_id: tournament,
            name: name.into(),
            seed,
            checked_in,
        };
        guard.participants.push(participant.clone());
        Ok(participant)
    }

    pub fn set_participant_checked_in(
        &self,
        tournament: TournamentId,
        participant: ParticipantId,
        checked_in: bool,
    ) -> Result<Participant> {
        let tables = self.tables(tournament)?;
        let mut guard = tables.lock().map_err(poisoned)?;
        let entry = guard
            .participants
            .iter_mut()
            .find(|p| p.id == participant)
            .ok_or_else(|| EngineError::not_found("participant", participant))?;
        entry.checked_in = checked_in;
        Ok(entry.clone())
    }

    /// Writes every tournament to `path` through a temp file and rename.
    /// Concurrent saves are serialized, so a later save always carries the
    /// later state.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let _writer = self.snapshot_lock.lock().map_err(poisoned)?;
        let handles: Vec<(TournamentId, SharedTables)> = {
            let guard = self.tournaments.lock().map_err(poisoned)?;
            guard.iter().map(|(id, tables)| (*id, tables.clone())).collect()
        };
        let mut tournaments = BTreeMap::new();
        for (id, tables) in handles {
            let guard = tables.lock().map_err(poisoned)?;
            tournaments.insert(id, guard.clone());
        }
        // Counters are read after the copies so they cover every copied id.
        let snapshot = Snapshot {
            next_participant_id: self.next_participant_id.load(Ordering::SeqCst),
            next_match_id: self.next_match_id.load(Ordering::SeqCst),
            next_report_id: self.next_report_id.load(Ordering::SeqCst),
            tournaments,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(&snapshot)?;
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        fs::write(&staging, payload)?;
        fs::rename(&staging, path)?;
        Ok(())
    }

    pub fn load_snapshot(path: &Path) -> Result<MemoryStore> {
        let data = fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&data)?;
        // Never hand out an id that is already stored, whatever the counters say.
        let tables = snapshot.tournaments.values();
        let max_participant = tables.clone().flat_map(|t| t.participants.iter().map(|p| p.id)).max();
        let max_match = tables.clone().flat_map(|t| t.matches.keys().copied()).max();
        let max_report = tables.flat_map(|t| t.reports.keys().copied()).max();
        let store = MemoryStore {
            next_participant_id: AtomicU32::new(snapshot.next_participant_id.max(max_participant.unwrap_or(0))),
            next_match_id: AtomicU64::new(snapshot.next_match_id.max(max_match.unwrap_or(0))),
            next_report_id: AtomicU64::new(snapshot.next_report_id.max(max_report.unwrap_or(0))),
            ..MemoryStore::default()
        };
        {
            let mut tournaments = store.tournaments.lock().map_err(poisoned)?;
            let mut match_index = store.match_index.lock().map_err(poisoned)?;
            let mut report_index = store.report_index.lock().map_err(poisoned)?;
            for (id, tables) in snapshot.tournaments {
                match_index.extend(tables.matches.keys().map(|m| (*m, id)));
                report_index.extend(tables.reports.keys().map(|r| (*r, id)));
                tournaments.insert(id, Arc::new(Mutex::new(tables)));
            }
        }
        Ok(store)
    }
}

impl BracketStore for MemoryStore {
    fn locate_match(&self, id: MatchId) -> Result<TournamentId> {
        let guard = self.match_index.lock().map_err(poisoned)?;
        guard.get(&id).copied().ok_or_else(|| EngineError::not_found("match", id))
    }

    fn locate_report(&self, id: ReportId) -> Result<TournamentId> {
        let guard = self.report_index.lock().map_err(poisoned)?;
        guard.get(&id).copied().ok_or_else(|| EngineError::not_found("report", id))
    }

    fn transaction<R, F>(&self, tournament: TournamentId, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn BracketTx) -> Result<R>,
    {
        let tables = self.tables(tournament)?;
        // Held for the whole transaction: serializes writers per tournament.
        let mut committed = tables.lock().map_err(poisoned)?;
        let mut tx = MemoryTx {
            tournament,
            tables: committed.clone(),
            next_match_id: &self.next_match_id,
            next_report_id: &self.next_report_id,
            created_matches: Vec::new(),
            deleted_matches: Vec::new(),
            created_reports: Vec::new(),
        };
        let value = f(&mut tx)?;

        let MemoryTx {
            tables: working,
            created_matches,
            deleted_matches,
            created_reports,
            ..
        } = tx;
        {
            let mut match_index = self.match_index.lock().map_err(poisoned)?;
            for id in deleted_matches {
                match_index.remove(&id);
            }
            match_index.extend(created_matches.into_iter().map(|id| (id, tournament)));
            let mut report_index = self.report_index.lock().map_err(poisoned)?;
            report_index.extend(created_reports.into_iter().map(|id| (id, tournament)));
        }
        *committed = working;
        Ok(value)
    }

    fn read<R, F>(&self, tournament: TournamentId, f: F) -> Result<R>
    where
        F: FnOnce(&dyn BracketTx) -> Result<R>,
    {
        let shared = {
            let guard = self.tournaments.lock().map_err(poisoned)?;
            guard.get(&tournament).cloned()
        };
        let tables = match shared {
            Some(tables) => tables.lock().map_err(poisoned)?.clone(),
            None => TournamentTables::default(),
        };
        let tx = MemoryTx {
            tournament,
            tables,
            next_match_id: &self.next_match_id,
            next_report_id: &self.next_report_id,
            created_matches: Vec::new(),
            deleted_matches: Vec::new(),
            created_reports: Vec::new(),
        };
        f(&tx)
    }
}

struct MemoryTx<'a> {
    tournament: TournamentId,
    tables: TournamentTables,
    next_match_id: &'a AtomicU64,
    next_report_id: &'a AtomicU64,
    created_matches: Vec<MatchId>,
    deleted_matches: Vec<MatchId>,
    created_reports: Vec<ReportId>,
}

impl BracketTx for MemoryTx<'_> {
    fn tournament_id(&self) -> TournamentId {
        self.tournament
    }

    fn load_participants(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> = self
            .tables
            .participants
            .iter()
            .filter(|p| p.checked_in)
            .cloned()
            .collect();
        participants.sort_by_key(|p| (p.seed, p.id));
        participants
    }

    fn create_matches(&mut self, specs: Vec<NewMatch>, now: DateTime<Utc>) -> Result<Vec<MatchId>> {
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = self.next_match_id.fetch_add(1, Ordering::SeqCst) + 1;
            if self.tables.matches.contains_key(&id) {
                return Err(EngineError::Storage(format!("match id {id} is already in use")));
            }
            self.tables.matches.insert(
                id,
                Match {
                    id,
                    tournament_id: self.tournament,
                    partition: spec.partition,
                    round: spec.round,
                    slot_index: spec.slot_index,
                    label: spec.label,
                    occupants: spec.occupants,
                    checked_in: [false, false],
                    winner: None,
                    scores: None,
                    status: MatchStatus::Pending,
                    winner_next: None,
                    loser_next: None,
                    condition: None,
                    bye: false,
                    scheduled_at: None,
                    started_at: None,
                    completed_at: None,
                    updated_at: now,
                },
            );
            self.created_matches.push(id);
            ids.push(id);
        }
        Ok(ids)
    }

    fn wire_forward_pointers(&mut self, wiring: Vec<ForwardPointers>) -> Result<()> {
        for pointers in wiring {
            for target in [pointers.winner_next, pointers.loser_next].into_iter().flatten() {
                if !self.tables.matches.contains_key(&target.match_id) {
                    return Err(EngineError::TopologyInvariantViolated(format!(
                        "match {} points at missing match {}",
                        pointers.match_id, target.match_id
                    )));
                }
            }
            let row = self
                .tables
                .matches
                .get_mut(&pointers.match_id)
                .ok_or_else(|| EngineError::not_found("match", pointers.match_id))?;
            row.winner_next = pointers.winner_next;
            row.loser_next = pointers.loser_next;
            row.condition = pointers.condition;
        }
        Ok(())
    }

    fn delete_matches(&mut self) -> usize {
        let removed = std::mem::take(&mut self.tables.matches);
        self.created_matches.retain(|id| !removed.contains_key(id));
        self.deleted_matches.extend(removed.keys().copied());
        removed.len()
    }

    fn get_match(&self, id: MatchId) -> Result<Match> {
        self.tables
            .matches
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("match", id))
    }

    fn update_match(&mut self, updated: &Match) -> Result<()> {
        let row = self
            .tables
            .matches
            .get_mut(&updated.id)
            .ok_or_else(|| EngineError::not_found("match", updated.id))?;
        *row = updated.clone();
        Ok(())
    }

    fn find_matches(&self) -> Vec<Match> {
        self.tables.matches.values().cloned().collect()
    }

    fn has_pending_inbound(&self, id: MatchId, slot: Slot) -> bool {
        let wanted = SlotTarget { match_id: id, slot };
        let reset_source = self.tables.matches.get(&id).and_then(|m| match m.condition {
            Some(MatchCondition::GrandFinalReset { gf1_id, .. }) => Some(gf1_id),
            None => None,
        });
        self.tables.matches.values().any(|source| {
            !source.status.is_terminal()
                && (source.winner_next == Some(wanted)
                    || source.loser_next == Some(wanted)
                    || reset_source == Some(source.id))
        })
    }

    fn create_report(&mut self, report: NewReport, now: DateTime<Utc>) -> Result<MatchReport> {
        if !self.tables.matches.contains_key(&report.match_id) {
            return Err(EngineError::not_found("match", report.match_id));
        }
        let id = self.next_report_id.fetch_add(1, Ordering::SeqCst) + 1;
        let row = MatchReport {
            id,
            match_id: report.match_id,
            reporter: report.reporter,
            scores: report.scores,
            winner: report.winner,
            review: report.review,
            reviewer: report.reviewer,
            created_at: now,
            reviewed_at: report.reviewed_at,
        };
        self.tables.reports.insert(id, row.clone());
        self.created_reports.push(id);
        Ok(row)
    }

    fn get_report(&self, id: ReportId) -> Result<MatchReport> {
        self.tables
            .reports
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("report", id))
    }

    fn update_report(&mut self, updated: &MatchReport) -> Result<()> {
        let row = self
            .tables
            .reports
            .get_mut(&updated.id)
            .ok_or_else(|| EngineError::not_found("report", updated.id))?;
        *row = updated.clone();
        Ok(())
    }

    fn reject_active_reports(&mut self, match_id: MatchId, reviewer: &str, now: DateTime<Utc>) -> Vec<ReportId> {
        let mut rejected = Vec::new();
        for report in self.tables.reports.values_mut() {
            if report.match_id == match_id && report.is_active() {
                report.review = ReviewStatus::Rejected;
                report.reviewer = Some(reviewer.to_string());
                report.reviewed_at = Some(now);
                rejected.push(report.id);
            }
        }
        rejected
    }

    fn reports_for_match(&self, match_id: MatchId) -> Vec<MatchReport> {
        self.tables
            .reports
            .values()
            .filter(|r| r.match_id == match_id)
            .cloned()
            .collect()
    }
}
