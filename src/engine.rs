use chrono::Utc;
use tracing::{error, info};

use crate::bye;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::progression::{self, PropagationPolicy};
use crate::store::{BracketStore, BracketTx, ForwardPointers, NewMatch};
use crate::topology::{self, NodeCondition};
use crate::types::{
    Actor, BracketFormat, BracketView, Match, MatchCondition, MatchId, MatchReport, MatchStatus,
    ParticipantId, ReportId, ReportOutcome, ReviewDecision, Scores, Slot, SlotTarget, TournamentId,
};

/// Public entry point. Each operation runs inside exactly one store
/// transaction, so a failure anywhere leaves the bracket untouched.
pub struct BracketEngine<S> {
    store: S,
    config: EngineConfig,
}

impl<S: BracketStore> BracketEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        BracketEngine { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn authorize(actor: &Actor) -> Result<()> {
        if actor.authorized {
            Ok(())
        } else {
            Err(EngineError::Forbidden { actor: actor.id.clone() })
        }
    }

    fn on_match<R>(
        &self,
        match_id: MatchId,
        f: impl FnOnce(&mut dyn BracketTx) -> Result<R>,
    ) -> Result<R> {
        let tournament = self.store.locate_match(match_id)?;
        logged(self.store.transaction(tournament, f))
    }

    /// Replaces the tournament's matches with a freshly built bracket.
    /// Refused once any match carries a played or reported result.
    pub fn generate_bracket(
        &self,
        actor: &Actor,
        tournament: TournamentId,
        format: BracketFormat,
    ) -> Result<BracketView> {
        Self::authorize(actor)?;
        let config = self.config.clone();
        logged(self.store.transaction(tournament, |tx| {
            if let Some(played) = tx.find_matches().into_iter().find(|m| m.has_result()) {
                return Err(EngineError::PreconditionViolated(format!(
                    "match {} already has a result; brackets cannot be regenerated",
                    played.label
                )));
            }
            let seeds: Vec<ParticipantId> = tx.load_participants().iter().map(|p| p.id).collect();
            let plan = topology::build_plan(&seeds, format, &config)?;
            let now = Utc::now();

            let removed = tx.delete_matches();
            let specs = plan
                .nodes
                .iter()
                .map(|node| NewMatch {
                    partition: node.partition,
                    round: node.round,
                    slot_index: node.slot_index,
                    label: node.label.clone(),
                    occupants: node.occupants,
                })
                .collect();
            let ids = tx.create_matches(specs, now)?;

            let target = |t: topology::NodeTarget| SlotTarget { match_id: ids[t.node], slot: t.slot };
            let wiring = plan
                .nodes
                .iter()
                .zip(ids.iter())
                .map(|(node, id)| ForwardPointers {
                    match_id: *id,
                    winner_next: node.winner_next.map(target),
                    loser_next: node.loser_next.map(target),
                    condition: node.condition.map(|c| match c {
                        NodeCondition::GrandFinalReset { gf1, losers_slot } => {
                            MatchCondition::GrandFinalReset { gf1_id: ids[gf1], losers_slot }
                        }
                    }),
                })
                .collect();
            tx.wire_forward_pointers(wiring)?;

            let byes = bye::resolve(tx, ids.iter().copied(), now)?;
            info!(
                "tournament {tournament}: generated {:?} bracket for {} participants ({} matches, {} auto-resolved, {} replaced)",
                format,
                seeds.len(),
                ids.len(),
                byes.len(),
                removed
            );
            Ok(view(tx))
        }))
    }

    pub fn check_in(&self, actor: &Actor, match_id: MatchId, slot: Slot) -> Result<Match> {
        Self::authorize(actor)?;
        self.on_match(match_id, |tx| progression::check_in(tx, match_id, slot, Utc::now()))
    }

    pub fn start_match(&self, actor: &Actor, match_id: MatchId) -> Result<Match> {
        Self::authorize(actor)?;
        self.on_match(match_id, |tx| progression::start_match(tx, match_id, Utc::now()))
    }

    pub fn report_result(&self, actor: &Actor, match_id: MatchId, scores: Scores) -> Result<MatchReport> {
        Self::authorize(actor)?;
        self.on_match(match_id, |tx| {
            progression::report_result(tx, match_id, scores, &actor.id, Utc::now())
        })
    }

    pub fn review_report(
        &self,
        actor: &Actor,
        report_id: ReportId,
        decision: ReviewDecision,
    ) -> Result<ReportOutcome> {
        Self::authorize(actor)?;
        let tournament = self.store.locate_report(report_id)?;
        logged(self.store.transaction(tournament, |tx| {
            let (report, touched) = progression::review_report(tx, report_id, decision, &actor.id, Utc::now())?;
            Ok(ReportOutcome { report, updated: reload(tx, touched)? })
        }))
    }

    /// Organizer correction of a verified result, cascading downstream when
    /// the winner flips.
    pub fn edit_verified_result(&self, actor: &Actor, match_id: MatchId, scores: Scores) -> Result<ReportOutcome> {
        Self::authorize(actor)?;
        self.on_match(match_id, |tx| {
            let (report, touched) = progression::edit_verified_result(tx, match_id, scores, &actor.id, Utc::now())?;
            Ok(ReportOutcome { report, updated: reload(tx, touched)? })
        })
    }

    /// Re-pushes a verified match's outcome into whichever downstream slots
    /// are still empty. Occupied slots are left alone.
    pub fn advance_winner(&self, actor: &Actor, match_id: MatchId) -> Result<Vec<Match>> {
        Self::authorize(actor)?;
        self.on_match(match_id, |tx| {
            let row = tx.get_match(match_id)?;
            if row.status != MatchStatus::Verified {
                return Err(EngineError::InvalidTransition { operation: "advance", status: row.status });
            }
            let now = Utc::now();
            let mut touched = progression::propagate(tx, &row, PropagationPolicy::BestEffort, now)?;
            touched.extend(bye::resolve(tx, touched.clone(), now)?);
            reload(tx, touched)
        })
    }

    pub fn bracket_view(&self, tournament: TournamentId) -> Result<BracketView> {
        logged(self.store.read(tournament, |tx| Ok(view(tx))))
    }
}

fn logged<R>(result: Result<R>) -> Result<R> {
    if let Err(err) = &result {
        if err.is_internal() {
            error!("bracket operation failed: {err}");
        }
    }
    result
}

/// Re-reads touched rows, deduplicated, in the order first touched.
fn reload(tx: &dyn BracketTx, touched: Vec<MatchId>) -> Result<Vec<Match>> {
    let mut seen = std::collections::HashSet::new();
    touched
        .into_iter()
        .filter(|id| seen.insert(*id))
        .map(|id| tx.get_match(id))
        .collect()
}

fn view(tx: &dyn BracketTx) -> BracketView {
    let mut matches = tx.find_matches();
    matches.sort_by_key(|m| (m.partition, m.round, m.slot_index, m.id));
    BracketView {
        tournament_id: tx.tournament_id(),
        champion: champion(&matches),
        matches,
    }
}

/// Winner of the last match that can still be played.
fn champion(matches: &[Match]) -> Option<ParticipantId> {
    let sink = matches
        .iter()
        .find(|m| m.winner_next.is_none() && m.loser_next.is_none() && m.condition.is_none())?;
    let reset = matches.iter().find(|m| {
        matches!(m.condition, Some(MatchCondition::GrandFinalReset { gf1_id, .. }) if gf1_id == sink.id)
    });
    match reset {
        Some(reset) if reset.status == MatchStatus::Verified => reset.winner,
        Some(reset) if reset.status != MatchStatus::Canceled => None,
        _ if sink.status == MatchStatus::Verified => sink.winner,
        _ => None,
    }
}
