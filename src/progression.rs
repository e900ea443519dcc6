use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::store::BracketTx;
use crate::types::{
  Match, MatchCondition, MatchId, MatchReport, MatchStatus, NewReport, ParticipantId,
  ReportId, ReviewDecision, ReviewStatus, Scores, Slot, SlotTarget,
};

/// How a propagation write treats an already-occupied target slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropagationPolicy {
  /// An occupied slot means the wiring or a previous write is wrong; fail.
  Strict,
  /// Fill empty slots only and skip occupied ones.
  BestEffort,
}

/// Reviewer recorded on reports closed by the engine rather than a person.
pub const SYSTEM_REVIEWER: &str = "system";

// ── Lifecycle transitions ──────────────────────────────────────────────

pub fn check_in(tx: &mut dyn BracketTx, match_id: MatchId, slot: Slot, now: DateTime<Utc>) -> Result<Match> {
  let mut row = tx.get_match(match_id)?;
  if matches!(
    row.status,
    MatchStatus::InProgress | MatchStatus::Verified | MatchStatus::Canceled
  ) {
    return Err(EngineError::InvalidTransition { operation: "check in", status: row.status });
  }
  if row.occupant(slot).is_none() {
    return Err(EngineError::PreconditionViolated(format!(
      "slot {slot:?} of match {} has no occupant",
      row.label
    )));
  }
  row.checked_in[slot.index()] = true;
  if row.status == MatchStatus::Pending && row.occupied_count() == 2 && row.checked_in == [true, true] {
    row.status = MatchStatus::Ready;
  }
  row.updated_at = now;
  tx.update_match(&row)?;
  Ok(row)
}

pub fn start_match(tx: &mut dyn BracketTx, match_id: MatchId, now: DateTime<Utc>) -> Result<Match> {
  let mut row = tx.get_match(match_id)?;
  if row.status != MatchStatus::Ready {
    return Err(EngineError::InvalidTransition { operation: "start", status: row.status });
  }
  row.status = MatchStatus::InProgress;
  row.started_at = Some(now);
  row.updated_at = now;
  tx.update_match(&row)?;
  Ok(row)
}

pub fn validate_scores(scores: Scores) -> Result<Slot> {
  if scores.p1 < 0 || scores.p2 < 0 {
    return Err(EngineError::InvalidInput("scores must not be negative".to_string()));
  }
  scores
    .leading_slot()
    .ok_or_else(|| EngineError::InvalidInput("tied scores cannot decide a winner".to_string()))
}

/// Winner implied by `scores`, which must name one of two present occupants.
fn implied_winner(row: &Match, scores: Scores) -> Result<ParticipantId> {
  let winner_slot = validate_scores(scores)?;
  let winner = row.occupant(winner_slot).ok_or_else(|| {
    EngineError::InvalidInput("the winner must be one of the match's occupants".to_string())
  })?;
  if row.occupant(winner_slot.other()).is_none() {
    return Err(EngineError::PreconditionViolated(format!(
      "match {} is missing an occupant",
      row.label
    )));
  }
  Ok(winner)
}

pub fn report_result(
  tx: &mut dyn BracketTx,
  match_id: MatchId,
  scores: Scores,
  reporter: &str,
  now: DateTime<Utc>,
) -> Result<MatchReport> {
  let mut row = tx.get_match(match_id)?;
  if row.status.is_terminal() {
    return Err(EngineError::InvalidTransition { operation: "report", status: row.status });
  }
  let winner = implied_winner(&row, scores)?;

  let superseded = tx.reject_active_reports(row.id, SYSTEM_REVIEWER, now);
  if !superseded.is_empty() {
    debug!("report on {} supersedes {:?}", row.label, superseded);
  }
  let report = tx.create_report(
    NewReport {
      match_id: row.id,
      reporter: reporter.to_string(),
      scores,
      winner,
      review: ReviewStatus::Pending,
      reviewer: None,
      reviewed_at: None,
    },
    now,
  )?;

  row.scores = Some(scores);
  row.status = MatchStatus::Reported;
  row.updated_at = now;
  tx.update_match(&row)?;
  Ok(report)
}

/// Applies a review. Returns the reviewed report and every match touched.
pub fn review_report(
  tx: &mut dyn BracketTx,
  report_id: ReportId,
  decision: ReviewDecision,
  reviewer: &str,
  now: DateTime<Utc>,
) -> Result<(MatchReport, Vec<MatchId>)> {
  let mut report = tx.get_report(report_id)?;
  if report.review != ReviewStatus::Pending {
    return Err(EngineError::ReportAlreadyReviewed { operation: "review", review: report.review });
  }
  let mut row = tx.get_match(report.match_id)?;
  if row.status != MatchStatus::Reported {
    return Err(EngineError::InvalidTransition { operation: "review", status: row.status });
  }

  report.reviewer = Some(reviewer.to_string());
  report.reviewed_at = Some(now);

  match decision {
    ReviewDecision::Reject => {
      report.review = ReviewStatus::Rejected;
      tx.update_report(&report)?;
      row.scores = None;
      row.status = MatchStatus::Pending;
      row.updated_at = now;
      tx.update_match(&row)?;
      Ok((report, vec![row.id]))
    }
    ReviewDecision::Approve => {
      if row.slot_of(report.winner).is_none() {
        return Err(EngineError::PreconditionViolated(format!(
          "reported winner {} no longer plays in {}",
          report.winner, row.label
        )));
      }
      report.review = ReviewStatus::Approved;
      tx.update_report(&report)?;

      row.winner = Some(report.winner);
      row.scores = Some(report.scores);
      row.completed_at = Some(now);
      row.status = MatchStatus::Verified;
      row.updated_at = now;
      tx.update_match(&row)?;
      info!("{} verified, winner {}", row.label, report.winner);

      let mut touched = vec![row.id];
      touched.extend(advance_verified(tx, &row, now)?);
      Ok((report, touched))
    }
  }
}

// ── Propagation ────────────────────────────────────────────────────────

/// Writes `participant` into `target`. Returns whether the slot was written.
pub fn place_occupant(
  tx: &mut dyn BracketTx,
  target: SlotTarget,
  participant: ParticipantId,
  policy: PropagationPolicy,
  now: DateTime<Utc>,
) -> Result<bool> {
  let mut row = tx.get_match(target.match_id)?;
  let existing = row.occupant(target.slot);
  if existing.is_some() || row.status.is_terminal() {
    return match policy {
      PropagationPolicy::Strict => {
        let detail = format!(
          "propagating {participant} into slot {:?} of {} found {:?} ({})",
          target.slot, row.label, existing, row.status
        );
        error!("{detail}");
        Err(EngineError::TopologyInvariantViolated(detail))
      }
      PropagationPolicy::BestEffort => {
        if existing != Some(participant) {
          warn!(
            "skipping advance of {participant} into {} slot {:?}: already {:?} ({})",
            row.label, target.slot, existing, row.status
          );
        }
        Ok(false)
      }
    };
  }
  row.occupants[target.slot.index()] = Some(participant);
  row.checked_in[target.slot.index()] = false;
  row.updated_at = now;
  tx.update_match(&row)?;
  debug!("placed {participant} into {} slot {:?}", row.label, target.slot);
  Ok(true)
}

/// Pushes a decided match's winner and loser along its forward pointers.
pub fn propagate(
  tx: &mut dyn BracketTx,
  row: &Match,
  policy: PropagationPolicy,
  now: DateTime<Utc>,
) -> Result<Vec<MatchId>> {
  let winner = row.winner.ok_or_else(|| {
    EngineError::TopologyInvariantViolated(format!("{} has no winner to propagate", row.label))
  })?;
  let mut touched = Vec::new();
  if let Some(target) = row.winner_next {
    if place_occupant(tx, target, winner, policy, now)? {
      touched.push(target.match_id);
    }
  }
  if let (Some(target), Some(loser)) = (row.loser_next, row.loser()) {
    if place_occupant(tx, target, loser, policy, now)? {
      touched.push(target.match_id);
    }
  }
  Ok(touched)
}

/// Strict propagation plus the grand-final rule, then bye resolution over
/// everything touched.
pub fn advance_verified(tx: &mut dyn BracketTx, row: &Match, now: DateTime<Utc>) -> Result<Vec<MatchId>> {
  let mut touched = propagate(tx, row, PropagationPolicy::Strict, now)?;
  if let Some(reset) = apply_grand_final_rule(tx, row, now)? {
    touched.push(reset);
  }
  touched.extend(crate::bye::resolve(tx, touched.clone(), now)?);
  Ok(touched)
}

/// Bracket-reset match that depends on `gf1_id`, if any.
pub fn find_reset_match(tx: &dyn BracketTx, gf1_id: MatchId) -> Option<(Match, Slot)> {
  tx.find_matches().into_iter().find_map(|m| match m.condition {
    Some(MatchCondition::GrandFinalReset { gf1_id: id, losers_slot }) if id == gf1_id => Some((m, losers_slot)),
    _ => None,
  })
}

/// Once GF1 is decided: a losers-side win activates a clean GF2 with both
/// finalists, a winners-side win closes GF2 unplayed.
pub fn apply_grand_final_rule(tx: &mut dyn BracketTx, gf1: &Match, now: DateTime<Utc>) -> Result<Option<MatchId>> {
  let Some((mut reset, losers_slot)) = find_reset_match(tx, gf1.id) else {
    return Ok(None);
  };
  let winner = match gf1.winner {
    Some(winner) if gf1.status == MatchStatus::Verified => winner,
    _ => return Ok(None),
  };
  let losers_side_won = gf1.occupied_count() == 2 && gf1.occupant(losers_slot) == Some(winner);

  tx.reject_active_reports(reset.id, SYSTEM_REVIEWER, now);
  reset.clear_result(now);
  reset.checked_in = [false, false];
  if losers_side_won {
    reset.occupants = gf1.occupants;
    info!("{} won from the losers side, {} is live", gf1.label, reset.label);
  } else {
    reset.occupants = [None, None];
    reset.status = MatchStatus::Canceled;
    info!("{} decided the event, {} will not be played", gf1.label, reset.label);
  }
  tx.update_match(&reset)?;
  Ok(Some(reset.id))
}

/// Returns a reset match to its unplayed shell while GF1 is undecided.
pub fn rewind_reset_match(
  tx: &mut dyn BracketTx,
  gf1_id: MatchId,
  actor: &str,
  now: DateTime<Utc>,
) -> Result<Option<MatchId>> {
  let Some((mut reset, _)) = find_reset_match(tx, gf1_id) else {
    return Ok(None);
  };
  tx.reject_active_reports(reset.id, actor, now);
  reset.clear_result(now);
  reset.occupants = [None, None];
  reset.checked_in = [false, false];
  tx.update_match(&reset)?;
  Ok(Some(reset.id))
}

// ── Corrections ────────────────────────────────────────────────────────

/// Organizer correction of a verified result. Appends an approved audit
/// report and cascades when the winner changes.
pub fn edit_verified_result(
  tx: &mut dyn BracketTx,
  match_id: MatchId,
  scores: Scores,
  editor: &str,
  now: DateTime<Utc>,
) -> Result<(MatchReport, Vec<MatchId>)> {
  let mut row = tx.get_match(match_id)?;
  if row.status != MatchStatus::Verified {
    return Err(EngineError::InvalidTransition { operation: "edit the result of", status: row.status });
  }
  if row.occupied_count() < 2 {
    return Err(EngineError::PreconditionViolated(format!(
      "match {} is missing an occupant",
      row.label
    )));
  }
  let new_winner = implied_winner(&row, scores)?;
  let old_winner = row.winner;

  row.scores = Some(scores);
  row.winner = Some(new_winner);
  row.completed_at = Some(now);
  row.status = MatchStatus::Verified;
  row.updated_at = now;
  tx.update_match(&row)?;

  tx.reject_active_reports(row.id, editor, now);
  let report = tx.create_report(
    NewReport {
      match_id: row.id,
      reporter: editor.to_string(),
      scores,
      winner: new_winner,
      review: ReviewStatus::Approved,
      reviewer: Some(editor.to_string()),
      reviewed_at: Some(now),
    },
    now,
  )?;

  let mut touched = vec![row.id];
  if old_winner != Some(new_winner) {
    info!("{} winner corrected from {:?} to {}", row.label, old_winner, new_winner);
    touched.extend(crate::cascade::invalidate_downstream(tx, &row, editor, now)?);
  }
  Ok((report, touched))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{BracketStore, ForwardPointers, MemoryStore, NewMatch};
  use crate::types::Partition;

  fn two_round_bracket(store: &MemoryStore) -> (MatchId, MatchId, MatchId) {
    store
      .transaction(1, |tx| {
        let spec = |label: &str, round: u32, slot_index: u32, occupants| NewMatch {
          partition: Partition::Winners,
          round,
          slot_index,
          label: label.to_string(),
          occupants,
        };
        let ids = tx.create_matches(
          vec![
            spec("W1", 1, 1, [Some(1), Some(4)]),
            spec("W1", 1, 2, [Some(2), Some(3)]),
            spec("W2", 2, 1, [None, None]),
          ],
          Utc::now(),
        )?;
        tx.wire_forward_pointers(vec![
          ForwardPointers {
            match_id: ids[0],
            winner_next: Some(SlotTarget { match_id: ids[2], slot: Slot::P1 }),
            loser_next: None,
            condition: None,
          },
          ForwardPointers {
            match_id: ids[1],
            winner_next: Some(SlotTarget { match_id: ids[2], slot: Slot::P2 }),
            loser_next: None,
            condition: None,
          },
        ])?;
        Ok((ids[0], ids[1], ids[2]))
      })
      .unwrap()
  }

  #[test]
  fn check_in_both_slots_makes_match_ready() {
    let store = MemoryStore::new();
    let (semi, _, _) = two_round_bracket(&store);
    let row = store.transaction(1, |tx| check_in(tx, semi, Slot::P1, Utc::now())).unwrap();
    assert_eq!(row.status, MatchStatus::Pending);
    let row = store.transaction(1, |tx| check_in(tx, semi, Slot::P2, Utc::now())).unwrap();
    assert_eq!(row.status, MatchStatus::Ready);

    let row = store.transaction(1, |tx| start_match(tx, semi, Utc::now())).unwrap();
    assert_eq!(row.status, MatchStatus::InProgress);
    let err = store.transaction(1, |tx| check_in(tx, semi, Slot::P1, Utc::now())).unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { status: MatchStatus::InProgress, .. }));
  }

  #[test]
  fn check_in_on_empty_slot_is_rejected() {
    let store = MemoryStore::new();
    let (_, _, final_id) = two_round_bracket(&store);
    let err = store.transaction(1, |tx| check_in(tx, final_id, Slot::P1, Utc::now())).unwrap_err();
    assert!(matches!(err, EngineError::PreconditionViolated(_)));
  }

  #[test]
  fn start_requires_ready() {
    let store = MemoryStore::new();
    let (semi, _, _) = two_round_bracket(&store);
    let err = store.transaction(1, |tx| start_match(tx, semi, Utc::now())).unwrap_err();
    assert_eq!(err.to_string(), "cannot start a match that is PENDING");
  }

  #[test]
  fn negative_scores_are_invalid() {
    assert!(matches!(validate_scores(Scores::new(-1, 2)), Err(EngineError::InvalidInput(_))));
    assert_eq!(validate_scores(Scores::new(0, 2)).unwrap(), Slot::P2);
  }

  #[test]
  fn report_then_approve_propagates_winner() {
    let store = MemoryStore::new();
    let (semi, _, final_id) = two_round_bracket(&store);
    let report = store
      .transaction(1, |tx| report_result(tx, semi, Scores::new(1, 3), "p4", Utc::now()))
      .unwrap();
    assert_eq!(report.winner, 4);

    let (reviewed, touched) = store
      .transaction(1, |tx| review_report(tx, report.id, ReviewDecision::Approve, "org", Utc::now()))
      .unwrap();
    assert_eq!(reviewed.review, ReviewStatus::Approved);
    assert!(touched.contains(&final_id));

    store
      .transaction(1, |tx| {
        let semi = tx.get_match(semi)?;
        assert_eq!(semi.status, MatchStatus::Verified);
        assert_eq!(semi.winner, Some(4));
        assert_eq!(tx.get_match(final_id)?.occupants, [Some(4), None]);
        Ok(())
      })
      .unwrap();
  }

  #[test]
  fn rejected_report_clears_provisional_scores() {
    let store = MemoryStore::new();
    let (semi, _, _) = two_round_bracket(&store);
    let report = store
      .transaction(1, |tx| report_result(tx, semi, Scores::new(3, 1), "p1", Utc::now()))
      .unwrap();
    store
      .transaction(1, |tx| review_report(tx, report.id, ReviewDecision::Reject, "org", Utc::now()))
      .unwrap();
    store
      .transaction(1, |tx| {
        let row = tx.get_match(semi)?;
        assert_eq!(row.status, MatchStatus::Pending);
        assert_eq!(row.scores, None);
        assert_eq!(tx.get_report(report.id)?.review, ReviewStatus::Rejected);
        Ok(())
      })
      .unwrap();
  }

  #[test]
  fn second_report_supersedes_first() {
    let store = MemoryStore::new();
    let (semi, _, _) = two_round_bracket(&store);
    let first = store
      .transaction(1, |tx| report_result(tx, semi, Scores::new(3, 1), "p1", Utc::now()))
      .unwrap();
    let second = store
      .transaction(1, |tx| report_result(tx, semi, Scores::new(1, 3), "p4", Utc::now()))
      .unwrap();
    let active = store
      .transaction(1, |tx| Ok(tx.reports_for_match(semi)))
      .unwrap()
      .into_iter()
      .filter(|r| r.is_active())
      .map(|r| r.id)
      .collect::<Vec<_>>();
    assert_eq!(active, vec![second.id]);
    let first = store.transaction(1, |tx| tx.get_report(first.id)).unwrap();
    assert_eq!(first.review, ReviewStatus::Rejected);
    assert_eq!(first.reviewer.as_deref(), Some(SYSTEM_REVIEWER));
  }

  #[test]
  fn reviewing_twice_is_an_invalid_transition() {
    let store = MemoryStore::new();
    let (semi, _, _) = two_round_bracket(&store);
    let report = store
      .transaction(1, |tx| report_result(tx, semi, Scores::new(3, 1), "p1", Utc::now()))
      .unwrap();
    store
      .transaction(1, |tx| review_report(tx, report.id, ReviewDecision::Reject, "org", Utc::now()))
      .unwrap();
    let err = store
      .transaction(1, |tx| review_report(tx, report.id, ReviewDecision::Approve, "org", Utc::now()))
      .unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
    assert_eq!(err.to_string(), "cannot review a report that is REJECTED");
  }

  #[test]
  fn strict_propagation_refuses_occupied_slot() {
    let store = MemoryStore::new();
    let (_, _, final_id) = two_round_bracket(&store);
    let target = SlotTarget { match_id: final_id, slot: Slot::P1 };
    let result = store.transaction(1, |tx| {
      place_occupant(tx, target, 1, PropagationPolicy::Strict, Utc::now())?;
      place_occupant(tx, target, 4, PropagationPolicy::Strict, Utc::now())
    });
    assert!(matches!(result, Err(EngineError::TopologyInvariantViolated(_))));

    let written = store
      .transaction(1, |tx| {
        place_occupant(tx, target, 1, PropagationPolicy::BestEffort, Utc::now())?;
        place_occupant(tx, target, 4, PropagationPolicy::BestEffort, Utc::now())
      })
      .unwrap();
    assert!(!written);
    let row = store.transaction(1, |tx| tx.get_match(final_id)).unwrap();
    assert_eq!(row.occupants, [Some(1), None]);
  }
}
