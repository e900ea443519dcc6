//! Invalidation of downstream results after a verified winner is corrected.
//!
//! The corrected match's new winner and loser overwrite the slots its
//! forward pointers name. Any match reached that already carried a result
//! (played, provisional, bye or canceled) is cleared back to `PENDING`, and
//! the slots it had filled further on are emptied in turn. The walk stops at
//! matches that had not produced anything yet.

use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

use crate::error::Result;
use crate::progression;
use crate::store::BracketTx;
use crate::types::{Match, MatchId, MatchStatus, ParticipantId, SlotTarget};

fn carries_outcome(row: &Match) -> bool {
  row.winner.is_some()
    || row.scores.is_some()
    || row.completed_at.is_some()
    || row.status == MatchStatus::Canceled
}

/// Rewrites everything downstream of `edited`, whose winner just changed.
/// Returns the touched match ids, bye re-resolutions included.
pub fn invalidate_downstream(
  tx: &mut dyn BracketTx,
  edited: &Match,
  editor: &str,
  now: DateTime<Utc>,
) -> Result<Vec<MatchId>> {
  let mut queue: VecDeque<(SlotTarget, Option<ParticipantId>)> = VecDeque::new();
  if let Some(target) = edited.winner_next {
    queue.push_back((target, edited.winner));
  }
  if let Some(target) = edited.loser_next {
    queue.push_back((target, edited.loser()));
  }

  let mut touched = Vec::new();
  if let Some(reset) = progression::apply_grand_final_rule(tx, edited, now)? {
    touched.push(reset);
  }

  let mut visited = HashSet::new();
  while let Some((target, carry)) = queue.pop_front() {
    if !visited.insert(target) {
      continue;
    }
    let mut row = tx.get_match(target.match_id)?;
    row.occupants[target.slot.index()] = carry;
    row.checked_in[target.slot.index()] = false;
    row.updated_at = now;
    touched.push(row.id);

    if !carries_outcome(&row) {
      if matches!(row.status, MatchStatus::Ready | MatchStatus::InProgress) {
        row.status = MatchStatus::Pending;
        row.started_at = None;
      }
      tx.update_match(&row)?;
      debug!("{} slot {:?} now holds {:?}", row.label, target.slot, carry);
      continue;
    }

    let fed_forward = row.status.is_terminal();
    row.clear_result(now);
    tx.update_match(&row)?;
    let rejected = tx.reject_active_reports(row.id, editor, now);
    info!(
      "{} invalidated by correction, {} report(s) rejected",
      row.label,
      rejected.len()
    );

    if let Some(reset) = progression::rewind_reset_match(tx, row.id, editor, now)? {
      touched.push(reset);
    }
    if fed_forward {
      for next in [row.winner_next, row.loser_next].into_iter().flatten() {
        queue.push_back((next, None));
      }
    }
  }

  touched.extend(crate::bye::resolve(tx, touched.clone(), now)?);
  Ok(touched)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{BracketStore, ForwardPointers, MemoryStore, NewMatch};
  use crate::types::{Partition, ReviewDecision, ReviewStatus, Scores, Slot};

  /// 1 v 4 and 2 v 3 feeding a final.
  fn four_player(store: &MemoryStore) -> [MatchId; 3] {
    store
      .transaction(1, |tx| {
        let node = |round: u32, slot_index: u32, occupants| NewMatch {
          partition: Partition::Winners,
          round,
          slot_index,
          label: format!("W{round}-{slot_index}"),
          occupants,
        };
        let ids = tx.create_matches(
          vec![node(1, 1, [Some(1), Some(4)]), node(1, 2, [Some(2), Some(3)]), node(2, 1, [None, None])],
          Utc::now(),
        )?;
        let feed = |from: MatchId, slot| ForwardPointers {
          match_id: from,
          winner_next: Some(SlotTarget { match_id: ids[2], slot }),
          loser_next: None,
          condition: None,
        };
        tx.wire_forward_pointers(vec![feed(ids[0], Slot::P1), feed(ids[1], Slot::P2)])?;
        Ok([ids[0], ids[1], ids[2]])
      })
      .unwrap()
  }

  fn play(store: &MemoryStore, id: MatchId, scores: Scores) {
    store
      .transaction(1, |tx| {
        let report = progression::report_result(tx, id, scores, "player", Utc::now())?;
        progression::review_report(tx, report.id, ReviewDecision::Approve, "org", Utc::now())
      })
      .unwrap();
  }

  #[test]
  fn correcting_a_semifinal_clears_the_played_final() {
    let store = MemoryStore::new();
    let [semi_a, semi_b, final_id] = four_player(&store);
    play(&store, semi_a, Scores::new(2, 0));
    play(&store, semi_b, Scores::new(2, 1));
    play(&store, final_id, Scores::new(2, 1));

    store
      .transaction(1, |tx| progression::edit_verified_result(tx, semi_a, Scores::new(0, 2), "org", Utc::now()))
      .unwrap();

    store
      .transaction(1, |tx| {
        let semi = tx.get_match(semi_a)?;
        assert_eq!(semi.winner, Some(4));
        assert_eq!(semi.status, MatchStatus::Verified);

        let final_row = tx.get_match(final_id)?;
        assert_eq!(final_row.occupants, [Some(4), Some(2)]);
        assert_eq!(final_row.status, MatchStatus::Pending);
        assert_eq!(final_row.winner, None);
        assert_eq!(final_row.scores, None);
        assert_eq!(final_row.completed_at, None);
        assert!(tx.reports_for_match(final_id).iter().all(|r| r.review == ReviewStatus::Rejected));

        let audit = tx.reports_for_match(semi_a);
        let active: Vec<_> = audit.iter().filter(|r| r.is_active()).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].winner, 4);
        assert_eq!(active[0].review, ReviewStatus::Approved);
        Ok(())
      })
      .unwrap();
  }

  #[test]
  fn same_winner_edit_leaves_downstream_alone() {
    let store = MemoryStore::new();
    let [semi_a, semi_b, final_id] = four_player(&store);
    play(&store, semi_a, Scores::new(2, 0));
    play(&store, semi_b, Scores::new(2, 1));
    play(&store, final_id, Scores::new(2, 1));

    let (_, touched) = store
      .transaction(1, |tx| progression::edit_verified_result(tx, semi_a, Scores::new(3, 1), "org", Utc::now()))
      .unwrap();
    assert_eq!(touched, vec![semi_a]);
    let final_row = store.transaction(1, |tx| tx.get_match(final_id)).unwrap();
    assert_eq!(final_row.status, MatchStatus::Verified);
    assert_eq!(final_row.winner, Some(1));
  }

  #[test]
  fn unplayed_downstream_only_swaps_the_occupant() {
    let store = MemoryStore::new();
    let [semi_a, _, final_id] = four_player(&store);
    play(&store, semi_a, Scores::new(2, 0));
    store
      .transaction(1, |tx| progression::check_in(tx, final_id, Slot::P1, Utc::now()))
      .unwrap();

    store
      .transaction(1, |tx| progression::edit_verified_result(tx, semi_a, Scores::new(1, 2), "org", Utc::now()))
      .unwrap();
    let final_row = store.transaction(1, |tx| tx.get_match(final_id)).unwrap();
    assert_eq!(final_row.occupants, [Some(4), None]);
    assert_eq!(final_row.checked_in, [false, false]);
    assert_eq!(final_row.status, MatchStatus::Pending);
  }

  #[test]
  fn edit_requires_verified_match() {
    let store = MemoryStore::new();
    let [semi_a, _, _] = four_player(&store);
    let err = store
      .transaction(1, |tx| progression::edit_verified_result(tx, semi_a, Scores::new(1, 2), "org", Utc::now()))
      .unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
  }
}
