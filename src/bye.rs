use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use crate::error::Result;
use crate::progression::{self, PropagationPolicy};
use crate::store::BracketTx;
use crate::types::{MatchId, MatchStatus, Slot};

enum Resolution {
  /// One occupant and nothing left to fill the other slot.
  Walkover,
  /// Nobody will ever play here.
  Dead,
}

/// Settles every match in `seeds`, and whatever they feed, that can no
/// longer be contested. Returns the ids resolved in this pass.
///
/// Safe to call repeatedly: a match is resolved at most once per pass, and
/// terminal matches are never touched again.
pub fn resolve(
  tx: &mut dyn BracketTx,
  seeds: impl IntoIterator<Item = MatchId>,
  now: DateTime<Utc>,
) -> Result<Vec<MatchId>> {
  // Ids grow in creation order, which is also dependency order.
  let mut queue: BTreeSet<MatchId> = seeds.into_iter().collect();
  let mut resolved = HashSet::new();
  let mut order = Vec::new();

  while let Some(id) = queue.pop_first() {
    if resolved.contains(&id) {
      continue;
    }
    let mut row = tx.get_match(id)?;
    let Some(resolution) = classify(tx, &row) else {
      continue;
    };
    resolved.insert(id);
    order.push(id);

    match resolution {
      Resolution::Walkover => {
        let winner = row.occupants.iter().flatten().copied().next();
        row.winner = winner;
        row.scores = None;
        row.bye = true;
        row.status = MatchStatus::Verified;
        row.started_at = Some(now);
        row.completed_at = Some(now);
        row.updated_at = now;
        tx.update_match(&row)?;
        debug!("{} resolved as a bye for {:?}", row.label, winner);

        for target in progression::propagate(tx, &row, PropagationPolicy::Strict, now)? {
          queue.insert(target);
        }
        if let Some(reset) = progression::apply_grand_final_rule(tx, &row, now)? {
          queue.insert(reset);
        }
      }
      Resolution::Dead => {
        row.status = MatchStatus::Canceled;
        row.updated_at = now;
        tx.update_match(&row)?;
        debug!("{} canceled, no one can reach it", row.label);

        queue.extend([row.winner_next, row.loser_next].into_iter().flatten().map(|t| t.match_id));
        if let Some((reset, _)) = progression::find_reset_match(tx, row.id) {
          queue.insert(reset.id);
        }
      }
    }
  }
  Ok(order)
}

fn classify(tx: &dyn BracketTx, row: &crate::types::Match) -> Option<Resolution> {
  if row.status.is_terminal() || row.occupied_count() == 2 {
    return None;
  }
  let waiting = Slot::BOTH
    .into_iter()
    .filter(|slot| row.occupant(*slot).is_none())
    .any(|slot| tx.has_pending_inbound(row.id, slot));
  if waiting {
    return None;
  }
  match row.occupied_count() {
    1 => Some(Resolution::Walkover),
    _ => Some(Resolution::Dead),
  }
}
