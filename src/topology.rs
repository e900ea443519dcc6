use std::collections::VecDeque;

use crate::config::{EngineConfig, SeedingMode};
use crate::error::{EngineError, Result};
use crate::types::{BracketFormat, ParticipantId, Partition, Slot};

/// Index of a node inside a [`BracketPlan`]. Plans are built before any
/// match row exists, so pointers refer to nodes instead of match ids.
pub type NodeIndex = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeTarget {
  pub node: NodeIndex,
  pub slot: Slot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeCondition {
  GrandFinalReset { gf1: NodeIndex, losers_slot: Slot },
}

#[derive(Clone, Debug)]
pub struct MatchNode {
  pub partition: Partition,
  pub round: u32,
  pub slot_index: u32,
  pub label: String,
  pub occupants: [Option<ParticipantId>; 2],
  pub winner_next: Option<NodeTarget>,
  pub loser_next: Option<NodeTarget>,
  pub condition: Option<NodeCondition>,
}

#[derive(Clone, Debug)]
pub struct BracketPlan {
  pub format: BracketFormat,
  pub nodes: Vec<MatchNode>,
}

#[derive(Clone, Copy, Debug)]
enum SlotSource {
  Entrant(ParticipantId),
  Winner(NodeIndex),
  Loser(NodeIndex),
  Empty,
}

struct PlanBuilder {
  nodes: Vec<MatchNode>,
  sources: Vec<[SlotSource; 2]>,
}

impl PlanBuilder {
  fn new() -> Self {
    PlanBuilder { nodes: Vec::new(), sources: Vec::new() }
  }

  fn push_node(
    &mut self,
    partition: Partition,
    round: u32,
    slot_index: u32,
    label: String,
    slot_a: SlotSource,
    slot_b: SlotSource,
  ) -> NodeIndex {
    let occupant = |source: SlotSource| match source {
      SlotSource::Entrant(id) => Some(id),
      _ => None,
    };
    self.nodes.push(MatchNode {
      partition,
      round,
      slot_index,
      label,
      occupants: [occupant(slot_a), occupant(slot_b)],
      winner_next: None,
      loser_next: None,
      condition: None,
    });
    self.sources.push([slot_a, slot_b]);
    self.nodes.len() - 1
  }

  /// Second pass: turn every pull-style source into a forward pointer on the feeding node.
  fn wire(mut self, format: BracketFormat) -> Result<BracketPlan> {
    for (target, sources) in self.sources.iter().enumerate() {
      for (slot, source) in Slot::BOTH.into_iter().zip(sources.iter()) {
        let pointer = NodeTarget { node: target, slot };
        match *source {
          SlotSource::Winner(from) => {
            let node = &mut self.nodes[from];
            if node.winner_next.is_some() {
              return Err(EngineError::TopologyInvariantViolated(format!(
                "{} would feed its winner into two matches",
                node.label
              )));
            }
            node.winner_next = Some(pointer);
          }
          SlotSource::Loser(from) => {
            let node = &mut self.nodes[from];
            if node.loser_next.is_some() {
              return Err(EngineError::TopologyInvariantViolated(format!(
                "{} would feed its loser into two matches",
                node.label
              )));
            }
            node.loser_next = Some(pointer);
          }
          SlotSource::Entrant(_) | SlotSource::Empty => {}
        }
      }
    }
    let plan = BracketPlan { format, nodes: self.nodes };
    plan.validate()?;
    Ok(plan)
  }
}

/// Builds the full match graph for `participants`, ordered best seed first.
pub fn build_plan(
  participants: &[ParticipantId],
  format: BracketFormat,
  config: &EngineConfig,
) -> Result<BracketPlan> {
  if participants.is_empty() {
    return Err(EngineError::InvalidInput(
      "a bracket needs at least one checked-in participant".to_string(),
    ));
  }
  if participants.len() == 1 {
    return Ok(BracketPlan { format, nodes: Vec::new() });
  }
  let mut builder = PlanBuilder::new();
  match format {
    BracketFormat::SingleElimination => {
      build_winners_rounds(&mut builder, participants, config.seeding, true);
    }
    BracketFormat::DoubleElimination => {
      build_double_elim(&mut builder, participants, config.seeding, config.allow_grand_finals_reset)?;
    }
  }
  builder.wire(format)
}

/// Builds the winners side and returns node indices grouped by round.
fn build_winners_rounds(
  builder: &mut PlanBuilder,
  participants: &[ParticipantId],
  seeding: SeedingMode,
  allow_ragged: bool,
) -> Vec<Vec<NodeIndex>> {
  let first_round = first_round_pairs(participants, seeding, allow_ragged);
  let mut rounds: Vec<Vec<NodeIndex>> = Vec::new();

  let mut ids = Vec::with_capacity(first_round.len());
  for (i, (slot_a, slot_b)) in first_round.into_iter().enumerate() {
    ids.push(builder.push_node(
      Partition::Winners,
      1,
      i as u32 + 1,
      "W1".to_string(),
      slot_a,
      slot_b,
    ));
  }
  rounds.push(ids);

  let mut round = 1u32;
  while rounds.last().map(|r| r.len()).unwrap_or(0) > 1 {
    round += 1;
    let prev = rounds.last().cloned().unwrap_or_default();
    let mut ids = Vec::with_capacity(prev.len().div_ceil(2));
    for (j, pair) in prev.chunks(2).enumerate() {
      let slot_a = SlotSource::Winner(pair[0]);
      let slot_b = pair.get(1).copied().map(SlotSource::Winner).unwrap_or(SlotSource::Empty);
      ids.push(builder.push_node(
        Partition::Winners,
        round,
        j as u32 + 1,
        format!("W{round}"),
        slot_a,
        slot_b,
      ));
    }
    rounds.push(ids);
  }
  rounds
}

/// Round-one pairings. Standard seeding pads to a power of two so byes land on
/// the top seeds; sequential seeding pairs list neighbours.
fn first_round_pairs(
  participants: &[ParticipantId],
  seeding: SeedingMode,
  allow_ragged: bool,
) -> Vec<(SlotSource, SlotSource)> {
  let entrant = |rank: usize| {
    participants
      .get(rank)
      .copied()
      .map(SlotSource::Entrant)
      .unwrap_or(SlotSource::Empty)
  };
  match seeding {
    SeedingMode::Standard => {
      let size = next_power_of_two(participants.len());
      let seeds = seed_positions(size as u32);
      seeds
        .chunks(2)
        .map(|pair| (entrant(pair[0] as usize - 1), entrant(pair[1] as usize - 1)))
        .collect()
    }
    SeedingMode::Sequential => {
      let size = if allow_ragged {
        participants.len()
      } else {
        next_power_of_two(participants.len())
      };
      (0..size.div_ceil(2))
        .map(|i| (entrant(i * 2), entrant(i * 2 + 1)))
        .collect()
    }
  }
}

fn build_double_elim(
  builder: &mut PlanBuilder,
  participants: &[ParticipantId],
  seeding: SeedingMode,
  allow_reset: bool,
) -> Result<()> {
  let winners_rounds = build_winners_rounds(builder, participants, seeding, false);
  let rounds = winners_rounds.len();

  // Odd losers rounds take drop-ins from W1 or survivors of the previous
  // even round; even rounds pair those survivors with the next winners-round losers.
  let mut losers_rounds: Vec<Vec<NodeIndex>> = Vec::new();
  for i in 1..rounds {
    let count = winners_rounds[i].len();
    let odd_round = (i * 2 - 1) as u32;
    let mut odd_ids = Vec::with_capacity(count);
    for j in 0..count {
      let (slot_a, slot_b) = if i == 1 {
        let w1 = &winners_rounds[0];
        (SlotSource::Loser(w1[j * 2]), SlotSource::Loser(w1[j * 2 + 1]))
      } else {
        let prev_even = losers_rounds.last().ok_or_else(|| {
          EngineError::TopologyInvariantViolated("missing losers round".to_string())
        })?;
        (SlotSource::Winner(prev_even[j * 2]), SlotSource::Winner(prev_even[j * 2 + 1]))
      };
      odd_ids.push(builder.push_node(
        Partition::Losers,
        odd_round,
        j as u32 + 1,
        format!("L{odd_round}"),
        slot_a,
        slot_b,
      ));
    }
    losers_rounds.push(odd_ids.clone());

    let even_round = odd_round + 1;
    let mut even_ids = Vec::with_capacity(count);
    for (j, odd_id) in odd_ids.iter().enumerate() {
      even_ids.push(builder.push_node(
        Partition::Losers,
        even_round,
        j as u32 + 1,
        format!("L{even_round}"),
        SlotSource::Winner(*odd_id),
        SlotSource::Loser(winners_rounds[i][j]),
      ));
    }
    losers_rounds.push(even_ids);
  }

  let winners_final = *winners_rounds
    .last()
    .and_then(|round| round.first())
    .ok_or_else(|| EngineError::TopologyInvariantViolated("missing winners final".to_string()))?;

  let losers_final_source = match losers_rounds.last() {
    Some(last_round) => {
      let node = *last_round.first().ok_or_else(|| {
        EngineError::TopologyInvariantViolated("missing losers final".to_string())
      })?;
      SlotSource::Winner(node)
    }
    None => SlotSource::Loser(winners_final),
  };

  let gf1 = builder.push_node(
    Partition::Finals,
    1,
    1,
    "GF1".to_string(),
    SlotSource::Winner(winners_final),
    losers_final_source,
  );

  if allow_reset {
    let gf2 = builder.push_node(
      Partition::Finals,
      2,
      1,
      "GF2".to_string(),
      SlotSource::Empty,
      SlotSource::Empty,
    );
    builder.nodes[gf2].condition = Some(NodeCondition::GrandFinalReset {
      gf1,
      losers_slot: Slot::P2,
    });
  }
  Ok(())
}

impl BracketPlan {
  /// Checks pointer ordering, acyclicity and the single-sink property.
  pub fn validate(&self) -> Result<()> {
    for (index, node) in self.nodes.iter().enumerate() {
      for target in [node.winner_next, node.loser_next].into_iter().flatten() {
        let next = self.nodes.get(target.node).ok_or_else(|| {
          EngineError::TopologyInvariantViolated(format!(
            "{} points at missing node {}",
            node.label, target.node
          ))
        })?;
        let ordered = if next.partition == node.partition {
          next.round > node.round
        } else {
          next.partition > node.partition
        };
        if !ordered || target.node == index {
          return Err(EngineError::TopologyInvariantViolated(format!(
            "{} (round {}) points back at {} (round {})",
            node.label, node.round, next.label, next.round
          )));
        }
      }
    }

    if self.topological_order().len() != self.nodes.len() {
      return Err(EngineError::TopologyInvariantViolated(
        "forward pointers contain a cycle".to_string(),
      ));
    }

    if !self.nodes.is_empty() {
      let sinks = self
        .nodes
        .iter()
        .filter(|node| node.winner_next.is_none() && node.condition.is_none())
        .count();
      if sinks != 1 {
        return Err(EngineError::TopologyInvariantViolated(format!(
          "bracket has {sinks} sinks, expected exactly one"
        )));
      }
    }
    Ok(())
  }

  /// Kahn's algorithm over winner and loser pointers. Nodes on a cycle are omitted.
  pub fn topological_order(&self) -> Vec<NodeIndex> {
    let mut indegree = vec![0usize; self.nodes.len()];
    for node in &self.nodes {
      for target in [node.winner_next, node.loser_next].into_iter().flatten() {
        if let Some(count) = indegree.get_mut(target.node) {
          *count += 1;
        }
      }
    }
    let mut queue: VecDeque<NodeIndex> = indegree
      .iter()
      .enumerate()
      .filter(|(_, count)| **count == 0)
      .map(|(index, _)| index)
      .collect();
    let mut order = Vec::with_capacity(self.nodes.len());
    while let Some(index) = queue.pop_front() {
      order.push(index);
      let node = &self.nodes[index];
      for target in [node.winner_next, node.loser_next].into_iter().flatten() {
        if let Some(count) = indegree.get_mut(target.node) {
          *count -= 1;
          if *count == 0 {
            queue.push_back(target.node);
          }
        }
      }
    }
    order
  }

  pub fn sink(&self) -> Option<NodeIndex> {
    self
      .nodes
      .iter()
      .position(|node| node.winner_next.is_none() && node.condition.is_none())
  }
}

/// Standard bracket order. Consecutive pairs are the round-one matches, so for
/// eight slots: 1 v 8, 4 v 5, 2 v 7, 3 v 6.
pub fn seed_positions(size: u32) -> Vec<u32> {
  let mut seeds = vec![1u32];
  while seeds.len() < size as usize {
    let n = seeds.len() as u32;
    let mut next = Vec::with_capacity(seeds.len() * 2);
    for seed in seeds.iter().copied() {
      next.push(seed);
      next.push((n * 2 + 1).saturating_sub(seed));
    }
    seeds = next;
  }
  seeds
}

fn next_power_of_two(n: usize) -> usize {
  n.max(2).next_power_of_two()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ids(n: u32) -> Vec<ParticipantId> {
    (1..=n).collect()
  }

  fn config(seeding: SeedingMode) -> EngineConfig {
    EngineConfig { seeding, ..EngineConfig::default() }
  }

  fn follow_to_sink(plan: &BracketPlan, mut index: NodeIndex) -> NodeIndex {
    let mut hops = 0;
    while let Some(next) = plan.nodes[index].winner_next {
      index = next.node;
      hops += 1;
      assert!(hops <= plan.nodes.len(), "winner chain does not terminate");
    }
    index
  }

  #[test]
  fn seed_positions_for_eight() {
    assert_eq!(seed_positions(8), vec![1, 8, 4, 5, 2, 7, 3, 6]);
  }

  #[test]
  fn empty_seed_list_is_rejected() {
    let err = build_plan(&[], BracketFormat::SingleElimination, &EngineConfig::default()).unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
  }

  #[test]
  fn single_participant_has_no_matches() {
    for format in [BracketFormat::SingleElimination, BracketFormat::DoubleElimination] {
      let plan = build_plan(&ids(1), format, &EngineConfig::default()).unwrap();
      assert!(plan.nodes.is_empty());
    }
  }

  #[test]
  fn four_player_standard_pairs_one_v_four() {
    let plan = build_plan(&ids(4), BracketFormat::SingleElimination, &EngineConfig::default()).unwrap();
    assert_eq!(plan.nodes.len(), 3);
    assert_eq!(plan.nodes[0].occupants, [Some(1), Some(4)]);
    assert_eq!(plan.nodes[1].occupants, [Some(2), Some(3)]);
    assert_eq!(plan.nodes[0].winner_next, Some(NodeTarget { node: 2, slot: Slot::P1 }));
    assert_eq!(plan.nodes[1].winner_next, Some(NodeTarget { node: 2, slot: Slot::P2 }));
  }

  #[test]
  fn sequential_pairs_neighbours_and_leaves_odd_bye() {
    let plan = build_plan(&ids(5), BracketFormat::SingleElimination, &config(SeedingMode::Sequential)).unwrap();
    let first: Vec<_> = plan.nodes.iter().filter(|n| n.round == 1).map(|n| n.occupants).collect();
    assert_eq!(first, vec![[Some(1), Some(2)], [Some(3), Some(4)], [Some(5), None]]);
  }

  #[test]
  fn single_elim_has_one_sink_reached_from_every_first_round_match() {
    for seeding in [SeedingMode::Standard, SeedingMode::Sequential] {
      for n in 2..=33u32 {
        let plan = build_plan(&ids(n), BracketFormat::SingleElimination, &config(seeding)).unwrap();
        let sinks: Vec<_> = (0..plan.nodes.len()).filter(|i| plan.nodes[*i].winner_next.is_none()).collect();
        assert_eq!(sinks.len(), 1, "n={n} {seeding:?}");
        for (index, node) in plan.nodes.iter().enumerate() {
          if node.round == 1 {
            assert_eq!(follow_to_sink(&plan, index), sinks[0]);
          }
        }
      }
    }
  }

  #[test]
  fn power_of_two_single_elim_has_n_minus_one_matches() {
    for n in [2u32, 4, 8, 16, 32] {
      let plan = build_plan(&ids(n), BracketFormat::SingleElimination, &EngineConfig::default()).unwrap();
      assert_eq!(plan.nodes.len(), n as usize - 1);
    }
  }

  #[test]
  fn standard_byes_go_to_top_seeds() {
    let plan = build_plan(&ids(6), BracketFormat::SingleElimination, &EngineConfig::default()).unwrap();
    let byes: Vec<_> = plan
      .nodes
      .iter()
      .filter(|n| n.round == 1 && n.occupants[1].is_none())
      .map(|n| n.occupants[0])
      .collect();
    assert_eq!(byes, vec![Some(1), Some(2)]);
  }

  #[test]
  fn winner_pointer_slot_follows_slot_index_parity() {
    let plan = build_plan(&ids(16), BracketFormat::SingleElimination, &EngineConfig::default()).unwrap();
    for node in &plan.nodes {
      if let Some(next) = node.winner_next {
        assert_eq!(next.slot, Slot::from_slot_index(node.slot_index));
        assert_eq!(plan.nodes[next.node].slot_index, (node.slot_index + 1) / 2);
      }
    }
  }

  #[test]
  fn double_elim_eight_shape() {
    let plan = build_plan(&ids(8), BracketFormat::DoubleElimination, &EngineConfig::default()).unwrap();
    let count = |p: Partition| plan.nodes.iter().filter(|n| n.partition == p).count();
    assert_eq!(count(Partition::Winners), 7);
    assert_eq!(count(Partition::Losers), 6);
    assert_eq!(count(Partition::Finals), 2);

    for node in plan.nodes.iter().filter(|n| n.partition == Partition::Winners) {
      assert!(node.loser_next.is_some(), "{} has no loser pointer", node.label);
    }
    let gf1 = plan.nodes.iter().position(|n| n.label == "GF1").unwrap();
    assert_eq!(plan.sink(), Some(gf1));
    let gf2 = plan.nodes.iter().find(|n| n.label == "GF2").unwrap();
    assert_eq!(
      gf2.condition,
      Some(NodeCondition::GrandFinalReset { gf1, losers_slot: Slot::P2 })
    );
  }

  #[test]
  fn double_elim_two_players_sends_loser_to_grand_final() {
    let plan = build_plan(&ids(2), BracketFormat::DoubleElimination, &EngineConfig::default()).unwrap();
    assert_eq!(plan.nodes.len(), 3);
    assert_eq!(plan.nodes[0].winner_next, Some(NodeTarget { node: 1, slot: Slot::P1 }));
    assert_eq!(plan.nodes[0].loser_next, Some(NodeTarget { node: 1, slot: Slot::P2 }));
  }

  #[test]
  fn double_elim_without_reset_has_no_gf2() {
    let config = EngineConfig { allow_grand_finals_reset: false, ..EngineConfig::default() };
    let plan = build_plan(&ids(4), BracketFormat::DoubleElimination, &config).unwrap();
    assert!(plan.nodes.iter().all(|n| n.label != "GF2"));
  }

  #[test]
  fn validate_rejects_cycles() {
    let mut plan = build_plan(&ids(4), BracketFormat::SingleElimination, &EngineConfig::default()).unwrap();
    plan.nodes[2].winner_next = Some(NodeTarget { node: 0, slot: Slot::P1 });
    assert!(matches!(plan.validate(), Err(EngineError::TopologyInvariantViolated(_))));
  }
}
