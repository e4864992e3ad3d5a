use super::{LoadBalancingContext, LoadBalancingStrategy};
use crate::{
  error::BalancerError,
  target::{Target, TargetId},
};
use arc_swap::ArcSwapOption;
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};

/// Smooth weighted round robin.
///
/// Each step, every eligible target earns its weight as credit. The target with the most credit wins and
/// pays back the total weight of the round. Over `Σweight` picks every target is chosen exactly `weight`
/// times, interleaved instead of in bursts.
///
/// The steps of one round only depend on the eligible set, so the round is computed once per set and
/// requests just advance a shared cursor through it.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
  schedule: ArcSwapOption<Schedule>,
  cursor: AtomicUsize,
}

#[derive(Debug)]
struct Schedule {
  members: Vec<(TargetId, u32)>,
  // indices into the eligible slice the schedule was built for
  picks: Vec<usize>,
}

impl Schedule {
  fn build(targets: &[Arc<Target>]) -> Schedule {
    let divisor = targets.iter().map(|target| target.weight()).fold(0, gcd).max(1);
    let weights: Vec<i64> = targets
      .iter()
      .map(|target| i64::from((target.weight() / divisor).max(1)))
      .collect();
    let total: i64 = weights.iter().sum();

    let mut credits = vec![0i64; weights.len()];
    let mut picks = Vec::with_capacity(total as usize);
    for _ in 0..total {
      let mut best = 0;
      for (index, weight) in weights.iter().enumerate() {
        credits[index] += weight;
        if credits[index] > credits[best] {
          best = index;
        }
      }
      credits[best] -= total;
      picks.push(best);
    }

    Schedule {
      members: targets
        .iter()
        .map(|target| (target.id().clone(), target.weight()))
        .collect(),
      picks,
    }
  }

  fn matches(&self, targets: &[Arc<Target>]) -> bool {
    self.members.len() == targets.len()
      && self
        .members
        .iter()
        .zip(targets)
        .all(|((id, weight), target)| id == target.id() && *weight == target.weight())
  }
}

fn gcd(a: u32, b: u32) -> u32 {
  if b == 0 {
    a
  } else {
    gcd(b, a % b)
  }
}

impl WeightedRoundRobin {
  pub fn new() -> WeightedRoundRobin {
    WeightedRoundRobin::default()
  }

  fn schedule_for(&self, targets: &[Arc<Target>]) -> Arc<Schedule> {
    if let Some(schedule) = self.schedule.load_full() {
      if schedule.matches(targets) {
        return schedule;
      }
    }
    // racing requests may both rebuild, they produce the same round
    let schedule = Arc::new(Schedule::build(targets));
    self.schedule.store(Some(schedule.clone()));
    schedule
  }
}

impl LoadBalancingStrategy for WeightedRoundRobin {
  fn select_target<'a>(&self, context: &LoadBalancingContext<'a>) -> Result<&'a Arc<Target>, BalancerError> {
    let targets = context.targets;
    if targets.is_empty() {
      return Err(BalancerError::EmptyPool);
    }

    let schedule = self.schedule_for(targets);
    let step = self.cursor.fetch_add(1, Ordering::Relaxed) % schedule.picks.len();
    targets.get(schedule.picks[step]).ok_or(BalancerError::EmptyPool)
  }
}
