use super::{min_by_score_from, round_robin::RoundRobin, LoadBalancingContext, LoadBalancingStrategy};
use crate::{error::BalancerError, target::Target};
use std::sync::Arc;

/// Picks the target with the fewest active connections relative to its weight
#[derive(Debug, Default)]
pub struct LeastConnection {
  // ties rotate, otherwise every idle pool would herd onto its first target
  tie_breaker: RoundRobin,
}

impl LeastConnection {
  pub fn new() -> LeastConnection {
    LeastConnection {
      tie_breaker: RoundRobin::new(),
    }
  }
}

fn fewer_connections(a: &Target, b: &Target) -> bool {
  // a.active / a.weight < b.active / b.weight
  let a_load = a.stats().active_connections() as u64 * u64::from(b.weight());
  let b_load = b.stats().active_connections() as u64 * u64::from(a.weight());
  a_load < b_load
}

impl LoadBalancingStrategy for LeastConnection {
  fn select_target<'a>(&self, context: &LoadBalancingContext<'a>) -> Result<&'a Arc<Target>, BalancerError> {
    let targets = context.targets;
    if targets.is_empty() {
      return Err(BalancerError::EmptyPool);
    }
    let start = self.tie_breaker.next_index(targets.len());
    Ok(&targets[min_by_score_from(targets, start, fewer_connections)])
  }
}
