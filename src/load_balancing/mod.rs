use crate::{error::BalancerError, key::RequestKey, pool::PoolSnapshot, target::Target};
use std::sync::Arc;

pub mod consistent_hash;
pub mod hash;
pub mod least_connection;
pub mod least_response_time;
pub mod random;
pub mod round_robin;
pub mod weighted_round_robin;

use consistent_hash::ConsistentHash;
use hash::KeyHash;
use least_connection::LeastConnection;
use least_response_time::LeastResponseTime;
use random::Random;
use round_robin::RoundRobin;
use weighted_round_robin::WeightedRoundRobin;

pub struct LoadBalancingContext<'a> {
  pub snapshot: &'a PoolSnapshot,
  /// Eligible targets in snapshot order, role and health filtering already applied
  pub targets: &'a [Arc<Target>],
  pub key: Option<&'a RequestKey>,
}

pub trait LoadBalancingStrategy: std::fmt::Debug + Send + Sync {
  fn select_target<'a>(&self, context: &LoadBalancingContext<'a>) -> Result<&'a Arc<Target>, BalancerError>;
}

/// The closed set of strategies, picked once when the upstream is built
#[derive(Debug)]
pub enum Strategy {
  RoundRobin(RoundRobin),
  WeightedRoundRobin(WeightedRoundRobin),
  LeastConnection(LeastConnection),
  Hash(KeyHash),
  ConsistentHash(ConsistentHash),
  LeastResponseTime(LeastResponseTime),
  Random(Random),
}

impl Strategy {
  pub fn name(&self) -> &'static str {
    match self {
      Strategy::RoundRobin(_) => "round-robin",
      Strategy::WeightedRoundRobin(_) => "weighted-round-robin",
      Strategy::LeastConnection(_) => "least-connection",
      Strategy::Hash(_) => "hash",
      Strategy::ConsistentHash(_) => "consistent-hash",
      Strategy::LeastResponseTime(_) => "least-response-time",
      Strategy::Random(_) => "random",
    }
  }

  /// Virtual nodes per unit of weight, if the strategy walks a hash ring
  pub fn ring_replicas(&self) -> Option<u32> {
    match self {
      Strategy::ConsistentHash(strategy) => Some(strategy.replicas()),
      _ => None,
    }
  }
}

impl Default for Strategy {
  fn default() -> Self {
    Strategy::RoundRobin(RoundRobin::new())
  }
}

impl LoadBalancingStrategy for Strategy {
  fn select_target<'a>(&self, context: &LoadBalancingContext<'a>) -> Result<&'a Arc<Target>, BalancerError> {
    if context.targets.is_empty() {
      return Err(BalancerError::EmptyPool);
    }
    match self {
      Strategy::RoundRobin(strategy) => strategy.select_target(context),
      Strategy::WeightedRoundRobin(strategy) => strategy.select_target(context),
      Strategy::LeastConnection(strategy) => strategy.select_target(context),
      Strategy::Hash(strategy) => strategy.select_target(context),
      Strategy::ConsistentHash(strategy) => strategy.select_target(context),
      Strategy::LeastResponseTime(strategy) => strategy.select_target(context),
      Strategy::Random(strategy) => strategy.select_target(context),
    }
  }
}

/// Picks the index of the target with the smallest score, starting the scan at `start` so that ties
/// rotate instead of always landing on the first target.
pub(crate) fn min_by_score_from<F>(targets: &[Arc<Target>], start: usize, mut less: F) -> usize
where
  F: FnMut(&Target, &Target) -> bool,
{
  let len = targets.len();
  let mut best = start % len;
  for offset in 1..len {
    let index = (start + offset) % len;
    if less(&targets[index], &targets[best]) {
      best = index;
    }
  }
  best
}
