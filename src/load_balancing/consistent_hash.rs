use super::{round_robin::RoundRobin, LoadBalancingContext, LoadBalancingStrategy};
use crate::{error::BalancerError, hash_ring::DEFAULT_REPLICAS, target::Target};
use std::sync::Arc;

/// Walks the snapshot's hash ring clockwise from `hash(key)` to the first eligible target.
///
/// Only keys owned by a removed or ineligible target move, everything else keeps its target.
#[derive(Debug)]
pub struct ConsistentHash {
  replicas: u32,
  fallback: RoundRobin,
}

impl ConsistentHash {
  pub fn new(replicas: u32) -> ConsistentHash {
    ConsistentHash {
      replicas: replicas.max(1),
      fallback: RoundRobin::new(),
    }
  }

  pub fn replicas(&self) -> u32 {
    self.replicas
  }
}

impl Default for ConsistentHash {
  fn default() -> Self {
    ConsistentHash::new(DEFAULT_REPLICAS)
  }
}

impl LoadBalancingStrategy for ConsistentHash {
  fn select_target<'a>(&self, context: &LoadBalancingContext<'a>) -> Result<&'a Arc<Target>, BalancerError> {
    let key = match context.key {
      Some(key) => key,
      None => return self.fallback.select_target(context),
    };
    let ring = context.snapshot.ring().ok_or_else(|| {
      BalancerError::invalid("consistent hashing needs a pool built with a hash ring")
    })?;
    let snapshot_targets = context.snapshot.targets();

    ring
      .walk(key.hash_value())
      .filter_map(|index| snapshot_targets.get(index))
      .find_map(|candidate| {
        context
          .targets
          .iter()
          .find(|eligible| eligible.same_instance(candidate))
      })
      .ok_or(BalancerError::EmptyPool)
  }
}
