use super::{LoadBalancingContext, LoadBalancingStrategy};
use crate::{error::BalancerError, target::Target};
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};

#[derive(Debug, Default)]
pub struct RoundRobin {
  // wraps against whatever list it is used with, membership changes don't reset it
  cursor: AtomicUsize,
}

impl RoundRobin {
  pub fn new() -> RoundRobin {
    RoundRobin {
      cursor: AtomicUsize::new(0),
    }
  }

  pub(crate) fn next_index(&self, len: usize) -> usize {
    self.cursor.fetch_add(1, Ordering::Relaxed) % len
  }
}

impl LoadBalancingStrategy for RoundRobin {
  fn select_target<'a>(&self, context: &LoadBalancingContext<'a>) -> Result<&'a Arc<Target>, BalancerError> {
    if context.targets.is_empty() {
      return Err(BalancerError::EmptyPool);
    }
    Ok(&context.targets[self.next_index(context.targets.len())])
  }
}
