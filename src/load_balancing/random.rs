use super::{LoadBalancingContext, LoadBalancingStrategy};
use crate::{error::BalancerError, target::Target};
use rand::{thread_rng, Rng};
use std::sync::Arc;

/// Weighted random pick
#[derive(Debug, Default)]
pub struct Random {}

impl Random {
  pub fn new() -> Random {
    Random {}
  }
}

/// Index of the target whose slice of the cumulative weight line contains `point`
pub(crate) fn index_on_weight_line(targets: &[Arc<Target>], point: u64) -> usize {
  let mut accumulated = 0u64;
  for (index, target) in targets.iter().enumerate() {
    accumulated += u64::from(target.weight());
    if point < accumulated {
      return index;
    }
  }
  targets.len() - 1
}

pub(crate) fn total_weight(targets: &[Arc<Target>]) -> u64 {
  targets.iter().map(|target| u64::from(target.weight())).sum()
}

impl LoadBalancingStrategy for Random {
  fn select_target<'a>(&self, context: &LoadBalancingContext<'a>) -> Result<&'a Arc<Target>, BalancerError> {
    let targets = context.targets;
    if targets.is_empty() {
      return Err(BalancerError::EmptyPool);
    }
    let mut rng = thread_rng();
    let point = rng.gen_range(0..total_weight(targets));
    Ok(&targets[index_on_weight_line(targets, point)])
  }
}

#[cfg(test)]
mod tests {
  use super::super::test_support::*;
  use super::*;

  #[test]
  pub fn weight_line() {
    let pool = pool(vec![spec("127.0.0.1:1").with_weight(2), spec("127.0.0.1:2").with_weight(3)]);
    let snapshot = pool.current_snapshot();
    let targets = snapshot.targets();

    assert_eq!(total_weight(targets), 5);
    assert_eq!(index_on_weight_line(targets, 0), 0);
    assert_eq!(index_on_weight_line(targets, 1), 0);
    assert_eq!(index_on_weight_line(targets, 2), 1);
    assert_eq!(index_on_weight_line(targets, 4), 1);
  }

  #[test]
  pub fn random_converges_to_weights() {
    let pool = pool(vec![spec("127.0.0.1:1").with_weight(3), spec("127.0.0.1:2").with_weight(1)]);
    let snapshot = pool.current_snapshot();
    let context = LoadBalancingContext {
      snapshot: &snapshot,
      targets: snapshot.targets(),
      key: None,
    };
    let strategy = Random::new();

    let first = (0..8000)
      .filter(|_| port(strategy.select_target(&context).unwrap()) == 1)
      .count();

    // expected 6000, sigma is about 39
    assert!((5700..=6300).contains(&first), "picked first target {} times", first);
  }
}
