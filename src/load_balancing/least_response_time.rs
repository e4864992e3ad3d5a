use super::{min_by_score_from, round_robin::RoundRobin, LoadBalancingContext, LoadBalancingStrategy};
use crate::{error::BalancerError, target::Target};
use std::sync::Arc;

pub const DEFAULT_LATENCY_WEIGHT: f64 = 1.0;
pub const DEFAULT_CONNECTION_WEIGHT: f64 = 10.0;

/// Prefers the fastest, currently idlest target.
///
/// `score = (ema_ms * latency_weight + active_connections * connection_weight) / weight`
#[derive(Debug)]
pub struct LeastResponseTime {
  latency_weight: f64,
  connection_weight: f64,
  tie_breaker: RoundRobin,
}

impl LeastResponseTime {
  pub fn new(latency_weight: f64, connection_weight: f64) -> LeastResponseTime {
    LeastResponseTime {
      latency_weight,
      connection_weight,
      tie_breaker: RoundRobin::new(),
    }
  }

  pub fn score(&self, target: &Target) -> f64 {
    let stats = target.stats();
    let load = stats.response_time_ema() * self.latency_weight
      + stats.active_connections() as f64 * self.connection_weight;
    load / f64::from(target.weight())
  }
}

impl Default for LeastResponseTime {
  fn default() -> Self {
    LeastResponseTime::new(DEFAULT_LATENCY_WEIGHT, DEFAULT_CONNECTION_WEIGHT)
  }
}

impl LoadBalancingStrategy for LeastResponseTime {
  fn select_target<'a>(&self, context: &LoadBalancingContext<'a>) -> Result<&'a Arc<Target>, BalancerError> {
    let targets = context.targets;
    if targets.is_empty() {
      return Err(BalancerError::EmptyPool);
    }
    let start = self.tie_breaker.next_index(targets.len());
    let index = min_by_score_from(targets, start, |a, b| self.score(a) < self.score(b));
    Ok(&targets[index])
  }
}

#[cfg(test)]
mod tests {
  use super::super::test_support::*;
  use super::*;
  use std::time::Duration;

  #[test]
  pub fn least_response_time_prefers_fast_target() {
    let pool = pool(vec![spec("127.0.0.1:1"), spec("127.0.0.1:2")]);
    let snapshot = pool.current_snapshot();
    let context = LoadBalancingContext {
      snapshot: &snapshot,
      targets: snapshot.targets(),
      key: None,
    };
    let strategy = LeastResponseTime::default();

    snapshot.targets()[0]
      .stats()
      .observe_response_time(Duration::from_millis(200), 0.3);
    snapshot.targets()[1]
      .stats()
      .observe_response_time(Duration::from_millis(20), 0.3);

    for _ in 0..4 {
      assert_eq!(port(strategy.select_target(&context).unwrap()), 2);
    }
  }

  #[test]
  pub fn least_response_time_accounts_for_connections() {
    let pool = pool(vec![spec("127.0.0.1:1"), spec("127.0.0.1:2")]);
    let snapshot = pool.current_snapshot();
    let context = LoadBalancingContext {
      snapshot: &snapshot,
      targets: snapshot.targets(),
      key: None,
    };
    let strategy = LeastResponseTime::new(1.0, 10.0);

    snapshot.targets()[0]
      .stats()
      .observe_response_time(Duration::from_millis(30), 0.3);
    snapshot.targets()[1]
      .stats()
      .observe_response_time(Duration::from_millis(20), 0.3);
    // 20 + 2 * 10 = 40 > 30
    snapshot.targets()[1].stats().start_connection();
    snapshot.targets()[1].stats().start_connection();

    assert_eq!(port(strategy.select_target(&context).unwrap()), 1);
  }

  #[test]
  pub fn least_response_time_rotates_between_unknown_targets() {
    let pool = pool(vec![spec("127.0.0.1:1"), spec("127.0.0.1:2")]);
    let snapshot = pool.current_snapshot();
    let context = LoadBalancingContext {
      snapshot: &snapshot,
      targets: snapshot.targets(),
      key: None,
    };
    let strategy = LeastResponseTime::default();

    assert_eq!(port(strategy.select_target(&context).unwrap()), 1);
    assert_eq!(port(strategy.select_target(&context).unwrap()), 2);
  }
}
