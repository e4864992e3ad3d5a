use super::{
  random::{index_on_weight_line, total_weight},
  round_robin::RoundRobin,
  LoadBalancingContext, LoadBalancingStrategy,
};
use crate::{error::BalancerError, target::Target};
use std::sync::Arc;

/// Sticky selection by `hash(key) mod Σweight` over the eligible targets.
///
/// Any change of the eligible list may move keys around, use [`super::consistent_hash::ConsistentHash`]
/// if that matters. Requests without a key are spread round robin.
#[derive(Debug, Default)]
pub struct KeyHash {
  fallback: RoundRobin,
}

impl KeyHash {
  pub fn new() -> KeyHash {
    KeyHash {
      fallback: RoundRobin::new(),
    }
  }
}

impl LoadBalancingStrategy for KeyHash {
  fn select_target<'a>(&self, context: &LoadBalancingContext<'a>) -> Result<&'a Arc<Target>, BalancerError> {
    let targets = context.targets;
    match context.key {
      Some(key) if !targets.is_empty() => {
        let point = key.hash_value() % total_weight(targets);
        Ok(&targets[index_on_weight_line(targets, point)])
      }
      _ => self.fallback.select_target(context),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::super::test_support::*;
  use super::*;
  use crate::key::RequestKey;
  use std::net::IpAddr;

  #[test]
  pub fn hash_strategy_same_key() {
    let pool = pool(vec![spec("127.0.0.1:1"), spec("127.0.0.1:2")]);
    let snapshot = pool.current_snapshot();
    let key = RequestKey::from("127.0.0.1".parse::<IpAddr>().unwrap());
    let context = LoadBalancingContext {
      snapshot: &snapshot,
      targets: snapshot.targets(),
      key: Some(&key),
    };
    let strategy = KeyHash::new();

    let address = strategy.select_target(&context).unwrap().address();
    for _ in 0..4 {
      assert_eq!(strategy.select_target(&context).unwrap().address(), address);
    }
  }

  #[test]
  pub fn hash_strategy_different_keys() {
    let pool = pool((1..=4).map(|port| spec(&format!("127.0.0.1:{}", port))).collect());
    let snapshot = pool.current_snapshot();
    let strategy = KeyHash::new();

    let picked: std::collections::HashSet<u16> = (0..64)
      .map(|user| {
        let key = RequestKey::from(format!("user-{}", user));
        let context = LoadBalancingContext {
          snapshot: &snapshot,
          targets: snapshot.targets(),
          key: Some(&key),
        };
        port(strategy.select_target(&context).unwrap())
      })
      .collect();

    assert!(picked.len() > 1);
  }

  #[test]
  pub fn hash_strategy_matches_modulo_for_equal_weights() {
    let pool = pool((1..=3).map(|port| spec(&format!("127.0.0.1:{}", port))).collect());
    let snapshot = pool.current_snapshot();
    let key = RequestKey::from("session-42");
    let context = LoadBalancingContext {
      snapshot: &snapshot,
      targets: snapshot.targets(),
      key: Some(&key),
    };

    let expected = (key.hash_value() % 3) as usize;

    assert_eq!(
      KeyHash::new().select_target(&context).unwrap().id(),
      snapshot.targets()[expected].id()
    );
  }

  #[test]
  pub fn hash_strategy_without_key_rotates() {
    let pool = pool(vec![spec("127.0.0.1:1"), spec("127.0.0.1:2")]);
    let snapshot = pool.current_snapshot();
    let context = LoadBalancingContext {
      snapshot: &snapshot,
      targets: snapshot.targets(),
      key: None,
    };
    let strategy = KeyHash::new();

    assert_eq!(port(strategy.select_target(&context).unwrap()), 1);
    assert_eq!(port(strategy.select_target(&context).unwrap()), 2);
  }
}
