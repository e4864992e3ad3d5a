use crate::{
  pool::MAX_WEIGHT,
  target::{Role, Target},
};
use std::{
  collections::hash_map::DefaultHasher,
  hash::{Hash, Hasher},
  sync::Arc,
};

pub const DEFAULT_REPLICAS: u32 = 160;
pub const MAX_REPLICAS: u32 = 1000;

/// Consistent hash ring over one pool snapshot.
///
/// Every non-down target owns `replicas * weight` points, with weights divided by their greatest common divisor
/// first. Weights above [`MAX_WEIGHT`] are capped. The ring is built once per snapshot and never
/// changed afterwards, points refer to targets by their index in that snapshot.
#[derive(Debug, Default)]
pub struct HashRing {
  points: Vec<(u64, usize)>,
}

impl HashRing {
  pub fn build(targets: &[Arc<Target>], replicas: u32) -> HashRing {
    let replicas = replicas.clamp(1, MAX_REPLICAS);
    let divisor = targets
      .iter()
      .filter(|target| target.role() != Role::Down)
      .map(|target| target.weight().clamp(1, MAX_WEIGHT))
      .fold(0, gcd)
      .max(1);
    let mut points = Vec::new();
    for (index, target) in targets.iter().enumerate() {
      if target.role() == Role::Down {
        continue;
      }
      let virtual_nodes = replicas * (target.weight().clamp(1, MAX_WEIGHT) / divisor);
      for replica in 0..virtual_nodes {
        points.push((point_hash(target.id().as_str(), replica), index));
      }
    }
    points.sort_unstable();
    HashRing { points }
  }

  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  /// Snapshot indices in clockwise order, starting at the first point at or after `hash`
  pub fn walk(&self, hash: u64) -> impl Iterator<Item = usize> + '_ {
    let start = self.points.partition_point(|(point, _)| *point < hash);
    let (before, after) = self.points.split_at(start);
    after.iter().chain(before.iter()).map(|(_, index)| *index)
  }
}

fn gcd(a: u32, b: u32) -> u32 {
  if b == 0 {
    a
  } else {
    gcd(b, a % b)
  }
}

fn point_hash(id: &str, replica: u32) -> u64 {
  // finish() does not reset state, so we'll need a new hasher for each point
  let mut hasher = DefaultHasher::new();
  id.hash(&mut hasher);
  replica.hash(&mut hasher);
  hasher.finish()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::target::TargetSpec;

  fn targets(specs: Vec<TargetSpec>) -> Vec<Arc<Target>> {
    specs.into_iter().map(|spec| Arc::new(Target::from_spec(spec))).collect()
  }

  fn spec(address: &str) -> TargetSpec {
    TargetSpec::new(address.parse().unwrap())
  }

  #[test]
  fn points_per_weight() {
    let ring = HashRing::build(
      &targets(vec![spec("127.0.0.1:1"), spec("127.0.0.1:2").with_weight(3)]),
      10,
    );

    assert_eq!(ring.len(), 40);
  }

  #[test]
  fn common_weight_factor_is_divided_out() {
    let ring = HashRing::build(
      &targets(vec![spec("127.0.0.1:1").with_weight(200), spec("127.0.0.1:2").with_weight(600)]),
      10,
    );

    assert_eq!(ring.len(), 40);
  }

  #[test]
  fn large_weights_and_replicas_are_bounded() {
    let ring = HashRing::build(
      &targets(vec![spec("127.0.0.1:1").with_weight(10_000_000), spec("127.0.0.1:2")]),
      10,
    );
    assert_eq!(ring.len(), (10 * (MAX_WEIGHT + 1)) as usize);

    let ring = HashRing::build(&targets(vec![spec("127.0.0.1:1")]), u32::MAX);
    assert_eq!(ring.len(), MAX_REPLICAS as usize);
  }

  #[test]
  fn down_targets_own_no_points() {
    let ring = HashRing::build(
      &targets(vec![spec("127.0.0.1:1"), spec("127.0.0.1:2").with_role(Role::Down)]),
      10,
    );

    assert_eq!(ring.len(), 10);
    assert!(ring.walk(42).all(|index| index == 0));
  }

  #[test]
  fn walk_visits_every_point_once() {
    let ring = HashRing::build(&targets(vec![spec("127.0.0.1:1"), spec("127.0.0.1:2")]), 5);

    assert_eq!(ring.walk(0).count(), 10);
    assert_eq!(ring.walk(u64::MAX).count(), 10);
    assert_eq!(ring.walk(u64::MAX / 2).count(), 10);
  }

  #[test]
  fn walk_is_sorted_clockwise() {
    let ring = HashRing::build(&targets(vec![spec("127.0.0.1:1"), spec("127.0.0.1:2")]), 5);
    let start = ring.points[3].0;

    let first = ring.walk(start).next();

    assert_eq!(first, Some(ring.points[3].1));
  }
}
