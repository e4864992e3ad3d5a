use crate::{
  error::BalancerError,
  hash_ring::HashRing,
  target::{Role, Target, TargetId, TargetSpec},
};
use arc_swap::ArcSwap;
use log::{info, warn};
use serde::Serialize;
use std::{
  collections::HashSet,
  fmt,
  net::SocketAddr,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
  },
};
use tokio::sync::watch;

/// Where a membership change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SourceKind {
  Static,
  Dns,
  Api,
  Admin,
}

impl SourceKind {
  /// Whether a full replacement from this source may bring a down target back. Refresh sources can't.
  pub fn may_lift_down(self) -> bool {
    matches!(self, SourceKind::Static | SourceKind::Admin)
  }
}

impl fmt::Display for SourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SourceKind::Static => write!(f, "static"),
      SourceKind::Dns => write!(f, "dns"),
      SourceKind::Api => write!(f, "api"),
      SourceKind::Admin => write!(f, "admin"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipOp {
  Add(TargetSpec),
  Remove(TargetId),
  UpdateWeight(TargetId, u32),
  UpdateAddress(TargetId, SocketAddr),
  SetRole(TargetId, Role),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
  pub source: SourceKind,
  pub ops: Vec<MembershipOp>,
}

impl MembershipChange {
  pub fn new(source: SourceKind) -> MembershipChange {
    MembershipChange { source, ops: Vec::new() }
  }

  pub fn add(mut self, spec: TargetSpec) -> MembershipChange {
    self.ops.push(MembershipOp::Add(spec));
    self
  }

  pub fn remove<I: Into<TargetId>>(mut self, id: I) -> MembershipChange {
    self.ops.push(MembershipOp::Remove(id.into()));
    self
  }

  pub fn update_weight<I: Into<TargetId>>(mut self, id: I, weight: u32) -> MembershipChange {
    self.ops.push(MembershipOp::UpdateWeight(id.into(), weight));
    self
  }

  pub fn update_address<I: Into<TargetId>>(mut self, id: I, address: SocketAddr) -> MembershipChange {
    self.ops.push(MembershipOp::UpdateAddress(id.into(), address));
    self
  }

  pub fn set_role<I: Into<TargetId>>(mut self, id: I, role: Role) -> MembershipChange {
    self.ops.push(MembershipOp::SetRole(id.into(), role));
    self
  }

  pub fn is_empty(&self) -> bool {
    self.ops.is_empty()
  }

  /// The change that turns `current` into `desired`, keeping the order of `desired` for new targets
  pub fn diff(source: SourceKind, current: &PoolSnapshot, desired: &[TargetSpec]) -> MembershipChange {
    let mut change = MembershipChange::new(source);
    let wanted: HashSet<&TargetId> = desired.iter().map(|spec| &spec.id).collect();

    for target in current.targets() {
      if !wanted.contains(target.id()) {
        change.ops.push(MembershipOp::Remove(target.id().clone()));
      }
    }

    for spec in desired {
      match current.get(&spec.id) {
        None => change.ops.push(MembershipOp::Add(spec.clone())),
        Some(target) => {
          if target.address() != spec.address {
            change.ops.push(MembershipOp::UpdateAddress(spec.id.clone(), spec.address));
          }
          if target.weight() != spec.weight {
            change.ops.push(MembershipOp::UpdateWeight(spec.id.clone(), spec.weight));
          }
          // only an operator takes a target out of down again
          let keeps_down = target.role() == Role::Down && !source.may_lift_down();
          if target.role() != spec.role && !keeps_down {
            change.ops.push(MembershipOp::SetRole(spec.id.clone(), spec.role));
          }
        }
      }
    }
    change
  }
}

/// An immutable view of the pool. Selections always run against one of these.
#[derive(Debug)]
pub struct PoolSnapshot {
  version: u64,
  targets: Vec<Arc<Target>>,
  ring: Option<HashRing>,
}

impl PoolSnapshot {
  fn new(version: u64, targets: Vec<Arc<Target>>, ring_replicas: Option<u32>) -> PoolSnapshot {
    let ring = ring_replicas.map(|replicas| HashRing::build(&targets, replicas));
    PoolSnapshot { version, targets, ring }
  }

  pub fn version(&self) -> u64 {
    self.version
  }

  pub fn targets(&self) -> &[Arc<Target>] {
    &self.targets
  }

  pub fn ring(&self) -> Option<&HashRing> {
    self.ring.as_ref()
  }

  pub fn get(&self, id: &TargetId) -> Option<&Arc<Target>> {
    self.targets.iter().find(|target| target.id() == id)
  }

  pub fn len(&self) -> usize {
    self.targets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.targets.is_empty()
  }
}

/// Owns the authoritative target list of one upstream.
///
/// Writers build the next snapshot off to the side and publish it with a single pointer swap, readers
/// never wait for them.
#[derive(Debug)]
pub struct PoolManager {
  name: String,
  current: ArcSwap<PoolSnapshot>,
  // serializes writers only
  writer: Mutex<()>,
  ring_replicas: Option<u32>,
  stale_refreshes: AtomicU64,
  versions: watch::Sender<u64>,
}

impl PoolManager {
  pub fn new<S: Into<String>>(
    name: S,
    specs: Vec<TargetSpec>,
    ring_replicas: Option<u32>,
  ) -> Result<PoolManager, BalancerError> {
    let name = name.into();
    if specs.is_empty() {
      return Err(BalancerError::invalid(format!("upstream '{}' has no targets", name)));
    }

    let mut seen = HashSet::new();
    for spec in &specs {
      validate_weight(&spec.id, spec.weight)?;
      if !seen.insert(spec.id.clone()) {
        return Err(BalancerError::invalid(format!(
          "target {} is listed twice in upstream '{}'",
          spec.id, name
        )));
      }
    }

    let targets = specs.into_iter().map(|spec| Arc::new(Target::from_spec(spec))).collect();
    let (versions, _) = watch::channel(1);
    Ok(PoolManager {
      name,
      current: ArcSwap::from_pointee(PoolSnapshot::new(1, targets, ring_replicas)),
      writer: Mutex::new(()),
      ring_replicas,
      stale_refreshes: AtomicU64::new(0),
      versions,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn current_snapshot(&self) -> Arc<PoolSnapshot> {
    self.current.load_full()
  }

  pub fn version(&self) -> u64 {
    self.current.load().version
  }

  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.versions.subscribe()
  }

  pub fn stale_refreshes(&self) -> u64 {
    self.stale_refreshes.load(Ordering::Relaxed)
  }

  /// Applies all operations of `change` or none of them and returns the published version.
  /// A change without effect publishes nothing and returns the current version.
  pub fn update(&self, change: MembershipChange) -> Result<u64, BalancerError> {
    let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
    self.apply(change)
  }

  /// Turns the pool into exactly `desired`, typically a reloaded config or a fresh DNS answer
  pub fn replace(&self, source: SourceKind, desired: &[TargetSpec]) -> Result<u64, BalancerError> {
    let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
    let change = MembershipChange::diff(source, &self.current.load(), desired);
    self.apply(change)
  }

  /// A membership source couldn't be reached. The last known good snapshot stays in place.
  pub fn report_stale(&self, error: &BalancerError) {
    self.stale_refreshes.fetch_add(1, Ordering::Relaxed);
    warn!(
      "upstream {}: keeping membership version {}, {}",
      self.name,
      self.version(),
      error
    );
  }

  fn apply(&self, change: MembershipChange) -> Result<u64, BalancerError> {
    let base = self.current.load_full();
    let mut targets = base.targets.clone();
    let mut changed = false;

    for op in &change.ops {
      changed |= apply_op(&mut targets, op)?;
    }

    if !changed {
      return Ok(base.version);
    }
    if targets.is_empty() {
      return Err(BalancerError::invalid(format!(
        "change from {} would leave upstream '{}' without targets",
        change.source, self.name
      )));
    }

    let version = base.version + 1;
    let count = targets.len();
    self
      .current
      .store(Arc::new(PoolSnapshot::new(version, targets, self.ring_replicas)));
    self.versions.send_replace(version);
    info!(
      "upstream {}: applied {} membership change, version {} with {} targets",
      self.name, change.source, version, count
    );
    Ok(version)
  }
}

/// Upper bound for target weights, the hash ring holds `replicas * weight` points per target
pub const MAX_WEIGHT: u32 = 1000;

fn validate_weight(id: &TargetId, weight: u32) -> Result<(), BalancerError> {
  if weight == 0 {
    Err(BalancerError::invalid(format!("target {} has weight 0", id)))
  } else if weight > MAX_WEIGHT {
    Err(BalancerError::invalid(format!(
      "target {} has weight {}, at most {} is allowed",
      id, weight, MAX_WEIGHT
    )))
  } else {
    Ok(())
  }
}

fn position(targets: &[Arc<Target>], id: &TargetId) -> Result<usize, BalancerError> {
  targets
    .iter()
    .position(|target| target.id() == id)
    .ok_or_else(|| BalancerError::UnknownTarget(id.clone()))
}

/// Returns whether the op changed anything
fn apply_op(targets: &mut Vec<Arc<Target>>, op: &MembershipOp) -> Result<bool, BalancerError> {
  match op {
    MembershipOp::Add(spec) => {
      validate_weight(&spec.id, spec.weight)?;
      if targets.iter().any(|target| target.id() == &spec.id) {
        return Err(BalancerError::invalid(format!("target {} is already a member", spec.id)));
      }
      targets.push(Arc::new(Target::from_spec(spec.clone())));
      Ok(true)
    }
    MembershipOp::Remove(id) => {
      let index = position(targets, id)?;
      targets.remove(index);
      Ok(true)
    }
    MembershipOp::UpdateWeight(id, weight) => {
      validate_weight(id, *weight)?;
      let index = position(targets, id)?;
      let target = &targets[index];
      if target.weight() == *weight {
        return Ok(false);
      }
      targets[index] = Arc::new(target.with_attributes(target.address(), *weight, target.role()));
      Ok(true)
    }
    MembershipOp::UpdateAddress(id, address) => {
      let index = position(targets, id)?;
      let target = &targets[index];
      if target.address() == *address {
        return Ok(false);
      }
      targets[index] = Arc::new(target.with_attributes(*address, target.weight(), target.role()));
      Ok(true)
    }
    MembershipOp::SetRole(id, role) => {
      let index = position(targets, id)?;
      let target = &targets[index];
      if target.role() == *role {
        return Ok(false);
      }
      targets[index] = Arc::new(target.with_attributes(target.address(), target.weight(), *role));
      Ok(true)
    }
  }
}
