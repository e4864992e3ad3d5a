use crate::health::HealthRecord;
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
  fmt,
  net::SocketAddr,
  sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
  },
  time::Duration,
};

/// Stable identifier of a target, usually `address:port` or `dnsname:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TargetId(String);

impl TargetId {
  pub fn new<S: Into<String>>(id: S) -> TargetId {
    TargetId(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for TargetId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for TargetId {
  fn from(id: &str) -> Self {
    TargetId::new(id)
  }
}

impl From<String> for TargetId {
  fn from(id: String) -> Self {
    TargetId(id)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Role {
  Primary,
  /// Only used once no primary target is eligible
  Backup,
  /// Manually excluded, never selected
  Down,
}

impl Default for Role {
  fn default() -> Self {
    Role::Primary
  }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Role::Primary => write!(f, "primary"),
      Role::Backup => write!(f, "backup"),
      Role::Down => write!(f, "down"),
    }
  }
}

/// The static attributes of a target as delivered by a membership source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
  pub id: TargetId,
  pub address: SocketAddr,
  pub weight: u32,
  pub role: Role,
}

impl TargetSpec {
  pub fn new(address: SocketAddr) -> TargetSpec {
    TargetSpec {
      id: TargetId::new(address.to_string()),
      address,
      weight: 1,
      role: Role::Primary,
    }
  }

  pub fn with_id<I: Into<TargetId>>(mut self, id: I) -> TargetSpec {
    self.id = id.into();
    self
  }

  pub fn with_weight(mut self, weight: u32) -> TargetSpec {
    self.weight = weight;
    self
  }

  pub fn with_role(mut self, role: Role) -> TargetSpec {
    self.role = role;
    self
  }
}

/// A backend endpoint as seen by one pool snapshot.
///
/// The static attributes belong to the snapshot, the [`TargetStats`] are shared between every
/// snapshot the target lives in and die together with the target.
#[derive(Debug)]
pub struct Target {
  id: TargetId,
  address: SocketAddr,
  weight: u32,
  role: Role,
  stats: Arc<TargetStats>,
}

impl Target {
  pub(crate) fn from_spec(spec: TargetSpec) -> Target {
    Target {
      id: spec.id,
      address: spec.address,
      weight: spec.weight,
      role: spec.role,
      stats: Arc::new(TargetStats::new()),
    }
  }

  /// Same target instance with changed attributes
  pub(crate) fn with_attributes(&self, address: SocketAddr, weight: u32, role: Role) -> Target {
    Target {
      id: self.id.clone(),
      address,
      weight,
      role,
      stats: self.stats.clone(),
    }
  }

  pub fn id(&self) -> &TargetId {
    &self.id
  }

  pub fn address(&self) -> SocketAddr {
    self.address
  }

  pub fn weight(&self) -> u32 {
    self.weight
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn stats(&self) -> &Arc<TargetStats> {
    &self.stats
  }

  pub fn spec(&self) -> TargetSpec {
    TargetSpec {
      id: self.id.clone(),
      address: self.address,
      weight: self.weight,
      role: self.role,
    }
  }

  /// True if both refer to the same target instance, regardless of attribute updates
  pub fn same_instance(&self, other: &Target) -> bool {
    Arc::ptr_eq(&self.stats, &other.stats)
  }
}

/// Live counters of a target. Everything in here is touched by many requests at once.
#[derive(Debug)]
pub struct TargetStats {
  active_connections: AtomicUsize,
  // f64 bits, milliseconds
  response_time_ema: AtomicU64,
  response_time_sampled: AtomicBool,
  total_requests: AtomicU64,
  total_failures: AtomicU64,
  health: Mutex<HealthRecord>,
}

impl TargetStats {
  fn new() -> TargetStats {
    TargetStats {
      active_connections: AtomicUsize::new(0),
      response_time_ema: AtomicU64::new(0f64.to_bits()),
      response_time_sampled: AtomicBool::new(false),
      total_requests: AtomicU64::new(0),
      total_failures: AtomicU64::new(0),
      health: Mutex::new(HealthRecord::default()),
    }
  }

  pub fn active_connections(&self) -> usize {
    self.active_connections.load(Ordering::Acquire)
  }

  pub(crate) fn start_connection(&self) {
    self.active_connections.fetch_add(1, Ordering::AcqRel);
  }

  /// Decrements the connection counter, never below zero. Returns false if there was nothing to decrement.
  pub(crate) fn finish_connection(&self) -> bool {
    let result = self
      .active_connections
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    if result.is_err() {
      warn!("connection counter released more often than acquired, clamped at zero");
    }
    result.is_ok()
  }

  pub fn response_time_ema(&self) -> f64 {
    f64::from_bits(self.response_time_ema.load(Ordering::Acquire))
  }

  /// `new = old * (1 - alpha) + sample * alpha`, the very first sample is taken as is
  pub(crate) fn observe_response_time(&self, sample: Duration, alpha: f64) {
    let sample = sample.as_micros() as f64 / 1000.0;
    let first = !self.response_time_sampled.swap(true, Ordering::AcqRel);
    let _ = self
      .response_time_ema
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
        let old = f64::from_bits(bits);
        let new = if first {
          sample
        } else {
          old * (1.0 - alpha) + sample * alpha
        };
        Some(new.to_bits())
      });
  }

  pub(crate) fn count_request(&self, success: bool) {
    self.total_requests.fetch_add(1, Ordering::Relaxed);
    if !success {
      self.total_failures.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn total_requests(&self) -> u64 {
    self.total_requests.load(Ordering::Relaxed)
  }

  pub fn total_failures(&self) -> u64 {
    self.total_failures.load(Ordering::Relaxed)
  }

  pub(crate) fn health(&self) -> MutexGuard<'_, HealthRecord> {
    self.health.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
