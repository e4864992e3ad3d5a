use crate::{
  error::BalancerError,
  health::{Admission, HealthPolicy, HealthTracker, Transition},
  key::{KeyExtractor, RequestKey},
  load_balancing::{LoadBalancingContext, LoadBalancingStrategy, Strategy},
  pool::{MembershipChange, PoolManager, PoolSnapshot, SourceKind},
  stats::{TargetReport, UpstreamStats},
  target::{Role, Target, TargetId, TargetSpec},
};
use hyper::Request;
use log::{debug, warn};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::time::Instant;

pub const DEFAULT_EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Success,
  Failure,
}

impl Outcome {
  pub fn is_success(&self) -> bool {
    *self == Outcome::Success
  }
}

impl From<bool> for Outcome {
  fn from(success: bool) -> Self {
    if success {
      Outcome::Success
    } else {
      Outcome::Failure
    }
  }
}

/// One acquired target. Hand it back through [`LoadBalancer::release`]; dropping it instead only gives
/// back the connection slot and reports nothing to the health tracker.
#[derive(Debug)]
pub struct Lease {
  target: Arc<Target>,
  started: Instant,
  trial: bool,
  released: bool,
}

impl Lease {
  pub fn target(&self) -> &Arc<Target> {
    &self.target
  }

  pub fn id(&self) -> &TargetId {
    self.target.id()
  }

  pub fn address(&self) -> SocketAddr {
    self.target.address()
  }

  /// True if this request decides whether an unhealthy target comes back
  pub fn is_trial(&self) -> bool {
    self.trial
  }

  pub fn started(&self) -> Instant {
    self.started
  }
}

impl Drop for Lease {
  fn drop(&mut self) {
    if !self.released {
      self.target.stats().finish_connection();
      if self.trial {
        HealthTracker::abandon_trial(&self.target);
      }
    }
  }
}

pub struct LoadBalancerBuilder {
  name: String,
  targets: Vec<TargetSpec>,
  strategy: Strategy,
  health_policy: HealthPolicy,
  key_extractor: Option<KeyExtractor>,
  ema_alpha: f64,
}

impl LoadBalancerBuilder {
  pub fn new<S: Into<String>>(name: S, targets: Vec<TargetSpec>, strategy: Strategy) -> LoadBalancerBuilder {
    LoadBalancerBuilder {
      name: name.into(),
      targets,
      strategy,
      health_policy: HealthPolicy::default(),
      key_extractor: None,
      ema_alpha: DEFAULT_EMA_ALPHA,
    }
  }

  pub fn health_policy(&mut self, policy: HealthPolicy) -> &mut LoadBalancerBuilder {
    self.health_policy = policy;
    self
  }

  pub fn key_extractor(&mut self, extractor: KeyExtractor) -> &mut LoadBalancerBuilder {
    self.key_extractor = Some(extractor);
    self
  }

  pub fn ema_alpha(&mut self, alpha: f64) -> &mut LoadBalancerBuilder {
    self.ema_alpha = alpha;
    self
  }

  pub fn build(self) -> Result<LoadBalancer, BalancerError> {
    if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
      return Err(BalancerError::invalid(format!(
        "ema_alpha of upstream '{}' must be in (0, 1], got {}",
        self.name, self.ema_alpha
      )));
    }
    if self.health_policy.max_fails == 0 {
      return Err(BalancerError::invalid(format!(
        "max_fails of upstream '{}' must be at least 1",
        self.name
      )));
    }

    let pool = PoolManager::new(self.name.clone(), self.targets, self.strategy.ring_replicas())?;
    Ok(LoadBalancer {
      tracker: HealthTracker::new(self.name.clone(), self.health_policy),
      name: self.name,
      pool: Arc::new(pool),
      strategy: self.strategy,
      key_extractor: self.key_extractor,
      ema_alpha: self.ema_alpha,
    })
  }
}

/// Answers "which target takes this request" and "how did it go" for one upstream group
#[derive(Debug)]
pub struct LoadBalancer {
  name: String,
  pool: Arc<PoolManager>,
  tracker: HealthTracker,
  strategy: Strategy,
  key_extractor: Option<KeyExtractor>,
  ema_alpha: f64,
}

impl LoadBalancer {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn pool(&self) -> &Arc<PoolManager> {
    &self.pool
  }

  pub fn tracker(&self) -> &HealthTracker {
    &self.tracker
  }

  pub fn strategy(&self) -> &Strategy {
    &self.strategy
  }

  pub fn acquire(&self, key: Option<&RequestKey>) -> Result<Lease, BalancerError> {
    let snapshot = self.pool.current_snapshot();
    let now = Instant::now();

    for role in [Role::Primary, Role::Backup] {
      let mut eligible = self.eligible(&snapshot, role, now);
      while !eligible.is_empty() {
        let context = LoadBalancingContext {
          snapshot: &snapshot,
          targets: &eligible,
          key,
        };
        let target = self.strategy.select_target(&context)?.clone();

        match self.tracker.admit(&target, now) {
          Admission::Rejected => {
            // lost the trial slot to a concurrent request
            eligible.retain(|candidate| !candidate.same_instance(&target));
          }
          admission => {
            let trial = admission == Admission::Trial;
            if trial {
              debug!("upstream {}: trial request to {}", self.name, target.id());
            }
            target.stats().start_connection();
            return Ok(Lease {
              target,
              started: now,
              trial,
              released: false,
            });
          }
        }
      }
    }

    Err(BalancerError::PoolExhausted(self.name.clone()))
  }

  /// Extracts the request key with the configured extractor, then acquires
  pub fn acquire_for<B>(&self, request: &Request<B>, client_address: &SocketAddr) -> Result<Lease, BalancerError> {
    let key = self
      .key_extractor
      .as_ref()
      .and_then(|extractor| extractor.extract(request, client_address));
    self.acquire(key.as_ref())
  }

  pub fn release(&self, mut lease: Lease, outcome: Outcome) -> Transition {
    lease.released = true;
    let now = Instant::now();
    lease.target.stats().finish_connection();
    self.complete(&lease.target, outcome, lease.started, now)
  }

  /// Release for hosts that only kept the target id. A release without a matching acquire is ignored, it neither
  /// counts as a request nor feeds the health state.
  pub fn release_by_id(
    &self,
    id: &TargetId,
    outcome: Outcome,
    latency: Duration,
  ) -> Result<Transition, BalancerError> {
    let snapshot = self.pool.current_snapshot();
    let target = snapshot
      .get(id)
      .ok_or_else(|| BalancerError::UnknownTarget(id.clone()))?;
    if !target.stats().finish_connection() {
      return Ok(Transition::Unchanged);
    }
    let now = Instant::now();
    Ok(self.complete(target, outcome, now.checked_sub(latency).unwrap_or(now), now))
  }

  fn complete(&self, target: &Target, outcome: Outcome, started: Instant, now: Instant) -> Transition {
    let stats = target.stats();
    stats.count_request(outcome.is_success());
    stats.observe_response_time(now.saturating_duration_since(started), self.ema_alpha);
    self.tracker.record(target, outcome.is_success(), started, now)
  }

  /// Feeds a probe result into the health state machine, without touching request counters
  pub fn record_probe(&self, target: &Target, success: bool, started: Instant) -> Transition {
    self.tracker.record(target, success, started, Instant::now())
  }

  pub fn update_membership(&self, change: MembershipChange) -> Result<u64, BalancerError> {
    self.pool.update(change)
  }

  pub fn set_role(&self, id: &TargetId, role: Role) -> Result<u64, BalancerError> {
    if role == Role::Down {
      warn!("upstream {}: target {} taken down manually", self.name, id);
    }
    self
      .pool
      .update(MembershipChange::new(SourceKind::Admin).set_role(id.clone(), role))
  }

  pub fn mark_down(&self, id: &TargetId) -> Result<u64, BalancerError> {
    self.set_role(id, Role::Down)
  }

  pub fn stats(&self) -> UpstreamStats {
    let snapshot = self.pool.current_snapshot();
    UpstreamStats {
      name: self.name.clone(),
      strategy: self.strategy.name(),
      version: snapshot.version(),
      stale_refreshes: self.pool.stale_refreshes(),
      targets: snapshot.targets().iter().map(|target| TargetReport::of(target)).collect(),
    }
  }

  fn eligible(&self, snapshot: &PoolSnapshot, role: Role, now: Instant) -> Vec<Arc<Target>> {
    snapshot
      .targets()
      .iter()
      .filter(|target| target.role() == role && self.tracker.is_eligible(target, now))
      .cloned()
      .collect()
  }
}
