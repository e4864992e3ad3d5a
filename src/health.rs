use crate::target::{Role, Target};
use log::{info, warn};
use serde::Serialize;
use std::{fmt, time::Duration};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthState {
  Healthy,
  Unhealthy,
  /// A single trial request is in flight
  Probing,
}

impl fmt::Display for HealthState {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      HealthState::Healthy => write!(f, "Healthy"),
      HealthState::Unhealthy => write!(f, "Unhealthy"),
      HealthState::Probing => write!(f, "Probing"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
  pub max_fails: u32,
  pub fail_timeout: Duration,
}

impl Default for HealthPolicy {
  fn default() -> Self {
    HealthPolicy {
      max_fails: 1,
      fail_timeout: Duration::from_secs(10),
    }
  }
}

/// Passive health bookkeeping of a single target, guarded by the target's own mutex
#[derive(Debug)]
pub struct HealthRecord {
  state: HealthState,
  consecutive_failures: u32,
  window_start: Option<Instant>,
  unhealthy_since: Option<Instant>,
}

impl Default for HealthRecord {
  fn default() -> Self {
    HealthRecord {
      state: HealthState::Healthy,
      consecutive_failures: 0,
      window_start: None,
      unhealthy_since: None,
    }
  }
}

impl HealthRecord {
  pub fn state(&self) -> HealthState {
    self.state
  }

  pub fn consecutive_failures(&self) -> u32 {
    self.consecutive_failures
  }

  fn trial_due(&self, now: Instant, fail_timeout: Duration) -> bool {
    self
      .unhealthy_since
      .map(|since| now.saturating_duration_since(since) >= fail_timeout)
      .unwrap_or(true)
  }

  fn recover(&mut self) {
    self.state = HealthState::Healthy;
    self.consecutive_failures = 0;
    self.window_start = None;
    self.unhealthy_since = None;
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
  Regular,
  /// The target was unhealthy and this request is its single trial
  Trial,
  Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Unchanged,
  MarkedUnhealthy,
  TrialFailed,
  Recovered,
}

/// Drives the per-target health state machine.
///
/// Probe results and request outcomes both go through [`HealthTracker::record_outcome`]. An outcome only
/// moves an unhealthy target if the check behind it started after the target became unhealthy, so
/// requests that were already in flight at that point can't flip it back.
#[derive(Debug, Clone)]
pub struct HealthTracker {
  upstream: String,
  policy: HealthPolicy,
}

impl HealthTracker {
  pub fn new<S: Into<String>>(upstream: S, policy: HealthPolicy) -> HealthTracker {
    HealthTracker {
      upstream: upstream.into(),
      policy,
    }
  }

  pub fn policy(&self) -> &HealthPolicy {
    &self.policy
  }

  pub fn state(&self, target: &Target) -> HealthState {
    target.stats().health().state
  }

  pub fn is_eligible(&self, target: &Target, now: Instant) -> bool {
    if target.role() == Role::Down {
      return false;
    }
    let record = target.stats().health();
    match record.state {
      HealthState::Healthy => true,
      HealthState::Unhealthy => record.trial_due(now, self.policy.fail_timeout),
      HealthState::Probing => false,
    }
  }

  /// Claims the target for one request. An unhealthy target whose `fail_timeout` ran out is handed out
  /// exactly once as a trial, every other caller gets [`Admission::Rejected`] until the trial reports back.
  pub fn admit(&self, target: &Target, now: Instant) -> Admission {
    if target.role() == Role::Down {
      return Admission::Rejected;
    }
    let mut record = target.stats().health();
    match record.state {
      HealthState::Healthy => Admission::Regular,
      HealthState::Unhealthy if record.trial_due(now, self.policy.fail_timeout) => {
        record.state = HealthState::Probing;
        Admission::Trial
      }
      _ => Admission::Rejected,
    }
  }

  pub fn record_outcome(&self, target: &Target, success: bool, latency: Duration) -> Transition {
    let now = Instant::now();
    let started = now.checked_sub(latency).unwrap_or(now);
    self.record(target, success, started, now)
  }

  pub(crate) fn record(&self, target: &Target, success: bool, started: Instant, now: Instant) -> Transition {
    let mut record = target.stats().health();
    let transition = match record.state {
      HealthState::Healthy if success => {
        record.consecutive_failures = 0;
        record.window_start = None;
        Transition::Unchanged
      }
      HealthState::Healthy => {
        let fail_timeout = self.policy.fail_timeout;
        let window_open = record
          .window_start
          .map(|start| now.saturating_duration_since(start) <= fail_timeout)
          .unwrap_or(false);
        if window_open {
          record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        } else {
          record.window_start = Some(now);
          record.consecutive_failures = 1;
        }

        if record.consecutive_failures >= self.policy.max_fails {
          record.state = HealthState::Unhealthy;
          record.unhealthy_since = Some(now);
          Transition::MarkedUnhealthy
        } else {
          Transition::Unchanged
        }
      }
      state => {
        let fresh = record.unhealthy_since.map(|since| started >= since).unwrap_or(true);
        if !fresh {
          Transition::Unchanged
        } else if success {
          record.recover();
          Transition::Recovered
        } else {
          record.state = HealthState::Unhealthy;
          record.unhealthy_since = Some(now);
          record.consecutive_failures = record.consecutive_failures.saturating_add(1);
          if state == HealthState::Probing {
            Transition::TrialFailed
          } else {
            Transition::Unchanged
          }
        }
      }
    };
    let failures = record.consecutive_failures;
    drop(record);

    match transition {
      Transition::MarkedUnhealthy => warn!(
        "upstream {}: target {} is unhealthy after {} consecutive failures",
        self.upstream,
        target.id(),
        failures
      ),
      Transition::TrialFailed => warn!(
        "upstream {}: trial request to {} failed, excluded for another {:?}",
        self.upstream,
        target.id(),
        self.policy.fail_timeout
      ),
      Transition::Recovered => info!("upstream {}: target {} is healthy again", self.upstream, target.id()),
      Transition::Unchanged => {}
    }
    transition
  }

  /// Hands an unused trial slot back, e.g. when the request was dropped before reporting
  pub(crate) fn abandon_trial(target: &Target) {
    let mut record = target.stats().health();
    if record.state == HealthState::Probing {
      record.state = HealthState::Unhealthy;
    }
  }
}
