use crate::{
  health::HealthState,
  target::{Role, Target, TargetId},
};
use serde::Serialize;
use std::{fmt, net::SocketAddr};

/// Point-in-time counters of one upstream, for whatever monitoring the host runs
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStats {
  pub name: String,
  pub strategy: &'static str,
  pub version: u64,
  pub stale_refreshes: u64,
  pub targets: Vec<TargetReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
  pub id: TargetId,
  pub address: SocketAddr,
  pub weight: u32,
  pub role: Role,
  pub health: HealthState,
  pub active_connections: usize,
  pub consecutive_failures: u32,
  pub response_time_ema_ms: f64,
  pub total_requests: u64,
  pub total_failures: u64,
}

impl TargetReport {
  pub fn of(target: &Target) -> TargetReport {
    let stats = target.stats();
    let (health, consecutive_failures) = {
      let record = stats.health();
      (record.state(), record.consecutive_failures())
    };
    TargetReport {
      id: target.id().clone(),
      address: target.address(),
      weight: target.weight(),
      role: target.role(),
      health,
      active_connections: stats.active_connections(),
      consecutive_failures,
      response_time_ema_ms: stats.response_time_ema(),
      total_requests: stats.total_requests(),
      total_failures: stats.total_failures(),
    }
  }
}

impl fmt::Display for UpstreamStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "upstream {} ({}), version {}, {} stale refreshes",
      self.name, self.strategy, self.version, self.stale_refreshes
    )?;
    for target in &self.targets {
      write!(f, "\n  {}", target)?;
    }
    Ok(())
  }
}

impl fmt::Display for TargetReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} [{}] {} weight={} {} active={} failures={} ema={:.1}ms requests={}/{} failed",
      self.id,
      self.address,
      self.role,
      self.weight,
      self.health,
      self.active_connections,
      self.consecutive_failures,
      self.response_time_ema_ms,
      self.total_requests,
      self.total_failures
    )
  }
}
