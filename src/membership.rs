use crate::{
  configuration::TargetConfig,
  error::BalancerError,
  pool::{PoolManager, SourceKind},
  target::TargetSpec,
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use log::{debug, info};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::lookup_host, task::JoinHandle};

/// Anything that can deliver the full desired target set of an upstream
#[async_trait]
pub trait MembershipSource: Send + Sync {
  fn kind(&self) -> SourceKind;

  async fn fetch(&self) -> Result<Vec<TargetSpec>, BalancerError>;
}

/// Resolves configured `host:port` entries. The configured string stays the target id while the
/// address follows DNS.
#[derive(Debug)]
pub struct DnsSource {
  entries: ArcSwap<Vec<TargetConfig>>,
}

impl DnsSource {
  pub fn new(entries: Vec<TargetConfig>) -> DnsSource {
    DnsSource {
      entries: ArcSwap::from_pointee(entries),
    }
  }

  /// Swaps the entries resolved from the next fetch on, e.g. after a config reload
  pub fn set_entries(&self, entries: Vec<TargetConfig>) {
    self.entries.store(Arc::new(entries));
  }
}

#[async_trait]
impl MembershipSource for DnsSource {
  fn kind(&self) -> SourceKind {
    SourceKind::Dns
  }

  async fn fetch(&self) -> Result<Vec<TargetSpec>, BalancerError> {
    let entries = self.entries.load_full();
    let mut specs = Vec::with_capacity(entries.len());
    for entry in entries.iter() {
      let address = resolve(&entry.address).await?;
      specs.push(
        TargetSpec::new(address)
          .with_id(entry.address.as_str())
          .with_weight(entry.weight)
          .with_role(entry.role),
      );
    }
    Ok(specs)
  }
}

async fn resolve(address: &str) -> Result<SocketAddr, BalancerError> {
  if let Ok(address) = address.parse::<SocketAddr>() {
    return Ok(address);
  }

  let stale = |reason: String| BalancerError::StaleMembership {
    origin: SourceKind::Dns,
    reason,
  };
  // lowest address, so that the pick doesn't flap with the answer order
  lookup_host(address)
    .await
    .map_err(|e| stale(format!("cannot resolve {}: {}", address, e)))?
    .min()
    .ok_or_else(|| stale(format!("{} resolved to no addresses", address)))
}

/// Periodically pulls a [`MembershipSource`] into a pool. Failures leave the last known good
/// membership in place.
pub struct MembershipRefresher {
  pool: Arc<PoolManager>,
  source: Arc<dyn MembershipSource>,
  interval: Duration,
  timeout: Duration,
}

impl MembershipRefresher {
  pub fn new(
    pool: Arc<PoolManager>,
    source: Arc<dyn MembershipSource>,
    interval: Duration,
    timeout: Duration,
  ) -> MembershipRefresher {
    MembershipRefresher {
      pool,
      source,
      interval,
      timeout,
    }
  }

  pub fn spawn(self) -> JoinHandle<()> {
    info!(
      "upstream {}: refreshing {} membership every {:?}",
      self.pool.name(),
      self.source.kind(),
      self.interval
    );
    tokio::spawn(async move {
      let mut timer = tokio::time::interval(self.interval);
      // the first tick completes immediately, the pool was just built from a fresh answer
      timer.tick().await;
      loop {
        timer.tick().await;
        self.refresh().await;
      }
    })
  }

  pub async fn refresh(&self) {
    let kind = self.source.kind();
    let result = match tokio::time::timeout(self.timeout, self.source.fetch()).await {
      Ok(result) => result,
      Err(_) => Err(BalancerError::StaleMembership {
        origin: kind,
        reason: format!("no answer within {:?}", self.timeout),
      }),
    };

    match result.and_then(|desired| self.pool.replace(kind, &desired)) {
      Ok(version) => debug!("upstream {}: {} refresh at version {}", self.pool.name(), kind, version),
      Err(e) => self.pool.report_stale(&e),
    }
  }
}
