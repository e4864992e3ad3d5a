use crate::{
  balancer::{LoadBalancer, LoadBalancerBuilder},
  configuration::{Config, UpstreamConfig},
  error::BalancerError,
  load_balancing::Strategy,
  membership::{DnsSource, MembershipRefresher, MembershipSource},
  pool::SourceKind,
  probe::ActiveHealthChecker,
  stats::UpstreamStats,
};
use futures::future::{join_all, try_join_all};
use log::{info, warn};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::task::JoinHandle;

/// Upper bound for a single DNS refresh
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// One running upstream group: the balancer plus the background tasks feeding it
pub struct Upstream {
  config: UpstreamConfig,
  balancer: Arc<LoadBalancer>,
  dns: Arc<DnsSource>,
  tasks: Vec<JoinHandle<()>>,
}

impl Upstream {
  pub async fn start(config: UpstreamConfig) -> Result<Upstream, BalancerError> {
    let dns = Arc::new(DnsSource::new(config.targets.clone()));
    let targets = dns.fetch().await?;

    let mut builder = LoadBalancerBuilder::new(config.name.clone(), targets, Strategy::from(&config.strategy));
    builder.health_policy(config.health.policy()).ema_alpha(config.ema_alpha);
    if let Some(key) = &config.key {
      builder.key_extractor(key.clone());
    }
    let balancer = Arc::new(builder.build()?);

    let mut tasks = Vec::new();
    if let Some(probe) = &config.health.probe {
      let prober = probe.kind.prober(probe.timeout());
      tasks.push(ActiveHealthChecker::new(balancer.clone(), prober, probe.interval(), probe.timeout()).spawn());
    }
    if let Some(interval) = config.dns_refresh() {
      let refresher = MembershipRefresher::new(
        balancer.pool().clone(),
        dns.clone(),
        interval,
        interval.min(DNS_TIMEOUT),
      );
      tasks.push(refresher.spawn());
    }

    info!(
      "upstream {}: started with {} targets, strategy {}",
      balancer.name(),
      balancer.pool().current_snapshot().len(),
      balancer.strategy().name()
    );
    Ok(Upstream {
      config,
      balancer,
      dns,
      tasks,
    })
  }

  pub fn name(&self) -> &str {
    &self.config.name
  }

  pub fn config(&self) -> &UpstreamConfig {
    &self.config
  }

  pub fn balancer(&self) -> &Arc<LoadBalancer> {
    &self.balancer
  }

  /// Applies the target list of a reloaded configuration. Everything else only takes effect after a restart.
  pub async fn reload(&mut self, config: UpstreamConfig) -> Result<u64, BalancerError> {
    if config.strategy != self.config.strategy
      || config.health != self.config.health
      || config.key != self.config.key
      || config.ema_alpha != self.config.ema_alpha
      || config.dns_refresh_secs != self.config.dns_refresh_secs
    {
      warn!(
        "upstream {}: only target changes are applied on reload, restart to apply the rest",
        self.name()
      );
    }

    let targets = DnsSource::new(config.targets.clone()).fetch().await?;
    let version = self.balancer.pool().replace(SourceKind::Static, &targets)?;
    self.dns.set_entries(config.targets.clone());
    self.config = config;
    Ok(version)
  }

  pub async fn shutdown(mut self) {
    let tasks = std::mem::take(&mut self.tasks);
    for task in &tasks {
      task.abort();
    }
    join_all(tasks).await;
    info!("upstream {}: stopped", self.name());
  }
}

impl Drop for Upstream {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}

/// Independent upstream groups, keyed by name
#[derive(Default)]
pub struct Upstreams {
  upstreams: HashMap<String, Upstream>,
}

impl Upstreams {
  pub async fn start(config: &Config) -> Result<Upstreams, BalancerError> {
    let started = try_join_all(config.upstreams.iter().cloned().map(Upstream::start)).await?;
    let upstreams = started
      .into_iter()
      .map(|upstream| (upstream.name().to_string(), upstream))
      .collect();
    Ok(Upstreams { upstreams })
  }

  pub fn get(&self, name: &str) -> Option<&Arc<LoadBalancer>> {
    self.upstreams.get(name).map(Upstream::balancer)
  }

  pub fn len(&self) -> usize {
    self.upstreams.len()
  }

  pub fn is_empty(&self) -> bool {
    self.upstreams.is_empty()
  }

  /// Reloads every upstream that survived the config change. A failing upstream keeps its membership
  /// and doesn't stop the others.
  pub async fn reload(&mut self, config: Config) {
    for name in self.upstreams.keys() {
      if config.upstream(name).is_none() {
        warn!("upstream {} was removed from the configuration, restart to stop it", name);
      }
    }

    for upstream_config in config.upstreams {
      let name = upstream_config.name.clone();
      match self.upstreams.get_mut(&name) {
        Some(upstream) => {
          if let Err(e) = upstream.reload(upstream_config).await {
            warn!("upstream {}: reload failed, {}", name, e);
          }
        }
        None => warn!("upstream {} was added to the configuration, restart to start it", name),
      }
    }
  }

  /// Stats of all upstreams, ordered by name
  pub fn stats(&self) -> Vec<UpstreamStats> {
    let mut stats: Vec<UpstreamStats> = self
      .upstreams
      .values()
      .map(|upstream| upstream.balancer().stats())
      .collect();
    stats.sort_by(|a, b| a.name.cmp(&b.name));
    stats
  }

  pub async fn shutdown(self) {
    join_all(self.upstreams.into_values().map(Upstream::shutdown)).await;
  }
}
