use crate::{
  balancer::DEFAULT_EMA_ALPHA,
  error::BalancerError,
  hash_ring::{DEFAULT_REPLICAS, MAX_REPLICAS},
  health::HealthPolicy,
  key::KeyExtractor,
  load_balancing::{
    consistent_hash::ConsistentHash,
    hash::KeyHash,
    least_connection::LeastConnection,
    least_response_time::{LeastResponseTime, DEFAULT_CONNECTION_WEIGHT, DEFAULT_LATENCY_WEIGHT},
    random::Random,
    round_robin::RoundRobin,
    weighted_round_robin::WeightedRoundRobin,
    Strategy,
  },
  pool::MAX_WEIGHT,
  probe::ProbeKind,
  target::Role,
};
use log::{info, warn};
use notify::{watcher, DebouncedEvent, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::{collections::HashSet, fs, sync::mpsc::channel, time::Duration};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
  pub upstreams: Vec<UpstreamConfig>,
}

impl Config {
  pub fn load(toml_path: &str) -> Result<Config, BalancerError> {
    let toml_str = fs::read_to_string(toml_path)?;
    let config = Config::parse(&toml_str)?;
    info!("Successfully parsed configuration {}", toml_path);
    Ok(config)
  }

  pub fn parse(toml_str: &str) -> Result<Config, BalancerError> {
    let config: Config = toml::from_str(toml_str).map_err(|e| BalancerError::invalid(e.to_string()))?;
    config.validate()?;
    config.print_warnings();
    Ok(config)
  }

  pub fn upstream(&self, name: &str) -> Option<&UpstreamConfig> {
    self.upstreams.iter().find(|upstream| upstream.name == name)
  }

  fn validate(&self) -> Result<(), BalancerError> {
    if self.upstreams.is_empty() {
      return Err(BalancerError::invalid("no upstreams configured"));
    }

    let mut names = HashSet::new();
    for upstream in &self.upstreams {
      if !names.insert(upstream.name.as_str()) {
        return Err(BalancerError::invalid(format!(
          "upstream '{}' is configured twice",
          upstream.name
        )));
      }
      upstream.validate()?;
    }
    Ok(())
  }

  fn print_warnings(&self) {
    for upstream in &self.upstreams {
      if upstream.strategy.needs_key() && upstream.key.is_none() {
        warn!(
          "upstream '{}' uses a hash strategy without a key, requests will be spread round robin",
          upstream.name
        );
      }
      if upstream.ignores_weights() {
        warn!(
          "upstream '{}' sets different weights but RoundRobin ignores them, use WeightedRoundRobin instead",
          upstream.name
        );
      }
      if upstream.dns_refresh_secs.is_none() && upstream.targets.iter().any(|target| !target.is_literal()) {
        warn!(
          "upstream '{}' has DNS targets but no dns_refresh_secs, they are resolved only once",
          upstream.name
        );
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamConfig {
  pub name: String,
  pub strategy: StrategyConfig,
  pub targets: Vec<TargetConfig>,
  #[serde(default)]
  pub key: Option<KeyExtractor>,
  #[serde(default = "default_ema_alpha")]
  pub ema_alpha: f64,
  #[serde(default)]
  pub dns_refresh_secs: Option<u64>,
  #[serde(default)]
  pub health: HealthConfig,
}

impl UpstreamConfig {
  pub fn dns_refresh(&self) -> Option<Duration> {
    self.dns_refresh_secs.map(Duration::from_secs)
  }

  /// Configured weights that have no effect on the chosen strategy
  pub fn ignores_weights(&self) -> bool {
    self.strategy == StrategyConfig::RoundRobin
      && self
        .targets
        .windows(2)
        .any(|pair| pair[0].weight != pair[1].weight)
  }

  fn validate(&self) -> Result<(), BalancerError> {
    let name = &self.name;
    if self.targets.is_empty() {
      return Err(BalancerError::invalid(format!("upstream '{}' has no targets", name)));
    }

    let mut addresses = HashSet::new();
    for target in &self.targets {
      if target.weight == 0 {
        return Err(BalancerError::invalid(format!(
          "target {} of upstream '{}' has weight 0",
          target.address, name
        )));
      }
      if target.weight > MAX_WEIGHT {
        return Err(BalancerError::invalid(format!(
          "target {} of upstream '{}' has weight {}, at most {} is allowed",
          target.address, name, target.weight, MAX_WEIGHT
        )));
      }
      if !addresses.insert(target.address.as_str()) {
        return Err(BalancerError::invalid(format!(
          "target {} is listed twice in upstream '{}'",
          target.address, name
        )));
      }
    }

    if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
      return Err(BalancerError::invalid(format!(
        "ema_alpha of upstream '{}' must be in (0, 1], got {}",
        name, self.ema_alpha
      )));
    }
    if self.dns_refresh_secs == Some(0) {
      return Err(BalancerError::invalid(format!(
        "dns_refresh_secs of upstream '{}' must not be 0",
        name
      )));
    }
    if let StrategyConfig::ConsistentHash { replicas } = self.strategy {
      if replicas == 0 || replicas > MAX_REPLICAS {
        return Err(BalancerError::invalid(format!(
          "consistent hash of upstream '{}' needs between 1 and {} replicas, got {}",
          name, MAX_REPLICAS, replicas
        )));
      }
    }
    self.health.validate(name)
  }
}

fn default_ema_alpha() -> f64 {
  DEFAULT_EMA_ALPHA
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TargetConfig {
  /// `ip:port` or `hostname:port`, doubles as the target id
  pub address: String,
  #[serde(default = "default_weight")]
  pub weight: u32,
  #[serde(default)]
  pub role: Role,
}

impl TargetConfig {
  pub fn new<S: Into<String>>(address: S) -> TargetConfig {
    TargetConfig {
      address: address.into(),
      weight: 1,
      role: Role::default(),
    }
  }

  /// Whether the address is a socket address that needs no resolution
  pub fn is_literal(&self) -> bool {
    self.address.parse::<std::net::SocketAddr>().is_ok()
  }
}

fn default_weight() -> u32 {
  1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub enum StrategyConfig {
  RoundRobin,
  WeightedRoundRobin,
  LeastConnection,
  Hash,
  Random,
  ConsistentHash {
    #[serde(default = "default_replicas")]
    replicas: u32,
  },
  LeastResponseTime {
    #[serde(default = "default_latency_weight")]
    latency_weight: f64,
    #[serde(default = "default_connection_weight")]
    connection_weight: f64,
  },
}

impl StrategyConfig {
  pub fn needs_key(&self) -> bool {
    matches!(self, StrategyConfig::Hash | StrategyConfig::ConsistentHash { .. })
  }
}

fn default_replicas() -> u32 {
  DEFAULT_REPLICAS
}

fn default_latency_weight() -> f64 {
  DEFAULT_LATENCY_WEIGHT
}

fn default_connection_weight() -> f64 {
  DEFAULT_CONNECTION_WEIGHT
}

impl From<&StrategyConfig> for Strategy {
  fn from(other: &StrategyConfig) -> Self {
    match *other {
      StrategyConfig::RoundRobin => Strategy::RoundRobin(RoundRobin::new()),
      StrategyConfig::WeightedRoundRobin => Strategy::WeightedRoundRobin(WeightedRoundRobin::new()),
      StrategyConfig::LeastConnection => Strategy::LeastConnection(LeastConnection::new()),
      StrategyConfig::Hash => Strategy::Hash(KeyHash::new()),
      StrategyConfig::Random => Strategy::Random(Random::new()),
      StrategyConfig::ConsistentHash { replicas } => Strategy::ConsistentHash(ConsistentHash::new(replicas)),
      StrategyConfig::LeastResponseTime {
        latency_weight,
        connection_weight,
      } => Strategy::LeastResponseTime(LeastResponseTime::new(latency_weight, connection_weight)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthConfig {
  #[serde(default = "default_max_fails")]
  pub max_fails: u32,
  #[serde(default = "default_fail_timeout_secs")]
  pub fail_timeout_secs: u64,
  #[serde(default)]
  pub probe: Option<ProbeConfig>,
}

impl Default for HealthConfig {
  fn default() -> Self {
    HealthConfig {
      max_fails: default_max_fails(),
      fail_timeout_secs: default_fail_timeout_secs(),
      probe: None,
    }
  }
}

impl HealthConfig {
  pub fn policy(&self) -> HealthPolicy {
    HealthPolicy {
      max_fails: self.max_fails,
      fail_timeout: Duration::from_secs(self.fail_timeout_secs),
    }
  }

  fn validate(&self, upstream: &str) -> Result<(), BalancerError> {
    if self.max_fails == 0 {
      return Err(BalancerError::invalid(format!(
        "max_fails of upstream '{}' must be at least 1",
        upstream
      )));
    }
    if let Some(probe) = &self.probe {
      if probe.interval_ms == 0 || probe.timeout_ms == 0 {
        return Err(BalancerError::invalid(format!(
          "probe interval and timeout of upstream '{}' must not be 0",
          upstream
        )));
      }
    }
    Ok(())
  }
}

fn default_max_fails() -> u32 {
  HealthPolicy::default().max_fails
}

fn default_fail_timeout_secs() -> u64 {
  HealthPolicy::default().fail_timeout.as_secs()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProbeConfig {
  pub interval_ms: u64,
  pub timeout_ms: u64,
  pub kind: ProbeKind,
}

impl ProbeConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_millis(self.interval_ms)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

/// Re-reads the configuration file whenever it is written and hands every valid version to the runtime
pub struct ConfigWatcher {
  // dropping this would stop the file events
  _watcher: RecommendedWatcher,
  configs: UnboundedReceiver<Config>,
}

impl ConfigWatcher {
  pub fn start(toml_path: &str, debounce: Duration) -> Result<ConfigWatcher, BalancerError> {
    let path = toml_path.to_string();
    let (tx, rx) = channel();
    let mut watcher = watcher(tx, debounce)
      .map_err(|e| BalancerError::invalid(format!("cannot watch {}: {}", toml_path, e)))?;
    watcher
      .watch(&path, RecursiveMode::NonRecursive)
      .map_err(|e| BalancerError::invalid(format!("cannot watch {}: {}", toml_path, e)))?;

    let (cs, configs) = unbounded_channel();
    std::thread::spawn(move || loop {
      let result = match rx.recv() {
        Ok(DebouncedEvent::NoticeWrite(_)) | Ok(DebouncedEvent::Write(_)) => Config::load(&path),
        Ok(_) => continue,
        Err(_) => return,
      };

      match result {
        Ok(config) => {
          if cs.send(config).is_err() {
            // the runtime is gone
            return;
          }
        }
        Err(e) => warn!("Ignoring changed configuration file {}: {}", path, e),
      }
    });

    Ok(ConfigWatcher {
      _watcher: watcher,
      configs,
    })
  }

  pub async fn next(&mut self) -> Option<Config> {
    self.configs.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::load_balancing::LoadBalancingStrategy;

  const FULL: &str = r#"
    [[upstreams]]
    name = "web"
    strategy = { ConsistentHash = { replicas = 40 } }
    key = { Header = "x-user" }
    ema_alpha = 0.5
    dns_refresh_secs = 30

    [[upstreams.targets]]
    address = "10.0.0.1:8080"
    weight = 3

    [[upstreams.targets]]
    address = "backend.internal:8080"
    role = "Backup"

    [upstreams.health]
    max_fails = 3
    fail_timeout_secs = 20
    probe = { interval_ms = 500, timeout_ms = 200, kind = { Http = { path = "/health" } } }

    [[upstreams]]
    name = "api"
    strategy = "LeastConnection"
    targets = [{ address = "10.0.1.1:9000" }]
  "#;

  #[test]
  pub fn parse_full_config() {
    let config = Config::parse(FULL).unwrap();

    assert_eq!(config.upstreams.len(), 2);
    let web = config.upstream("web").unwrap();
    assert_eq!(web.strategy, StrategyConfig::ConsistentHash { replicas: 40 });
    assert_eq!(web.key, Some(KeyExtractor::Header("x-user".into())));
    assert_eq!(web.ema_alpha, 0.5);
    assert_eq!(web.dns_refresh(), Some(Duration::from_secs(30)));
    assert_eq!(web.targets[0].weight, 3);
    assert_eq!(web.targets[0].role, Role::Primary);
    assert_eq!(web.targets[1].role, Role::Backup);
    assert!(web.targets[0].is_literal());
    assert!(!web.targets[1].is_literal());

    let probe = web.health.probe.as_ref().unwrap();
    assert_eq!(probe.interval(), Duration::from_millis(500));
    assert_eq!(probe.timeout(), Duration::from_millis(200));
    assert_eq!(
      probe.kind,
      ProbeKind::Http {
        path: "/health".into()
      }
    );
    assert_eq!(
      web.health.policy(),
      HealthPolicy {
        max_fails: 3,
        fail_timeout: Duration::from_secs(20)
      }
    );
  }

  #[test]
  pub fn defaults_apply() {
    let config = Config::parse(FULL).unwrap();

    let api = config.upstream("api").unwrap();
    assert_eq!(api.strategy, StrategyConfig::LeastConnection);
    assert_eq!(api.key, None);
    assert_eq!(api.ema_alpha, DEFAULT_EMA_ALPHA);
    assert_eq!(api.dns_refresh(), None);
    assert_eq!(api.targets[0].weight, 1);
    assert_eq!(api.health, HealthConfig::default());
    assert_eq!(api.health.policy(), HealthPolicy::default());
  }

  #[test]
  pub fn strategy_defaults() {
    let config = Config::parse(
      r#"
      [[upstreams]]
      name = "a"
      strategy = { LeastResponseTime = {} }
      targets = [{ address = "10.0.0.1:80" }]

      [[upstreams]]
      name = "b"
      strategy = { ConsistentHash = {} }
      targets = [{ address = "10.0.0.1:80" }]
    "#,
    )
    .unwrap();

    assert_eq!(
      config.upstreams[0].strategy,
      StrategyConfig::LeastResponseTime {
        latency_weight: DEFAULT_LATENCY_WEIGHT,
        connection_weight: DEFAULT_CONNECTION_WEIGHT
      }
    );
    assert_eq!(
      config.upstreams[1].strategy,
      StrategyConfig::ConsistentHash {
        replicas: DEFAULT_REPLICAS
      }
    );
  }

  #[test]
  pub fn strategy_conversion() {
    let cases = [
      (StrategyConfig::RoundRobin, "round-robin"),
      (StrategyConfig::WeightedRoundRobin, "weighted-round-robin"),
      (StrategyConfig::LeastConnection, "least-connection"),
      (StrategyConfig::Hash, "hash"),
      (StrategyConfig::Random, "random"),
      (StrategyConfig::ConsistentHash { replicas: 7 }, "consistent-hash"),
      (
        StrategyConfig::LeastResponseTime {
          latency_weight: 1.0,
          connection_weight: 1.0,
        },
        "least-response-time",
      ),
    ];

    for (config, name) in cases {
      let strategy = Strategy::from(&config);
      assert_eq!(strategy.name(), name);
      assert_eq!(strategy.ring_replicas().is_some(), name == "consistent-hash");
    }
    assert_eq!(
      Strategy::from(&StrategyConfig::ConsistentHash { replicas: 7 }).ring_replicas(),
      Some(7)
    );
  }

  fn assert_invalid(toml_str: &str, fragment: &str) {
    match Config::parse(toml_str) {
      Err(BalancerError::InvalidConfiguration(message)) => {
        assert!(message.contains(fragment), "'{}' does not contain '{}'", message, fragment)
      }
      other => panic!("expected invalid configuration, got {:?}", other),
    }
  }

  fn single(upstream_body: &str) -> String {
    format!("[[upstreams]]\nname = \"web\"\n{}", upstream_body)
  }

  #[test]
  pub fn reject_invalid_configs() {
    assert_invalid("upstreams = []", "no upstreams");
    assert_invalid(
      &single("strategy = \"RoundRobin\"\ntargets = []"),
      "has no targets",
    );
    assert_invalid(
      &single("strategy = \"RoundRobin\"\ntargets = [{ address = \"10.0.0.1:80\", weight = 0 }]"),
      "weight 0",
    );
    assert_invalid(
      &single("strategy = \"RoundRobin\"\ntargets = [{ address = \"10.0.0.1:80\" }, { address = \"10.0.0.1:80\" }]"),
      "listed twice",
    );
    assert_invalid(
      &single("strategy = \"Fastest\"\ntargets = [{ address = \"10.0.0.1:80\" }]"),
      "unknown variant",
    );
    assert_invalid(
      &single("strategy = \"RoundRobin\"\nema_alpha = 1.5\ntargets = [{ address = \"10.0.0.1:80\" }]"),
      "ema_alpha",
    );
    assert_invalid(
      &single("strategy = \"RoundRobin\"\nema_alpha = 0.0\ntargets = [{ address = \"10.0.0.1:80\" }]"),
      "ema_alpha",
    );
    assert_invalid(
      &single("strategy = \"RoundRobin\"\ntargets = [{ address = \"10.0.0.1:80\" }]\nhealth = { max_fails = 0 }"),
      "max_fails",
    );
    assert_invalid(
      &single(
        "strategy = \"RoundRobin\"\ntargets = [{ address = \"10.0.0.1:80\" }]\nhealth = { probe = { interval_ms = 0, timeout_ms = 10, kind = \"Tcp\" } }",
      ),
      "probe interval",
    );
    assert_invalid(
      &single("strategy = { ConsistentHash = { replicas = 0 } }\ntargets = [{ address = \"10.0.0.1:80\" }]"),
      "replicas",
    );
    assert_invalid(
      &single("strategy = { ConsistentHash = { replicas = 100000 } }\ntargets = [{ address = \"10.0.0.1:80\" }]"),
      "replicas",
    );
    assert_invalid(
      &single("strategy = \"Random\"\ntargets = [{ address = \"10.0.0.1:80\", weight = 10000000 }]"),
      "at most 1000",
    );
  }

  #[test]
  pub fn round_robin_with_weights_is_flagged() {
    let weighted = |strategy: &str| {
      Config::parse(&single(&format!(
        "strategy = {}\ntargets = [{{ address = \"10.0.0.1:80\", weight = 3 }}, {{ address = \"10.0.0.2:80\" }}]",
        strategy
      )))
      .unwrap()
      .upstreams
      .remove(0)
    };

    assert!(weighted("\"RoundRobin\"").ignores_weights());
    assert!(!weighted("\"WeightedRoundRobin\"").ignores_weights());
    assert!(!weighted("\"Random\"").ignores_weights());

    let equal = Config::parse(&single(
      "strategy = \"RoundRobin\"\ntargets = [{ address = \"10.0.0.1:80\", weight = 2 }, { address = \"10.0.0.2:80\", weight = 2 }]",
    ))
    .unwrap();
    assert!(!equal.upstreams[0].ignores_weights());
  }

  #[test]
  pub fn reject_duplicate_upstreams() {
    let upstream = "[[upstreams]]\nname = \"web\"\nstrategy = \"Random\"\ntargets = [{ address = \"10.0.0.1:80\" }]\n";

    assert_invalid(&format!("{}{}", upstream, upstream), "configured twice");
  }

  #[test]
  pub fn converted_strategy_selects() {
    use crate::{load_balancing::LoadBalancingContext, pool::PoolManager, target::TargetSpec};

    let pool = PoolManager::new("web", vec![TargetSpec::new("127.0.0.1:1".parse().unwrap())], None).unwrap();
    let snapshot = pool.current_snapshot();
    let context = LoadBalancingContext {
      snapshot: &snapshot,
      targets: snapshot.targets(),
      key: None,
    };

    let strategy = Strategy::from(&StrategyConfig::Random);

    assert_eq!(strategy.select_target(&context).unwrap().address().port(), 1);
  }

  #[test]
  pub fn load_missing_file() {
    assert!(matches!(
      Config::load("/nonexistent/upstream-balancer.toml"),
      Err(BalancerError::Io(_))
    ));
  }

  #[test]
  pub fn watching_missing_file_fails() {
    assert!(ConfigWatcher::start("/nonexistent/upstream-balancer.toml", Duration::from_secs(1)).is_err());
  }
}
