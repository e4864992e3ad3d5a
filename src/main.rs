use clap::{Arg, Command};
use log::{error, info, warn};
use std::time::Duration;
use upstream_balancer::{
  configuration::{Config, ConfigWatcher},
  logging, BalancerError, Upstreams,
};

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_DEBOUNCE: Duration = Duration::from_secs(2);

#[tokio::main]
pub async fn main() -> Result<(), BalancerError> {
  let matches = Command::new("upstream-balancer")
    .version(env!("CARGO_PKG_VERSION"))
    .about("Picks backend targets for upstream groups and keeps track of their health")
    .arg(
      Arg::new("config")
        .short('c')
        .long("config")
        .takes_value(true)
        .default_value(DEFAULT_CONFIG_PATH)
        .help("Path of the TOML configuration file"),
    )
    .arg(
      Arg::new("stats-interval")
        .long("stats-interval")
        .takes_value(true)
        .default_value("60")
        .help("Seconds between two stats log lines, 0 disables them"),
    )
    .get_matches();

  let _handle = logging::initialize()?;

  let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH).to_string();
  let stats_interval = matches
    .value_of("stats-interval")
    .unwrap_or("60")
    .parse::<u64>()
    .map_err(|e| BalancerError::invalid(format!("invalid --stats-interval: {}", e)))?;

  let config = Config::load(&config_path)?;
  let mut upstreams = Upstreams::start(&config).await?;
  info!("Serving {} upstreams from {}", upstreams.len(), config_path);

  let mut watcher = match ConfigWatcher::start(&config_path, CONFIG_DEBOUNCE) {
    Ok(watcher) => Some(watcher),
    Err(e) => {
      warn!("Configuration changes won't be picked up: {}", e);
      None
    }
  };

  let mut stats_timer = (stats_interval > 0).then(|| tokio::time::interval(Duration::from_secs(stats_interval)));

  loop {
    tokio::select! {
      Some(config) = next_config(&mut watcher) => {
        info!("Configuration changed, reloading upstreams");
        upstreams.reload(config).await;
      }
      _ = tick(&mut stats_timer) => {
        for stats in upstreams.stats() {
          info!("{}", stats);
        }
      }
      result = tokio::signal::ctrl_c() => {
        if let Err(e) = result {
          error!("Cannot listen for shutdown signal: {}", e);
        }
        break;
      }
    }
  }

  info!("Shutting down");
  upstreams.shutdown().await;
  Ok(())
}

async fn next_config(watcher: &mut Option<ConfigWatcher>) -> Option<Config> {
  match watcher {
    Some(watcher) => watcher.next().await,
    None => std::future::pending().await,
  }
}

async fn tick(timer: &mut Option<tokio::time::Interval>) {
  match timer {
    Some(timer) => {
      timer.tick().await;
    }
    None => std::future::pending().await,
  }
}
