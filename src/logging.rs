use crate::error::BalancerError;
use log::{info, LevelFilter};
use log4rs::{
  append::console::ConsoleAppender,
  config::{Appender, Root},
  encode::pattern::PatternEncoder,
  Config,
};

const DEFAULT_LOG_LEVEL: &str = "INFO";

pub fn initialize() -> Result<log4rs::Handle, BalancerError> {
  let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.into());
  let level_filter = parse_level_filter(&log_level)
    .ok_or_else(|| BalancerError::invalid(format!("Invalid log level: {}", &log_level)))?;

  let stdout = ConsoleAppender::builder()
    .encoder(Box::new(PatternEncoder::new("{d} {h({l:5})} {t} - {m}{n}")))
    .build();
  let config = Config::builder()
    .appender(Appender::builder().build("stdout", Box::new(stdout)))
    .build(Root::builder().appender("stdout").build(level_filter))
    .map_err(|e| BalancerError::invalid(format!("Invalid logging configuration: {}", e)))?;

  let handle = log4rs::init_config(config)
    .map_err(|e| BalancerError::invalid(format!("Initializing logging failed: {}", e)))?;
  info!("Logging Level: {}", &level_filter);
  Ok(handle)
}

fn parse_level_filter(str: &str) -> Option<LevelFilter> {
  match str.to_lowercase().as_str() {
    "off" => Some(LevelFilter::Off),
    "error" => Some(LevelFilter::Error),
    "warn" => Some(LevelFilter::Warn),
    "info" => Some(LevelFilter::Info),
    "debug" => Some(LevelFilter::Debug),
    "trace" => Some(LevelFilter::Trace),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  pub fn parse_known_levels() {
    assert_eq!(parse_level_filter("DEBUG"), Some(LevelFilter::Debug));
    assert_eq!(parse_level_filter("warn"), Some(LevelFilter::Warn));
    assert_eq!(parse_level_filter("Off"), Some(LevelFilter::Off));
    assert_eq!(parse_level_filter(DEFAULT_LOG_LEVEL), Some(LevelFilter::Info));
  }

  #[test]
  pub fn parse_unknown_level() {
    assert_eq!(parse_level_filter("verbose"), None);
  }
}
