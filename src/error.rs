use crate::{pool::SourceKind, target::TargetId};
use std::{io, net::SocketAddr, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BalancerError {
  /// Neither a primary nor a backup target can take the request
  #[error("upstream '{0}' has no eligible target left, including backups")]
  PoolExhausted(String),

  #[error("no eligible targets to select from")]
  EmptyPool,

  #[error("membership source {origin} failed to refresh: {reason}")]
  StaleMembership { origin: SourceKind, reason: String },

  #[error("probe of {address} timed out after {timeout:?}")]
  ProbeTimeout { address: SocketAddr, timeout: Duration },

  #[error("probe of {address} failed: {reason}")]
  ProbeFailure { address: SocketAddr, reason: String },

  #[error("invalid configuration: {0}")]
  InvalidConfiguration(String),

  #[error("target {0} is not a member of the pool")]
  UnknownTarget(TargetId),

  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

impl BalancerError {
  pub fn invalid<S: Into<String>>(message: S) -> BalancerError {
    BalancerError::InvalidConfiguration(message.into())
  }
}
