use crate::{
  balancer::LoadBalancer,
  error::BalancerError,
  health::Transition,
  target::{Role, Target, TargetId},
};
use async_trait::async_trait;
use hyper::{client::HttpConnector, http::uri, Body, Client, Uri};
use hyper_timeout::TimeoutConnector;
use log::{debug, info};
use serde::Deserialize;
use std::{collections::HashMap, fmt, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpStream, task::JoinHandle, time::Instant};

/// A lightweight synthetic check of one address
#[async_trait]
pub trait Prober: fmt::Debug + Send + Sync {
  async fn probe(&self, address: SocketAddr) -> Result<(), BalancerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum ProbeKind {
  Tcp,
  Http { path: String },
}

impl ProbeKind {
  pub fn prober(&self, timeout: Duration) -> Arc<dyn Prober> {
    match self {
      ProbeKind::Tcp => Arc::new(TcpProber),
      ProbeKind::Http { path } => Arc::new(HttpProber::new(path.clone(), timeout)),
    }
  }
}

/// Healthy if a TCP connection can be established
#[derive(Debug)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
  async fn probe(&self, address: SocketAddr) -> Result<(), BalancerError> {
    TcpStream::connect(address)
      .await
      .map(|_| ())
      .map_err(|e| BalancerError::ProbeFailure {
        address,
        reason: e.to_string(),
      })
  }
}

/// Healthy if a GET on `path` answers with a 2xx status
pub struct HttpProber {
  path: String,
  client: Client<TimeoutConnector<HttpConnector>, Body>,
}

impl fmt::Debug for HttpProber {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HttpProber").field("path", &self.path).finish()
  }
}

impl HttpProber {
  pub fn new(path: String, timeout: Duration) -> HttpProber {
    let http_connector = HttpConnector::new();
    let mut connector = TimeoutConnector::new(http_connector);
    connector.set_connect_timeout(Some(timeout));
    connector.set_read_timeout(Some(timeout));
    connector.set_write_timeout(Some(timeout));
    let client = Client::builder().build::<_, Body>(connector);
    HttpProber { path, client }
  }

  fn uri(&self, address: SocketAddr) -> Result<Uri, BalancerError> {
    uri::Uri::builder()
      .scheme("http")
      .authority(address.to_string().as_str())
      .path_and_query(self.path.as_str())
      .build()
      .map_err(|e| BalancerError::invalid(format!("invalid probe uri for {}: {}", address, e)))
  }
}

#[async_trait]
impl Prober for HttpProber {
  async fn probe(&self, address: SocketAddr) -> Result<(), BalancerError> {
    let uri = self.uri(address)?;
    match self.client.get(uri).await {
      Ok(response) if response.status().is_success() => Ok(()),
      Ok(response) => Err(BalancerError::ProbeFailure {
        address,
        reason: format!("status {}", response.status()),
      }),
      Err(e) => Err(BalancerError::ProbeFailure {
        address,
        reason: e.to_string(),
      }),
    }
  }
}

/// Runs one probe, abandoning it after `timeout`
pub async fn probe_once(prober: &dyn Prober, address: SocketAddr, timeout: Duration) -> Result<(), BalancerError> {
  match tokio::time::timeout(timeout, prober.probe(address)).await {
    Ok(result) => result,
    Err(_) => Err(BalancerError::ProbeTimeout { address, timeout }),
  }
}

/// Keeps exactly one probe task per probed target of an upstream.
///
/// Tasks are reconciled whenever the pool publishes a new version: removed or re-added targets lose their
/// old task, down targets aren't probed at all.
#[derive(Debug)]
pub struct ActiveHealthChecker {
  balancer: Arc<LoadBalancer>,
  prober: Arc<dyn Prober>,
  interval: Duration,
  timeout: Duration,
}

impl ActiveHealthChecker {
  pub fn new(
    balancer: Arc<LoadBalancer>,
    prober: Arc<dyn Prober>,
    interval: Duration,
    timeout: Duration,
  ) -> ActiveHealthChecker {
    ActiveHealthChecker {
      balancer,
      prober,
      interval,
      timeout,
    }
  }

  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(self.supervise())
  }

  async fn supervise(self) {
    let mut versions = self.balancer.pool().subscribe();
    // dropped together with this future, also when the supervisor task is aborted
    let mut tasks = ProbeTasks::default();
    info!(
      "upstream {}: probing targets every {:?}",
      self.balancer.name(),
      self.interval
    );

    loop {
      self.reconcile(&mut tasks);
      if versions.changed().await.is_err() {
        break;
      }
    }
  }

  fn reconcile(&self, tasks: &mut ProbeTasks) {
    let snapshot = self.balancer.pool().current_snapshot();
    let wanted: HashMap<&TargetId, &Arc<Target>> = snapshot
      .targets()
      .iter()
      .filter(|target| target.role() != Role::Down)
      .map(|target| (target.id(), target))
      .collect();

    tasks.0.retain(|id, (probed, task)| {
      let keep = wanted
        .get(id)
        .map(|target| target.same_instance(probed) && target.address() == probed.address())
        .unwrap_or(false);
      if !keep {
        task.abort();
      }
      keep
    });

    for (id, target) in wanted {
      if !tasks.0.contains_key(id) {
        let task = tokio::spawn(probe_loop(
          self.balancer.clone(),
          self.prober.clone(),
          (*target).clone(),
          self.interval,
          self.timeout,
        ));
        tasks.0.insert(id.clone(), ((*target).clone(), task));
      }
    }
  }
}

/// The running per-target loops. Aborts all of them when dropped.
#[derive(Debug, Default)]
struct ProbeTasks(HashMap<TargetId, (Arc<Target>, JoinHandle<()>)>);

impl Drop for ProbeTasks {
  fn drop(&mut self) {
    for (_, (_, task)) in self.0.drain() {
      task.abort();
    }
  }
}

async fn probe_loop(
  balancer: Arc<LoadBalancer>,
  prober: Arc<dyn Prober>,
  target: Arc<Target>,
  interval: Duration,
  timeout: Duration,
) {
  let mut timer = tokio::time::interval(interval);
  loop {
    timer.tick().await;
    let started = Instant::now();
    let result = probe_once(prober.as_ref(), target.address(), timeout).await;

    if let Err(e) = &result {
      debug!("upstream {}: {}", balancer.name(), e);
    }
    let transition = balancer.record_probe(&target, result.is_ok(), started);
    if transition == Transition::Recovered {
      debug!(
        "upstream {}: probe brought {} back",
        balancer.name(),
        target.id()
      );
    }
  }
}
