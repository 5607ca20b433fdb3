use crate::channel::{Connector, ExecutorChannel, Metadata};
use crate::{Error, Result};
use proto_gateway::data::{DataRequest, DataResponse, Exception, RequestHeader};
use proto_gateway::health::ServingStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default bound on a single health-check RPC.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Hard cap on a whole-deployment warmup.
const WARMUP_BUDGET: Duration = Duration::from_secs(600);
const WARMUP_BACKOFF_MIN: Duration = Duration::from_millis(100);
const WARMUP_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Which replica tier of a deployment a connection addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Head,
    Worker,
}

// A channel which may be ready (if Some), currently being dialed (if
// locked), or neither. Replicas re-dial on demand after a send failure.
type DialState = Arc<futures::lock::Mutex<Option<Arc<dyn ExecutorChannel>>>>;

struct Replica {
    address: String,
    role: Role,
    channel: DialState,
    healthy: AtomicBool,
}

struct Deployment {
    name: String,
    replicas: std::sync::Mutex<Vec<Arc<Replica>>>,
    // Monotonic round-robin pick counter.
    counter: AtomicUsize,
}

/// Health-aware pool of channels to executor replicas, grouped by
/// deployment, with round-robin balancing and bounded retries.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    deployments: std::sync::Mutex<HashMap<String, Arc<Deployment>>>,
    retries: u32,
    timeout_send: Option<Duration>,
    closing: CancellationToken,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        retries: u32,
        timeout_send: Option<Duration>,
    ) -> Self {
        Self {
            connector,
            deployments: Default::default(),
            retries,
            timeout_send,
            closing: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a replica of `deployment`. Idempotent: re-adding an address
    /// reuses its existing channel.
    pub fn add_connection(&self, deployment: &str, address: &str, role: Role) {
        let mut deployments = self.deployments.lock().unwrap();
        let entry = deployments
            .entry(deployment.to_string())
            .or_insert_with(|| {
                Arc::new(Deployment {
                    name: deployment.to_string(),
                    replicas: Default::default(),
                    counter: AtomicUsize::new(0),
                })
            });

        let mut replicas = entry.replicas.lock().unwrap();
        if replicas.iter().any(|r| r.address == address && r.role == role) {
            return;
        }
        tracing::debug!(deployment, address, ?role, "adding pool connection");
        replicas.push(Arc::new(Replica {
            address: address.to_string(),
            role,
            channel: Default::default(),
            healthy: AtomicBool::new(true),
        }));
    }

    /// Names of all registered deployments.
    pub fn deployments(&self) -> Vec<String> {
        self.deployments.lock().unwrap().keys().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one logical call to one replica of `deployment`.
    ///
    /// Transport failures are retried up to the configured `retries`, each
    /// attempt advancing to the next replica of the ring. When attempts are
    /// exhausted the terminal transport error is returned as data: an ERROR
    /// response whose exception wraps the error. Executor-reported errors
    /// (`status = ERROR` inside an otherwise successful call) pass through
    /// without retry.
    pub async fn send_requests_once(
        &self,
        mut requests: Vec<DataRequest>,
        deployment: &str,
        role: Role,
        endpoint: Option<&str>,
        metadata: &Metadata,
    ) -> Result<(DataResponse, Metadata)> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        let state = self
            .deployments
            .lock()
            .unwrap()
            .get(deployment)
            .cloned()
            .ok_or_else(|| Error::UnknownDeployment(deployment.to_string()))?;

        if let Some(endpoint) = endpoint {
            for request in &mut requests {
                request
                    .header
                    .get_or_insert_with(RequestHeader::default)
                    .exec_endpoint = Some(endpoint.to_string());
            }
        }
        let header = requests.first().and_then(|r| r.header.clone());

        let ring: Vec<Arc<Replica>> = state
            .replicas
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.role == role)
            .cloned()
            .collect();
        if ring.is_empty() {
            return Err(Error::UnknownDeployment(deployment.to_string()));
        }

        let base = state.counter.fetch_add(1, Ordering::Relaxed);
        let order = attempt_order(&ring, base);

        let mut last_err = None;
        for attempt in 0..=self.retries {
            let replica = &order[attempt as usize % order.len()];

            let outcome = tokio::select! {
                _ = self.closing.cancelled() => return Err(Error::Cancelled),
                outcome = self.try_send(replica, &requests, metadata) => outcome,
            };
            match outcome {
                Ok(ok) => {
                    replica.healthy.store(true, Ordering::Relaxed);
                    return Ok(ok);
                }
                Err(err) => {
                    tracing::warn!(
                        deployment = %state.name,
                        address = %replica.address,
                        attempt,
                        error = %err,
                        "executor send failed",
                    );
                    replica.healthy.store(false, Ordering::Relaxed);
                    *replica.channel.lock().await = None;
                    last_err = Some(err);
                }
            }
        }

        let err = last_err.expect("at least one attempt was made");
        let exception = Exception {
            name: err.exception_name().to_string(),
            args: vec![err.to_string()],
            stacks: Vec::new(),
            executor: state.name.clone(),
        };
        Ok((
            DataResponse::from_exception(header, exception),
            Metadata::new(),
        ))
    }

    async fn try_send(
        &self,
        replica: &Replica,
        requests: &[DataRequest],
        metadata: &Metadata,
    ) -> Result<(DataResponse, Metadata)> {
        let channel = self.dial(replica).await?;
        let call = channel.process(requests.to_vec(), metadata);
        match self.timeout_send {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| Error::Timeout(timeout))?,
            None => call.await,
        }
    }

    // Fast path: the replica channel is dialed and ready. Slow path: dial
    // it, holding the replica's async lock so concurrent senders share one
    // dial attempt.
    async fn dial(&self, replica: &Replica) -> Result<Arc<dyn ExecutorChannel>> {
        let mut state = replica.channel.lock().await;
        if let Some(channel) = &*state {
            return Ok(channel.clone());
        }
        let channel = self.connector.connect(&replica.address).await?;
        *state = Some(channel.clone());
        Ok(channel)
    }

    /// Open a channel to every replica of `deployment` and drive a health
    /// check through it, retrying with exponential backoff until all
    /// replicas respond SERVING, `stop` fires, or the warmup budget
    /// elapses. Always returns cleanly.
    pub async fn warmup(&self, deployment: &str, stop: &CancellationToken) {
        let _ = tokio::time::timeout(WARMUP_BUDGET, self.warmup_loop(deployment, stop)).await;
    }

    async fn warmup_loop(&self, deployment: &str, stop: &CancellationToken) {
        let backoff = exponential_backoff::Backoff::new(
            u32::MAX,
            WARMUP_BACKOFF_MIN,
            Some(WARMUP_BACKOFF_MAX),
        );
        let mut attempt = 0u32;

        loop {
            if stop.is_cancelled() || self.is_closed() {
                return;
            }
            match self.probe_deployment(deployment).await {
                Ok(true) => {
                    tracing::debug!(deployment, "warmup complete");
                    return;
                }
                Ok(false) => (),
                Err(err) => {
                    tracing::debug!(deployment, error = %err, "warmup probe failed");
                }
            }

            attempt += 1;
            let Some(delay) = backoff.next(attempt) else {
                return;
            };
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => (),
            }
        }
    }

    // Probe every replica of `deployment` concurrently. True if all serve.
    async fn probe_deployment(&self, deployment: &str) -> Result<bool> {
        let state = self
            .deployments
            .lock()
            .unwrap()
            .get(deployment)
            .cloned()
            .ok_or_else(|| Error::UnknownDeployment(deployment.to_string()))?;
        let replicas: Vec<Arc<Replica>> = state.replicas.lock().unwrap().clone();

        let probes = replicas.iter().map(|replica| async move {
            let channel = self.dial(replica).await?;
            let status = channel.health(HEALTH_CHECK_TIMEOUT).await?;
            Ok::<_, Error>((replica, status))
        });

        let mut all_serving = true;
        for result in futures::future::join_all(probes).await {
            match result {
                Ok((replica, ServingStatus::Serving)) => {
                    replica.healthy.store(true, Ordering::Relaxed);
                }
                Ok((replica, status)) => {
                    tracing::debug!(
                        deployment,
                        address = %replica.address,
                        status = status.as_str_name(),
                        "replica is not serving",
                    );
                    all_serving = false;
                }
                Err(_) => all_serving = false,
            }
        }
        Ok(all_serving)
    }

    /// Close the pool: pending sends are cancelled, channels are dropped,
    /// and later sends fail with [`Error::PoolClosed`]. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.cancel();
        self.deployments.lock().unwrap().clear();
        tracing::debug!("connection pool closed");
    }
}

// Replica attempt order for one send: walk the full ring starting at the
// scheduled slot, keeping healthy replicas. The scheduled replica itself is
// kept even when unhealthy, giving it a half-open re-check trial when its
// turn comes around.
fn attempt_order(ring: &[Arc<Replica>], base: usize) -> Vec<Arc<Replica>> {
    let mut order = Vec::with_capacity(ring.len());
    for k in 0..ring.len() {
        let replica = &ring[(base + k) % ring.len()];
        if k == 0 || replica.healthy.load(Ordering::Relaxed) {
            order.push(replica.clone());
        }
    }
    order
}
