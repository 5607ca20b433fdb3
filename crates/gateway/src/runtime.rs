//! Lifecycle shell of a gateway process: setup / run-forever / cancel /
//! teardown, signal wiring, and the readiness + metrics endpoint.

use crate::channel::Connector;
use crate::{GatewayConfig, GatewayStreamer, GrpcConnector};
use proto_gateway::health::ServingStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The runtime lifecycle contract. Phases run strictly in order:
/// `setup`, then `run_forever` until `cancel`, then `teardown`.
#[async_trait::async_trait]
pub trait Runtime: Send {
    async fn setup(&mut self) -> anyhow::Result<()>;
    async fn run_forever(&mut self) -> anyhow::Result<()>;
    async fn cancel(&mut self);
    async fn teardown(&mut self) -> anyhow::Result<()>;
}

/// Owns a [`GatewayStreamer`] and drives it through the lifecycle: builds
/// it at setup (starting warmup in the background), parks until the cancel
/// event, and closes it at teardown.
pub struct GatewayRuntime {
    config: GatewayConfig,
    registry: prometheus::Registry,
    streamer: Option<Arc<GatewayStreamer>>,
    cancel: CancellationToken,
    ready: Arc<AtomicBool>,
    warmup_stop: CancellationToken,
    warmup_task: Option<tokio::task::JoinHandle<()>>,
}

impl GatewayRuntime {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            registry: prometheus::Registry::new(),
            streamer: None,
            cancel: CancellationToken::new(),
            ready: Arc::new(AtomicBool::new(false)),
            warmup_stop: CancellationToken::new(),
            warmup_task: None,
        }
    }

    pub fn streamer(&self) -> Option<Arc<GatewayStreamer>> {
        self.streamer.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn readiness(&self) -> ServingStatus {
        if self.ready.load(Ordering::SeqCst) {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        }
    }

    /// HTTP router serving the readiness probe and prometheus metrics.
    pub fn router(&self) -> axum::Router {
        use axum::http::StatusCode;
        use axum::routing::get;

        let ready = self.ready.clone();
        let registry = self.registry.clone();

        axum::Router::new()
            .route(
                "/healthz",
                get(move || async move {
                    if ready.load(Ordering::SeqCst) {
                        (StatusCode::OK, ServingStatus::Serving.as_str_name())
                    } else {
                        (
                            StatusCode::SERVICE_UNAVAILABLE,
                            ServingStatus::NotServing.as_str_name(),
                        )
                    }
                }),
            )
            .route(
                "/metrics",
                get(move || async move {
                    match prometheus::TextEncoder::new().encode_to_string(&registry.gather()) {
                        Ok(text) => (StatusCode::OK, text),
                        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
                    }
                }),
            )
    }

    /// Run the whole lifecycle, cancelling on SIGINT / SIGTERM.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.setup().await?;
        register_signal_handlers(self.cancel.clone())?;
        self.run_forever().await?;
        self.teardown().await
    }
}

#[async_trait::async_trait]
impl Runtime for GatewayRuntime {
    async fn setup(&mut self) -> anyhow::Result<()> {
        let connector = Arc::new(GrpcConnector::new(self.config.compression));
        let streamer = Arc::new(GatewayStreamer::with_connector(
            self.config.clone(),
            connector,
            Some(&self.registry),
        )?);

        let warmup_streamer = streamer.clone();
        let warmup_stop = self.warmup_stop.clone();
        self.warmup_task = Some(tokio::spawn(async move {
            warmup_streamer.warmup(&warmup_stop).await;
        }));

        self.streamer = Some(streamer);
        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(runtime = %self.config.runtime_name, "gateway is serving");
        Ok(())
    }

    async fn run_forever(&mut self) -> anyhow::Result<()> {
        self.cancel.cancelled().await;
        Ok(())
    }

    async fn cancel(&mut self) {
        self.cancel.cancel();
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        self.ready.store(false, Ordering::SeqCst);

        self.warmup_stop.cancel();
        if let Some(task) = self.warmup_task.take() {
            if !task.is_finished() {
                tracing::debug!("cancelling warmup task");
                task.abort();
            }
            let _ = task.await;
        }

        if let Some(streamer) = &self.streamer {
            streamer.close().await;
        }
        tracing::info!(runtime = %self.config.runtime_name, "gateway shut down");
        Ok(())
    }
}

/// Wire SIGINT / SIGTERM to `cancel`.
pub fn register_signal_handlers(cancel: CancellationToken) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
            let mut stream = signal(kind)?;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                stream.recv().await;
                tracing::debug!(signal = ?kind, "received shutdown signal");
                cancel.cancel();
            });
        }
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }
    Ok(())
}

/// Probe an executor address through the standard health-check RPC.
pub async fn is_ready(address: &str, timeout: Duration) -> bool {
    let connector = GrpcConnector::new(None);
    match connector.connect(address).await {
        Ok(channel) => matches!(channel.health(timeout).await, Ok(ServingStatus::Serving)),
        Err(_) => false,
    }
}

/// Poll `address` for readiness every 100ms until it serves, `timeout`
/// elapses, or `shutdown` fires. True unless the deadline was reached.
pub async fn wait_for_ready_or_shutdown(
    address: &str,
    timeout: Option<Duration>,
    shutdown: &CancellationToken,
) -> bool {
    let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
    loop {
        if shutdown.is_cancelled() {
            return true;
        }
        if is_ready(address, crate::pool::HEALTH_CHECK_TIMEOUT).await {
            return true;
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return true,
            _ = tokio::time::sleep(Duration::from_millis(100)) => (),
        }
    }
}
