use crate::channel::{Connector, GrpcConnector, Metadata};
use crate::graph::Topology;
use crate::handler::RequestHandler;
use crate::metrics::NodeMetrics;
use crate::pool::{ConnectionPool, Role};
use crate::streamer::{FloatingTasks, RequestStreamer};
use crate::{Error, GatewayConfig, Result};
use futures::{Stream, StreamExt};
use proto_gateway::data::{AttrValue, DataRequest, DataResponse, Doc, RequestHeader};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Options of the document-streaming entry points.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// How many documents go into a single request.
    pub request_size: usize,
    /// Executor endpoint to which documents are sent, like "/index".
    pub exec_endpoint: Option<String>,
    /// Regex selecting the deployments which should process the request.
    pub target_executor: Option<String>,
    /// Parameters attached to every request.
    pub parameters: HashMap<String, AttrValue>,
    /// Yield responses in request order rather than completion order.
    pub results_in_order: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            request_size: 100,
            exec_endpoint: None,
            target_executor: None,
            parameters: HashMap::new(),
            results_in_order: false,
        }
    }
}

/// An executor-reported error, unpacked from response status.
#[derive(Clone, Debug)]
pub struct ExecutorError {
    pub name: String,
    pub args: Vec<String>,
    pub stacks: Vec<String>,
    pub executor: String,
}

impl ExecutorError {
    pub fn from_response(response: &DataResponse) -> Option<Self> {
        if !response.is_error() {
            return None;
        }
        Some(match response.exception() {
            Some(exception) => Self {
                name: exception.name.clone(),
                args: exception.args.clone(),
                stacks: exception.stacks.clone(),
                executor: exception.executor.clone(),
            },
            None => Self {
                name: "ExecutorError".to_string(),
                args: Vec::new(),
                stacks: Vec::new(),
                executor: String::new(),
            },
        })
    }
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.args.is_empty() {
            write!(f, ": {}", self.args.join(", "))?;
        }
        if !self.executor.is_empty() {
            write!(f, " (raised by '{}')", self.executor)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecutorError {}

/// The gateway entry point: binds the connection pool, topology, and
/// request streamer, and exposes the batch / stream / unary calls.
pub struct GatewayStreamer {
    config: GatewayConfig,
    pool: Arc<ConnectionPool>,
    graph: Arc<Topology>,
    streamer: RequestStreamer,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl GatewayStreamer {
    /// Build a gateway over tonic gRPC channels.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let connector = Arc::new(GrpcConnector::new(config.compression));
        Self::with_connector(config, connector, None)
    }

    /// Build a gateway over an arbitrary [`Connector`], optionally
    /// registering per-deployment metrics.
    pub fn with_connector(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        registry: Option<&prometheus::Registry>,
    ) -> Result<Self> {
        let graph = Arc::new(Topology::build(&config)?);
        for name in graph.deployments() {
            if !config.executor_addresses.contains_key(name) {
                return Err(Error::Config(format!(
                    "no executor addresses for deployment '{name}'"
                )));
            }
        }

        let pool = Arc::new(ConnectionPool::new(
            connector,
            config.retries,
            config.timeout_send,
        ));
        for (deployment, addresses) in &config.executor_addresses {
            if !config.graph.contains_key(deployment)
                && !config.graph.values().flatten().any(|n| n == deployment)
            {
                tracing::warn!(%deployment, "addresses given for a deployment not in the graph");
                continue;
            }
            for address in addresses.iter() {
                pool.add_connection(deployment, address, Role::Head);
            }
        }

        let metrics = match registry {
            Some(registry) => Some(Arc::new(
                NodeMetrics::register(registry, &config.runtime_name)
                    .map_err(|err| Error::Config(err.to_string()))?,
            )),
            None => None,
        };

        let floating = Arc::new(FloatingTasks::default());
        let cancel = CancellationToken::new();
        let handler = Arc::new(RequestHandler::new(
            graph.clone(),
            pool.clone(),
            floating.clone(),
            metrics,
        ));
        let streamer = RequestStreamer::new(handler, config.prefetch, floating, cancel.clone());

        Ok(Self {
            config,
            pool,
            graph,
            streamer,
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    /// Rebuild a streamer from the [`crate::ENV_STREAMER_ARGS`]
    /// environment handoff of a parent process.
    pub fn from_env() -> Result<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    /// Publish this gateway's configuration for child processes.
    pub fn publish_env_args(&self) -> Result<()> {
        self.config.to_env()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Cancellation token observed by every stream of this gateway.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stream pre-built requests and stream responses back.
    pub fn rpc_stream(
        &self,
        requests: impl Stream<Item = DataRequest> + Send + 'static,
        results_in_order: bool,
    ) -> impl Stream<Item = DataResponse> + Send + 'static {
        self.streamer.stream(requests, results_in_order)
    }

    /// RPC-framework compatible alias of [`GatewayStreamer::rpc_stream`]:
    /// both names drive the very same pipeline.
    pub fn call(
        &self,
        requests: impl Stream<Item = DataRequest> + Send + 'static,
        results_in_order: bool,
    ) -> impl Stream<Item = DataResponse> + Send + 'static {
        self.rpc_stream(requests, results_in_order)
    }

    /// Chunk `docs` into requests of `request_size` and yield the full
    /// response of each.
    pub fn stream_responses(
        &self,
        docs: Vec<Doc>,
        options: StreamOptions,
    ) -> Result<impl Stream<Item = DataResponse> + Send + 'static> {
        let requests = batch_requests(
            docs,
            options.request_size,
            options.exec_endpoint.clone(),
            options.target_executor.clone(),
            options.parameters.clone(),
        )?;
        Ok(self.rpc_stream(futures::stream::iter(requests), options.results_in_order))
    }

    /// Chunk `docs` into requests and yield the documents of each response.
    pub fn stream_docs(
        &self,
        docs: Vec<Doc>,
        options: StreamOptions,
    ) -> Result<impl Stream<Item = Vec<Doc>> + Send + 'static> {
        Ok(self
            .stream_responses(docs, options)?
            .map(|mut response| std::mem::take(&mut response.docs)))
    }

    /// Like [`GatewayStreamer::stream_responses`], with any executor error
    /// unpacked alongside each response.
    pub fn stream(
        &self,
        docs: Vec<Doc>,
        options: StreamOptions,
    ) -> Result<impl Stream<Item = (DataResponse, Option<ExecutorError>)> + Send + 'static> {
        Ok(self.stream_responses(docs, options)?.map(|response| {
            let error = ExecutorError::from_response(&response);
            (response, error)
        }))
    }

    /// Unary entry point: one request in, one response out.
    pub async fn process_single_data(&self, request: DataRequest) -> DataResponse {
        self.streamer.process_single_data(request).await
    }

    /// A client handle bound to a single deployment of the topology.
    pub fn executor_client(&self, executor: &str) -> Result<ExecutorClient> {
        if !self.graph.deployments().any(|name| name == executor) {
            return Err(Error::UnknownDeployment(executor.to_string()));
        }
        Ok(ExecutorClient {
            pool: self.pool.clone(),
            executor: executor.to_string(),
        })
    }

    /// Pre-establish channels to every deployment, until healthy, `stop`
    /// fires, or the warmup budget elapses. Failures are logged, never
    /// surfaced.
    pub async fn warmup(&self, stop: &CancellationToken) {
        tracing::debug!("running gateway warmup");
        let pool = &self.pool;
        let warmups = pool
            .deployments()
            .into_iter()
            .map(|deployment| async move { pool.warmup(&deployment, stop).await });
        futures::future::join_all(warmups).await;
    }

    /// Await completion of floating dispatches, then close the pool.
    /// Idempotent: a second call is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.streamer.wait_floating_requests_end().await;
        self.pool.close().await;
    }

    /// Hard shutdown: cancel in-flight work and abort floating dispatches
    /// instead of awaiting them.
    pub async fn abort(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.streamer.floating().abort_all();
        self.pool.close().await;
    }
}

/// Per-deployment convenience client, in the style of an executor-side
/// streamer: batches documents to one deployment and concatenates the
/// returned documents.
pub struct ExecutorClient {
    pool: Arc<ConnectionPool>,
    executor: String,
}

impl ExecutorClient {
    pub fn name(&self) -> &str {
        &self.executor
    }

    /// Send `docs` to this deployment in batches of `request_size`,
    /// concurrently, and return the concatenated response documents.
    /// Batches failing with an executor error are logged and skipped;
    /// pool-level errors surface.
    pub async fn post(
        &self,
        docs: Vec<Doc>,
        request_size: usize,
        endpoint: Option<&str>,
        parameters: HashMap<String, AttrValue>,
    ) -> Result<Vec<Doc>> {
        let requests = batch_requests(
            docs,
            request_size,
            endpoint.map(str::to_string),
            Some(self.executor.clone()),
            parameters,
        )?;
        let metadata = Metadata::new();

        let calls = requests.into_iter().map(|request| {
            self.pool.send_requests_once(
                vec![request],
                &self.executor,
                Role::Head,
                endpoint,
                &metadata,
            )
        });

        let mut merged = Vec::new();
        for result in futures::future::join_all(calls).await {
            match result {
                Ok((response, _)) if !response.is_error() => merged.extend(response.docs),
                Ok((response, _)) => tracing::warn!(
                    executor = %self.executor,
                    exception = ?response.exception(),
                    "executor call returned an error",
                ),
                Err(err) => return Err(err),
            }
        }
        Ok(merged)
    }
}

// Chunk `docs` into per-batch requests. The last batch may be smaller;
// empty input builds no requests at all.
fn batch_requests(
    mut docs: Vec<Doc>,
    request_size: usize,
    exec_endpoint: Option<String>,
    target_executor: Option<String>,
    parameters: HashMap<String, AttrValue>,
) -> Result<Vec<DataRequest>> {
    if request_size == 0 {
        return Err(Error::Config(
            "request_size must be greater than zero".to_string(),
        ));
    }

    let mut requests = Vec::with_capacity(docs.len().div_ceil(request_size));
    while !docs.is_empty() {
        let tail = docs.split_off(docs.len().min(request_size));
        let batch = std::mem::replace(&mut docs, tail);
        requests.push(DataRequest {
            header: Some(RequestHeader {
                request_id: uuid::Uuid::new_v4().to_string(),
                exec_endpoint: exec_endpoint.clone(),
                target_executor: target_executor.clone(),
            }),
            parameters: parameters.clone(),
            docs: batch,
        });
    }
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batching_chunks_docs_in_order() {
        let docs: Vec<Doc> = (0..5).map(|i| Doc::new(format!("d{i}"))).collect();
        let requests = batch_requests(docs, 2, None, None, HashMap::new()).unwrap();

        let sizes: Vec<usize> = requests.iter().map(|r| r.docs.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(requests[2].docs[0].id, "d4");

        // Every request carries a distinct id.
        let mut ids: Vec<&str> = requests
            .iter()
            .map(|r| r.header.as_ref().unwrap().request_id.as_str())
            .collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn zero_request_size_is_a_config_error() {
        let err = batch_requests(vec![Doc::new("d1")], 0, None, None, HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_docs_build_no_requests() {
        let requests = batch_requests(Vec::new(), 3, None, None, HashMap::new()).unwrap();
        assert!(requests.is_empty());
    }
}
