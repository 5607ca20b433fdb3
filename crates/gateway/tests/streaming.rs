//! End-to-end scenarios over an in-process mock network: the gateway is
//! real, only the executor channels are faked.

use futures::future::BoxFuture;
use futures::StreamExt;
use gateway::{
    Connector, Error, ExecutorChannel, GatewayConfig, GatewayStreamer, Metadata, StreamOptions,
};
use proto_gateway::data::{AttrValue, DataRequest, DataResponse, Doc, Exception, RequestHeader};
use proto_gateway::health::ServingStatus;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Behavior =
    Arc<dyn Fn(Vec<DataRequest>) -> BoxFuture<'static, gateway::Result<DataResponse>> + Send + Sync>;

/// Fake executor network: behaviors are keyed by replica address, and all
/// traffic is recorded.
#[derive(Clone, Default)]
struct MockNet {
    inner: Arc<MockNetInner>,
}

#[derive(Default)]
struct MockNetInner {
    behaviors: Mutex<HashMap<String, Behavior>>,
    unserving: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockNet {
    fn set(&self, address: &str, behavior: Behavior) {
        self.inner
            .behaviors
            .lock()
            .unwrap()
            .insert(address.to_string(), behavior);
    }

    /// Echo, tagging every returned doc with an attribute.
    fn tag(&self, address: &str, key: &'static str, value: &'static str) {
        self.set(
            address,
            Arc::new(move |requests| {
                Box::pin(async move {
                    let mut response = echo_response(requests);
                    for doc in &mut response.docs {
                        doc.attributes.insert(key.to_string(), AttrValue::text(value));
                    }
                    Ok(response)
                })
            }),
        );
    }

    /// Fail at the transport level.
    fn fail(&self, address: &str) {
        self.set(
            address,
            Arc::new(|_requests| {
                Box::pin(async {
                    Err(Error::Grpc(tonic::Status::unavailable("connection refused")))
                })
            }),
        );
    }

    /// Succeed at the transport level with an executor-reported error.
    fn logical_error(&self, address: &str, name: &'static str) {
        let executor = address.trim_start_matches("mock://").to_string();
        self.set(
            address,
            Arc::new(move |requests| {
                let executor = executor.clone();
                Box::pin(async move {
                    let header = requests.first().and_then(|r| r.header.clone());
                    Ok(DataResponse::from_exception(
                        header,
                        Exception {
                            name: name.to_string(),
                            args: vec!["executor raised".to_string()],
                            stacks: Vec::new(),
                            executor,
                        },
                    ))
                })
            }),
        );
    }

    /// Echo after a fixed delay.
    fn sleepy(&self, address: &str, delay: Duration) {
        self.set(
            address,
            Arc::new(move |requests| {
                Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    Ok(echo_response(requests))
                })
            }),
        );
    }

    /// Echo after the per-request delay carried in parameters.
    fn delay_from_param(&self, address: &str) {
        self.set(
            address,
            Arc::new(|requests| {
                Box::pin(async move {
                    let delay = requests
                        .first()
                        .and_then(|r| r.parameters.get("delay_ms"))
                        .and_then(|v| v.as_number())
                        .unwrap_or(0.0);
                    tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                    Ok(echo_response(requests))
                })
            }),
        );
    }

    fn set_unserving(&self, address: &str) {
        self.inner
            .unserving
            .lock()
            .unwrap()
            .insert(address.to_string());
    }

    fn attempts(&self) -> Vec<String> {
        self.inner.attempts.lock().unwrap().clone()
    }

    fn attempts_to(&self, address: &str) -> usize {
        self.attempts().iter().filter(|a| *a == address).count()
    }

    fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for MockNet {
    async fn connect(&self, address: &str) -> gateway::Result<Arc<dyn ExecutorChannel>> {
        Ok(Arc::new(MockChannel {
            address: address.to_string(),
            net: self.inner.clone(),
        }))
    }
}

struct MockChannel {
    address: String,
    net: Arc<MockNetInner>,
}

#[async_trait::async_trait]
impl ExecutorChannel for MockChannel {
    async fn process(
        &self,
        requests: Vec<DataRequest>,
        _metadata: &Metadata,
    ) -> gateway::Result<(DataResponse, Metadata)> {
        self.net.attempts.lock().unwrap().push(self.address.clone());
        let n = self.net.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.net.max_in_flight.fetch_max(n, Ordering::SeqCst);

        let behavior = self.net.behaviors.lock().unwrap().get(&self.address).cloned();
        let result = match behavior {
            Some(behavior) => behavior(requests).await,
            None => Ok(echo_response(requests)),
        };

        self.net.in_flight.fetch_sub(1, Ordering::SeqCst);
        result.map(|response| (response, Metadata::new()))
    }

    async fn health(&self, _timeout: Duration) -> gateway::Result<ServingStatus> {
        if self.net.unserving.lock().unwrap().contains(&self.address) {
            Ok(ServingStatus::NotServing)
        } else {
            Ok(ServingStatus::Serving)
        }
    }
}

fn echo_response(requests: Vec<DataRequest>) -> DataResponse {
    let header = requests.first().and_then(|r| r.header.clone());
    let docs = requests.into_iter().flat_map(|r| r.docs).collect();
    DataResponse::ok(header, docs)
}

fn config(graph: serde_json::Value, addresses: serde_json::Value) -> GatewayConfig {
    GatewayConfig {
        graph: serde_json::from_value(graph).unwrap(),
        executor_addresses: serde_json::from_value(addresses).unwrap(),
        ..Default::default()
    }
}

fn gateway(net: &MockNet, config: GatewayConfig) -> GatewayStreamer {
    GatewayStreamer::with_connector(config, Arc::new(net.clone()), None).unwrap()
}

fn docs(n: usize) -> Vec<Doc> {
    (1..=n).map(|i| Doc::new(format!("d{i}"))).collect()
}

fn ids(docs: &[Doc]) -> Vec<&str> {
    docs.iter().map(|d| d.id.as_str()).collect()
}

#[tokio::test]
async fn linear_topology_happy_path() {
    let net = MockNet::default();
    let gw = gateway(
        &net,
        config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a1"})),
    );

    let responses: Vec<DataResponse> = gw
        .stream_responses(
            docs(3),
            StreamOptions {
                request_size: 2,
                results_in_order: true,
                ..Default::default()
            },
        )
        .unwrap()
        .collect()
        .await;

    assert_eq!(responses.len(), 2);
    assert!(!responses[0].is_error());
    assert!(!responses[1].is_error());
    assert_eq!(ids(&responses[0].docs), vec!["d1", "d2"]);
    assert_eq!(ids(&responses[1].docs), vec!["d3"]);
}

#[tokio::test]
async fn fan_out_fan_in_merges_by_id() {
    let net = MockNet::default();
    net.tag("mock://a", "src", "a");
    net.tag("mock://b", "src", "b");

    let gw = gateway(
        &net,
        config(
            json!({"start": ["a", "b"], "a": ["c"], "b": ["c"], "c": ["end"]}),
            json!({"a": "mock://a", "b": "mock://b", "c": "mock://c"}),
        ),
    );

    let response = gw
        .process_single_data(DataRequest {
            docs: docs(1),
            ..Default::default()
        })
        .await;

    assert!(!response.is_error());
    assert_eq!(ids(&response.docs), vec!["d1"]);
    // The same id arrived over both branches: the later branch (by edge
    // insertion order) wins the conflicting tag.
    assert_eq!(response.docs[0].attributes["src"].as_text(), Some("b"));
}

#[tokio::test]
async fn executor_error_is_isolated_and_not_retried() {
    let net = MockNet::default();
    net.tag("mock://a", "src", "a");
    net.logical_error("mock://b", "Boom");

    let mut cfg = config(
        json!({"start": ["a", "b"], "a": ["end"], "b": ["end"]}),
        json!({"a": "mock://a", "b": "mock://b"}),
    );
    cfg.retries = 2;
    let gw = gateway(&net, cfg);

    let response = gw
        .process_single_data(DataRequest {
            docs: docs(1),
            ..Default::default()
        })
        .await;

    // The healthy branch's docs came through, with the error surfaced.
    assert_eq!(ids(&response.docs), vec!["d1"]);
    assert_eq!(response.docs[0].attributes["src"].as_text(), Some("a"));
    assert!(response.is_error());
    let exception = response.exception().unwrap();
    assert_eq!(exception.name, "Boom");
    assert_eq!(exception.executor, "b");
    // Logical errors are never retried.
    assert_eq!(net.attempts_to("mock://b"), 1);
}

#[tokio::test]
async fn transport_failure_retries_the_next_replica() {
    let net = MockNet::default();
    net.fail("mock://r1");
    net.fail("mock://r2");

    let mut cfg = config(
        json!({"start": ["a"], "a": ["end"]}),
        json!({"a": ["mock://r1", "mock://r2", "mock://r3"]}),
    );
    cfg.retries = 2;
    let gw = gateway(&net, cfg);

    let response = gw
        .process_single_data(DataRequest {
            docs: docs(1),
            ..Default::default()
        })
        .await;

    assert!(!response.is_error());
    assert_eq!(ids(&response.docs), vec!["d1"]);
    assert_eq!(net.attempts(), vec!["mock://r1", "mock://r2", "mock://r3"]);
}

#[tokio::test]
async fn exhausted_retries_surface_a_transport_error() {
    let net = MockNet::default();
    net.fail("mock://r1");
    net.fail("mock://r2");

    let mut cfg = config(
        json!({"start": ["a"], "a": ["end"]}),
        json!({"a": ["mock://r1", "mock://r2"]}),
    );
    cfg.retries = 2;
    let gw = gateway(&net, cfg);

    let response = gw
        .process_single_data(DataRequest {
            docs: docs(1),
            ..Default::default()
        })
        .await;

    assert!(response.is_error());
    assert_eq!(response.exception().unwrap().name, "TransportError");
    assert_eq!(response.exception().unwrap().executor, "a");
    // retries + 1 attempts in total, cycling over the two replicas.
    assert_eq!(net.attempts().len(), 3);
}

#[tokio::test]
async fn send_timeout_surfaces_as_timeout() {
    let net = MockNet::default();
    net.sleepy("mock://a1", Duration::from_millis(500));

    let mut cfg = config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a1"}));
    cfg.timeout_send = Some(Duration::from_millis(30));
    let gw = gateway(&net, cfg);

    let response = gw
        .process_single_data(DataRequest {
            docs: docs(1),
            ..Default::default()
        })
        .await;

    assert!(response.is_error());
    assert_eq!(response.exception().unwrap().name, "Timeout");
}

#[tokio::test]
async fn ordered_streaming_restores_input_order() {
    let net = MockNet::default();
    net.delay_from_param("mock://a1");

    let mut cfg = config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a1"}));
    cfg.prefetch = 4;
    let gw = gateway(&net, cfg);

    // Later requests complete sooner: completion order is scrambled.
    let requests: Vec<DataRequest> = (1..=10)
        .map(|i| DataRequest {
            header: Some(RequestHeader {
                request_id: format!("{i}"),
                ..Default::default()
            }),
            parameters: HashMap::from([(
                "delay_ms".to_string(),
                AttrValue::number(((10 - i) * 20) as f64),
            )]),
            docs: vec![Doc::new(format!("d{i}"))],
        })
        .collect();

    let responses: Vec<DataResponse> = gw
        .rpc_stream(futures::stream::iter(requests), true)
        .collect()
        .await;

    let order: Vec<String> = responses
        .iter()
        .map(|r| r.header.as_ref().unwrap().request_id.clone())
        .collect();
    let expected: Vec<String> = (1..=10).map(|i| format!("{i}")).collect();
    assert_eq!(order, expected);
}

#[tokio::test]
async fn unordered_streaming_yields_completion_order() {
    let net = MockNet::default();
    net.delay_from_param("mock://a1");

    let gw = gateway(
        &net,
        config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a1"})),
    );

    let requests: Vec<DataRequest> = (1..=5)
        .map(|i| DataRequest {
            header: Some(RequestHeader {
                request_id: format!("{i}"),
                ..Default::default()
            }),
            parameters: HashMap::from([(
                "delay_ms".to_string(),
                AttrValue::number(((5 - i) * 40) as f64),
            )]),
            docs: vec![Doc::new(format!("d{i}"))],
        })
        .collect();

    let responses: Vec<DataResponse> = gw
        .rpc_stream(futures::stream::iter(requests), false)
        .collect()
        .await;

    assert_eq!(responses.len(), 5);
    // Request 5 has zero delay and completes first.
    assert_eq!(responses[0].header.as_ref().unwrap().request_id, "5");
}

#[tokio::test]
async fn prefetch_bounds_in_flight_requests() {
    let net = MockNet::default();
    net.sleepy("mock://a1", Duration::from_millis(40));

    let mut cfg = config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a1"}));
    cfg.prefetch = 3;
    let gw = gateway(&net, cfg);

    let responses: Vec<DataResponse> = gw
        .stream_responses(
            docs(12),
            StreamOptions {
                request_size: 1,
                ..Default::default()
            },
        )
        .unwrap()
        .collect()
        .await;

    assert_eq!(responses.len(), 12);
    assert!(
        net.max_in_flight() <= 3,
        "in-flight exceeded prefetch: {}",
        net.max_in_flight()
    );
    assert!(net.max_in_flight() >= 2, "prefetch showed no concurrency");
}

#[tokio::test]
async fn zero_prefetch_is_unbounded() {
    let net = MockNet::default();
    net.sleepy("mock://a1", Duration::from_millis(40));

    let gw = gateway(
        &net,
        config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a1"})),
    );

    let responses: Vec<DataResponse> = gw
        .stream_responses(
            docs(8),
            StreamOptions {
                request_size: 1,
                ..Default::default()
            },
        )
        .unwrap()
        .collect()
        .await;

    assert_eq!(responses.len(), 8);
    assert!(net.max_in_flight() > 3, "expected unbounded concurrency");
}

#[tokio::test]
async fn zero_request_size_fails_at_call_time() {
    let net = MockNet::default();
    let gw = gateway(
        &net,
        config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a1"})),
    );

    let err = gw
        .stream_responses(
            docs(3),
            StreamOptions {
                request_size: 0,
                ..Default::default()
            },
        )
        .err()
        .unwrap();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn empty_docs_yield_no_responses() {
    let net = MockNet::default();
    let gw = gateway(
        &net,
        config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a1"})),
    );

    let responses: Vec<DataResponse> = gw
        .stream_responses(Vec::new(), StreamOptions::default())
        .unwrap()
        .collect()
        .await;
    assert!(responses.is_empty());
    assert!(net.attempts().is_empty());

    gw.close().await;
}

#[tokio::test]
async fn identity_round_trip_is_invariant_over_request_size() {
    let input: Vec<Doc> = (1..=6)
        .map(|i| {
            Doc::new(format!("d{i}"))
                .with_attr("rank", i as f64)
                .with_attr("lang", "en")
        })
        .collect();

    for request_size in [1, 3, 6, 7] {
        let net = MockNet::default();
        let gw = gateway(
            &net,
            config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a1"})),
        );

        let batches: Vec<Vec<Doc>> = gw
            .stream_docs(
                input.clone(),
                StreamOptions {
                    request_size,
                    results_in_order: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .collect()
            .await;
        let round_tripped: Vec<Doc> = batches.into_iter().flatten().collect();

        assert_eq!(
            round_tripped, input,
            "round trip at request_size {request_size}"
        );
    }
}

#[tokio::test]
async fn conditions_route_docs_and_preserve_the_rest() {
    let net = MockNet::default();
    net.tag("mock://a", "src", "a");
    net.tag("mock://b", "src", "b");

    let mut cfg = config(
        json!({"start": ["a", "b"], "a": ["end"], "b": ["end"]}),
        json!({"a": "mock://a", "b": "mock://b"}),
    );
    cfg.graph_conditions = HashMap::from([
        ("a".to_string(), json!({"lang": "en"})),
        ("b".to_string(), json!({"lang": "de"})),
    ]);
    let gw = gateway(&net, cfg);

    let input = vec![
        Doc::new("d1").with_attr("lang", "en"),
        Doc::new("d2").with_attr("lang", "de"),
        Doc::new("d3").with_attr("lang", "fr"),
    ];
    let response = gw
        .process_single_data(DataRequest {
            docs: input,
            ..Default::default()
        })
        .await;

    assert!(!response.is_error());
    let by_id: HashMap<&str, &Doc> = response.docs.iter().map(|d| (d.id.as_str(), d)).collect();
    // No ids are lost: routed docs carry their tag, the unroutable doc
    // rejoins untouched.
    assert_eq!(by_id.len(), 3);
    assert_eq!(by_id["d1"].attributes["src"].as_text(), Some("a"));
    assert_eq!(by_id["d2"].attributes["src"].as_text(), Some("b"));
    assert!(!by_id["d3"].attributes.contains_key("src"));
}

#[tokio::test]
async fn target_executor_passes_through_unmatched_deployments() {
    let net = MockNet::default();
    net.tag("mock://a", "src", "a");

    let gw = gateway(
        &net,
        config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a"})),
    );

    let responses: Vec<DataResponse> = gw
        .stream_responses(
            docs(2),
            StreamOptions {
                request_size: 2,
                target_executor: Some("^other$".to_string()),
                ..Default::default()
            },
        )
        .unwrap()
        .collect()
        .await;

    assert_eq!(responses.len(), 1);
    assert_eq!(ids(&responses[0].docs), vec!["d1", "d2"]);
    assert!(!responses[0].docs[0].attributes.contains_key("src"));
    assert!(net.attempts().is_empty());
}

#[tokio::test]
async fn stream_unpacks_executor_errors() {
    let net = MockNet::default();
    net.logical_error("mock://a", "Boom");

    let gw = gateway(
        &net,
        config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a"})),
    );

    let results: Vec<_> = gw
        .stream(docs(1), StreamOptions::default())
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    let (_, error) = &results[0];
    let error = error.as_ref().unwrap();
    assert_eq!(error.name, "Boom");
    assert_eq!(error.executor, "a");
}

#[tokio::test]
async fn close_drains_floating_tasks_and_shuts_the_pool() {
    let net = MockNet::default();
    let completed = Arc::new(AtomicBool::new(false));
    {
        let completed = completed.clone();
        net.set(
            "mock://f",
            Arc::new(move |requests| {
                let completed = completed.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    completed.store(true, Ordering::SeqCst);
                    Ok(echo_response(requests))
                })
            }),
        );
    }

    let gw = gateway(
        &net,
        config(
            json!({"start": ["a", "f"], "a": ["end"]}),
            json!({"a": "mock://a", "f": "mock://f"}),
        ),
    );
    let client = gw.executor_client("a").unwrap();

    let response = gw
        .process_single_data(DataRequest {
            docs: docs(1),
            ..Default::default()
        })
        .await;
    // The floating branch is not awaited on the response path.
    assert!(!response.is_error());
    assert!(!completed.load(Ordering::SeqCst));

    let started = std::time::Instant::now();
    gw.close().await;
    assert!(completed.load(Ordering::SeqCst), "close did not drain");
    assert!(started.elapsed() >= Duration::from_millis(200));

    // The pool refuses further sends.
    let err = client
        .post(docs(1), 1, None, HashMap::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::PoolClosed));
}

#[tokio::test]
async fn close_is_idempotent() {
    let net = MockNet::default();
    let gw = gateway(
        &net,
        config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a"})),
    );

    gw.close().await;
    gw.close().await;
}

#[tokio::test]
async fn cancellation_ends_the_stream_early() {
    let net = MockNet::default();
    net.sleepy("mock://a1", Duration::from_millis(50));

    let mut cfg = config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a1"}));
    cfg.prefetch = 1;
    let gw = gateway(&net, cfg);

    let mut responses = gw
        .stream_responses(
            docs(10),
            StreamOptions {
                request_size: 1,
                ..Default::default()
            },
        )
        .unwrap();

    let mut seen = 0;
    while let Some(_response) = responses.next().await {
        seen += 1;
        if seen == 2 {
            gw.cancel_token().cancel();
        }
    }
    assert!(seen < 10, "cancellation did not stop the stream, saw {seen}");
}

#[tokio::test]
async fn warmup_returns_once_replicas_serve() {
    let net = MockNet::default();
    let gw = gateway(
        &net,
        config(
            json!({"start": ["a"], "a": ["end"]}),
            json!({"a": ["mock://a1", "mock://a2"]}),
        ),
    );

    let stop = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(1), gw.warmup(&stop))
        .await
        .expect("warmup should return promptly when replicas serve");
}

#[tokio::test]
async fn warmup_stops_on_the_stop_event() {
    let net = MockNet::default();
    net.set_unserving("mock://a1");

    let gw = gateway(
        &net,
        config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a1"})),
    );

    let stop = CancellationToken::new();
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_clone.cancel();
    });

    tokio::time::timeout(Duration::from_secs(2), gw.warmup(&stop))
        .await
        .expect("warmup should stop on the stop event");
}

#[tokio::test]
async fn construction_rejects_a_cyclic_graph() {
    let net = MockNet::default();
    let err = GatewayStreamer::with_connector(
        config(
            json!({"start": ["a"], "a": ["b"], "b": ["a"]}),
            json!({"a": "mock://a", "b": "mock://b"}),
        ),
        Arc::new(net),
        None,
    )
    .err()
    .unwrap();
    assert!(matches!(err, Error::Graph(_)));
}

#[tokio::test]
async fn construction_rejects_missing_addresses() {
    let net = MockNet::default();
    let err = GatewayStreamer::with_connector(
        config(json!({"start": ["a"], "a": ["end"]}), json!({})),
        Arc::new(net),
        None,
    )
    .err()
    .unwrap();
    assert!(matches!(err, Error::Config(_)));
}

// Counter value for one deployment label, zero if never recorded.
fn counter_value(registry: &prometheus::Registry, name: &str, deployment: &str) -> f64 {
    registry
        .gather()
        .iter()
        .find(|family| family.get_name() == name)
        .and_then(|family| {
            family.get_metric().iter().find(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|label| label.get_name() == "deployment" && label.get_value() == deployment)
            })
        })
        .map(|metric| metric.get_counter().get_value())
        .unwrap_or(0.0)
}

#[tokio::test]
async fn metrics_count_floating_dispatches_too() {
    let net = MockNet::default();
    net.logical_error("mock://b", "Boom");

    let registry = prometheus::Registry::new();
    let gw = GatewayStreamer::with_connector(
        config(
            json!({"start": ["a", "b", "f"], "a": ["end"], "b": ["end"]}),
            json!({"a": "mock://a", "b": "mock://b", "f": "mock://f"}),
        ),
        Arc::new(net.clone()),
        Some(&registry),
    )
    .unwrap();

    let response = gw
        .process_single_data(DataRequest {
            docs: docs(1),
            ..Default::default()
        })
        .await;
    assert!(response.is_error());

    // Draining on close guarantees the floating dispatch was recorded.
    gw.close().await;

    for deployment in ["a", "b", "f"] {
        assert_eq!(
            counter_value(&registry, "gateway_requests_total", deployment),
            1.0,
            "requests of '{deployment}'"
        );
    }
    assert_eq!(counter_value(&registry, "gateway_request_errors_total", "a"), 0.0);
    assert_eq!(counter_value(&registry, "gateway_request_errors_total", "b"), 1.0);
    assert_eq!(counter_value(&registry, "gateway_request_errors_total", "f"), 0.0);
}

#[tokio::test]
async fn readiness_poll_gives_up_at_the_deadline() {
    // Nothing listens on this address: every probe fails fast.
    let started = std::time::Instant::now();
    let ready = gateway::runtime::wait_for_ready_or_shutdown(
        "127.0.0.1:1",
        Some(Duration::from_millis(300)),
        &CancellationToken::new(),
    )
    .await;

    assert!(!ready, "a dead address must not become ready");
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[tokio::test]
async fn readiness_poll_stops_when_shutdown_fires() {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    // No deadline: only the shutdown event can end the poll.
    let ready = tokio::time::timeout(
        Duration::from_secs(5),
        gateway::runtime::wait_for_ready_or_shutdown("127.0.0.1:1", None, &shutdown),
    )
    .await
    .expect("shutdown should end the readiness poll");
    assert!(ready);
}

#[tokio::test]
async fn executor_client_posts_batches() {
    let net = MockNet::default();
    net.tag("mock://a", "src", "a");

    let gw = gateway(
        &net,
        config(json!({"start": ["a"], "a": ["end"]}), json!({"a": "mock://a"})),
    );

    let client = gw.executor_client("a").unwrap();
    let merged = client.post(docs(5), 2, None, HashMap::new()).await.unwrap();

    assert_eq!(merged.len(), 5);
    assert!(merged.iter().all(|d| d.attributes["src"].as_text() == Some("a")));
    assert_eq!(net.attempts_to("mock://a"), 3);

    assert!(matches!(
        gw.executor_client("nope"),
        Err(Error::UnknownDeployment(_))
    ));
}
