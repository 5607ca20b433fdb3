use crate::graph::{self, Node, NodeId, Topology};
use crate::metrics::NodeMetrics;
use crate::pool::{ConnectionPool, Role};
use crate::streamer::FloatingTasks;
use crate::{Error, Metadata, Result};
use proto_gateway::data::{
    status, AttrValue, DataRequest, DataResponse, Doc, Exception, RequestHeader, Status,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

type Params = HashMap<String, AttrValue>;

/// Drives one client request through the topology: layered concurrent
/// dispatch, edge filtering, fan-in reduction, and error collection.
pub(crate) struct RequestHandler {
    graph: Arc<Topology>,
    pool: Arc<ConnectionPool>,
    floating: Arc<FloatingTasks>,
    metrics: Option<Arc<NodeMetrics>>,
}

impl RequestHandler {
    pub fn new(
        graph: Arc<Topology>,
        pool: Arc<ConnectionPool>,
        floating: Arc<FloatingTasks>,
        metrics: Option<Arc<NodeMetrics>>,
    ) -> Self {
        Self {
            graph,
            pool,
            floating,
            metrics,
        }
    }

    /// Handle one request. Failures become response status, never errors:
    /// an admitted request always yields exactly one response.
    pub async fn handle(&self, mut request: DataRequest) -> DataResponse {
        let header = {
            let header = request.header.get_or_insert_with(RequestHeader::default);
            if header.request_id.is_empty() {
                header.request_id = uuid::Uuid::new_v4().to_string();
            }
            header.clone()
        };
        let parameters = std::mem::take(&mut request.parameters);
        let docs = std::mem::take(&mut request.docs);

        match self.walk(&header, &parameters, docs).await {
            Ok(response) => response,
            Err(err) => {
                let exception = Exception {
                    name: err.exception_name().to_string(),
                    args: vec![err.to_string()],
                    stacks: Vec::new(),
                    executor: String::new(),
                };
                let mut response = DataResponse::from_exception(Some(header), exception);
                response.parameters = parameters;
                response
            }
        }
    }

    async fn walk(
        &self,
        header: &RequestHeader,
        parameters: &Params,
        docs: Vec<Doc>,
    ) -> Result<DataResponse> {
        let graph = &self.graph;

        // Deployments which should actually be invoked; others pass the
        // request through untouched.
        let target = match header.target_executor.as_deref() {
            Some(pattern) if !pattern.is_empty() => Some(regex::Regex::new(pattern).map_err(
                |err| Error::Config(format!("invalid target_executor pattern: {err}")),
            )?),
            _ => None,
        };

        // Per-node input buffers, one slot per incoming edge. A `None`
        // slot means its predecessor was skipped or failed.
        let mut inbox: Vec<Vec<Option<Vec<Doc>>>> = graph
            .nodes()
            .iter()
            .map(|node| vec![None; node.preds.len()])
            .collect();
        // Documents withheld by edge conditions, keyed by the rank of the
        // node which held them back. They rejoin the reduction at `end`.
        let mut residuals: Vec<(usize, Vec<Doc>)> = Vec::new();
        let mut errors: Vec<(usize, Exception)> = Vec::new();

        self.forward(graph.start(), docs, &mut inbox, &mut residuals)?;

        for layer in graph.layers() {
            let header_ref = &*header;
            let parameters_ref = &*parameters;

            let mut dispatches = Vec::new();
            for &id in layer {
                let node = graph.node(id);
                let inputs: Vec<Vec<Doc>> = std::mem::take(&mut inbox[id])
                    .into_iter()
                    .flatten()
                    .collect();
                if inputs.is_empty() {
                    // All predecessors were skipped or failed.
                    continue;
                }
                let docs = graph::reduce(inputs, node.no_reduce);

                if node.floating {
                    self.spawn_floating(id, docs, header.clone(), parameters.clone());
                    continue;
                }
                if let Some(target) = &target {
                    if !target.is_match(&node.name) {
                        self.forward(id, docs, &mut inbox, &mut residuals)?;
                        continue;
                    }
                }
                dispatches.push(async move {
                    (
                        id,
                        self.dispatch(node, docs, header_ref, parameters_ref).await,
                    )
                });
            }

            for (id, outcome) in futures::future::join_all(dispatches).await {
                match outcome {
                    Ok((response, _metadata)) if !response.is_error() => {
                        self.forward(id, response.docs, &mut inbox, &mut residuals)?;
                    }
                    Ok((response, _metadata)) => {
                        let exception = response.exception().cloned().unwrap_or_else(|| {
                            Exception {
                                name: "ExecutorError".to_string(),
                                args: Vec::new(),
                                stacks: Vec::new(),
                                executor: graph.node(id).name.clone(),
                            }
                        });
                        errors.push((graph.node(id).rank, exception));
                    }
                    Err(err) => {
                        errors.push((
                            graph.node(id).rank,
                            Exception {
                                name: err.exception_name().to_string(),
                                args: vec![err.to_string()],
                                stacks: Vec::new(),
                                executor: graph.node(id).name.clone(),
                            },
                        ));
                    }
                }
            }
        }

        // Reduce at `end`: withheld documents rejoin first so that branch
        // outputs win id conflicts, then branches in edge order.
        residuals.sort_by_key(|(rank, _)| *rank);
        let mut branches: Vec<Vec<Doc>> = residuals.into_iter().map(|(_, docs)| docs).collect();
        branches.extend(std::mem::take(&mut inbox[graph.end()]).into_iter().flatten());
        let docs = graph::reduce(branches, false);

        // The surfaced error is the first by topological rank; the sort is
        // stable, so ties keep their insertion order.
        errors.sort_by_key(|(rank, _)| *rank);
        let status = match errors.into_iter().next() {
            Some((_, exception)) => Status {
                code: status::Code::Error as i32,
                description: exception.args.first().cloned().unwrap_or_default(),
                exception: Some(exception),
            },
            None => Status {
                code: status::Code::Ok as i32,
                ..Default::default()
            },
        };

        Ok(DataResponse {
            header: Some(header.clone()),
            parameters: parameters.clone(),
            docs,
            status: Some(status),
        })
    }

    // Filter `docs` over the outgoing edges of `from` and deliver them to
    // successor input slots. Documents matching no outgoing condition are
    // withheld into `residuals`.
    fn forward(
        &self,
        from: NodeId,
        docs: Vec<Doc>,
        inbox: &mut [Vec<Option<Vec<Doc>>>],
        residuals: &mut Vec<(usize, Vec<Doc>)>,
    ) -> Result<()> {
        let node = self.graph.node(from);
        if node.succs.is_empty() {
            return Ok(());
        }

        let mut matched = vec![false; docs.len()];
        let mut outputs: Vec<Vec<Doc>> = Vec::with_capacity(node.succs.len());
        for &succ in &node.succs {
            match &self.graph.node(succ).condition {
                None => {
                    matched.iter_mut().for_each(|m| *m = true);
                    outputs.push(docs.clone());
                }
                Some(condition) => {
                    let mut selected = Vec::new();
                    for (i, doc) in docs.iter().enumerate() {
                        if condition.matches(doc)? {
                            matched[i] = true;
                            selected.push(doc.clone());
                        }
                    }
                    outputs.push(selected);
                }
            }
        }

        for (&succ, output) in node.succs.iter().zip(outputs) {
            let slot = self
                .graph
                .node(succ)
                .preds
                .iter()
                .position(|&p| p == from)
                .expect("edge is registered both ways");
            inbox[succ][slot] = Some(output);
        }

        let withheld: Vec<Doc> = docs
            .into_iter()
            .zip(&matched)
            .filter(|(_, matched)| !**matched)
            .map(|(doc, _)| doc)
            .collect();
        if !withheld.is_empty() {
            residuals.push((node.rank, withheld));
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(deployment = %node.name, request_id = %header.request_id))]
    async fn dispatch(
        &self,
        node: &Node,
        docs: Vec<Doc>,
        header: &RequestHeader,
        parameters: &Params,
    ) -> Result<(DataResponse, Metadata)> {
        let request = DataRequest {
            header: Some(header.clone()),
            parameters: parameters.clone(),
            docs,
        };
        if let Some(metrics) = &self.metrics {
            metrics.requests.with_label_values(&[&node.name]).inc();
        }
        let started = std::time::Instant::now();

        let result = self
            .pool
            .send_requests_once(
                vec![request],
                &node.name,
                Role::Head,
                header.exec_endpoint.as_deref(),
                &node.metadata,
            )
            .await;

        if let Some(metrics) = &self.metrics {
            metrics
                .latency
                .with_label_values(&[&node.name])
                .observe(started.elapsed().as_secs_f64());
            let failed = match &result {
                Ok((response, _)) => response.is_error(),
                Err(_) => true,
            };
            if failed {
                metrics.errors.with_label_values(&[&node.name]).inc();
            }
        }
        result
    }

    // Dispatch a floating subgraph as a detached task, registered with the
    // floating set so close() can drain it. Outputs are discarded; only
    // side effects matter.
    fn spawn_floating(&self, id: NodeId, docs: Vec<Doc>, header: RequestHeader, parameters: Params) {
        let graph = self.graph.clone();
        let pool = self.pool.clone();
        let metrics = self.metrics.clone();

        let handle = tokio::spawn(async move {
            let mut pending: VecDeque<(NodeId, Vec<Doc>)> = VecDeque::new();
            pending.push_back((id, docs));

            while let Some((id, docs)) = pending.pop_front() {
                let node = graph.node(id);
                let request = DataRequest {
                    header: Some(header.clone()),
                    parameters: parameters.clone(),
                    docs,
                };
                if let Some(metrics) = &metrics {
                    metrics.requests.with_label_values(&[&node.name]).inc();
                }
                let started = std::time::Instant::now();
                let result = pool
                    .send_requests_once(
                        vec![request],
                        &node.name,
                        Role::Head,
                        header.exec_endpoint.as_deref(),
                        &node.metadata,
                    )
                    .await;
                if let Some(metrics) = &metrics {
                    metrics
                        .latency
                        .with_label_values(&[&node.name])
                        .observe(started.elapsed().as_secs_f64());
                    let failed = match &result {
                        Ok((response, _)) => response.is_error(),
                        Err(_) => true,
                    };
                    if failed {
                        metrics.errors.with_label_values(&[&node.name]).inc();
                    }
                }

                let response = match result {
                    Ok((response, _)) if !response.is_error() => response,
                    Ok((response, _)) => {
                        tracing::warn!(
                            deployment = %node.name,
                            exception = ?response.exception(),
                            "floating dispatch returned an error",
                        );
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(
                            deployment = %node.name,
                            error = %err,
                            "floating dispatch failed",
                        );
                        continue;
                    }
                };

                // Successors of a floating node are floating themselves:
                // forward filtered outputs down the chain.
                for &succ in &node.succs {
                    let mut selected = Vec::new();
                    for doc in &response.docs {
                        match &graph.node(succ).condition {
                            None => selected.push(doc.clone()),
                            Some(condition) => match condition.matches(doc) {
                                Ok(true) => selected.push(doc.clone()),
                                Ok(false) => (),
                                Err(err) => {
                                    tracing::warn!(
                                        deployment = %graph.node(succ).name,
                                        error = %err,
                                        "dropping doc failing condition evaluation",
                                    );
                                }
                            },
                        }
                    }
                    pending.push_back((succ, selected));
                }
            }
        });
        self.floating.register(handle);
    }
}
