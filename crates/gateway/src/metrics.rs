use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Per-deployment request instrumentation, labelled by deployment name.
pub(crate) struct NodeMetrics {
    pub requests: IntCounterVec,
    pub errors: IntCounterVec,
    pub latency: HistogramVec,
}

impl NodeMetrics {
    pub fn register(registry: &Registry, runtime_name: &str) -> prometheus::Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new(
                "gateway_requests_total",
                "Requests dispatched to a deployment.",
            )
            .const_label("runtime", runtime_name),
            &["deployment"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new(
                "gateway_request_errors_total",
                "Dispatches which returned an error status.",
            )
            .const_label("runtime", runtime_name),
            &["deployment"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Round-trip latency of deployment dispatches.",
            )
            .const_label("runtime", runtime_name),
            &["deployment"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            requests,
            errors,
            latency,
        })
    }
}
