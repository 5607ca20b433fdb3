use crate::handler::RequestHandler;
use futures::{Stream, StreamExt};
use proto_gateway::data::{DataRequest, DataResponse};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// In-flight handles of floating-node dispatches. Shared by every stream
/// of a gateway and drained at close.
#[derive(Default)]
pub struct FloatingTasks {
    inner: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl FloatingTasks {
    pub fn register(&self, handle: JoinHandle<()>) {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|handle| !handle.is_finished());
        inner.push(handle);
    }

    /// Await every registered task, including tasks registered while
    /// draining.
    pub async fn drain(&self) {
        loop {
            let handles = std::mem::take(&mut *self.inner.lock().unwrap());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    /// Hard shutdown: abort instead of awaiting.
    pub fn abort_all(&self) {
        for handle in std::mem::take(&mut *self.inner.lock().unwrap()) {
            handle.abort();
        }
    }
}

/// Turns a stream of requests into a stream of responses with bounded
/// in-flight concurrency.
///
/// At most `prefetch` requests are in flight (dispatched but not yet
/// delivered) at a time; zero means unbounded. The next input is not
/// consumed until a slot frees, which backpressures the client.
pub struct RequestStreamer {
    handler: Arc<RequestHandler>,
    prefetch: usize,
    floating: Arc<FloatingTasks>,
    cancel: CancellationToken,
}

impl RequestStreamer {
    pub(crate) fn new(
        handler: Arc<RequestHandler>,
        prefetch: usize,
        floating: Arc<FloatingTasks>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handler,
            prefetch,
            floating,
            cancel,
        }
    }

    /// Stream `requests` through the topology.
    ///
    /// With `results_in_order`, responses are re-sequenced into input
    /// order; otherwise they are yielded as they complete. Cancellation
    /// (or the consumer dropping the stream) stops input consumption and
    /// aborts in-flight dispatches; the stream then simply ends.
    pub fn stream(
        &self,
        requests: impl Stream<Item = DataRequest> + Send + 'static,
        results_in_order: bool,
    ) -> impl Stream<Item = DataResponse> + Send + 'static {
        let handler = self.handler.clone();
        let semaphore = match self.prefetch {
            0 => None,
            bound => Some(Arc::new(Semaphore::new(bound))),
        };
        let cancel = self.cancel.child_token();

        let (out_tx, out_rx) = mpsc::channel::<DataResponse>(1);
        let (done_tx, mut done_rx) =
            mpsc::unbounded_channel::<(u64, DataResponse, Option<OwnedSemaphorePermit>)>();

        // Collector: re-sequences completions when ordering is requested,
        // and releases each prefetch slot once its response is delivered.
        let collector_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut next = 0u64;
            let mut buffered: BTreeMap<u64, (DataResponse, Option<OwnedSemaphorePermit>)> =
                BTreeMap::new();

            while let Some((seq, response, permit)) = done_rx.recv().await {
                if !results_in_order {
                    if out_tx.send(response).await.is_err() {
                        // Consumer went away: stop pulling input.
                        collector_cancel.cancel();
                        return;
                    }
                    drop(permit);
                    continue;
                }
                buffered.insert(seq, (response, permit));
                while let Some((response, permit)) = buffered.remove(&next) {
                    if out_tx.send(response).await.is_err() {
                        collector_cancel.cancel();
                        return;
                    }
                    drop(permit);
                    next += 1;
                }
            }
        });

        // Puller: drives the input, acquiring a prefetch slot before each
        // pull so a slow consumer defers further input consumption.
        let puller_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::pin!(requests);
            let mut seq = 0u64;
            let mut tasks = tokio::task::JoinSet::new();

            loop {
                let permit = match &semaphore {
                    Some(semaphore) => tokio::select! {
                        _ = puller_cancel.cancelled() => break,
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                    },
                    None => None,
                };
                let request = tokio::select! {
                    _ = puller_cancel.cancelled() => break,
                    request = requests.next() => request,
                };
                let Some(request) = request else { break };

                let handler = handler.clone();
                let done_tx = done_tx.clone();
                tasks.spawn(async move {
                    let response = handler.handle(request).await;
                    // The permit travels with the response: it is released
                    // on delivery, not on completion.
                    let _ = done_tx.send((seq, response, permit));
                });
                seq += 1;
            }
            drop(done_tx);

            tokio::select! {
                _ = puller_cancel.cancelled() => tasks.abort_all(),
                _ = async {
                    while tasks.join_next().await.is_some() {}
                } => (),
            }
        });

        ReceiverStream::new(out_rx)
    }

    /// Degenerate single-request path: one request in, one response out,
    /// with the same error semantics as streaming.
    pub async fn process_single_data(&self, request: DataRequest) -> DataResponse {
        self.handler.handle(request).await
    }

    /// Await completion of every floating dispatch registered so far.
    pub async fn wait_floating_requests_end(&self) {
        self.floating.drain().await;
    }

    pub(crate) fn floating(&self) -> &Arc<FloatingTasks> {
        &self.floating
    }
}
