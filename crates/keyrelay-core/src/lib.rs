pub mod context;
pub mod error;
pub mod preprocess;
pub mod queue;
pub mod tokenizer;
pub mod upstream;

pub use context::RequestContext;
pub use error::ProxyError;
pub use preprocess::{InboundRequest, Preprocessed, preprocess};
pub use queue::Queue;
pub use tokenizer::{CharHeuristicEstimator, TokenEstimator};
pub use upstream::{ServiceEndpoint, ServiceFamily, UpstreamOutcome, UpstreamProxy, translate_response_body};

use std::collections::HashMap;
use std::sync::Arc;

use keyrelay_common::Headers;
use keyrelay_provider_core::KeyPool;
use tokio_util::sync::CancellationToken;

/// Everything the router needs to run one request end to end: the pool,
/// one FIFO queue per service, and the upstream dispatcher. One `Core`
/// per process, shared behind an `Arc` by every handler.
pub struct CoreState {
    pub pool: Arc<KeyPool>,
    pub queues: HashMap<String, Arc<Queue>>,
    pub upstream: UpstreamProxy,
    pub estimator: Box<dyn TokenEstimator>,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    /// Spawns one scheduler task per registered service and wraps
    /// everything behind a shared handle.
    pub fn new(pool: Arc<KeyPool>, upstream: UpstreamProxy) -> Self {
        let mut queues = HashMap::new();
        for service in pool.services() {
            let queue = Queue::new(service);
            queue.clone().spawn_scheduler(pool.clone());
            queues.insert(service.to_string(), queue);
        }
        Self {
            state: Arc::new(CoreState {
                pool,
                queues,
                upstream,
                estimator: Box::new(CharHeuristicEstimator),
            }),
        }
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }
}

impl CoreState {
    /// Runs one request through the whole pipeline: parse and translate
    /// the body, join the service's admission line, dispatch to the
    /// upstream, and hand back whatever the caller should forward to the
    /// client.
    pub async fn handle(
        &self,
        trace_id: String,
        inbound: InboundRequest,
        outbound_headers: Headers,
        cancel: CancellationToken,
    ) -> Result<(RequestContext, UpstreamOutcome), ProxyError> {
        let Preprocessed { mut ctx, body } = preprocess(trace_id, inbound, &self.pool, self.estimator.as_ref())?;

        let queue = self
            .queues
            .get(&ctx.service)
            .ok_or_else(|| ProxyError::Unsupported(format!("no admission queue for service '{}'", ctx.service)))?;
        // `admission` carries the concurrency-gate permit (§5) that bounds
        // how many requests for this service are in flight at once.
        // `dispatch` takes ownership of it so a streaming response keeps
        // the permit held for the stream's full lifetime, not just until
        // the first chunk of headers arrives.
        let admission = queue.admit(ctx.model.clone(), cancel).await?;
        ctx.bind_key(admission.key.clone());

        let outcome = self
            .upstream
            .dispatch(&self.pool, self.estimator.as_ref(), &mut ctx, body, outbound_headers, admission)
            .await?;
        Ok((ctx, outcome))
    }
}
