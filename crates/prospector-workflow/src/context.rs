//! The shared pipeline context.
//!
//! One explicit object constructed at startup and passed by `Arc` into the
//! executor and scheduler — no global singletons. For multi-process
//! deployments the same interfaces can be backed by a shared durable store.

use prospector_cache::ResultCache;
use prospector_core::audit::AuditSink;
use prospector_core::capability::CapabilityInvoker;
use prospector_core::config::OrchestratorConfig;
use prospector_queue::TaskQueue;
use prospector_security::TokenAuthority;
use std::sync::Arc;

/// Everything the orchestration core shares: token authority, result cache,
/// task queue, capability boundary, audit sink, and config.
pub struct PipelineContext {
    pub config: OrchestratorConfig,
    pub tokens: Arc<TokenAuthority>,
    pub cache: Arc<ResultCache>,
    pub queue: Arc<TaskQueue>,
    pub invoker: Arc<dyn CapabilityInvoker>,
    pub audit: Arc<dyn AuditSink>,
}

impl PipelineContext {
    /// Wire up the full context from a config, a capability boundary, and
    /// an audit sink.
    pub fn new(
        config: OrchestratorConfig,
        invoker: Arc<dyn CapabilityInvoker>,
        audit: Arc<dyn AuditSink>,
    ) -> Arc<Self> {
        let tokens = Arc::new(TokenAuthority::new(&config.tokens));
        let cache = Arc::new(ResultCache::new());
        let queue = Arc::new(TaskQueue::new(
            config.queue.clone(),
            Arc::clone(&tokens),
            Arc::clone(&invoker),
            Arc::clone(&audit),
        ));
        Arc::new(Self {
            config,
            tokens,
            cache,
            queue,
            invoker,
            audit,
        })
    }

    /// Spawn the queue dispatcher and the token/cache sweepers.
    /// Returns the join handles so an embedder can abort them on shutdown.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self.queue).run()),
            TokenAuthority::spawn_sweeper(
                Arc::clone(&self.tokens),
                self.config.tokens.sweep_interval_secs,
            ),
            ResultCache::spawn_sweeper(
                Arc::clone(&self.cache),
                self.config.cache.sweep_interval_secs,
            ),
        ]
    }
}
