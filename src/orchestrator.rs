use std::{sync::Arc, time::Duration};

use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    error::EngineError,
    exec_log::ExecutionLog,
    metrics::{MetricsAggregator, MetricsSnapshot},
    models::{ExecutionRecord, ExecutionRequest, ExecutionStatus, ExecutionView},
    queue::{QueuedJob, Scheduler},
    sandbox::SandboxBackend,
    store::ResultStore,
    worker::{ExecutionContext, spawn_worker_pool},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Occupancy {
    pub pending: usize,
    pub in_progress: u64,
}

/// Accepts submissions, hands them to the worker pool and answers queries.
///
/// Owns the result store and metrics for the lifetime of the process; there
/// is no global state behind it.
pub struct Orchestrator {
    ctx: Arc<ExecutionContext>,
    scheduler: Scheduler,
}

impl Orchestrator {
    /// Builds the context and spawns the worker pool. Must run inside a
    /// tokio runtime.
    pub fn start(config: &EngineConfig, sandbox: Arc<dyn SandboxBackend>) -> Self {
        let ctx = Arc::new(ExecutionContext {
            store: Arc::new(ResultStore::new()),
            metrics: Arc::new(MetricsAggregator::new()),
            runtimes: config.runtime_registry(),
            sandbox,
            exec_log: ExecutionLog::new(config.log_dir.clone()),
            sandbox_timeout: config.sandbox_timeout,
            max_output_bytes: config.max_output_bytes,
        });
        let scheduler = Scheduler::new(config.queue_capacity);
        spawn_worker_pool(config.worker_count, scheduler.receiver(), ctx.clone());

        tracing::info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            sandbox = ctx.sandbox.name(),
            runtimes = ?ctx.runtimes.names(),
            "execution orchestrator started"
        );
        Self { ctx, scheduler }
    }

    /// Records a pending execution and queues it. Never waits on the queue or
    /// on the execution itself.
    pub fn submit(&self, request: ExecutionRequest) -> Result<Uuid, EngineError> {
        let permit = self.scheduler.reserve()?;
        let exec_id = Uuid::new_v4();

        let record = ExecutionRecord::pending(exec_id, request.language.clone());
        self.ctx
            .metrics
            .begin(&request.language, || self.ctx.store.insert_pending(record));
        tracing::info!(
            exec_id = %exec_id,
            language = %request.language,
            inputs = request.inputs.len(),
            "execution submitted"
        );

        permit.send(QueuedJob { exec_id, request });
        Ok(exec_id)
    }

    pub fn query(&self, exec_id: &Uuid) -> ExecutionView {
        let Some(record) = self.ctx.store.get(exec_id) else {
            return ExecutionView::Unknown;
        };
        match (record.status, record.result) {
            (ExecutionStatus::Completed, Some(outcome)) => ExecutionView::Completed {
                outcome,
                duration: record.duration.unwrap_or_default(),
            },
            _ => ExecutionView::Pending,
        }
    }

    /// Like [`Orchestrator::query`], but first waits up to `timeout` for the
    /// execution to complete.
    pub async fn wait(&self, exec_id: &Uuid, timeout: Duration) -> ExecutionView {
        let Some(mut done) = self.ctx.store.subscribe(exec_id) else {
            return ExecutionView::Unknown;
        };
        let _ = tokio::time::timeout(timeout, done.wait_for(|completed| *completed)).await;
        self.query(exec_id)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Pending records and in-flight metrics, read at the same instant.
    pub fn occupancy(&self) -> Occupancy {
        self.ctx.metrics.observe(|metrics| Occupancy {
            pending: self.ctx.store.pending_count(),
            in_progress: metrics.in_progress,
        })
    }
}
