use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use tokio::sync::{Mutex, mpsc::Receiver};
use uuid::Uuid;

use crate::{
    error::ExecutionError,
    exec_log::{ExecutionEvent, ExecutionLog},
    metrics::{MetricsAggregator, RunStatus},
    models::{InputResults, Outcome},
    queue::QueuedJob,
    sandbox::{RunSpec, RuntimeRegistry, SandboxBackend},
    store::ResultStore,
};

/// Everything a worker needs to run and finalize an execution.
pub struct ExecutionContext {
    pub store: Arc<ResultStore>,
    pub metrics: Arc<MetricsAggregator>,
    pub runtimes: RuntimeRegistry,
    pub sandbox: Arc<dyn SandboxBackend>,
    pub exec_log: ExecutionLog,
    pub sandbox_timeout: Duration,
    pub max_output_bytes: usize,
}

pub fn spawn_worker_pool(
    workers: usize,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    ctx: Arc<ExecutionContext>,
) {
    for worker_id in 0..workers.max(1) {
        let receiver = receiver.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            worker_loop(worker_id, receiver, ctx).await;
        });
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    ctx: Arc<ExecutionContext>,
) {
    loop {
        let job = {
            let mut locked = receiver.lock().await;
            locked.recv().await
        };
        let Some(job) = job else {
            tracing::info!(worker_id, "job queue closed, worker exiting");
            break;
        };

        tracing::debug!(worker_id, exec_id = %job.exec_id, "starting execution");
        run_job(&ctx, job).await;
    }
}

/// Runs one execution and always finalizes it, even if dispatch panics.
async fn run_job(ctx: &Arc<ExecutionContext>, job: QueuedJob) {
    let started = Instant::now();
    let exec_id = job.exec_id;
    let language = job.request.language.clone();

    let task_ctx = ctx.clone();
    let result = match tokio::spawn(async move { dispatch(&task_ctx, job).await }).await {
        Ok(result) => result,
        Err(join_err) => {
            tracing::error!(exec_id = %exec_id, error = %join_err, "execution task aborted");
            Err(ExecutionError::Internal(join_err.to_string()))
        }
    };

    finalize(ctx, exec_id, &language, result, started.elapsed()).await;
}

async fn dispatch(
    ctx: &ExecutionContext,
    job: QueuedJob,
) -> Result<InputResults, ExecutionError> {
    let QueuedJob { exec_id, request } = job;
    let runtime = ctx
        .runtimes
        .resolve(&request.language)
        .cloned()
        .ok_or_else(|| ExecutionError::UnsupportedLanguage(request.language.clone()))?;

    let spec = RunSpec {
        exec_id,
        files: runtime.source_files(&request.code),
        runtime,
        inputs: request.inputs,
        timeout: ctx.sandbox_timeout,
        max_output_bytes: ctx.max_output_bytes,
    };
    Ok(ctx.sandbox.execute(spec).await?)
}

async fn finalize(
    ctx: &ExecutionContext,
    exec_id: Uuid,
    language: &str,
    result: Result<InputResults, ExecutionError>,
    elapsed: Duration,
) {
    let duration = elapsed.as_secs_f64();
    let (outcome, status, error_kind) = match result {
        Ok(results) => (Outcome::Completed(results), RunStatus::Success, None),
        Err(err) => {
            tracing::warn!(
                exec_id = %exec_id,
                language,
                error_kind = err.kind().as_str(),
                error = %err,
                "execution failed"
            );
            (
                Outcome::Failed {
                    error: err.to_string(),
                },
                RunStatus::Error,
                Some(err.kind()),
            )
        }
    };

    let completed = ctx.metrics.end(exec_id, duration, status, error_kind, || {
        ctx.store.complete(&exec_id, outcome, duration)
    });
    if !completed {
        tracing::warn!(exec_id = %exec_id, "execution record missing or already completed");
    }

    let event = ExecutionEvent {
        exec_id,
        language: language.to_string(),
        status,
        duration,
        timestamp: Utc::now(),
    };
    tracing::info!(
        exec_id = %exec_id,
        language,
        status = status.as_str(),
        duration,
        "execution finished"
    );
    if let Err(err) = ctx.exec_log.record(&event).await {
        tracing::warn!(exec_id = %exec_id, error = %err, "failed to append execution log");
    }
}
