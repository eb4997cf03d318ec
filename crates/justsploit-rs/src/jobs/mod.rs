use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    adapters::{build_invocation, Invocation, ToolSettings},
    config::AppConfig,
    db::ScanRecordSink,
    error::ScanError,
    executor::{execute, ExecOutcome},
    models::{NormalizedScanRecord, ScanJob, TaskId, TaskSnapshot, TaskStatus},
    parser::normalize,
    queue::{Broker, QueuedJob},
};

/// Queue-facing façade used by callers: submit, poll, cancel.
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    broker: Broker,
    tools: ToolSettings,
}

impl TaskDispatcher {
    pub fn new(broker: Broker, tools: ToolSettings) -> Self {
        Self { broker, tools }
    }

    /// Validate and enqueue. Never waits for a worker.
    pub async fn submit(&self, mut job: ScanJob) -> Result<TaskId, ScanError> {
        build_invocation(&job, &self.tools)?;
        job.target = job.target.trim().to_string();

        let purged = self.broker.tasks().purge_expired().await;
        if purged > 0 {
            info!(purged, "dropped expired task results");
        }

        let id = TaskId::new();
        self.broker.tasks().insert(id, job.clone()).await;
        if let Err(e) = self
            .broker
            .enqueue(QueuedJob {
                id,
                job: job.clone(),
            })
            .await
        {
            self.broker.tasks().remove(id).await;
            return Err(e);
        }

        info!(task_id = %id, tool = %job.tool, target = %job.target, "scan job enqueued");
        Ok(id)
    }

    pub async fn status(&self, id: TaskId) -> Result<TaskSnapshot, ScanError> {
        self.broker.tasks().snapshot(id).await
    }

    /// Best effort: a running tool is signalled, not awaited.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, ScanError> {
        let cancelled = self.broker.tasks().request_cancel(id).await?;
        if cancelled {
            info!(task_id = %id, "cancellation requested");
        }
        Ok(cancelled)
    }

    /// Poll until the task is terminal.
    pub async fn wait(&self, id: TaskId, poll_interval: Duration) -> Result<TaskSnapshot, ScanError> {
        loop {
            let snapshot = self.status(id).await?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Everything a worker needs, shared by the pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub broker: Broker,
    pub config: Arc<AppConfig>,
    pub sink: Arc<dyn ScanRecordSink>,
}

impl WorkerContext {
    pub fn new(broker: Broker, config: Arc<AppConfig>, sink: Arc<dyn ScanRecordSink>) -> Self {
        Self {
            broker,
            config,
            sink,
        }
    }
}

pub fn spawn_worker_pool(ctx: WorkerContext, workers: usize) -> Vec<JoinHandle<()>> {
    let workers = workers.max(1);
    info!(workers, "starting scan worker pool");
    (0..workers)
        .map(|worker_id| tokio::spawn(worker_loop(worker_id, ctx.clone())))
        .collect()
}

/// One job at a time until the broker is closed and drained.
pub async fn worker_loop(worker_id: usize, ctx: WorkerContext) {
    while let Some(queued) = ctx.broker.next_job().await {
        let task_id = queued.id;
        let job_ctx = ctx.clone();
        let handle = tokio::spawn(process_job(job_ctx, queued));

        if let Err(e) = handle.await {
            error!(worker_id, task_id = %task_id, error = %e, "scan job aborted");
            let message = format!("worker task aborted: {e}");
            if let Err(e) = ctx
                .broker
                .tasks()
                .finish(task_id, TaskStatus::Failed, None, Some(message))
                .await
            {
                error!(worker_id, task_id = %task_id, error = %e, "failed status update");
            }
        }
    }
    info!(worker_id, "queue drained, worker exiting");
}

async fn process_job(ctx: WorkerContext, queued: QueuedJob) {
    let QueuedJob { id, job } = queued;

    let mut cancel = match ctx.broker.tasks().claim(id).await {
        Ok(Some(cancel)) => cancel,
        Ok(None) => {
            info!(task_id = %id, "job cancelled before start, skipping");
            return;
        }
        Err(e) => {
            error!(task_id = %id, error = %e, "failed status update");
            return;
        }
    };

    let invocation = match build_invocation(&job, &ctx.config.tools()) {
        Ok(invocation) => invocation,
        Err(e) => {
            error!(task_id = %id, error = %e, "job no longer builds");
            if let Err(e) = ctx
                .broker
                .tasks()
                .finish(id, TaskStatus::Failed, None, Some(e.to_string()))
                .await
            {
                error!(task_id = %id, error = %e, "failed status update");
            }
            return;
        }
    };

    let started_at = Utc::now();
    let limit = ctx.config.timeout_for(job.tool);
    let outcome = tokio::select! {
        outcome = execute(&invocation, limit) => outcome,
        _ = cancel_requested(&mut cancel) => {
            info!(task_id = %id, "job cancelled while running, tool terminated");
            return;
        }
    };

    let record = build_record(&job, &invocation, outcome, started_at, Utc::now());
    match ctx.sink.save(&record, job.project_ref).await {
        Ok(record_id) => info!(task_id = %id, record_id, "scan record saved"),
        Err(e) => error!(task_id = %id, error = %e, "failed to save scan record"),
    }

    let status = record.status;
    let error = record.error_message.clone();
    match ctx
        .broker
        .tasks()
        .finish(id, status, Some(record), error)
        .await
    {
        Ok(true) => info!(task_id = %id, %status, "scan finished"),
        Ok(false) => warn!(task_id = %id, %status, "tool finished after cancellation, status stays CANCELLED"),
        Err(e) => error!(task_id = %id, error = %e, "failed status update"),
    }
}

async fn cancel_requested(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|cancelled| *cancelled).await.is_err() {
        // task dropped from the store; nobody can cancel it any more
        std::future::pending::<()>().await;
    }
}

/// Classify the process outcome into the one terminal record for the job.
pub fn build_record(
    job: &ScanJob,
    invocation: &Invocation,
    outcome: ExecOutcome,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
) -> NormalizedScanRecord {
    let mut record = NormalizedScanRecord {
        scan_kind: job.tool,
        status: TaskStatus::Failed,
        raw_output: String::new(),
        parsed: None,
        command: invocation.command_line(),
        options: job.options.clone(),
        started_at,
        completed_at,
        error_message: None,
    };

    match outcome {
        ExecOutcome::Finished(output) => {
            if !output.stderr.trim().is_empty() {
                debug!(tool = %job.tool, exit_code = output.exit_code, stderr = %output.stderr.trim(), "tool wrote to stderr");
            }
            let parsed = normalize(job.tool, &output.stdout);
            match parsed.error() {
                Some(error) => record.error_message = Some(error.to_string()),
                None => record.status = TaskStatus::Completed,
            }
            record.raw_output = output.stdout;
            record.parsed = Some(parsed);
        }
        ExecOutcome::NonZeroExit {
            code,
            stdout,
            stderr,
        } => {
            record.raw_output = stdout;
            record.error_message = Some(ScanError::NonZeroExit { code, stderr }.record_message());
        }
        failed @ (ExecOutcome::TimedOut(_) | ExecOutcome::SpawnFailed(_)) => {
            if let Err(e) = failed.into_result() {
                record.error_message = Some(e.record_message());
            }
        }
    }
    record
}
