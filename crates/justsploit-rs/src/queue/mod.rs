use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, watch, Mutex, RwLock},
    time::Instant,
};
use tracing::{debug, info};

use crate::{
    error::ScanError,
    models::{NormalizedScanRecord, ScanJob, TaskId, TaskSnapshot, TaskStatus},
};

/// Message handed from the dispatcher to exactly one worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: TaskId,
    pub job: ScanJob,
}

#[derive(Debug)]
struct TaskEntry {
    job: ScanJob,
    status: TaskStatus,
    record: Option<NormalizedScanRecord>,
    error: Option<String>,
    submitted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<Instant>,
    cancel: watch::Sender<bool>,
}

impl TaskEntry {
    fn snapshot(&self, task_id: TaskId) -> TaskSnapshot {
        TaskSnapshot {
            task_id,
            tool: self.job.tool,
            target: self.job.target.clone(),
            status: self.status,
            record: self.record.clone(),
            error: self.error.clone(),
            submitted_at: self.submitted_at,
            updated_at: self.updated_at,
        }
    }

    fn apply(&mut self, to: TaskStatus) -> bool {
        if !self.status.can_transition_to(to) {
            return false;
        }
        self.status = to;
        self.updated_at = Utc::now();
        if to.is_terminal() {
            self.finished_at = Some(Instant::now());
        }
        true
    }
}

/// Result store: the single source of truth for task status.
///
/// Every change goes through the state machine on [`TaskStatus`], under the
/// write lock, so no reader ever sees a task move backwards.
#[derive(Debug, Clone)]
pub struct TaskStore {
    entries: Arc<RwLock<HashMap<TaskId, TaskEntry>>>,
    ttl: Duration,
}

impl TaskStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    fn expired(&self, entry: &TaskEntry) -> bool {
        entry
            .finished_at
            .is_some_and(|finished| finished.elapsed() >= self.ttl)
    }

    pub async fn insert(&self, id: TaskId, job: ScanJob) {
        let now = Utc::now();
        let (cancel, _) = watch::channel(false);
        self.entries.write().await.insert(
            id,
            TaskEntry {
                job,
                status: TaskStatus::Pending,
                record: None,
                error: None,
                submitted_at: now,
                updated_at: now,
                finished_at: None,
                cancel,
            },
        );
    }

    pub async fn remove(&self, id: TaskId) {
        self.entries.write().await.remove(&id);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn snapshot(&self, id: TaskId) -> Result<TaskSnapshot, ScanError> {
        let entries = self.entries.read().await;
        match entries.get(&id) {
            Some(entry) if !self.expired(entry) => Ok(entry.snapshot(id)),
            _ => Err(ScanError::NotFound(id)),
        }
    }

    /// PENDING → RUNNING for the worker that got the job off the queue.
    ///
    /// `Ok(None)` means the task was cancelled before anyone picked it up.
    pub async fn claim(&self, id: TaskId) -> Result<Option<watch::Receiver<bool>>, ScanError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(ScanError::NotFound(id))?;
        if entry.apply(TaskStatus::Running) {
            Ok(Some(entry.cancel.subscribe()))
        } else {
            Ok(None)
        }
    }

    /// Record the terminal outcome of an executed job.
    ///
    /// Returns `false` when the task was cancelled in the meantime; the record
    /// is still attached in that case but the status stays CANCELLED.
    pub async fn finish(
        &self,
        id: TaskId,
        to: TaskStatus,
        record: Option<NormalizedScanRecord>,
        error: Option<String>,
    ) -> Result<bool, ScanError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(ScanError::NotFound(id))?;
        let applied = entry.apply(to);
        if applied || (entry.status == TaskStatus::Cancelled && entry.record.is_none()) {
            if record.is_some() {
                entry.record = record;
            }
            if applied {
                entry.error = error;
            }
            entry.updated_at = Utc::now();
        }
        Ok(applied)
    }

    /// Mark a live task CANCELLED and signal whoever is running it.
    ///
    /// `Ok(false)` for tasks that already reached a terminal status.
    pub async fn request_cancel(&self, id: TaskId) -> Result<bool, ScanError> {
        let mut entries = self.entries.write().await;
        let expired = entries.get(&id).map_or(true, |e| self.expired(e));
        if expired {
            return Err(ScanError::NotFound(id));
        }
        let Some(entry) = entries.get_mut(&id) else {
            return Err(ScanError::NotFound(id));
        };
        let was = entry.status;
        if !entry.apply(TaskStatus::Cancelled) {
            return Ok(false);
        }
        entry.error = Some(format!("cancelled while {}", was.to_string().to_lowercase()));
        entry.cancel.send_replace(true);
        Ok(true)
    }

    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !self.expired(entry));
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "purged expired task results");
        }
        purged
    }
}

/// In-process broker: a FIFO shared by every worker plus the result store.
///
/// Built once at startup with [`Broker::connect`] and passed by handle to the
/// dispatcher and workers. [`Broker::close`] stops intake; workers finish
/// whatever is already queued and then see the end of the stream.
#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    tx: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    rx: Mutex<mpsc::UnboundedReceiver<QueuedJob>>,
    tasks: TaskStore,
}

impl Broker {
    pub fn connect(result_ttl: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        info!(result_ttl_secs = result_ttl.as_secs(), "broker connected");
        Self {
            inner: Arc::new(BrokerInner {
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(rx),
                tasks: TaskStore::new(result_ttl),
            }),
        }
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.inner.tasks
    }

    pub async fn enqueue(&self, job: QueuedJob) -> Result<(), ScanError> {
        let tx = self.inner.tx.lock().await;
        let tx = tx
            .as_ref()
            .ok_or_else(|| ScanError::Execution("broker is closed".to_string()))?;
        tx.send(job)
            .map_err(|_| ScanError::Execution("broker is closed".to_string()))
    }

    /// Next job for the calling worker; `None` once closed and drained.
    pub async fn next_job(&self) -> Option<QueuedJob> {
        self.inner.rx.lock().await.recv().await
    }

    pub async fn close(&self) {
        if self.inner.tx.lock().await.take().is_some() {
            info!("broker closed, draining queued jobs");
        }
    }

    #[cfg(test)]
    pub async fn is_closed(&self) -> bool {
        self.inner.tx.lock().await.is_none()
    }
}
