use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::{ExecutionRecord, ExecutionStatus, Outcome};

struct StoredExecution {
    record: ExecutionRecord,
    done: watch::Sender<bool>,
}

/// Execution records keyed by exec id. Records are never evicted.
#[derive(Default)]
pub struct ResultStore {
    records: DashMap<Uuid, StoredExecution>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pending(&self, record: ExecutionRecord) {
        let (done, _) = watch::channel(false);
        self.records
            .insert(record.exec_id, StoredExecution { record, done });
    }

    pub fn get(&self, exec_id: &Uuid) -> Option<ExecutionRecord> {
        self.records.get(exec_id).map(|e| e.record.clone())
    }

    /// Stores the outcome and flips the record to `Completed`.
    ///
    /// Returns `false` without touching anything when the id is unknown or
    /// the record already completed.
    pub fn complete(&self, exec_id: &Uuid, outcome: Outcome, duration: f64) -> bool {
        let Some(mut entry) = self.records.get_mut(exec_id) else {
            return false;
        };
        if entry.record.status == ExecutionStatus::Completed {
            return false;
        }
        entry.record.status = ExecutionStatus::Completed;
        entry.record.result = Some(outcome);
        entry.record.duration = Some(duration);
        entry.record.completed_at = Some(Utc::now());
        entry.done.send_replace(true);
        true
    }

    pub fn subscribe(&self, exec_id: &Uuid) -> Option<watch::Receiver<bool>> {
        self.records.get(exec_id).map(|e| e.done.subscribe())
    }

    pub fn pending_count(&self) -> usize {
        self.records
            .iter()
            .filter(|e| e.record.status == ExecutionStatus::Pending)
            .count()
    }
}
