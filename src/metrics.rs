use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

/// Point-in-time copy of every execution counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub in_progress: u64,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub execution_times: HashMap<Uuid, f64>,
    pub executions_by_language: BTreeMap<String, u64>,
    pub errors: BTreeMap<String, u64>,
    pub last_execution: Option<DateTime<Utc>>,
    pub max_execution_time: f64,
    pub avg_execution_time: f64,
}

/// Execution counters behind a single lock.
///
/// Every operation holds the lock for its whole read-modify-write, so a
/// snapshot never sees `in_progress` released without the matching duration
/// already recorded.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    state: Mutex<MetricsSnapshot>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a new execution. `transition` runs under the same lock, so a
    /// reader going through [`MetricsAggregator::observe`] sees both updates
    /// or neither.
    pub fn begin<T>(&self, language: &str, transition: impl FnOnce() -> T) -> T {
        let mut state = self.lock();
        let applied = transition();
        state.in_progress += 1;
        state.total_executions += 1;
        *state
            .executions_by_language
            .entry(language.to_string())
            .or_insert(0) += 1;
        state.last_execution = Some(Utc::now());
        applied
    }

    /// Records a finished execution, running `transition` under the lock like
    /// [`MetricsAggregator::begin`].
    pub fn end<T>(
        &self,
        exec_id: Uuid,
        duration: f64,
        status: RunStatus,
        error: Option<ErrorKind>,
        transition: impl FnOnce() -> T,
    ) -> T {
        let mut state = self.lock();
        let applied = transition();
        state.in_progress = state.in_progress.saturating_sub(1);
        state.execution_times.insert(exec_id, duration);
        match status {
            RunStatus::Success => state.successful_executions += 1,
            RunStatus::Error => {
                state.failed_executions += 1;
                let kind = error.unwrap_or(ErrorKind::Internal);
                *state.errors.entry(kind.as_str().to_string()).or_insert(0) += 1;
            }
        }

        let (max, sum) = state
            .execution_times
            .values()
            .fold((0.0f64, 0.0f64), |(max, sum), v| (max.max(*v), sum + v));
        state.max_execution_time = max;
        state.avg_execution_time = sum / state.execution_times.len() as f64;
        applied
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().clone()
    }

    /// Runs `read` while holding the lock, so it cannot interleave with a
    /// `begin` or `end` transition.
    pub fn observe<T>(&self, read: impl FnOnce(&MetricsSnapshot) -> T) -> T {
        read(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, MetricsSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
