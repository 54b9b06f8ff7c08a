use std::sync::Arc;

use tokio::sync::{
    Mutex,
    mpsc::{self, OwnedPermit, Receiver, Sender, error::TrySendError},
};
use uuid::Uuid;

use crate::{error::EngineError, models::ExecutionRequest};

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub exec_id: Uuid,
    pub request: ExecutionRequest,
}

/// Bounded submission queue shared by the worker pool.
#[derive(Clone)]
pub struct Scheduler {
    sender: Sender<QueuedJob>,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
}

impl Scheduler {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Claims a queue slot without waiting, so callers can record the
    /// submission before the job becomes visible to workers.
    pub fn reserve(&self) -> Result<OwnedPermit<QueuedJob>, EngineError> {
        self.sender.clone().try_reserve_owned().map_err(|err| match err {
            TrySendError::Full(_) => EngineError::QueueFull,
            TrySendError::Closed(_) => {
                EngineError::Internal("execution queue is closed".to_string())
            }
        })
    }

    pub fn receiver(&self) -> Arc<Mutex<Receiver<QueuedJob>>> {
        self.receiver.clone()
    }
}
