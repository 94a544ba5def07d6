//! Supervision for a session's pipeline tasks.
//!
//! Tasks spawned into a group report their result on completion; the
//! group's waiter resolves with the first failure so the session can tear
//! everything down. Partial operation is never acceptable: one failed
//! task cancels the whole session.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::errors::{SessionError, SessionResult};

pub struct TaskGroup {
    results_tx: mpsc::UnboundedSender<(&'static str, SessionResult<()>)>,
    handles: Mutex<Vec<AbortHandle>>,
}

pub struct TaskWaiter {
    results_rx: mpsc::UnboundedReceiver<(&'static str, SessionResult<()>)>,
}

impl TaskGroup {
    pub fn new() -> (Self, TaskWaiter) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        (
            TaskGroup {
                results_tx,
                handles: Mutex::new(Vec::new()),
            },
            TaskWaiter { results_rx },
        )
    }

    /// Spawn a supervised task. The returned handle can abort just this
    /// task (used for interrupting an in-flight response).
    pub fn spawn<F>(&self, name: &'static str, future: F) -> AbortHandle
    where
        F: Future<Output = SessionResult<()>> + Send + 'static,
    {
        let results_tx = self.results_tx.clone();
        let handle = tokio::spawn(async move {
            let result = future.await;
            // An aborted task never reports; that is the point.
            let _ = results_tx.send((name, result));
        });
        let abort = handle.abort_handle();
        self.handles.lock().push(abort.clone());
        abort
    }

    /// Cancel every task in the group.
    pub fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl TaskWaiter {
    /// Resolve with the first task failure. Successful completions are
    /// logged and waited past; the waiter pends while everything is
    /// healthy.
    pub async fn wait(&mut self) -> SessionError {
        loop {
            match self.results_rx.recv().await {
                Some((name, Ok(()))) => {
                    debug!(task = name, "Session task completed");
                }
                Some((name, Err(error))) => {
                    debug!(task = name, %error, "Session task failed");
                    return error;
                }
                // All senders gone: the group itself was dropped. Treat as
                // an internal fault rather than spinning.
                None => return SessionError::Internal(anyhow::anyhow!("task group dropped")),
            }
        }
    }
}
