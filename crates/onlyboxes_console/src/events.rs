//! Per-task completion signals.
//!
//! Every sync/auto submitter and every waiting reader subscribes to the
//! same watch channel for a task; the dispatcher flips it exactly once
//! at the terminal transition, so all concurrent waiters wake together.

use onlyboxes_protocol::TaskId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Clone, Default)]
pub struct TaskEvents {
    inner: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl TaskEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a task's completion signal. Always check the stored
    /// status after subscribing: the terminal write may already have
    /// happened, in which case the channel already reads `true`.
    pub fn subscribe(&self, task_id: &TaskId) -> watch::Receiver<bool> {
        let mut inner = self.inner.lock().expect("task events lock poisoned");
        inner
            .entry(task_id.as_str().to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Wake every waiter for the task. The sender is dropped afterwards;
    /// late subscribers still observe the final `true` through their
    /// receiver clone, and brand-new subscribers re-read the store first.
    pub fn signal_terminal(&self, task_id: &TaskId) {
        let sender = {
            let mut inner = self.inner.lock().expect("task events lock poisoned");
            inner.remove(task_id.as_str())
        };
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
    }

    /// Drop every sender. Pending waiters observe a closed channel and
    /// surface `server_shutdown`.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("task events lock poisoned");
        inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_all_waiters_wake_on_terminal() {
        let events = TaskEvents::new();
        let task_id = TaskId::new();

        let mut rx1 = events.subscribe(&task_id);
        let mut rx2 = events.subscribe(&task_id);
        events.signal_terminal(&task_id);

        tokio::time::timeout(Duration::from_secs(1), rx1.wait_for(|done| *done))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx2.wait_for(|done| *done))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_before_subscribe_is_not_a_deadlock() {
        let events = TaskEvents::new();
        let task_id = TaskId::new();

        // Nothing subscribed yet: the signal is a no-op; later readers
        // must consult the store, which already has the terminal row.
        events.signal_terminal(&task_id);
        let rx = events.subscribe(&task_id);
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels() {
        let events = TaskEvents::new();
        let task_id = TaskId::new();
        let mut rx = events.subscribe(&task_id);
        events.shutdown();

        let result = rx.wait_for(|done| *done).await;
        assert!(result.is_err());
    }
}
