//! Correlation-id map for in-flight agent commands. One oneshot per
//! correlation id; resolution writes to the channel, the waiter reads with a
//! timeout, and the sweeper expires entries past a hard maximum age.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::warn;

use crate::protocol::{CommandResult, CommandStatus};

struct PendingEntry {
    agent_id: String,
    tx: oneshot::Sender<CommandResult>,
    started_at: Instant,
}

#[derive(Default)]
pub struct PendingCommands {
    inner: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh correlation id for an outbound command.
    pub fn register(&self, agent_id: &str) -> (String, oneshot::Receiver<CommandResult>) {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            correlation_id.clone(),
            PendingEntry {
                agent_id: agent_id.to_string(),
                tx,
                started_at: Instant::now(),
            },
        );
        (correlation_id, rx)
    }

    /// Resolve a pending command. Returns false for unknown ids (stale
    /// responses after a timeout already consumed the entry).
    pub fn resolve(&self, correlation_id: &str, result: CommandResult) -> bool {
        match self.lock().remove(correlation_id) {
            Some(entry) => {
                let _ = entry.tx.send(result);
                true
            }
            None => {
                warn!(correlation_id, "Response for unknown correlation id");
                false
            }
        }
    }

    /// Drop a pending entry without resolving (send failure cleanup).
    pub fn remove(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    /// Resolve every entry for an agent with a disconnection error.
    pub fn fail_all_for_agent(&self, agent_id: &str) {
        let mut map = self.lock();
        let ids: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.agent_id == agent_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(entry) = map.remove(&id) {
                let _ = entry.tx.send(CommandResult::failure(
                    id,
                    CommandStatus::Disconnected,
                    "Agent disconnected while command was in flight",
                ));
            }
        }
    }

    /// Expire entries older than `max_age`, resolving them as timeouts
    /// rather than deleting silently.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut map = self.lock();
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.started_at.elapsed() > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        let count = expired.len();
        for id in expired {
            if let Some(entry) = map.remove(&id) {
                warn!(correlation_id = id, agent_id = entry.agent_id, "Sweeping stale pending command");
                let _ = entry.tx.send(CommandResult::failure(
                    id,
                    CommandStatus::Timeout,
                    "Command expired in pending registry",
                ));
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_exactly_once_with_matching_id() {
        let pending = PendingCommands::new();
        let (id, rx) = pending.register("a1");

        assert!(pending.resolve(&id, CommandResult::success(id.clone(), None)));
        // Second resolution finds nothing
        assert!(!pending.resolve(&id, CommandResult::success(id.clone(), None)));

        let result = rx.await.unwrap();
        assert_eq!(result.correlation_id, id);
        assert!(result.ok());
    }

    #[tokio::test]
    async fn test_no_cross_talk_between_correlations() {
        let pending = PendingCommands::new();
        let (id_a, rx_a) = pending.register("a1");
        let (id_b, rx_b) = pending.register("a1");

        pending.resolve(&id_b, CommandResult::success(id_b.clone(), None));
        pending.resolve(&id_a, CommandResult::failure(id_a.clone(), CommandStatus::Error, "nope"));

        assert_eq!(rx_a.await.unwrap().status, CommandStatus::Error);
        assert!(rx_b.await.unwrap().ok());
    }

    #[tokio::test]
    async fn test_disconnect_fails_all_for_agent() {
        let pending = PendingCommands::new();
        let (_, rx1) = pending.register("a1");
        let (_, rx2) = pending.register("a1");
        let (other_id, rx_other) = pending.register("a2");

        pending.fail_all_for_agent("a1");

        assert_eq!(rx1.await.unwrap().status, CommandStatus::Disconnected);
        assert_eq!(rx2.await.unwrap().status, CommandStatus::Disconnected);
        assert_eq!(pending.len(), 1);

        pending.resolve(&other_id, CommandResult::success(other_id.clone(), None));
        assert!(rx_other.await.unwrap().ok());
    }

    #[tokio::test]
    async fn test_sweeper_times_out_stale_entries() {
        let pending = PendingCommands::new();
        let (_, rx) = pending.register("a1");

        assert_eq!(pending.sweep(Duration::from_secs(60)), 0);
        assert_eq!(pending.sweep(Duration::ZERO), 1);
        assert_eq!(rx.await.unwrap().status, CommandStatus::Timeout);
        assert!(pending.is_empty());
    }
}
