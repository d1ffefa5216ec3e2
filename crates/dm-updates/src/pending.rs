//! Pending-update registry: one entry per in-flight agent-driven update,
//! resolved by the agent's `update_complete` event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dm_common::keys::make_composite_key;
use tokio::sync::oneshot;
use tracing::warn;

/// Terminal signal for one agent-driven update.
#[derive(Debug, Clone)]
pub struct UpdateCompletion {
    pub success: bool,
    pub new_container_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Default)]
pub struct PendingUpdates {
    inner: Mutex<HashMap<String, oneshot::Sender<UpdateCompletion>>>,
}

impl PendingUpdates {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register before sending the command so the completion event cannot
    /// race past the waiter.
    pub fn register(
        &self,
        host_id: &str,
        container_id: &str,
    ) -> oneshot::Receiver<UpdateCompletion> {
        let key = make_composite_key(host_id, container_id);
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), tx)
            .is_some()
        {
            warn!(key, "Replaced an existing pending update entry");
        }
        rx
    }

    pub fn unregister(&self, host_id: &str, container_id: &str) {
        let key = make_composite_key(host_id, container_id);
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }

    /// Resolve the waiter, if any. Returns false for updates nobody awaits.
    pub fn resolve(&self, host_id: &str, container_id: &str, completion: UpdateCompletion) -> bool {
        let key = make_composite_key(host_id, container_id);
        match self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
        {
            Some(tx) => tx.send(completion).is_ok(),
            None => false,
        }
    }

    /// Await the completion with a timeout. The entry is removed either way.
    pub async fn wait_for_completion(
        &self,
        host_id: &str,
        container_id: &str,
        rx: oneshot::Receiver<UpdateCompletion>,
        timeout: Duration,
    ) -> UpdateCompletion {
        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => UpdateCompletion {
                success: false,
                new_container_id: None,
                error: Some("Pending update entry dropped".into()),
            },
            Err(_) => UpdateCompletion {
                success: false,
                new_container_id: None,
                error: Some("Agent update timed out".into()),
            },
        };
        self.unregister(host_id, container_id);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_reaches_waiter() {
        let registry = PendingUpdates::new();
        let rx = registry.register("h1", "abc123def456");

        assert!(registry.resolve(
            "h1",
            "abc123def456",
            UpdateCompletion {
                success: true,
                new_container_id: Some("def456abc123".into()),
                error: None,
            }
        ));

        let completion = registry
            .wait_for_completion("h1", "abc123def456", rx, Duration::from_secs(1))
            .await;
        assert!(completion.success);
        assert_eq!(completion.new_container_id.as_deref(), Some("def456abc123"));
    }

    #[tokio::test]
    async fn test_timeout_cleans_up_entry() {
        let registry = PendingUpdates::new();
        let rx = registry.register("h1", "abc123def456");

        let completion = registry
            .wait_for_completion("h1", "abc123def456", rx, Duration::from_millis(10))
            .await;
        assert!(!completion.success);
        assert!(completion.error.unwrap().contains("timed out"));

        // Entry is gone: resolving now reaches nobody
        assert!(!registry.resolve(
            "h1",
            "abc123def456",
            UpdateCompletion {
                success: true,
                new_container_id: None,
                error: None,
            }
        ));
    }
}
