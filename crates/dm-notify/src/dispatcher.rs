//! Channel-agnostic send with retry/backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dm_common::DmError;
use dm_store::Store;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::channels::{ChannelConfig, channel_from_row};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub title: String,
    pub body: String,
    pub severity: String,
    pub alert_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A queued send: message plus the channel type names the rule selected.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub channel_types: Vec<String>,
    pub message: NotificationMessage,
}

/// Delivery seam. The default implementation POSTs JSON; tests substitute a
/// recording transport. SMTP and other non-HTTP transports plug in here.
pub trait Transport: Send + Sync + 'static {
    fn deliver(
        &self,
        channel: &ChannelConfig,
        payload: &Value,
    ) -> impl Future<Output = Result<(), DmError>> + Send;
}

#[derive(Clone, Default)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl Transport for HttpTransport {
    async fn deliver(&self, channel: &ChannelConfig, payload: &Value) -> Result<(), DmError> {
        let Some(endpoint) = channel.endpoint() else {
            // Non-HTTP transports (SMTP) are delivered by an external relay;
            // the core only records the formatted message.
            info!(channel = channel.type_name(), "No HTTP endpoint, skipping transport");
            return Ok(());
        };
        let mut req = self.http.post(&endpoint).json(payload);
        if let ChannelConfig::Ntfy {
            auth_token: Some(token),
            ..
        } = channel
        {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| DmError::engine(None, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DmError::engine(
                Some(resp.status().as_u16()),
                format!("{} returned {}", channel.type_name(), resp.status()),
            ));
        }
        Ok(())
    }
}

pub struct Dispatcher<T: Transport> {
    store: Store,
    transport: T,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(store: Store, transport: T) -> Self {
        Self { store, transport }
    }

    /// Queue feeding the dispatcher; the alert engine holds the sender so
    /// its evaluations never block on delivery.
    pub fn channel() -> (
        mpsc::UnboundedSender<NotificationRequest>,
        mpsc::UnboundedReceiver<NotificationRequest>,
    ) {
        mpsc::unbounded_channel()
    }

    /// Drain the queue until all senders drop.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<NotificationRequest>) {
        while let Some(request) = rx.recv().await {
            self.dispatch(&request).await;
        }
        info!("Notification dispatcher stopped");
    }

    /// Send a message to every enabled channel of the requested types.
    pub async fn dispatch(&self, request: &NotificationRequest) {
        let rows = match self
            .store
            .get_notification_channels_by_type(&request.channel_types)
        {
            Ok(rows) => rows,
            Err(e) => {
                error!("Failed to load notification channels: {e}");
                return;
            }
        };

        for row in rows {
            let channel = match channel_from_row(&row) {
                Ok(c) => c,
                Err(e) => {
                    warn!(channel = row.name, "Skipping channel with bad config: {e}");
                    continue;
                }
            };
            if let Err(e) = self.send_with_retry(&channel, &request.message).await {
                error!(channel = row.name, "Notification delivery failed: {e}");
            }
        }
    }

    /// Deliver one message with exponential backoff; transient errors retry,
    /// 4xx responses do not (the payload will not get better).
    pub async fn send_with_retry(
        &self,
        channel: &ChannelConfig,
        message: &NotificationMessage,
    ) -> Result<(), DmError> {
        let payload = channel.build_payload(message);
        let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.transport.deliver(channel, &payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if let DmError::Engine {
                        status: Some(status),
                        ..
                    } = &e
                    {
                        if (400..500).contains(status) {
                            return Err(e);
                        }
                    }
                    if attempt < MAX_ATTEMPTS {
                        warn!(
                            channel = channel.type_name(),
                            attempt, "Delivery failed, retrying: {e}"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| DmError::engine(None, "Delivery failed")))
    }

    /// Send a synthetic message through a single channel config, used by the
    /// API's test-channel endpoint.
    pub async fn test_channel(&self, channel: &ChannelConfig) -> Result<(), DmError> {
        let message = NotificationMessage {
            title: "DockMon test notification".into(),
            body: format!("Test message for {} channel", channel.type_name()),
            severity: "info".into(),
            alert_id: None,
            timestamp: Utc::now(),
        };
        self.send_with_retry(channel, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyTransport {
        failures_before_success: AtomicU32,
        delivered: Mutex<Vec<Value>>,
    }

    impl Transport for &'static FlakyTransport {
        async fn deliver(&self, _channel: &ChannelConfig, payload: &Value) -> Result<(), DmError> {
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                return Err(DmError::engine(Some(500), "boom"));
            }
            self.delivered.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn message() -> NotificationMessage {
        NotificationMessage {
            title: "t".into(),
            body: "b".into(),
            severity: "warning".into(),
            alert_id: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let transport: &'static FlakyTransport = Box::leak(Box::new(FlakyTransport {
            failures_before_success: AtomicU32::new(2),
            delivered: Mutex::new(Vec::new()),
        }));
        let store = Store::open_in_memory().unwrap();
        let dispatcher = Dispatcher::new(store, transport);

        let channel = ChannelConfig::Slack {
            webhook_url: "https://hooks.slack.example/x".into(),
        };
        dispatcher
            .send_with_retry(&channel, &message())
            .await
            .unwrap();
        assert_eq!(transport.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_client_error_does_not_retry() {
        struct Reject(AtomicU32);
        impl Transport for &'static Reject {
            async fn deliver(&self, _c: &ChannelConfig, _p: &Value) -> Result<(), DmError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(DmError::engine(Some(404), "gone"))
            }
        }
        let transport: &'static Reject = Box::leak(Box::new(Reject(AtomicU32::new(0))));
        let store = Store::open_in_memory().unwrap();
        let dispatcher = Dispatcher::new(store, transport);
        let channel = ChannelConfig::Slack {
            webhook_url: "https://hooks.slack.example/x".into(),
        };
        assert!(dispatcher.send_with_retry(&channel, &message()).await.is_err());
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
    }
}
