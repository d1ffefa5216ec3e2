//! The in-process event bus. `emit` runs three best-effort, isolated steps
//! in order: persist an event-log row, dispatch to the alert engine, then
//! invoke subscribers and the WebSocket fanout channel. A failure in any
//! step is logged and never reaches the emitter or the other steps.
//!
//! The bus is the only process-wide singleton; it has an explicit
//! `init`/`shutdown` pair. Everything else is constructor-injected.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dm_alerts::{AlertContext, AlertEngine};
use dm_common::event::{Event, EventScope};
use dm_common::keys::parse_composite_key;
use dm_store::Store;
use dm_store::models::EventLogRow;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Envelope pushed to UI WebSocket clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: Value,
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct EventBus {
    store: Store,
    alerts: Arc<AlertEngine>,
    subscribers: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    next_subscription: AtomicU64,
    ws_tx: broadcast::Sender<UiMessage>,
    suppression: RwLock<Vec<regex::Regex>>,
}

impl EventBus {
    pub fn new(store: Store, alerts: Arc<AlertEngine>) -> Self {
        let suppression = store
            .global_settings()
            .map(|s| compile_patterns(&s.event_suppression_patterns))
            .unwrap_or_default();
        Self {
            store,
            alerts,
            subscribers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            ws_tx: broadcast::channel(256).0,
            suppression: RwLock::new(suppression),
        }
    }

    // ── Pub/sub ─────────────────────────────────────────────────

    /// Register a handler for a concrete event type. Safe to call
    /// concurrently; the returned id makes unsubscription idempotent.
    pub fn subscribe(&self, event_type: &str, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.entry(event_type.to_string())
            .or_default()
            .push((id, handler));
        debug!(event_type, "Subscriber registered");
        id
    }

    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(handlers) = subs.get_mut(event_type) {
            handlers.retain(|(hid, _)| *hid != id);
            if handlers.is_empty() {
                subs.remove(event_type);
            }
        }
    }

    /// Receiver for the UI WebSocket fanout.
    pub fn subscribe_ui(&self) -> broadcast::Receiver<UiMessage> {
        self.ws_tx.subscribe()
    }

    /// Push an arbitrary UI envelope (progress events, stats, …).
    pub fn broadcast(&self, message_type: &str, data: Value) {
        let _ = self.ws_tx.send(UiMessage {
            message_type: message_type.to_string(),
            data,
        });
    }

    /// Reload suppression patterns after a settings change.
    pub fn reload_suppression(&self) {
        if let Ok(settings) = self.store.global_settings() {
            *self.suppression.write().unwrap_or_else(|e| e.into_inner()) =
                compile_patterns(&settings.event_suppression_patterns);
        }
    }

    // ── Emit pipeline ───────────────────────────────────────────

    /// Process one event synchronously to completion. Each step is
    /// best-effort: a failing step is logged and the rest still run.
    pub async fn emit(&self, event: Event) {
        debug!(
            event_type = %event.event_type,
            scope = %event.scope_name,
            "Emitting event"
        );

        self.log_to_store(&event);
        self.dispatch_alerts(&event);
        self.notify_subscribers(event).await;
    }

    fn log_to_store(&self, event: &Event) {
        let (title, message) = event.render();

        if self.is_suppressed(&title) || self.is_suppressed(&message) {
            debug!(event_type = %event.event_type, "Event suppressed by pattern");
            return;
        }

        let (category, severity) = event.event_type.log_class();
        let row = EventLogRow {
            id: 0,
            event_type: event.event_type.as_str().to_string(),
            category: category.to_string(),
            severity: severity.to_string(),
            title,
            message,
            scope_type: event.scope_type.as_str().to_string(),
            scope_id: event.scope_id.clone(),
            scope_name: event.scope_name.clone(),
            host_id: event.host_id.clone(),
            host_name: event.host_name.clone(),
            old_state: event
                .data
                .get("old_state")
                .and_then(Value::as_str)
                .map(String::from),
            new_state: event
                .data
                .get("new_state")
                .and_then(Value::as_str)
                .map(String::from),
            timestamp: event.timestamp,
        };
        if let Err(e) = self.store.insert_event_log(&row) {
            error!("Event bus: failed to log event: {e}");
        }
    }

    fn dispatch_alerts(&self, event: &Event) {
        let Some(alert_kind) = event.event_type.alert_kind() else {
            return;
        };
        let payload = event.alert_payload(alert_kind);

        match event.scope_type {
            EventScope::Container => {
                let Some(host_id) = event.host_id.clone() else {
                    return;
                };
                // scope_id is the composite key; keep it for dedup stability
                if parse_composite_key(&event.scope_id).is_none() {
                    warn!(scope_id = event.scope_id, "Container event without composite key");
                }
                let ctx = AlertContext::container(
                    event.scope_id.clone(),
                    event.scope_name.clone(),
                    host_id,
                    event.host_name.clone().unwrap_or_default(),
                );
                self.alerts.evaluate_event(alert_kind, &ctx, &payload);
            }
            EventScope::Host => {
                let ctx = AlertContext::host(event.scope_id.clone(), event.scope_name.clone());
                self.alerts.evaluate_event(alert_kind, &ctx, &payload);
            }
            EventScope::System => {}
        }
    }

    async fn notify_subscribers(&self, event: Event) {
        let handlers: Vec<Handler> = {
            let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            subs.get(event.event_type.as_str())
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            // Each subscriber runs isolated; one failure cannot starve the rest
            handler(event.clone()).await;
        }

        let (title, message) = event.render();
        self.broadcast(
            "event_notification",
            json!({
                "event_type": event.event_type.as_str(),
                "scope_type": event.scope_type.as_str(),
                "scope_id": event.scope_id,
                "scope_name": event.scope_name,
                "host_id": event.host_id,
                "title": title,
                "message": message,
                "data": event.data,
                "timestamp": event.timestamp.to_rfc3339(),
            }),
        );
    }

    fn is_suppressed(&self, text: &str) -> bool {
        self.suppression
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|re| re.is_match(text))
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<regex::Regex> {
    patterns
        .iter()
        .filter_map(|p| match regex::Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = p, "Ignoring invalid suppression pattern: {e}");
                None
            }
        })
        .collect()
}

// ── Process-wide lifecycle ──────────────────────────────────────

static BUS: RwLock<Option<Arc<EventBus>>> = RwLock::new(None);

/// Install the process-wide bus. Later `get()` calls return this instance.
pub fn init(store: Store, alerts: Arc<AlertEngine>) -> Arc<EventBus> {
    let bus = Arc::new(EventBus::new(store, alerts));
    *BUS.write().unwrap_or_else(|e| e.into_inner()) = Some(bus.clone());
    info!("Event bus initialized");
    bus
}

pub fn get() -> Option<Arc<EventBus>> {
    BUS.read().unwrap_or_else(|e| e.into_inner()).clone()
}

pub fn shutdown() {
    *BUS.write().unwrap_or_else(|e| e.into_inner()) = None;
    info!("Event bus shut down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_common::event::EventType;
    use std::sync::atomic::AtomicUsize;

    fn bus() -> EventBus {
        let store = Store::open_in_memory().unwrap();
        let alerts = Arc::new(AlertEngine::new(store.clone(), None));
        EventBus::new(store, alerts)
    }

    fn container_event() -> Event {
        Event::new(
            EventType::ContainerDied,
            EventScope::Container,
            "h1:abc123def456",
            "web",
        )
        .with_host("h1", "edge")
        .with_data(json!({"exit_code": 137}))
    }

    #[tokio::test]
    async fn test_emit_logs_and_fans_out() {
        let bus = bus();
        let mut ui_rx = bus.subscribe_ui();

        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        bus.subscribe(
            "container_died",
            Arc::new(move |_event| {
                let seen = seen.clone();
                Box::pin(async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        bus.emit(container_event()).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let events = bus.store.list_recent_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "container_died");
        assert_eq!(events[0].severity, "error");

        let ui = ui_rx.try_recv().unwrap();
        assert_eq!(ui.message_type, "event_notification");
        assert_eq!(ui.data["scope_name"], "web");
    }

    #[tokio::test]
    async fn test_unsubscribe_idempotent() {
        let bus = bus();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let id = bus.subscribe(
            "container_died",
            Arc::new(move |_| {
                let seen = seen.clone();
                Box::pin(async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        bus.unsubscribe("container_died", id);
        bus.unsubscribe("container_died", id);

        bus.emit(container_event()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_suppressed_event_not_logged_but_still_fans_out() {
        let store = Store::open_in_memory().unwrap();
        let mut settings = store.global_settings().unwrap();
        settings.event_suppression_patterns = vec!["Container Died:.*".into()];
        store.save_global_settings(&settings).unwrap();

        let alerts = Arc::new(AlertEngine::new(store.clone(), None));
        let bus = EventBus::new(store, alerts);
        let mut ui_rx = bus.subscribe_ui();

        bus.emit(container_event()).await;
        assert!(bus.store.list_recent_events(10).unwrap().is_empty());
        // WS fanout still happens
        assert!(ui_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_emit_triggers_event_alert() {
        let store = Store::open_in_memory().unwrap();
        let rule = dm_store::models::AlertRule {
            id: "died_watch".into(),
            name: "container died".into(),
            scope: dm_store::models::RuleScope::Container,
            kind: "state_change".into(),
            severity: "critical".into(),
            enabled: true,
            metric: None,
            operator: None,
            threshold: None,
            clear_threshold: None,
            duration_seconds: None,
            clear_duration_seconds: None,
            occurrences: None,
            grace_seconds: None,
            cooldown_seconds: None,
            notification_cooldown_seconds: None,
            host_selector: None,
            container_selector: None,
            labels: None,
            notify_channels: None,
            depends_on: None,
            version: 1,
            created_at: chrono::Utc::now() - chrono::TimeDelta::hours(1),
        };
        store.create_alert_rule(&rule).unwrap();

        let alerts = Arc::new(AlertEngine::new(store.clone(), None));
        let bus = EventBus::new(store.clone(), alerts);

        bus.emit(container_event()).await;

        let open = store.list_alerts(false).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, "state_change");
        assert_eq!(open[0].scope_id, "h1:abc123def456");
    }
}
