//! Channel sum type with variant-specific configs and per-channel payload
//! formatting. Transport bodies stay behind the `Transport` seam; this
//! module only decides where a message goes and what JSON it carries.

use dm_common::DmError;
use dm_store::models::NotificationChannelRow;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::dispatcher::NotificationMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Telegram {
        bot_token: String,
        chat_id: String,
    },
    Discord {
        webhook_url: String,
    },
    Slack {
        webhook_url: String,
    },
    Pushover {
        app_token: String,
        user_key: String,
    },
    Gotify {
        server_url: String,
        app_token: String,
        #[serde(default)]
        priority: Option<i64>,
    },
    Ntfy {
        server_url: String,
        topic: String,
        #[serde(default)]
        auth_token: Option<String>,
    },
    Smtp {
        host: String,
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password_encrypted: Option<String>,
        from_addr: String,
        to_addrs: Vec<String>,
        #[serde(default)]
        use_tls: bool,
    },
    Webhook {
        url: String,
        #[serde(default)]
        headers: Option<Value>,
    },
}

impl ChannelConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Telegram { .. } => "telegram",
            Self::Discord { .. } => "discord",
            Self::Slack { .. } => "slack",
            Self::Pushover { .. } => "pushover",
            Self::Gotify { .. } => "gotify",
            Self::Ntfy { .. } => "ntfy",
            Self::Smtp { .. } => "smtp",
            Self::Webhook { .. } => "webhook",
        }
    }

    /// Target URL for HTTP-delivered channels. SMTP has none.
    pub fn endpoint(&self) -> Option<String> {
        match self {
            Self::Telegram { bot_token, .. } => Some(format!(
                "https://api.telegram.org/bot{bot_token}/sendMessage"
            )),
            Self::Discord { webhook_url } | Self::Slack { webhook_url } => {
                Some(webhook_url.clone())
            }
            Self::Pushover { .. } => Some("https://api.pushover.net/1/messages.json".to_string()),
            Self::Gotify {
                server_url,
                app_token,
                ..
            } => Some(format!(
                "{}/message?token={app_token}",
                server_url.trim_end_matches('/')
            )),
            Self::Ntfy {
                server_url, topic, ..
            } => Some(format!("{}/{topic}", server_url.trim_end_matches('/'))),
            Self::Smtp { .. } => None,
            Self::Webhook { url, .. } => Some(url.clone()),
        }
    }

    /// JSON body formatted for the channel's API shape.
    pub fn build_payload(&self, msg: &NotificationMessage) -> Value {
        let text = format!("{}\n{}", msg.title, msg.body);
        match self {
            Self::Telegram { chat_id, .. } => json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }),
            Self::Discord { .. } => json!({
                "embeds": [{
                    "title": msg.title,
                    "description": msg.body,
                    "color": severity_color(&msg.severity),
                }]
            }),
            Self::Slack { .. } => json!({
                "text": format!("*{}*\n{}", msg.title, msg.body),
            }),
            Self::Pushover {
                app_token,
                user_key,
            } => json!({
                "token": app_token,
                "user": user_key,
                "title": msg.title,
                "message": msg.body,
                "priority": if msg.severity == "critical" { 1 } else { 0 },
            }),
            Self::Gotify { priority, .. } => json!({
                "title": msg.title,
                "message": msg.body,
                "priority": priority.unwrap_or(5),
            }),
            Self::Ntfy { .. } => json!({
                "title": msg.title,
                "message": msg.body,
                "priority": if msg.severity == "critical" { "high" } else { "default" },
            }),
            Self::Smtp { to_addrs, .. } => json!({
                "subject": msg.title,
                "body": msg.body,
                "to": to_addrs,
            }),
            Self::Webhook { .. } => json!({
                "title": msg.title,
                "message": msg.body,
                "severity": msg.severity,
                "alert_id": msg.alert_id,
                "timestamp": msg.timestamp.to_rfc3339(),
            }),
        }
    }
}

fn severity_color(severity: &str) -> u32 {
    match severity {
        "critical" => 0xE01E5A,
        "warning" => 0xECB22E,
        _ => 0x36C5F0,
    }
}

/// Decode a stored channel row into its typed config.
pub fn channel_from_row(row: &NotificationChannelRow) -> Result<ChannelConfig, DmError> {
    let mut config = row.config.clone();
    if let Some(obj) = config.as_object_mut() {
        obj.insert("type".to_string(), Value::String(row.channel_type.clone()));
    }
    serde_json::from_value(config).map_err(|e| {
        DmError::Validation(format!(
            "Invalid {} channel config for '{}': {e}",
            row.channel_type, row.name
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message() -> NotificationMessage {
        NotificationMessage {
            title: "Container Died: web".into(),
            body: "Container web died with exit code 137".into(),
            severity: "critical".into(),
            alert_id: Some("a1".into()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_channel_from_row() {
        let row = NotificationChannelRow {
            id: 1,
            channel_type: "telegram".into(),
            name: "oncall".into(),
            config: json!({"bot_token": "t", "chat_id": "42"}),
            enabled: true,
        };
        let channel = channel_from_row(&row).unwrap();
        assert_eq!(channel.type_name(), "telegram");
        assert!(channel.endpoint().unwrap().contains("api.telegram.org"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let row = NotificationChannelRow {
            id: 1,
            channel_type: "discord".into(),
            name: "bad".into(),
            config: json!({"not_a_field": true}),
            enabled: true,
        };
        assert!(matches!(
            channel_from_row(&row),
            Err(DmError::Validation(_))
        ));
    }

    #[test]
    fn test_pushover_payload_priority() {
        let channel = ChannelConfig::Pushover {
            app_token: "app".into(),
            user_key: "user".into(),
        };
        let payload = channel.build_payload(&message());
        assert_eq!(payload["priority"], 1);
        assert_eq!(payload["token"], "app");
    }

    #[test]
    fn test_smtp_has_no_endpoint() {
        let channel = ChannelConfig::Smtp {
            host: "mail.example.com".into(),
            port: 587,
            username: None,
            password_encrypted: None,
            from_addr: "dockmon@example.com".into(),
            to_addrs: vec!["ops@example.com".into()],
            use_tls: true,
        };
        assert!(channel.endpoint().is_none());
        let payload = channel.build_payload(&message());
        assert_eq!(payload["to"][0], "ops@example.com");
    }
}
