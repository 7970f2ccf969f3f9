//! Outbound operator notifications: a chat webhook (Discord-style embeds)
//! and PagerDuty events v2.
//!
//! Sending never fails the caller. Every delivery is retried with jittered
//! exponential backoff; a delivery that still fails is logged, and a short
//! fallback message is attempted on the chat webhook.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::{Value, json};

use crate::config::WebhookConfig;
use crate::error::NotifyError;

/// Embed colour used for every notification (red).
const EMBED_COLOR: u32 = 15_548_997;
const MAX_NAME_CHARS: usize = 256;
const NAME_KEEP_CHARS: usize = 250;
const MAX_VALUE_CHARS: usize = 6000;
const VALUE_KEEP_CHARS: usize = 5500;
const FIELD_CHARS: usize = 1020;
const CUT_OFF_NOTICE: &str = " `Cut-off due to exceeding maximum character limit`";
const NO_VALUE: &str = "no value";

/// PagerDuty severity, derived from the notification flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
}

/// One embed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    pub value: String,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A message for the operators.
#[derive(Debug, Clone, Default)]
pub struct Notification {
    pub name: String,
    pub value: Option<String>,
    pub content: Option<String>,
    pub component: Option<String>,
    pub info: Vec<Field>,
    /// Mention the on-call id in chat.
    pub ping: bool,
    /// Page through PagerDuty as critical.
    pub critical: bool,
}

impl Notification {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn ping(mut self, ping: bool) -> Self {
        self.ping = ping;
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_info(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.push(Field::new(name, value));
        self
    }

    pub fn severity(&self) -> Severity {
        if self.critical {
            Severity::Critical
        } else if self.ping {
            Severity::Error
        } else {
            Severity::Warning
        }
    }
}

/// A notification after size limits have been applied.
#[derive(Debug, Clone, PartialEq)]
struct Prepared {
    name: String,
    value: String,
    username: String,
    content: String,
    /// Caller info, then continuation fields, then the timestamp.
    fields: Vec<Field>,
    timestamp: String,
    severity: Severity,
    component: Option<String>,
    ping: bool,
}

fn take_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn skip_chars(s: &str, n: usize) -> String {
    s.chars().skip(n).collect()
}

/// Posts notifications to the configured targets.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl Notifier {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// At least one delivery target is configured.
    pub fn is_enabled(&self) -> bool {
        self.config.webhook_url.is_some() || self.config.pagerduty_routing_key.is_some()
    }

    fn prepare(&self, notification: Notification) -> Prepared {
        let severity = notification.severity();
        let Notification {
            mut name,
            value,
            content,
            component,
            info,
            ping,
            ..
        } = notification;
        let mut value = value.unwrap_or_else(|| NO_VALUE.to_string());

        if name.chars().count() >= MAX_NAME_CHARS {
            value = skip_chars(&name, NAME_KEEP_CHARS) + &value;
            name = take_chars(&name, NAME_KEEP_CHARS) + "...";
        }

        let mut username = self.config.node_name.clone();
        if let Some(component) = &component {
            if username.len() + component.len() < 32 {
                username = format!("{username}:{component}");
            }
        }

        if value.chars().count() >= MAX_VALUE_CHARS {
            value = take_chars(&value, VALUE_KEEP_CHARS) + CUT_OFF_NOTICE;
        }

        let chars: Vec<char> = value.chars().collect();
        let mut chunks = chars.chunks(FIELD_CHARS).map(|c| c.iter().collect::<String>());
        let head = chunks.next().unwrap_or_default();

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut fields = info;
        fields.extend(
            chunks
                .enumerate()
                .map(|(i, chunk)| Field::new(format!("Continuation {}", i + 1), chunk)),
        );
        fields.push(Field::new("Timestamp", timestamp.clone()));

        let mention = match (&self.config.ping_id, ping) {
            (Some(id), true) => id.as_str(),
            _ => "",
        };
        let content = format!("{}{mention}", content.unwrap_or_default());

        Prepared {
            name,
            value: head,
            username,
            content,
            fields,
            timestamp,
            severity,
            component,
            ping,
        }
    }

    fn chat_payload(p: &Prepared) -> Value {
        let mut fields = vec![Field::new(p.name.clone(), p.value.clone())];
        fields.extend(p.fields.iter().cloned());
        json!({
            "content": p.content,
            "username": p.username,
            "embeds": [{
                "color": EMBED_COLOR,
                "fields": fields,
                "timestamp": p.timestamp,
            }],
        })
    }

    fn pagerduty_payload(p: &Prepared, routing_key: &str, attempt: u32) -> Value {
        let summary = if p.value == NO_VALUE {
            format!("{} ", p.name)
        } else {
            format!("{} {}", p.name, p.value)
        };

        let mut details = serde_json::Map::new();
        details.insert("value".into(), Value::String(p.value.clone()));
        for field in &p.fields {
            details.insert(field.name.clone(), Value::String(field.value.clone()));
        }

        // Shed detail on later attempts in case the payload itself is rejected.
        let custom_details = if attempt >= 4 {
            Value::String(p.value.clone())
        } else {
            Value::Object(details)
        };
        let summary = if attempt >= 6 { p.name.clone() } else { summary };

        json!({
            "routing_key": routing_key,
            "event_action": "trigger",
            "payload": {
                "summary": summary,
                "severity": p.severity,
                "source": p.username,
                "component": p.component,
                "custom_details": custom_details,
            },
        })
    }

    /// Deliver `notification` to every configured target.
    pub async fn send(&self, notification: Notification) {
        let prepared = self.prepare(notification);
        tracing::error!(
            name = %prepared.name,
            severity = ?prepared.severity,
            "[webhook] {}",
            prepared.value
        );

        if let Some(key) = &self.config.pagerduty_routing_key {
            let url = self.config.pagerduty_url.clone();
            let result = self
                .post_with_retry(&url, |attempt| {
                    Self::pagerduty_payload(&prepared, key.expose_secret(), attempt)
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Unable to post notification to PagerDuty");
                let mention = if prepared.severity == Severity::Critical {
                    self.config.ping_id.as_deref().unwrap_or_default()
                } else {
                    ""
                };
                let detail = take_chars(&e.to_string(), 1000);
                self.fallback(
                    &prepared,
                    format!("{mention} Unable to post error to pagerduty\n{detail}"),
                )
                .await;
            }
        }

        match &self.config.webhook_url {
            Some(url) => {
                let payload = Self::chat_payload(&prepared);
                let result = self
                    .post_with_retry(url.expose_secret(), |_| payload.clone())
                    .await;
                if let Err(e) = result {
                    tracing::error!(error = %e, "Unable to post notification to webhook");
                    tracing::debug!(body = %payload, "Webhook request body");
                    let mention = if prepared.ping {
                        self.config.ping_id.as_deref().unwrap_or_default()
                    } else {
                        ""
                    };
                    self.fallback(&prepared, format!("{mention} Unable to post error to webhook"))
                        .await;
                }
            }
            None => tracing::warn!("Notification not posted to webhook"),
        }
    }

    /// Single best-effort post of a plain message to the chat webhook.
    async fn fallback(&self, prepared: &Prepared, content: String) {
        let Some(url) = &self.config.webhook_url else {
            return;
        };
        let body = json!({ "content": content, "username": prepared.username });
        if let Err(e) = self.post_once(url.expose_secret(), &body).await {
            tracing::error!(error = %e, "Fallback webhook post failed");
        }
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }

    async fn post_with_retry<F>(&self, url: &str, body: F) -> Result<(), NotifyError>
    where
        F: Fn(u32) -> Value,
    {
        let mut attempt = 1;
        loop {
            match self.post_once(url, &body(attempt)).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt > self.config.max_retries => return Err(e),
                Err(e) => {
                    let delay = backoff(self.config.retry_base_delay, attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Notification post failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// `base * 2^(attempt-1)`, capped at one hour, scaled by a random factor
/// in `[1, 2)`.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(20));
    let capped = exp.min(Duration::from_secs(3600));
    capped.mul_f64(rand::thread_rng().gen_range(1.0..2.0))
}
