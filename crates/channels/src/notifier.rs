//! Outbound channel API: the Notifier every funnel component sends through.

use async_trait::async_trait;
use funnel_core::config::ChannelConfig;
use funnel_core::types::{ButtonAction, Menu, OutboundMessage, ParticipantId};
use funnel_core::{FunnelError, FunnelResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Delivers one outbound message to a participant.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> FunnelResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    /// Videos are recognised by an `.mp4` suffix or a `video` marker in the reference.
    pub fn infer(media_ref: &str) -> Self {
        let lower = media_ref.to_ascii_lowercase();
        if lower.ends_with(".mp4") || lower.contains("video") {
            MediaKind::Video
        } else {
            MediaKind::Photo
        }
    }

    fn endpoint(&self) -> &'static str {
        match self {
            MediaKind::Photo => "sendPhoto",
            MediaKind::Video => "sendVideo",
        }
    }

    fn field(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API notifier.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    parse_mode: String,
}

impl TelegramNotifier {
    pub fn new(config: &ChannelConfig) -> FunnelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| FunnelError::Transport(format!("http client: {e}")))?;
        info!(
            api_base = %config.api_base,
            timeout_ms = config.request_timeout_ms,
            "Channel notifier initialized"
        );
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            parse_mode: config.parse_mode.clone(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// `sendMessage`: text plus optional inline keyboard.
    pub async fn send_message(
        &self,
        participant: &ParticipantId,
        text: &str,
        menu: &Menu,
    ) -> FunnelResult<()> {
        let mut body = json!({
            "chat_id": participant.as_str(),
            "text": text,
            "parse_mode": self.parse_mode,
        });
        attach_markup(&mut body, menu);
        self.call("sendMessage", &body).await
    }

    /// `sendPhoto` / `sendVideo` with the text as caption.
    pub async fn send_media(
        &self,
        participant: &ParticipantId,
        media_ref: &str,
        caption: &str,
        menu: &Menu,
    ) -> FunnelResult<()> {
        let kind = MediaKind::infer(media_ref);
        let mut body = json!({
            "chat_id": participant.as_str(),
            "caption": caption,
            "parse_mode": self.parse_mode,
        });
        body[kind.field()] = Value::String(media_ref.to_string());
        attach_markup(&mut body, menu);
        self.call(kind.endpoint(), &body).await
    }

    /// Point the platform's update delivery at our inbound webhook.
    pub async fn register_webhook(&self, url: &str) -> FunnelResult<()> {
        self.call("setWebhook", &json!({ "url": url })).await?;
        info!(url = %url, "Channel webhook registered");
        Ok(())
    }

    async fn call(&self, method: &str, body: &Value) -> FunnelResult<()> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| FunnelError::Transport(format!("{method}: {}", e.without_url())))?;

        let status = response.status();
        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| FunnelError::Transport(format!("{method}: bad response: {e}")))?;

        if !status.is_success() || !parsed.ok {
            return Err(FunnelError::Transport(format!(
                "{method}: {} {}",
                status,
                parsed.description.unwrap_or_default()
            )));
        }
        debug!(method, "Channel API call succeeded");
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &OutboundMessage) -> FunnelResult<()> {
        match message.media.as_deref() {
            Some(media_ref) => {
                self.send_media(&message.participant, media_ref, &message.text, &message.menu)
                    .await
            }
            None => {
                self.send_message(&message.participant, &message.text, &message.menu)
                    .await
            }
        }
    }
}

/// Render a menu as a Telegram `inline_keyboard`.
pub fn inline_keyboard(menu: &Menu) -> Value {
    let rows: Vec<Value> = menu
        .rows
        .iter()
        .map(|row| {
            Value::Array(
                row.iter()
                    .map(|button| match &button.action {
                        ButtonAction::Callback(data) => {
                            json!({ "text": button.label, "callback_data": data })
                        }
                        ButtonAction::Url(url) => json!({ "text": button.label, "url": url }),
                    })
                    .collect(),
            )
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

fn attach_markup(body: &mut Value, menu: &Menu) {
    if !menu.is_empty() {
        body["reply_markup"] = inline_keyboard(menu);
    }
}

/// In-memory notifier that records deliveries; can be switched to fail or
/// made slow.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<OutboundMessage>>,
    failing: Mutex<bool>,
    delay: Option<Duration>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `send` sleeps for `delay` before recording.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every subsequent `send` fails with a transport error while set.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().expect("notifier mutex poisoned") = failing;
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().expect("notifier mutex poisoned").clone()
    }

    pub fn sent_to(&self, participant: &ParticipantId) -> Vec<OutboundMessage> {
        self.sent()
            .into_iter()
            .filter(|m| &m.participant == participant)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().expect("notifier mutex poisoned").len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &OutboundMessage) -> FunnelResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if *self.failing.lock().expect("notifier mutex poisoned") {
            return Err(FunnelError::Transport("recording notifier set to fail".into()));
        }
        self.sent
            .lock()
            .expect("notifier mutex poisoned")
            .push(message.clone());
        Ok(())
    }
}
