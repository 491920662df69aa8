//! Inbound update parsing and event classification.
//!
//! Accepts native chat-platform updates (`message` / `callback_query`) as
//! well as the flat `{participantId, text}` / `{participantId, data}` shape,
//! then maps the raw text or callback data onto `InboundEvent`.

use funnel_core::types::{callback, InboundEvent, ParticipantId};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPayload {
    Text(String),
    Callback(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundUpdate {
    pub participant: ParticipantId,
    pub payload: InboundPayload,
}

impl InboundUpdate {
    /// Parse a webhook body. `Ok(None)` means a well-formed update that
    /// carries nothing the funnel reacts to (edits, joins, ...).
    pub fn parse(body: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        let raw: RawUpdate = serde_json::from_slice(body)?;
        Ok(raw.into_update())
    }

    pub fn event(&self) -> InboundEvent {
        classify(&self.payload)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawUpdate {
    Direct(DirectEvent),
    Platform(PlatformUpdate),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectEvent {
    participant_id: ParticipantId,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlatformUpdate {
    #[serde(default)]
    message: Option<PlatformMessage>,
    #[serde(default)]
    callback_query: Option<PlatformCallback>,
}

#[derive(Debug, Deserialize)]
struct PlatformMessage {
    chat: PlatformChat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlatformCallback {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    message: Option<PlatformMessage>,
}

#[derive(Debug, Deserialize)]
struct PlatformChat {
    id: ParticipantId,
}

impl RawUpdate {
    fn into_update(self) -> Option<InboundUpdate> {
        match self {
            RawUpdate::Direct(direct) => {
                let payload = match (direct.data, direct.text) {
                    (Some(data), _) => InboundPayload::Callback(data),
                    (None, Some(text)) => InboundPayload::Text(text),
                    (None, None) => return None,
                };
                Some(InboundUpdate {
                    participant: direct.participant_id,
                    payload,
                })
            }
            RawUpdate::Platform(update) => {
                if let Some(cb) = update.callback_query {
                    let message = cb.message?;
                    return Some(InboundUpdate {
                        participant: message.chat.id,
                        payload: InboundPayload::Callback(cb.data.unwrap_or_default()),
                    });
                }
                // Non-text messages (stickers, photos) still count as activity.
                let message = update.message?;
                Some(InboundUpdate {
                    participant: message.chat.id,
                    payload: InboundPayload::Text(message.text.unwrap_or_default()),
                })
            }
        }
    }
}

/// Map raw text or callback data onto the closed event set.
pub fn classify(payload: &InboundPayload) -> InboundEvent {
    match payload {
        InboundPayload::Callback(data) => classify_callback(data),
        InboundPayload::Text(text) => classify_text(text),
    }
}

fn classify_callback(data: &str) -> InboundEvent {
    match data {
        callback::CONFIRM_AGE => InboundEvent::ConfirmAge,
        callback::TEASE => InboundEvent::Tease,
        callback::SHOW_OFFERS => InboundEvent::ShowOffers,
        callback::CHECK_PAYMENT => InboundEvent::CheckPayment,
        other => match other.strip_prefix(callback::PRODUCT_PREFIX) {
            Some(product) if !product.is_empty() => {
                InboundEvent::SelectProduct(product.to_string())
            }
            _ => InboundEvent::Unrecognized(other.to_string()),
        },
    }
}

fn classify_text(text: &str) -> InboundEvent {
    let normalized = text.trim().to_lowercase();
    // Commands may arrive as `/start@SomeBot payload`.
    let command = normalized
        .strip_prefix('/')
        .map(|c| c.split(['@', ' ']).next().unwrap_or_default())
        .unwrap_or(normalized.as_str());

    match command {
        "start" => InboundEvent::Start,
        "offers" | "show offers" | "prices" => InboundEvent::ShowOffers,
        "check" | "check payment" | "paid" => InboundEvent::CheckPayment,
        _ => InboundEvent::Unrecognized(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_platform_message() {
        let body = br#"{"update_id":1,"message":{"message_id":5,"chat":{"id":42,"type":"private"},"text":"/start"}}"#;
        let update = InboundUpdate::parse(body).unwrap().unwrap();
        assert_eq!(update.participant, ParticipantId::from(42));
        assert_eq!(update.event(), InboundEvent::Start);
    }

    #[test]
    fn test_parse_platform_callback() {
        let body = br#"{"update_id":2,"callback_query":{"id":"cb","data":"buy:pack20","message":{"chat":{"id":-7}}}}"#;
        let update = InboundUpdate::parse(body).unwrap().unwrap();
        assert_eq!(update.participant.as_str(), "-7");
        assert_eq!(update.event(), InboundEvent::SelectProduct("pack20".into()));
    }

    #[test]
    fn test_parse_direct_shapes() {
        let text = InboundUpdate::parse(br#"{"participantId":"A","text":"start"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(text.payload, InboundPayload::Text("start".into()));

        let data = InboundUpdate::parse(br#"{"participantId":"A","data":"age_ok"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(data.event(), InboundEvent::ConfirmAge);
    }

    #[test]
    fn test_irrelevant_update_is_none() {
        let body = br#"{"update_id":3,"edited_message":{"chat":{"id":1},"text":"x"}}"#;
        assert!(InboundUpdate::parse(body).unwrap().is_none());
    }

    #[test]
    fn test_malformed_body_is_error() {
        assert!(InboundUpdate::parse(b"not json").is_err());
    }

    #[test]
    fn test_non_text_message_counts_as_unrecognized_text() {
        let body = br#"{"update_id":4,"message":{"chat":{"id":9},"sticker":{}}}"#;
        let update = InboundUpdate::parse(body).unwrap().unwrap();
        assert_eq!(update.event(), InboundEvent::Unrecognized(String::new()));
    }

    #[test]
    fn test_callback_without_data_is_unrecognized() {
        let body = br#"{"update_id":5,"callback_query":{"id":"cb","message":{"chat":{"id":11}}}}"#;
        let update = InboundUpdate::parse(body).unwrap().unwrap();
        assert_eq!(update.participant, ParticipantId::from(11));
        assert_eq!(update.payload, InboundPayload::Callback(String::new()));
        assert_eq!(update.event(), InboundEvent::Unrecognized(String::new()));
    }

    #[test]
    fn test_text_commands() {
        let classify_text = |t: &str| classify(&InboundPayload::Text(t.into()));
        assert_eq!(classify_text("/start@FunnelBot"), InboundEvent::Start);
        assert_eq!(classify_text("  Show Offers "), InboundEvent::ShowOffers);
        assert_eq!(classify_text("/check"), InboundEvent::CheckPayment);
        assert_eq!(
            classify_text("hello there"),
            InboundEvent::Unrecognized("hello there".into())
        );
    }

    #[test]
    fn test_unknown_callbacks() {
        let classify_cb = |d: &str| classify(&InboundPayload::Callback(d.into()));
        assert_eq!(classify_cb("buy:"), InboundEvent::Unrecognized("buy:".into()));
        assert_eq!(classify_cb("mystery"), InboundEvent::Unrecognized("mystery".into()));
        assert_eq!(classify_cb("tease"), InboundEvent::Tease);
    }
}
