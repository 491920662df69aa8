//! Domain types shared by the funnel, the remarketing scheduler and the
//! payment reconciler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ─── Participants ───────────────────────────────────────────────────────────

/// Opaque, stable identifier of one conversation (one per chat).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for ParticipantId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// Chat platforms send numeric chat ids; other callers send strings.
impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Num(i64),
            Str(String),
        }

        match RawId::deserialize(deserializer)? {
            RawId::Num(n) => Ok(Self(n.to_string())),
            RawId::Str(s) if s.trim().is_empty() => {
                Err(serde::de::Error::custom("participant id must not be empty"))
            }
            RawId::Str(s) => Ok(Self(s)),
        }
    }
}

// ─── Funnel ─────────────────────────────────────────────────────────────────

/// Conversational position of a participant in the sales funnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelState {
    #[default]
    New,
    /// Age gate shown; waiting for the confirm control.
    AgeGate,
    ViewingOffers,
    AwaitingPayment,
}

/// Recognized inbound events. Raw text and callback data are classified
/// into this closed set before they reach the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Start,
    ConfirmAge,
    Tease,
    ShowOffers,
    SelectProduct(String),
    CheckPayment,
    Unrecognized(String),
}

impl InboundEvent {
    pub fn label(&self) -> &'static str {
        match self {
            InboundEvent::Start => "start",
            InboundEvent::ConfirmAge => "confirm_age",
            InboundEvent::Tease => "tease",
            InboundEvent::ShowOffers => "show_offers",
            InboundEvent::SelectProduct(_) => "select_product",
            InboundEvent::CheckPayment => "check_payment",
            InboundEvent::Unrecognized(_) => "unrecognized",
        }
    }
}

/// Callback identifiers carried by inline controls.
pub mod callback {
    pub const CONFIRM_AGE: &str = "age_ok";
    pub const TEASE: &str = "tease";
    pub const SHOW_OFFERS: &str = "show_offers";
    pub const CHECK_PAYMENT: &str = "check_payment";
    pub const PRODUCT_PREFIX: &str = "buy:";

    pub fn select_product(product_id: &str) -> String {
        format!("{PRODUCT_PREFIX}{product_id}")
    }
}

// ─── Remarketing ────────────────────────────────────────────────────────────

/// One of the fixed, ordered idle-triggered nudges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemarketingStage {
    First,
    Second,
    Third,
}

impl RemarketingStage {
    pub const ALL: [RemarketingStage; 3] = [
        RemarketingStage::First,
        RemarketingStage::Second,
        RemarketingStage::Third,
    ];

    pub fn number(&self) -> u8 {
        match self {
            RemarketingStage::First => 1,
            RemarketingStage::Second => 2,
            RemarketingStage::Third => 3,
        }
    }

    /// The last stage; firing it exhausts the lead.
    pub fn is_final(&self) -> bool {
        matches!(self, RemarketingStage::Third)
    }
}

impl fmt::Display for RemarketingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage_{}", self.number())
    }
}

/// Per-participant remarketing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub participant: ParticipantId,
    pub created_at: DateTime<Utc>,
    pub last_interaction_at: DateTime<Utc>,
    pub stages_sent: BTreeSet<RemarketingStage>,
}

impl LeadRecord {
    pub fn new(participant: ParticipantId, now: DateTime<Utc>) -> Self {
        Self {
            participant,
            created_at: now,
            last_interaction_at: now,
            stages_sent: BTreeSet::new(),
        }
    }

    pub fn idle_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_interaction_at).num_seconds()
    }
}

// ─── Orders ─────────────────────────────────────────────────────────────────

/// Order identifier: `{participant}_{product}_{created_ms}`.
///
/// Unique without a central sequence; the ledger bumps the timestamp on the
/// rare same-millisecond collision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn compose(participant: &ParticipantId, product_id: &str, created_ms: i64) -> Self {
        Self(format!("{}_{}_{}", participant, product_id, created_ms))
    }

    /// Parse a string that is exactly an order id.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let mut parts = raw.rsplitn(3, '_');
        let millis = parts.next()?;
        let product = parts.next()?;
        let participant = parts.next()?;
        let well_formed = !participant.is_empty()
            && !product.is_empty()
            && product.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !millis.is_empty()
            && millis.chars().all(|c| c.is_ascii_digit());
        well_formed.then(|| Self(raw.to_string()))
    }

    /// Find an order id embedded in a free-form reference string echoed back
    /// by a payment provider, e.g. `"VIP pack | ref 42_pack20_1700000000000"`.
    pub fn find_in(reference: &str) -> Option<Self> {
        reference
            .split(|c: char| c.is_whitespace() || matches!(c, '|' | ',' | ';' | '#' | '(' | ')'))
            .map(|token| token.trim_matches(|c: char| matches!(c, '.' | ':' | '"' | '\'')))
            .find_map(OrderId::parse)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Single-use mapping from a pending invoice to the participant who asked for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub participant: ParticipantId,
    pub product_id: String,
    pub created_at: DateTime<Utc>,
}

// ─── Catalog ────────────────────────────────────────────────────────────────

/// Immutable catalog entry, defined at process start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub price_amount: f64,
    pub price_currency: String,
}

impl Product {
    pub fn new(id: &str, title: &str, price_amount: f64, price_currency: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            price_amount,
            price_currency: price_currency.to_string(),
        }
    }

    /// Menu label, e.g. `"VIP monthly group — 45 EUR"`.
    pub fn label(&self) -> String {
        format!("{} — {} {}", self.title, self.price_amount, self.price_currency)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    products: Vec<Product>,
}

impl Catalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self { products }
    }

    pub fn get(&self, id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.id == id)
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

// ─── Outbound ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonAction {
    Callback(String),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub action: ButtonAction,
}

impl Button {
    pub fn callback(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: ButtonAction::Callback(data.into()),
        }
    }

    pub fn url(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: ButtonAction::Url(url.into()),
        }
    }
}

/// Inline control layout: one inner vec per keyboard row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Menu {
    pub rows: Vec<Vec<Button>>,
}

impl Menu {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn single(button: Button) -> Self {
        Self {
            rows: vec![vec![button]],
        }
    }

    pub fn rows(rows: Vec<Vec<Button>>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|row| row.is_empty())
    }

    pub fn callbacks(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().flatten().filter_map(|b| match &b.action {
            ButtonAction::Callback(data) => Some(data.as_str()),
            ButtonAction::Url(_) => None,
        })
    }
}

/// What the funnel wants delivered to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub participant: ParticipantId,
    pub text: String,
    /// Media reference (file id or URL); sent as a captioned photo/video when set.
    pub media: Option<String>,
    pub menu: Menu,
}

impl OutboundMessage {
    pub fn text(participant: ParticipantId, text: impl Into<String>) -> Self {
        Self {
            participant,
            text: text.into(),
            media: None,
            menu: Menu::none(),
        }
    }

    pub fn with_menu(mut self, menu: Menu) -> Self {
        self.menu = menu;
        self
    }

    pub fn with_media(mut self, media: Option<String>) -> Self {
        self.media = media;
        self
    }
}
