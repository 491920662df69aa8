//! Funnel copy and control layouts. Every message optionally carries the
//! configured media reference.

use funnel_core::types::{
    callback, Button, Catalog, Menu, OutboundMessage, ParticipantId, RemarketingStage,
};

#[derive(Debug, Clone, Default)]
pub struct FunnelContent {
    media: Option<String>,
}

impl FunnelContent {
    pub fn new(media: Option<String>) -> Self {
        Self {
            media: media.filter(|m| !m.trim().is_empty()),
        }
    }

    fn message(&self, participant: &ParticipantId, text: &str, menu: Menu) -> OutboundMessage {
        OutboundMessage::text(participant.clone(), text)
            .with_menu(menu)
            .with_media(self.media.clone())
    }

    fn show_offers_button(label: &str) -> Button {
        Button::callback(label, callback::SHOW_OFFERS)
    }

    pub fn age_gate(&self, participant: &ParticipantId) -> OutboundMessage {
        self.message(
            participant,
            "Hey you 😈\n\nI was waiting for you…\nBefore we go on, tell me one thing:",
            Menu::single(Button::callback("✅ I'm 18+", callback::CONFIRM_AGE)),
        )
    }

    pub fn intro(&self, participant: &ParticipantId) -> OutboundMessage {
        self.message(
            participant,
            "Perfect 😏\n\nI'm **Ana**, 19…\n\nSweet face, not so innocent once you get to know me 😇🔥\n\nWant to see more?",
            Menu::rows(vec![
                vec![Button::callback("🔥 I want to see more", callback::TEASE)],
                vec![Self::show_offers_button("💋 Show me the prices")],
            ]),
        )
    }

    pub fn tease(&self, participant: &ParticipantId) -> OutboundMessage {
        self.message(
            participant,
            "Sometimes I wonder if anyone out there can keep up with me…\n\nNo games, no waiting. If that's your thing, you're in the right place 😈",
            Menu::single(Self::show_offers_button("💋 Show me the prices")),
        )
    }

    /// One entry per catalog product.
    pub fn offers(&self, participant: &ParticipantId, catalog: &Catalog) -> OutboundMessage {
        let rows = catalog
            .products()
            .iter()
            .map(|product| {
                vec![Button::callback(
                    product.label(),
                    callback::select_product(&product.id),
                )]
            })
            .collect();
        self.message(
            participant,
            "*Pick your VIP access:*\n\n🔥 Exclusive content\n✨ Natural, no filters\n🔒 Total discretion",
            Menu::rows(rows),
        )
    }

    pub fn payment_prompt(&self, participant: &ParticipantId, payment_url: &str) -> OutboundMessage {
        self.message(
            participant,
            "🔐 Last step!\n\nTap below to pay and join the VIP 💞",
            Menu::rows(vec![
                vec![Button::url("💳 Complete payment", payment_url)],
                vec![Button::callback("🔍 I've paid — check", callback::CHECK_PAYMENT)],
            ]),
        )
    }

    pub fn payments_unavailable(&self, participant: &ParticipantId) -> OutboundMessage {
        self.message(
            participant,
            "⏳ Payments aren't open yet. Check back in a little while 💕",
            Menu::single(Self::show_offers_button("💋 See the prices again")),
        )
    }

    pub fn checking_payment(&self, participant: &ParticipantId) -> OutboundMessage {
        self.message(
            participant,
            "⏳ Checking on it…\nOnce your payment is approved you'll get your access automatically 💕",
            Menu::none(),
        )
    }

    pub fn nudge(&self, participant: &ParticipantId, stage: RemarketingStage) -> OutboundMessage {
        let text = match stage {
            RemarketingStage::First => "👀 Still there? I'm ready for you…",
            RemarketingStage::Second => "🔥 I get restless when you disappear 😈",
            RemarketingStage::Third => "⏳ Last call… after this, only at the next VIP opening",
        };
        self.message(
            participant,
            text,
            Menu::single(Self::show_offers_button("💋 See the prices again")),
        )
    }
}
