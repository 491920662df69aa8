use crate::error::{FunnelError, FunnelResult};
use crate::types::{Catalog, Product, RemarketingStage};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Root application configuration. Loaded from environment variables
/// with the prefix `FUNNEL__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
    #[serde(default)]
    pub remarketing: RemarketingConfig,
    /// Public URL the chat platform and payment provider call back into.
    #[serde(default)]
    pub public_base_url: String,
    /// Where paying participants are sent (invite link, group, etc.).
    #[serde(default)]
    pub access_link: String,
    #[serde(default = "default_catalog")]
    pub catalog: Vec<Product>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_channel_api_base")]
    pub api_base: String,
    /// Photo/video attached to every funnel message (file id or URL).
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_register_webhook")]
    pub register_webhook: bool,
}

/// Keyed-hash algorithm used to sign payment notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    Sha256,
    #[default]
    Sha512,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    /// Without a key the payment collaborator counts as unconfigured.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_payment_api_base")]
    pub api_base: String,
    /// Shared secret for notification signatures; checks are skipped when unset.
    #[serde(default)]
    pub ipn_secret: Option<String>,
    #[serde(default)]
    pub signature_algorithm: SignatureAlgorithm,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Unpaid orders are dropped this long after creation.
    #[serde(default = "default_order_ttl_secs")]
    pub order_ttl_secs: u64,
}

/// How a sweep treats several stages that became due at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpPolicy {
    /// Send every due stage, lowest first.
    #[default]
    AllDue,
    /// Send only the highest due stage; lower ones are marked as sent.
    LatestOnly,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemarketingConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_stage_one_secs")]
    pub stage_one_secs: u64,
    #[serde(default = "default_stage_two_secs")]
    pub stage_two_secs: u64,
    #[serde(default = "default_stage_three_secs")]
    pub stage_three_secs: u64,
    #[serde(default)]
    pub catch_up: CatchUpPolicy,
    /// Absolute lifetime of a lead record, counted from its creation.
    #[serde(default = "default_lead_ttl_secs")]
    pub lead_ttl_secs: u64,
}

// Default functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    10000
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_channel_api_base() -> String {
    "https://api.telegram.org".to_string()
}
fn default_parse_mode() -> String {
    "Markdown".to_string()
}
fn default_request_timeout_ms() -> u64 {
    8000
}
fn default_register_webhook() -> bool {
    true
}
fn default_payment_api_base() -> String {
    "https://api.nowpayments.io/v1".to_string()
}
fn default_signature_header() -> String {
    "x-nowpayments-sig".to_string()
}
fn default_sweep_interval_secs() -> u64 {
    4
}
fn default_stage_one_secs() -> u64 {
    300
}
fn default_stage_two_secs() -> u64 {
    900
}
fn default_stage_three_secs() -> u64 {
    3600
}
fn default_lead_ttl_secs() -> u64 {
    86_400
}
fn default_order_ttl_secs() -> u64 {
    172_800
}
fn default_catalog() -> Vec<Product> {
    vec![
        Product::new("pack20", "Photo + video pack", 20.0, "EUR"),
        Product::new("pack45", "VIP monthly group", 45.0, "EUR"),
        Product::new("pack80", "Lifetime access + private chat", 80.0, "EUR"),
    ]
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_channel_api_base(),
            media_ref: None,
            parse_mode: default_parse_mode(),
            request_timeout_ms: default_request_timeout_ms(),
            register_webhook: default_register_webhook(),
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: default_payment_api_base(),
            ipn_secret: None,
            signature_algorithm: SignatureAlgorithm::default(),
            signature_header: default_signature_header(),
            request_timeout_ms: default_request_timeout_ms(),
            order_ttl_secs: default_order_ttl_secs(),
        }
    }
}

impl Default for RemarketingConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            stage_one_secs: default_stage_one_secs(),
            stage_two_secs: default_stage_two_secs(),
            stage_three_secs: default_stage_three_secs(),
            catch_up: CatchUpPolicy::default(),
            lead_ttl_secs: default_lead_ttl_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            channel: ChannelConfig::default(),
            payment: PaymentConfig::default(),
            remarketing: RemarketingConfig::default(),
            public_base_url: String::new(),
            access_link: String::new(),
            catalog: default_catalog(),
        }
    }
}

impl ChannelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl PaymentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Key present and non-blank.
    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

impl RemarketingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Idle thresholds in ascending stage order.
    pub fn thresholds(&self) -> [(RemarketingStage, u64); 3] {
        [
            (RemarketingStage::First, self.stage_one_secs),
            (RemarketingStage::Second, self.stage_two_secs),
            (RemarketingStage::Third, self.stage_three_secs),
        ]
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("FUNNEL")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.catalog.clone())
    }

    /// Reject configurations the service cannot run with. Called once at
    /// startup, before any traffic is served.
    pub fn validate(&self) -> FunnelResult<()> {
        if self.channel.bot_token.trim().is_empty() {
            return Err(FunnelError::ConfigurationMissing(
                "channel.bot_token".to_string(),
            ));
        }
        if self.public_base_url.trim().is_empty() {
            return Err(FunnelError::ConfigurationMissing(
                "public_base_url".to_string(),
            ));
        }
        let base = url::Url::parse(&self.public_base_url).map_err(|e| {
            FunnelError::InvalidConfig(format!("public_base_url: {e}"))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(FunnelError::InvalidConfig(
                "public_base_url must be an http(s) URL".to_string(),
            ));
        }
        if self.access_link.trim().is_empty() {
            return Err(FunnelError::ConfigurationMissing("access_link".to_string()));
        }
        if self.catalog.is_empty() {
            return Err(FunnelError::ConfigurationMissing("catalog".to_string()));
        }

        let mut seen = HashSet::new();
        for product in &self.catalog {
            let id_ok = !product.id.is_empty()
                && product
                    .id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-');
            if !id_ok {
                return Err(FunnelError::InvalidConfig(format!(
                    "product id `{}` must be non-empty ASCII alphanumerics or '-'",
                    product.id
                )));
            }
            if !seen.insert(product.id.as_str()) {
                return Err(FunnelError::InvalidConfig(format!(
                    "duplicate product id `{}`",
                    product.id
                )));
            }
            if product.price_amount.is_nan() || product.price_amount <= 0.0 {
                return Err(FunnelError::InvalidConfig(format!(
                    "product `{}` must have a positive price",
                    product.id
                )));
            }
        }

        let thresholds = self.remarketing.thresholds();
        if thresholds[0].1 == 0 || thresholds.windows(2).any(|w| w[0].1 >= w[1].1) {
            return Err(FunnelError::InvalidConfig(
                "remarketing stage thresholds must be positive and strictly ascending"
                    .to_string(),
            ));
        }
        if self.remarketing.sweep_interval_secs == 0 {
            return Err(FunnelError::InvalidConfig(
                "remarketing.sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Callback URL the payment provider notifies.
    pub fn payment_callback_url(&self) -> String {
        format!(
            "{}/webhook/payment",
            self.public_base_url.trim_end_matches('/')
        )
    }

    /// Webhook URL registered with the chat platform.
    pub fn channel_webhook_url(&self) -> String {
        format!(
            "{}/webhook/channel",
            self.public_base_url.trim_end_matches('/')
        )
    }
}
