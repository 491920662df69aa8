use thiserror::Error;

pub type FunnelResult<T> = Result<T, FunnelError>;

#[derive(Error, Debug)]
pub enum FunnelError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Missing configuration: {0}")]
    ConfigurationMissing(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Payment notification rejected: signature mismatch")]
    UnauthorizedNotification,

    #[error("Unknown order: {0}")]
    UnknownOrder(String),

    #[error("Unknown product: {0}")]
    UnknownProduct(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FunnelError {
    /// Errors the funnel degrades around instead of surfacing to a participant.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FunnelError::Transport(_)
                | FunnelError::ConfigurationMissing(_)
                | FunnelError::UnknownOrder(_)
        )
    }
}
