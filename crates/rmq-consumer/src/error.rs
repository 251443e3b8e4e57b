use rmq_membership::MembershipError;
use rmq_store::StoreError;
use thiserror::Error;

/// Client and container level failures.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Already started")]
    AlreadyStarted,

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Why a single consumption attempt failed.
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// The body cannot be turned into the handler's parameter type. Never
    /// retried.
    #[error("Body does not match handler type: {0}")]
    TypeMismatch(String),

    #[error("Handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl ConsumeError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConsumeError::TypeMismatch(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConsumeError::TypeMismatch(_) => "type_mismatch",
            ConsumeError::Handler(_) => "handler",
            ConsumeError::Panicked(_) => "panic",
        }
    }
}
