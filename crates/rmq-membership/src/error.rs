use thiserror::Error;

#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("Store error: {0}")]
    Store(#[from] rmq_store::StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MembershipError>;
