use agr_net::NetError;
use agr_types::{AgentId, OrgError};
use thiserror::Error;

/// Errors from kernel operations.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("organization error: {0}")]
    Org(#[from] OrgError),

    #[error("network error: {0}")]
    Net(#[from] NetError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("unknown agent kind: {0}")]
    UnknownAgentKind(String),

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("kernel is shutting down")]
    ShuttingDown,
}

impl From<config::ConfigError> for KernelError {
    fn from(e: config::ConfigError) -> Self {
        KernelError::Config(e.to_string())
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
