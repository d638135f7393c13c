use agr_types::KernelId;
use thiserror::Error;

/// Errors of kernel-to-kernel links.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("already connected to {0}")]
    AlreadyConnected(KernelId),

    #[error("refusing to link a kernel to itself")]
    SelfConnection,

    #[error("link closed")]
    LinkClosed,
}

impl From<serde_json::Error> for NetError {
    fn from(e: serde_json::Error) -> Self {
        NetError::Serialization(e.to_string())
    }
}

pub type NetResult<T> = Result<T, NetError>;
