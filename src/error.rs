//! Error types for the relay core.

use std::io;

/// Relay result type
pub type Result<T> = std::result::Result<T, ChatError>;

/// Failures surfaced by the broker, the endpoint and their buffers.
///
/// A readiness wait that expires is not an error; see
/// [`UpdateStatus`](crate::UpdateStatus).
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// A buffer could not grow.
    #[error("out of memory growing a buffer to {0} bytes")]
    Resource(usize),

    /// The address did not resolve or nothing accepted the connection.
    #[error("no reachable address: {0}")]
    NoAddress(String),

    #[error("already started")]
    AlreadyStarted,

    #[error("not started")]
    NotStarted,

    #[error("port {0} is busy")]
    PortBusy(u16),

    #[error("system error: {0}")]
    System(#[from] io::Error),

    /// A relayed frame carried no author separator.
    #[error("malformed frame: missing author separator")]
    MalformedFrame,

    /// Display names travel as a single frame and may not contain framing bytes.
    #[error("invalid display name {0:?}")]
    InvalidName(String),

    /// The connection reached its terminal state and cannot be reused.
    #[error("connection closed")]
    Closed,
}

impl ChatError {
    /// Underlying OS error code, if this is a system failure.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            ChatError::System(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
