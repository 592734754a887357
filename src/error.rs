use thiserror::Error;

/// Stream outcomes a caller is expected to match on. Setup and configuration problems are
///  reported as `anyhow::Error` instead.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum SlapError {
    /// `pull` waited for its full timeout without any data becoming available
    #[error("timed out waiting for data")]
    TimedOut,
    /// The stream was closed (locally or by the peer) and all buffered data was consumed
    #[error("stream is closed")]
    Closed,
    /// The raw link failed or a frame exhausted its retries. This is terminal.
    #[error("link is dead: {0}")]
    LinkDead(String),
}

pub type SlapResult<T> = Result<T, SlapError>;
