use thiserror::Error;

/// Status taxonomy surfaced by the driver.
///
/// Device-facing operations return these directly; cross-thread trampolines
/// forward the worker's status verbatim through the reply handle.
#[derive(Error, Debug)]
pub enum NatError {
    #[error("network is down")]
    NetDown,

    #[error("resource busy, try again")]
    TryAgain,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("no buffer space available")]
    NoBufferSpace,

    #[error("port forward setup failed: {0}")]
    RedirSetup(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("wait interrupted")]
    Interrupted,

    #[error("wait timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NatError {
    /// Whether a failed device wait may be ignored silently.
    pub(crate) fn is_benign_wait(&self) -> bool {
        matches!(self, NatError::Timeout | NatError::Interrupted)
    }
}
