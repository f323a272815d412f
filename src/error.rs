use thiserror::Error;

/// Failure reported by a hardware sink for a single write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("bus transfer failed: {0}")]
    Bus(String),
    #[error("device not available")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Request outside the channel's physical range or frequency bounds.
    /// Nothing was written and the previous state is untouched.
    #[error("rejected: {0}")]
    Validation(String),
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// A generator did not exit within the stop timeout. The owning
    /// supervisor refuses further requests once this has been returned.
    #[error("consistency failure: {0}")]
    Consistency(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Consistency(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
