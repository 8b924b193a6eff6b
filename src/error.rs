use std::net::SocketAddr;

/// Errors surfaced by the VNet manager and its subsystems.
#[derive(Debug, thiserror::Error)]
pub enum VNetError {
    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network stack error: {0}")]
    Stack(String),

    #[error("operation canceled")]
    Canceled,

    #[error("no handler bound for {0}")]
    NoHandler(SocketAddr),

    #[error("handler error: {0}")]
    Handler(#[source] anyhow::Error),

    #[error("{0} error(s) during Run: {1:?}")]
    Aggregate(usize, Vec<VNetError>),
}

impl VNetError {
    /// True if this is the expected, non-actionable result of a cooperative shutdown.
    pub fn is_canceled(&self) -> bool {
        matches!(self, VNetError::Canceled)
    }

    /// Collapse a batch of subsystem results into a single aggregate error, if any failed.
    ///
    /// `Canceled` is elided from the aggregate when any other error is also present, since it is
    /// the expected shape of a forwarder that was torn down deliberately.
    pub fn aggregate(errors: Vec<VNetError>) -> Option<VNetError> {
        let has_other = errors.iter().any(|e| !e.is_canceled());
        let kept: Vec<VNetError> = if has_other {
            errors.into_iter().filter(|e| !e.is_canceled()).collect()
        } else {
            errors
        };

        match kept.len() {
            0 => None,
            1 => kept.into_iter().next(),
            n => Some(VNetError::Aggregate(n, kept)),
        }
    }
}

pub type Result<T> = std::result::Result<T, VNetError>;
