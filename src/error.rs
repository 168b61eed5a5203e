use thiserror::Error;

/// Failure taxonomy for pipeline tasks. The queue's consume loop routes on
/// `is_permanent`: permanent failures go straight to the dead-letter stream,
/// everything else is retried with exponential backoff.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Programming or schema errors that retrying cannot fix.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Remote answered with an HTTP status; 4xx/5xx are not retried.
    #[error("http status {status} from {url}")]
    Http { status: u16, url: String },

    /// The rendered page shows a different city than the requested geoid.
    #[error("region mismatch: geoid {geoid} renders as {city:?}")]
    RegionMismatch { geoid: String, city: Option<String> },

    /// Listing/product markup did not yield the expected structure.
    #[error("parse failure on {url}: {reason}")]
    Parse { url: String, reason: String },

    /// robots.txt disallows the URL for our user agent.
    #[error("robots.txt disallows {0}")]
    RobotsDisallowed(String),

    /// Page render exceeded its deadline.
    #[error("render timeout after {timeout_ms}ms on {url}")]
    RenderTimeout { url: String, timeout_ms: u64 },

    /// Anything else: network hiccups, storage conflicts, browser crashes.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn permanent(msg: impl Into<String>) -> Self {
        TaskError::Permanent(msg.into())
    }

    /// Permanent failures skip the retry ladder and land in the DLQ.
    pub fn is_permanent(&self) -> bool {
        match self {
            TaskError::Permanent(_) => true,
            TaskError::RobotsDisallowed(_) => true,
            TaskError::Http { status, .. } => (400..600).contains(&(*status as u32)),
            _ => false,
        }
    }
}
