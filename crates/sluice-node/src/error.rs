use thiserror::Error;

/// Errors surfaced by the fetcher service to the surrounding protocol layer.
///
/// Validation rejects never appear here; they are reported as
/// [`AdmissionOutcome`](crate::sink::AdmissionOutcome) tags.
#[derive(Debug, Error)]
pub enum FetcherError {
    /// The event loop is gone (stopped or never started).
    #[error("fetcher stopped")]
    Stopped,
    /// Configuration rejected by [`FetcherConfig::validate`](crate::config::FetcherConfig::validate).
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    /// The event loop task panicked or was aborted.
    #[error("event loop task failed: {0}")]
    TaskFailed(String),
}

#[cfg(test)]
mod tests {
    use super::FetcherError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(FetcherError::Stopped.to_string(), "fetcher stopped");
        assert_eq!(
            FetcherError::InvalidConfig("add_batch_size must be > 0").to_string(),
            "invalid config: add_batch_size must be > 0"
        );
    }
}
