use thiserror::Error;

/// Failure taxonomy for the query pipeline.
///
/// The dispatcher matches on these structurally: credential expiry, IP bans
/// and transient errors each require a different corrective action and must
/// never be conflated.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Timeout or connect-level failure on the wire.
    #[error("network error: {0}")]
    Network(String),

    /// Unexpected HTTP status from the upstream.
    #[error("unexpected HTTP status {0}")]
    Protocol(u16),

    /// HTTP 200 but the application envelope reported failure.
    #[error("api error: {0}")]
    Application(String),

    /// Application-level expiry code; credentials must be renegotiated.
    /// Handled inside the dispatcher, never surfaced to callers.
    #[error("credentials expired")]
    AuthExpired,

    /// HTTP 403 from the upstream protection layer.
    #[error("access denied (403)")]
    Ban,

    /// Vision pipeline produced the wrong box or point count.
    #[error("captcha recognition failed: {0}")]
    Recognition(String),

    /// Key or padding malformation; should not occur on valid inputs.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A model artifact failed to load or execute.
    #[error("inference error: {0}")]
    Inference(String),

    /// Every proxy in the pool has been removed.
    #[error("proxy pool exhausted")]
    PoolExhausted,

    /// Credential negotiation exhausted its outer retry bound; the run
    /// cannot continue without credentials.
    #[error("credential negotiation failed: {0}")]
    Negotiation(String),

    /// Retries for one (target, service type) pair ran out; the run
    /// continues with the remaining pairs.
    #[error("query abandoned after {attempts} attempts: {reason}")]
    Abandoned { attempts: usize, reason: String },

    /// Operator interrupt observed; no further requests are issued.
    #[error("cancelled by operator")]
    Cancelled,
}

impl QueryError {
    /// Fatal errors terminate the whole run with a nonzero exit; anything
    /// else abandons at most the current (target, service type) pair.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueryError::Ban | QueryError::PoolExhausted | QueryError::Negotiation(_)
        )
    }
}

impl From<reqwest::Error> for QueryError {
    fn from(e: reqwest::Error) -> Self {
        QueryError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(QueryError::Ban.is_fatal());
        assert!(QueryError::PoolExhausted.is_fatal());
        assert!(QueryError::Negotiation("out of retries".into()).is_fatal());
        assert!(!QueryError::AuthExpired.is_fatal());
        assert!(!QueryError::Network("timeout".into()).is_fatal());
        assert!(!QueryError::Abandoned { attempts: 3, reason: "x".into() }.is_fatal());
    }
}
