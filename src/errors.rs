// =============================================================================
// Engine Errors — typed failure kinds shared across the execution plane
// =============================================================================
//
// The venue gateway consumes retryable network failures internally; every
// other kind surfaces to the caller. The OMS converts `VenueRejected` into
// order status Rejected instead of propagating it upward.
// =============================================================================

use thiserror::Error;

/// Failure kinds produced by the execution plane.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transient network / rate-limit failure. Only the venue gateway sees
    /// this variant; it is retried internally and never escapes unless the
    /// retry budget is exhausted.
    #[error("retryable network error: {0}")]
    RetryableNetwork(String),

    /// The venue returned a non-retryable rejection (4xx other than 429).
    #[error("venue rejected request: {0}")]
    VenueRejected(String),

    /// A local constraint was violated before anything was sent.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// The sizing service could not produce a venue-valid size.
    #[error("sizing failed for {symbol}: {reason}")]
    SizingFailed { symbol: String, reason: String },

    /// Symbol metadata could not be fetched from the venue.
    #[error("symbol info fetch failed for {symbol}: {reason}")]
    SymbolInfoFetchFailed { symbol: String, reason: String },

    /// No venue is registered and active in the unified order manager.
    #[error("no active venue registered")]
    NoActiveVenue,

    /// An allocation policy was misconfigured for the current active set.
    #[error("invalid allocation config: {0}")]
    InvalidAllocation(String),

    /// A caller-supplied deadline elapsed before the operation completed.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl EngineError {
    /// Whether the gateway retry loop may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableNetwork(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(EngineError::RetryableNetwork("429".into()).is_retryable());
        assert!(!EngineError::VenueRejected("bad qty".into()).is_retryable());
        assert!(!EngineError::NoActiveVenue.is_retryable());
        assert!(!EngineError::Timeout("deadline".into()).is_retryable());
    }

    #[test]
    fn display_includes_symbol_context() {
        let err = EngineError::SizingFailed {
            symbol: "BTC/USDT".into(),
            reason: "no ticker price".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("BTC/USDT"));
        assert!(msg.contains("no ticker price"));
    }
}
