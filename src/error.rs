// =============================================================================
// Error taxonomy for the market-data and signal pipeline
// =============================================================================
//
// Transport failures never appear here: the feed recovers from them locally
// with reconnect-and-backoff, and subscribers only observe a data gap.
// =============================================================================

use thiserror::Error;

/// Errors surfaced to callers of the core APIs.
///
/// Worst-case user-visible behaviour anywhere in the pipeline is a stale price
/// or a missing signal, never a crash.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A malformed tick or payload. Dropped and logged at the point of
    /// occurrence; never delivered to subscribers.
    #[error("failed to parse {field}: {reason}")]
    Parse { field: String, reason: String },

    /// Historical data could not be fetched. The gateway converts this into an
    /// empty result before callers ever see it; the variant exists for
    /// logging and for gateway-internal propagation.
    #[error("historical data fetch failed: {0}")]
    Fetch(String),

    /// An invalid partial config passed to `update_config`. Rejected
    /// synchronously; the prior config remains in effect.
    #[error("invalid signal config: {0}")]
    Config(String),
}

impl CoreError {
    pub fn parse(field: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Parse {
            field: field.into(),
            reason: reason.to_string(),
        }
    }
}
