//! Error types for block-metrics operations.
//!
//! This module defines one error enumeration using `thiserror`. A small set of
//! sentinel variants (`NotFound`, `Conflict`, `Throttled`, `FailedResponse`,
//! `Cancelled`) classifies failures across the storage, RPC, and sync layers;
//! the `Context` variant chains descriptions on top of any cause, and
//! [`MetricsError::is`] tests a chained error against a sentinel.

use thiserror::Error;

/// Custom error type for block-metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The requested entity does not exist, or there is no more data.
    #[error("not found")]
    NotFound,

    /// The operation violates a database constraint or duplicates an entity.
    #[error("conflict")]
    Conflict,

    /// The remote endpoint rejected the request due to rate limiting.
    #[error("throttled")]
    Throttled,

    /// The RPC endpoint answered with an error object or unexpected status.
    #[error("failed response")]
    FailedResponse,

    /// The surrounding cancellation scope was signalled.
    #[error("cancelled")]
    Cancelled,

    /// Errors encountered during database operations that do not map to a
    /// sentinel kind.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Errors on the WebSocket transport.
    #[error("websocket error: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Errors while decoding wire payloads (JSON, hex, base64).
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Errors related to configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic errors for operations that don't fit other categories.
    #[error("internal error: {0}")]
    Internal(String),

    /// An additional description layered on top of a cause.
    #[error("{desc}: {cause}")]
    Context {
        desc: String,
        #[source]
        cause: Box<MetricsError>,
    },
}

impl MetricsError {
    /// Extends this error with an additional description. The textual form of
    /// the result is `"desc: cause-text"`.
    #[must_use]
    pub fn wrap(self, desc: impl Into<String>) -> Self {
        MetricsError::Context {
            desc: desc.into(),
            cause: Box::new(self),
        }
    }

    /// Checks whether this error is of the given kind, unwrapping `Context`
    /// layers until the root cause is reached.
    #[must_use]
    pub fn is(&self, kind: &MetricsError) -> bool {
        let mut err = self;
        while let MetricsError::Context { cause, .. } = err {
            err = cause;
        }
        std::mem::discriminant(err) == std::mem::discriminant(kind)
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.is(&MetricsError::NotFound)
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.is(&MetricsError::Conflict)
    }

    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.is(&MetricsError::Throttled)
    }

    #[must_use]
    pub fn is_failed_response(&self) -> bool {
        self.is(&MetricsError::FailedResponse)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.is(&MetricsError::Cancelled)
    }
}

impl From<serde_json::Error> for MetricsError {
    fn from(err: serde_json::Error) -> Self {
        MetricsError::Decoding(err.to_string())
    }
}

/// Type alias for Results using `MetricsError`.
pub type Result<T> = std::result::Result<T, MetricsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_preserves_kind() {
        let err = MetricsError::NotFound.wrap("latest block");
        assert!(err.is(&MetricsError::NotFound));
        assert!(err.is_not_found());
        assert!(!err.is(&MetricsError::Conflict));
    }

    #[test]
    fn test_wrap_is_deep() {
        let err = MetricsError::Conflict
            .wrap("insert validator")
            .wrap("validator ID")
            .wrap("sync");
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_distinct_sentinels_do_not_match() {
        let sentinels = [
            MetricsError::NotFound,
            MetricsError::Conflict,
            MetricsError::Throttled,
            MetricsError::FailedResponse,
            MetricsError::Cancelled,
        ];
        for (i, a) in sentinels.iter().enumerate() {
            for (j, b) in sentinels.iter().enumerate() {
                assert_eq!(a.is(b), i == j, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_display_chains_descriptions() {
        let err = MetricsError::NotFound.wrap("no blocks").wrap("latest block");
        assert_eq!(err.to_string(), "latest block: no blocks: not found");
    }

    #[test]
    fn test_carrier_variants_keep_their_kind() {
        let err = MetricsError::Decoding("bad hex".to_string()).wrap("commit");
        assert!(!err.is_not_found());
        assert!(err.is(&MetricsError::Decoding(String::new())));
    }
}
