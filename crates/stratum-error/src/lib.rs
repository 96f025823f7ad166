#![forbid(unsafe_code)]
//! Error types for the Stratum metadata cache.
//!
//! # Error Taxonomy
//!
//! Every public cache operation returns `Result<T, CacheError>`. Variants
//! fall into three recovery classes:
//!
//! | Variant | Class | Meaning |
//! |---------|-------|---------|
//! | `BadArgument` | recoverable | Malformed parameter (undefined address, out-of-range config) caught at the entry point, no state change |
//! | `NotFound` | recoverable | Address absent from the cache on a query that requires presence |
//! | `ProtocolViolation` | **fatal** | Caller broke the exclusive-access discipline: double protect, unprotect without protect, cyclic dependency edge, removing a protected or pinned entry |
//! | `Callback` | recoverable | A client serialize/deserialize/notify callback failed; the client error is carried verbatim |
//! | `OutOfMemory` | recoverable | A client signalled allocation failure while materializing an entry; no partial entry was inserted |
//!
//! `ProtocolViolation` indicates caller misuse, not an environmental
//! condition. The cache's own state stays coherent (the offending operation
//! is rejected before mutation), but the caller's bookkeeping is by
//! definition wrong, so retrying is meaningless. [`CacheError::is_fatal`]
//! reports this classification and is exhaustive over the variants: adding
//! a variant without classifying it is a compile error.
//!
//! ## Design Constraints
//!
//! - `stratum-error` must not depend on `stratum-types` or `stratum-cache`
//!   (no cyclic deps); diagnostic payloads are owned `String`s.
//! - Client callback errors cross the cache boundary as
//!   `Box<dyn Error + Send + Sync>` and are surfaced unmodified inside
//!   [`CacheError::Callback`], with the failing operation named.

use thiserror::Error;

/// Boxed client-supplied error, surfaced verbatim.
pub type ClientError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for all Stratum cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Malformed parameter detected at a public entry point.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// The requested address is not resident in the cache.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller violated the protect/unprotect/pin contract.
    ///
    /// Fatal by classification: the cache rejected the operation and its
    /// own state is intact, but the caller's access discipline is broken.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A client callback failed during the named cache operation.
    ///
    /// The client error is carried unmodified; `during` names the callback
    /// (`"deserialize"`, `"serialize"`, `"notify"`, ...).
    #[error("client callback failed during {during}: {source}")]
    Callback {
        during: &'static str,
        #[source]
        source: ClientError,
    },

    /// A client signalled allocation failure while materializing an entry.
    #[error("out of memory")]
    OutOfMemory,
}

impl CacheError {
    /// Whether this error indicates unrecoverable caller misuse.
    ///
    /// Exhaustive over the variants — adding a variant without
    /// classifying it here is a compile error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ProtocolViolation(_) => true,
            Self::BadArgument(_) | Self::NotFound(_) | Self::Callback { .. } | Self::OutOfMemory => {
                false
            }
        }
    }

    /// Shorthand constructor for [`CacheError::Callback`].
    #[must_use]
    pub fn callback(during: &'static str, source: ClientError) -> Self {
        Self::Callback { during, source }
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
