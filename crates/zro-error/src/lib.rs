#![forbid(unsafe_code)]
//! Error types for the zro read path.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `zro-types` | Byte-level decode failures of on-disk records |
//! | Runtime | `ZroError` | `zro-error` (this crate) | Errors surfaced by the resolver and the decompression pipeline |
//!
//! A `ParseError` converts into `ZroError::Parse`. Code that knows which
//! metadata block produced the failure wraps it as `Corruption` instead so the
//! block number survives for triage.
//!
//! ## Page-level errors
//!
//! Read failures and corrupt clusters are recorded on the destination pages
//! themselves (see `zro-block::Page::set_error`). `ZroError` is what the
//! read entry points return for the first failed page they were asked about.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `ReadFailed` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `NoMemory` | `ENOMEM` |
//! | `Busy` | `EBUSY` |
//! | `Again` | `EAGAIN` |
//! | `NotSupported` | `EOPNOTSUPP` |

use thiserror::Error;
use zro_types::ParseError;

/// Unified error type for all zro operations.
#[derive(Debug, Error)]
pub enum ZroError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The extent index or a compressed cluster is inconsistent.
    ///
    /// Covers invalid cluster types, zero or forward NONHEAD deltas,
    /// non-terminating chains and page-count mismatches during decompression.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Structurally invalid input outside of live metadata (bad geometry,
    /// malformed configuration).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Allocation of a workgroup, staging page or scratch buffer failed.
    #[error("out of memory")]
    NoMemory,

    /// A freeze or non-blocking page lock could not be taken.
    #[error("resource busy")]
    Busy,

    /// The operation raced with another owner and should be retried later.
    #[error("try again")]
    Again,

    /// The requested path is not available for this input (for example a
    /// decompressor fast path that cannot handle the output window).
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A block read completed with an error.
    #[error("read failed at block {block}")]
    ReadFailed { block: u64 },
}

impl ZroError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::ReadFailed { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) => libc::EINVAL,
            Self::NoMemory => libc::ENOMEM,
            Self::Busy => libc::EBUSY,
            Self::Again => libc::EAGAIN,
            Self::NotSupported(_) => libc::EOPNOTSUPP,
        }
    }

    /// Whether the caller may retry the same operation unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoMemory | Self::Busy | Self::Again)
    }

    /// Shorthand for a corruption error at `block`.
    #[must_use]
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }
}

impl From<ParseError> for ZroError {
    fn from(err: ParseError) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Result alias using `ZroError`.
pub type Result<T> = std::result::Result<T, ZroError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(ZroError, libc::c_int)> = vec![
            (ZroError::Io(std::io::Error::other("test")), libc::EIO),
            (ZroError::corruption(0, "test"), libc::EIO),
            (ZroError::Format("test".into()), libc::EINVAL),
            (ZroError::Parse("test".into()), libc::EINVAL),
            (ZroError::NoMemory, libc::ENOMEM),
            (ZroError::Busy, libc::EBUSY),
            (ZroError::Again, libc::EAGAIN),
            (ZroError::NotSupported("fast path".into()), libc::EOPNOTSUPP),
            (ZroError::ReadFailed { block: 9 }, libc::EIO),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = ZroError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn retryable_classification() {
        assert!(ZroError::Busy.is_retryable());
        assert!(ZroError::Again.is_retryable());
        assert!(ZroError::NoMemory.is_retryable());
        assert!(!ZroError::corruption(1, "x").is_retryable());
        assert!(!ZroError::ReadFailed { block: 1 }.is_retryable());
    }

    #[test]
    fn parse_error_converts() {
        let parse = ParseError::InsufficientData {
            needed: 8,
            offset: 4,
            actual: 2,
        };
        let err: ZroError = parse.into();
        assert!(matches!(err, ZroError::Parse(_)));
        assert!(err.to_string().contains("need 8 bytes"));
    }

    #[test]
    fn display_formatting() {
        let err = ZroError::corruption(42, "NONHEAD delta 0 at lcn 3");
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: NONHEAD delta 0 at lcn 3"
        );
        assert_eq!(
            ZroError::ReadFailed { block: 7 }.to_string(),
            "read failed at block 7"
        );
    }
}
