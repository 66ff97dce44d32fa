#![forbid(unsafe_code)]
//! Error types for bmx.
//!
//! # Error Taxonomy
//!
//! bmx uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `bmx-types` | Page layout violations detected while decoding bytes |
//! | Runtime | `BmxError` | `bmx-error` (this crate) | Errors surfaced by the page cache, chains, and indexes |
//!
//! `bmx-error` does not depend on `bmx-types`. Page decoders in `bmx-bitmap`
//! convert a `ParseError` into `BmxError::Corruption` and attach the page id.
//!
//! ## Kinds
//!
//! Every variant maps to exactly one [`ErrorKind`] via [`BmxError::kind`]. The
//! mapping has no wildcard arm, so a new variant does not compile until it is
//! classified.
//!
//! | Variant | Kind | Fatal |
//! |---------|------|-------|
//! | `Io` | `Io` | yes |
//! | `NoSpace` | `Allocation` | yes |
//! | `CacheExhausted` | `Allocation` | yes |
//! | `Corruption` | `Corruption` | yes |
//! | `ScanMisuse` | `Misuse` | no |
//! | `Format` | `Invalid` | no |
//! | `NotFound` | `Invalid` | no |
//!
//! Out-of-range bit positions are not errors: page calls report them as a
//! boolean failure and the chain manager extends the chain.
//!
//! Nothing in bmx retries. A fatal error leaves the index in whatever state
//! the interrupted mutation reached; callers decide whether to reopen.

use thiserror::Error;

/// Unified error type for all bmx operations.
#[derive(Debug, Error)]
pub enum BmxError {
    /// Operating system I/O error from a byte device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A page failed validation while being decoded or after a mutation.
    ///
    /// Covers run streams with gaps, `bit_count` disagreeing with the run
    /// sum, broken chain links, and self-id mismatches.
    #[error("corrupt bitmap page {page}: {detail}")]
    Corruption { page: u32, detail: String },

    /// Invalid configuration or device geometry.
    #[error("invalid format: {0}")]
    Format(String),

    /// The page device has no unallocated pages left.
    #[error("no space left on page device")]
    NoSpace,

    /// Every frame of the buffer pool is pinned.
    #[error("page cache exhausted: all {frames} frames pinned")]
    CacheExhausted { frames: usize },

    /// API used out of order (probe before open, use after close).
    #[error("scan misuse: {0}")]
    ScanMisuse(String),

    /// A row, position, or value the caller named does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Coarse classification of a [`BmxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    Allocation,
    Corruption,
    Misuse,
    Invalid,
}

impl BmxError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::NoSpace | Self::CacheExhausted { .. } => ErrorKind::Allocation,
            Self::Corruption { .. } => ErrorKind::Corruption,
            Self::ScanMisuse(_) => ErrorKind::Misuse,
            Self::Format(_) | Self::NotFound(_) => ErrorKind::Invalid,
        }
    }

    /// Whether the index should be considered unusable after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Io | ErrorKind::Allocation | ErrorKind::Corruption
        )
    }

    pub fn corruption(page: u32, detail: impl Into<String>) -> Self {
        Self::Corruption {
            page,
            detail: detail.into(),
        }
    }

    pub fn misuse(detail: impl Into<String>) -> Self {
        Self::ScanMisuse(detail.into())
    }
}

/// Result alias using `BmxError`.
pub type Result<T> = std::result::Result<T, BmxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_covers_all_variants() {
        let cases: Vec<(BmxError, ErrorKind, bool)> = vec![
            (
                BmxError::Io(std::io::Error::other("test")),
                ErrorKind::Io,
                true,
            ),
            (
                BmxError::corruption(3, "gap in run stream"),
                ErrorKind::Corruption,
                true,
            ),
            (BmxError::Format("test".into()), ErrorKind::Invalid, false),
            (BmxError::NoSpace, ErrorKind::Allocation, true),
            (
                BmxError::CacheExhausted { frames: 4 },
                ErrorKind::Allocation,
                true,
            ),
            (BmxError::misuse("closed"), ErrorKind::Misuse, false),
            (BmxError::NotFound("row 9".into()), ErrorKind::Invalid, false),
        ];

        for (error, kind, fatal) in &cases {
            assert_eq!(error.kind(), *kind, "wrong kind for {error:?}");
            assert_eq!(error.is_fatal(), *fatal, "wrong fatality for {error:?}");
        }
    }

    #[test]
    fn display_formatting() {
        let err = BmxError::corruption(42, "bit_count 80 != run sum 79");
        assert_eq!(
            err.to_string(),
            "corrupt bitmap page 42: bit_count 80 != run sum 79"
        );

        assert_eq!(
            BmxError::CacheExhausted { frames: 8 }.to_string(),
            "page cache exhausted: all 8 frames pinned"
        );
        assert_eq!(
            BmxError::misuse("get_position on closed scan").to_string(),
            "scan misuse: get_position on closed scan"
        );
        assert_eq!(BmxError::NoSpace.to_string(), "no space left on page device");
    }

    #[test]
    fn io_error_converts_with_question_mark() {
        fn fails() -> Result<()> {
            Err(std::io::Error::other("disk gone"))?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("disk gone"));
    }
}
