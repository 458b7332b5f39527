#![forbid(unsafe_code)]
//! Error types for the blockfile disk cache.
//!
//! # Error Taxonomy
//!
//! The cache uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `dc-types` | On-disk record violations detected during byte parsing |
//! | Runtime | `DcError` | `dc-error` (this crate) | Errors returned by the backend, entries and the CLI |
//!
//! A third, narrower type, [`CheckError`], carries the negative status codes
//! produced by the structural self-check.
//!
//! ## Mapping Policy: ParseError → DcError
//!
//! `dc-error` does not depend on `dc-types`. The conversion lives in
//! `dc-ondisk` and `dc-core`:
//!
//! | ParseError Variant | DcError Variant | When |
//! |--------------------|-----------------|------|
//! | `InsufficientData` | `Corruption { addr, detail }` | A record read from a live block file is short |
//! | `InvalidMagic` | `Format(detail)` | Index or block file header has the wrong magic |
//! | `InvalidField` | `Format` at open, `Corruption` afterwards | Header fields out of range |
//! | `IntegerConversion` | `Corruption { addr, detail }` | Size or offset arithmetic overflowed |
//!
//! ## Recovery Policy
//!
//! | Class | Variants | Backend reaction |
//! |-------|----------|------------------|
//! | Logic | `NotFound`, `Exists`, `InvalidArgument`, `TooBig` | Returned to the caller, nothing else happens |
//! | Entry-local | `Corruption` on one entry | That entry is doomed |
//! | Structural | `Format`, `Corruption` on index or lists | Cache restart (all files recreated) |
//! | I/O | `Io`, `NoSpace` | Counted; repeated failures disable the backend |
//! | State | `Disabled`, `NotInitialized`, `Shutdown` | Fail fast |
//!
//! ## Status Code Mapping
//!
//! Every `DcError` variant maps to exactly one network-style status code via
//! [`DcError::to_net_error`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | Code | Constant |
//! |---------|------|----------|
//! | `Io` | -2 | `ERR_FAILED` |
//! | `Corruption` | -401 | `ERR_CACHE_READ_FAILURE` |
//! | `Format` | -404 | `ERR_CACHE_OPEN_FAILURE` |
//! | `Parse` | -401 | `ERR_CACHE_READ_FAILURE` |
//! | `NotFound` | -400 | `ERR_CACHE_MISS` |
//! | `Exists` | -405 | `ERR_CACHE_CREATE_FAILURE` |
//! | `InvalidArgument` | -4 | `ERR_INVALID_ARGUMENT` |
//! | `NoSpace` | -402 | `ERR_CACHE_WRITE_FAILURE` |
//! | `TooBig` | -2 | `ERR_FAILED` |
//! | `Disabled` | -2 | `ERR_FAILED` |
//! | `NotInitialized` | -9 | `ERR_UNEXPECTED` |
//! | `Shutdown` | -9 | `ERR_UNEXPECTED` |
//! | `Check` | -2 | `ERR_FAILED` |

use std::fmt;

use thiserror::Error;

pub const ERR_FAILED: i32 = -2;
pub const ERR_INVALID_ARGUMENT: i32 = -4;
pub const ERR_UNEXPECTED: i32 = -9;
pub const ERR_CACHE_MISS: i32 = -400;
pub const ERR_CACHE_READ_FAILURE: i32 = -401;
pub const ERR_CACHE_WRITE_FAILURE: i32 = -402;
pub const ERR_CACHE_OPEN_FAILURE: i32 = -404;
pub const ERR_CACHE_CREATE_FAILURE: i32 = -405;

/// Unified error type for all cache operations.
#[derive(Debug, Error)]
pub enum DcError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record failed validation while the cache was live.
    ///
    /// `addr` is the raw cache address of the record (0 when the damage is in
    /// a file header rather than a record).
    #[error("corrupt record at {addr:#010x}: {detail}")]
    Corruption { addr: u32, detail: String },

    /// A cache file has the wrong magic, version or geometry.
    #[error("invalid cache format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without record context.
    #[error("parse error: {0}")]
    Parse(String),

    /// No live entry with this key.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// A live entry already owns this key.
    #[error("entry exists: {0}")]
    Exists(String),

    /// Stream index, offset or length out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Block files cannot grow any further.
    #[error("no space left in block files")]
    NoSpace,

    /// A stream would exceed the per-entry size limit.
    #[error("stream too big: {requested} bytes requested, limit {limit}")]
    TooBig { requested: i64, limit: i64 },

    /// The backend hit a critical error and refuses further work until it
    /// restarts.
    #[error("cache backend disabled")]
    Disabled,

    /// An operation arrived before `init` completed.
    #[error("cache backend not initialized")]
    NotInitialized,

    /// The cache thread is gone.
    #[error("cache thread shut down")]
    Shutdown,

    /// Structural self-check failure.
    #[error("self-check failed: {0}")]
    Check(CheckError),
}

impl DcError {
    /// Convert this error into a network-style status code.
    #[must_use]
    pub fn to_net_error(&self) -> i32 {
        match self {
            Self::Io(_) | Self::TooBig { .. } | Self::Disabled | Self::Check(_) => ERR_FAILED,
            Self::Corruption { .. } | Self::Parse(_) => ERR_CACHE_READ_FAILURE,
            Self::Format(_) => ERR_CACHE_OPEN_FAILURE,
            Self::NotFound(_) => ERR_CACHE_MISS,
            Self::Exists(_) => ERR_CACHE_CREATE_FAILURE,
            Self::InvalidArgument(_) => ERR_INVALID_ARGUMENT,
            Self::NoSpace => ERR_CACHE_WRITE_FAILURE,
            Self::NotInitialized | Self::Shutdown => ERR_UNEXPECTED,
        }
    }

    /// Errors that count towards disabling the backend.
    #[must_use]
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::NoSpace)
    }

    /// Errors that mean the on-disk structure can no longer be trusted.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Format(_) | Self::Check(_))
    }

    /// The device ran out of room (as opposed to the block files).
    #[must_use]
    pub fn is_disk_full(&self) -> bool {
        match self {
            Self::Io(err) => err.raw_os_error() == Some(libc::ENOSPC),
            Self::NoSpace => true,
            _ => false,
        }
    }
}

/// Negative status codes produced by the self-check and recorded when the
/// backend reports a critical error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckError {
    InitFailed,
    InvalidTail,
    InvalidHead,
    InvalidPrev,
    InvalidNext,
    InvalidEntry,
    InvalidAddress,
    InvalidLinks,
    NumEntriesMismatch,
    ReadFailure,
    PreviousCrash,
    StorageError,
    InvalidMask,
    CacheDoomed,
    CacheOpen,
}

impl CheckError {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::InitFailed => -1,
            Self::InvalidTail => -2,
            Self::InvalidHead => -3,
            Self::InvalidPrev => -4,
            Self::InvalidNext => -5,
            Self::InvalidEntry => -6,
            Self::InvalidAddress => -7,
            Self::InvalidLinks => -8,
            Self::NumEntriesMismatch => -9,
            Self::ReadFailure => -10,
            Self::PreviousCrash => -11,
            Self::StorageError => -12,
            Self::InvalidMask => -13,
            Self::CacheDoomed => -14,
            Self::CacheOpen => -15,
        }
    }

    /// Inverse of [`CheckError::code`].
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            -1 => Self::InitFailed,
            -2 => Self::InvalidTail,
            -3 => Self::InvalidHead,
            -4 => Self::InvalidPrev,
            -5 => Self::InvalidNext,
            -6 => Self::InvalidEntry,
            -7 => Self::InvalidAddress,
            -8 => Self::InvalidLinks,
            -9 => Self::NumEntriesMismatch,
            -10 => Self::ReadFailure,
            -11 => Self::PreviousCrash,
            -12 => Self::StorageError,
            -13 => Self::InvalidMask,
            -14 => Self::CacheDoomed,
            -15 => Self::CacheOpen,
            _ => return None,
        };
        Some(err)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitFailed => "init failed",
            Self::InvalidTail => "invalid list tail",
            Self::InvalidHead => "invalid list head",
            Self::InvalidPrev => "invalid prev link",
            Self::InvalidNext => "invalid next link",
            Self::InvalidEntry => "invalid entry",
            Self::InvalidAddress => "invalid address",
            Self::InvalidLinks => "inconsistent links",
            Self::NumEntriesMismatch => "entry count mismatch",
            Self::ReadFailure => "read failure",
            Self::PreviousCrash => "previous crash",
            Self::StorageError => "storage error",
            Self::InvalidMask => "invalid mask",
            Self::CacheDoomed => "cache doomed",
            Self::CacheOpen => "cache open",
        }
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

impl From<CheckError> for DcError {
    fn from(err: CheckError) -> Self {
        Self::Check(err)
    }
}

/// Result alias using `DcError`.
pub type Result<T> = std::result::Result<T, DcError>;
