#![forbid(unsafe_code)]
//! Blockfile disk cache public API.
//!
//! Re-exports the backend from `dc-core`. This is the crate downstream
//! consumers and the `dc` command line tool depend on.

pub use dc_core::*;
