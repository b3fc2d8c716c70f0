//! Batch Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the batch workspace members.
//!
//! # Overview
//!
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Fingerprints**: SHA-256 digests used to identify job runs and to
//!   verify staged files
//!
//! # Example
//!
//! ```no_run
//! use batch_common::fingerprint::fingerprint_pairs;
//!
//! let key = fingerprint_pairs([("input.file", "data/usage.csv")]);
//! assert_eq!(key.len(), 64);
//! ```

pub mod fingerprint;
pub mod logging;

pub use fingerprint::{compute_file_checksum, fingerprint_pairs};
