//! Shared utilities.
//!
//! Common utilities used across the crate including hashing, cancellation
//! and test helpers.

pub mod cancel;
pub mod hash;

#[cfg(test)]
pub mod testutil;
