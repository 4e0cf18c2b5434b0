//! Engine integration tests.
//!
//! These run the public API end to end: staging, deploying and destroying
//! blueprints against in-memory providers with state kept on disk.

mod common;
mod deploy_tests;
mod drift_tests;
mod staging_tests;
