//! blueprint-lib: Core engine for declarative infrastructure blueprints
//!
//! This crate turns a blueprint document into deployed infrastructure:
//! - `schema`: the blueprint document model (variables, resources, includes, exports)
//! - `resolve`: `${..}` substitution resolution against params, resources and children
//! - `graph`: the element dependency graph and its execution waves
//! - `stage`: change staging, diffing desired state against recorded state
//! - `deploy`: the orchestrator that applies change sets, with rollback
//! - `reconcile`: drift detection and reconciliation against live state
//!
//! Providers plug into the engine through the traits in `registry`, and
//! instance state is persisted through a `state::StateContainer`.

pub mod blueprint;
pub mod config;
pub mod consts;
pub mod deploy;
pub mod diagnostics;
pub mod functions;
pub mod graph;
pub mod reconcile;
pub mod registry;
pub mod resolve;
pub mod schema;
pub mod stage;
pub mod state;
pub mod substitution;
pub mod util;
pub mod value;

/// Re-exported so providers can implement the async traits without a
/// direct dependency.
pub use async_trait::async_trait;
