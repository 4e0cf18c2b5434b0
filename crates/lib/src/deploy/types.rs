//! Inputs, outputs, events and errors of deploy and destroy runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blueprint::PrepareError;
use crate::diagnostics::Diagnostic;
use crate::reconcile::ReconcileError;
use crate::registry::RegistryError;
use crate::schema::Blueprint;
use crate::stage::{BlueprintChanges, ChangeAction, StageError};
use crate::state::{ElementStatus, RunStatus, StateError};
use crate::value::MappingNode;

#[derive(Debug, Error)]
pub enum DeployError {
  #[error("instance not found: {0}")]
  InstanceNotFound(String),

  #[error("instance '{instance_id}' has unresolved drift in {}", .elements.join(", "))]
  UnresolvedDrift { instance_id: String, elements: Vec<String> },

  #[error("change set has {} error(s) and cannot be deployed", .diagnostics.len())]
  InvalidChanges { diagnostics: Vec<Diagnostic> },

  #[error(transparent)]
  Prepare(#[from] PrepareError),

  #[error(transparent)]
  Stage(#[from] StageError),

  #[error(transparent)]
  Reconcile(#[from] ReconcileError),

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  State(#[from] StateError),

  #[error("deployment task failed: {0}")]
  Task(String),
}

/// Everything needed to deploy a staged change set.
#[derive(Debug, Clone, Default)]
pub struct DeployInput {
  pub instance_id: String,
  pub blueprint: Blueprint,
  pub changes: BlueprintChanges,
  pub params: BTreeMap<String, MappingNode>,
  /// Revert the elements changed by this run if any element fails.
  pub rollback: bool,
  /// Deploy even if the instance has drifted or a previous run was
  /// interrupted.
  pub allow_drift: bool,
  pub source_path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DestroyInput {
  pub instance_id: String,
}

/// A status transition streamed while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeployEvent {
  Element {
    instance_id: String,
    /// `resources.x`, `links.a::b` or `children.y`.
    element: String,
    status: ElementStatus,
    #[serde(default)]
    reasons: Vec<String>,
  },
  Run {
    instance_id: String,
    status: RunStatus,
  },
  Rollback {
    instance_id: String,
    element: String,
    reverted: bool,
  },
}

/// Final outcome of one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementReport {
  pub status: ElementStatus,
  #[serde(default)]
  pub action: Option<ChangeAction>,
  #[serde(default)]
  pub failure_reasons: Vec<String>,
}

/// An element rollback could not revert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRollbackItem {
  pub element: String,
  pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackSummary {
  pub reverted: Vec<String>,
  pub skipped: Vec<SkippedRollbackItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploySummary {
  pub instance_id: String,
  pub status: RunStatus,
  /// Every element the run touched, keyed by element id.
  pub elements: BTreeMap<String, ElementReport>,
  #[serde(default)]
  pub exports: BTreeMap<String, MappingNode>,
  #[serde(default)]
  pub rollback: Option<RollbackSummary>,
}

impl DeploySummary {
  pub fn succeeded(&self) -> impl Iterator<Item = &str> {
    self.with_status(ElementStatus::Succeeded)
  }

  pub fn failed(&self) -> impl Iterator<Item = &str> {
    self.with_status(ElementStatus::Failed)
  }

  fn with_status(&self, status: ElementStatus) -> impl Iterator<Item = &str> {
    self
      .elements
      .iter()
      .filter(move |(_, report)| report.status == status)
      .map(|(element, _)| element.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestroySummary {
  pub instance_id: String,
  pub status: RunStatus,
  pub destroyed: Vec<String>,
  /// Elements that could not be destroyed, with the reasons.
  pub failed: BTreeMap<String, Vec<String>>,
}

/// Run status from the number of elements that succeeded and failed.
pub(crate) fn terminal_status(succeeded: usize, failed: usize, interrupted: bool) -> RunStatus {
  if interrupted {
    RunStatus::Interrupted
  } else if failed == 0 {
    RunStatus::Completed
  } else if succeeded == 0 {
    RunStatus::Failed
  } else {
    RunStatus::PartiallyFailed
  }
}
