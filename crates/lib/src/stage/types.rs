//! Change set types produced by staging.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostic;
use crate::value::MappingNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
  Create,
  Update,
  Delete,
  /// Destroy and create again, before any dependent runs.
  Recreate,
}

impl std::fmt::Display for ChangeAction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ChangeAction::Create => write!(f, "create"),
      ChangeAction::Update => write!(f, "update"),
      ChangeAction::Delete => write!(f, "delete"),
      ChangeAction::Recreate => write!(f, "recreate"),
    }
  }
}

/// A single field difference. `prev` is absent for new fields and `new`
/// for removed ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
  pub path: String,
  #[serde(default)]
  pub prev: Option<MappingNode>,
  #[serde(default)]
  pub new: Option<MappingNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChanges {
  pub action: ChangeAction,
  pub resource_type: String,
  #[serde(default)]
  pub new_fields: Vec<FieldChange>,
  #[serde(default)]
  pub modified_fields: Vec<FieldChange>,
  #[serde(default)]
  pub removed_fields: Vec<FieldChange>,
  /// Paths whose value can only be known during deployment.
  #[serde(default)]
  pub known_on_deploy: Vec<String>,
  /// Element ids (`resources.x`, `children.y`) this resource depends on.
  #[serde(default)]
  pub depends_on: Vec<String>,
  /// Hash of the resolved desired spec, when it fully resolved.
  #[serde(default)]
  pub spec_hash: Option<String>,
}

impl ResourceChanges {
  pub fn new(action: ChangeAction, resource_type: impl Into<String>) -> Self {
    Self {
      action,
      resource_type: resource_type.into(),
      new_fields: Vec::new(),
      modified_fields: Vec::new(),
      removed_fields: Vec::new(),
      known_on_deploy: Vec::new(),
      depends_on: Vec::new(),
      spec_hash: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkChanges {
  pub action: ChangeAction,
  pub resource_a: String,
  pub resource_b: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildChanges {
  pub action: ChangeAction,
  /// The resolved include path, when known.
  #[serde(default)]
  pub path: Option<String>,
  #[serde(default)]
  pub child_instance_id: Option<String>,
  /// The child could not be staged because its include depends on values
  /// only known during deployment.
  #[serde(default)]
  pub staged_on_deploy: bool,
  #[serde(default)]
  pub changes: Option<BlueprintChanges>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportChange {
  pub action: ChangeAction,
  #[serde(default)]
  pub prev: Option<MappingNode>,
  #[serde(default)]
  pub new: Option<MappingNode>,
  #[serde(default)]
  pub known_on_deploy: bool,
}

/// Number of elements per action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
  pub create: usize,
  pub update: usize,
  pub delete: usize,
  pub recreate: usize,
}

impl ActionCounts {
  pub fn record(&mut self, action: ChangeAction) {
    match action {
      ChangeAction::Create => self.create += 1,
      ChangeAction::Update => self.update += 1,
      ChangeAction::Delete => self.delete += 1,
      ChangeAction::Recreate => self.recreate += 1,
    }
  }

  pub fn total(&self) -> usize {
    self.create + self.update + self.delete + self.recreate
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
  pub resources: ActionCounts,
  pub links: ActionCounts,
  pub children: ActionCounts,
  pub exports: ActionCounts,
}

/// Everything a deployment would change. Unchanged elements are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintChanges {
  #[serde(default)]
  pub resources: BTreeMap<String, ResourceChanges>,
  #[serde(default)]
  pub links: BTreeMap<String, LinkChanges>,
  #[serde(default)]
  pub children: BTreeMap<String, ChildChanges>,
  #[serde(default)]
  pub exports: BTreeMap<String, ExportChange>,
  #[serde(default)]
  pub diagnostics: Vec<Diagnostic>,
  /// Staging went ahead even though drift was detected.
  #[serde(default)]
  pub acknowledged_drift: bool,
  #[serde(default)]
  pub summary: ChangeSummary,
  /// Id of the saved change set record, when staged for an instance.
  #[serde(default)]
  pub changeset_id: Option<String>,
}

impl BlueprintChanges {
  pub fn is_empty(&self) -> bool {
    self.resources.is_empty() && self.links.is_empty() && self.children.is_empty() && self.exports.is_empty()
  }

  /// Returns true if any element (including nested children) has an
  /// error diagnostic.
  pub fn has_errors(&self) -> bool {
    self.diagnostics.iter().any(Diagnostic::is_error)
      || self
        .children
        .values()
        .filter_map(|child| child.changes.as_ref())
        .any(BlueprintChanges::has_errors)
  }

  /// Recount the summary from the recorded changes.
  pub fn summarize(&mut self) {
    let mut summary = ChangeSummary::default();
    for change in self.resources.values() {
      summary.resources.record(change.action);
    }
    for change in self.links.values() {
      summary.links.record(change.action);
    }
    for change in self.children.values() {
      summary.children.record(change.action);
    }
    for change in self.exports.values() {
      summary.exports.record(change.action);
    }
    self.summary = summary;
  }
}
