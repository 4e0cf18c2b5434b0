//! Drift detection and reconciliation.
//!
//! The detector compares recorded resource specs with the live state
//! reported by providers, and flags elements a previous run left in
//! progress. Staging and deployment refuse to continue over drift unless
//! the caller acknowledges it or reconciles first.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::graph::ElementId;
use crate::registry::{ProviderError, ProviderRegistry, RegistryError, ResourceInfo};
use crate::resolve::BoxFuture;
use crate::stage::FieldChange;
use crate::state::{ElementStatus, InstanceState, ResourceState, RunStatus, StateContainer, StateError};
use crate::value::{MappingNode, PropertyPath};

#[derive(Debug, Error)]
pub enum ReconcileError {
  #[error("instance not found: {0}")]
  InstanceNotFound(String),

  #[error("{0} is not recorded on the instance")]
  UnknownElement(String),

  #[error("{0} cannot be reconciled directly")]
  Unsupported(String),

  #[error("failed to read external state of '{resource}': {source}")]
  Provider {
    resource: String,
    #[source]
    source: ProviderError,
  },

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  State(#[from] StateError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ElementReconcileStatus {
  Unchanged,
  /// Live state differs from the recorded spec. `prev` is the recorded
  /// value and `new` the live one.
  Drifted { changes: Vec<FieldChange> },
  /// The element no longer exists.
  Missing,
  /// A previous run never finished this element.
  Interrupted { last_status: ElementStatus },
}

impl ElementReconcileStatus {
  pub fn is_unchanged(&self) -> bool {
    matches!(self, ElementReconcileStatus::Unchanged)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationCheckResult {
  pub instance_id: String,
  #[serde(default)]
  pub resources: BTreeMap<String, ElementReconcileStatus>,
  #[serde(default)]
  pub links: BTreeMap<String, ElementReconcileStatus>,
  #[serde(default)]
  pub children: BTreeMap<String, ReconciliationCheckResult>,
  pub drift_detected: bool,
}

impl ReconciliationCheckResult {
  /// Element ids (`resources.x`, `links.y`) that are not unchanged.
  pub fn affected_elements(&self) -> Vec<String> {
    let resources = self
      .resources
      .iter()
      .filter(|(_, status)| !status.is_unchanged())
      .map(|(name, _)| ElementId::Resource(name.clone()).to_string());
    let links = self
      .links
      .iter()
      .filter(|(_, status)| !status.is_unchanged())
      .map(|(name, _)| ElementId::Link(name.clone()).to_string());
    let children = self
      .children
      .iter()
      .filter(|(_, child)| child.drift_detected)
      .map(|(name, _)| ElementId::Child(name.clone()).to_string());
    resources.chain(links).chain(children).collect()
  }
}

/// How to settle a drifted or interrupted element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "element", rename_all = "snake_case")]
pub enum ReconcileAction {
  /// Record the live state as the element's spec and mark it succeeded.
  /// Resources that no longer exist are removed from the instance.
  AcceptExternal(ElementId),
  MarkFailed(ElementId),
}

pub struct DriftDetector {
  registry: Arc<ProviderRegistry>,
  state: Arc<dyn StateContainer>,
}

impl DriftDetector {
  pub fn new(registry: Arc<ProviderRegistry>, state: Arc<dyn StateContainer>) -> Self {
    Self { registry, state }
  }

  /// Compare an instance (and its children) with live state.
  ///
  /// Only resources that completed are checked against providers. The
  /// result is recorded through the state container, and drifted resources
  /// are flagged on the instance.
  pub fn check<'a>(
    &'a self,
    instance: &'a InstanceState,
  ) -> BoxFuture<'a, Result<ReconciliationCheckResult, ReconcileError>> {
    Box::pin(async move {
      let mut result = ReconciliationCheckResult {
        instance_id: instance.instance_id.clone(),
        ..Default::default()
      };

      for (name, resource) in &instance.resources {
        let status = self.check_resource(&instance.instance_id, resource).await?;
        if !status.is_unchanged() {
          debug!(instance = %instance.instance_id, resource = %name, ?status, "resource drifted");
        }
        result.resources.insert(name.clone(), status);
      }

      for (name, link) in &instance.links {
        let side_missing = [&link.resource_a, &link.resource_b].into_iter().any(|side| {
          !instance.resources.contains_key(side)
            || matches!(result.resources.get(side), Some(ElementReconcileStatus::Missing))
        });
        let status = if link.status == ElementStatus::InProgress {
          ElementReconcileStatus::Interrupted {
            last_status: link.status,
          }
        } else if side_missing {
          ElementReconcileStatus::Missing
        } else {
          ElementReconcileStatus::Unchanged
        };
        result.links.insert(name.clone(), status);
      }

      for (name, child_id) in &instance.children {
        match self.state.get_instance(child_id).await? {
          Some(child) => {
            let child_result = self.check(&child).await?;
            result.children.insert(name.clone(), child_result);
          }
          None => warn!(instance = %instance.instance_id, child = %name, "child instance record is missing"),
        }
      }

      result.drift_detected = result.resources.values().any(|s| !s.is_unchanged())
        || result.links.values().any(|s| !s.is_unchanged())
        || result.children.values().any(|c| c.drift_detected);

      let drifted: Vec<String> = result
        .resources
        .iter()
        .filter(|(_, s)| matches!(s, ElementReconcileStatus::Drifted { .. } | ElementReconcileStatus::Missing))
        .map(|(name, _)| name.clone())
        .collect();
      if !drifted.is_empty() {
        self
          .state
          .update_instance(
            &instance.instance_id,
            Box::new(move |stored| {
              for name in drifted {
                if let Some(resource) = stored.resources.get_mut(&name) {
                  resource.drifted = true;
                }
              }
            }),
          )
          .await?;
      }

      self.state.save_reconciliation(&instance.instance_id, &result).await?;
      info!(
        instance = %instance.instance_id,
        drift_detected = result.drift_detected,
        "drift check complete"
      );
      Ok(result)
    })
  }

  async fn check_resource(
    &self,
    instance_id: &str,
    resource: &ResourceState,
  ) -> Result<ElementReconcileStatus, ReconcileError> {
    match resource.status {
      ElementStatus::InProgress => {
        return Ok(ElementReconcileStatus::Interrupted {
          last_status: resource.status,
        });
      }
      ElementStatus::Succeeded => {}
      // Never deployed, or already known to be broken.
      ElementStatus::Pending | ElementStatus::Failed | ElementStatus::Skipped => {
        return Ok(ElementReconcileStatus::Unchanged);
      }
    }

    let provider = self.registry.resource(&resource.resource_type)?;
    let live = provider
      .get_external_state(&resource_info(instance_id, resource))
      .await
      .map_err(|source| ReconcileError::Provider {
        resource: resource.name.clone(),
        source,
      })?;

    let Some(live) = live else {
      return Ok(ElementReconcileStatus::Missing);
    };

    let mut changes = Vec::new();
    compare_recorded(&PropertyPath::root().field("spec"), &resource.spec, Some(&live), &mut changes);
    if changes.is_empty() {
      Ok(ElementReconcileStatus::Unchanged)
    } else {
      Ok(ElementReconcileStatus::Drifted { changes })
    }
  }

  /// Settle drifted or interrupted elements of an instance.
  ///
  /// Once no element is left in progress, an instance whose run was cut
  /// short is marked `Interrupted` so it can be deployed again.
  pub async fn apply(&self, instance_id: &str, actions: Vec<ReconcileAction>) -> Result<(), ReconcileError> {
    let mut instance = self
      .state
      .get_instance(instance_id)
      .await?
      .ok_or_else(|| ReconcileError::InstanceNotFound(instance_id.to_string()))?;

    for action in actions {
      match action {
        ReconcileAction::AcceptExternal(ElementId::Resource(name)) => {
          let resource = instance
            .resources
            .get(&name)
            .ok_or_else(|| ReconcileError::UnknownElement(format!("resources.{name}")))?;
          let provider = self.registry.resource(&resource.resource_type)?;
          let live = provider
            .get_external_state(&resource_info(instance_id, resource))
            .await
            .map_err(|source| ReconcileError::Provider {
              resource: name.clone(),
              source,
            })?;

          match live {
            Some(spec) => {
              if let Some(resource) = instance.resources.get_mut(&name) {
                resource.spec = spec;
                resource.status = ElementStatus::Succeeded;
                resource.failure_reasons.clear();
                resource.drifted = false;
                // Force the next staging run to diff against the new spec.
                resource.spec_hash = None;
              }
            }
            None => {
              instance.resources.remove(&name);
            }
          }
          info!(instance = %instance_id, resource = %name, "accepted external state");
        }
        ReconcileAction::AcceptExternal(ElementId::Link(name)) => {
          let link = instance
            .links
            .get_mut(&name)
            .ok_or_else(|| ReconcileError::UnknownElement(format!("links.{name}")))?;
          link.status = ElementStatus::Succeeded;
          link.failure_reasons.clear();
        }
        ReconcileAction::MarkFailed(ElementId::Resource(name)) => {
          let resource = instance
            .resources
            .get_mut(&name)
            .ok_or_else(|| ReconcileError::UnknownElement(format!("resources.{name}")))?;
          resource.status = ElementStatus::Failed;
          resource.failure_reasons = vec!["marked failed during reconciliation".to_string()];
          resource.drifted = false;
          resource.spec_hash = None;
          info!(instance = %instance_id, resource = %name, "marked resource failed");
        }
        ReconcileAction::MarkFailed(ElementId::Link(name)) => {
          let link = instance
            .links
            .get_mut(&name)
            .ok_or_else(|| ReconcileError::UnknownElement(format!("links.{name}")))?;
          link.status = ElementStatus::Failed;
          link.failure_reasons = vec!["marked failed during reconciliation".to_string()];
        }
        ReconcileAction::AcceptExternal(child @ ElementId::Child(_))
        | ReconcileAction::MarkFailed(child @ ElementId::Child(_)) => {
          return Err(ReconcileError::Unsupported(child.to_string()));
        }
      }
    }

    let still_running = instance.resources.values().any(|r| r.status == ElementStatus::InProgress)
      || instance.links.values().any(|l| l.status == ElementStatus::InProgress);
    if instance.status == RunStatus::InProgress && !still_running {
      instance.status = RunStatus::Interrupted;
    }

    self.state.save_instance(&instance).await?;
    Ok(())
  }
}

fn resource_info(instance_id: &str, resource: &ResourceState) -> ResourceInfo {
  ResourceInfo {
    instance_id: instance_id.to_string(),
    resource_name: resource.name.clone(),
    resource_type: resource.resource_type.clone(),
    spec: resource.spec.clone(),
  }
}

/// Compare every recorded leaf with the live value at the same path.
/// Fields only present in the live state are ignored.
fn compare_recorded(path: &PropertyPath, recorded: &MappingNode, live: Option<&MappingNode>, out: &mut Vec<FieldChange>) {
  match recorded {
    MappingNode::Fields(fields) => {
      for (key, value) in fields {
        let live_value = live.and_then(MappingNode::as_fields).and_then(|f| f.get(key));
        compare_recorded(&path.field(key.clone()), value, live_value, out);
      }
    }
    MappingNode::Items(items) => {
      let live_items = live.and_then(MappingNode::as_items).unwrap_or_default();
      if live_items.len() != items.len() {
        out.push(FieldChange {
          path: path.to_string(),
          prev: Some(recorded.clone()),
          new: live.cloned(),
        });
        return;
      }
      for (idx, item) in items.iter().enumerate() {
        compare_recorded(&path.index(idx), item, live_items.get(idx), out);
      }
    }
    MappingNode::None => {}
    leaf => {
      if live != Some(leaf) {
        out.push(FieldChange {
          path: path.to_string(),
          prev: Some(leaf.clone()),
          new: live.cloned(),
        });
      }
    }
  }
}
