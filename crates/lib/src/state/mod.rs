//! Durable instance state.
//!
//! The engine reads and writes instance, resource, link, changeset and
//! reconciliation records only through [`StateContainer`]. Two containers
//! ship with the crate: [`MemoryStateContainer`] for tests and embedding,
//! and [`FileStateContainer`] which keeps one JSON document per instance.

pub mod file;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reconcile::ReconciliationCheckResult;
use crate::stage::BlueprintChanges;
use crate::value::MappingNode;

pub use file::FileStateContainer;
pub use memory::MemoryStateContainer;

/// Status of a single resource, link or child within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementStatus {
  #[default]
  Pending,
  InProgress,
  Succeeded,
  Failed,
  /// Conditionally excluded.
  Skipped,
}

impl ElementStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      ElementStatus::Succeeded | ElementStatus::Failed | ElementStatus::Skipped
    )
  }
}

/// Status of a deploy or destroy run for a whole instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  #[default]
  Pending,
  InProgress,
  Completed,
  PartiallyFailed,
  Failed,
  Interrupted,
}

impl RunStatus {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, RunStatus::Pending | RunStatus::InProgress)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
  pub name: String,
  pub resource_type: String,
  /// Desired spec merged with provider-assigned values.
  pub spec: MappingNode,
  #[serde(default)]
  pub metadata: MappingNode,
  pub status: ElementStatus,
  #[serde(default)]
  pub failure_reasons: Vec<String>,
  #[serde(default)]
  pub depends_on: Vec<String>,
  /// Hash of the resolved desired spec last deployed.
  #[serde(default)]
  pub spec_hash: Option<String>,
  #[serde(default)]
  pub drifted: bool,
}

impl ResourceState {
  pub fn new(name: impl Into<String>, resource_type: impl Into<String>, spec: MappingNode) -> Self {
    Self {
      name: name.into(),
      resource_type: resource_type.into(),
      spec,
      metadata: MappingNode::None,
      status: ElementStatus::Succeeded,
      failure_reasons: Vec::new(),
      depends_on: Vec::new(),
      spec_hash: None,
      drifted: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkState {
  pub name: String,
  pub resource_a: String,
  pub resource_b: String,
  #[serde(default)]
  pub link_data: MappingNode,
  pub status: ElementStatus,
  #[serde(default)]
  pub failure_reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
  pub instance_id: String,
  pub status: RunStatus,
  #[serde(default)]
  pub resources: BTreeMap<String, ResourceState>,
  #[serde(default)]
  pub links: BTreeMap<String, LinkState>,
  /// Child include name to child instance id.
  #[serde(default)]
  pub children: BTreeMap<String, String>,
  #[serde(default)]
  pub exports: BTreeMap<String, MappingNode>,
  /// Unix timestamp (seconds) of the last completed deployment.
  #[serde(default)]
  pub last_deployed: Option<u64>,
}

impl InstanceState {
  pub fn new(instance_id: impl Into<String>) -> Self {
    Self {
      instance_id: instance_id.into(),
      ..Default::default()
    }
  }

  /// Returns true if a previous run never reached a terminal status.
  pub fn is_interrupted(&self) -> bool {
    self.status == RunStatus::InProgress
      || self.resources.values().any(|r| r.status == ElementStatus::InProgress)
      || self.links.values().any(|l| l.status == ElementStatus::InProgress)
  }

  /// Resources flagged by a drift check and not yet reconciled.
  pub fn drifted_resources(&self) -> impl Iterator<Item = &str> {
    self.resources.values().filter(|r| r.drifted).map(|r| r.name.as_str())
  }
}

/// A staged change set as recorded in the state container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetRecord {
  pub id: String,
  pub instance_id: Option<String>,
  pub changes: BlueprintChanges,
  pub created_at: u64,
}

#[derive(Debug, Error)]
pub enum StateError {
  #[error("instance not found: {0}")]
  InstanceNotFound(String),

  #[error("invalid state id '{0}'")]
  InvalidId(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("failed to serialize state: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("failed to persist state file: {0}")]
  Persist(#[from] tempfile::PersistError),
}

/// A mutation applied atomically to a stored instance.
pub type InstanceUpdate = Box<dyn FnOnce(&mut InstanceState) + Send>;

/// Seconds since the Unix epoch.
pub fn now_unix() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or_default()
}

#[async_trait]
pub trait StateContainer: Send + Sync {
  async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceState>, StateError>;

  async fn save_instance(&self, instance: &InstanceState) -> Result<(), StateError>;

  async fn remove_instance(&self, instance_id: &str) -> Result<Option<InstanceState>, StateError>;

  /// Apply `update` to the stored instance without interleaving with other
  /// updates to the same container.
  ///
  /// Returns `InstanceNotFound` if the instance does not exist.
  async fn update_instance(&self, instance_id: &str, update: InstanceUpdate) -> Result<(), StateError>;

  async fn save_changeset(&self, record: &ChangesetRecord) -> Result<(), StateError>;

  async fn get_changeset(&self, id: &str) -> Result<Option<ChangesetRecord>, StateError>;

  async fn save_reconciliation(&self, instance_id: &str, result: &ReconciliationCheckResult) -> Result<(), StateError>;

  async fn update_instance_status(&self, instance_id: &str, status: RunStatus) -> Result<(), StateError> {
    self
      .update_instance(
        instance_id,
        Box::new(move |instance| {
          instance.status = status;
          if status == RunStatus::Completed {
            instance.last_deployed = Some(now_unix());
          }
        }),
      )
      .await
  }

  async fn save_resource(&self, instance_id: &str, resource: ResourceState) -> Result<(), StateError> {
    self
      .update_instance(
        instance_id,
        Box::new(move |instance| {
          instance.resources.insert(resource.name.clone(), resource);
        }),
      )
      .await
  }

  /// Set a resource's status, creating a placeholder record if none exists.
  async fn update_resource_status(
    &self,
    instance_id: &str,
    name: &str,
    resource_type: &str,
    status: ElementStatus,
    reasons: Vec<String>,
  ) -> Result<(), StateError> {
    let name = name.to_string();
    let resource_type = resource_type.to_string();
    self
      .update_instance(
        instance_id,
        Box::new(move |instance| {
          let entry = instance
            .resources
            .entry(name.clone())
            .or_insert_with(|| ResourceState::new(name, resource_type, MappingNode::None));
          entry.status = status;
          entry.failure_reasons = reasons;
        }),
      )
      .await
  }

  async fn remove_resource(&self, instance_id: &str, name: &str) -> Result<(), StateError> {
    let name = name.to_string();
    self
      .update_instance(
        instance_id,
        Box::new(move |instance| {
          instance.resources.remove(&name);
        }),
      )
      .await
  }

  async fn save_link(&self, instance_id: &str, link: LinkState) -> Result<(), StateError> {
    self
      .update_instance(
        instance_id,
        Box::new(move |instance| {
          instance.links.insert(link.name.clone(), link);
        }),
      )
      .await
  }

  /// Set a link's status, creating a placeholder record if none exists.
  async fn update_link_status(
    &self,
    instance_id: &str,
    name: &str,
    endpoints: (&str, &str),
    status: ElementStatus,
    reasons: Vec<String>,
  ) -> Result<(), StateError> {
    let name = name.to_string();
    let (resource_a, resource_b) = (endpoints.0.to_string(), endpoints.1.to_string());
    self
      .update_instance(
        instance_id,
        Box::new(move |instance| {
          let entry = instance.links.entry(name.clone()).or_insert_with(|| LinkState {
            name,
            resource_a,
            resource_b,
            link_data: MappingNode::None,
            status,
            failure_reasons: Vec::new(),
          });
          entry.status = status;
          entry.failure_reasons = reasons;
        }),
      )
      .await
  }

  async fn remove_link(&self, instance_id: &str, name: &str) -> Result<(), StateError> {
    let name = name.to_string();
    self
      .update_instance(
        instance_id,
        Box::new(move |instance| {
          instance.links.remove(&name);
        }),
      )
      .await
  }

  async fn save_child(&self, instance_id: &str, name: &str, child_instance_id: &str) -> Result<(), StateError> {
    let (name, child_id) = (name.to_string(), child_instance_id.to_string());
    self
      .update_instance(
        instance_id,
        Box::new(move |instance| {
          instance.children.insert(name, child_id);
        }),
      )
      .await
  }

  async fn remove_child(&self, instance_id: &str, name: &str) -> Result<(), StateError> {
    let name = name.to_string();
    self
      .update_instance(
        instance_id,
        Box::new(move |instance| {
          instance.children.remove(&name);
        }),
      )
      .await
  }

  async fn save_exports(&self, instance_id: &str, exports: BTreeMap<String, MappingNode>) -> Result<(), StateError> {
    self
      .update_instance(
        instance_id,
        Box::new(move |instance| {
          instance.exports = exports;
        }),
      )
      .await
  }
}
