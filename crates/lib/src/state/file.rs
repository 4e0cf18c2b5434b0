//! JSON file state container.
//!
//! # Storage Layout
//!
//! ```text
//! {root}/
//! ├── instances/<instance-id>.json
//! ├── changesets/<changeset-id>.json
//! └── reconciliations/<instance-id>.json
//! ```
//!
//! Every write goes to a temporary file in the target directory which is
//! then renamed over the destination, so readers never observe a partial
//! document.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ChangesetRecord, InstanceState, InstanceUpdate, StateContainer, StateError};
use crate::reconcile::ReconciliationCheckResult;

const INSTANCES_DIR: &str = "instances";
const CHANGESETS_DIR: &str = "changesets";
const RECONCILIATIONS_DIR: &str = "reconciliations";

#[derive(Debug)]
pub struct FileStateContainer {
  root: PathBuf,
  /// Serializes read-modify-write cycles on instance files.
  write_lock: Mutex<()>,
}

impl FileStateContainer {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      write_lock: Mutex::new(()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn record_path(&self, dir: &str, id: &str) -> Result<PathBuf, StateError> {
    if id.is_empty() || id.contains(&['/', '\\'][..]) || id == "." || id == ".." {
      return Err(StateError::InvalidId(id.to_string()));
    }
    Ok(self.root.join(dir).join(format!("{id}.json")))
  }

  fn read_instance(&self, instance_id: &str) -> Result<Option<InstanceState>, StateError> {
    read_json(&self.record_path(INSTANCES_DIR, instance_id)?)
  }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
  let content = match fs::read_to_string(path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(StateError::Io(e)),
  };
  Ok(Some(serde_json::from_str(&content)?))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
  let dir = path
    .parent()
    .ok_or_else(|| StateError::InvalidId(path.display().to_string()))?;
  fs::create_dir_all(dir)?;

  let content = serde_json::to_vec_pretty(value)?;
  let mut temp = NamedTempFile::new_in(dir)?;
  temp.write_all(&content)?;
  temp.as_file().sync_all()?;
  temp.persist(path)?;

  debug!(path = %path.display(), "wrote state file");
  Ok(())
}

#[async_trait]
impl StateContainer for FileStateContainer {
  async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceState>, StateError> {
    self.read_instance(instance_id)
  }

  async fn save_instance(&self, instance: &InstanceState) -> Result<(), StateError> {
    let _guard = self.write_lock.lock().await;
    write_json_atomic(&self.record_path(INSTANCES_DIR, &instance.instance_id)?, instance)
  }

  async fn remove_instance(&self, instance_id: &str) -> Result<Option<InstanceState>, StateError> {
    let _guard = self.write_lock.lock().await;
    let path = self.record_path(INSTANCES_DIR, instance_id)?;
    let existing = read_json(&path)?;
    if existing.is_some() {
      fs::remove_file(&path)?;
    }
    Ok(existing)
  }

  async fn update_instance(&self, instance_id: &str, update: InstanceUpdate) -> Result<(), StateError> {
    let _guard = self.write_lock.lock().await;
    let mut instance = self
      .read_instance(instance_id)?
      .ok_or_else(|| StateError::InstanceNotFound(instance_id.to_string()))?;
    update(&mut instance);
    write_json_atomic(&self.record_path(INSTANCES_DIR, instance_id)?, &instance)
  }

  async fn save_changeset(&self, record: &ChangesetRecord) -> Result<(), StateError> {
    write_json_atomic(&self.record_path(CHANGESETS_DIR, &record.id)?, record)
  }

  async fn get_changeset(&self, id: &str) -> Result<Option<ChangesetRecord>, StateError> {
    read_json(&self.record_path(CHANGESETS_DIR, id)?)
  }

  async fn save_reconciliation(&self, instance_id: &str, result: &ReconciliationCheckResult) -> Result<(), StateError> {
    write_json_atomic(&self.record_path(RECONCILIATIONS_DIR, instance_id)?, result)
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;
  use crate::state::{ElementStatus, ResourceState, RunStatus};
  use crate::value::MappingNode;

  #[tokio::test]
  async fn missing_instance_is_none() {
    let dir = TempDir::new().unwrap();
    let state = FileStateContainer::new(dir.path());
    assert!(state.get_instance("nope").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn instance_roundtrips_through_disk() {
    let dir = TempDir::new().unwrap();
    let state = FileStateContainer::new(dir.path());

    let mut instance = InstanceState::new("inst-1");
    instance.resources.insert(
      "orders".to_string(),
      ResourceState::new("orders", "test/table", MappingNode::fields([("name", MappingNode::string("orders"))])),
    );
    state.save_instance(&instance).await.unwrap();

    assert!(dir.path().join("instances").join("inst-1.json").exists());

    state
      .update_resource_status("inst-1", "orders", "test/table", ElementStatus::Failed, vec!["boom".to_string()])
      .await
      .unwrap();
    state.update_instance_status("inst-1", RunStatus::Failed).await.unwrap();

    // A fresh container sees the persisted updates.
    let reopened = FileStateContainer::new(dir.path());
    let loaded = reopened.get_instance("inst-1").await.unwrap().unwrap();
    assert_eq!(loaded.status, RunStatus::Failed);
    assert_eq!(loaded.resources["orders"].status, ElementStatus::Failed);
    assert_eq!(loaded.resources["orders"].failure_reasons, vec!["boom".to_string()]);
  }

  #[tokio::test]
  async fn remove_instance_deletes_file() {
    let dir = TempDir::new().unwrap();
    let state = FileStateContainer::new(dir.path());
    state.save_instance(&InstanceState::new("inst-1")).await.unwrap();

    let removed = state.remove_instance("inst-1").await.unwrap();
    assert!(removed.is_some());
    assert!(state.get_instance("inst-1").await.unwrap().is_none());
    assert!(state.remove_instance("inst-1").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn rejects_path_like_ids() {
    let dir = TempDir::new().unwrap();
    let state = FileStateContainer::new(dir.path());
    let err = state.get_instance("../escape").await.unwrap_err();
    assert!(matches!(err, StateError::InvalidId(_)));
  }
}
