//! In-memory state container.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{ChangesetRecord, InstanceState, InstanceUpdate, StateContainer, StateError};
use crate::reconcile::ReconciliationCheckResult;

#[derive(Debug, Default)]
struct Records {
  instances: HashMap<String, InstanceState>,
  changesets: HashMap<String, ChangesetRecord>,
  reconciliations: HashMap<String, ReconciliationCheckResult>,
}

/// Keeps every record in process memory behind one lock.
#[derive(Debug, Default)]
pub struct MemoryStateContainer {
  records: Mutex<Records>,
}

impl MemoryStateContainer {
  pub fn new() -> Self {
    Self::default()
  }

  /// The most recent reconciliation result recorded for an instance.
  pub fn last_reconciliation(&self, instance_id: &str) -> Option<ReconciliationCheckResult> {
    self.lock().reconciliations.get(instance_id).cloned()
  }

  fn lock(&self) -> MutexGuard<'_, Records> {
    self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

#[async_trait]
impl StateContainer for MemoryStateContainer {
  async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceState>, StateError> {
    Ok(self.lock().instances.get(instance_id).cloned())
  }

  async fn save_instance(&self, instance: &InstanceState) -> Result<(), StateError> {
    self
      .lock()
      .instances
      .insert(instance.instance_id.clone(), instance.clone());
    Ok(())
  }

  async fn remove_instance(&self, instance_id: &str) -> Result<Option<InstanceState>, StateError> {
    Ok(self.lock().instances.remove(instance_id))
  }

  async fn update_instance(&self, instance_id: &str, update: InstanceUpdate) -> Result<(), StateError> {
    let mut records = self.lock();
    let instance = records
      .instances
      .get_mut(instance_id)
      .ok_or_else(|| StateError::InstanceNotFound(instance_id.to_string()))?;
    update(instance);
    Ok(())
  }

  async fn save_changeset(&self, record: &ChangesetRecord) -> Result<(), StateError> {
    self.lock().changesets.insert(record.id.clone(), record.clone());
    Ok(())
  }

  async fn get_changeset(&self, id: &str) -> Result<Option<ChangesetRecord>, StateError> {
    Ok(self.lock().changesets.get(id).cloned())
  }

  async fn save_reconciliation(&self, instance_id: &str, result: &ReconciliationCheckResult) -> Result<(), StateError> {
    self
      .lock()
      .reconciliations
      .insert(instance_id.to_string(), result.clone());
    Ok(())
  }
}
