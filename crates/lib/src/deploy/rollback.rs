//! Best-effort rollback of a failed deployment.
//!
//! Every element a run changed leaves a [`Revert`]. When the run fails and
//! the caller asked for rollback, the reverts are applied newest first.
//! Anything that cannot be put back is reported rather than aborting the
//! rest of the rollback.

use thiserror::Error;
use tracing::{info, warn};

use super::{DeployRun, emit, resource_info};
use crate::deploy::types::{DeployEvent, RollbackSummary, SkippedRollbackItem};
use crate::graph::{ElementId, link_name};
use crate::registry::{LinkDeployInput, LinkDestroyInput, ProviderError, RegistryError, ResourceDeployInput};
use crate::state::{LinkState, ResourceState, StateError};

/// How to undo one successful change.
#[derive(Debug, Clone)]
pub(crate) enum Revert {
  ResourceCreated {
    resource: ResourceState,
  },
  ResourceChanged {
    prior: ResourceState,
    current: ResourceState,
    recreated: bool,
  },
  ResourceDeleted {
    prior: ResourceState,
  },
  LinkCreated {
    link: LinkState,
  },
  LinkChanged {
    name: String,
  },
  LinkDeleted {
    link: LinkState,
  },
  ChildCreated {
    name: String,
    child_instance_id: String,
  },
  ChildChanged {
    name: String,
  },
  ChildDeleted {
    name: String,
  },
}

impl Revert {
  pub(crate) fn element(&self) -> ElementId {
    match self {
      Revert::ResourceCreated { resource } => ElementId::Resource(resource.name.clone()),
      Revert::ResourceChanged { prior, .. } | Revert::ResourceDeleted { prior } => {
        ElementId::Resource(prior.name.clone())
      }
      Revert::LinkCreated { link } | Revert::LinkDeleted { link } => ElementId::Link(link.name.clone()),
      Revert::LinkChanged { name } => ElementId::Link(name.clone()),
      Revert::ChildCreated { name, .. } | Revert::ChildChanged { name } | Revert::ChildDeleted { name } => {
        ElementId::Child(name.clone())
      }
    }
  }
}

#[derive(Debug, Error)]
pub(crate) enum RevertError {
  #[error("provider marks the resource type as irreversible")]
  Irreversible,

  #[error("reverting {0} is not supported")]
  NotSupported(&'static str),

  #[error("provider call failed: {0}")]
  Provider(#[from] ProviderError),

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  State(#[from] StateError),

  #[error("could not destroy child instance: {0}")]
  ChildDestroy(String),
}

impl DeployRun {
  /// Apply reverts newest first.
  pub(super) async fn rollback(&self, reverts: Vec<Revert>) -> RollbackSummary {
    info!(instance = %self.instance_id, changes = reverts.len(), "rolling back deployment");
    let mut summary = RollbackSummary::default();

    for revert in reverts.into_iter().rev() {
      let element = revert.element();
      let reverted = match self.revert(revert).await {
        Ok(()) => {
          summary.reverted.push(element.to_string());
          true
        }
        Err(err) => {
          warn!(element = %element, reason = %err, "could not roll back element");
          summary.skipped.push(SkippedRollbackItem {
            element: element.to_string(),
            reason: err.to_string(),
          });
          false
        }
      };
      emit(
        &self.events,
        DeployEvent::Rollback {
          instance_id: self.instance_id.clone(),
          element: element.to_string(),
          reverted,
        },
      );
    }

    info!(
      instance = %self.instance_id,
      reverted = summary.reverted.len(),
      skipped = summary.skipped.len(),
      "rollback finished"
    );
    summary
  }

  async fn revert(&self, revert: Revert) -> Result<(), RevertError> {
    let registry = self.orchestrator.registry();
    let element = revert.element();

    match revert {
      Revert::ResourceCreated { resource } => {
        let provider = registry.resource(&resource.resource_type)?;
        if provider.definition().irreversible {
          return Err(RevertError::Irreversible);
        }
        let info = resource_info(&self.instance_id, &resource);
        self
          .orchestrator
          .call_provider(&element, "destroy", || {
            let provider = provider.clone();
            let info = info.clone();
            async move { provider.destroy(&info).await }
          })
          .await?;
        self.state().remove_resource(&self.instance_id, &resource.name).await?;
      }

      Revert::ResourceChanged {
        prior,
        current,
        recreated,
      } => {
        let provider = registry.resource(&prior.resource_type)?;
        if provider.definition().irreversible {
          return Err(RevertError::Irreversible);
        }
        if recreated {
          let info = resource_info(&self.instance_id, &current);
          self
            .orchestrator
            .call_provider(&element, "destroy", || {
              let provider = provider.clone();
              let info = info.clone();
              async move { provider.destroy(&info).await }
            })
            .await?;
        }
        let input = ResourceDeployInput {
          resource: resource_info(&self.instance_id, &prior),
          prior_spec: (!recreated).then(|| current.spec.clone()),
        };
        self
          .orchestrator
          .call_provider(&element, "deploy", || {
            let provider = provider.clone();
            let input = input.clone();
            async move { provider.deploy(input).await }
          })
          .await?;
        self.state().save_resource(&self.instance_id, prior).await?;
      }

      Revert::ResourceDeleted { prior } => {
        let provider = registry.resource(&prior.resource_type)?;
        if provider.definition().irreversible {
          return Err(RevertError::Irreversible);
        }
        let input = ResourceDeployInput {
          resource: resource_info(&self.instance_id, &prior),
          prior_spec: None,
        };
        self
          .orchestrator
          .call_provider(&element, "deploy", || {
            let provider = provider.clone();
            let input = input.clone();
            async move { provider.deploy(input).await }
          })
          .await?;
        self.state().save_resource(&self.instance_id, prior).await?;
      }

      Revert::LinkCreated { link } => {
        if let Some(provider) = self.link_provider(&link) {
          let input = LinkDestroyInput {
            instance_id: self.instance_id.clone(),
            link_name: link.name.clone(),
            link_data: link.link_data.clone(),
          };
          self
            .orchestrator
            .call_provider(&element, "unlink", || {
              let provider = provider.clone();
              let input = input.clone();
              async move { provider.destroy(input).await }
            })
            .await?;
        }
        self.state().remove_link(&self.instance_id, &link.name).await?;
      }

      Revert::LinkDeleted { link } => {
        let (Some(a), Some(b)) = (
          self.prior.resources.get(&link.resource_a),
          self.prior.resources.get(&link.resource_b),
        ) else {
          return Err(RevertError::NotSupported("links whose resources are gone"));
        };
        let provider = registry
          .link(&a.resource_type, &b.resource_type)
          .ok_or(RevertError::NotSupported("links without a provider"))?;
        let input = LinkDeployInput {
          instance_id: self.instance_id.clone(),
          link_name: link_name(&link.resource_a, &link.resource_b),
          resource_a: resource_info(&self.instance_id, a),
          resource_b: resource_info(&self.instance_id, b),
          prior_link_data: None,
        };
        let link_data = self
          .orchestrator
          .call_provider(&element, "link", || {
            let provider = provider.clone();
            let input = input.clone();
            async move { provider.deploy(input).await }
          })
          .await?;
        self
          .state()
          .save_link(&self.instance_id, LinkState { link_data, ..link })
          .await?;
      }

      Revert::ChildCreated {
        name,
        child_instance_id,
      } => {
        let summary = self
          .orchestrator
          .run_destroy(child_instance_id, self.events.clone(), self.cancel.clone())
          .await
          .map_err(|err| RevertError::ChildDestroy(err.to_string()))?;
        if summary.status != crate::state::RunStatus::Completed {
          return Err(RevertError::ChildDestroy(format!("{:?}", summary.status)));
        }
        self.state().remove_child(&self.instance_id, &name).await?;
      }

      Revert::LinkChanged { .. } => return Err(RevertError::NotSupported("link updates")),
      Revert::ChildChanged { .. } => return Err(RevertError::NotSupported("child blueprint updates")),
      Revert::ChildDeleted { .. } => return Err(RevertError::NotSupported("child blueprint removal")),
    }

    info!(element = %element, "rolled back");
    Ok(())
  }

  fn link_provider(&self, link: &LinkState) -> Option<std::sync::Arc<dyn crate::registry::LinkProvider>> {
    let resources = &self.prior.resources;
    let type_of = |name: &str| {
      resources
        .get(name)
        .map(|r| r.resource_type.clone())
        .or_else(|| self.changes.resources.get(name).map(|c| c.resource_type.clone()))
    };
    let (a, b) = (type_of(&link.resource_a)?, type_of(&link.resource_b)?);
    self.orchestrator.registry().link(&a, &b)
  }
}
