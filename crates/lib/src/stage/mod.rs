//! Change staging.
//!
//! Staging resolves a blueprint against the recorded state of an instance
//! and works out what a deployment would create, update, recreate or
//! delete, without calling any provider that changes infrastructure.
//!
//! # Process
//!
//! 1. If the instance exists, the drift detector runs first. Drift stops
//!    staging unless the caller acknowledges it.
//! 2. The blueprint is prepared (variables, templates, conditions, graph).
//! 3. Elements are staged wave by wave in dependency order, so a resource
//!    marked for recreation is known before its dependents are resolved.
//! 4. Recorded elements missing from the blueprint become deletions, then
//!    exports are compared with their recorded values.
//!
//! Resolution problems are attached to the element as diagnostics and the
//! remaining elements are still staged.

pub mod diff;
pub mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::blueprint::{PrepareError, PreparedBlueprint, prepare};
use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostic, ReasonCode};
use crate::graph::ElementId;
use crate::reconcile::{DriftDetector, ReconcileError, ReconciliationCheckResult};
use crate::registry::{ProviderError, ProviderRegistry};
use crate::resolve::{BoxFuture, ChildExportFieldInfo, ResolveFor, ResolveInputs, Resolution};
use crate::schema::Blueprint;
use crate::state::{ChangesetRecord, ElementStatus, InstanceState, StateContainer, StateError, now_unix};
use crate::substitution::SourceRange;
use crate::util::cancel::CancelToken;
use crate::util::hash::{Hashable, hash_bytes};
use crate::value::{MappingNode, PropertyPath};

pub use diff::{SpecDiff, diff_specs};
pub use types::{
  ActionCounts, BlueprintChanges, ChangeAction, ChangeSummary, ChildChanges, ExportChange, FieldChange, LinkChanges,
  ResourceChanges,
};

/// Fetches the source text of an included blueprint.
#[async_trait]
pub trait ChildResolver: Send + Sync {
  async fn resolve(&self, include_name: &str, path: &str) -> Result<String, ProviderError>;
}

/// Turns blueprint source text into the blueprint object graph.
pub trait BlueprintLoader: Send + Sync {
  fn load(&self, source: &str) -> Result<Blueprint, ProviderError>;
}

/// Loads blueprints serialized as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBlueprintLoader;

impl BlueprintLoader for JsonBlueprintLoader {
  fn load(&self, source: &str) -> Result<Blueprint, ProviderError> {
    serde_json::from_str(source).map_err(|e| ProviderError::new(format!("invalid blueprint: {e}")))
  }
}

#[derive(Debug, Error)]
pub enum StageError {
  #[error(transparent)]
  Prepare(#[from] PrepareError),

  #[error(transparent)]
  State(#[from] StateError),

  #[error(transparent)]
  Reconcile(#[from] ReconcileError),

  #[error("include cycle: {}", .chain.join(" -> "))]
  IncludeCycle { chain: Vec<String> },

  #[error("child '{child}' exceeds the maximum include depth of {max}")]
  MaxIncludeDepth { child: String, max: usize },

  #[error("failed to serialize change set: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("staging task failed: {0}")]
  Task(String),

  #[error("staging was cancelled")]
  Cancelled,
}

impl StageError {
  pub fn to_diagnostic(&self) -> Diagnostic {
    match self {
      StageError::IncludeCycle { .. } => Diagnostic::error(ReasonCode::ChildIncludeCycle, self.to_string()),
      StageError::MaxIncludeDepth { child, .. } => {
        Diagnostic::error(ReasonCode::MaxIncludeDepth, self.to_string()).for_element(format!("children.{child}"))
      }
      StageError::Prepare(PrepareError::Graph(err)) => err.to_diagnostic(),
      other => Diagnostic::error(ReasonCode::ChildLoadFailed, other.to_string()),
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct StageOptions {
  /// The instance to stage against. `None` stages a brand new deployment
  /// and does not record the change set.
  pub instance_id: Option<String>,
  pub params: BTreeMap<String, MappingNode>,
  /// Stage even if the instance has drifted.
  pub allow_drift: bool,
  /// Path of the blueprint document, used for include cycle detection and
  /// call stack traces.
  pub source_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "result", rename_all = "snake_case")]
pub enum StageOutcome {
  Changes(BlueprintChanges),
  /// The instance drifted from its recorded state and nothing was staged.
  Drift(ReconciliationCheckResult),
}

impl StageOutcome {
  pub fn changes(self) -> Option<BlueprintChanges> {
    match self {
      StageOutcome::Changes(changes) => Some(changes),
      StageOutcome::Drift(_) => None,
    }
  }
}

/// Stages blueprints against recorded instance state.
#[derive(Clone)]
pub struct ChangeStager {
  pub(crate) registry: Arc<ProviderRegistry>,
  pub(crate) state: Arc<dyn StateContainer>,
  pub(crate) config: EngineConfig,
  pub(crate) child_resolver: Option<Arc<dyn ChildResolver>>,
  pub(crate) loader: Arc<dyn BlueprintLoader>,
}

/// Staged changes plus the export values, for parents of a child.
struct Staged {
  changes: BlueprintChanges,
  exports: BTreeMap<String, ChildExportFieldInfo>,
}

impl ChangeStager {
  pub fn new(registry: Arc<ProviderRegistry>, state: Arc<dyn StateContainer>, config: EngineConfig) -> Self {
    Self {
      registry,
      state,
      config,
      child_resolver: None,
      loader: Arc::new(JsonBlueprintLoader),
    }
  }

  pub fn with_child_resolver(mut self, resolver: impl ChildResolver + 'static) -> Self {
    self.child_resolver = Some(Arc::new(resolver));
    self
  }

  pub fn with_loader(mut self, loader: impl BlueprintLoader + 'static) -> Self {
    self.loader = Arc::new(loader);
    self
  }

  /// Stage `blueprint` for the instance named in `options`.
  ///
  /// # Errors
  ///
  /// Returns an error if the blueprint cannot be prepared, an include
  /// cycle or depth violation is found, or state cannot be read or
  /// written. Problems with individual elements are diagnostics on the
  /// returned changes instead.
  pub async fn stage(
    &self,
    blueprint: Blueprint,
    options: StageOptions,
    cancel: &CancelToken,
  ) -> Result<StageOutcome, StageError> {
    info!(instance = ?options.instance_id, "staging changes");

    let prior = match &options.instance_id {
      Some(id) => self.state.get_instance(id).await?,
      None => None,
    };

    let mut acknowledged = false;
    if let Some(prior) = &prior
      && self.config.check_drift
    {
      let report = DriftDetector::new(self.registry.clone(), self.state.clone())
        .check(prior)
        .await?;
      if report.drift_detected {
        if !options.allow_drift {
          warn!(instance = %prior.instance_id, elements = ?report.affected_elements(), "drift detected, nothing staged");
          return Ok(StageOutcome::Drift(report));
        }
        warn!(instance = %prior.instance_id, elements = ?report.affected_elements(), "staging over acknowledged drift");
        acknowledged = true;
      }
    }

    let ancestry = options.source_path.iter().cloned().collect();
    let staged = self
      .stage_blueprint(Arc::new(blueprint), options.clone(), prior, ancestry, cancel.clone())
      .await?;

    let mut changes = staged.changes;
    if acknowledged {
      changes.acknowledged_drift = true;
      changes.diagnostics.push(Diagnostic::warning(
        ReasonCode::DriftAcknowledged,
        "the instance has drifted from its recorded state",
      ));
    }

    if let Some(instance_id) = &options.instance_id {
      let created_at = now_unix();
      let id = hash_bytes(&serde_json::to_vec(&(instance_id, created_at, &changes))?).0;
      changes.changeset_id = Some(id.clone());
      self
        .state
        .save_changeset(&ChangesetRecord {
          id,
          instance_id: Some(instance_id.clone()),
          changes: changes.clone(),
          created_at,
        })
        .await?;
    }

    info!(
      resources = changes.summary.resources.total(),
      links = changes.summary.links.total(),
      children = changes.summary.children.total(),
      exports = changes.summary.exports.total(),
      errors = changes.has_errors(),
      "staging complete"
    );
    Ok(StageOutcome::Changes(changes))
  }

  fn stage_blueprint(
    &self,
    blueprint: Arc<Blueprint>,
    options: StageOptions,
    prior: Option<InstanceState>,
    ancestry: Vec<String>,
    cancel: CancelToken,
  ) -> BoxFuture<'_, Result<Staged, StageError>> {
    Box::pin(async move {
      let inputs = ResolveInputs {
        params: options.params.clone(),
        prior: prior.clone(),
        child_exports: self.recorded_child_exports(prior.as_ref()).await?,
        source_path: options.source_path.clone(),
      };
      let prepared = prepare(blueprint, Arc::new(inputs), self.registry.clone()).await?;

      let mut changes = BlueprintChanges {
        diagnostics: prepared.diagnostics.clone(),
        ..Default::default()
      };

      let run = Arc::new(StageRun {
        stager: self.clone(),
        prepared,
        prior,
        options,
        ancestry,
      });
      let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

      for (idx, wave) in run.prepared.graph.execution_waves().into_iter().enumerate() {
        if cancel.is_cancelled() {
          return Err(StageError::Cancelled);
        }
        debug!(wave = idx, elements = wave.len(), "staging wave");

        let changed: Arc<BTreeSet<String>> = Arc::new(changes.resources.keys().cloned().collect());
        let mut join_set = JoinSet::new();
        for element in wave {
          if run.is_excluded(&element) {
            debug!(element = %element, "skipping excluded element");
            continue;
          }
          let run = run.clone();
          let semaphore = semaphore.clone();
          let changed = changed.clone();
          let cancel = cancel.clone();
          join_set.spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
              return Err(StageError::Cancelled);
            };
            run.stage_element(element, &changed, cancel).await
          });
        }

        while let Some(joined) = join_set.join_next().await {
          match joined {
            Ok(Ok(staged)) => staged.merge_into(&mut changes),
            Ok(Err(err)) => return Err(err),
            Err(err) => {
              error!(error = %err, "staging task panicked");
              return Err(StageError::Task(err.to_string()));
            }
          }
        }
      }

      run.stage_removals(&mut changes);
      let exports = run.stage_exports(&mut changes).await;
      changes.summarize();
      Ok(Staged { changes, exports })
    })
  }

  pub(crate) async fn recorded_child_exports(
    &self,
    prior: Option<&InstanceState>,
  ) -> Result<BTreeMap<String, BTreeMap<String, MappingNode>>, StateError> {
    let mut out = BTreeMap::new();
    let Some(prior) = prior else {
      return Ok(out);
    };
    for (name, child_id) in &prior.children {
      if let Some(child) = self.state.get_instance(child_id).await? {
        out.insert(name.clone(), child.exports);
      }
    }
    Ok(out)
  }
}

/// The result of staging one element.
enum StagedElement {
  Resource {
    name: String,
    changes: Option<ResourceChanges>,
    diagnostics: Vec<Diagnostic>,
  },
  Link {
    name: String,
    changes: Option<LinkChanges>,
  },
  Child {
    name: String,
    changes: Option<ChildChanges>,
    diagnostics: Vec<Diagnostic>,
  },
}

impl StagedElement {
  fn merge_into(self, out: &mut BlueprintChanges) {
    match self {
      StagedElement::Resource {
        name,
        changes,
        diagnostics,
      } => {
        out.diagnostics.extend(diagnostics);
        if let Some(changes) = changes {
          out.resources.insert(name, changes);
        }
      }
      StagedElement::Link { name, changes } => {
        if let Some(changes) = changes {
          out.links.insert(name, changes);
        }
      }
      StagedElement::Child {
        name,
        changes,
        diagnostics,
      } => {
        out.diagnostics.extend(diagnostics);
        if let Some(changes) = changes {
          out.children.insert(name, changes);
        }
      }
    }
  }
}

/// State shared by the element tasks of one staging pass.
struct StageRun {
  stager: ChangeStager,
  prepared: PreparedBlueprint,
  prior: Option<InstanceState>,
  options: StageOptions,
  /// Include paths from the root blueprint down to this one.
  ancestry: Vec<String>,
}

impl StageRun {
  fn is_excluded(&self, element: &ElementId) -> bool {
    match element {
      ElementId::Resource(name) => self.prepared.expansion.is_resource_excluded(name),
      ElementId::Child(name) => self.prepared.expansion.is_child_excluded(name),
      ElementId::Link(_) => false,
    }
  }

  async fn stage_element(
    &self,
    element: ElementId,
    changed: &BTreeSet<String>,
    cancel: CancelToken,
  ) -> Result<StagedElement, StageError> {
    match element {
      ElementId::Resource(name) => {
        let (changes, diagnostics) = self.stage_resource(&name).await;
        Ok(StagedElement::Resource {
          name,
          changes,
          diagnostics,
        })
      }
      ElementId::Link(name) => {
        let changes = self.stage_link(&name, changed);
        Ok(StagedElement::Link { name, changes })
      }
      ElementId::Child(name) => self.stage_child(name, cancel).await,
    }
  }

  fn resource_range(&self, name: &str) -> Option<SourceRange> {
    let instance = self.prepared.expansion.instance(name)?;
    self.prepared.blueprint.resources.get(&instance.template)?.range
  }

  fn depends_on(&self, element: &ElementId) -> Vec<String> {
    self
      .prepared
      .graph
      .dependencies(element)
      .iter()
      .map(ToString::to_string)
      .collect()
  }

  async fn stage_resource(&self, name: &str) -> (Option<ResourceChanges>, Vec<Diagnostic>) {
    let element = format!("resources.{name}");
    let resolver = &self.prepared.resolver;
    let mut diagnostics = Vec::new();

    let resolved = match resolver.resolve_resource(name, ResolveFor::ChangeStaging).await {
      Ok(resolved) => resolved,
      Err(err) => {
        debug!(resource = %name, error = %err, "resource failed to resolve");
        diagnostics.push(err.to_diagnostic(&element, self.resource_range(name)));
        return (None, diagnostics);
      }
    };

    let provider = match self.stager.registry.resource(&resolved.resource_type) {
      Ok(provider) => provider,
      Err(err) => {
        diagnostics.push(
          Diagnostic::error(ReasonCode::ProviderNotFound, err.to_string())
            .for_element(&element)
            .with_range(self.resource_range(name)),
        );
        return (None, diagnostics);
      }
    };
    let definition = provider.definition();
    let patterns = definition.field_patterns();
    diagnostics.extend(
      patterns
        .invalid
        .iter()
        .map(|err| Diagnostic::warning(ReasonCode::InvalidPathPattern, err.to_string()).for_element(&element)),
    );

    let desired = resolved.root();
    let spec_hash = if resolved.is_fully_resolved() {
      desired.compute_hash().ok().map(|hash| hash.0)
    } else {
      None
    };
    let deferred: Vec<PropertyPath> = resolved.deferred.iter().map(|d| d.path.clone()).collect();

    let prior = self
      .prior
      .as_ref()
      .and_then(|prior| prior.resources.get(name))
      .filter(|prior| !prior.spec.is_none());

    let (action, diff) = match prior {
      None => (ChangeAction::Create, diff_specs(None, &desired, &patterns.computed, &deferred)),
      Some(prior) => {
        if prior.status == ElementStatus::Succeeded && spec_hash.is_some() && prior.spec_hash == spec_hash {
          debug!(resource = %name, "spec hash unchanged");
          return (None, diagnostics);
        }

        let recorded = MappingNode::fields([("spec", prior.spec.clone()), ("metadata", prior.metadata.clone())]);
        let diff = diff_specs(Some(&recorded), &desired, &patterns.computed, &deferred);
        let replaces = diff
          .changed_paths()
          .filter_map(|path| PropertyPath::parse(path).ok())
          .any(|path| patterns.forces_replacement(&path));

        let action = if prior.resource_type != resolved.resource_type || replaces {
          ChangeAction::Recreate
        } else if diff.has_changes() || prior.status != ElementStatus::Succeeded {
          ChangeAction::Update
        } else {
          return (None, diagnostics);
        };
        (action, diff)
      }
    };

    if action == ChangeAction::Recreate {
      resolver.mark_replacing(name);
    }
    diagnostics.extend(diff.warnings.into_iter().map(|d| d.for_element(&element)));
    debug!(resource = %name, %action, "staged resource");

    (
      Some(ResourceChanges {
        action,
        resource_type: resolved.resource_type.clone(),
        new_fields: diff.new_fields,
        modified_fields: diff.modified_fields,
        removed_fields: diff.removed_fields,
        known_on_deploy: diff.known_on_deploy,
        depends_on: self.depends_on(&ElementId::Resource(name.to_string())),
        spec_hash,
      }),
      diagnostics,
    )
  }

  fn stage_link(&self, name: &str, changed: &BTreeSet<String>) -> Option<LinkChanges> {
    let endpoints = self.prepared.graph.link(name)?;
    let recorded = self.prior.as_ref().and_then(|prior| prior.links.get(name));

    let action = match recorded {
      None => ChangeAction::Create,
      Some(link) if link.status != ElementStatus::Succeeded => ChangeAction::Update,
      Some(_) if changed.contains(&endpoints.resource_a) || changed.contains(&endpoints.resource_b) => {
        ChangeAction::Update
      }
      Some(_) => return None,
    };

    debug!(link = %name, %action, "staged link");
    Some(LinkChanges {
      action,
      resource_a: endpoints.resource_a.clone(),
      resource_b: endpoints.resource_b.clone(),
    })
  }

  async fn stage_child(&self, name: String, cancel: CancelToken) -> Result<StagedElement, StageError> {
    let element = format!("children.{name}");
    let range = self.prepared.blueprint.includes.get(&name).and_then(|include| include.range);
    let failed = |diagnostic: Diagnostic| StagedElement::Child {
      name: name.clone(),
      changes: None,
      diagnostics: vec![diagnostic.for_element(&element).with_range(range)],
    };

    let recorded_id = self.prior.as_ref().and_then(|prior| prior.children.get(&name)).cloned();
    let child_instance_id = recorded_id.clone().or_else(|| {
      self
        .options
        .instance_id
        .as_ref()
        .map(|parent| format!("{parent}.{name}"))
    });
    let action = if recorded_id.is_some() {
      ChangeAction::Update
    } else {
      ChangeAction::Create
    };

    let (include, deferred) = match self
      .prepared
      .resolver
      .resolve_include(&name, ResolveFor::ChangeStaging)
      .await
    {
      Resolution::Resolved(node) => (node, Vec::new()),
      Resolution::Deferred { partial, deferred } => (partial, deferred),
      Resolution::Failed(err) => return Ok(failed(err.to_diagnostic(&element, range))),
    };
    let path = include
      .as_fields()
      .and_then(|fields| fields.get("path"))
      .and_then(MappingNode::as_str)
      .map(str::to_string);

    if !deferred.is_empty() {
      debug!(child = %name, "child include is only known on deploy");
      return Ok(StagedElement::Child {
        name: name.clone(),
        changes: Some(ChildChanges {
          action,
          path,
          child_instance_id,
          staged_on_deploy: true,
          changes: None,
        }),
        diagnostics: Vec::new(),
      });
    }

    let Some(path) = path else {
      return Ok(failed(Diagnostic::error(
        ReasonCode::InvalidReference,
        "include path must resolve to a string",
      )));
    };

    if self.ancestry.contains(&path) {
      let mut chain = self.ancestry.clone();
      chain.push(path);
      return Err(StageError::IncludeCycle { chain });
    }
    let max = self.stager.config.max_include_depth;
    if self.ancestry.len() >= max {
      return Err(StageError::MaxIncludeDepth { child: name.clone(), max });
    }

    let Some(child_resolver) = &self.stager.child_resolver else {
      return Ok(failed(Diagnostic::error(
        ReasonCode::ChildLoadFailed,
        "no child resolver is configured",
      )));
    };
    let source = match child_resolver.resolve(&name, &path).await {
      Ok(source) => source,
      Err(err) => {
        return Ok(failed(Diagnostic::error(
          ReasonCode::ChildLoadFailed,
          format!("failed to fetch '{path}': {err}"),
        )));
      }
    };
    let child_blueprint = match self.stager.loader.load(&source) {
      Ok(blueprint) => blueprint,
      Err(err) => {
        return Ok(failed(Diagnostic::error(
          ReasonCode::ChildLoadFailed,
          format!("failed to load '{path}': {err}"),
        )));
      }
    };

    let params = include
      .as_fields()
      .and_then(|fields| fields.get("variables"))
      .and_then(MappingNode::as_fields)
      .cloned()
      .unwrap_or_default();
    let child_prior = match &recorded_id {
      Some(id) => self.stager.state.get_instance(id).await?,
      None => None,
    };
    let child_options = StageOptions {
      instance_id: child_instance_id.clone(),
      params,
      allow_drift: self.options.allow_drift,
      source_path: Some(path.clone()),
    };
    let mut ancestry = self.ancestry.clone();
    ancestry.push(path.clone());

    debug!(child = %name, path = %path, "staging child blueprint");
    let staged = match self
      .stager
      .stage_blueprint(Arc::new(child_blueprint), child_options, child_prior, ancestry, cancel)
      .await
    {
      Ok(staged) => staged,
      Err(StageError::Prepare(err)) => {
        return Ok(StagedElement::Child {
          name: name.clone(),
          changes: None,
          diagnostics: err
            .diagnostics()
            .into_iter()
            .map(|d| Diagnostic {
              element: Some(element.clone()),
              range,
              message: match &d.element {
                Some(inner) => format!("{inner}: {}", d.message),
                None => d.message.clone(),
              },
              ..d
            })
            .collect(),
        });
      }
      Err(err) => return Err(err),
    };

    for (export, info) in staged.exports {
      self.prepared.resolver.set_child_export(&name, &export, info);
    }

    let changes = if recorded_id.is_some() && staged.changes.is_empty() && !staged.changes.has_errors() {
      None
    } else {
      Some(ChildChanges {
        action,
        path: Some(path),
        child_instance_id,
        staged_on_deploy: false,
        changes: Some(staged.changes),
      })
    };
    Ok(StagedElement::Child {
      name,
      changes,
      diagnostics: Vec::new(),
    })
  }

  /// Recorded elements that are no longer part of the blueprint.
  fn stage_removals(&self, changes: &mut BlueprintChanges) {
    let Some(prior) = &self.prior else {
      return;
    };
    let expansion = &self.prepared.expansion;

    for (name, resource) in &prior.resources {
      if expansion.instance(name).is_some() && !expansion.is_resource_excluded(name) {
        continue;
      }
      debug!(resource = %name, "staged resource removal");
      let mut removed = ResourceChanges::new(ChangeAction::Delete, resource.resource_type.clone());
      removed.depends_on = resource.depends_on.clone();
      changes.resources.insert(name.clone(), removed);
    }

    for (name, link) in &prior.links {
      if self.prepared.graph.link(name).is_some() {
        continue;
      }
      changes.links.insert(
        name.clone(),
        LinkChanges {
          action: ChangeAction::Delete,
          resource_a: link.resource_a.clone(),
          resource_b: link.resource_b.clone(),
        },
      );
    }

    for (name, child_id) in &prior.children {
      if self.prepared.blueprint.includes.contains_key(name) && !expansion.is_child_excluded(name) {
        continue;
      }
      changes.children.insert(
        name.clone(),
        ChildChanges {
          action: ChangeAction::Delete,
          path: None,
          child_instance_id: Some(child_id.clone()),
          staged_on_deploy: false,
          changes: None,
        },
      );
    }
  }

  async fn stage_exports(&self, changes: &mut BlueprintChanges) -> BTreeMap<String, ChildExportFieldInfo> {
    let recorded = self.prior.as_ref().map(|prior| &prior.exports);
    let mut exports = BTreeMap::new();

    for (name, export) in &self.prepared.blueprint.exports {
      let prev = recorded.and_then(|r| r.get(name)).cloned();
      let action = if prev.is_some() {
        ChangeAction::Update
      } else {
        ChangeAction::Create
      };

      match self
        .prepared
        .resolver
        .resolve_export(name, ResolveFor::ChangeStaging)
        .await
      {
        Resolution::Resolved(value) => {
          exports.insert(
            name.clone(),
            ChildExportFieldInfo {
              value: value.clone(),
              known: true,
            },
          );
          if prev.as_ref() != Some(&value) {
            changes.exports.insert(
              name.clone(),
              ExportChange {
                action,
                prev,
                new: Some(value),
                known_on_deploy: false,
              },
            );
          }
        }
        Resolution::Deferred { .. } => {
          exports.insert(
            name.clone(),
            ChildExportFieldInfo {
              value: MappingNode::None,
              known: false,
            },
          );
          changes.exports.insert(
            name.clone(),
            ExportChange {
              action,
              prev,
              new: None,
              known_on_deploy: true,
            },
          );
        }
        Resolution::Failed(err) => {
          changes
            .diagnostics
            .push(err.to_diagnostic(format!("exports.{name}"), export.range));
        }
      }
    }

    if let Some(recorded) = recorded {
      for (name, value) in recorded {
        if !self.prepared.blueprint.exports.contains_key(name) {
          changes.exports.insert(
            name.clone(),
            ExportChange {
              action: ChangeAction::Delete,
              prev: Some(value.clone()),
              new: None,
              known_on_deploy: false,
            },
          );
        }
      }
    }

    exports
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use serde_json::json;

  use super::*;
  use crate::registry::{LinkPriority, ResourceDefinition};
  use crate::schema::{Export, Include, Resource, Variable, VariableType};
  use crate::state::{LinkState, MemoryStateContainer, ResourceState, RunStatus};
  use crate::util::testutil::{TestLink, TestResource, expr};

  struct Sources(HashMap<String, String>);

  #[async_trait]
  impl ChildResolver for Sources {
    async fn resolve(&self, _include_name: &str, path: &str) -> Result<String, ProviderError> {
      self
        .0
        .get(path)
        .cloned()
        .ok_or_else(|| ProviderError::new(format!("{path} not found")))
    }
  }

  struct Fixture {
    table: TestResource,
    state: Arc<MemoryStateContainer>,
    stager: ChangeStager,
  }

  fn fixture() -> Fixture {
    let table = TestResource::new("test/table").with_definition(ResourceDefinition {
      computed_fields: vec!["spec.arn".to_string(), "spec.endpoints[*].id".to_string()],
      replace_on_change: vec!["spec.name".to_string()],
      ..Default::default()
    });
    let mut registry = ProviderRegistry::with_core_functions();
    registry.register_resource(table.clone());
    registry.register_resource(TestResource::new("test/function"));
    registry.register_link(TestLink::new("test/function", "test/table").with_priority(LinkPriority::ResourceB));

    let state = Arc::new(MemoryStateContainer::new());
    let stager = ChangeStager::new(Arc::new(registry), state.clone(), EngineConfig::default());
    Fixture { table, state, stager }
  }

  fn blueprint() -> Blueprint {
    let mut blueprint = Blueprint::default();
    blueprint
      .variables
      .insert("env".to_string(), Variable::new(VariableType::String).with_default("prod"));
    blueprint.resources.insert(
      "orders".to_string(),
      Resource::new(
        "test/table",
        MappingNode::fields([("name", expr("orders-${variables.env}")), ("size", MappingNode::int(1))]),
      )
      .with_labels(&[("app", "orders")]),
    );
    blueprint.resources.insert(
      "handler".to_string(),
      Resource::new(
        "test/function",
        MappingNode::fields([("table_arn", expr("${resources.orders.spec.arn}"))]),
      )
      .with_link_selector(&[("app", "orders")]),
    );
    blueprint.exports.insert(
      "table_name".to_string(),
      Export::new(expr("${resources.orders.spec.name}")),
    );
    blueprint
  }

  /// State as a successful deployment of `blueprint()` would record it.
  fn deployed() -> InstanceState {
    let mut instance = InstanceState::new("prod");
    instance.status = RunStatus::Completed;
    instance.resources.insert(
      "orders".to_string(),
      ResourceState::new(
        "orders",
        "test/table",
        MappingNode::from(json!({ "name": "orders-prod", "size": 1, "arn": "arn:orders" })),
      ),
    );
    let mut orders = instance.resources["orders"].clone();
    orders.metadata = MappingNode::from(json!({ "labels": { "app": "orders" } }));
    instance.resources.insert("orders".to_string(), orders);
    instance.resources.insert(
      "handler".to_string(),
      ResourceState::new("handler", "test/function", MappingNode::from(json!({ "table_arn": "arn:orders" }))),
    );
    instance.links.insert(
      "handler::orders".to_string(),
      LinkState {
        name: "handler::orders".to_string(),
        resource_a: "handler".to_string(),
        resource_b: "orders".to_string(),
        link_data: MappingNode::None,
        status: ElementStatus::Succeeded,
        failure_reasons: Vec::new(),
      },
    );
    instance
      .exports
      .insert("table_name".to_string(), MappingNode::string("orders-prod"));
    instance
  }

  fn options(instance_id: Option<&str>) -> StageOptions {
    StageOptions {
      instance_id: instance_id.map(str::to_string),
      ..Default::default()
    }
  }

  async fn stage(fx: &Fixture, blueprint: Blueprint, options: StageOptions) -> BlueprintChanges {
    fx.stager
      .stage(blueprint, options, &CancelToken::new())
      .await
      .unwrap()
      .changes()
      .expect("expected changes")
  }

  #[tokio::test]
  async fn new_deployment_creates_everything() {
    let fx = fixture();
    let changes = stage(&fx, blueprint(), options(None)).await;

    assert_eq!(changes.resources["orders"].action, ChangeAction::Create);
    let handler = &changes.resources["handler"];
    assert_eq!(handler.action, ChangeAction::Create);
    assert_eq!(handler.known_on_deploy, vec!["spec.table_arn"]);
    assert_eq!(handler.depends_on, vec!["resources.orders"]);
    assert_eq!(changes.links["handler::orders"].action, ChangeAction::Create);
    assert_eq!(changes.exports["table_name"].new, Some(MappingNode::string("orders-prod")));
    assert_eq!(changes.summary.resources.create, 2);
    assert_eq!(changes.summary.links.create, 1);
    assert!(changes.changeset_id.is_none());
  }

  #[tokio::test]
  async fn restaging_a_deployed_blueprint_is_empty() {
    let fx = fixture();
    fx.state.save_instance(&deployed()).await.unwrap();

    let changes = stage(&fx, blueprint(), options(Some("prod"))).await;
    assert!(changes.is_empty(), "{changes:#?}");
    assert!(!changes.has_errors());

    let id = changes.changeset_id.clone().unwrap();
    let record = fx.state.get_changeset(&id).await.unwrap().unwrap();
    assert_eq!(record.instance_id.as_deref(), Some("prod"));
  }

  #[tokio::test]
  async fn update_and_recreate_follow_replace_paths() {
    let fx = fixture();
    fx.state.save_instance(&deployed()).await.unwrap();

    let mut bp = blueprint();
    bp.resources.get_mut("orders").unwrap().spec =
      MappingNode::fields([("name", expr("orders-${variables.env}")), ("size", MappingNode::int(2))]);
    let changes = stage(&fx, bp, options(Some("prod"))).await;
    let orders = &changes.resources["orders"];
    assert_eq!(orders.action, ChangeAction::Update);
    assert_eq!(orders.modified_fields[0].path, "spec.size");
    assert_eq!(changes.links["handler::orders"].action, ChangeAction::Update);
    assert!(!changes.resources.contains_key("handler"));

    let mut params = BTreeMap::new();
    params.insert("env".to_string(), MappingNode::string("staging"));
    let changes = stage(
      &fx,
      blueprint(),
      StageOptions {
        params,
        ..options(Some("prod"))
      },
    )
    .await;
    assert_eq!(changes.resources["orders"].action, ChangeAction::Recreate);
    // The recorded arn no longer applies once the table is replaced.
    let handler = &changes.resources["handler"];
    assert_eq!(handler.action, ChangeAction::Update);
    assert_eq!(handler.known_on_deploy, vec!["spec.table_arn"]);
    assert_eq!(changes.exports["table_name"].action, ChangeAction::Update);
  }

  #[tokio::test]
  async fn removed_elements_are_deleted() {
    let fx = fixture();
    fx.state.save_instance(&deployed()).await.unwrap();

    let mut bp = blueprint();
    bp.resources.remove("handler");
    bp.exports.clear();
    let changes = stage(&fx, bp, options(Some("prod"))).await;

    assert_eq!(changes.resources["handler"].action, ChangeAction::Delete);
    assert_eq!(changes.links["handler::orders"].action, ChangeAction::Delete);
    assert_eq!(changes.exports["table_name"].action, ChangeAction::Delete);
    assert!(!changes.resources.contains_key("orders"));
    assert_eq!(changes.summary.resources.delete, 1);
  }

  #[tokio::test]
  async fn drift_stops_staging_unless_allowed() {
    let fx = fixture();
    fx.state.save_instance(&deployed()).await.unwrap();
    fx.table.set_external("orders", None);

    let outcome = fx
      .stager
      .stage(blueprint(), options(Some("prod")), &CancelToken::new())
      .await
      .unwrap();
    let StageOutcome::Drift(report) = outcome else {
      panic!("expected drift");
    };
    assert!(report.drift_detected);

    let changes = stage(
      &fx,
      blueprint(),
      StageOptions {
        allow_drift: true,
        ..options(Some("prod"))
      },
    )
    .await;
    assert!(changes.acknowledged_drift);
    assert!(
      changes
        .diagnostics
        .iter()
        .any(|d| d.reason == ReasonCode::DriftAcknowledged)
    );
  }

  #[tokio::test]
  async fn resolution_errors_do_not_stop_other_elements() {
    let fx = fixture();
    let mut bp = blueprint();
    bp.resources.insert(
      "broken".to_string(),
      Resource::new("test/table", MappingNode::fields([("name", expr("${unknown_fn(1)}"))])),
    );

    let changes = stage(&fx, bp, options(None)).await;
    assert!(changes.has_errors());
    assert!(!changes.resources.contains_key("broken"));
    assert_eq!(changes.resources["orders"].action, ChangeAction::Create);
    let diag = changes.diagnostics.iter().find(|d| d.is_error()).unwrap();
    assert_eq!(diag.element.as_deref(), Some("resources.broken"));
    assert_eq!(diag.reason, ReasonCode::FunctionNotFound);
  }

  fn network_child() -> String {
    json!({
      "variables": { "cidr": { "var_type": "string" } },
      "resources": {
        "vpc": {
          "resource_type": "test/table",
          "spec": { "scalar": "vpc" }
        }
      },
      "exports": {
        "cidr": { "field": { "scalar": "10.0.0.0/16" } }
      }
    })
    .to_string()
  }

  #[tokio::test]
  async fn children_are_staged_recursively() {
    let mut fx = fixture();
    fx.stager = fx.stager.clone().with_child_resolver(Sources(HashMap::from([(
      "network.json".to_string(),
      network_child(),
    )])));

    let mut bp = blueprint();
    let mut include = Include::new("network.json");
    include
      .variables
      .insert("cidr".to_string(), MappingNode::string("10.0.0.0/16"));
    bp.includes.insert("network".to_string(), include);
    bp.exports
      .insert("cidr".to_string(), Export::new(expr("${children.network.cidr}")));

    let changes = stage(&fx, bp, options(Some("prod"))).await;
    let child = &changes.children["network"];
    assert_eq!(child.action, ChangeAction::Create);
    assert_eq!(child.child_instance_id.as_deref(), Some("prod.network"));
    let nested = child.changes.as_ref().unwrap();
    assert_eq!(nested.resources["vpc"].action, ChangeAction::Create);
    assert_eq!(changes.exports["cidr"].new, Some(MappingNode::string("10.0.0.0/16")));
  }

  #[tokio::test]
  async fn include_cycles_are_rejected() {
    let mut fx = fixture();
    let looping = json!({
      "includes": { "again": { "path": { "scalar": "loop.json" } } }
    })
    .to_string();
    fx.stager = fx
      .stager
      .clone()
      .with_child_resolver(Sources(HashMap::from([("loop.json".to_string(), looping)])));

    let mut bp = Blueprint::default();
    bp.includes.insert("first".to_string(), Include::new("loop.json"));
    let err = fx
      .stager
      .stage(bp, options(None), &CancelToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, StageError::IncludeCycle { ref chain } if chain.len() == 2), "{err}");
  }

  #[tokio::test]
  async fn missing_child_resolver_is_a_diagnostic() {
    let fx = fixture();
    let mut bp = blueprint();
    bp.includes.insert("network".to_string(), Include::new("network.json"));

    let changes = stage(&fx, bp, options(None)).await;
    assert!(!changes.children.contains_key("network"));
    assert!(
      changes
        .diagnostics
        .iter()
        .any(|d| d.reason == ReasonCode::ChildLoadFailed && d.element.as_deref() == Some("children.network"))
    );
  }

  #[tokio::test]
  async fn invalid_computed_patterns_are_reported_and_ignored() {
    let table = TestResource::new("test/table").with_definition(ResourceDefinition {
      computed_fields: vec!["spec.arn".to_string(), "spec.size[0".to_string()],
      ..Default::default()
    });
    let mut registry = ProviderRegistry::with_core_functions();
    registry.register_resource(table);
    registry.register_resource(TestResource::new("test/function"));
    registry.register_link(TestLink::new("test/function", "test/table").with_priority(LinkPriority::ResourceB));
    let stager = ChangeStager::new(
      Arc::new(registry),
      Arc::new(MemoryStateContainer::new()),
      EngineConfig::default(),
    );

    let mut bp = blueprint();
    bp.resources.get_mut("handler").unwrap().spec = MappingNode::fields([
      ("table_arn", expr("${resources.orders.spec.arn}")),
      ("table_size", expr("${resources.orders.spec.size}")),
    ]);
    let changes = stager
      .stage(bp, options(None), &CancelToken::new())
      .await
      .unwrap()
      .changes()
      .unwrap();

    let warning = changes
      .diagnostics
      .iter()
      .find(|d| d.reason == ReasonCode::InvalidPathPattern)
      .unwrap();
    assert!(!warning.is_error());
    assert_eq!(warning.element.as_deref(), Some("resources.orders"));

    // Only the valid pattern defers; `size` resolves from the blueprint.
    let handler = &changes.resources["handler"];
    assert_eq!(handler.known_on_deploy, vec!["spec.table_arn"]);
    let size = handler.new_fields.iter().find(|f| f.path == "spec.table_size").unwrap();
    assert_eq!(size.new, Some(MappingNode::int(1)));
    let orders = &changes.resources["orders"];
    assert!(orders.new_fields.iter().any(|f| f.path == "spec.size"));
  }

  #[tokio::test]
  async fn cancelled_staging_stops() {
    let fx = fixture();
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = fx.stager.stage(blueprint(), options(None), &cancel).await.unwrap_err();
    assert!(matches!(err, StageError::Cancelled));
  }
}
