//! Deployment orchestration.
//!
//! The orchestrator applies a staged change set to an instance:
//!
//! 1. Removals first: links, then resources and children in reverse
//!    dependency order.
//! 2. Creates, updates and recreates in dependency waves. Elements of a
//!    wave run concurrently, bounded by [`EngineConfig::concurrency`].
//! 3. Exports are resolved once every element has finished.
//!
//! Every status transition is persisted through the state container and
//! streamed as a [`DeployEvent`]. A failed element fails its dependents
//! without attempting them while independent branches carry on. When the
//! caller asks for rollback, the elements this run changed are reverted
//! best-effort in reverse order.
//!
//! Cancellation and the run deadline stop new element work. Calls already
//! in flight are allowed to finish and the run ends `Interrupted`.

mod rollback;
pub mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::blueprint::{PreparedBlueprint, prepare};
use crate::config::EngineConfig;
use crate::graph::ElementId;
use crate::reconcile::DriftDetector;
use crate::registry::{
  LinkDeployInput, LinkDestroyInput, ProviderError, ProviderRegistry, ResourceDeployInput, ResourceInfo,
  ResourceProvider,
};
use crate::resolve::{BoxFuture, ChildExportFieldInfo, Resolution, ResolveFor, ResolveInputs};
use crate::stage::{
  BlueprintChanges, BlueprintLoader, ChangeAction, ChangeStager, ChildResolver, StageOptions, StageOutcome, diff_specs,
};
use crate::state::{ElementStatus, InstanceState, LinkState, ResourceState, RunStatus, StateContainer, StateError};
use crate::util::cancel::CancelToken;
use crate::util::hash::Hashable;
use crate::value::{MappingNode, PropertyPath};

use rollback::Revert;
pub use types::{
  DeployError, DeployEvent, DeployInput, DeploySummary, DestroyInput, DestroySummary, ElementReport, RollbackSummary,
  SkippedRollbackItem,
};
use types::terminal_status;

/// Applies staged changes through the registered providers.
#[derive(Clone)]
pub struct Orchestrator {
  stager: ChangeStager,
}

impl Orchestrator {
  pub fn new(registry: Arc<ProviderRegistry>, state: Arc<dyn StateContainer>, config: EngineConfig) -> Self {
    Self {
      stager: ChangeStager::new(registry, state, config),
    }
  }

  /// Resolver for included child blueprints. Children fail to deploy
  /// without one.
  pub fn with_child_resolver(mut self, resolver: impl ChildResolver + 'static) -> Self {
    self.stager = self.stager.with_child_resolver(resolver);
    self
  }

  pub fn with_loader(mut self, loader: impl BlueprintLoader + 'static) -> Self {
    self.stager = self.stager.with_loader(loader);
    self
  }

  fn registry(&self) -> &Arc<ProviderRegistry> {
    &self.stager.registry
  }

  fn state(&self) -> &Arc<dyn StateContainer> {
    &self.stager.state
  }

  fn config(&self) -> &EngineConfig {
    &self.stager.config
  }

  /// Deploy a staged change set.
  ///
  /// # Errors
  ///
  /// Returns an error before any provider is called if the change set has
  /// errors, the blueprint cannot be prepared, or the instance has
  /// unresolved drift and `allow_drift` is not set. Element failures are
  /// reported in the summary; only state container failures abort a run
  /// midway, after the elements already running have finished.
  pub async fn deploy(
    &self,
    input: DeployInput,
    events: Option<UnboundedSender<DeployEvent>>,
    cancel: &CancelToken,
  ) -> Result<DeploySummary, DeployError> {
    self.run_deploy(input, events, cancel.clone()).await
  }

  /// Destroy every element of an instance and then the instance itself.
  pub async fn destroy(
    &self,
    input: DestroyInput,
    events: Option<UnboundedSender<DeployEvent>>,
    cancel: &CancelToken,
  ) -> Result<DestroySummary, DeployError> {
    self.run_destroy(input.instance_id, events, cancel.clone()).await
  }

  fn run_deploy(
    &self,
    input: DeployInput,
    events: Option<UnboundedSender<DeployEvent>>,
    cancel: CancelToken,
  ) -> BoxFuture<'_, Result<DeploySummary, DeployError>> {
    Box::pin(async move {
      let DeployInput {
        instance_id,
        blueprint,
        changes,
        params,
        rollback,
        allow_drift,
        source_path,
      } = input;
      info!(instance = %instance_id, "starting deployment");

      if changes.has_errors() {
        return Err(DeployError::InvalidChanges {
          diagnostics: changes.diagnostics.iter().filter(|d| d.is_error()).cloned().collect(),
        });
      }

      let allow_drift = allow_drift || changes.acknowledged_drift;
      let prior = match self.state().get_instance(&instance_id).await? {
        Some(prior) => {
          if prior.is_interrupted() || self.config().check_drift {
            self.verify_drift(&prior, allow_drift).await?;
          }
          prior
        }
        None => {
          let fresh = InstanceState::new(&instance_id);
          self.state().save_instance(&fresh).await?;
          fresh
        }
      };

      self.state().update_instance_status(&instance_id, RunStatus::InProgress).await?;
      emit(
        &events,
        DeployEvent::Run {
          instance_id: instance_id.clone(),
          status: RunStatus::InProgress,
        },
      );

      let inputs = ResolveInputs {
        params: params.clone(),
        prior: Some(prior.clone()),
        child_exports: self.stager.recorded_child_exports(Some(&prior)).await?,
        source_path: source_path.clone(),
      };
      let prepared = match prepare(Arc::new(blueprint), Arc::new(inputs), self.registry().clone()).await {
        Ok(prepared) => prepared,
        Err(err) => {
          error!(instance = %instance_id, error = %err, "failed to prepare blueprint for deployment");
          self.state().update_instance_status(&instance_id, RunStatus::Failed).await?;
          emit(
            &events,
            DeployEvent::Run {
              instance_id,
              status: RunStatus::Failed,
            },
          );
          return Err(err.into());
        }
      };

      let run = Arc::new(DeployRun {
        orchestrator: self.clone(),
        instance_id: instance_id.clone(),
        prepared,
        changes,
        prior,
        allow_drift,
        events: events.clone(),
        cancel,
        deadline: self.config().run_deadline.map(|limit| Instant::now() + limit),
      });

      let mut outcome = RunOutcome::default();
      let removals = run.removal_order();
      run_waves(&run, removals.waves(), Some(&removals), &mut outcome).await?;
      run_waves(&run, run.deploy_waves(), None, &mut outcome).await?;

      let exports = if outcome.interrupted {
        warn!(instance = %instance_id, "deployment interrupted, exports left unchanged");
        run.prior.exports.clone()
      } else {
        run.resolve_exports().await?
      };

      let succeeded = outcome.count(ElementStatus::Succeeded);
      let failed = outcome.count(ElementStatus::Failed);
      let status = terminal_status(succeeded, failed, outcome.interrupted);

      let rollback = if rollback && failed > 0 {
        Some(run.rollback(std::mem::take(&mut outcome.reverts)).await)
      } else {
        None
      };

      self.state().update_instance_status(&instance_id, status).await?;
      emit(
        &events,
        DeployEvent::Run {
          instance_id: instance_id.clone(),
          status,
        },
      );
      info!(instance = %instance_id, ?status, succeeded, failed, "deployment finished");

      Ok(DeploySummary {
        instance_id,
        status,
        elements: outcome.reports,
        exports,
        rollback,
      })
    })
  }

  /// An interrupted instance may only be deployed again once the drift
  /// detector finds nothing, unless the caller accepts the drift.
  /// Refuse to deploy over drift, whether flagged by an earlier check or
  /// found now, unless the caller opted in.
  async fn verify_drift(&self, prior: &InstanceState, allow_drift: bool) -> Result<(), DeployError> {
    let report = DriftDetector::new(self.registry().clone(), self.state().clone())
      .check(prior)
      .await?;
    let mut elements = report.affected_elements();
    for name in prior.drifted_resources() {
      let element = ElementId::Resource(name.to_string()).to_string();
      if !elements.contains(&element) {
        elements.push(element);
      }
    }
    if elements.is_empty() {
      return Ok(());
    }
    if !allow_drift {
      warn!(instance = %prior.instance_id, ?elements, "unresolved drift, refusing to deploy");
      return Err(DeployError::UnresolvedDrift {
        instance_id: prior.instance_id.clone(),
        elements,
      });
    }
    warn!(instance = %prior.instance_id, ?elements, "deploying over acknowledged drift");
    Ok(())
  }

  fn run_destroy(
    &self,
    instance_id: String,
    events: Option<UnboundedSender<DeployEvent>>,
    cancel: CancelToken,
  ) -> BoxFuture<'_, Result<DestroySummary, DeployError>> {
    Box::pin(async move {
      let instance = self
        .state()
        .get_instance(&instance_id)
        .await?
        .ok_or_else(|| DeployError::InstanceNotFound(instance_id.clone()))?;
      info!(instance = %instance_id, "destroying instance");

      self.state().update_instance_status(&instance_id, RunStatus::InProgress).await?;
      emit(
        &events,
        DeployEvent::Run {
          instance_id: instance_id.clone(),
          status: RunStatus::InProgress,
        },
      );

      let run = Arc::new(DestroyRun {
        orchestrator: self.clone(),
        instance,
        events: events.clone(),
        cancel,
        deadline: self.config().run_deadline.map(|limit| Instant::now() + limit),
      });

      let order = run.removal_order();
      let mut destroyed = Vec::new();
      let mut failed: BTreeMap<String, Vec<String>> = BTreeMap::new();
      let mut blocked: BTreeMap<ElementId, String> = BTreeMap::new();
      let mut interrupted = false;
      let semaphore = Arc::new(Semaphore::new(self.config().concurrency.max(1)));

      for (idx, wave) in order.waves().into_iter().enumerate() {
        if run.should_stop() {
          interrupted = true;
          break;
        }
        debug!(wave = idx, elements = wave.len(), "destroying wave");

        let mut first_error = None;
        let mut join_set = JoinSet::new();
        for element in wave {
          if let Some(reason) = blocked.get(&element) {
            warn!(element = %element, reason = %reason, "not destroying element");
            if let Err(err) = run.mark_failed(&element, reason).await {
              first_error = Some(DeployError::from(err));
              break;
            }
            failed.insert(element.to_string(), vec![reason.clone()]);
            continue;
          }
          let run = run.clone();
          let semaphore = semaphore.clone();
          join_set.spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
              return Ok((element, None));
            };
            if run.should_stop() {
              return Ok((element, None));
            }
            let result = run.destroy_element(&element).await?;
            Ok::<_, DeployError>((element, Some(result)))
          });
        }

        while let Some(joined) = join_set.join_next().await {
          match joined {
            Ok(Ok((element, Some(Ok(()))))) => destroyed.push(element.to_string()),
            Ok(Ok((element, Some(Err(reason))))) => {
              for dependency in order.blocked_by(&element) {
                blocked
                  .entry(dependency)
                  .or_insert_with(|| format!("{element} could not be destroyed"));
              }
              failed.insert(element.to_string(), vec![reason]);
            }
            Ok(Ok((_, None))) => interrupted = true,
            Ok(Err(err)) => {
              error!(error = %err, "destroy task failed, draining the rest of the wave");
              first_error.get_or_insert(err);
            }
            Err(err) => {
              error!(error = %err, "destroy task panicked");
              first_error.get_or_insert(DeployError::Task(err.to_string()));
            }
          }
        }
        if let Some(err) = first_error {
          return Err(err);
        }
      }

      let status = terminal_status(destroyed.len(), failed.len(), interrupted);
      if status == RunStatus::Completed {
        self.state().remove_instance(&instance_id).await?;
      } else {
        self.state().update_instance_status(&instance_id, status).await?;
      }
      emit(
        &events,
        DeployEvent::Run {
          instance_id: instance_id.clone(),
          status,
        },
      );
      info!(instance = %instance_id, ?status, destroyed = destroyed.len(), failed = failed.len(), "destroy finished");

      Ok(DestroySummary {
        instance_id,
        status,
        destroyed,
        failed,
      })
    })
  }

  /// Call a provider with the per-call timeout, retrying retryable errors
  /// when a retry policy is configured.
  async fn call_provider<T, F, Fut>(&self, element: &ElementId, op: &str, mut call: F) -> Result<T, ProviderError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
  {
    let timeout = self.config().provider_call_timeout;
    let mut attempt = 1;
    loop {
      let result = match tokio::time::timeout(timeout, call()).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::new(format!(
          "{op} timed out after {}",
          humantime::format_duration(timeout)
        ))),
      };
      match (result, &self.config().retry) {
        (Err(err), Some(policy)) if err.retryable && attempt < policy.max_attempts => {
          let delay = policy.delay_for(attempt);
          warn!(
            element = %element,
            op,
            attempt,
            error = %err,
            delay = %humantime::format_duration(delay),
            "retrying provider call"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        (result, _) => return result,
      }
    }
  }

  /// Poll `has_stabilised` until it reports true or the stabilisation
  /// timeout elapses.
  async fn wait_for_stability(
    &self,
    element: &ElementId,
    provider: &Arc<dyn ResourceProvider>,
    resource: &ResourceInfo,
  ) -> Result<(), ProviderError> {
    let limit = self.config().stabilisation_timeout;
    let started = Instant::now();
    loop {
      let stable = self
        .call_provider(element, "has_stabilised", || {
          let provider = provider.clone();
          let resource = resource.clone();
          async move { provider.has_stabilised(&resource).await }
        })
        .await?;
      if stable {
        return Ok(());
      }
      if started.elapsed() >= limit {
        return Err(ProviderError::new(format!(
          "did not stabilise within {}",
          humantime::format_duration(limit)
        )));
      }
      debug!(element = %element, "waiting for resource to stabilise");
      tokio::time::sleep(self.config().stabilisation_poll_interval).await;
    }
  }
}

fn emit(events: &Option<UnboundedSender<DeployEvent>>, event: DeployEvent) {
  if let Some(tx) = events {
    // A dropped receiver only means nobody is listening.
    let _ = tx.send(event);
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

/// Split a resource root back into its spec and metadata.
fn split_root(root: MappingNode) -> (MappingNode, MappingNode) {
  match root {
    MappingNode::Fields(mut fields) => (
      fields.remove("spec").unwrap_or_default(),
      fields.remove("metadata").unwrap_or_default(),
    ),
    other => (other, MappingNode::None),
  }
}

/// A unit of work for one element.
#[derive(Debug, Clone)]
enum Work {
  Deploy(ElementId),
  Remove(ElementId),
}

impl Work {
  fn element(&self) -> &ElementId {
    match self {
      Work::Deploy(element) | Work::Remove(element) => element,
    }
  }
}

/// What happened to one element.
struct ElementResult {
  element: ElementId,
  /// `None` when the run stopped before the element started.
  report: Option<ElementReport>,
  revert: Option<Revert>,
}

impl ElementResult {
  fn succeeded(element: ElementId, action: Option<ChangeAction>, revert: Option<Revert>) -> Self {
    Self {
      element,
      report: Some(ElementReport {
        status: ElementStatus::Succeeded,
        action,
        failure_reasons: Vec::new(),
      }),
      revert,
    }
  }

  fn not_started(element: ElementId) -> Self {
    Self {
      element,
      report: None,
      revert: None,
    }
  }

  fn is_failed(&self) -> bool {
    self
      .report
      .as_ref()
      .is_some_and(|report| report.status == ElementStatus::Failed)
  }
}

#[derive(Default)]
struct RunOutcome {
  reports: BTreeMap<String, ElementReport>,
  /// Successful changes in the order they completed.
  reverts: Vec<Revert>,
  /// Elements that must not be attempted, with the reason.
  blocked: BTreeMap<ElementId, String>,
  interrupted: bool,
}

impl RunOutcome {
  fn count(&self, status: ElementStatus) -> usize {
    self.reports.values().filter(|report| report.status == status).count()
  }
}

/// Resources and children ordered for removal: an element is removed only
/// once nothing that depends on it remains.
#[derive(Debug, Default)]
struct RemovalOrder {
  links: Vec<ElementId>,
  /// Element to the elements it depends on.
  nodes: BTreeMap<ElementId, Vec<ElementId>>,
}

impl RemovalOrder {
  fn new(links: Vec<ElementId>, nodes: BTreeMap<ElementId, Vec<ElementId>>) -> Self {
    Self { links, nodes }
  }

  fn waves(&self) -> Vec<Vec<ElementId>> {
    let mut waves = Vec::new();
    if !self.links.is_empty() {
      waves.push(self.links.clone());
    }

    let mut remaining: BTreeSet<&ElementId> = self.nodes.keys().collect();
    while !remaining.is_empty() {
      let ready: Vec<&ElementId> = remaining
        .iter()
        .copied()
        .filter(|id| {
          !remaining
            .iter()
            .any(|other| other != id && self.nodes.get(*other).is_some_and(|deps| deps.contains(id)))
        })
        .collect();
      // Recorded dependencies can only form a cycle if state was edited by
      // hand; remove what is left together.
      let wave = if ready.is_empty() {
        remaining.iter().copied().collect()
      } else {
        ready
      };
      for id in &wave {
        remaining.remove(id);
      }
      waves.push(wave.into_iter().cloned().collect());
    }
    waves
  }

  /// Elements that must be kept because `failed` could not be removed.
  fn blocked_by(&self, failed: &ElementId) -> BTreeSet<ElementId> {
    let mut out = BTreeSet::new();
    let mut stack = vec![failed.clone()];
    while let Some(current) = stack.pop() {
      for dependency in self.nodes.get(&current).into_iter().flatten() {
        if self.nodes.contains_key(dependency) && out.insert(dependency.clone()) {
          stack.push(dependency.clone());
        }
      }
    }
    out
  }
}

fn recorded_dependencies(resource: &ResourceState) -> Vec<ElementId> {
  resource.depends_on.iter().filter_map(|id| ElementId::parse(id)).collect()
}

/// Run waves of element work, recording reports and propagating failures.
///
/// `removals` is set when the waves remove elements, in which case a
/// failure blocks the failed element's dependencies instead of its
/// dependents.
async fn run_waves(
  run: &Arc<DeployRun>,
  waves: Vec<Vec<ElementId>>,
  removals: Option<&RemovalOrder>,
  outcome: &mut RunOutcome,
) -> Result<(), DeployError> {
  let semaphore = Arc::new(Semaphore::new(run.orchestrator.config().concurrency.max(1)));

  for (idx, wave) in waves.into_iter().enumerate() {
    if outcome.interrupted || run.should_stop() {
      outcome.interrupted = true;
      return Ok(());
    }
    debug!(wave = idx, elements = wave.len(), removal = removals.is_some(), "running wave");

    // Spawned tasks are always drained before a state error is returned.
    let mut first_error = None;
    let mut join_set = JoinSet::new();
    for element in wave {
      if let Some(reason) = outcome.blocked.get(&element).cloned() {
        warn!(element = %element, reason = %reason, "skipping element");
        let action = run.staged_action(&element);
        match run.fail(element, action, reason).await {
          Ok(result) => record(outcome, result, run, removals),
          Err(err) => {
            first_error = Some(err);
            break;
          }
        }
        continue;
      }

      let work = match removals {
        Some(_) => Work::Remove(element),
        None => Work::Deploy(element),
      };
      let run = run.clone();
      let semaphore = semaphore.clone();
      join_set.spawn(async move {
        let Ok(_permit) = semaphore.acquire().await else {
          return Ok(ElementResult::not_started(work.element().clone()));
        };
        if run.should_stop() {
          return Ok(ElementResult::not_started(work.element().clone()));
        }
        run.execute(work).await
      });
    }

    while let Some(joined) = join_set.join_next().await {
      match joined {
        Ok(Ok(result)) => record(outcome, result, run, removals),
        Ok(Err(err)) => {
          error!(error = %err, "deployment task failed, draining the rest of the wave");
          first_error.get_or_insert(err);
        }
        Err(err) => {
          error!(error = %err, "deployment task panicked");
          first_error.get_or_insert(DeployError::Task(err.to_string()));
        }
      }
    }
    if let Some(err) = first_error {
      return Err(err);
    }
  }
  Ok(())
}

fn record(outcome: &mut RunOutcome, result: ElementResult, run: &DeployRun, removals: Option<&RemovalOrder>) {
  if result.is_failed() {
    let blocked = match removals {
      Some(order) => order.blocked_by(&result.element),
      None => run.prepared.graph.dependents_transitive(&result.element),
    };
    for element in blocked {
      outcome
        .blocked
        .entry(element)
        .or_insert_with(|| format!("{} failed", result.element));
    }
  }

  match result.report {
    Some(report) => {
      outcome.reports.insert(result.element.to_string(), report);
    }
    None => outcome.interrupted = true,
  }
  outcome.reverts.extend(result.revert);
}

/// State shared by the element tasks of one deploy run.
struct DeployRun {
  orchestrator: Orchestrator,
  instance_id: String,
  prepared: PreparedBlueprint,
  changes: BlueprintChanges,
  /// The instance as recorded before the run started.
  prior: InstanceState,
  allow_drift: bool,
  events: Option<UnboundedSender<DeployEvent>>,
  cancel: CancelToken,
  deadline: Option<Instant>,
}

impl DeployRun {
  fn state(&self) -> &Arc<dyn StateContainer> {
    self.orchestrator.state()
  }

  fn should_stop(&self) -> bool {
    self.cancel.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
  }

  fn emit(&self, element: &ElementId, status: ElementStatus, reasons: Vec<String>) {
    emit(
      &self.events,
      DeployEvent::Element {
        instance_id: self.instance_id.clone(),
        element: element.to_string(),
        status,
        reasons,
      },
    );
  }

  fn staged_action(&self, element: &ElementId) -> Option<ChangeAction> {
    match element {
      ElementId::Resource(name) => self.changes.resources.get(name).map(|c| c.action),
      ElementId::Link(name) => self.changes.links.get(name).map(|c| c.action),
      ElementId::Child(name) => self.changes.children.get(name).map(|c| c.action),
    }
  }

  fn removal_order(&self) -> RemovalOrder {
    let links = self
      .changes
      .links
      .iter()
      .filter(|(_, change)| change.action == ChangeAction::Delete)
      .map(|(name, _)| ElementId::Link(name.clone()))
      .collect();

    let mut nodes = BTreeMap::new();
    for (name, change) in &self.changes.resources {
      if change.action != ChangeAction::Delete {
        continue;
      }
      let deps = self
        .prior
        .resources
        .get(name)
        .map(recorded_dependencies)
        .unwrap_or_default();
      nodes.insert(ElementId::Resource(name.clone()), deps);
    }
    for (name, change) in &self.changes.children {
      if change.action == ChangeAction::Delete {
        nodes.insert(ElementId::Child(name.clone()), Vec::new());
      }
    }
    RemovalOrder::new(links, nodes)
  }

  fn deploy_waves(&self) -> Vec<Vec<ElementId>> {
    let resources = self
      .changes
      .resources
      .iter()
      .filter(|(_, c)| c.action != ChangeAction::Delete)
      .map(|(name, _)| ElementId::Resource(name.clone()));
    let links = self
      .changes
      .links
      .iter()
      .filter(|(_, c)| c.action != ChangeAction::Delete)
      .map(|(name, _)| ElementId::Link(name.clone()));
    let children = self
      .changes
      .children
      .iter()
      .filter(|(_, c)| c.action != ChangeAction::Delete)
      .map(|(name, _)| ElementId::Child(name.clone()));

    let selected: BTreeSet<ElementId> = resources
      .chain(links)
      .chain(children)
      .filter(|element| self.prepared.graph.contains(element))
      .collect();
    self.prepared.graph.execution_waves_for(&selected)
  }

  /// Persist a status transition and stream it.
  async fn transition(&self, element: &ElementId, status: ElementStatus, reasons: Vec<String>) -> Result<(), StateError> {
    match element {
      ElementId::Resource(name) => {
        let resource_type = self
          .changes
          .resources
          .get(name)
          .map(|c| c.resource_type.clone())
          .or_else(|| self.prior.resources.get(name).map(|r| r.resource_type.clone()))
          .unwrap_or_default();
        self
          .state()
          .update_resource_status(&self.instance_id, name, &resource_type, status, reasons.clone())
          .await?;
      }
      ElementId::Link(name) => {
        let endpoints = self
          .prepared
          .graph
          .link(name)
          .map(|l| (l.resource_a.clone(), l.resource_b.clone()))
          .or_else(|| {
            self
              .prior
              .links
              .get(name)
              .map(|l| (l.resource_a.clone(), l.resource_b.clone()))
          });
        if let Some((a, b)) = endpoints {
          self
            .state()
            .update_link_status(&self.instance_id, name, (&a, &b), status, reasons.clone())
            .await?;
        }
      }
      // Children carry their own run status on the child instance.
      ElementId::Child(_) => {}
    }
    self.emit(element, status, reasons);
    Ok(())
  }

  async fn fail(
    &self,
    element: ElementId,
    action: Option<ChangeAction>,
    reason: String,
  ) -> Result<ElementResult, DeployError> {
    error!(instance = %self.instance_id, element = %element, reason = %reason, "element failed");
    self
      .transition(&element, ElementStatus::Failed, vec![reason.clone()])
      .await?;
    Ok(ElementResult {
      element,
      report: Some(ElementReport {
        status: ElementStatus::Failed,
        action,
        failure_reasons: vec![reason],
      }),
      revert: None,
    })
  }

  async fn execute(&self, work: Work) -> Result<ElementResult, DeployError> {
    match work {
      Work::Deploy(ElementId::Resource(name)) => self.deploy_resource(name).await,
      Work::Deploy(ElementId::Link(name)) => self.deploy_link(name).await,
      Work::Deploy(ElementId::Child(name)) => self.deploy_child(name).await,
      Work::Remove(ElementId::Resource(name)) => self.remove_resource(name).await,
      Work::Remove(ElementId::Link(name)) => self.remove_link(name).await,
      Work::Remove(ElementId::Child(name)) => self.remove_child(name).await,
    }
  }

  async fn deploy_resource(&self, name: String) -> Result<ElementResult, DeployError> {
    let element = ElementId::Resource(name.clone());
    let Some(staged) = self.changes.resources.get(&name) else {
      return Ok(ElementResult::not_started(element));
    };
    let mut action = staged.action;
    self.transition(&element, ElementStatus::InProgress, Vec::new()).await?;

    let resolver = &self.prepared.resolver;
    let resolved = match resolver.resolve_resource(&name, ResolveFor::Deployment).await {
      Ok(resolved) => resolved,
      Err(err) => return self.fail(element, Some(action), err.to_string()).await,
    };
    if !resolved.is_fully_resolved() {
      let paths: Vec<String> = resolved.deferred.iter().map(|d| d.path.to_string()).collect();
      let reason = format!("values still unknown at deploy time: {}", paths.join(", "));
      return self.fail(element, Some(action), reason).await;
    }

    let provider = match self.orchestrator.registry().resource(&resolved.resource_type) {
      Ok(provider) => provider,
      Err(err) => return self.fail(element, Some(action), err.to_string()).await,
    };
    let definition = provider.definition();
    let prior = self
      .prior
      .resources
      .get(&name)
      .filter(|prior| !prior.spec.is_none())
      .cloned();
    let desired = resolved.root();

    // Values that were unknown while staging may turn out to need a
    // recreate, or no change at all.
    if action == ChangeAction::Update
      && !staged.known_on_deploy.is_empty()
      && let Some(prior) = &prior
    {
      let recorded = MappingNode::fields([("spec", prior.spec.clone()), ("metadata", prior.metadata.clone())]);
      let patterns = definition.field_patterns();
      let diff = diff_specs(Some(&recorded), &desired, &patterns.computed, &[]);
      if diff
        .changed_paths()
        .filter_map(|path| PropertyPath::parse(path).ok())
        .any(|path| patterns.forces_replacement(&path))
      {
        action = ChangeAction::Recreate;
      } else if !diff.has_changes() && prior.status == ElementStatus::Succeeded {
        debug!(resource = %name, "no changes once resolved");
        self.transition(&element, ElementStatus::Succeeded, Vec::new()).await?;
        return Ok(ElementResult::succeeded(element, None, None));
      }
    }
    debug!(resource = %name, %action, "deploying resource");

    if action == ChangeAction::Recreate
      && let Some(prior) = &prior
    {
      let old_provider = match self.orchestrator.registry().resource(&prior.resource_type) {
        Ok(provider) => provider,
        Err(err) => return self.fail(element, Some(action), err.to_string()).await,
      };
      let old = resource_info(&self.instance_id, prior);
      let destroyed = self
        .orchestrator
        .call_provider(&element, "destroy", || {
          let provider = old_provider.clone();
          let old = old.clone();
          async move { provider.destroy(&old).await }
        })
        .await;
      if let Err(err) = destroyed {
        return self
          .fail(element, Some(action), format!("failed to destroy for recreation: {err}"))
          .await;
      }
    }

    let info = ResourceInfo {
      instance_id: self.instance_id.clone(),
      resource_name: name.clone(),
      resource_type: resolved.resource_type.clone(),
      spec: resolved.spec.clone(),
    };
    let input = ResourceDeployInput {
      resource: info.clone(),
      prior_spec: match action {
        ChangeAction::Update => prior.as_ref().map(|p| p.spec.clone()),
        _ => None,
      },
    };
    let output = match self
      .orchestrator
      .call_provider(&element, "deploy", || {
        let provider = provider.clone();
        let input = input.clone();
        async move { provider.deploy(input).await }
      })
      .await
    {
      Ok(output) => output,
      Err(err) => return self.fail(element, Some(action), err.to_string()).await,
    };

    if definition.requires_stabilisation
      && let Err(err) = self.orchestrator.wait_for_stability(&element, &provider, &info).await
    {
      return self.fail(element, Some(action), err.to_string()).await;
    }

    let mut root = desired.clone();
    for (path, value) in output.computed_fields {
      let applied = PropertyPath::parse(&path).and_then(|parsed| root.set_path(&parsed, value));
      if let Err(err) = applied {
        warn!(resource = %name, path = %path, error = %err, "ignoring computed field");
      }
    }
    let (spec, metadata) = split_root(root);
    self.prepared.resolver.record_deployed(&name, &spec, &metadata);

    let record = ResourceState {
      name: name.clone(),
      resource_type: resolved.resource_type.clone(),
      spec,
      metadata,
      status: ElementStatus::Succeeded,
      failure_reasons: Vec::new(),
      depends_on: self
        .prepared
        .graph
        .dependencies(&element)
        .iter()
        .map(ToString::to_string)
        .collect(),
      spec_hash: desired.compute_hash().ok().map(|hash| hash.0),
      drifted: false,
    };
    self.state().save_resource(&self.instance_id, record.clone()).await?;
    self.emit(&element, ElementStatus::Succeeded, Vec::new());
    info!(resource = %name, %action, "resource deployed");

    let revert = match prior {
      Some(prior) if action != ChangeAction::Create => Revert::ResourceChanged {
        prior,
        current: record,
        recreated: action == ChangeAction::Recreate,
      },
      _ => Revert::ResourceCreated { resource: record },
    };
    Ok(ElementResult::succeeded(element, Some(action), Some(revert)))
  }

  async fn deploy_link(&self, name: String) -> Result<ElementResult, DeployError> {
    let element = ElementId::Link(name.clone());
    let action = self.staged_action(&element);
    let Some(endpoints) = self.prepared.graph.link(&name).cloned() else {
      return self.fail(element, action, "link is no longer selected".to_string()).await;
    };
    self.transition(&element, ElementStatus::InProgress, Vec::new()).await?;

    let current = self
      .state()
      .get_instance(&self.instance_id)
      .await?
      .ok_or_else(|| DeployError::InstanceNotFound(self.instance_id.clone()))?;
    let (Some(a), Some(b)) = (
      current.resources.get(&endpoints.resource_a),
      current.resources.get(&endpoints.resource_b),
    ) else {
      return self
        .fail(element, action, "linked resources are not deployed".to_string())
        .await;
    };
    let Some(provider) = self.orchestrator.registry().link(&a.resource_type, &b.resource_type) else {
      let reason = format!("no link provider for {} -> {}", a.resource_type, b.resource_type);
      return self.fail(element, action, reason).await;
    };

    let input = LinkDeployInput {
      instance_id: self.instance_id.clone(),
      link_name: name.clone(),
      resource_a: resource_info(&self.instance_id, a),
      resource_b: resource_info(&self.instance_id, b),
      prior_link_data: self.prior.links.get(&name).map(|link| link.link_data.clone()),
    };
    let link_data = match self
      .orchestrator
      .call_provider(&element, "link", || {
        let provider = provider.clone();
        let input = input.clone();
        async move { provider.deploy(input).await }
      })
      .await
    {
      Ok(data) => data,
      Err(err) => return self.fail(element, action, err.to_string()).await,
    };

    let record = LinkState {
      name: name.clone(),
      resource_a: endpoints.resource_a,
      resource_b: endpoints.resource_b,
      link_data,
      status: ElementStatus::Succeeded,
      failure_reasons: Vec::new(),
    };
    self.state().save_link(&self.instance_id, record.clone()).await?;
    self.emit(&element, ElementStatus::Succeeded, Vec::new());
    debug!(link = %name, "link deployed");

    let revert = if self.prior.links.contains_key(&name) {
      Revert::LinkChanged { name }
    } else {
      Revert::LinkCreated { link: record }
    };
    Ok(ElementResult::succeeded(element, action, Some(revert)))
  }

  async fn deploy_child(&self, name: String) -> Result<ElementResult, DeployError> {
    let element = ElementId::Child(name.clone());
    let staged = self.changes.children.get(&name).cloned();
    let action = staged.as_ref().map(|c| c.action);
    self.transition(&element, ElementStatus::InProgress, Vec::new()).await?;

    let include = match self
      .prepared
      .resolver
      .resolve_include(&name, ResolveFor::Deployment)
      .await
      .into_result()
    {
      Ok((include, deferred)) if deferred.is_empty() => include,
      Ok(_) => {
        return self
          .fail(element, action, "include did not fully resolve".to_string())
          .await;
      }
      Err(err) => return self.fail(element, action, err.to_string()).await,
    };
    let fields = include.as_fields().cloned().unwrap_or_default();
    let Some(path) = fields.get("path").and_then(MappingNode::as_str).map(str::to_string) else {
      return self
        .fail(element, action, "include path must resolve to a string".to_string())
        .await;
    };
    let params = fields
      .get("variables")
      .and_then(MappingNode::as_fields)
      .cloned()
      .unwrap_or_default();

    let Some(child_resolver) = self.orchestrator.stager.child_resolver.clone() else {
      return self
        .fail(element, action, "no child resolver is configured".to_string())
        .await;
    };
    let source = match child_resolver.resolve(&name, &path).await {
      Ok(source) => source,
      Err(err) => return self.fail(element, action, format!("failed to fetch '{path}': {err}")).await,
    };
    let blueprint = match self.orchestrator.stager.loader.load(&source) {
      Ok(blueprint) => blueprint,
      Err(err) => return self.fail(element, action, format!("failed to load '{path}': {err}")).await,
    };

    let child_id = staged
      .as_ref()
      .and_then(|c| c.child_instance_id.clone())
      .or_else(|| self.prior.children.get(&name).cloned())
      .unwrap_or_else(|| format!("{}.{name}", self.instance_id));

    let staged_changes = staged.and_then(|c| if c.staged_on_deploy { None } else { c.changes });
    let changes = match staged_changes {
      Some(changes) => changes,
      None => {
        let options = StageOptions {
          instance_id: Some(child_id.clone()),
          params: params.clone(),
          allow_drift: self.allow_drift,
          source_path: Some(path.clone()),
        };
        match self.orchestrator.stager.stage(blueprint.clone(), options, &self.cancel).await {
          Ok(StageOutcome::Changes(changes)) => changes,
          Ok(StageOutcome::Drift(_)) => {
            return self
              .fail(element, action, format!("child instance '{child_id}' has drifted"))
              .await;
          }
          Err(err) => return self.fail(element, action, err.to_string()).await,
        }
      }
    };

    debug!(child = %name, instance = %child_id, "deploying child blueprint");
    let input = DeployInput {
      instance_id: child_id.clone(),
      blueprint,
      changes,
      params,
      rollback: false,
      allow_drift: self.allow_drift,
      source_path: Some(path),
    };
    let summary = match self
      .orchestrator
      .run_deploy(input, self.events.clone(), self.cancel.clone())
      .await
    {
      Ok(summary) => summary,
      Err(err) => return self.fail(element, action, err.to_string()).await,
    };
    if summary.status != RunStatus::Completed {
      let reason = format!("child instance '{child_id}' ended {:?}", summary.status);
      return self.fail(element, action, reason).await;
    }

    self.state().save_child(&self.instance_id, &name, &child_id).await?;
    if let Some(child) = self.state().get_instance(&child_id).await? {
      for (export, value) in child.exports {
        self
          .prepared
          .resolver
          .set_child_export(&name, &export, ChildExportFieldInfo { value, known: true });
      }
    }
    self.emit(&element, ElementStatus::Succeeded, Vec::new());

    let revert = if self.prior.children.contains_key(&name) {
      Revert::ChildChanged { name }
    } else {
      Revert::ChildCreated {
        name,
        child_instance_id: child_id,
      }
    };
    Ok(ElementResult::succeeded(element, action, Some(revert)))
  }

  async fn remove_resource(&self, name: String) -> Result<ElementResult, DeployError> {
    let element = ElementId::Resource(name.clone());
    let action = Some(ChangeAction::Delete);
    let Some(prior) = self.prior.resources.get(&name).cloned() else {
      return Ok(ElementResult::succeeded(element, action, None));
    };
    self.transition(&element, ElementStatus::InProgress, Vec::new()).await?;

    // Records without a spec never reached the provider.
    if !prior.spec.is_none() {
      let provider = match self.orchestrator.registry().resource(&prior.resource_type) {
        Ok(provider) => provider,
        Err(err) => return self.fail(element, action, err.to_string()).await,
      };
      let info = resource_info(&self.instance_id, &prior);
      let destroyed = self
        .orchestrator
        .call_provider(&element, "destroy", || {
          let provider = provider.clone();
          let info = info.clone();
          async move { provider.destroy(&info).await }
        })
        .await;
      if let Err(err) = destroyed {
        return self.fail(element, action, err.to_string()).await;
      }
    }

    self.state().remove_resource(&self.instance_id, &name).await?;
    self.emit(&element, ElementStatus::Succeeded, Vec::new());
    info!(resource = %name, "resource removed");
    Ok(ElementResult::succeeded(
      element,
      action,
      Some(Revert::ResourceDeleted { prior }),
    ))
  }

  async fn remove_link(&self, name: String) -> Result<ElementResult, DeployError> {
    let element = ElementId::Link(name.clone());
    let action = Some(ChangeAction::Delete);
    let Some(prior) = self.prior.links.get(&name).cloned() else {
      return Ok(ElementResult::succeeded(element, action, None));
    };
    self.transition(&element, ElementStatus::InProgress, Vec::new()).await?;

    let types = (
      self.prior.resources.get(&prior.resource_a).map(|r| r.resource_type.as_str()),
      self.prior.resources.get(&prior.resource_b).map(|r| r.resource_type.as_str()),
    );
    let provider = match types {
      (Some(a), Some(b)) => self.orchestrator.registry().link(a, b),
      _ => None,
    };
    match provider {
      Some(provider) => {
        let input = LinkDestroyInput {
          instance_id: self.instance_id.clone(),
          link_name: name.clone(),
          link_data: prior.link_data.clone(),
        };
        let destroyed = self
          .orchestrator
          .call_provider(&element, "unlink", || {
            let provider = provider.clone();
            let input = input.clone();
            async move { provider.destroy(input).await }
          })
          .await;
        if let Err(err) = destroyed {
          return self.fail(element, action, err.to_string()).await;
        }
      }
      None => warn!(link = %name, "no link provider, removing the record only"),
    }

    self.state().remove_link(&self.instance_id, &name).await?;
    self.emit(&element, ElementStatus::Succeeded, Vec::new());
    Ok(ElementResult::succeeded(element, action, Some(Revert::LinkDeleted { link: prior })))
  }

  async fn remove_child(&self, name: String) -> Result<ElementResult, DeployError> {
    let element = ElementId::Child(name.clone());
    let action = Some(ChangeAction::Delete);
    let Some(child_id) = self.prior.children.get(&name).cloned() else {
      return Ok(ElementResult::succeeded(element, action, None));
    };
    self.emit(&element, ElementStatus::InProgress, Vec::new());

    let summary = match self
      .orchestrator
      .run_destroy(child_id.clone(), self.events.clone(), self.cancel.clone())
      .await
    {
      Ok(summary) => summary,
      Err(DeployError::InstanceNotFound(_)) => {
        warn!(child = %name, instance = %child_id, "child instance already gone");
        self.state().remove_child(&self.instance_id, &name).await?;
        return Ok(ElementResult::succeeded(element, action, None));
      }
      Err(err) => return self.fail(element, action, err.to_string()).await,
    };
    if summary.status != RunStatus::Completed {
      let failed: Vec<&str> = summary.failed.keys().map(String::as_str).collect();
      let reason = format!("child instance '{child_id}' kept {}", failed.join(", "));
      return self.fail(element, action, reason).await;
    }

    self.state().remove_child(&self.instance_id, &name).await?;
    self.emit(&element, ElementStatus::Succeeded, Vec::new());
    Ok(ElementResult::succeeded(element, action, Some(Revert::ChildDeleted { name })))
  }

  async fn resolve_exports(&self) -> Result<BTreeMap<String, MappingNode>, StateError> {
    let mut exports = BTreeMap::new();
    for name in self.prepared.blueprint.exports.keys() {
      match self
        .prepared
        .resolver
        .resolve_export(name, ResolveFor::Deployment)
        .await
      {
        Resolution::Resolved(value) => {
          exports.insert(name.clone(), value);
        }
        Resolution::Deferred { deferred, .. } => {
          warn!(export = %name, unresolved = deferred.len(), "export did not fully resolve");
        }
        Resolution::Failed(err) => warn!(export = %name, error = %err, "failed to resolve export"),
      }
    }
    self.state().save_exports(&self.instance_id, exports.clone()).await?;
    Ok(exports)
  }
}

/// State shared by the tasks of one destroy run.
struct DestroyRun {
  orchestrator: Orchestrator,
  instance: InstanceState,
  events: Option<UnboundedSender<DeployEvent>>,
  cancel: CancelToken,
  deadline: Option<Instant>,
}

impl DestroyRun {
  fn state(&self) -> &Arc<dyn StateContainer> {
    self.orchestrator.state()
  }

  fn should_stop(&self) -> bool {
    self.cancel.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
  }

  fn emit(&self, element: &ElementId, status: ElementStatus, reasons: Vec<String>) {
    emit(
      &self.events,
      DeployEvent::Element {
        instance_id: self.instance.instance_id.clone(),
        element: element.to_string(),
        status,
        reasons,
      },
    );
  }

  fn removal_order(&self) -> RemovalOrder {
    let links = self.instance.links.keys().map(|name| ElementId::Link(name.clone())).collect();
    let mut nodes: BTreeMap<ElementId, Vec<ElementId>> = self
      .instance
      .resources
      .values()
      .map(|resource| (ElementId::Resource(resource.name.clone()), recorded_dependencies(resource)))
      .collect();
    for name in self.instance.children.keys() {
      nodes.insert(ElementId::Child(name.clone()), Vec::new());
    }
    RemovalOrder::new(links, nodes)
  }

  async fn mark_failed(&self, element: &ElementId, reason: &str) -> Result<(), StateError> {
    let id = &self.instance.instance_id;
    let reasons = vec![reason.to_string()];
    match element {
      ElementId::Resource(name) => {
        let resource_type = self
          .instance
          .resources
          .get(name)
          .map(|r| r.resource_type.clone())
          .unwrap_or_default();
        self
          .state()
          .update_resource_status(id, name, &resource_type, ElementStatus::Failed, reasons.clone())
          .await?;
      }
      ElementId::Link(name) => {
        if let Some(link) = self.instance.links.get(name) {
          self
            .state()
            .update_link_status(
              id,
              name,
              (&link.resource_a, &link.resource_b),
              ElementStatus::Failed,
              reasons.clone(),
            )
            .await?;
        }
      }
      ElementId::Child(_) => {}
    }
    self.emit(element, ElementStatus::Failed, reasons);
    Ok(())
  }

  /// Destroy one element. The inner error is the failure reason.
  async fn destroy_element(&self, element: &ElementId) -> Result<Result<(), String>, DeployError> {
    self.emit(element, ElementStatus::InProgress, Vec::new());
    let id = &self.instance.instance_id;

    let result = match element {
      ElementId::Link(name) => self.destroy_link(name).await,
      ElementId::Resource(name) => self.destroy_resource(name).await,
      ElementId::Child(name) => match self.instance.children.get(name) {
        Some(child_id) => {
          match self
            .orchestrator
            .run_destroy(child_id.clone(), self.events.clone(), self.cancel.clone())
            .await
          {
            Ok(summary) if summary.status == RunStatus::Completed => Ok(()),
            Ok(summary) => Err(format!("child instance '{child_id}' ended {:?}", summary.status)),
            Err(DeployError::InstanceNotFound(_)) => Ok(()),
            Err(err) => Err(err.to_string()),
          }
        }
        None => Ok(()),
      },
    };

    match &result {
      Ok(()) => {
        match element {
          ElementId::Link(name) => self.state().remove_link(id, name).await?,
          ElementId::Resource(name) => self.state().remove_resource(id, name).await?,
          ElementId::Child(name) => self.state().remove_child(id, name).await?,
        }
        self.emit(element, ElementStatus::Succeeded, Vec::new());
        debug!(element = %element, "destroyed");
      }
      Err(reason) => {
        error!(element = %element, reason = %reason, "failed to destroy element");
        self.mark_failed(element, reason).await?;
      }
    }
    Ok(result)
  }

  async fn destroy_link(&self, name: &str) -> Result<(), String> {
    let Some(link) = self.instance.links.get(name) else {
      return Ok(());
    };
    let resources = &self.instance.resources;
    let provider = match (resources.get(&link.resource_a), resources.get(&link.resource_b)) {
      (Some(a), Some(b)) => self.orchestrator.registry().link(&a.resource_type, &b.resource_type),
      _ => None,
    };
    let Some(provider) = provider else {
      warn!(link = %name, "no link provider, removing the record only");
      return Ok(());
    };
    let input = LinkDestroyInput {
      instance_id: self.instance.instance_id.clone(),
      link_name: name.to_string(),
      link_data: link.link_data.clone(),
    };
    self
      .orchestrator
      .call_provider(&ElementId::Link(name.to_string()), "unlink", || {
        let provider = provider.clone();
        let input = input.clone();
        async move { provider.destroy(input).await }
      })
      .await
      .map_err(|err| err.to_string())
  }

  async fn destroy_resource(&self, name: &str) -> Result<(), String> {
    let Some(resource) = self.instance.resources.get(name) else {
      return Ok(());
    };
    if resource.spec.is_none() {
      return Ok(());
    }
    let provider = self
      .orchestrator
      .registry()
      .resource(&resource.resource_type)
      .map_err(|err| err.to_string())?;
    let info = resource_info(&self.instance.instance_id, resource);
    self
      .orchestrator
      .call_provider(&ElementId::Resource(name.to_string()), "destroy", || {
        let provider = provider.clone();
        let info = info.clone();
        async move { provider.destroy(&info).await }
      })
      .await
      .map_err(|err| err.to_string())
  }
}
