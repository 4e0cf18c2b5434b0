//! Substitution resolution.
//!
//! The resolver turns blueprint value trees that may contain `${..}`
//! expressions into concrete values. It is created once per staging or
//! deployment run and memoizes resolved resources, data source fetches and
//! child exports for the lifetime of that run.
//!
//! # Results
//!
//! Resolution has three outcomes (see [`Resolution`]):
//!
//! - **Resolved**: every expression produced a value.
//! - **Deferred**: some fields depend on values that only exist after a
//!   dependency is deployed. The resolvable part is returned together with
//!   the paths that are known on deploy. Deferral only happens while staging.
//! - **Failed**: a hard error such as a missing variable.
//!
//! # None Semantics
//!
//! Lists drop items that resolve to none and mappings omit such fields, at
//! every depth. A string that interpolates a none value is none as a whole.

pub mod callstack;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::blueprint::Expansion;
use crate::diagnostics::{Diagnostic, ReasonCode};
use crate::registry::{
  DataSourceFetchInput, FieldPatterns, FunctionArgs, FunctionContext, FunctionError, ProviderRegistry, RegistryError,
};
use crate::schema::{Blueprint, Condition, ResourceMetadata};
use crate::state::{InstanceState, ResourceState};
use crate::substitution::{SourceRange, StringOrSubstitutions, StringPart, Substitution, SubstitutionKind};
use crate::value::{Cache, MappingNode, PropertyPath};

use callstack::{Call, CallStack};

/// A boxed, sendable future used for recursive resolution.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which phase a resolution runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveFor {
  ChangeStaging,
  Deployment,
}

/// The kind of element being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveTarget {
  Metadata,
  Resource,
  Export,
  Include,
  DataSource,
  Variable,
  Condition,
  Each,
  ChildReference,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
  #[error("variable '{name}' has no value and no default")]
  MissingVariable { name: String },

  #[error("unknown resource '{name}'")]
  UnknownResource { name: String },

  #[error("unknown data source '{name}'")]
  UnknownDataSource { name: String },

  #[error("unknown child blueprint '{name}'")]
  UnknownChild { name: String },

  #[error("unknown export '{name}'")]
  UnknownExport { name: String },

  #[error("dependency was conditionally excluded: {element} references {dependency}")]
  DependencyExcluded { element: String, dependency: String },

  #[error("resource '{name}' has not been deployed")]
  ResourceNotDeployed { name: String },

  #[error("export '{export}' of child '{child}' is not known")]
  ChildExportUnknown { child: String, export: String },

  #[error("index {index} is out of bounds for '{element}'")]
  IndexOutOfBounds { element: String, index: usize },

  #[error("'elem' and 'i' can only be used inside a templated resource")]
  ElemOutsideTemplate,

  #[error("cannot interpolate a {kind} value into a string")]
  InvalidInterpolation { kind: String },

  #[error("function '{name}' is not registered")]
  FunctionNotFound { name: String },

  #[error("function '{function}' failed: {message}")]
  FunctionFailed {
    function: String,
    message: String,
    /// Active calls at the point of failure, innermost first.
    stack: Vec<Call>,
  },

  #[error("data source '{name}' failed: {message}")]
  DataSourceFailed { name: String, message: String },

  #[error("data source '{name}' has no field '{field}'")]
  DataSourceFieldMissing { name: String, field: String },

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error("condition must resolve to a boolean, got {kind}")]
  ConditionNotBoolean { kind: String },

  #[error("each must resolve to a list, got {kind}")]
  EachNotList { kind: String },

  #[error("{element} must be fully resolved during change staging but depends on {}", .references.join(", "))]
  MustResolveDuringStaging { element: String, references: Vec<String> },
}

impl ResolveError {
  pub fn reason(&self) -> ReasonCode {
    match self {
      ResolveError::MissingVariable { .. } => ReasonCode::MissingVariable,
      ResolveError::UnknownResource { .. }
      | ResolveError::UnknownDataSource { .. }
      | ResolveError::UnknownChild { .. }
      | ResolveError::UnknownExport { .. } => ReasonCode::UnknownElement,
      ResolveError::DependencyExcluded { .. } => ReasonCode::DependencyExcluded,
      ResolveError::ResourceNotDeployed { .. } => ReasonCode::ResourceNotDeployed,
      ResolveError::ChildExportUnknown { .. } => ReasonCode::ChildExportUnknown,
      ResolveError::IndexOutOfBounds { .. } | ResolveError::ElemOutsideTemplate => ReasonCode::InvalidReference,
      ResolveError::InvalidInterpolation { .. } => ReasonCode::InvalidInterpolation,
      ResolveError::FunctionNotFound { .. } => ReasonCode::FunctionNotFound,
      ResolveError::FunctionFailed { .. } => ReasonCode::FunctionFailed,
      ResolveError::DataSourceFailed { .. } | ResolveError::DataSourceFieldMissing { .. } => {
        ReasonCode::DataSourceFailed
      }
      ResolveError::Registry(_) => ReasonCode::ProviderNotFound,
      ResolveError::ConditionNotBoolean { .. } => ReasonCode::InvalidCondition,
      ResolveError::EachNotList { .. } => ReasonCode::InvalidTemplate,
      ResolveError::MustResolveDuringStaging { .. } => ReasonCode::MustResolveDuringStaging,
    }
  }

  pub fn to_diagnostic(&self, element: impl Into<String>, range: Option<SourceRange>) -> Diagnostic {
    Diagnostic::error(self.reason(), self.to_string())
      .for_element(element)
      .with_range(range)
  }
}

/// A property whose value is only known once a dependency is deployed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredProperty {
  /// Path relative to the resolved node.
  pub path: PropertyPath,
  /// The references that caused the deferral, e.g. `resources.db.spec.host`.
  pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
  Resolved(MappingNode),
  Deferred {
    partial: MappingNode,
    deferred: Vec<DeferredProperty>,
  },
  Failed(ResolveError),
}

impl Resolution {
  pub fn is_resolved(&self) -> bool {
    matches!(self, Resolution::Resolved(_))
  }

  pub fn is_deferred(&self) -> bool {
    matches!(self, Resolution::Deferred { .. })
  }

  /// The resolved value, or the resolvable part of a deferred one.
  pub fn value(&self) -> Option<&MappingNode> {
    match self {
      Resolution::Resolved(value) | Resolution::Deferred { partial: value, .. } => Some(value),
      Resolution::Failed(_) => None,
    }
  }

  pub fn into_result(self) -> Result<(MappingNode, Vec<DeferredProperty>), ResolveError> {
    match self {
      Resolution::Resolved(value) => Ok((value, Vec::new())),
      Resolution::Deferred { partial, deferred } => Ok((partial, deferred)),
      Resolution::Failed(err) => Err(err),
    }
  }

  fn from_partial(result: Result<Partial, ResolveError>) -> Self {
    match result {
      Ok(partial) if partial.deferred.is_empty() => Resolution::Resolved(partial.value),
      Ok(partial) => Resolution::Deferred {
        partial: partial.value,
        deferred: partial.deferred,
      },
      Err(err) => Resolution::Failed(err),
    }
  }
}

/// The current element of a templated resource.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateScope {
  pub elem: MappingNode,
  pub index: usize,
}

/// Information about what is being resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveContext {
  /// Element the value belongs to, e.g. `resources.orders`.
  pub element: String,
  pub target: ResolveTarget,
  pub mode: ResolveFor,
  pub template: Option<TemplateScope>,
  pub range: Option<SourceRange>,
}

impl ResolveContext {
  pub fn new(element: impl Into<String>, target: ResolveTarget, mode: ResolveFor) -> Self {
    Self {
      element: element.into(),
      target,
      mode,
      template: None,
      range: None,
    }
  }

  pub fn with_template(mut self, elem: MappingNode, index: usize) -> Self {
    self.template = Some(TemplateScope { elem, index });
    self
  }
}

/// A resource with its spec and metadata resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResource {
  pub name: String,
  pub resource_type: String,
  pub spec: MappingNode,
  pub metadata: MappingNode,
  /// Deferred paths rooted at `spec` or `metadata`.
  pub deferred: Vec<DeferredProperty>,
}

impl ResolvedResource {
  /// The resource as a single node with `spec` and `metadata` fields.
  pub fn root(&self) -> MappingNode {
    resource_root(&self.spec, &self.metadata)
  }

  pub fn is_fully_resolved(&self) -> bool {
    self.deferred.is_empty()
  }
}

fn resource_root(spec: &MappingNode, metadata: &MappingNode) -> MappingNode {
  MappingNode::fields([("spec", spec.clone()), ("metadata", metadata.clone())])
}

/// Cached knowledge about one export of a child blueprint.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildExportFieldInfo {
  pub value: MappingNode,
  /// False when the export will only be known once the child is deployed.
  pub known: bool,
}

/// Inputs shared by every resolution in a run.
#[derive(Debug, Clone, Default)]
pub struct ResolveInputs {
  pub params: BTreeMap<String, MappingNode>,
  /// Recorded state of the instance being staged or deployed.
  pub prior: Option<InstanceState>,
  /// Recorded exports of child instances, keyed by include name.
  pub child_exports: BTreeMap<String, BTreeMap<String, MappingNode>>,
  /// Path of the blueprint document, used in call stack traces.
  pub source_path: Option<String>,
}

impl ResolveInputs {
  pub fn with_params(params: BTreeMap<String, MappingNode>) -> Self {
    Self {
      params,
      ..Default::default()
    }
  }

  fn prior_resource(&self, name: &str) -> Option<&ResourceState> {
    self.prior.as_ref().and_then(|prior| prior.resources.get(name))
  }
}

#[derive(Debug, Default)]
struct ResolveCaches {
  resources: Cache<(String, ResolveFor), ResolvedResource>,
  data_sources: Arc<Cache<String, BTreeMap<String, MappingNode>>>,
  child_exports: Cache<(String, String), ChildExportFieldInfo>,
  /// Resources deployed earlier in this run, as `spec`/`metadata` roots.
  deployed: Cache<String, MappingNode>,
  replacing: Cache<String, ()>,
  field_patterns: Cache<String, Arc<FieldPatterns>>,
}

/// Value produced by resolving a node: the resolvable part plus any
/// deferred paths relative to the node.
#[derive(Debug, Default)]
struct Partial {
  value: MappingNode,
  deferred: Vec<DeferredProperty>,
}

impl Partial {
  fn value(value: MappingNode) -> Self {
    Self {
      value,
      deferred: Vec::new(),
    }
  }

  fn deferred(references: Vec<String>) -> Self {
    Self {
      value: MappingNode::None,
      deferred: vec![DeferredProperty {
        path: PropertyPath::root(),
        references: dedup(references),
      }],
    }
  }

  fn is_deferred(&self) -> bool {
    !self.deferred.is_empty()
  }

  fn references(&self) -> Vec<String> {
    self.deferred.iter().flat_map(|d| d.references.iter().cloned()).collect()
  }
}

fn dedup(references: Vec<String>) -> Vec<String> {
  let mut seen = BTreeSet::new();
  references.into_iter().filter(|r| seen.insert(r.clone())).collect()
}

/// Resolves substitutions for one staging or deployment run.
///
/// Clones share the same caches, so a resolver can be handed to concurrent
/// tasks freely.
#[derive(Clone)]
pub struct SubstitutionResolver {
  blueprint: Arc<Blueprint>,
  inputs: Arc<ResolveInputs>,
  registry: Arc<ProviderRegistry>,
  expansion: Arc<Expansion>,
  caches: Arc<ResolveCaches>,
}

impl SubstitutionResolver {
  pub fn new(
    blueprint: Arc<Blueprint>,
    inputs: Arc<ResolveInputs>,
    registry: Arc<ProviderRegistry>,
    expansion: Arc<Expansion>,
  ) -> Self {
    Self {
      blueprint,
      inputs,
      registry,
      expansion,
      caches: Arc::new(ResolveCaches::default()),
    }
  }

  /// A resolver over a different template expansion.
  ///
  /// Data source results carry over; resolved resources do not.
  pub fn with_expansion(&self, expansion: Arc<Expansion>) -> Self {
    Self {
      blueprint: self.blueprint.clone(),
      inputs: self.inputs.clone(),
      registry: self.registry.clone(),
      expansion,
      caches: Arc::new(ResolveCaches {
        data_sources: self.caches.data_sources.clone(),
        ..Default::default()
      }),
    }
  }

  pub fn blueprint(&self) -> &Blueprint {
    &self.blueprint
  }

  pub fn inputs(&self) -> &ResolveInputs {
    &self.inputs
  }

  pub fn registry(&self) -> &Arc<ProviderRegistry> {
    &self.registry
  }

  pub fn expansion(&self) -> &Expansion {
    &self.expansion
  }

  /// Resolve an arbitrary value tree.
  pub async fn resolve(&self, node: &MappingNode, ctx: &ResolveContext, stack: &CallStack) -> Resolution {
    Resolution::from_partial(self.resolve_node(node, ctx, stack).await)
  }

  /// Resolve the spec and metadata of a resource (or template instance).
  ///
  /// Results are memoized per resource and mode.
  pub fn resolve_resource<'a>(
    &'a self,
    name: &'a str,
    mode: ResolveFor,
  ) -> BoxFuture<'a, Result<ResolvedResource, ResolveError>> {
    Box::pin(async move {
      let key = (name.to_string(), mode);
      if let Some(hit) = self.caches.resources.get(&key) {
        return Ok(hit);
      }

      let instance = self
        .expansion
        .instance(name)
        .ok_or_else(|| ResolveError::UnknownResource { name: name.to_string() })?;
      let decl = self
        .blueprint
        .resources
        .get(&instance.template)
        .ok_or_else(|| ResolveError::UnknownResource { name: name.to_string() })?;

      let mut ctx = ResolveContext::new(format!("resources.{name}"), ResolveTarget::Resource, mode);
      ctx.range = decl.range;
      if let Some(elem) = &instance.elem {
        ctx = ctx.with_template(elem.clone(), instance.index.unwrap_or_default());
      }

      let root = resource_root(&decl.spec, &metadata_node(&decl.metadata));
      let partial = self.resolve_node(&root, &ctx, &CallStack::new()).await?;

      let mut fields = match partial.value {
        MappingNode::Fields(fields) => fields,
        _ => BTreeMap::new(),
      };
      let resolved = ResolvedResource {
        name: name.to_string(),
        resource_type: decl.resource_type.clone(),
        spec: fields.remove("spec").unwrap_or_default(),
        metadata: fields.remove("metadata").unwrap_or_default(),
        deferred: partial.deferred,
      };

      trace!(resource = %name, ?mode, deferred = resolved.deferred.len(), "resolved resource");
      Ok(self.caches.resources.insert(key, resolved))
    })
  }

  /// Evaluate a condition. Conditions must resolve fully.
  pub fn resolve_condition<'a>(
    &'a self,
    condition: &'a Condition,
    ctx: &'a ResolveContext,
    stack: &'a CallStack,
  ) -> BoxFuture<'a, Result<bool, ResolveError>> {
    Box::pin(async move {
      match condition {
        Condition::Expr(node) => {
          let partial = self.resolve_node(node, ctx, stack).await?;
          if partial.is_deferred() {
            return Err(ResolveError::MustResolveDuringStaging {
              element: ctx.element.clone(),
              references: dedup(partial.references()),
            });
          }
          partial.value.as_bool().ok_or_else(|| ResolveError::ConditionNotBoolean {
            kind: partial.value.kind().to_string(),
          })
        }
        Condition::And(items) => {
          for item in items {
            if !self.resolve_condition(item, ctx, stack).await? {
              return Ok(false);
            }
          }
          Ok(true)
        }
        Condition::Or(items) => {
          for item in items {
            if self.resolve_condition(item, ctx, stack).await? {
              return Ok(true);
            }
          }
          Ok(false)
        }
        Condition::Not(inner) => Ok(!self.resolve_condition(inner, ctx, stack).await?),
      }
    })
  }

  /// Resolve the `each` list of a templated resource.
  ///
  /// A none value yields no instances.
  pub async fn resolve_each(&self, template: &str) -> Result<Vec<MappingNode>, ResolveError> {
    let decl = self
      .blueprint
      .resources
      .get(template)
      .ok_or_else(|| ResolveError::UnknownResource {
        name: template.to_string(),
      })?;
    let Some(each) = &decl.each else {
      return Ok(Vec::new());
    };

    let mut ctx = ResolveContext::new(
      format!("resources.{template}"),
      ResolveTarget::Each,
      ResolveFor::ChangeStaging,
    );
    ctx.range = decl.range;
    let partial = self.resolve_node(each, &ctx, &CallStack::new()).await?;
    if partial.is_deferred() {
      return Err(ResolveError::MustResolveDuringStaging {
        element: ctx.element,
        references: dedup(partial.references()),
      });
    }

    match partial.value {
      MappingNode::Items(items) => Ok(items),
      MappingNode::None => Ok(Vec::new()),
      other => Err(ResolveError::EachNotList {
        kind: other.kind().to_string(),
      }),
    }
  }

  pub async fn resolve_export(&self, name: &str, mode: ResolveFor) -> Resolution {
    let Some(export) = self.blueprint.exports.get(name) else {
      return Resolution::Failed(ResolveError::UnknownExport { name: name.to_string() });
    };
    let mut ctx = ResolveContext::new(format!("exports.{name}"), ResolveTarget::Export, mode);
    ctx.range = export.range;
    self.resolve(&export.field, &ctx, &CallStack::new()).await
  }

  /// Resolve an include as a mapping with `path`, `variables` and
  /// `metadata` fields.
  pub async fn resolve_include(&self, name: &str, mode: ResolveFor) -> Resolution {
    let Some(include) = self.blueprint.includes.get(name) else {
      return Resolution::Failed(ResolveError::UnknownChild { name: name.to_string() });
    };
    let node = MappingNode::fields([
      ("path", include.path.clone()),
      ("variables", MappingNode::Fields(include.variables.clone())),
      ("metadata", include.metadata.clone().unwrap_or_default()),
    ]);
    let mut ctx = ResolveContext::new(format!("children.{name}"), ResolveTarget::Include, mode);
    ctx.range = include.range;
    self.resolve(&node, &ctx, &CallStack::new()).await
  }

  /// Fetch a data source, returning its exported fields.
  pub async fn resolve_data_source(&self, name: &str, mode: ResolveFor) -> Resolution {
    Resolution::from_partial(self.fetch_data_source(name, mode, &CallStack::new()).await)
  }

  /// Record the final spec and metadata of a resource deployed in this run.
  pub fn record_deployed(&self, name: &str, spec: &MappingNode, metadata: &MappingNode) {
    self.caches.deployed.replace(name.to_string(), resource_root(spec, metadata));
  }

  /// Mark a resource as being recreated, so its recorded computed values
  /// are no longer used.
  pub fn mark_replacing(&self, name: &str) {
    self.caches.replacing.insert(name.to_string(), ());
  }

  pub fn is_replacing(&self, name: &str) -> bool {
    self.caches.replacing.contains(&name.to_string())
  }

  pub fn set_child_export(&self, child: &str, export: &str, info: ChildExportFieldInfo) {
    self.caches.child_exports.replace((child.to_string(), export.to_string()), info);
  }

  fn resolve_node<'a>(
    &'a self,
    node: &'a MappingNode,
    ctx: &'a ResolveContext,
    stack: &'a CallStack,
  ) -> BoxFuture<'a, Result<Partial, ResolveError>> {
    Box::pin(async move {
      match node {
        MappingNode::Scalar(_) | MappingNode::None => Ok(Partial::value(node.clone())),
        MappingNode::Substitutions(subs) => self.resolve_string(subs, ctx, stack).await,
        MappingNode::Items(items) => {
          let mut out = Vec::with_capacity(items.len());
          let mut references = Vec::new();
          for item in items {
            let partial = self.resolve_node(item, ctx, stack).await?;
            if partial.is_deferred() {
              references.extend(partial.references());
            } else if !partial.value.is_none() {
              out.push(partial.value);
            }
          }
          if references.is_empty() {
            Ok(Partial::value(MappingNode::Items(out)))
          } else {
            Ok(Partial::deferred(references))
          }
        }
        MappingNode::Fields(fields) => {
          let mut out = BTreeMap::new();
          let mut deferred = Vec::new();
          for (key, value) in fields {
            let partial = self.resolve_node(value, ctx, stack).await?;
            let prefix = PropertyPath::root().field(key.clone());
            deferred.extend(partial.deferred.into_iter().map(|d| DeferredProperty {
              path: prefix.join(&d.path),
              references: d.references,
            }));
            if !partial.value.is_none() {
              out.insert(key.clone(), partial.value);
            }
          }
          Ok(Partial {
            value: MappingNode::Fields(out),
            deferred,
          })
        }
      }
    })
  }

  async fn resolve_string(
    &self,
    subs: &StringOrSubstitutions,
    ctx: &ResolveContext,
    stack: &CallStack,
  ) -> Result<Partial, ResolveError> {
    if let Some(sub) = subs.single() {
      return self.resolve_sub(sub, ctx, stack).await;
    }

    let mut out = String::new();
    let mut references = Vec::new();
    let mut saw_none = false;
    for part in &subs.parts {
      match part {
        StringPart::Literal(text) => out.push_str(text),
        StringPart::Substitution(sub) => {
          let partial = self.resolve_sub(sub, ctx, stack).await?;
          if partial.is_deferred() {
            references.extend(partial.references());
            continue;
          }
          match &partial.value {
            MappingNode::None => saw_none = true,
            MappingNode::Scalar(scalar) => out.push_str(&scalar.to_interpolated()),
            other => {
              return Err(ResolveError::InvalidInterpolation {
                kind: other.kind().to_string(),
              });
            }
          }
        }
      }
    }

    if !references.is_empty() {
      Ok(Partial::deferred(references))
    } else if saw_none {
      Ok(Partial::default())
    } else {
      Ok(Partial::value(MappingNode::string(out)))
    }
  }

  fn resolve_sub<'a>(
    &'a self,
    sub: &'a Substitution,
    ctx: &'a ResolveContext,
    stack: &'a CallStack,
  ) -> BoxFuture<'a, Result<Partial, ResolveError>> {
    Box::pin(async move {
      match &sub.kind {
        SubstitutionKind::Literal(scalar) => Ok(Partial::value(MappingNode::Scalar(scalar.clone()))),
        SubstitutionKind::Variable { name } => self.variable(name).map(Partial::value),
        SubstitutionKind::ResourceProperty {
          resource,
          index,
          path,
          optional,
        } => self.resource_property(resource, *index, path, *optional, ctx).await,
        SubstitutionKind::DataSourceProperty {
          data_source,
          field,
          index,
        } => self.data_source_property(data_source, field, *index, ctx, stack).await,
        SubstitutionKind::ChildProperty { child, export, path } => self.child_property(child, export, path, ctx),
        SubstitutionKind::Elem { path } => {
          let scope = ctx.template.as_ref().ok_or(ResolveError::ElemOutsideTemplate)?;
          Ok(Partial::value(scope.elem.get_path(path).cloned().unwrap_or_default()))
        }
        SubstitutionKind::ElemIndex => {
          let scope = ctx.template.as_ref().ok_or(ResolveError::ElemOutsideTemplate)?;
          Ok(Partial::value(MappingNode::int(scope.index as i64)))
        }
        SubstitutionKind::FunctionCall { name, args } => self.function_call(sub, name, args, ctx, stack).await,
      }
    })
  }

  fn variable(&self, name: &str) -> Result<MappingNode, ResolveError> {
    if let Some(value) = self.inputs.params.get(name) {
      return Ok(value.clone());
    }
    self
      .blueprint
      .variables
      .get(name)
      .and_then(|decl| decl.default.clone())
      .map(MappingNode::Scalar)
      .ok_or_else(|| ResolveError::MissingVariable { name: name.to_string() })
  }

  async fn resource_property(
    &self,
    resource: &str,
    index: Option<usize>,
    path: &PropertyPath,
    optional: bool,
    ctx: &ResolveContext,
  ) -> Result<Partial, ResolveError> {
    if !self.blueprint.resources.contains_key(resource) {
      return Err(ResolveError::UnknownResource {
        name: resource.to_string(),
      });
    }

    match (self.expansion.template_instances(resource), index) {
      (Some(instances), Some(idx)) => {
        let name = instances.get(idx).ok_or_else(|| ResolveError::IndexOutOfBounds {
          element: format!("resources.{resource}"),
          index: idx,
        })?;
        self.instance_property(name, path, optional, ctx).await
      }
      (Some(instances), None) => {
        let mut items = Vec::new();
        let mut references = Vec::new();
        for name in instances {
          if self.expansion.is_resource_excluded(name) {
            continue;
          }
          let partial = self.instance_property(name, path, optional, ctx).await?;
          if partial.is_deferred() {
            references.extend(partial.references());
          } else if !partial.value.is_none() {
            items.push(partial.value);
          }
        }
        if references.is_empty() {
          Ok(Partial::value(MappingNode::Items(items)))
        } else {
          Ok(Partial::deferred(references))
        }
      }
      (None, Some(idx)) => Err(ResolveError::IndexOutOfBounds {
        element: format!("resources.{resource}"),
        index: idx,
      }),
      (None, None) => self.instance_property(resource, path, optional, ctx).await,
    }
  }

  async fn instance_property(
    &self,
    name: &str,
    path: &PropertyPath,
    optional: bool,
    ctx: &ResolveContext,
  ) -> Result<Partial, ResolveError> {
    if self.expansion.is_resource_excluded(name) {
      if optional {
        return Ok(Partial::default());
      }
      return Err(ResolveError::DependencyExcluded {
        element: ctx.element.clone(),
        dependency: format!("resources.{name}"),
      });
    }

    match ctx.mode {
      ResolveFor::Deployment => {
        let root = match self.caches.deployed.get(&name.to_string()) {
          Some(root) => root,
          None => self
            .inputs
            .prior_resource(name)
            .map(|prior| resource_root(&prior.spec, &prior.metadata))
            .ok_or_else(|| ResolveError::ResourceNotDeployed { name: name.to_string() })?,
        };
        Ok(Partial::value(root.get_path(path).cloned().unwrap_or_default()))
      }
      ResolveFor::ChangeStaging => {
        let resolved = self.resolve_resource(name, ResolveFor::ChangeStaging).await?;
        let reference = format!("resources.{name}.{path}");

        if resolved.deferred.iter().any(|d| d.path.overlaps(path)) {
          return Ok(Partial::deferred(vec![reference]));
        }
        if let Some(value) = resolved.root().get_path(path).cloned() {
          return Ok(Partial::value(value));
        }
        if self.is_computed(&resolved.resource_type, path) {
          let recorded = if self.is_replacing(name) {
            None
          } else {
            self
              .inputs
              .prior_resource(name)
              .and_then(|prior| resource_root(&prior.spec, &prior.metadata).get_path(path).cloned())
          };
          return Ok(match recorded {
            Some(value) => Partial::value(value),
            None => Partial::deferred(vec![reference]),
          });
        }
        Ok(Partial::default())
      }
    }
  }

  fn is_computed(&self, resource_type: &str, path: &PropertyPath) -> bool {
    self
      .field_patterns(resource_type)
      .is_some_and(|patterns| patterns.is_computed(path))
  }

  fn field_patterns(&self, resource_type: &str) -> Option<Arc<FieldPatterns>> {
    if let Some(patterns) = self.caches.field_patterns.get(&resource_type.to_string()) {
      return Some(patterns);
    }
    let provider = self.registry.resource(resource_type).ok()?;
    let patterns = provider.definition().field_patterns();
    for err in &patterns.invalid {
      warn!(resource_type, error = %err, "ignoring invalid field pattern");
    }
    Some(
      self
        .caches
        .field_patterns
        .insert(resource_type.to_string(), Arc::new(patterns)),
    )
  }

  async fn data_source_property(
    &self,
    data_source: &str,
    field: &str,
    index: Option<usize>,
    ctx: &ResolveContext,
    stack: &CallStack,
  ) -> Result<Partial, ResolveError> {
    let fetched = self.fetch_data_source(data_source, ctx.mode, stack).await?;
    if fetched.is_deferred() {
      return Ok(Partial::deferred(vec![format!("datasources.{data_source}.{field}")]));
    }

    let value = fetched
      .value
      .as_fields()
      .and_then(|fields| fields.get(field))
      .cloned()
      .ok_or_else(|| ResolveError::DataSourceFieldMissing {
        name: data_source.to_string(),
        field: field.to_string(),
      })?;

    match index {
      None => Ok(Partial::value(value)),
      Some(idx) => value
        .as_items()
        .and_then(|items| items.get(idx))
        .cloned()
        .map(Partial::value)
        .ok_or_else(|| ResolveError::IndexOutOfBounds {
          element: format!("datasources.{data_source}.{field}"),
          index: idx,
        }),
    }
  }

  async fn fetch_data_source(
    &self,
    name: &str,
    mode: ResolveFor,
    stack: &CallStack,
  ) -> Result<Partial, ResolveError> {
    if let Some(fields) = self.caches.data_sources.get(&name.to_string()) {
      return Ok(Partial::value(MappingNode::Fields(fields)));
    }

    let decl = self
      .blueprint
      .data_sources
      .get(name)
      .ok_or_else(|| ResolveError::UnknownDataSource { name: name.to_string() })?;

    let mut input = DataSourceFetchInput {
      data_source_name: name.to_string(),
      filter_field: None,
      filter_operator: None,
      filter_search: None,
    };
    if let Some(filter) = &decl.filter {
      let mut ctx = ResolveContext::new(format!("datasources.{name}"), ResolveTarget::DataSource, mode);
      ctx.range = decl.range;
      let search = self.resolve_node(&filter.search, &ctx, stack).await?;
      if search.is_deferred() {
        return Ok(Partial::deferred(search.references()));
      }
      input.filter_field = Some(filter.field.clone());
      input.filter_operator = Some(filter.operator.clone());
      input.filter_search = Some(search.value);
    }

    let provider = self.registry.data_source(&decl.data_source_type)?;
    debug!(data_source = %name, data_source_type = %decl.data_source_type, "fetching data source");
    let fetched = provider
      .fetch(input)
      .await
      .map_err(|e| ResolveError::DataSourceFailed {
        name: name.to_string(),
        message: e.message,
      })?;

    let exported: BTreeMap<String, MappingNode> = if decl.exports.is_empty() {
      fetched
    } else {
      decl
        .exports
        .iter()
        .filter_map(|(export, spec)| {
          let source = spec.alias_for.as_deref().unwrap_or(export);
          fetched.get(source).map(|value| (export.clone(), value.clone()))
        })
        .collect()
    };

    let stored = self.caches.data_sources.insert(name.to_string(), exported);
    Ok(Partial::value(MappingNode::Fields(stored)))
  }

  fn child_property(
    &self,
    child: &str,
    export: &str,
    path: &PropertyPath,
    ctx: &ResolveContext,
  ) -> Result<Partial, ResolveError> {
    if !self.blueprint.includes.contains_key(child) {
      return Err(ResolveError::UnknownChild { name: child.to_string() });
    }
    if self.expansion.is_child_excluded(child) {
      return Err(ResolveError::DependencyExcluded {
        element: ctx.element.clone(),
        dependency: format!("children.{child}"),
      });
    }

    let known = match self.caches.child_exports.get(&(child.to_string(), export.to_string())) {
      Some(info) if info.known => Some(info.value),
      Some(_) => None,
      None => self
        .inputs
        .child_exports
        .get(child)
        .and_then(|exports| exports.get(export))
        .cloned(),
    };

    match (known, ctx.mode) {
      (Some(value), _) => Ok(Partial::value(value.get_path(path).cloned().unwrap_or_default())),
      (None, ResolveFor::ChangeStaging) => Ok(Partial::deferred(vec![format!("children.{child}.{export}")])),
      (None, ResolveFor::Deployment) => Err(ResolveError::ChildExportUnknown {
        child: child.to_string(),
        export: export.to_string(),
      }),
    }
  }

  async fn function_call(
    &self,
    sub: &Substitution,
    name: &str,
    args: &[crate::substitution::FunctionArg],
    ctx: &ResolveContext,
    stack: &CallStack,
  ) -> Result<Partial, ResolveError> {
    if self.registry.function(name).is_err() {
      return Err(ResolveError::FunctionNotFound { name: name.to_string() });
    }

    let mut call_args = FunctionArgs::default();
    let mut references = Vec::new();
    for arg in args {
      let partial = self.resolve_sub(&arg.value, ctx, stack).await?;
      if partial.is_deferred() {
        references.extend(partial.references());
        continue;
      }
      match &arg.name {
        Some(arg_name) => {
          call_args.named.insert(arg_name.clone(), partial.value);
        }
        None => call_args.positional.push(partial.value),
      }
    }
    if !references.is_empty() {
      return Ok(Partial::deferred(references));
    }

    let mut function_ctx = FunctionContext::new(self.registry.clone(), stack.clone());
    function_ctx.location = sub.range.or(ctx.range);
    function_ctx.file_path = self.inputs.source_path.clone();

    function_ctx
      .call(name, call_args)
      .await
      .map(Partial::value)
      .map_err(|err| match err {
        FunctionError::Traced {
          function,
          message,
          stack,
        } => ResolveError::FunctionFailed {
          function,
          message,
          stack,
        },
        other => ResolveError::FunctionFailed {
          function: name.to_string(),
          message: other.to_string(),
          stack: Vec::new(),
        },
      })
  }
}

fn metadata_node(metadata: &ResourceMetadata) -> MappingNode {
  let mut fields = BTreeMap::new();
  if let Some(display_name) = &metadata.display_name {
    fields.insert("display_name".to_string(), display_name.clone());
  }
  if !metadata.labels.is_empty() {
    fields.insert(
      "labels".to_string(),
      MappingNode::fields(metadata.labels.iter().map(|(k, v)| (k.clone(), MappingNode::string(v.clone())))),
    );
  }
  if !metadata.annotations.is_empty() {
    fields.insert("annotations".to_string(), MappingNode::Fields(metadata.annotations.clone()));
  }
  if let Some(custom) = &metadata.custom {
    fields.insert("custom".to_string(), custom.clone());
  }
  MappingNode::Fields(fields)
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::Ordering;

  use serde_json::json;

  use super::*;
  use crate::registry::ResourceDefinition;
  use crate::schema::{DataSource, Include, Resource, Variable, VariableType};
  use crate::util::testutil::{TestDataSource, TestResource, expr};

  fn registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::with_core_functions();
    registry.register_resource(TestResource::new("test/table").with_definition(ResourceDefinition {
      computed_fields: vec!["spec.arn".to_string()],
      ..Default::default()
    }));
    registry.register_resource(TestResource::new("test/function"));
    registry
  }

  fn resolver_with(blueprint: Blueprint, inputs: ResolveInputs, registry: ProviderRegistry) -> SubstitutionResolver {
    let expansion = Expansion::identity(&blueprint);
    SubstitutionResolver::new(
      Arc::new(blueprint),
      Arc::new(inputs),
      Arc::new(registry),
      Arc::new(expansion),
    )
  }

  fn staging(element: &str) -> ResolveContext {
    ResolveContext::new(element, ResolveTarget::Resource, ResolveFor::ChangeStaging)
  }

  fn table_and_handler() -> Blueprint {
    let mut blueprint = Blueprint::default();
    blueprint.resources.insert(
      "orders".to_string(),
      Resource::new("test/table", MappingNode::from(json!({ "name": "orders" }))),
    );
    blueprint.resources.insert(
      "handler".to_string(),
      Resource::new(
        "test/function",
        MappingNode::fields([
          ("table", expr("${resources.orders.spec.name}")),
          ("tableArn", expr("${resources.orders.spec.arn}")),
          ("runtime", MappingNode::string("go1.x")),
        ]),
      ),
    );
    blueprint
  }

  #[tokio::test]
  async fn variables_use_params_then_defaults() {
    let mut blueprint = Blueprint::default();
    blueprint.variables.insert(
      "region".to_string(),
      Variable::new(VariableType::String).with_default("eu-west-1"),
    );
    blueprint.variables.insert("env".to_string(), Variable::new(VariableType::String));

    let resolver = resolver_with(blueprint.clone(), ResolveInputs::default(), registry());
    let stack = CallStack::new();
    let resolution = resolver
      .resolve(&expr("${variables.region}"), &staging("resources.x"), &stack)
      .await;
    assert_eq!(resolution, Resolution::Resolved(MappingNode::string("eu-west-1")));

    let resolution = resolver.resolve(&expr("${variables.env}"), &staging("resources.x"), &stack).await;
    assert!(matches!(
      resolution,
      Resolution::Failed(ResolveError::MissingVariable { name }) if name == "env"
    ));

    let params = BTreeMap::from([("region".to_string(), MappingNode::string("us-east-1"))]);
    let resolver = resolver_with(blueprint, ResolveInputs::with_params(params), registry());
    let resolution = resolver
      .resolve(&expr("region-${variables.region}"), &staging("resources.x"), &stack)
      .await;
    assert_eq!(resolution, Resolution::Resolved(MappingNode::string("region-us-east-1")));
  }

  #[tokio::test]
  async fn none_values_are_dropped_at_every_depth() {
    let resolver = resolver_with(table_and_handler(), ResolveInputs::default(), registry());
    let node = MappingNode::fields([
      (
        "list",
        MappingNode::Items(vec![
          MappingNode::int(1),
          expr("${resources.orders.spec.missing}"),
          MappingNode::int(2),
        ]),
      ),
      ("gone", expr("${resources.orders.spec.missing}")),
      ("label", expr("prefix-${resources.orders.spec.missing}")),
      (
        "nested",
        MappingNode::fields([("inner", expr("${resources.orders.spec.missing}"))]),
      ),
    ]);

    let resolution = resolver.resolve(&node, &staging("resources.x"), &CallStack::new()).await;
    let Resolution::Resolved(value) = resolution else {
      panic!("expected resolved, got {resolution:?}");
    };
    assert_eq!(value.to_json(), json!({ "list": [1, 2], "nested": {} }));
  }

  #[tokio::test]
  async fn computed_field_without_prior_value_is_deferred() {
    let resolver = resolver_with(table_and_handler(), ResolveInputs::default(), registry());

    let handler = resolver
      .resolve_resource("handler", ResolveFor::ChangeStaging)
      .await
      .unwrap();
    assert_eq!(handler.spec.as_fields().unwrap()["table"], MappingNode::string("orders"));
    assert!(!handler.spec.as_fields().unwrap().contains_key("tableArn"));
    assert_eq!(handler.deferred.len(), 1);
    assert_eq!(handler.deferred[0].path.to_string(), "spec.tableArn");
    assert_eq!(handler.deferred[0].references, vec!["resources.orders.spec.arn".to_string()]);
  }

  #[tokio::test]
  async fn computed_field_uses_recorded_value_unless_replacing() {
    let mut prior = InstanceState::new("inst-1");
    prior.resources.insert(
      "orders".to_string(),
      ResourceState::new(
        "orders",
        "test/table",
        MappingNode::from(json!({ "name": "orders", "arn": "arn:orders" })),
      ),
    );
    let inputs = ResolveInputs {
      prior: Some(prior),
      ..Default::default()
    };

    let resolver = resolver_with(table_and_handler(), inputs.clone(), registry());
    let handler = resolver
      .resolve_resource("handler", ResolveFor::ChangeStaging)
      .await
      .unwrap();
    assert!(handler.is_fully_resolved());
    assert_eq!(handler.spec.as_fields().unwrap()["tableArn"], MappingNode::string("arn:orders"));

    let resolver = resolver_with(table_and_handler(), inputs, registry());
    resolver.mark_replacing("orders");
    let handler = resolver
      .resolve_resource("handler", ResolveFor::ChangeStaging)
      .await
      .unwrap();
    assert!(!handler.is_fully_resolved());
  }

  #[tokio::test]
  async fn deployment_mode_reads_deployed_resources() {
    let resolver = resolver_with(table_and_handler(), ResolveInputs::default(), registry());

    let err = resolver
      .resolve_resource("handler", ResolveFor::Deployment)
      .await
      .unwrap_err();
    assert!(matches!(err, ResolveError::ResourceNotDeployed { name } if name == "orders"));

    let resolver = resolver_with(table_and_handler(), ResolveInputs::default(), registry());
    resolver.record_deployed(
      "orders",
      &MappingNode::from(json!({ "name": "orders", "arn": "arn:new" })),
      &MappingNode::None,
    );
    let handler = resolver
      .resolve_resource("handler", ResolveFor::Deployment)
      .await
      .unwrap();
    assert_eq!(handler.spec.as_fields().unwrap()["tableArn"], MappingNode::string("arn:new"));
  }

  #[tokio::test]
  async fn excluded_dependency_is_error_unless_optional() {
    let mut blueprint = table_and_handler();
    blueprint.resources.insert(
      "audit".to_string(),
      Resource::new(
        "test/function",
        MappingNode::fields([("table", expr("${resources.orders?.spec.name}"))]),
      ),
    );

    let mut expansion = Expansion::identity(&blueprint);
    expansion.exclude_resource("orders");
    let resolver = SubstitutionResolver::new(
      Arc::new(blueprint),
      Arc::new(ResolveInputs::default()),
      Arc::new(registry()),
      Arc::new(expansion),
    );

    let err = resolver
      .resolve_resource("handler", ResolveFor::ChangeStaging)
      .await
      .unwrap_err();
    assert!(matches!(err, ResolveError::DependencyExcluded { ref dependency, .. } if dependency == "resources.orders"));
    assert_eq!(err.reason(), ReasonCode::DependencyExcluded);

    let audit = resolver
      .resolve_resource("audit", ResolveFor::ChangeStaging)
      .await
      .unwrap();
    assert_eq!(audit.spec, MappingNode::Fields(BTreeMap::new()));
  }

  #[tokio::test]
  async fn function_args_collect_every_deferred_reference() {
    let resolver = resolver_with(table_and_handler(), ResolveInputs::default(), registry());
    let node = expr("${join(list(resources.orders.spec.arn, resources.orders.spec.name, resources.orders.spec.arn), \",\")}");

    let resolution = resolver.resolve(&node, &staging("resources.x"), &CallStack::new()).await;
    let Resolution::Deferred { partial, deferred } = resolution else {
      panic!("expected deferred, got {resolution:?}");
    };
    assert!(partial.is_none());
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].references, vec!["resources.orders.spec.arn".to_string()]);
  }

  #[tokio::test]
  async fn function_failure_carries_call_stack() {
    let resolver = resolver_with(Blueprint::default(), ResolveInputs::default(), registry());
    let node = expr("${map(list(1, 2), \"to_upper\")}");

    let resolution = resolver.resolve(&node, &staging("resources.x"), &CallStack::new()).await;
    let Resolution::Failed(ResolveError::FunctionFailed { function, stack, .. }) = resolution else {
      panic!("expected function failure, got {resolution:?}");
    };
    assert_eq!(function, "to_upper");
    let names: Vec<_> = stack.iter().map(|c| c.function_name.as_str()).collect();
    assert_eq!(names, vec!["to_upper", "map"]);
  }

  #[tokio::test]
  async fn unknown_function_is_reported() {
    let resolver = resolver_with(Blueprint::default(), ResolveInputs::default(), registry());
    let resolution = resolver
      .resolve(&expr("${nope(1)}"), &staging("resources.x"), &CallStack::new())
      .await;
    assert!(matches!(
      resolution,
      Resolution::Failed(ResolveError::FunctionNotFound { name }) if name == "nope"
    ));
  }

  #[tokio::test]
  async fn interpolating_a_list_is_an_error() {
    let mut blueprint = Blueprint::default();
    blueprint.variables.insert("n".to_string(), Variable::new(VariableType::Integer).with_default(3i64));
    let resolver = resolver_with(blueprint, ResolveInputs::default(), registry());

    let resolution = resolver
      .resolve(&expr("n=${variables.n}"), &staging("resources.x"), &CallStack::new())
      .await;
    assert_eq!(resolution, Resolution::Resolved(MappingNode::string("n=3")));

    let resolution = resolver
      .resolve(&expr("items=${list(1)}"), &staging("resources.x"), &CallStack::new())
      .await;
    assert!(matches!(
      resolution,
      Resolution::Failed(ResolveError::InvalidInterpolation { .. })
    ));
  }

  #[tokio::test]
  async fn data_sources_are_fetched_once_per_run() {
    let source = TestDataSource::new(
      "test/network",
      BTreeMap::from([
        ("vpc".to_string(), MappingNode::string("vpc-1")),
        (
          "subnets".to_string(),
          MappingNode::Items(vec![MappingNode::string("a"), MappingNode::string("b")]),
        ),
      ]),
    );
    let fetches = source.fetch_count();
    let mut registry = registry();
    registry.register_data_source(source);

    let mut blueprint = Blueprint::default();
    blueprint.data_sources.insert(
      "network".to_string(),
      DataSource {
        data_source_type: "test/network".to_string(),
        filter: None,
        exports: BTreeMap::new(),
        range: None,
      },
    );
    let resolver = resolver_with(blueprint, ResolveInputs::default(), registry);

    let node = MappingNode::fields([
      ("vpc", expr("${datasources.network.vpc}")),
      ("subnet", expr("${datasources.network.subnets[1]}")),
    ]);
    let resolution = resolver.resolve(&node, &staging("resources.x"), &CallStack::new()).await;
    assert_eq!(
      resolution,
      Resolution::Resolved(MappingNode::from(json!({ "vpc": "vpc-1", "subnet": "b" })))
    );
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let missing = resolver
      .resolve(&expr("${datasources.network.zones}"), &staging("resources.x"), &CallStack::new())
      .await;
    assert!(matches!(
      missing,
      Resolution::Failed(ResolveError::DataSourceFieldMissing { .. })
    ));
  }

  #[tokio::test]
  async fn template_instances_see_elem_and_index() {
    let mut blueprint = Blueprint::default();
    blueprint.resources.insert(
      "queue".to_string(),
      Resource::new(
        "test/function",
        MappingNode::fields([("name", expr("${elem.name}-${i}"))]),
      )
      .with_each(MappingNode::from(json!([{ "name": "a" }, { "name": "b" }]))),
    );
    blueprint.resources.insert(
      "router".to_string(),
      Resource::new(
        "test/function",
        MappingNode::fields([
          ("queues", expr("${resources.queue.spec.name}")),
          ("first", expr("${resources.queue[0].spec.name}")),
        ]),
      ),
    );

    let resolver = resolver_with(blueprint.clone(), ResolveInputs::default(), registry());
    let items = resolver.resolve_each("queue").await.unwrap();
    assert_eq!(items.len(), 2);

    let mut expansion = Expansion::identity(&blueprint);
    expansion.expand_template("queue", items);
    let resolver = resolver.with_expansion(Arc::new(expansion));

    let router = resolver
      .resolve_resource("router", ResolveFor::ChangeStaging)
      .await
      .unwrap();
    assert_eq!(
      router.spec.to_json(),
      json!({ "queues": ["a-0", "b-1"], "first": "a-0" })
    );

    let err = resolver
      .resolve(&expr("${elem.name}"), &staging("resources.router"), &CallStack::new())
      .await;
    assert!(matches!(err, Resolution::Failed(ResolveError::ElemOutsideTemplate)));
  }

  #[tokio::test]
  async fn child_exports_defer_while_staging_and_fail_on_deploy() {
    let mut blueprint = Blueprint::default();
    blueprint.includes.insert("core".to_string(), Include::new("core.blueprint.yaml"));
    let resolver = resolver_with(blueprint, ResolveInputs::default(), registry());
    let node = expr("${children.core.endpoint}");

    let staged = resolver.resolve(&node, &staging("resources.x"), &CallStack::new()).await;
    assert!(staged.is_deferred());

    let deploy_ctx = ResolveContext::new("resources.x", ResolveTarget::Resource, ResolveFor::Deployment);
    let deployed = resolver.resolve(&node, &deploy_ctx, &CallStack::new()).await;
    assert!(matches!(
      deployed,
      Resolution::Failed(ResolveError::ChildExportUnknown { .. })
    ));

    resolver.set_child_export(
      "core",
      "endpoint",
      ChildExportFieldInfo {
        value: MappingNode::string("https://core"),
        known: true,
      },
    );
    let deployed = resolver.resolve(&node, &deploy_ctx, &CallStack::new()).await;
    assert_eq!(deployed, Resolution::Resolved(MappingNode::string("https://core")));
  }

  #[tokio::test]
  async fn compound_conditions() {
    let mut blueprint = Blueprint::default();
    blueprint.variables.insert(
      "env".to_string(),
      Variable::new(VariableType::String).with_default("prod"),
    );
    let resolver = resolver_with(blueprint, ResolveInputs::default(), registry());
    let ctx = ResolveContext::new("resources.x", ResolveTarget::Condition, ResolveFor::ChangeStaging);
    let stack = CallStack::new();

    let is_prod = Condition::Expr(expr("${eq(variables.env, \"prod\")}"));
    let cond = Condition::And(vec![
      is_prod.clone(),
      Condition::Not(Box::new(Condition::Expr(MappingNode::bool(false)))),
    ]);
    assert!(resolver.resolve_condition(&cond, &ctx, &stack).await.unwrap());

    let cond = Condition::Or(vec![Condition::Not(Box::new(is_prod))]);
    assert!(!resolver.resolve_condition(&cond, &ctx, &stack).await.unwrap());

    let err = resolver
      .resolve_condition(&Condition::Expr(MappingNode::string("yes")), &ctx, &stack)
      .await
      .unwrap_err();
    assert!(matches!(err, ResolveError::ConditionNotBoolean { .. }));
  }
}
