//! Capability registry for providers and functions.
//!
//! Every pluggable implementation is registered under a namespaced type
//! string (for example `aws/dynamodb/table`) and tagged with the capability
//! it provides. Each capability has its own narrow trait; the engine never
//! downcasts between them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resolve::callstack::{Call, CallStack};
use crate::substitution::SourceRange;
use crate::value::{MappingNode, PathError, PathPattern, PropertyPath, ScalarValue};

/// Error returned by a provider implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ProviderError {
  pub message: String,
  /// The operation may succeed if attempted again.
  pub retryable: bool,
}

impl ProviderError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      retryable: false,
    }
  }

  pub fn retryable(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      retryable: true,
    }
  }
}

/// Static behaviour declared by a resource provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
  /// Path patterns for values assigned by the provider after creation.
  pub computed_fields: Vec<String>,
  /// Path patterns that force a destroy and re-create when changed.
  pub replace_on_change: Vec<String>,
  /// Changes cannot be reverted during rollback.
  pub irreversible: bool,
  /// Deployments must be polled with `has_stabilised` before they count as done.
  pub requires_stabilisation: bool,
}

impl ResourceDefinition {
  /// Parse the definition's field patterns.
  ///
  /// A pattern that fails to parse matches nothing and is reported in
  /// `FieldPatterns::invalid`.
  pub fn field_patterns(&self) -> FieldPatterns {
    let mut invalid = Vec::new();
    let mut parse = |raw: &[String]| -> Vec<PathPattern> {
      raw
        .iter()
        .filter_map(|pattern| match PathPattern::parse(pattern) {
          Ok(parsed) => Some(parsed),
          Err(err) => {
            invalid.push(err);
            None
          }
        })
        .collect()
    };
    let computed = parse(&self.computed_fields);
    let replace_on_change = parse(&self.replace_on_change);
    FieldPatterns {
      computed,
      replace_on_change,
      invalid,
    }
  }
}

/// Parsed `ResourceDefinition` patterns, shared by resolution, staging and
/// deployment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldPatterns {
  pub computed: Vec<PathPattern>,
  pub replace_on_change: Vec<PathPattern>,
  pub invalid: Vec<PathError>,
}

impl FieldPatterns {
  pub fn is_computed(&self, path: &PropertyPath) -> bool {
    self.computed.iter().any(|pattern| pattern.matches(path))
  }

  pub fn forces_replacement(&self, path: &PropertyPath) -> bool {
    self.replace_on_change.iter().any(|pattern| pattern.matches(path))
  }
}

/// Identifies a deployed or to-be-deployed resource for provider calls.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInfo {
  pub instance_id: String,
  pub resource_name: String,
  pub resource_type: String,
  pub spec: MappingNode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDeployInput {
  pub resource: ResourceInfo,
  /// The recorded spec for updates, `None` for creates.
  pub prior_spec: Option<MappingNode>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceDeployOutput {
  /// Provider-assigned values keyed by property path, e.g. `spec.arn`.
  pub computed_fields: BTreeMap<String, MappingNode>,
}

#[async_trait]
pub trait ResourceProvider: Send + Sync {
  fn resource_type(&self) -> &str;

  fn definition(&self) -> ResourceDefinition {
    ResourceDefinition::default()
  }

  async fn deploy(&self, input: ResourceDeployInput) -> Result<ResourceDeployOutput, ProviderError>;

  async fn has_stabilised(&self, _resource: &ResourceInfo) -> Result<bool, ProviderError> {
    Ok(true)
  }

  async fn destroy(&self, resource: &ResourceInfo) -> Result<(), ProviderError>;

  /// Live state as reported by the provider, `None` if the resource is gone.
  async fn get_external_state(&self, resource: &ResourceInfo) -> Result<Option<MappingNode>, ProviderError>;
}

/// Which side of a link, if any, must be deployed first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPriority {
  #[default]
  None,
  ResourceA,
  ResourceB,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkDeployInput {
  pub instance_id: String,
  pub link_name: String,
  /// The selecting (source) resource.
  pub resource_a: ResourceInfo,
  /// The selected (target) resource.
  pub resource_b: ResourceInfo,
  pub prior_link_data: Option<MappingNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkDestroyInput {
  pub instance_id: String,
  pub link_name: String,
  pub link_data: MappingNode,
}

#[async_trait]
pub trait LinkProvider: Send + Sync {
  fn resource_type_a(&self) -> &str;

  fn resource_type_b(&self) -> &str;

  fn priority(&self) -> LinkPriority {
    LinkPriority::None
  }

  /// Wire the two resources together, returning link data to record.
  async fn deploy(&self, input: LinkDeployInput) -> Result<MappingNode, ProviderError>;

  async fn destroy(&self, input: LinkDestroyInput) -> Result<(), ProviderError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceFetchInput {
  pub data_source_name: String,
  pub filter_field: Option<String>,
  pub filter_operator: Option<String>,
  pub filter_search: Option<MappingNode>,
}

#[async_trait]
pub trait DataSourceProvider: Send + Sync {
  fn data_source_type(&self) -> &str;

  async fn fetch(&self, input: DataSourceFetchInput) -> Result<BTreeMap<String, MappingNode>, ProviderError>;
}

/// Resolved function arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionArgs {
  pub positional: Vec<MappingNode>,
  pub named: BTreeMap<String, MappingNode>,
}

impl FunctionArgs {
  pub fn positional(args: Vec<MappingNode>) -> Self {
    Self {
      positional: args,
      named: BTreeMap::new(),
    }
  }

  /// Positional argument `idx`, falling back to the named argument `name`.
  pub fn get(&self, idx: usize, name: &str) -> Option<&MappingNode> {
    self.positional.get(idx).or_else(|| self.named.get(name))
  }

  pub fn require(&self, idx: usize, name: &str) -> Result<&MappingNode, FunctionError> {
    self
      .get(idx, name)
      .ok_or_else(|| FunctionError::InvalidArgs(format!("missing argument '{name}'")))
  }

  pub fn require_str(&self, idx: usize, name: &str) -> Result<&str, FunctionError> {
    let value = self.require(idx, name)?;
    value
      .as_str()
      .ok_or_else(|| FunctionError::InvalidArgs(format!("argument '{name}' must be a string, got {}", value.kind())))
  }

  pub fn require_list(&self, idx: usize, name: &str) -> Result<&[MappingNode], FunctionError> {
    let value = self.require(idx, name)?;
    value
      .as_items()
      .ok_or_else(|| FunctionError::InvalidArgs(format!("argument '{name}' must be a list, got {}", value.kind())))
  }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum FunctionError {
  #[error("invalid arguments: {0}")]
  InvalidArgs(String),

  #[error("{0}")]
  Failed(String),

  /// A failure raised inside a nested call, with the stack captured there.
  #[error("{function}: {message}")]
  Traced {
    function: String,
    message: String,
    stack: Vec<Call>,
  },
}

/// Context handed to a function invocation.
pub struct FunctionContext {
  pub stack: CallStack,
  pub location: Option<SourceRange>,
  pub file_path: Option<String>,
  registry: Arc<ProviderRegistry>,
}

impl FunctionContext {
  pub fn new(registry: Arc<ProviderRegistry>, stack: CallStack) -> Self {
    Self {
      stack,
      location: None,
      file_path: None,
      registry,
    }
  }

  /// Invoke another registered function, tracking it on the call stack.
  pub async fn call(&self, name: &str, args: FunctionArgs) -> Result<MappingNode, FunctionError> {
    let function = self
      .registry
      .function(name)
      .map_err(|e| FunctionError::Failed(e.to_string()))?;

    self.stack.push(Call {
      file_path: self.file_path.clone(),
      function_name: name.to_string(),
      location: self.location,
    });

    let nested = FunctionContext {
      stack: self.stack.clone(),
      location: self.location,
      file_path: self.file_path.clone(),
      registry: self.registry.clone(),
    };
    let result = function.call(args, &nested).await.map_err(|e| match e {
      traced @ FunctionError::Traced { .. } => traced,
      other => FunctionError::Traced {
        function: name.to_string(),
        message: other.to_string(),
        stack: self.stack.snapshot(),
      },
    });

    self.stack.pop();
    result
  }
}

#[async_trait]
pub trait Function: Send + Sync {
  fn name(&self) -> &str;

  async fn call(&self, args: FunctionArgs, ctx: &FunctionContext) -> Result<MappingNode, FunctionError>;
}

#[async_trait]
pub trait CustomVariableType: Send + Sync {
  fn type_name(&self) -> &str;

  /// Allowed values keyed by a display label.
  async fn options(&self) -> Result<BTreeMap<String, ScalarValue>, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CapabilityKind {
  Resource,
  Link,
  DataSource,
  Function,
  CustomVariableType,
}

impl std::fmt::Display for CapabilityKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      CapabilityKind::Resource => "resource",
      CapabilityKind::Link => "link",
      CapabilityKind::DataSource => "data source",
      CapabilityKind::Function => "function",
      CapabilityKind::CustomVariableType => "custom variable type",
    };
    write!(f, "{name}")
  }
}

/// A registered implementation tagged by capability.
#[derive(Clone)]
pub enum Capability {
  Resource(Arc<dyn ResourceProvider>),
  Link(Arc<dyn LinkProvider>),
  DataSource(Arc<dyn DataSourceProvider>),
  Function(Arc<dyn Function>),
  CustomVariableType(Arc<dyn CustomVariableType>),
}

impl Capability {
  pub fn kind(&self) -> CapabilityKind {
    match self {
      Capability::Resource(_) => CapabilityKind::Resource,
      Capability::Link(_) => CapabilityKind::Link,
      Capability::DataSource(_) => CapabilityKind::DataSource,
      Capability::Function(_) => CapabilityKind::Function,
      Capability::CustomVariableType(_) => CapabilityKind::CustomVariableType,
    }
  }

  /// The type string the capability is registered under.
  pub fn type_name(&self) -> String {
    match self {
      Capability::Resource(p) => p.resource_type().to_string(),
      Capability::Link(p) => link_type(p.resource_type_a(), p.resource_type_b()),
      Capability::DataSource(p) => p.data_source_type().to_string(),
      Capability::Function(f) => f.name().to_string(),
      Capability::CustomVariableType(t) => t.type_name().to_string(),
    }
  }
}

impl std::fmt::Debug for Capability {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}({})", self.kind(), self.type_name())
  }
}

/// The registry key for a link between two resource types.
pub fn link_type(type_a: &str, type_b: &str) -> String {
  format!("{type_a}::{type_b}")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
  #[error("no {kind} registered for '{name}'")]
  NotFound { kind: CapabilityKind, name: String },
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
  entries: HashMap<(CapabilityKind, String), Capability>,
}

impl ProviderRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry pre-loaded with the core function library.
  pub fn with_core_functions() -> Self {
    let mut registry = Self::new();
    crate::functions::register_core_functions(&mut registry);
    registry
  }

  /// Register a capability, replacing any previous one with the same key.
  pub fn register(&mut self, capability: Capability) {
    let key = (capability.kind(), capability.type_name());
    self.entries.insert(key, capability);
  }

  pub fn register_resource(&mut self, provider: impl ResourceProvider + 'static) {
    self.register(Capability::Resource(Arc::new(provider)));
  }

  pub fn register_link(&mut self, provider: impl LinkProvider + 'static) {
    self.register(Capability::Link(Arc::new(provider)));
  }

  pub fn register_data_source(&mut self, provider: impl DataSourceProvider + 'static) {
    self.register(Capability::DataSource(Arc::new(provider)));
  }

  pub fn register_function(&mut self, function: impl Function + 'static) {
    self.register(Capability::Function(Arc::new(function)));
  }

  pub fn register_custom_variable_type(&mut self, var_type: impl CustomVariableType + 'static) {
    self.register(Capability::CustomVariableType(Arc::new(var_type)));
  }

  fn lookup(&self, kind: CapabilityKind, name: &str) -> Result<&Capability, RegistryError> {
    self
      .entries
      .get(&(kind, name.to_string()))
      .ok_or_else(|| RegistryError::NotFound {
        kind,
        name: name.to_string(),
      })
  }

  pub fn resource(&self, resource_type: &str) -> Result<Arc<dyn ResourceProvider>, RegistryError> {
    match self.lookup(CapabilityKind::Resource, resource_type)? {
      Capability::Resource(p) => Ok(p.clone()),
      _ => Err(RegistryError::NotFound {
        kind: CapabilityKind::Resource,
        name: resource_type.to_string(),
      }),
    }
  }

  pub fn link(&self, type_a: &str, type_b: &str) -> Option<Arc<dyn LinkProvider>> {
    match self.lookup(CapabilityKind::Link, &link_type(type_a, type_b)).ok()? {
      Capability::Link(p) => Some(p.clone()),
      _ => None,
    }
  }

  pub fn data_source(&self, data_source_type: &str) -> Result<Arc<dyn DataSourceProvider>, RegistryError> {
    match self.lookup(CapabilityKind::DataSource, data_source_type)? {
      Capability::DataSource(p) => Ok(p.clone()),
      _ => Err(RegistryError::NotFound {
        kind: CapabilityKind::DataSource,
        name: data_source_type.to_string(),
      }),
    }
  }

  pub fn function(&self, name: &str) -> Result<Arc<dyn Function>, RegistryError> {
    match self.lookup(CapabilityKind::Function, name)? {
      Capability::Function(f) => Ok(f.clone()),
      _ => Err(RegistryError::NotFound {
        kind: CapabilityKind::Function,
        name: name.to_string(),
      }),
    }
  }

  pub fn custom_variable_type(&self, type_name: &str) -> Result<Arc<dyn CustomVariableType>, RegistryError> {
    match self.lookup(CapabilityKind::CustomVariableType, type_name)? {
      Capability::CustomVariableType(t) => Ok(t.clone()),
      _ => Err(RegistryError::NotFound {
        kind: CapabilityKind::CustomVariableType,
        name: type_name.to_string(),
      }),
    }
  }

  pub fn has(&self, kind: CapabilityKind, name: &str) -> bool {
    self.entries.contains_key(&(kind, name.to_string()))
  }
}
