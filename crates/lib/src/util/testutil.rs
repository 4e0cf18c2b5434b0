//! Test utilities for blueprint-lib.
//!
//! In-memory providers that record every call, so unit tests can assert on
//! ordering and inject failures without touching real infrastructure.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::registry::{
  DataSourceFetchInput, DataSourceProvider, LinkDeployInput, LinkDestroyInput, LinkPriority, LinkProvider,
  ProviderError, ResourceDefinition, ResourceDeployInput, ResourceDeployOutput, ResourceInfo, ResourceProvider,
};
use crate::substitution::parse;
use crate::value::MappingNode;

/// Parse a `${..}` string into an unresolved node.
pub fn expr(input: &str) -> MappingNode {
  MappingNode::Substitutions(parse(input).unwrap())
}

/// Shared, ordered log of provider calls such as `deploy:orders`.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn calls(log: &CallLog) -> Vec<String> {
  log.lock().unwrap().clone()
}

/// A resource provider that echoes specs back and records calls.
#[derive(Clone)]
pub struct TestResource {
  resource_type: String,
  definition: ResourceDefinition,
  computed: BTreeMap<String, MappingNode>,
  log: CallLog,
  failing: Arc<Mutex<BTreeSet<String>>>,
  external: Arc<Mutex<BTreeMap<String, Option<MappingNode>>>>,
}

impl TestResource {
  pub fn new(resource_type: &str) -> Self {
    Self {
      resource_type: resource_type.to_string(),
      definition: ResourceDefinition::default(),
      computed: BTreeMap::new(),
      log: CallLog::default(),
      failing: Arc::default(),
      external: Arc::default(),
    }
  }

  pub fn with_definition(mut self, definition: ResourceDefinition) -> Self {
    self.definition = definition;
    self
  }

  /// Value returned for `path` by every deploy.
  pub fn with_computed(mut self, path: &str, value: MappingNode) -> Self {
    self.computed.insert(path.to_string(), value);
    self
  }

  pub fn with_log(mut self, log: CallLog) -> Self {
    self.log = log;
    self
  }

  pub fn log(&self) -> CallLog {
    self.log.clone()
  }

  /// Make every call for `resource_name` fail.
  pub fn fail(&self, resource_name: &str) {
    self.failing.lock().unwrap().insert(resource_name.to_string());
  }

  /// Override the live state reported for a resource. `None` means gone.
  pub fn set_external(&self, resource_name: &str, state: Option<MappingNode>) {
    self.external.lock().unwrap().insert(resource_name.to_string(), state);
  }

  fn record(&self, op: &str, resource_name: &str) -> Result<(), ProviderError> {
    self.log.lock().unwrap().push(format!("{op}:{resource_name}"));
    if self.failing.lock().unwrap().contains(resource_name) {
      return Err(ProviderError::new(format!("{op} of {resource_name} failed")));
    }
    Ok(())
  }
}

#[async_trait]
impl ResourceProvider for TestResource {
  fn resource_type(&self) -> &str {
    &self.resource_type
  }

  fn definition(&self) -> ResourceDefinition {
    self.definition.clone()
  }

  async fn deploy(&self, input: ResourceDeployInput) -> Result<ResourceDeployOutput, ProviderError> {
    self.record("deploy", &input.resource.resource_name)?;
    Ok(ResourceDeployOutput {
      computed_fields: self.computed.clone(),
    })
  }

  async fn destroy(&self, resource: &ResourceInfo) -> Result<(), ProviderError> {
    self.record("destroy", &resource.resource_name)
  }

  async fn get_external_state(&self, resource: &ResourceInfo) -> Result<Option<MappingNode>, ProviderError> {
    match self.external.lock().unwrap().get(&resource.resource_name) {
      Some(state) => Ok(state.clone()),
      None => Ok(Some(resource.spec.clone())),
    }
  }
}

/// A link provider that records calls into a shared log.
#[derive(Clone)]
pub struct TestLink {
  type_a: String,
  type_b: String,
  priority: LinkPriority,
  log: CallLog,
}

impl TestLink {
  pub fn new(type_a: &str, type_b: &str) -> Self {
    Self {
      type_a: type_a.to_string(),
      type_b: type_b.to_string(),
      priority: LinkPriority::None,
      log: CallLog::default(),
    }
  }

  pub fn with_priority(mut self, priority: LinkPriority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_log(mut self, log: CallLog) -> Self {
    self.log = log;
    self
  }
}

#[async_trait]
impl LinkProvider for TestLink {
  fn resource_type_a(&self) -> &str {
    &self.type_a
  }

  fn resource_type_b(&self) -> &str {
    &self.type_b
  }

  fn priority(&self) -> LinkPriority {
    self.priority
  }

  async fn deploy(&self, input: LinkDeployInput) -> Result<MappingNode, ProviderError> {
    self.log.lock().unwrap().push(format!("link:{}", input.link_name));
    Ok(MappingNode::fields([(
      "wired",
      MappingNode::string(format!(
        "{}->{}",
        input.resource_a.resource_name, input.resource_b.resource_name
      )),
    )]))
  }

  async fn destroy(&self, input: LinkDestroyInput) -> Result<(), ProviderError> {
    self.log.lock().unwrap().push(format!("unlink:{}", input.link_name));
    Ok(())
  }
}

/// A data source returning fixed fields and counting fetches.
pub struct TestDataSource {
  data_source_type: String,
  fields: BTreeMap<String, MappingNode>,
  fetches: Arc<AtomicUsize>,
}

impl TestDataSource {
  pub fn new(data_source_type: &str, fields: BTreeMap<String, MappingNode>) -> Self {
    Self {
      data_source_type: data_source_type.to_string(),
      fields,
      fetches: Arc::default(),
    }
  }

  pub fn fetch_count(&self) -> Arc<AtomicUsize> {
    self.fetches.clone()
  }
}

#[async_trait]
impl DataSourceProvider for TestDataSource {
  fn data_source_type(&self) -> &str {
    &self.data_source_type
  }

  async fn fetch(&self, _input: DataSourceFetchInput) -> Result<BTreeMap<String, MappingNode>, ProviderError> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    Ok(self.fields.clone())
  }
}
