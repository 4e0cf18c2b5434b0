//! Shared test helpers for engine integration tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use blueprint_lib::async_trait;
use blueprint_lib::config::EngineConfig;
use blueprint_lib::deploy::{DeployInput, DeploySummary, Orchestrator};
use blueprint_lib::registry::{
  LinkDeployInput, LinkDestroyInput, LinkPriority, LinkProvider, ProviderError, ProviderRegistry, ResourceDefinition,
  ResourceDeployInput, ResourceDeployOutput, ResourceInfo, ResourceProvider,
};
use blueprint_lib::schema::{Blueprint, Export, Include, Resource, Variable, VariableType};
use blueprint_lib::stage::{BlueprintChanges, ChangeStager, ChildResolver, StageOptions, StageOutcome};
use blueprint_lib::state::{FileStateContainer, InstanceState, StateContainer};
use blueprint_lib::substitution::parse;
use blueprint_lib::util::cancel::CancelToken;
use blueprint_lib::value::MappingNode;
use tempfile::TempDir;

/// Parse a `${..}` string into an unresolved node.
pub fn expr(input: &str) -> MappingNode {
  MappingNode::Substitutions(parse(input).unwrap())
}

/// Ordered log of provider calls, for example `deploy:orders`.
pub type Calls = Arc<Mutex<Vec<String>>>;

/// Resources as the "cloud" currently sees them, keyed by resource name.
pub type Cloud = Arc<Mutex<BTreeMap<String, MappingNode>>>;

/// A resource provider backed by an in-memory cloud.
#[derive(Clone)]
pub struct CloudResource {
  resource_type: String,
  definition: ResourceDefinition,
  calls: Calls,
  cloud: Cloud,
  failing: Arc<Mutex<BTreeSet<String>>>,
}

impl CloudResource {
  pub fn new(resource_type: &str, definition: ResourceDefinition, calls: Calls, cloud: Cloud) -> Self {
    Self {
      resource_type: resource_type.to_string(),
      definition,
      calls,
      cloud,
      failing: Arc::default(),
    }
  }

  pub fn fail(&self, name: &str) {
    self.failing.lock().unwrap().insert(name.to_string());
  }

  fn record(&self, op: &str, name: &str) -> Result<(), ProviderError> {
    self.calls.lock().unwrap().push(format!("{op}:{name}"));
    if self.failing.lock().unwrap().contains(name) {
      return Err(ProviderError::new(format!("{op} of {name} was rejected")));
    }
    Ok(())
  }
}

#[async_trait]
impl ResourceProvider for CloudResource {
  fn resource_type(&self) -> &str {
    &self.resource_type
  }

  fn definition(&self) -> ResourceDefinition {
    self.definition.clone()
  }

  async fn deploy(&self, input: ResourceDeployInput) -> Result<ResourceDeployOutput, ProviderError> {
    let name = input.resource.resource_name;
    self.record("deploy", &name)?;

    let mut computed = BTreeMap::new();
    if self.definition.computed_fields.iter().any(|f| f == "spec.id") {
      computed.insert("spec.id".to_string(), MappingNode::string(format!("id-{name}")));
    }
    let mut live = input.resource.spec;
    if let (MappingNode::Fields(fields), Some(id)) = (&mut live, computed.get("spec.id")) {
      fields.insert("id".to_string(), id.clone());
    }
    self.cloud.lock().unwrap().insert(name, live);
    Ok(ResourceDeployOutput {
      computed_fields: computed,
    })
  }

  async fn destroy(&self, resource: &ResourceInfo) -> Result<(), ProviderError> {
    self.record("destroy", &resource.resource_name)?;
    self.cloud.lock().unwrap().remove(&resource.resource_name);
    Ok(())
  }

  async fn get_external_state(&self, resource: &ResourceInfo) -> Result<Option<MappingNode>, ProviderError> {
    Ok(self.cloud.lock().unwrap().get(&resource.resource_name).cloned())
  }
}

/// Wires functions to the queues they consume.
pub struct Subscription {
  calls: Calls,
}

#[async_trait]
impl LinkProvider for Subscription {
  fn resource_type_a(&self) -> &str {
    "cloud/function"
  }

  fn resource_type_b(&self) -> &str {
    "cloud/queue"
  }

  fn priority(&self) -> LinkPriority {
    LinkPriority::ResourceB
  }

  async fn deploy(&self, input: LinkDeployInput) -> Result<MappingNode, ProviderError> {
    self.calls.lock().unwrap().push(format!("link:{}", input.link_name));
    Ok(MappingNode::fields([(
      "subscription",
      MappingNode::string(format!(
        "{}->{}",
        input.resource_a.resource_name, input.resource_b.resource_name
      )),
    )]))
  }

  async fn destroy(&self, input: LinkDestroyInput) -> Result<(), ProviderError> {
    self.calls.lock().unwrap().push(format!("unlink:{}", input.link_name));
    Ok(())
  }
}

/// Serves child blueprints from memory.
#[derive(Clone, Default)]
pub struct Sources(pub HashMap<String, String>);

#[async_trait]
impl ChildResolver for Sources {
  async fn resolve(&self, _include_name: &str, path: &str) -> Result<String, ProviderError> {
    self
      .0
      .get(path)
      .cloned()
      .ok_or_else(|| ProviderError::new(format!("no such blueprint: {path}")))
  }
}

/// Isolated engine environment.
///
/// Each test gets its own temporary state directory and cloud.
pub struct TestEnv {
  pub temp: TempDir,
  pub calls: Calls,
  pub cloud: Cloud,
  pub queue: CloudResource,
  pub function: CloudResource,
  pub state: Arc<FileStateContainer>,
  pub registry: Arc<ProviderRegistry>,
  pub sources: Sources,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let calls = Calls::default();
    let cloud = Cloud::default();
    let queue = CloudResource::new(
      "cloud/queue",
      ResourceDefinition {
        computed_fields: vec!["spec.id".to_string()],
        replace_on_change: vec!["spec.fifo".to_string()],
        ..Default::default()
      },
      calls.clone(),
      cloud.clone(),
    );
    let function = CloudResource::new("cloud/function", ResourceDefinition::default(), calls.clone(), cloud.clone());

    let mut registry = ProviderRegistry::with_core_functions();
    registry.register_resource(queue.clone());
    registry.register_resource(function.clone());
    registry.register_link(Subscription { calls: calls.clone() });

    let state = Arc::new(FileStateContainer::new(temp.path().join("state")));
    Self {
      temp,
      calls,
      cloud,
      queue,
      function,
      state,
      registry: Arc::new(registry),
      sources: Sources::default(),
    }
  }

  pub fn add_source(&mut self, path: &str, blueprint: &Blueprint) {
    self
      .sources
      .0
      .insert(path.to_string(), serde_json::to_string(blueprint).unwrap());
  }

  pub fn config(&self) -> EngineConfig {
    EngineConfig {
      concurrency: 4,
      ..Default::default()
    }
  }

  pub fn stager(&self) -> ChangeStager {
    ChangeStager::new(self.registry.clone(), self.state.clone(), self.config()).with_child_resolver(self.sources.clone())
  }

  pub fn orchestrator(&self) -> Orchestrator {
    Orchestrator::new(self.registry.clone(), self.state.clone(), self.config()).with_child_resolver(self.sources.clone())
  }

  pub fn options(&self, params: &[(&str, &str)]) -> StageOptions {
    StageOptions {
      instance_id: Some("shop".to_string()),
      params: params
        .iter()
        .map(|(k, v)| (k.to_string(), MappingNode::string(*v)))
        .collect(),
      ..Default::default()
    }
  }

  pub async fn stage_with(&self, blueprint: &Blueprint, options: StageOptions) -> StageOutcome {
    self
      .stager()
      .stage(blueprint.clone(), options, &CancelToken::new())
      .await
      .unwrap()
  }

  pub async fn stage(&self, blueprint: &Blueprint) -> BlueprintChanges {
    self
      .stage_with(blueprint, self.options(&[("env", "prod")]))
      .await
      .changes()
      .expect("staging reported drift")
  }

  pub async fn deploy_changes(&self, blueprint: &Blueprint, changes: BlueprintChanges, rollback: bool) -> DeploySummary {
    self
      .orchestrator()
      .deploy(
        DeployInput {
          instance_id: "shop".to_string(),
          blueprint: blueprint.clone(),
          changes,
          params: BTreeMap::from([("env".to_string(), MappingNode::string("prod"))]),
          rollback,
          ..Default::default()
        },
        None,
        &CancelToken::new(),
      )
      .await
      .unwrap()
  }

  pub async fn deploy(&self, blueprint: &Blueprint) -> DeploySummary {
    let changes = self.stage(blueprint).await;
    self.deploy_changes(blueprint, changes, false).await
  }

  pub async fn instance(&self, id: &str) -> Option<InstanceState> {
    self.state.get_instance(id).await.unwrap()
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn clear_calls(&self) {
    self.calls.lock().unwrap().clear();
  }
}

/// An order queue, a worker consuming it and an export of the queue id.
pub fn shop_blueprint() -> Blueprint {
  let mut bp = Blueprint::default();
  bp.variables
    .insert("env".to_string(), Variable::new(VariableType::String).with_default("dev"));
  bp.resources.insert(
    "orders".to_string(),
    Resource::new(
      "cloud/queue",
      MappingNode::fields([("name", expr("orders-${variables.env}")), ("fifo", MappingNode::bool(false))]),
    )
    .with_labels(&[("app", "shop")]),
  );
  bp.resources.insert(
    "worker".to_string(),
    Resource::new(
      "cloud/function",
      MappingNode::fields([
        ("queue_id", expr("${resources.orders.spec.id}")),
        ("memory", MappingNode::int(128)),
      ]),
    )
    .with_link_selector(&[("app", "shop")]),
  );
  bp.exports
    .insert("queue_id".to_string(), Export::new(expr("${resources.orders.spec.id}")));
  bp
}

/// A child blueprint with a single dead-letter queue.
pub fn dead_letter_blueprint() -> Blueprint {
  let mut bp = Blueprint::default();
  bp.variables
    .insert("owner".to_string(), Variable::new(VariableType::String));
  bp.resources.insert(
    "dlq".to_string(),
    Resource::new(
      "cloud/queue",
      MappingNode::fields([("name", expr("dlq-${variables.owner}")), ("fifo", MappingNode::bool(true))]),
    ),
  );
  bp.exports
    .insert("dlq_id".to_string(), Export::new(expr("${resources.dlq.spec.id}")));
  bp
}

/// The shop blueprint including the dead-letter child.
pub fn shop_with_child() -> Blueprint {
  let mut bp = shop_blueprint();
  let mut include = Include::new("dlq.json");
  include.variables.insert("owner".to_string(), MappingNode::string("shop"));
  bp.includes.insert("deadletter".to_string(), include);
  bp.exports.insert(
    "dlq_id".to_string(),
    Export::new(expr("${children.deadletter.dlq_id}")),
  );
  bp
}
