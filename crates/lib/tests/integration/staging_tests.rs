//! Staging integration tests.

use blueprint_lib::diagnostics::ReasonCode;
use blueprint_lib::stage::ChangeAction;
use blueprint_lib::state::StateContainer;
use blueprint_lib::value::MappingNode;

use super::common::{TestEnv, dead_letter_blueprint, shop_blueprint, shop_with_child};

#[tokio::test]
async fn new_instance_stages_every_element() {
  let env = TestEnv::new();
  let changes = env.stage(&shop_blueprint()).await;

  assert_eq!(changes.resources["orders"].action, ChangeAction::Create);
  let worker = &changes.resources["worker"];
  assert_eq!(worker.action, ChangeAction::Create);
  assert_eq!(worker.known_on_deploy, vec!["spec.queue_id"]);
  assert_eq!(worker.depends_on, vec!["resources.orders"]);
  assert_eq!(changes.links["worker::orders"].action, ChangeAction::Create);

  let export = &changes.exports["queue_id"];
  assert_eq!(export.action, ChangeAction::Create);
  assert!(export.known_on_deploy);
  assert_eq!(changes.summary.resources.create, 2);
  assert!(env.calls().is_empty(), "{:?}", env.calls());
}

#[tokio::test]
async fn params_override_variable_defaults() {
  let env = TestEnv::new();
  let changes = env.stage(&shop_blueprint()).await;
  let name = changes.resources["orders"]
    .new_fields
    .iter()
    .find(|f| f.path == "spec.name")
    .unwrap();
  assert_eq!(name.new, Some(MappingNode::string("orders-prod")));

  let defaults = env
    .stage_with(&shop_blueprint(), env.options(&[]))
    .await
    .changes()
    .unwrap();
  let name = defaults.resources["orders"]
    .new_fields
    .iter()
    .find(|f| f.path == "spec.name")
    .unwrap();
  assert_eq!(name.new, Some(MappingNode::string("orders-dev")));
}

#[tokio::test]
async fn change_sets_are_recorded_on_disk() {
  let env = TestEnv::new();
  let changes = env.stage(&shop_blueprint()).await;

  let id = changes.changeset_id.clone().unwrap();
  let record = env.state.get_changeset(&id).await.unwrap().unwrap();
  assert_eq!(record.instance_id.as_deref(), Some("shop"));
  assert_eq!(record.changes.resources, changes.resources);
  assert!(
    env
      .temp
      .path()
      .join("state")
      .join("changesets")
      .join(format!("{id}.json"))
      .exists()
  );
}

#[tokio::test]
async fn included_blueprints_are_staged_as_children() {
  let mut env = TestEnv::new();
  env.add_source("dlq.json", &dead_letter_blueprint());

  let changes = env.stage(&shop_with_child()).await;
  let child = &changes.children["deadletter"];
  assert_eq!(child.action, ChangeAction::Create);
  assert_eq!(child.path.as_deref(), Some("dlq.json"));
  assert_eq!(child.child_instance_id.as_deref(), Some("shop.deadletter"));

  let nested = child.changes.as_ref().unwrap();
  assert_eq!(nested.resources["dlq"].action, ChangeAction::Create);
  assert!(changes.exports["dlq_id"].known_on_deploy);
}

#[tokio::test]
async fn child_errors_surface_on_the_parent_change_set() {
  let mut env = TestEnv::new();
  env.add_source("dlq.json", &dead_letter_blueprint());

  let mut bp = shop_with_child();
  bp.includes.get_mut("deadletter").unwrap().variables.clear();
  let changes = env.stage(&bp).await;

  assert!(changes.has_errors());
  assert!(!changes.children.contains_key("deadletter"));
  let diagnostic = changes
    .diagnostics
    .iter()
    .find(|d| d.element.as_deref() == Some("children.deadletter"))
    .unwrap();
  assert!(diagnostic.is_error());
  assert_eq!(diagnostic.reason, ReasonCode::MissingVariable);
  assert!(diagnostic.message.contains("owner"), "{}", diagnostic.message);
}
