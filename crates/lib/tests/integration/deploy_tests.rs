//! Deploy and destroy integration tests.

use blueprint_lib::deploy::{DeployEvent, DestroyInput};
use blueprint_lib::stage::ChangeAction;
use blueprint_lib::state::{ElementStatus, RunStatus};
use blueprint_lib::util::cancel::CancelToken;
use blueprint_lib::value::MappingNode;
use tokio::sync::mpsc;

use super::common::{TestEnv, dead_letter_blueprint, expr, shop_blueprint, shop_with_child};

#[tokio::test]
async fn deploy_then_destroy_round_trip() {
  let env = TestEnv::new();
  let summary = env.deploy(&shop_blueprint()).await;

  assert_eq!(summary.status, RunStatus::Completed);
  assert_eq!(
    env.calls(),
    vec!["deploy:orders", "deploy:worker", "link:worker::orders"]
  );
  assert_eq!(summary.exports["queue_id"], MappingNode::string("id-orders"));

  let instance = env.instance("shop").await.unwrap();
  assert_eq!(instance.status, RunStatus::Completed);
  let worker = instance.resources["worker"].spec.as_fields().unwrap();
  assert_eq!(worker["queue_id"], MappingNode::string("id-orders"));
  assert_eq!(instance.links["worker::orders"].status, ElementStatus::Succeeded);
  assert!(env.temp.path().join("state").join("instances").join("shop.json").exists());

  assert!(env.stage(&shop_blueprint()).await.is_empty());

  env.clear_calls();
  let destroyed = env
    .orchestrator()
    .destroy(
      DestroyInput {
        instance_id: "shop".to_string(),
      },
      None,
      &CancelToken::new(),
    )
    .await
    .unwrap();
  assert_eq!(destroyed.status, RunStatus::Completed);
  assert_eq!(
    env.calls(),
    vec!["unlink:worker::orders", "destroy:worker", "destroy:orders"]
  );
  assert!(env.instance("shop").await.is_none());
  assert!(env.cloud.lock().unwrap().is_empty());
}

#[tokio::test]
async fn updates_only_touch_changed_elements() {
  let env = TestEnv::new();
  env.deploy(&shop_blueprint()).await;
  env.clear_calls();

  let mut bp = shop_blueprint();
  bp.resources.get_mut("worker").unwrap().spec = MappingNode::fields([
    ("queue_id", expr("${resources.orders.spec.id}")),
    ("memory", MappingNode::int(256)),
  ]);
  let summary = env.deploy(&bp).await;

  assert_eq!(summary.status, RunStatus::Completed);
  assert_eq!(summary.elements["resources.worker"].action, Some(ChangeAction::Update));
  assert!(!summary.elements.contains_key("resources.orders"));
  assert_eq!(env.calls(), vec!["deploy:worker", "link:worker::orders"]);
  let instance = env.instance("shop").await.unwrap();
  assert_eq!(
    instance.resources["worker"].spec.as_fields().unwrap()["memory"],
    MappingNode::int(256)
  );
}

#[tokio::test]
async fn replacing_a_queue_recreates_it() {
  let env = TestEnv::new();
  env.deploy(&shop_blueprint()).await;
  env.clear_calls();

  let mut bp = shop_blueprint();
  bp.resources.get_mut("orders").unwrap().spec = MappingNode::fields([
    ("name", expr("orders-${variables.env}")),
    ("fifo", MappingNode::bool(true)),
  ]);
  let changes = env.stage(&bp).await;
  assert_eq!(changes.resources["orders"].action, ChangeAction::Recreate);
  assert_eq!(changes.resources["worker"].known_on_deploy, vec!["spec.queue_id"]);

  let summary = env.deploy_changes(&bp, changes, false).await;
  assert_eq!(summary.status, RunStatus::Completed);
  let calls = env.calls();
  assert_eq!(&calls[..2], ["destroy:orders", "deploy:orders"]);
  // The new queue kept its id, so the worker needed nothing.
  assert!(!calls.contains(&"deploy:worker".to_string()));
  assert_eq!(summary.elements["resources.worker"].action, None);
}

#[tokio::test]
async fn child_blueprints_deploy_as_their_own_instances() {
  let mut env = TestEnv::new();
  env.add_source("dlq.json", &dead_letter_blueprint());

  let summary = env.deploy(&shop_with_child()).await;
  assert_eq!(summary.status, RunStatus::Completed, "{summary:#?}");
  assert_eq!(summary.exports["dlq_id"], MappingNode::string("id-dlq"));

  let parent = env.instance("shop").await.unwrap();
  assert_eq!(parent.children["deadletter"], "shop.deadletter");
  let child = env.instance("shop.deadletter").await.unwrap();
  assert_eq!(child.status, RunStatus::Completed);
  assert_eq!(
    child.resources["dlq"].spec.as_fields().unwrap()["name"],
    MappingNode::string("dlq-shop")
  );

  env
    .orchestrator()
    .destroy(
      DestroyInput {
        instance_id: "shop".to_string(),
      },
      None,
      &CancelToken::new(),
    )
    .await
    .unwrap();
  assert!(env.instance("shop.deadletter").await.is_none());
  assert!(env.calls().contains(&"destroy:dlq".to_string()));
}

#[tokio::test]
async fn failed_dependencies_fail_their_dependents() {
  let env = TestEnv::new();
  env.queue.fail("orders");

  let summary = env.deploy(&shop_blueprint()).await;
  assert_eq!(summary.status, RunStatus::Failed);
  assert_eq!(
    summary.elements["resources.orders"].failure_reasons,
    vec!["deploy of orders was rejected"]
  );
  assert_eq!(summary.elements["resources.worker"].status, ElementStatus::Failed);
  assert_eq!(summary.elements["links.worker::orders"].status, ElementStatus::Failed);
  assert_eq!(env.calls(), vec!["deploy:orders"]);
  assert_eq!(env.instance("shop").await.unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn rollback_destroys_what_the_run_created() {
  let env = TestEnv::new();
  env.function.fail("worker");

  let changes = env.stage(&shop_blueprint()).await;
  let (tx, mut rx) = mpsc::unbounded_channel();
  let summary = env
    .orchestrator()
    .deploy(
      blueprint_lib::deploy::DeployInput {
        instance_id: "shop".to_string(),
        blueprint: shop_blueprint(),
        changes,
        params: [("env".to_string(), MappingNode::string("prod"))].into(),
        rollback: true,
        ..Default::default()
      },
      Some(tx),
      &CancelToken::new(),
    )
    .await
    .unwrap();

  assert_eq!(summary.status, RunStatus::PartiallyFailed);
  let rollback = summary.rollback.unwrap();
  assert_eq!(rollback.reverted, vec!["resources.orders"]);
  assert!(env.cloud.lock().unwrap().is_empty());
  assert!(!env.instance("shop").await.unwrap().resources.contains_key("orders"));

  let mut rolled_back = Vec::new();
  while let Ok(event) = rx.try_recv() {
    if let DeployEvent::Rollback { element, reverted, .. } = event {
      rolled_back.push((element, reverted));
    }
  }
  assert_eq!(rolled_back, vec![("resources.orders".to_string(), true)]);
}
