//! Drift detection and reconciliation integration tests.

use blueprint_lib::deploy::{DeployError, DeployInput};
use blueprint_lib::diagnostics::ReasonCode;
use blueprint_lib::graph::ElementId;
use blueprint_lib::reconcile::{DriftDetector, ElementReconcileStatus, ReconcileAction};
use blueprint_lib::stage::{ChangeAction, StageOptions, StageOutcome};
use blueprint_lib::state::{ElementStatus, RunStatus, StateContainer};
use blueprint_lib::util::cancel::CancelToken;
use blueprint_lib::value::MappingNode;

use super::common::{TestEnv, shop_blueprint};

/// Flip the live `fifo` flag of the orders queue behind the engine's back.
fn tamper_with_orders(env: &TestEnv) {
  let mut cloud = env.cloud.lock().unwrap();
  if let Some(MappingNode::Fields(fields)) = cloud.get_mut("orders") {
    fields.insert("fifo".to_string(), MappingNode::bool(true));
  }
}

fn detector(env: &TestEnv) -> DriftDetector {
  DriftDetector::new(env.registry.clone(), env.state.clone())
}

#[tokio::test]
async fn external_changes_stop_staging() {
  let env = TestEnv::new();
  env.deploy(&shop_blueprint()).await;
  tamper_with_orders(&env);

  let outcome = env.stage_with(&shop_blueprint(), env.options(&[("env", "prod")])).await;
  let StageOutcome::Drift(report) = outcome else {
    panic!("expected the drift report");
  };
  assert!(report.drift_detected);
  assert_eq!(report.affected_elements(), vec!["resources.orders"]);
  let ElementReconcileStatus::Drifted { changes } = &report.resources["orders"] else {
    panic!("orders should have drifted");
  };
  assert_eq!(changes[0].path, "spec.fifo");
  assert!(env.instance("shop").await.unwrap().resources["orders"].drifted);

  let acknowledged = env
    .stage_with(
      &shop_blueprint(),
      StageOptions {
        allow_drift: true,
        ..env.options(&[("env", "prod")])
      },
    )
    .await
    .changes()
    .unwrap();
  assert!(acknowledged.acknowledged_drift);
  assert!(
    acknowledged
      .diagnostics
      .iter()
      .any(|d| d.reason == ReasonCode::DriftAcknowledged)
  );
}

#[tokio::test]
async fn accepted_external_state_is_diffed_against() {
  let env = TestEnv::new();
  env.deploy(&shop_blueprint()).await;
  tamper_with_orders(&env);

  detector(&env)
    .apply("shop", vec![ReconcileAction::AcceptExternal(ElementId::Resource("orders".to_string()))])
    .await
    .unwrap();
  let orders = &env.instance("shop").await.unwrap().resources["orders"];
  assert!(!orders.drifted);
  assert_eq!(orders.spec.as_fields().unwrap()["fifo"], MappingNode::bool(true));

  // The blueprint still asks for a standard queue, which forces a replacement.
  let changes = env.stage(&shop_blueprint()).await;
  assert_eq!(changes.resources["orders"].action, ChangeAction::Recreate);
}

#[tokio::test]
async fn vanished_resources_are_recreated_once_accepted() {
  let env = TestEnv::new();
  env.deploy(&shop_blueprint()).await;
  env.cloud.lock().unwrap().remove("worker");

  let instance = env.instance("shop").await.unwrap();
  let report = detector(&env).check(&instance).await.unwrap();
  assert_eq!(report.resources["worker"], ElementReconcileStatus::Missing);

  detector(&env)
    .apply("shop", vec![ReconcileAction::AcceptExternal(ElementId::Resource("worker".to_string()))])
    .await
    .unwrap();
  assert!(!env.instance("shop").await.unwrap().resources.contains_key("worker"));

  // The subscription still points at the missing worker until it is redeployed.
  let changes = env
    .stage_with(
      &shop_blueprint(),
      StageOptions {
        allow_drift: true,
        ..env.options(&[("env", "prod")])
      },
    )
    .await
    .changes()
    .unwrap();
  assert_eq!(changes.resources["worker"].action, ChangeAction::Create);
  assert_eq!(changes.links["worker::orders"].action, ChangeAction::Update);
}

#[tokio::test]
async fn deploys_refuse_checked_drift_until_acknowledged() {
  let env = TestEnv::new();
  env.deploy(&shop_blueprint()).await;
  let changes = env.stage(&shop_blueprint()).await;
  tamper_with_orders(&env);

  let instance = env.instance("shop").await.unwrap();
  let report = detector(&env).check(&instance).await.unwrap();
  assert!(report.drift_detected);
  assert!(env.instance("shop").await.unwrap().resources["orders"].drifted);

  env.clear_calls();
  let err = env
    .orchestrator()
    .deploy(
      DeployInput {
        instance_id: "shop".to_string(),
        blueprint: shop_blueprint(),
        changes,
        params: [("env".to_string(), MappingNode::string("prod"))].into(),
        allow_drift: false,
        ..Default::default()
      },
      None,
      &CancelToken::new(),
    )
    .await
    .unwrap_err();
  assert!(
    matches!(err, DeployError::UnresolvedDrift { ref elements, .. } if elements == &["resources.orders"]),
    "{err}"
  );
  assert!(env.calls().is_empty());
  assert_eq!(env.instance("shop").await.unwrap().status, RunStatus::Completed);

  let acknowledged = env
    .stage_with(
      &shop_blueprint(),
      StageOptions {
        allow_drift: true,
        ..env.options(&[("env", "prod")])
      },
    )
    .await
    .changes()
    .unwrap();
  let summary = env.deploy_changes(&shop_blueprint(), acknowledged, false).await;
  assert_eq!(summary.status, RunStatus::Completed);
}

#[tokio::test]
async fn interrupted_runs_are_settled_before_redeploying() {
  let env = TestEnv::new();
  env.deploy(&shop_blueprint()).await;
  env
    .state
    .update_resource_status("shop", "orders", "cloud/queue", ElementStatus::InProgress, Vec::new())
    .await
    .unwrap();

  let err = env
    .orchestrator()
    .deploy(
      DeployInput {
        instance_id: "shop".to_string(),
        blueprint: shop_blueprint(),
        ..Default::default()
      },
      None,
      &CancelToken::new(),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, DeployError::UnresolvedDrift { .. }), "{err}");

  detector(&env)
    .apply("shop", vec![ReconcileAction::MarkFailed(ElementId::Resource("orders".to_string()))])
    .await
    .unwrap();

  let changes = env.stage(&shop_blueprint()).await;
  assert_eq!(changes.resources["orders"].action, ChangeAction::Update);
  let summary = env.deploy_changes(&shop_blueprint(), changes, false).await;
  assert_eq!(summary.status, RunStatus::Completed);
  let instance = env.instance("shop").await.unwrap();
  assert_eq!(instance.resources["orders"].status, ElementStatus::Succeeded);
}
