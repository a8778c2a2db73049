// Command intake behind `serve`, driven in-process

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use workflow_orchestrator::cache::{CacheTtls, MokaCache};
use workflow_orchestrator::config::WorkflowOrchestratorConfig;
use workflow_orchestrator::events::{EventCoordinator, EVENT_SIGNAL};
use workflow_orchestrator::orchestration::{
    ApprovalAggregator, LoggingNotifier, OrchestrationDriver, RunRegistry, SignalBridge, SignalHub,
};
use workflow_orchestrator::store::Repositories;
use workflow_orchestrator::{InstanceLifecycleService, Intake};

fn intake() -> (Intake, mpsc::UnboundedReceiver<Value>) {
    let repos = Repositories::in_memory();
    let cache = Arc::new(MokaCache::default());
    let events = EventCoordinator::new(repos.events.clone(), cache.clone(), CacheTtls::default());
    let signals = Arc::new(SignalHub::new(8));
    let runs = Arc::new(RunRegistry::new());
    events.register_listener(EVENT_SIGNAL, Arc::new(SignalBridge::new(signals.clone())));

    let notifier = Arc::new(LoggingNotifier);
    let driver = OrchestrationDriver::new(
        repos.runs.clone(),
        notifier.clone(),
        signals.clone(),
        runs.clone(),
        WorkflowOrchestratorConfig::default().orchestration,
    );
    let approvals = ApprovalAggregator::new(notifier, signals.clone(), runs.clone());
    let definitions = repos.definitions.clone();
    let lifecycle = InstanceLifecycleService::new(repos, cache, CacheTtls::default())
        .with_events(events.clone())
        .with_signals(signals)
        .with_run_registry(runs);
    Intake::new(definitions, lifecycle, driver, approvals, events)
}

async fn ok(intake: &Intake, line: Value) -> Value {
    let reply = intake.handle_line(&line.to_string()).await.unwrap();
    assert_eq!(reply["ok"], true, "{reply}");
    reply["result"].clone()
}

#[tokio::test(start_paused = true)]
async fn process_started_through_intake_completes_on_signal() {
    let (intake, mut reports) = intake();
    ok(&intake, json!({"op": "deploy_definition", "id": 1, "key": "order"})).await;
    let instance = ok(
        &intake,
        json!({
            "op": "start_process",
            "process_definition_key": "order",
            "start_user_id": "dana",
            "variables": {"amount": 40}
        }),
    )
    .await;
    let id = instance["id"].as_str().unwrap().to_string();
    assert_eq!(instance["variables"]["initiator"]["value"], "dana");

    ok(
        &intake,
        json!({
            "op": "signal",
            "signal_name": "complete",
            "process_instance_id": id,
            "variables": {"shipped": true}
        }),
    )
    .await;

    let report = reports.recv().await.unwrap();
    assert_eq!(report["report"], "process_run");
    assert_eq!(report["result"]["status"], "completed");
    assert_eq!(report["result"]["process_instance_id"], id.as_str());
}

#[tokio::test(start_paused = true)]
async fn task_lifecycle_through_intake() {
    let (intake, mut reports) = intake();
    ok(
        &intake,
        json!({"op": "create_task", "task_id": "t-1", "process_instance_id": "pi-1", "name": "pack"}),
    )
    .await;
    ok(&intake, json!({"op": "claim_task", "task_id": "t-1", "user_id": "erin"})).await;

    let conflict = intake
        .handle_line(&json!({"op": "claim_task", "task_id": "t-1", "user_id": "finn"}).to_string())
        .await
        .unwrap();
    assert_eq!(conflict["ok"], false);
    assert_eq!(conflict["error"]["kind"], "conflict");

    ok(
        &intake,
        json!({"op": "complete_task", "task_id": "t-1", "user_id": "erin", "variables": {"boxes": 2}}),
    )
    .await;

    let report = reports.recv().await.unwrap();
    assert_eq!(report["report"], "task_run");
    assert_eq!(report["result"]["completed"], true);
    assert_eq!(report["result"]["result"]["variables"]["boxes"], 2);
}

#[tokio::test(start_paused = true)]
async fn approval_votes_through_intake() {
    let (intake, mut reports) = intake();
    ok(
        &intake,
        json!({
            "op": "request_approval",
            "request_id": "r-1",
            "requestor": "dana",
            "approvers": ["a", "b"],
            "deadline_secs": 60,
            "require_all": true
        }),
    )
    .await;
    let vote = ok(
        &intake,
        json!({"op": "vote", "request_id": "r-1", "approver": "a", "approved": false, "comments": "no budget"}),
    )
    .await;
    assert_eq!(vote["accepted"], true);

    let report = reports.recv().await.unwrap();
    assert_eq!(report["report"], "approval");
    assert_eq!(report["result"]["status"], "rejected");
    assert_eq!(report["result"]["comments"], "no budget");
}

#[tokio::test(start_paused = true)]
async fn timers_and_event_listing_through_intake() {
    let (intake, _reports) = intake();
    ok(
        &intake,
        json!({"op": "schedule_timer", "timer_id": "nudge", "process_instance_id": "pi-1", "delay_ms": 100}),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let events = ok(&intake, json!({"op": "events", "process_instance_id": "pi-1"})).await;
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], "timer");

    ok(&intake, json!({"op": "cancel_timer", "timer_id": "nudge"})).await;
}

#[tokio::test]
async fn malformed_lines_get_validation_errors() {
    let (intake, _reports) = intake();
    assert!(intake.handle_line("   ").await.is_none());

    for line in ["not json", r#"{"op":"launch"}"#, r#"{"op":"suspend"}"#] {
        let reply = intake.handle_line(line).await.unwrap();
        assert_eq!(reply["ok"], false, "{line}");
        assert_eq!(reply["error"]["kind"], "validation", "{line}");
    }

    let missing = intake
        .handle_line(r#"{"op":"suspend","process_instance_id":"pi-404"}"#)
        .await
        .unwrap();
    assert_eq!(missing["error"]["kind"], "not_found");
}
