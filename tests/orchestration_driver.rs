// End-to-end runs through the orchestration driver

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use workflow_orchestrator::cache::{CacheTtls, MokaCache};
use workflow_orchestrator::config::WorkflowOrchestratorConfig;
use workflow_orchestrator::events::{EventCoordinator, SignalEvent, EVENT_SIGNAL};
use workflow_orchestrator::lifecycle::{ProcessDefinition, StartProcessRequest, TaskInstance};
use workflow_orchestrator::orchestration::{
    Notification, NotificationKind, Notifier, NotifyError, OrchestrationDriver, ProcessRunInput,
    RunRegistry, RunStatus, SignalBridge, SignalHub, TaskRunInput, INITIATOR_VARIABLE,
    PROCESS_COMPLETE_SIGNAL, TASK_COMPLETE_SIGNAL,
};
use workflow_orchestrator::store::{InMemoryStore, Repositories, RunStatusRepository};
use workflow_orchestrator::{
    InstanceLifecycleService, ShutdownCoordinator, VariableMap, VariableValue,
};

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    fn kinds(&self) -> Vec<NotificationKind> {
        self.sent.lock().unwrap().iter().map(|n| n.kind).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

/// Takes a while to deliver, so a cancelled run is still busy after it wakes.
#[derive(Default)]
struct SlowNotifier {
    inner: RecordingNotifier,
}

#[async_trait]
impl Notifier for SlowNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.inner.notify(notification).await
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    events: EventCoordinator,
    driver: OrchestrationDriver,
    lifecycle: InstanceLifecycleService,
    notifier: Arc<RecordingNotifier>,
}

async fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let repos = Repositories::from_store(store.clone());
    repos
        .definitions
        .save_definition(&ProcessDefinition {
            id: 1,
            key: "order".to_string(),
            name: "Order fulfilment".to_string(),
            version: 1,
            suspended: false,
            tenant_id: None,
        })
        .await
        .unwrap();

    let cache = Arc::new(MokaCache::default());
    let events = EventCoordinator::new(repos.events.clone(), cache.clone(), CacheTtls::default());
    let signals = Arc::new(SignalHub::new(8));
    let runs = Arc::new(RunRegistry::new());
    events.register_listener(EVENT_SIGNAL, Arc::new(SignalBridge::new(signals.clone())));

    let mut config = WorkflowOrchestratorConfig::default().orchestration;
    config.retry.jitter = false;
    let notifier = Arc::new(RecordingNotifier::default());
    let driver = OrchestrationDriver::new(
        repos.runs.clone(),
        notifier.clone(),
        signals.clone(),
        runs.clone(),
        config,
    );
    let lifecycle = InstanceLifecycleService::new(repos, cache, CacheTtls::default())
        .with_events(events.clone())
        .with_signals(signals)
        .with_run_registry(runs);

    Harness {
        store,
        events,
        driver,
        lifecycle,
        notifier,
    }
}

fn run_input(instance_id: &str) -> ProcessRunInput {
    let mut variables = VariableMap::new();
    variables.insert(
        INITIATOR_VARIABLE.to_string(),
        VariableValue::String("dana".to_string()),
    );
    ProcessRunInput {
        process_definition_id: 1,
        process_instance_id: instance_id.to_string(),
        business_key: Some("order-99".to_string()),
        variables,
        initiator: None,
    }
}

#[tokio::test(start_paused = true)]
async fn process_run_completes_on_signal() {
    let h = harness().await;
    let instance = h
        .lifecycle
        .start_process_instance(StartProcessRequest {
            process_definition_id: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    let handle = h.driver.start_process(run_input(&instance.id)).unwrap();
    h.events
        .send_signal(SignalEvent {
            signal_name: PROCESS_COMPLETE_SIGNAL.to_string(),
            process_instance_id: Some(instance.id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.process_instance_id, instance.id);

    let record = h.store.get_run(&instance.id).await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(
        h.notifier.kinds(),
        vec![NotificationKind::ProcessStarted, NotificationKind::ProcessCompleted]
    );
    assert_eq!(h.notifier.sent.lock().unwrap()[0].recipient, "dana");
}

#[tokio::test(start_paused = true)]
async fn process_run_times_out_after_a_day() {
    let h = harness().await;
    let start = tokio::time::Instant::now();

    let result = h.driver.run_process(run_input("pi-1")).await.unwrap();

    assert_eq!(result.status, RunStatus::Timeout);
    assert!(start.elapsed() >= Duration::from_secs(24 * 3600));
    assert!(!h.driver.registry().is_running("pi-1"));
}

#[tokio::test(start_paused = true)]
async fn signal_after_deadline_does_not_complete_the_run() {
    let h = harness().await;
    let result = h.driver.run_process(run_input("pi-1")).await.unwrap();
    assert_eq!(result.status, RunStatus::Timeout);

    assert!(!h
        .driver
        .signals()
        .signal("pi-1", PROCESS_COMPLETE_SIGNAL, json!({}))
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn terminating_the_instance_cancels_its_run() {
    let h = harness().await;
    let instance = h
        .lifecycle
        .start_process_instance(StartProcessRequest {
            process_definition_key: Some("order".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    let handle = h.driver.start_process(run_input(&instance.id)).unwrap();
    tokio::task::yield_now().await;
    h.lifecycle
        .terminate_process_instance(&instance.id, "customer cancelled")
        .await
        .unwrap();

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn task_run_completes_when_the_task_is_completed() {
    let h = harness().await;
    h.lifecycle
        .create_task(TaskInstance::new("t-1", "pi-1", "pack"))
        .await
        .unwrap();

    let handle = h
        .driver
        .start_task(TaskRunInput {
            task_id: "t-1".to_string(),
            assignee: Some("erin".to_string()),
            variables: VariableMap::new(),
        })
        .unwrap();
    assert!(h.driver.signals().is_waiting("t-1", TASK_COMPLETE_SIGNAL));

    h.lifecycle.claim_task("t-1", "erin").await.unwrap();
    let mut output = VariableMap::new();
    output.insert("boxes".to_string(), VariableValue::Integer(2));
    h.lifecycle.complete_task("t-1", "erin", output).await.unwrap();

    let result = handle.await.unwrap().unwrap();
    assert!(result.completed);
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.result["completed_by"], "erin");
    assert_eq!(result.result["variables"]["boxes"], 2);
    assert!(h.notifier.kinds().contains(&NotificationKind::TaskAssigned));
    assert!(h.notifier.kinds().contains(&NotificationKind::TaskCompleted));
}

#[tokio::test(start_paused = true)]
async fn task_run_times_out_after_three_days() {
    let h = harness().await;
    let start = tokio::time::Instant::now();

    let result = h
        .driver
        .run_task(TaskRunInput {
            task_id: "t-9".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Timeout);
    assert!(!result.completed);
    assert!(start.elapsed() >= Duration::from_secs(72 * 3600));
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_cancelled_runs_to_finish() {
    let h = harness().await;
    let store = Arc::new(InMemoryStore::new());
    let notifier = Arc::new(SlowNotifier::default());
    let registry = Arc::new(RunRegistry::new());
    let driver = OrchestrationDriver::new(
        store.clone(),
        notifier.clone(),
        Arc::new(SignalHub::new(8)),
        registry.clone(),
        WorkflowOrchestratorConfig::default().orchestration,
    );

    let handle = driver.start_process(run_input("pi-1")).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(notifier.inner.kinds(), vec![NotificationKind::ProcessStarted]);

    ShutdownCoordinator::new(registry.clone(), h.events.clone())
        .shutdown_all_services()
        .await
        .unwrap();

    let record = store.get_run("pi-1").await.unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);
    assert_eq!(
        notifier.inner.kinds(),
        vec![NotificationKind::ProcessStarted, NotificationKind::ProcessCompleted]
    );
    assert_eq!(registry.live_count(), 0);
    assert_eq!(handle.await.unwrap().unwrap().status, RunStatus::Cancelled);
}
