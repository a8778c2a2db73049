use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::notifier::{Notification, NotificationKind, Notifier};
use super::retry::retry_transient;
use super::signals::SignalHub;
use super::types::*;
use super::wait::{wait_point, LiveRun, RunRegistry, WaitOutcome};
use crate::config::RetryConfig;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::observability::orchestration_metrics;
use crate::store::{RunKind, RunRecord, RunStatusRepository};
use crate::telemetry::{create_orchestration_span, generate_correlation_id, worker_identity};

/// Votes collected so far for one request.
#[derive(Debug, Default)]
struct Tally {
    votes: BTreeMap<String, bool>,
    comments: Vec<String>,
}

impl Tally {
    fn record(&mut self, vote: ApprovalVote) {
        if !vote.comments.is_empty() {
            self.comments.push(vote.comments);
        }
        self.votes.insert(vote.approver, vote.approved);
    }

    fn approved(&self, approvers: &[String], require_all: bool) -> bool {
        if require_all {
            approvers
                .iter()
                .all(|approver| self.votes.get(approver) == Some(&true))
        } else {
            self.votes.values().any(|approved| *approved)
        }
    }

    /// Whether further votes can no longer change the outcome.
    fn is_decided(&self, approvers: &[String], require_all: bool) -> bool {
        if self.votes.len() == approvers.len() {
            return true;
        }
        if require_all {
            self.votes.values().any(|approved| !approved)
        } else {
            self.votes.values().any(|approved| *approved)
        }
    }
}

/// Bounded-time multi-party vote over a shared `approval` channel.
#[derive(Clone)]
pub struct ApprovalAggregator {
    notifier: Arc<dyn Notifier>,
    signals: Arc<SignalHub>,
    registry: Arc<RunRegistry>,
    runs: Option<(Arc<dyn RunStatusRepository>, RetryConfig)>,
}

impl ApprovalAggregator {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        signals: Arc<SignalHub>,
        registry: Arc<RunRegistry>,
    ) -> Self {
        Self {
            notifier,
            signals,
            registry,
            runs: None,
        }
    }

    /// Record approval runs in `runs` alongside process and task runs.
    pub fn with_run_store(mut self, runs: Arc<dyn RunStatusRepository>, retry: RetryConfig) -> Self {
        self.runs = Some((runs, retry));
        self
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        self.registry.cancel(request_id)
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.signals.is_waiting(request_id, APPROVAL_SIGNAL)
    }

    /// Deliver a vote to a pending request. Returns false if nobody is waiting.
    pub fn submit_vote(&self, request_id: &str, vote: ApprovalVote) -> OrchestrationResult<bool> {
        if vote.approver.is_empty() {
            return Err(OrchestrationError::validation("approver is required"));
        }
        let payload = serde_json::to_value(&vote)
            .map_err(|e| OrchestrationError::validation(format!("unencodable vote: {}", e)))?;
        self.signals.signal(request_id, APPROVAL_SIGNAL, payload)
    }

    /// Validate and register the request, then run the vote on its own task.
    pub fn start_approval(
        &self,
        request: ApprovalRequest,
    ) -> OrchestrationResult<JoinHandle<ApprovalWorkflowResult>> {
        if request.request_id.is_empty() {
            return Err(OrchestrationError::validation("request id is required"));
        }
        if request.approvers.iter().all(|a| a.is_empty()) {
            return Err(OrchestrationError::validation(
                "at least one approver is required",
            ));
        }
        if request.deadline.is_zero() {
            return Err(OrchestrationError::validation("deadline must be positive"));
        }

        let (cancel, live) = self.registry.register(&request.request_id)?;
        let votes = match self.signals.register(&request.request_id, APPROVAL_SIGNAL) {
            Ok(rx) => rx,
            Err(e) => {
                self.registry.unregister(&request.request_id);
                return Err(e);
            }
        };

        let aggregator = self.clone();
        let span = create_orchestration_span(
            "approval",
            Some(&request.request_id),
            None,
            Some(&generate_correlation_id()),
        );
        Ok(tokio::spawn(
            async move { aggregator.aggregate(request, votes, cancel, live).await }.instrument(span),
        ))
    }

    pub async fn run_approval(
        &self,
        request: ApprovalRequest,
    ) -> OrchestrationResult<ApprovalWorkflowResult> {
        self.start_approval(request)?
            .await
            .map_err(|e| OrchestrationError::Transient(format!("approval run aborted: {}", e)))
    }

    async fn aggregate(
        &self,
        request: ApprovalRequest,
        mut votes: mpsc::Receiver<serde_json::Value>,
        mut cancel: watch::Receiver<bool>,
        _live: LiveRun,
    ) -> ApprovalWorkflowResult {
        let request_id = request.request_id.clone();
        let mut approvers: Vec<String> = Vec::with_capacity(request.approvers.len());
        for approver in &request.approvers {
            if !approver.is_empty() && !approvers.contains(approver) {
                approvers.push(approver.clone());
            }
        }

        orchestration_metrics().record_run_started();
        self.record(&request_id, RunStatus::Running, None).await;
        self.notify_approvers(&request, &approvers);

        let deadline = tokio::time::Instant::now() + request.deadline;
        let mut tally = Tally::default();

        let status = loop {
            match wait_point(&mut votes, deadline, &mut cancel).await {
                WaitOutcome::Signalled(payload) => {
                    let vote: ApprovalVote = match serde_json::from_value(payload) {
                        Ok(vote) => vote,
                        Err(e) => {
                            warn!(request_id = %request_id, error = %e, "Ignoring malformed vote");
                            continue;
                        }
                    };
                    if !approvers.contains(&vote.approver) {
                        warn!(
                            request_id = %request_id,
                            approver = %vote.approver,
                            "Ignoring vote from non-approver"
                        );
                        continue;
                    }

                    debug!(request_id = %request_id, approver = %vote.approver, approved = vote.approved, "Vote received");
                    tally.record(vote);
                    if tally.is_decided(&approvers, request.require_all) {
                        break if tally.approved(&approvers, request.require_all) {
                            ApprovalStatus::Approved
                        } else {
                            ApprovalStatus::Rejected
                        };
                    }
                }
                WaitOutcome::DeadlineElapsed => {
                    orchestration_metrics().record_run_timeout();
                    break ApprovalStatus::Timeout;
                }
                WaitOutcome::Cancelled => break ApprovalStatus::Cancelled,
            }
        };

        self.signals.unregister(&request_id, APPROVAL_SIGNAL);
        self.registry.unregister(&request_id);
        drop(votes);

        let approved = status == ApprovalStatus::Approved;
        let result = ApprovalWorkflowResult {
            request_id: request_id.clone(),
            status,
            approved,
            comments: tally.comments.join("; "),
            votes: tally.votes,
            end_time: Utc::now(),
        };

        let run_status = match status {
            ApprovalStatus::Approved | ApprovalStatus::Rejected => RunStatus::Completed,
            ApprovalStatus::Timeout => RunStatus::Timeout,
            ApprovalStatus::Cancelled => RunStatus::Cancelled,
        };
        self.record(&request_id, run_status, serde_json::to_value(&result).ok())
            .await;

        let mut payload = serde_json::Map::new();
        payload.insert("status".to_string(), json!(status));
        payload.insert("approved".to_string(), json!(approved));
        payload.insert("comments".to_string(), json!(result.comments));
        if let Err(e) = self
            .notifier
            .notify(Notification {
                kind: NotificationKind::ApprovalCompleted,
                recipient: request.requestor.clone(),
                subject_id: request_id.clone(),
                payload,
            })
            .await
        {
            orchestration_metrics().record_notification_failure();
            warn!(request_id = %request_id, error = %e, "Approval completion notification failed");
        }

        orchestration_metrics().record_approval_completed();
        info!(
            request_id = %request_id,
            status = ?status,
            votes = result.votes.len(),
            "Approval finished"
        );
        result
    }

    fn notify_approvers(&self, request: &ApprovalRequest, approvers: &[String]) {
        for approver in approvers {
            let notifier = self.notifier.clone();
            let mut payload = serde_json::Map::new();
            payload.insert("requestor".to_string(), json!(request.requestor));
            payload.insert("content".to_string(), request.content.clone());
            payload.insert(
                "deadline_seconds".to_string(),
                json!(request.deadline.as_secs_f64()),
            );
            payload.insert("require_all".to_string(), json!(request.require_all));
            let notification = Notification {
                kind: NotificationKind::ApprovalRequest,
                recipient: approver.clone(),
                subject_id: request.request_id.clone(),
                payload,
            };

            tokio::spawn(async move {
                let recipient = notification.recipient.clone();
                if let Err(e) = notifier.notify(notification).await {
                    orchestration_metrics().record_notification_failure();
                    warn!(approver = %recipient, error = %e, "Approval request notification failed");
                }
            });
        }
    }

    async fn record(&self, request_id: &str, status: RunStatus, detail: Option<serde_json::Value>) {
        let Some((runs, retry)) = &self.runs else {
            return;
        };
        let record = RunRecord {
            run_id: request_id.to_string(),
            kind: RunKind::Approval,
            status,
            worker: worker_identity(),
            updated_at: Utc::now(),
            detail,
        };
        let outcome = retry_transient(retry, "record_approval_status", || async {
            runs.record_run(&record).await.map_err(OrchestrationError::from)
        })
        .await;
        if let Err(e) = outcome {
            warn!(request_id = %request_id, status = %status, error = %e, "Failed to record approval status");
        }
    }
}
