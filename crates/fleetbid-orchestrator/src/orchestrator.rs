//! The orchestrator state object and message dispatcher.
//!
//! Registry, round table and ledger live in one [`OrchestratorState`]
//! behind a single `RwLock`. Every mutation (a decoded message from any
//! connection, a deadline firing, a connection closing) takes the write
//! lock, so recording a bid and evaluating its round never interleave.
//!
//! Messages that name a device are only applied when they arrive on the
//! connection that device registered on. Assigned tasks stay tracked until
//! the winner's result arrives or the result timeout expires.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use fleetbid_auction::{BidCoordinator, RoundOutcome, RoundSnapshot};
use fleetbid_network::{ConnectionHandle, ConnectionId, ConnectionRegistry, DeviceSnapshot};
use fleetbid_protocol::{
    BidParams, DeviceId, InboundMessage, ResultParams, TaskId, TaskSourceParams, DEFAULT_RESULT_SCORE,
};
use fleetbid_state::{ScoreEntry, ScoringLedger};

use crate::config::OrchestratorConfig;

/// Finished rounds kept for the status API.
const OUTCOME_HISTORY_LEN: usize = 100;

/// What became of an assigned task's result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResultState {
    /// The round was aborted, so no result is coming.
    NotExpected,
    Pending { due_at: DateTime<Utc> },
    Completed {
        received_at: DateTime<Utc>,
        confidence: Option<f64>,
    },
    TimedOut { expired_at: DateTime<Utc> },
}

/// A finished round and when it finished.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeRecord {
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: RoundOutcome,
    pub result: ResultState,
}

/// Everything the orchestrator knows, guarded by one lock.
#[derive(Debug)]
pub struct OrchestratorState {
    pub registry: ConnectionRegistry,
    pub coordinator: BidCoordinator,
    pub ledger: ScoringLedger,
    /// Most recent first.
    pub outcomes: VecDeque<OutcomeRecord>,
    /// Assigned tasks still waiting on their winner's result.
    pub awaiting_results: HashMap<TaskId, DeviceId>,
    pub result_timeout: Duration,
    pub started_at: DateTime<Utc>,
}

impl OrchestratorState {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            coordinator: BidCoordinator::new(config.bid_config()),
            ledger: ScoringLedger::new(config.ledger.history_len),
            outcomes: VecDeque::with_capacity(OUTCOME_HISTORY_LEN),
            awaiting_results: HashMap::new(),
            result_timeout: Duration::from_millis(config.bidding.result_timeout_ms),
            started_at: Utc::now(),
        }
    }

    /// Devices that should be asked to bid for `capability`.
    pub fn eligible_devices(&self, capability: &str) -> Vec<DeviceId> {
        let skip_overloaded = self.coordinator.config().skip_overloaded;
        self.registry
            .list_by_capability(capability)
            .into_iter()
            .filter(|id| {
                !skip_overloaded
                    || self
                        .registry
                        .get(id)
                        .is_some_and(|entry| !entry.metrics.is_overloaded())
            })
            .collect()
    }

    /// Record a finished round. An assigned task starts waiting for its result.
    fn push_outcome(&mut self, outcome: RoundOutcome) {
        let now = Utc::now();
        let result = match outcome.winner() {
            Some(winner) => {
                self.awaiting_results
                    .insert(outcome.task_id().clone(), winner.clone());
                let due_at = chrono::Duration::from_std(self.result_timeout)
                    .ok()
                    .and_then(|timeout| now.checked_add_signed(timeout))
                    .unwrap_or(now);
                ResultState::Pending { due_at }
            }
            None => ResultState::NotExpected,
        };

        if self.outcomes.len() == OUTCOME_HISTORY_LEN {
            self.outcomes.pop_back();
        }
        self.outcomes.push_front(OutcomeRecord {
            finished_at: now,
            outcome,
            result,
        });
    }

    fn set_result_state(&mut self, task_id: &TaskId, result: ResultState) {
        if let Some(record) = self
            .outcomes
            .iter_mut()
            .find(|r| r.outcome.task_id() == task_id)
        {
            record.result = result;
        }
    }

    /// The device `task_id` was assigned to, while it is still remembered.
    fn assignee(&self, task_id: &TaskId) -> Option<&DeviceId> {
        self.awaiting_results.get(task_id).or_else(|| {
            self.outcomes
                .iter()
                .find(|r| r.outcome.task_id() == task_id)
                .and_then(|r| r.outcome.winner())
        })
    }

    /// Whether `device_id` is the device registered on `connection`. Logs and
    /// returns false otherwise.
    fn sent_by_owner(&self, connection: &ConnectionHandle, device_id: &DeviceId, kind: &'static str) -> bool {
        let owner = self.registry.device_on(connection.id());
        if owner == Some(device_id) {
            return true;
        }
        tracing::warn!(
            kind,
            device_id = %device_id,
            connection = connection.id(),
            registered_as = ?owner.map(DeviceId::as_str),
            "message from a connection not registered as its sender, discarded"
        );
        false
    }
}

/// Cloneable handle to the shared orchestrator state.
#[derive(Clone)]
pub struct Orchestrator {
    state: Arc<RwLock<OrchestratorState>>,
    next_connection: Arc<AtomicU64>,
}

impl Orchestrator {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(OrchestratorState::new(config))),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn shared_state(&self) -> Arc<RwLock<OrchestratorState>> {
        Arc::clone(&self.state)
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Apply one decoded message received on `connection`.
    pub async fn handle_message(&self, connection: &ConnectionHandle, message: InboundMessage) {
        match message {
            InboundMessage::Register(params) => {
                let mut state = self.state.write().await;
                let device_id = params.device_id.clone();
                let capabilities = params.capabilities.join(",");
                let has_npu = params.has_npu;
                let registration = state.registry.register(connection.clone(), params);
                tracing::info!(
                    device_id = %device_id,
                    connection = connection.id(),
                    peer = %connection.peer(),
                    capabilities = %capabilities,
                    has_npu,
                    generation = registration.generation,
                    "device registered"
                );
                if let Some(previous) = registration.renamed_from {
                    tracing::info!(connection = connection.id(), previous = %previous, "connection re-registered under a new device id");
                }
            }
            InboundMessage::Status(params) => {
                let mut state = self.state.write().await;
                if !state.sent_by_owner(connection, &params.device_id, "status") {
                    return;
                }
                if state.registry.update_metrics(&params.device_id, params.metrics) {
                    tracing::debug!(device_id = %params.device_id, "status updated");
                }
            }
            InboundMessage::Heartbeat(params) => {
                let mut state = self.state.write().await;
                if !state.sent_by_owner(connection, &params.device_id, "heartbeat") {
                    return;
                }
                if state.registry.touch(&params.device_id) {
                    tracing::debug!(device_id = %params.device_id, "heartbeat");
                }
            }
            InboundMessage::TaskSource(params) => self.open_round(params).await,
            InboundMessage::Bid(params) => self.record_bid(connection, params).await,
            InboundMessage::Result(params) => self.record_result(connection, params).await,
        }
    }

    async fn open_round(&self, params: TaskSourceParams) {
        let source = params.source.clone();
        let opened = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let capability = state.coordinator.capability_for(&params);
            let eligible = state.eligible_devices(&capability);
            state.coordinator.open_round(&state.registry, params, &eligible)
        };

        match opened {
            Ok(round) => self.arm_deadline(round.task_id, round.deadline),
            Err(e) => tracing::warn!(source = %source, error = %e, "task dropped"),
        }
    }

    async fn record_bid(&self, connection: &ConnectionHandle, params: BidParams) {
        let mut state = self.state.write().await;
        if !state.sent_by_owner(connection, &params.device_id, "bid") {
            return;
        }

        let task_id = params.task_id.clone();
        let device_id = params.device_id.clone();
        if let Err(e) = state.coordinator.record_bid(params) {
            tracing::warn!(task_id = %task_id, device_id = %device_id, error = %e, "bid discarded");
        }
    }

    async fn record_result(&self, connection: &ConnectionHandle, params: ResultParams) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if !state.sent_by_owner(connection, &params.device_id, "result") {
            return;
        }

        if let Some(task_id) = &params.task_id {
            if let Some(assignee) = state.assignee(task_id).filter(|a| *a != &params.device_id) {
                tracing::warn!(
                    task_id = %task_id,
                    device_id = %params.device_id,
                    assigned_to = %assignee,
                    "result from a device the task was not assigned to, discarded"
                );
                return;
            }
            if state.awaiting_results.remove(task_id).is_some() {
                state.set_result_state(
                    task_id,
                    ResultState::Completed {
                        received_at: Utc::now(),
                        confidence: params.confidence,
                    },
                );
            } else {
                tracing::debug!(task_id = %task_id, device_id = %params.device_id, "result for a task not awaiting one");
            }
        }

        let utilization = state
            .registry
            .get(&params.device_id)
            .and_then(|entry| entry.metrics.cpu_load)
            .unwrap_or(DEFAULT_RESULT_SCORE);
        let confidence = params.confidence.unwrap_or(DEFAULT_RESULT_SCORE);
        let entry = state
            .ledger
            .record(&params.subtask, &params.device_id, utilization, confidence);

        tracing::info!(
            device_id = %params.device_id,
            task_id = %params.task_id.as_ref().map(TaskId::as_str).unwrap_or_default(),
            task_type = %params.subtask,
            confidence,
            score = entry.score,
            "result received"
        );
    }

    /// Evaluate `task_id` once `deadline` has passed.
    fn arm_deadline(&self, task_id: TaskId, deadline: Duration) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            orchestrator.evaluate(&task_id).await;
        });
    }

    /// Close a round and assign its task. Returns `None` when the round was
    /// already evaluated.
    pub async fn evaluate(&self, task_id: &TaskId) -> Option<RoundOutcome> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let outcome = state.coordinator.evaluate(&state.registry, task_id)?;
        state.push_outcome(outcome.clone());
        if outcome.winner().is_some() {
            self.arm_result_timeout(task_id.clone(), state.result_timeout);
        }
        Some(outcome)
    }

    fn arm_result_timeout(&self, task_id: TaskId, timeout: Duration) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            orchestrator.expire_result(&task_id).await;
        });
    }

    /// Stop waiting for `task_id`'s result. Returns false when it already
    /// arrived, or the task was never assigned.
    pub async fn expire_result(&self, task_id: &TaskId) -> bool {
        let mut state = self.state.write().await;
        let Some(winner) = state.awaiting_results.remove(task_id) else {
            return false;
        };
        state.set_result_state(task_id, ResultState::TimedOut { expired_at: Utc::now() });
        tracing::warn!(
            task_id = %task_id,
            device_id = %winner,
            timeout_ms = state.result_timeout.as_millis() as u64,
            "no result before the result timeout"
        );
        true
    }

    /// Forget whatever device `connection` registered. Runs once per
    /// connection, however its handler exits.
    pub async fn connection_closed(&self, connection: ConnectionId) {
        let mut state = self.state.write().await;
        match state.registry.remove(connection) {
            Some(device_id) => tracing::info!(device_id = %device_id, connection, "device removed"),
            None => tracing::debug!(connection, "connection closed with no registered device"),
        }
    }

    // -- read-only views ----------------------------------------------------

    pub async fn devices(&self) -> Vec<DeviceSnapshot> {
        self.state.read().await.registry.snapshot()
    }

    pub async fn rounds(&self) -> Vec<RoundSnapshot> {
        self.state.read().await.coordinator.snapshot()
    }

    pub async fn scores(&self) -> Vec<ScoreEntry> {
        self.state.read().await.ledger.scores()
    }

    pub async fn outcomes(&self) -> Vec<OutcomeRecord> {
        self.state.read().await.outcomes.iter().cloned().collect()
    }

    pub async fn list_by_capability(&self, capability: &str) -> Vec<DeviceId> {
        self.state.read().await.registry.list_by_capability(capability)
    }
}
