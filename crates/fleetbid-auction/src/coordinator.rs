//! Bid Coordinator: the table of in-flight rounds and the steps that move
//! them forward.
//!
//! 1. **Open**: a task source arrives; eligible devices receive a
//!    `bid_request` and a round is stored in the `Open` phase.
//! 2. **Collect**: bids from invited devices are recorded until the
//!    deadline fires.
//! 3. **Evaluate**: the round is taken out of the table, frozen, ranked and
//!    the task is delivered to the winner.
//!
//! Evaluation removes the round before doing anything else, so a round is
//! evaluated at most once and a bid that arrives afterwards finds nothing to
//! attach to. The coordinator never touches a socket: every message leaves
//! through a [`BidTransport`].

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use fleetbid_network::BidTransport;
use fleetbid_protocol::{
    Bid, BidParams, DeviceId, TaskId, TaskSourceParams, WireMessage, DEFAULT_BID_DEADLINE_MS,
    DEFAULT_CAPABILITY,
};

use crate::round::{BiddingRound, RoundPhase, RoundSnapshot};
use crate::selection::{NpuFirstLowestLoad, SelectionPolicy};
use crate::AuctionError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Knobs for the bidding lifecycle.
#[derive(Debug, Clone)]
pub struct BidConfig {
    /// How long a round collects bids.
    pub deadline: Duration,
    /// Capability assumed when a task source names none.
    pub default_capability: String,
    /// Exclude devices whose last status reports overload from fan-out.
    pub skip_overloaded: bool,
    /// Fall back to the next-ranked bidder when the winner cannot be reached.
    pub reassign_on_send_failure: bool,
    /// Tell the task source when its task could not be placed.
    pub notify_source_on_failure: bool,
}

impl Default for BidConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_millis(DEFAULT_BID_DEADLINE_MS),
            default_capability: DEFAULT_CAPABILITY.to_string(),
            skip_overloaded: false,
            reassign_on_send_failure: false,
            notify_source_on_failure: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A freshly opened round; the caller arms a timer for `deadline`.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedRound {
    pub task_id: TaskId,
    pub capability: String,
    pub deadline: Duration,
    pub invited: Vec<DeviceId>,
}

/// Why a round ended without an assignment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "device_id")]
pub enum AbortReason {
    /// The deadline passed with no bids.
    NoBids,
    /// The selected winner could not be reached.
    WinnerUnreachable(DeviceId),
    /// Every bidder was tried and none could be reached.
    AllBiddersUnreachable,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoBids => "no_bids",
            Self::WinnerUnreachable(_) => "winner_unreachable",
            Self::AllBiddersUnreachable => "all_bidders_unreachable",
        }
    }
}

/// Terminal result of one round.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RoundOutcome {
    Assigned {
        task_id: TaskId,
        capability: String,
        origin: DeviceId,
        winner: DeviceId,
        bid: Bid,
        bid_count: usize,
        /// Higher-ranked bidders skipped because delivery failed.
        skipped: Vec<DeviceId>,
    },
    Aborted {
        task_id: TaskId,
        capability: String,
        origin: DeviceId,
        bid_count: usize,
        reason: AbortReason,
    },
}

impl RoundOutcome {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Assigned { task_id, .. } | Self::Aborted { task_id, .. } => task_id,
        }
    }

    pub fn winner(&self) -> Option<&DeviceId> {
        match self {
            Self::Assigned { winner, .. } => Some(winner),
            Self::Aborted { .. } => None,
        }
    }

    pub fn phase(&self) -> RoundPhase {
        match self {
            Self::Assigned { .. } => RoundPhase::Assigned,
            Self::Aborted { .. } => RoundPhase::Aborted,
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Owns every open round. Callers serialise access (the orchestrator holds
/// it behind its state lock).
pub struct BidCoordinator {
    config: BidConfig,
    policy: Box<dyn SelectionPolicy>,
    rounds: HashMap<TaskId, BiddingRound>,
}

impl std::fmt::Debug for BidCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BidCoordinator")
            .field("config", &self.config)
            .field("open_rounds", &self.rounds.len())
            .finish()
    }
}

impl BidCoordinator {
    pub fn new(config: BidConfig) -> Self {
        Self::with_policy(config, Box::new(NpuFirstLowestLoad))
    }

    pub fn with_policy(config: BidConfig, policy: Box<dyn SelectionPolicy>) -> Self {
        Self {
            config,
            policy,
            rounds: HashMap::new(),
        }
    }

    pub fn config(&self) -> &BidConfig {
        &self.config
    }

    /// Capability a task source asks for, falling back to the default.
    pub fn capability_for(&self, source: &TaskSourceParams) -> String {
        source
            .capability
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.config.default_capability)
            .to_string()
    }

    /// Open a round for `source`, soliciting bids from `eligible`.
    ///
    /// When nobody is eligible, or no bid request could be delivered, no
    /// round is created and the source is told (if configured).
    pub fn open_round<T: BidTransport + ?Sized>(
        &mut self,
        transport: &T,
        source: TaskSourceParams,
        eligible: &[DeviceId],
    ) -> Result<OpenedRound, AuctionError> {
        let capability = self.capability_for(&source);

        if eligible.is_empty() {
            tracing::warn!(
                source = %source.source,
                capability = %capability,
                "no eligible devices for task, not opening a round"
            );
            self.notify_source(transport, &source.source, None, &capability, "no_eligible_devices");
            return Err(AuctionError::NoEligibleDevices(capability));
        }

        let task_id = self.fresh_task_id();
        let deadline_ms = self.config.deadline.as_millis() as u64;
        let request = WireMessage::bid_request(&task_id, &capability, deadline_ms);
        let report = transport.broadcast(eligible, &request);

        if report.delivered.is_empty() {
            tracing::warn!(
                task_id = %task_id,
                capability = %capability,
                failed = report.failed.len(),
                "no bid request could be delivered, not opening a round"
            );
            self.notify_source(transport, &source.source, Some(&task_id), &capability, "no_eligible_devices");
            return Err(AuctionError::NoEligibleDevices(capability));
        }

        let invited = report.delivered;
        let round = BiddingRound::new(
            task_id.clone(),
            capability.clone(),
            source.source,
            source.payload,
            self.config.deadline,
            invited.iter().cloned(),
        );
        self.rounds.insert(task_id.clone(), round);

        tracing::info!(
            task_id = %task_id,
            capability = %capability,
            invited = invited.len(),
            deadline_ms,
            "bidding round opened"
        );

        Ok(OpenedRound {
            task_id,
            capability,
            deadline: self.config.deadline,
            invited,
        })
    }

    /// Record a bid. Bids for unknown or closed rounds are rejected.
    pub fn record_bid(&mut self, params: BidParams) -> Result<(), AuctionError> {
        let round = self
            .rounds
            .get_mut(&params.task_id)
            .ok_or_else(|| AuctionError::UnknownRound(params.task_id.clone()))?;

        let replaced = round.record_bid(params.device_id.clone(), params.bid)?;
        tracing::debug!(
            task_id = %params.task_id,
            device_id = %params.device_id,
            replaced,
            bids = round.bid_count(),
            "bid recorded"
        );
        Ok(())
    }

    /// Close the round and assign its task.
    ///
    /// Returns `None` if the round is unknown, which is what a second
    /// evaluation of the same round observes.
    pub fn evaluate<T: BidTransport + ?Sized>(&mut self, transport: &T, task_id: &TaskId) -> Option<RoundOutcome> {
        let mut round = self.rounds.remove(task_id)?;
        if let Err(e) = round.close() {
            tracing::error!(task_id = %task_id, error = %e, "round was not open at evaluation");
            return None;
        }

        let bid_count = round.bid_count();
        let ranked = self.policy.rank(&round);

        if ranked.is_empty() {
            round.finish(RoundPhase::Aborted);
            tracing::warn!(task_id = %task_id, capability = %round.capability(), "no bids received, round aborted");
            return Some(self.abort(transport, round, AbortReason::NoBids));
        }

        let mut skipped = Vec::new();
        for candidate in ranked {
            let Some(bid) = round.bids().get(&candidate).cloned() else {
                continue;
            };
            let message = WireMessage::task_assignment(
                round.task_id(),
                round.capability(),
                round.payload(),
                bid.has_npu,
                round.origin(),
            );

            match transport.send(&candidate, &message) {
                Ok(()) => {
                    round.finish(RoundPhase::Assigned);
                    tracing::info!(
                        task_id = %task_id,
                        winner = %candidate,
                        cpu_load = bid.cpu_load,
                        has_npu = bid.has_npu,
                        bids = bid_count,
                        "task assigned"
                    );
                    return Some(RoundOutcome::Assigned {
                        task_id: task_id.clone(),
                        capability: round.capability().to_string(),
                        origin: round.origin().clone(),
                        winner: candidate,
                        bid,
                        bid_count,
                        skipped,
                    });
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, device_id = %candidate, error = %e, "failed to deliver task to winner");
                    if !self.config.reassign_on_send_failure {
                        round.finish(RoundPhase::Aborted);
                        return Some(self.abort(transport, round, AbortReason::WinnerUnreachable(candidate)));
                    }
                    skipped.push(candidate);
                }
            }
        }

        round.finish(RoundPhase::Aborted);
        tracing::warn!(task_id = %task_id, tried = skipped.len(), "no bidder reachable, round aborted");
        Some(self.abort(transport, round, AbortReason::AllBiddersUnreachable))
    }

    pub fn is_open(&self, task_id: &TaskId) -> bool {
        self.rounds.contains_key(task_id)
    }

    pub fn round(&self, task_id: &TaskId) -> Option<&BiddingRound> {
        self.rounds.get(task_id)
    }

    pub fn open_rounds(&self) -> usize {
        self.rounds.len()
    }

    /// Open rounds, oldest first.
    pub fn snapshot(&self) -> Vec<RoundSnapshot> {
        let mut rounds: Vec<RoundSnapshot> = self.rounds.values().map(BiddingRound::snapshot).collect();
        rounds.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.task_id.cmp(&b.task_id)));
        rounds
    }

    fn fresh_task_id(&self) -> TaskId {
        loop {
            let id = TaskId::generate();
            if !self.rounds.contains_key(&id) {
                return id;
            }
        }
    }

    fn abort<T: BidTransport + ?Sized>(&self, transport: &T, round: BiddingRound, reason: AbortReason) -> RoundOutcome {
        self.notify_source(
            transport,
            round.origin(),
            Some(round.task_id()),
            round.capability(),
            reason.as_str(),
        );
        RoundOutcome::Aborted {
            task_id: round.task_id().clone(),
            capability: round.capability().to_string(),
            origin: round.origin().clone(),
            bid_count: round.bid_count(),
            reason,
        }
    }

    fn notify_source<T: BidTransport + ?Sized>(
        &self,
        transport: &T,
        source: &DeviceId,
        task_id: Option<&TaskId>,
        capability: &str,
        reason: &str,
    ) {
        if !self.config.notify_source_on_failure {
            return;
        }
        let notice = WireMessage::task_failed(task_id, capability, reason);
        if let Err(e) = transport.send(source, &notice) {
            tracing::debug!(source = %source, error = %e, "could not notify task source");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use fleetbid_network::NetworkError;
    use fleetbid_protocol::MessageKind;

    use super::*;

    /// Records every send; devices in `unreachable` fail.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(DeviceId, WireMessage)>>,
        unreachable: HashSet<DeviceId>,
    }

    impl RecordingTransport {
        fn unreachable(ids: &[&str]) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                unreachable: ids.iter().map(|id| DeviceId::from(*id)).collect(),
            }
        }

        fn sent_of(&self, kind: MessageKind) -> Vec<(DeviceId, WireMessage)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, m)| m.message_kind() == Some(kind))
                .cloned()
                .collect()
        }
    }

    impl BidTransport for RecordingTransport {
        fn send(&self, device: &DeviceId, message: &WireMessage) -> Result<(), NetworkError> {
            if self.unreachable.contains(device) {
                return Err(NetworkError::ConnectionClosed(device.clone()));
            }
            self.sent.lock().unwrap().push((device.clone(), message.clone()));
            Ok(())
        }

        fn is_reachable(&self, device: &DeviceId) -> bool {
            !self.unreachable.contains(device)
        }
    }

    fn source() -> TaskSourceParams {
        TaskSourceParams {
            source: DeviceId::from("src"),
            payload: serde_json::json!({ "image_base64": "AAEC" }),
            capability: None,
        }
    }

    fn ids(list: &[&str]) -> Vec<DeviceId> {
        list.iter().map(|id| DeviceId::from(*id)).collect()
    }

    fn bid(task_id: &TaskId, device: &str, cpu: f64, npu: bool) -> BidParams {
        BidParams {
            task_id: task_id.clone(),
            device_id: DeviceId::from(device),
            bid: Bid::new(cpu, 70.0, npu),
        }
    }

    #[test]
    fn open_round_fans_out_bid_requests() {
        let transport = RecordingTransport::default();
        let mut coordinator = BidCoordinator::new(BidConfig::default());

        let opened = coordinator.open_round(&transport, source(), &ids(&["A", "B"])).unwrap();
        assert_eq!(opened.capability, "classify");
        assert_eq!(opened.invited, ids(&["A", "B"]));
        assert!(coordinator.is_open(&opened.task_id));

        let requests = transport.sent_of(MessageKind::BidRequest);
        assert_eq!(requests.len(), 2);
        let (_, msg) = &requests[0];
        assert_eq!(msg.task_id, opened.task_id.as_str());
        assert_eq!(msg.data["task_type"], "classify");
        assert_eq!(msg.data["deadline_ms"], 5000);
    }

    #[test]
    fn no_eligible_devices_opens_nothing_and_notifies_source() {
        let transport = RecordingTransport::default();
        let mut coordinator = BidCoordinator::new(BidConfig::default());

        let err = coordinator.open_round(&transport, source(), &[]).unwrap_err();
        assert!(matches!(err, AuctionError::NoEligibleDevices(ref c) if c == "classify"));
        assert_eq!(coordinator.open_rounds(), 0);

        let failures = transport.sent_of(MessageKind::TaskFailed);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, DeviceId::from("src"));
        assert_eq!(failures[0].1.data["reason"], "no_eligible_devices");
    }

    #[test]
    fn unreachable_devices_are_not_invited() {
        let transport = RecordingTransport::unreachable(&["B"]);
        let mut coordinator = BidCoordinator::new(BidConfig::default());

        let opened = coordinator.open_round(&transport, source(), &ids(&["A", "B"])).unwrap();
        assert_eq!(opened.invited, ids(&["A"]));

        let err = coordinator.record_bid(bid(&opened.task_id, "B", 0.1, true)).unwrap_err();
        assert!(matches!(err, AuctionError::NotInvited { .. }));
    }

    #[test]
    fn npu_bidder_wins_and_receives_task() {
        let transport = RecordingTransport::default();
        let mut coordinator = BidCoordinator::new(BidConfig::default());
        let opened = coordinator.open_round(&transport, source(), &ids(&["A", "B", "C"])).unwrap();

        coordinator.record_bid(bid(&opened.task_id, "A", 0.9, false)).unwrap();
        coordinator.record_bid(bid(&opened.task_id, "B", 0.3, true)).unwrap();
        coordinator.record_bid(bid(&opened.task_id, "C", 0.1, false)).unwrap();

        let outcome = coordinator.evaluate(&transport, &opened.task_id).unwrap();
        assert_eq!(outcome.winner(), Some(&DeviceId::from("B")));
        assert_eq!(outcome.phase(), RoundPhase::Assigned);

        let tasks = transport.sent_of(MessageKind::Task);
        assert_eq!(tasks.len(), 1);
        let (to, msg) = &tasks[0];
        assert_eq!(to, &DeviceId::from("B"));
        assert_eq!(msg.task_id, opened.task_id.as_str());
        assert_eq!(msg.data["image_base64"], "AAEC");
        assert_eq!(msg.data["use_npu"], true);
        assert_eq!(msg.data["origin"], "src");
    }

    #[test]
    fn lowest_cpu_wins_without_npu() {
        let transport = RecordingTransport::default();
        let mut coordinator = BidCoordinator::new(BidConfig::default());
        let opened = coordinator.open_round(&transport, source(), &ids(&["A", "C"])).unwrap();

        coordinator.record_bid(bid(&opened.task_id, "A", 0.9, false)).unwrap();
        coordinator.record_bid(bid(&opened.task_id, "C", 0.1, false)).unwrap();

        let outcome = coordinator.evaluate(&transport, &opened.task_id).unwrap();
        assert_eq!(outcome.winner(), Some(&DeviceId::from("C")));
        assert_eq!(transport.sent_of(MessageKind::Task)[0].1.data["use_npu"], false);
    }

    #[test]
    fn zero_bids_aborts_without_assignment() {
        let transport = RecordingTransport::default();
        let mut coordinator = BidCoordinator::new(BidConfig::default());
        let opened = coordinator.open_round(&transport, source(), &ids(&["A"])).unwrap();

        let outcome = coordinator.evaluate(&transport, &opened.task_id).unwrap();
        assert!(matches!(outcome, RoundOutcome::Aborted { reason: AbortReason::NoBids, .. }));
        assert!(transport.sent_of(MessageKind::Task).is_empty());

        let failures = transport.sent_of(MessageKind::TaskFailed);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].1.task_id, opened.task_id.as_str());
        assert_eq!(failures[0].1.data["reason"], "no_bids");
    }

    #[test]
    fn source_not_notified_when_disabled() {
        let transport = RecordingTransport::default();
        let config = BidConfig {
            notify_source_on_failure: false,
            ..BidConfig::default()
        };
        let mut coordinator = BidCoordinator::new(config);
        let opened = coordinator.open_round(&transport, source(), &ids(&["A"])).unwrap();
        coordinator.evaluate(&transport, &opened.task_id).unwrap();
        assert!(transport.sent_of(MessageKind::TaskFailed).is_empty());
    }

    #[test]
    fn evaluation_happens_once_and_late_bids_are_dropped() {
        let transport = RecordingTransport::default();
        let mut coordinator = BidCoordinator::new(BidConfig::default());
        let opened = coordinator.open_round(&transport, source(), &ids(&["A", "B"])).unwrap();
        coordinator.record_bid(bid(&opened.task_id, "A", 0.5, false)).unwrap();

        assert!(coordinator.evaluate(&transport, &opened.task_id).is_some());
        assert!(coordinator.evaluate(&transport, &opened.task_id).is_none());

        let err = coordinator.record_bid(bid(&opened.task_id, "B", 0.0, true)).unwrap_err();
        assert!(matches!(err, AuctionError::UnknownRound(_)));
        assert_eq!(transport.sent_of(MessageKind::Task).len(), 1);
    }

    #[test]
    fn unreachable_winner_aborts_by_default() {
        let transport = RecordingTransport::default();
        let mut coordinator = BidCoordinator::new(BidConfig::default());
        let opened = coordinator.open_round(&transport, source(), &ids(&["A", "B"])).unwrap();
        coordinator.record_bid(bid(&opened.task_id, "A", 0.1, true)).unwrap();
        coordinator.record_bid(bid(&opened.task_id, "B", 0.5, false)).unwrap();

        // A disappears between bidding and assignment.
        let gone = RecordingTransport::unreachable(&["A"]);
        let outcome = coordinator.evaluate(&gone, &opened.task_id).unwrap();
        assert_eq!(
            outcome,
            RoundOutcome::Aborted {
                task_id: opened.task_id.clone(),
                capability: "classify".into(),
                origin: DeviceId::from("src"),
                bid_count: 2,
                reason: AbortReason::WinnerUnreachable(DeviceId::from("A")),
            }
        );
        assert!(gone.sent_of(MessageKind::Task).is_empty());
        assert_eq!(gone.sent_of(MessageKind::TaskFailed)[0].1.data["reason"], "winner_unreachable");
    }

    #[test]
    fn unreachable_winner_falls_back_when_reassign_enabled() {
        let transport = RecordingTransport::default();
        let config = BidConfig {
            reassign_on_send_failure: true,
            ..BidConfig::default()
        };
        let mut coordinator = BidCoordinator::new(config);
        let opened = coordinator.open_round(&transport, source(), &ids(&["A", "B", "C"])).unwrap();
        coordinator.record_bid(bid(&opened.task_id, "A", 0.1, true)).unwrap();
        coordinator.record_bid(bid(&opened.task_id, "B", 0.5, false)).unwrap();
        coordinator.record_bid(bid(&opened.task_id, "C", 0.7, false)).unwrap();

        let gone = RecordingTransport::unreachable(&["A"]);
        let outcome = coordinator.evaluate(&gone, &opened.task_id).unwrap();
        match outcome {
            RoundOutcome::Assigned { winner, skipped, .. } => {
                assert_eq!(winner, DeviceId::from("B"));
                assert_eq!(skipped, ids(&["A"]));
            }
            other => panic!("expected assignment, got {other:?}"),
        }
        assert_eq!(gone.sent_of(MessageKind::Task).len(), 1);
    }

    #[test]
    fn explicit_capability_overrides_default() {
        let transport = RecordingTransport::default();
        let mut coordinator = BidCoordinator::new(BidConfig::default());
        let mut src = source();
        src.capability = Some("generate_story".into());

        let opened = coordinator.open_round(&transport, src, &ids(&["A"])).unwrap();
        assert_eq!(opened.capability, "generate_story");
        assert_eq!(coordinator.snapshot()[0].capability, "generate_story");
    }
}
