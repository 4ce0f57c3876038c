use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use fleetbid_protocol::{Bid, DeviceId, TaskId};

use crate::AuctionError;

/// Phase of a bidding round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Accepting bids.
    Open,
    /// Deadline fired; bids are frozen and a winner is being chosen.
    Evaluating,
    /// Task payload delivered to the winner.
    Assigned,
    /// Ended without an assignment.
    Aborted,
}

/// One task's solicitation, collection and selection cycle.
#[derive(Debug, Clone)]
pub struct BiddingRound {
    task_id: TaskId,
    capability: String,
    origin: DeviceId,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    deadline: Duration,
    invited: BTreeSet<DeviceId>,
    bids: BTreeMap<DeviceId, Bid>,
    phase: RoundPhase,
}

impl BiddingRound {
    pub fn new(
        task_id: TaskId,
        capability: String,
        origin: DeviceId,
        payload: serde_json::Value,
        deadline: Duration,
        invited: impl IntoIterator<Item = DeviceId>,
    ) -> Self {
        Self {
            task_id,
            capability,
            origin,
            payload,
            created_at: Utc::now(),
            deadline,
            invited: invited.into_iter().collect(),
            bids: BTreeMap::new(),
            phase: RoundPhase::Open,
        }
    }

    /// Record a bid. A second bid from the same device replaces the first;
    /// returns whether one was replaced.
    pub fn record_bid(&mut self, device_id: DeviceId, bid: Bid) -> Result<bool, AuctionError> {
        if self.phase != RoundPhase::Open {
            return Err(AuctionError::RoundClosed {
                task_id: self.task_id.clone(),
                phase: self.phase,
            });
        }
        if !self.invited.contains(&device_id) {
            return Err(AuctionError::NotInvited {
                task_id: self.task_id.clone(),
                device_id,
            });
        }
        Ok(self.bids.insert(device_id, bid).is_some())
    }

    /// Freeze the bid set. Only the first call succeeds.
    pub fn close(&mut self) -> Result<(), AuctionError> {
        if self.phase != RoundPhase::Open {
            return Err(AuctionError::RoundClosed {
                task_id: self.task_id.clone(),
                phase: self.phase,
            });
        }
        self.phase = RoundPhase::Evaluating;
        Ok(())
    }

    pub(crate) fn finish(&mut self, phase: RoundPhase) {
        debug_assert!(matches!(phase, RoundPhase::Assigned | RoundPhase::Aborted));
        self.phase = phase;
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn origin(&self) -> &DeviceId {
        &self.origin
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn bids(&self) -> &BTreeMap<DeviceId, Bid> {
        &self.bids
    }

    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    pub fn is_invited(&self, device_id: &DeviceId) -> bool {
        self.invited.contains(device_id)
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            task_id: self.task_id.clone(),
            capability: self.capability.clone(),
            origin: self.origin.clone(),
            phase: self.phase,
            created_at: self.created_at,
            deadline_ms: self.deadline.as_millis() as u64,
            invited: self.invited.iter().cloned().collect(),
            bids: self.bids.clone(),
        }
    }
}

/// Read-only view of a round for status reporting. Omits the payload.
#[derive(Debug, Clone, Serialize)]
pub struct RoundSnapshot {
    pub task_id: TaskId,
    pub capability: String,
    pub origin: DeviceId,
    pub phase: RoundPhase,
    pub created_at: DateTime<Utc>,
    pub deadline_ms: u64,
    pub invited: Vec<DeviceId>,
    pub bids: BTreeMap<DeviceId, Bid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round() -> BiddingRound {
        BiddingRound::new(
            TaskId::from("t1"),
            "classify".into(),
            DeviceId::from("src"),
            serde_json::json!({ "image_base64": "AA==" }),
            Duration::from_secs(5),
            [DeviceId::from("A"), DeviceId::from("B")],
        )
    }

    #[test]
    fn accepts_bids_while_open() {
        let mut r = round();
        assert_eq!(r.phase(), RoundPhase::Open);
        assert!(!r.record_bid(DeviceId::from("A"), Bid::new(0.5, 80.0, false)).unwrap());
        assert_eq!(r.bid_count(), 1);
    }

    #[test]
    fn last_bid_from_a_device_wins() {
        let mut r = round();
        r.record_bid(DeviceId::from("A"), Bid::new(0.5, 80.0, false)).unwrap();
        assert!(r.record_bid(DeviceId::from("A"), Bid::new(0.1, 80.0, false)).unwrap());
        assert_eq!(r.bid_count(), 1);
        assert_eq!(r.bids()[&DeviceId::from("A")].cpu_load, 0.1);
    }

    #[test]
    fn uninvited_bidder_is_rejected() {
        let mut r = round();
        let err = r.record_bid(DeviceId::from("Z"), Bid::new(0.0, 100.0, true)).unwrap_err();
        assert!(matches!(err, AuctionError::NotInvited { .. }));
        assert_eq!(r.bid_count(), 0);
    }

    #[test]
    fn close_is_exactly_once_and_freezes_bids() {
        let mut r = round();
        r.close().unwrap();
        assert_eq!(r.phase(), RoundPhase::Evaluating);
        assert!(matches!(r.close(), Err(AuctionError::RoundClosed { .. })));

        let err = r.record_bid(DeviceId::from("A"), Bid::new(0.1, 80.0, false)).unwrap_err();
        assert!(matches!(err, AuctionError::RoundClosed { phase: RoundPhase::Evaluating, .. }));
    }
}
