//! Winner selection.
//!
//! The default policy prefers devices with an NPU; within the preferred
//! group (or among all bidders when nobody has an NPU) the lowest reported
//! CPU load wins, and equal loads go to the lexically smallest device id so
//! that evaluation is reproducible.

use std::cmp::Ordering;

use fleetbid_protocol::{Bid, DeviceId};

use crate::round::BiddingRound;

/// Orders a round's bidders from most to least preferred.
///
/// The first entry is the winner; the rest are the fallback order used when
/// delivery to a better candidate fails.
pub trait SelectionPolicy: Send + Sync {
    fn rank(&self, round: &BiddingRound) -> Vec<DeviceId>;
}

/// NPU first, then lowest CPU load, then lowest device id.
#[derive(Debug, Clone, Copy, Default)]
pub struct NpuFirstLowestLoad;

impl NpuFirstLowestLoad {
    pub fn compare(a: (&DeviceId, &Bid), b: (&DeviceId, &Bid)) -> Ordering {
        b.1.has_npu
            .cmp(&a.1.has_npu)
            .then_with(|| a.1.effective_cpu_load().total_cmp(&b.1.effective_cpu_load()))
            .then_with(|| a.0.cmp(b.0))
    }
}

impl SelectionPolicy for NpuFirstLowestLoad {
    fn rank(&self, round: &BiddingRound) -> Vec<DeviceId> {
        let mut bids: Vec<(&DeviceId, &Bid)> = round.bids().iter().collect();
        bids.sort_by(|a, b| Self::compare(*a, *b));
        bids.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn round_with(bids: &[(&str, f64, bool)]) -> BiddingRound {
        let mut round = BiddingRound::new(
            "t1".into(),
            "classify".into(),
            "src".into(),
            serde_json::Value::Null,
            Duration::from_secs(5),
            bids.iter().map(|(id, _, _)| DeviceId::from(*id)),
        );
        for (id, cpu, npu) in bids {
            round.record_bid(DeviceId::from(*id), Bid::new(*cpu, 50.0, *npu)).unwrap();
        }
        round
    }

    fn winner(bids: &[(&str, f64, bool)]) -> Option<DeviceId> {
        NpuFirstLowestLoad.rank(&round_with(bids)).into_iter().next()
    }

    #[test]
    fn npu_beats_lower_cpu_elsewhere() {
        let w = winner(&[("A", 0.9, false), ("B", 0.3, true), ("C", 0.1, false)]);
        assert_eq!(w, Some(DeviceId::from("B")));
    }

    #[test]
    fn lowest_cpu_without_npu() {
        let w = winner(&[("A", 0.9, false), ("C", 0.1, false)]);
        assert_eq!(w, Some(DeviceId::from("C")));
    }

    #[test]
    fn lowest_cpu_among_npu_devices() {
        let w = winner(&[("A", 0.6, true), ("B", 0.2, true), ("C", 0.0, false)]);
        assert_eq!(w, Some(DeviceId::from("B")));
    }

    #[test]
    fn ties_go_to_lowest_device_id() {
        let w = winner(&[("charlie", 0.4, false), ("alpha", 0.4, false), ("bravo", 0.4, false)]);
        assert_eq!(w, Some(DeviceId::from("alpha")));
    }

    #[test]
    fn no_bids_no_winner() {
        assert_eq!(winner(&[]), None);
    }

    #[test]
    fn full_ranking_order() {
        let ranked = NpuFirstLowestLoad.rank(&round_with(&[
            ("A", 0.9, false),
            ("B", 0.3, true),
            ("C", 0.1, false),
            ("D", 0.7, true),
        ]));
        let ids: Vec<&str> = ranked.iter().map(DeviceId::as_str).collect();
        assert_eq!(ids, vec!["B", "D", "C", "A"]);
    }

    #[test]
    fn non_finite_load_ranks_after_real_readings() {
        let w = winner(&[("A", f64::NAN, false), ("B", 0.95, false)]);
        assert_eq!(w, Some(DeviceId::from("B")));
    }
}
