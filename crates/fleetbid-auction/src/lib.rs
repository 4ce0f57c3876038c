//! fleetbid auction: solicit bids for a task, pick one winner, hand it the
//! task.
//!
//! - [`round`]: the per-task state machine (`Open` -> `Evaluating` ->
//!   `Assigned` | `Aborted`)
//! - [`selection`]: how bids are ranked
//! - [`coordinator`]: the table of open rounds and the fan-out, evaluation
//!   and assignment steps, written against [`fleetbid_network::BidTransport`]

pub mod coordinator;
pub mod round;
pub mod selection;

pub use coordinator::{AbortReason, BidConfig, BidCoordinator, OpenedRound, RoundOutcome};
pub use round::{BiddingRound, RoundPhase, RoundSnapshot};
pub use selection::{NpuFirstLowestLoad, SelectionPolicy};

use fleetbid_protocol::{DeviceId, TaskId};

/// Errors from the bidding layer.
#[derive(Debug, thiserror::Error)]
pub enum AuctionError {
    #[error("no bidding round for task {0}")]
    UnknownRound(TaskId),

    #[error("round {task_id} no longer accepts bids (phase {phase:?})")]
    RoundClosed { task_id: TaskId, phase: RoundPhase },

    #[error("device {device_id} was not invited to bid on {task_id}")]
    NotInvited { task_id: TaskId, device_id: DeviceId },

    #[error("no reachable device advertises capability '{0}'")]
    NoEligibleDevices(String),
}
