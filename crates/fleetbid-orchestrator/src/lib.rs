//! fleetbid orchestrator: the process devices connect to.
//!
//! [`server::DeviceServer`] accepts device connections and feeds decoded
//! messages to [`orchestrator::Orchestrator`], which owns the registry, the
//! bid coordinator and the scoring ledger behind one lock and arms the
//! deadline timer for every round it opens. [`status::StatusServer`] serves
//! a read-only JSON view of the same state.

pub mod client;
pub mod config;
pub mod orchestrator;
pub mod server;
pub mod status;

pub use config::OrchestratorConfig;
pub use orchestrator::{Orchestrator, OrchestratorState, OutcomeRecord, ResultState};
pub use server::DeviceServer;
pub use status::StatusServer;
