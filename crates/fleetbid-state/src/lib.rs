//! fleetbid state - observations the orchestrator accumulates over time.

pub mod ledger;

pub use ledger::{fitness_score, Observation, ScoreEntry, ScoringLedger};
