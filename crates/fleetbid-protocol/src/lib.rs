//! fleetbid protocol - wire types shared by the orchestrator and devices.
//!
//! Every message on the wire is a bare JSON object carrying a `type`
//! discriminator plus the `agent_id`, `task_id`, `subtask` and `data`
//! envelope fields. Objects are not length-prefixed; [`codec::MessageFramer`]
//! recovers message boundaries from the byte stream.

pub mod codec;
pub mod constants;
pub mod error;
pub mod identity;
pub mod messages;
pub mod types;

pub use codec::MessageFramer;
pub use constants::*;
pub use error::*;
pub use identity::*;
pub use messages::*;
pub use types::*;
