//! Shared building blocks for the pulsenet workspace: pulse data, node
//! identifiers, signing and hashing helpers, and the common error type.

pub mod auth;
pub mod crypto;
pub mod error;
pub mod pulse;
pub mod utils;

pub use error::{PulseError, PulseNetError, Result};
pub use pulse::{Bits256, PulseData, PulseNumber};
pub use utils::{NodeRef, ShortNodeId};
