pub mod cloud;
pub mod controller;
pub mod phase;
pub mod processor;
pub mod round;
pub mod sync;

pub use controller::RoundController;
pub use phase::RoundPhase;
pub use processor::{RoundEvent, RoundProcessor};
pub use round::RealmRound;
pub use sync::SyncService;
