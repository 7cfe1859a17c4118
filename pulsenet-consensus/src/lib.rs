//! Pulse-synchronized membership consensus.
//!
//! Every pulse the nodes of a realm run one round: they announce themselves,
//! exchange what they saw, reveal committed entropy and agree on a cloud hash
//! over the resulting census. Nodes that are not yet members wait in the
//! purgatory until enough evidence admits them.

pub mod adapters;
pub mod census;
pub mod config;
pub mod error;
pub mod keeper;
pub mod member;
pub mod misbehavior;
pub mod packet;
pub mod phases;
pub mod population;
pub mod profile;
pub mod purgatory;
pub mod report;
pub mod rules;
pub mod storage;

pub use adapters::{DatagramHandler, Inbound, PacketParserFactory, PacketProcessor, PulseHandler};
pub use census::{CensusMember, OnlinePopulation};
pub use config::ConsensusConfig;
pub use error::ConsensusError;
pub use keeper::{PopulationAccessor, PopulationKeeper};
pub use member::{OpMode, Power, PrimaryRole, Rank};
pub use phases::{RoundController, RoundEvent, RoundPhase, RoundProcessor};
pub use profile::{ProfileExtension, StaticProfile};
pub use purgatory::{AscensionPolicy, PurgatoryEvent};
pub use report::{OnConsensusFinished, Report};
pub use rules::{Certificate, StaticCertificate};
pub use storage::{InMemoryPulseStorage, PulseStorage};

use std::sync::{Mutex, MutexGuard};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
