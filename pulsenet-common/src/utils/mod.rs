//! Node identifiers and small helpers shared across the workspace.

pub mod node_ref;
pub mod time;

pub use node_ref::{NodeRef, ShortNodeId};
