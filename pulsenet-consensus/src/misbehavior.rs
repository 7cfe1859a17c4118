//! Fraud and blame bookkeeping.
//!
//! A fraud is provable from the packets alone (two different announcements
//! about the same node, an entropy reveal that does not match its
//! commitment). A blame is weaker evidence, such as a cloud hash vote that
//! disagrees with ours.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use pulsenet_common::ShortNodeId;
use serde::{Deserialize, Serialize};

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FraudKind {
    InconsistentNeighbourAnnouncement,
    ConflictingAnnouncement,
    MismatchedEntropyReveal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudReport {
    pub kind: FraudKind,
    /// Node held responsible.
    pub suspect: ShortNodeId,
    /// Node the inconsistent data was about, when it differs from the suspect.
    pub subject: ShortNodeId,
    pub details: String,
}

impl FraudReport {
    pub fn new(kind: FraudKind, suspect: ShortNodeId, subject: ShortNodeId, details: impl Into<String>) -> Self {
        Self {
            kind,
            suspect,
            subject,
            details: details.into(),
        }
    }
}

impl fmt::Display for FraudReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} by node {} about node {}: {}",
            self.kind, self.suspect, self.subject, self.details
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlameKind {
    CloudHashMismatch,
    MissingEntropyReveal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blame {
    pub kind: BlameKind,
    pub suspect: ShortNodeId,
    pub details: String,
}

/// Records kept per suspect and kind of misbehavior. Older ones are
/// dropped while the totals keep counting.
pub const MAX_RECORDS_PER_SUSPECT: usize = 32;

#[derive(Debug)]
struct Ledger<T> {
    total: usize,
    recent: VecDeque<T>,
}

impl<T> Default for Ledger<T> {
    fn default() -> Self {
        Self {
            total: 0,
            recent: VecDeque::new(),
        }
    }
}

impl<T> Ledger<T> {
    fn push(&mut self, record: T) -> usize {
        if self.recent.len() >= MAX_RECORDS_PER_SUSPECT {
            self.recent.pop_front();
        }
        self.recent.push_back(record);
        self.total = self.total.saturating_add(1);
        self.total
    }
}

impl<T: Clone> Ledger<T> {
    fn to_vec(&self) -> Vec<T> {
        self.recent.iter().cloned().collect()
    }
}

#[derive(Debug, Default)]
struct Records {
    frauds: HashMap<ShortNodeId, Ledger<FraudReport>>,
    blames: HashMap<ShortNodeId, Ledger<Blame>>,
}

/// Accumulates frauds and blames per suspect. One registry lives for the
/// whole node; rounds feed it.
#[derive(Debug, Default)]
pub struct MisbehaviorRegistry {
    records: Mutex<Records>,
}

impl MisbehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fraud. Returns `true` when this is the first fraud against
    /// the suspect.
    pub fn register_fraud(&self, report: FraudReport) -> bool {
        let mut records = lock(&self.records);
        let entry = records.frauds.entry(report.suspect).or_default();
        let first = entry.total == 0;
        // Identical reports arrive when the same packet is replayed.
        if !entry.recent.contains(&report) {
            entry.push(report);
        }
        first
    }

    /// Records a blame and returns how many blames the suspect has collected.
    pub fn register_blame(&self, blame: Blame) -> usize {
        let mut records = lock(&self.records);
        records.blames.entry(blame.suspect).or_default().push(blame)
    }

    pub fn is_fraudulent(&self, node: ShortNodeId) -> bool {
        lock(&self.records).frauds.contains_key(&node)
    }

    pub fn frauds_against(&self, node: ShortNodeId) -> Vec<FraudReport> {
        lock(&self.records).frauds.get(&node).map(Ledger::to_vec).unwrap_or_default()
    }

    /// The most recent blames against `node`.
    pub fn blames_against(&self, node: ShortNodeId) -> Vec<Blame> {
        lock(&self.records).blames.get(&node).map(Ledger::to_vec).unwrap_or_default()
    }

    /// Number of distinct suspects with at least one fraud.
    pub fn fraud_count(&self) -> usize {
        lock(&self.records).frauds.len()
    }

    pub fn blame_count(&self) -> usize {
        lock(&self.records).blames.values().map(|l| l.total).sum()
    }
}
