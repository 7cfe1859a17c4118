use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use pulsenet_common::NodeRef;
use pulsenet_consensus::{PurgatoryEvent, Report, StaticCertificate};

use crate::bootstrap::{SessionId, SessionManager};

/// Reacts to what the rounds produce: keeps a join session per pending
/// joiner and logs round outcomes.
pub struct Maestro {
    sessions: Arc<SessionManager>,
    certificate: Arc<StaticCertificate>,
    session_ttl: Duration,
    joiners: Mutex<HashMap<NodeRef, SessionId>>,
    last_report: Mutex<Option<Report>>,
    failed_rounds: Mutex<u64>,
}

impl Maestro {
    pub fn new(sessions: Arc<SessionManager>, certificate: Arc<StaticCertificate>, session_ttl: Duration) -> Self {
        Self {
            sessions,
            certificate,
            session_ttl,
            joiners: Mutex::new(HashMap::new()),
            last_report: Mutex::new(None),
            failed_rounds: Mutex::new(0),
        }
    }

    pub fn last_report(&self) -> Option<Report> {
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn failed_rounds(&self) -> u64 {
        *self.failed_rounds.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending_joiners(&self) -> usize {
        self.joiners.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn run(
        self: Arc<Self>,
        mut purgatory: UnboundedReceiver<PurgatoryEvent>,
        mut reports: UnboundedReceiver<Report>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                Some(event) = purgatory.recv() => self.handle_purgatory_event(event),
                Some(report) = reports.recv() => self.handle_report(report),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                else => break,
            }
        }
        debug!("Maestro stopped");
    }

    /// Forgets joiners whose session expired before they were admitted.
    fn prune_expired(&self) {
        let mut joiners = self.joiners.lock().unwrap_or_else(|e| e.into_inner());
        let before = joiners.len();
        joiners.retain(|_, id| self.sessions.contains(*id));
        if joiners.len() < before {
            debug!("Forgot {} joiners with expired sessions", before - joiners.len());
        }
    }

    pub fn handle_purgatory_event(&self, event: PurgatoryEvent) {
        self.prune_expired();
        match event {
            PurgatoryEvent::PhantomCreated {
                node_id,
                node_ref: Some(node_ref),
                is_joiner: true,
            } => {
                let mut joiners = self.joiners.lock().unwrap_or_else(|e| e.into_inner());
                // A joiner seen again keeps its session with a fresh deadline.
                if let Some(id) = joiners.get(&node_ref).copied() {
                    if let Ok(session) = self.sessions.release_session(id) {
                        self.sessions.prolongate_session(id, session);
                        return;
                    }
                }
                let id = self
                    .sessions
                    .new_session(node_ref, Some(Arc::clone(&self.certificate)), self.session_ttl);
                joiners.insert(node_ref, id);
                info!("Joiner {} ({}) entered purgatory, session {}", node_id, node_ref, id);
            }
            PurgatoryEvent::PhantomCreated { node_id, .. } => {
                debug!("Phantom created for node {}", node_id);
            }
            PurgatoryEvent::Ascended {
                node_id,
                node_ref,
                is_joiner,
            } => {
                let Some(id) = self
                    .joiners
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&node_ref)
                else {
                    debug!("Node {} ascended (joiner={})", node_id, is_joiner);
                    return;
                };
                match self.sessions.release_session(id) {
                    Ok(_) => info!("Joiner {} admitted, session {} closed", node_id, id),
                    Err(e) => warn!("Joiner {} admitted after its session ended: {}", node_id, e),
                }
            }
        }
    }

    pub fn handle_report(&self, report: Report) {
        self.prune_expired();
        if report.population_valid {
            info!(
                "Pulse {} sealed: power={} mode={:?} joiner={}",
                report.pulse_number, report.member_power, report.member_mode, report.is_joiner
            );
        } else {
            *self.failed_rounds.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            warn!(
                "Pulse {} ended without a valid population (joiner={})",
                report.pulse_number, report.is_joiner
            );
        }
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);
    }
}
