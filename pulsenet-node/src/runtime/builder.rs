use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use pulsenet_common::auth::ed25519::Ed25519Authenticator;
use pulsenet_common::auth::Authenticator;
use pulsenet_common::{PulseData, PulseNetError, Result};
use pulsenet_consensus::rules::Certificate;
use pulsenet_consensus::{PopulationKeeper, PulseStorage, Report, RoundController};
use pulsenet_p2p::{Transport, UdpTransport};

use crate::bootstrap::SessionManager;
use crate::config::Config;
use crate::runtime::maestro::Maestro;
use crate::storage::FilePulseStorage;

pub struct NodeRuntime {
    pub controller: Arc<RoundController>,
    pub maestro: Arc<Maestro>,
    pub sessions: Arc<SessionManager>,
    pub storage: Arc<FilePulseStorage>,
    local_address: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeRuntime {
    /// Address the UDP socket is bound to.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Stops every task of the node and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        self.sessions.stop().await;
        info!("Node stopped");
    }
}

/// Pulse the node resumes from: the last stored one when it was produced
/// the way this node produces pulses, otherwise the first ephemeral pulse.
async fn starting_pulse(storage: &FilePulseStorage, ephemeral: bool) -> Result<PulseData> {
    match storage.latest().await? {
        Some(pulse) if pulse.is_from_ephemeral() == ephemeral => {
            info!("Resuming from stored pulse {}", pulse.number);
            Ok(pulse)
        }
        Some(pulse) => {
            warn!("Stored pulse {} does not match the pulse mode, starting over", pulse.number);
            Ok(PulseData::new_first_ephemeral())
        }
        None => Ok(PulseData::new_first_ephemeral()),
    }
}

pub async fn build_runtime(config: Config, auth: Arc<Ed25519Authenticator>) -> Result<NodeRuntime> {
    config.validate()?;
    let certificate = Arc::new(config.certificate.clone());

    let storage = Arc::new(FilePulseStorage::open(config.storage_path()).await?);
    let pulse = starting_pulse(&storage, config.consensus.ephemeral).await?;

    let profile = Arc::new(config.local_profile(auth.public_key()));
    let keeper = Arc::new(PopulationKeeper::new(Arc::clone(&profile), config.consensus.keeper_history));
    keeper
        .set_initial_snapshot(pulse, certificate.initial_census())
        .map_err(|e| PulseNetError::Consensus(e.to_string()))?;
    let is_discovery = certificate.discovery_nodes.iter().any(|d| d.node_id == config.node_id);

    let transport = Arc::new(
        UdpTransport::bind(&config.p2p_config())
            .await
            .map_err(|e| PulseNetError::Network(e.to_string()))?,
    );
    let local_address = transport.local_address();

    let controller = Arc::new(RoundController::new(
        config.consensus.clone(),
        Arc::clone(&profile),
        auth,
        transport.clone(),
        keeper,
        certificate.clone(),
        storage.clone(),
    ));

    let sessions = Arc::new(SessionManager::new());
    sessions.start();
    let maestro = Arc::new(Maestro::new(
        Arc::clone(&sessions),
        certificate,
        Duration::from_millis(config.join_session_ttl_ms),
    ));

    let (purgatory_tx, purgatory_rx) = mpsc::unbounded_channel();
    let (report_tx, report_rx) = mpsc::unbounded_channel();
    controller.set_purgatory_observer(purgatory_tx);
    controller.set_on_finished(Arc::new(move |report: Report| {
        let _ = report_tx.send(report);
    }));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let handler = Arc::new(controller.datagram_handler());
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move { transport.run(handler, rx).await }));

    let m = Arc::clone(&maestro);
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move { m.run(purgatory_rx, report_rx, rx).await }));

    let c = Arc::clone(&controller);
    tasks.push(tokio::spawn(async move { c.run(shutdown_rx).await }));

    info!(
        "Node {} ({}) running on {} discovery={} ephemeral={}",
        config.node_id, profile.node_ref, local_address, is_discovery, config.consensus.ephemeral
    );

    Ok(NodeRuntime {
        controller,
        maestro,
        sessions,
        storage,
        local_address,
        shutdown,
        tasks,
    })
}
