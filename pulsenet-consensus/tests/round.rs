use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;

use pulsenet_common::auth::ed25519::Ed25519Authenticator;
use pulsenet_common::auth::Authenticator;
use pulsenet_common::{Bits256, PulseData, PulseNumber, ShortNodeId};
use pulsenet_consensus::purgatory::PurgatoryEvent;
use pulsenet_consensus::rules::{DiscoveryNode, MinRoles};
use pulsenet_consensus::{
    Certificate, ConsensusConfig, InMemoryPulseStorage, PopulationKeeper, PrimaryRole, PulseStorage, Report,
    RoundController, StaticCertificate, StaticProfile,
};
use pulsenet_p2p::InMemoryHub;

struct TestNode {
    controller: Arc<RoundController>,
    keeper: Arc<PopulationKeeper>,
    storage: Arc<InMemoryPulseStorage>,
    reports: Arc<Mutex<Vec<Report>>>,
}

fn address(id: u32) -> String {
    format!("mem://node-{id}")
}

fn test_config() -> ConsensusConfig {
    ConsensusConfig {
        announce_timeout_ms: 300,
        vector_timeout_ms: 300,
        entropy_timeout_ms: 300,
        finalize_timeout_ms: 300,
        sync_timeout_ms: 300,
        ..ConsensusConfig::default()
    }
}

fn certificate(keys: &[(u32, Arc<Ed25519Authenticator>)], majority_rule: usize) -> Arc<StaticCertificate> {
    Arc::new(StaticCertificate {
        discovery_nodes: keys
            .iter()
            .map(|(id, auth)| DiscoveryNode {
                node_id: ShortNodeId(*id),
                role: PrimaryRole::Virtual,
                address: address(*id),
                public_key: auth.public_key(),
            })
            .collect(),
        majority_rule,
        min_roles: MinRoles {
            virtual_nodes: 1,
            ..MinRoles::default()
        },
    })
}

fn start_node(
    hub: &InMemoryHub,
    id: u32,
    auth: Arc<Ed25519Authenticator>,
    cert: Arc<StaticCertificate>,
    config: ConsensusConfig,
) -> TestNode {
    let profile = Arc::new(StaticProfile::new(
        ShortNodeId(id),
        PrimaryRole::Virtual,
        auth.public_key(),
        address(id),
    ));
    let keeper = Arc::new(PopulationKeeper::new(Arc::clone(&profile), 8));
    keeper
        .set_initial_snapshot(PulseData::new_first_ephemeral(), cert.initial_census())
        .unwrap();
    let storage = Arc::new(InMemoryPulseStorage::new());
    let transport = Arc::new(hub.connect(&address(id)));

    let controller = Arc::new(RoundController::new(
        config,
        profile,
        auth,
        transport.clone(),
        Arc::clone(&keeper),
        cert,
        storage.clone(),
    ));
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    controller.set_on_finished(Arc::new(move |report: Report| sink.lock().unwrap().push(report)));

    let handler = Arc::new(controller.datagram_handler());
    tokio::spawn(async move { transport.run(handler).await });

    TestNode {
        controller,
        keeper,
        storage,
        reports,
    }
}

fn keys(count: u32) -> Vec<(u32, Arc<Ed25519Authenticator>)> {
    (1..=count).map(|id| (id, Arc::new(Ed25519Authenticator::generate()))).collect()
}

fn next_pulse() -> PulseData {
    PulseData::new_first_ephemeral().create_next_ephemeral_pulse().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_nodes_agree_on_cloud_hash() {
    let hub = InMemoryHub::new();
    let keys = keys(4);
    let cert = certificate(&keys, 3);
    let nodes: Vec<TestNode> = keys
        .iter()
        .map(|(id, auth)| start_node(&hub, *id, Arc::clone(auth), Arc::clone(&cert), test_config()))
        .collect();

    let pulse = next_pulse();
    let reports = join_all(nodes.iter().map(|n| n.controller.run_round(pulse))).await;
    for report in reports {
        let report = report.unwrap();
        assert!(report.population_valid);
        assert!(!report.is_joiner);
        assert_eq!(report.pulse_number, pulse.number);
    }

    let hashes: Vec<_> = nodes.iter().map(|n| n.keeper.get_cloud_hash(pulse.number).unwrap()).collect();
    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    for node in &nodes {
        let accessor = node.keeper.latest_accessor().unwrap();
        assert_eq!(accessor.pulse.number, pulse.number);
        assert_eq!(accessor.population.indexed_count(), 4);
        assert!(accessor.population.is_valid());
        assert_eq!(node.storage.latest().await.unwrap(), Some(pulse));
        assert_eq!(node.reports.lock().unwrap().len(), 1);
        assert_eq!(node.controller.last_pulse(), Some(pulse));
        assert_eq!(node.controller.misbehavior().fraud_count(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_completes_without_a_silent_peer() {
    let hub = InMemoryHub::new();
    let keys = keys(4);
    let cert = certificate(&keys, 3);
    let nodes: Vec<TestNode> = keys
        .iter()
        .map(|(id, auth)| start_node(&hub, *id, Arc::clone(auth), Arc::clone(&cert), test_config()))
        .collect();
    hub.set_offline(&address(4), true);

    let pulse = next_pulse();
    let reports = join_all(nodes[..3].iter().map(|n| n.controller.run_round(pulse))).await;
    assert!(reports.into_iter().all(|r| r.unwrap().population_valid));

    let hashes: Vec<_> = nodes[..3]
        .iter()
        .map(|n| n.keeper.get_cloud_hash(pulse.number).unwrap())
        .collect();
    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    let census = nodes[0].keeper.latest_accessor().unwrap();
    assert_eq!(census.population.indexed_count(), 3);
    assert!(census.population.get_member(ShortNodeId(4)).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_majority_is_a_round_failure() {
    let hub = InMemoryHub::new();
    let keys = keys(3);
    let cert = certificate(&keys, 3);
    let nodes: Vec<TestNode> = keys
        .iter()
        .map(|(id, auth)| start_node(&hub, *id, Arc::clone(auth), Arc::clone(&cert), test_config()))
        .collect();
    hub.set_offline(&address(3), true);

    let pulse = next_pulse();
    let reports = join_all(nodes[..2].iter().map(|n| n.controller.run_round(pulse))).await;
    assert!(reports.into_iter().all(|r| !r.unwrap().population_valid));

    let accessor = nodes[0].keeper.latest_accessor().unwrap();
    assert_eq!(accessor.pulse.number, pulse.number);
    assert!(!accessor.population.is_valid());
    assert_eq!(accessor.population.indexed_count(), 3);
    assert!(nodes[0].keeper.get_cloud_hash(pulse.number).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_joiner_is_admitted_and_syncs_census() {
    let hub = InMemoryHub::new();
    let keys = keys(3);
    let cert = certificate(&keys, 2);
    let mut config = test_config();
    config.ascension.allow_brief_ascension = true;

    let members: Vec<TestNode> = keys
        .iter()
        .map(|(id, auth)| start_node(&hub, *id, Arc::clone(auth), Arc::clone(&cert), config.clone()))
        .collect();
    let (observer, mut purgatory_events) = tokio::sync::mpsc::unbounded_channel();
    members[0].controller.set_purgatory_observer(observer);

    let joiner_auth = Arc::new(Ed25519Authenticator::generate());
    let joiner = start_node(&hub, 10, joiner_auth, Arc::clone(&cert), config);

    let pulse = next_pulse();
    let joiner_round = {
        let controller = Arc::clone(&joiner.controller);
        tokio::spawn(async move { controller.run_round(pulse).await })
    };
    // Members open the round after the joiner announced itself.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let reports = join_all(members.iter().map(|n| n.controller.run_round(pulse))).await;
    assert!(reports.into_iter().all(|r| r.unwrap().population_valid));

    for member in &members {
        let census = member.keeper.latest_accessor().unwrap();
        assert_eq!(census.population.indexed_count(), 4);
        assert!(census.population.get_member(ShortNodeId(10)).is_some());
    }

    let report = joiner_round.await.unwrap().unwrap();
    assert!(report.is_joiner);
    assert!(report.population_valid);
    let census = joiner.keeper.latest_accessor().unwrap();
    assert!(census.population.local().is_some());
    assert_eq!(
        joiner.keeper.get_cloud_hash(pulse.number),
        members[0].keeper.get_cloud_hash(pulse.number)
    );

    let mut created = false;
    let mut ascended = false;
    while let Ok(event) = purgatory_events.try_recv() {
        match event {
            PurgatoryEvent::PhantomCreated { node_id, is_joiner, .. } => {
                created |= node_id == ShortNodeId(10) && is_joiner;
            }
            PurgatoryEvent::Ascended { node_id, .. } => ascended |= node_id == ShortNodeId(10),
        }
    }
    assert!(created && ascended);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_consecutive_rounds_keep_agreeing() {
    let hub = InMemoryHub::new();
    let keys = keys(3);
    let cert = certificate(&keys, 2);
    let nodes: Vec<TestNode> = keys
        .iter()
        .map(|(id, auth)| start_node(&hub, *id, Arc::clone(auth), Arc::clone(&cert), test_config()))
        .collect();

    let mut pulse = next_pulse();
    for _ in 0..3 {
        let reports = join_all(nodes.iter().map(|n| n.controller.run_round(pulse))).await;
        assert!(reports.into_iter().all(|r| r.unwrap().population_valid));
        pulse = pulse.create_next_ephemeral_pulse().unwrap();
    }

    let storage: Arc<dyn PulseStorage> = nodes[0].storage.clone();
    let latest = storage.latest().await.unwrap().unwrap();
    let previous = storage.previous(latest.number).await.unwrap().unwrap();
    assert!(previous.is_valid_next(&latest));
    assert_eq!(nodes[0].reports.lock().unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pulsar_pulses_drive_running_controllers() {
    let hub = InMemoryHub::new();
    let keys = keys(3);
    let cert = certificate(&keys, 2);
    let nodes: Vec<TestNode> = keys
        .iter()
        .map(|(id, auth)| start_node(&hub, *id, Arc::clone(auth), Arc::clone(&cert), test_config()))
        .collect();

    let (stop, stopped) = tokio::sync::watch::channel(false);
    let tasks: Vec<_> = nodes
        .iter()
        .map(|n| tokio::spawn(Arc::clone(&n.controller).run(stopped.clone())))
        .collect();

    let pulse = PulseData::new_first_pulsar(10, Bits256::random()).unwrap();
    for node in &nodes {
        node.controller.pulse_handler().handle_pulse(pulse, pulse.to_bytes()).await;
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;

    for node in &nodes {
        assert_eq!(node.controller.last_pulse(), Some(pulse));
        assert!(node.keeper.get_cloud_hash(pulse.number).is_some());
    }
    // A replayed pulse does not start another round.
    nodes[0].controller.pulse_handler().handle_pulse(pulse, pulse.to_bytes()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(nodes[0].reports.lock().unwrap().len(), 1);

    // Points back at our pulse with another delta: dropped.
    let broken = PulseData::new_pulsar(PulseNumber::new(pulse.number.as_u32() + 5), 10, 5, Bits256::random()).unwrap();
    nodes[0].controller.pulse_handler().handle_pulse(broken, broken.to_bytes()).await;
    // Ephemeral data never passes as a pulsar pulse.
    let ephemeral = next_pulse();
    nodes[0].controller.pulse_handler().handle_pulse(ephemeral, ephemeral.to_bytes()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(nodes[0].controller.last_pulse(), Some(pulse));

    let successor = pulse.create_next_pulsar_pulse(10, Bits256::random).unwrap();
    for node in &nodes {
        node.controller.pulse_handler().handle_pulse(successor, successor.to_bytes()).await;
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;
    for node in &nodes {
        assert_eq!(node.controller.last_pulse(), Some(successor));
    }
    assert_eq!(nodes[0].reports.lock().unwrap().len(), 2);

    stop.send(true).unwrap();
    for task in tasks {
        task.await.unwrap();
    }
}
