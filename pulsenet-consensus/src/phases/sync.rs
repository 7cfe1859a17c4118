//! Census transfer for nodes that cannot compute it themselves.
//!
//! A joiner takes no part in the cloud hash vote. After its round it asks a
//! member for the sealed census with a signed `SyncRequest` and waits for
//! the `SyncReply` through a [`Future`](pulsenet_p2p::Future).

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use pulsenet_common::auth::Authenticator;
use pulsenet_common::PulseNumber;
use pulsenet_p2p::{FutureError, FutureManager, Transport};

use crate::adapters::Inbound;
use crate::error::ConsensusError;
use crate::keeper::PopulationKeeper;
use crate::packet::{MemberPacket, PacketBody, PacketCodec, SyncReply, SyncRequest};
use crate::profile::StaticProfile;

pub struct SyncService {
    local: Arc<StaticProfile>,
    auth: Arc<dyn Authenticator>,
    transport: Arc<dyn Transport>,
    codec: PacketCodec,
    keeper: Arc<PopulationKeeper>,
    futures: FutureManager<SyncReply>,
    timeout: Duration,
}

impl SyncService {
    pub fn new(
        local: Arc<StaticProfile>,
        auth: Arc<dyn Authenticator>,
        transport: Arc<dyn Transport>,
        codec: PacketCodec,
        keeper: Arc<PopulationKeeper>,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            auth,
            transport,
            codec,
            keeper,
            futures: FutureManager::new(),
            timeout,
        }
    }

    pub fn pending(&self) -> usize {
        self.futures.len()
    }

    async fn send(&self, packet: MemberPacket, address: &str) -> Result<(), ConsensusError> {
        let packet = packet.sign(self.auth.as_ref())?;
        let bytes = self.codec.encode(&packet)?;
        self.transport.send_datagram(address, bytes).await?;
        Ok(())
    }

    /// Answers requests from the latest sealed census and completes the
    /// future a reply belongs to.
    pub async fn handle_packet(&self, packet: MemberPacket, from: Inbound) -> Result<(), ConsensusError> {
        match &packet.body {
            PacketBody::SyncRequest(request) => {
                let Some(accessor) = self.keeper.latest_accessor() else {
                    return Err(ConsensusError::InternalInvariant("no census to share".into()));
                };
                let reply = SyncReply {
                    request_id: request.request_id,
                    pulse: accessor.pulse,
                    cloud_hash: accessor.cloud_hash,
                    members: accessor.population.to_census_members(),
                };
                debug!(
                    "Answering sync request {} from node {} with pulse {}",
                    request.request_id, packet.source, accessor.pulse.number
                );
                let response = MemberPacket::new(
                    packet.pulse_number,
                    self.local.node_id,
                    packet.source,
                    PacketBody::SyncReply(reply),
                );
                self.send(response, &from.addr).await
            }
            PacketBody::SyncReply(reply) => {
                let Some(accessor) = self.keeper.latest_accessor() else {
                    return Err(ConsensusError::Authenticity(packet.source));
                };
                let Some(member) = accessor.get_active_node_by_short_id(packet.source) else {
                    return Err(ConsensusError::Authenticity(packet.source));
                };
                if !packet.verify(self.auth.as_ref(), &member.profile.public_key) {
                    return Err(ConsensusError::Authenticity(packet.source));
                }
                match self.futures.get(reply.request_id) {
                    Some(future) => {
                        future.set_result(reply.clone());
                    }
                    None => debug!("Late sync reply {} from node {}", reply.request_id, packet.source),
                }
                Ok(())
            }
            _ => Err(ConsensusError::Malformed("not a sync packet".into())),
        }
    }

    /// Asks `target` for its latest census.
    pub async fn request_census(
        &self,
        target: &StaticProfile,
        pulse_number: PulseNumber,
    ) -> Result<SyncReply, ConsensusError> {
        let future = self.futures.create();
        let request = MemberPacket::new(
            pulse_number,
            self.local.node_id,
            target.node_id,
            PacketBody::SyncRequest(SyncRequest {
                request_id: future.id(),
            }),
        );
        if let Err(e) = self.send(request, &target.address).await {
            future.cancel();
            return Err(e);
        }
        future.get_result(self.timeout).await.map_err(|e| match e {
            FutureError::Timeout => ConsensusError::Timeout(format!("sync with node {}", target.node_id)),
            FutureError::ChannelClosed => ConsensusError::Timeout(format!("sync with node {} cancelled", target.node_id)),
        })
    }
}
