use bincode::Options;

use crate::adapters::PacketParserFactory;
use crate::error::ConsensusError;
use crate::packet::{InboundPacket, MemberPacket, PacketBody};

/// Wire codec for member packets: bincode with a size limit.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_size: usize,
}

impl PacketCodec {
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new().with_limit(self.max_size as u64)
    }

    pub fn encode(&self, packet: &MemberPacket) -> Result<Vec<u8>, ConsensusError> {
        Ok(self.options().serialize(packet)?)
    }

    pub fn decode(&self, buf: &[u8]) -> Result<MemberPacket, ConsensusError> {
        let packet: MemberPacket = self.options().deserialize(buf)?;
        validate(&packet)?;
        Ok(packet)
    }
}

/// Structural checks that need no round state.
fn validate(packet: &MemberPacket) -> Result<(), ConsensusError> {
    if packet.source.is_absent() {
        return Err(ConsensusError::Malformed("absent source id".into()));
    }
    if !packet.pulse_number.is_time_pulse() {
        return Err(ConsensusError::Malformed(format!(
            "pulse number {} is not a time pulse",
            packet.pulse_number
        )));
    }
    match &packet.body {
        PacketBody::Announcement(ann) => {
            if ann.member_id != packet.source {
                return Err(ConsensusError::Malformed(format!(
                    "announcement for node {} sent by node {}",
                    ann.member_id, packet.source
                )));
            }
            if ann.pulse.number != packet.pulse_number {
                return Err(ConsensusError::Malformed("announced pulse differs from packet pulse".into()));
            }
            if ann.rank.is_joiner() && ann.profile.is_none() {
                return Err(ConsensusError::Malformed("joiner announcement without profile".into()));
            }
        }
        PacketBody::Vector(vector) => {
            if vector.joiners.iter().any(|p| p.as_announcement().is_none()) {
                return Err(ConsensusError::Malformed("vector relays a non-announcement".into()));
            }
        }
        _ => {}
    }
    Ok(())
}

impl PacketParserFactory for PacketCodec {
    fn parse_packet(&self, buf: &[u8]) -> Result<InboundPacket, ConsensusError> {
        Ok(InboundPacket::Member(self.decode(buf)?))
    }
}
