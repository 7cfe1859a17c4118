pub mod codec;
pub mod limiter;
pub mod recorder;
pub mod types;

pub use codec::PacketCodec;
pub use limiter::PacketLimiter;
pub use recorder::{PacketRecorder, RecordedPacket};
pub use types::{
    EntropyReveal, FinalizeVote, InboundPacket, MemberAnnouncement, MemberPacket, PacketBody, PacketType,
    SyncReply, SyncRequest, VectorReport,
};
