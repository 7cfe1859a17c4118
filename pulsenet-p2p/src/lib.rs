pub mod config;
pub mod future;
pub mod in_memory;
pub mod message;
pub mod traits;
pub mod udp;

pub use config::P2pConfig;
pub use future::{Future, FutureError, FutureManager};
pub use in_memory::{InMemoryHub, InMemoryTransport};
pub use message::NetworkError;
pub use traits::{DatagramReceiver, Transport};
pub use udp::UdpTransport;
