pub mod adapter;
pub mod channels;
pub mod drain;
pub mod error;
pub mod transport;

pub use adapter::{build_adapter, Adapter, HorizontalAdapter, LocalAdapter, Namespace};
pub use channels::{ChannelManager, JoinRejection, JoinResponse, LeaveResponse};
pub use drain::drain_local_sockets;
pub use error::{Error, Result};
pub use transport::{ClusterBus, ClusterTransport, NatsTransport, RedisTransport, Transport};
