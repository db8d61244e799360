//! Pub/sub substrates carrying requests, responses and broadcasts between nodes

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub mod cluster;
pub mod nats;
pub mod redis;

pub use cluster::{ClusterBus, ClusterTransport};
pub use nats::NatsTransport;
pub use redis::RedisTransport;

/// Which of the three adapter channels a payload arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub kind: MessageKind,
    pub payload: String,
}

/// Where a transport pushes everything it receives
pub type MessageSink = mpsc::UnboundedSender<TransportMessage>;

/// Names of the broadcast, request and response channels of one driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    pub broadcast: String,
    pub request: String,
    pub response: String,
}

impl ChannelNames {
    /// `<prefix>#<driver>-adapter` plus its `#comms#req` and `#comms#res` siblings
    #[must_use]
    pub fn new(driver: &str, prefix: &str) -> Self {
        let base = if prefix.is_empty() {
            format!("{driver}-adapter")
        } else {
            format!("{prefix}#{driver}-adapter")
        };
        Self {
            request: format!("{base}#comms#req"),
            response: format!("{base}#comms#res"),
            broadcast: base,
        }
    }

    #[must_use]
    pub fn kind_of(&self, channel: &str) -> Option<MessageKind> {
        if channel == self.request {
            Some(MessageKind::Request)
        } else if channel == self.response {
            Some(MessageKind::Response)
        } else if channel == self.broadcast {
            Some(MessageKind::Broadcast)
        } else {
            None
        }
    }

    #[must_use]
    pub fn name_of(&self, kind: MessageKind) -> &str {
        match kind {
            MessageKind::Request => &self.request,
            MessageKind::Response => &self.response,
            MessageKind::Broadcast => &self.broadcast,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (MessageKind, &str)> {
        [MessageKind::Request, MessageKind::Response, MessageKind::Broadcast]
            .into_iter()
            .map(move |kind| (kind, self.name_of(kind)))
    }
}

/// Backend contract used by the horizontal adapter
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect, subscribe to all three channels and start forwarding into `sink`.
    /// Failing here aborts startup.
    async fn init(&self, sink: MessageSink) -> Result<()>;

    async fn broadcast_to_channel(&self, channel: &str, payload: String) -> Result<()>;

    /// Number of nodes currently subscribed to the request channel, this one included
    async fn get_num_sub(&self) -> Result<usize>;

    async fn disconnect(&self) -> Result<()>;

    fn channels(&self) -> &ChannelNames;
}
