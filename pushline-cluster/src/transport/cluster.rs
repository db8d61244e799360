//! In-process discovery group
//!
//! Nodes sharing a [`ClusterBus`] see each other directly. Delivery includes
//! the publisher, and the subscriber count is the number of distinct nodes
//! joined to the request topic.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChannelNames, MessageKind, MessageSink, Transport, TransportMessage};
use crate::error::{Error, Result};

static PROCESS_GROUP: LazyLock<ClusterBus> = LazyLock::new(ClusterBus::new);

struct Member {
    node: Uuid,
    kind: MessageKind,
    sink: MessageSink,
}

#[derive(Clone, Default)]
pub struct ClusterBus {
    topics: Arc<RwLock<HashMap<String, Vec<Member>>>>,
}

impl ClusterBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Group shared by every adapter of this process
    #[must_use]
    pub fn process_group() -> Self {
        PROCESS_GROUP.clone()
    }

    fn join(&self, topic: &str, node: Uuid, kind: MessageKind, sink: MessageSink) {
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Member { node, kind, sink });
    }

    fn leave(&self, node: Uuid) {
        self.topics.write().retain(|_, members| {
            members.retain(|m| m.node != node);
            !members.is_empty()
        });
    }

    /// Deliver to every member of `topic`. Returns how many members received it.
    fn publish(&self, topic: &str, payload: &str) -> usize {
        let mut topics = self.topics.write();
        let Some(members) = topics.get_mut(topic) else {
            return 0;
        };
        members.retain(|m| {
            m.sink
                .send(TransportMessage {
                    kind: m.kind,
                    payload: payload.to_string(),
                })
                .is_ok()
        });
        members.len()
    }

    fn node_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, |members| {
            members.iter().map(|m| m.node).collect::<HashSet<_>>().len()
        })
    }
}

pub struct ClusterTransport {
    bus: ClusterBus,
    node: Uuid,
    channels: ChannelNames,
}

impl ClusterTransport {
    #[must_use]
    pub fn new(bus: ClusterBus, prefix: &str) -> Self {
        Self {
            bus,
            node: Uuid::new_v4(),
            channels: ChannelNames::new("cluster", prefix),
        }
    }
}

#[async_trait]
impl Transport for ClusterTransport {
    async fn init(&self, sink: MessageSink) -> Result<()> {
        for (kind, topic) in self.channels.iter() {
            self.bus.join(topic, self.node, kind, sink.clone());
        }
        info!(node = %self.node, channel = %self.channels.broadcast, "Joined cluster discovery group");
        Ok(())
    }

    async fn broadcast_to_channel(&self, channel: &str, payload: String) -> Result<()> {
        if self.channels.kind_of(channel).is_none() {
            return Err(Error::Transport(format!("unknown channel {channel}")));
        }
        let delivered = self.bus.publish(channel, &payload);
        debug!(channel, delivered, "Published to cluster group");
        Ok(())
    }

    async fn get_num_sub(&self) -> Result<usize> {
        Ok(self.bus.node_count(&self.channels.request))
    }

    async fn disconnect(&self) -> Result<()> {
        self.bus.leave(self.node);
        Ok(())
    }

    fn channels(&self) -> &ChannelNames {
        &self.channels
    }
}
