//! NATS backend
//!
//! Peers are counted either from the configured `nodes_number` or by pinging
//! `$SYS.REQ.SERVER.PING.CONNZ` and summing the connection totals every
//! server reports back.

use async_nats::{Client, ConnectOptions, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use pushline_core::config::NatsAdapterConfig;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ChannelNames, MessageKind, MessageSink, Transport, TransportMessage};
use crate::error::{Error, Result};

const CONNZ_SUBJECT: &str = "$SYS.REQ.SERVER.PING.CONNZ";

/// How long to wait for the first CONNZ reply
const FIRST_REPLY_WINDOW: Duration = Duration::from_millis(1000);

/// How long to keep listening after each further reply
const NEXT_REPLY_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
struct ConnzReply {
    data: ConnzData,
}

#[derive(Debug, Deserialize)]
struct ConnzData {
    #[serde(default)]
    total: usize,
}

fn nats_error(e: impl std::fmt::Display) -> Error {
    Error::Nats(e.to_string())
}

pub struct NatsTransport {
    config: NatsAdapterConfig,
    client: OnceCell<Client>,
    channels: ChannelNames,
    cancel_token: CancellationToken,
}

impl NatsTransport {
    #[must_use]
    pub fn new(config: &NatsAdapterConfig) -> Self {
        Self {
            channels: ChannelNames::new("nats", &config.prefix),
            config: config.clone(),
            client: OnceCell::new(),
            cancel_token: CancellationToken::new(),
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .get()
            .ok_or_else(|| Error::Transport("NATS transport is not initialized".to_string()))
    }

    fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new()
            .connection_timeout(Duration::from_millis(self.config.timeout_ms))
            .ping_interval(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&self.config.user, &self.config.pass) {
            options = options.user_and_password(user.clone(), pass.clone());
        }
        if let Some(token) = &self.config.token {
            options = options.token(token.clone());
        }
        options
    }

    /// Sum `data.total` over every CONNZ reply arriving within the collection windows
    async fn count_connections(client: &Client) -> Result<usize> {
        let inbox = client.new_inbox();
        let mut replies = client.subscribe(inbox.clone()).await.map_err(nats_error)?;
        client
            .publish_with_reply(CONNZ_SUBJECT, inbox, Bytes::new())
            .await
            .map_err(nats_error)?;

        let mut total = 0;
        let mut window = FIRST_REPLY_WINDOW;
        while let Ok(Some(reply)) = timeout(window, replies.next()).await {
            match serde_json::from_slice::<ConnzReply>(&reply.payload) {
                Ok(connz) => total += connz.data.total,
                Err(e) => debug!(error = %e, "Ignoring malformed CONNZ reply"),
            }
            window = NEXT_REPLY_WINDOW;
        }
        Ok(total)
    }
}

async fn forward(
    mut subscriber: Subscriber,
    kind: MessageKind,
    sink: MessageSink,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = subscriber.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let payload = match String::from_utf8(msg.payload.to_vec()) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, subject = %msg.subject, "Dropping non UTF-8 NATS payload");
                continue;
            }
        };
        if sink.send(TransportMessage { kind, payload }).is_err() {
            break;
        }
    }
    debug!(?kind, "NATS subscription closed");
}

#[async_trait]
impl Transport for NatsTransport {
    async fn init(&self, sink: MessageSink) -> Result<()> {
        let client = self
            .connect_options()
            .connect(self.config.servers.clone())
            .await
            .map_err(nats_error)?;

        for (kind, subject) in self.channels.iter() {
            let subscriber = client
                .subscribe(subject.to_string())
                .await
                .map_err(nats_error)?;
            tokio::spawn(forward(subscriber, kind, sink.clone(), self.cancel_token.clone()));
        }

        info!(servers = ?self.config.servers, channel = %self.channels.broadcast, "NATS transport connected");
        let _ = self.client.set(client);
        Ok(())
    }

    async fn broadcast_to_channel(&self, channel: &str, payload: String) -> Result<()> {
        self.client()?
            .publish(channel.to_string(), Bytes::from(payload))
            .await
            .map_err(nats_error)
    }

    async fn get_num_sub(&self) -> Result<usize> {
        if self.config.nodes_number > 0 {
            return Ok(self.config.nodes_number);
        }
        let total = Self::count_connections(self.client()?).await?;
        debug!(total, "Counted NATS connections");
        Ok(total)
    }

    async fn disconnect(&self) -> Result<()> {
        self.cancel_token.cancel();
        if let Some(client) = self.client.get() {
            client.flush().await.map_err(nats_error)?;
        }
        info!("NATS transport disconnected");
        Ok(())
    }

    fn channels(&self) -> &ChannelNames {
        &self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_static_node_count_skips_server() {
        let config = NatsAdapterConfig {
            nodes_number: 3,
            ..NatsAdapterConfig::default()
        };
        let transport = NatsTransport::new(&config);

        assert_eq!(transport.get_num_sub().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dynamic_count_requires_connection() {
        let transport = NatsTransport::new(&NatsAdapterConfig::default());

        assert!(matches!(transport.get_num_sub().await, Err(Error::Transport(_))));
    }

    #[test]
    fn test_connz_reply_decodes() {
        let raw = br#"{"server":{"name":"n1"},"data":{"now":"x","num_connections":2,"total":4}}"#;
        let reply: ConnzReply = serde_json::from_slice(raw).unwrap();

        assert_eq!(reply.data.total, 4);
    }

    #[tokio::test]
    #[ignore = "Requires NATS server"]
    async fn test_round_trip_against_server() {
        let transport = NatsTransport::new(&NatsAdapterConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.init(tx).await.unwrap();

        let broadcast = transport.channels().broadcast.clone();
        transport.broadcast_to_channel(&broadcast, "hello".to_string()).await.unwrap();

        let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.kind, MessageKind::Broadcast);
        assert_eq!(msg.payload, "hello");

        transport.disconnect().await.unwrap();
    }
}
