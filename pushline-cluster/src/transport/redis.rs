//! Redis pub/sub backend
//!
//! One multiplexed connection publishes and runs `PUBSUB NUMSUB`, a separate
//! pub/sub connection listens on the three adapter channels. The first
//! subscribe must succeed; later disconnects are retried with backoff.

use async_trait::async_trait;
use futures::StreamExt;
use pushline_core::config::RedisAdapterConfig;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, Client as RedisClient};
use tokio::sync::OnceCell;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ChannelNames, MessageSink, Transport, TransportMessage};
use crate::error::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

pub struct RedisTransport {
    client: RedisClient,
    /// Every shard queried for subscriber counts in cluster mode
    shard_clients: Vec<RedisClient>,
    publisher: OnceCell<MultiplexedConnection>,
    shards: OnceCell<Vec<MultiplexedConnection>>,
    channels: ChannelNames,
    cancel_token: CancellationToken,
}

impl RedisTransport {
    pub fn new(config: &RedisAdapterConfig) -> Result<Self> {
        let primary = if config.cluster_mode {
            config
                .cluster_nodes
                .first()
                .ok_or_else(|| Error::Configuration("cluster_mode without cluster_nodes".to_string()))?
        } else {
            &config.url
        };
        let client = RedisClient::open(primary.as_str())?;

        let shard_clients = if config.cluster_mode {
            config
                .cluster_nodes
                .iter()
                .map(|url| RedisClient::open(url.as_str()))
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };

        Ok(Self {
            client,
            shard_clients,
            publisher: OnceCell::new(),
            shards: OnceCell::new(),
            channels: ChannelNames::new("redis", &config.prefix),
            cancel_token: CancellationToken::new(),
        })
    }

    fn publisher(&self) -> Result<MultiplexedConnection> {
        self.publisher
            .get()
            .cloned()
            .ok_or_else(|| Error::Transport("Redis transport is not initialized".to_string()))
    }

    async fn numsub(conn: &mut MultiplexedConnection, channel: &str) -> Result<usize> {
        let (_, count): (String, usize) = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            redis::cmd("PUBSUB")
                .arg("NUMSUB")
                .arg(channel)
                .query_async(conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis PUBSUB NUMSUB timed out".to_string()))??;
        Ok(count)
    }
}

async fn connect(client: &RedisClient) -> Result<MultiplexedConnection> {
    timeout(
        Duration::from_secs(REDIS_TIMEOUT_SECS),
        client.get_multiplexed_async_connection(),
    )
    .await
    .map_err(|_| Error::Timeout("Timed out connecting to Redis".to_string()))?
    .map_err(Error::from)
}

async fn subscribe(client: &RedisClient, channels: &ChannelNames) -> Result<PubSub> {
    let mut pubsub = timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), client.get_async_pubsub())
        .await
        .map_err(|_| Error::Timeout("Timed out getting Redis Pub/Sub connection".to_string()))??;

    let names: Vec<&str> = channels.iter().map(|(_, name)| name).collect();
    timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), pubsub.subscribe(&names))
        .await
        .map_err(|_| Error::Timeout("Timed out subscribing to adapter channels".to_string()))??;

    Ok(pubsub)
}

/// Why a subscriber session ended
enum SubscriberExit {
    /// The stream ended after a healthy session; reset the backoff
    Disconnected,
    /// The sink is gone or shutdown was requested
    Stopped,
}

async fn forward(
    pubsub: PubSub,
    channels: &ChannelNames,
    sink: &MessageSink,
    cancel: &CancellationToken,
) -> SubscriberExit {
    let mut stream = pubsub.into_on_message();
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => return SubscriberExit::Stopped,
            msg = stream.next() => match msg {
                Some(msg) => msg,
                None => return SubscriberExit::Disconnected,
            },
        };

        let channel = msg.get_channel_name();
        let Some(kind) = channels.kind_of(channel) else {
            continue;
        };
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, channel, "Dropping undecodable Redis payload");
                continue;
            }
        };
        if sink.send(TransportMessage { kind, payload }).is_err() {
            return SubscriberExit::Stopped;
        }
    }
}

/// Keep a subscriber alive until cancelled, reconnecting with exponential backoff
async fn run_subscriber(
    client: RedisClient,
    channels: ChannelNames,
    sink: MessageSink,
    cancel: CancellationToken,
    first: PubSub,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    let mut session = Some(first);

    loop {
        if let Some(pubsub) = session.take() {
            match forward(pubsub, &channels, &sink, &cancel).await {
                SubscriberExit::Stopped => {
                    info!("Redis subscriber stopped");
                    return;
                }
                SubscriberExit::Disconnected => {
                    error!(
                        "Redis subscriber stream ended (connection lost), reconnecting after {}s",
                        INITIAL_BACKOFF_SECS
                    );
                    backoff_secs = INITIAL_BACKOFF_SECS;
                }
            }
        }

        tokio::select! {
            () = cancel.cancelled() => {
                info!("Redis subscriber task cancelled during backoff");
                return;
            }
            () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
        }

        match subscribe(&client, &channels).await {
            Ok(pubsub) => {
                info!(channel = %channels.broadcast, "Redis subscriber reconnected");
                session = Some(pubsub);
            }
            Err(e) => {
                error!(
                    error = %e,
                    backoff_secs,
                    "Redis subscriber failed to connect, retrying after backoff"
                );
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn init(&self, sink: MessageSink) -> Result<()> {
        let publisher = connect(&self.client).await?;
        // A second init keeps the first connection
        let _ = self.publisher.set(publisher);

        if !self.shard_clients.is_empty() {
            let mut shards = Vec::with_capacity(self.shard_clients.len());
            for client in &self.shard_clients {
                shards.push(connect(client).await?);
            }
            let _ = self.shards.set(shards);
        }

        let first = subscribe(&self.client, &self.channels).await?;
        info!(channel = %self.channels.broadcast, "Redis subscriber connected");

        tokio::spawn(run_subscriber(
            self.client.clone(),
            self.channels.clone(),
            sink,
            self.cancel_token.clone(),
            first,
        ));
        Ok(())
    }

    async fn broadcast_to_channel(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.publisher()?;
        let receivers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(channel, payload),
        )
        .await
        .map_err(|_| Error::Timeout("Timed out publishing to Redis".to_string()))??;
        debug!(channel, receivers, "Published to Redis");
        Ok(())
    }

    async fn get_num_sub(&self) -> Result<usize> {
        let Some(shards) = self.shards.get() else {
            let mut conn = self.publisher()?;
            return Self::numsub(&mut conn, &self.channels.request).await;
        };

        let mut total = 0;
        for shard in shards {
            let mut conn = shard.clone();
            match Self::numsub(&mut conn, &self.channels.request).await {
                Ok(count) => total += count,
                Err(e) => warn!(error = %e, "Skipping Redis shard in subscriber count"),
            }
        }
        debug!(total, "Counted subscribers across Redis cluster");
        Ok(total)
    }

    async fn disconnect(&self) -> Result<()> {
        info!("Shutting down Redis transport");
        self.cancel_token.cancel();
        Ok(())
    }

    fn channels(&self) -> &ChannelNames {
        &self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageKind;
    use tokio::sync::mpsc;

    #[test]
    fn test_cluster_mode_needs_nodes() {
        let config = RedisAdapterConfig {
            cluster_mode: true,
            ..RedisAdapterConfig::default()
        };
        assert!(matches!(RedisTransport::new(&config), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_prefixed_channels() {
        let config = RedisAdapterConfig {
            prefix: "staging".to_string(),
            ..RedisAdapterConfig::default()
        };
        let transport = RedisTransport::new(&config).unwrap();

        assert_eq!(transport.channels().request, "staging#redis-adapter#comms#req");
    }

    #[tokio::test]
    async fn test_publish_before_init_fails() {
        let transport = RedisTransport::new(&RedisAdapterConfig::default()).unwrap();
        let result = transport.broadcast_to_channel("redis-adapter", "{}".to_string()).await;

        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_round_trip_against_server() {
        let transport = RedisTransport::new(&RedisAdapterConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.init(tx).await.unwrap();

        assert!(transport.get_num_sub().await.unwrap() >= 1);

        let request = transport.channels().request.clone();
        transport.broadcast_to_channel(&request, "hello".to_string()).await.unwrap();

        let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.kind, MessageKind::Request);
        assert_eq!(msg.payload, "hello");

        transport.disconnect().await.unwrap();
    }
}
