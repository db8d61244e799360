//! Registry access for the protocol layer, either node-local or cluster-wide

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use pushline_core::config::{AdapterConfig, AdapterDriver};
use pushline_core::metrics::MetricsSink;
use pushline_core::models::Socket;
use serde_json::Value;
use tracing::info;

use crate::error::Result;
use crate::transport::{ClusterBus, ClusterTransport, NatsTransport, RedisTransport, Transport};

pub mod horizontal;
pub mod local;
pub mod namespace;
pub mod pending;
pub mod request;

pub use horizontal::HorizontalAdapter;
pub use local::{LocalAdapter, USER_CHANNEL_PREFIX};
pub use namespace::Namespace;
pub use request::{BroadcastMessage, RequestBody, RequestOptions, RequestType, ResponseBody};

/// Every registry operation the protocol and HTTP layers rely on
///
/// Reads take `only_local` to skip the cluster round trip.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn add_socket(&self, app_id: &str, socket: Socket) -> bool;

    async fn remove_socket(&self, app_id: &str, socket_id: &str) -> bool;

    /// Returns the channel's connection count after joining
    async fn add_to_channel(&self, app_id: &str, channel: &str, socket: &Socket) -> usize;

    /// Returns the channel's remaining connection count
    async fn remove_from_channel(&self, app_id: &str, channel: &str, socket_id: &str) -> usize;

    async fn remove_from_channels(&self, app_id: &str, channels: &[String], socket_id: &str);

    async fn get_sockets(&self, app_id: &str, only_local: bool) -> Result<HashMap<String, Socket>>;

    async fn get_sockets_count(&self, app_id: &str, only_local: bool) -> Result<usize>;

    async fn get_channels(
        &self,
        app_id: &str,
        only_local: bool,
    ) -> Result<HashMap<String, HashSet<String>>>;

    async fn get_channels_with_sockets_count(
        &self,
        app_id: &str,
        only_local: bool,
    ) -> Result<HashMap<String, usize>>;

    async fn get_channel_sockets(
        &self,
        app_id: &str,
        channel: &str,
        only_local: bool,
    ) -> Result<HashMap<String, Socket>>;

    async fn get_channel_sockets_count(
        &self,
        app_id: &str,
        channel: &str,
        only_local: bool,
    ) -> Result<usize>;

    async fn get_channel_members(
        &self,
        app_id: &str,
        channel: &str,
        only_local: bool,
    ) -> Result<HashMap<String, Value>>;

    async fn get_channel_members_count(
        &self,
        app_id: &str,
        channel: &str,
        only_local: bool,
    ) -> Result<usize>;

    async fn is_in_channel(
        &self,
        app_id: &str,
        channel: &str,
        socket_id: &str,
        only_local: bool,
    ) -> Result<bool>;

    /// Deliver `data` to a channel on every node, skipping `except`
    async fn send(&self, app_id: &str, channel: &str, data: &str, except: Option<&str>);

    async fn terminate_user_connections(&self, app_id: &str, user_id: &str);

    async fn add_user(&self, socket: &Socket);

    async fn remove_user(&self, socket: &Socket);

    async fn get_user_sockets(&self, app_id: &str, user_id: &str) -> Vec<Socket>;

    async fn clear_namespace(&self, app_id: &str);

    async fn clear_namespaces(&self);

    /// Apps with a namespace on this node
    fn namespace_ids(&self) -> Vec<String>;

    /// Sockets connected to this node, never asking peers
    fn local_sockets(&self, app_id: &str) -> Vec<Socket>;

    async fn disconnect(&self) -> Result<()>;
}

#[async_trait]
impl Adapter for LocalAdapter {
    async fn add_socket(&self, app_id: &str, socket: Socket) -> bool {
        Self::add_socket(self, app_id, socket)
    }

    async fn remove_socket(&self, app_id: &str, socket_id: &str) -> bool {
        Self::remove_socket(self, app_id, socket_id)
    }

    async fn add_to_channel(&self, app_id: &str, channel: &str, socket: &Socket) -> usize {
        Self::add_to_channel(self, app_id, channel, socket)
    }

    async fn remove_from_channel(&self, app_id: &str, channel: &str, socket_id: &str) -> usize {
        Self::remove_from_channel(self, app_id, channel, socket_id)
    }

    async fn remove_from_channels(&self, app_id: &str, channels: &[String], socket_id: &str) {
        Self::remove_from_channels(self, app_id, channels, socket_id);
    }

    async fn get_sockets(&self, app_id: &str, _only_local: bool) -> Result<HashMap<String, Socket>> {
        Ok(self.sockets(app_id))
    }

    async fn get_sockets_count(&self, app_id: &str, _only_local: bool) -> Result<usize> {
        Ok(self.sockets_count(app_id))
    }

    async fn get_channels(
        &self,
        app_id: &str,
        _only_local: bool,
    ) -> Result<HashMap<String, HashSet<String>>> {
        Ok(self.channels(app_id))
    }

    async fn get_channels_with_sockets_count(
        &self,
        app_id: &str,
        _only_local: bool,
    ) -> Result<HashMap<String, usize>> {
        Ok(self.channels_with_sockets_count(app_id))
    }

    async fn get_channel_sockets(
        &self,
        app_id: &str,
        channel: &str,
        _only_local: bool,
    ) -> Result<HashMap<String, Socket>> {
        Ok(self.channel_sockets(app_id, channel))
    }

    async fn get_channel_sockets_count(
        &self,
        app_id: &str,
        channel: &str,
        _only_local: bool,
    ) -> Result<usize> {
        Ok(self.channel_sockets_count(app_id, channel))
    }

    async fn get_channel_members(
        &self,
        app_id: &str,
        channel: &str,
        _only_local: bool,
    ) -> Result<HashMap<String, Value>> {
        Ok(self.channel_members(app_id, channel))
    }

    async fn get_channel_members_count(
        &self,
        app_id: &str,
        channel: &str,
        _only_local: bool,
    ) -> Result<usize> {
        Ok(self.channel_members_count(app_id, channel))
    }

    async fn is_in_channel(
        &self,
        app_id: &str,
        channel: &str,
        socket_id: &str,
        _only_local: bool,
    ) -> Result<bool> {
        Ok(Self::is_in_channel(self, app_id, channel, socket_id))
    }

    async fn send(&self, app_id: &str, channel: &str, data: &str, except: Option<&str>) {
        Self::send(self, app_id, channel, data, except);
    }

    async fn terminate_user_connections(&self, app_id: &str, user_id: &str) {
        Self::terminate_user_connections(self, app_id, user_id);
    }

    async fn add_user(&self, socket: &Socket) {
        Self::add_user(self, socket);
    }

    async fn remove_user(&self, socket: &Socket) {
        Self::remove_user(self, socket);
    }

    async fn get_user_sockets(&self, app_id: &str, user_id: &str) -> Vec<Socket> {
        self.user_sockets(app_id, user_id)
    }

    async fn clear_namespace(&self, app_id: &str) {
        Self::clear_namespace(self, app_id);
    }

    async fn clear_namespaces(&self) {
        Self::clear_namespaces(self);
    }

    fn namespace_ids(&self) -> Vec<String> {
        Self::namespace_ids(self)
    }

    fn local_sockets(&self, app_id: &str) -> Vec<Socket> {
        self.sockets(app_id).into_values().collect()
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

async fn start<T: Transport>(
    transport: T,
    config: &AdapterConfig,
    metrics: Arc<dyn MetricsSink>,
) -> Result<Arc<dyn Adapter>> {
    let adapter = HorizontalAdapter::new(transport, config.requests_timeout(), metrics);
    adapter.init().await?;
    Ok(adapter)
}

/// Build and initialize the adapter selected by `config.driver`
///
/// `bus` is the discovery group used by the `cluster` driver; other drivers
/// ignore it. Transport failures here are fatal to startup.
pub async fn build_adapter(
    config: &AdapterConfig,
    node_id: &str,
    metrics: Arc<dyn MetricsSink>,
    bus: &ClusterBus,
) -> Result<Arc<dyn Adapter>> {
    info!(node_id, driver = %config.driver, "Building adapter");

    match config.driver {
        AdapterDriver::Local => Ok(Arc::new(LocalAdapter::new())),
        AdapterDriver::Cluster => {
            let transport = ClusterTransport::new(bus.clone(), &config.cluster.prefix);
            start(transport, config, metrics).await
        }
        AdapterDriver::Redis => {
            let transport = RedisTransport::new(&config.redis)?;
            start(transport, config, metrics).await
        }
        AdapterDriver::Nats => {
            let transport = NatsTransport::new(&config.nats);
            start(transport, config, metrics).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushline_core::metrics::NoopMetrics;

    #[tokio::test]
    async fn test_local_driver_answers_locally() {
        let config = AdapterConfig::default();
        let adapter = build_adapter(&config, "n1", Arc::new(NoopMetrics), &ClusterBus::new())
            .await
            .unwrap();

        adapter.add_to_channel("app", "chat", &Socket::new("1.1", "app")).await;

        assert_eq!(adapter.get_sockets_count("app", false).await.unwrap(), 1);
        assert!(adapter.is_in_channel("app", "chat", "1.1", false).await.unwrap());
        assert_eq!(adapter.namespace_ids(), vec!["app".to_string()]);
    }

    #[tokio::test]
    async fn test_cluster_driver_joins_bus() {
        let config = AdapterConfig {
            driver: AdapterDriver::Cluster,
            ..AdapterConfig::default()
        };
        let bus = ClusterBus::new();
        let first = build_adapter(&config, "n1", Arc::new(NoopMetrics), &bus).await.unwrap();
        let second = build_adapter(&config, "n2", Arc::new(NoopMetrics), &bus).await.unwrap();

        second.add_socket("app", Socket::new("2.1", "app")).await;
        assert_eq!(first.get_sockets_count("app", false).await.unwrap(), 1);
        assert_eq!(first.get_sockets_count("app", true).await.unwrap(), 0);

        first.disconnect().await.unwrap();
        second.disconnect().await.unwrap();
    }
}
