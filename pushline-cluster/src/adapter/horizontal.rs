//! Cluster-wide registry built from the local one plus a transport
//!
//! Reads are answered locally first. When the transport reports more than
//! one subscriber the query is published to every peer and their answers are
//! merged until all have replied or the request times out.
//!
//! ```text
//!           |--> node 1 --> local lookup --> response --|
//! node 0 ---|--> node 2 --> local lookup --> response --|--> node 0 merges
//!           |--> node 3 --> local lookup --> response --|
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pushline_core::metrics::MetricsSink;
use pushline_core::models::Socket;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::local::LocalAdapter;
use super::pending::{Accumulator, IssuedRequests, RequestTable};
use super::request::{BroadcastMessage, RequestBody, RequestOptions, RequestType, ResponseBody};
use super::Adapter;
use crate::error::{Error, Result};
use crate::transport::{MessageKind, Transport, TransportMessage};

/// Own request ids remembered for echo suppression
const ISSUED_REQUESTS_CAPACITY: usize = 1024;

pub struct HorizontalAdapter<T: Transport> {
    /// Origin tag of every message this node publishes
    uuid: String,
    local: LocalAdapter,
    transport: T,
    requests: Arc<RequestTable>,
    issued: IssuedRequests,
    requests_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
    cancel_token: CancellationToken,
}

impl<T: Transport> HorizontalAdapter<T> {
    pub fn new(transport: T, requests_timeout: Duration, metrics: Arc<dyn MetricsSink>) -> Arc<Self> {
        Arc::new(Self {
            uuid: Uuid::new_v4().to_string(),
            local: LocalAdapter::new(),
            transport,
            requests: Arc::new(RequestTable::new(Arc::clone(&metrics))),
            issued: IssuedRequests::new(ISSUED_REQUESTS_CAPACITY),
            requests_timeout,
            metrics,
            cancel_token: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn local(&self) -> &LocalAdapter {
        &self.local
    }

    /// Number of requests still waiting for peers
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Initialize the transport and start dispatching what it receives
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TransportMessage>();
        self.transport.init(tx).await?;

        let this = Arc::clone(self);
        let cancel = self.cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => this.dispatch(msg),
                        None => break,
                    },
                }
            }
            debug!(uuid = %this.uuid, "Adapter dispatcher stopped");
        });

        info!(
            uuid = %self.uuid,
            channel = %self.transport.channels().broadcast,
            "Horizontal adapter initialized"
        );
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, msg: TransportMessage) {
        match msg.kind {
            MessageKind::Broadcast => self.on_broadcast(&msg.payload),
            MessageKind::Response => self.on_response(&msg.payload),
            MessageKind::Request => {
                let request: RequestBody = match serde_json::from_str(&msg.payload) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(error = %e, "Dropping malformed request");
                        return;
                    }
                };
                // Our own request echoed back by the transport
                if self.issued.contains(&request.request_id) {
                    return;
                }
                let this = Arc::clone(self);
                tokio::spawn(async move { this.on_request(request).await });
            }
        }
    }

    fn on_broadcast(&self, payload: &str) {
        let message: BroadcastMessage = match serde_json::from_str(payload) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "Dropping malformed broadcast");
                return;
            }
        };
        if message.uuid == self.uuid
            || message.app_id.is_empty()
            || message.channel.is_empty()
            || message.data.is_empty()
        {
            return;
        }
        self.local.send(
            &message.app_id,
            &message.channel,
            &message.data,
            message.excepting_id.as_deref(),
        );
    }

    fn on_response(&self, payload: &str) {
        match serde_json::from_str::<ResponseBody>(payload) {
            Ok(response) if !response.request_id.is_empty() => {
                self.requests.on_response(response);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Dropping malformed response"),
        }
    }

    async fn on_request(&self, request: RequestBody) {
        debug!(
            request_id = %request.request_id,
            app_id = %request.app_id,
            kind = %request.kind,
            "Received request from another node"
        );

        let response = self.answer(&request);
        let body = match serde_json::to_string(&response) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, request_id = %request.request_id, "Failed to encode response");
                return;
            }
        };
        if let Err(e) = self
            .transport
            .broadcast_to_channel(&self.transport.channels().response, body)
            .await
        {
            warn!(error = %e, request_id = %request.request_id, "Failed to publish response");
            return;
        }
        self.metrics
            .mark_horizontal_adapter_request_received(&request.app_id);
    }

    /// Local answer to a peer's request, shaped for the wire
    fn answer(&self, request: &RequestBody) -> ResponseBody {
        let app_id = request.app_id.as_str();
        let mut response = ResponseBody::empty(&request.request_id);

        match request.kind {
            RequestType::Sockets => {
                response.sockets = Some(self.local.sockets(app_id).into_values().collect());
            }
            RequestType::ChannelSockets => {
                response.sockets = Some(
                    self.local
                        .channel_sockets(app_id, request.channel())
                        .into_values()
                        .collect(),
                );
            }
            RequestType::Channels => {
                response.channels = Some(
                    self.local
                        .channels(app_id)
                        .into_iter()
                        .map(|(channel, ids)| (channel, ids.into_iter().collect()))
                        .collect(),
                );
            }
            RequestType::ChannelsWithSocketsCount => {
                response.channels_with_sockets_count =
                    Some(self.local.channels_with_sockets_count(app_id).into_iter().collect());
            }
            RequestType::ChannelMembers => {
                response.members = Some(
                    self.local
                        .channel_members(app_id, request.channel())
                        .into_iter()
                        .collect(),
                );
            }
            RequestType::SocketsCount => {
                response.total_count = Some(self.local.sockets_count(app_id));
            }
            RequestType::ChannelMembersCount => {
                response.total_count = Some(self.local.channel_members_count(app_id, request.channel()));
            }
            RequestType::ChannelSocketsCount => {
                response.total_count = Some(self.local.channel_sockets_count(app_id, request.channel()));
            }
            RequestType::SocketExistsInChannel => {
                response.exists =
                    Some(self.local.is_in_channel(app_id, request.channel(), request.ws_id()));
            }
            RequestType::TerminateUserConnections => {
                self.local.terminate_user_connections(app_id, request.user_id());
            }
        }
        response
    }

    /// Peer count, or `None` when the query should stay local
    async fn peers(&self, app_id: &str) -> Option<usize> {
        match self.transport.get_num_sub().await {
            Ok(num_sub) if num_sub > 1 => Some(num_sub),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, app_id, "Could not count subscribers, answering locally");
                None
            }
        }
    }

    /// Publish a request seeded with `local` and wait for the merged result
    async fn scatter(
        &self,
        app_id: &str,
        kind: RequestType,
        opts: Option<RequestOptions>,
        local: Accumulator,
    ) -> Result<Accumulator> {
        let Some(num_sub) = self.peers(app_id).await else {
            return Ok(local);
        };

        let request_id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(&RequestBody {
            request_id: request_id.clone(),
            app_id: app_id.to_string(),
            kind,
            opts,
        })?;

        self.issued.record(&request_id);
        let resolution = self.requests.open(
            &request_id,
            app_id,
            kind,
            num_sub,
            local,
            self.requests_timeout,
        );

        match self
            .transport
            .broadcast_to_channel(&self.transport.channels().request, body)
            .await
        {
            Ok(()) => {
                self.metrics.mark_horizontal_adapter_request_sent(app_id);
                debug!(%request_id, app_id, %kind, num_sub, "Sent request to other nodes");
            }
            Err(e) => {
                warn!(error = %e, %request_id, app_id, %kind, "Failed to publish request, answering locally");
                self.requests.force_resolve(&request_id);
            }
        }

        let resolution = resolution
            .await
            .map_err(|_| Error::RequestDropped(request_id))?;
        Ok(resolution.value)
    }
}

#[async_trait]
impl<T: Transport> Adapter for HorizontalAdapter<T> {
    async fn add_socket(&self, app_id: &str, socket: Socket) -> bool {
        self.local.add_socket(app_id, socket)
    }

    async fn remove_socket(&self, app_id: &str, socket_id: &str) -> bool {
        self.local.remove_socket(app_id, socket_id)
    }

    async fn add_to_channel(&self, app_id: &str, channel: &str, socket: &Socket) -> usize {
        self.local.add_to_channel(app_id, channel, socket)
    }

    async fn remove_from_channel(&self, app_id: &str, channel: &str, socket_id: &str) -> usize {
        self.local.remove_from_channel(app_id, channel, socket_id)
    }

    async fn remove_from_channels(&self, app_id: &str, channels: &[String], socket_id: &str) {
        self.local.remove_from_channels(app_id, channels, socket_id);
    }

    async fn get_sockets(&self, app_id: &str, only_local: bool) -> Result<HashMap<String, Socket>> {
        let local = self.local.sockets(app_id);
        if only_local {
            return Ok(local);
        }
        self.scatter(app_id, RequestType::Sockets, None, Accumulator::Sockets(local))
            .await
            .map(Accumulator::into_sockets)
    }

    async fn get_sockets_count(&self, app_id: &str, only_local: bool) -> Result<usize> {
        let local = self.local.sockets_count(app_id);
        if only_local {
            return Ok(local);
        }
        self.scatter(app_id, RequestType::SocketsCount, None, Accumulator::Count(local))
            .await
            .map(|acc| acc.count())
    }

    async fn get_channels(
        &self,
        app_id: &str,
        only_local: bool,
    ) -> Result<HashMap<String, HashSet<String>>> {
        let local = self.local.channels(app_id);
        if only_local {
            return Ok(local);
        }
        self.scatter(app_id, RequestType::Channels, None, Accumulator::Channels(local))
            .await
            .map(Accumulator::into_channels)
    }

    async fn get_channels_with_sockets_count(
        &self,
        app_id: &str,
        only_local: bool,
    ) -> Result<HashMap<String, usize>> {
        let local = self.local.channels_with_sockets_count(app_id);
        if only_local {
            return Ok(local);
        }
        self.scatter(
            app_id,
            RequestType::ChannelsWithSocketsCount,
            None,
            Accumulator::ChannelsWithCount(local),
        )
        .await
        .map(Accumulator::into_channels_with_count)
    }

    async fn get_channel_sockets(
        &self,
        app_id: &str,
        channel: &str,
        only_local: bool,
    ) -> Result<HashMap<String, Socket>> {
        let local = self.local.channel_sockets(app_id, channel);
        if only_local {
            return Ok(local);
        }
        self.scatter(
            app_id,
            RequestType::ChannelSockets,
            Some(RequestOptions::channel(channel)),
            Accumulator::Sockets(local),
        )
        .await
        .map(Accumulator::into_sockets)
    }

    async fn get_channel_sockets_count(
        &self,
        app_id: &str,
        channel: &str,
        only_local: bool,
    ) -> Result<usize> {
        let local = self.local.channel_sockets_count(app_id, channel);
        if only_local {
            return Ok(local);
        }
        self.scatter(
            app_id,
            RequestType::ChannelSocketsCount,
            Some(RequestOptions::channel(channel)),
            Accumulator::Count(local),
        )
        .await
        .map(|acc| acc.count())
    }

    async fn get_channel_members(
        &self,
        app_id: &str,
        channel: &str,
        only_local: bool,
    ) -> Result<HashMap<String, Value>> {
        let local = self.local.channel_members(app_id, channel);
        if only_local {
            return Ok(local);
        }
        self.scatter(
            app_id,
            RequestType::ChannelMembers,
            Some(RequestOptions::channel(channel)),
            Accumulator::Members(local),
        )
        .await
        .map(Accumulator::into_members)
    }

    async fn get_channel_members_count(
        &self,
        app_id: &str,
        channel: &str,
        only_local: bool,
    ) -> Result<usize> {
        let local = self.local.channel_members_count(app_id, channel);
        if only_local {
            return Ok(local);
        }
        self.scatter(
            app_id,
            RequestType::ChannelMembersCount,
            Some(RequestOptions::channel(channel)),
            Accumulator::Count(local),
        )
        .await
        .map(|acc| acc.count())
    }

    async fn is_in_channel(
        &self,
        app_id: &str,
        channel: &str,
        socket_id: &str,
        only_local: bool,
    ) -> Result<bool> {
        let exists = self.local.is_in_channel(app_id, channel, socket_id);
        if only_local || exists {
            return Ok(exists);
        }
        let opts = RequestOptions {
            channel: Some(channel.to_string()),
            ws_id: Some(socket_id.to_string()),
            user_id: None,
        };
        self.scatter(
            app_id,
            RequestType::SocketExistsInChannel,
            Some(opts),
            Accumulator::Exists(false),
        )
        .await
        .map(|acc| acc.exists())
    }

    async fn send(&self, app_id: &str, channel: &str, data: &str, except: Option<&str>) {
        // Peers drop empty broadcasts, so nobody gets one
        if data.is_empty() {
            debug!(app_id, channel, "Dropping empty message");
            return;
        }
        self.local.send(app_id, channel, data, except);

        let message = BroadcastMessage {
            uuid: self.uuid.clone(),
            app_id: app_id.to_string(),
            channel: channel.to_string(),
            data: data.to_string(),
            excepting_id: except.map(str::to_string),
        };
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, app_id, channel, "Failed to encode broadcast");
                return;
            }
        };
        if let Err(e) = self
            .transport
            .broadcast_to_channel(&self.transport.channels().broadcast, payload)
            .await
        {
            warn!(error = %e, app_id, channel, "Failed to publish broadcast");
        }
    }

    async fn terminate_user_connections(&self, app_id: &str, user_id: &str) {
        self.local.terminate_user_connections(app_id, user_id);

        let Some(num_sub) = self.peers(app_id).await else {
            return;
        };
        let request_id = Uuid::new_v4().to_string();
        let body = RequestBody {
            request_id: request_id.clone(),
            app_id: app_id.to_string(),
            kind: RequestType::TerminateUserConnections,
            opts: Some(RequestOptions {
                user_id: Some(user_id.to_string()),
                ..RequestOptions::default()
            }),
        };
        let payload = match serde_json::to_string(&body) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, app_id, "Failed to encode terminate request");
                return;
            }
        };

        // Nobody waits on the result
        self.issued.record(&request_id);
        drop(self.requests.open(
            &request_id,
            app_id,
            RequestType::TerminateUserConnections,
            num_sub,
            Accumulator::Ack,
            self.requests_timeout,
        ));

        match self
            .transport
            .broadcast_to_channel(&self.transport.channels().request, payload)
            .await
        {
            Ok(()) => self.metrics.mark_horizontal_adapter_request_sent(app_id),
            Err(e) => {
                warn!(error = %e, app_id, user_id, "Failed to publish terminate request");
                self.requests.force_resolve(&request_id);
            }
        }
    }

    async fn add_user(&self, socket: &Socket) {
        self.local.add_user(socket);
    }

    async fn remove_user(&self, socket: &Socket) {
        self.local.remove_user(socket);
    }

    async fn get_user_sockets(&self, app_id: &str, user_id: &str) -> Vec<Socket> {
        self.local.user_sockets(app_id, user_id)
    }

    async fn clear_namespace(&self, app_id: &str) {
        self.local.clear_namespace(app_id);
    }

    async fn clear_namespaces(&self) {
        self.local.clear_namespaces();
    }

    fn namespace_ids(&self) -> Vec<String> {
        self.local.namespace_ids()
    }

    fn local_sockets(&self, app_id: &str) -> Vec<Socket> {
        self.local.sockets(app_id).into_values().collect()
    }

    async fn disconnect(&self) -> Result<()> {
        self.cancel_token.cancel();
        self.requests.clear();
        self.issued.clear();
        self.transport.disconnect().await
    }
}
