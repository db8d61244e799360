//! In-flight scatter-gather requests and the per-kind merge rules
//!
//! A request is opened with this node's own answer already folded in
//! (`msg_count = 1`). Every peer response bumps the count and runs the
//! kind's combinator. The request resolves once `num_sub` answers are in,
//! or its timer fires first and it resolves with whatever arrived.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use pushline_core::metrics::MetricsSink;
use pushline_core::models::Socket;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use super::request::{RequestType, ResponseBody};

/// Partial result of one request, shaped by its kind
#[derive(Debug, Clone)]
pub enum Accumulator {
    Sockets(HashMap<String, Socket>),
    Channels(HashMap<String, HashSet<String>>),
    ChannelsWithCount(HashMap<String, usize>),
    Members(HashMap<String, Value>),
    Count(usize),
    Exists(bool),
    Ack,
}

impl Accumulator {
    /// Fold one peer response into the partial result
    pub fn combine(&mut self, response: ResponseBody) {
        match self {
            Self::Sockets(sockets) => {
                for socket in response.sockets.into_iter().flatten() {
                    sockets.entry(socket.id.clone()).or_insert(socket);
                }
            }
            Self::Channels(channels) => {
                for (channel, ids) in response.channels.into_iter().flatten() {
                    channels.entry(channel).or_default().extend(ids);
                }
            }
            Self::ChannelsWithCount(counts) => {
                for (channel, count) in response.channels_with_sockets_count.into_iter().flatten() {
                    *counts.entry(channel).or_default() += count;
                }
            }
            Self::Members(members) => {
                for (user_id, info) in response.members.into_iter().flatten() {
                    members.entry(user_id).or_insert(info);
                }
            }
            Self::Count(total) => *total += response.total_count.unwrap_or(0),
            Self::Exists(exists) => *exists |= response.exists.unwrap_or(false),
            Self::Ack => {}
        }
    }

    #[must_use]
    pub fn into_sockets(self) -> HashMap<String, Socket> {
        match self {
            Self::Sockets(sockets) => sockets,
            _ => HashMap::new(),
        }
    }

    #[must_use]
    pub fn into_channels(self) -> HashMap<String, HashSet<String>> {
        match self {
            Self::Channels(channels) => channels,
            _ => HashMap::new(),
        }
    }

    #[must_use]
    pub fn into_channels_with_count(self) -> HashMap<String, usize> {
        match self {
            Self::ChannelsWithCount(counts) => counts,
            _ => HashMap::new(),
        }
    }

    #[must_use]
    pub fn into_members(self) -> HashMap<String, Value> {
        match self {
            Self::Members(members) => members,
            _ => HashMap::new(),
        }
    }

    #[must_use]
    pub const fn count(&self) -> usize {
        match self {
            Self::Count(total) => *total,
            _ => 0,
        }
    }

    #[must_use]
    pub const fn exists(&self) -> bool {
        matches!(self, Self::Exists(true))
    }
}

/// Final value handed back to the caller
#[derive(Debug)]
pub struct Resolution {
    pub value: Accumulator,
    /// The timer fired before every peer answered
    pub forced: bool,
}

struct PendingRequest {
    app_id: String,
    kind: RequestType,
    num_sub: usize,
    msg_count: usize,
    created_at: Instant,
    accumulator: Accumulator,
    resolver: oneshot::Sender<Resolution>,
    timer: Option<AbortHandle>,
}

/// Requests issued by this node, keyed by request id
pub struct RequestTable {
    requests: DashMap<String, PendingRequest>,
    metrics: Arc<dyn MetricsSink>,
}

impl RequestTable {
    #[must_use]
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            requests: DashMap::new(),
            metrics,
        }
    }

    /// Register a request seeded with the local answer and arm its timer
    pub fn open(
        self: &Arc<Self>,
        request_id: &str,
        app_id: &str,
        kind: RequestType,
        num_sub: usize,
        local: Accumulator,
        timeout: Duration,
    ) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        self.requests.insert(
            request_id.to_string(),
            PendingRequest {
                app_id: app_id.to_string(),
                kind,
                num_sub,
                msg_count: 1,
                created_at: Instant::now(),
                accumulator: local,
                resolver: tx,
                timer: None,
            },
        );

        let table = Arc::downgrade(self);
        let id = request_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.force_resolve(&id);
            }
        });

        match self.requests.get_mut(request_id) {
            Some(mut pending) => pending.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }

        rx
    }

    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.requests.contains_key(request_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Fold a peer response. Responses for unknown ids are dropped.
    /// Returns true when this response completed the request.
    pub fn on_response(&self, response: ResponseBody) -> bool {
        let request_id = response.request_id.clone();
        let complete = {
            let Some(mut pending) = self.requests.get_mut(&request_id) else {
                debug!(%request_id, "Dropping response for unknown request");
                return false;
            };
            pending.msg_count += 1;
            pending.accumulator.combine(response);
            self.metrics
                .mark_horizontal_adapter_response_received(&pending.app_id);
            debug!(
                %request_id,
                kind = %pending.kind,
                received = pending.msg_count,
                expected = pending.num_sub,
                "Folded peer response"
            );
            pending.msg_count >= pending.num_sub
        };

        if complete {
            self.resolve(&request_id, false);
        }
        complete
    }

    /// Resolve with the partial data gathered so far
    pub fn force_resolve(&self, request_id: &str) -> bool {
        self.resolve(request_id, true)
    }

    fn resolve(&self, request_id: &str, forced: bool) -> bool {
        let Some((_, pending)) = self.requests.remove(request_id) else {
            return false;
        };
        if let Some(timer) = &pending.timer {
            timer.abort();
        }

        let elapsed = pending.created_at.elapsed();
        self.metrics
            .track_horizontal_adapter_resolved_promises(&pending.app_id, !forced);
        self.metrics
            .track_horizontal_adapter_resolve_time(&pending.app_id, elapsed.as_secs_f64() * 1000.0);

        if forced {
            debug!(
                request_id,
                kind = %pending.kind,
                received = pending.msg_count,
                expected = pending.num_sub,
                "Timeout reached, resolving with partial responses"
            );
        } else {
            debug!(request_id, kind = %pending.kind, "Request resolved");
        }

        // The caller may have given up already
        let _ = pending.resolver.send(Resolution {
            value: pending.accumulator,
            forced,
        });
        true
    }

    /// Drop every pending request. Waiting callers observe a dropped resolver.
    pub fn clear(&self) {
        for entry in self.requests.iter() {
            if let Some(timer) = &entry.timer {
                timer.abort();
            }
        }
        self.requests.clear();
    }
}

/// Ids of requests this node published, oldest evicted first
///
/// Outlives the pending entry, so an echo that arrives after its request
/// resolved is still recognised as our own.
pub struct IssuedRequests {
    capacity: usize,
    inner: Mutex<(VecDeque<String>, HashSet<String>)>,
}

impl IssuedRequests {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new((VecDeque::with_capacity(capacity), HashSet::with_capacity(capacity))),
        }
    }

    pub fn record(&self, request_id: &str) {
        let mut guard = self.inner.lock();
        let (order, ids) = &mut *guard;
        if !ids.insert(request_id.to_string()) {
            return;
        }
        order.push_back(request_id.to_string());
        while order.len() > self.capacity {
            if let Some(evicted) = order.pop_front() {
                ids.remove(&evicted);
            }
        }
    }

    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.inner.lock().1.contains(request_id)
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.0.clear();
        guard.1.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushline_core::metrics::NoopMetrics;
    use serde_json::json;

    fn table() -> Arc<RequestTable> {
        Arc::new(RequestTable::new(Arc::new(NoopMetrics)))
    }

    fn count_response(id: &str, n: usize) -> ResponseBody {
        ResponseBody {
            total_count: Some(n),
            ..ResponseBody::empty(id)
        }
    }

    #[test]
    fn test_channels_union_and_count_sum() {
        let mut channels = Accumulator::Channels(HashMap::from([(
            "a".to_string(),
            HashSet::from(["1.1".to_string()]),
        )]));
        channels.combine(ResponseBody {
            channels: Some(vec![
                ("a".to_string(), vec!["1.1".to_string(), "2.1".to_string()]),
                ("b".to_string(), vec!["2.2".to_string()]),
            ]),
            ..ResponseBody::empty("r")
        });
        let channels = channels.into_channels();
        assert_eq!(channels["a"].len(), 2);
        assert_eq!(channels["b"].len(), 1);

        let mut counts = Accumulator::ChannelsWithCount(HashMap::from([("a".to_string(), 1)]));
        counts.combine(ResponseBody {
            channels_with_sockets_count: Some(vec![("a".to_string(), 2), ("b".to_string(), 4)]),
            ..ResponseBody::empty("r")
        });
        let counts = counts.into_channels_with_count();
        assert_eq!(counts["a"], 3);
        assert_eq!(counts["b"], 4);
    }

    #[test]
    fn test_members_first_wins() {
        let mut members = Accumulator::Members(HashMap::from([("u1".to_string(), json!("local"))]));
        members.combine(ResponseBody {
            members: Some(vec![
                ("u1".to_string(), json!("remote")),
                ("u2".to_string(), json!("remote")),
            ]),
            ..ResponseBody::empty("r")
        });

        let members = members.into_members();
        assert_eq!(members["u1"], json!("local"));
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn test_exists_is_logical_or() {
        let mut exists = Accumulator::Exists(false);
        exists.combine(ResponseBody {
            exists: Some(false),
            ..ResponseBody::empty("r")
        });
        assert!(!exists.exists());
        exists.combine(ResponseBody {
            exists: Some(true),
            ..ResponseBody::empty("r")
        });
        exists.combine(ResponseBody::empty("r"));
        assert!(exists.exists());
    }

    #[tokio::test]
    async fn test_resolves_when_all_peers_answer() {
        let table = table();
        let rx = table.open("r1", "app", RequestType::SocketsCount, 3, Accumulator::Count(2), Duration::from_secs(5));

        assert!(!table.on_response(count_response("r1", 5)));
        assert!(table.on_response(count_response("r1", 1)));
        assert!(table.is_empty());

        let resolution = rx.await.unwrap();
        assert!(!resolution.forced);
        assert_eq!(resolution.value.count(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_forces_partial_resolution() {
        let table = table();
        let rx = table.open("r1", "app", RequestType::SocketsCount, 3, Accumulator::Count(2), Duration::from_millis(100));
        table.on_response(count_response("r1", 4));

        let resolution = rx.await.unwrap();
        assert!(resolution.forced);
        assert_eq!(resolution.value.count(), 6);

        // Late answers are dropped
        assert!(!table.on_response(count_response("r1", 10)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_clear_drops_waiters() {
        let table = table();
        let rx = table.open("r1", "app", RequestType::Sockets, 2, Accumulator::Sockets(HashMap::new()), Duration::from_secs(5));

        table.clear();

        assert!(rx.await.is_err());
        assert!(!table.contains("r1"));
    }

    #[test]
    fn test_issued_ids_outlive_resolution_and_evict_oldest() {
        let issued = IssuedRequests::new(2);
        issued.record("r1");
        issued.record("r2");
        issued.record("r2");
        assert!(issued.contains("r1"));

        issued.record("r3");
        assert!(!issued.contains("r1"));
        assert!(issued.contains("r2"));
        assert!(issued.contains("r3"));

        issued.clear();
        assert!(!issued.contains("r3"));
    }
}
