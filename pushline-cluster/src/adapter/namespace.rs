//! Per-tenant registry of sockets, channel membership and users

use std::collections::{HashMap, HashSet};

use pushline_core::models::{PusherMessage, Socket, TERMINATION_CODE};
use serde_json::Value;
use tracing::debug;

/// In-memory index for one app
///
/// Every socket id referenced by `channels` or `users` is present in
/// `sockets`, and channel entries are dropped as soon as they become empty.
#[derive(Debug, Default)]
pub struct Namespace {
    app_id: String,
    sockets: HashMap<String, Socket>,
    channels: HashMap<String, HashSet<String>>,
    users: HashMap<String, HashSet<String>>,
}

impl Namespace {
    #[must_use]
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn sockets(&self) -> &HashMap<String, Socket> {
        &self.sockets
    }

    /// Insert or replace a socket. Returns true in both cases.
    pub fn add_socket(&mut self, socket: Socket) -> bool {
        self.sockets.insert(socket.id.clone(), socket);
        true
    }

    /// Remove a socket from every channel and user entry, then drop it.
    /// Returns whether the socket was known.
    pub fn remove_socket(&mut self, socket_id: &str) -> bool {
        self.channels.retain(|_, ids| {
            ids.remove(socket_id);
            !ids.is_empty()
        });
        self.users.retain(|_, ids| {
            ids.remove(socket_id);
            !ids.is_empty()
        });
        self.sockets.remove(socket_id).is_some()
    }

    /// Join `socket` to `channel` and return the channel's connection count.
    ///
    /// An unknown socket is registered first. A known one has the channel and
    /// any presence entry for it merged into its stored state.
    pub fn add_to_channel(&mut self, socket: &Socket, channel: &str) -> usize {
        let stored = self
            .sockets
            .entry(socket.id.clone())
            .or_insert_with(|| socket.clone());
        stored.subscribed_channels.insert(channel.to_string());
        if let Some(member) = socket.presence.get(channel) {
            stored.presence.insert(channel.to_string(), member.clone());
        }
        if stored.user.is_none() {
            stored.user.clone_from(&socket.user);
        }

        let ids = self.channels.entry(channel.to_string()).or_default();
        ids.insert(socket.id.clone());
        ids.len()
    }

    /// Leave a single channel and return how many connections remain in it
    pub fn remove_from_channel(&mut self, socket_id: &str, channel: &str) -> usize {
        self.leave(socket_id, channel);
        self.channels.get(channel).map_or(0, HashSet::len)
    }

    /// Leave several channels at once, as done while tearing down a connection
    pub fn remove_from_channels(&mut self, socket_id: &str, channels: &[String]) {
        for channel in channels {
            self.leave(socket_id, channel);
        }
    }

    fn leave(&mut self, socket_id: &str, channel: &str) {
        if let Some(ids) = self.channels.get_mut(channel) {
            ids.remove(socket_id);
            if ids.is_empty() {
                self.channels.remove(channel);
            }
        }
        if let Some(socket) = self.sockets.get_mut(socket_id) {
            socket.subscribed_channels.remove(channel);
            socket.presence.remove(channel);
        }
    }

    #[must_use]
    pub fn is_in_channel(&self, socket_id: &str, channel: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|ids| ids.contains(socket_id))
    }

    #[must_use]
    pub fn channels(&self) -> &HashMap<String, HashSet<String>> {
        &self.channels
    }

    #[must_use]
    pub fn channels_with_sockets_count(&self) -> HashMap<String, usize> {
        self.channels
            .iter()
            .map(|(channel, ids)| (channel.clone(), ids.len()))
            .collect()
    }

    /// Sockets joined to `channel`, skipping ids no longer registered
    #[must_use]
    pub fn channel_sockets(&self, channel: &str) -> HashMap<String, Socket> {
        let Some(ids) = self.channels.get(channel) else {
            return HashMap::new();
        };
        ids.iter()
            .filter_map(|id| self.sockets.get(id).map(|s| (id.clone(), s.clone())))
            .collect()
    }

    #[must_use]
    pub fn channel_sockets_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, HashSet::len)
    }

    /// Presence members of `channel` keyed by user id. The first socket seen
    /// for a user supplies its info.
    #[must_use]
    pub fn channel_members(&self, channel: &str) -> HashMap<String, Value> {
        let mut members = HashMap::new();
        let Some(ids) = self.channels.get(channel) else {
            return members;
        };
        for socket in ids.iter().filter_map(|id| self.sockets.get(id)) {
            if let Some(member) = socket.presence.get(channel) {
                members
                    .entry(member.user_id.clone())
                    .or_insert_with(|| member.user_info.clone());
            }
        }
        members
    }

    /// Index the socket under its user. No-op for anonymous sockets.
    ///
    /// A socket registered before signing in gets the user written into its
    /// stored copy; a previous user of the same socket is unindexed.
    pub fn add_user(&mut self, socket: &Socket) {
        let Some(user) = &socket.user else {
            return;
        };
        let stored = self
            .sockets
            .entry(socket.id.clone())
            .or_insert_with(|| socket.clone());
        if let Some(previous) = stored.user.replace(user.clone()) {
            if previous.id != user.id {
                self.unindex_user(&previous.id, &socket.id);
            }
        }
        self.users
            .entry(user.id.clone())
            .or_default()
            .insert(socket.id.clone());
    }

    pub fn remove_user(&mut self, socket: &Socket) {
        let Some(user_id) = socket.user_id() else {
            return;
        };
        self.unindex_user(user_id, &socket.id);
    }

    fn unindex_user(&mut self, user_id: &str, socket_id: &str) {
        if let Some(ids) = self.users.get_mut(user_id) {
            ids.remove(socket_id);
            if ids.is_empty() {
                self.users.remove(user_id);
            }
        }
    }

    #[must_use]
    pub fn user_sockets(&self, user_id: &str) -> Vec<Socket> {
        self.users
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| self.sockets.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Notify and close every socket authenticated as `user_id`.
    /// Returns the number of sockets that were told to close.
    pub fn terminate_user_connections(&self, user_id: &str) -> usize {
        let notice = PusherMessage::termination_notice();
        let mut terminated = 0;
        let sockets = self
            .users
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sockets.get(id));
        for socket in sockets {
            socket.send_json(&notice);
            socket.close(TERMINATION_CODE, "You got disconnected by the app.");
            terminated += 1;
        }
        debug!(app_id = %self.app_id, user_id, terminated, "Terminated user connections");
        terminated
    }

    /// True when every referenced socket id is registered and no channel is empty
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let no_dangling = self
            .channels
            .values()
            .chain(self.users.values())
            .all(|ids| ids.iter().all(|id| self.sockets.contains_key(id)));
        let no_empty = self.channels.values().all(|ids| !ids.is_empty());
        no_dangling && no_empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushline_core::models::{Outbound, PresenceMember};
    use serde_json::json;

    fn presence_socket(id: &str, channel: &str, user_id: &str) -> Socket {
        let mut socket = Socket::new(id, "app").with_user(user_id, json!({"id": user_id}));
        socket.presence.insert(
            channel.to_string(),
            PresenceMember {
                user_id: user_id.to_string(),
                user_info: json!({"name": user_id}),
            },
        );
        socket
    }

    #[test]
    fn test_add_to_channel_counts_distinct_sockets() {
        let mut ns = Namespace::new("app");
        let a = Socket::new("1.1", "app");
        let b = Socket::new("1.2", "app");

        assert_eq!(ns.add_to_channel(&a, "chat"), 1);
        assert_eq!(ns.add_to_channel(&a, "chat"), 1);
        assert_eq!(ns.add_to_channel(&b, "chat"), 2);
        assert_eq!(ns.channel_sockets_count("chat"), 2);
        assert!(ns.sockets()["1.1"].subscribed_channels.contains("chat"));
    }

    #[test]
    fn test_remove_socket_drops_empty_channels() {
        let mut ns = Namespace::new("app");
        let a = Socket::new("1.1", "app");
        let b = Socket::new("1.2", "app");
        ns.add_to_channel(&a, "solo");
        ns.add_to_channel(&a, "shared");
        ns.add_to_channel(&b, "shared");

        assert!(ns.remove_socket("1.1"));
        assert!(!ns.channels().contains_key("solo"));
        assert_eq!(ns.channel_sockets_count("shared"), 1);
        assert!(!ns.remove_socket("1.1"));
        assert!(ns.is_consistent());
    }

    #[test]
    fn test_remove_from_channel_returns_remaining() {
        let mut ns = Namespace::new("app");
        ns.add_to_channel(&Socket::new("1.1", "app"), "c");
        ns.add_to_channel(&Socket::new("1.2", "app"), "c");

        assert_eq!(ns.remove_from_channel("1.1", "c"), 1);
        assert_eq!(ns.remove_from_channel("1.2", "c"), 0);
        assert_eq!(ns.remove_from_channel("missing", "c"), 0);
        assert!(ns.channels().is_empty());
    }

    #[test]
    fn test_batch_removal() {
        let mut ns = Namespace::new("app");
        let s = Socket::new("1.1", "app");
        ns.add_to_channel(&s, "a");
        ns.add_to_channel(&s, "b");

        ns.remove_from_channels("1.1", &["a".to_string(), "b".to_string(), "zzz".to_string()]);

        assert!(ns.channels().is_empty());
        assert!(ns.sockets()["1.1"].subscribed_channels.is_empty());
    }

    #[test]
    fn test_channel_members_keyed_by_user() {
        let mut ns = Namespace::new("app");
        ns.add_to_channel(&presence_socket("1.1", "presence-x", "u1"), "presence-x");
        ns.add_to_channel(&presence_socket("1.2", "presence-x", "u1"), "presence-x");
        ns.add_to_channel(&presence_socket("1.3", "presence-x", "u2"), "presence-x");
        ns.add_to_channel(&Socket::new("1.4", "app"), "presence-x");

        let members = ns.channel_members("presence-x");
        assert_eq!(members.len(), 2);
        assert_eq!(members["u1"], json!({"name": "u1"}));
    }

    #[test]
    fn test_user_index() {
        let mut ns = Namespace::new("app");
        let s = Socket::new("1.1", "app").with_user("u1", Value::Null);
        let anon = Socket::new("1.2", "app");

        ns.add_user(&s);
        ns.add_user(&anon);
        assert_eq!(ns.user_sockets("u1").len(), 1);
        assert!(ns.is_consistent());

        ns.remove_user(&s);
        assert!(ns.user_sockets("u1").is_empty());
    }

    #[test]
    fn test_terminate_user_connections_notifies_and_closes() {
        let mut ns = Namespace::new("app");
        let (s1, mut rx1) = Socket::with_channel("1.1", "app");
        let (s2, mut rx2) = Socket::with_channel("1.2", "app");
        for socket in [s1.with_user("u1", Value::Null), s2.with_user("u2", Value::Null)] {
            ns.add_socket(socket.clone());
            ns.add_user(&socket);
        }

        assert_eq!(ns.terminate_user_connections("u1"), 1);

        match rx1.try_recv().unwrap() {
            Outbound::Message(frame) => assert!(frame.contains("4009")),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(matches!(rx1.try_recv().unwrap(), Outbound::Close { code: 4009, .. }));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_terminate_reaches_socket_that_signed_in_later() {
        let mut ns = Namespace::new("app");
        let (anonymous, mut rx) = Socket::with_channel("1.1", "app");
        ns.add_socket(anonymous.clone());

        ns.add_user(&anonymous.with_user("u1", json!({"name": "Ann"})));

        assert_eq!(ns.sockets()["1.1"].user_id(), Some("u1"));
        assert_eq!(ns.user_sockets("u1").len(), 1);
        assert_eq!(ns.terminate_user_connections("u1"), 1);
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Message(_)));
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close { code: 4009, .. }));
    }

    #[test]
    fn test_signing_in_as_another_user_moves_the_index() {
        let mut ns = Namespace::new("app");
        let socket = Socket::new("1.1", "app");
        ns.add_user(&socket.clone().with_user("u1", Value::Null));
        ns.add_user(&socket.with_user("u2", Value::Null));

        assert!(ns.user_sockets("u1").is_empty());
        assert_eq!(ns.user_sockets("u2").len(), 1);
        assert_eq!(ns.terminate_user_connections("u1"), 0);
    }

    mod integrity {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            AddSocket(u8),
            AddToChannel(u8, u8),
            RemoveFromChannel(u8, u8),
            RemoveSocket(u8),
            AddUser(u8, u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..6).prop_map(Op::AddSocket),
                (0u8..6, 0u8..4).prop_map(|(s, c)| Op::AddToChannel(s, c)),
                (0u8..6, 0u8..4).prop_map(|(s, c)| Op::RemoveFromChannel(s, c)),
                (0u8..6).prop_map(Op::RemoveSocket),
                (0u8..6, 0u8..3).prop_map(|(s, u)| Op::AddUser(s, u)),
            ]
        }

        proptest! {
            #[test]
            fn registry_stays_consistent(ops in proptest::collection::vec(op(), 0..64)) {
                let mut ns = Namespace::new("app");
                for op in ops {
                    match op {
                        Op::AddSocket(s) => {
                            ns.add_socket(Socket::new(s.to_string(), "app"));
                        }
                        Op::AddToChannel(s, c) => {
                            ns.add_to_channel(&Socket::new(s.to_string(), "app"), &format!("c{c}"));
                        }
                        Op::RemoveFromChannel(s, c) => {
                            ns.remove_from_channel(&s.to_string(), &format!("c{c}"));
                        }
                        Op::RemoveSocket(s) => {
                            ns.remove_socket(&s.to_string());
                        }
                        Op::AddUser(s, u) => {
                            let socket = Socket::new(s.to_string(), "app").with_user(format!("u{u}"), Value::Null);
                            ns.add_user(&socket);
                        }
                    }
                    prop_assert!(ns.is_consistent());
                }
            }
        }
    }
}
