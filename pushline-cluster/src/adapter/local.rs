use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use pushline_core::models::Socket;
use serde_json::Value;
use tracing::debug;

use super::namespace::Namespace;

/// Channel prefix addressing every socket of one user
pub const USER_CHANNEL_PREFIX: &str = "#server-to-user-";

/// Owns one [`Namespace`] per app and routes every call to it
///
/// Namespaces are created on first access and live until cleared.
#[derive(Debug, Default)]
pub struct LocalAdapter {
    namespaces: DashMap<String, Namespace>,
}

impl LocalAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_namespace<R>(&self, app_id: &str, f: impl FnOnce(&mut Namespace) -> R) -> R {
        let mut ns = self
            .namespaces
            .entry(app_id.to_string())
            .or_insert_with(|| Namespace::new(app_id));
        f(ns.value_mut())
    }

    fn read_namespace<R>(&self, app_id: &str, default: R, f: impl FnOnce(&Namespace) -> R) -> R {
        self.namespaces.get(app_id).map_or(default, |ns| f(ns.value()))
    }

    #[must_use]
    pub fn namespace_ids(&self) -> Vec<String> {
        self.namespaces.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn add_socket(&self, app_id: &str, socket: Socket) -> bool {
        self.with_namespace(app_id, |ns| ns.add_socket(socket))
    }

    pub fn remove_socket(&self, app_id: &str, socket_id: &str) -> bool {
        self.with_namespace(app_id, |ns| ns.remove_socket(socket_id))
    }

    pub fn add_to_channel(&self, app_id: &str, channel: &str, socket: &Socket) -> usize {
        self.with_namespace(app_id, |ns| ns.add_to_channel(socket, channel))
    }

    pub fn remove_from_channel(&self, app_id: &str, channel: &str, socket_id: &str) -> usize {
        self.with_namespace(app_id, |ns| ns.remove_from_channel(socket_id, channel))
    }

    pub fn remove_from_channels(&self, app_id: &str, channels: &[String], socket_id: &str) {
        self.with_namespace(app_id, |ns| ns.remove_from_channels(socket_id, channels));
    }

    #[must_use]
    pub fn sockets(&self, app_id: &str) -> HashMap<String, Socket> {
        self.read_namespace(app_id, HashMap::new(), |ns| ns.sockets().clone())
    }

    #[must_use]
    pub fn sockets_count(&self, app_id: &str) -> usize {
        self.read_namespace(app_id, 0, |ns| ns.sockets().len())
    }

    #[must_use]
    pub fn channels(&self, app_id: &str) -> HashMap<String, HashSet<String>> {
        self.read_namespace(app_id, HashMap::new(), |ns| ns.channels().clone())
    }

    #[must_use]
    pub fn channels_with_sockets_count(&self, app_id: &str) -> HashMap<String, usize> {
        self.read_namespace(app_id, HashMap::new(), Namespace::channels_with_sockets_count)
    }

    #[must_use]
    pub fn channel_sockets(&self, app_id: &str, channel: &str) -> HashMap<String, Socket> {
        self.read_namespace(app_id, HashMap::new(), |ns| ns.channel_sockets(channel))
    }

    #[must_use]
    pub fn channel_sockets_count(&self, app_id: &str, channel: &str) -> usize {
        self.read_namespace(app_id, 0, |ns| ns.channel_sockets_count(channel))
    }

    #[must_use]
    pub fn channel_members(&self, app_id: &str, channel: &str) -> HashMap<String, Value> {
        self.read_namespace(app_id, HashMap::new(), |ns| ns.channel_members(channel))
    }

    #[must_use]
    pub fn channel_members_count(&self, app_id: &str, channel: &str) -> usize {
        self.read_namespace(app_id, 0, |ns| ns.channel_members(channel).len())
    }

    #[must_use]
    pub fn is_in_channel(&self, app_id: &str, channel: &str, socket_id: &str) -> bool {
        self.read_namespace(app_id, false, |ns| ns.is_in_channel(socket_id, channel))
    }

    /// Deliver `data` to the local sockets of `channel`
    ///
    /// `#server-to-user-<id>` targets every socket of that user and ignores
    /// `except`. Returns how many sockets accepted the frame. Empty payloads
    /// are never delivered.
    pub fn send(&self, app_id: &str, channel: &str, data: &str, except: Option<&str>) -> usize {
        if data.is_empty() {
            debug!(app_id, channel, "Dropping empty message");
            return 0;
        }
        let delivered = if let Some(user_id) = channel.strip_prefix(USER_CHANNEL_PREFIX) {
            self.user_sockets(app_id, user_id)
                .iter()
                .filter(|socket| socket.send_raw(data))
                .count()
        } else {
            self.read_namespace(app_id, 0, |ns| {
                ns.channel_sockets(channel)
                    .values()
                    .filter(|socket| Some(socket.id.as_str()) != except)
                    .filter(|socket| socket.send_raw(data))
                    .count()
            })
        };
        debug!(app_id, channel, delivered, "Delivered message locally");
        delivered
    }

    pub fn terminate_user_connections(&self, app_id: &str, user_id: &str) -> usize {
        self.read_namespace(app_id, 0, |ns| ns.terminate_user_connections(user_id))
    }

    pub fn add_user(&self, socket: &Socket) {
        self.with_namespace(&socket.app_id, |ns| ns.add_user(socket));
    }

    pub fn remove_user(&self, socket: &Socket) {
        self.with_namespace(&socket.app_id, |ns| ns.remove_user(socket));
    }

    #[must_use]
    pub fn user_sockets(&self, app_id: &str, user_id: &str) -> Vec<Socket> {
        self.read_namespace(app_id, Vec::new(), |ns| ns.user_sockets(user_id))
    }

    /// Replace an app's namespace with an empty one
    pub fn clear_namespace(&self, app_id: &str) {
        self.namespaces
            .insert(app_id.to_string(), Namespace::new(app_id));
    }

    pub fn clear_namespaces(&self) {
        self.namespaces.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushline_core::models::Outbound;

    #[test]
    fn test_namespaces_are_isolated() {
        let adapter = LocalAdapter::new();
        adapter.add_to_channel("a", "chat", &Socket::new("1.1", "a"));
        adapter.add_to_channel("b", "chat", &Socket::new("2.1", "b"));
        adapter.add_to_channel("b", "chat", &Socket::new("2.2", "b"));

        assert_eq!(adapter.channel_sockets_count("a", "chat"), 1);
        assert_eq!(adapter.channel_sockets_count("b", "chat"), 2);
        assert_eq!(adapter.sockets_count("c"), 0);
    }

    #[test]
    fn test_send_skips_excepted_socket() {
        let adapter = LocalAdapter::new();
        let (s1, mut rx1) = Socket::with_channel("1.1", "app");
        let (s2, mut rx2) = Socket::with_channel("1.2", "app");
        adapter.add_to_channel("app", "chat", &s1);
        adapter.add_to_channel("app", "chat", &s2);

        assert_eq!(adapter.send("app", "chat", "{\"event\":\"x\"}", Some("1.1")), 1);
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv().unwrap(), Outbound::Message(_)));
    }

    #[test]
    fn test_empty_message_is_not_delivered() {
        let adapter = LocalAdapter::new();
        let (socket, mut rx) = Socket::with_channel("1.1", "app");
        adapter.add_to_channel("app", "chat", &socket);

        assert_eq!(adapter.send("app", "chat", "", None), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_to_user_channel_ignores_except() {
        let adapter = LocalAdapter::new();
        let (s1, mut rx1) = Socket::with_channel("1.1", "app");
        let (s2, mut rx2) = Socket::with_channel("1.2", "app");
        adapter.add_user(&s1.with_user("u1", Value::Null));
        adapter.add_user(&s2.with_user("u1", Value::Null));

        let delivered = adapter.send("app", "#server-to-user-u1", "{}", Some("1.1"));

        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_clear_namespace() {
        let adapter = LocalAdapter::new();
        adapter.add_socket("a", Socket::new("1.1", "a"));
        adapter.add_socket("b", Socket::new("2.1", "b"));

        adapter.clear_namespace("a");
        assert_eq!(adapter.sockets_count("a"), 0);
        assert_eq!(adapter.sockets_count("b"), 1);

        adapter.clear_namespaces();
        assert!(adapter.namespace_ids().is_empty());
    }
}
