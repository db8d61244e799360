use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::message::PusherMessage;

/// Frame handed to the connection task that owns the real WebSocket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized Pusher JSON frame
    Message(Arc<str>),
    Close { code: u16, reason: String },
}

pub type SocketSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMember {
    pub user_id: String,
    #[serde(default)]
    pub user_info: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub user_info: Value,
}

/// A connected client as seen by the registry
///
/// Sockets arriving from peers in scatter-gather responses carry no sender;
/// sending to them does nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Socket {
    pub id: String,
    pub app_id: String,
    #[serde(default)]
    pub subscribed_channels: HashSet<String>,
    #[serde(default)]
    pub presence: HashMap<String, PresenceMember>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(skip)]
    sender: Option<SocketSender>,
}

impl Socket {
    #[must_use]
    pub fn new(id: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            app_id: app_id.into(),
            subscribed_channels: HashSet::new(),
            presence: HashMap::new(),
            user: None,
            sender: None,
        }
    }

    /// Create a socket together with the receiving end of its outbound queue
    #[must_use]
    pub fn with_channel(
        id: impl Into<String>,
        app_id: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut socket = Self::new(id, app_id);
        socket.sender = Some(tx);
        (socket, rx)
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>, user_info: Value) -> Self {
        self.user = Some(User {
            id: user_id.into(),
            user_info,
        });
        self
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// Queue a raw frame. Returns false when the socket has no live handle.
    pub fn send(&self, frame: Outbound) -> bool {
        match &self.sender {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Queue an already serialized payload
    pub fn send_raw(&self, payload: &str) -> bool {
        self.send(Outbound::Message(Arc::from(payload)))
    }

    pub fn send_json(&self, message: &PusherMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.send(Outbound::Message(Arc::from(json))),
            Err(e) => {
                tracing::warn!(socket_id = %self.id, error = %e, "Failed to encode outbound frame");
                false
            }
        }
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.send(Outbound::Close {
            code,
            reason: reason.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_reaches_receiver() {
        let (socket, mut rx) = Socket::with_channel("1.1", "app");

        assert!(socket.send_raw("hello"));
        assert!(socket.close(4009, "bye"));

        assert_eq!(rx.try_recv().unwrap(), Outbound::Message(Arc::from("hello")));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close {
                code: 4009,
                reason: "bye".to_string()
            }
        );
    }

    #[test]
    fn test_remote_socket_round_trip_drops_sender() {
        let (socket, _rx) = Socket::with_channel("1.1", "app");
        let socket = socket.with_user("u1", json!({"name": "Ann"}));

        let wire = serde_json::to_value(&socket).unwrap();
        assert_eq!(wire["appId"], "app");
        assert_eq!(wire["user"]["id"], "u1");

        let remote: Socket = serde_json::from_value(wire).unwrap();
        assert!(!remote.send_raw("ignored"));
        assert_eq!(remote.user_id(), Some("u1"));
    }
}
