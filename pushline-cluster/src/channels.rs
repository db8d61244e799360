//! Join and leave policy applied before a socket touches the registry

use std::sync::{Arc, LazyLock};

use pushline_core::models::{is_presence_channel, App, PresenceMember, PusherMessage, Socket};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, error};

use crate::adapter::Adapter;

/// Channel names a client may subscribe to
static CHANNEL_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: constant pattern, always valid
    Regex::new(r"^#?[-a-zA-Z0-9_=@,.;]+$").expect("channel name regex is a valid constant")
});

const RESTRICTED_NAME_MESSAGE: &str = "The channel name is not allowed. Read channel conventions: https://pusher.com/docs/channels/using_channels/channels/#channel-naming-conventions";

#[must_use]
pub fn is_restricted_channel_name(channel: &str) -> bool {
    !CHANNEL_NAME_REGEX.is_match(channel)
}

/// Serialized size of a member's `user_info` in kilobytes
#[must_use]
pub fn user_info_size_in_kb(user_info: &Value) -> f64 {
    let bytes = match user_info {
        Value::String(s) => s.len(),
        other => serde_json::to_vec(other).map_or(0, |raw| raw.len()),
    };
    bytes as f64 / 1024.0
}

/// Why a subscription was refused
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRejection {
    pub code: u16,
    pub kind: Option<&'static str>,
    pub message: String,
}

impl JoinRejection {
    fn new(code: u16, kind: Option<&'static str>, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
        }
    }

    /// `pusher:subscription_error` frame for the client
    #[must_use]
    pub fn to_message(&self, channel: &str) -> PusherMessage {
        PusherMessage::subscription_error(channel, self.kind.unwrap_or(""), &self.message, self.code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinResponse {
    Joined {
        /// Connections on the channel after joining
        channel_connections: usize,
        member: Option<PresenceMember>,
    },
    Rejected(JoinRejection),
}

impl JoinResponse {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Joined { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaveResponse {
    pub remaining_connections: usize,
    /// Presence record the socket held on the channel
    pub member: Option<PresenceMember>,
}

pub struct ChannelManager {
    adapter: Arc<dyn Adapter>,
}

impl ChannelManager {
    #[must_use]
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self { adapter }
    }

    /// Subscribe `socket` to `channel` after checking the app's limits
    ///
    /// Presence channels need `member`; it is recorded on the socket before
    /// the registry sees it so peers answer member queries correctly.
    pub async fn join(
        &self,
        app: &App,
        socket: &mut Socket,
        channel: &str,
        member: Option<PresenceMember>,
    ) -> JoinResponse {
        if let Some(rejection) = Self::check_name(app, channel) {
            debug!(app_id = %app.id, channel, code = rejection.code, "Rejected channel name");
            return JoinResponse::Rejected(rejection);
        }

        let member = if is_presence_channel(channel) {
            match self.check_presence(app, channel, member).await {
                Ok(member) => Some(member),
                Err(rejection) => {
                    debug!(
                        app_id = %app.id,
                        channel,
                        socket_id = %socket.id,
                        code = rejection.code,
                        "Rejected presence subscription"
                    );
                    return JoinResponse::Rejected(rejection);
                }
            }
        } else {
            None
        };

        if let Some(member) = &member {
            socket.presence.insert(channel.to_string(), member.clone());
        }
        socket.subscribed_channels.insert(channel.to_string());

        let channel_connections = self.adapter.add_to_channel(&app.id, channel, socket).await;
        JoinResponse::Joined {
            channel_connections,
            member,
        }
    }

    /// Unsubscribe `socket` from `channel`
    pub async fn leave(&self, app_id: &str, socket: &mut Socket, channel: &str) -> LeaveResponse {
        let remaining_connections = self
            .adapter
            .remove_from_channel(app_id, channel, &socket.id)
            .await;
        socket.subscribed_channels.remove(channel);
        LeaveResponse {
            remaining_connections,
            member: socket.presence.remove(channel),
        }
    }

    fn check_name(app: &App, channel: &str) -> Option<JoinRejection> {
        if channel.len() > app.max_channel_name_length {
            return Some(JoinRejection::new(
                4009,
                Some("LimitReached"),
                format!(
                    "The channel name is longer than the allowed {} characters.",
                    app.max_channel_name_length
                ),
            ));
        }
        if is_restricted_channel_name(channel) {
            return Some(JoinRejection::new(4009, None, RESTRICTED_NAME_MESSAGE));
        }
        None
    }

    async fn check_presence(
        &self,
        app: &App,
        channel: &str,
        member: Option<PresenceMember>,
    ) -> Result<PresenceMember, JoinRejection> {
        let members = match self.adapter.get_channel_members_count(&app.id, channel, false).await {
            Ok(count) => count,
            Err(e) => {
                error!(app_id = %app.id, channel, error = %e, "Failed to count presence members");
                return Err(JoinRejection::new(
                    4302,
                    Some("ServerError"),
                    "A server error has occured.",
                ));
            }
        };
        if members + 1 > app.max_presence_members_per_channel {
            return Err(JoinRejection::new(
                4100,
                Some("LimitReached"),
                "The maximum members per presence channel limit was reached",
            ));
        }

        let Some(member) = member else {
            return Err(JoinRejection::new(
                4009,
                None,
                "Presence channel subscriptions must carry channel data.",
            ));
        };
        if user_info_size_in_kb(&member.user_info) > app.max_presence_member_size_in_kb {
            return Err(JoinRejection::new(
                4301,
                Some("LimitReached"),
                format!(
                    "The maximum size for a channel member is {} KB.",
                    app.max_presence_member_size_in_kb
                ),
            ));
        }
        Ok(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LocalAdapter;
    use serde_json::json;

    fn manager() -> (ChannelManager, Arc<LocalAdapter>) {
        let adapter = Arc::new(LocalAdapter::new());
        (ChannelManager::new(adapter.clone()), adapter)
    }

    fn member(user_id: &str) -> Option<PresenceMember> {
        Some(PresenceMember {
            user_id: user_id.to_string(),
            user_info: json!({ "name": user_id }),
        })
    }

    #[test]
    fn test_restricted_names() {
        assert!(!is_restricted_channel_name("chat-room_1"));
        assert!(!is_restricted_channel_name("#server-to-user-42"));
        assert!(is_restricted_channel_name("chat room"));
        assert!(is_restricted_channel_name(""));
        assert!(is_restricted_channel_name("a##b"));
    }

    #[test]
    fn test_user_info_size() {
        assert!((user_info_size_in_kb(&json!("a".repeat(1024))) - 1.0).abs() < f64::EPSILON);
        assert!(user_info_size_in_kb(&json!({ "k": "v" })) < 0.1);
    }

    #[tokio::test]
    async fn test_public_join_and_leave() {
        let (manager, adapter) = manager();
        let app = App::with_id("app");
        let mut socket = Socket::new("1.1", "app");

        let joined = manager.join(&app, &mut socket, "chat", None).await;
        assert_eq!(
            joined,
            JoinResponse::Joined {
                channel_connections: 1,
                member: None
            }
        );
        assert!(socket.subscribed_channels.contains("chat"));
        assert!(adapter.is_in_channel("app", "chat", "1.1"));

        let left = manager.leave("app", &mut socket, "chat").await;
        assert_eq!(left.remaining_connections, 0);
        assert!(left.member.is_none());
        assert!(socket.subscribed_channels.is_empty());
    }

    #[tokio::test]
    async fn test_name_rules() {
        let (manager, _) = manager();
        let app = App {
            max_channel_name_length: 8,
            ..App::with_id("app")
        };
        let mut socket = Socket::new("1.1", "app");

        let JoinResponse::Rejected(too_long) = manager.join(&app, &mut socket, "much-too-long", None).await else {
            panic!("long name accepted");
        };
        assert_eq!(too_long.code, 4009);
        assert_eq!(too_long.kind, Some("LimitReached"));

        let JoinResponse::Rejected(restricted) = manager.join(&app, &mut socket, "a b", None).await else {
            panic!("restricted name accepted");
        };
        assert_eq!(restricted.code, 4009);
        assert!(socket.subscribed_channels.is_empty());
    }

    #[tokio::test]
    async fn test_presence_member_limit() {
        let (manager, adapter) = manager();
        let app = App {
            max_presence_members_per_channel: 2,
            ..App::with_id("app")
        };

        for (id, user) in [("1.1", "u1"), ("1.2", "u2")] {
            let mut socket = Socket::new(id, "app");
            let joined = manager.join(&app, &mut socket, "presence-room", member(user)).await;
            assert!(joined.is_success());
            assert_eq!(socket.presence["presence-room"].user_id, user);
        }

        let mut third = Socket::new("1.3", "app");
        let JoinResponse::Rejected(rejection) = manager.join(&app, &mut third, "presence-room", member("u3")).await else {
            panic!("third member accepted");
        };
        assert_eq!(rejection.code, 4100);

        let frame = rejection.to_message("presence-room");
        assert_eq!(frame.event, "pusher:subscription_error");
        assert_eq!(adapter.channel_members_count("app", "presence-room"), 2);
        assert!(third.presence.is_empty());
    }

    #[tokio::test]
    async fn test_presence_member_size() {
        let (manager, _) = manager();
        let app = App {
            max_presence_member_size_in_kb: 1.0,
            ..App::with_id("app")
        };
        let mut socket = Socket::new("1.1", "app");
        let oversized = Some(PresenceMember {
            user_id: "u1".to_string(),
            user_info: json!({ "bio": "x".repeat(2048) }),
        });

        let JoinResponse::Rejected(rejection) = manager.join(&app, &mut socket, "presence-room", oversized).await else {
            panic!("oversized member accepted");
        };
        assert_eq!(rejection.code, 4301);

        let JoinResponse::Rejected(missing) = manager.join(&app, &mut socket, "presence-room", None).await else {
            panic!("member data missing but accepted");
        };
        assert_eq!(missing.code, 4009);
    }

    #[tokio::test]
    async fn test_presence_leave_returns_member() {
        let (manager, _) = manager();
        let app = App::with_id("app");
        let mut socket = Socket::new("1.1", "app");
        manager.join(&app, &mut socket, "presence-room", member("u1")).await;

        let left = manager.leave("app", &mut socket, "presence-room").await;

        assert_eq!(left.member.map(|m| m.user_id), Some("u1".to_string()));
        assert!(socket.presence.is_empty());
    }
}
