use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Code sent before closing sockets of a terminated user
pub const TERMINATION_CODE: u16 = 4009;
/// Code sent to every local socket while the node is shutting down
pub const DRAIN_CODE: u16 = 4200;

/// A Pusher protocol frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PusherMessage {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PusherMessage {
    #[must_use]
    pub fn new(event: impl Into<String>, channel: Option<String>, data: Option<Value>) -> Self {
        Self {
            event: event.into(),
            channel,
            data,
        }
    }

    /// `pusher:error` frame
    #[must_use]
    pub fn error(code: u16, message: &str) -> Self {
        Self::new("pusher:error", None, Some(json!({ "code": code, "message": message })))
    }

    #[must_use]
    pub fn termination_notice() -> Self {
        Self::error(TERMINATION_CODE, "You got disconnected by the app.")
    }

    #[must_use]
    pub fn drain_notice() -> Self {
        Self::error(DRAIN_CODE, "Server closed. Please reconnect shortly.")
    }

    /// `pusher:subscription_error` frame for a rejected join
    #[must_use]
    pub fn subscription_error(channel: &str, kind: &str, error: &str, status: u16) -> Self {
        Self::new(
            "pusher:subscription_error",
            Some(channel.to_string()),
            Some(json!({ "type": kind, "error": error, "status": status })),
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_notice_shape() {
        let frame = PusherMessage::termination_notice().to_json().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["event"], "pusher:error");
        assert_eq!(value["data"]["code"], 4009);
        assert!(value.get("channel").is_none());
    }

    #[test]
    fn test_subscription_error_carries_channel() {
        let msg = PusherMessage::subscription_error("presence-a", "LimitReached", "full", 4100);

        assert_eq!(msg.channel.as_deref(), Some("presence-a"));
        assert_eq!(msg.data.unwrap()["status"], 4100);
    }
}
