//! Messages exchanged between nodes over the request, response and broadcast channels

use pushline_core::models::Socket;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query kinds understood by every node, numbered as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RequestType {
    Sockets,
    Channels,
    ChannelSockets,
    ChannelMembers,
    SocketsCount,
    ChannelMembersCount,
    ChannelSocketsCount,
    SocketExistsInChannel,
    ChannelsWithSocketsCount,
    TerminateUserConnections,
}

impl From<RequestType> for u8 {
    fn from(kind: RequestType) -> Self {
        match kind {
            RequestType::Sockets => 0,
            RequestType::Channels => 1,
            RequestType::ChannelSockets => 2,
            RequestType::ChannelMembers => 3,
            RequestType::SocketsCount => 4,
            RequestType::ChannelMembersCount => 5,
            RequestType::ChannelSocketsCount => 6,
            RequestType::SocketExistsInChannel => 7,
            RequestType::ChannelsWithSocketsCount => 8,
            RequestType::TerminateUserConnections => 9,
        }
    }
}

impl TryFrom<u8> for RequestType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Sockets,
            1 => Self::Channels,
            2 => Self::ChannelSockets,
            3 => Self::ChannelMembers,
            4 => Self::SocketsCount,
            5 => Self::ChannelMembersCount,
            6 => Self::ChannelSocketsCount,
            7 => Self::SocketExistsInChannel,
            8 => Self::ChannelsWithSocketsCount,
            9 => Self::TerminateUserConnections,
            other => return Err(format!("unknown request type {other}")),
        })
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl RequestOptions {
    #[must_use]
    pub fn channel(channel: &str) -> Self {
        Self {
            channel: Some(channel.to_string()),
            ..Self::default()
        }
    }
}

/// Published on the request channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
    pub request_id: String,
    pub app_id: String,
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<RequestOptions>,
}

impl RequestBody {
    fn opt<'a>(&'a self, pick: impl Fn(&'a RequestOptions) -> Option<&'a String>) -> &'a str {
        self.opts
            .as_ref()
            .and_then(pick)
            .map_or("", String::as_str)
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        self.opt(|o| o.channel.as_ref())
    }

    #[must_use]
    pub fn ws_id(&self) -> &str {
        self.opt(|o| o.ws_id.as_ref())
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        self.opt(|o| o.user_id.as_ref())
    }
}

/// Published on the response channel. Only the fields of the request's kind are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sockets: Option<Vec<Socket>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<(String, Vec<String>)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels_with_sockets_count: Option<Vec<(String, usize)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<(String, Value)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
}

impl ResponseBody {
    #[must_use]
    pub fn empty(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            ..Self::default()
        }
    }
}

/// Published on the broadcast channel for every `send`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    /// Origin node
    pub uuid: String,
    pub app_id: String,
    pub channel: String,
    pub data: String,
    #[serde(default)]
    pub excepting_id: Option<String>,
}
