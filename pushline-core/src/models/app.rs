use serde::{Deserialize, Serialize};

/// Per-tenant limits consulted by the channel join policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct App {
    pub id: String,
    pub max_presence_members_per_channel: usize,
    pub max_presence_member_size_in_kb: f64,
    pub max_channel_name_length: usize,
}

impl Default for App {
    fn default() -> Self {
        Self {
            id: String::new(),
            max_presence_members_per_channel: 100,
            max_presence_member_size_in_kb: 2.0,
            max_channel_name_length: 200,
        }
    }
}

impl App {
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

#[must_use]
pub fn is_presence_channel(channel: &str) -> bool {
    channel.starts_with("presence-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_app_uses_defaults() {
        let app: App = serde_json::from_str(r#"{"id":"a1","max_presence_members_per_channel":2}"#).unwrap();

        assert_eq!(app.max_presence_members_per_channel, 2);
        assert_eq!(app.max_channel_name_length, 200);
        assert!((app.max_presence_member_size_in_kb - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_presence_prefix() {
        assert!(is_presence_channel("presence-room"));
        assert!(!is_presence_channel("private-room"));
    }
}
