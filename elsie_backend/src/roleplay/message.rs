use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a chat channel. Either part may be missing depending on what
/// the platform client could supply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMatch {
    Same,
    Different,
    /// Neither ids nor names are available on both sides.
    Unknown,
}

impl ChannelRef {
    pub fn new(id: Option<&str>, name: Option<&str>) -> Self {
        Self {
            id: non_empty(id),
            name: non_empty(name),
        }
    }

    pub fn with_id(id: &str) -> Self {
        Self::new(Some(id), None)
    }

    pub fn with_name(name: &str) -> Self {
        Self::new(None, Some(name))
    }

    /// Registry key: the id when present, otherwise the name prefixed so it
    /// can never collide with an id.
    pub fn session_key(&self) -> Option<String> {
        if let Some(id) = self.id.as_deref() {
            return Some(id.to_string());
        }
        self.name.as_deref().map(|name| format!("name:{}", name))
    }

    pub fn is_identified(&self) -> bool {
        self.id.is_some() || self.name.is_some()
    }

    /// Compare by id when both sides carry one, else by name.
    pub fn compare(&self, other: &ChannelRef) -> ChannelMatch {
        if let (Some(a), Some(b)) = (self.id.as_deref(), other.id.as_deref()) {
            return if a == b {
                ChannelMatch::Same
            } else {
                ChannelMatch::Different
            };
        }
        if let (Some(a), Some(b)) = (self.name.as_deref(), other.name.as_deref()) {
            return if a.eq_ignore_ascii_case(b) {
                ChannelMatch::Same
            } else {
                ChannelMatch::Different
            };
        }
        ChannelMatch::Unknown
    }

    pub fn label(&self) -> String {
        match (self.id.as_deref(), self.name.as_deref()) {
            (Some(id), Some(name)) => format!("#{} ({})", name, id),
            (Some(id), None) => id.to_string(),
            (None, Some(name)) => format!("#{}", name),
            (None, None) => "<unidentified channel>".to_string(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Inbound message as delivered by the chat-platform client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub author_id: String,
    pub raw_text: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_direct_message: bool,
}

impl IncomingMessage {
    pub fn new(channel_id: &str, author_id: &str, raw_text: &str) -> Self {
        Self {
            channel_id: Some(channel_id.to_string()),
            channel_name: None,
            author_id: author_id.to_string(),
            raw_text: raw_text.to_string(),
            timestamp: Utc::now(),
            is_direct_message: false,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn direct(mut self) -> Self {
        self.is_direct_message = true;
        self
    }

    pub fn channel(&self) -> ChannelRef {
        ChannelRef::new(self.channel_id.as_deref(), self.channel_name.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_prefers_id_then_name() {
        assert_eq!(
            ChannelRef::new(Some("123"), Some("ten-forward")).session_key(),
            Some("123".to_string())
        );
        assert_eq!(
            ChannelRef::with_name("ten-forward").session_key(),
            Some("name:ten-forward".to_string())
        );
        assert_eq!(ChannelRef::new(Some("  "), None).session_key(), None);
    }

    #[test]
    fn compare_falls_back_to_names_then_unknown() {
        let bound = ChannelRef::new(Some("1"), Some("bar"));
        assert_eq!(bound.compare(&ChannelRef::with_id("1")), ChannelMatch::Same);
        assert_eq!(
            bound.compare(&ChannelRef::with_id("2")),
            ChannelMatch::Different
        );
        assert_eq!(
            bound.compare(&ChannelRef::with_name("BAR")),
            ChannelMatch::Same
        );
        assert_eq!(
            ChannelRef::with_id("1").compare(&ChannelRef::with_name("bar")),
            ChannelMatch::Unknown
        );
    }

    #[test]
    fn incoming_message_decodes_with_defaults() {
        let message: IncomingMessage = serde_json::from_value(serde_json::json!({
            "channel_id": "c1",
            "author_id": "u1",
            "raw_text": "Hello there"
        }))
        .expect("decode message");
        assert!(!message.is_direct_message);
        assert_eq!(message.channel().session_key(), Some("c1".to_string()));
    }
}
