//! Normalized records
//!
//! Shapes the origin API layer hands to the reconciliation engine,
//! already translated from each origin's wire format.
//! Empty strings mean "not provided" throughout.

use serde::{Deserialize, Serialize};

use crate::data::ContentKind;

/// A boolean an origin may or may not report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    #[default]
    Unknown,
    True,
    False,
}

impl TriState {
    /// The reported value, if any
    pub fn known(&self) -> Option<bool> {
        match self {
            Self::Unknown => None,
            Self::True => Some(true),
            Self::False => Some(false),
        }
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

impl From<Option<bool>> for TriState {
    fn from(value: Option<bool>) -> Self {
        value.map_or(Self::Unknown, Self::from)
    }
}

/// One attached file of a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedAttachment {
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl NormalizedAttachment {
    pub fn new(url: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mime_type: Some(mime_type.into()),
        }
    }

    pub fn content_kind(&self) -> ContentKind {
        self.mime_type
            .as_deref()
            .map(ContentKind::from_mime_type)
            .unwrap_or_default()
    }
}

/// A user as reported by an origin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizedUser {
    pub remote_id: String,
    pub username: String,
    pub webfinger_id: Option<String>,
    pub real_name: Option<String>,
    pub avatar_url: Option<String>,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub url: Option<String>,
    pub created_date: i64,
    /// Whether `actor` follows this user
    pub followed_by_actor: TriState,
    /// Who `followed_by_actor` is reported for; the observing account when absent
    pub actor: Option<Box<NormalizedUser>>,
    /// Last known message of this user
    pub latest_message: Option<Box<NormalizedMessage>>,
}

impl NormalizedUser {
    pub fn new(remote_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// Neither a remote id nor a username to identify it by
    pub fn is_empty(&self) -> bool {
        self.remote_id.is_empty() && self.username.is_empty()
    }
}

/// A message as reported by an origin
///
/// A reblog arrives as a wrapper whose `reblogged_message` is the original.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizedMessage {
    pub remote_id: String,
    pub body: String,
    pub via: Option<String>,
    pub url: Option<String>,
    pub created_date: i64,
    pub sent_date: i64,
    pub public: bool,
    pub sender: Option<NormalizedUser>,
    pub author: Option<NormalizedUser>,
    /// User the favorited flag is reported for; the sender when absent
    pub actor: Option<NormalizedUser>,
    pub recipient: Option<NormalizedUser>,
    pub in_reply_to: Option<Box<NormalizedMessage>>,
    pub reblogged_message: Option<Box<NormalizedMessage>>,
    pub favorited_by_actor: TriState,
    pub attachments: Vec<NormalizedAttachment>,
}

impl NormalizedMessage {
    pub fn new(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remote_id.is_empty() && self.body.is_empty() && self.reblogged_message.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tri_state_known_values() {
        assert_eq!(TriState::Unknown.known(), None);
        assert_eq!(TriState::from(true).known(), Some(true));
        assert_eq!(TriState::from(Some(false)), TriState::False);
        assert_eq!(TriState::from(None), TriState::Unknown);
    }

    #[test]
    fn message_loads_from_sparse_json() {
        let json = r#"{
            "remote_id": "m1",
            "body": "hello @bob",
            "sent_date": 100,
            "sender": { "remote_id": "u1", "username": "alice" },
            "favorited_by_actor": "true",
            "attachments": [{ "url": "https://o.example/a.png", "mime_type": "image/png" }]
        }"#;

        let message: NormalizedMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.remote_id, "m1");
        assert_eq!(message.sender.as_ref().unwrap().username, "alice");
        assert_eq!(message.favorited_by_actor, TriState::True);
        assert_eq!(message.attachments[0].content_kind(), ContentKind::Image);
        assert!(message.in_reply_to.is_none());
        assert!(!message.public);
    }

    #[test]
    fn empty_records() {
        assert!(NormalizedMessage::default().is_empty());
        assert!(!NormalizedMessage::new("m1").is_empty());
        assert!(NormalizedUser::default().is_empty());
        assert!(!NormalizedUser::new("", "alice").is_empty());
    }
}
