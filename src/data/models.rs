//! Data models
//!
//! Rust structs representing database entities.
//! Local ids are SQLite rowids; dates are epoch milliseconds (0 = unknown).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Origin
// =============================================================================

/// A remote backend instance
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Origin {
    pub id: i64,
    /// API dialect, e.g. "mastodon", "gnusocial"
    pub origin_type: String,
    pub name: String,
    /// Base URL of the instance
    pub url: String,
    pub ssl: bool,
    pub allow_html: bool,
    /// Maximum message length; 0 when unlimited or unknown
    pub text_limit: i64,
}

/// Values needed to register an origin
#[derive(Debug, Clone)]
pub struct NewOrigin {
    pub origin_type: String,
    pub name: String,
    pub url: String,
    pub ssl: bool,
    pub allow_html: bool,
    pub text_limit: i64,
}

// =============================================================================
// User
// =============================================================================

/// A participant known to the system
///
/// Local accounts are ordinary users; the account is identified by its user id.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub origin_id: i64,
    pub remote_id: Option<String>,
    pub username: String,
    pub webfinger_id: Option<String>,
    pub real_name: Option<String>,
    pub avatar_url: Option<String>,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub url: Option<String>,
    pub created_date: i64,
    pub latest_msg_id: i64,
    pub latest_msg_date: i64,
}

// =============================================================================
// Message
// =============================================================================

/// A unit of content
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub origin_id: i64,
    pub remote_id: Option<String>,
    /// Original creator (differs from sender for reblogs)
    pub author_id: Option<i64>,
    /// Who transmitted it; kept from the first full observation
    pub sender_id: Option<i64>,
    pub recipient_id: Option<i64>,
    pub body: String,
    /// Source-client label
    pub via: Option<String>,
    /// Permalink
    pub url: Option<String>,
    pub in_reply_to_msg_id: Option<i64>,
    pub in_reply_to_user_id: Option<i64>,
    pub created_date: i64,
    /// Ordering date; only ever increases
    pub sent_date: i64,
    pub public: bool,
}

impl Message {
    /// A stub row exists only as a reference target (e.g. a reply parent)
    pub fn is_stub(&self) -> bool {
        self.sender_id.is_none() && self.sent_date == 0
    }
}

/// Relationship of one local account to one message
#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageAccountFlags {
    pub user_id: i64,
    pub message_id: i64,
    pub subscribed: bool,
    pub favorited: bool,
    pub reblogged: bool,
    /// Remote id of the reblog activity, needed to undo it
    pub reblog_remote_id: Option<String>,
    pub mentioned: bool,
    pub replied: bool,
    pub directed: bool,
}

/// Follow relation between two users
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowRelation {
    pub user_id: i64,
    pub followed_user_id: i64,
    pub followed: bool,
}

// =============================================================================
// Identity kinds
// =============================================================================

/// Entity kinds with a remote identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Message,
    User,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::User => "user",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Message => "messages",
            Self::User => "users",
        }
    }
}

// =============================================================================
// Timeline kinds
// =============================================================================

/// Timelines that can be synchronized and displayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    /// Messages the account is subscribed to
    Home,
    Favorites,
    Mentions,
    Direct,
    /// Messages sent or authored by the account
    Own,
    /// Messages sent or authored by one given user
    User,
    Public,
    /// Latest message of each user the account follows
    Following,
    /// Everything stored for one origin
    Everything,
    /// Mentions, replies and direct messages waiting for the account
    NeedsAction,
}

/// Column names of one per-account sync checkpoint
#[derive(Debug, Clone, Copy)]
pub(crate) struct CheckpointColumns {
    pub position: &'static str,
    pub item_date: &'static str,
    pub downloaded_date: &'static str,
}

impl TimelineKind {
    pub const ALL: [TimelineKind; 10] = [
        Self::Home,
        Self::Favorites,
        Self::Mentions,
        Self::Direct,
        Self::Own,
        Self::User,
        Self::Public,
        Self::Following,
        Self::Everything,
        Self::NeedsAction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Favorites => "favorites",
            Self::Mentions => "mentions",
            Self::Direct => "direct",
            Self::Own => "own",
            Self::User => "user",
            Self::Public => "public",
            Self::Following => "following",
            Self::Everything => "everything",
            Self::NeedsAction => "needs_action",
        }
    }

    /// Whether this timeline keeps a per-account checkpoint
    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint_columns().is_some()
    }

    pub(crate) fn checkpoint_columns(&self) -> Option<CheckpointColumns> {
        let columns = match self {
            Self::Home => CheckpointColumns {
                position: "home_position",
                item_date: "home_item_date",
                downloaded_date: "home_downloaded_date",
            },
            Self::Favorites => CheckpointColumns {
                position: "favorites_position",
                item_date: "favorites_item_date",
                downloaded_date: "favorites_downloaded_date",
            },
            Self::Direct => CheckpointColumns {
                position: "direct_position",
                item_date: "direct_item_date",
                downloaded_date: "direct_downloaded_date",
            },
            Self::Mentions => CheckpointColumns {
                position: "mentions_position",
                item_date: "mentions_item_date",
                downloaded_date: "mentions_downloaded_date",
            },
            Self::Own => CheckpointColumns {
                position: "own_position",
                item_date: "own_item_date",
                downloaded_date: "own_downloaded_date",
            },
            _ => return None,
        };
        Some(columns)
    }
}

impl fmt::Display for TimelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimelineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown timeline kind: {s}"))
    }
}

// =============================================================================
// Downloads
// =============================================================================

/// What a download belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadKind {
    Avatar,
    Attachment,
}

impl DownloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avatar => "avatar",
            Self::Attachment => "attachment",
        }
    }
}

/// Media type of a downloadable file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Image,
    Video,
    Text,
    #[default]
    Unknown,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Text => "text",
            Self::Unknown => "unknown",
        }
    }

    /// Guess from a MIME type such as "image/png"
    pub fn from_mime_type(mime_type: &str) -> Self {
        match mime_type.split('/').next().unwrap_or_default() {
            "image" => Self::Image,
            "video" => Self::Video,
            "text" => Self::Text,
            _ => Self::Unknown,
        }
    }
}

/// Retrieval state of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Absent,
    Loaded,
    /// Transient failure; retried on a later pass
    SoftError,
    /// Permanent failure; never retried automatically
    HardError,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Loaded => "loaded",
            Self::SoftError => "soft_error",
            Self::HardError => "hard_error",
        }
    }
}

/// Stored download row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Download {
    pub id: i64,
    pub download_kind: String,
    pub user_id: Option<i64>,
    pub message_id: Option<i64>,
    pub content_kind: String,
    pub url: String,
    pub valid_from: i64,
    pub loaded_date: i64,
    pub status: String,
    pub filename: Option<String>,
}

impl Download {
    pub fn is_loaded(&self) -> bool {
        self.status == DownloadStatus::Loaded.as_str()
    }
}
