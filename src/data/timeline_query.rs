//! Timeline query plans
//!
//! A timeline is the `messages` table, optionally pre-filtered or replaced
//! by a derived table, plus only the joins the requested columns need.
//! Joins come from a fixed, ordered rule list; each rule is appended only
//! when its predicate holds for the request.

use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};
use std::str::FromStr;

use super::models::TimelineKind;
use crate::error::AppError;

/// Default page size
pub const DEFAULT_TIMELINE_LIMIT: u32 = 40;

// =============================================================================
// Columns
// =============================================================================

/// Optional columns a view may request on top of the message core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    AuthorName,
    SenderName,
    InReplyToName,
    RecipientName,
    /// Local file of the author's avatar
    AvatarFile,
    /// Local file of the first loaded image attachment
    AttachmentImage,
    /// Whether the account follows the sender / author
    FollowFlags,
    /// Favorited / reblogged / mentioned for the account
    AccountFlags,
}

impl Column {
    pub const ALL: [Column; 8] = [
        Self::AuthorName,
        Self::SenderName,
        Self::InReplyToName,
        Self::RecipientName,
        Self::AvatarFile,
        Self::AttachmentImage,
        Self::FollowFlags,
        Self::AccountFlags,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorName => "author_name",
            Self::SenderName => "sender_name",
            Self::InReplyToName => "in_reply_to_name",
            Self::RecipientName => "recipient_name",
            Self::AvatarFile => "avatar_file",
            Self::AttachmentImage => "attachment_image",
            Self::FollowFlags => "follow_flags",
            Self::AccountFlags => "account_flags",
        }
    }

    fn bit(&self) -> u16 {
        1 << (*self as u16)
    }
}

impl FromStr for Column {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|column| column.as_str() == normalized)
            .ok_or_else(|| format!("unknown timeline column: {s}"))
    }
}

/// Set of requested optional columns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnSet(u16);

impl ColumnSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Column::ALL.into_iter().collect()
    }

    pub fn with(mut self, column: Column) -> Self {
        self.0 |= column.bit();
        self
    }

    pub fn contains(&self, column: Column) -> bool {
        self.0 & column.bit() != 0
    }
}

impl FromIterator<Column> for ColumnSet {
    fn from_iter<I: IntoIterator<Item = Column>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

// =============================================================================
// Request
// =============================================================================

/// What to show
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineRequest {
    pub kind: TimelineKind,
    /// Observing account (local user id)
    pub account_id: Option<i64>,
    /// Restrict to one origin
    pub origin_id: Option<i64>,
    /// Subject of a `User` timeline
    pub user_id: Option<i64>,
    pub columns: ColumnSet,
    /// Only messages sent strictly before this date
    pub older_than: Option<i64>,
    pub limit: u32,
}

impl TimelineRequest {
    pub fn new(kind: TimelineKind) -> Self {
        Self {
            kind,
            account_id: None,
            origin_id: None,
            user_id: None,
            columns: ColumnSet::empty(),
            older_than: None,
            limit: DEFAULT_TIMELINE_LIMIT,
        }
    }

    pub fn for_account(mut self, account_id: i64) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn at_origin(mut self, origin_id: i64) -> Self {
        self.origin_id = Some(origin_id);
        self
    }

    pub fn of_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_columns(mut self, columns: ColumnSet) -> Self {
        self.columns = columns;
        self
    }

    pub fn older_than(mut self, sent_date: i64) -> Self {
        self.older_than = Some(sent_date);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    fn account(&self) -> i64 {
        self.account_id.unwrap_or_default()
    }
}

/// Kinds selected through the account's flags row
fn filters_by_flags(kind: TimelineKind) -> bool {
    matches!(
        kind,
        TimelineKind::Home
            | TimelineKind::Favorites
            | TimelineKind::Mentions
            | TimelineKind::Direct
            | TimelineKind::NeedsAction
    )
}

// =============================================================================
// Join rules
// =============================================================================

struct JoinRule {
    name: &'static str,
    needed: fn(&TimelineRequest) -> bool,
    push: fn(&mut QueryBuilder<'static, Sqlite>, &TimelineRequest),
}

fn needs_account_flags(request: &TimelineRequest) -> bool {
    filters_by_flags(request.kind) || request.columns.contains(Column::AccountFlags)
}

fn push_account_flags(builder: &mut QueryBuilder<'static, Sqlite>, request: &TimelineRequest) {
    if filters_by_flags(request.kind) {
        builder.push(" INNER JOIN message_account_flags AS f");
    } else {
        builder.push(" LEFT JOIN message_account_flags AS f");
    }
    builder.push(" ON f.message_id = m.id AND f.user_id = ");
    builder.push_bind(request.account());
}

fn needs_author(request: &TimelineRequest) -> bool {
    request.columns.contains(Column::AuthorName)
}

fn push_author(builder: &mut QueryBuilder<'static, Sqlite>, _: &TimelineRequest) {
    builder.push(" LEFT JOIN users AS author ON author.id = m.author_id");
}

fn needs_sender(request: &TimelineRequest) -> bool {
    request.columns.contains(Column::SenderName)
}

fn push_sender(builder: &mut QueryBuilder<'static, Sqlite>, _: &TimelineRequest) {
    builder.push(" LEFT JOIN users AS sender ON sender.id = m.sender_id");
}

fn needs_reply_user(request: &TimelineRequest) -> bool {
    request.columns.contains(Column::InReplyToName)
}

fn push_reply_user(builder: &mut QueryBuilder<'static, Sqlite>, _: &TimelineRequest) {
    builder.push(" LEFT JOIN users AS reply_user ON reply_user.id = m.in_reply_to_user_id");
}

fn needs_recipient(request: &TimelineRequest) -> bool {
    request.columns.contains(Column::RecipientName)
}

fn push_recipient(builder: &mut QueryBuilder<'static, Sqlite>, _: &TimelineRequest) {
    builder.push(" LEFT JOIN users AS recipient ON recipient.id = m.recipient_id");
}

fn needs_avatar(request: &TimelineRequest) -> bool {
    request.columns.contains(Column::AvatarFile)
}

fn push_avatar(builder: &mut QueryBuilder<'static, Sqlite>, _: &TimelineRequest) {
    builder.push(
        " LEFT JOIN downloads AS avatar ON avatar.user_id = COALESCE(m.author_id, m.sender_id) \
         AND avatar.download_kind = 'avatar' AND avatar.status = 'loaded'",
    );
}

fn needs_attachment(request: &TimelineRequest) -> bool {
    request.columns.contains(Column::AttachmentImage)
}

fn push_attachment(builder: &mut QueryBuilder<'static, Sqlite>, _: &TimelineRequest) {
    builder.push(
        " LEFT JOIN downloads AS attachment ON attachment.id = (\
         SELECT MIN(d.id) FROM downloads AS d WHERE d.message_id = m.id \
         AND d.download_kind = 'attachment' AND d.content_kind = 'image' AND d.status = 'loaded')",
    );
}

fn needs_follow_flags(request: &TimelineRequest) -> bool {
    request.columns.contains(Column::FollowFlags)
}

fn push_follow_flags(builder: &mut QueryBuilder<'static, Sqlite>, request: &TimelineRequest) {
    builder.push(" LEFT JOIN following AS sender_follow ON sender_follow.user_id = ");
    builder.push_bind(request.account());
    builder.push(" AND sender_follow.followed_user_id = m.sender_id");
    builder.push(" LEFT JOIN following AS author_follow ON author_follow.user_id = ");
    builder.push_bind(request.account());
    builder.push(" AND author_follow.followed_user_id = m.author_id");
}

const JOIN_RULES: [JoinRule; 8] = [
    JoinRule {
        name: "account_flags",
        needed: needs_account_flags,
        push: push_account_flags,
    },
    JoinRule {
        name: "author",
        needed: needs_author,
        push: push_author,
    },
    JoinRule {
        name: "sender",
        needed: needs_sender,
        push: push_sender,
    },
    JoinRule {
        name: "reply_user",
        needed: needs_reply_user,
        push: push_reply_user,
    },
    JoinRule {
        name: "recipient",
        needed: needs_recipient,
        push: push_recipient,
    },
    JoinRule {
        name: "avatar",
        needed: needs_avatar,
        push: push_avatar,
    },
    JoinRule {
        name: "attachment",
        needed: needs_attachment,
        push: push_attachment,
    },
    JoinRule {
        name: "follow_flags",
        needed: needs_follow_flags,
        push: push_follow_flags,
    },
];

// =============================================================================
// Plan
// =============================================================================

/// A validated timeline request with its join plan
#[derive(Debug, Clone)]
pub struct TimelineQuery {
    request: TimelineRequest,
    joins: Vec<&'static str>,
}

impl TimelineQuery {
    /// Validate the request and choose the joins it needs
    ///
    /// # Errors
    /// Validation error when the kind or the columns need an account,
    /// user or origin the request does not name
    pub fn plan(request: TimelineRequest) -> Result<Self, AppError> {
        let needs_account = filters_by_flags(request.kind)
            || matches!(request.kind, TimelineKind::Own | TimelineKind::Following)
            || request.columns.contains(Column::AccountFlags)
            || request.columns.contains(Column::FollowFlags);
        if needs_account && request.account_id.is_none() {
            return Err(AppError::Validation(format!(
                "{} timeline with these columns requires an account",
                request.kind
            )));
        }
        if request.kind == TimelineKind::User && request.user_id.is_none() {
            return Err(AppError::Validation(
                "user timeline requires a user id".to_string(),
            ));
        }
        if request.kind == TimelineKind::Everything && request.origin_id.is_none() {
            return Err(AppError::Validation(
                "everything timeline requires an origin id".to_string(),
            ));
        }

        let joins = JOIN_RULES
            .iter()
            .filter(|rule| (rule.needed)(&request))
            .map(|rule| rule.name)
            .collect();

        Ok(Self { request, joins })
    }

    pub fn request(&self) -> &TimelineRequest {
        &self.request
    }

    /// Names of the joins in the order they are applied
    pub fn join_names(&self) -> &[&'static str] {
        &self.joins
    }

    /// Render the plan into a bound query
    pub fn build(&self) -> QueryBuilder<'static, Sqlite> {
        let request = &self.request;
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT m.id, m.origin_id, m.remote_id, m.author_id, m.sender_id, m.recipient_id, \
             m.body, m.in_reply_to_msg_id, m.created_date, m.sent_date, m.public",
        );
        self.push_select(&mut builder);
        self.push_base(&mut builder);

        for rule in JOIN_RULES.iter() {
            if self.joins.contains(&rule.name) {
                (rule.push)(&mut builder, request);
            }
        }

        self.push_filters(&mut builder);
        builder.push(" ORDER BY m.sent_date DESC, m.id DESC LIMIT ");
        builder.push_bind(i64::from(request.limit));
        builder
    }

    /// SQL text of the plan, for logging and tests
    pub fn sql(&self) -> String {
        self.build().sql().to_string()
    }

    fn push_select(&self, builder: &mut QueryBuilder<'static, Sqlite>) {
        let columns = &self.request.columns;
        let pick = |column: Column, expression: &'static str| {
            if columns.contains(column) {
                expression
            } else {
                "NULL"
            }
        };
        let select = [
            (pick(Column::AuthorName, "author.username"), "author_name"),
            (pick(Column::SenderName, "sender.username"), "sender_name"),
            (pick(Column::InReplyToName, "reply_user.username"), "in_reply_to_name"),
            (pick(Column::RecipientName, "recipient.username"), "recipient_name"),
            (pick(Column::AvatarFile, "avatar.filename"), "avatar_file"),
            (pick(Column::AttachmentImage, "attachment.filename"), "attachment_file"),
            (pick(Column::FollowFlags, "sender_follow.followed"), "sender_followed"),
            (pick(Column::FollowFlags, "author_follow.followed"), "author_followed"),
            (pick(Column::AccountFlags, "f.favorited"), "favorited"),
            (pick(Column::AccountFlags, "f.reblogged"), "reblogged"),
            (pick(Column::AccountFlags, "f.mentioned"), "mentioned"),
        ];
        for (expression, alias) in select {
            builder.push(format!(", {expression} AS {alias}"));
        }
    }

    fn push_base(&self, builder: &mut QueryBuilder<'static, Sqlite>) {
        let request = &self.request;
        match request.kind {
            TimelineKind::Public => {
                builder.push(" FROM (SELECT * FROM messages WHERE public = 1) AS m");
            }
            TimelineKind::Everything => {
                builder.push(" FROM (SELECT * FROM messages WHERE origin_id = ");
                builder.push_bind(request.origin_id.unwrap_or_default());
                builder.push(") AS m");
            }
            TimelineKind::Following => {
                // One row per followed user: the message its activity pointer names
                builder.push(
                    " FROM (SELECT fw.followed_user_id AS followed_user_id, \
                     u.latest_msg_id AS latest_msg_id \
                     FROM following AS fw JOIN users AS u ON u.id = fw.followed_user_id \
                     WHERE fw.followed = 1 AND u.latest_msg_id <> 0 AND fw.user_id = ",
                );
                builder.push_bind(request.account());
                builder.push(") AS latest JOIN messages AS m ON m.id = latest.latest_msg_id");
            }
            _ => {
                builder.push(" FROM messages AS m");
            }
        }
    }

    fn push_filters(&self, builder: &mut QueryBuilder<'static, Sqlite>) {
        let request = &self.request;
        let mut first = true;
        let mut condition = |builder: &mut QueryBuilder<'static, Sqlite>| {
            builder.push(if first { " WHERE " } else { " AND " });
            first = false;
        };

        match request.kind {
            TimelineKind::Home => {
                condition(builder);
                builder.push("f.subscribed = 1");
            }
            TimelineKind::Favorites => {
                condition(builder);
                builder.push("f.favorited = 1");
            }
            TimelineKind::Mentions => {
                condition(builder);
                builder.push("f.mentioned = 1");
            }
            TimelineKind::Direct => {
                condition(builder);
                builder.push("f.directed = 1");
            }
            TimelineKind::NeedsAction => {
                condition(builder);
                builder.push("(f.mentioned = 1 OR f.directed = 1 OR f.replied = 1)");
            }
            TimelineKind::Own | TimelineKind::User => {
                let user_id = if request.kind == TimelineKind::Own {
                    request.account()
                } else {
                    request.user_id.unwrap_or_default()
                };
                condition(builder);
                builder.push("(m.sender_id = ");
                builder.push_bind(user_id);
                builder.push(" OR m.author_id = ");
                builder.push_bind(user_id);
                builder.push(")");
            }
            TimelineKind::Public | TimelineKind::Following | TimelineKind::Everything => {}
        }

        if let Some(origin_id) = request.origin_id {
            if request.kind != TimelineKind::Everything {
                condition(builder);
                builder.push("m.origin_id = ");
                builder.push_bind(origin_id);
            }
        }

        if let Some(older_than) = request.older_than {
            condition(builder);
            builder.push("m.sent_date < ");
            builder.push_bind(older_than);
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

/// One displayed timeline entry; unrequested columns are None
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TimelineRow {
    pub id: i64,
    pub origin_id: i64,
    pub remote_id: Option<String>,
    pub author_id: Option<i64>,
    pub sender_id: Option<i64>,
    pub recipient_id: Option<i64>,
    pub body: String,
    pub in_reply_to_msg_id: Option<i64>,
    pub created_date: i64,
    pub sent_date: i64,
    pub public: bool,
    pub author_name: Option<String>,
    pub sender_name: Option<String>,
    pub in_reply_to_name: Option<String>,
    pub recipient_name: Option<String>,
    pub avatar_file: Option<String>,
    pub attachment_file: Option<String>,
    pub sender_followed: Option<bool>,
    pub author_followed: Option<bool>,
    pub favorited: Option<bool>,
    pub reblogged: Option<bool>,
    pub mentioned: Option<bool>,
}
