//! SQLite database operations
//!
//! All database access goes through this module.
//! Uses SQLx with an embedded migration directory.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::time::Duration;

use super::models::*;
use super::timeline_query::{TimelineQuery, TimelineRow};
use crate::error::AppError;

/// Pool sizing and locking behaviour
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// A single bindable column value
#[derive(Debug, Clone, PartialEq)]
enum ColumnValue {
    Int(i64),
    Text(String),
    Bool(bool),
}

fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: ColumnValue) {
    match value {
        ColumnValue::Int(v) => builder.push_bind(v),
        ColumnValue::Text(v) => builder.push_bind(v),
        ColumnValue::Bool(v) => builder.push_bind(v),
    };
}

/// Build `INSERT INTO table (a, b) VALUES (?, ?)` from column/value pairs
fn build_insert(
    table: &str,
    columns: Vec<(&'static str, ColumnValue)>,
) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!("INSERT INTO {table} ("));
    let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
    builder.push(names.join(", "));
    builder.push(") VALUES (");
    for (index, (_, value)) in columns.into_iter().enumerate() {
        if index > 0 {
            builder.push(", ");
        }
        push_value(&mut builder, value);
    }
    builder.push(")");
    builder
}

/// Columns that only ever increase, whatever the writer order
const MONOTONIC_COLUMNS: [&str; 1] = ["sent_date"];

/// Build `UPDATE table SET a = ?, b = ? WHERE id = ?` from column/value pairs
fn build_update(
    table: &str,
    id: i64,
    columns: Vec<(&'static str, ColumnValue)>,
) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!("UPDATE {table} SET "));
    for (index, (name, value)) in columns.into_iter().enumerate() {
        if index > 0 {
            builder.push(", ");
        }
        if MONOTONIC_COLUMNS.contains(&name) {
            builder.push(format!("{name} = MAX({name}, "));
            push_value(&mut builder, value);
            builder.push(")");
        } else {
            builder.push(name);
            builder.push(" = ");
            push_value(&mut builder, value);
        }
    }
    builder.push(" WHERE id = ");
    builder.push_bind(id);
    builder
}

// =============================================================================
// Write sets
// =============================================================================

/// Columns of a message row to write; `None` leaves the stored value alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageChanges {
    pub origin_id: Option<i64>,
    pub remote_id: Option<String>,
    pub author_id: Option<i64>,
    pub sender_id: Option<i64>,
    pub recipient_id: Option<i64>,
    pub body: Option<String>,
    pub via: Option<String>,
    pub url: Option<String>,
    pub in_reply_to_msg_id: Option<i64>,
    pub in_reply_to_user_id: Option<i64>,
    pub created_date: Option<i64>,
    pub sent_date: Option<i64>,
    pub public: Option<bool>,
}

impl MessageChanges {
    fn columns(&self) -> Vec<(&'static str, ColumnValue)> {
        let mut columns = Vec::new();
        let ints = [
            ("origin_id", self.origin_id),
            ("author_id", self.author_id),
            ("sender_id", self.sender_id),
            ("recipient_id", self.recipient_id),
            ("in_reply_to_msg_id", self.in_reply_to_msg_id),
            ("in_reply_to_user_id", self.in_reply_to_user_id),
            ("created_date", self.created_date),
            ("sent_date", self.sent_date),
        ];
        for (name, value) in ints {
            if let Some(value) = value {
                columns.push((name, ColumnValue::Int(value)));
            }
        }
        let texts = [
            ("remote_id", &self.remote_id),
            ("body", &self.body),
            ("via", &self.via),
            ("url", &self.url),
        ];
        for (name, value) in texts {
            if let Some(value) = value {
                columns.push((name, ColumnValue::Text(value.clone())));
            }
        }
        if let Some(public) = self.public {
            columns.push(("public", ColumnValue::Bool(public)));
        }
        columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns().is_empty()
    }
}

/// Columns of a user row to write; `None` leaves the stored value alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserChanges {
    pub origin_id: Option<i64>,
    pub remote_id: Option<String>,
    pub username: Option<String>,
    pub webfinger_id: Option<String>,
    pub real_name: Option<String>,
    pub avatar_url: Option<String>,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub url: Option<String>,
    pub created_date: Option<i64>,
}

impl UserChanges {
    fn columns(&self) -> Vec<(&'static str, ColumnValue)> {
        let mut columns = Vec::new();
        if let Some(origin_id) = self.origin_id {
            columns.push(("origin_id", ColumnValue::Int(origin_id)));
        }
        let texts = [
            ("remote_id", &self.remote_id),
            ("username", &self.username),
            ("webfinger_id", &self.webfinger_id),
            ("real_name", &self.real_name),
            ("avatar_url", &self.avatar_url),
            ("description", &self.description),
            ("homepage", &self.homepage),
            ("url", &self.url),
        ];
        for (name, value) in texts {
            if let Some(value) = value {
                columns.push((name, ColumnValue::Text(value.clone())));
            }
        }
        if let Some(created_date) = self.created_date {
            columns.push(("created_date", ColumnValue::Int(created_date)));
        }
        columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns().is_empty()
    }
}

/// Flag changes for one (message, account) pair
///
/// Set-once flags are only ever raised; `favorited` and `reblogged`
/// replace the stored value when present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagsUpdate {
    pub user_id: i64,
    pub message_id: i64,
    pub subscribed: bool,
    pub favorited: Option<bool>,
    pub reblogged: Option<bool>,
    pub reblog_remote_id: Option<String>,
    pub mentioned: bool,
    pub replied: bool,
    pub directed: bool,
}

impl FlagsUpdate {
    /// Nothing to record
    pub fn is_noop(&self) -> bool {
        !self.subscribed
            && self.favorited.is_none()
            && self.reblogged.is_none()
            && !self.mentioned
            && !self.replied
            && !self.directed
    }
}

/// Stored sync checkpoint of one timeline of one account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointRow {
    pub position: Option<String>,
    pub item_date: i64,
    pub downloaded_date: i64,
}

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        Self::connect_with_options(path, &ConnectOptions::default()).await
    }

    /// Connect with explicit pool options
    pub async fn connect_with_options(
        path: &Path,
        options: &ConnectOptions,
    ) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(options.busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect_options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!("Migration failed: {}", e);
            AppError::Migration(e)
        })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Origin
    // =========================================================================

    /// Register a new origin
    pub async fn insert_origin(&self, origin: &NewOrigin) -> Result<i64, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO origins (origin_type, name, url, ssl, allow_html, text_limit)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&origin.origin_type)
        .bind(&origin.name)
        .bind(&origin.url)
        .bind(origin.ssl)
        .bind(origin.allow_html)
        .bind(origin.text_limit)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Get origin by ID
    pub async fn get_origin(&self, id: i64) -> Result<Option<Origin>, AppError> {
        let origin = sqlx::query_as::<_, Origin>("SELECT * FROM origins WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(origin)
    }

    /// Get origin by its unique name
    pub async fn get_origin_by_name(&self, name: &str) -> Result<Option<Origin>, AppError> {
        let origin = sqlx::query_as::<_, Origin>("SELECT * FROM origins WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(origin)
    }

    /// List all origins
    pub async fn get_origins(&self) -> Result<Vec<Origin>, AppError> {
        let origins = sqlx::query_as::<_, Origin>("SELECT * FROM origins ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(origins)
    }

    /// Update capability flags of an origin
    ///
    /// Name, type and URL stay fixed once created.
    pub async fn update_origin_capabilities(
        &self,
        id: i64,
        allow_html: bool,
        text_limit: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE origins SET allow_html = ?, text_limit = ? WHERE id = ?")
            .bind(allow_html)
            .bind(text_limit)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Local id of the entity with this remote id, if stored
    pub async fn find_local_id(
        &self,
        kind: EntityKind,
        origin_id: i64,
        remote_id: &str,
    ) -> Result<Option<i64>, AppError> {
        let query = format!(
            "SELECT id FROM {} WHERE origin_id = ? AND remote_id = ?",
            kind.table()
        );
        let id = sqlx::query_scalar::<_, i64>(&query)
            .bind(origin_id)
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(id)
    }

    /// Remote id of a stored entity
    pub async fn find_remote_id(
        &self,
        kind: EntityKind,
        id: i64,
    ) -> Result<Option<String>, AppError> {
        let query = format!("SELECT remote_id FROM {} WHERE id = ?", kind.table());
        let remote_id = sqlx::query_scalar::<_, Option<String>>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(remote_id.flatten().filter(|value| !value.is_empty()))
    }

    /// Local user id by (origin, username)
    ///
    /// Several users may share a stale username; a user without a remote
    /// id wins, then the most recently created one.
    pub async fn find_user_id_by_username(
        &self,
        origin_id: i64,
        username: &str,
    ) -> Result<Option<i64>, AppError> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM users WHERE origin_id = ? AND username = ? \
             ORDER BY remote_id IS NOT NULL, id DESC LIMIT 1",
        )
        .bind(origin_id)
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    /// Remote id of the reblog activity an account made of a message
    pub async fn find_reblog_remote_id(
        &self,
        message_id: i64,
        user_id: i64,
    ) -> Result<Option<String>, AppError> {
        let remote_id = sqlx::query_scalar::<_, Option<String>>(
            r#"
            SELECT reblog_remote_id FROM message_account_flags
            WHERE message_id = ? AND user_id = ? AND reblogged = 1
            "#,
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(remote_id.flatten().filter(|value| !value.is_empty()))
    }

    // =========================================================================
    // User
    // =========================================================================

    /// Get user by ID
    pub async fn get_user(&self, id: i64) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Insert a new user, returning its local id
    ///
    /// # Errors
    /// Fails with a unique violation when another writer stored the
    /// same (origin, remote id) or (origin, username) first.
    pub async fn insert_user(&self, changes: &UserChanges) -> Result<i64, AppError> {
        if changes.origin_id.is_none() || changes.username.is_none() {
            return Err(AppError::Validation(
                "user insert requires origin_id and username".to_string(),
            ));
        }

        let mut builder = build_insert("users", changes.columns());
        let result = builder.build().execute(&self.pool).await?;

        Ok(result.last_insert_rowid())
    }

    /// Write the given columns of an existing user
    pub async fn update_user(&self, id: i64, changes: &UserChanges) -> Result<(), AppError> {
        let columns = changes.columns();
        if columns.is_empty() {
            return Ok(());
        }

        let mut builder = build_update("users", id, columns);
        builder.build().execute(&self.pool).await?;

        Ok(())
    }

    // =========================================================================
    // Message
    // =========================================================================

    /// Get message by ID
    pub async fn get_message(&self, id: i64) -> Result<Option<Message>, AppError> {
        let message = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(message)
    }

    /// Stored sender of a message
    pub async fn get_message_sender_id(&self, id: i64) -> Result<Option<i64>, AppError> {
        let sender_id =
            sqlx::query_scalar::<_, Option<i64>>("SELECT sender_id FROM messages WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(sender_id.flatten())
    }

    /// Insert a new message, returning its local id
    pub async fn insert_message(&self, changes: &MessageChanges) -> Result<i64, AppError> {
        if changes.origin_id.is_none() {
            return Err(AppError::Validation(
                "message insert requires origin_id".to_string(),
            ));
        }

        let mut builder = build_insert("messages", changes.columns());
        let result = builder.build().execute(&self.pool).await?;

        Ok(result.last_insert_rowid())
    }

    /// Write the given columns of an existing message
    ///
    /// Only touched columns are written; concurrent partial observations
    /// of other columns are not overwritten.
    pub async fn update_message(&self, id: i64, changes: &MessageChanges) -> Result<(), AppError> {
        let columns = changes.columns();
        if columns.is_empty() {
            return Ok(());
        }

        let mut builder = build_update("messages", id, columns);
        builder.build().execute(&self.pool).await?;

        Ok(())
    }

    /// Number of stored messages
    pub async fn count_messages(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Message × account flags
    // =========================================================================

    /// Get the flags row of one (message, account) pair
    pub async fn get_flags(
        &self,
        message_id: i64,
        user_id: i64,
    ) -> Result<Option<MessageAccountFlags>, AppError> {
        let flags = sqlx::query_as::<_, MessageAccountFlags>(
            "SELECT * FROM message_account_flags WHERE message_id = ? AND user_id = ?",
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(flags)
    }

    /// Create or merge the flags row of one (message, account) pair
    pub async fn upsert_flags(&self, update: &FlagsUpdate) -> Result<(), AppError> {
        if update.is_noop() {
            return Ok(());
        }

        // A cleared reblog also forgets the reblog activity id
        let reblog_remote_id = match update.reblogged {
            Some(true) => update.reblog_remote_id.clone(),
            _ => None,
        };

        sqlx::query(
            r#"
            INSERT INTO message_account_flags (
                user_id, message_id, subscribed, favorited, reblogged,
                reblog_remote_id, mentioned, replied, directed
            ) VALUES (?, ?, ?, COALESCE(?, 0), COALESCE(?, 0), ?, ?, ?, ?)
            ON CONFLICT(user_id, message_id) DO UPDATE SET
                subscribed = MAX(subscribed, excluded.subscribed),
                favorited = COALESCE(?, favorited),
                reblogged = COALESCE(?, reblogged),
                reblog_remote_id = CASE WHEN ? IS NULL THEN reblog_remote_id
                                        ELSE excluded.reblog_remote_id END,
                mentioned = MAX(mentioned, excluded.mentioned),
                replied = MAX(replied, excluded.replied),
                directed = MAX(directed, excluded.directed)
            "#,
        )
        .bind(update.user_id)
        .bind(update.message_id)
        .bind(update.subscribed)
        .bind(update.favorited)
        .bind(update.reblogged)
        .bind(&reblog_remote_id)
        .bind(update.mentioned)
        .bind(update.replied)
        .bind(update.directed)
        .bind(update.favorited)
        .bind(update.reblogged)
        .bind(update.reblogged)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Follow relationships
    // =========================================================================

    /// Record whether `user_id` follows `followed_user_id`
    pub async fn upsert_follow(
        &self,
        user_id: i64,
        followed_user_id: i64,
        followed: bool,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO following (user_id, followed_user_id, followed)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id, followed_user_id) DO UPDATE SET followed = excluded.followed
            "#,
        )
        .bind(user_id)
        .bind(followed_user_id)
        .bind(followed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the follow relation between two users
    pub async fn get_follow(
        &self,
        user_id: i64,
        followed_user_id: i64,
    ) -> Result<Option<FollowRelation>, AppError> {
        let relation = sqlx::query_as::<_, FollowRelation>(
            "SELECT * FROM following WHERE user_id = ? AND followed_user_id = ?",
        )
        .bind(user_id)
        .bind(followed_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(relation)
    }

    /// Ids of users currently followed by `user_id`
    pub async fn get_followed_user_ids(&self, user_id: i64) -> Result<Vec<i64>, AppError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT followed_user_id FROM following WHERE user_id = ? AND followed = 1 ORDER BY followed_user_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    // =========================================================================
    // Latest activity & checkpoints
    // =========================================================================

    /// Stored (latest message id, latest message date) of a user
    pub async fn get_user_latest(&self, user_id: i64) -> Result<Option<(i64, i64)>, AppError> {
        let row = sqlx::query("SELECT latest_msg_id, latest_msg_date FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| (row.get("latest_msg_id"), row.get("latest_msg_date"))))
    }

    /// Move the latest-activity pointer forward
    ///
    /// Applies only when the stored date is older, in one statement.
    ///
    /// # Returns
    /// true if the pointer moved
    pub async fn advance_user_latest(
        &self,
        user_id: i64,
        message_id: i64,
        date: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE users SET latest_msg_id = ?, latest_msg_date = ?
            WHERE id = ? AND latest_msg_date < ?
            "#,
        )
        .bind(message_id)
        .bind(date)
        .bind(user_id)
        .bind(date)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Stored checkpoint of one timeline of an account
    pub async fn get_checkpoint(
        &self,
        user_id: i64,
        kind: TimelineKind,
    ) -> Result<Option<CheckpointRow>, AppError> {
        let columns = checkpoint_columns(kind)?;
        let query = format!(
            "SELECT {} AS position, {} AS item_date, {} AS downloaded_date FROM users WHERE id = ?",
            columns.position, columns.item_date, columns.downloaded_date
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| CheckpointRow {
            position: row.get("position"),
            item_date: row.get("item_date"),
            downloaded_date: row.get("downloaded_date"),
        }))
    }

    /// Move a checkpoint's item position/date forward
    pub async fn advance_checkpoint_item(
        &self,
        user_id: i64,
        kind: TimelineKind,
        position: Option<&str>,
        item_date: i64,
    ) -> Result<bool, AppError> {
        let columns = checkpoint_columns(kind)?;
        let query = format!(
            "UPDATE users SET {position} = COALESCE(?, {position}), {item} = ? WHERE id = ? AND {item} < ?",
            position = columns.position,
            item = columns.item_date,
        );
        let result = sqlx::query(&query)
            .bind(position)
            .bind(item_date)
            .bind(user_id)
            .bind(item_date)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Move a checkpoint's downloaded date forward
    pub async fn advance_checkpoint_downloaded(
        &self,
        user_id: i64,
        kind: TimelineKind,
        downloaded_date: i64,
    ) -> Result<bool, AppError> {
        let columns = checkpoint_columns(kind)?;
        let query = format!(
            "UPDATE users SET {dl} = ? WHERE id = ? AND {dl} < ?",
            dl = columns.downloaded_date,
        );
        let result = sqlx::query(&query)
            .bind(downloaded_date)
            .bind(user_id)
            .bind(downloaded_date)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Downloads
    // =========================================================================

    /// Record an attachment of a message
    ///
    /// # Returns
    /// The new row, or None if this (message, url) was already recorded
    pub async fn insert_attachment_download(
        &self,
        message_id: i64,
        url: &str,
        content_kind: ContentKind,
        status: DownloadStatus,
    ) -> Result<Option<Download>, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO downloads (
                download_kind, message_id, content_kind, url, valid_from, status
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(DownloadKind::Attachment.as_str())
        .bind(message_id)
        .bind(content_kind.as_str())
        .bind(url)
        .bind(now_millis())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_download(result.last_insert_rowid()).await
    }

    /// Point a user's avatar at `url`
    ///
    /// A changed URL resets the avatar to absent so it is fetched again.
    ///
    /// # Returns
    /// The avatar row when it was created or reset, None if unchanged
    pub async fn set_avatar_download(
        &self,
        user_id: i64,
        url: &str,
        status: DownloadStatus,
    ) -> Result<Option<Download>, AppError> {
        let now = now_millis();
        let reset = sqlx::query(
            r#"
            UPDATE downloads
            SET url = ?, status = ?, filename = NULL, loaded_date = 0, valid_from = ?
            WHERE user_id = ? AND download_kind = 'avatar' AND url <> ?
            "#,
        )
        .bind(url)
        .bind(status.as_str())
        .bind(now)
        .bind(user_id)
        .bind(url)
        .execute(&self.pool)
        .await?;

        if reset.rows_affected() == 0 {
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO downloads (
                    download_kind, user_id, content_kind, url, valid_from, status
                ) VALUES ('avatar', ?, 'image', ?, ?, ?)
                "#,
            )
            .bind(user_id)
            .bind(url)
            .bind(now)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() == 0 {
                return Ok(None);
            }
        }

        self.get_avatar_download(user_id).await
    }

    /// Get download by ID
    pub async fn get_download(&self, id: i64) -> Result<Option<Download>, AppError> {
        let download = sqlx::query_as::<_, Download>("SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(download)
    }

    /// Get the avatar download of a user
    pub async fn get_avatar_download(&self, user_id: i64) -> Result<Option<Download>, AppError> {
        let download = sqlx::query_as::<_, Download>(
            "SELECT * FROM downloads WHERE user_id = ? AND download_kind = 'avatar'",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(download)
    }

    /// Get attachment downloads of a message
    pub async fn get_message_downloads(&self, message_id: i64) -> Result<Vec<Download>, AppError> {
        let downloads = sqlx::query_as::<_, Download>(
            "SELECT * FROM downloads WHERE message_id = ? ORDER BY id",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(downloads)
    }

    /// Downloads still waiting to be fetched (absent or soft error)
    pub async fn get_pending_downloads(&self, limit: usize) -> Result<Vec<Download>, AppError> {
        let downloads = sqlx::query_as::<_, Download>(
            r#"
            SELECT * FROM downloads
            WHERE status IN ('absent', 'soft_error')
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(downloads)
    }

    /// Record the outcome of a download attempt
    pub async fn update_download_status(
        &self,
        id: i64,
        status: DownloadStatus,
        filename: Option<&str>,
    ) -> Result<bool, AppError> {
        let loaded_date = match status {
            DownloadStatus::Loaded => now_millis(),
            _ => 0,
        };
        let result = sqlx::query(
            r#"
            UPDATE downloads
            SET status = ?, filename = COALESCE(?, filename), loaded_date = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(filename)
        .bind(loaded_date)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Timelines
    // =========================================================================

    /// Run a planned timeline query
    pub async fn fetch_timeline(&self, query: &TimelineQuery) -> Result<Vec<TimelineRow>, AppError> {
        let mut builder = query.build();
        let rows = builder
            .build_query_as::<TimelineRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }
}

fn checkpoint_columns(kind: TimelineKind) -> Result<CheckpointColumns, AppError> {
    kind.checkpoint_columns().ok_or_else(|| {
        AppError::Validation(format!("timeline kind {kind} has no sync checkpoint"))
    })
}
