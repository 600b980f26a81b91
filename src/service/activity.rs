//! Latest-activity tracking
//!
//! Per-user "most recent message" pointers and per-account sync
//! checkpoints. Both only move forward: values are advanced in memory
//! and saved with conditional UPDATEs that never overwrite a newer
//! stored value.

use std::sync::Arc;
use std::time::Duration;

use crate::data::{now_millis, Database, TimelineKind};
use crate::error::AppError;

/// Latest message pointer of one user
pub struct UserActivityPointer {
    db: Arc<Database>,
    user_id: i64,
    message_id: i64,
    message_date: i64,
    dirty: bool,
}

impl UserActivityPointer {
    /// Load the stored pointer
    ///
    /// # Errors
    /// `NotFound` if the user does not exist
    pub async fn load(db: Arc<Database>, user_id: i64) -> Result<Self, AppError> {
        let (message_id, message_date) = db
            .get_user_latest(user_id)
            .await?
            .ok_or(AppError::NotFound)?;

        Ok(Self {
            db,
            user_id,
            message_id,
            message_date,
            dirty: false,
        })
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    pub fn message_date(&self) -> i64 {
        self.message_date
    }

    /// Note a message by this user; only a strictly newer date counts
    pub fn on_new_message(&mut self, message_id: i64, date: i64) {
        if message_id != 0 && date > self.message_date {
            self.message_id = message_id;
            self.message_date = date;
            self.dirty = true;
        }
    }

    /// Write the pointer if it moved
    ///
    /// When another writer already stored a newer (or equal) date, the
    /// stored value wins and is reloaded.
    ///
    /// # Returns
    /// true if the stored pointer changed
    pub async fn save(&mut self) -> Result<bool, AppError> {
        if !self.dirty {
            return Ok(false);
        }
        self.dirty = false;

        let advanced = self
            .db
            .advance_user_latest(self.user_id, self.message_id, self.message_date)
            .await?;
        if !advanced {
            if let Some((message_id, message_date)) = self.db.get_user_latest(self.user_id).await? {
                tracing::debug!(
                    user_id = self.user_id,
                    stored_date = message_date,
                    ignored_date = self.message_date,
                    "Latest activity already newer in store"
                );
                self.message_id = message_id;
                self.message_date = message_date;
            }
        }

        Ok(advanced)
    }
}

/// Sync checkpoint of one timeline of one account
pub struct SyncCheckpoint {
    db: Arc<Database>,
    user_id: i64,
    kind: TimelineKind,
    position: Option<String>,
    item_date: i64,
    downloaded_date: i64,
    item_changed: bool,
    downloaded_changed: bool,
}

impl SyncCheckpoint {
    /// Load the stored checkpoint
    ///
    /// # Errors
    /// `Validation` for timeline kinds without a checkpoint,
    /// `NotFound` if the account does not exist
    pub async fn load(db: Arc<Database>, kind: TimelineKind, user_id: i64) -> Result<Self, AppError> {
        let row = db
            .get_checkpoint(user_id, kind)
            .await?
            .ok_or(AppError::NotFound)?;

        Ok(Self {
            db,
            user_id,
            kind,
            position: row.position,
            item_date: row.item_date,
            downloaded_date: row.downloaded_date,
            item_changed: false,
            downloaded_changed: false,
        })
    }

    pub fn kind(&self) -> TimelineKind {
        self.kind
    }

    pub fn position(&self) -> Option<&str> {
        self.position.as_deref()
    }

    pub fn item_date(&self) -> i64 {
        self.item_date
    }

    pub fn downloaded_date(&self) -> i64 {
        self.downloaded_date
    }

    /// Note a synced item; older items leave the checkpoint alone
    pub fn on_new_item(&mut self, position: Option<&str>, date: i64) {
        if date <= self.item_date {
            return;
        }
        self.item_date = date;
        if let Some(position) = position.filter(|p| !p.is_empty()) {
            self.position = Some(position.to_string());
        }
        self.item_changed = true;
    }

    /// Mark a completed download pass as of now
    pub fn on_download_completed(&mut self) {
        let now = now_millis();
        if now > self.downloaded_date {
            self.downloaded_date = now;
            self.downloaded_changed = true;
        }
    }

    /// Write the fields that changed
    ///
    /// # Returns
    /// true if anything was written
    pub async fn save(&mut self) -> Result<bool, AppError> {
        let mut written = false;

        if self.item_changed {
            self.item_changed = false;
            written |= self
                .db
                .advance_checkpoint_item(
                    self.user_id,
                    self.kind,
                    self.position.as_deref(),
                    self.item_date,
                )
                .await?;
        }
        if self.downloaded_changed {
            self.downloaded_changed = false;
            written |= self
                .db
                .advance_checkpoint_downloaded(self.user_id, self.kind, self.downloaded_date)
                .await?;
        }

        if written {
            tracing::debug!(
                user_id = self.user_id,
                timeline = %self.kind,
                item_date = self.item_date,
                downloaded_date = self.downloaded_date,
                "Sync checkpoint saved"
            );
        }

        Ok(written)
    }

    /// Whether the last download pass is older than `interval`
    pub fn is_time_to_auto_sync(&self, interval: Duration) -> bool {
        let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
        now_millis() - self.downloaded_date > interval_ms
    }
}
