//! Timeline sync service
//!
//! Ingests one fetched page of a timeline and moves the account's
//! checkpoint for that timeline forward. Fetching and scheduling
//! belong to the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::activity::SyncCheckpoint;
use super::ingest::{IngestContext, Reconciler};
use crate::api::{NormalizedMessage, NormalizedUser};
use crate::data::Database;
use crate::error::AppError;

/// Outcome of one page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub stored: usize,
    /// Empty or failed items
    pub skipped: usize,
    /// Newest sent date among stored items
    pub newest_date: i64,
    pub checkpoint_saved: bool,
}

/// Timeline sync service
pub struct TimelineSync {
    db: Arc<Database>,
    reconciler: Reconciler,
}

impl TimelineSync {
    /// Create new timeline sync service
    pub fn new(db: Arc<Database>, reconciler: Reconciler) -> Self {
        Self { db, reconciler }
    }

    /// Ingest a page of messages item by item
    ///
    /// A failed item is counted and skipped. For timelines with a
    /// checkpoint, the newest stored item becomes the new position.
    pub async fn ingest_messages(
        &self,
        ctx: &IngestContext,
        messages: &[NormalizedMessage],
    ) -> Result<SyncReport, AppError> {
        let mut report = SyncReport::default();
        let mut checkpoint = self.load_checkpoint(ctx).await?;

        for message in messages {
            if self.reconciler.ingest_message(ctx, message).await.is_none() {
                report.skipped += 1;
                continue;
            }
            report.stored += 1;
            report.newest_date = report.newest_date.max(message.sent_date);
            if let Some(checkpoint) = checkpoint.as_mut() {
                checkpoint.on_new_item(Some(&message.remote_id), message.sent_date);
            }
        }

        if let Some(checkpoint) = checkpoint.as_mut() {
            // A page where every item failed is not a completed download
            if report.stored > 0 || messages.is_empty() {
                checkpoint.on_download_completed();
            }
            report.checkpoint_saved = checkpoint.save().await?;
        }

        tracing::info!(
            account = ctx.account.user_id,
            timeline = %ctx.timeline_kind,
            stored = report.stored,
            skipped = report.skipped,
            "Timeline page ingested"
        );

        Ok(report)
    }

    /// Ingest a page of users, e.g. a following list
    pub async fn ingest_users(
        &self,
        ctx: &IngestContext,
        users: &[NormalizedUser],
    ) -> Result<SyncReport, AppError> {
        let mut report = SyncReport::default();
        for user in users {
            match self.reconciler.ingest_user(ctx, user).await {
                Some(_) => report.stored += 1,
                None => report.skipped += 1,
            }
        }

        tracing::info!(
            account = ctx.account.user_id,
            stored = report.stored,
            skipped = report.skipped,
            "User page ingested"
        );

        Ok(report)
    }

    /// Whether the account's timeline has not been synced within `interval`
    ///
    /// Timelines without a checkpoint are always due.
    pub async fn is_due(&self, ctx: &IngestContext, interval: Duration) -> Result<bool, AppError> {
        Ok(self
            .load_checkpoint(ctx)
            .await?
            .is_none_or(|checkpoint| checkpoint.is_time_to_auto_sync(interval)))
    }

    async fn load_checkpoint(&self, ctx: &IngestContext) -> Result<Option<SyncCheckpoint>, AppError> {
        if !ctx.timeline_kind.has_checkpoint() {
            return Ok(None);
        }
        let checkpoint =
            SyncCheckpoint::load(self.db.clone(), ctx.timeline_kind, ctx.account.user_id).await?;
        Ok(Some(checkpoint))
    }
}
