//! Ingest service
//!
//! Reconciles normalized messages and users from any origin into the
//! local store: identity resolution, newest-wins ordering, reblog
//! collapse, reply chains, per-account flags, follow relations,
//! download rows and latest-activity pointers.
//!
//! The public entry points never fail. Every error inside one ingest
//! is logged, counted, and turned into `None`, so a bad item never
//! aborts a batch.

use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Instant;

use super::activity::UserActivityPointer;
use super::identity::IdentityResolver;
use crate::api::{NormalizedAttachment, NormalizedMessage, NormalizedUser, TriState};
use crate::data::{
    ContentKind, Database, DownloadStatus, EntityKind, FlagsUpdate, Message, MessageChanges,
    TimelineKind, User, UserChanges,
};
use crate::error::{is_unique_violation, AppError};
use crate::metrics::{
    DOWNLOADS_ENQUEUED_TOTAL, INGEST_CONFLICTS_TOTAL, INGEST_DURATION_SECONDS, INGEST_TOTAL,
};
use crate::storage::{DownloadDescriptor, DownloadQueue};

/// Deepest nesting of embedded records one ingest follows
pub const MAX_INGEST_DEPTH: usize = 8;

/// The local account records are observed through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MyAccount {
    /// Local user id of the account
    pub user_id: i64,
    pub origin_id: i64,
    pub username: String,
}

/// Everything one ingest call needs besides the store
#[derive(Debug, Clone)]
pub struct IngestContext {
    pub account: MyAccount,
    /// Timeline being synchronized
    pub timeline_kind: TimelineKind,
    /// Hand image attachments to the download coordinator right away
    pub load_attached_images: bool,
    /// Hand avatars to the download coordinator
    pub load_avatars: bool,
}

impl IngestContext {
    pub fn new(account: MyAccount, timeline_kind: TimelineKind) -> Self {
        Self {
            account,
            timeline_kind,
            load_attached_images: false,
            load_avatars: false,
        }
    }

    pub fn with_downloads(mut self, load_attached_images: bool, load_avatars: bool) -> Self {
        self.load_attached_images = load_attached_images;
        self.load_avatars = load_avatars;
        self
    }
}

/// Users and messages a message row refers to
#[derive(Debug, Default)]
struct MessageRefs {
    sender_id: Option<i64>,
    author_id: Option<i64>,
    recipient_id: Option<i64>,
    in_reply_to_msg_id: Option<i64>,
    in_reply_to_user_id: Option<i64>,
}

/// Reconciliation engine
#[derive(Clone)]
pub struct Reconciler {
    db: Arc<Database>,
    identity: IdentityResolver,
    downloads: Arc<dyn DownloadQueue>,
}

impl Reconciler {
    /// Create new reconciler
    pub fn new(db: Arc<Database>, downloads: Arc<dyn DownloadQueue>) -> Self {
        Self {
            identity: IdentityResolver::new(db.clone()),
            db,
            downloads,
        }
    }

    /// Ingest one message with everything it embeds
    ///
    /// # Returns
    /// Local id of the stored message, None if the input was empty or failed
    pub async fn ingest_message(
        &self,
        ctx: &IngestContext,
        message: &NormalizedMessage,
    ) -> Option<i64> {
        let started = Instant::now();
        let result = self.message(ctx, message, 0).await;
        INGEST_DURATION_SECONDS
            .with_label_values(&["message"])
            .observe(started.elapsed().as_secs_f64());
        finish(EntityKind::Message, &message.remote_id, result)
    }

    /// Ingest one user, and its latest message if embedded
    ///
    /// # Returns
    /// Local id of the stored user, None if the input was empty or failed
    pub async fn ingest_user(&self, ctx: &IngestContext, user: &NormalizedUser) -> Option<i64> {
        let started = Instant::now();
        let result = self.user(ctx, user, 0).await;
        INGEST_DURATION_SECONDS
            .with_label_values(&["user"])
            .observe(started.elapsed().as_secs_f64());
        finish(EntityKind::User, &user.remote_id, result)
    }

    // =========================================================================
    // Message path
    // =========================================================================

    fn message<'a>(
        &'a self,
        ctx: &'a IngestContext,
        message: &'a NormalizedMessage,
        depth: usize,
    ) -> BoxFuture<'a, Result<Option<i64>, AppError>> {
        async move {
            if depth > MAX_INGEST_DEPTH {
                return Err(AppError::DepthExceeded(depth));
            }
            if message.is_empty() {
                return Ok(None);
            }

            let account_id = ctx.account.user_id;
            let top_level = depth == 0;
            let mut flags = FlagsUpdate {
                user_id: account_id,
                ..Default::default()
            };

            let wrapper_sender_id = self.optional_user(ctx, message.sender.as_ref(), depth).await?;
            let actor_id = match &message.actor {
                Some(actor) => self.user(ctx, actor, depth + 1).await?,
                None => wrapper_sender_id,
            };

            // A reblog collapses onto the original's row; the reblogger is its sender
            // and the original's author (or sender) its author
            let (canonical, sender_id, author_id) = match message.reblogged_message.as_deref() {
                Some(original) => {
                    let original_sender_id = self
                        .optional_user(ctx, original.sender.as_ref(), depth)
                        .await?;
                    let author_id = match &original.author {
                        Some(author) => self.user(ctx, author, depth + 1).await?,
                        None => None,
                    };
                    if wrapper_sender_id == Some(account_id) {
                        flags.reblogged = Some(true);
                        flags.reblog_remote_id = non_empty_str(&message.remote_id);
                    }
                    (
                        original,
                        wrapper_sender_id.or(original_sender_id),
                        author_id.or(original_sender_id),
                    )
                }
                None => {
                    let author_id = match &message.author {
                        Some(author) => self.user(ctx, author, depth + 1).await?,
                        None => None,
                    };
                    (message, wrapper_sender_id, author_id.or(wrapper_sender_id))
                }
            };
            if canonical.is_empty() {
                return Ok(None);
            }

            if actor_id == Some(account_id) {
                flags.favorited = message
                    .favorited_by_actor
                    .known()
                    .or_else(|| canonical.favorited_by_actor.known());
            }

            let recipient_id = self
                .optional_user(ctx, canonical.recipient.as_ref(), depth)
                .await?;
            if recipient_id == Some(account_id)
                || (top_level && ctx.timeline_kind == TimelineKind::Direct)
            {
                flags.directed = true;
            }
            if top_level && ctx.timeline_kind == TimelineKind::Home {
                flags.subscribed = true;
            }

            let mut refs = MessageRefs {
                sender_id,
                author_id,
                recipient_id,
                ..Default::default()
            };
            if let Some(parent) = canonical.in_reply_to.as_deref() {
                refs.in_reply_to_msg_id = self.message(ctx, parent, depth + 1).await?;
                refs.in_reply_to_user_id = match &parent.sender {
                    Some(sender) => self.find_user(ctx.account.origin_id, sender).await?.map(|u| u.id),
                    None => None,
                };
                if refs.in_reply_to_user_id.is_none() {
                    if let Some(parent_id) = refs.in_reply_to_msg_id {
                        refs.in_reply_to_user_id = self.db.get_message_sender_id(parent_id).await?;
                    }
                }
                if refs.in_reply_to_user_id == Some(account_id) {
                    flags.replied = true;
                }
            }
            flags.mentioned = flags.replied
                || mentions_account(&canonical.body, &ctx.account.username)
                || (top_level && ctx.timeline_kind == TimelineKind::Mentions);

            let (message_id, is_new) = self
                .store_message(ctx.account.origin_id, canonical, &refs)
                .await?;

            flags.message_id = message_id;
            self.db.upsert_flags(&flags).await?;

            if is_new {
                self.record_attachments(ctx, message_id, &canonical.attachments)
                    .await?;
            }

            if canonical.sent_date > 0 {
                let mut active_users = Vec::with_capacity(2);
                active_users.extend(sender_id);
                if author_id != sender_id {
                    active_users.extend(author_id);
                }
                for user_id in active_users {
                    let mut pointer = UserActivityPointer::load(self.db.clone(), user_id).await?;
                    pointer.on_new_message(message_id, canonical.sent_date);
                    pointer.save().await?;
                }
            }

            tracing::debug!(
                message_id,
                remote_id = %canonical.remote_id,
                depth,
                is_new,
                "Message reconciled"
            );

            Ok(Some(message_id))
        }
        .boxed()
    }

    /// Insert or update the canonical message row
    ///
    /// # Returns
    /// (local id, whether the row was new or a promoted stub)
    async fn store_message(
        &self,
        origin_id: i64,
        canonical: &NormalizedMessage,
        refs: &MessageRefs,
    ) -> Result<(i64, bool), AppError> {
        let stored = self.find_message(origin_id, &canonical.remote_id).await?;

        if let Some(stored) = stored {
            let changes = message_changes(origin_id, canonical, refs, Some(&stored));
            self.db.update_message(stored.id, &changes).await?;
            return Ok((stored.id, stored.is_stub()));
        }

        let changes = message_changes(origin_id, canonical, refs, None);
        match self.db.insert_message(&changes).await {
            Ok(id) => Ok((id, true)),
            Err(error) if is_unique_violation(&error) => {
                INGEST_CONFLICTS_TOTAL.with_label_values(&["message"]).inc();
                let winner = self
                    .find_message(origin_id, &canonical.remote_id)
                    .await?
                    .ok_or(error)?;
                tracing::debug!(
                    message_id = winner.id,
                    remote_id = %canonical.remote_id,
                    "Message stored concurrently; updating instead"
                );
                let changes = message_changes(origin_id, canonical, refs, Some(&winner));
                self.db.update_message(winner.id, &changes).await?;
                Ok((winner.id, winner.is_stub()))
            }
            Err(error) => Err(error),
        }
    }

    async fn find_message(&self, origin_id: i64, remote_id: &str) -> Result<Option<Message>, AppError> {
        match self
            .identity
            .resolve(EntityKind::Message, origin_id, remote_id)
            .await?
        {
            Some(id) => self.db.get_message(id).await,
            None => Ok(None),
        }
    }

    async fn record_attachments(
        &self,
        ctx: &IngestContext,
        message_id: i64,
        attachments: &[NormalizedAttachment],
    ) -> Result<(), AppError> {
        for attachment in attachments {
            let url = attachment.url.trim();
            if url.is_empty() {
                continue;
            }
            let content_kind = attachment.content_kind();
            let fetchable = is_fetchable_url(url);
            let status = if fetchable {
                DownloadStatus::Absent
            } else {
                tracing::warn!(message_id, url, "Malformed attachment URL");
                DOWNLOADS_ENQUEUED_TOTAL
                    .with_label_values(&["attachment", "malformed"])
                    .inc();
                DownloadStatus::HardError
            };

            let Some(download) = self
                .db
                .insert_attachment_download(message_id, url, content_kind, status)
                .await?
            else {
                continue;
            };

            if fetchable && content_kind == ContentKind::Image && ctx.load_attached_images {
                self.downloads
                    .enqueue(DownloadDescriptor::attachment(&download, content_kind));
            }
        }
        Ok(())
    }

    // =========================================================================
    // User path
    // =========================================================================

    fn optional_user<'a>(
        &'a self,
        ctx: &'a IngestContext,
        user: Option<&'a NormalizedUser>,
        depth: usize,
    ) -> BoxFuture<'a, Result<Option<i64>, AppError>> {
        async move {
            match user {
                Some(user) => self.user(ctx, user, depth + 1).await,
                None => Ok(None),
            }
        }
        .boxed()
    }

    fn user<'a>(
        &'a self,
        ctx: &'a IngestContext,
        user: &'a NormalizedUser,
        depth: usize,
    ) -> BoxFuture<'a, Result<Option<i64>, AppError>> {
        async move {
            if depth > MAX_INGEST_DEPTH {
                return Err(AppError::DepthExceeded(depth));
            }
            if user.is_empty() {
                return Ok(None);
            }

            let account = &ctx.account;
            let user_id = self.store_user(account.origin_id, user).await?;

            if let Some(avatar_url) = user.avatar_url.as_deref().map(str::trim) {
                if !avatar_url.is_empty() {
                    self.record_avatar(ctx, user_id, avatar_url).await?;
                }
            }

            if let Some(followed) = user.followed_by_actor.known() {
                let actor_id = match &user.actor {
                    Some(actor) => self.user(ctx, actor, depth + 1).await?,
                    None => Some(account.user_id),
                };
                if actor_id == Some(account.user_id) && user_id != account.user_id {
                    self.db.upsert_follow(account.user_id, user_id, followed).await?;
                }
            }

            // Only a top-level user brings its latest message along
            if depth == 0 {
                if let Some(latest) = user.latest_message.as_deref() {
                    let latest = with_default_sender(latest, user);
                    if let Err(error) = self.message(ctx, &latest, depth + 1).await {
                        tracing::warn!(
                            user_id,
                            error = %error,
                            kind = error.kind(),
                            "Failed to ingest latest message of user"
                        );
                    }
                }
            }

            tracing::debug!(user_id, remote_id = %user.remote_id, depth, "User reconciled");

            Ok(Some(user_id))
        }
        .boxed()
    }

    async fn store_user(&self, origin_id: i64, user: &NormalizedUser) -> Result<i64, AppError> {
        if let Some(stored) = self.find_user(origin_id, user).await? {
            let changes = user_changes(origin_id, user, Some(&stored));
            self.db.update_user(stored.id, &changes).await?;
            return Ok(stored.id);
        }

        let changes = user_changes(origin_id, user, None);
        match self.db.insert_user(&changes).await {
            Ok(id) => Ok(id),
            Err(error) if is_unique_violation(&error) => {
                INGEST_CONFLICTS_TOTAL.with_label_values(&["user"]).inc();
                let winner = self.find_user(origin_id, user).await?.ok_or(error)?;
                tracing::debug!(
                    user_id = winner.id,
                    remote_id = %user.remote_id,
                    "User stored concurrently; updating instead"
                );
                let changes = user_changes(origin_id, user, Some(&winner));
                self.db.update_user(winner.id, &changes).await?;
                Ok(winner.id)
            }
            Err(error) => Err(error),
        }
    }

    /// Stored user by remote id, else by username
    ///
    /// A username match is only taken when it carries no other remote id.
    async fn find_user(&self, origin_id: i64, user: &NormalizedUser) -> Result<Option<User>, AppError> {
        if let Some(id) = self
            .identity
            .resolve(EntityKind::User, origin_id, &user.remote_id)
            .await?
        {
            return self.db.get_user(id).await;
        }

        let Some(id) = self
            .identity
            .resolve_username(origin_id, &user.username)
            .await?
        else {
            return Ok(None);
        };
        let stored = self.db.get_user(id).await?;
        Ok(stored.filter(|stored| {
            user.remote_id.is_empty()
                || stored
                    .remote_id
                    .as_deref()
                    .is_none_or(|remote_id| remote_id.is_empty() || remote_id == user.remote_id)
        }))
    }

    async fn record_avatar(
        &self,
        ctx: &IngestContext,
        user_id: i64,
        avatar_url: &str,
    ) -> Result<(), AppError> {
        let fetchable = is_fetchable_url(avatar_url);
        let status = if fetchable {
            DownloadStatus::Absent
        } else {
            tracing::warn!(user_id, url = avatar_url, "Malformed avatar URL");
            DownloadStatus::HardError
        };

        let changed = self
            .db
            .set_avatar_download(user_id, avatar_url, status)
            .await?;
        if let Some(download) = changed {
            if !fetchable {
                DOWNLOADS_ENQUEUED_TOTAL
                    .with_label_values(&["avatar", "malformed"])
                    .inc();
            } else if ctx.load_avatars {
                self.downloads.enqueue(DownloadDescriptor::avatar(&download));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn finish(kind: EntityKind, remote_id: &str, result: Result<Option<i64>, AppError>) -> Option<i64> {
    let entity = kind.as_str();
    match result {
        Ok(Some(id)) => {
            INGEST_TOTAL.with_label_values(&[entity, "stored"]).inc();
            Some(id)
        }
        Ok(None) => {
            INGEST_TOTAL.with_label_values(&[entity, "skipped"]).inc();
            None
        }
        Err(error) => {
            let error_kind = error.kind();
            if error.is_transient() {
                tracing::warn!(entity, remote_id, error = %error, kind = error_kind, "Ingest failed");
            } else {
                tracing::error!(entity, remote_id, error = %error, kind = error_kind, "Ingest failed");
            }
            INGEST_TOTAL.with_label_values(&[entity, error_kind]).inc();
            None
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().and_then(non_empty_str)
}

fn non_empty_str(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn mentions_account(body: &str, username: &str) -> bool {
    !username.is_empty() && body.contains(&format!("@{username}"))
}

fn is_fetchable_url(raw: &str) -> bool {
    url::Url::parse(raw)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false)
}

/// The latest message of a user, with that user as sender if none is given
fn with_default_sender(latest: &NormalizedMessage, user: &NormalizedUser) -> NormalizedMessage {
    let mut latest = latest.clone();
    if latest.sender.is_none() {
        latest.sender = Some(NormalizedUser {
            latest_message: None,
            actor: None,
            followed_by_actor: TriState::Unknown,
            ..user.clone()
        });
    }
    latest
}

/// Columns to write for one observation of a message
///
/// `stored` is the row as it is now, None when inserting.
fn message_changes(
    origin_id: i64,
    canonical: &NormalizedMessage,
    refs: &MessageRefs,
    stored: Option<&Message>,
) -> MessageChanges {
    let is_new = stored.is_none_or(Message::is_stub);
    let stored_sent_date = stored.map_or(0, |message| message.sent_date);
    let is_newer = canonical.sent_date > stored_sent_date;

    let mut changes = MessageChanges {
        author_id: refs.author_id,
        recipient_id: refs.recipient_id,
        in_reply_to_msg_id: refs.in_reply_to_msg_id,
        in_reply_to_user_id: refs.in_reply_to_user_id,
        ..Default::default()
    };

    if stored.is_none() {
        changes.origin_id = Some(origin_id);
        changes.remote_id = non_empty_str(&canonical.remote_id);
    }

    if is_new {
        changes.created_date = Some(if canonical.created_date > 0 {
            canonical.created_date
        } else {
            canonical.sent_date
        });
        changes.body = Some(canonical.body.clone());
        changes.via = non_empty(&canonical.via);
        changes.url = non_empty(&canonical.url);
    }

    // The first sender seen is kept
    if is_new || stored.is_some_and(|message| message.sender_id.is_none()) {
        changes.sender_id = refs.sender_id;
    }

    if is_newer {
        changes.sent_date = Some(canonical.sent_date);
        changes.public = Some(canonical.public);
        if !canonical.body.is_empty() {
            changes.body = Some(canonical.body.clone());
        }
        if let Some(via) = non_empty(&canonical.via) {
            changes.via = Some(via);
        }
        if let Some(url) = non_empty(&canonical.url) {
            changes.url = Some(url);
        }
    }

    changes
}

/// Columns to write for one observation of a user; empty fields never overwrite
fn user_changes(origin_id: i64, user: &NormalizedUser, stored: Option<&User>) -> UserChanges {
    let mut changes = UserChanges {
        webfinger_id: non_empty(&user.webfinger_id),
        real_name: non_empty(&user.real_name),
        avatar_url: non_empty(&user.avatar_url),
        description: non_empty(&user.description),
        homepage: non_empty(&user.homepage),
        url: non_empty(&user.url),
        ..Default::default()
    };
    if user.created_date > 0 && stored.is_none_or(|stored| stored.created_date == 0) {
        changes.created_date = Some(user.created_date);
    }

    match stored {
        None => {
            changes.origin_id = Some(origin_id);
            changes.remote_id = non_empty_str(&user.remote_id);
            changes.username = Some(
                non_empty_str(&user.username)
                    .unwrap_or_else(|| format!("id:{}", user.remote_id.trim())),
            );
        }
        Some(stored) => {
            changes.username = non_empty_str(&user.username).filter(|name| *name != stored.username);
            if stored.remote_id.as_deref().is_none_or(str::is_empty) {
                changes.remote_id = non_empty_str(&user.remote_id);
            }
        }
    }

    changes
}
