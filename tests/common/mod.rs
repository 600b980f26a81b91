//! Common test utilities for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use mergeline::api::{NormalizedMessage, NormalizedUser};
use mergeline::data::{NewOrigin, TimelineKind, UserChanges};
use mergeline::service::{IngestContext, MyAccount};
use mergeline::storage::{ChannelDownloadQueue, DownloadDescriptor};
use mergeline::{AppState, config};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Store with one origin and one local account
pub struct TestStore {
    pub state: AppState,
    pub account: MyAccount,
    pub downloads: mpsc::Receiver<DownloadDescriptor>,
    pub _temp_dir: TempDir,
}

impl TestStore {
    /// Create a fresh store; the account is "me" on origin "o1"
    pub async fn new() -> Self {
        Self::with_account_username("me").await
    }

    pub async fn with_account_username(username: &str) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            database: config::DatabaseConfig {
                path: db_path,
                max_connections: 8,
                busy_timeout_ms: 5_000,
            },
            sync: config::SyncConfig {
                auto_sync_interval_seconds: 900,
            },
            downloads: config::DownloadConfig {
                load_attached_images: true,
                load_avatars: true,
                queue_capacity: 64,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let (queue, downloads) = ChannelDownloadQueue::new(config.downloads.queue_capacity);
        let state = AppState::new(config, Arc::new(queue)).await.unwrap();

        let origin_id = state
            .db
            .insert_origin(&NewOrigin {
                origin_type: "mastodon".to_string(),
                name: "o1".to_string(),
                url: "https://o1.example".to_string(),
                ssl: true,
                allow_html: true,
                text_limit: 500,
            })
            .await
            .unwrap();
        let user_id = state
            .db
            .insert_user(&UserChanges {
                origin_id: Some(origin_id),
                remote_id: Some("me-remote".to_string()),
                username: Some(username.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        Self {
            account: MyAccount {
                user_id,
                origin_id,
                username: username.to_string(),
            },
            state,
            downloads,
            _temp_dir: temp_dir,
        }
    }

    pub fn origin_id(&self) -> i64 {
        self.account.origin_id
    }

    pub fn ctx(&self, kind: TimelineKind) -> IngestContext {
        self.state.ingest_context(self.account.clone(), kind)
    }

    /// The account as a normalized user, e.g. for `actor`
    pub fn me(&self) -> NormalizedUser {
        NormalizedUser::new("me-remote", self.account.username.clone())
    }

    pub async fn user_id(&self, remote_id: &str) -> Option<i64> {
        self.state
            .db
            .find_local_id(mergeline::data::EntityKind::User, self.origin_id(), remote_id)
            .await
            .unwrap()
    }

    pub async fn message_id(&self, remote_id: &str) -> Option<i64> {
        self.state
            .db
            .find_local_id(mergeline::data::EntityKind::Message, self.origin_id(), remote_id)
            .await
            .unwrap()
    }

    /// Drain descriptors handed to the download queue so far
    pub fn drain_downloads(&mut self) -> Vec<DownloadDescriptor> {
        let mut drained = Vec::new();
        while let Ok(descriptor) = self.downloads.try_recv() {
            drained.push(descriptor);
        }
        drained
    }
}

pub fn user(remote_id: &str, username: &str) -> NormalizedUser {
    NormalizedUser::new(remote_id, username)
}

pub fn message(remote_id: &str, sender: NormalizedUser, body: &str, sent_date: i64) -> NormalizedMessage {
    NormalizedMessage {
        remote_id: remote_id.to_string(),
        body: body.to_string(),
        sent_date,
        created_date: sent_date,
        public: true,
        sender: Some(sender),
        ..Default::default()
    }
}
