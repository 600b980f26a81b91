//! Mergeline - merges social-network timelines from many origins
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Origin API clients (external)               │
//! │  - Fetch pages and translate them to normalized records     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Reconciler: identity, ordering, reblogs, replies, flags  │
//! │  - Latest-activity pointers and sync checkpoints            │
//! │  - Timeline views                                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! │  - Download queue to the coordinator                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: Normalized message and user records
//! - `service`: Reconciliation and timeline logic
//! - `data`: Database layer and timeline query plans
//! - `storage`: Download descriptors and queue
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod service;
pub mod storage;

use std::sync::Arc;

/// Application state shared by all workers
///
/// Cheap to clone; every clone shares one connection pool.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Reconciliation engine
    pub reconciler: service::Reconciler,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database and run migrations
    /// 2. Build the reconciler around the download queue
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrated
    pub async fn new(
        config: config::AppConfig,
        downloads: Arc<dyn storage::DownloadQueue>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let options = data::ConnectOptions {
            max_connections: config.database.max_connections,
            busy_timeout: std::time::Duration::from_millis(config.database.busy_timeout_ms),
        };
        let db = Arc::new(data::Database::connect_with_options(&config.database.path, &options).await?);
        tracing::info!("Database connected");

        let reconciler = service::Reconciler::new(db.clone(), downloads);

        Ok(Self {
            config: Arc::new(config),
            db,
            reconciler,
        })
    }

    /// Look up a local account by origin name and username
    ///
    /// # Errors
    /// `NotFound` if the origin or the account does not exist
    pub async fn account(
        &self,
        origin_name: &str,
        username: &str,
    ) -> Result<service::MyAccount, error::AppError> {
        let origin = self
            .db
            .get_origin_by_name(origin_name)
            .await?
            .ok_or(error::AppError::NotFound)?;
        let user_id = self
            .db
            .find_user_id_by_username(origin.id, username)
            .await?
            .ok_or(error::AppError::NotFound)?;

        Ok(service::MyAccount {
            user_id,
            origin_id: origin.id,
            username: username.to_string(),
        })
    }

    /// Ingest context for an account with the configured download preferences
    pub fn ingest_context(
        &self,
        account: service::MyAccount,
        timeline_kind: data::TimelineKind,
    ) -> service::IngestContext {
        service::IngestContext::new(account, timeline_kind).with_downloads(
            self.config.downloads.load_attached_images,
            self.config.downloads.load_avatars,
        )
    }

    pub fn timeline_service(&self) -> service::TimelineService {
        service::TimelineService::new(self.db.clone())
    }

    pub fn timeline_sync(&self) -> service::TimelineSync {
        service::TimelineSync::new(self.db.clone(), self.reconciler.clone())
    }
}
