//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite database operations
//! - Entity models
//! - Timeline query plans

mod database;
mod models;
mod timeline_query;

pub use database::{
    CheckpointRow, ConnectOptions, Database, FlagsUpdate, MessageChanges, UserChanges,
};
pub use models::*;
pub use timeline_query::{Column, ColumnSet, TimelineQuery, TimelineRequest, TimelineRow};
