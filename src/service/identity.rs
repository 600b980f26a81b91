//! Identity service
//!
//! Maps (origin, remote id) pairs to local ids and back.

use std::sync::Arc;

use crate::data::{Database, EntityKind};
use crate::error::AppError;

/// Identity resolver
///
/// Every lookup is a single point query on the pool, so a row another
/// worker has committed is visible to the next call.
#[derive(Clone)]
pub struct IdentityResolver {
    db: Arc<Database>,
}

impl IdentityResolver {
    /// Create new identity resolver
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Local id of a stored message or user
    ///
    /// An empty remote id never matches and does not touch the store.
    pub async fn resolve(
        &self,
        kind: EntityKind,
        origin_id: i64,
        remote_id: &str,
    ) -> Result<Option<i64>, AppError> {
        if remote_id.is_empty() {
            return Ok(None);
        }
        self.db.find_local_id(kind, origin_id, remote_id).await
    }

    /// Remote id of a stored message or user
    pub async fn reverse(&self, kind: EntityKind, local_id: i64) -> Result<Option<String>, AppError> {
        if local_id == 0 {
            return Ok(None);
        }
        self.db.find_remote_id(kind, local_id).await
    }

    /// Remote id to act on when undoing an account's reblog
    ///
    /// The reblog activity's own id when the account's flags recorded one,
    /// the message's remote id otherwise.
    pub async fn reblog_remote_id(
        &self,
        message_id: i64,
        account_user_id: i64,
    ) -> Result<Option<String>, AppError> {
        if let Some(remote_id) = self
            .db
            .find_reblog_remote_id(message_id, account_user_id)
            .await?
        {
            return Ok(Some(remote_id));
        }
        self.reverse(EntityKind::Message, message_id).await
    }

    /// Local user id by username, for origins that report no user id
    pub async fn resolve_username(
        &self,
        origin_id: i64,
        username: &str,
    ) -> Result<Option<i64>, AppError> {
        if username.is_empty() {
            return Ok(None);
        }
        self.db.find_user_id_by_username(origin_id, username).await
    }
}
