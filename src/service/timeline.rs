//! Timeline service
//!
//! Builds display rows for a timeline from the local store.

use std::sync::Arc;

use crate::data::{Database, TimelineQuery, TimelineRequest, TimelineRow};
use crate::error::AppError;
use crate::metrics::TIMELINE_QUERIES_TOTAL;

/// Largest page a caller may ask for
pub const MAX_TIMELINE_LIMIT: u32 = 200;

/// Timeline service
pub struct TimelineService {
    db: Arc<Database>,
}

impl TimelineService {
    /// Create new timeline service
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Load one page of a timeline
    ///
    /// Newest first by sent date. Page further back by passing the last
    /// row's `sent_date` as `older_than`.
    ///
    /// # Errors
    /// Validation error when the request lacks the account, user or
    /// origin its kind needs
    pub async fn load(&self, mut request: TimelineRequest) -> Result<Vec<TimelineRow>, AppError> {
        request.limit = request.limit.clamp(1, MAX_TIMELINE_LIMIT);
        let query = TimelineQuery::plan(request)?;

        TIMELINE_QUERIES_TOTAL
            .with_label_values(&[query.request().kind.as_str()])
            .inc();
        tracing::debug!(
            timeline = %query.request().kind,
            joins = ?query.join_names(),
            "Loading timeline"
        );

        self.db.fetch_timeline(&query).await
    }
}
