//! Service layer
//!
//! Contains the reconciliation logic on top of the data layer.
//! Services share one `Database` handle and hold no global state.

mod activity;
mod identity;
mod ingest;
mod sync;
mod timeline;

pub use activity::{SyncCheckpoint, UserActivityPointer};
pub use identity::IdentityResolver;
pub use ingest::{IngestContext, MAX_INGEST_DEPTH, MyAccount, Reconciler};
pub use sync::{SyncReport, TimelineSync};
pub use timeline::{MAX_TIMELINE_LIMIT, TimelineService};
