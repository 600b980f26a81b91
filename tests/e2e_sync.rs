//! E2E tests for timeline page sync and checkpoints

mod common;

use std::time::Duration;

use common::{TestStore, message, user};
use mergeline::api::{NormalizedMessage, NormalizedUser};
use mergeline::data::TimelineKind;
use mergeline::service::SyncCheckpoint;

#[tokio::test]
async fn test_page_ingest_isolates_bad_items_and_saves_checkpoint() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);
    let sync = store.state.timeline_sync();

    let page = vec![
        message("m1", user("u1", "alice"), "one", 100),
        NormalizedMessage::default(),
        message("m2", user("u1", "alice"), "two", 300),
        message("m3", user("u1", "alice"), "three", 200),
    ];
    let report = sync.ingest_messages(&ctx, &page).await.unwrap();

    assert_eq!(report.stored, 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.newest_date, 300);
    assert!(report.checkpoint_saved);

    let checkpoint = SyncCheckpoint::load(
        store.state.db.clone(),
        TimelineKind::Home,
        store.account.user_id,
    )
    .await
    .unwrap();
    assert_eq!(checkpoint.position(), Some("m2"));
    assert_eq!(checkpoint.item_date(), 300);
    assert!(checkpoint.downloaded_date() > 0);

    assert!(!sync.is_due(&ctx, Duration::from_secs(900)).await.unwrap());
}

#[tokio::test]
async fn test_fresh_account_is_due_for_sync() {
    let store = TestStore::new().await;
    let sync = store.state.timeline_sync();
    let interval = store.state.config.sync.auto_sync_interval();

    assert!(sync.is_due(&store.ctx(TimelineKind::Mentions), interval).await.unwrap());
    // Timelines without a checkpoint are always due
    assert!(sync.is_due(&store.ctx(TimelineKind::Public), interval).await.unwrap());
}

#[tokio::test]
async fn test_public_page_has_no_checkpoint() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Public);

    let report = store
        .state
        .timeline_sync()
        .ingest_messages(&ctx, &[message("m1", user("u1", "alice"), "hi", 100)])
        .await
        .unwrap();

    assert_eq!(report.stored, 1);
    assert!(!report.checkpoint_saved);
}

#[tokio::test]
async fn test_older_page_does_not_move_checkpoint_back() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Own);
    let sync = store.state.timeline_sync();

    sync.ingest_messages(&ctx, &[message("m5", store.me(), "new", 500)])
        .await
        .unwrap();
    sync.ingest_messages(&ctx, &[message("m1", store.me(), "old", 100)])
        .await
        .unwrap();

    let checkpoint = SyncCheckpoint::load(store.state.db.clone(), TimelineKind::Own, store.account.user_id)
        .await
        .unwrap();
    assert_eq!(checkpoint.position(), Some("m5"));
    assert_eq!(checkpoint.item_date(), 500);
}

#[tokio::test]
async fn test_user_page() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);

    let users = vec![
        user("u1", "alice"),
        NormalizedUser::default(),
        user("u2", "carol"),
    ];
    let report = store
        .state
        .timeline_sync()
        .ingest_users(&ctx, &users)
        .await
        .unwrap();

    assert_eq!(report.stored, 2);
    assert_eq!(report.skipped, 1);
    assert!(store.user_id("u2").await.is_some());
}

#[tokio::test]
async fn test_failed_page_leaves_sync_due() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);
    let sync = store.state.timeline_sync();
    let interval = Duration::from_secs(900);

    let page = vec![NormalizedMessage::default(), NormalizedMessage::default()];
    let report = sync.ingest_messages(&ctx, &page).await.unwrap();

    assert_eq!(report.stored, 0);
    assert_eq!(report.skipped, 2);
    assert!(!report.checkpoint_saved);
    assert!(sync.is_due(&ctx, interval).await.unwrap());

    // An empty page is a completed, if uneventful, sync
    let report = sync.ingest_messages(&ctx, &[]).await.unwrap();
    assert!(report.checkpoint_saved);
    assert!(!sync.is_due(&ctx, interval).await.unwrap());
}
