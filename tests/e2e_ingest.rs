//! E2E tests for message and user reconciliation

mod common;

use common::{TestStore, message, user};
use mergeline::api::{NormalizedAttachment, NormalizedMessage, NormalizedUser, TriState};
use mergeline::data::{DownloadKind, TimelineKind};

#[tokio::test]
async fn test_scenario_newest_wins_and_favorite() {
    let store = TestStore::with_account_username("bob").await;
    let reconciler = &store.state.reconciler;
    let ctx = store.ctx(TimelineKind::Home);
    let db = &store.state.db;

    let alice_id = reconciler
        .ingest_user(&ctx, &user("u1", "alice"))
        .await
        .unwrap();

    let first = message("m1", user("u1", "alice"), "hello @bob", 100);
    let message_id = reconciler.ingest_message(&ctx, &first).await.unwrap();

    let stored = db.get_message(message_id).await.unwrap().unwrap();
    assert_eq!(stored.sender_id, Some(alice_id));
    assert_eq!(stored.sent_date, 100);
    let flags = db.get_flags(message_id, store.account.user_id).await.unwrap().unwrap();
    assert!(flags.subscribed);
    assert!(flags.mentioned);
    assert!(!flags.favorited);

    // An older observation changes nothing
    let older = message("m1", user("u1", "alice"), "stale body", 50);
    assert_eq!(reconciler.ingest_message(&ctx, &older).await, Some(message_id));
    let stored = db.get_message(message_id).await.unwrap().unwrap();
    assert_eq!(stored.sent_date, 100);
    assert_eq!(stored.body, "hello @bob");

    // A newer one favorited by the account wins
    let mut newer = message("m1", user("u1", "alice"), "hello @bob", 200);
    newer.actor = Some(store.me());
    newer.favorited_by_actor = TriState::True;
    assert_eq!(reconciler.ingest_message(&ctx, &newer).await, Some(message_id));

    let stored = db.get_message(message_id).await.unwrap().unwrap();
    assert_eq!(stored.sent_date, 200);
    let flags = db.get_flags(message_id, store.account.user_id).await.unwrap().unwrap();
    assert!(flags.favorited);
    assert!(flags.mentioned);
    assert_eq!(db.count_messages().await.unwrap(), 1);
}

#[tokio::test]
async fn test_ingest_is_idempotent() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);
    let db = &store.state.db;
    let input = message("m1", user("u1", "alice"), "same", 100);

    let first = store.state.reconciler.ingest_message(&ctx, &input).await.unwrap();
    let before = db.get_message(first).await.unwrap().unwrap();
    let second = store.state.reconciler.ingest_message(&ctx, &input).await.unwrap();
    let after = db.get_message(second).await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(db.count_messages().await.unwrap(), 1);
    assert_eq!(before.body, after.body);
    assert_eq!(before.sent_date, after.sent_date);
    assert_eq!(before.sender_id, after.sender_id);
}

#[tokio::test]
async fn test_empty_inputs_touch_nothing() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);

    assert!(store
        .state
        .reconciler
        .ingest_message(&ctx, &NormalizedMessage::default())
        .await
        .is_none());
    assert!(store
        .state
        .reconciler
        .ingest_user(&ctx, &NormalizedUser::default())
        .await
        .is_none());
    assert_eq!(store.state.db.count_messages().await.unwrap(), 0);
}

#[tokio::test]
async fn test_reblog_collapses_onto_original() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);
    let db = &store.state.db;

    let original = message("m1", user("u1", "alice"), "original", 100);
    let original_id = store.state.reconciler.ingest_message(&ctx, &original).await.unwrap();

    let wrapper = NormalizedMessage {
        remote_id: "rb1".to_string(),
        sent_date: 300,
        sender: Some(store.me()),
        reblogged_message: Some(Box::new(message("m1", user("u1", "alice"), "original", 100))),
        ..Default::default()
    };
    let reblog_id = store.state.reconciler.ingest_message(&ctx, &wrapper).await.unwrap();

    assert_eq!(reblog_id, original_id);
    assert_eq!(db.count_messages().await.unwrap(), 1);
    assert_eq!(store.message_id("rb1").await, None);

    // The original was seen first, so its sender stays
    let stored = db.get_message(original_id).await.unwrap().unwrap();
    assert_eq!(stored.author_id, store.user_id("u1").await);
    assert_eq!(stored.sender_id, store.user_id("u1").await);

    let flags = db.get_flags(original_id, store.account.user_id).await.unwrap().unwrap();
    assert!(flags.reblogged);
    assert_eq!(flags.reblog_remote_id.as_deref(), Some("rb1"));
}

#[tokio::test]
async fn test_reblog_seen_first_keeps_reblogger_as_sender() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);
    let db = &store.state.db;

    let wrapper = NormalizedMessage {
        remote_id: "rb1".to_string(),
        sent_date: 400,
        sender: Some(user("u2", "bob")),
        reblogged_message: Some(Box::new(message("orig1", user("u1", "alice"), "original", 300))),
        ..Default::default()
    };
    let id = store.state.reconciler.ingest_message(&ctx, &wrapper).await.unwrap();

    let bob = store.user_id("u2").await.unwrap();
    let alice = store.user_id("u1").await.unwrap();
    let stored = db.get_message(id).await.unwrap().unwrap();
    assert_eq!(stored.remote_id.as_deref(), Some("orig1"));
    assert_eq!(stored.sender_id, Some(bob));
    assert_eq!(stored.author_id, Some(alice));
    assert_eq!(stored.sent_date, 300);

    // Both the reblogger and the author move their pointers
    assert_eq!(db.get_user_latest(bob).await.unwrap(), Some((id, 300)));
    assert_eq!(db.get_user_latest(alice).await.unwrap(), Some((id, 300)));

    // The original arriving later does not replace the reblogger
    store
        .state
        .reconciler
        .ingest_message(&ctx, &message("orig1", user("u1", "alice"), "original", 300))
        .await
        .unwrap();
    let stored = db.get_message(id).await.unwrap().unwrap();
    assert_eq!(stored.sender_id, Some(bob));
}

#[tokio::test]
async fn test_reblog_by_someone_else_is_not_marked() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);

    let wrapper = NormalizedMessage {
        remote_id: "rb2".to_string(),
        sender: Some(user("u2", "carol")),
        reblogged_message: Some(Box::new(message("m1", user("u1", "alice"), "original", 100))),
        ..Default::default()
    };
    let id = store.state.reconciler.ingest_message(&ctx, &wrapper).await.unwrap();

    let flags = store
        .state
        .db
        .get_flags(id, store.account.user_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!flags.reblogged);
    assert!(flags.reblog_remote_id.is_none());
}

#[tokio::test]
async fn test_sender_preserved_author_overwritten() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Public);
    let db = &store.state.db;

    let id = store
        .state
        .reconciler
        .ingest_message(&ctx, &message("m1", user("u1", "alice"), "hi", 100))
        .await
        .unwrap();

    let mut later = message("m1", user("u2", "carol"), "hi", 200);
    later.author = Some(user("u2", "carol"));
    store.state.reconciler.ingest_message(&ctx, &later).await.unwrap();

    let stored = db.get_message(id).await.unwrap().unwrap();
    assert_eq!(stored.sender_id, store.user_id("u1").await);
    assert_eq!(stored.author_id, store.user_id("u2").await);
}

#[tokio::test]
async fn test_mentions_and_direct_flags() {
    let store = TestStore::new().await;
    let db = &store.state.db;
    let account = store.account.user_id;

    let public = store.ctx(TimelineKind::Public);
    let mentioning = store
        .state
        .reconciler
        .ingest_message(&public, &message("m1", user("u1", "alice"), "ping @me", 100))
        .await
        .unwrap();
    let flags = db.get_flags(mentioning, account).await.unwrap().unwrap();
    assert!(flags.mentioned);
    assert!(!flags.subscribed);

    let plain = store
        .state
        .reconciler
        .ingest_message(&public, &message("m2", user("u1", "alice"), "no ping", 110))
        .await
        .unwrap();
    assert!(db.get_flags(plain, account).await.unwrap().is_none());

    // A later observation without the mention does not clear it
    store
        .state
        .reconciler
        .ingest_message(&public, &message("m1", user("u1", "alice"), "edited", 120))
        .await
        .unwrap();
    assert!(db.get_flags(mentioning, account).await.unwrap().unwrap().mentioned);

    // Anything synced from the mentions timeline counts
    let mentions = store.ctx(TimelineKind::Mentions);
    let listed = store
        .state
        .reconciler
        .ingest_message(&mentions, &message("m3", user("u1", "alice"), "nothing", 130))
        .await
        .unwrap();
    assert!(db.get_flags(listed, account).await.unwrap().unwrap().mentioned);

    let mut direct = message("m4", user("u1", "alice"), "psst", 140);
    direct.recipient = Some(store.me());
    let direct_id = store
        .state
        .reconciler
        .ingest_message(&public, &direct)
        .await
        .unwrap();
    let stored = db.get_message(direct_id).await.unwrap().unwrap();
    assert_eq!(stored.recipient_id, Some(account));
    assert!(db.get_flags(direct_id, account).await.unwrap().unwrap().directed);
}

#[tokio::test]
async fn test_reply_to_account_marks_replied() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);
    let db = &store.state.db;
    let account = store.account.user_id;

    let own = store
        .state
        .reconciler
        .ingest_message(&ctx, &message("m1", store.me(), "my post", 100))
        .await
        .unwrap();

    // Parent referenced by id only: the stored sender decides
    let mut reply = message("m2", user("u1", "alice"), "nice", 200);
    reply.in_reply_to = Some(Box::new(NormalizedMessage::new("m1")));
    let reply_id = store.state.reconciler.ingest_message(&ctx, &reply).await.unwrap();

    let stored = db.get_message(reply_id).await.unwrap().unwrap();
    assert_eq!(stored.in_reply_to_msg_id, Some(own));
    assert_eq!(stored.in_reply_to_user_id, Some(account));
    let flags = db.get_flags(reply_id, account).await.unwrap().unwrap();
    assert!(flags.replied);
    assert!(flags.mentioned);

    // The parent keeps its own sender and date
    let parent = db.get_message(own).await.unwrap().unwrap();
    assert_eq!(parent.sender_id, Some(account));
    assert_eq!(parent.sent_date, 100);
}

#[tokio::test]
async fn test_stub_parent_promoted_later() {
    let mut store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);
    let db = &store.state.db;

    let mut reply = message("m2", user("u2", "carol"), "reply first", 200);
    reply.in_reply_to = Some(Box::new(NormalizedMessage::new("m1")));
    store.state.reconciler.ingest_message(&ctx, &reply).await.unwrap();

    let stub_id = store.message_id("m1").await.unwrap();
    let stub = db.get_message(stub_id).await.unwrap().unwrap();
    assert!(stub.is_stub());
    assert_eq!(db.count_messages().await.unwrap(), 2);

    let mut full = message("m1", user("u1", "alice"), "the parent", 150);
    full.attachments = vec![NormalizedAttachment::new("https://o1.example/p.png", "image/png")];
    let promoted_id = store.state.reconciler.ingest_message(&ctx, &full).await.unwrap();

    assert_eq!(promoted_id, stub_id);
    let promoted = db.get_message(stub_id).await.unwrap().unwrap();
    assert!(!promoted.is_stub());
    assert_eq!(promoted.sender_id, store.user_id("u1").await);
    assert_eq!(promoted.body, "the parent");
    assert_eq!(db.get_message_downloads(stub_id).await.unwrap().len(), 1);

    let queued = store.drain_downloads();
    assert!(queued
        .iter()
        .any(|d| d.download_kind == DownloadKind::Attachment && d.message_id == Some(stub_id)));
}

#[tokio::test]
async fn test_user_sparse_merge() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);
    let db = &store.state.db;

    let mut first = user("u1", "alice");
    first.real_name = Some("Alice A.".to_string());
    first.homepage = Some("https://alice.example".to_string());
    let id = store.state.reconciler.ingest_user(&ctx, &first).await.unwrap();

    let mut second = user("u1", "");
    second.description = Some("hello".to_string());
    second.real_name = Some(String::new());
    assert_eq!(store.state.reconciler.ingest_user(&ctx, &second).await, Some(id));

    let stored = db.get_user(id).await.unwrap().unwrap();
    assert_eq!(stored.username, "alice");
    assert_eq!(stored.real_name.as_deref(), Some("Alice A."));
    assert_eq!(stored.homepage.as_deref(), Some("https://alice.example"));
    assert_eq!(stored.description.as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_user_identity_fallbacks() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);
    let db = &store.state.db;

    // No username reported
    let nameless = store.state.reconciler.ingest_user(&ctx, &user("42", "")).await.unwrap();
    assert_eq!(db.get_user(nameless).await.unwrap().unwrap().username, "id:42");

    // Known by username first, remote id learned later
    let by_name = store.state.reconciler.ingest_user(&ctx, &user("", "carol")).await.unwrap();
    let with_id = store.state.reconciler.ingest_user(&ctx, &user("c1", "carol")).await.unwrap();
    assert_eq!(by_name, with_id);
    assert_eq!(
        db.get_user(with_id).await.unwrap().unwrap().remote_id.as_deref(),
        Some("c1")
    );
}

#[tokio::test]
async fn test_reused_username_does_not_block_new_holder() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);
    let db = &store.state.db;

    let old_alice = store
        .state
        .reconciler
        .ingest_user(&ctx, &user("u1", "alice"))
        .await
        .unwrap();

    // Another account now holds the handle
    let id = store
        .state
        .reconciler
        .ingest_message(&ctx, &message("m9", user("u3", "alice"), "new handle", 100))
        .await
        .unwrap();

    let new_alice = store.user_id("u3").await.unwrap();
    assert_ne!(new_alice, old_alice);
    assert_eq!(store.user_id("u1").await, Some(old_alice));
    let stored = db.get_message(id).await.unwrap().unwrap();
    assert_eq!(stored.sender_id, Some(new_alice));
    assert_eq!(db.get_user(new_alice).await.unwrap().unwrap().username, "alice");
}

#[tokio::test]
async fn test_follow_recorded_for_account_only() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);
    let db = &store.state.db;
    let account = store.account.user_id;

    let mut followed = user("u1", "alice");
    followed.followed_by_actor = TriState::True;
    let alice = store.state.reconciler.ingest_user(&ctx, &followed).await.unwrap();
    assert_eq!(db.get_followed_user_ids(account).await.unwrap(), vec![alice]);

    followed.followed_by_actor = TriState::False;
    store.state.reconciler.ingest_user(&ctx, &followed).await.unwrap();
    assert!(db.get_followed_user_ids(account).await.unwrap().is_empty());

    // Reported for another actor: not the account's relation
    let mut other = user("u2", "dave");
    other.followed_by_actor = TriState::True;
    other.actor = Some(Box::new(user("u3", "erin")));
    let dave = store.state.reconciler.ingest_user(&ctx, &other).await.unwrap();
    assert!(db.get_follow(account, dave).await.unwrap().is_none());
}

#[tokio::test]
async fn test_latest_message_of_top_level_user() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Public);
    let db = &store.state.db;

    let mut bob = user("u1", "bob");
    let mut latest = NormalizedMessage::new("m9");
    latest.body = "latest".to_string();
    latest.sent_date = 900;
    bob.latest_message = Some(Box::new(latest));

    let bob_id = store.state.reconciler.ingest_user(&ctx, &bob).await.unwrap();
    let message_id = store.message_id("m9").await.unwrap();

    let stored = db.get_message(message_id).await.unwrap().unwrap();
    assert_eq!(stored.sender_id, Some(bob_id));
    assert_eq!(db.get_user_latest(bob_id).await.unwrap(), Some((message_id, 900)));
}

#[tokio::test]
async fn test_latest_activity_pointer_tracks_newest() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Public);
    let reconciler = &store.state.reconciler;

    reconciler
        .ingest_message(&ctx, &message("m1", user("u1", "alice"), "a", 100))
        .await
        .unwrap();
    let newest = reconciler
        .ingest_message(&ctx, &message("m2", user("u1", "alice"), "b", 300))
        .await
        .unwrap();
    reconciler
        .ingest_message(&ctx, &message("m3", user("u1", "alice"), "c", 200))
        .await
        .unwrap();

    let alice = store.user_id("u1").await.unwrap();
    assert_eq!(
        store.state.db.get_user_latest(alice).await.unwrap(),
        Some((newest, 300))
    );
}

#[tokio::test]
async fn test_avatar_and_images_handed_to_queue() {
    let mut store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);

    let mut sender = user("u1", "alice");
    sender.avatar_url = Some("https://o1.example/alice.png".to_string());
    let mut input = message("m1", sender, "pics", 100);
    input.attachments = vec![
        NormalizedAttachment::new("https://o1.example/1.jpg", "image/jpeg"),
        NormalizedAttachment::new("https://o1.example/2.mp4", "video/mp4"),
    ];
    store.state.reconciler.ingest_message(&ctx, &input).await.unwrap();

    let queued = store.drain_downloads();
    assert_eq!(queued.len(), 2);
    assert!(queued.iter().any(|d| d.download_kind == DownloadKind::Avatar));
    assert!(queued
        .iter()
        .any(|d| d.download_kind == DownloadKind::Attachment && d.url.ends_with("1.jpg")));

    let pending = store.state.db.get_pending_downloads(10).await.unwrap();
    assert_eq!(pending.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_ingest_yields_one_row() {
    let store = TestStore::new().await;
    let ctx = store.ctx(TimelineKind::Home);

    let mut handles = Vec::new();
    for index in 0..8 {
        let reconciler = store.state.reconciler.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let input = message("m1", user("u1", "alice"), "race", 100 + index);
            reconciler.ingest_message(&ctx, &input).await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        if let Some(id) = handle.await.unwrap() {
            ids.push(id);
        }
    }

    assert!(!ids.is_empty());
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(store.state.db.count_messages().await.unwrap(), 1);

    let stored = store.state.db.get_message(ids[0]).await.unwrap().unwrap();
    assert_eq!(stored.sent_date, 107);
}
