// End-to-end tests for the sync core: RSVP upsert semantics, the
// connection state machine, projection lifecycle, and match ranking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use meetmate::auth::CallerIdentity;
use meetmate::error::{AppError, AppResult};
use meetmate::models::{ConnectionStatus, RsvpStatus, UserProfile};
use meetmate::realtime::ProjectionRegistry;
use meetmate::services::{
    AiProvider, ConnectionService, EventInput, EventService, MatchService, MeetingInput,
    MessagingService, UserService,
};
use meetmate::store::MeetStore;
use meetmate::sync::SyncOrchestrator;

struct TestContext {
    // Held so the database file outlives the store.
    _dir: tempfile::TempDir,
    store: Arc<MeetStore>,
}

async fn test_store() -> TestContext {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("meetmate.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let store = MeetStore::new(&url, 64).await.expect("store");
    store.init().await.expect("schema");
    TestContext {
        _dir: dir,
        store: Arc::new(store),
    }
}

fn caller(uid: &str) -> CallerIdentity {
    CallerIdentity {
        uid: uid.to_string(),
        email: format!("{}@example.com", uid),
    }
}

fn profile(id: &str, skills: &[&str]) -> UserProfile {
    let now = Utc::now();
    UserProfile {
        id: id.to_string(),
        name: format!("User {}", id),
        email: format!("{}@example.com", id),
        avatar: None,
        skills: skills.iter().map(|s| s.to_string()).collect(),
        interests: vec![],
        goals: vec![],
        bio: None,
        created_at: now,
        updated_at: now,
    }
}

/// Deterministic provider: embeddings are a fixed map over profile text.
struct FixedProvider {
    embeddings: HashMap<String, Vec<f32>>,
}

#[async_trait]
impl AiProvider for FixedProvider {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        Ok(self
            .embeddings
            .get(text)
            .cloned()
            .unwrap_or_else(|| vec![0.0, 0.0]))
    }

    async fn chat_complete(&self, prompt: &str, _context: Option<&str>) -> AppResult<String> {
        Ok(format!("echo: {}", prompt))
    }
}

async fn make_event(events: &EventService, by: &str, title: &str, offset_hours: i64) -> String {
    events
        .create_event(
            &caller(by),
            EventInput {
                title: title.to_string(),
                description: "x".to_string(),
                date: Utc::now() + ChronoDuration::hours(offset_hours),
                location: "HQ".to_string(),
            },
        )
        .await
        .expect("create event")
        .id
}

// ---------------------------------------------------------------------
// RSVP and events
// ---------------------------------------------------------------------

#[tokio::test]
async fn rsvp_upsert_keeps_one_record_per_user_event_pair() {
    let ctx = test_store().await;
    let events = EventService::new(ctx.store.clone());
    let event_id = make_event(&events, "u1", "Meetup", 24).await;

    let first = events
        .upsert_rsvp(&caller("u2"), &event_id, RsvpStatus::Going)
        .await
        .unwrap();
    assert_eq!(first.status, RsvpStatus::Going);

    let second = events
        .upsert_rsvp(&caller("u2"), &event_id, RsvpStatus::Maybe)
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.status, RsvpStatus::Maybe);

    let all = events.rsvps_for_event(&event_id).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, RsvpStatus::Maybe);
}

#[tokio::test]
async fn rsvp_requires_existing_event() {
    let ctx = test_store().await;
    let events = EventService::new(ctx.store.clone());

    let err = events
        .upsert_rsvp(&caller("u2"), "no-such-event", RsvpStatus::Going)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn event_listing_is_sorted_by_date_ascending() {
    let ctx = test_store().await;
    let events = EventService::new(ctx.store.clone());

    make_event(&events, "u1", "later", 72).await;
    make_event(&events, "u1", "soon", 1).await;
    make_event(&events, "u1", "middle", 24).await;

    let listed = events.list_events().await.unwrap();
    assert_eq!(listed.len(), 3);
    for pair in listed.windows(2) {
        assert!(pair[0].date <= pair[1].date);
    }
    assert_eq!(listed[0].title, "soon");
}

#[tokio::test]
async fn event_creation_validates_required_fields() {
    let ctx = test_store().await;
    let events = EventService::new(ctx.store.clone());

    let err = events
        .create_event(
            &caller("u1"),
            EventInput {
                title: "  ".to_string(),
                description: "x".to_string(),
                date: Utc::now(),
                location: "HQ".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn event_update_is_creator_only_and_keeps_created_by() {
    let ctx = test_store().await;
    let events = EventService::new(ctx.store.clone());
    let event_id = make_event(&events, "u1", "Meetup", 24).await;

    let err = events
        .update_event(&caller("u2"), &event_id, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let updated = events
        .update_event(
            &caller("u1"),
            &event_id,
            meetmate::services::EventPatch {
                title: Some("Renamed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.title, "Renamed");
    assert_eq!(updated.created_by, "u1");
}

// ---------------------------------------------------------------------
// Connection graph
// ---------------------------------------------------------------------

#[tokio::test]
async fn duplicate_pending_request_conflicts_without_new_record() {
    let ctx = test_store().await;
    let connections = ConnectionService::new(ctx.store.clone());

    connections.send_request("a", "b").await.unwrap();

    let err = connections.send_request("a", "b").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    // Reverse direction while pending also conflicts (unordered pair).
    let err = connections.send_request("b", "a").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let pending = connections.list_incoming_pending("b").await.unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn self_connection_and_empty_ids_are_rejected() {
    let ctx = test_store().await;
    let connections = ConnectionService::new(ctx.store.clone());

    assert!(matches!(
        connections.send_request("a", "a").await.unwrap_err(),
        AppError::Validation(_)
    ));
    assert!(matches!(
        connections.send_request("", "b").await.unwrap_err(),
        AppError::Validation(_)
    ));
}

#[tokio::test]
async fn accepted_connection_is_symmetric() {
    let ctx = test_store().await;
    let connections = ConnectionService::new(ctx.store.clone());

    let id = connections.send_request("a", "b").await.unwrap();
    connections
        .respond(&id, ConnectionStatus::Accepted)
        .await
        .unwrap();

    let peers_a = connections.accepted_peer_ids("a").await.unwrap();
    let peers_b = connections.accepted_peer_ids("b").await.unwrap();
    assert!(peers_a.contains(&"b".to_string()));
    assert!(peers_b.contains(&"a".to_string()));
}

#[tokio::test]
async fn connection_transitions_are_terminal() {
    let ctx = test_store().await;
    let connections = ConnectionService::new(ctx.store.clone());

    let id = connections.send_request("a", "b").await.unwrap();
    connections
        .respond(&id, ConnectionStatus::Declined)
        .await
        .unwrap();

    let err = connections
        .respond(&id, ConnectionStatus::Accepted)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let err = connections
        .respond("missing", ConnectionStatus::Accepted)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn pending_requests_resolve_sender_profiles_with_fallback() {
    let ctx = test_store().await;
    let connections = ConnectionService::new(ctx.store.clone());
    let users = UserService::new(ctx.store.clone());

    users
        .create_or_update(
            &caller("a"),
            meetmate::services::ProfileInput {
                name: "Alice".to_string(),
                email: "a@example.com".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    connections.send_request("a", "c").await.unwrap();
    connections.send_request("ghost", "c").await.unwrap();

    let pending = connections.list_incoming_pending("c").await.unwrap();
    assert_eq!(pending.len(), 2);

    let from_alice = pending.iter().find(|r| r.sender_id == "a").unwrap();
    assert_eq!(from_alice.sender_name, "Alice");
    assert!(from_alice.sender.is_some());

    // No profile stored for "ghost": display name degrades to the raw id.
    let from_ghost = pending.iter().find(|r| r.sender_id == "ghost").unwrap();
    assert_eq!(from_ghost.sender_name, "ghost");
    assert!(from_ghost.sender.is_none());
}

// ---------------------------------------------------------------------
// Real-time projections
// ---------------------------------------------------------------------

#[tokio::test]
async fn projection_delivers_full_snapshots_on_change() {
    let ctx = test_store().await;
    let events = EventService::new(ctx.store.clone());
    let registry = ProjectionRegistry::new(ctx.store.clone());

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    registry.subscribe_to_events(Arc::new(move |snapshot| {
        sink.lock().unwrap().push(snapshot.len());
    }));

    tokio::time::sleep(Duration::from_millis(100)).await;
    make_event(&events, "u1", "first", 1).await;
    make_event(&events, "u1", "second", 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sizes = seen.lock().unwrap().clone();
    // Initial empty snapshot, then a full result set per change.
    assert_eq!(sizes.first(), Some(&0));
    assert_eq!(sizes.last(), Some(&2));
}

#[tokio::test]
async fn cleanup_stops_all_callbacks() {
    let ctx = test_store().await;
    let events = EventService::new(ctx.store.clone());
    let registry = ProjectionRegistry::new(ctx.store.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let spy = calls.clone();
    registry.subscribe_to_events(Arc::new(move |_snapshot| {
        spy.fetch_add(1, Ordering::SeqCst);
    }));

    make_event(&events, "u1", "before", 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(calls.load(Ordering::SeqCst) >= 1);

    // cleanup() joins the listener tasks, so the count is final as soon
    // as it returns.
    registry.cleanup().await;
    assert_eq!(registry.active_listeners(), 0);
    let after_cleanup = calls.load(Ordering::SeqCst);

    make_event(&events, "u1", "after", 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_cleanup);
}

#[tokio::test]
async fn unsubscribe_tears_down_single_listener() {
    let ctx = test_store().await;
    let events = EventService::new(ctx.store.clone());
    let registry = ProjectionRegistry::new(ctx.store.clone());

    let event_id = make_event(&events, "u1", "watched", 1).await;

    let rsvp_calls = Arc::new(AtomicUsize::new(0));
    let spy = rsvp_calls.clone();
    let listener = registry.subscribe_to_event_rsvps(
        &event_id,
        Arc::new(move |_snapshot| {
            spy.fetch_add(1, Ordering::SeqCst);
        }),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    registry.unsubscribe(&listener).await;
    // Double unsubscribe is a no-op.
    registry.unsubscribe(&listener).await;
    let baseline = rsvp_calls.load(Ordering::SeqCst);

    events
        .upsert_rsvp(&caller("u2"), &event_id, RsvpStatus::Going)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rsvp_calls.load(Ordering::SeqCst), baseline);
}

#[tokio::test]
async fn scoped_rsvp_projection_ignores_other_events() {
    let ctx = test_store().await;
    let events = EventService::new(ctx.store.clone());
    let registry = ProjectionRegistry::new(ctx.store.clone());

    let watched = make_event(&events, "u1", "watched", 1).await;
    let other = make_event(&events, "u1", "other", 2).await;

    let snapshots = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = snapshots.clone();
    registry.subscribe_to_event_rsvps(
        &watched,
        Arc::new(move |snapshot| {
            sink.lock().unwrap().push(snapshot);
        }),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    events
        .upsert_rsvp(&caller("u2"), &other, RsvpStatus::Going)
        .await
        .unwrap();
    events
        .upsert_rsvp(&caller("u3"), &watched, RsvpStatus::Maybe)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let all = snapshots.lock().unwrap();
    let last = all.last().unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].user_id, "u3");
    assert_eq!(last[0].event_id, watched);
}

// ---------------------------------------------------------------------
// Sync orchestrator
// ---------------------------------------------------------------------

#[tokio::test]
async fn orchestrated_write_is_broadcast_before_return() {
    let ctx = test_store().await;
    let events = EventService::new(ctx.store.clone());
    let users = UserService::new(ctx.store.clone());
    let sync = SyncOrchestrator::new(ctx.store.clone(), events.clone(), users);

    let mut rx = ctx.store.subscribe_changes();

    let event = sync
        .create_event(
            &caller("u1"),
            EventInput {
                title: "Meetup".to_string(),
                description: "x".to_string(),
                date: Utc::now(),
                location: "HQ".to_string(),
            },
        )
        .await
        .unwrap();

    // The notification is already queued for independent subscribers.
    let change = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("change within timeout")
        .unwrap();
    match change {
        meetmate::store::StoreChange::Events { id } => assert_eq!(id, event.id),
        other => panic!("unexpected change: {:?}", other),
    }
}

// ---------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------

#[tokio::test]
async fn matching_is_deterministic_and_excludes_self() {
    let ctx = test_store().await;

    let target = profile("u1", &["rust"]);
    let close = profile("u2", &["rust-adjacent"]);
    let far = profile("u3", &["gardening"]);
    let zero = profile("u4", &["nothing"]);
    for p in [&target, &close, &far, &zero] {
        ctx.store.upsert_user(p).await.unwrap();
    }

    let mut embeddings = HashMap::new();
    embeddings.insert(target.profile_text(), vec![1.0, 0.0]);
    embeddings.insert(close.profile_text(), vec![0.9, 0.1]);
    embeddings.insert(far.profile_text(), vec![0.0, 1.0]);
    // Zero magnitude must rank last with similarity 0, not NaN.
    embeddings.insert(zero.profile_text(), vec![0.0, 0.0]);

    let matching = MatchService::new(
        ctx.store.clone(),
        Arc::new(FixedProvider { embeddings }),
        4,
    );

    let first = matching.find_top_matches("u1", 3).await.unwrap();
    let ids: Vec<&str> = first.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["u2", "u3", "u4"]);
    assert!(!ids.contains(&"u1"));

    for _ in 0..5 {
        let again = matching.find_top_matches("u1", 3).await.unwrap();
        let again_ids: Vec<&str> = again.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(again_ids, ids);
    }

    let top_one = matching.find_top_matches("u1", 1).await.unwrap();
    assert_eq!(top_one.len(), 1);
    assert_eq!(top_one[0].id, "u2");
}

#[tokio::test]
async fn matching_unknown_user_is_not_found() {
    let ctx = test_store().await;
    let matching = MatchService::new(
        ctx.store.clone(),
        Arc::new(FixedProvider {
            embeddings: HashMap::new(),
        }),
        4,
    );

    let err = matching.find_top_matches("nobody", 3).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

// ---------------------------------------------------------------------
// Messaging and meetings
// ---------------------------------------------------------------------

#[tokio::test]
async fn conversation_is_ordered_and_pair_scoped() {
    let ctx = test_store().await;
    let messaging = MessagingService::new(ctx.store.clone());

    messaging
        .send_message(&caller("a"), "b", "hello")
        .await
        .unwrap();
    messaging
        .send_message(&caller("b"), "a", "hi back")
        .await
        .unwrap();
    messaging
        .send_message(&caller("a"), "c", "unrelated")
        .await
        .unwrap();

    let conversation = messaging.conversation(&caller("a"), "b").await.unwrap();
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation[0].content, "hello");
    assert_eq!(conversation[1].content, "hi back");
    assert!(conversation[0].timestamp <= conversation[1].timestamp);
}

#[tokio::test]
async fn meeting_validation_rejects_inverted_times() {
    let ctx = test_store().await;
    let messaging = MessagingService::new(ctx.store.clone());

    let start = Utc::now();
    let err = messaging
        .schedule_meeting(
            &caller("a"),
            MeetingInput {
                participants: vec!["b".to_string()],
                summary: "Sync".to_string(),
                description: String::new(),
                start,
                end: start - ChronoDuration::hours(1),
                meeting_link: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let meeting = messaging
        .schedule_meeting(
            &caller("a"),
            MeetingInput {
                participants: vec!["b".to_string()],
                summary: "Sync".to_string(),
                description: String::new(),
                start,
                end: start + ChronoDuration::hours(1),
                meeting_link: Some("https://meet.example.com/x".to_string()),
            },
        )
        .await
        .unwrap();

    let mine = messaging.meetings_for("a").await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, meeting.id);
}

// ---------------------------------------------------------------------
// Spec scenario
// ---------------------------------------------------------------------

#[tokio::test]
async fn full_networking_scenario() {
    let ctx = test_store().await;
    let events = EventService::new(ctx.store.clone());
    let connections = ConnectionService::new(ctx.store.clone());

    // u1 creates an event.
    let event = events
        .create_event(
            &caller("u1"),
            EventInput {
                title: "Meetup".to_string(),
                description: "x".to_string(),
                date: Utc::now() + ChronoDuration::days(30),
                location: "HQ".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(event.created_by, "u1");

    // u2 RSVPs going, then changes to maybe; same record both times.
    let first = events
        .upsert_rsvp(&caller("u2"), &event.id, RsvpStatus::Going)
        .await
        .unwrap();
    let second = events
        .upsert_rsvp(&caller("u2"), &event.id, RsvpStatus::Maybe)
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.status, RsvpStatus::Maybe);

    // u1 requests a connection; the duplicate conflicts.
    let conn_id = connections.send_request("u1", "u2").await.unwrap();
    assert!(matches!(
        connections.send_request("u1", "u2").await.unwrap_err(),
        AppError::Conflict(_)
    ));

    // u2 accepts; both sides see the edge.
    connections
        .respond(&conn_id, ConnectionStatus::Accepted)
        .await
        .unwrap();
    assert!(connections
        .accepted_peer_ids("u1")
        .await
        .unwrap()
        .contains(&"u2".to_string()));
}
