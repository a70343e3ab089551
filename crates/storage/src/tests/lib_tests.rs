use super::*;
use chrono::Duration;

async fn storage() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

/// Races need a real file so both tasks hit one database through separate
/// pool connections.
fn temp_db_root(tag: &str) -> std::path::PathBuf {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let root = std::env::temp_dir().join(format!("display_storage_test_{tag}_{suffix}"));
    std::fs::create_dir_all(&root).expect("temp dir");
    root
}

async fn file_backed_storage(tag: &str) -> (Storage, std::path::PathBuf) {
    let root = temp_db_root(tag);
    let url = format!("sqlite://{}/test.db", root.display());
    (Storage::new(&url).await.expect("db"), root)
}

async fn display(storage: &Storage, name: &str) -> DisplayId {
    let (display, _) = storage
        .find_or_create_display(name, Utc::now())
        .await
        .expect("display");
    display.display_id
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    storage().await.health_check().await.expect("health check");
}

#[tokio::test]
async fn find_or_create_display_is_idempotent() {
    let storage = storage().await;
    let now = Utc::now();
    let (first, created) = storage.find_or_create_display("lobby", now).await.expect("first");
    assert!(created);
    let (second, created) = storage.find_or_create_display("lobby", now).await.expect("second");
    assert!(!created);
    assert_eq!(first.display_id, second.display_id);
    assert_eq!(second.state.status, DisplayStatus::Disconnected);
    assert_eq!(second.state.ip, UNKNOWN_IP);

    let by_name = storage
        .load_display_by_name("lobby")
        .await
        .expect("load")
        .expect("some");
    assert_eq!(by_name.display_id, first.display_id);
}

#[tokio::test]
async fn record_hello_refreshes_contact_and_forces_running() {
    let storage = storage().await;
    let id = display(&storage, "lobby").await;
    let now = Utc::now();

    storage
        .record_hello(id, Some("10.0.0.7"), Some("conn-1"), now)
        .await
        .expect("hello");

    let loaded = storage.load_display(id).await.expect("load").expect("some");
    assert_eq!(loaded.state.status, DisplayStatus::Running);
    assert_eq!(loaded.state.ip, "10.0.0.7");
    assert_eq!(loaded.state.websocket_connection_id.as_deref(), Some("conn-1"));
    assert!(loaded.state.last_contact_at.is_some());
    assert!(loaded.state.last_hello.is_some());
}

#[tokio::test]
async fn blank_ip_falls_back_to_unknown() {
    let storage = storage().await;
    let id = display(&storage, "lobby").await;
    storage
        .record_hello(id, Some("   "), None, Utc::now())
        .await
        .expect("hello");
    let loaded = storage.load_display(id).await.expect("load").expect("some");
    assert_eq!(loaded.state.ip, UNKNOWN_IP);
}

#[tokio::test]
async fn commit_playback_position_writes_pointers_and_audit() {
    let storage = storage().await;
    let id = display(&storage, "lobby").await;
    let slide = storage.create_slide(None, "ad hoc", 10).await.expect("slide");
    let now = Utc::now();

    storage.set_live(id, true, now).await.expect("live");
    let live = storage
        .load_display(id)
        .await
        .expect("load")
        .expect("some")
        .live;
    assert!(live);

    storage
        .commit_playback_position(id, shared::domain::OVERRIDE_GROUP_ID, slide, None, live, now)
        .await
        .expect("commit");

    let loaded = storage.load_display(id).await.expect("load").expect("some");
    assert_eq!(loaded.state.current_slide_id, Some(slide.0));
    assert_eq!(loaded.state.current_group_id, Some(shared::domain::OVERRIDE_GROUP_ID));
    assert_eq!(loaded.state.status, DisplayStatus::Running);
    assert_eq!(storage.shown_count(id, slide).await.expect("count"), 1);
}

#[tokio::test]
async fn consuming_the_same_override_twice_fails_the_second_call() {
    let storage = storage().await;
    let id = display(&storage, "bar").await;
    let effect = storage.create_effect("fade").await.expect("effect");
    let slide = storage.create_slide(None, "promo", 20).await.expect("slide");
    let entry = storage
        .append_override(id, slide, 20, effect)
        .await
        .expect("append");

    let first = storage
        .consume_override(id, entry.override_id, Some("c1"), false, Utc::now())
        .await
        .expect("consume");
    assert!(first.is_some());

    let second = storage
        .consume_override(id, entry.override_id, Some("c2"), false, Utc::now())
        .await
        .expect("consume");
    assert!(second.is_none());
    assert_eq!(storage.shown_count(id, slide).await.expect("count"), 1);
}

#[tokio::test]
async fn concurrent_consumption_of_one_entry_has_a_single_winner() {
    let (storage, root) = file_backed_storage("consume_race").await;
    let id = display(&storage, "bar").await;
    let effect = storage.create_effect("fade").await.expect("effect");
    let slide = storage.create_slide(None, "promo", 20).await.expect("slide");
    let entry = storage
        .append_override(id, slide, 20, effect)
        .await
        .expect("append");

    let entry_id = entry.override_id;
    let a = storage.clone();
    let b = storage.clone();
    let first = tokio::spawn(async move {
        a.consume_override(id, entry_id, Some("c1"), false, Utc::now())
            .await
    });
    let second = tokio::spawn(async move {
        b.consume_override(id, entry_id, Some("c2"), false, Utc::now())
            .await
    });
    let first = first.await.expect("join").expect("consume");
    let second = second.await.expect("join").expect("consume");

    assert!(first.is_some() != second.is_some());
    assert_eq!(storage.shown_count(id, slide).await.expect("count"), 1);
    assert!(storage.list_overrides(id).await.expect("list").is_empty());

    std::fs::remove_dir_all(root).expect("cleanup");
}

#[tokio::test]
async fn concurrent_first_hellos_create_one_display() {
    let (storage, root) = file_backed_storage("hello_race").await;

    let a = storage.clone();
    let b = storage.clone();
    let first = tokio::spawn(async move { a.find_or_create_display("lobby", Utc::now()).await });
    let second = tokio::spawn(async move { b.find_or_create_display("lobby", Utc::now()).await });
    let (first, first_created) = first.await.expect("join").expect("display");
    let (second, second_created) = second.await.expect("join").expect("display");

    assert_eq!(first.display_id, second.display_id);
    assert!(first_created != second_created);
    assert_eq!(storage.list_displays().await.expect("list").len(), 1);

    std::fs::remove_dir_all(root).expect("cleanup");
}

#[tokio::test]
async fn removing_a_middle_entry_renumbers_contiguously() {
    let storage = storage().await;
    let id = display(&storage, "bar").await;
    let effect = storage.create_effect("fade").await.expect("effect");
    let mut slides = Vec::new();
    for name in ["a", "b", "c"] {
        slides.push(storage.create_slide(None, name, 5).await.expect("slide"));
    }
    let mut entries = Vec::new();
    for slide in &slides {
        entries.push(storage.append_override(id, *slide, 5, effect).await.expect("append"));
    }
    assert_eq!(
        entries.iter().map(|e| e.position).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    storage
        .consume_override(id, entries[1].override_id, None, false, Utc::now())
        .await
        .expect("consume")
        .expect("entry");

    let remaining = storage.list_overrides(id).await.expect("list");
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].slide_id, slides[0]);
    assert_eq!(remaining[1].slide_id, slides[2]);
    assert_eq!(remaining[0].position, 1);
    assert_eq!(remaining[1].position, 2);
}

#[tokio::test]
async fn repeated_errors_share_one_open_ticket() {
    let storage = storage().await;
    let id = display(&storage, "foo").await;
    let now = Utc::now();

    let first = storage.append_error(id, "line one", now).await.expect("raise");
    let second = storage.append_error(id, "line two", now).await.expect("raise");
    assert_eq!(first, second);
    assert_eq!(storage.ticket_count(id).await.expect("count"), 1);

    let ticket = storage.open_ticket(id).await.expect("open").expect("ticket");
    assert!(ticket.description.contains("line one"));
    assert!(ticket.description.ends_with("line two"));

    let loaded = storage.load_display(id).await.expect("load").expect("some");
    assert_eq!(loaded.state.status, DisplayStatus::Error);
}

#[tokio::test]
async fn closing_a_ticket_leaves_status_alone() {
    let storage = storage().await;
    let id = display(&storage, "foo").await;
    let ticket = storage.append_error(id, "boom", Utc::now()).await.expect("raise");

    // Another display's id cannot close this ticket.
    let other = display(&storage, "other").await;
    assert!(!storage.close_ticket(other, ticket, Utc::now()).await.expect("close"));
    assert!(storage.open_ticket(id).await.expect("open").is_some());

    assert!(storage.close_ticket(id, ticket, Utc::now()).await.expect("close"));
    assert!(storage.open_ticket(id).await.expect("open").is_none());

    let loaded = storage.load_display(id).await.expect("load").expect("some");
    assert_eq!(loaded.state.status, DisplayStatus::Error);

    // A new error after closing opens a fresh ticket.
    storage.append_error(id, "again", Utc::now()).await.expect("raise");
    assert_eq!(storage.ticket_count(id).await.expect("count"), 2);
}

#[tokio::test]
async fn disconnect_matches_by_connection_id() {
    let storage = storage().await;
    let id = display(&storage, "lobby").await;
    storage
        .record_hello(id, None, Some("conn-9"), Utc::now())
        .await
        .expect("hello");

    let bound = storage
        .load_display_by_connection("conn-9")
        .await
        .expect("load")
        .expect("some");
    assert_eq!(bound.display_id, id);

    assert!(storage
        .mark_disconnected("unknown-conn", Utc::now())
        .await
        .expect("disconnect")
        .is_none());

    let disconnected = storage
        .mark_disconnected("conn-9", Utc::now())
        .await
        .expect("disconnect")
        .expect("display");
    assert_eq!(disconnected.display_id, id);
    assert_eq!(disconnected.state.status, DisplayStatus::Disconnected);
    assert!(disconnected.state.websocket_connection_id.is_none());
    assert!(storage
        .load_display_by_connection("conn-9")
        .await
        .expect("load")
        .is_none());
}

#[tokio::test]
async fn late_query_skips_unmonitored_and_never_contacted_displays() {
    let storage = storage().await;
    let now = Utc::now();
    let stale = display(&storage, "stale").await;
    let fresh = display(&storage, "fresh").await;
    let silent = display(&storage, "silent").await;
    let ignored = display(&storage, "ignored").await;

    storage
        .record_hello(stale, None, None, now - Duration::minutes(10))
        .await
        .expect("hello");
    storage.record_hello(fresh, None, None, now).await.expect("hello");
    storage
        .record_hello(ignored, None, None, now - Duration::minutes(10))
        .await
        .expect("hello");
    storage.set_monitor(ignored, false, now).await.expect("monitor");
    let _ = silent;

    let cutoff = now - Duration::minutes(5);
    let late = storage.late_displays(cutoff).await.expect("late");
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].display_id, stale);
}

#[tokio::test]
async fn presentation_slides_follow_group_then_slide_order() {
    let storage = storage().await;
    let now = Utc::now();
    let effect = storage.create_effect("fade").await.expect("effect");
    let presentation = storage
        .create_presentation("infoloop", effect, 8, now)
        .await
        .expect("presentation");
    let intro = storage.create_group(presentation, "intro").await.expect("group");
    let main = storage.create_group(presentation, "main").await.expect("group");

    let s1 = storage.create_slide(Some(intro), "welcome", -1).await.expect("slide");
    let s2 = storage.create_slide(Some(main), "news", 30).await.expect("slide");
    let s3 = storage.create_slide(Some(intro), "agenda", -1).await.expect("slide");

    let ordered = storage
        .presentation_slides(presentation)
        .await
        .expect("slides");
    assert_eq!(
        ordered.iter().map(|s| s.slide_id).collect::<Vec<_>>(),
        vec![s1, s3, s2]
    );
}
