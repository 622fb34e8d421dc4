/// Chat session tests
/// Drive ChatSession end to end against the in-memory backend

use chrono::{Duration as ChronoDuration, Utc};
use portal_chat_core::realtime::SubscriptionState;
use portal_chat_core::types::{ClientSummary, SubscriptionScope};
use portal_chat_core::{
    ChatConfig, ChatError, ChatMessage, ChatSession, InMemoryBackend, LocalStore, NoticeLevel,
    PortalEvent, Role, Viewer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

async fn login(
    viewer: Viewer,
    backend: &Arc<InMemoryBackend>,
    store: &LocalStore,
) -> ChatSession<InMemoryBackend> {
    ChatSession::init(viewer, backend.clone(), store.clone(), ChatConfig::default())
        .await
        .unwrap()
}

async fn next_event(session: &ChatSession<InMemoryBackend>) {
    timeout(Duration::from_secs(1), session.process_next_event())
        .await
        .expect("no bridge event arrived")
        .expect("bridge queue closed");
}

fn collect(rx: &mut broadcast::Receiver<PortalEvent>) -> Vec<PortalEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn ids(messages: &[ChatMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| m.durable_id().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_paging_yields_full_history_in_order() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let base = Utc::now() - ChronoDuration::hours(1);
    for i in 0..45 {
        backend
            .seed_message_at(
                &conv.id,
                if i % 2 == 0 { "client-a" } else { "admin-1" },
                if i % 2 == 0 { Role::Client } else { Role::Admin },
                &format!("message {}", i),
                base + ChronoDuration::seconds(i),
            )
            .await
            .unwrap();
    }

    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::client("client-a"), &backend, &store).await;
    session.select_conversation(&conv.id).await.unwrap();
    assert_eq!(session.messages().await.len(), 20);
    assert!(session.has_more_history().await);

    let mut loads = 0;
    while session.has_more_history().await {
        session.load_older().await.unwrap();
        loads += 1;
        assert!(loads <= 3, "paging did not terminate");
    }
    assert_eq!(session.load_older().await.unwrap(), 0);

    let loaded = session.messages().await;
    let expected: Vec<String> = backend
        .messages(&conv.id)
        .await
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids(&loaded), expected);
    assert!(loaded
        .windows(2)
        .all(|w| w[0].created_at() < w[1].created_at()));
}

#[tokio::test]
async fn test_optimistic_send_and_echo_leave_one_message() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::client("client-a"), &backend, &store).await;
    session.select_conversation(&conv.id).await.unwrap();

    let sent = session.send("Olá").await.unwrap();
    // The push echo of the same message
    next_event(&session).await;

    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].durable_id(), Some(sent.id.as_str()));
    assert_eq!(messages[0].content(), "Olá");
    assert!(!session.has_notification(&conv.id).await);
    assert!(session.pending_sends().await.is_empty());
}

#[tokio::test]
async fn test_echo_before_send_response_is_reconciled() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    backend.set_send_delay(Some(Duration::from_millis(200))).await;
    let store = LocalStore::temporary().unwrap();
    let session = Arc::new(login(Viewer::client("client-a"), &backend, &store).await);
    session.select_conversation(&conv.id).await.unwrap();

    let sender = session.clone();
    let send = tokio::spawn(async move { sender.send("Olá").await });

    // Echo lands while the send call is still waiting for its response
    next_event(&session).await;
    {
        let messages = session.messages().await;
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].is_pending());
    }

    let sent = send.await.unwrap().unwrap();
    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].durable_id(), Some(sent.id.as_str()));
    assert!(session.pending_sends().await.is_empty());
}

#[tokio::test]
async fn test_validation_rejects_before_network() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::client("client-a"), &backend, &store).await;

    assert!(matches!(
        session.send("hello").await,
        Err(ChatError::Validation(_))
    ));
    session.select_conversation(&conv.id).await.unwrap();
    assert!(matches!(session.send("  ").await, Err(ChatError::Validation(_))));
    assert!(session.messages().await.is_empty());
    assert!(backend.messages(&conv.id).await.is_empty());
}

#[tokio::test]
async fn test_failed_send_stays_visible_until_retried() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::client("client-a"), &backend, &store).await;
    session.select_conversation(&conv.id).await.unwrap();
    let mut events = session.subscribe_events();

    backend.fail_next_sends(1).await;
    assert!(session.send("urgent").await.is_err());

    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_failed());
    let temp_id = messages[0].temp_id().unwrap();

    let seen = collect(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, PortalEvent::SendFailed { temp_id: t, .. } if *t == temp_id)));
    assert!(seen.iter().any(|e| matches!(
        e,
        PortalEvent::Notice {
            level: NoticeLevel::Error,
            ..
        }
    )));

    let confirmed = session.retry(temp_id).await.unwrap();
    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].durable_id(), Some(confirmed.id.as_str()));
    assert!(session.pending_sends().await.is_empty());
}

#[tokio::test]
async fn test_next_send_retries_failed_first() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::client("client-a"), &backend, &store).await;
    session.select_conversation(&conv.id).await.unwrap();

    backend.fail_next_sends(1).await;
    assert!(session.send("first").await.is_err());
    session.send("second").await.unwrap();

    let contents: Vec<String> = backend
        .messages(&conv.id)
        .await
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["first", "second"]);
    let messages = session.messages().await;
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| !m.is_pending()));
}

#[tokio::test]
async fn test_discard_removes_failed_message() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::client("client-a"), &backend, &store).await;
    session.select_conversation(&conv.id).await.unwrap();

    backend.fail_next_sends(1).await;
    assert!(session.send("oops").await.is_err());
    let temp_id = session.messages().await[0].temp_id().unwrap();

    assert!(session.discard(temp_id).await);
    assert!(session.messages().await.is_empty());
    assert!(session.pending_sends().await.is_empty());
    assert!(!session.discard(temp_id).await);
}

#[tokio::test]
async fn test_admin_not_notified_by_admin_messages() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::admin("admin-1"), &backend, &store).await;
    let mut events = session.subscribe_events();

    backend
        .insert_message(&conv.id, "admin-2", Role::Admin, "internal note")
        .await
        .unwrap();
    next_event(&session).await;
    assert!(!session.has_notification(&conv.id).await);

    let from_client = backend
        .insert_message(&conv.id, "client-a", Role::Client, "any news?")
        .await
        .unwrap();
    next_event(&session).await;
    assert!(session.has_notification(&conv.id).await);
    assert_eq!(
        session.notifications().unread_ids(&conv.id).await,
        vec![from_client.id]
    );

    let seen = collect(&mut events);
    assert!(seen.contains(&PortalEvent::UnreadChanged {
        conversation_id: conv.id.clone(),
        unread: 1,
    }));
}

#[tokio::test]
async fn test_open_conversation_suppresses_notifications() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::admin("admin-1"), &backend, &store).await;
    session.select_conversation(&conv.id).await.unwrap();
    let mut events = session.subscribe_events();

    let incoming = backend
        .insert_message(&conv.id, "client-a", Role::Client, "hello")
        .await
        .unwrap();
    // Scoped and global subscriptions both deliver it
    next_event(&session).await;
    next_event(&session).await;

    assert_eq!(ids(&session.messages().await), vec![incoming.id.clone()]);
    assert!(!session.has_notification(&conv.id).await);

    let inserted = collect(&mut events)
        .into_iter()
        .filter(|e| matches!(e, PortalEvent::MessageInserted { .. }))
        .count();
    assert_eq!(inserted, 1);
}

#[tokio::test]
async fn test_selecting_conversation_marks_it_read() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::admin("admin-1"), &backend, &store).await;

    backend
        .insert_message(&conv.id, "client-a", Role::Client, "hi")
        .await
        .unwrap();
    next_event(&session).await;
    assert_eq!(session.unread_count(&conv.id).await, 1);

    session.select_conversation(&conv.id).await.unwrap();
    assert_eq!(session.unread_count(&conv.id).await, 0);
    assert_eq!(session.messages().await.len(), 1);
}

#[tokio::test]
async fn test_switch_drops_events_of_previous_conversation() {
    let backend = Arc::new(InMemoryBackend::new());
    let first = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let second = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::client("client-a"), &backend, &store).await;

    session.select_conversation(&first.id).await.unwrap();
    backend
        .insert_message(&first.id, "admin-1", Role::Admin, "late")
        .await
        .unwrap();
    // Let the forwarding task queue the event
    sleep(Duration::from_millis(50)).await;

    session.select_conversation(&second.id).await.unwrap();
    assert_eq!(session.drain_events().await, 1);
    assert!(session.messages().await.is_empty());
    assert_eq!(
        session.active_conversation().await.as_deref(),
        Some(second.id.as_str())
    );
    // Aborted forwarding task releases its receiver on the next scheduler pass
    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        backend
            .subscriber_count(&SubscriptionScope::Conversation(first.id.clone()))
            .await,
        0
    );
}

#[tokio::test]
async fn test_activity_reorders_conversation_list() {
    let backend = Arc::new(InMemoryBackend::new());
    let older = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let newer = backend
        .seed_conversation("client-b", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::admin("admin-1"), &backend, &store).await;
    assert_eq!(session.conversations().await[0].id, newer.id);
    let mut events = session.subscribe_events();

    backend
        .insert_message(&older.id, "client-a", Role::Client, "bump")
        .await
        .unwrap();
    next_event(&session).await;

    assert_eq!(session.conversations().await[0].id, older.id);
    assert!(collect(&mut events).iter().any(|e| matches!(
        e,
        PortalEvent::ConversationUpdated { conversation_id, .. } if *conversation_id == older.id
    )));
}

#[tokio::test]
async fn test_unknown_conversation_is_fetched_and_announced() {
    let backend = Arc::new(InMemoryBackend::new());
    backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::admin("admin-1"), &backend, &store).await;
    let mut events = session.subscribe_events();

    let fresh = backend
        .seed_conversation("client-new", ClientSummary::default())
        .await;
    backend
        .insert_message(&fresh.id, "client-new", Role::Client, "first contact")
        .await
        .unwrap();
    next_event(&session).await;

    let conversations = session.conversations().await;
    assert_eq!(conversations.len(), 2);
    assert_eq!(conversations[0].id, fresh.id);
    assert!(session.has_notification(&fresh.id).await);
    assert!(collect(&mut events).iter().any(|e| matches!(
        e,
        PortalEvent::ConversationInserted { conversation } if conversation.id == fresh.id
    )));
}

#[tokio::test]
async fn test_open_conversation_for_client_reuses_or_creates() {
    let backend = Arc::new(InMemoryBackend::new());
    let existing = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::admin("admin-1"), &backend, &store).await;
    let mut events = session.subscribe_events();

    let found = session
        .open_conversation_for_client("client-a", None)
        .await
        .unwrap();
    assert_eq!(found.id, existing.id);

    let created = session
        .open_conversation_for_client("client-b", Some("Cível"))
        .await
        .unwrap();
    assert_ne!(created.id, existing.id);
    assert_eq!(created.client_id, "client-b");
    let again = session
        .open_conversation_for_client("client-b", None)
        .await
        .unwrap();
    assert_eq!(again.id, created.id);

    let inserted = collect(&mut events)
        .into_iter()
        .filter(|e| matches!(e, PortalEvent::ConversationInserted { .. }))
        .count();
    assert_eq!(inserted, 1);
    assert_eq!(session.conversations().await.len(), 2);
}

#[tokio::test]
async fn test_dropped_channel_reconnects_and_resyncs() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::client("client-a"), &backend, &store).await;
    session.select_conversation(&conv.id).await.unwrap();

    backend.drop_live_channels().await;
    next_event(&session).await;
    assert_eq!(session.subscription_states().await.0, SubscriptionState::Detached);

    // Written while nobody listens
    let missed = backend
        .insert_message(&conv.id, "admin-1", Role::Admin, "while you were away")
        .await
        .unwrap();

    let restored = session.maintain_connections().await;
    assert_eq!(restored, vec![SubscriptionScope::Conversation(conv.id.clone())]);
    assert_eq!(session.subscription_states().await.0, SubscriptionState::Attached);
    assert_eq!(ids(&session.messages().await), vec![missed.id.clone()]);

    // Live delivery works again
    let live = backend
        .insert_message(&conv.id, "admin-1", Role::Admin, "back online")
        .await
        .unwrap();
    next_event(&session).await;
    assert_eq!(ids(&session.messages().await), vec![missed.id, live.id]);
}

#[tokio::test]
async fn test_reconnect_catches_up_missed_notifications() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::admin("admin-1"), &backend, &store).await;

    backend
        .insert_message(&conv.id, "client-a", Role::Client, "one")
        .await
        .unwrap();
    next_event(&session).await;
    assert_eq!(session.unread_count(&conv.id).await, 1);

    backend.drop_live_channels().await;
    next_event(&session).await;
    assert_eq!(session.subscription_states().await.1, SubscriptionState::Detached);

    backend
        .insert_message(&conv.id, "client-a", Role::Client, "two")
        .await
        .unwrap();
    let restored = session.maintain_connections().await;
    assert_eq!(restored, vec![SubscriptionScope::All]);
    assert_eq!(session.unread_count(&conv.id).await, 2);
}

#[tokio::test]
async fn test_teardown_detaches_everything() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::admin("admin-1"), &backend, &store).await;
    session.select_conversation(&conv.id).await.unwrap();
    assert_eq!(
        session.subscription_states().await,
        (SubscriptionState::Attached, SubscriptionState::Attached)
    );

    session.teardown().await;
    assert_eq!(
        session.subscription_states().await,
        (SubscriptionState::Detached, SubscriptionState::Detached)
    );
    assert!(session.active_conversation().await.is_none());
    assert!(session.messages().await.is_empty());
    assert!(session.maintain_connections().await.is_empty());
}

#[tokio::test]
async fn test_run_loop_applies_events_until_shutdown() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = Arc::new(login(Viewer::client("client-a"), &backend, &store).await);
    session.select_conversation(&conv.id).await.unwrap();
    let mut events = session.subscribe_events();

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let runner = session.clone();
    let handle = tokio::spawn(async move { runner.run(stop_rx).await });

    let reply = backend
        .insert_message(&conv.id, "admin-1", Role::Admin, "answer")
        .await
        .unwrap();
    let inserted = timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(PortalEvent::MessageInserted { message_id, .. }) = events.recv().await {
                return message_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(inserted, reply.id);

    stop_tx.send(true).unwrap();
    timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

async fn seed_history(backend: &InMemoryBackend, conversation_id: &str, count: i64) -> Vec<String> {
    let base = Utc::now() - ChronoDuration::hours(1);
    let mut ids = Vec::new();
    for i in 0..count {
        let m = backend
            .seed_message_at(
                conversation_id,
                "admin-1",
                Role::Admin,
                &format!("history {}", i),
                base + ChronoDuration::seconds(i),
            )
            .await
            .unwrap();
        ids.push(m.id);
    }
    ids
}

#[tokio::test]
async fn test_reselect_during_older_load_keeps_newest_page() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let history = seed_history(&backend, &conv.id, 45).await;
    let store = LocalStore::temporary().unwrap();
    let session = Arc::new(login(Viewer::client("client-a"), &backend, &store).await);
    session.select_conversation(&conv.id).await.unwrap();

    backend.set_page_delay(Some(Duration::from_millis(200))).await;
    let loader = session.clone();
    let older = tokio::spawn(async move { loader.load_older().await });
    sleep(Duration::from_millis(20)).await;

    session.select_conversation(&conv.id).await.unwrap();
    assert_eq!(older.await.unwrap().unwrap(), 0);

    let window = ids(&session.messages().await);
    assert_eq!(window, history[25..].to_vec());
    assert!(session.has_more_history().await);
}

#[tokio::test]
async fn test_switch_during_older_load_drops_page() {
    let backend = Arc::new(InMemoryBackend::new());
    let first = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let second = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    seed_history(&backend, &first.id, 45).await;
    let other = backend
        .insert_message(&second.id, "admin-1", Role::Admin, "other case")
        .await
        .unwrap();
    let store = LocalStore::temporary().unwrap();
    let session = Arc::new(login(Viewer::client("client-a"), &backend, &store).await);
    session.select_conversation(&first.id).await.unwrap();

    backend.set_page_delay(Some(Duration::from_millis(200))).await;
    let loader = session.clone();
    let older = tokio::spawn(async move { loader.load_older().await });
    sleep(Duration::from_millis(20)).await;

    backend.set_page_delay(None).await;
    session.select_conversation(&second.id).await.unwrap();
    assert_eq!(older.await.unwrap().unwrap(), 0);
    assert_eq!(ids(&session.messages().await), vec![other.id]);
}

#[tokio::test]
async fn test_switch_during_initial_load_drops_page() {
    let backend = Arc::new(InMemoryBackend::new());
    let first = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let second = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    seed_history(&backend, &first.id, 5).await;
    let other = backend
        .insert_message(&second.id, "admin-1", Role::Admin, "other case")
        .await
        .unwrap();
    let store = LocalStore::temporary().unwrap();
    let session = Arc::new(login(Viewer::client("client-a"), &backend, &store).await);

    backend.set_page_delay(Some(Duration::from_millis(200))).await;
    let selector = session.clone();
    let first_id = first.id.clone();
    let slow = tokio::spawn(async move { selector.select_conversation(&first_id).await });
    sleep(Duration::from_millis(20)).await;

    session.select_conversation(&second.id).await.unwrap();
    slow.await.unwrap().unwrap();

    assert_eq!(
        session.active_conversation().await.as_deref(),
        Some(second.id.as_str())
    );
    assert_eq!(ids(&session.messages().await), vec![other.id]);
}

#[tokio::test]
async fn test_fresh_admin_catches_up_after_outage() {
    let backend = Arc::new(InMemoryBackend::new());
    let conv = backend
        .seed_conversation("client-a", ClientSummary::default())
        .await;
    let store = LocalStore::temporary().unwrap();
    let session = login(Viewer::admin("admin-1"), &backend, &store).await;
    assert!(session.notifications().snapshot().await.last_seen_at.is_none());

    backend.drop_live_channels().await;
    next_event(&session).await;
    assert_eq!(session.subscription_states().await.1, SubscriptionState::Detached);

    sleep(Duration::from_millis(5)).await;
    let missed = backend
        .insert_message(&conv.id, "client-a", Role::Client, "missed")
        .await
        .unwrap();

    let restored = session.maintain_connections().await;
    assert_eq!(restored, vec![SubscriptionScope::All]);
    assert_eq!(session.notifications().unread_ids(&conv.id).await, vec![missed.id]);
}
