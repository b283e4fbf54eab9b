use super::*;

use storage::{ChatStore, MemoryStore};

use crate::tests::support::*;
use crate::DeliveryState;

async fn seeded_memory() -> (
    Arc<MemoryStore>,
    Arc<ChatSession>,
    Arc<ChatSession>,
    ConversationId,
) {
    let store = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn ChatStore> = Arc::clone(&store) as Arc<dyn ChatStore>;
    let ana = connect(Arc::clone(&store_dyn), "ana", fast_settings()).await;
    let ben = connect(store_dyn, "ben", fast_settings()).await;
    let conversation_id = ana
        .mutations()
        .create_direct_conversation(
            ben.user_id(),
            ParticipantProfile {
                name: "ana".into(),
                photo_url: None,
                role: shared::domain::ParticipantRole::Coach,
            },
            ParticipantProfile {
                name: "ben".into(),
                photo_url: None,
                role: shared::domain::ParticipantRole::Client,
            },
        )
        .await
        .expect("create conversation");
    (store, ana, ben, conversation_id)
}

async fn first_delivered_message(
    session: &Arc<ChatSession>,
    conversation_id: &ConversationId,
) -> Message {
    let mut stream = session
        .open_conversation(conversation_id)
        .await
        .expect("open");
    let snapshot = wait_for_stream(&mut stream, |s| {
        s.messages
            .iter()
            .any(|view| view.delivery == DeliveryState::Delivered)
    })
    .await;
    stream.close();
    snapshot
        .messages
        .into_iter()
        .find(|view| view.delivery == DeliveryState::Delivered)
        .map(|view| view.message)
        .expect("delivered message")
}

#[tokio::test]
async fn conversation_creation_reuses_the_existing_pair() {
    let (_, ana, ben, conversation_id) = seeded_memory().await;

    // Same pair, either direction, lands on the same conversation.
    let again = ana
        .mutations()
        .create_direct_conversation(
            ben.user_id(),
            profile("ana", shared::domain::ParticipantRole::Coach),
            profile("ben", shared::domain::ParticipantRole::Client),
        )
        .await
        .expect("idempotent create");
    assert_eq!(again, conversation_id);

    let reversed = ben
        .mutations()
        .create_direct_conversation(
            ana.user_id(),
            profile("ben", shared::domain::ParticipantRole::Client),
            profile("ana", shared::domain::ParticipantRole::Coach),
        )
        .await
        .expect("reverse create");
    assert_eq!(reversed, conversation_id);
}

#[tokio::test]
async fn send_increments_unread_only_for_recipients() {
    let (store, ana, ben, conversation_id) = seeded_memory().await;
    for i in 0..2 {
        ana.mutations()
            .send_text(&conversation_id, &format!("m{i}"), None)
            .await
            .expect("send");
    }
    let conversation = store
        .fetch_conversation(ana.tenant(), &conversation_id)
        .await
        .expect("fetch");
    assert_eq!(conversation.unread_for(ben.user_id()), 2);
    assert_eq!(conversation.unread_for(ana.user_id()), 0);
    let last = conversation.last_message.expect("summary");
    assert_eq!(last.preview, "m1");
    assert_eq!(last.sender_id, *ana.user_id());
}

#[tokio::test]
async fn reaction_toggle_flips_membership_per_user() {
    let (store, ana, ben, conversation_id) = seeded_memory().await;
    ana.mutations()
        .send_text(&conversation_id, "react to me", None)
        .await
        .expect("send");
    let message = first_delivered_message(&ana, &conversation_id).await;

    assert!(ben
        .mutations()
        .toggle_reaction(&conversation_id, &message.id, "🔥")
        .await
        .expect("toggle on"));
    let stored = store
        .fetch_message(ben.tenant(), &conversation_id, &message.id)
        .await
        .expect("fetch");
    assert_eq!(
        stored.reactors("🔥").map(|set| set.contains(ben.user_id())),
        Some(true)
    );

    assert!(!ben
        .mutations()
        .toggle_reaction(&conversation_id, &message.id, "🔥")
        .await
        .expect("toggle off"));
    let stored = store
        .fetch_message(ben.tenant(), &conversation_id, &message.id)
        .await
        .expect("fetch");
    assert!(stored.reactions.is_empty());
}

#[tokio::test]
async fn only_the_sender_may_edit_or_delete() {
    let (store, ana, ben, conversation_id) = seeded_memory().await;
    ana.mutations()
        .send_text(&conversation_id, "original", None)
        .await
        .expect("send");
    let message = first_delivered_message(&ana, &conversation_id).await;

    let err = ben
        .mutations()
        .edit_message(&conversation_id, &message.id, "hijacked")
        .await
        .expect_err("must deny");
    assert!(matches!(err, MutationError::PermissionDenied(_)));
    let err = ben
        .mutations()
        .delete_message(&conversation_id, &message.id)
        .await
        .expect_err("must deny");
    assert!(matches!(err, MutationError::PermissionDenied(_)));

    ana.mutations()
        .edit_message(&conversation_id, &message.id, "amended")
        .await
        .expect("edit");
    let stored = store
        .fetch_message(ana.tenant(), &conversation_id, &message.id)
        .await
        .expect("fetch");
    assert!(stored.edited);
    assert_eq!(stored.preview(), "amended");
    assert_eq!(stored.created_at, message.created_at);
}

#[tokio::test]
async fn delete_tombstones_without_changing_sequence_shape() {
    let (store, ana, _ben, conversation_id) = seeded_memory().await;
    ana.mutations()
        .send_text(&conversation_id, "first", None)
        .await
        .expect("send");
    ana.mutations()
        .send_text(&conversation_id, "second", None)
        .await
        .expect("send");

    let mut stream = ana
        .open_conversation(&conversation_id)
        .await
        .expect("open");
    let before = wait_for_stream(&mut stream, |s| {
        s.messages.len() == 2
            && s.messages
                .iter()
                .all(|view| view.delivery == DeliveryState::Delivered)
    })
    .await;
    let first_id = before.messages[0].message.id.clone();

    ana.mutations()
        .delete_message(&conversation_id, &first_id)
        .await
        .expect("delete");

    let after = wait_for_stream(&mut stream, |s| {
        s.messages.first().map(|view| view.message.deleted) == Some(true)
    })
    .await;
    assert_eq!(after.messages.len(), 2, "sequence length is preserved");
    assert_eq!(after.messages[0].message.id, first_id);
    let stored = store
        .fetch_message(ana.tenant(), &conversation_id, &first_id)
        .await
        .expect("fetch");
    assert_eq!(stored.preview(), "");
    assert_eq!(stored.created_at, before.messages[0].message.created_at);
}

#[tokio::test]
async fn star_and_pin_flags_toggle_on_the_message() {
    let (store, ana, _ben, conversation_id) = seeded_memory().await;
    ana.mutations()
        .send_text(&conversation_id, "flag me", None)
        .await
        .expect("send");
    let message = first_delivered_message(&ana, &conversation_id).await;

    assert!(ana
        .mutations()
        .toggle_star(&conversation_id, &message.id)
        .await
        .expect("star"));
    assert!(ana
        .mutations()
        .toggle_message_pin(&conversation_id, &message.id)
        .await
        .expect("pin"));
    let stored = store
        .fetch_message(ana.tenant(), &conversation_id, &message.id)
        .await
        .expect("fetch");
    assert!(stored.starred && stored.pinned);

    assert!(!ana
        .mutations()
        .toggle_star(&conversation_id, &message.id)
        .await
        .expect("unstar"));
    let stored = store
        .fetch_message(ana.tenant(), &conversation_id, &message.id)
        .await
        .expect("fetch");
    assert!(!stored.starred && stored.pinned);
}

#[tokio::test]
async fn conversation_pin_and_archive_stay_scoped_to_the_caller() {
    let (store, ana, ben, conversation_id) = seeded_memory().await;

    assert!(ana
        .mutations()
        .toggle_conversation_pin(&conversation_id)
        .await
        .expect("pin"));
    assert!(ana
        .mutations()
        .toggle_archive(&conversation_id)
        .await
        .expect("archive"));

    let conversation = store
        .fetch_conversation(ana.tenant(), &conversation_id)
        .await
        .expect("fetch");
    assert!(conversation.is_pinned_by(ana.user_id()));
    assert!(conversation.is_archived_by(ana.user_id()));
    assert!(!conversation.is_pinned_by(ben.user_id()));
    assert!(!conversation.is_archived_by(ben.user_id()));

    assert!(!ana
        .mutations()
        .toggle_conversation_pin(&conversation_id)
        .await
        .expect("unpin"));
    let conversation = store
        .fetch_conversation(ana.tenant(), &conversation_id)
        .await
        .expect("fetch");
    assert!(conversation.pinned_by.is_empty());
    assert!(conversation.is_archived_by(ana.user_id()));
}

#[tokio::test]
async fn media_send_uploads_then_references_the_blob() {
    let (store, ana, _ben, conversation_id) = seeded_memory().await;
    ana.mutations()
        .send_media(
            &conversation_id,
            MessageKind::Audio,
            MediaUpload {
                filename: "note.ogg".to_string(),
                mime_type: Some("audio/ogg".to_string()),
                bytes: vec![9, 9, 9],
            },
            None,
        )
        .await
        .expect("send media");

    let message = first_delivered_message(&ana, &conversation_id).await;
    assert_eq!(message.kind, MessageKind::Audio);
    match &message.body {
        MessageBody::Media {
            blob, size_bytes, ..
        } => {
            assert_eq!(*size_bytes, 3);
            let stored = store.blob(ana.tenant(), blob).await.expect("blob");
            assert_eq!(stored.bytes, vec![9, 9, 9]);
        }
        other => panic!("unexpected body: {other:?}"),
    }
}

#[tokio::test]
async fn failed_send_stays_visible_and_can_be_retried() {
    let store = ScriptedStore::new();
    store.insert_conversation(direct_conversation("c1", "ana", "ben"));
    let ana = connect(store.clone(), "ana", fast_settings()).await;
    let conversation_id = ConversationId::from("c1");
    let mut events = ana.subscribe_events();

    store.fail_next_commits(1);
    let err = ana
        .mutations()
        .send_text(&conversation_id, "doomed", None)
        .await
        .expect_err("send must fail");
    assert!(matches!(err, MutationError::Unavailable { .. }));
    assert_eq!(store.commit_count(), 0);

    let pending = ana.mutations().pending_writes(&conversation_id);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, WriteStatus::Failed);
    let correlation_id = pending[0].correlation_id;

    let event = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(ClientEvent::MutationFailed {
                correlation_id, ..
            }) = events.recv().await
            {
                break correlation_id;
            }
        }
    })
    .await
    .expect("failure event");
    assert_eq!(event, Some(correlation_id));

    ana.mutations()
        .retry_send(&correlation_id)
        .await
        .expect("retry");
    assert_eq!(store.commit_count(), 1);
    let pending = ana.mutations().pending_writes(&conversation_id);
    assert_eq!(pending[0].status, WriteStatus::Pending);
}

#[tokio::test]
async fn discard_removes_only_failed_writes() {
    let store = ScriptedStore::new();
    store.insert_conversation(direct_conversation("c1", "ana", "ben"));
    let ana = connect(store.clone(), "ana", fast_settings()).await;
    let conversation_id = ConversationId::from("c1");

    let correlation_id = ana
        .mutations()
        .send_text(&conversation_id, "in flight", None)
        .await
        .expect("send");
    let err = ana
        .mutations()
        .discard_failed(&correlation_id)
        .await
        .expect_err("pending writes are not discardable");
    assert!(matches!(err, MutationError::Conflict(_)));

    store.fail_next_commits(1);
    let err = ana
        .mutations()
        .send_text(&conversation_id, "doomed", None)
        .await
        .expect_err("send must fail");
    assert!(matches!(err, MutationError::Unavailable { .. }));
    let failed = ana
        .mutations()
        .pending_writes(&conversation_id)
        .into_iter()
        .find(|entry| entry.status == WriteStatus::Failed)
        .expect("failed entry");
    ana.mutations()
        .discard_failed(&failed.correlation_id)
        .await
        .expect("discard");
    assert!(ana
        .mutations()
        .pending_writes(&conversation_id)
        .iter()
        .all(|entry| entry.correlation_id != failed.correlation_id));
}

#[tokio::test]
async fn idempotent_mutations_retry_transient_failures_once() {
    let store = ScriptedStore::new();
    store.insert_conversation(direct_conversation("c1", "ana", "ben"));
    let ana = connect(store.clone(), "ana", fast_settings()).await;
    let conversation_id = ConversationId::from("c1");

    store.fail_next_commits(1);
    ana.mutations()
        .toggle_archive(&conversation_id)
        .await
        .expect("retried commit succeeds");
    assert_eq!(store.commit_count(), 1);

    // Two consecutive outages exhaust the single retry.
    store.fail_next_commits(2);
    let err = ana
        .mutations()
        .toggle_archive(&conversation_id)
        .await
        .expect_err("retries exhausted");
    assert!(matches!(
        err,
        MutationError::Unavailable { attempts: 2, .. }
    ));
}

#[tokio::test]
async fn optimistic_writes_expire_as_failed_without_an_echo() {
    let store = ScriptedStore::new();
    store.insert_conversation(direct_conversation("c1", "ana", "ben"));
    let mut settings = fast_settings();
    settings.reconcile_timeout = Duration::from_millis(150);
    let ana = connect(store.clone(), "ana", settings).await;
    let conversation_id = ConversationId::from("c1");
    let mut events = ana.subscribe_events();

    let correlation_id = ana
        .mutations()
        .send_text(&conversation_id, "lost in transit", None)
        .await
        .expect("send");

    let expired = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(ClientEvent::OptimisticTimedOut { correlation_id }) = events.recv().await {
                break correlation_id;
            }
        }
    })
    .await
    .expect("expiry event");
    assert_eq!(expired, correlation_id);

    let pending = ana.mutations().pending_writes(&conversation_id);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, WriteStatus::Failed);
}
