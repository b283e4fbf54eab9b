use super::*;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration as StdDuration;

use shared::domain::{MessageKind, UserId};
use shared::model::MessageBody;
use storage::{ChatStore, MemoryStore, WriteBatch, WriteOp};

use crate::tests::support::*;

fn text_message(conversation: &str, sender: &str, text: &str, at: DateTime<Utc>) -> Message {
    let sender_id = UserId::from(sender);
    Message {
        id: MessageId::generate(),
        conversation_id: ConversationId::from(conversation),
        sender_id: sender_id.clone(),
        kind: MessageKind::Text,
        body: MessageBody::Text {
            text: text.to_string(),
        },
        created_at: at,
        edited: false,
        deleted: false,
        pinned: false,
        starred: false,
        reactions: BTreeMap::new(),
        read_by: BTreeSet::from([sender_id]),
        reply_to: None,
        correlation_id: None,
    }
}

#[tokio::test]
async fn duplicate_echo_never_duplicates_the_optimistic_message() {
    let store = ScriptedStore::new();
    store.insert_conversation(direct_conversation("c1", "ana", "ben"));
    let ana = connect(store.clone(), "ana", fast_settings()).await;
    let conversation_id = ConversationId::from("c1");
    let mut stream = ana
        .open_conversation(&conversation_id)
        .await
        .expect("open");
    wait_until(|| store.tail_subscriber_count() == 1).await;
    store.push_tail(Vec::new());

    ana.mutations()
        .send_text(&conversation_id, "hi", None)
        .await
        .expect("send");

    let pending = wait_for_stream(&mut stream, |s| {
        s.messages.len() == 1 && s.messages[0].delivery == DeliveryState::Pending
    })
    .await;
    assert_eq!(pending.messages[0].message.preview(), "hi");

    let mut echo = pending.messages[0].message.clone();
    echo.created_at = Utc::now();
    store.push_tail(vec![echo.clone()]);
    wait_for_stream(&mut stream, |s| {
        s.messages.len() == 1 && s.messages[0].delivery == DeliveryState::Delivered
    })
    .await;

    // The same echo delivered again must not resurrect a second copy.
    store.push_tail(vec![echo.clone()]);
    store.push_tail(vec![echo]);
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    let snapshot = stream.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].delivery, DeliveryState::Delivered);
    wait_until(|| ana.mutations().pending_writes(&conversation_id).is_empty()).await;
}

#[tokio::test]
async fn messages_falling_out_of_the_live_window_are_kept_as_history() {
    let store = ScriptedStore::new();
    store.insert_conversation(direct_conversation("c1", "ana", "ben"));
    let ana = connect(store.clone(), "ana", fast_settings()).await;
    let conversation_id = ConversationId::from("c1");
    let mut stream = ana
        .open_conversation(&conversation_id)
        .await
        .expect("open");
    wait_until(|| store.tail_subscriber_count() == 1).await;

    let base = Utc::now();
    let m1 = text_message("c1", "ana", "one", base);
    let m2 = text_message("c1", "ben", "two", base + chrono::Duration::seconds(1));
    let m3 = text_message("c1", "ana", "three", base + chrono::Duration::seconds(2));

    store.push_tail(vec![m1.clone(), m2.clone()]);
    wait_for_stream(&mut stream, |s| s.messages.len() == 2).await;

    // The server window slides forward; m1 leaves the tail but must stay
    // visible at its position.
    store.push_tail(vec![m2.clone(), m3.clone()]);
    let snapshot = wait_for_stream(&mut stream, |s| s.messages.len() == 3).await;
    let texts: Vec<String> = snapshot
        .messages
        .iter()
        .map(|view| view.message.preview())
        .collect();
    assert_eq!(texts, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn backward_pagination_preserves_held_order_and_ids() {
    let store = Arc::new(MemoryStore::new());
    let tenant = shared::domain::TenantId::from("acme");
    store
        .commit(
            &tenant,
            WriteBatch::new().with(WriteOp::CreateConversation(direct_conversation(
                "c1", "ana", "ben",
            ))),
        )
        .await
        .expect("create");
    for i in 0..12 {
        store
            .commit(
                &tenant,
                WriteBatch::new().with(WriteOp::InsertMessage(text_message(
                    "c1",
                    "ana",
                    &format!("m{i}"),
                    Utc::now(),
                ))),
            )
            .await
            .expect("insert");
    }

    let mut settings = fast_settings();
    settings.page_size = 4;
    settings.older_page_size = 3;
    let ben = connect(Arc::clone(&store) as Arc<dyn ChatStore>, "ben", settings).await;
    let conversation_id = ConversationId::from("c1");
    let mut stream = ben
        .open_conversation(&conversation_id)
        .await
        .expect("open");
    wait_for_stream(&mut stream, |s| {
        s.phase == StreamPhase::Live && s.messages.len() == 4
    })
    .await;

    let mut previous_ids: Vec<MessageId> = stream
        .snapshot()
        .messages
        .iter()
        .map(|view| view.message.id.clone())
        .collect();
    loop {
        let added = stream.load_older().await.expect("load older");
        let snapshot = stream.snapshot();
        let ids: Vec<MessageId> = snapshot
            .messages
            .iter()
            .map(|view| view.message.id.clone())
            .collect();

        let unique: std::collections::HashSet<&MessageId> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len(), "no duplicate ids after paging");
        assert_eq!(
            ids[ids.len() - previous_ids.len()..],
            previous_ids[..],
            "previously loaded messages keep their relative order"
        );
        for pair in snapshot.messages.windows(2) {
            assert!(pair[0].message.created_at < pair[1].message.created_at);
        }

        previous_ids = ids;
        if added == 0 || snapshot.reached_start {
            break;
        }
    }

    let snapshot = stream.snapshot();
    assert_eq!(snapshot.messages.len(), 12);
    assert!(snapshot.reached_start);
    assert_eq!(stream.load_older().await.expect("idempotent"), 0);
}

#[tokio::test]
async fn load_older_is_rejected_before_the_stream_is_live() {
    let store = ScriptedStore::new();
    store.insert_conversation(direct_conversation("c1", "ana", "ben"));
    let ana = connect(store.clone(), "ana", fast_settings()).await;
    let stream = ana
        .open_conversation(&ConversationId::from("c1"))
        .await
        .expect("open");
    assert_eq!(stream.snapshot().phase, StreamPhase::Subscribing);
    let err = stream.load_older().await.expect_err("must reject");
    assert!(matches!(err, SyncError::StreamClosed(_)));
}

#[tokio::test]
async fn closing_discards_in_memory_state() {
    let store = ScriptedStore::new();
    store.insert_conversation(direct_conversation("c1", "ana", "ben"));
    let ana = connect(store.clone(), "ana", fast_settings()).await;
    let conversation_id = ConversationId::from("c1");
    let mut stream = ana
        .open_conversation(&conversation_id)
        .await
        .expect("open");
    wait_until(|| store.tail_subscriber_count() == 1).await;
    store.push_tail(vec![text_message("c1", "ana", "hello", Utc::now())]);
    wait_for_stream(&mut stream, |s| s.messages.len() == 1).await;

    stream.close();
    wait_for_stream(&mut stream, |s| s.phase == StreamPhase::Closed).await;
    assert!(stream.snapshot().messages.is_empty());
    let err = stream.load_older().await.expect_err("closed stream");
    assert!(matches!(err, SyncError::StreamClosed(_)));
}

#[test]
fn day_grouping_is_a_pure_idempotent_projection() {
    let view = |at: DateTime<Utc>| MessageView {
        message: text_message("c1", "ana", "x", at),
        delivery: DeliveryState::Delivered,
    };
    let d1a: DateTime<Utc> = "2026-03-01T10:00:00Z".parse().expect("timestamp");
    let d1b: DateTime<Utc> = "2026-03-01T23:30:00Z".parse().expect("timestamp");
    let d2: DateTime<Utc> = "2026-03-02T00:10:00Z".parse().expect("timestamp");
    let snapshot = MessageStreamSnapshot {
        conversation_id: ConversationId::from("c1"),
        phase: StreamPhase::Live,
        messages: vec![view(d1a), view(d1b), view(d2)],
        reached_start: true,
        stale: false,
    };

    let utc = FixedOffset::east_opt(0).expect("offset");
    let sections = snapshot.grouped_by_day(utc);
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0].messages.len(), 2);
    assert_eq!(sections[1].messages.len(), 1);

    // Idempotent, and stored timestamps are untouched.
    let again = snapshot.grouped_by_day(utc);
    assert_eq!(again.len(), sections.len());
    assert_eq!(snapshot.messages[1].message.created_at, d1b);

    // A viewer two hours east sees the 23:30 message on the next day.
    let east = FixedOffset::east_opt(2 * 3600).expect("offset");
    let shifted = snapshot.grouped_by_day(east);
    assert_eq!(shifted.len(), 2);
    assert_eq!(shifted[0].messages.len(), 1);
    assert_eq!(shifted[1].messages.len(), 2);
}
