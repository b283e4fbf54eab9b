use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use shared::{
    domain::{ConversationId, MessageId},
    error::SyncError,
    model::Message,
};
use storage::MessageCursor;

use crate::{
    mutations::{OptimisticWrite, WriteStatus},
    wait_or_cancelled, ChatSession, ClientEvent, Disposer, SubscriptionScope,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Closed,
    Subscribing,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Delivered,
    Pending,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MessageView {
    pub message: Message,
    pub delivery: DeliveryState,
}

#[derive(Debug, Clone)]
pub struct MessageStreamSnapshot {
    pub conversation_id: ConversationId,
    pub phase: StreamPhase,
    /// Ascending by server timestamp; unconfirmed optimistic writes sit at
    /// the end, ordered by submission.
    pub messages: Vec<MessageView>,
    pub reached_start: bool,
    pub stale: bool,
}

impl MessageStreamSnapshot {
    fn empty(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            phase: StreamPhase::Subscribing,
            messages: Vec::new(),
            reached_start: false,
            stale: false,
        }
    }

    /// Read-side projection: calendar-day sections in the viewer's offset.
    /// Pure over the snapshot; stored timestamps are untouched.
    pub fn grouped_by_day(&self, offset: FixedOffset) -> Vec<DaySection> {
        let mut sections: Vec<DaySection> = Vec::new();
        for view in &self.messages {
            let day = view.message.created_at.with_timezone(&offset).date_naive();
            match sections.last_mut() {
                Some(section) if section.day == day => section.messages.push(view.clone()),
                _ => sections.push(DaySection {
                    day,
                    messages: vec![view.clone()],
                }),
            }
        }
        sections
    }
}

#[derive(Debug, Clone)]
pub struct DaySection {
    pub day: NaiveDate,
    pub messages: Vec<MessageView>,
}

fn sort_key(message: &Message) -> (DateTime<Utc>, MessageId) {
    (message.created_at, message.id.clone())
}

struct StreamState {
    phase: StreamPhase,
    /// Paged history, ascending, strictly before the live tail.
    older: Vec<Message>,
    /// Live window, ascending.
    tail: Vec<Message>,
    reached_start: bool,
    stale: bool,
}

struct StreamShared {
    session: Arc<ChatSession>,
    conversation_id: ConversationId,
    state: Mutex<StreamState>,
    snapshots: watch::Sender<MessageStreamSnapshot>,
}

impl StreamShared {
    async fn publish(&self) {
        let snapshot = {
            let state = self.state.lock().await;
            let pending = self.session.outbox().pending_for(&self.conversation_id);
            compose(&self.conversation_id, &state, pending)
        };
        let _ = self.snapshots.send(snapshot);
    }

    async fn mark_stale(&self) {
        let transitioned = {
            let mut state = self.state.lock().await;
            let transitioned = !state.stale;
            state.stale = true;
            transitioned
        };
        if transitioned {
            let _ = self.session.events().send(ClientEvent::SubscriptionStale {
                scope: SubscriptionScope::Conversation(self.conversation_id.clone()),
            });
        }
        self.publish().await;
    }

    /// Merges a live tail snapshot. Messages that fell out of the bounded
    /// window move into the paged history so nothing held vanishes, and
    /// every echoed correlation id is reported for outbox reconciliation.
    async fn apply_server_snapshot(&self, incoming: Vec<Message>) {
        for message in &incoming {
            if let Some(correlation_id) = message.correlation_id {
                self.session.notify_echo(correlation_id);
            }
        }
        let recovered = {
            let mut state = self.state.lock().await;
            let recovered = state.stale;
            state.stale = false;
            state.phase = StreamPhase::Live;

            let incoming_ids: HashSet<&MessageId> = incoming.iter().map(|m| &m.id).collect();
            let min_key = incoming.first().map(sort_key);
            let mut older: Vec<Message> = Vec::new();
            let drained_older = state.older.drain(..).collect::<Vec<_>>();
            let drained_tail = state.tail.drain(..).collect::<Vec<_>>();
            for message in drained_older.into_iter().chain(drained_tail.into_iter()) {
                if incoming_ids.contains(&message.id) {
                    continue;
                }
                let keep = match &min_key {
                    Some(min) => sort_key(&message) < *min,
                    None => true,
                };
                if keep {
                    older.push(message);
                }
            }
            older.sort_by_key(sort_key);
            state.older = older;
            state.tail = incoming;
            recovered
        };
        if recovered {
            let _ = self
                .session
                .events()
                .send(ClientEvent::SubscriptionRecovered {
                    scope: SubscriptionScope::Conversation(self.conversation_id.clone()),
                });
        }
        self.publish().await;
    }

    /// Tears down in-memory state; nothing is cached across close/open.
    async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            state.phase = StreamPhase::Closed;
            state.older.clear();
            state.tail.clear();
            state.reached_start = false;
            state.stale = false;
        }
        self.publish().await;
    }
}

fn compose(
    conversation_id: &ConversationId,
    state: &StreamState,
    pending: Vec<OptimisticWrite>,
) -> MessageStreamSnapshot {
    let confirmed: HashSet<Uuid> = state
        .older
        .iter()
        .chain(&state.tail)
        .filter_map(|m| m.correlation_id)
        .collect();
    let mut messages: Vec<MessageView> = state
        .older
        .iter()
        .chain(&state.tail)
        .cloned()
        .map(|message| MessageView {
            message,
            delivery: DeliveryState::Delivered,
        })
        .collect();
    for entry in pending {
        // The echo replaces the optimistic copy in place; even a duplicated
        // echo can only match once.
        if confirmed.contains(&entry.correlation_id) {
            continue;
        }
        let delivery = match entry.status {
            WriteStatus::Pending => DeliveryState::Pending,
            WriteStatus::Failed => DeliveryState::Failed,
        };
        messages.push(MessageView {
            message: entry.message,
            delivery,
        });
    }
    MessageStreamSnapshot {
        conversation_id: conversation_id.clone(),
        phase: state.phase,
        messages,
        reached_start: state.reached_start,
        stale: state.stale,
    }
}

/// Live view of one open conversation. `close`/`dispose` releases the
/// underlying subscription; double-disposal is a no-op.
pub struct MessageStreamHandle {
    shared: Arc<StreamShared>,
    snapshots: watch::Receiver<MessageStreamSnapshot>,
    disposer: Disposer,
}

impl MessageStreamHandle {
    pub fn snapshot(&self) -> MessageStreamSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Resolves when a newer snapshot is available; false once the stream
    /// is gone.
    pub async fn changed(&mut self) -> bool {
        self.snapshots.changed().await.is_ok()
    }

    /// One-shot backward page anchored at the oldest held message. Valid
    /// only while the stream is live; never duplicates held ids and never
    /// reorders what is already loaded.
    pub async fn load_older(&self) -> Result<usize, SyncError> {
        let limit = self.shared.session.settings().older_page_size;
        let cursor = {
            let state = self.shared.state.lock().await;
            if state.phase != StreamPhase::Live {
                return Err(SyncError::StreamClosed(
                    "load_older requires a live stream".to_string(),
                ));
            }
            if state.reached_start {
                return Ok(0);
            }
            match state.older.first().or_else(|| state.tail.first()) {
                Some(first) => MessageCursor::of(first),
                // Nothing held yet, so there is no cursor to anchor on.
                None => return Ok(0),
            }
        };

        let page = self
            .shared
            .session
            .store()
            .fetch_messages_before(
                self.shared.session.tenant(),
                &self.shared.conversation_id,
                &cursor,
                limit,
            )
            .await
            .map_err(|err| SyncError::Subscription(err.to_string()))?;

        let added = {
            let mut state = self.shared.state.lock().await;
            let held: HashSet<MessageId> = state
                .older
                .iter()
                .chain(&state.tail)
                .map(|m| m.id.clone())
                .collect();
            let fresh: Vec<Message> = page
                .iter()
                .filter(|m| !held.contains(&m.id))
                .cloned()
                .collect();
            let added = fresh.len();
            state.reached_start = page.len() < limit;
            let mut merged = fresh;
            merged.extend(state.older.drain(..));
            merged.sort_by_key(sort_key);
            state.older = merged;
            added
        };
        debug!(conversation_id = %self.shared.conversation_id, added, "stream: older page loaded");
        self.shared.publish().await;
        Ok(added)
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.shared.conversation_id
    }

    pub fn close(&self) {
        self.disposer.dispose();
    }

    pub fn disposer(&self) -> &Disposer {
        &self.disposer
    }
}

pub(crate) async fn open(
    session: Arc<ChatSession>,
    conversation_id: &ConversationId,
) -> Result<MessageStreamHandle, SyncError> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (snapshot_tx, snapshot_rx) =
        watch::channel(MessageStreamSnapshot::empty(conversation_id.clone()));
    let shared = Arc::new(StreamShared {
        session,
        conversation_id: conversation_id.clone(),
        state: Mutex::new(StreamState {
            phase: StreamPhase::Subscribing,
            older: Vec::new(),
            tail: Vec::new(),
            reached_start: false,
            stale: false,
        }),
        snapshots: snapshot_tx,
    });
    tokio::spawn(run_pump(Arc::clone(&shared), cancel_rx));
    Ok(MessageStreamHandle {
        shared,
        snapshots: snapshot_rx,
        disposer: Disposer::new(cancel_tx),
    })
}

async fn run_pump(shared: Arc<StreamShared>, mut cancelled: watch::Receiver<bool>) {
    let page_size = shared.session.settings().page_size;
    let resubscribe_delay = shared.session.settings().resubscribe_delay;
    let mut outbox_rx = shared.session.outbox().subscribe_changes();
    loop {
        let subscription = shared
            .session
            .store()
            .subscribe_message_tail(shared.session.tenant(), &shared.conversation_id, page_size)
            .await;
        let mut snapshots = match subscription {
            Ok(stream) => stream,
            Err(err) => {
                warn!(conversation_id = %shared.conversation_id, "stream: subscribe failed: {err}");
                shared.mark_stale().await;
                if wait_or_cancelled(&mut cancelled, resubscribe_delay).await {
                    shared.close().await;
                    return;
                }
                continue;
            }
        };
        loop {
            tokio::select! {
                _ = cancelled.changed() => {
                    shared.close().await;
                    return;
                }
                changed = outbox_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    shared.publish().await;
                }
                incoming = snapshots.next() => match incoming {
                    Some(messages) => shared.apply_server_snapshot(messages).await,
                    None => {
                        debug!(conversation_id = %shared.conversation_id, "stream: subscription ended, resubscribing");
                        shared.mark_stale().await;
                        break;
                    }
                }
            }
        }
        if wait_or_cancelled(&mut cancelled, resubscribe_delay).await {
            shared.close().await;
            return;
        }
    }
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
