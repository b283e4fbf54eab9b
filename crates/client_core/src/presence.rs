use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use shared::{
    domain::{ConversationId, UserId},
    error::SyncError,
    model::PresenceRecord,
};

use crate::{wait_or_cancelled, ChatSession, Disposer};

/// Peers' ephemeral state, best-effort and eventually consistent.
///
/// Staleness is applied at read time: a signal the owner never cleared still
/// expires once its timestamp falls outside the TTL, covering abrupt
/// disconnects.
#[derive(Debug, Clone, Default)]
pub struct PresenceRoster {
    records: HashMap<UserId, PresenceRecord>,
}

impl PresenceRoster {
    fn from_records(records: Vec<PresenceRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.user_id.clone(), record))
                .collect(),
        }
    }

    pub fn record(&self, user_id: &UserId) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    pub fn last_seen(&self, user_id: &UserId) -> Option<DateTime<Utc>> {
        self.records.get(user_id).map(|record| record.last_seen)
    }

    pub fn is_online(&self, user_id: &UserId, now: DateTime<Utc>, presence_ttl: Duration) -> bool {
        self.records
            .get(user_id)
            .map(|record| record.online && fresh(record.last_seen, now, presence_ttl))
            .unwrap_or(false)
    }

    /// Peers currently typing in the conversation, excluding the viewer.
    pub fn typing_in(
        &self,
        conversation_id: &ConversationId,
        viewer: &UserId,
        now: DateTime<Utc>,
        typing_ttl: Duration,
    ) -> Vec<UserId> {
        let mut out: Vec<UserId> = self
            .records
            .values()
            .filter(|record| {
                record.user_id != *viewer
                    && record.typing_in.as_ref() == Some(conversation_id)
                    && record
                        .typing_at
                        .map(|at| fresh(at, now, typing_ttl))
                        .unwrap_or(false)
            })
            .map(|record| record.user_id.clone())
            .collect();
        out.sort();
        out
    }
}

fn fresh(at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    match now.signed_duration_since(at).to_std() {
        Ok(age) => age <= ttl,
        // Timestamp ahead of the viewer clock: treat as fresh.
        Err(_) => true,
    }
}

struct TypingSignal {
    /// `Some` marks a keystroke in the conversation, `None` an explicit stop.
    conversation_id: Option<ConversationId>,
}

/// Heartbeat publisher plus debounced typing signals plus the peers'
/// presence subscription. Disposal publishes one final offline record.
pub struct PresenceHandle {
    roster: watch::Receiver<PresenceRoster>,
    typing_tx: mpsc::UnboundedSender<TypingSignal>,
    disposer: Disposer,
}

impl PresenceHandle {
    pub fn roster(&self) -> PresenceRoster {
        self.roster.borrow().clone()
    }

    pub async fn changed(&mut self) -> bool {
        self.roster.changed().await.is_ok()
    }

    /// Fire-and-forget. A keystroke burst collapses into at most one
    /// `typing=true` write; the trailing `typing=false` follows once the
    /// debounce window lapses with no further input.
    pub fn set_typing(&self, conversation_id: &ConversationId, is_typing: bool) {
        let _ = self.typing_tx.send(TypingSignal {
            conversation_id: is_typing.then(|| conversation_id.clone()),
        });
    }

    pub fn dispose(&self) {
        self.disposer.dispose();
    }

    pub fn disposer(&self) -> &Disposer {
        &self.disposer
    }
}

pub(crate) async fn start(session: Arc<ChatSession>) -> Result<PresenceHandle, SyncError> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (typing_tx, typing_rx) = mpsc::unbounded_channel();
    let (roster_tx, roster_rx) = watch::channel(PresenceRoster::default());
    tokio::spawn(run(session, roster_tx, typing_rx, cancel_rx));
    Ok(PresenceHandle {
        roster: roster_rx,
        typing_tx,
        disposer: Disposer::new(cancel_tx),
    })
}

async fn run(
    session: Arc<ChatSession>,
    roster_tx: watch::Sender<PresenceRoster>,
    mut typing_rx: mpsc::UnboundedReceiver<TypingSignal>,
    mut cancelled: watch::Receiver<bool>,
) {
    let settings = session.settings().clone();
    let debounce = chrono::Duration::from_std(settings.typing_debounce)
        .unwrap_or_else(|_| chrono::Duration::seconds(2));
    let mut heartbeat = tokio::time::interval(settings.heartbeat_interval);
    let expiry = tokio::time::sleep(settings.typing_debounce);
    tokio::pin!(expiry);
    // Conversation the local user is typing in, with the time of the last
    // published `typing=true`.
    let mut typing: Option<(ConversationId, DateTime<Utc>)> = None;

    'outer: loop {
        let subscription = session.store().subscribe_presence(session.tenant()).await;
        let mut snapshots = match subscription {
            Ok(stream) => stream,
            Err(err) => {
                warn!("presence: subscribe failed: {err}");
                if wait_or_cancelled(&mut cancelled, settings.resubscribe_delay).await {
                    break 'outer;
                }
                continue;
            }
        };
        loop {
            // Biased: the startup heartbeat lands before any queued typing
            // signal.
            tokio::select! {
                biased;
                _ = cancelled.changed() => break 'outer,
                _ = heartbeat.tick() => {
                    publish(&session, &typing).await;
                }
                signal = typing_rx.recv() => match signal {
                    Some(TypingSignal { conversation_id: Some(conversation_id) }) => {
                        let now = Utc::now();
                        let needs_write = match &typing {
                            Some((current, published_at)) => {
                                *current != conversation_id
                                    || now.signed_duration_since(*published_at) >= debounce
                            }
                            None => true,
                        };
                        if needs_write {
                            typing = Some((conversation_id, now));
                            publish(&session, &typing).await;
                        }
                        expiry
                            .as_mut()
                            .reset(tokio::time::Instant::now() + settings.typing_debounce);
                    }
                    Some(TypingSignal { conversation_id: None }) => {
                        if typing.take().is_some() {
                            publish(&session, &typing).await;
                        }
                    }
                    None => break 'outer,
                },
                _ = &mut expiry, if typing.is_some() => {
                    typing = None;
                    publish(&session, &typing).await;
                }
                incoming = snapshots.next() => match incoming {
                    Some(records) => {
                        let _ = roster_tx.send(PresenceRoster::from_records(records));
                    }
                    None => {
                        debug!("presence: subscription ended, resubscribing");
                        break;
                    }
                }
            }
        }
        if wait_or_cancelled(&mut cancelled, settings.resubscribe_delay).await {
            break 'outer;
        }
    }

    // Lifecycle hook: flip to offline exactly once on the way out.
    let record = PresenceRecord::offline(session.user_id().clone(), Utc::now());
    if let Err(err) = session
        .store()
        .publish_presence(session.tenant(), record)
        .await
    {
        debug!("presence: offline publish failed: {err}");
    }
}

async fn publish(session: &ChatSession, typing: &Option<(ConversationId, DateTime<Utc>)>) {
    let record = PresenceRecord {
        user_id: session.user_id().clone(),
        online: true,
        last_seen: Utc::now(),
        typing_in: typing.as_ref().map(|(conversation_id, _)| conversation_id.clone()),
        typing_at: typing.as_ref().map(|(_, at)| *at),
    };
    if let Err(err) = session
        .store()
        .publish_presence(session.tenant(), record)
        .await
    {
        debug!("presence: publish failed: {err}");
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
