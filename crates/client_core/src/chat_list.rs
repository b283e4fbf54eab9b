use std::{cmp::Reverse, sync::Arc};

use tokio::sync::watch;
use tracing::{debug, warn};

use shared::{domain::UserId, error::SyncError, model::Conversation};

use crate::{ledger, wait_or_cancelled, ChatSession, ClientEvent, Disposer, SubscriptionScope};

/// Ordered view of every conversation the viewer participates in.
///
/// `stale` flags a dropped subscription while the last-known-good list stays
/// in place, so consumers never flash empty across a reconnect.
#[derive(Debug, Clone)]
pub struct ChatListSnapshot {
    pub viewer: UserId,
    pub conversations: Vec<Conversation>,
    pub unread_total: u64,
    pub stale: bool,
}

impl ChatListSnapshot {
    fn empty(viewer: UserId) -> Self {
        Self {
            viewer,
            conversations: Vec::new(),
            unread_total: 0,
            stale: false,
        }
    }

    /// Pure partition over `archived_by`; no extra subscription needed.
    pub fn active(&self) -> Vec<&Conversation> {
        self.conversations
            .iter()
            .filter(|c| !c.is_archived_by(&self.viewer))
            .collect()
    }

    pub fn archived(&self) -> Vec<&Conversation> {
        self.conversations
            .iter()
            .filter(|c| c.is_archived_by(&self.viewer))
            .collect()
    }
}

/// Total order: pinned-by-viewer first, then last activity descending, ties
/// broken by conversation id for determinism.
fn order(conversations: &mut [Conversation], viewer: &UserId) {
    conversations.sort_by_key(|conversation| {
        (
            !conversation.is_pinned_by(viewer),
            Reverse(conversation.activity_at()),
            conversation.id.clone(),
        )
    });
}

pub struct ChatListHandle {
    snapshots: watch::Receiver<ChatListSnapshot>,
    disposer: Disposer,
}

impl ChatListHandle {
    pub fn snapshot(&self) -> ChatListSnapshot {
        self.snapshots.borrow().clone()
    }

    pub async fn changed(&mut self) -> bool {
        self.snapshots.changed().await.is_ok()
    }

    pub fn dispose(&self) {
        self.disposer.dispose();
    }

    pub fn disposer(&self) -> &Disposer {
        &self.disposer
    }
}

pub(crate) async fn subscribe(session: Arc<ChatSession>) -> Result<ChatListHandle, SyncError> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (snapshot_tx, snapshot_rx) =
        watch::channel(ChatListSnapshot::empty(session.user_id().clone()));
    tokio::spawn(run_pump(session, snapshot_tx, cancel_rx));
    Ok(ChatListHandle {
        snapshots: snapshot_rx,
        disposer: Disposer::new(cancel_tx),
    })
}

async fn run_pump(
    session: Arc<ChatSession>,
    snapshot_tx: watch::Sender<ChatListSnapshot>,
    mut cancelled: watch::Receiver<bool>,
) {
    let viewer = session.user_id().clone();
    let resubscribe_delay = session.settings().resubscribe_delay;
    loop {
        let subscription = session
            .store()
            .subscribe_conversations(session.tenant(), &viewer)
            .await;
        let mut snapshots = match subscription {
            Ok(stream) => stream,
            Err(err) => {
                warn!(user_id = %viewer, "chat_list: subscribe failed: {err}");
                mark_stale(&session, &snapshot_tx);
                if wait_or_cancelled(&mut cancelled, resubscribe_delay).await {
                    return;
                }
                continue;
            }
        };
        loop {
            tokio::select! {
                _ = cancelled.changed() => return,
                incoming = snapshots.next() => match incoming {
                    Some(mut conversations) => {
                        order(&mut conversations, &viewer);
                        let unread_total = ledger::unread_total(&conversations, &viewer);
                        let recovered = snapshot_tx.borrow().stale;
                        let _ = snapshot_tx.send(ChatListSnapshot {
                            viewer: viewer.clone(),
                            conversations,
                            unread_total,
                            stale: false,
                        });
                        if recovered {
                            let _ = session.events().send(ClientEvent::SubscriptionRecovered {
                                scope: SubscriptionScope::ChatList,
                            });
                        }
                    }
                    None => {
                        debug!(user_id = %viewer, "chat_list: subscription ended, resubscribing");
                        mark_stale(&session, &snapshot_tx);
                        break;
                    }
                }
            }
        }
        if wait_or_cancelled(&mut cancelled, resubscribe_delay).await {
            return;
        }
    }
}

/// Keeps the last-known-good list, only flipping the stale flag.
fn mark_stale(session: &ChatSession, snapshot_tx: &watch::Sender<ChatListSnapshot>) {
    let mut current = snapshot_tx.borrow().clone();
    if !current.stale {
        current.stale = true;
        let _ = snapshot_tx.send(current);
        let _ = session.events().send(ClientEvent::SubscriptionStale {
            scope: SubscriptionScope::ChatList,
        });
    }
}

#[cfg(test)]
#[path = "tests/chat_list_tests.rs"]
mod tests;
