use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, mpsc, watch};
use tracing::info;
use uuid::Uuid;

use shared::{
    domain::{ConversationId, TenantId, UserId},
    error::{MutationError, SyncError},
};
use storage::ChatStore;

pub mod chat_list;
pub mod ledger;
pub mod mutations;
pub mod presence;
pub mod settings;
pub mod stream;
pub mod tenant;

pub use chat_list::{ChatListHandle, ChatListSnapshot};
pub use mutations::{MediaUpload, MutationOrchestrator, OptimisticWrite, WriteStatus};
pub use presence::{PresenceHandle, PresenceRoster};
pub use settings::{load_settings, SyncSettings};
pub use stream::{
    DaySection, DeliveryState, MessageStreamHandle, MessageStreamSnapshot, MessageView, StreamPhase,
};
pub use tenant::RuntimeContext;

/// Which live subscription an event refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope {
    ChatList,
    Conversation(ConversationId),
    Presence,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A mutation was rejected. For sends the optimistic entry stays visible
    /// as failed under this correlation id until retried or discarded.
    MutationFailed {
        correlation_id: Option<Uuid>,
        error: MutationError,
    },
    /// An optimistic write saw no server echo within the reconcile timeout.
    OptimisticTimedOut { correlation_id: Uuid },
    SubscriptionStale { scope: SubscriptionScope },
    SubscriptionRecovered { scope: SubscriptionScope },
}

/// One authenticated session against one tenant namespace.
///
/// Explicit and disposable: every subscription hangs off a handle with a
/// [`Disposer`], and dropping the session tears down its background tasks.
pub struct ChatSession {
    store: Arc<dyn ChatStore>,
    tenant: TenantId,
    user_id: UserId,
    settings: SyncSettings,
    events: broadcast::Sender<ClientEvent>,
    outbox: Arc<mutations::Outbox>,
    echo_tx: mpsc::UnboundedSender<Uuid>,
}

impl ChatSession {
    /// Resolves the tenant from the runtime context and wires the session.
    /// An unresolvable tenant fails fast here; nothing runs unscoped.
    pub async fn connect(
        store: Arc<dyn ChatStore>,
        context: &RuntimeContext,
        user_id: UserId,
        settings: SyncSettings,
    ) -> Result<Arc<Self>, SyncError> {
        let tenant = tenant::resolve(context)?;
        let (events, _) = broadcast::channel(256);
        let (echo_tx, echo_rx) = mpsc::unbounded_channel();
        let outbox = Arc::new(mutations::Outbox::new());
        let session = Arc::new(Self {
            store,
            tenant,
            user_id,
            settings,
            events: events.clone(),
            outbox: Arc::clone(&outbox),
            echo_tx,
        });
        mutations::spawn_reaper(
            Arc::downgrade(&outbox),
            events,
            echo_rx,
            session.settings.reconcile_timeout,
        );
        info!(tenant = %session.tenant, user_id = %session.user_id, "session: connected");
        Ok(session)
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn mutations(self: &Arc<Self>) -> MutationOrchestrator {
        MutationOrchestrator::new(Arc::clone(self))
    }

    pub async fn subscribe_chat_list(self: &Arc<Self>) -> Result<ChatListHandle, SyncError> {
        chat_list::subscribe(Arc::clone(self)).await
    }

    pub async fn open_conversation(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> Result<MessageStreamHandle, SyncError> {
        stream::open(Arc::clone(self), conversation_id).await
    }

    pub async fn start_presence(self: &Arc<Self>) -> Result<PresenceHandle, SyncError> {
        presence::start(Arc::clone(self)).await
    }

    pub(crate) fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub(crate) fn events(&self) -> &broadcast::Sender<ClientEvent> {
        &self.events
    }

    pub(crate) fn outbox(&self) -> &mutations::Outbox {
        &self.outbox
    }

    /// Read-side signal from the message stream: a server echo for this
    /// correlation id was observed. The orchestrator's reaper discards the
    /// matching optimistic record.
    pub(crate) fn notify_echo(&self, correlation_id: Uuid) {
        let _ = self.echo_tx.send(correlation_id);
    }
}

/// Releases the live subscription behind a handle.
///
/// Exactly-once semantics: the second and later calls, including the Drop
/// after an explicit call, are safe no-ops.
pub struct Disposer {
    cancel: StdMutex<Option<watch::Sender<bool>>>,
}

impl Disposer {
    pub(crate) fn new(cancel: watch::Sender<bool>) -> Self {
        Self {
            cancel: StdMutex::new(Some(cancel)),
        }
    }

    pub fn dispose(&self) {
        let sender = match self.cancel.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
    }

    pub fn is_disposed(&self) -> bool {
        match self.cancel.lock() {
            Ok(guard) => guard.is_none(),
            Err(_) => true,
        }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Sleeps for `delay` unless the disposer fires first; true means cancelled.
pub(crate) async fn wait_or_cancelled(
    cancelled: &mut watch::Receiver<bool>,
    delay: std::time::Duration,
) -> bool {
    tokio::select! {
        _ = cancelled.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
