use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use shared::{
    domain::{BlobRef, ConversationId, MessageId, MessageKind, TenantId, UserId},
    error::StoreError,
    model::{Conversation, LastMessage, Message, PresenceRecord},
};

/// Pagination anchor: pages are fetched strictly before `(created_at, id)`,
/// the same composite the store orders messages by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCursor {
    pub created_at: DateTime<Utc>,
    pub id: MessageId,
}

impl MessageCursor {
    pub fn of(message: &Message) -> Self {
        Self {
            created_at: message.created_at,
            id: message.id.clone(),
        }
    }
}

fn sort_key(message: &Message) -> (DateTime<Utc>, MessageId) {
    (message.created_at, message.id.clone())
}

/// Conversation membership sets toggled per participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipSet {
    PinnedBy,
    ArchivedBy,
}

/// One document mutation inside an atomic batch.
///
/// Set-valued updates (`AddReaction`, `AddReadBy`, `AddMembership` and their
/// removals) are idempotent so concurrent callers converge.
#[derive(Debug, Clone)]
pub enum WriteOp {
    CreateConversation(Conversation),
    /// `created_at` is reassigned by the store at commit time, strictly
    /// greater than any earlier timestamp in the conversation.
    InsertMessage(Message),
    EditMessageText {
        conversation_id: ConversationId,
        message_id: MessageId,
        text: String,
    },
    TombstoneMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    AddReaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: String,
        user_id: UserId,
    },
    RemoveReaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: String,
        user_id: UserId,
    },
    SetMessageStarred {
        conversation_id: ConversationId,
        message_id: MessageId,
        starred: bool,
    },
    SetMessagePinned {
        conversation_id: ConversationId,
        message_id: MessageId,
        pinned: bool,
    },
    AddReadBy {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
    },
    IncrementUnread {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    ResetUnread {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    /// `at` is stamped by the store with the batch timestamp, matching the
    /// server-assigned timestamp of a message inserted in the same batch.
    SetLastMessage {
        conversation_id: ConversationId,
        preview: String,
        kind: MessageKind,
        sender_id: UserId,
    },
    AddMembership {
        conversation_id: ConversationId,
        set: MembershipSet,
        user_id: UserId,
    },
    RemoveMembership {
        conversation_id: ConversationId,
        set: MembershipSet,
        user_id: UserId,
    },
}

/// An all-or-nothing multi-document write.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn with(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Live query result: the subscriber receives a full snapshot on subscribe
/// and again after every commit that can affect the query. The stream ends
/// when the store is dropped; resubscribing restarts it.
pub struct SnapshotStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> SnapshotStream<T> {
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<T> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/// Lets alternate `ChatStore` backends hand out snapshot streams.
impl<T> From<mpsc::UnboundedReceiver<T>> for SnapshotStream<T> {
    fn from(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// The document-store boundary consumed by the synchronization core.
///
/// Mirrors the vendor primitives the core relies on: live query
/// subscriptions, one-shot cursor pagination, atomic multi-document batches,
/// idempotent set-membership updates, server-assigned monotonic timestamps
/// and blob upload.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn subscribe_conversations(
        &self,
        tenant: &TenantId,
        user_id: &UserId,
    ) -> Result<SnapshotStream<Vec<Conversation>>, StoreError>;

    /// Live tail bounded to the `limit` most recent messages, ascending.
    async fn subscribe_message_tail(
        &self,
        tenant: &TenantId,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<SnapshotStream<Vec<Message>>, StoreError>;

    async fn subscribe_presence(
        &self,
        tenant: &TenantId,
    ) -> Result<SnapshotStream<Vec<PresenceRecord>>, StoreError>;

    async fn fetch_conversation(
        &self,
        tenant: &TenantId,
        conversation_id: &ConversationId,
    ) -> Result<Conversation, StoreError>;

    async fn fetch_message(
        &self,
        tenant: &TenantId,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<Message, StoreError>;

    /// One-shot backward page: up to `limit` messages strictly before the
    /// cursor, ascending.
    async fn fetch_messages_before(
        &self,
        tenant: &TenantId,
        conversation_id: &ConversationId,
        before: &MessageCursor,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Ids of messages at or before `up_to` that `user_id` has not read.
    async fn fetch_unread_message_ids(
        &self,
        tenant: &TenantId,
        conversation_id: &ConversationId,
        user_id: &UserId,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, StoreError>;

    async fn find_direct_conversation(
        &self,
        tenant: &TenantId,
        a: &UserId,
        b: &UserId,
    ) -> Result<Option<ConversationId>, StoreError>;

    async fn commit(&self, tenant: &TenantId, batch: WriteBatch) -> Result<(), StoreError>;

    async fn publish_presence(
        &self,
        tenant: &TenantId,
        record: PresenceRecord,
    ) -> Result<(), StoreError>;

    async fn upload_blob(
        &self,
        tenant: &TenantId,
        filename: &str,
        mime_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<BlobRef, StoreError>;
}

#[derive(Clone, Default)]
struct TenantShard {
    conversations: HashMap<ConversationId, Conversation>,
    // Kept sorted by (created_at, id); the sole ordering key.
    messages: HashMap<ConversationId, Vec<Message>>,
    presence: HashMap<UserId, PresenceRecord>,
    blobs: HashMap<BlobRef, StoredBlob>,
}

struct ConversationSubscriber {
    tenant: TenantId,
    user_id: UserId,
    tx: mpsc::UnboundedSender<Vec<Conversation>>,
}

struct TailSubscriber {
    tenant: TenantId,
    conversation_id: ConversationId,
    limit: usize,
    tx: mpsc::UnboundedSender<Vec<Message>>,
}

struct PresenceSubscriber {
    tenant: TenantId,
    tx: mpsc::UnboundedSender<Vec<PresenceRecord>>,
}

#[derive(Default)]
struct Subscribers {
    conversations: Vec<ConversationSubscriber>,
    tails: Vec<TailSubscriber>,
    presence: Vec<PresenceSubscriber>,
}

/// In-process `ChatStore` used by tests and the demo harness.
///
/// Commits are applied to a staged copy of the tenant shard and swapped in
/// only when every op validates, so a failing batch leaves no partial state.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<HashMap<TenantId, TenantShard>>,
    subscribers: Mutex<Subscribers>,
    fail_next_commit: Mutex<Option<StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a one-shot commit failure; the next `commit` returns `err`
    /// without applying anything. Test hook for atomicity properties.
    pub async fn fail_next_commit(&self, err: StoreError) {
        *self.fail_next_commit.lock().await = Some(err);
    }

    pub async fn blob(&self, tenant: &TenantId, blob: &BlobRef) -> Option<StoredBlob> {
        let state = self.state.read().await;
        state.get(tenant)?.blobs.get(blob).cloned()
    }

    async fn notify(&self, tenant: &TenantId) {
        let state = self.state.read().await;
        let empty = TenantShard::default();
        let shard = state.get(tenant).unwrap_or(&empty);
        let mut subs = self.subscribers.lock().await;
        subs.conversations.retain(|sub| {
            sub.tenant != *tenant
                || sub
                    .tx
                    .send(conversations_for(shard, &sub.user_id))
                    .is_ok()
        });
        subs.tails.retain(|sub| {
            sub.tenant != *tenant
                || sub
                    .tx
                    .send(tail_for(shard, &sub.conversation_id, sub.limit))
                    .is_ok()
        });
    }

    async fn notify_presence(&self, tenant: &TenantId) {
        let state = self.state.read().await;
        let empty = TenantShard::default();
        let shard = state.get(tenant).unwrap_or(&empty);
        let mut subs = self.subscribers.lock().await;
        subs.presence.retain(|sub| {
            sub.tenant != *tenant || sub.tx.send(presence_for(shard)).is_ok()
        });
    }
}

fn conversations_for(shard: &TenantShard, user_id: &UserId) -> Vec<Conversation> {
    let mut out: Vec<Conversation> = shard
        .conversations
        .values()
        .filter(|conversation| conversation.has_participant(user_id))
        .cloned()
        .collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

fn tail_for(shard: &TenantShard, conversation_id: &ConversationId, limit: usize) -> Vec<Message> {
    let messages = match shard.messages.get(conversation_id) {
        Some(messages) => messages,
        None => return Vec::new(),
    };
    let start = messages.len().saturating_sub(limit);
    messages[start..].to_vec()
}

fn presence_for(shard: &TenantShard) -> Vec<PresenceRecord> {
    let mut out: Vec<PresenceRecord> = shard.presence.values().cloned().collect();
    out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    out
}

fn next_timestamp(shard: &TenantShard, conversation_id: &ConversationId, now: DateTime<Utc>) -> DateTime<Utc> {
    let last = shard
        .messages
        .get(conversation_id)
        .and_then(|messages| messages.last())
        .map(|message| message.created_at);
    match last {
        Some(last) if last >= now => last + Duration::milliseconds(1),
        _ => now,
    }
}

fn conversation_mut<'a>(
    shard: &'a mut TenantShard,
    conversation_id: &ConversationId,
) -> Result<&'a mut Conversation, StoreError> {
    shard
        .conversations
        .get_mut(conversation_id)
        .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))
}

fn message_mut<'a>(
    shard: &'a mut TenantShard,
    conversation_id: &ConversationId,
    message_id: &MessageId,
) -> Result<&'a mut Message, StoreError> {
    shard
        .messages
        .get_mut(conversation_id)
        .and_then(|messages| messages.iter_mut().find(|m| m.id == *message_id))
        .ok_or_else(|| {
            StoreError::NotFound(format!("message {message_id} in conversation {conversation_id}"))
        })
}

fn require_participant(conversation: &Conversation, user_id: &UserId) -> Result<(), StoreError> {
    if conversation.has_participant(user_id) {
        Ok(())
    } else {
        Err(StoreError::Validation(format!(
            "user {user_id} is not a participant of conversation {}",
            conversation.id
        )))
    }
}

fn apply_batch(shard: &mut TenantShard, batch: &WriteBatch) -> Result<(), StoreError> {
    let mut batch_at = Utc::now();
    for op in batch.ops() {
        match op {
            WriteOp::CreateConversation(conversation) => {
                validate_new_conversation(conversation)?;
                if shard.conversations.contains_key(&conversation.id) {
                    return Err(StoreError::Conflict(format!(
                        "conversation {} already exists",
                        conversation.id
                    )));
                }
                shard
                    .conversations
                    .insert(conversation.id.clone(), conversation.clone());
                shard.messages.entry(conversation.id.clone()).or_default();
            }
            WriteOp::InsertMessage(message) => {
                let conversation = shard
                    .conversations
                    .get(&message.conversation_id)
                    .ok_or_else(|| {
                        StoreError::NotFound(format!("conversation {}", message.conversation_id))
                    })?;
                require_participant(conversation, &message.sender_id)?;
                let messages = shard
                    .messages
                    .entry(message.conversation_id.clone())
                    .or_default();
                if messages.iter().any(|m| m.id == message.id) {
                    return Err(StoreError::Conflict(format!(
                        "message {} already exists",
                        message.id
                    )));
                }
                let assigned = next_timestamp(shard, &message.conversation_id, batch_at);
                let mut stored = message.clone();
                stored.created_at = assigned;
                batch_at = assigned;
                let messages = shard
                    .messages
                    .entry(message.conversation_id.clone())
                    .or_default();
                messages.push(stored);
                messages.sort_by_key(sort_key);
            }
            WriteOp::EditMessageText {
                conversation_id,
                message_id,
                text,
            } => {
                let message = message_mut(shard, conversation_id, message_id)?;
                if message.deleted {
                    return Err(StoreError::Conflict(format!(
                        "message {message_id} is deleted"
                    )));
                }
                match &mut message.body {
                    shared::model::MessageBody::Text { text: current } => {
                        *current = text.clone();
                    }
                    shared::model::MessageBody::Media { .. } => {
                        return Err(StoreError::Validation(format!(
                            "message {message_id} has no editable text"
                        )));
                    }
                }
                message.edited = true;
            }
            WriteOp::TombstoneMessage {
                conversation_id,
                message_id,
            } => {
                let message = message_mut(shard, conversation_id, message_id)?;
                if !message.deleted {
                    message.tombstone();
                }
            }
            WriteOp::AddReaction {
                conversation_id,
                message_id,
                emoji,
                user_id,
            } => {
                let conversation = conversation_mut(shard, conversation_id)?.clone();
                require_participant(&conversation, user_id)?;
                let message = message_mut(shard, conversation_id, message_id)?;
                message
                    .reactions
                    .entry(emoji.clone())
                    .or_default()
                    .insert(user_id.clone());
            }
            WriteOp::RemoveReaction {
                conversation_id,
                message_id,
                emoji,
                user_id,
            } => {
                let message = message_mut(shard, conversation_id, message_id)?;
                if let Some(reactors) = message.reactions.get_mut(emoji) {
                    reactors.remove(user_id);
                    if reactors.is_empty() {
                        message.reactions.remove(emoji);
                    }
                }
            }
            WriteOp::SetMessageStarred {
                conversation_id,
                message_id,
                starred,
            } => {
                message_mut(shard, conversation_id, message_id)?.starred = *starred;
            }
            WriteOp::SetMessagePinned {
                conversation_id,
                message_id,
                pinned,
            } => {
                message_mut(shard, conversation_id, message_id)?.pinned = *pinned;
            }
            WriteOp::AddReadBy {
                conversation_id,
                message_id,
                user_id,
            } => {
                let conversation = conversation_mut(shard, conversation_id)?.clone();
                require_participant(&conversation, user_id)?;
                message_mut(shard, conversation_id, message_id)?
                    .read_by
                    .insert(user_id.clone());
            }
            WriteOp::IncrementUnread {
                conversation_id,
                user_id,
            } => {
                let conversation = conversation_mut(shard, conversation_id)?;
                require_participant(conversation, user_id)?;
                let count = conversation.unread_counts.entry(user_id.clone()).or_insert(0);
                *count = count.saturating_add(1);
                conversation.updated_at = batch_at;
            }
            WriteOp::ResetUnread {
                conversation_id,
                user_id,
            } => {
                let conversation = conversation_mut(shard, conversation_id)?;
                require_participant(conversation, user_id)?;
                conversation.unread_counts.insert(user_id.clone(), 0);
                conversation.updated_at = batch_at;
            }
            WriteOp::SetLastMessage {
                conversation_id,
                preview,
                kind,
                sender_id,
            } => {
                let conversation = conversation_mut(shard, conversation_id)?;
                conversation.last_message = Some(LastMessage {
                    preview: preview.clone(),
                    kind: *kind,
                    sender_id: sender_id.clone(),
                    at: batch_at,
                });
                conversation.updated_at = batch_at;
            }
            WriteOp::AddMembership {
                conversation_id,
                set,
                user_id,
            } => {
                let conversation = conversation_mut(shard, conversation_id)?;
                require_participant(conversation, user_id)?;
                membership_mut(conversation, *set).insert(user_id.clone());
                conversation.updated_at = batch_at;
            }
            WriteOp::RemoveMembership {
                conversation_id,
                set,
                user_id,
            } => {
                let conversation = conversation_mut(shard, conversation_id)?;
                membership_mut(conversation, *set).remove(user_id);
                conversation.updated_at = batch_at;
            }
        }
    }
    Ok(())
}

fn membership_mut(
    conversation: &mut Conversation,
    set: MembershipSet,
) -> &mut std::collections::BTreeSet<UserId> {
    match set {
        MembershipSet::PinnedBy => &mut conversation.pinned_by,
        MembershipSet::ArchivedBy => &mut conversation.archived_by,
    }
}

fn validate_new_conversation(conversation: &Conversation) -> Result<(), StoreError> {
    if conversation.participants.len() != 2 {
        return Err(StoreError::Validation(format!(
            "direct conversation requires exactly two participants, got {}",
            conversation.participants.len()
        )));
    }
    if conversation.participants[0] == conversation.participants[1] {
        return Err(StoreError::Validation(
            "participants must be distinct".to_string(),
        ));
    }
    let participants: HashSet<&UserId> = conversation.participants.iter().collect();
    for user_id in conversation.pinned_by.iter().chain(&conversation.archived_by) {
        if !participants.contains(user_id) {
            return Err(StoreError::Validation(format!(
                "membership sets may only contain participants, found {user_id}"
            )));
        }
    }
    for user_id in conversation.unread_counts.keys() {
        if !participants.contains(user_id) {
            return Err(StoreError::Validation(format!(
                "unread counters may only cover participants, found {user_id}"
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn subscribe_conversations(
        &self,
        tenant: &TenantId,
        user_id: &UserId,
    ) -> Result<SnapshotStream<Vec<Conversation>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let state = self.state.read().await;
            let empty = TenantShard::default();
            let shard = state.get(tenant).unwrap_or(&empty);
            let _ = tx.send(conversations_for(shard, user_id));
        }
        self.subscribers
            .lock()
            .await
            .conversations
            .push(ConversationSubscriber {
                tenant: tenant.clone(),
                user_id: user_id.clone(),
                tx,
            });
        Ok(SnapshotStream { rx })
    }

    async fn subscribe_message_tail(
        &self,
        tenant: &TenantId,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<SnapshotStream<Vec<Message>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let state = self.state.read().await;
            let empty = TenantShard::default();
            let shard = state.get(tenant).unwrap_or(&empty);
            let _ = tx.send(tail_for(shard, conversation_id, limit));
        }
        self.subscribers.lock().await.tails.push(TailSubscriber {
            tenant: tenant.clone(),
            conversation_id: conversation_id.clone(),
            limit,
            tx,
        });
        Ok(SnapshotStream { rx })
    }

    async fn subscribe_presence(
        &self,
        tenant: &TenantId,
    ) -> Result<SnapshotStream<Vec<PresenceRecord>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let state = self.state.read().await;
            let empty = TenantShard::default();
            let shard = state.get(tenant).unwrap_or(&empty);
            let _ = tx.send(presence_for(shard));
        }
        self.subscribers
            .lock()
            .await
            .presence
            .push(PresenceSubscriber {
                tenant: tenant.clone(),
                tx,
            });
        Ok(SnapshotStream { rx })
    }

    async fn fetch_conversation(
        &self,
        tenant: &TenantId,
        conversation_id: &ConversationId,
    ) -> Result<Conversation, StoreError> {
        let state = self.state.read().await;
        state
            .get(tenant)
            .and_then(|shard| shard.conversations.get(conversation_id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))
    }

    async fn fetch_message(
        &self,
        tenant: &TenantId,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<Message, StoreError> {
        let state = self.state.read().await;
        state
            .get(tenant)
            .and_then(|shard| shard.messages.get(conversation_id))
            .and_then(|messages| messages.iter().find(|m| m.id == *message_id))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "message {message_id} in conversation {conversation_id}"
                ))
            })
    }

    async fn fetch_messages_before(
        &self,
        tenant: &TenantId,
        conversation_id: &ConversationId,
        before: &MessageCursor,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read().await;
        let messages = state
            .get(tenant)
            .and_then(|shard| shard.messages.get(conversation_id))
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        let anchor = (before.created_at, before.id.clone());
        let filtered: Vec<Message> = messages
            .iter()
            .filter(|m| sort_key(m) < anchor)
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit);
        Ok(filtered[start..].to_vec())
    }

    async fn fetch_unread_message_ids(
        &self,
        tenant: &TenantId,
        conversation_id: &ConversationId,
        user_id: &UserId,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, StoreError> {
        let state = self.state.read().await;
        let messages = state
            .get(tenant)
            .and_then(|shard| shard.messages.get(conversation_id))
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        Ok(messages
            .iter()
            .filter(|m| m.created_at <= up_to && !m.is_read_by(user_id))
            .map(|m| m.id.clone())
            .collect())
    }

    async fn find_direct_conversation(
        &self,
        tenant: &TenantId,
        a: &UserId,
        b: &UserId,
    ) -> Result<Option<ConversationId>, StoreError> {
        let state = self.state.read().await;
        Ok(state.get(tenant).and_then(|shard| {
            shard
                .conversations
                .values()
                .find(|conversation| {
                    conversation.participants.len() == 2
                        && conversation.has_participant(a)
                        && conversation.has_participant(b)
                })
                .map(|conversation| conversation.id.clone())
        }))
    }

    async fn commit(&self, tenant: &TenantId, batch: WriteBatch) -> Result<(), StoreError> {
        if let Some(err) = self.fail_next_commit.lock().await.take() {
            return Err(err);
        }
        {
            let mut state = self.state.write().await;
            let shard = state.entry(tenant.clone()).or_default();
            let mut staged = shard.clone();
            apply_batch(&mut staged, &batch)?;
            *shard = staged;
        }
        self.notify(tenant).await;
        Ok(())
    }

    async fn publish_presence(
        &self,
        tenant: &TenantId,
        record: PresenceRecord,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.fail_next_commit.lock().await.take() {
            return Err(err);
        }
        {
            let mut state = self.state.write().await;
            let shard = state.entry(tenant.clone()).or_default();
            shard.presence.insert(record.user_id.clone(), record);
        }
        self.notify_presence(tenant).await;
        Ok(())
    }

    async fn upload_blob(
        &self,
        tenant: &TenantId,
        filename: &str,
        mime_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<BlobRef, StoreError> {
        if filename.is_empty() {
            return Err(StoreError::Validation("filename must not be empty".into()));
        }
        let blob = BlobRef(format!(
            "tenants/{tenant}/media/{}/{filename}",
            Uuid::new_v4()
        ));
        let mut state = self.state.write().await;
        let shard = state.entry(tenant.clone()).or_default();
        shard.blobs.insert(
            blob.clone(),
            StoredBlob {
                filename: filename.to_string(),
                mime_type: mime_type.map(str::to_string),
                bytes,
            },
        );
        Ok(blob)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
