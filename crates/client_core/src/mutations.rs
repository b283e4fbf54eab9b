use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared::{
    domain::{BlobRef, ConversationId, MessageId, MessageKind, UserId},
    error::{MutationError, StoreError},
    model::{Conversation, Message, MessageBody, ParticipantProfile, ReplySnippet},
};
use storage::{MembershipSet, WriteBatch, WriteOp};

use crate::{ChatSession, ClientEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Pending,
    Failed,
}

/// Local-only shadow of an in-flight send: the draft rendered immediately,
/// keyed by the correlation id the server path echoes back.
#[derive(Debug, Clone)]
pub struct OptimisticWrite {
    pub correlation_id: Uuid,
    pub message: Message,
    pub status: WriteStatus,
    pub submitted_at: DateTime<Utc>,
}

/// The set of optimistic write records. Mutated only through the
/// orchestrator; the message stream reads it for reconciliation and reports
/// echoes back via the session's echo channel.
pub struct Outbox {
    entries: StdMutex<HashMap<Uuid, OptimisticWrite>>,
    /// Bumped on every mutation so read-side views can recompose.
    changed: watch::Sender<u64>,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            entries: StdMutex::new(HashMap::new()),
            changed,
        }
    }

    pub(crate) fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn bump(&self) {
        self.changed.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, OptimisticWrite>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, write: OptimisticWrite) {
        self.lock().insert(write.correlation_id, write);
        self.bump();
    }

    pub(crate) fn remove(&self, correlation_id: &Uuid) -> Option<OptimisticWrite> {
        let removed = self.lock().remove(correlation_id);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    fn get(&self, correlation_id: &Uuid) -> Option<OptimisticWrite> {
        self.lock().get(correlation_id).cloned()
    }

    fn mark_failed(&self, correlation_id: &Uuid) {
        if let Some(entry) = self.lock().get_mut(correlation_id) {
            entry.status = WriteStatus::Failed;
        }
        self.bump();
    }

    fn mark_pending(&self, correlation_id: &Uuid, submitted_at: DateTime<Utc>) {
        if let Some(entry) = self.lock().get_mut(correlation_id) {
            entry.status = WriteStatus::Pending;
            entry.submitted_at = submitted_at;
        }
        self.bump();
    }

    /// Outstanding writes for one conversation, oldest first.
    pub(crate) fn pending_for(&self, conversation_id: &ConversationId) -> Vec<OptimisticWrite> {
        let mut out: Vec<OptimisticWrite> = self
            .lock()
            .values()
            .filter(|entry| entry.message.conversation_id == *conversation_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (a.submitted_at, a.correlation_id).cmp(&(b.submitted_at, b.correlation_id))
        });
        out
    }

    /// Flips pending entries older than `cutoff` to failed; returns the
    /// correlation ids that expired in this pass.
    fn expire_pending_before(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        let mut expired = Vec::new();
        for entry in self.lock().values_mut() {
            if entry.status == WriteStatus::Pending && entry.submitted_at < cutoff {
                entry.status = WriteStatus::Failed;
                expired.push(entry.correlation_id);
            }
        }
        if !expired.is_empty() {
            self.bump();
        }
        expired
    }
}

/// Discards confirmed optimistic records and expires the ones that never
/// received a server echo. An expired record is surfaced, never silently
/// dropped.
pub(crate) fn spawn_reaper(
    outbox: Weak<Outbox>,
    events: broadcast::Sender<ClientEvent>,
    mut echo_rx: mpsc::UnboundedReceiver<Uuid>,
    reconcile_timeout: Duration,
) {
    tokio::spawn(async move {
        let period = (reconcile_timeout / 2).max(Duration::from_millis(50));
        let mut ticker = tokio::time::interval(period);
        let grace = chrono::Duration::from_std(reconcile_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        loop {
            tokio::select! {
                echoed = echo_rx.recv() => match echoed {
                    Some(correlation_id) => {
                        let Some(outbox) = outbox.upgrade() else { break };
                        if outbox.remove(&correlation_id).is_some() {
                            debug!(%correlation_id, "mutation: optimistic write confirmed by echo");
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let Some(outbox) = outbox.upgrade() else { break };
                    for correlation_id in outbox.expire_pending_before(Utc::now() - grace) {
                        warn!(%correlation_id, "mutation: no server echo within reconcile timeout");
                        let _ = events.send(ClientEvent::OptimisticTimedOut { correlation_id });
                    }
                }
            }
        }
    });
}

/// Media staged for a send; uploaded through the store's blob primitive.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Executes every state-changing operation as one atomic multi-document
/// batch. Failures come back typed; the optimistic overlay is rolled back or
/// marked failed in place.
#[derive(Clone)]
pub struct MutationOrchestrator {
    session: Arc<ChatSession>,
}

impl MutationOrchestrator {
    pub(crate) fn new(session: Arc<ChatSession>) -> Self {
        Self { session }
    }

    /// Reuses the existing conversation for the same pair, creating one only
    /// when none exists.
    pub async fn create_direct_conversation(
        &self,
        other_id: &UserId,
        own_profile: ParticipantProfile,
        other_profile: ParticipantProfile,
    ) -> Result<ConversationId, MutationError> {
        let me = self.session.user_id().clone();
        if *other_id == me {
            return Err(MutationError::PayloadRejected(
                "cannot start a conversation with yourself".to_string(),
            ));
        }
        if let Some(existing) = self
            .find_direct(other_id)
            .await?
        {
            return Ok(existing);
        }

        let conversation = Conversation::direct(
            ConversationId::generate(),
            (me, own_profile),
            (other_id.clone(), other_profile),
            Utc::now(),
        );
        let id = conversation.id.clone();
        let batch = WriteBatch::new().with(WriteOp::CreateConversation(conversation));
        match self.commit_idempotent(batch).await {
            Ok(()) => {
                info!(conversation_id = %id, "mutation: conversation created");
                Ok(id)
            }
            // Lost a creation race: fall back to the winner.
            Err(MutationError::Conflict(_)) => match self.find_direct(other_id).await? {
                Some(existing) => Ok(existing),
                None => Err(MutationError::Conflict(
                    "conversation creation conflicted".to_string(),
                )),
            },
            Err(err) => Err(err),
        }
    }

    /// Optimistic send: the draft is visible through the message stream
    /// before the server confirms. Never auto-retried; a failed send stays
    /// visible as failed under the returned correlation id.
    pub async fn send_text(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        reply_to: Option<ReplySnippet>,
    ) -> Result<Uuid, MutationError> {
        if text.trim().is_empty() {
            return Err(MutationError::PayloadRejected(
                "message text must not be empty".to_string(),
            ));
        }
        let body = MessageBody::Text {
            text: text.to_string(),
        };
        self.submit_send(conversation_id, MessageKind::Text, body, reply_to)
            .await
    }

    /// Uploads the blob, then sends a media message referencing it.
    pub async fn send_media(
        &self,
        conversation_id: &ConversationId,
        kind: MessageKind,
        upload: MediaUpload,
        reply_to: Option<ReplySnippet>,
    ) -> Result<Uuid, MutationError> {
        if kind == MessageKind::Text {
            return Err(MutationError::PayloadRejected(
                "media sends require a media kind".to_string(),
            ));
        }
        let size_bytes = upload.bytes.len() as u64;
        let filename = upload.filename.clone();
        let mime_type = upload.mime_type.clone();
        let blob = self.upload_media(upload).await?;
        let body = MessageBody::Media {
            blob,
            filename,
            mime_type,
            size_bytes,
        };
        self.submit_send(conversation_id, kind, body, reply_to).await
    }

    /// Stages media through the store's blob primitive; the returned
    /// reference is what a media send embeds.
    pub async fn upload_media(&self, upload: MediaUpload) -> Result<BlobRef, MutationError> {
        self.session
            .store()
            .upload_blob(
                self.session.tenant(),
                &upload.filename,
                upload.mime_type.as_deref(),
                upload.bytes,
            )
            .await
            .map_err(|err| MutationError::from_store(err, 1))
    }

    /// Re-submits a failed optimistic write under its original correlation
    /// id and message id.
    pub async fn retry_send(&self, correlation_id: &Uuid) -> Result<(), MutationError> {
        let entry = self
            .session
            .outbox()
            .get(correlation_id)
            .ok_or_else(|| {
                MutationError::NotFound(format!("no optimistic write {correlation_id}"))
            })?;
        if entry.status != WriteStatus::Failed {
            return Err(MutationError::Conflict(format!(
                "optimistic write {correlation_id} is still pending"
            )));
        }
        let conversation = self
            .conversation_for_caller(&entry.message.conversation_id)
            .await?;
        self.session
            .outbox()
            .mark_pending(correlation_id, Utc::now());
        match self
            .session
            .store()
            .commit(self.session.tenant(), send_batch(&conversation, &entry.message))
            .await
        {
            Ok(()) => {
                info!(%correlation_id, "send: retry committed");
                Ok(())
            }
            Err(err) => Err(self.fail_send(*correlation_id, err)),
        }
    }

    /// Drops a failed optimistic write at the caller's request.
    pub async fn discard_failed(&self, correlation_id: &Uuid) -> Result<(), MutationError> {
        let entry = self
            .session
            .outbox()
            .get(correlation_id)
            .ok_or_else(|| {
                MutationError::NotFound(format!("no optimistic write {correlation_id}"))
            })?;
        if entry.status != WriteStatus::Failed {
            return Err(MutationError::Conflict(format!(
                "optimistic write {correlation_id} is still pending"
            )));
        }
        self.session.outbox().remove(correlation_id);
        Ok(())
    }

    /// Outstanding optimistic writes for retry/discard affordances.
    pub fn pending_writes(&self, conversation_id: &ConversationId) -> Vec<OptimisticWrite> {
        self.session.outbox().pending_for(conversation_id)
    }

    /// Only the original sender may edit; ordering position is untouched.
    pub async fn edit_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        text: &str,
    ) -> Result<(), MutationError> {
        if text.trim().is_empty() {
            return Err(MutationError::PayloadRejected(
                "edited text must not be empty".to_string(),
            ));
        }
        let message = self.message_for_caller(conversation_id, message_id).await?;
        if message.sender_id != *self.session.user_id() {
            return Err(MutationError::PermissionDenied(
                "only the sender may edit a message".to_string(),
            ));
        }
        self.commit_idempotent(WriteBatch::new().with(WriteOp::EditMessageText {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            text: text.to_string(),
        }))
        .await
    }

    /// Tombstones in place; the id keeps its position so clients paging
    /// through history never see the sequence shrink.
    pub async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), MutationError> {
        let message = self.message_for_caller(conversation_id, message_id).await?;
        if message.sender_id != *self.session.user_id() {
            return Err(MutationError::PermissionDenied(
                "only the sender may delete a message".to_string(),
            ));
        }
        self.commit_idempotent(WriteBatch::new().with(WriteOp::TombstoneMessage {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        }))
        .await
    }

    /// Toggles the caller in the emoji's reactor set. Returns whether the
    /// reaction is present after the call.
    pub async fn toggle_reaction(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<bool, MutationError> {
        if emoji.is_empty() {
            return Err(MutationError::PayloadRejected(
                "emoji must not be empty".to_string(),
            ));
        }
        let me = self.session.user_id().clone();
        let message = self.message_for_caller(conversation_id, message_id).await?;
        let currently = message
            .reactors(emoji)
            .map(|set| set.contains(&me))
            .unwrap_or(false);
        let op = if currently {
            WriteOp::RemoveReaction {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
                emoji: emoji.to_string(),
                user_id: me,
            }
        } else {
            WriteOp::AddReaction {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
                emoji: emoji.to_string(),
                user_id: me,
            }
        };
        self.commit_idempotent(WriteBatch::new().with(op)).await?;
        Ok(!currently)
    }

    pub async fn toggle_star(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<bool, MutationError> {
        let message = self.message_for_caller(conversation_id, message_id).await?;
        let target = !message.starred;
        self.commit_idempotent(WriteBatch::new().with(WriteOp::SetMessageStarred {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            starred: target,
        }))
        .await?;
        Ok(target)
    }

    pub async fn toggle_message_pin(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<bool, MutationError> {
        let message = self.message_for_caller(conversation_id, message_id).await?;
        let target = !message.pinned;
        self.commit_idempotent(WriteBatch::new().with(WriteOp::SetMessagePinned {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            pinned: target,
        }))
        .await?;
        Ok(target)
    }

    /// Scoped to the caller's own membership; the other participant's view
    /// is untouched.
    pub async fn toggle_conversation_pin(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<bool, MutationError> {
        self.toggle_membership(conversation_id, MembershipSet::PinnedBy)
            .await
    }

    pub async fn toggle_archive(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<bool, MutationError> {
        self.toggle_membership(conversation_id, MembershipSet::ArchivedBy)
            .await
    }

    /// Atomically receipts every message at or before `up_to` and resets the
    /// caller's unread counter; neither effect is observable without the
    /// other. Returns how many messages were receipted.
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        up_to: DateTime<Utc>,
    ) -> Result<usize, MutationError> {
        let me = self.session.user_id().clone();
        self.conversation_for_caller(conversation_id).await?;
        let unread = self
            .session
            .store()
            .fetch_unread_message_ids(self.session.tenant(), conversation_id, &me, up_to)
            .await
            .map_err(|err| MutationError::from_store(err, 1))?;

        let mut batch = WriteBatch::new().with(WriteOp::ResetUnread {
            conversation_id: conversation_id.clone(),
            user_id: me.clone(),
        });
        for message_id in &unread {
            batch.push(WriteOp::AddReadBy {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
                user_id: me.clone(),
            });
        }
        self.commit_idempotent(batch).await?;
        debug!(conversation_id = %conversation_id, receipted = unread.len(), "mark_read: committed");
        Ok(unread.len())
    }

    async fn toggle_membership(
        &self,
        conversation_id: &ConversationId,
        set: MembershipSet,
    ) -> Result<bool, MutationError> {
        let me = self.session.user_id().clone();
        let conversation = self.conversation_for_caller(conversation_id).await?;
        let currently = match set {
            MembershipSet::PinnedBy => conversation.is_pinned_by(&me),
            MembershipSet::ArchivedBy => conversation.is_archived_by(&me),
        };
        let op = if currently {
            WriteOp::RemoveMembership {
                conversation_id: conversation_id.clone(),
                set,
                user_id: me,
            }
        } else {
            WriteOp::AddMembership {
                conversation_id: conversation_id.clone(),
                set,
                user_id: me,
            }
        };
        self.commit_idempotent(WriteBatch::new().with(op)).await?;
        Ok(!currently)
    }

    async fn submit_send(
        &self,
        conversation_id: &ConversationId,
        kind: MessageKind,
        body: MessageBody,
        reply_to: Option<ReplySnippet>,
    ) -> Result<Uuid, MutationError> {
        let conversation = self.conversation_for_caller(conversation_id).await?;
        let correlation_id = Uuid::new_v4();
        let me = self.session.user_id().clone();
        let message = Message {
            id: MessageId::generate(),
            conversation_id: conversation_id.clone(),
            sender_id: me.clone(),
            kind,
            body,
            // Local clock placeholder; the store assigns the real timestamp.
            created_at: Utc::now(),
            edited: false,
            deleted: false,
            pinned: false,
            starred: false,
            reactions: Default::default(),
            read_by: std::iter::once(me).collect(),
            reply_to,
            correlation_id: Some(correlation_id),
        };

        self.session.outbox().insert(OptimisticWrite {
            correlation_id,
            message: message.clone(),
            status: WriteStatus::Pending,
            submitted_at: Utc::now(),
        });

        match self
            .session
            .store()
            .commit(self.session.tenant(), send_batch(&conversation, &message))
            .await
        {
            Ok(()) => {
                debug!(conversation_id = %conversation_id, %correlation_id, "send: committed, awaiting echo");
                Ok(correlation_id)
            }
            Err(err) => Err(self.fail_send(correlation_id, err)),
        }
    }

    fn fail_send(&self, correlation_id: Uuid, err: StoreError) -> MutationError {
        let error = MutationError::from_store(err, 1);
        self.session.outbox().mark_failed(&correlation_id);
        warn!(%correlation_id, "send: failed, kept for retry: {error}");
        let _ = self.session.events().send(ClientEvent::MutationFailed {
            correlation_id: Some(correlation_id),
            error: error.clone(),
        });
        error
    }

    async fn find_direct(
        &self,
        other_id: &UserId,
    ) -> Result<Option<ConversationId>, MutationError> {
        self.session
            .store()
            .find_direct_conversation(self.session.tenant(), self.session.user_id(), other_id)
            .await
            .map_err(|err| MutationError::from_store(err, 1))
    }

    async fn conversation_for_caller(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Conversation, MutationError> {
        let conversation = self
            .session
            .store()
            .fetch_conversation(self.session.tenant(), conversation_id)
            .await
            .map_err(|err| MutationError::from_store(err, 1))?;
        if !conversation.has_participant(self.session.user_id()) {
            return Err(MutationError::PermissionDenied(format!(
                "user {} is not a participant of conversation {conversation_id}",
                self.session.user_id()
            )));
        }
        Ok(conversation)
    }

    async fn message_for_caller(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<Message, MutationError> {
        self.conversation_for_caller(conversation_id).await?;
        self.session
            .store()
            .fetch_message(self.session.tenant(), conversation_id, message_id)
            .await
            .map_err(|err| MutationError::from_store(err, 1))
    }

    /// Bounded automatic retry for idempotent operations only; sends go
    /// through `submit_send` and are never replayed implicitly.
    async fn commit_idempotent(&self, batch: WriteBatch) -> Result<(), MutationError> {
        let retries = self.session.settings().mutation_retries;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .session
                .store()
                .commit(self.session.tenant(), batch.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt <= retries => {
                    warn!(attempt, "mutation: transient store failure, retrying: {err}");
                    tokio::time::sleep(self.session.settings().retry_backoff).await;
                }
                Err(err) => return Err(MutationError::from_store(err, attempt)),
            }
        }
    }
}

fn send_batch(conversation: &Conversation, message: &Message) -> WriteBatch {
    let mut batch = WriteBatch::new()
        .with(WriteOp::InsertMessage(message.clone()))
        .with(WriteOp::SetLastMessage {
            conversation_id: conversation.id.clone(),
            preview: message.preview(),
            kind: message.kind,
            sender_id: message.sender_id.clone(),
        });
    for participant in &conversation.participants {
        if *participant != message.sender_id {
            batch.push(WriteOp::IncrementUnread {
                conversation_id: conversation.id.clone(),
                user_id: participant.clone(),
            });
        }
    }
    batch
}

#[cfg(test)]
#[path = "tests/mutations_tests.rs"]
mod tests;
