use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{BlobRef, ConversationId, MessageId, MessageKind, ParticipantRole, UserId};

/// Maximum length of the last-message preview stored on a conversation.
pub const LAST_MESSAGE_PREVIEW_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    pub preview: String,
    pub kind: MessageKind,
    pub sender_id: UserId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<UserId>,
    pub profiles: HashMap<UserId, ParticipantProfile>,
    pub unread_counts: HashMap<UserId, u32>,
    pub pinned_by: BTreeSet<UserId>,
    pub archived_by: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Builds a fresh two-party conversation with zeroed counters and empty
    /// membership sets.
    pub fn direct(
        id: ConversationId,
        a: (UserId, ParticipantProfile),
        b: (UserId, ParticipantProfile),
        now: DateTime<Utc>,
    ) -> Self {
        let participants = vec![a.0.clone(), b.0.clone()];
        let profiles = HashMap::from([(a.0.clone(), a.1), (b.0.clone(), b.1)]);
        let unread_counts = HashMap::from([(a.0, 0), (b.0, 0)]);
        Self {
            id,
            participants,
            profiles,
            unread_counts,
            pinned_by: BTreeSet::new(),
            archived_by: BTreeSet::new(),
            last_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }

    pub fn unread_for(&self, user_id: &UserId) -> u32 {
        self.unread_counts.get(user_id).copied().unwrap_or(0)
    }

    pub fn is_pinned_by(&self, user_id: &UserId) -> bool {
        self.pinned_by.contains(user_id)
    }

    pub fn is_archived_by(&self, user_id: &UserId) -> bool {
        self.archived_by.contains(user_id)
    }

    /// Sort key for chat lists: most recent activity first.
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|last| last.at)
            .unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    Media {
        blob: BlobRef,
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        size_bytes: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplySnippet {
    pub message_id: MessageId,
    pub sender_name: String,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    pub edited: bool,
    pub deleted: bool,
    pub pinned: bool,
    pub starred: bool,
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub read_by: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnippet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl Message {
    /// Truncated text used for conversation summaries and reply snippets.
    pub fn preview(&self) -> String {
        let text = match &self.body {
            MessageBody::Text { text } => text.as_str(),
            MessageBody::Media { filename, .. } => filename.as_str(),
        };
        text.chars().take(LAST_MESSAGE_PREVIEW_LEN).collect()
    }

    /// Replaces the payload while keeping id, sender and timestamp, so the
    /// message holds its position in the ordered sequence.
    pub fn tombstone(&mut self) {
        self.deleted = true;
        self.body = MessageBody::Text {
            text: String::new(),
        };
    }

    pub fn is_read_by(&self, user_id: &UserId) -> bool {
        self.read_by.contains(user_id)
    }

    pub fn reactors(&self, emoji: &str) -> Option<&BTreeSet<UserId>> {
        self.reactions.get(emoji)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing_in: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing_at: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    pub fn offline(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            online: false,
            last_seen: now,
            typing_in: None,
            typing_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message(text: &str) -> Message {
        Message {
            id: MessageId::from("m1"),
            conversation_id: ConversationId::from("c1"),
            sender_id: UserId::from("u1"),
            kind: MessageKind::Text,
            body: MessageBody::Text {
                text: text.to_string(),
            },
            created_at: "2026-01-01T00:00:00Z".parse().expect("timestamp"),
            edited: false,
            deleted: false,
            pinned: false,
            starred: false,
            reactions: BTreeMap::new(),
            read_by: BTreeSet::new(),
            reply_to: None,
            correlation_id: None,
        }
    }

    #[test]
    fn preview_truncates_long_text() {
        let message = text_message(&"x".repeat(250));
        assert_eq!(message.preview().chars().count(), LAST_MESSAGE_PREVIEW_LEN);
    }

    #[test]
    fn tombstone_keeps_identity_and_timestamp() {
        let mut message = text_message("secret");
        let id = message.id.clone();
        let at = message.created_at;
        message.tombstone();
        assert!(message.deleted);
        assert_eq!(message.id, id);
        assert_eq!(message.created_at, at);
        assert_eq!(
            message.body,
            MessageBody::Text {
                text: String::new()
            }
        );
    }

    #[test]
    fn conversation_activity_falls_back_to_created_at() {
        let now = "2026-02-01T10:00:00Z".parse().expect("timestamp");
        let conversation = Conversation::direct(
            ConversationId::from("c1"),
            (
                UserId::from("a"),
                ParticipantProfile {
                    name: "A".into(),
                    photo_url: None,
                    role: ParticipantRole::Coach,
                },
            ),
            (
                UserId::from("b"),
                ParticipantProfile {
                    name: "B".into(),
                    photo_url: None,
                    role: ParticipantRole::Client,
                },
            ),
            now,
        );
        assert_eq!(conversation.activity_at(), now);
        assert_eq!(conversation.unread_for(&UserId::from("a")), 0);
    }

    #[test]
    fn message_round_trips_through_json() {
        let mut message = text_message("hi");
        message.correlation_id = Some(Uuid::new_v4());
        message
            .reactions
            .entry("👍".to_string())
            .or_default()
            .insert(UserId::from("u2"));
        let raw = serde_json::to_string(&message).expect("serialize");
        let back: Message = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back, message);
    }
}
