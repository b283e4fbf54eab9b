//! Derived unread/read-receipt projections.
//!
//! Nothing here writes: unread counters are mutated only by the send and
//! mark-read batches in [`crate::mutations`], and read-by sets only by
//! mark-read, which keeps the counters from diverging.

use shared::{
    domain::UserId,
    model::{Conversation, Message},
};

/// Badge total across every conversation the user participates in.
pub fn unread_total(conversations: &[Conversation], user_id: &UserId) -> u64 {
    conversations
        .iter()
        .map(|conversation| u64::from(conversation.unread_for(user_id)))
        .sum()
}

/// Participants other than the sender who have read the message.
pub fn read_receipts<'a>(message: &'a Message) -> Vec<&'a UserId> {
    message
        .read_by
        .iter()
        .filter(|user_id| **user_id != message.sender_id)
        .collect()
}

/// True once every participant appears in the message's read-by set.
pub fn is_read_by_all(message: &Message, participants: &[UserId]) -> bool {
    participants
        .iter()
        .all(|user_id| message.is_read_by(user_id))
}
