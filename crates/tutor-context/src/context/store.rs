//! Append-only message history for one session.

use crate::error::ContextError;
use crate::{Message, NewMessage, Segment};
use chrono::Utc;

/// Ordered conversation history.
///
/// Entries are never edited or removed during a session. The only exception
/// is [`rollback_last`](Self::rollback_last), which undoes the append made by
/// a turn that is being aborted.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    next_index: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and append a message. Returns its sequence index.
    pub fn append(&mut self, message: NewMessage) -> Result<u64, ContextError> {
        let role = message
            .role
            .ok_or_else(|| ContextError::InvalidRole("message role is not set".into()))?;
        validate_content(&message.content)?;

        let sequence_index = self.next_index;
        self.messages.push(Message {
            role,
            content: message.content,
            sequence_index,
            created_at: Utc::now(),
        });
        self.next_index += 1;
        Ok(sequence_index)
    }

    /// All messages in sequence order.
    pub fn all(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, position: usize) -> Option<&Message> {
        self.messages.get(position)
    }

    /// The anchor: the first message of the session.
    pub fn anchor(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Remove the most recent message and give back its sequence index.
    pub(crate) fn rollback_last(&mut self) -> Option<Message> {
        let message = self.messages.pop()?;
        self.next_index = message.sequence_index;
        Some(message)
    }

    pub(crate) fn clear(&mut self) {
        self.messages.clear();
        self.next_index = 0;
    }
}

fn validate_content(content: &[Segment]) -> Result<(), ContextError> {
    if content.is_empty() {
        return Err(ContextError::InvalidMessage("content is empty".into()));
    }
    let mut has_substance = false;
    for segment in content {
        match segment {
            Segment::Text { text } => has_substance |= !text.trim().is_empty(),
            Segment::ImageUrl { image_url } => {
                if image_url.url.trim().is_empty() {
                    return Err(ContextError::InvalidMessage(
                        "image segment has an empty url".into(),
                    ));
                }
                has_substance = true;
            }
        }
    }
    if !has_substance {
        return Err(ContextError::InvalidMessage(
            "content has no text or image".into(),
        ));
    }
    Ok(())
}
