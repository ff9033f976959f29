//! Conversation history owned by a single client.

use crate::types::{Message, Role};

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    system: Option<String>,
    messages: Vec<Message>,
}

impl Conversation {
    /// Empty, or `[system]` when a system prompt is given.
    pub fn new(system: Option<String>) -> Self {
        let system = system.filter(|s| !s.trim().is_empty());
        let mut conversation = Self {
            system,
            messages: Vec::new(),
        };
        conversation.clear();
        conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system.as_deref()
    }

    /// Messages after the leading system message.
    pub fn history(&self) -> &[Message] {
        match self.messages.first() {
            Some(first) if first.role == Role::System => &self.messages[1..],
            _ => &self.messages,
        }
    }

    /// Reset to the state right after construction. Idempotent.
    pub fn clear(&mut self) {
        self.messages.clear();
        if let Some(system) = &self.system {
            self.messages.push(Message::system(system.clone()));
        }
    }

    /// Record a completed exchange that did not go through a streaming turn.
    pub fn record_exchange(&mut self, user: Message, assistant: Message) {
        self.messages.push(user);
        self.messages.push(assistant);
    }

    /// Append `user` and return a guard that rolls the conversation back to
    /// its current length unless [`PendingTurn::commit`] is called.
    pub fn begin_turn(&mut self, user: Message) -> PendingTurn<'_> {
        let checkpoint = self.messages.len();
        self.messages.push(user);
        PendingTurn {
            conversation: self,
            checkpoint,
            reply: String::new(),
            committed: false,
        }
    }
}

pub struct PendingTurn<'a> {
    conversation: &'a mut Conversation,
    checkpoint: usize,
    reply: String,
    committed: bool,
}

impl PendingTurn<'_> {
    pub fn conversation(&self) -> &Conversation {
        self.conversation
    }

    pub fn push_delta(&mut self, delta: &str) {
        self.reply.push_str(delta);
    }

    pub fn reply(&self) -> &str {
        &self.reply
    }

    /// Append the accumulated reply as one assistant message.
    pub fn commit(mut self) {
        let reply = std::mem::take(&mut self.reply);
        self.conversation.messages.push(Message::assistant(reply));
        self.committed = true;
    }

    pub fn rollback(self) {}
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let dropped = self.conversation.messages.len() - self.checkpoint;
        self.conversation.messages.truncate(self.checkpoint);
        tracing::debug!(
            checkpoint = self.checkpoint,
            dropped,
            "rolled back unfinished turn"
        );
    }
}
