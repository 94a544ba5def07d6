//! Conversation state: per-character message histories and the rules for
//! merging streamed deltas into them.

pub mod preprocess;
pub mod prompt;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::metrics;
use prompt::{PromptGenerator, default_system_prompt};

/// Maximum messages kept per character before truncation.
pub const MAX_MESSAGES_PER_CHARACTER: usize = 100;

/// Appended to an assistant message that was cut off mid-generation.
pub const INTERRUPTION_MARKER: &str = "—";

/// User-message sentinel meaning "detected but empty speech".
pub const USER_SILENCE_MARKER: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Roles a streamed delta can carry. Keeps system/tool messages out of the
/// delta path by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaRole {
    User,
    Assistant,
}

impl From<DeltaRole> for Role {
    fn from(role: DeltaRole) -> Role {
        match role {
            DeltaRole::User => Role::User,
            DeltaRole::Assistant => Role::Assistant,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
        }
    }
}

/// Derived from the last message of the active history, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    WaitingForUser,
    UserSpeaking,
    BotSpeaking,
}

/// One character's conversation within a session.
///
/// The first message is always the system prompt; truncation preserves it
/// and the most recent messages.
pub struct CharacterHistory {
    pub character_name: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: Instant,
    pub last_accessed: Instant,
}

impl CharacterHistory {
    pub fn new(character_name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        let now = Instant::now();
        CharacterHistory {
            character_name: character_name.into(),
            messages: vec![ChatMessage::new(Role::System, system_prompt)],
            created_at: now,
            last_accessed: now,
        }
    }

    /// Drop the oldest non-system messages over the cap. Returns how many
    /// were removed.
    pub fn truncate_if_needed(&mut self, max_messages: usize) -> usize {
        if self.messages.len() <= max_messages {
            return 0;
        }
        let removed = self.messages.len() - max_messages;
        // Keep message[0] plus the last (max - 1) messages.
        self.messages.drain(1..=removed);
        removed
    }

    pub fn system_prompt(&self) -> &str {
        debug_assert!(self.messages[0].role == Role::System);
        &self.messages[0].content
    }

    pub fn update_system_prompt(&mut self, prompt: String) {
        debug_assert!(self.messages[0].role == Role::System);
        self.messages[0].content = prompt;
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

/// Session-scoped conversation aggregate: one history per character ever
/// visited, plus the active character pointer.
#[derive(Default)]
pub struct Chatbot {
    histories: HashMap<String, CharacterHistory>,
    current_character: Option<String>,
    prompt_generator: Option<Arc<dyn PromptGenerator>>,
}

impl Chatbot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_character(&self) -> Option<&str> {
        self.current_character.as_deref()
    }

    pub fn has_history(&self, name: &str) -> bool {
        self.histories.contains_key(name)
    }

    fn active_history(&self) -> Option<&CharacterHistory> {
        self.current_character
            .as_ref()
            .and_then(|name| self.histories.get(name))
    }

    fn active_history_mut(&mut self) -> Option<&mut CharacterHistory> {
        let name = self.current_character.clone()?;
        self.histories.get_mut(&name)
    }

    /// The active history's messages, or a default system-only history when
    /// no character has been selected yet.
    pub fn current_messages(&self) -> Vec<ChatMessage> {
        match self.active_history() {
            Some(history) => history.messages.clone(),
            None => vec![ChatMessage::new(Role::System, default_system_prompt())],
        }
    }

    pub fn message_count(&self) -> usize {
        self.active_history().map(|h| h.message_count()).unwrap_or(1)
    }

    pub fn conversation_state(&self) -> ConversationState {
        let messages = self.current_messages();
        let Some(last) = messages.last() else {
            return ConversationState::WaitingForUser;
        };
        match last.role {
            Role::Assistant => ConversationState::BotSpeaking,
            Role::User => {
                if last.content.trim().is_empty() {
                    ConversationState::WaitingForUser
                } else {
                    ConversationState::UserSpeaking
                }
            }
            Role::System => ConversationState::WaitingForUser,
            // Tool messages only exist in the completion engine's working
            // list, never in conversation history.
            Role::Tool => unreachable!("tool message in conversation history"),
        }
    }

    /// Append a streamed fragment to the active history.
    ///
    /// `expected_index` guards against races between producers: when the
    /// history has already grown past it, the delta is stale and dropped.
    /// Returns whether a new message was started, letting the producer
    /// track its own message index.
    pub fn add_message_delta(
        &mut self,
        delta: &str,
        role: DeltaRole,
        expected_index: Option<usize>,
    ) -> bool {
        let Some(history) = self.active_history_mut() else {
            warn!("Dropping chat delta: no active character");
            return false;
        };

        if let Some(index) = expected_index {
            if history.messages.len() > index {
                warn!(
                    delta,
                    ?role,
                    expected_index = index,
                    "Stale delta dropped: history moved on"
                );
                return false;
            }
        }

        let role: Role = role.into();
        let extends_last = matches!(history.messages.last(), Some(last) if last.role == role);

        let is_new_message = if extends_last {
            let Some(last) = history.messages.last_mut() else {
                unreachable!("extends_last implies a last message");
            };
            let was_empty = last.content.is_empty();
            let needs_space_left = !was_empty && !last.content.ends_with(char::is_whitespace);
            let needs_space_right = !delta.is_empty() && !delta.starts_with(char::is_whitespace);

            if needs_space_left && needs_space_right {
                last.content.push(' ');
            }
            last.content.push_str(delta);
            was_empty
        } else {
            history.messages.push(ChatMessage::new(role, delta));
            true
        };

        let removed = history.truncate_if_needed(MAX_MESSAGES_PER_CHARACTER);
        if removed > 0 {
            metrics::HISTORY_TRUNCATIONS.inc();
            info!(
                character = history.character_name,
                removed, "Truncated character history"
            );
        }

        is_new_message
    }

    /// Switch the active character, creating a history seeded with
    /// `system_prompt` on first visit. Re-switching an already-visited
    /// character only refreshes its access time; the previously rendered
    /// prompt stays. Returns whether a new history was created.
    pub fn switch_character(&mut self, name: &str, system_prompt: &str) -> bool {
        if name.trim().is_empty() {
            error!("Cannot switch to a character with an empty name");
            return false;
        }
        if system_prompt.trim().is_empty() {
            error!(character = name, "Cannot switch with an empty system prompt");
            return false;
        }

        let created = !self.histories.contains_key(name);
        if created {
            self.histories
                .insert(name.to_string(), CharacterHistory::new(name, system_prompt));
            info!(character = name, "Created character history");
        } else if let Some(history) = self.histories.get_mut(name) {
            history.last_accessed = Instant::now();
            info!(
                character = name,
                messages = history.message_count(),
                "Restored character history"
            );
        }

        self.current_character = Some(name.to_string());
        metrics::CHARACTER_SWITCHES.inc();
        created
    }

    /// Drop one character's history. Clearing the active character leaves
    /// no character selected.
    pub fn clear_history(&mut self, name: &str) {
        if self.histories.remove(name).is_none() {
            warn!(character = name, "Tried to clear a non-existent history");
            return;
        }
        if self.current_character.as_deref() == Some(name) {
            self.current_character = None;
        }
        info!(character = name, "Cleared character history");
    }

    /// Drop everything; called on session end.
    pub fn clear_all(&mut self) {
        let count = self.histories.len();
        self.histories.clear();
        self.current_character = None;
        debug!(count, "Cleared all character histories");
    }

    /// Messages ready for upstream submission.
    pub fn preprocessed_messages(&self) -> Vec<ChatMessage> {
        let current = self.current_messages();
        let messages = if current.len() > 2 {
            current
        } else {
            // Some chat models refuse a history with no user turn.
            vec![
                current[0].clone(),
                ChatMessage::new(Role::User, "Hello!"),
            ]
        };
        preprocess::preprocess_messages(&messages)
    }

    /// Render the generator once, freeze the result into the active
    /// history, and retain the generator as the "instructions configured"
    /// signal. The generator is never re-invoked automatically.
    pub fn set_prompt_generator(&mut self, generator: Arc<dyn PromptGenerator>) {
        let prompt = generator.make_system_prompt();
        if let Some(history) = self.active_history_mut() {
            history.update_system_prompt(prompt);
        }
        self.prompt_generator = Some(generator);
    }

    /// Retain a generator whose rendered prompt was already frozen by a
    /// character switch, without invoking it again.
    pub fn retain_prompt_generator(&mut self, generator: Arc<dyn PromptGenerator>) {
        self.prompt_generator = Some(generator);
    }

    pub fn prompt_generator(&self) -> Option<Arc<dyn PromptGenerator>> {
        self.prompt_generator.clone()
    }

    pub fn system_prompt(&self) -> String {
        self.current_messages()[0].content.clone()
    }

    /// Last non-blank message with the given role.
    pub fn last_message(&self, role: Role) -> Option<String> {
        self.current_messages()
            .iter()
            .rev()
            .find(|m| m.role == role && !m.content.trim().is_empty())
            .map(|m| m.content.clone())
    }
}
