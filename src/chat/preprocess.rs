//! Message normalization applied just before upstream submission.

use super::{ChatMessage, INTERRUPTION_MARKER, Role, USER_SILENCE_MARKER};

/// Normalize a message list for the chat model:
///
/// - drop messages that are empty once the interruption marker is removed
///   (an interruption can land before the model says anything at all),
/// - collapse consecutive same-role messages into one,
/// - insert a synthetic user greeting when the sequence opens
///   `system, assistant` or is system-only (some models refuse an
///   assistant turn with no preceding user turn),
/// - strip the silence-marker prefix from user messages that carry real
///   content after it: the marker only matters to the live dialogue.
pub fn preprocess_messages(history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut output: Vec<ChatMessage> = Vec::with_capacity(history.len());

    for message in history {
        if message.content.replace(INTERRUPTION_MARKER, "").is_empty() {
            continue;
        }

        match output.last_mut() {
            Some(last) if last.role == message.role => {
                last.content.push(' ');
                last.content.push_str(&message.content);
            }
            _ => output.push(message.clone()),
        }
    }

    let role_at = |index: usize| output.get(index).map(|m| m.role);
    if role_at(0) == Some(Role::System) && matches!(role_at(1), None | Some(Role::Assistant)) {
        output.insert(1, ChatMessage::new(Role::User, "Hello."));
    }

    for message in &mut output {
        if message.role == Role::User
            && message.content.starts_with(USER_SILENCE_MARKER)
            && message.content != USER_SILENCE_MARKER
        {
            // The user went silent, got the marker, then spoke again before
            // the model answered. The system prompt has special handling for
            // the bare marker; with real content following it, it would
            // only confuse the model.
            message.content = message.content[USER_SILENCE_MARKER.len()..].to_string();
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> ChatMessage {
        ChatMessage::new(role, content)
    }

    #[test]
    fn test_consecutive_same_role_messages_merge() {
        let output = preprocess_messages(&[
            msg(Role::System, "prompt"),
            msg(Role::User, "first"),
            msg(Role::User, "second"),
            msg(Role::Assistant, "reply"),
        ]);
        assert_eq!(output.len(), 3);
        assert_eq!(output[1].content, "first second");
    }

    #[test]
    fn test_interruption_only_messages_are_dropped() {
        let output = preprocess_messages(&[
            msg(Role::System, "prompt"),
            msg(Role::User, "hi"),
            msg(Role::Assistant, INTERRUPTION_MARKER),
            msg(Role::User, "still there?"),
        ]);
        // The two user messages become neighbors after the drop, so they merge.
        assert_eq!(output.len(), 2);
        assert_eq!(output[1].role, Role::User);
        assert_eq!(output[1].content, "hi still there?");
    }

    #[test]
    fn test_synthetic_greeting_before_leading_assistant() {
        let output = preprocess_messages(&[
            msg(Role::System, "prompt"),
            msg(Role::Assistant, "I speak first."),
        ]);
        assert_eq!(output.len(), 3);
        assert_eq!(output[1].role, Role::User);
        assert_eq!(output[1].content, "Hello.");
        assert_eq!(output[2].role, Role::Assistant);
    }

    #[test]
    fn test_synthetic_greeting_after_bare_system() {
        let output = preprocess_messages(&[msg(Role::System, "prompt")]);
        assert_eq!(output.len(), 2);
        assert_eq!(output[1].role, Role::User);
    }

    #[test]
    fn test_silence_marker_prefix_is_stripped() {
        let output = preprocess_messages(&[
            msg(Role::System, "prompt"),
            msg(Role::User, "... actually, one more thing"),
        ]);
        assert_eq!(output[1].content, " actually, one more thing");
    }

    #[test]
    fn test_bare_silence_marker_is_kept() {
        let output = preprocess_messages(&[
            msg(Role::System, "prompt"),
            msg(Role::User, USER_SILENCE_MARKER),
        ]);
        assert_eq!(output[1].content, USER_SILENCE_MARKER);
    }

    #[test]
    fn test_no_greeting_when_user_leads() {
        let output = preprocess_messages(&[
            msg(Role::System, "prompt"),
            msg(Role::User, "hello"),
            msg(Role::Assistant, "hi"),
        ]);
        assert_eq!(output.len(), 3);
        assert_eq!(output[1].content, "hello");
    }
}
