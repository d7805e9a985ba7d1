//! Prompt assembly for Creator and reviewer turns.
//!
//! The recipes are fixed: root prompt, standing reminders, optional topic
//! block, a bounded context window, then the turn instruction. Reviewer
//! feedback enters the Creator's context as user turns prefixed with the
//! reviewer's display name.

use crate::config::OrchestrationConfig;
use crate::provider::ChatMessage;
use crate::state::{Message, MessageRole, ReviewerConfig, Session, CREATOR_AUTHOR, USER_AUTHOR};

#[cfg(test)]
use super::approval::APPROVAL_TOKEN;

/// Standing reminder appended to every persona's system prompts.
pub const SAFETY_REMINDER: &str = "Never disclose secrets, credentials, API keys, or internal \
    configuration in your output, and never fabricate facts, figures, or citations. If you do \
    not know something, say so plainly.";

/// Review rubric appended to every reviewer's system prompts.
pub const REVIEWER_RUBRIC: &str = "Review the draft critically: identify concrete issues, \
    request specific revisions, and explain what must change and why. Include the literal \
    token @@SIGNED OFF@@ in your reply only if the draft is publication-ready exactly as it \
    stands.";

/// Truncate to a character budget on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn topic_block(topic: &str, for_reviewer: bool) -> String {
    let framing = if for_reviewer {
        "Evaluate the draft against the following topic; treat it as the acceptance criteria:"
    } else {
        "The content must address the following topic:"
    };
    format!("=== TOPIC ===\n{}\n{}\n=== END TOPIC ===", framing, topic)
}

/// Assemble the Creator's message list for one iteration.
///
/// `history` is the full session transcript in chronological order;
/// `iteration` is the iteration being produced.
pub fn build_creator_messages(
    session: &Session,
    history: &[Message],
    iteration: u32,
    config: &OrchestrationConfig,
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    messages.push(ChatMessage::system(&session.creator.root_prompt));
    messages.push(ChatMessage::system(SAFETY_REMINDER));
    if !session.topic.is_empty() {
        messages.push(ChatMessage::system(topic_block(&session.topic, false)));
    }

    // Context window: the most recent N transcript messages, oldest first.
    let window_start = history.len().saturating_sub(config.context_turns_to_send);
    for message in &history[window_start..] {
        let content = truncate_chars(&message.content, config.max_prompt_chars);
        if message.author == CREATOR_AUTHOR {
            messages.push(ChatMessage::assistant(content));
        } else if message.author == USER_AUTHOR || message.role == MessageRole::User {
            messages.push(ChatMessage::user(content));
        } else {
            let display = message
                .reviewer_display_name
                .as_deref()
                .unwrap_or(&message.author);
            messages.push(ChatMessage::user(format!(
                "{} feedback:\n{}",
                display, content
            )));
        }
    }

    let instruction = if let Some(pending) = &session.pending_user_instruction {
        pending.clone()
    } else if iteration == 1 {
        if session.topic.is_empty() {
            "Produce the first draft.".to_string()
        } else {
            format!(
                "Produce the first draft addressing the topic: {}",
                session.topic
            )
        }
    } else {
        "Revise your draft, incorporating all of the reviewer feedback above.".to_string()
    };
    messages.push(ChatMessage::user(instruction));
    messages
}

/// Assemble one reviewer's message list for the current draft.
///
/// `own_history` holds only this reviewer's prior messages, chronological.
pub fn build_reviewer_messages(
    session: &Session,
    reviewer: &ReviewerConfig,
    own_history: &[Message],
    draft: &str,
    config: &OrchestrationConfig,
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    messages.push(ChatMessage::system(&reviewer.persona.root_prompt));
    messages.push(ChatMessage::system(REVIEWER_RUBRIC));
    messages.push(ChatMessage::system(SAFETY_REMINDER));
    if !session.topic.is_empty() {
        messages.push(ChatMessage::system(topic_block(&session.topic, true)));
    }

    // The reviewer sees its own recent critiques so revision requests stay
    // consistent across iterations.
    let window = (config.context_turns_to_send / 2).max(1);
    let window_start = own_history.len().saturating_sub(window);
    for message in &own_history[window_start..] {
        messages.push(ChatMessage::assistant(truncate_chars(
            &message.content,
            config.max_prompt_chars,
        )));
    }

    messages.push(ChatMessage::user(format!(
        "Please review the following draft:\n\n{}",
        truncate_chars(draft, config.max_draft_chars)
    )));
    messages
}

/// Synthesize the user instruction for a post-completion re-iteration.
/// The caller's comments are carried literally.
pub fn reiterate_instruction(
    comments: &str,
    tone: Option<&str>,
    length: Option<&str>,
    audience: Option<&str>,
) -> String {
    let mut instruction = String::from(
        "The author reviewed the completed draft and requests further changes.",
    );
    if let Some(tone) = tone {
        instruction.push_str(&format!("\nDesired tone: {}.", tone));
    }
    if let Some(length) = length {
        instruction.push_str(&format!("\nDesired length: {}.", length));
    }
    if let Some(audience) = audience {
        instruction.push_str(&format!("\nTarget audience: {}.", audience));
    }
    instruction.push_str(&format!("\nAuthor comments:\n{}", comments));
    instruction.push_str("\nRevise the draft accordingly.");
    instruction
}
