//! Request composition for remediation dialogues

use std::borrow::Cow;

use super::provider::CompletionRequest;
use super::types::ConversationTurn;

/// Fixed instruction sent ahead of every conversation
pub const SYSTEM_INSTRUCTION: &str = "You are a database security expert helping a developer fix findings from a Postgres security audit. Respond using markdown formatting.
Prioritize the current query from the user. Use earlier turns of the conversation only where they relate to it, and focus on the user's input.
Provide your response prefixed with \"Guide:\" followed by the remediation steps.
End with a \"Keyword:\" section listing, separated by commas, only the words or phrases that appear directly in the user's query. Do not infer additional terms. If a word is misspelled, list the corrected spelling.";

/// `[system] + history + [user issue]`
pub fn compose<'a>(
    issue: &str,
    history: &'a [ConversationTurn],
    temperature: f32,
    top_p: f32,
) -> CompletionRequest<'a> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Cow::Owned(ConversationTurn::system(SYSTEM_INSTRUCTION)));
    messages.extend(history.iter().map(Cow::Borrowed));
    messages.push(Cow::Owned(ConversationTurn::user(issue)));

    CompletionRequest {
        messages,
        temperature,
        top_p,
    }
}
