//! Response Interpreter: pulls an optional suggestion out of assistant text.
//!
//! The first ``` fenced region (shortest match) is the suggestion. The display
//! text is always the full reply; later fenced regions stay inline in it.

use serde::Serialize;

const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpretedReply {
    pub display_text: String,
    pub suggestion: Option<String>,
}

pub fn interpret(raw: &str) -> InterpretedReply {
    InterpretedReply {
        display_text: raw.to_string(),
        suggestion: first_fenced_region(raw)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
}

fn first_fenced_region(text: &str) -> Option<&str> {
    let open = text.find(FENCE)? + FENCE.len();
    let close = text[open..].find(FENCE)?;
    Some(&text[open..open + close])
}
