//! Heuristic token counting (spec §4.D). Pure and side-effect free: the
//! same message always yields the same estimate, so the archival observer
//! can make chunking decisions without an LLM round-trip.

use fern_types::{Message, Part};

/// Estimate the token count of a single message.
///
/// If the message carries reported `tokens` usage and it is non-zero, that
/// figure is authoritative. Otherwise we approximate from the serialised
/// size of its parts: `ceil(bytes / 4)`, counting text parts by their raw
/// text and tool parts by their JSON-serialised input/output.
pub fn estimate(message: &Message) -> usize {
    if let Some(tokens) = &message.tokens {
        if !tokens.is_zero() {
            return tokens.total() as usize;
        }
    }

    let mut bytes = 0usize;
    for part in &message.parts {
        bytes += part_bytes(part);
    }
    ceil_div(bytes, 4)
}

/// Sum of `estimate` over a slice of messages.
pub fn estimate_messages(messages: &[Message]) -> usize {
    messages.iter().map(estimate).sum()
}

fn part_bytes(part: &Part) -> usize {
    match part {
        Part::Text { text } => text.len(),
        Part::Reasoning { text } => text.len(),
        Part::Tool { state, .. } => {
            let mut n = serde_json::to_string(&state.input).map(|s| s.len()).unwrap_or(0);
            if let Some(output) = &state.output {
                n += serde_json::to_string(output).map(|s| s.len()).unwrap_or(0);
            }
            n
        }
        Part::StepStart | Part::StepFinish => 0,
    }
}

fn ceil_div(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}
