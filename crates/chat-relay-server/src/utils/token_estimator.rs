//! Token estimation for chat turns.
//! More stable than a char/4 approximation for short conversational text.

use crate::models::Turn;

/// Estimate tokens from text using word-based heuristic
/// Rule: avg ~1.3 tokens per word plus a small formatting overhead
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let words = text.split_whitespace().count();
    ((words as f64 * 1.3) + 5.0).ceil() as usize
}

/// Estimate tokens for an outbound prompt (system instruction + context turns)
pub fn estimate_prompt_tokens(system_prompt: &str, context: &[Turn]) -> usize {
    estimate_tokens(system_prompt)
        + context
            .iter()
            .map(|turn| estimate_tokens(&turn.content))
            .sum::<usize>()
}
