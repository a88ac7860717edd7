//! Token Estimation
//!
//! Character-count heuristic; stored per message at insert time.

/// Estimate tokens as `ceil(chars / chars_per_token)`.
pub fn estimate_tokens(text: &str, chars_per_token: u32) -> i64 {
    let chars = text.chars().count() as i64;
    let per_token = i64::from(chars_per_token.max(1));
    (chars + per_token - 1) / per_token
}

/// Sum of stored estimates.
pub fn total_tokens<'a>(estimates: impl IntoIterator<Item = &'a i64>) -> i64 {
    estimates.into_iter().sum()
}
