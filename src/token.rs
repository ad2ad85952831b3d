//! Token estimator (C2): a pure function from text to an integer token
//! estimate. No tokenizer dependency — the corpus this crate was built
//! against approximates at ~4 chars/token, which is good enough for
//! threshold comparisons and never needs to match a specific model's
//! encoder exactly.

/// Estimate the token count of `text`.
///
/// Empty input is zero tokens; everything else rounds up so that a single
/// stray character still counts as one token.
pub fn estimate_tokens(text: &str) -> i64 {
    let len = text.chars().count();
    if len == 0 {
        return 0;
    }
    ((len as f64) / 4.0).ceil() as i64
}

/// Sum of `estimate_tokens` over multiple strings, as used when measuring a
/// context item's `title + body`.
pub fn estimate_tokens_many<'a>(parts: impl IntoIterator<Item = &'a str>) -> i64 {
    parts.into_iter().map(estimate_tokens).sum()
}
