//! Canonical model names.
//!
//! Clients may request a model with a thinking-mode suffix in parentheses,
//! e.g. `gpt-5(high)` or `claude-sonnet-4(8192)`. Runtime state and selector
//! cursors are keyed by the canonical base name so that all thinking variants
//! of a model share cooldown and stickiness decisions.

/// Split a model name into its canonical base and optional thinking suffix.
///
/// Only a trailing `(...)` group is recognized. A name without the group, or
/// where stripping would leave an empty base, is returned unchanged.
pub fn split_thinking_suffix(model: &str) -> (&str, Option<&str>) {
    let trimmed = model.trim();
    if !trimmed.ends_with(')') {
        return (trimmed, None);
    }
    let Some(open) = trimmed.rfind('(') else {
        return (trimmed, None);
    };
    let base = trimmed[..open].trim();
    if base.is_empty() {
        return (trimmed, None);
    }
    let suffix = &trimmed[open + 1..trimmed.len() - 1];
    (base, Some(suffix))
}

/// Canonical model name with any thinking-mode suffix stripped.
pub fn canonical_model(model: &str) -> &str {
    split_thinking_suffix(model).0
}
