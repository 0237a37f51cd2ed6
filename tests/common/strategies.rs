//! Proptest strategies.

use proptest::prelude::*;

/// Known pipeline step names
pub fn step_name_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(super::all_steps())
}

/// A sequence of (step, completed?) marks
pub fn mark_sequence_strategy() -> impl Strategy<Value = Vec<(&'static str, bool)>> {
    prop::collection::vec((step_name_strategy(), any::<bool>()), 1..40)
}

/// Error text that may embed a pattern in random case
pub fn error_with_pattern_strategy() -> impl Strategy<Value = (String, String, String)> {
    (
        "[a-z ]{0,12}",
        prop::sample::select(vec!["timeout", "connection reset", "rate limit", "503"]),
        "[a-z ]{0,12}",
    )
        .prop_flat_map(|(prefix, pattern, suffix)| {
            let len = pattern.len();
            prop::collection::vec(any::<bool>(), len).prop_map(move |upper| {
                let mixed: String = pattern
                    .chars()
                    .zip(upper)
                    .map(|(c, up)| if up { c.to_ascii_uppercase() } else { c })
                    .collect();
                (prefix.clone(), mixed, suffix.clone())
            })
        })
}
