//! Fact key normalization.
//!
//! Keys are dotted lowercase strings: `<category>(.<segment>)+`. Hosts emit
//! all kinds of spellings (plural categories, `/` separators, mixed case);
//! everything is coerced here, once, at ingest. Downstream layers may assume
//! keys are already normal.

use crate::error::EngramError;

/// Fixed plural→singular aliases for category segments. The generic
/// trailing-`s` rule below covers the rest; these are the irregular ones.
const PLURAL_ALIASES: &[(&str, &str)] = &[
    ("entities", "entity"),
    ("preferences", "preference"),
    ("corrections", "correction"),
];

/// Normalize a raw key into canonical dotted form.
///
/// - lowercases and trims
/// - `/` separators become `.`
/// - empty segments are dropped
/// - the category (first segment) is aliased plural→singular
///
/// Errors when fewer than two segments remain or when the category is not in
/// `categories`.
pub fn normalize_key(raw: &str, categories: &[String]) -> Result<String, EngramError> {
    let lowered = raw.trim().to_lowercase().replace('/', ".");
    let segments: Vec<&str> = lowered
        .split('.')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    if segments.len() < 2 {
        return Err(EngramError::MalformedKey(format!(
            "key needs at least category and one segment: {raw:?}"
        )));
    }

    let category = singularize(segments[0], categories);
    if !categories.iter().any(|c| c == &category) {
        return Err(EngramError::MalformedKey(format!(
            "unknown category {:?} in key {raw:?}",
            segments[0]
        )));
    }

    let mut out = category;
    for seg in &segments[1..] {
        out.push('.');
        out.push_str(seg);
    }
    Ok(out)
}

/// First dotted segment of an (already normalized) key.
pub fn category_of(key: &str) -> &str {
    key.split('.').next().unwrap_or(key)
}

/// Nth dotted segment, if present.
pub fn segment(key: &str, n: usize) -> Option<&str> {
    key.split('.').nth(n)
}

fn singularize(segment: &str, categories: &[String]) -> String {
    for (plural, singular) in PLURAL_ALIASES {
        if segment == *plural {
            return singular.to_string();
        }
    }
    // "users" → "user", but only when the stem is a known category, so
    // legitimately-plural segments elsewhere in the key are untouched.
    if let Some(stem) = segment.strip_suffix('s') {
        if categories.iter().any(|c| c == stem) {
            return stem.to_string();
        }
    }
    segment.to_string()
}
