//! Derived boolean properties of memo content.
//!
//! The flags are recomputed whenever content changes and persisted beside
//! the memo so that filters on them can be pushed down to SQL.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::MemoProperty;

static FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(```|~~~)").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`[^`\n]+`").unwrap());
static TASK_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+\[([ xX])\]").unwrap());
static AUTO_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s<>()]+").unwrap());
static MARKDOWN_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[^\]\n]*\]\([^)\s]+\)").unwrap());

/// Compute the property flags of a memo's markdown content.
///
/// Content inside fenced code blocks counts towards `has_code` only; task
/// items and links inside code are ignored.
pub fn extract(content: &str) -> MemoProperty {
    let mut property = MemoProperty::default();
    let mut in_fence = false;

    for line in content.lines() {
        if FENCE.is_match(line) {
            property.has_code = true;
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        let without_code = if INLINE_CODE.is_match(line) {
            property.has_code = true;
            INLINE_CODE.replace_all(line, "").into_owned()
        } else {
            line.to_string()
        };

        if let Some(caps) = TASK_ITEM.captures(&without_code) {
            property.has_task_list = true;
            if &caps[1] == " " {
                property.has_incomplete_tasks = true;
            }
        }

        if AUTO_LINK.is_match(&without_code) || MARKDOWN_LINK.is_match(&without_code) {
            property.has_link = true;
        }
    }

    property
}
