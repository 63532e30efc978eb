//! Memo tag rules.
//!
//! Tags are an ordered set of case-sensitive strings. They serve two roles:
//! a `/`-separated taxonomy (`book/fiction` sits under `book`) and, through
//! the exact form `collab/<userID>`, an access grant to that user.

use std::collections::HashSet;

/// Prefix of collaboration tags.
pub const COLLAB_TAG_PREFIX: &str = "collab/";

/// Trim, drop empties and deduplicate, keeping first-seen order.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for tag in tags {
        let trimmed = tag.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            result.push(trimmed.to_string());
        }
    }
    result
}

/// The collaboration tag granting `user_id` access.
pub fn collab_tag(user_id: i64) -> String {
    format!("{}{}", COLLAB_TAG_PREFIX, user_id)
}

/// Parse `collab/<userID>`. Only the exact form produced by [`collab_tag`]
/// is a grant, so `collab/07`, `collab/+7` and `collab/7/x` are not.
pub fn parse_collab_tag(tag: &str) -> Option<i64> {
    let id: i64 = tag.strip_prefix(COLLAB_TAG_PREFIX)?.parse().ok()?;
    (id > 0 && collab_tag(id) == tag).then_some(id)
}

/// Collaborator IDs present in `before` but not in `after`.
pub fn removed_collaborators(before: &[String], after: &[String]) -> Vec<i64> {
    let kept: HashSet<i64> = after.iter().filter_map(|t| parse_collab_tag(t)).collect();
    let mut removed: Vec<i64> = before
        .iter()
        .filter_map(|t| parse_collab_tag(t))
        .filter(|id| !kept.contains(id))
        .collect();
    removed.sort_unstable();
    removed.dedup();
    removed
}

/// Hierarchical membership: `tag` equals `ancestor` or descends from it.
pub fn tag_matches_hierarchy(tag: &str, ancestor: &str) -> bool {
    match tag.strip_prefix(ancestor) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
