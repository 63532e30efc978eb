//! SQL generation for memo prefilters and the viewer visibility rule.
//!
//! Fragments reference the memo table as `m` and use positional `?`
//! placeholders; parameters are returned in placeholder order.

use memos_core::tags::collab_tag;
use memos_core::{MemoSqlPrefilter, TagMatchGroup, TagMatchKind, Visibility};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::Sqlite;

/// Type-safe parameter binding for SQL queries.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    /// Integer parameter.
    Int(i64),
    /// Boolean parameter (stored as 0/1).
    Bool(bool),
    /// String parameter.
    String(String),
}

/// Bind `params` to a query in order.
pub fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[QueryParam],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Generates the WHERE fragment for a [`MemoSqlPrefilter`].
///
/// # Example
///
/// ```rust,ignore
/// let filter = CompiledFilter::compile("creator_id == 1 && \"work\" in tags")?;
/// let (sql, params) = MemoFilterQueryBuilder::new(filter.sql_prefilter()).build();
/// // sql: "m.creator_id IN (?) AND EXISTS (SELECT 1 FROM json_each(m.tags) jt WHERE jt.value = ?)"
/// ```
pub struct MemoFilterQueryBuilder<'a> {
    filter: &'a MemoSqlPrefilter,
}

impl<'a> MemoFilterQueryBuilder<'a> {
    /// Maximum number of bound values a prefilter may expand to.
    const MAX_FILTER_ELEMENTS: usize = 500;

    pub fn new(filter: &'a MemoSqlPrefilter) -> Self {
        Self { filter }
    }

    /// Build the fragment. An unconstrained prefilter yields `("1", [])`,
    /// an unsatisfiable one `("0", [])`.
    pub fn build(&self) -> (String, Vec<QueryParam>) {
        let f = self.filter;
        if f.unsatisfiable {
            return ("0".to_string(), vec![]);
        }

        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if !f.creator_ids.is_empty() {
            clauses.push(format!("m.creator_id IN ({})", placeholders(f.creator_ids.len())));
            params.extend(f.creator_ids.iter().map(|id| QueryParam::Int(*id)));
        }
        if !f.visibility_in.is_empty() {
            clauses.push(format!("m.visibility IN ({})", placeholders(f.visibility_in.len())));
            params.extend(
                f.visibility_in
                    .iter()
                    .map(|v| QueryParam::String(v.as_str().to_string())),
            );
        }
        if !f.state_in.is_empty() {
            clauses.push(format!("m.row_status IN ({})", placeholders(f.state_in.len())));
            params.extend(
                f.state_in
                    .iter()
                    .map(|s| QueryParam::String(s.as_str().to_string())),
            );
        }

        for (column, value) in [
            ("pinned", f.pinned),
            ("has_link", f.has_link),
            ("has_task_list", f.has_task_list),
            ("has_code", f.has_code),
            ("has_incomplete_tasks", f.has_incomplete_tasks),
        ] {
            if let Some(value) = value {
                clauses.push(format!("m.{} = ?", column));
                params.push(QueryParam::Bool(value));
            }
        }

        for group in &f.tag_groups {
            let (sql, group_params) = tag_group_exists(group);
            clauses.push(sql);
            params.extend(group_params);
        }
        for group in &f.exclude_tag_groups {
            let (sql, group_params) = tag_group_exists(group);
            clauses.push(format!("NOT {}", sql));
            params.extend(group_params);
        }

        // Dropping constraints only widens the candidate set.
        if params.len() > Self::MAX_FILTER_ELEMENTS {
            return ("1".to_string(), vec![]);
        }

        let sql = if clauses.is_empty() {
            "1".to_string()
        } else {
            clauses.join(" AND ")
        };
        (sql, params)
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// `EXISTS` over the memo's tags matching any option of the group.
fn tag_group_exists(group: &TagMatchGroup) -> (String, Vec<QueryParam>) {
    let mut conditions = Vec::with_capacity(group.options.len());
    let mut params = Vec::new();
    for option in &group.options {
        match option.kind {
            TagMatchKind::Exact => {
                conditions.push("jt.value = ?");
                params.push(QueryParam::String(option.value.clone()));
            }
            TagMatchKind::Prefix => {
                conditions.push("substr(jt.value, 1, length(?)) = ?");
                params.push(QueryParam::String(option.value.clone()));
                params.push(QueryParam::String(option.value.clone()));
            }
        }
    }
    let predicate = if conditions.is_empty() {
        "0".to_string()
    } else {
        conditions.join(" OR ")
    };
    (
        format!(
            "EXISTS (SELECT 1 FROM json_each(m.tags) jt WHERE {})",
            predicate
        ),
        params,
    )
}

/// Visibility rule for `viewer`, matching `Memo::is_visible_to`.
pub fn visibility_clause(viewer: Option<i64>) -> (String, Vec<QueryParam>) {
    match viewer {
        None => (
            "m.visibility = ?".to_string(),
            vec![QueryParam::String(Visibility::Public.as_str().to_string())],
        ),
        Some(user_id) => (
            "(m.creator_id = ? OR m.visibility IN (?, ?) OR EXISTS (SELECT 1 FROM json_each(m.tags) jt WHERE jt.value = ?))"
                .to_string(),
            vec![
                QueryParam::Int(user_id),
                QueryParam::String(Visibility::Public.as_str().to_string()),
                QueryParam::String(Visibility::Protected.as_str().to_string()),
                QueryParam::String(collab_tag(user_id)),
            ],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memos_core::{CompiledFilter, TagMatchOption};

    fn build(src: &str) -> (String, Vec<QueryParam>) {
        let filter = CompiledFilter::compile(src).unwrap();
        MemoFilterQueryBuilder::new(filter.sql_prefilter()).build()
    }

    #[test]
    fn test_empty_filter_returns_true() {
        let (sql, params) = build("");
        assert_eq!(sql, "1");
        assert!(params.is_empty());
    }

    #[test]
    fn test_unsatisfiable_returns_false() {
        let (sql, params) = build("creator_id == 1 && creator_id == 2");
        assert_eq!(sql, "0");
        assert!(params.is_empty());
    }

    #[test]
    fn test_creator_and_visibility() {
        let (sql, params) = build("creator_id in [2, 1] && visibility != \"PRIVATE\"");
        assert_eq!(sql, "m.creator_id IN (?, ?) AND m.visibility IN (?, ?)");
        assert_eq!(
            params,
            vec![
                QueryParam::Int(1),
                QueryParam::Int(2),
                QueryParam::String("PROTECTED".into()),
                QueryParam::String("PUBLIC".into()),
            ]
        );
    }

    #[test]
    fn test_bool_columns() {
        let (sql, params) = build("pinned && !property.hasCode");
        assert_eq!(sql, "m.pinned = ? AND m.has_code = ?");
        assert_eq!(params, vec![QueryParam::Bool(true), QueryParam::Bool(false)]);
    }

    #[test]
    fn test_tag_group_and_exclusion() {
        let pf = MemoSqlPrefilter {
            tag_groups: vec![TagMatchGroup {
                options: vec![TagMatchOption::exact("book"), TagMatchOption::prefix("book/")],
            }],
            exclude_tag_groups: vec![TagMatchGroup {
                options: vec![TagMatchOption::exact("secret")],
            }],
            ..Default::default()
        };
        let (sql, params) = MemoFilterQueryBuilder::new(&pf).build();
        assert_eq!(
            sql,
            "EXISTS (SELECT 1 FROM json_each(m.tags) jt WHERE jt.value = ? OR substr(jt.value, 1, length(?)) = ?) \
             AND NOT EXISTS (SELECT 1 FROM json_each(m.tags) jt WHERE jt.value = ?)"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_oversized_filter_degrades_to_unconstrained() {
        let pf = MemoSqlPrefilter {
            creator_ids: (0..1000).collect(),
            ..Default::default()
        };
        let (sql, params) = MemoFilterQueryBuilder::new(&pf).build();
        assert_eq!(sql, "1");
        assert!(params.is_empty());
    }

    #[test]
    fn test_visibility_clause_anonymous() {
        let (sql, params) = visibility_clause(None);
        assert_eq!(sql, "m.visibility = ?");
        assert_eq!(params, vec![QueryParam::String("PUBLIC".into())]);
    }

    #[test]
    fn test_visibility_clause_includes_collab_tag() {
        let (_, params) = visibility_clause(Some(7));
        assert_eq!(params.last(), Some(&QueryParam::String("collab/7".into())));
    }
}
