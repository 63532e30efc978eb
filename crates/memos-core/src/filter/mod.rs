//! Memo filter compiler.
//!
//! A filter is a boolean CEL expression over memo fields. Compiling yields
//! two artifacts: an exact predicate evaluated in-process and a coarse
//! [`MemoSqlPrefilter`] that storage can push down. The prefilter always
//! admits a superset of the memos the predicate matches.
//!
//! ```text
//! source ──parse──▶ Expr ──rewrite_legacy──▶ Expr ──check──▶ CompiledFilter
//!                                                              ├─ matches(memo)
//!                                                              └─ sql_prefilter()
//! ```

mod ast;
mod checker;
mod eval;
mod parser;
mod prefilter;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Result;
use crate::models::Memo;

pub use ast::{ComprehensionKind, Expr, Func, Value};
pub use prefilter::{MemoSqlPrefilter, TagMatchGroup, TagMatchKind, TagMatchOption};

static CONTENT_IDENTIFIERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(content|property|has_link|has_task_list|has_code|has_incomplete_tasks)\b")
        .unwrap()
});

/// Textual scan for identifiers that filter on memo content or derived
/// content properties. Conservative: a string literal containing one of the
/// words is also reported.
pub fn references_content_fields(source: &str) -> bool {
    CONTENT_IDENTIFIERS.is_match(source)
}

/// A parsed and type-checked memo filter.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    source: String,
    expr: Option<Expr>,
    prefilter: MemoSqlPrefilter,
}

impl CompiledFilter {
    /// Compile `source`. Blank input yields the match-all filter.
    pub fn compile(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Ok(Self::match_all());
        }
        let expr = checker::rewrite_legacy(parser::parse(source)?)?;
        checker::check(&expr)?;
        let prefilter = prefilter::derive(&expr);
        tracing::trace!(
            filter = source,
            unsatisfiable = prefilter.unsatisfiable,
            "Compiled memo filter"
        );
        Ok(Self {
            source: source.to_string(),
            expr: Some(expr),
            prefilter,
        })
    }

    pub fn match_all() -> Self {
        Self {
            source: String::new(),
            expr: None,
            prefilter: MemoSqlPrefilter::unconstrained(),
        }
    }

    pub fn is_match_all(&self) -> bool {
        self.expr.is_none()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Exact evaluation; evaluation errors count as "no match".
    pub fn matches(&self, memo: &Memo) -> bool {
        self.matches_at(memo, Utc::now().timestamp())
    }

    /// [`matches`](Self::matches) with a fixed value for `now()`.
    pub fn matches_at(&self, memo: &Memo, now: i64) -> bool {
        let Some(expr) = &self.expr else {
            return true;
        };
        let mut activation = eval::Activation::new(memo, now);
        matches!(eval::eval(expr, &mut activation), Ok(Value::Bool(true)))
    }

    pub fn sql_prefilter(&self) -> &MemoSqlPrefilter {
        &self.prefilter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{MemoProperty, MemoState, Visibility};
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn memo(creator_id: i64, tags: &[&str]) -> Memo {
        Memo {
            id: 1,
            uid: "uid".into(),
            creator_id,
            content: "hello".into(),
            visibility: Visibility::Private,
            state: MemoState::Normal,
            pinned: false,
            create_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            update_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            location: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            property: MemoProperty::default(),
        }
    }

    fn prefilter(src: &str) -> MemoSqlPrefilter {
        CompiledFilter::compile(src).unwrap().sql_prefilter().clone()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = CompiledFilter::compile("   ").unwrap();
        assert!(filter.is_match_all());
        assert!(filter.matches(&memo(1, &[])));
        assert!(filter.sql_prefilter().is_unconstrained());
    }

    #[test]
    fn test_invalid_filter_errors() {
        for src in ["creator_id ==", "creator_id", "bogus == 1", "creator_id == \"1\""] {
            let err = CompiledFilter::compile(src).unwrap_err();
            assert!(matches!(err, Error::InvalidFilter(_)), "{}: {:?}", src, err);
        }
    }

    #[test]
    fn test_contradictory_creators_are_unsatisfiable() {
        let pf = prefilter("creator_id == 1 && creator_id == 2");
        assert!(pf.unsatisfiable);
        assert!(!pf.admits(&memo(1, &[])));
    }

    #[test]
    fn test_or_with_unrecognised_branch_widens() {
        let pf = prefilter("creator_id == 1 || pinned == true || content.contains(\"x\")");
        assert!(pf.creator_ids.is_empty());
        assert_eq!(pf.pinned, None);
        assert!(!pf.unsatisfiable);
    }

    #[test]
    fn test_or_unions_constrained_fields() {
        let pf = prefilter("creator_id == 1 || creator_id in [3, 2]");
        assert_eq!(pf.creator_ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_unsatisfiable_branch_is_absorbed() {
        let pf = prefilter("visibility == \"SECRET\" || creator_id == 4");
        assert_eq!(pf.creator_ids, vec![4]);
        assert!(pf.visibility_in.is_empty());
    }

    #[test]
    fn test_visibility_negation_uses_complement() {
        let pf = prefilter("visibility != \"PRIVATE\"");
        assert_eq!(pf.visibility_in, vec![Visibility::Protected, Visibility::Public]);

        let pf = prefilter("!(visibility in [\"PUBLIC\", \"PROTECTED\", \"PRIVATE\"])");
        assert!(pf.unsatisfiable);

        let pf = prefilter("visibility != \"SECRET\"");
        assert!(pf.is_unconstrained());
    }

    #[test]
    fn test_creator_negation_is_unconstrained() {
        assert!(prefilter("creator_id != 1").is_unconstrained());
        assert!(prefilter("!(creator_id in [1, 2])").is_unconstrained());
        assert_eq!(prefilter("!(creator_id != 5)").creator_ids, vec![5]);
    }

    #[test]
    fn test_de_morgan_over_bool_fields() {
        let pf = prefilter("!(pinned || has_code)");
        assert_eq!(pf.pinned, Some(false));
        assert_eq!(pf.has_code, Some(false));

        let pf = prefilter("!(pinned && has_code)");
        assert_eq!(pf.pinned, None);
        assert_eq!(pf.has_code, None);
    }

    #[test]
    fn test_property_accessors_push_down() {
        let pf = prefilter("property.hasTaskList && !property.hasIncompleteTasks");
        assert_eq!(pf.has_task_list, Some(true));
        assert_eq!(pf.has_incomplete_tasks, Some(false));
    }

    #[test]
    fn test_hierarchical_tag_filter() {
        let filter = CompiledFilter::compile("tag in [\"book\"]").unwrap();
        assert!(filter.matches(&memo(1, &["book"])));
        assert!(filter.matches(&memo(1, &["book/fiction"])));
        assert!(!filter.matches(&memo(1, &["bookshelf"])));

        let pf = filter.sql_prefilter();
        assert_eq!(
            pf.tag_groups,
            vec![TagMatchGroup {
                options: vec![
                    TagMatchOption::exact("book"),
                    TagMatchOption::prefix("book/"),
                ],
            }]
        );
        assert!(pf.admits(&memo(1, &["book/fiction"])));
        assert!(!pf.admits(&memo(1, &["bookshelf"])));
    }

    #[test]
    fn test_tag_exclusion() {
        let pf = prefilter("!(\"secret\" in tags)");
        assert_eq!(
            pf.exclude_tag_groups,
            vec![TagMatchGroup {
                options: vec![TagMatchOption::exact("secret")],
            }]
        );
        assert!(pf.tag_groups.is_empty());
    }

    #[test]
    fn test_empty_legacy_tag_list() {
        assert!(prefilter("tag in []").unsatisfiable);
        assert!(prefilter("!(tag in [])").is_unconstrained());
    }

    #[test]
    fn test_or_keeps_only_shared_tag_groups() {
        let pf = prefilter("(\"a\" in tags && pinned) || (\"a\" in tags && \"b\" in tags)");
        assert_eq!(
            pf.tag_groups,
            vec![TagMatchGroup {
                options: vec![TagMatchOption::exact("a")],
            }]
        );
        assert_eq!(pf.pinned, None);
    }

    #[test]
    fn test_references_content_fields() {
        assert!(references_content_fields("content.contains(\"x\")"));
        assert!(references_content_fields("property.hasLink"));
        assert!(references_content_fields("has_code == true"));
        assert!(references_content_fields("\"content\" in tags"));
        assert!(!references_content_fields("creator_id == 1 && \"contents\" in tags"));
    }

    #[test]
    fn test_now_is_injectable() {
        let filter = CompiledFilter::compile("created_ts > now() - 60").unwrap();
        let m = memo(1, &[]);
        assert!(filter.matches_at(&m, 1_700_000_030));
        assert!(!filter.matches_at(&m, 1_700_000_100));
    }

    const TAG_POOL: &[&str] = &["a", "a/b", "ab", "b", "b/c", "collab/1"];
    const VIS_LITERALS: &[&str] = &["PUBLIC", "PROTECTED", "PRIVATE", "SECRET"];
    const STATE_LITERALS: &[&str] = &["NORMAL", "ARCHIVED", "DELETED"];
    const BOOL_FIELDS: &[&str] = &[
        "pinned",
        "has_link",
        "has_task_list",
        "has_code",
        "has_incomplete_tasks",
    ];

    fn random_leaf(rng: &mut StdRng) -> String {
        let tag = TAG_POOL.choose(rng).unwrap();
        let vis = VIS_LITERALS.choose(rng).unwrap();
        let state = STATE_LITERALS.choose(rng).unwrap();
        let field = BOOL_FIELDS.choose(rng).unwrap();
        match rng.gen_range(0..16) {
            0 => format!("creator_id == {}", rng.gen_range(1..4)),
            1 => format!("creator_id != {}", rng.gen_range(1..4)),
            2 => format!(
                "creator_id in [{}, {}]",
                rng.gen_range(1..4),
                rng.gen_range(1..4)
            ),
            3 => format!("visibility == \"{}\"", vis),
            4 => format!("visibility in [\"{}\", \"{}\"]", vis, VIS_LITERALS.choose(rng).unwrap()),
            5 => format!("state != \"{}\"", state),
            6 => field.to_string(),
            7 => format!("{} == {}", field, rng.gen_bool(0.5)),
            8 => format!("{} != {}", rng.gen_bool(0.5), field),
            9 => format!("\"{}\" in tags", tag),
            10 => format!("tag in [\"{}\", \"{}\"]", tag, TAG_POOL.choose(rng).unwrap()),
            11 => format!("tags.exists(t, t.startsWith(\"{}\") || \"{}\" == t)", tag, TAG_POOL.choose(rng).unwrap()),
            12 => "content.contains(\"x\")".to_string(),
            13 => format!("creator_id / {} == 1", rng.gen_range(0..2)),
            14 => rng.gen_bool(0.5).to_string(),
            _ => "tags.all(t, t != \"b\")".to_string(),
        }
    }

    fn random_filter(rng: &mut StdRng, depth: u32) -> String {
        if depth == 0 || rng.gen_bool(0.3) {
            return random_leaf(rng);
        }
        match rng.gen_range(0..3) {
            0 => format!(
                "({}) && ({})",
                random_filter(rng, depth - 1),
                random_filter(rng, depth - 1)
            ),
            1 => format!(
                "({}) || ({})",
                random_filter(rng, depth - 1),
                random_filter(rng, depth - 1)
            ),
            _ => format!("!({})", random_filter(rng, depth - 1)),
        }
    }

    fn random_memo(rng: &mut StdRng) -> Memo {
        let mut m = memo(rng.gen_range(1..4), &[]);
        m.visibility = *Visibility::ALL.choose(rng).unwrap();
        m.state = *MemoState::ALL.choose(rng).unwrap();
        m.pinned = rng.gen_bool(0.5);
        m.content = if rng.gen_bool(0.5) { "x" } else { "y" }.to_string();
        m.property = MemoProperty {
            has_link: rng.gen_bool(0.5),
            has_task_list: rng.gen_bool(0.5),
            has_code: rng.gen_bool(0.5),
            has_incomplete_tasks: rng.gen_bool(0.5),
        };
        m.tags = TAG_POOL
            .iter()
            .filter(|_| rng.gen_bool(0.3))
            .map(|t| t.to_string())
            .collect();
        m
    }

    #[test]
    fn test_prefilter_admits_every_match() {
        let mut rng = StdRng::seed_from_u64(0x6d656d6f73);
        let memos: Vec<Memo> = (0..64).map(|_| random_memo(&mut rng)).collect();

        for _ in 0..1500 {
            let src = random_filter(&mut rng, 4);
            let filter = CompiledFilter::compile(&src)
                .unwrap_or_else(|e| panic!("generated filter {:?} failed: {}", src, e));
            let pf = filter.sql_prefilter();
            for m in &memos {
                if filter.matches(m) {
                    assert!(
                        pf.admits(m),
                        "prefilter {:?} of {:?} rejects matching memo {:?}",
                        pf,
                        src,
                        m
                    );
                }
            }
        }
    }
}
