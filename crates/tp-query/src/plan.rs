//! # Query Plan
//!
//! The compiled, immutable form of a query. Produced by
//! [`crate::compiler::compile`] and shared (behind an `Arc`) by the engine and
//! the live broadcaster.

use crate::dates::DatePredicate;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::fmt;

/// Source name that selects every source under the log root.
pub const ALL_SOURCES: &str = "*";

/// Which strategy the engine runs, decided once from the SELECT list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultKind {
    Search,
    Count,
    Distinct,
    CountDistinct,
}

impl ResultKind {
    /// Wire name used in result envelopes (`{"type": ..}`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Count => "count",
            Self::Distinct => "distinct",
            Self::CountDistinct => "count-distinct",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dot-delimited JSON path, pre-split into segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldPath {
    raw: String,
    #[serde(skip)]
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let segments = raw.split('.').map(str::to_string).collect();
        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Last segment, used as the default output name.
    pub fn leaf(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or(&self.raw)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Exists,
    Eq,
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
    In,
    Like,
    ILike,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exists => "exists",
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::In => "in",
            Self::Like => "like",
            Self::ILike => "ilike",
        }
    }
}

/// Declared type of a predicate, fixed from the literal's lexical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Integer,
    Float,
    String,
}

/// A SQL `LIKE` pattern compiled to an anchored regular expression.
#[derive(Debug, Clone, Serialize)]
pub struct LikePattern {
    source: String,
    case_insensitive: bool,
    #[serde(skip)]
    regex: Regex,
}

impl LikePattern {
    /// `%` matches any run of characters, `_` exactly one. Everything else is
    /// literal.
    pub fn new(source: &str, case_insensitive: bool) -> Result<Self, regex::Error> {
        let mut expr = String::with_capacity(source.len() + 8);
        expr.push('^');
        let mut literal = String::new();
        for c in source.chars() {
            match c {
                '%' | '_' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(if c == '%' { ".*" } else { "." });
                }
                _ => literal.push(c),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        let regex = RegexBuilder::new(&expr)
            .case_insensitive(case_insensitive)
            .dot_matches_new_line(true)
            .build()?;
        Ok(Self {
            source: source.to_string(),
            case_insensitive,
            regex,
        })
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.case_insensitive == other.case_insensitive
    }
}

/// Right-hand side of a [`FieldPredicate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateValue {
    None,
    Int(i64),
    Float(f64),
    Str(String),
    IntSet(Vec<i64>),
    StrSet(Vec<String>),
    Pattern(LikePattern),
}

impl PredicateValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Int(_) | Self::IntSet(_) => ValueKind::Integer,
            Self::Float(_) => ValueKind::Float,
            _ => ValueKind::String,
        }
    }
}

/// One WHERE (or SELECT-implied) condition on a non-date field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldPredicate {
    pub path: FieldPath,
    pub alias: String,
    pub operator: Operator,
    pub value: PredicateValue,
}

impl FieldPredicate {
    pub fn new(path: FieldPath, operator: Operator, value: PredicateValue) -> Self {
        let alias = path.leaf().to_string();
        Self {
            path,
            alias,
            operator,
            value,
        }
    }

    /// Predicate that only requires the field to be present.
    pub fn exists(path: FieldPath) -> Self {
        Self::new(path, Operator::Exists, PredicateValue::None)
    }

    pub fn value_kind(&self) -> ValueKind {
        self.value.kind()
    }
}

/// A projected output field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Projection {
    pub path: FieldPath,
    pub alias: String,
}

/// A compiled query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    /// FROM list in declaration order, without duplicates.
    pub sources: Vec<String>,
    /// WHERE conditions first, then the existence checks implied by SELECT.
    pub predicates: Vec<FieldPredicate>,
    pub date_predicates: Vec<DatePredicate>,
    /// Empty means the full record is emitted.
    pub projections: Vec<Projection>,
    pub aggregation_field: Option<FieldPath>,
    pub result_kind: ResultKind,
}

impl QueryPlan {
    /// Field paths in the order the evaluator looks them up.
    pub fn lookup_paths(&self) -> Vec<&FieldPath> {
        self.predicates.iter().map(|p| &p.path).collect()
    }

    /// True when `source` is one of this plan's sources (or the plan reads
    /// every source).
    pub fn reads_source(&self, source: &str) -> bool {
        self.sources
            .iter()
            .any(|s| s == source || s == ALL_SOURCES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_prefix_suffix_substring_exact() {
        let prefix = LikePattern::new("/api/%", false).unwrap();
        assert!(prefix.is_match("/api/v1/users"));
        assert!(!prefix.is_match("/healthz"));

        let suffix = LikePattern::new("%.json", false).unwrap();
        assert!(suffix.is_match("report.json"));
        assert!(!suffix.is_match("report.json.gz"));

        let substring = LikePattern::new("%timeout%", false).unwrap();
        assert!(substring.is_match("upstream timeout after 30s"));

        let exact = LikePattern::new("GET", false).unwrap();
        assert!(exact.is_match("GET"));
        assert!(!exact.is_match("GETS"));
    }

    #[test]
    fn test_like_escapes_regex_metacharacters() {
        let p = LikePattern::new("a.b(%", false).unwrap();
        assert!(p.is_match("a.b(c)"));
        assert!(!p.is_match("axb(c)"));
    }

    #[test]
    fn test_ilike_is_case_insensitive() {
        let p = LikePattern::new("%ERROR%", true).unwrap();
        assert!(p.is_match("an error occurred"));
        let p = LikePattern::new("%ERROR%", false).unwrap();
        assert!(!p.is_match("an error occurred"));
    }

    #[test]
    fn test_field_path_leaf() {
        let path = FieldPath::new("line.request.path");
        assert_eq!(path.leaf(), "path");
        assert_eq!(path.segments().len(), 3);
    }

    #[test]
    fn test_value_kind() {
        assert_eq!(PredicateValue::Int(1).kind(), ValueKind::Integer);
        assert_eq!(PredicateValue::IntSet(vec![1]).kind(), ValueKind::Integer);
        assert_eq!(PredicateValue::Float(2.5).kind(), ValueKind::Float);
        assert_eq!(PredicateValue::Str("x".into()).kind(), ValueKind::String);
        assert_eq!(PredicateValue::None.kind(), ValueKind::String);
    }
}
