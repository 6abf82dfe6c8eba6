//! # Predicate Evaluator
//!
//! Decides whether one NDJSON log line satisfies a [`QueryPlan`]'s filters.

use crate::dates::{self, DatePredicate};
use crate::plan::{FieldPath, FieldPredicate, Operator, PredicateValue, QueryPlan};
use serde_json::Value;
use std::borrow::Cow;
use std::cmp::Ordering;

/// Record field that date predicates are checked against.
pub const TIMESTAMP_FIELD: &str = "time";

/// Path segment that matches every element of an array or object.
const WILDCARD: &str = "*";

/// True when `line` is a JSON record satisfying every predicate of `plan`.
pub fn evaluate_line(plan: &QueryPlan, line: &[u8]) -> bool {
    matching_record(plan, line).is_some()
}

/// Parses `line` and returns the record if it matches.
///
/// Blank lines and lines that are not valid JSON never match.
pub fn matching_record(plan: &QueryPlan, line: &[u8]) -> Option<Value> {
    let record = parse_record(line)?;
    evaluate_record(plan, &record).then_some(record)
}

pub fn parse_record(line: &[u8]) -> Option<Value> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_slice(trimmed).ok()
}

pub fn evaluate_record(plan: &QueryPlan, record: &Value) -> bool {
    plan.predicates.iter().all(|p| evaluate_predicate(p, record))
        && evaluate_dates(&plan.date_predicates, record)
}

fn evaluate_predicate(predicate: &FieldPredicate, record: &Value) -> bool {
    let mut candidates = Vec::new();
    collect_fields(record, predicate.path.segments(), &mut candidates);
    candidates
        .into_iter()
        .any(|observed| evaluate_value(predicate, observed))
}

/// A record without a parsable timestamp passes: its file was already
/// selected by date.
fn evaluate_dates(predicates: &[DatePredicate], record: &Value) -> bool {
    if predicates.is_empty() {
        return true;
    }
    match record
        .get(TIMESTAMP_FIELD)
        .and_then(Value::as_str)
        .and_then(dates::parse_timestamp)
    {
        Some(t) => dates::all_match_instant(predicates, t),
        None => true,
    }
}

/// Applies one predicate to a value already extracted from the record.
pub fn evaluate_value(predicate: &FieldPredicate, observed: &Value) -> bool {
    if predicate.operator == Operator::Exists {
        return true;
    }

    match &predicate.value {
        PredicateValue::None => false,
        PredicateValue::Int(expected) => match observed {
            Value::Number(_) => compare_number(observed, *expected)
                .is_some_and(|o| ordering_matches(predicate.operator, o)),
            _ => false,
        },
        PredicateValue::Float(expected) => match observed.as_f64() {
            Some(n) => n
                .partial_cmp(expected)
                .is_some_and(|o| ordering_matches(predicate.operator, o)),
            None => false,
        },
        PredicateValue::IntSet(set) => match observed {
            Value::Number(_) => set
                .iter()
                .any(|n| compare_number(observed, *n) == Some(Ordering::Equal)),
            _ => false,
        },
        PredicateValue::Str(expected) => {
            let rendered = render(observed);
            let text: &str = &rendered;
            match predicate.operator {
                Operator::Eq => text == expected.as_str(),
                Operator::NotEq => text != expected.as_str(),
                _ => false,
            }
        }
        PredicateValue::StrSet(set) => {
            let text = render(observed);
            set.iter().any(|s| s.as_str() == text)
        }
        PredicateValue::Pattern(pattern) => pattern.is_match(&render(observed)),
    }
}

fn compare_number(observed: &Value, expected: i64) -> Option<Ordering> {
    if let Some(n) = observed.as_i64() {
        return Some(n.cmp(&expected));
    }
    observed.as_f64()?.partial_cmp(&(expected as f64))
}

fn ordering_matches(operator: Operator, ordering: Ordering) -> bool {
    match operator {
        Operator::Eq => ordering == Ordering::Equal,
        Operator::NotEq => ordering != Ordering::Equal,
        Operator::Gt => ordering == Ordering::Greater,
        Operator::GtEq => ordering != Ordering::Less,
        Operator::Lt => ordering == Ordering::Less,
        Operator::LtEq => ordering != Ordering::Greater,
        _ => false,
    }
}

/// Text form used by string predicates and distinct keys.
pub fn render(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s),
        Value::Null => Cow::Borrowed(""),
        other => Cow::Owned(other.to_string()),
    }
}

/// First value at `path`, walking objects by key and arrays by index.
pub fn extract_field<'v>(record: &'v Value, path: &FieldPath) -> Option<&'v Value> {
    let mut found = Vec::new();
    collect_fields(record, path.segments(), &mut found);
    found.into_iter().next()
}

fn collect_fields<'v>(value: &'v Value, segments: &[String], out: &mut Vec<&'v Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };

    match value {
        Value::Object(map) => {
            if head == WILDCARD {
                for child in map.values() {
                    collect_fields(child, rest, out);
                }
            } else if let Some(child) = map.get(head) {
                collect_fields(child, rest, out);
            }
        }
        Value::Array(items) => {
            if head == WILDCARD {
                for child in items {
                    collect_fields(child, rest, out);
                }
            } else if let Some(child) = head.parse::<usize>().ok().and_then(|i| items.get(i)) {
                collect_fields(child, rest, out);
            }
        }
        _ => {}
    }
}
