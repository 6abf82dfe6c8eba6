//! `SELECT DISTINCT(field)` and `SELECT COUNT(DISTINCT(field))`.

use super::{for_each_line, scan_files, ScanContext};
use crate::error::Result;
use crate::predicate::{extract_field, matching_record};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

pub(super) async fn count_distinct(
    ctx: &ScanContext,
    files: Vec<PathBuf>,
) -> Result<BTreeMap<String, u64>> {
    let Some(field) = ctx.plan.aggregation_field.clone() else {
        tracing::warn!("distinct query without an aggregation field");
        return Ok(BTreeMap::new());
    };

    let per_file = scan_files(ctx, files, move |plan, path, cancel| {
        let field = field.clone();
        async move {
            let mut counts: HashMap<String, u64> = HashMap::new();
            for_each_line(&path, &cancel, |_, line| {
                let Some(record) = matching_record(&plan, line) else {
                    return;
                };
                if let Some(key) = extract_field(&record, &field).and_then(distinct_key) {
                    *counts.entry(key).or_insert(0) += 1;
                }
            })
            .await?;
            tracing::debug!(path = %path.display(), keys = counts.len(), "scanned file");
            Ok(counts)
        }
    })
    .await?;

    let mut merged = BTreeMap::new();
    for counts in per_file {
        merge_counts(&mut merged, counts);
    }
    Ok(merged)
}

pub(super) async fn distinct(ctx: &ScanContext, files: Vec<PathBuf>) -> Result<Vec<String>> {
    let counts = count_distinct(ctx, files).await?;
    Ok(counts.into_keys().collect())
}

/// Only scalar values are counted; objects, arrays and `null` are skipped.
fn distinct_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn merge_counts(into: &mut BTreeMap<String, u64>, counts: HashMap<String, u64>) {
    for (key, n) in counts {
        *into.entry(key).or_insert(0) += n;
    }
}
