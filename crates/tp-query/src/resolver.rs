//! # Log File Resolver
//!
//! Maps a source and its date predicates to the log files that may hold
//! matching records. The store is laid out as
//! `<log_root>/<source>/<YYYY-MM-DD>/<YYYY-MM-DDTHH-MM-SS>.log`.
//!
//! Anything that does not fit the layout is skipped, never reported as an
//! error.

use crate::dates::{all_match_day, all_match_instant, DatePredicate};
use crate::plan::{QueryPlan, ALL_SOURCES};
use chrono::{NaiveDate, NaiveDateTime};
use std::fs;
use std::path::{Path, PathBuf};

pub const FOLDER_FORMAT: &str = "%Y-%m-%d";
pub const FILE_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";
pub const LOG_EXTENSION: &str = "log";

/// Files of one source that pass the date predicates, sorted by directory
/// then file name.
pub fn resolve(source: &str, date_predicates: &[DatePredicate], log_root: &Path) -> Vec<PathBuf> {
    let source_dir = log_root.join(source);
    let mut files = Vec::new();

    for (day, dir) in sorted_entries(&source_dir, true) {
        let Ok(day) = NaiveDate::parse_from_str(&day, FOLDER_FORMAT) else {
            tracing::debug!(dir = %dir.display(), "skipping non-date directory");
            continue;
        };
        if !all_match_day(date_predicates, day) {
            continue;
        }

        for (name, file) in sorted_entries(&dir, false) {
            let Some(started) = file_timestamp(&name) else {
                tracing::debug!(file = %file.display(), "skipping unrecognised log file");
                continue;
            };
            if all_match_instant(date_predicates, started) {
                files.push(file);
            }
        }
    }

    files
}

/// Files for every source of `plan`, in FROM order without duplicates.
/// `*` expands to all sources under the root.
pub fn resolve_plan(plan: &QueryPlan, log_root: &Path) -> Vec<PathBuf> {
    let mut sources: Vec<String> = Vec::new();
    for source in &plan.sources {
        if source == ALL_SOURCES {
            sources.extend(list_sources(log_root));
        } else {
            sources.push(source.clone());
        }
    }

    let mut files: Vec<PathBuf> = Vec::new();
    let mut seen = Vec::new();
    for source in sources {
        if seen.contains(&source) {
            continue;
        }
        for file in resolve(&source, &plan.date_predicates, log_root) {
            if !files.contains(&file) {
                files.push(file);
            }
        }
        seen.push(source);
    }

    tracing::debug!(files = files.len(), sources = seen.len(), "resolved log files");
    files
}

/// Source directory names under `log_root`, sorted.
pub fn list_sources(log_root: &Path) -> Vec<String> {
    sorted_entries(log_root, true)
        .into_iter()
        .map(|(name, _)| name)
        .collect()
}

fn file_timestamp(name: &str) -> Option<NaiveDateTime> {
    let stem = name.strip_suffix(LOG_EXTENSION)?.strip_suffix('.')?;
    NaiveDateTime::parse_from_str(stem, FILE_FORMAT).ok()
}

/// `(name, path)` pairs of directories (or files) in `dir`, sorted by name.
fn sorted_entries(dir: &Path, directories: bool) -> Vec<(String, PathBuf)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
            return Vec::new();
        }
    };

    let mut out: Vec<(String, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_type()
                .map(|t| if directories { t.is_dir() } else { t.is_file() })
                .unwrap_or(false)
        })
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            Some((name, entry.path()))
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}
