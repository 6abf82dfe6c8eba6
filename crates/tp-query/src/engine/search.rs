//! # Search
//!
//! Two phases keep output ordered without buffering matches in memory:
//!
//! 1. every file is scanned in parallel and its matching line numbers are
//!    recorded as [`MatchRanges`];
//! 2. files are re-read one at a time, in resolver order, emitting the lines
//!    inside their ranges.
//!
//! In skip-sort mode phase 2 is skipped and scan tasks emit matches directly.

use super::{for_each_line, scan_files, ScanContext};
use crate::error::{QueryError, Result};
use crate::format::format_record;
use crate::predicate::{evaluate_line, matching_record, parse_record};
use crate::reader::LineReader;
use futures_util::Stream;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Ascending, disjoint, inclusive `[start, end]` line intervals.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MatchRanges {
    ranges: Vec<(u64, u64)>,
}

impl MatchRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a matching line. Lines must arrive in ascending order; a line
    /// directly after the previous match extends the last range.
    pub fn record(&mut self, line: u64) {
        if let Some(last) = self.ranges.last_mut() {
            debug_assert!(line > last.1, "lines must be recorded in ascending order");
            if line == last.1 + 1 {
                last.1 = line;
                return;
            }
        }
        self.ranges.push((line, line));
    }

    pub fn contains(&self, line: u64) -> bool {
        let idx = self.ranges.partition_point(|&(_, end)| end < line);
        self.ranges
            .get(idx)
            .is_some_and(|&(start, _)| start <= line)
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Last matching line, if any.
    pub fn last_line(&self) -> Option<u64> {
        self.ranges.last().map(|&(_, end)| end)
    }
}

/// Formatted search results. Errors arrive as the final item.
///
/// Dropping or closing the stream cancels the query.
#[derive(Debug)]
pub struct SearchStream {
    rx: mpsc::Receiver<Result<String>>,
    cancel: CancellationToken,
}

impl SearchStream {
    pub async fn next(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<String>> {
        futures_util::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }

    pub fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    /// Drains the stream, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}

impl Drop for SearchStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(super) fn start(
    mut ctx: ScanContext,
    files: Vec<PathBuf>,
    skip_sort: bool,
    buffer: usize,
) -> SearchStream {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    ctx.cancel = ctx.cancel.child_token();
    let cancel = ctx.cancel.clone();

    tokio::spawn(async move {
        let start = Instant::now();
        let result = if skip_sort {
            emit_unordered(&ctx, files, &tx).await
        } else {
            emit_ordered(&ctx, files, &tx).await
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => tracing::info!(kind = "search", elapsed_ms, "query finished"),
            Err(e) => {
                tracing::info!(kind = "search", elapsed_ms, error = %e, "query finished with an error");
                let _ = tx.send(Err(e)).await;
            }
        }
    });

    SearchStream { rx, cancel }
}

async fn emit_ordered(
    ctx: &ScanContext,
    files: Vec<PathBuf>,
    tx: &mpsc::Sender<Result<String>>,
) -> Result<()> {
    let per_file = scan_files(ctx, files.clone(), |plan, path, cancel| async move {
        let mut ranges = MatchRanges::new();
        for_each_line(&path, &cancel, |line_number, line| {
            if evaluate_line(&plan, line) {
                ranges.record(line_number);
            }
        })
        .await?;
        Ok(ranges)
    })
    .await?;

    for (path, ranges) in files.into_iter().zip(per_file) {
        let Some(last_line) = ranges.last_line() else {
            continue;
        };
        tracing::debug!(path = %path.display(), ranges = ranges.ranges().len(), "emitting matches");

        let mut reader = LineReader::open(&path).await?;
        while let Some((line_number, line)) = reader.next_line().await? {
            if ctx.cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }
            if line_number > last_line {
                break;
            }
            if !ranges.contains(line_number) {
                continue;
            }
            let Some(record) = parse_record(line) else {
                continue;
            };
            let formatted = format_record(&ctx.plan, line, &record);
            if tx.send(Ok(formatted)).await.is_err() {
                return Err(QueryError::Cancelled);
            }
        }
    }
    Ok(())
}

async fn emit_unordered(
    ctx: &ScanContext,
    files: Vec<PathBuf>,
    tx: &mpsc::Sender<Result<String>>,
) -> Result<()> {
    let tx = tx.clone();
    scan_files(ctx, files, move |plan, path, cancel| {
        let tx = tx.clone();
        async move {
            let mut reader = LineReader::open(&path).await?;
            while let Some((_, line)) = reader.next_line().await? {
                if cancel.is_cancelled() {
                    return Err(QueryError::Cancelled);
                }
                let Some(record) = matching_record(&plan, line) else {
                    continue;
                };
                let formatted = format_record(&plan, line, &record);
                if tx.send(Ok(formatted)).await.is_err() {
                    return Err(QueryError::Cancelled);
                }
            }
            Ok(())
        }
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_matches_extend_one_range() {
        let mut ranges = MatchRanges::new();
        for line in [1, 2, 3, 7, 9, 10] {
            ranges.record(line);
        }
        assert_eq!(ranges.ranges(), &[(1, 3), (7, 7), (9, 10)]);
        assert_eq!(ranges.last_line(), Some(10));
    }

    #[test]
    fn test_ranges_are_disjoint_and_ascending() {
        let mut ranges = MatchRanges::new();
        for line in [2, 4, 5, 6, 11, 12, 20] {
            ranges.record(line);
        }
        for pair in ranges.ranges().windows(2) {
            assert!(pair[0].1 + 1 < pair[1].0);
        }
        for &(start, end) in ranges.ranges() {
            assert!(start <= end);
        }
    }

    #[test]
    fn test_contains() {
        let mut ranges = MatchRanges::new();
        for line in [3, 4, 8] {
            ranges.record(line);
        }
        let inside: Vec<u64> = (0..10).filter(|&l| ranges.contains(l)).collect();
        assert_eq!(inside, vec![3, 4, 8]);
        assert!(!MatchRanges::new().contains(1));
    }
}
