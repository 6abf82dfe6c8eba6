//! `SELECT COUNT(*)` / `SELECT COUNT(field)`.

use super::{for_each_line, scan_files, ScanContext};
use crate::error::Result;
use crate::predicate::evaluate_line;
use std::path::PathBuf;

pub(super) async fn run(ctx: &ScanContext, files: Vec<PathBuf>) -> Result<u64> {
    let per_file = scan_files(ctx, files, |plan, path, cancel| async move {
        let mut matches = 0u64;
        for_each_line(&path, &cancel, |_, line| {
            if evaluate_line(&plan, line) {
                matches += 1;
            }
        })
        .await?;
        tracing::debug!(path = %path.display(), matches, "counted file");
        Ok(matches)
    })
    .await?;

    Ok(per_file.into_iter().sum())
}
