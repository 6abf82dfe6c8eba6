//! # Execution Engine
//!
//! Runs a compiled [`QueryPlan`] over a list of log files. One tokio task is
//! spawned per file; a semaphore bounds how many scan at once. Results are
//! merged after every task has finished.
//!
//! | Kind            | Strategy                                        |
//! |-----------------|-------------------------------------------------|
//! | `Count`         | per-file match counts, summed                   |
//! | `CountDistinct` | per-file value counts, merged by key            |
//! | `Distinct`      | keys of `CountDistinct`, sorted                 |
//! | `Search`        | match ranges per file, then ordered re-read     |

mod count;
mod distinct;
mod search;

pub use search::{MatchRanges, SearchStream};

use crate::compiler::compile;
use crate::error::{QueryError, Result};
use crate::plan::{QueryPlan, ResultKind};
use crate::reader::LineReader;
use crate::resolver;
use std::collections::BTreeMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Default capacity of the search output channel.
pub const DEFAULT_SEARCH_BUFFER: usize = 10_000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub log_root: PathBuf,
    /// Upper bound on files scanned at once.
    pub max_parallelism: usize,
    /// Emit search matches as soon as they are found, in no particular order.
    pub skip_sort: bool,
    pub search_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from("./logs"),
            max_parallelism: default_parallelism(),
            skip_sort: false,
            search_buffer: DEFAULT_SEARCH_BUFFER,
        }
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}

/// Result of a query, one variant per [`ResultKind`].
#[derive(Debug)]
pub enum QueryOutput {
    Count(u64),
    Distinct(Vec<String>),
    CountDistinct(BTreeMap<String, u64>),
    Search(SearchStream),
}

impl QueryOutput {
    pub fn kind(&self) -> ResultKind {
        match self {
            Self::Count(_) => ResultKind::Count,
            Self::Distinct(_) => ResultKind::Distinct,
            Self::CountDistinct(_) => ResultKind::CountDistinct,
            Self::Search(_) => ResultKind::Search,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compile `sql`, resolve its files under the log root and run it.
    pub async fn query(&self, sql: &str) -> Result<QueryOutput> {
        let plan = Arc::new(compile(sql)?);
        let files = self.resolve(plan.clone()).await?;
        self.run(plan, files).await
    }

    pub async fn resolve(&self, plan: Arc<QueryPlan>) -> Result<Vec<PathBuf>> {
        let log_root = self.config.log_root.clone();
        tokio::task::spawn_blocking(move || resolver::resolve_plan(&plan, &log_root))
            .await
            .map_err(|e| QueryError::Task(e.to_string()))
    }

    pub async fn run(&self, plan: Arc<QueryPlan>, files: Vec<PathBuf>) -> Result<QueryOutput> {
        self.run_with_cancel(plan, files, CancellationToken::new())
            .await
    }

    /// Like [`Engine::run`], stopping early with [`QueryError::Cancelled`]
    /// once `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        plan: Arc<QueryPlan>,
        files: Vec<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<QueryOutput> {
        let start = Instant::now();
        let kind = plan.result_kind;
        tracing::info!(kind = %kind, files = files.len(), "running query");

        let ctx = ScanContext {
            plan,
            cancel,
            max_parallelism: self.config.max_parallelism.max(1),
        };

        let output = match kind {
            ResultKind::Count => QueryOutput::Count(count::run(&ctx, files).await?),
            ResultKind::CountDistinct => {
                QueryOutput::CountDistinct(distinct::count_distinct(&ctx, files).await?)
            }
            ResultKind::Distinct => QueryOutput::Distinct(distinct::distinct(&ctx, files).await?),
            ResultKind::Search => QueryOutput::Search(search::start(
                ctx,
                files,
                self.config.skip_sort,
                self.config.search_buffer,
            )),
        };

        // Search logs its own completion once the stream is drained.
        if kind != ResultKind::Search {
            tracing::info!(
                kind = %kind,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "query finished"
            );
        }
        Ok(output)
    }
}

/// State shared by every file task of one query.
#[derive(Clone)]
pub(crate) struct ScanContext {
    pub plan: Arc<QueryPlan>,
    pub cancel: CancellationToken,
    pub max_parallelism: usize,
}

/// Spawns one task per file, gated by a semaphore, and waits for all of
/// them. Results come back in file order.
///
/// The first failing task cancels the rest; its error is returned in
/// preference to the `Cancelled` errors it causes.
pub(crate) async fn scan_files<T, F, Fut>(
    ctx: &ScanContext,
    files: Vec<PathBuf>,
    scan: F,
) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(Arc<QueryPlan>, PathBuf, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(ctx.max_parallelism));
    let token = ctx.cancel.child_token();

    let mut handles = Vec::with_capacity(files.len());
    for path in files {
        let semaphore = semaphore.clone();
        let token = token.clone();
        let task = scan(ctx.plan.clone(), path, token.clone());
        handles.push(tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(QueryError::Cancelled),
                permit = semaphore.acquire_owned() => permit.map_err(|_| QueryError::Cancelled)?,
            };
            let result = task.await;
            if result.is_err() {
                token.cancel();
            }
            result
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    let mut failure: Option<QueryError> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(e)) => keep_first_failure(&mut failure, e),
            Err(e) => keep_first_failure(&mut failure, QueryError::Task(e.to_string())),
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

fn keep_first_failure(slot: &mut Option<QueryError>, err: QueryError) {
    match slot {
        None => *slot = Some(err),
        Some(QueryError::Cancelled) if !matches!(err, QueryError::Cancelled) => *slot = Some(err),
        Some(_) => {}
    }
}

/// Calls `f` with every line of `path`, checking for cancellation between
/// lines.
pub(crate) async fn for_each_line<F>(path: &Path, cancel: &CancellationToken, mut f: F) -> Result<()>
where
    F: FnMut(u64, &[u8]),
{
    let mut reader = LineReader::open(path).await?;
    while let Some((line_number, line)) = reader.next_line().await? {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        f(line_number, line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_log(root: &Path, rel: &str, lines: &[&str]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, lines.join("\n")).unwrap();
    }

    fn engine(root: &Path, max_parallelism: usize) -> Engine {
        Engine::new(EngineConfig {
            log_root: root.to_path_buf(),
            max_parallelism,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_count_over_files_with_parallelism_one() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), "app/2020-01-01/2020-01-01T00-00-00.log", &[r#"{"a":1}"#, r#"{"a":2}"#]);
        write_log(dir.path(), "app/2020-01-02/2020-01-02T00-00-00.log", &[r#"{"a":1}"#]);

        let out = engine(dir.path(), 1)
            .query("SELECT COUNT(*) FROM app WHERE line.a = 1")
            .await
            .unwrap();
        assert!(matches!(out, QueryOutput::Count(0)));

        let out = engine(dir.path(), 1)
            .query("SELECT COUNT(*) FROM app WHERE a = 1")
            .await
            .unwrap();
        assert!(matches!(out, QueryOutput::Count(2)));
    }

    #[tokio::test]
    async fn test_no_files_yields_empty_results() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), 2);

        let out = engine.query("SELECT COUNT(*) FROM app").await.unwrap();
        assert!(matches!(out, QueryOutput::Count(0)));

        let out = engine.query("SELECT DISTINCT(a) FROM app").await.unwrap();
        assert!(matches!(out, QueryOutput::Distinct(ref v) if v.is_empty()));

        match engine.query("SELECT * FROM app").await.unwrap() {
            QueryOutput::Search(stream) => assert!(stream.collect().await.unwrap().is_empty()),
            other => panic!("expected search, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_read_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let plan = Arc::new(compile("SELECT COUNT(*) FROM app").unwrap());
        let missing = dir.path().join("app/2020-01-01/2020-01-01T00-00-00.log");

        let err = engine(dir.path(), 2)
            .run(plan, vec![missing])
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Read { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_query_stops() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), "app/2020-01-01/2020-01-01T00-00-00.log", &[r#"{"a":1}"#]);
        let engine = engine(dir.path(), 1);
        let plan = Arc::new(compile("SELECT COUNT(*) FROM app").unwrap());
        let files = engine.resolve(plan.clone()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine.run_with_cancel(plan, files, cancel).await.unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_search_logs_completion_after_draining() {
        let logs = Captured::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), "app/2020-01-01/2020-01-01T00-00-00.log", &[r#"{"a":1}"#]);
        let engine = engine(dir.path(), 1);
        let plan = Arc::new(compile("SELECT * FROM app").unwrap());
        let files = engine.resolve(plan.clone()).await.unwrap();

        let stream = match engine.run(plan, files).await.unwrap() {
            QueryOutput::Search(stream) => stream,
            other => panic!("expected search, got {:?}", other.kind()),
        };
        assert!(!logs.text().contains("query finished"));

        assert_eq!(stream.collect().await.unwrap(), vec![r#"{"a":1}"#]);
        assert!(logs.text().contains("query finished"));
    }

    #[test]
    fn test_first_real_failure_wins() {
        let mut slot = None;
        keep_first_failure(&mut slot, QueryError::Cancelled);
        keep_first_failure(&mut slot, QueryError::Task("boom".into()));
        keep_first_failure(&mut slot, QueryError::Task("later".into()));
        assert!(matches!(slot, Some(QueryError::Task(ref m)) if m == "boom"));
    }
}
