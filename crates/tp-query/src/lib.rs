//! # tp-query: the "Engine" of TIDEPOOL
//!
//! Compiles a restricted SQL dialect into filters over newline-delimited JSON
//! log records, resolves the date-bucketed log files a query touches, and
//! scans them concurrently. The same compiled filters drive live
//! subscriptions over freshly ingested lines.
//!
//! ```text
//! SQL ──► compiler ──► QueryPlan ──► resolver ──► files ──► engine ──► QueryOutput
//!                          │
//! (source, line) ──────────┴──► live::LiveBroadcaster ──► sinks
//! ```

pub mod compiler;
pub mod dates;
pub mod engine;
pub mod error;
pub mod escape;
pub mod format;
pub mod live;
pub mod plan;
pub mod predicate;
pub mod reader;
pub mod resolver;

pub use compiler::compile;
pub use engine::{Engine, EngineConfig, QueryOutput, SearchStream};
pub use error::{CompileError, QueryError};
pub use live::{LiveBroadcaster, LiveSink, SubscriptionId};
pub use plan::{QueryPlan, ResultKind};
