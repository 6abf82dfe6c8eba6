//! # API Handlers
//!
//! Axum handlers for queries and line ingestion.

use crate::AppState;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tp_query::{QueryError, QueryOutput, ResultKind, SearchStream};

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Compile errors are the caller's fault; anything else is ours.
fn query_error(e: QueryError) -> ApiError {
    let status = match e {
        QueryError::Compile(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}

#[derive(Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    q: String,
}

// =============================================================================
// Status
// =============================================================================

pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "up",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "live_subscriptions": state.live.len().await,
    }))
}

// =============================================================================
// Query
// =============================================================================

async fn run_query(state: &AppState, sql: &str) -> Result<QueryOutput, ApiError> {
    let min = state.config.server.min_query_length;
    if sql.trim().len() < min {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Query length needs to be at least {} characters", min),
        ));
    }

    let start = Instant::now();
    tracing::debug!(query = %sql, "query received");
    let output = state.engine.query(sql).await.map_err(query_error)?;
    tracing::debug!(
        kind = %output.kind(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "query resolved"
    );
    Ok(output)
}

/// `GET /query?q=SQL`. Search results are streamed as they arrive.
pub async fn query(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Result<Response, ApiError> {
    let output = run_query(&state, &params.q).await?;
    let kind = output.kind().as_str();

    let response = match output {
        QueryOutput::Count(n) => Json(json!({ "type": kind, "results": n })).into_response(),
        QueryOutput::Distinct(values) => {
            Json(json!({ "type": kind, "results": values })).into_response()
        }
        QueryOutput::CountDistinct(counts) => {
            Json(json!({ "type": kind, "results": counts })).into_response()
        }
        QueryOutput::Search(stream) => (
            [(header::CONTENT_TYPE, "application/json")],
            Body::from_stream(search_envelope(stream)),
        )
            .into_response(),
    };
    Ok(response)
}

/// `GET /query-for-lines?q=SQL`. One record per line; only search queries.
pub async fn query_for_lines(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Result<Response, ApiError> {
    match run_query(&state, &params.q).await? {
        QueryOutput::Search(stream) => Ok((
            [(header::CONTENT_TYPE, "application/json-seq")],
            Body::from_stream(line_sequence(stream)),
        )
            .into_response()),
        other => Err(api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "{} results are not supported on /query-for-lines. Use /query instead.",
                other.kind()
            ),
        )),
    }
}

enum Envelope {
    Open,
    Rows { first: bool },
    Closed,
}

/// `{"type":"search","results":[r1,r2,..]}`, written incrementally. A read
/// failure mid-stream closes the array and appends an `error` member.
fn search_envelope(
    stream: SearchStream,
) -> impl futures_util::Stream<Item = Result<String, Infallible>> + Send {
    futures_util::stream::unfold(
        (stream, Envelope::Open),
        |(mut stream, phase)| async move {
            match phase {
                Envelope::Open => Some((
                    Ok(format!(
                        r#"{{"type":"{}","results":["#,
                        ResultKind::Search.as_str()
                    )),
                    (stream, Envelope::Rows { first: true }),
                )),
                Envelope::Rows { first } => match stream.next().await {
                    Some(Ok(record)) => {
                        let chunk = if first { record } else { format!(",{}", record) };
                        Some((Ok(chunk), (stream, Envelope::Rows { first: false })))
                    }
                    Some(Err(e)) => {
                        tracing::error!("Search failed mid-stream: {}", e);
                        let tail = format!(r#"],"error":{}}}"#, Value::String(e.to_string()));
                        Some((Ok(tail), (stream, Envelope::Closed)))
                    }
                    None => Some((Ok("]}".to_string()), (stream, Envelope::Closed))),
                },
                Envelope::Closed => None,
            }
        },
    )
}

fn line_sequence(
    stream: SearchStream,
) -> impl futures_util::Stream<Item = Result<String, Infallible>> + Send {
    futures_util::stream::unfold(stream, |mut stream| async move {
        match stream.next().await {
            Some(Ok(record)) => Some((Ok(format!("{}\n", record)), stream)),
            Some(Err(e)) => {
                tracing::error!("Search failed mid-stream: {}", e);
                None
            }
            None => None,
        }
    })
}

// =============================================================================
// Ingest
// =============================================================================

/// `POST /ingest/:source`. Body is newline-delimited lines.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    body: String,
) -> Json<Value> {
    let mut lines = 0usize;
    let mut delivered = 0usize;
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        lines += 1;
        delivered += state.live.ingest(&source, line).await;
    }
    tracing::debug!(source = %source, lines, delivered, "ingested lines");
    Json(json!({ "lines": lines, "delivered": delivered }))
}
