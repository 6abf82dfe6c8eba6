//! # File Tailing
//!
//! Follows log files named in `[[tail]]` config entries and feeds each new
//! line to the live broadcaster, wrapped as
//! `{"time": RFC3339, "hostname": H, "line": <record>}`.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tp_query::reader::{read_lines_retrying, RetryPolicy};
use tp_query::LiveBroadcaster;

#[derive(Deserialize, Clone, Debug)]
pub struct TailConfig {
    pub source: String,
    pub path: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval() -> u64 {
    500
}

/// Polls `tail.path` from its current end until cancelled or the reader
/// gives up.
pub async fn follow(
    tail: TailConfig,
    live: Arc<LiveBroadcaster>,
    hostname: String,
    cancel: CancellationToken,
) {
    let policy = RetryPolicy::default();
    let mut offset = tokio::fs::metadata(&tail.path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    let mut interval = tokio::time::interval(Duration::from_millis(tail.poll_interval_ms.max(1)));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let mut lines = Vec::new();
        let read = read_lines_retrying(&tail.path, offset, &policy, |line| {
            lines.push(wrap_line(&hostname, line));
        });
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = read => next,
        };
        match next {
            Ok(next) => offset = next,
            Err(e) => {
                tracing::error!("Tail for source '{}' stopped: {}", tail.source, e);
                break;
            }
        }

        for line in lines {
            live.ingest(&tail.source, &line).await;
        }
    }

    tracing::debug!("Tail for source '{}' finished", tail.source);
}

/// A line that is not a JSON object is embedded as a string.
pub fn wrap_line(hostname: &str, line: &[u8]) -> String {
    let text = String::from_utf8_lossy(line);
    let record = match serde_json::from_str::<Value>(&text) {
        Ok(value @ Value::Object(_)) => value,
        _ => Value::String(text.into_owned()),
    };
    json!({
        "time": Utc::now().to_rfc3339(),
        "hostname": hostname,
        "line": record,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_line_embeds_objects() {
        let wrapped: Value = serde_json::from_str(&wrap_line("box-1", br#"{"level":"error"}"#)).unwrap();
        assert_eq!(wrapped["hostname"], "box-1");
        assert_eq!(wrapped["line"]["level"], "error");
        assert!(chrono::DateTime::parse_from_rfc3339(wrapped["time"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_wrap_line_embeds_other_text_as_string() {
        let wrapped: Value = serde_json::from_str(&wrap_line("box-1", b"GET /healthz 200")).unwrap();
        assert_eq!(wrapped["line"], "GET /healthz 200");

        let wrapped: Value = serde_json::from_str(&wrap_line("box-1", b"[1,2]")).unwrap();
        assert_eq!(wrapped["line"], "[1,2]");
    }

    #[tokio::test]
    async fn test_follow_feeds_appended_lines() {
        use std::io::Write;
        use tokio::sync::mpsc;
        use tp_query::live::SinkError;
        use tp_query::LiveSink;

        struct Collect(mpsc::UnboundedSender<String>);

        #[async_trait::async_trait]
        impl LiveSink for Collect {
            async fn deliver(&self, event: String) -> Result<(), SinkError> {
                self.0.send(event).map_err(|e| e.to_string().into())
            }
        }

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"level\":\"old\"}\n").unwrap();
        file.flush().unwrap();

        let live = Arc::new(LiveBroadcaster::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        live.subscribe("SELECT * FROM app WHERE line.level = 'error'", Arc::new(Collect(tx)))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(follow(
            TailConfig {
                source: "app".into(),
                path: file.path().to_path_buf(),
                poll_interval_ms: 10,
            },
            live.clone(),
            "box-1".into(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        file.write_all(b"{\"level\":\"error\"}\n{\"level\":\"info\"}\n").unwrap();
        file.flush().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let event: Value = serde_json::from_str(&event).unwrap();
        assert_eq!(event["type"], "log");
        assert_eq!(event["data"]["hostname"], "box-1");
        assert_eq!(event["data"]["line"]["level"], "error");

        cancel.cancel();
        task.await.unwrap();
    }
}
