//! # tp: TIDEPOOL command line
//!
//! - `tp query "<SQL>"` runs a query against the local log root (`-` reads
//!   the query from stdin).
//! - `tp remote "<SQL>"` runs a query on a hub.
//! - `tp push <source>` sends stdin lines to a hub's live subscribers.
//! - `tp sources` lists the sources under the log root.

use std::io::{BufRead, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tp_query::engine::default_parallelism;
use tp_query::{Engine, EngineConfig, QueryOutput};

/// TIDEPOOL: SQL over newline-delimited JSON logs.
#[derive(Parser)]
#[command(name = "tp", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query against local log files.
    Query {
        /// SQL query, or `-` to read it from stdin.
        query: String,

        /// Log root directory.
        #[arg(long, default_value = "./logs")]
        log_root: PathBuf,

        /// Maximum number of files scanned at once.
        #[arg(long, default_value_t = default_parallelism())]
        max_parallelism: usize,

        /// Print search results as soon as they are found, unordered.
        #[arg(long)]
        skip_sort: bool,
    },

    /// Run a query on a running hub.
    Remote {
        query: String,

        #[arg(long, env = "TP_HUB_URL", default_value = "http://127.0.0.1:9001")]
        hub: String,
    },

    /// Send lines from stdin to a hub as freshly ingested lines of `source`.
    Push {
        source: String,

        #[arg(long, env = "TP_HUB_URL", default_value = "http://127.0.0.1:9001")]
        hub: String,
    },

    /// List the sources under the log root.
    Sources {
        #[arg(long, default_value = "./logs")]
        log_root: PathBuf,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tp=warn,tp_query=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sources { log_root } => {
            for source in tp_query::resolver::list_sources(&log_root) {
                println!("{}", source);
            }
        }

        cmd => {
            let rt = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => fail(format!("Failed to build tokio runtime: {}", e)),
            };

            if let Err(e) = rt.block_on(async_main(cmd)) {
                fail(e);
            }
        }
    }
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

async fn async_main(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Query {
            query,
            log_root,
            max_parallelism,
            skip_sort,
        } => {
            let query = read_query(query)?;
            tracing::debug!(log_root = %log_root.display(), max_parallelism, skip_sort, "running query locally");
            let engine = Engine::new(EngineConfig {
                log_root,
                max_parallelism,
                skip_sort,
                ..Default::default()
            });
            let output = engine.query(&query).await.map_err(|e| e.to_string())?;
            print_output(output).await
        }

        Commands::Remote { query, hub } => {
            let client = reqwest::Client::new();
            let url = format!("{}/query", hub.trim_end_matches('/'));
            tracing::debug!(url = %url, "querying hub");
            let resp = client
                .get(&url)
                .query(&[("q", query.as_str())])
                .send()
                .await
                .map_err(|e| e.to_string())?;

            let status = resp.status();
            let json = resp
                .json::<serde_json::Value>()
                .await
                .map_err(|e| e.to_string())?;
            if !status.is_success() {
                tracing::warn!(status = %status, "hub rejected query");
                return Err(json
                    .get("error")
                    .and_then(|e| e.as_str())
                    .map(ToString::to_string)
                    .unwrap_or_else(|| format!("hub returned {}", status)));
            }
            let pretty = serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?;
            println!("{}", pretty);
            Ok(())
        }

        Commands::Push { source, hub } => {
            let mut body = String::new();
            for line in std::io::stdin().lock().lines() {
                let line = line.map_err(|e| e.to_string())?;
                body.push_str(&line);
                body.push('\n');
            }

            let client = reqwest::Client::new();
            let url = format!("{}/ingest/{}", hub.trim_end_matches('/'), source);
            tracing::debug!(url = %url, bytes = body.len(), "pushing lines");
            let resp = client
                .post(&url)
                .body(body)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            let json = resp
                .json::<serde_json::Value>()
                .await
                .map_err(|e| e.to_string())?;
            println!("{}", json);
            Ok(())
        }

        Commands::Sources { .. } => Ok(()),
    }
}

/// `-` means the query comes from stdin.
fn read_query(query: String) -> Result<String, String> {
    if query != "-" {
        return Ok(query);
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| e.to_string())?;
    Ok(buf.trim().to_string())
}

async fn print_output(output: QueryOutput) -> Result<(), String> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let written = match output {
        QueryOutput::Count(n) => writeln!(out, "{}", n),
        QueryOutput::Distinct(values) => values.iter().try_for_each(|v| writeln!(out, "{}", v)),
        QueryOutput::CountDistinct(counts) => {
            let pretty = serde_json::to_string_pretty(&counts).map_err(|e| e.to_string())?;
            writeln!(out, "{}", pretty)
        }
        QueryOutput::Search(mut stream) => {
            drop(out);
            while let Some(record) = stream.next().await {
                let record = record.map_err(|e| e.to_string())?;
                println!("{}", record);
            }
            return Ok(());
        }
    };
    written.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_query() {
        let cli = Cli::try_parse_from([
            "tp",
            "query",
            "SELECT COUNT(*) FROM app",
            "--log-root",
            "/var/log/tp",
            "--max-parallelism",
            "3",
            "--skip-sort",
        ])
        .unwrap();
        match cli.command {
            Commands::Query {
                query,
                log_root,
                max_parallelism,
                skip_sort,
            } => {
                assert_eq!(query, "SELECT COUNT(*) FROM app");
                assert_eq!(log_root, PathBuf::from("/var/log/tp"));
                assert_eq!(max_parallelism, 3);
                assert!(skip_sort);
            }
            _ => panic!("expected query command"),
        }
    }

    #[test]
    fn test_parse_remote_with_hub() {
        let cli = Cli::try_parse_from(["tp", "remote", "SELECT * FROM app", "--hub", "http://hub:9001"])
            .unwrap();
        match cli.command {
            Commands::Remote { hub, .. } => assert_eq!(hub, "http://hub:9001"),
            _ => panic!("expected remote command"),
        }
    }

    #[test]
    fn test_inline_query_is_used_as_is() {
        assert_eq!(read_query("SELECT * FROM app".into()).unwrap(), "SELECT * FROM app");
    }
}
