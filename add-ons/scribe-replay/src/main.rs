//! Scribe Replay
//!
//! Feeds a JSON-lines recording of speech-to-text events through the aggregation engine and
//! writes the resulting utterances to one `<conversation>.jsonl` file per conversation.
//!
//! Usage:
//!   scribe-replay [--input events.jsonl] [--out ./messages]
//!
//! Each input line is one event:
//!   {"type":"fragment","conversation_id":"c1","role":"user","text":"Hel","timestamp":"2024-05-01T10:00:00Z","is_final":false}
//!   {"type":"completed","conversation_id":"c1"}
//!
//! Without `--input` events are read from stdin. Engine settings come from
//! `config/scribe.toml` (or `SCRIBE_CONFIG`) and `SCRIBE_*` environment variables.

use chrono::{DateTime, Utc};
use scribe_core::{
    AggregationEngine, CompletionReport, CompletionSignal, DrainCoordinator, EngineConfig,
    JsonlMessageStore, ScribeResult, SpeakerRole,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_OUT_DIR: &str = "messages";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplayEvent {
    Fragment {
        conversation_id: String,
        role: SpeakerRole,
        text: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        is_final: bool,
    },
    Completed {
        conversation_id: String,
    },
}

struct Args {
    input: Option<PathBuf>,
    out: PathBuf,
}

fn parse_args() -> Option<Args> {
    let mut input = None;
    let mut out = PathBuf::from(DEFAULT_OUT_DIR);
    let mut args = std::env::args().skip(1);

    while let Some(a) = args.next() {
        match a.as_str() {
            "--input" => input = Some(PathBuf::from(args.next()?)),
            "--out" => out = PathBuf::from(args.next()?),
            _ => return None,
        }
    }
    Some(Args { input, out })
}

fn print_usage() {
    eprintln!("Usage: scribe-replay [--input FILE] [--out DIR]");
    eprintln!("  --input FILE   JSON-lines event recording (default: stdin)");
    eprintln!("  --out DIR      Directory for per-conversation message files (default: {})", DEFAULT_OUT_DIR);
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[scribe-replay] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(args) = parse_args() else {
        print_usage();
        std::process::exit(2);
    };

    match run(args).await {
        Ok(0) => {}
        Ok(unsaved) => {
            tracing::error!(unsaved, "replay finished with unsaved utterances");
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "replay failed");
            std::process::exit(1);
        }
    }
}

/// Replay every event and return the number of utterances that could not be stored.
async fn run(args: Args) -> ScribeResult<usize> {
    let config = EngineConfig::load()?;
    let store = Arc::new(JsonlMessageStore::new(&args.out));
    let out_dir = store.root().display().to_string();
    let engine = AggregationEngine::start(config, store)?;
    let coordinator = Arc::new(DrainCoordinator::new(engine.clone()));
    let (completions, listener) = Arc::clone(&coordinator).listen();

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(reader).lines();

    tracing::info!(
        input = %args.input.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "stdin".into()),
        out = %out_dir,
        "replay started"
    );

    let mut pending: Vec<oneshot::Receiver<ScribeResult<CompletionReport>>> = Vec::new();
    let mut line_no = 0usize;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; stopping replay");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event: ReplayEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "skipping malformed event");
                continue;
            }
        };

        match event {
            ReplayEvent::Fragment {
                conversation_id,
                role,
                text,
                timestamp,
                is_final,
            } => {
                let action = engine.push_fragment(&conversation_id, role, &text, timestamp, is_final)?;
                tracing::debug!(line = line_no, conversation_id = %conversation_id, %role, ?action, "fragment");
            }
            ReplayEvent::Completed { conversation_id } => {
                let (signal, reply) = CompletionSignal::with_reply(conversation_id);
                if completions.send(signal).is_err() {
                    tracing::warn!(line = line_no, "drain coordinator stopped; completion ignored");
                    continue;
                }
                pending.push(reply);
            }
        }
    }

    let mut unsaved = 0;
    for reply in pending {
        match reply.await {
            Ok(Ok(report)) => {
                unsaved += report.unsaved.len();
                println!("{}", report);
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "completion rejected"),
            Err(_) => tracing::warn!("completion dropped before reporting"),
        }
    }
    drop(completions);
    let _ = listener.await;

    // Conversations the recording never completed.
    for report in engine.shutdown().await? {
        let report = CompletionReport::from(report);
        unsaved += report.unsaved.len();
        println!("{} (flushed at shutdown)", report);
    }

    let stats = engine.stats();
    tracing::info!(
        fragments = stats.fragments_ingested,
        persisted = stats.utterances_persisted,
        failures = stats.persist_failures,
        stats = %serde_json::to_string(&stats)?,
        "replay finished"
    );
    Ok(unsaved)
}
