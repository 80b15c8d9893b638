//! odotrust node
//!
//! Runs the provenance pipeline over a JSON-lines telemetry replay:
//!
//! ```text
//! odotrust-node [--config odotrust.toml] --replay fleet.jsonl
//! odotrust-node --version-json
//! ```
//!
//! Without `--replay`, lines are read from stdin. On end of input or
//! Ctrl-C, open trips are flushed and the pipeline drains before exit.

mod anchor;
mod replay;

use anyhow::{anyhow, Context};
use odotrust_core::{logging, Config};
use odotrust_pipeline::{LogNotifier, Pipeline, WalletCredential};
use odotrust_telemetry::{StaticDirectory, TripSegmenter};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::anchor::HttpAnchorClient;
use crate::replay::{parse_line, ReplayRecord};

const NODE_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    protocol_version: u32,
}

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    replay: Option<PathBuf>,
    version_json: bool,
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--version-json" => parsed.version_json = true,
            "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| anyhow!("--config was provided without a path"))?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--replay" => {
                let path = iter
                    .next()
                    .ok_or_else(|| anyhow!("--replay was provided without a path"))?;
                parsed.replay = Some(PathBuf::from(path));
            }
            other => return Err(anyhow!("unknown argument: {}", other)),
        }
    }
    Ok(parsed)
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => {
            let mut config = Config::default();
            config.apply_env(|key| std::env::var(key).ok())?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;

    if args.version_json {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config = load_config(args.config.as_ref())?;
    logging::init(&config.logging)?;

    for path in [
        &config.storage.trust_db_path,
        &config.storage.batch_db_path,
    ] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    info!(
        workers = config.pipeline.workers,
        anchor = %config.anchor.endpoint,
        trust_db = %config.storage.trust_db_path.display(),
        "odotrust node starting"
    );

    let directory = Arc::new(StaticDirectory::new());
    let anchor = Arc::new(HttpAnchorClient::new(&config.anchor)?);
    let processor = Pipeline::build_processor(&config, directory.clone(), anchor, Arc::new(LogNotifier))?
        .with_credential(WalletCredential::new(config.anchor.credential_id.clone()));
    let processor = Arc::new(processor);
    let segmenter = Arc::new(TripSegmenter::new(config.segmenter.clone(), directory.clone()));

    let pipeline = Pipeline::start(&config, segmenter, processor.clone());

    let replayed = match &args.replay {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening replay {}", path.display()))?;
            replay_until_interrupted(BufReader::new(file), &pipeline, &directory).await?
        }
        None => replay_until_interrupted(BufReader::new(tokio::io::stdin()), &pipeline, &directory).await?,
    };

    pipeline.shutdown().await?;

    let metrics = processor.metrics();
    let ledger = processor.ledger().metrics();
    info!(
        records = replayed,
        batches = metrics.batches_processed_total.load(Ordering::Relaxed),
        anchored = metrics.batches_anchored_total.load(Ordering::Relaxed),
        fraud = metrics.batches_fraud_total.load(Ordering::Relaxed),
        submission_failures = metrics.submission_failures_total.load(Ordering::Relaxed),
        trust_events = ledger.trust_events_applied_total,
        trust_conflicts = ledger.trust_conflicts_total,
        "odotrust node stopped"
    );
    Ok(())
}

async fn replay_until_interrupted<R>(
    reader: R,
    pipeline: &Pipeline,
    directory: &StaticDirectory,
) -> anyhow::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        result = replay(reader, pipeline, directory) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, flushing open trips");
            Ok(0)
        }
    }
}

async fn replay<R>(reader: R, pipeline: &Pipeline, directory: &StaticDirectory) -> anyhow::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0u64;
    let mut records = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        match parse_line(&line) {
            Ok(None) => {}
            Ok(Some(ReplayRecord::Device {
                device_id,
                vehicle_id,
                owner_id,
            })) => {
                directory.register(&device_id, &vehicle_id, &owner_id);
                records += 1;
            }
            Ok(Some(ReplayRecord::Point(point))) => {
                pipeline.submit(point).await?;
                records += 1;
            }
            Err(e) => error!(line = line_no, error = %e, "Skipping malformed replay line"),
        }
    }
    Ok(records)
}
