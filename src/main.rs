//! Folio 命令行入口
//!
//! 用法：
//!   folio [--config <path>] [--offline] analyze <image>
//!   folio [--config <path>] [--offline] batch <image>...
//!   folio [--config <path>] [--offline] resume <session_id> [image]
//!   folio [--config <path>] rounds <session_id>

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use folio::config::load_config;
use folio::core::{Runtime, RuntimeBuilder};
use folio::history::ArtifactRef;
use folio::llm::{ModelReply, ScriptStep, ScriptedGateway};
use folio::observability;
use folio::rounds::RoundEvent;
use tokio::sync::mpsc;

const USAGE: &str = "usage: folio [--config <path>] [--offline] <analyze <image> | batch <image>... | resume <session_id> [image] | rounds <session_id>>";

struct Cli {
    config: Option<PathBuf>,
    offline: bool,
    command: String,
    args: Vec<String>,
}

fn parse_args() -> anyhow::Result<Cli> {
    let mut config = None;
    let mut offline = false;
    let mut rest = Vec::new();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let path = it.next().context("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            "--offline" => offline = true,
            "-h" | "--help" => bail!(USAGE),
            _ => rest.push(arg),
        }
    }
    if rest.is_empty() {
        bail!(USAGE);
    }
    let command = rest.remove(0);
    Ok(Cli {
        config,
        offline,
        command,
        args: rest,
    })
}

/// 离线模式：不访问推理服务，每个会话首轮直接给出占位答案
fn offline_gateway() -> Arc<ScriptedGateway> {
    Arc::new(ScriptedGateway::new(ScriptStep::Reply(ModelReply::answer(
        "offline run: no inference backend contacted",
        serde_json::json!({ "status": "offline" }),
    ))))
}

fn print_events(mut rx: mpsc::UnboundedReceiver<RoundEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        }
    });
}

async fn run_job(runtime: &Runtime, job_id: String) -> anyhow::Result<()> {
    tokio::select! {
        record = runtime.jobs.wait(&job_id) => {
            let record = record?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        _ = tokio::signal::ctrl_c() => {
            runtime.jobs.cancel(&job_id).await?;
            eprintln!("cancellation requested; waiting for the current round to finish");
            let record = runtime.jobs.wait(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = parse_args()?;
    let config = load_config(cli.config.clone()).context("Failed to load config")?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut builder = RuntimeBuilder::new(config).with_events(event_tx);
    if cli.offline {
        builder = builder.with_gateway(offline_gateway());
    }
    let runtime = builder.build();

    match cli.command.as_str() {
        "analyze" => {
            let image = cli.args.first().context("analyze requires an image")?;
            print_events(event_rx);
            let job_id = runtime.jobs.submit(ArtifactRef::new(image.as_str())).await?;
            tracing::info!(job_id = %job_id, "job submitted");
            run_job(&runtime, job_id).await?;
        }
        "resume" => {
            let session_id = cli.args.first().context("resume requires a session id")?;
            let artifact = cli.args.get(1).map(|p| ArtifactRef::new(p.as_str()));
            print_events(event_rx);
            let job_id = runtime.jobs.resume(session_id, artifact).await?;
            run_job(&runtime, job_id).await?;
        }
        "batch" => {
            if cli.args.is_empty() {
                bail!("batch requires at least one image");
            }
            print_events(event_rx);
            let artifacts = cli
                .args
                .iter()
                .map(|p| ArtifactRef::new(p.as_str()))
                .collect();
            let batch_id = runtime.batches.submit_batch(artifacts).await?;
            tracing::info!(batch_id = %batch_id, "batch submitted");
            let view = tokio::select! {
                view = runtime.batches.wait(&batch_id) => view?,
                _ = tokio::signal::ctrl_c() => {
                    runtime.batches.cancel(&batch_id).await?;
                    runtime.batches.wait(&batch_id).await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        "rounds" => {
            let session_id = cli.args.first().context("rounds requires a session id")?;
            let rounds = runtime.jobs.rounds(session_id).await?;
            for round in rounds {
                println!("{}", serde_json::to_string(&round)?);
            }
        }
        other => bail!("unknown command '{other}'\n{USAGE}"),
    }

    Ok(())
}
