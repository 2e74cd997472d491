#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stage_harness::gateway::{ChatGateway, NoopUsageSink, ProviderGateway, StderrUsageSink};
use stage_harness::reset::reset_stage;
use stage_harness::status::stage_status;
use stage_harness::{
    load_working_set, Checkpointer, JsonContextPrompts, JsonlTraceSink, Pipeline, PipelineConfig,
    ReadinessPolicy, RunOptions, StageGraph, StageKind, StageRun, StatefulChatAdapter,
    WorkingSetLock,
};

#[derive(Parser)]
#[command(name = "stages", version, about = "Stage pipeline over a stateful chat backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one stage over every ready item
    Run {
        stage: StageKind,
        /// Working-set JSON file
        #[arg(long)]
        data: PathBuf,
        /// Config JSON file; defaults plus environment when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Run the stage's alternate mode (review / draft)
        #[arg(long)]
        alternate: bool,
        /// Re-run items that already hold a result
        #[arg(long)]
        force: bool,
        /// Accept predecessor results that are error markers
        #[arg(long)]
        lenient: bool,
        #[arg(long)]
        limit: Option<usize>,
        /// Plan and trace without calling the backend
        #[arg(long)]
        dry_run: bool,
        /// Write per-item call traces as JSONL
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Print one usage record per backend call on stderr
        #[arg(long)]
        usage: bool,
    },
    /// Clear a stage's results so it runs again
    Reset {
        stage: StageKind,
        #[arg(long)]
        data: PathBuf,
        /// Also clear every later stage
        #[arg(long)]
        downstream: bool,
        /// Comma-separated item ids; all items when omitted
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
    },
    /// Print per-slot progress as JSON
    Status {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        lenient: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            stage,
            data,
            config,
            alternate,
            force,
            lenient,
            limit,
            dry_run,
            trace,
            usage,
        } => {
            let mut config = match config {
                Some(path) => PipelineConfig::load(path)?,
                None => {
                    let mut config = PipelineConfig::default();
                    config.apply_env()?;
                    config
                }
            };
            config.readiness.force |= force;
            config.readiness.lenient |= lenient;

            let _lock = WorkingSetLock::acquire(&data)?;
            let mut items = load_working_set(&data).await?;

            let adapter = StatefulChatAdapter::with_config(
                config.api.base_url.clone(),
                config.api.api_token.clone(),
                config.api.timeout(),
            )?;
            let gateway: Arc<dyn ChatGateway> = if usage {
                Arc::new(ProviderGateway::new(adapter, Arc::new(StderrUsageSink)))
            } else {
                Arc::new(ProviderGateway::new(adapter, Arc::new(NoopUsageSink)))
            };

            let checkpointer = Checkpointer::new(&data, config.checkpoint.clone());
            let mut pipeline = Pipeline::new(config, gateway, Arc::new(JsonContextPrompts))?;
            let worker = match trace {
                Some(path) => {
                    let (sink, worker) = JsonlTraceSink::new(path)?;
                    pipeline = pipeline.with_trace(Arc::new(sink));
                    Some(worker)
                }
                None => None,
            };

            let run = if alternate {
                StageRun::alternate(stage)
            } else {
                StageRun::primary(stage)
            };
            let options = RunOptions { limit, dry_run };
            let summary = pipeline.run_stage(&mut items, run, &checkpointer, &options).await;

            // The worker drains once the last sender is gone.
            drop(pipeline);
            if let Some(worker) = worker {
                worker.join()?;
            }
            println!("{}", serde_json::to_string_pretty(&summary?)?);
        }
        Commands::Reset {
            stage,
            data,
            downstream,
            ids,
        } => {
            let _lock = WorkingSetLock::acquire(&data)?;
            let mut items = load_working_set(&data).await?;
            let only: Option<HashSet<String>> =
                (!ids.is_empty()).then(|| ids.into_iter().collect());
            let graph = StageGraph::standard();
            let report = reset_stage(&mut items, &graph, stage, downstream, only.as_ref());
            save(&data, &items).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status { data, lenient } => {
            let items = load_working_set(&data).await?;
            let policy = ReadinessPolicy {
                force: false,
                lenient,
            };
            let rows = stage_status(&items, &StageGraph::standard(), policy);
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}

async fn save(path: &Path, items: &[stage_harness::Item]) -> Result<(), Box<dyn std::error::Error>> {
    let checkpointer = Checkpointer::new(path, Default::default());
    if let Some(backup) = checkpointer.backup().await? {
        tracing::info!(backup = %backup.display(), "Backed up working set");
    }
    checkpointer.save(items).await?;
    Ok(())
}
