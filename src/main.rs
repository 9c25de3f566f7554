use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use transitflow::core::catalog::Catalog;
use transitflow::core::config::{load_pipeline, load_pipelines_dir, parse_duration};
use transitflow::core::logging;
use transitflow::{PipelineBuilder, TransitFlow, Trigger};

#[derive(Parser)]
#[command(name = "transitflow", version, about = "Hourly transit data pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one cycle and print its summary as JSON
    RunOnce {
        #[arg(long)]
        config: PathBuf,
        /// Reuse a run id to retry a cycle
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Run cycles on an interval until Ctrl-C
    Serve {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value = "1h")]
        every: String,
    },
    /// Replace a reference table snapshot from a JSON array file
    LoadReference {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Check a pipeline config, or every config in a directory, and list its units
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Show the most recent cycles
    History {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();
    let cli = Cli::parse();

    match cli.command {
        Command::RunOnce { config, run_id } => {
            let pipeline = PipelineBuilder::from_path(&config)?.build()?;
            let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let summary = pipeline.run_cycle(&run_id).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Serve { config, every } => {
            let interval = parse_duration(&every)?;
            let pipeline = Arc::new(PipelineBuilder::from_path(&config)?.build()?);
            tracing::info!(pipeline = %pipeline.name(), every = %every, "serving");
            TransitFlow::new().add_pipeline(Trigger::Interval(interval), pipeline).run().await?;
        }
        Command::LoadReference { config, name, file } => {
            let builder = PipelineBuilder::from_path(&config)?;
            let key = builder
                .config()
                .references
                .get(&name)
                .map(|r| r.key.clone())
                .ok_or_else(|| format!("reference {name} is not declared in {}", config.display()))?;
            let rows = match serde_json::from_slice::<Value>(&std::fs::read(&file)?)? {
                Value::Array(rows) => rows,
                _ => return Err(format!("{} must hold a JSON array", file.display()).into()),
            };

            let pipeline = builder.build()?;
            let loaded = pipeline.warehouse().replace_reference(&name, &key, &rows)?;
            let refreshed = pipeline.refresh_enrichment().await?;
            let rows_enriched: usize = refreshed.iter().map(|r| r.rows_enriched).sum();
            println!("loaded {loaded} rows into reference {name}; re-enriched {rows_enriched} rows");
        }
        Command::Validate { config } => {
            let configs = if config.is_dir() { load_pipelines_dir(&config)? } else { vec![load_pipeline(&config)?] };
            for config in configs {
                let catalog = Catalog::from_config(&config)?;
                println!("pipeline {} is valid", config.pipeline);
                for unit in catalog.units() {
                    let curated = if config.curation.contains_key(&unit.name) { "curated" } else { "raw only" };
                    println!("  {:<24} {} {} ({curated})", unit.name, unit.method, unit.endpoint);
                }
            }
        }
        Command::History { config, limit } => {
            let pipeline = PipelineBuilder::from_path(&config)?.build()?;
            for run in pipeline.warehouse().recent_runs(limit)? {
                println!(
                    "{}  {:<10} {:<9} {}  {}ms",
                    run.started_at,
                    run.status,
                    run.trigger_type,
                    run.id,
                    run.duration_ms.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}
