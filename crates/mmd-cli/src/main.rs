use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mmd_core::CatalogVersion;
use mmd_pipeline::{
    load_resolver, BulkCommitPipeline, CommitError, CommitOutcome, CommitRequest, EngineConfig,
    IntegrityChecker, SynonymExporter,
};
use mmd_sources::{source_for, SourceFormat};
use mmd_storage::CatalogStore;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "mmd-cli")]
#[command(about = "Metric master-data catalog: commit, check, export and resolve")]
struct Cli {
    /// Overrides MMD_DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the catalog schema if it does not exist.
    Migrate,
    /// Replace the whole catalog with the batch at PATH.
    Commit {
        path: PathBuf,
        /// json, sheets or xlsx.
        #[arg(long, default_value_t = SourceFormat::Json)]
        format: SourceFormat,
        #[arg(long, default_value = "bulk replace")]
        summary: String,
        #[arg(long)]
        created_by: Option<String>,
        /// Reject batches carrying collisions, orphaned synonyms or inverted ranges.
        #[arg(long)]
        strict: bool,
    },
    /// Report integrity issues; exits 1 when any are found.
    Check {
        #[arg(long)]
        require_system: bool,
        #[arg(long)]
        json: bool,
    },
    /// Write the flattened synonym artifact and its summary.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Versions,
    Restore {
        version_id: i64,
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Resolve a free-text metric name through the synonym list.
    Resolve { name: String },
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("mmd error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let mut config = EngineConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command {
        Commands::Migrate => {
            open_store(&config).await?;
            println!("catalog schema ready at {}", config.database_url);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Commit {
            path,
            format,
            summary,
            created_by,
            strict,
        } => {
            let source = source_for(format, &path);
            info!(source = %source.describe(), "loading catalog batch");
            let batch = source
                .load()
                .with_context(|| format!("loading {format} batch {}", path.display()))?;
            let pipeline = BulkCommitPipeline::new(open_store(&config).await?)
                .with_backoff(config.backoff())
                .strict(strict);
            let request = CommitRequest {
                change_summary: summary,
                created_by,
            };
            report_commit(pipeline.commit_with_retry(&batch, &request).await)
        }
        Commands::Check {
            require_system,
            json,
        } => {
            let view = open_store(&config).await?.read_snapshot().await?;
            let report = IntegrityChecker::new()
                .require_system(require_system)
                .check(&view);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render_text());
            }
            Ok(exit_code(report.is_clean()))
        }
        Commands::Export { out } => {
            let path = out.unwrap_or_else(|| config.export_path.clone());
            let report = SynonymExporter::new(open_store(&config).await?, path)
                .export()
                .await?;
            println!(
                "exported {} synonym record(s) to {} (summary {})",
                report.summary.record_count,
                report.artifact_path.display(),
                report.summary_path.display()
            );
            for (system, count) in &report.summary.by_system {
                println!("  system {system}: {count}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Versions => {
            let versions = open_store(&config).await?.versions().await?;
            if versions.is_empty() {
                println!("no versions recorded");
            }
            for version in &versions {
                print_version(version);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Restore {
            version_id,
            created_by,
        } => {
            let pipeline =
                BulkCommitPipeline::new(open_store(&config).await?).with_backoff(config.backoff());
            report_commit(pipeline.restore_version(version_id, created_by).await)
        }
        Commands::Resolve { name } => {
            let store = open_store(&config).await?;
            let resolver = load_resolver(&store, config.auto_map_threshold).await?;
            match resolver.best_match(&name) {
                Some(found) => {
                    println!("{}", serde_json::to_string_pretty(&found)?);
                    Ok(exit_code(found.auto_mapped))
                }
                None => {
                    println!("no synonym matches \"{name}\"");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Serve { port } => {
            mmd_web::serve(&config, port.unwrap_or(config.web_port)).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("MMD_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}

async fn open_store(config: &EngineConfig) -> Result<CatalogStore> {
    config
        .open_store()
        .await
        .with_context(|| format!("opening catalog {}", config.database_url))
}

fn report_commit(result: Result<CommitOutcome, CommitError>) -> Result<ExitCode> {
    match result {
        Ok(outcome) => {
            println!(
                "committed version {}: {} metric(s), {} synonym(s), {} conversion group(s)",
                outcome.version_id, outcome.metrics, outcome.synonyms, outcome.conversion_groups
            );
            println!(
                "  added {} / changed {} / removed {}{}",
                outcome.diff.added.len(),
                outcome.diff.changed.len(),
                outcome.diff.removed.len(),
                if outcome.replayed { " (same data as previous version)" } else { "" }
            );
            println!("  data_hash {}", outcome.data_hash);
            Ok(ExitCode::SUCCESS)
        }
        Err(CommitError::Rejected { issues }) => {
            eprintln!("commit rejected; catalog unchanged:");
            for issue in &issues {
                eprintln!(
                    "  {} {}: {}",
                    issue.issue_type, issue.metric_id, issue.issue_description
                );
            }
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err).context("bulk commit rolled back; catalog unchanged"),
    }
}

fn print_version(version: &CatalogVersion) {
    println!(
        "{:>5}  {}  {:<24} +{} ~{} -{}  {}  {}",
        version.version_id,
        version.created_at.format("%Y-%m-%d %H:%M:%S"),
        version.created_by.as_deref().unwrap_or("-"),
        version.added_count,
        version.changed_count,
        version.removed_count,
        &version.data_hash[..version.data_hash.len().min(12)],
        version.change_summary
    );
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
