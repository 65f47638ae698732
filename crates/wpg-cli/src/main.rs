mod config;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use config::AppConfig;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wpg_core::{conflict_origin, PromptGenerator, Record, RecordId, SyncState};
use wpg_engine::{
    maintenance, CancelToken, GenerationPipeline, GenerationReport, SyncEngine, SyncReport,
};
use wpg_mirror_adapter::DirectoryMirror;
use wpg_provider_adapter::{CommandPromptGenerator, PromptFileGenerator, UrlTemplateImageFetcher};
use wpg_storage::{RecordStore, RecoveryReport};

#[derive(Parser)]
#[command(name = "wpg")]
#[command(about = "Topic-organized wallpaper dataset generator with shared-mirror sync", long_about = None)]
struct Cli {
    /// Config file (defaults to ./wpg.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides the configured data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Overrides the configured dataset id
    #[arg(long, global = true)]
    dataset: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate new wallpapers for a topic
    Generate {
        topic: String,
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Pull, merge and push against the configured mirror
    Sync {
        /// Mirror directory, overriding the configured one
        #[arg(long)]
        mirror: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show topics with record counts
    Topics {
        #[arg(long)]
        json: bool,
    },
    /// List records, oldest first
    List {
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        favorites: bool,
        #[arg(long)]
        json: bool,
    },
    /// Repair orphaned files and records
    Recover,
    /// Delete one record and its image locally
    Remove { id: String },
    /// Edit notes or the favorite flag of a record
    Annotate(AnnotateArgs),
}

#[derive(Args)]
struct AnnotateArgs {
    id: String,
    #[arg(long, conflicts_with = "clear_notes")]
    notes: Option<String>,
    #[arg(long)]
    clear_notes: bool,
    #[arg(long, conflicts_with = "unfavorite")]
    favorite: bool,
    #[arg(long)]
    unfavorite: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let (mut config, config_path) = AppConfig::load(cli.config.as_deref())?;
    config.apply_env()?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(dataset) = cli.dataset {
        config.dataset_id = dataset;
    }
    if let Some(path) = &config_path {
        info!(path = %path.display(), "config loaded");
    }

    let store = RecordStore::open(&config.data_dir)
        .with_context(|| format!("Failed to open store at {}", config.data_dir.display()))?;
    let recovery = maintenance::recover_if_idle(&store, Utc::now())
        .context("Recovery pass failed")?;
    if let Some(report) = recovery.as_ref().filter(|report| !report.is_clean()) {
        warn!(repairs = report.repairs(), "startup recovery repaired the store");
    }

    match cli.command {
        Commands::Generate {
            topic,
            count,
            width,
            height,
            json,
        } => {
            let mut pipeline_config = config.pipeline_config();
            pipeline_config.width = width.unwrap_or(pipeline_config.width);
            pipeline_config.height = height.unwrap_or(pipeline_config.height);

            let prompts = prompt_source(&config)?;
            let template = config.image.url_template.clone().context(
                "No image backend configured: set IMAGE_GENERATOR_URL_TEMPLATE or image.url_template",
            )?;
            let images = UrlTemplateImageFetcher::new(template, config.timeout())?;
            if !images.placeholders_used().contains(&"{seed}") {
                warn!("image template has no {{seed}} placeholder; re-runs may not reproduce images");
            }
            let pipeline = GenerationPipeline::new(pipeline_config, prompts, images);
            let report = pipeline.run(&store, &topic, count)?;
            emit(&report, json, print_generation)?;
        }
        Commands::Sync { mirror, json } => {
            let mirror_dir = mirror.or_else(|| config.mirror_dir.clone()).context(
                "No mirror configured: pass --mirror or set WPG_MIRROR_DIR or mirror_dir",
            )?;
            let engine = SyncEngine::new(config.sync_config(), DirectoryMirror::new(mirror_dir));
            let report = engine.sync_with(&store, &CancelToken::new())?;
            emit(&report, json, print_sync)?;
        }
        Commands::Topics { json } => {
            let topics = store.topics()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&topics)?);
            } else if topics.is_empty() {
                println!("No topics yet.");
            } else {
                for topic in &topics {
                    let last = topic
                        .last_generated_at
                        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:<32} {:>5}  {}", topic.topic, topic.record_count, last);
                }
            }
        }
        Commands::List {
            topic,
            favorites,
            json,
        } => {
            let records = store
                .list(topic.as_deref())?
                .into_iter()
                .filter(|record| !favorites || record.is_favorite)
                .collect::<Vec<_>>();
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                println!("Found {} records:", records.len());
                for record in &records {
                    print_record(record);
                }
            }
        }
        Commands::Recover => match &recovery {
            Some(report) => print_recovery(report),
            None => print_recovery(&maintenance::recover(&store, Utc::now())?),
        },
        Commands::Remove { id } => {
            let id = RecordId::new(id);
            maintenance::remove(&store, &id, Utc::now())?;
            println!("Removed {id}");
        }
        Commands::Annotate(args) => {
            let notes = if args.clear_notes {
                Some(None)
            } else {
                args.notes.as_deref().map(Some)
            };
            let favorite = if args.favorite {
                Some(true)
            } else if args.unfavorite {
                Some(false)
            } else {
                None
            };
            if notes.is_none() && favorite.is_none() {
                bail!("Nothing to change: pass --notes, --clear-notes, --favorite or --unfavorite");
            }
            let record =
                maintenance::annotate(&store, &RecordId::new(args.id), notes, favorite, Utc::now())?;
            print_record(&record);
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn prompt_source(config: &AppConfig) -> Result<Box<dyn PromptGenerator>> {
    if let Some(command) = &config.prompts.command {
        return Ok(Box::new(CommandPromptGenerator::from_command_line(
            command,
            config.timeout(),
        )?));
    }
    if let Some(file) = &config.prompts.file {
        return Ok(Box::new(PromptFileGenerator::load(file).with_context(
            || format!("Failed to load prompts from {}", file.display()),
        )?));
    }
    bail!("No prompt source configured: set WPG_PROMPT_COMMAND or WPG_PROMPTS_FILE")
}

fn emit<T: Serialize>(value: &T, json: bool, human: fn(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn print_generation(report: &GenerationReport) {
    println!(
        "Topic '{}': {}/{} images created, {} failed, {} duplicates skipped{}",
        report.topic,
        report.succeeded,
        report.attempted(),
        report.failed,
        report.skipped_duplicates,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for failure in &report.failures {
        println!("  failed: {} ({})", failure.prompt, failure.error);
    }
}

fn print_sync(report: &SyncReport) {
    println!(
        "Synced {} at {}: {} pulled, {} materialized, {} restored, {} fast-forwarded, {} deduplicated, {} pushed ({} images)",
        report.dataset_id,
        report.commit.revision,
        report.pulled,
        report.materialized,
        report.restored,
        report.fast_forwarded,
        report.deduplicated,
        report.pushed_records,
        report.pushed_uploads,
    );
    for conflict in &report.conflicts {
        println!(
            "  conflict on {}: {} kept, other version saved as {}",
            conflict.record_id,
            conflict.winner.as_str(),
            conflict.conflict_id
        );
    }
}

fn print_recovery(report: &RecoveryReport) {
    if report.is_clean() {
        println!("Store is consistent.");
        return;
    }
    for name in &report.partial_writes_removed {
        println!("removed partial write {name}");
    }
    for name in &report.orphaned_files_removed {
        println!("removed orphaned file {name}");
    }
    for id in &report.orphaned_records_removed {
        println!("removed record without image {id}");
    }
}

fn print_record(record: &Record) {
    let state = match record.sync_state {
        SyncState::LocalOnly => "local",
        SyncState::Synced => "synced",
        SyncState::RemoteOnly => "remote",
    };
    println!(
        "- [{}] {} {} {} {}{}",
        record.id,
        record.created_at.format("%Y-%m-%d %H:%M"),
        state,
        record.topic,
        record.prompt,
        if record.is_favorite { " *" } else { "" }
    );
    if let Some(origin) = conflict_origin(&record.id) {
        println!("    conflict copy of {origin}");
    }
    if let Some(notes) = &record.notes {
        println!("    notes: {notes}");
    }
}
