//! `sf` - command-line front end for storyforge.
//!
//! Every command opens the SQLite store named by `storage.db_path` (or
//! `--db`), runs one engine operation and prints either human text or, with
//! `--json`, the operation's report as JSON on stdout. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use storyforge_core::config::{Config, resolve_config_path};
use storyforge_core::context::LayeredContext;
use storyforge_core::error::format_error_with_remediation;
use storyforge_core::generation::{GenerateReport, HttpBackend, SlotOutcome};
use storyforge_core::lifecycle::ProjectPhase;
use storyforge_core::logging::init_logging;
use storyforge_core::model::{CandidateId, ProjectBible};
use storyforge_core::StoryEngine;

#[derive(Parser)]
#[command(name = "sf", version, propagate_version = true)]
#[command(about = "Draft long-form fiction unit by unit from a project bible")]
struct Cli {
    /// Config file (default: ./storyforge.toml, then the user config dir)
    #[arg(long, global = true, env = "STORYFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database, overriding `storage.db_path`
    #[arg(long, global = true, env = "STORYFORGE_DB")]
    db: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a project from a bible TOML file
    Init { bible: PathBuf },

    /// Show one project, or list all of them
    Project { project: Option<String> },

    /// Move a project to another phase. Moving back out of drafting purges
    /// generated units.
    Transition { project: String, phase: ProjectPhase },

    /// Print the context that generation would see for a unit
    Assemble {
        project: String,
        unit: u32,
        /// Token budget (default: context.context_budget_tokens)
        #[arg(long)]
        budget: Option<usize>,
    },

    /// Generate candidates for a unit
    Generate {
        project: String,
        unit: u32,
        /// Number of candidates (default: generation.candidates_per_unit)
        #[arg(short = 'n', long)]
        n: Option<u32>,
        /// Start a fresh batch even if the unit is done
        #[arg(long, conflicts_with = "retry_slot")]
        regenerate: bool,
        /// Re-run one slot of the previous batch
        #[arg(long)]
        retry_slot: Option<u32>,
    },

    /// Select a candidate as the unit's text
    Select {
        project: String,
        unit: u32,
        /// Candidate id, with or without the `c` prefix
        candidate: CandidateId,
    },

    /// Show a unit's status and candidates
    Status { project: String, unit: u32 },

    /// Reindex a unit's selected text
    Index {
        project: String,
        unit: u32,
        /// Re-chunk even when the stored chunks look current
        #[arg(long)]
        force: bool,
    },

    /// Delete a unit with its candidates and chunks
    DeleteUnit { project: String, unit: u32 },

    /// Show the effective configuration
    Config {
        /// Print only the config file path in use
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        match err.downcast_ref::<storyforge_core::Error>() {
            Some(core) => eprintln!("{}", format_error_with_remediation(core)),
            None => eprintln!("Error: {err:#}"),
        }
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.storage.db_path.clone_from(db);
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    init_logging(&config.logging).context("initializing logging")?;

    match cli.command {
        Command::Config { path } => show_config(cli.config.as_deref(), &config, cli.json, path),
        command => run_engine(command, config, cli.json).await,
    }
}

async fn run_engine(command: Command, config: Config, json: bool) -> anyhow::Result<()> {
    let backend = Arc::new(HttpBackend::from_config(&config.backend)?);
    let engine = StoryEngine::open(config, backend)?;

    match command {
        Command::Init { bible: path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let bible: ProjectBible = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            let state = engine.create_project(&bible).await?;
            emit(json, &state, |s| {
                println!(
                    "Created project {} ({} units, phase {})",
                    s.project_id,
                    bible.outline.len(),
                    s.phase
                );
            })?;
        }
        Command::Project { project: None } => {
            let projects = engine.list_projects().await?;
            emit(json, &projects, |list| {
                if list.is_empty() {
                    println!("No projects");
                }
                for state in list {
                    println!(
                        "{:<24} {:<10} epoch {}",
                        state.project_id,
                        state.phase.as_str(),
                        state.epoch
                    );
                }
            })?;
        }
        Command::Project {
            project: Some(project),
        } => {
            let view = engine.project(&project).await?;
            emit(json, &view, |v| {
                println!("{} - {} [{}]", v.state.project_id, v.title, v.state.phase);
                for unit in &v.units {
                    let selected = unit.selected.map(|c| c.to_string()).unwrap_or_default();
                    println!(
                        "  {:>3}  {:<11} {:<6} {}",
                        unit.ordinal,
                        unit.status.as_str(),
                        selected,
                        unit.title
                    );
                }
            })?;
        }
        Command::Transition { project, phase } => {
            let report = engine.transition(&project, phase).await?;
            emit(json, &report, |r| {
                println!("{}: {} -> {}", r.project_id, r.from, r.to);
                if r.purged_units > 0 {
                    println!(
                        "Purged {} units ({} candidates, {} chunks)",
                        r.purged_units, r.purged_candidates, r.purged_chunks
                    );
                }
            })?;
        }
        Command::Assemble {
            project,
            unit,
            budget,
        } => {
            let context = engine.assemble(&project, unit, budget).await?;
            emit(json, &context, print_context)?;
        }
        Command::Generate {
            project,
            unit,
            n,
            regenerate,
            retry_slot,
        } => {
            let batch = async {
                match (retry_slot, regenerate) {
                    (Some(slot), _) => engine.retry_one(&project, unit, slot).await,
                    (None, true) => engine.regenerate(&project, unit, n).await,
                    (None, false) => engine.generate(&project, unit, n).await,
                }
            };
            tokio::pin!(batch);
            let report = tokio::select! {
                report = &mut batch => report?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(project_id = %project, unit, "Interrupted; cancelling queued slots");
                    engine.cancel(&project);
                    batch.await?
                }
            };
            emit(json, &report, print_generate)?;
        }
        Command::Select {
            project,
            unit,
            candidate,
        } => {
            let outcome = engine.select(&project, unit, candidate).await?;
            emit(json, &outcome, |o| {
                println!("{}: selected {}", o.report.unit, o.report.selected);
                if let Some(err) = &o.report.index_error {
                    println!("Indexing failed ({err}); run `sf index` to retry");
                }
                if let Some(change) = &o.phase_change {
                    println!("Project moved {} -> {}", change.from, change.to);
                }
            })?;
        }
        Command::Status { project, unit } => {
            let status = engine.status(&project, unit).await?;
            emit(json, &status, |s| {
                let title = s.title.as_deref().unwrap_or("(not in outline)");
                println!("{} {} [{}]", s.unit, title, s.status);
                println!(
                    "Chunks: {} indexed, {} failed",
                    s.indexed_chunks, s.failed_chunks
                );
                if let Some(failure) = &s.last_failure {
                    println!(
                        "Last batch failed: {}/{} slots",
                        failure.failed, failure.requested
                    );
                }
                for c in &s.candidates {
                    let mark = if c.selected { "*" } else { " " };
                    let score = c.score.map(|v| format!("{v:>3}")).unwrap_or_else(|| "  -".into());
                    println!(
                        "{mark} {:<6} slot {:<2} {:>6} words  score {score}  {}",
                        c.id.to_string(),
                        c.slot,
                        c.word_count,
                        c.summary
                    );
                }
            })?;
        }
        Command::Index {
            project,
            unit,
            force,
        } => {
            let report = engine.index(&project, unit, force).await?;
            emit(json, &report, |r| match r {
                Some(r) => println!(
                    "{} chunks ({} reused, {} embedded, {} failed, {} removed)",
                    r.chunks, r.reused, r.embedded, r.failed, r.removed
                ),
                None => println!("Index already current"),
            })?;
        }
        Command::DeleteUnit { project, unit } => {
            let outcome = engine.delete_unit(&project, unit).await?;
            emit(json, &outcome, |o| {
                if o.existed {
                    println!("Deleted {}", o.unit);
                } else {
                    println!("{} had nothing stored", o.unit);
                }
                if let Some(change) = &o.phase_change {
                    println!("Project moved {} -> {}", change.from, change.to);
                }
            })?;
        }
        Command::Config { path } => show_config(None, engine.config(), json, path)?,
    }
    Ok(())
}

fn show_config(
    explicit: Option<&Path>,
    config: &Config,
    json: bool,
    path_only: bool,
) -> anyhow::Result<()> {
    let path = resolve_config_path(explicit);
    if path_only {
        match path {
            Some(path) => println!("{}", path.display()),
            None => println!("(defaults)"),
        }
        return Ok(());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        print!("{}", config.to_toml_string()?);
    }
    Ok(())
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn print_generate(report: &GenerateReport) {
    println!(
        "{} [{}]: {}/{} slots succeeded",
        report.unit, report.status, report.succeeded, report.requested
    );
    for slot in &report.slots {
        match &slot.outcome {
            SlotOutcome::Succeeded { candidate_id } => {
                println!("  slot {:<2} {candidate_id}", slot.slot);
            }
            SlotOutcome::Failed { last_error } => {
                println!(
                    "  slot {:<2} failed after {} attempts: {last_error}",
                    slot.slot, slot.attempts
                );
            }
            SlotOutcome::Cancelled => println!("  slot {:<2} cancelled", slot.slot),
        }
    }
}

fn print_context(context: &LayeredContext) {
    println!(
        "{}: {}/{} tokens ({} required){}",
        context.unit,
        context.used_tokens,
        context.budget_tokens,
        context.required_tokens,
        if context.over_budget {
            ", required tier over budget"
        } else {
            ""
        }
    );
    for (tier, items) in [
        ("required", &context.required),
        ("important", &context.important),
        ("reference", &context.reference),
    ] {
        println!("[{tier}]");
        for item in items {
            let cut = if item.truncated { " (truncated)" } else { "" };
            println!("  {:?} {} - {} tokens{cut}", item.kind, item.label, item.tokens);
        }
    }
}
