//! dealwatch CLI
//!
//! Runs the scheduler in the foreground, or inspects and edits the persisted
//! state between runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use clap::{Parser, Subcommand};
use dealwatch::{
    error::{AppError, Result},
    models::Config,
    pipeline::{self, Scheduler, StartState},
    storage::LocalStorage,
    utils::{clock::SystemClock, log as console, normalize_domain},
};

/// dealwatch - deal source scheduler
#[derive(Parser, Debug)]
#[command(
    name = "dealwatch",
    version,
    about = "Polls deal sources, drops repeated offers and respects per-site limits"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "dealwatch.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run cycles until interrupted
    Run,

    /// Run a single cycle and exit
    Once {
        /// Poll every enabled source regardless of cadence
        #[arg(long)]
        force: bool,
    },

    /// Show sources, limits and recent outcomes
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration file
    Validate,

    /// Remove expired fingerprints and blocks from the saved state
    Gc,

    /// Stop polling a domain for a while
    Block {
        domain: String,

        #[arg(long, default_value = "manual")]
        reason: String,

        /// Block length (default: rate_limit.block_minutes)
        #[arg(long)]
        minutes: Option<i64>,
    },

    /// Lift a block
    Unblock { domain: String },
}

/// Load the config file. A missing file means defaults; a broken one is an
/// error.
fn load_config(path: &Path) -> (Result<Config>, bool) {
    if path.exists() {
        (Config::load(path), false)
    } else {
        (Ok(Config::default()), true)
    }
}

fn base_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn domain_arg(domain: &str) -> Result<String> {
    normalize_domain(domain)
        .ok_or_else(|| AppError::validation(format!("invalid domain '{domain}'")))
}

fn open(config: &Arc<Config>, config_path: &Path) -> Result<Scheduler> {
    let snapshot = config.storage.snapshot_file(&base_dir(config_path));
    let store = Arc::new(LocalStorage::new(snapshot));
    pipeline::build_scheduler(Arc::clone(config), Arc::new(SystemClock), Some(store))
}

fn print_status(scheduler: &Scheduler) {
    let status = scheduler.context().status(10);

    console::header(&format!(
        "dealwatch status at {}",
        status.generated_at.format("%Y-%m-%d %H:%M:%S")
    ));
    for row in &status.sources {
        let s = &row.source;
        let state = if !s.enabled {
            "disabled".to_string()
        } else if let Some(block) = &row.blocked {
            format!("blocked until {} ({})", block.until.format("%H:%M"), block.reason)
        } else if row.due {
            "due".to_string()
        } else {
            match row.next_due_at {
                Some(at) => format!("next {}", at.format("%H:%M")),
                None => "due".to_string(),
            }
        };
        println!(
            "  {:<24} {:<16} score {:>5.2}  {:<28} [{}]",
            s.domain,
            s.category,
            row.score,
            state,
            row.rate_profile
        );
        if let Some(err) = &s.last_error {
            console::sub_item(&format!("last error: {err}"));
        }
    }

    console::summary(
        "Totals",
        &[
            ("Fingerprints", status.dedup.fingerprints.to_string()),
            ("Admitted", status.rate.admitted.to_string()),
            ("Throttled", status.rate.throttled.to_string()),
            ("Blocked domains", status.rate.blocked_domains.to_string()),
            ("Cached feeds", status.cache.entries.to_string()),
        ],
    );

    if !status.recent.is_empty() {
        console::separator();
        for outcome in &status.recent {
            let result = match &outcome.error {
                Some(err) if !outcome.success => format!("failed: {err}"),
                _ => format!(
                    "{} found, {} new, {} published",
                    outcome.items_found, outcome.items_accepted, outcome.items_published
                ),
            };
            println!(
                "  {} {:<24} {}",
                outcome.timestamp.format("%H:%M:%S"),
                outcome.domain,
                result
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, missing) = load_config(&cli.config);
    let level = if cli.verbose {
        "debug".to_string()
    } else if cli.quiet {
        "warn".to_string()
    } else {
        match &config {
            Ok(config) => config.logging.level.clone(),
            Err(_) => "info".to_string(),
        }
    };
    console::init(&level);

    if missing {
        log::warn!(
            "Config file {} not found; using defaults",
            cli.config.display()
        );
    }
    let config = config.inspect_err(|e| log::error!("Could not load config: {}", e))?;
    config.validate()?;
    let config = Arc::new(config);

    match cli.command {
        Command::Run => {
            log::info!(
                "dealwatch starting with {} source(s), {} concurrent",
                config.sources.len(),
                config.scheduler.max_concurrent
            );
            let scheduler = open(&config, &cli.config)?;
            scheduler
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        log::error!("Could not listen for Ctrl-C: {}", e);
                        std::future::pending::<()>().await;
                    }
                })
                .await?;
        }

        Command::Once { force } => {
            let scheduler = open(&config, &cli.config)?;
            let start = scheduler.restore_or_fresh().await;
            let report = if force {
                scheduler.run_forced_cycle().await
            } else {
                scheduler.run_cycle().await
            };
            if start == StartState::Unreadable {
                log::warn!("Leaving the unreadable snapshot in place; state not saved");
            } else {
                scheduler.persist().await?;
            }

            console::summary(
                "Cycle",
                &[
                    ("Due", report.due.to_string()),
                    ("Succeeded", report.succeeded.to_string()),
                    ("Failed", report.failed.to_string()),
                    ("Deferred", report.deferred.to_string()),
                    ("Items found", report.items_found.to_string()),
                    ("Items new", report.items_accepted.to_string()),
                    ("Items published", report.items_published.to_string()),
                    ("Elapsed", format!("{}ms", report.elapsed.num_milliseconds())),
                ],
            );
        }

        Command::Status { json } => {
            let scheduler = open(&config, &cli.config)?;
            scheduler.restore_or_fresh().await;
            if json {
                let status = scheduler.context().status(50);
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&scheduler);
            }
        }

        Command::Validate => {
            // Building the engine also compiles patterns and binds profiles.
            let scheduler = open(&config, &cli.config)?;
            log::info!(
                "✓ Config OK ({} sources, {} rate profiles)",
                scheduler.context().registry.len(),
                config.rate_limit.profiles.len()
            );
        }

        Command::Gc => {
            let scheduler = open(&config, &cli.config)?;
            scheduler.restore().await?;
            let report = scheduler.collect_garbage(scheduler.context().now());
            scheduler.persist().await?;
            console::summary(
                "Garbage collection",
                &[
                    ("Fingerprints removed", report.fingerprints.to_string()),
                    ("Blocks expired", report.blocks.to_string()),
                    ("Cache entries dropped", report.cache_entries.to_string()),
                ],
            );
        }

        Command::Block {
            domain,
            reason,
            minutes,
        } => {
            let domain = domain_arg(&domain)?;
            let duration = match minutes {
                Some(m) if m > 0 => Duration::minutes(m),
                Some(_) => return Err(AppError::validation("--minutes must be > 0")),
                None => config.rate_limit.block_duration(),
            };
            let scheduler = open(&config, &cli.config)?;
            scheduler.restore().await?;
            let ctx = scheduler.context();
            ctx.rate.block(&domain, reason, duration, ctx.now());
            scheduler.persist().await?;
        }

        Command::Unblock { domain } => {
            let domain = domain_arg(&domain)?;
            let scheduler = open(&config, &cli.config)?;
            scheduler.restore().await?;
            if scheduler.context().rate.unblock(&domain) {
                scheduler.persist().await?;
            } else {
                log::warn!("{} was not blocked", domain);
            }
        }
    }

    Ok(())
}
