use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cronguard::config::{Config, DEFAULT_CONFIG_PATH};
use cronguard::history::MemoryHistory;
use cronguard::stat::format_duration;

#[derive(Parser)]
#[command(
    name = "cronguard",
    about = "Cron-scheduled single-flight backup runner",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "CRONGUARD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log to stdout instead of the configured log file
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (scheduler + health endpoints)
    Serve,

    /// Run one backup now and print its outcome
    RunNow,

    /// Show the recorded backup history
    History {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Inspect the configured schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Validate the configuration file and exit
    CheckConfig,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Preview what will run in the next N hours
    Preview {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn init_tracing(config: &Config, debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if debug {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return;
    }

    match open_log(&config.log_path) {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            tracing::warn!(
                path = %config.log_path.display(),
                error = %e,
                "cannot open log file, logging to stderr"
            );
        }
    }
}

fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_tracing(&config, cli.debug);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            tracing::info!(config = %cli.config.display(), "Starting cronguard daemon");
            cronguard::serve(config).await?;
        }
        Commands::RunNow => {
            let history = cronguard::open_history(&config)?;
            let orchestrator = cronguard::build_orchestrator(&config, history.clone())?;
            let stat = orchestrator.run_backup().await;
            history.close()?;

            println!("{}", serde_json::to_string_pretty(&stat)?);
            if stat.is_failure() {
                bail!("backup {} failed", stat.name);
            }
        }
        Commands::History { json } => {
            let history = cronguard::open_history(&config)?;
            let stats = tokio::task::spawn_blocking({
                let history = history.clone();
                move || history.list()
            })
            .await??;
            history.close()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else if stats.is_empty() {
                println!("No backup history recorded.");
            } else {
                println!(
                    "{:<16} | {:<8} | {:<28} | {:<12} | Error",
                    "Job", "Status", "Started", "Duration"
                );
                println!("{:-<16}-|-{:-<8}-|-{:-<28}-|-{:-<12}-|-{:-<20}", "", "", "", "", "");
                for (name, runs) in &stats {
                    for stat in runs {
                        println!(
                            "{:<16} | {:<8} | {:<28} | {:<12} | {}",
                            name,
                            stat.status(),
                            stat.start,
                            format_duration(stat.duration),
                            stat.error.as_deref().unwrap_or("")
                        );
                    }
                }
            }
        }
        Commands::Schedule { action } => match action {
            ScheduleAction::Preview { hours } => {
                let orchestrator =
                    cronguard::build_orchestrator(&config, Arc::new(MemoryHistory::new(0)))?;
                let preview = orchestrator.crontab()?.preview(hours);

                if preview.is_empty() {
                    println!("No runs scheduled in next {} hours.", hours);
                } else {
                    println!("Upcoming runs (next {} hours):", hours);
                    for (time, name) in preview {
                        println!("{} : {}", time.to_rfc3339(), name);
                    }
                }
            }
        },
        Commands::CheckConfig => {
            println!("{}: configuration OK", cli.config.display());
        }
    }

    Ok(())
}
