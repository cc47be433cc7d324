//! # Strata CLI (`strata`)
//!
//! ## Usage
//!
//! ```bash
//! strata --config ./config/strata.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `strata start` | Take the writer lock, run workers and the control plane |
//! | `strata stop` | Ask the running daemon to drain and exit |
//! | `strata status` | Queue depth, leases, failures, registry |
//! | `strata health` | Lock holder, store reachability, version |
//! | `strata discover [cv]` | Scan content versions and enqueue changes |
//! | `strata build` | One-shot bulk build |
//! | `strata enqueue <cv:path>...` | Enqueue files (use `--flash` for edits) |
//! | `strata wait <ids>...` | Wait for queue items to finish |
//! | `strata cancel <ids>...` | Cancel queue items |
//! | `strata snapshot` | Build a registry snapshot |
//! | `strata resolve <name>` | Resolve a definition against a snapshot |
//! | `strata reset [--fresh]` | Clear the queue, or the whole store |
//! | `strata gc` | Delete unreferenced artifacts and old snapshots |
//! | `strata completions <shell>` | Print shell completions |

use clap::{ArgGroup, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use strata::build::{self, BuildMode};
use strata::commands;
use strata::config;
use strata::daemon::{self, StartOptions};
use strata::error::{ClientError, DaemonError};
use strata::models::priority;
use strata::progress::ProgressMode;
use strata::status;

/// Strata — an incremental, crash-safe build daemon for layered source corpora.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/strata.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "strata", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/strata.toml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// More logging (-v debug, -vv trace). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground.
    ///
    /// Takes the writer lock before touching the store; a second daemon on
    /// the same store is refused.
    Start {
        /// Truncate the store before starting.
        #[arg(long)]
        fresh: bool,
        /// Accept changed step versions and regenerate affected artifacts.
        #[arg(long)]
        accept_tool_versions: bool,
    },

    /// Ask the running daemon to finish in-flight items and exit.
    Stop,

    /// Show queue depth, leases, recent failures and the registry state.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Check the running daemon and its store.
    Health {
        #[arg(long)]
        json: bool,
    },

    /// Scan content versions and enqueue changed files.
    Discover {
        /// Only this content version (default: all).
        content_version: Option<String>,
        /// Re-enqueue every routed file, changed or not.
        #[arg(long)]
        force: bool,
    },

    /// Build everything that is stale, then exit.
    ///
    /// Uses a running daemon if there is one; otherwise takes the writer
    /// lock and drains the queue in this process.
    Build {
        /// Run in the background; output goes to `<store dir>/runs/<run_id>.log`.
        #[arg(long)]
        detach: bool,
        /// Give up waiting after this many seconds.
        #[arg(long, default_value_t = 3600)]
        timeout_secs: u64,
        /// Progress output on stderr (default: human on a TTY, else off).
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Enqueue files on the running daemon. Prints the queue ids.
    #[command(group(ArgGroup::new("tier").args(["priority", "flash"])))]
    Enqueue {
        /// Files as `<content_version>:<relative/path>`.
        #[arg(required = true)]
        files: Vec<String>,
        #[arg(long)]
        priority: Option<i64>,
        /// Enqueue at the flash tier (interactive edits).
        #[arg(long)]
        flash: bool,
    },

    /// Wait until the given queue items finish.
    Wait {
        #[arg(required = true)]
        ids: Vec<i64>,
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },

    /// Cancel queue items.
    Cancel {
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Build a registry snapshot from the current definitions.
    Snapshot,

    /// Resolve a name (or every reference of one file) against a snapshot.
    Resolve {
        /// Definition name to look up.
        #[arg(required_unless_present = "file")]
        name: Option<String>,
        /// Resolve the references of `<content_version>:<path>` instead.
        #[arg(long, conflicts_with = "name")]
        file: Option<String>,
        /// Snapshot id (default: latest).
        #[arg(long)]
        snapshot: Option<i64>,
    },

    /// Clear the queue; with `--fresh`, truncate the whole store.
    Reset {
        #[arg(long)]
        fresh: bool,
    },

    /// Delete unreferenced artifacts and old registry snapshots.
    Gc,

    /// Print shell completions.
    Completions { shell: Shell },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

fn init_tracing(format: LogFormat, verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("strata={level},tower_http=warn")));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true);

    let _ = match format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()),
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
    };
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Distinct exit codes for the failures scripts branch on.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<DaemonError>() {
        return match e {
            DaemonError::LockContention { .. } => 3,
            DaemonError::SchemaMismatch { .. } | DaemonError::ToolVersionMismatch { .. } => 4,
            DaemonError::NonLocalBind(_) => 2,
        };
    }
    if err.downcast_ref::<ClientError>().is_some() {
        return 5;
    }
    1
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "strata", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Start {
            fresh,
            accept_tool_versions,
        } => {
            daemon::run_daemon(
                &cfg,
                StartOptions {
                    fresh,
                    accept_tool_versions,
                },
            )
            .await?;
        }
        Commands::Stop => commands::run_stop(&cfg).await?,
        Commands::Status { json } => status::run_status(&cfg, json).await?,
        Commands::Health { json } => status::run_health(&cfg, json).await?,
        Commands::Discover {
            content_version,
            force,
        } => commands::run_discover(&cfg, content_version.as_deref(), force).await?,
        Commands::Build {
            detach,
            timeout_secs,
            progress,
        } => {
            if detach {
                let mut args = vec!["--timeout-secs".to_string(), timeout_secs.to_string()];
                args.extend(["--progress".to_string(), "json".to_string()]);
                let child = build::spawn_detached(&cfg, &cli.config, &args)?;
                println!("Build {} running as pid {}.", child.run_id, child.pid);
                println!("Log: {}", child.log.display());
                return Ok(());
            }

            let mode = match progress {
                Some(ProgressArg::Off) => ProgressMode::Off,
                Some(ProgressArg::Human) => ProgressMode::Human,
                Some(ProgressArg::Json) => ProgressMode::Json,
                None => ProgressMode::default_for_tty(),
            };
            let reporter = mode.reporter();
            let report =
                build::run_build(&cfg, Duration::from_secs(timeout_secs), reporter.as_ref()).await?;

            let s = &report.summary;
            let via = match report.mode {
                BuildMode::Client => "daemon",
                BuildMode::Writer => "standalone",
            };
            println!(
                "Build {} ({}): {} enqueued, {} built, {} reused, {} failed, {} cancelled.",
                report.run_id, via, report.enqueued, s.built, s.reused, s.failed, s.cancelled
            );
            if !report.completed {
                anyhow::bail!(
                    "timed out after {}s with {} item(s) still open",
                    timeout_secs,
                    s.pending + s.leased
                );
            }
            if s.failed > 0 {
                anyhow::bail!("{} item(s) failed; see `strata status`", s.failed);
            }
        }
        Commands::Enqueue {
            files,
            priority: explicit,
            flash,
        } => {
            let tier = if flash {
                priority::FLASH
            } else {
                explicit.unwrap_or(priority::NORMAL)
            };
            commands::run_enqueue(&cfg, &files, tier).await?;
        }
        Commands::Wait { ids, timeout_ms } => {
            commands::run_wait(&cfg, &ids, Duration::from_millis(timeout_ms)).await?
        }
        Commands::Cancel { ids } => commands::run_cancel(&cfg, &ids).await?,
        Commands::Snapshot => commands::run_snapshot(&cfg).await?,
        Commands::Resolve {
            name,
            file,
            snapshot,
        } => match (name, file) {
            (_, Some(file)) => commands::run_resolve_file(&cfg, &file, snapshot).await?,
            (Some(name), None) => commands::run_resolve(&cfg, &name, snapshot).await?,
            (None, None) => anyhow::bail!("give a name or --file"),
        },
        Commands::Reset { fresh } => commands::run_reset(&cfg, fresh).await?,
        Commands::Gc => commands::run_gc(&cfg).await?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
