//! Binary entrypoint for the meshgate CLI.
//!
//! Commands:
//! - `start [--daemon] [--pid-file <path>]` - run the gateway until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `status` - build the gateway without starting it and print what it would run
//! - `check-config` - validate scheduled broadcasts and the service graph
//!
//! See the library crate docs for module-level details: `meshgate::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};

use meshgate::config::Config;
use meshgate::gateway::Gateway;
use meshgate::scheduler::broadcast::load_broadcasts;

#[derive(Parser)]
#[command(name = "meshgate")]
#[command(about = "A plugin gateway for Meshtastic mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Run as a background daemon (Unix only)
        #[arg(short, long)]
        daemon: bool,

        /// PID file location (for daemon mode)
        #[arg(long, default_value = "/tmp/meshgate.pid")]
        pid_file: String,
    },
    /// Write a default configuration file
    Init,
    /// Show services, plugins, and scheduled tasks
    Status,
    /// Validate configuration without starting anything
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { daemon, pid_file } => {
            let config = Config::load(&cli.config).await?;

            #[cfg(all(unix, feature = "daemon"))]
            if daemon {
                // Parent exits inside; only the detached child returns.
                daemonize_process(&config, &pid_file)?;
            }

            #[cfg(not(all(unix, feature = "daemon")))]
            if daemon {
                let _ = pid_file;
                eprintln!("Error: Daemon mode requires Unix platform and 'daemon' feature.");
                std::process::exit(1);
            }

            init_logging(Some(&config), cli.verbose);
            info!("Starting meshgate v{}", env!("CARGO_PKG_VERSION"));
            let gateway = Gateway::new(config).await?;
            gateway.run().await?;
        }
        Commands::Init => {
            init_logging(None, cli.verbose);
            if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                warn!("{} already exists; leaving it untouched", cli.config);
                return Ok(());
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = Config::load(&cli.config).await?;
            init_logging(Some(&config), cli.verbose);
            let gateway = Gateway::new(config).await?;
            let status = gateway.status().await;

            println!("{} ({})", status.name, env!("CARGO_PKG_VERSION"));
            println!("Services:");
            for svc in &status.services {
                let deps = if svc.dependencies.is_empty() {
                    String::new()
                } else {
                    format!(" <- {}", svc.dependencies.join(", "))
                };
                println!("  {:<12} {}{}", svc.name, svc.state, deps);
            }
            println!("Plugins:");
            for p in &status.plugins {
                println!("  {:<12} v{}  {}", p.name, p.version, p.description);
            }
            println!("Scheduled tasks:");
            for t in &status.tasks {
                let next = t
                    .next_run
                    .map(|n| n.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:<20} {:<28} enabled={} next={}",
                    t.name, t.schedule, t.enabled, next
                );
            }
            for (name, reason) in &status.skipped_broadcasts {
                println!("  (skipped) {}: {}", name, reason);
            }
        }
        Commands::CheckConfig => {
            let config = Config::load(&cli.config).await?;
            init_logging(Some(&config), cli.verbose);
            let report = load_broadcasts(&config.scheduled_broadcasts, config.broadcast_defaults());
            println!(
                "Scheduled broadcasts: {} valid, {} skipped",
                report.tasks.len(),
                report.skipped.len()
            );
            for (name, reason) in &report.skipped {
                println!("  {}: {}", name, reason);
            }

            let gateway = Gateway::new(config).await?;
            match gateway.services().calculate_startup_order().await {
                Ok(order) => println!("Startup order: {}", order.join(" -> ")),
                Err(e) => {
                    println!("Service graph error: {}", e);
                    std::process::exit(1);
                }
            }
            if !report.skipped.is_empty() {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}

fn init_logging(config: Option<&Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .and_then(|c| c.logging.file.as_deref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    match file {
        Some(f) => {
            let file = std::sync::Mutex::new(f);
            // In daemon mode stdout is redirected, so only the file gets the line.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}

/// Re-spawn this binary detached, write its PID, and exit the parent.
#[cfg(all(unix, feature = "daemon"))]
fn daemonize_process(config: &Config, pid_file: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::process::{Command, Stdio};

    let log_path = config.logging.file.as_deref().unwrap_or("meshgate.log");

    let current_exe = std::env::current_exe()?;
    let child_args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| arg != "--daemon" && arg != "-d")
        .collect();

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let child = Command::new(&current_exe)
        .args(&child_args)
        .stdin(Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;

    std::fs::write(pid_file, format!("{}", child.id()))?;
    std::process::exit(0);
}
