//! Command-line interface for reef-orchestrator.
//!
//! Provides commands for running the orchestrator, inspecting its status,
//! editing the task file and checking configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::adapters::{HttpConnector, ServiceConnector, SimulatedLab};
use crate::config::{self, ServiceMode, Settings};
use crate::core::{Orchestrator, TaskDocument};
use crate::domain::ScanMode;
use crate::logging;

pub mod tasks;

/// reef-orchestrator - unattended time-lapse imaging
#[derive(Parser, Debug)]
#[command(name = "reef-orchestrator")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator until interrupted
    Run {
        /// Where the hardware services are reached (overrides config)
        #[arg(short, long, value_enum, env = "REEF_MODE")]
        mode: Option<ServiceMode>,

        /// Drive an in-process simulated lab instead of real hardware
        #[arg(long)]
        simulation: bool,
    },

    /// Show the status written by a running orchestrator
    Status,

    /// Inspect and edit the task file
    Tasks {
        #[command(subcommand)]
        command: tasks::TaskCommands,
    },

    /// Check a task file without running anything
    Validate {
        /// Task file (defaults to the configured one)
        file: Option<PathBuf>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Install logging: console plus rotated file for `run`, console only otherwise
    pub fn init_logging(&self) -> Result<()> {
        match self.command {
            Commands::Run { .. } => logging::init(config::config()?, self.verbose),
            _ => {
                logging::init_console(self.verbose);
                Ok(())
            }
        }
    }

    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { mode, simulation } => run(mode, simulation).await,
            Commands::Status => show_status(),
            Commands::Tasks { command } => tasks::execute(command).await,
            Commands::Validate { file } => validate(file),
            Commands::Config => show_config(),
        }
    }
}

/// Simulated lab holding a plate for every automated task in the task file
fn simulated_lab(settings: &Settings) -> Result<SimulatedLab> {
    let bytes = std::fs::read(&settings.task_file)
        .with_context(|| format!("Failed to read task file: {}", settings.task_file.display()))?;
    let doc = TaskDocument::parse(&bytes)?;

    let lab = doc
        .tasks
        .iter()
        .filter(|t| t.settings.scan_mode == ScanMode::FullAutomation)
        .fold(SimulatedLab::new(), |lab, task| {
            lab.with_sample(task.settings.incubator_slot, task.name.clone())
        });
    Ok(lab)
}

/// Signals that start a graceful shutdown
struct ShutdownSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Install the handlers. From here on SIGTERM no longer kills the process.
    fn install() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to listen for SIGTERM")?,
        })
    }

    /// Resolve with the name of the first signal received
    async fn recv(&mut self) -> Result<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("Failed to listen for Ctrl-C")?;
                    Ok("SIGINT")
                }
                _ = self.terminate.recv() => Ok("SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            Ok("Ctrl-C")
        }
    }
}

/// Start the orchestrator and run until Ctrl-C or SIGTERM
async fn run(mode: Option<ServiceMode>, simulation: bool) -> Result<()> {
    let mut signals = ShutdownSignals::install()?;
    let mut settings = config::config()?.clone();
    if let Some(mode) = mode {
        settings.services.mode = mode;
    }

    let connector: Arc<dyn ServiceConnector> = if simulation {
        tracing::info!("Running against a simulated lab");
        Arc::new(simulated_lab(&settings)?)
    } else {
        let services = &settings.services;
        tracing::info!(mode = ?services.mode, url = services.server_url(), "Connecting to service server");
        Arc::new(HttpConnector::new(
            services.server_url(),
            services.workspace.clone(),
            services.token(),
            settings.timeouts.call,
            settings.timeouts.load.max(settings.timeouts.unload),
        ))
    };

    let orchestrator = Orchestrator::start(settings, connector)
        .await
        .context("Failed to start orchestrator")?;

    eprintln!("Orchestrator running. Press Ctrl-C to stop.");
    let received = signals.recv().await?;
    tracing::info!(signal = received, "Shutdown signal received");
    eprintln!("\nStopping; waiting for running hardware sequences to finish...");

    let report = orchestrator.shutdown().await;
    for forced in &report.forced {
        eprintln!(
            "[force-closed] {} (task: {}) after {:?}",
            forced.label,
            forced.task.as_deref().unwrap_or("-"),
            forced.elapsed
        );
    }
    for actor in &report.aborted {
        eprintln!("[aborted] {}", actor);
    }

    Ok(())
}

/// Print status.json in a readable form
fn show_status() -> Result<()> {
    let settings = config::config()?;
    let path = settings.status_file();
    let bytes = std::fs::read(&path).with_context(|| {
        format!(
            "No status at {} (is the orchestrator running?)",
            path.display()
        )
    })?;
    let status: Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let text = |v: &Value| v.as_str().unwrap_or("-").to_string();

    println!("Status as of {}", text(&status["generated_at"]));
    if status["shutdown_requested"].as_bool().unwrap_or(false) {
        println!("Shutdown requested");
    }
    if let Some(reason) = status["dispatch_halted"].as_str() {
        println!("DISPATCH HALTED: {}", reason);
    }

    println!();
    println!("{:<24} {:<10} {:<20} {:>7} {:>7}", "TASK", "STATE", "NEXT", "PENDING", "IMAGED");
    println!("{}", "-".repeat(72));
    for task in status["tasks"].as_array().into_iter().flatten() {
        println!(
            "{:<24} {:<10} {:<20} {:>7} {:>7}",
            text(&task["name"]),
            text(&task["state"]),
            text(&task["next_time_point"]),
            task["pending"],
            task["imaged"]
        );
        if let Some(message) = task["message"].as_str() {
            println!("    {}", message);
        }
    }

    println!();
    println!("{:<32} {:<12} {:<12} {:>8}", "SERVICE", "KIND", "CONNECTION", "FAILURES");
    println!("{}", "-".repeat(68));
    for service in status["services"].as_array().into_iter().flatten() {
        println!(
            "{:<32} {:<12} {:<12} {:>8}",
            text(&service["name"]),
            text(&service["kind"]),
            text(&service["connection"]),
            service["consecutive_failures"]
        );
    }

    println!();
    println!(
        "Transport: {} queued, worker {}",
        status["transport"]["queue_size"],
        text(&status["transport"]["worker"])
    );
    for section in status["active_sections"].as_array().into_iter().flatten() {
        println!(
            "  in progress: {} ({} ms)",
            text(&section["label"]),
            section["elapsed_ms"]
        );
    }

    Ok(())
}

/// Parse and check a task file
fn validate(file: Option<PathBuf>) -> Result<()> {
    let path = match file {
        Some(path) => path,
        None => config::config()?.task_file.clone(),
    };
    let bytes =
        std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let doc = TaskDocument::parse(&bytes)
        .with_context(|| format!("{} is not a valid task file", path.display()))?;

    let pending: usize = doc.tasks.iter().map(|t| t.pending_time_points.len()).sum();
    println!(
        "{}: {} tasks, {} slots, {} pending time points",
        path.display(),
        doc.tasks.len(),
        doc.slots.len(),
        pending
    );
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Task file: {}", cfg.task_file.display());
    println!("  Status:    {}", cfg.status_file().display());
    println!("  Log:       {}", cfg.log_file().display());
    println!();
    println!("Services ({:?}):", cfg.services.mode);
    println!("  Server:    {}", cfg.services.server_url());
    println!("  Workspace: {}", cfg.services.workspace);
    println!(
        "  Token:     {} ({})",
        cfg.services.token_env,
        if cfg.services.token().is_some() { "set" } else { "not set" }
    );
    println!("  Incubator: {}", cfg.services.incubator_id);
    println!("  Arm:       {}", cfg.services.arm_id);
    for m in &cfg.services.microscopes {
        println!("  Microscope: {} (arm station {})", m.id, m.arm_station);
    }
    println!();
    let t = &cfg.timeouts;
    println!("Timeouts:");
    println!("  Load/unload:    {:?} / {:?}", t.load, t.unload);
    println!("  Ping:           {:?}", t.ping);
    println!("  Call:           {:?}", t.call);
    println!("  Scan poll:      {:?} (status call {:?})", t.scan_poll, t.scan_status_call);
    println!("  Section limit:  {:?}", t.max_section);
    println!("  Shutdown grace: {:?}", t.shutdown_grace);
    println!();
    println!("Health: every {:?}, unreachable after {} failures", cfg.health.interval, cfg.health.failure_threshold);
    println!("Scheduler: poll {:?}, watch task file: {}", cfg.scheduler.poll_interval, cfg.scheduler.watch_task_file);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_starts_graceful_shutdown() {
        let mut signals = ShutdownSignals::install().unwrap();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), signals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "SIGTERM");
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from(["reef-orchestrator", "run", "--mode", "cloud", "--simulation"])
            .unwrap();
        match cli.command {
            Commands::Run { mode, simulation } => {
                assert_eq!(mode, Some(ServiceMode::Cloud));
                assert!(simulation);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_task_subcommands() {
        let cli = Cli::try_parse_from(["reef-orchestrator", "-v", "tasks", "pause", "exp1"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Tasks {
                command: tasks::TaskCommands::Pause { ref name }
            } if name == "exp1"
        ));

        assert!(Cli::try_parse_from(["reef-orchestrator", "tasks", "add"]).is_err());
    }

    #[test]
    fn test_simulated_lab_seeded_from_task_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let settings = Settings::for_home(temp.path());
        std::fs::write(
            &settings.task_file,
            r#"{"tasks": [
                {"name": "exp1", "pending_time_points": ["2024-01-01T10:00:00"],
                 "settings": {"scan_mode": "full_automation", "incubator_slot": 3}},
                {"name": "scope", "pending_time_points": [],
                 "settings": {"scan_mode": "microscope_only", "incubator_slot": 7}}
            ]}"#,
        )
        .unwrap();

        let lab = simulated_lab(&settings).unwrap();
        assert!(lab.sample_location(3).is_some());
        assert!(lab.sample_location(7).is_none());
    }
}
