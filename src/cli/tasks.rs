//! Task file subcommands.
//!
//! Edits go through the task store, so they take the same lock as a running
//! orchestrator and are picked up by its file watcher.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::config;
use crate::core::TaskStore;
use crate::domain::Task;

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// List tasks and their progress
    List,

    /// Add a task, or replace the task with the same name
    Add {
        /// JSON file holding one task
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Remove a task
    Remove { name: String },

    /// Stop dispatching a task until resumed
    Pause { name: String },

    /// Un-pause a task or clear its error
    Resume { name: String },
}

pub async fn execute(command: TaskCommands) -> Result<()> {
    let path = config::config()?.task_file.clone();

    match command {
        TaskCommands::List => {
            let store = TaskStore::open(&path).await?;
            list(&store.tasks());
        }
        TaskCommands::Add { file } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read task: {}", file.display()))?;
            let task: Task = serde_json::from_slice(&bytes)
                .with_context(|| format!("Invalid task JSON in {}", file.display()))?;
            let name = task.name.clone();

            let store = TaskStore::open_or_create(&path).await?;
            store.upsert_task(task).await?;
            println!("Task '{}' saved to {}", name, path.display());
        }
        TaskCommands::Remove { name } => {
            let store = TaskStore::open(&path).await?;
            let removed = store.remove_task(&name).await?;
            println!(
                "Removed '{}' ({} imaged, {} pending)",
                removed.name,
                removed.imaged_time_points.len(),
                removed.pending_time_points.len()
            );
        }
        TaskCommands::Pause { name } => {
            let store = TaskStore::open(&path).await?;
            store.pause(&name).await?;
            println!("Paused '{}'", name);
        }
        TaskCommands::Resume { name } => {
            let store = TaskStore::open(&path).await?;
            let state = store.resume(&name).await?;
            println!("Resumed '{}' ({})", name, state);
        }
    }

    Ok(())
}

fn list(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks");
        return;
    }

    println!(
        "{:<24} {:<10} {:<16} {:>4} {:<20} {:>9}",
        "NAME", "STATE", "MODE", "SLOT", "NEXT", "PROGRESS"
    );
    println!("{}", "-".repeat(90));

    for task in tasks {
        let next = task
            .next_time_point()
            .map(|tp| tp.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let total = task.imaged_time_points.len() + task.pending_time_points.len();
        println!(
            "{:<24} {:<10} {:<16} {:>4} {:<20} {:>4}/{:<4}",
            task.name,
            task.operational_state,
            format!("{:?}", task.settings.scan_mode),
            task.settings.incubator_slot,
            next,
            task.imaged_time_points.len(),
            total
        );
        if let Some(ref message) = task.message {
            println!("    {}", message);
        }
    }
}
