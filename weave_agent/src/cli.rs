//! Command-line interface for the WeaveKit engine.
//!
//! Every command prints JSON on stdout; logs go to stderr.
//!
//! # Examples
//!
//! Create and run a workflow from a definition file:
//!
//! ```bash
//! $ weave create plan.yaml --id nightly
//! $ weave start nightly
//! ```
//!
//! Create and start in one step:
//!
//! ```bash
//! $ weave run plan.yaml
//! ```
//!
//! Inspect stored workflows:
//!
//! ```bash
//! $ weave list
//! $ weave status nightly --full
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use weave_core::types::WorkflowStatus;

use crate::config::EngineConfig;
use crate::workflow::manager::WorkflowManager;

/// CLI arguments for the engine.
#[derive(Parser, Debug)]
#[command(name = "weave", version, about = "Dependency-aware task workflow engine")]
pub struct Cli {
    /// Engine config file (YAML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding workflow records (overrides config and WEAVE_STORE_DIR)
    #[arg(short, long, global = true)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub action: Action,
}

/// Engine actions available via CLI.
#[derive(Subcommand, Debug)]
pub enum Action {
    /// Validate a task-definition file and persist the workflow
    Create {
        /// YAML or JSON definition
        file: PathBuf,

        /// Workflow id, overriding the one in the file
        #[arg(long)]
        id: Option<String>,
    },

    /// Run a created workflow to completion
    Start {
        /// Workflow id
        workflow_id: String,
    },

    /// Continue a workflow left running by an interrupted process
    Resume {
        /// Workflow id
        workflow_id: String,
    },

    /// Show the persisted state of a workflow
    Status {
        /// Workflow id
        workflow_id: String,

        /// Show results without truncation
        #[arg(long)]
        full: bool,
    },

    /// List stored workflows
    List,

    /// Delete a workflow record
    Delete {
        /// Workflow id
        workflow_id: String,
    },

    /// Create a workflow from a definition file and start it
    Run {
        /// YAML or JSON definition
        file: PathBuf,

        /// Workflow id, overriding the one in the file
        #[arg(long)]
        id: Option<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .await
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let mut config = config.with_env();
    if let Some(store) = &cli.store {
        config.store_dir = store.clone();
    }
    Ok(config)
}

/// Executes a parsed command line.
///
/// # Returns
///
/// The process exit code: `0` on success, `1` when a run ends `failed`.
pub async fn execute(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli).await?;
    let manager = WorkflowManager::from_config(&config)
        .await
        .with_context(|| format!("opening store {}", config.store_dir.display()))?;

    let report = match cli.action {
        Action::Create { file, id } => {
            let workflow = manager.create_from_file(&file, id.as_deref()).await?;
            print_json(&workflow.summary())?;
            return Ok(0);
        }
        Action::Start { workflow_id } => manager.start(&workflow_id).await?,
        Action::Resume { workflow_id } => manager.resume(&workflow_id).await?,
        Action::Run { file, id } => {
            let workflow = manager.create_from_file(&file, id.as_deref()).await?;
            manager.start(&workflow.workflow_id).await?
        }
        Action::Status { workflow_id, full } => {
            let workflow = if full {
                manager.status(&workflow_id).await?
            } else {
                manager.status_for_display(&workflow_id).await?
            };
            print_json(&workflow)?;
            return Ok(0);
        }
        Action::List => {
            print_json(&manager.list().await?)?;
            return Ok(0);
        }
        Action::Delete { workflow_id } => {
            manager.delete(&workflow_id).await?;
            print_json(&serde_json::json!({ "workflow_id": workflow_id, "deleted": true }))?;
            return Ok(0);
        }
    };

    print_json(&report)?;
    Ok(if report.status == WorkflowStatus::Completed { 0 } else { 1 })
}

/// Entry point for the CLI.
pub async fn run() -> anyhow::Result<i32> {
    execute(Cli::parse()).await
}
