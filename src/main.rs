use oida::core::agent::AgentExecutor;
use oida::core::cortex::Cortex;
use oida::core::decision::{Disposition, Priority};
use oida::core::r#loop::Orchestrator;
use oida::core::state::{OidaConfig, OIDA_DIR};
use oida::io::telemetry;
use oida::memory::{CozoStateStore, CycleRecord, StateStore};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "oida",
    version,
    about = "Autonomous Observe-Infer-Decide-Act loop over a workspace"
)]
struct Cli {
    /// Workspace root; config and state live under `<workspace>/.oida`.
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Config file (defaults to `<workspace>/.oida/config.toml`).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the loop until interrupted (the default).
    Run,
    /// Create `.oida/config.toml` and ignore `.oida/` in git.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Manage the goals fed to the reasoning engine.
    Goal {
        #[command(subcommand)]
        command: GoalCommand,
    },
    /// Print recent cycle records, most recent first.
    Log {
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
}

#[derive(Subcommand)]
enum GoalCommand {
    Add {
        description: String,
        #[arg(short, long, default_value = "medium")]
        priority: Priority,
    },
    Done {
        id: String,
    },
    List {
        /// Include completed goals.
        #[arg(short, long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| OidaConfig::default_path(&cli.workspace));

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_loop(&cli.workspace, &config_path).await,
        Command::Init { force } => init_workspace(&cli.workspace, &config_path, force),
        Command::Goal { command } => {
            let config = load_config(&cli.workspace, &config_path)?;
            let store = CozoStateStore::open(&config.state_dir())?;
            goal_command(&store, command).await
        }
        Command::Log { count } => {
            let config = load_config(&cli.workspace, &config_path)?;
            let store = CozoStateStore::open(&config.state_dir())?;
            print_log(&store, count).await
        }
    }
}

fn load_config(workspace: &Path, path: &Path) -> Result<OidaConfig> {
    let mut config = OidaConfig::load(path)?;
    if config.workspace_root.is_relative() {
        config.workspace_root = workspace.join(&config.workspace_root);
    }
    Ok(config)
}

async fn run_loop(workspace: &Path, config_path: &Path) -> Result<()> {
    let config = load_config(workspace, config_path)?;

    println!("{}", "OIDA loop starting".green().bold());
    println!("   workspace : {}", config.workspace_root.display());
    println!("   reasoning : {} ({})", config.reasoning.endpoint, config.reasoning.model);
    println!("   agent     : {}", config.execution.agent_binary);
    println!("   interval  : {}s", config.cycle_interval_secs);

    // Fail before touching the store if the config is unusable.
    config.validate().context("Invalid configuration")?;

    let cortex = Cortex::new(config.reasoning.clone())?;
    let executor = AgentExecutor::new(config.workspace_root.clone(), config.execution.clone());
    let store = CozoStateStore::open(&config.state_dir())?;

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(cortex),
        Arc::new(executor),
        Arc::new(store),
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                trigger.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for interrupts"),
        }
    });

    orchestrator.run(shutdown).await?;
    println!("{}", "OIDA loop stopped.".green());
    Ok(())
}

fn init_workspace(workspace: &Path, config_path: &Path, force: bool) -> Result<()> {
    if !workspace.is_dir() {
        bail!("{} is not a directory", workspace.display());
    }
    fs::create_dir_all(workspace.join(OIDA_DIR))?;

    if config_path.exists() && !force {
        println!("{}", "OIDA is already initialized in this workspace.".green());
    } else {
        OidaConfig::default().save(config_path)?;
        println!("{} {}", "Wrote".green(), config_path.display());
    }

    let gitignore_path = workspace.join(".gitignore");
    let mut gitignore = if gitignore_path.exists() {
        fs::read_to_string(&gitignore_path)?
    } else {
        String::new()
    };
    if !gitignore.lines().any(|l| l.trim_end_matches('/') == OIDA_DIR) {
        gitignore.push_str(&format!("\n# OIDA loop state\n{}/\n", OIDA_DIR));
        fs::write(&gitignore_path, gitignore)?;
    }
    Ok(())
}

async fn goal_command(store: &CozoStateStore, command: GoalCommand) -> Result<()> {
    match command {
        GoalCommand::Add {
            description,
            priority,
        } => {
            let goal = store.add_goal(&description, priority).await?;
            println!("{} {} [{}]", "Added goal".green(), goal.id.bold(), goal.priority);
        }
        GoalCommand::Done { id } => {
            if store.complete_goal(&id).await? {
                println!("{} {}", "Completed goal".green(), id.bold());
            } else {
                bail!("no open goal with id {}", id);
            }
        }
        GoalCommand::List { all } => {
            let goals = if all {
                store.goals().await?
            } else {
                store.open_goals().await?
            };
            if goals.is_empty() {
                println!("{}", "No goals.".yellow());
            }
            for goal in goals {
                let status = if goal.is_open() {
                    "open".cyan()
                } else {
                    "done".dimmed()
                };
                println!(
                    "{}  {:<8}  {:<4}  {}",
                    goal.id.bold(),
                    goal.priority.to_string(),
                    status,
                    goal.description
                );
            }
        }
    }
    Ok(())
}

async fn print_log(store: &CozoStateStore, count: usize) -> Result<()> {
    let records = store.recent(count).await?;
    if records.is_empty() {
        println!("{}", "No cycles recorded yet.".yellow());
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &CycleRecord) {
    let decision = &record.decision;
    let disposition = match decision.disposition {
        Disposition::Act => "act".green().bold(),
        Disposition::Investigate => "investigate".yellow(),
        Disposition::Wait => "wait".dimmed(),
    };
    println!(
        "#{} {} {} ({:.2}) {}",
        record.cycle,
        record.at.format("%Y-%m-%d %H:%M:%S"),
        disposition,
        decision.confidence,
        decision.reasoning
    );
    if let Some(action) = &decision.action {
        println!("     {} {}: {}", "->".cyan(), action.kind, action.description);
    }
    if let Some(exec) = &record.execution {
        let status = if exec.success {
            "ok".green()
        } else {
            exec.outcome.to_string().red()
        };
        print!("     {} in {:.1}s", status, exec.duration.as_secs_f64());
        if let Some(code) = exec.exit_code {
            print!(" (exit {})", code);
        }
        if exec.output_truncated {
            print!(" [truncated]");
        }
        println!();
        if let Some(err) = &exec.error {
            println!("     {}", err.lines().next().unwrap_or_default().red());
        }
    }
}
