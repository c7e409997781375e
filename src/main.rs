mod executor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cascade_core::catalog::RoleCatalog;
use cascade_core::config::AppConfig;
use cascade_core::event::EventBus;
use cascade_core::traits::RoleExecutor;
use cascade_core::types::{TaskSpec, WorkflowEvent, WorkflowId, WorkflowStatus};

use cascade_engine::{CheckpointStore, DependencyAnalyzer, RunLogger, WorkflowEngine};

use executor::ShellRoleExecutor;

#[derive(Parser)]
#[command(name = "cascade", version, about = "Waterfall multi-role workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cascade.toml", env = "CASCADE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task through a role sequence
    Run {
        /// Comma-separated role sequence, e.g. planner,coder,tester
        #[arg(short, long, value_delimiter = ',')]
        roles: Vec<String>,
        /// Admission priority, 1 (lowest) to 10
        #[arg(short, long)]
        priority: Option<u8>,
        /// Extra requirement passed to every role (repeatable)
        #[arg(long = "require")]
        requirements: Vec<String>,
        /// Shell command that executes a role (overrides config)
        #[arg(long)]
        executor: Option<String>,
        /// Task description
        #[arg(trailing_var_arg = true, required = true)]
        task: Vec<String>,
    },
    /// Check a role sequence against the dependency graph
    Validate {
        #[arg(short, long, value_delimiter = ',')]
        roles: Vec<String>,
    },
    /// Show critical roles, suggested order and parallel groups
    Plan {
        #[arg(short, long, value_delimiter = ',')]
        roles: Vec<String>,
    },
    /// Show what a role failure would do to the rest of a sequence
    Impact {
        #[arg(short, long, value_delimiter = ',')]
        roles: Vec<String>,
        /// The role assumed to fail
        #[arg(short, long)]
        failed: String,
    },
    /// List catalog roles and their dependencies
    Roles,
    /// List stored checkpoints
    Checkpoints {
        /// Include finished workflows
        #[arg(long)]
        all: bool,
        /// Delete the checkpoint of this workflow
        #[arg(long)]
        delete: Option<String>,
    },
    /// Resume a paused or interrupted workflow from its checkpoint
    Resume {
        workflow_id: String,
        #[arg(long)]
        executor: Option<String>,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cascade=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "cascade", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let catalog = Arc::new(RoleCatalog::builtin_with(config.roles.clone()));

    match cli.command {
        Commands::Run {
            roles,
            priority,
            requirements,
            executor,
            task,
        } => {
            let mut task_spec = TaskSpec::new(task.join(" "))
                .with_priority(priority.unwrap_or(config.engine.default_priority));
            for r in requirements {
                task_spec = task_spec.with_requirement(r);
            }
            let role_executor = build_executor(&config, executor)?;
            let (engine, bus) = build_engine(&config, catalog, role_executor)?;

            let wf = engine.create_workflow(task_spec, roles)?;
            if wf.sequence_adjusted {
                eprintln!("[sequence adjusted: {}]", wf.roles.join(" -> "));
            }
            let status = drive(&engine, &bus, &config, &wf.id, false).await?;
            finish(status)
        }
        Commands::Resume {
            workflow_id,
            executor,
        } => {
            let store = open_checkpoints(&config)?
                .ok_or_else(|| anyhow::anyhow!("checkpointing is disabled in config"))?;
            let saved = store
                .load(&workflow_id)
                .map_err(anyhow::Error::msg)?
                .ok_or_else(|| anyhow::anyhow!("no checkpoint for workflow {}", workflow_id))?;
            if saved.status.is_terminal() {
                anyhow::bail!("workflow {} already finished ({})", workflow_id, saved.status);
            }

            let role_executor = build_executor(&config, executor)?;
            let (engine, bus) = build_engine(&config, catalog, role_executor)?;
            let created = saved.status == WorkflowStatus::Created;
            let id = engine.restore(saved)?;
            let status = drive(&engine, &bus, &config, &id, !created).await?;
            finish(status)
        }
        Commands::Validate { roles } => {
            let analyzer = analyzer(&config, catalog);
            let validation = analyzer.validate_sequence(&roles);
            for e in &validation.errors {
                println!("error: {}", e);
            }
            for w in &validation.warnings {
                println!("warning: {}", w);
            }
            if validation.only_order_errors() {
                println!(
                    "suggested order: {}",
                    analyzer.adjust_sequence(&roles).join(" -> ")
                );
            }
            if validation.is_valid() {
                println!("ok: {}", roles.join(" -> "));
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        Commands::Plan { roles } => {
            let analysis = analyzer(&config, catalog).analyze_critical_path(&roles);
            println!("Critical:  {}", analysis.critical.join(", "));
            println!("Optional:  {}", analysis.optional.join(", "));
            println!("Order:     {}", analysis.execution_order.join(" -> "));
            for (i, group) in analysis.parallel_groups.iter().enumerate() {
                println!("Stage {}:   {}", i + 1, group.join(", "));
            }
            for v in &analysis.violations {
                println!("violation: {}", v);
            }
            Ok(())
        }
        Commands::Impact { roles, failed } => {
            let analyzer = analyzer(&config, catalog);
            let remaining: Vec<String> = match roles.iter().position(|r| *r == failed) {
                Some(i) => roles[i + 1..].to_vec(),
                None => anyhow::bail!("role '{}' is not in the sequence", failed),
            };
            let impact = analyzer.assess_failure_impact(&failed, &remaining);
            println!("{}", serde_json::to_string_pretty(&impact)?);
            for path in analyzer.alternative_paths(&failed, &roles) {
                println!("alternative: {}", path.join(" -> "));
            }
            Ok(())
        }
        Commands::Roles => {
            print!("{}", analyzer(&config, catalog).render());
            Ok(())
        }
        Commands::Checkpoints { all, delete } => {
            let store = open_checkpoints(&config)?
                .ok_or_else(|| anyhow::anyhow!("checkpointing is disabled in config"))?;
            if let Some(id) = delete {
                let removed = store.delete(&id).map_err(anyhow::Error::msg)?;
                println!("deleted {} checkpoint(s)", removed);
                return Ok(());
            }
            let list = if all {
                store.list()
            } else {
                store.list_resumable()
            }
            .map_err(anyhow::Error::msg)?;
            if list.is_empty() {
                println!("No checkpoints.");
            }
            for c in list {
                println!(
                    "{}  {:<9} {:>5}  {}  {}",
                    c.workflow_id,
                    c.status,
                    c.progress,
                    c.updated_at.format("%Y-%m-%d %H:%M"),
                    truncate(&c.description, 60)
                );
            }
            Ok(())
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".cascade").join("config.toml"));
    match home_config {
        Some(p) if p.exists() => {
            info!(path = %p.display(), "Loading config from home directory");
            Ok(AppConfig::load(&p)?)
        }
        _ => {
            warn!(path = %path.display(), "No config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

fn analyzer(config: &AppConfig, catalog: Arc<RoleCatalog>) -> DependencyAnalyzer {
    DependencyAnalyzer::new(catalog).with_similarity_threshold(config.recovery.similarity_threshold)
}

fn build_executor(
    config: &AppConfig,
    command: Option<String>,
) -> anyhow::Result<Arc<dyn RoleExecutor>> {
    let executor = match (command, &config.executor) {
        (Some(cmd), cfg) => ShellRoleExecutor::new(
            cmd,
            cfg.as_ref().map(|c| c.timeout_secs).unwrap_or(600),
        ),
        (None, Some(cfg)) => ShellRoleExecutor::from_config(cfg),
        (None, None) => anyhow::bail!("no role executor: pass --executor or set [executor] in config"),
    };
    Ok(Arc::new(executor))
}

fn open_checkpoints(config: &AppConfig) -> anyhow::Result<Option<Arc<CheckpointStore>>> {
    match config.checkpoint_path() {
        Some(path) => Ok(Some(Arc::new(
            CheckpointStore::open(&path).map_err(anyhow::Error::msg)?,
        ))),
        None => Ok(None),
    }
}

fn build_engine(
    config: &AppConfig,
    catalog: Arc<RoleCatalog>,
    executor: Arc<dyn RoleExecutor>,
) -> anyhow::Result<(Arc<WorkflowEngine>, Arc<EventBus>)> {
    if config.recovery.llm_enabled {
        warn!("recovery.llm_enabled is set but no LLM client is configured for the CLI");
    }
    let bus = Arc::new(EventBus::default());
    let mut engine =
        WorkflowEngine::from_config(config, catalog, executor, None)?.with_event_bus(bus.clone());
    if let Some(store) = open_checkpoints(config)? {
        engine = engine.with_checkpoints(store);
    }
    Ok((Arc::new(engine), bus))
}

/// Start or resume a workflow, print its progress and wait for it to stop.
async fn drive(
    engine: &Arc<WorkflowEngine>,
    bus: &Arc<EventBus>,
    config: &AppConfig,
    id: &WorkflowId,
    resume: bool,
) -> anyhow::Result<WorkflowStatus> {
    let cancel = CancellationToken::new();
    if let Some(log_dir) = config.log_dir() {
        let level = config.log.as_ref().map(|l| l.level).unwrap_or(2);
        let logger = RunLogger::new(log_dir, level);
        tokio::spawn(logger.run(bus.clone(), id.clone(), cancel.clone()));
    }

    let mut rx = bus.subscribe();
    let printer_id = id.clone();
    let print_handle = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if event.workflow_id() != &printer_id {
                continue;
            }
            match &event {
                WorkflowEvent::RoleStarted { role, index, .. } => {
                    eprintln!("[{}] {} started", index + 1, role)
                }
                WorkflowEvent::RoleCompleted {
                    role, elapsed_ms, ..
                } => eprintln!("    {} done in {}ms", role, elapsed_ms),
                WorkflowEvent::RoleFailed { role, error, .. } => {
                    eprintln!("    {} FAILED: {}", role, truncate(error, 200))
                }
                WorkflowEvent::HandoffCreated { from, to, score, .. } => {
                    eprintln!("    handoff {} -> {} (score {:.2})", from, to, score)
                }
                WorkflowEvent::RecoveryDecided {
                    role,
                    action,
                    automatic,
                    ..
                } => eprintln!(
                    "    recovery for {}: {}{}",
                    role,
                    action,
                    if *automatic { "" } else { " (manual)" }
                ),
                WorkflowEvent::Paused { reason, .. } => eprintln!("[paused] {}", reason),
                _ => {}
            }
            if event.is_terminal() {
                break;
            }
        }
    });

    let started = if resume {
        engine.resume(id)
    } else {
        engine.start(id)
    };
    if !started {
        print_handle.abort();
        cancel.cancel();
        let errors = engine
            .snapshot(id)
            .map(|wf| {
                wf.error_log
                    .iter()
                    .map(|e| e.message.clone())
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default();
        anyhow::bail!("workflow {} could not start: {}", id, errors);
    }

    // Ctrl-C pauses; the checkpoint keeps the workflow resumable
    let status = tokio::select! {
        status = engine.wait(id) => status,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n[interrupt] pausing after the current role...");
            engine.pause(id);
            engine.wait(id).await
        }
    };
    let status = status.ok_or_else(|| anyhow::anyhow!("workflow {} disappeared", id))?;

    if status != WorkflowStatus::Paused {
        print_handle.await.ok();
    } else {
        print_handle.abort();
    }
    cancel.cancel();

    if let Some(summary) = engine.get_status(id) {
        println!(
            "{} {} ({}, {} error(s))",
            summary.id, summary.status, summary.progress, summary.errors
        );
    }
    if let Some(wf) = engine.snapshot(id) {
        if let Some(p) = &wf.pending_intervention {
            println!("waiting on '{}': {}", p.role, p.reason);
        }
        if status == WorkflowStatus::Paused {
            println!("resume with: cascade resume {}", id);
        }
    }
    Ok(status)
}

fn finish(status: WorkflowStatus) -> anyhow::Result<()> {
    match status {
        WorkflowStatus::Completed => Ok(()),
        WorkflowStatus::Paused => std::process::exit(2),
        _ => std::process::exit(1),
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
