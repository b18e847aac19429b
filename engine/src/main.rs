use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tandem_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use tandem_orchestrator::{
    ArtifactStore, ConfigLoader, EnvSecretStore, OrchestratorError, RunRegistry, RunSnapshot,
    RunStatus, ScriptedGenerator,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tandem-orch")]
#[command(about = "Plan, approve and execute multi-agent runs against a local workspace")]
struct Cli {
    /// Where run artifacts and logs are kept (defaults to `<workspace>/.tandem/orchestrator`)
    #[arg(long, global = true)]
    state_dir: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan a run and optionally approve and execute it
    Run {
        objective: String,
        #[arg(long, default_value = ".")]
        workspace: String,
        /// JSON file of canned responses per agent role
        #[arg(long)]
        script: String,
        /// JSON or YAML config file
        #[arg(long)]
        config: Option<String>,
        /// Approve the plan and every staged write as soon as they are ready
        #[arg(long, default_value_t = false)]
        approve: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    List,
    Show {
        run_id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Events {
        run_id: String,
    },
    Delete {
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let workspace_hint = match &cli.command {
        Command::Run { workspace, .. } => PathBuf::from(workspace),
        _ => PathBuf::from("."),
    };
    let state_dir = resolve_state_dir(cli.state_dir.clone(), &workspace_hint);
    let logs_dir = canonical_logs_dir_from_root(&state_dir);
    let console = !matches!(
        cli.command,
        Command::Run { json: true, .. } | Command::Show { json: true, .. } | Command::Events { .. }
    );
    let (_log_guard, log_info) = init_process_logging(ProcessKind::Cli, &logs_dir, 14, console)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Cli,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "cli.main",
            status: Some("ok"),
            detail: Some("cli jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("cli logging initialized: {:?}", log_info);

    let store = Arc::new(
        ArtifactStore::new(&state_dir)
            .with_context(|| format!("opening state dir {}", state_dir.display()))?,
    );

    match cli.command {
        Command::Run {
            objective,
            workspace,
            script,
            config,
            approve,
            json,
        } => {
            let generator = ScriptedGenerator::from_file(Path::new(&script))
                .with_context(|| format!("loading scripted responses from {}", script))?;
            let config = load_config(config.as_deref())?;
            let registry = RunRegistry::new(store, Arc::new(generator), Arc::new(EnvSecretStore))
                .with_defaults(config)
                .with_process_kind(ProcessKind::Cli);

            let workspace = std::fs::canonicalize(&workspace)
                .with_context(|| format!("workspace {} does not exist", workspace))?;
            let run_id = registry.create_run(objective, workspace, None).await?;
            registry.start(&run_id).await?;

            if approve && registry.snapshot(&run_id).await?.status == RunStatus::AwaitingApproval {
                let review = registry.plan_review(&run_id).await?;
                let mut events = registry.subscribe(&run_id).await?;
                let driving = registry.approve_plan(&run_id, &review);
                tokio::pin!(driving);
                loop {
                    tokio::select! {
                        result = &mut driving => {
                            result?;
                            break;
                        }
                        event = events.recv() => match event {
                            Ok(record) if record.event_type == "task.awaiting_approval" => {
                                approve_staged(&registry, &run_id).await?;
                            }
                            Ok(_) => {}
                            Err(RecvError::Lagged(_)) => approve_staged(&registry, &run_id).await?,
                            Err(RecvError::Closed) => {
                                (&mut driving).await?;
                                break;
                            }
                        }
                    }
                }
            } else if !approve && !json {
                let review = registry.plan_review(&run_id).await?;
                println!("{}", review.content);
                println!("Plan hash: {}", review.content_hash);
            }

            print_snapshot(&registry.snapshot(&run_id).await?, json)?;
        }
        Command::List => {
            for run in store.list_runs()? {
                println!(
                    "{}  {:<18}  {}  {}",
                    run.run_id,
                    run.status.as_str(),
                    run.created_at.format("%Y-%m-%d %H:%M"),
                    run.objective
                );
            }
        }
        Command::Show { run_id, json } => {
            ArtifactStore::validate_run_id(&run_id)?;
            if !store.run_exists(&run_id) {
                anyhow::bail!("run {} not found", run_id);
            }
            let run = store.recover_run(&run_id)?;
            print_snapshot(&run.to_snapshot(), json)?;
        }
        Command::Events { run_id } => {
            ArtifactStore::validate_run_id(&run_id)?;
            if !store.run_exists(&run_id) {
                anyhow::bail!("run {} not found", run_id);
            }
            for record in store.load_events(&run_id)? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Delete { run_id } => {
            ArtifactStore::validate_run_id(&run_id)?;
            if !store.run_exists(&run_id) {
                anyhow::bail!("run {} not found", run_id);
            }
            store.delete_run(&run_id)?;
            println!("Deleted {}", run_id);
        }
    }

    Ok(())
}

/// Approve and apply whatever is staged. Retries when another write lands
/// between listing and approval.
async fn approve_staged(registry: &RunRegistry, run_id: &str) -> anyhow::Result<()> {
    loop {
        let ids: Vec<String> = registry
            .list_staged(run_id)
            .await?
            .into_iter()
            .map(|op| op.id)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let record = match registry.approve_batch(run_id, &ids).await {
            Ok(record) => record,
            Err(OrchestratorError::ApprovalDrift(reason)) => {
                warn!(run_id, %reason, "staged set changed, approving again");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        match registry.execute_approved_batch(run_id, &record).await {
            Ok(outcome) => {
                info!(
                    run_id,
                    approval_id = %outcome.approval_id,
                    operations = outcome.results.len(),
                    "applied staged writes"
                );
                return Ok(());
            }
            Err(OrchestratorError::ApprovalDrift(reason)) => {
                warn!(run_id, %reason, "staged set changed before execution, approving again");
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<tandem_orchestrator::OrchestratorConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = path {
        loader = loader
            .with_file(Path::new(path))
            .with_context(|| format!("reading config {}", path))?;
    }
    Ok(loader.with_env().load()?)
}

fn resolve_state_dir(flag: Option<String>, workspace: &Path) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("TANDEM_ORCH_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    workspace
        .join(tandem_orchestrator::store::ARTIFACT_DIR_NAME)
        .join("orchestrator")
}

fn print_snapshot(snapshot: &RunSnapshot, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }
    println!("Run {} [{}]", snapshot.run_id, snapshot.status.as_str());
    println!("Objective: {}", snapshot.objective);
    if let Some(err) = &snapshot.error_message {
        println!("Reason: {}", err);
    }
    for task in &snapshot.tasks {
        println!("  {:<10} {:?}  {}", task.id, task.state, task.title);
    }
    let budget = &snapshot.budget;
    println!(
        "Tokens: {}/{}  Iterations: {}/{}  Subagent runs: {}/{}",
        budget.tokens_used,
        budget.max_tokens,
        budget.iterations_used,
        budget.max_iterations,
        budget.subagent_runs_used,
        budget.max_subagent_runs
    );
    Ok(())
}
