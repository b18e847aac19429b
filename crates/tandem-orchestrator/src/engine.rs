// Orchestrator Engine
// Drives one run through planning, approval, parallel task execution and its
// terminal state. All public entry points are safe to call from any task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use tandem_observability::{
    emit_event as emit_obs_event, scrub_secrets, ObservabilityEvent, ProcessKind,
};

use crate::agents::{
    estimate_tokens, AgentPrompts, Generation, GenerationRequest, Generator, PlannerConstraints,
    ResearcherConstraints, RoleTemplate, ToolCall,
};
use crate::budget::{BudgetController, BudgetExceeded, BudgetKind, BudgetLedger, BudgetStatus, FixLoopBudget};
use crate::config::{CompletionPolicy, OrchestratorConfig};
use crate::error::{OrchestratorError, Result};
use crate::events::EventBus;
use crate::locks::ResourceLimits;
use crate::policy::{PolicyAction, PolicyGate, RequestedAction};
use crate::scheduler::TaskScheduler;
use crate::secrets::{redact_secret_fields, scrub_prompt, SecretStore};
use crate::staging::{
    content_hash, ApprovalRecord, BatchOutcome, OperationExecutor, OperationKind, StagedOperation,
    StagingStore,
};
use crate::store::ArtifactStore;
use crate::types::{
    AgentRole, ApprovalScope, Artifact, ArtifactType, OrchestratorEvent, Run, RunEventRecord,
    RunSnapshot, RunStatus, Task, TaskState, ValidationResult,
};
use crate::workspace::Workspace;

#[cfg(test)]
type TestTaskExecutor =
    Arc<dyn Fn(RunEngine, Task) -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync>;

/// Everything a reviewer needs to approve a plan. Approving binds to exactly
/// this content and these operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReview {
    pub run_id: String,
    pub content: String,
    pub tasks: Vec<Task>,
    pub operations: Vec<StagedOperation>,
    pub content_hash: String,
}

impl PlanReview {
    pub fn operation_ids(&self) -> Vec<String> {
        self.operations.iter().map(|op| op.id.clone()).collect()
    }
}

enum StopReason {
    Cancelled,
    Paused,
    Budget(BudgetExceeded),
}

/// What a builder attempt did to the workspace
#[derive(Default)]
struct ChangeSet {
    lines: Vec<String>,
    patch: String,
}

impl ChangeSet {
    fn record(&mut self, operation: &StagedOperation, disposition: &str) {
        self.lines
            .push(format!("- {} ({})", scrub_secrets(&operation.diff_summary()), disposition));
        self.patch.push_str(&operation.render_patch());
    }

    fn summary(&self) -> String {
        if self.lines.is_empty() {
            "No file changes were made.".to_string()
        } else {
            self.lines.join("\n")
        }
    }
}

/// Engine for one orchestration run
#[derive(Clone)]
pub struct RunEngine {
    run_id: String,
    config: Arc<OrchestratorConfig>,
    run: Arc<RwLock<Run>>,
    budget: Arc<Mutex<BudgetController>>,
    gate: Arc<PolicyGate>,
    staging: Arc<StagingStore>,
    workspace: Workspace,
    limits: Arc<ResourceLimits>,
    store: Arc<ArtifactStore>,
    bus: EventBus,
    generator: Arc<dyn Generator>,
    secrets: Arc<dyn SecretStore>,
    cancel_token: CancellationToken,
    pause_tx: Arc<watch::Sender<bool>>,
    /// Last assigned event sequence number; also serializes emission
    event_seq: Arc<Mutex<u64>>,
    /// Held by whichever call is currently driving planning or execution
    drive_lock: Arc<Mutex<()>>,
    /// Policy refusals per task, fed back into the next builder prompt
    restrictions: Arc<Mutex<HashMap<String, Vec<String>>>>,
    /// Staged writes a reviewer unstaged or rejected, keyed by proposing task
    withdrawn: Arc<Mutex<HashMap<String, Vec<String>>>>,
    /// Wakes the execution loop when staged operations are executed or withdrawn
    staged_release: Arc<Notify>,
    process: ProcessKind,
    #[cfg(test)]
    test_task_executor: Option<TestTaskExecutor>,
}

impl RunEngine {
    pub fn new(
        run: Run,
        store: Arc<ArtifactStore>,
        generator: Arc<dyn Generator>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let run_id = run.run_id.clone();
        let config = Arc::new(run.config.clone());
        let limits = Arc::new(ResourceLimits::from_config(&config));
        let workspace = Workspace::new(run.workspace_root.clone()).with_limits(limits.clone());
        let gate = PolicyGate::new(workspace.root().to_path_buf(), &config);
        let budget = BudgetController::from_ledger(run.budget.clone(), config.budget_warning_threshold);
        let last_seq = store
            .latest_event_seq(&run_id)
            .unwrap_or(0)
            .max(run.last_event_seq);
        let (pause_tx, _) = watch::channel(run.status == RunStatus::Paused);
        let staging = if run.tasks.is_empty() {
            StagingStore::new()
        } else {
            StagingStore::with_plan_content(render_plan(&run.tasks))
        };

        Self {
            run_id,
            config,
            run: Arc::new(RwLock::new(run)),
            budget: Arc::new(Mutex::new(budget)),
            gate: Arc::new(gate),
            staging: Arc::new(staging),
            workspace,
            limits,
            store,
            bus: EventBus::new(),
            generator,
            secrets,
            cancel_token: CancellationToken::new(),
            pause_tx: Arc::new(pause_tx),
            event_seq: Arc::new(Mutex::new(last_seq)),
            drive_lock: Arc::new(Mutex::new(())),
            restrictions: Arc::new(Mutex::new(HashMap::new())),
            withdrawn: Arc::new(Mutex::new(HashMap::new())),
            staged_release: Arc::new(Notify::new()),
            process: ProcessKind::Service,
            #[cfg(test)]
            test_task_executor: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_process_kind(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_test_task_executor<F, Fut>(mut self, executor: F) -> Self
    where
        F: Fn(RunEngine, Task) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        use futures::FutureExt;
        self.test_task_executor = Some(Arc::new(move |engine: RunEngine, task: Task| {
            executor(engine, task).boxed()
        }));
        self
    }

    /// Persist a freshly created run and announce it
    pub async fn register(&self) -> Result<()> {
        self.store.create_run_dir(&self.run_id)?;
        self.persist(None).await?;
        let objective = self.run.read().await.objective.clone();
        self.emit_event(OrchestratorEvent::RunCreated {
            run_id: self.run_id.clone(),
            objective,
            timestamp: Utc::now(),
        })
        .await;
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEventRecord> {
        self.bus.subscribe()
    }

    pub async fn status(&self) -> RunStatus {
        self.run.read().await.status
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        self.sync_budget().await;
        self.run.read().await.to_snapshot()
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.run.read().await.tasks.clone()
    }

    pub async fn budget(&self) -> BudgetLedger {
        self.sync_budget().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn sync_budget(&self) -> BudgetLedger {
        let ledger = self.budget.lock().await.snapshot();
        self.run.write().await.budget = ledger.clone();
        ledger
    }

    // ========================================================================
    // Planning
    // ========================================================================

    /// Idle -> Planning -> AwaitingApproval
    pub async fn start(&self) -> Result<()> {
        let _drive = self.drive_lock.lock().await;
        let status = self.status().await;
        if status != RunStatus::Idle {
            return Err(OrchestratorError::InvalidOperation(format!(
                "Run cannot start from {}",
                status.as_str()
            )));
        }
        self.run_planning_phase().await
    }

    async fn run_planning_phase(&self) -> Result<()> {
        let (objective, feedback) = {
            let mut run = self.run.write().await;
            run.status = RunStatus::Planning;
            run.error_message = None;
            (run.objective.clone(), run.revision_feedback.clone())
        };
        self.budget.lock().await.set_active(true);
        self.emit_event(OrchestratorEvent::PlanningStarted {
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
        })
        .await;

        let summary = self.workspace.summary().await;
        let constraints = PlannerConstraints {
            max_tasks: self.config.max_tasks,
            research_enabled: self.config.enable_research,
        };
        let body = AgentPrompts::build_planner_prompt(&objective, &summary, &constraints, feedback.as_deref());

        let generation = match self.call_agent(self.prepare_request(AgentRole::Planner, &body)).await {
            Ok(generation) => generation,
            Err(OrchestratorError::BudgetExceeded(exceeded)) => {
                return self.handle_budget_exceeded(exceeded).await;
            }
            Err(e) => {
                let err = OrchestratorError::PlanningFailed(e.to_string());
                self.handle_failure(&err.to_string()).await?;
                return Err(err);
            }
        };

        if self.is_cancelled() {
            return self.handle_cancellation().await;
        }

        let allow_fallback = self.config.allow_prose_fallback || !self.config.strict_planner_json;
        let parsed = AgentPrompts::parse_task_list(&generation.text, allow_fallback).and_then(|parsed| {
            let tasks: Vec<Task> = parsed
                .into_iter()
                .map(Task::from)
                .map(|mut task| {
                    if !self.config.enable_research {
                        task.assigned_role = AgentRole::Builder;
                    }
                    task
                })
                .collect();
            TaskScheduler::validate(&tasks, self.config.max_tasks)?;
            Ok(tasks)
        });
        let tasks = match parsed {
            Ok(tasks) => tasks,
            Err(err) => {
                self.handle_failure(&err.to_string()).await?;
                return Err(err);
            }
        };

        let content = render_plan(&tasks);
        self.staging.set_plan_content(content.clone()).await;
        {
            let mut run = self.run.write().await;
            run.tasks = tasks.clone();
            run.revision_feedback = None;
            if run.status == RunStatus::Paused {
                // paused mid-planning; resume lands on the review
                run.paused_from = Some(RunStatus::AwaitingApproval);
            } else {
                run.status = RunStatus::AwaitingApproval;
            }
        }
        self.budget.lock().await.set_active(false);

        tracing::info!(run_id = %self.run_id, task_count = tasks.len(), "Plan generated");
        self.emit_event(OrchestratorEvent::PlanGenerated {
            run_id: self.run_id.clone(),
            task_count: tasks.len(),
            tasks,
            timestamp: Utc::now(),
        })
        .await;

        let operations = self.staging.list().await;
        self.emit_event(OrchestratorEvent::ApprovalRequested {
            run_id: self.run_id.clone(),
            scope: ApprovalScope::Plan,
            content_hash: content_hash(&content, &operations),
            operation_count: operations.len(),
            reason: "Plan ready for review".to_string(),
            timestamp: Utc::now(),
        })
        .await;
        Ok(())
    }

    /// The plan under review plus the initial staged write set
    pub async fn plan_review(&self) -> Result<PlanReview> {
        let tasks = {
            let run = self.run.read().await;
            if run.status != RunStatus::AwaitingApproval {
                return Err(OrchestratorError::InvalidOperation(
                    "Run is not awaiting approval".to_string(),
                ));
            }
            run.tasks.clone()
        };
        let content = self.staging.plan_content().await;
        let operations = self.staging.list().await;
        Ok(PlanReview {
            run_id: self.run_id.clone(),
            content_hash: content_hash(&content, &operations),
            content,
            tasks,
            operations,
        })
    }

    /// Approve whatever is currently under review and execute the plan
    pub async fn approve(&self) -> Result<()> {
        let review = self.plan_review().await?;
        self.approve_plan(&review).await
    }

    /// Approve exactly `review`. Fails with approval drift if the plan or the
    /// staged set changed after it was produced; the run then stays in review.
    /// Returns once the run stops executing (terminal or paused).
    pub async fn approve_plan(&self, review: &PlanReview) -> Result<()> {
        let _drive = self.drive_lock.lock().await;
        if self.status().await != RunStatus::AwaitingApproval {
            return Err(OrchestratorError::InvalidOperation(
                "Run is not awaiting approval".to_string(),
            ));
        }

        let content = self.staging.plan_content().await;
        let operations = self.staging.list().await;
        if content != review.content || content_hash(&content, &operations) != review.content_hash {
            return Err(OrchestratorError::ApprovalDrift(
                "plan or staged operations changed since review".to_string(),
            ));
        }

        let approved = self
            .staging
            .approve_and_execute(
                &self.run_id,
                &review.content,
                &review.operation_ids(),
                &self.workspace,
                Some(&self.cancel_token),
            )
            .await;
        let (record, outcome) = match approved {
            Ok(approved) => approved,
            Err(err) => {
                tracing::warn!(run_id = %self.run_id, "Plan approval refused: {}", err);
                return Err(err);
            }
        };
        {
            let mut run = self.run.write().await;
            run.plan_approval = Some(record.clone());
            run.status = RunStatus::Executing;
        }
        self.emit_event(OrchestratorEvent::ApprovalGranted {
            run_id: self.run_id.clone(),
            scope: ApprovalScope::Plan,
            approval_id: record.approval_id.clone(),
            timestamp: Utc::now(),
        })
        .await;
        if !outcome.results.is_empty() {
            self.report_batch(&outcome).await;
        }

        self.run_execution_loop().await
    }

    /// AwaitingApproval -> RevisionRequested -> Planning
    pub async fn request_revision(&self, feedback: impl Into<String>) -> Result<()> {
        let _drive = self.drive_lock.lock().await;
        let feedback = feedback.into();
        {
            let mut run = self.run.write().await;
            if run.status != RunStatus::AwaitingApproval {
                return Err(OrchestratorError::InvalidOperation(
                    "Run is not awaiting approval".to_string(),
                ));
            }
            run.status = RunStatus::RevisionRequested;
            run.revision_feedback = Some(feedback.clone());
        }
        self.emit_event(OrchestratorEvent::RevisionRequested {
            run_id: self.run_id.clone(),
            feedback,
            timestamp: Utc::now(),
        })
        .await;
        self.run_planning_phase().await
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Suspend scheduling. In-flight tasks finish; nothing new is dispatched.
    pub async fn pause(&self) -> Result<()> {
        let from = {
            let mut run = self.run.write().await;
            if run.status.is_terminal() {
                return Err(OrchestratorError::InvalidOperation(format!(
                    "Run is already {}",
                    run.status.as_str()
                )));
            }
            if run.status == RunStatus::Paused {
                return Ok(());
            }
            self.pause_tx.send_replace(true);
            if run.status == RunStatus::Executing {
                // the execution loop parks the run once in-flight tasks settle
                return Ok(());
            }
            let from = run.status;
            run.paused_from = Some(from);
            run.status = RunStatus::Paused;
            from
        };
        self.budget.lock().await.set_active(false);
        self.emit_event(OrchestratorEvent::RunPaused {
            run_id: self.run_id.clone(),
            from,
            timestamp: Utc::now(),
        })
        .await;
        Ok(())
    }

    /// Re-enter the state the run was paused from, re-checking budgets first
    pub async fn resume(&self) -> Result<()> {
        let _drive = self.drive_lock.lock().await;
        let to = {
            let run = self.run.read().await;
            if run.status != RunStatus::Paused {
                return Err(OrchestratorError::InvalidOperation("Run is not paused".to_string()));
            }
            run.paused_from.unwrap_or(if run.tasks.is_empty() {
                RunStatus::Planning
            } else {
                RunStatus::Executing
            })
        };

        let revalidated = self.budget.lock().await.revalidate();
        if let Err(exceeded) = revalidated {
            return self.handle_budget_exceeded(exceeded).await;
        }

        self.pause_tx.send_replace(false);
        {
            let mut run = self.run.write().await;
            run.status = to;
            run.paused_from = None;
            run.error_message = None;
        }
        self.emit_event(OrchestratorEvent::RunResumed {
            run_id: self.run_id.clone(),
            to,
            timestamp: Utc::now(),
        })
        .await;

        match to {
            RunStatus::Executing => self.run_execution_loop().await,
            RunStatus::Idle | RunStatus::Planning | RunStatus::RevisionRequested => {
                self.run_planning_phase().await
            }
            _ => Ok(()),
        }
    }

    /// Request cancellation. The driving call finalizes the run once in-flight
    /// work reaches a safe point.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Request cancellation and wait until the run is in `Cancelled` (or
    /// another terminal state it reached first)
    pub async fn cancel_and_finalize(&self) -> Result<()> {
        self.cancel();
        let _drive = self.drive_lock.lock().await;
        if self.status().await.is_terminal() {
            return Ok(());
        }
        self.handle_cancellation().await
    }

    // ========================================================================
    // Staged operations
    // ========================================================================

    /// Stage an operation for later batch approval
    pub async fn stage_operation(&self, mut operation: StagedOperation) -> Result<String> {
        if self.status().await.is_terminal() {
            return Err(OrchestratorError::InvalidOperation(
                "Cannot stage operations on a finished run".to_string(),
            ));
        }
        if operation.kind != OperationKind::ShellCommand {
            self.workspace.resolve(&operation.target)?;
            if operation.before_snapshot.is_none() {
                operation.before_snapshot = self.workspace.snapshot(&operation.target).await.ok();
            }
        }

        let description = scrub_secrets(&operation.diff_summary());
        let task_id = operation.origin.clone();
        let operation_id = self.staging.stage(operation).await;
        self.emit_event(OrchestratorEvent::OperationStaged {
            run_id: self.run_id.clone(),
            task_id,
            operation_id: operation_id.clone(),
            description: description.clone(),
            timestamp: Utc::now(),
        })
        .await;

        let content = self.staging.plan_content().await;
        let operations = self.staging.list().await;
        self.emit_event(OrchestratorEvent::ApprovalRequested {
            run_id: self.run_id.clone(),
            scope: ApprovalScope::Batch,
            content_hash: content_hash(&content, &operations),
            operation_count: operations.len(),
            reason: format!("{} awaits approval", description),
            timestamp: Utc::now(),
        })
        .await;
        Ok(operation_id)
    }

    pub async fn list_staged(&self) -> Vec<StagedOperation> {
        self.staging.list().await
    }

    pub async fn unstage(&self, operation_id: &str) -> Option<StagedOperation> {
        let operation = self.staging.remove(operation_id).await?;
        self.withdraw(&operation, "was unstaged").await;
        Some(operation)
    }

    /// Turn down one staged operation. A task waiting on it is retried with
    /// the rejection in its prompt.
    pub async fn reject_staged(&self, operation_id: &str, reason: &str) -> Option<StagedOperation> {
        let operation = self.staging.reject(operation_id).await?;
        self.withdraw(&operation, &format!("was rejected: {}", reason)).await;
        Some(operation)
    }

    pub async fn clear_staged(&self) -> Vec<StagedOperation> {
        let cleared = self.staging.clear().await;
        for operation in &cleared {
            self.withdraw(operation, "was cleared").await;
        }
        cleared
    }

    /// Note a withdrawn write against the task that proposed it, if that task
    /// is still running or waiting on it
    async fn withdraw(&self, operation: &StagedOperation, what: &str) {
        let Some(task_id) = operation.origin.clone() else {
            return;
        };
        let waiting = self.run.read().await.task(&task_id).is_some_and(|t| {
            matches!(t.state, TaskState::Running | TaskState::AwaitingApproval)
        });
        if !waiting {
            return;
        }
        let note = format!("{} {}", scrub_secrets(&operation.description), what);
        tracing::info!(run_id = %self.run_id, task_id = %task_id, operation_id = %operation.id, "{}", note);
        self.restrictions
            .lock()
            .await
            .entry(task_id.clone())
            .or_default()
            .push(note.clone());
        self.withdrawn.lock().await.entry(task_id).or_default().push(note);
        self.staged_release.notify_one();
    }

    /// Approve the currently staged set, which must equal `operation_ids` in
    /// staging order
    pub async fn approve_batch(&self, operation_ids: &[String]) -> Result<ApprovalRecord> {
        let content = self.staging.plan_content().await;
        let record = self
            .staging
            .approve_and_prepare(&self.run_id, &content, operation_ids)
            .await?;
        self.emit_event(OrchestratorEvent::ApprovalGranted {
            run_id: self.run_id.clone(),
            scope: ApprovalScope::Batch,
            approval_id: record.approval_id.clone(),
            timestamp: Utc::now(),
        })
        .await;
        Ok(record)
    }

    /// Execute a previously approved batch against the workspace. Tasks whose
    /// staged writes have all landed are released by the execution loop.
    pub async fn execute_approved_batch(&self, record: &ApprovalRecord) -> Result<BatchOutcome> {
        let outcome = self
            .staging
            .execute_approved(record, &self.workspace, Some(&self.cancel_token))
            .await?;
        self.report_batch(&outcome).await;
        self.staged_release.notify_one();
        Ok(outcome)
    }

    /// Put back every file an executed batch touched, newest change first.
    /// Shell commands cannot be undone and are skipped. Returns how many
    /// files were restored.
    pub async fn undo_batch(&self, approval_id: &str) -> Result<usize> {
        let Some(applied) = self.staging.take_executed(approval_id).await else {
            return Err(OrchestratorError::NotFound(format!(
                "No executed batch {} to undo",
                approval_id
            )));
        };
        let mut restored = 0;
        for operation in applied.iter().rev() {
            if operation.kind == OperationKind::ShellCommand {
                tracing::warn!(run_id = %self.run_id, operation_id = %operation.id, "Cannot undo shell command");
                continue;
            }
            if let Some(snapshot) = &operation.before_snapshot {
                self.workspace.restore(snapshot).await?;
                restored += 1;
            }
        }
        tracing::info!(run_id = %self.run_id, approval_id, restored, "Undid staged batch");
        Ok(restored)
    }

    async fn report_batch(&self, outcome: &BatchOutcome) {
        if let Some(error) = outcome.first_error() {
            tracing::warn!(
                run_id = %self.run_id,
                approval_id = %outcome.approval_id,
                "Staged batch stopped early: {}",
                error
            );
        }
        self.emit_event(OrchestratorEvent::StagedBatchExecuted {
            run_id: self.run_id.clone(),
            approval_id: outcome.approval_id.clone(),
            applied: outcome.applied(),
            failed: outcome.failed(),
            skipped: outcome.skipped(),
            timestamp: Utc::now(),
        })
        .await;
    }

    // ========================================================================
    // Execution Loop
    // ========================================================================

    async fn run_execution_loop(&self) -> Result<()> {
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        let mut pause_rx = self.pause_tx.subscribe();
        self.budget.lock().await.set_active(true);

        loop {
            if let Some(stop) = self.pending_stop().await {
                while let Some(joined) = join_set.join_next().await {
                    self.log_join_result(joined);
                }
                return match stop {
                    StopReason::Cancelled => self.handle_cancellation().await,
                    StopReason::Paused => self.handle_pause().await,
                    StopReason::Budget(exceeded) => self.handle_budget_exceeded(exceeded).await,
                };
            }

            self.release_held_tasks().await;
            self.dispatch_runnable(&mut join_set).await;

            if join_set.is_empty() {
                if !self.any_held().await {
                    return self.settle().await;
                }
                self.await_staged_approval(&mut pause_rx).await;
                continue;
            }

            tokio::select! {
                Some(joined) = join_set.join_next() => self.log_join_result(joined),
                _ = self.cancel_token.cancelled() => {}
                _ = pause_rx.changed() => {}
                _ = self.staged_release.notified() => {}
            }
        }
    }

    async fn any_held(&self) -> bool {
        TaskScheduler::any_awaiting_approval(&self.run.read().await.tasks)
    }

    /// Nothing can run until a reviewer acts on staged operations. The wall
    /// clock stops while waiting.
    async fn await_staged_approval(&self, pause_rx: &mut watch::Receiver<bool>) {
        tracing::info!(run_id = %self.run_id, "Waiting for staged operations to be approved");
        self.budget.lock().await.set_active(false);
        tokio::select! {
            _ = self.cancel_token.cancelled() => {}
            _ = pause_rx.changed() => {}
            _ = self.staged_release.notified() => {}
        }
        self.budget.lock().await.set_active(true);
    }

    /// Complete held tasks whose staged writes have all been executed, and
    /// retry those whose writes were withdrawn
    async fn release_held_tasks(&self) {
        let held: Vec<Task> = self
            .run
            .read()
            .await
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::AwaitingApproval)
            .cloned()
            .collect();

        for task in held {
            let withdrawn = self.withdrawn.lock().await.remove(&task.id);
            let result = match withdrawn {
                Some(notes) => self.record_task_failure(&task.id, &notes.join("; ")).await,
                None if self.staging.pending_from(&task.id).await.is_empty() => {
                    let validation = task
                        .validation_result
                        .clone()
                        .unwrap_or_else(|| unparsed_validation("Validation result missing"));
                    self.complete_task(&task.id, validation).await
                }
                None => Ok(()),
            };
            if let Err(e) = result {
                tracing::error!(run_id = %self.run_id, task_id = %task.id, "Failed to release held task: {}", e);
            }
        }
    }

    async fn pending_stop(&self) -> Option<StopReason> {
        if self.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        let status = self.budget.lock().await.check();
        match status {
            BudgetStatus::Exceeded(exceeded) => return Some(StopReason::Budget(exceeded)),
            BudgetStatus::Warning { kind, percentage } => {
                tracing::warn!(run_id = %self.run_id, kind = %kind, percentage, "Budget warning");
                self.emit_event(OrchestratorEvent::BudgetWarning {
                    run_id: self.run_id.clone(),
                    kind,
                    percentage,
                    timestamp: Utc::now(),
                })
                .await;
            }
            BudgetStatus::Ok => {}
        }
        if *self.pause_tx.borrow() {
            return Some(StopReason::Paused);
        }
        None
    }

    /// Dispatch runnable tasks in plan order while task permits last
    async fn dispatch_runnable(&self, join_set: &mut JoinSet<Result<()>>) {
        let runnable: Vec<String> = {
            let mut run = self.run.write().await;
            TaskScheduler::refresh_runnable(&mut run.tasks);
            TaskScheduler::get_all_runnable(&run.tasks)
                .into_iter()
                .map(|t| t.id.clone())
                .collect()
        };

        for task_id in runnable {
            let Ok(permit) = self.limits.tasks.clone().try_acquire_owned() else {
                break;
            };
            let task = {
                let mut run = self.run.write().await;
                match run.task_mut(&task_id) {
                    Some(task) if matches!(task.state, TaskState::Pending | TaskState::Runnable) => {
                        task.state = TaskState::Running;
                        task.clone()
                    }
                    _ => continue,
                }
            };

            self.emit_event(OrchestratorEvent::TaskStarted {
                run_id: self.run_id.clone(),
                task_id: task.id.clone(),
                attempt: task.retry_count + 1,
                timestamp: Utc::now(),
            })
            .await;

            let engine = self.clone();
            join_set.spawn(async move {
                let _permit = permit;
                engine.execute_task(task).await
            });
        }
    }

    fn log_join_result(&self, joined: std::result::Result<Result<()>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(run_id = %self.run_id, "Task returned error: {}", e),
            Err(e) => tracing::error!(run_id = %self.run_id, "Task join failed: {}", e),
        }
    }

    /// Nothing runnable and nothing in flight: decide the terminal state
    async fn settle(&self) -> Result<()> {
        let (all_done, succeeded, unfinished, first_failure) = {
            let run = self.run.read().await;
            let first_failure = run
                .tasks
                .iter()
                .find(|t| t.state == TaskState::Failed)
                .map(|t| {
                    format!(
                        "Task {} failed: {}",
                        t.id,
                        t.error_message.as_deref().unwrap_or("no reason recorded")
                    )
                });
            let unfinished = run.tasks.iter().filter(|t| t.state != TaskState::Done).count();
            (
                TaskScheduler::all_completed(&run.tasks),
                run.tasks.iter().any(|t| t.state == TaskState::Done),
                unfinished,
                first_failure,
            )
        };

        if all_done {
            return self.handle_completion(None).await;
        }
        match self.config.completion_policy {
            CompletionPolicy::CompleteIfAnySucceeded if succeeded => {
                self.handle_completion(Some(format!("{} task(s) failed or were blocked", unfinished)))
                    .await
            }
            _ => {
                let reason = first_failure.unwrap_or_else(|| "No runnable tasks remain".to_string());
                self.handle_failure(&reason).await
            }
        }
    }

    // ========================================================================
    // Task Execution
    // ========================================================================

    async fn execute_task(&self, task: Task) -> Result<()> {
        #[cfg(test)]
        if let Some(executor) = self.test_task_executor.clone() {
            return executor(self.clone(), task).await;
        }

        let task_id = task.id.clone();
        match self.attempt_task(&task).await {
            Ok(validation) if validation.passed => self.finish_task(&task_id, validation).await,
            Ok(validation) => {
                let reason = OrchestratorError::ValidationFailed(validation.feedback.clone()).to_string();
                self.set_validation(&task_id, validation).await;
                self.record_task_failure(&task_id, &reason).await
            }
            Err(OrchestratorError::BudgetExceeded(exceeded)) => {
                tracing::warn!(run_id = %self.run_id, task_id = %task_id, "Task stopped by budget: {}", exceeded);
                self.requeue_task(&task_id).await;
                Ok(())
            }
            Err(e) if self.is_cancelled() => {
                tracing::info!(run_id = %self.run_id, task_id = %task_id, "Task interrupted by cancellation: {}", e);
                self.requeue_task(&task_id).await;
                Ok(())
            }
            Err(e) if e.is_transient() => self.record_task_failure(&task_id, &e.to_string()).await,
            Err(e) => {
                let attempts = self.budget.lock().await.retries_for(&task_id) as u32 + 1;
                self.fail_task(&task_id, attempts, &e.to_string()).await
            }
        }
    }

    /// One scheduler attempt: build, validate, then bounded fix rounds
    async fn attempt_task(&self, task: &Task) -> Result<ValidationResult> {
        let context = self.workspace.task_context(task).await;
        let restrictions = self
            .restrictions
            .lock()
            .await
            .get(&task.id)
            .cloned()
            .unwrap_or_default();

        let mut validation = self
            .build_and_validate(task, &context, task.error_message.as_deref(), &restrictions, None)
            .await?
            .unwrap_or_else(|| unparsed_validation("Builder produced no result"));

        let mut fix_budget = FixLoopBudget::new(self.config.fix_loop_token_budget);
        let mut round = 0;
        while !validation.passed && round < self.config.effective_fix_loop_attempts() && !self.is_cancelled() {
            round += 1;
            let feedback = fix_feedback(&validation);
            tracing::info!(run_id = %self.run_id, task_id = %task.id, round, "Starting fix round");
            match self
                .build_and_validate(task, &context, Some(&feedback), &restrictions, Some(&mut fix_budget))
                .await?
            {
                Some(next) => validation = next,
                None => break,
            }
        }
        Ok(validation)
    }

    /// Returns `None` when the fix-loop budget refuses the builder call
    async fn build_and_validate(
        &self,
        task: &Task,
        context: &str,
        feedback: Option<&str>,
        restrictions: &[String],
        fix_budget: Option<&mut FixLoopBudget>,
    ) -> Result<Option<ValidationResult>> {
        let role = match task.assigned_role {
            AgentRole::Researcher => AgentRole::Researcher,
            _ => AgentRole::Builder,
        };
        let body = match role {
            AgentRole::Researcher => AgentPrompts::build_researcher_prompt(
                &format!("{}\n\n{}", task.title, task.description),
                &ResearcherConstraints::default(),
            ),
            _ => AgentPrompts::build_builder_prompt(task, context, feedback, restrictions),
        };
        let request = self.prepare_request(role, &body);
        if let Some(fix_budget) = fix_budget {
            if !fix_budget.reserve(request_estimate(&request)) {
                tracing::info!(
                    run_id = %self.run_id,
                    task_id = %task.id,
                    remaining = fix_budget.remaining(),
                    "Fix-loop token budget exhausted"
                );
                return Ok(None);
            }
        }
        self.budget.lock().await.record_iteration()?;

        let generation = self.call_agent(request).await?;
        self.ensure_not_cancelled()?;
        let changes = self.apply_tool_calls(task, &generation.tool_calls).await?;

        let notes = scrub_prompt(&generation.text, self.secrets.as_ref(), &self.config.secret_names);
        if !changes.patch.is_empty() {
            self.attach_artifact(&task.id, ArtifactType::Patch, "patch.diff", &changes.patch)
                .await?;
        }
        let (kind, filename) = match role {
            AgentRole::Researcher => (ArtifactType::Sources, "sources.md"),
            _ => (ArtifactType::Notes, "notes.md"),
        };
        self.attach_artifact(&task.id, kind, filename, &notes).await?;
        self.ensure_not_cancelled()?;

        let body = AgentPrompts::build_validator_prompt(task, &changes.summary(), &notes);
        let verdict = self.call_agent(self.prepare_request(AgentRole::Validator, &body)).await?;
        let validation = AgentPrompts::parse_validation_result(&verdict.text, self.config.allow_prose_fallback)
            .unwrap_or_else(|| unparsed_validation("Validator response could not be parsed"));
        let json = serde_json::to_string_pretty(&validation)?;
        self.attach_artifact(&task.id, ArtifactType::Validation, "validation.json", &json)
            .await?;
        Ok(Some(validation))
    }

    /// Route every tool call through the policy gate
    async fn apply_tool_calls(&self, task: &Task, calls: &[ToolCall]) -> Result<ChangeSet> {
        let mut changes = ChangeSet::default();
        for call in calls {
            self.ensure_not_cancelled()?;
            let Some(action) = RequestedAction::from_tool_call(&call.tool, &call.args) else {
                let reason = format!("unknown tool {}", call.tool);
                return Err(self.block_action(task, &call.tool, &reason).await);
            };
            let label = format!("{} {}", action.kind.as_str(), action.display_target());
            let decision = self.gate.classify(&action);
            let mut logged_args = call.args.clone();
            redact_secret_fields(&mut logged_args);
            tracing::debug!(
                run_id = %self.run_id,
                task_id = %task.id,
                tool = %call.tool,
                args = %logged_args,
                tier = ?decision.tier,
                "Gated tool call"
            );

            match decision.action {
                PolicyAction::Block => {
                    return Err(self.block_action(task, &label, &decision.reason).await);
                }
                PolicyAction::AutoAllow => {
                    let Some(operation) = self.operation_for(task, &action).await else {
                        continue;
                    };
                    self.workspace
                        .apply(&operation)
                        .await
                        .map_err(|e| OrchestratorError::Execution(e.to_string()))?;
                    changes.record(&operation, "applied");
                }
                PolicyAction::RequireApproval if self.config.staged_mode => {
                    let Some(operation) = self.operation_for(task, &action).await else {
                        let reason = format!("{} (cannot be staged for approval)", decision.reason);
                        return Err(self.block_action(task, &label, &reason).await);
                    };
                    changes.record(&operation, "staged for approval");
                    self.stage_operation(operation).await?;
                }
                PolicyAction::RequireApproval => {
                    let reason = format!("{} (staged mode is off)", decision.reason);
                    return Err(self.block_action(task, &label, &reason).await);
                }
            }
        }
        Ok(changes)
    }

    async fn operation_for(&self, task: &Task, action: &RequestedAction) -> Option<StagedOperation> {
        let operation = StagedOperation::from_action(action)?.with_origin(task.id.clone());
        if operation.kind == OperationKind::ShellCommand {
            return Some(operation);
        }
        let snapshot = self.workspace.snapshot(&operation.target).await.ok();
        Some(operation.with_snapshot(snapshot))
    }

    /// Record a refusal and return the error that fails this attempt
    async fn block_action(&self, task: &Task, label: &str, reason: &str) -> OrchestratorError {
        tracing::warn!(run_id = %self.run_id, task_id = %task.id, action = %label, "Policy blocked: {}", reason);
        self.restrictions
            .lock()
            .await
            .entry(task.id.clone())
            .or_default()
            .push(format!("{}: {}", label, reason));
        self.emit_event(OrchestratorEvent::PolicyBlocked {
            run_id: self.run_id.clone(),
            task_id: Some(task.id.clone()),
            action: label.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
        .await;
        OrchestratorError::PolicyBlocked(reason.to_string())
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(OrchestratorError::InvalidOperation("Run cancelled".to_string()));
        }
        Ok(())
    }

    fn prepare_request(&self, role: AgentRole, body: &str) -> GenerationRequest {
        let body = scrub_prompt(body, self.secrets.as_ref(), &self.config.secret_names);
        RoleTemplate::for_role(role).request(body, self.config.max_response_tokens)
    }

    /// Reserve, generate, reconcile. Nothing is sent when the reservation is
    /// refused.
    async fn call_agent(&self, request: GenerationRequest) -> Result<Generation> {
        let estimate = request_estimate(&request);
        let role = request.role;
        let reservation = self.budget.lock().await.reserve_call(estimate)?;

        let permit = self.limits.acquire_llm().await?;
        let timeout_secs = self.config.agent_timeout_secs;
        tracing::debug!(run_id = %self.run_id, role = role.as_str(), estimate, "Dispatching sub-agent call");
        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), self.generator.generate(request)).await;
        drop(permit);

        match result {
            Ok(Ok(generation)) => {
                self.budget
                    .lock()
                    .await
                    .reconcile(reservation, generation.tokens_used)?;
                Ok(generation)
            }
            Ok(Err(e)) => {
                let _ = self.budget.lock().await.reconcile(reservation, 0);
                Err(e)
            }
            Err(_) => {
                let _ = self.budget.lock().await.reconcile(reservation, estimate);
                Err(OrchestratorError::Timeout(format!(
                    "{} call exceeded {}s",
                    role.as_str(),
                    timeout_secs
                )))
            }
        }
    }

    /// A validated task completes at once unless it still has staged writes
    /// waiting; then it is held so dependents cannot start early
    async fn finish_task(&self, task_id: &str, validation: ValidationResult) -> Result<()> {
        let withdrawn = self.withdrawn.lock().await.remove(task_id);
        if let Some(notes) = withdrawn {
            self.set_validation(task_id, validation).await;
            return self.record_task_failure(task_id, &notes.join("; ")).await;
        }
        let pending = self.staging.pending_from(task_id).await;
        if pending.is_empty() {
            return self.complete_task(task_id, validation).await;
        }

        {
            let mut run = self.run.write().await;
            if let Some(task) = run.task_mut(task_id) {
                task.state = TaskState::AwaitingApproval;
                task.validation_result = Some(validation);
                task.error_message = None;
            }
        }
        tracing::info!(
            run_id = %self.run_id,
            task_id = %task_id,
            staged = pending.len(),
            "Task validated; waiting for staged operations"
        );
        self.emit_event(OrchestratorEvent::TaskAwaitingApproval {
            run_id: self.run_id.clone(),
            task_id: task_id.to_string(),
            operation_ids: pending,
            timestamp: Utc::now(),
        })
        .await;
        Ok(())
    }

    async fn complete_task(&self, task_id: &str, validation: ValidationResult) -> Result<()> {
        {
            let mut run = self.run.write().await;
            if let Some(task) = run.task_mut(task_id) {
                task.state = TaskState::Done;
                task.validation_result = Some(validation);
                task.error_message = None;
            }
        }
        self.restrictions.lock().await.remove(task_id);
        tracing::info!(run_id = %self.run_id, task_id = %task_id, "Task completed");
        self.emit_event(OrchestratorEvent::TaskCompleted {
            run_id: self.run_id.clone(),
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
        })
        .await;
        Ok(())
    }

    async fn set_validation(&self, task_id: &str, validation: ValidationResult) {
        if let Some(task) = self.run.write().await.task_mut(task_id) {
            task.validation_result = Some(validation);
        }
    }

    async fn requeue_task(&self, task_id: &str) {
        if let Some(task) = self.run.write().await.task_mut(task_id) {
            if task.state == TaskState::Running {
                task.state = TaskState::Pending;
            }
        }
    }

    /// Count a failed attempt: back to Pending while retries remain, otherwise
    /// Failed with its dependents blocked
    pub(crate) async fn record_task_failure(&self, task_id: &str, reason: &str) -> Result<()> {
        self.discard_staged_from(task_id).await;
        let recorded = self.budget.lock().await.record_retry(task_id);
        let max_retries = u64::from(self.config.max_task_retries);

        match recorded {
            Ok(failures) if failures < max_retries => {
                let retry_count = failures as u32;
                if let Some(task) = self.run.write().await.task_mut(task_id) {
                    task.state = TaskState::Pending;
                    task.retry_count = retry_count;
                    task.error_message = Some(reason.to_string());
                }
                tracing::info!(run_id = %self.run_id, task_id = %task_id, retry_count, "Retrying task: {}", reason);
                self.emit_event(OrchestratorEvent::TaskRetry {
                    run_id: self.run_id.clone(),
                    task_id: task_id.to_string(),
                    retry_count,
                    reason: reason.to_string(),
                    timestamp: Utc::now(),
                })
                .await;
                Ok(())
            }
            Ok(failures) => self.fail_task(task_id, failures as u32, reason).await,
            Err(exceeded) => {
                self.fail_task(task_id, exceeded.would_be.saturating_sub(1) as u32, reason)
                    .await
            }
        }
    }

    async fn fail_task(&self, task_id: &str, attempts: u32, reason: &str) -> Result<()> {
        self.discard_staged_from(task_id).await;
        let exhausted = OrchestratorError::TaskRetriesExhausted {
            task_id: task_id.to_string(),
            attempts,
        };
        let message = format!("{}: {}", exhausted, reason);
        let blocked = {
            let mut run = self.run.write().await;
            if let Some(task) = run.task_mut(task_id) {
                task.state = TaskState::Failed;
                task.retry_count = attempts;
                task.error_message = Some(message.clone());
            }
            TaskScheduler::block_dependents(&mut run.tasks)
        };

        tracing::warn!(run_id = %self.run_id, task_id = %task_id, "{}", message);
        self.emit_event(OrchestratorEvent::TaskFailed {
            run_id: self.run_id.clone(),
            task_id: task_id.to_string(),
            reason: message,
            timestamp: Utc::now(),
        })
        .await;
        for (blocked_id, blocked_by) in blocked {
            self.emit_event(OrchestratorEvent::TaskBlocked {
                run_id: self.run_id.clone(),
                task_id: blocked_id,
                blocked_by,
                timestamp: Utc::now(),
            })
            .await;
        }
        Ok(())
    }

    /// Writes proposed by a failed attempt are never offered for approval
    async fn discard_staged_from(&self, task_id: &str) {
        self.withdrawn.lock().await.remove(task_id);
        let discarded = self.staging.discard_from(task_id).await;
        if !discarded.is_empty() {
            tracing::info!(
                run_id = %self.run_id,
                task_id = %task_id,
                count = discarded.len(),
                "Discarded staged operations from failed attempt"
            );
        }
    }

    async fn attach_artifact(
        &self,
        task_id: &str,
        artifact_type: ArtifactType,
        filename: &str,
        content: &str,
    ) -> Result<()> {
        let path = self.store.save_artifact(&self.run_id, task_id, filename, content)?;
        let preview = content
            .lines()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.chars().take(120).collect::<String>());
        if let Some(task) = self.run.write().await.task_mut(task_id) {
            task.artifacts.retain(|a| a.artifact_type != artifact_type);
            task.artifacts.push(Artifact {
                artifact_type,
                path,
                preview,
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn set_task_state(&self, task_id: &str, state: TaskState) {
        if let Some(task) = self.run.write().await.task_mut(task_id) {
            task.state = state;
        }
    }

    // ========================================================================
    // Terminal and paused states
    // ========================================================================

    /// Move to a terminal status once. Returns false if the run already ended.
    async fn enter_terminal(&self, status: RunStatus, reason: Option<String>) -> bool {
        self.budget.lock().await.set_active(false);
        let mut run = self.run.write().await;
        if run.status.is_terminal() {
            return false;
        }
        run.status = status;
        run.paused_from = None;
        run.ended_at = Some(Utc::now());
        run.error_message = reason;
        for task in run.tasks.iter_mut().filter(|t| t.state == TaskState::Running) {
            task.state = TaskState::Pending;
        }
        true
    }

    async fn handle_completion(&self, note: Option<String>) -> Result<()> {
        if !self.enter_terminal(RunStatus::Completed, note).await {
            return Ok(());
        }
        tracing::info!(run_id = %self.run_id, "Run completed");
        self.emit_event(OrchestratorEvent::RunCompleted {
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
        })
        .await;
        self.write_summary().await
    }

    async fn handle_failure(&self, reason: &str) -> Result<()> {
        if !self.enter_terminal(RunStatus::Failed, Some(reason.to_string())).await {
            return Ok(());
        }
        tracing::error!(run_id = %self.run_id, "Run failed: {}", reason);
        self.emit_event(OrchestratorEvent::RunFailed {
            run_id: self.run_id.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
        .await;
        self.write_summary().await
    }

    async fn handle_cancellation(&self) -> Result<()> {
        if !self
            .enter_terminal(RunStatus::Cancelled, Some("Cancelled by user".to_string()))
            .await
        {
            return Ok(());
        }
        tracing::info!(run_id = %self.run_id, "Run cancelled");
        self.emit_event(OrchestratorEvent::RunCancelled {
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
        })
        .await;
        self.write_summary().await
    }

    async fn handle_budget_exceeded(&self, exceeded: BudgetExceeded) -> Result<()> {
        let reason = format!("{}; partial artifacts were kept", exceeded);
        if !self.enter_terminal(RunStatus::BudgetExceeded, Some(reason)).await {
            return Ok(());
        }
        tracing::warn!(run_id = %self.run_id, "{}", exceeded);
        self.emit_event(OrchestratorEvent::BudgetExceeded {
            run_id: self.run_id.clone(),
            kind: exceeded.kind,
            cap: exceeded.cap,
            would_be: exceeded.would_be,
            timestamp: Utc::now(),
        })
        .await;
        self.write_summary().await
    }

    async fn handle_pause(&self) -> Result<()> {
        self.budget.lock().await.set_active(false);
        {
            let mut run = self.run.write().await;
            if run.status != RunStatus::Executing {
                return Ok(());
            }
            run.paused_from = Some(RunStatus::Executing);
            run.status = RunStatus::Paused;
            for task in run.tasks.iter_mut().filter(|t| t.state == TaskState::Running) {
                task.state = TaskState::Pending;
            }
        }
        tracing::info!(run_id = %self.run_id, "Run paused");
        self.emit_event(OrchestratorEvent::RunPaused {
            run_id: self.run_id.clone(),
            from: RunStatus::Executing,
            timestamp: Utc::now(),
        })
        .await;
        Ok(())
    }

    async fn write_summary(&self) -> Result<()> {
        let run = self.run.read().await.clone();
        self.store.save_summary(&self.run_id, &render_summary(&run))
    }

    // ========================================================================
    // Events and persistence
    // ========================================================================

    async fn persist(&self, seq: Option<u64>) -> Result<()> {
        let ledger = self.budget.lock().await.snapshot();
        let mut run = self.run.write().await;
        run.budget = ledger;
        run.updated_at = Utc::now();
        if let Some(seq) = seq {
            run.last_event_seq = seq;
        }
        self.store.save_run(&run)
    }

    /// Sequence, append to the log, checkpoint if needed, then publish. Callers
    /// must not hold the run lock.
    async fn emit_event(&self, event: OrchestratorEvent) {
        let mut last_seq = self.event_seq.lock().await;
        *last_seq += 1;
        let record = RunEventRecord {
            seq: *last_seq,
            event_id: format!("evt-{}", Uuid::new_v4()),
            run_id: self.run_id.clone(),
            event_type: event.event_type().to_string(),
            timestamp: Utc::now(),
            event,
        };

        if let Err(e) = self.store.append_event(&record) {
            tracing::error!(run_id = %self.run_id, "Failed to append orchestrator event: {}", e);
        }
        if record.event.is_checkpoint() {
            if let Err(e) = self.persist(Some(record.seq)).await {
                tracing::error!(run_id = %self.run_id, "Failed to checkpoint run: {}", e);
            }
        }

        let level = match &record.event {
            OrchestratorEvent::RunFailed { .. }
            | OrchestratorEvent::TaskFailed { .. }
            | OrchestratorEvent::PolicyBlocked { .. }
            | OrchestratorEvent::BudgetExceeded { .. } => Level::WARN,
            _ => Level::INFO,
        };
        emit_obs_event(
            level,
            self.process,
            ObservabilityEvent {
                event: &record.event_type,
                component: "orchestrator.engine",
                run_id: Some(&self.run_id),
                task_id: record.event.task_id(),
                seq: Some(record.seq),
                ..Default::default()
            },
        );

        self.bus.publish(record);
    }
}

fn request_estimate(request: &GenerationRequest) -> u64 {
    estimate_tokens(&request.prompt) + request.max_tokens
}

fn unparsed_validation(feedback: &str) -> ValidationResult {
    ValidationResult {
        passed: false,
        feedback: feedback.to_string(),
        suggested_fixes: Vec::new(),
    }
}

fn fix_feedback(validation: &ValidationResult) -> String {
    if validation.suggested_fixes.is_empty() {
        return validation.feedback.clone();
    }
    let fixes: Vec<String> = validation
        .suggested_fixes
        .iter()
        .map(|fix| format!("- {}", fix))
        .collect();
    format!("{}\n\nSuggested fixes:\n{}", validation.feedback, fixes.join("\n"))
}

/// Canonical plan text shown for review and bound into the approval hash
pub fn render_plan(tasks: &[Task]) -> String {
    let mut out = String::new();
    for (index, task) in tasks.iter().enumerate() {
        out.push_str(&format!("{}. [{}] {}\n", index + 1, task.id, task.title));
        if !task.description.is_empty() {
            out.push_str(&format!("   {}\n", task.description));
        }
        out.push_str(&format!("   role: {}\n", task.assigned_role.as_str()));
        if !task.dependencies.is_empty() {
            out.push_str(&format!("   depends on: {}\n", task.dependencies.join(", ")));
        }
        for criterion in &task.acceptance_criteria {
            out.push_str(&format!("   - {}\n", criterion));
        }
    }
    out
}

fn render_summary(run: &Run) -> String {
    let mut out = format!(
        "# Run {}\n\nObjective: {}\n\nStatus: {}\n",
        run.run_id,
        run.objective,
        run.status.as_str()
    );
    if let Some(reason) = &run.error_message {
        out.push_str(&format!("\nReason: {}\n", reason));
    }
    out.push_str(&format!("\nLast checkpoint: event {}\n", run.last_event_seq));

    out.push_str("\n## Tasks\n\n| id | title | state | retries |\n|---|---|---|---|\n");
    for task in &run.tasks {
        out.push_str(&format!(
            "| {} | {} | {:?} | {} |\n",
            task.id, task.title, task.state, task.retry_count
        ));
    }

    out.push_str("\n## Budget\n\n| kind | used | cap |\n|---|---|---|\n");
    for kind in BudgetKind::all() {
        out.push_str(&format!(
            "| {} | {} | {} |\n",
            kind,
            run.budget.used(*kind),
            run.budget.cap(*kind)
        ));
    }
    out
}
