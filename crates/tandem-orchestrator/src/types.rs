// Orchestrator Types
// Core type definitions for multi-agent runs

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::{BudgetKind, BudgetLedger};
use crate::config::OrchestratorConfig;
use crate::staging::ApprovalRecord;

// ============================================================================
// Run State
// ============================================================================

/// Status of an orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created, planning not started
    Idle,
    /// Planner agent is generating the task DAG
    Planning,
    /// Plan generated, awaiting user approval
    AwaitingApproval,
    /// User asked for a new plan
    RevisionRequested,
    /// Executing tasks
    Executing,
    /// Scheduling suspended by user
    Paused,
    /// All reachable tasks settled successfully
    Completed,
    /// Planning failed or tasks failed
    Failed,
    /// A hard budget cap was hit
    BudgetExceeded,
    /// Run cancelled by user
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::BudgetExceeded | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::RevisionRequested => "revision_requested",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One orchestration session for one objective
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub objective: String,
    pub config: OrchestratorConfig,
    pub workspace_root: PathBuf,
    pub status: RunStatus,
    /// State to re-enter on resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<RunStatus>,
    /// Task DAG in planner insertion order
    pub tasks: Vec<Task>,
    pub budget: BudgetLedger,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Human-readable reason for the current terminal or paused state
    pub error_message: Option<String>,
    pub revision_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_approval: Option<ApprovalRecord>,
    /// Sequence number of the last event folded into this snapshot
    #[serde(default)]
    pub last_event_seq: u64,
}

impl Run {
    pub fn new(
        run_id: String,
        objective: String,
        config: OrchestratorConfig,
        workspace_root: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            objective,
            budget: BudgetLedger::from_config(&config),
            config,
            workspace_root,
            status: RunStatus::Idle,
            paused_from: None,
            tasks: Vec::new(),
            created_at: now,
            updated_at: now,
            ended_at: None,
            error_message: None,
            revision_feedback: None,
            plan_approval: None,
            last_event_seq: 0,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn to_snapshot(&self) -> RunSnapshot {
        let count = |state: TaskState| self.tasks.iter().filter(|t| t.state == state).count();

        RunSnapshot {
            run_id: self.run_id.clone(),
            status: self.status,
            paused_from: self.paused_from,
            objective: self.objective.clone(),
            task_count: self.tasks.len(),
            tasks_completed: count(TaskState::Done),
            tasks_failed: count(TaskState::Failed),
            tasks_blocked: count(TaskState::Blocked),
            tasks_awaiting_approval: count(TaskState::AwaitingApproval),
            running_task_ids: self
                .tasks
                .iter()
                .filter(|t| t.state == TaskState::Running)
                .map(|t| t.id.clone())
                .collect(),
            tasks: self.tasks.clone(),
            budget: self.budget.clone(),
            error_message: self.error_message.clone(),
            last_checkpoint_seq: self.last_event_seq,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn to_summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            objective: self.objective.clone(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Fold a logged event into this snapshot. Used when replaying the event log
    /// after a crash; every arm is idempotent.
    pub fn apply_event(&mut self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::RunCreated { .. } => {}
            OrchestratorEvent::PlanningStarted { .. } => {
                self.status = RunStatus::Planning;
            }
            OrchestratorEvent::PlanGenerated { tasks, .. } => {
                self.tasks = tasks.clone();
                self.status = RunStatus::AwaitingApproval;
            }
            OrchestratorEvent::RevisionRequested { feedback, .. } => {
                self.status = RunStatus::RevisionRequested;
                self.revision_feedback = Some(feedback.clone());
            }
            OrchestratorEvent::ApprovalGranted {
                scope: ApprovalScope::Plan,
                ..
            } => {
                self.status = RunStatus::Executing;
            }
            OrchestratorEvent::TaskStarted { task_id, .. } => {
                if let Some(task) = self.task_mut(task_id) {
                    task.state = TaskState::Running;
                }
            }
            OrchestratorEvent::TaskAwaitingApproval { task_id, .. } => {
                if let Some(task) = self.task_mut(task_id) {
                    task.state = TaskState::AwaitingApproval;
                }
            }
            OrchestratorEvent::TaskCompleted { task_id, .. } => {
                if let Some(task) = self.task_mut(task_id) {
                    task.state = TaskState::Done;
                    task.error_message = None;
                }
            }
            OrchestratorEvent::TaskRetry {
                task_id,
                retry_count,
                reason,
                ..
            } => {
                if let Some(task) = self.task_mut(task_id) {
                    task.state = TaskState::Pending;
                    task.retry_count = *retry_count;
                    task.error_message = Some(reason.clone());
                }
            }
            OrchestratorEvent::TaskFailed {
                task_id, reason, ..
            } => {
                if let Some(task) = self.task_mut(task_id) {
                    task.state = TaskState::Failed;
                    task.error_message = Some(reason.clone());
                }
            }
            OrchestratorEvent::TaskBlocked {
                task_id,
                blocked_by,
                ..
            } => {
                if let Some(task) = self.task_mut(task_id) {
                    task.state = TaskState::Blocked;
                    task.error_message = Some(format!("Blocked by failed dependency {}", blocked_by));
                }
            }
            OrchestratorEvent::RunPaused { from, .. } => {
                self.paused_from = Some(*from);
                self.status = RunStatus::Paused;
            }
            OrchestratorEvent::RunResumed { to, .. } => {
                self.paused_from = None;
                self.status = *to;
            }
            OrchestratorEvent::BudgetExceeded { kind, .. } => {
                self.status = RunStatus::BudgetExceeded;
                self.error_message = Some(format!("Budget exceeded: {}", kind));
            }
            OrchestratorEvent::RunCompleted { .. } => {
                self.status = RunStatus::Completed;
            }
            OrchestratorEvent::RunFailed { reason, .. } => {
                self.status = RunStatus::Failed;
                self.error_message = Some(reason.clone());
            }
            OrchestratorEvent::RunCancelled { .. } => {
                self.status = RunStatus::Cancelled;
            }
            OrchestratorEvent::ApprovalGranted { .. }
            | OrchestratorEvent::ApprovalRequested { .. }
            | OrchestratorEvent::PolicyBlocked { .. }
            | OrchestratorEvent::OperationStaged { .. }
            | OrchestratorEvent::StagedBatchExecuted { .. }
            | OrchestratorEvent::BudgetWarning { .. } => {}
        }
    }
}

/// Snapshot of run state for UI consumption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub paused_from: Option<RunStatus>,
    pub objective: String,
    pub task_count: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_blocked: usize,
    #[serde(default)]
    pub tasks_awaiting_approval: usize,
    pub running_task_ids: Vec<String>,
    pub tasks: Vec<Task>,
    pub budget: BudgetLedger,
    pub error_message: Option<String>,
    /// Last persisted snapshot the run can be resumed or inspected from
    pub last_checkpoint_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lightweight summary of a run for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub objective: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Task State
// ============================================================================

/// State of a task in the DAG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for dependencies
    Pending,
    /// Dependencies done, waiting for a dispatch slot
    Runnable,
    /// Dispatched to a sub-agent
    Running,
    /// A dependency failed; can never become runnable
    Blocked,
    /// Validated, but its staged writes have not been executed yet.
    /// Dependents wait until they are.
    AwaitingApproval,
    Done,
    /// Failed after max retries
    Failed,
}

/// Sub-agent role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Builder,
    Validator,
    Researcher,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Builder => "builder",
            Self::Validator => "validator",
            Self::Researcher => "researcher",
        }
    }
}

fn default_task_role() -> AgentRole {
    AgentRole::Builder
}

/// A single task in the orchestration DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    /// IDs of tasks that must complete before this one
    pub dependencies: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    #[serde(default = "default_task_role")]
    pub assigned_role: AgentRole,
    pub state: TaskState,
    pub retry_count: u32,
    pub artifacts: Vec<Artifact>,
    pub validation_result: Option<ValidationResult>,
    pub error_message: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
            assigned_role: AgentRole::Builder,
            state: TaskState::Pending,
            retry_count: 0,
            artifacts: Vec::new(),
            validation_result: None,
            error_message: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }
}

// ============================================================================
// Artifacts
// ============================================================================

/// Type of artifact produced by a sub-agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Patch,
    Notes,
    Validation,
    Sources,
}

/// An artifact produced by a sub-agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_type: ArtifactType,
    /// Path relative to the run folder
    pub path: String,
    pub preview: Option<String>,
}

/// Result of validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub feedback: String,
    pub suggested_fixes: Vec<String>,
}

// ============================================================================
// Events
// ============================================================================

/// What an approval covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalScope {
    /// The task plan plus the initial staged write set
    Plan,
    /// A batch of staged operations
    Batch,
}

/// Event types for the append-only log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RunCreated {
        run_id: String,
        objective: String,
        timestamp: DateTime<Utc>,
    },
    PlanningStarted {
        run_id: String,
        timestamp: DateTime<Utc>,
    },
    PlanGenerated {
        run_id: String,
        task_count: usize,
        tasks: Vec<Task>,
        timestamp: DateTime<Utc>,
    },
    ApprovalRequested {
        run_id: String,
        scope: ApprovalScope,
        content_hash: String,
        operation_count: usize,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    ApprovalGranted {
        run_id: String,
        scope: ApprovalScope,
        approval_id: String,
        timestamp: DateTime<Utc>,
    },
    RevisionRequested {
        run_id: String,
        feedback: String,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        run_id: String,
        task_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// Task validated; completes once its staged operations are executed
    TaskAwaitingApproval {
        run_id: String,
        task_id: String,
        operation_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        run_id: String,
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskRetry {
        run_id: String,
        task_id: String,
        retry_count: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        run_id: String,
        task_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    TaskBlocked {
        run_id: String,
        task_id: String,
        blocked_by: String,
        timestamp: DateTime<Utc>,
    },
    PolicyBlocked {
        run_id: String,
        task_id: Option<String>,
        action: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    OperationStaged {
        run_id: String,
        task_id: Option<String>,
        operation_id: String,
        description: String,
        timestamp: DateTime<Utc>,
    },
    StagedBatchExecuted {
        run_id: String,
        approval_id: String,
        applied: usize,
        failed: usize,
        skipped: usize,
        timestamp: DateTime<Utc>,
    },
    BudgetWarning {
        run_id: String,
        kind: BudgetKind,
        percentage: u8,
        timestamp: DateTime<Utc>,
    },
    BudgetExceeded {
        run_id: String,
        kind: BudgetKind,
        cap: u64,
        would_be: u64,
        timestamp: DateTime<Utc>,
    },
    RunPaused {
        run_id: String,
        from: RunStatus,
        timestamp: DateTime<Utc>,
    },
    RunResumed {
        run_id: String,
        to: RunStatus,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        run_id: String,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        run_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    RunCancelled {
        run_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    /// Dotted event name used on the event stream
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => "run.created",
            Self::PlanningStarted { .. } => "planning.started",
            Self::PlanGenerated { .. } => "plan.generated",
            Self::ApprovalRequested { .. } => "approval.requested",
            Self::ApprovalGranted { .. } => "approval.granted",
            Self::RevisionRequested { .. } => "revision.requested",
            Self::TaskStarted { .. } => "task.started",
            Self::TaskAwaitingApproval { .. } => "task.awaiting_approval",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskRetry { .. } => "task.retry",
            Self::TaskFailed { .. } => "task.failed",
            Self::TaskBlocked { .. } => "task.blocked",
            Self::PolicyBlocked { .. } => "policy.blocked",
            Self::OperationStaged { .. } => "operation.staged",
            Self::StagedBatchExecuted { .. } => "staging.executed",
            Self::BudgetWarning { .. } => "budget.warning",
            Self::BudgetExceeded { .. } => "budget.exceeded",
            Self::RunPaused { .. } => "run.paused",
            Self::RunResumed { .. } => "run.resumed",
            Self::RunCompleted { .. } => "run.completed",
            Self::RunFailed { .. } => "run.failed",
            Self::RunCancelled { .. } => "run.cancelled",
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::TaskAwaitingApproval { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskRetry { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskBlocked { task_id, .. } => Some(task_id),
            Self::PolicyBlocked { task_id, .. } | Self::OperationStaged { task_id, .. } => {
                task_id.as_deref()
            }
            _ => None,
        }
    }

    /// Whether a snapshot should be persisted right after this event
    pub fn is_checkpoint(&self) -> bool {
        matches!(
            self,
            Self::PlanGenerated { .. }
                | Self::ApprovalGranted { .. }
                | Self::TaskAwaitingApproval { .. }
                | Self::TaskCompleted { .. }
                | Self::TaskFailed { .. }
                | Self::RunPaused { .. }
                | Self::RunResumed { .. }
                | Self::RunCompleted { .. }
                | Self::RunFailed { .. }
                | Self::RunCancelled { .. }
                | Self::BudgetExceeded { .. }
        )
    }
}

/// Sequenced envelope persisted to `events.jsonl` and published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventRecord {
    pub seq: u64,
    pub event_id: String,
    pub run_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub event: OrchestratorEvent,
}
