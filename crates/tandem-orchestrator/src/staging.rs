// Staging Store
// Buffers proposed mutations for one-shot batch review and binds each approval
// to the exact reviewed content through an order-sensitive hash.

use std::collections::HashMap;
use std::fmt::Write;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::policy::{ActionKind, RequestedAction};
use crate::workspace::FileSnapshot;

/// Bumped whenever the canonical serialization below changes, so approvals
/// recorded by an older build are reported as drift instead of silently
/// mismatching.
pub const APPROVAL_HASH_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Write,
    Edit,
    Delete,
    ShellCommand,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::ShellCommand => "shell_command",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedStatus {
    Staged,
    ApprovedPendingExecution,
    Executed,
    Rejected,
}

/// A proposed mutating action awaiting batch approval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedOperation {
    pub id: String,
    /// Task or session that proposed the operation
    pub origin: Option<String>,
    pub kind: OperationKind,
    /// Workspace-relative path, or the command line for shell operations
    pub target: String,
    pub before_snapshot: Option<FileSnapshot>,
    pub proposed_content: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub status: StagedStatus,
}

impl StagedOperation {
    pub fn new(kind: OperationKind, target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            id: Uuid::new_v4().to_string(),
            origin: None,
            description: describe(kind, &target),
            kind,
            target,
            before_snapshot: None,
            proposed_content: None,
            created_at: Utc::now(),
            status: StagedStatus::Staged,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.proposed_content = Some(content.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: Option<FileSnapshot>) -> Self {
        self.before_snapshot = snapshot;
        self
    }

    /// Build a staged operation from a gated action. Returns `None` for actions
    /// that cannot be replayed later (reads, or network fetches without a
    /// command line).
    pub fn from_action(action: &RequestedAction) -> Option<Self> {
        let path = || action.path.as_ref().map(|p| p.to_string_lossy().to_string());
        let op = match action.kind {
            ActionKind::Write => Self::new(OperationKind::Write, path()?),
            ActionKind::Edit => Self::new(OperationKind::Edit, path()?),
            ActionKind::Delete => Self::new(OperationKind::Delete, path()?),
            ActionKind::Shell | ActionKind::Install | ActionKind::Network | ActionKind::VcsPush => {
                Self::new(OperationKind::ShellCommand, action.command.clone()?)
            }
            ActionKind::Read | ActionKind::Search | ActionKind::List | ActionKind::Diff => {
                return None
            }
        };
        Some(match &action.content {
            Some(content) => op.with_content(content.clone()),
            None => op,
        })
    }

    /// One-line review summary, e.g. `Write src/lib.rs (+3 -1 lines)`
    pub fn diff_summary(&self) -> String {
        let before = self
            .before_snapshot
            .as_ref()
            .and_then(|s| s.content.as_deref())
            .unwrap_or("");
        match self.kind {
            OperationKind::Write | OperationKind::Edit => {
                let after = self.proposed_content.as_deref().unwrap_or("");
                let (added, removed) = line_delta(before, after);
                format!("{} (+{} -{} lines)", self.description, added, removed)
            }
            OperationKind::Delete => {
                format!("{} (-{} lines)", self.description, before.lines().count())
            }
            OperationKind::ShellCommand => self.description.clone(),
        }
    }

    /// Patch-style rendering written into the task artifact folder
    pub fn render_patch(&self) -> String {
        let before = self
            .before_snapshot
            .as_ref()
            .and_then(|s| s.content.as_deref())
            .unwrap_or("");
        let mut out = String::new();
        match self.kind {
            OperationKind::ShellCommand => {
                let _ = writeln!(out, "$ {}", self.target);
            }
            OperationKind::Delete => {
                let _ = writeln!(out, "--- a/{}\n+++ /dev/null", self.target);
                for line in before.lines() {
                    let _ = writeln!(out, "-{}", line);
                }
            }
            OperationKind::Write | OperationKind::Edit => {
                let after = self.proposed_content.as_deref().unwrap_or("");
                let _ = writeln!(out, "--- a/{}\n+++ b/{}", self.target, self.target);
                let before_lines: Vec<&str> = before.lines().collect();
                let after_lines: Vec<&str> = after.lines().collect();
                for line in before_lines.iter().filter(|l| !after_lines.contains(l)) {
                    let _ = writeln!(out, "-{}", line);
                }
                for line in after_lines.iter().filter(|l| !before_lines.contains(l)) {
                    let _ = writeln!(out, "+{}", line);
                }
            }
        }
        out
    }
}

fn describe(kind: OperationKind, target: &str) -> String {
    let short = shorten(target, 50);
    match kind {
        OperationKind::Write => format!("Write to {}", short),
        OperationKind::Edit => format!("Edit {}", short),
        OperationKind::Delete => format!("Delete {}", short),
        OperationKind::ShellCommand => format!("Run: {}", short),
    }
}

fn shorten(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - (max_chars - 3)).collect();
    format!("...{}", tail)
}

fn line_delta(before: &str, after: &str) -> (usize, usize) {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for line in before.lines() {
        *counts.entry(line).or_default() -= 1;
    }
    for line in after.lines() {
        *counts.entry(line).or_default() += 1;
    }
    counts.values().fold((0, 0), |(added, removed), delta| {
        if *delta > 0 {
            (added + *delta as usize, removed)
        } else {
            (added, removed + delta.unsigned_abs() as usize)
        }
    })
}

// ============================================================================
// Approval hashing
// ============================================================================

/// Binds a specific content state to a user's consent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approval_id: String,
    /// Identifier of the reviewed plan or operation set
    pub plan_id: String,
    pub content_hash: String,
    pub operations_hash: String,
    pub operation_ids: Vec<String>,
    pub approved_at: DateTime<Utc>,
    pub hash_version: u32,
}

fn digest(rows: impl IntoIterator<Item = String>) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(row.as_bytes());
        hasher.update(b"\n");
    }
    format!("sha256:{:x}", hasher.finalize())
}

/// Length-prefixed so that field boundaries cannot be forged by content
fn field(value: &str) -> String {
    format!("{}:{}", value.len(), value)
}

/// Hash of the ordered operation id list
pub fn operations_hash(operation_ids: &[String]) -> String {
    let header = format!("tandem-staging-ops/v{}", APPROVAL_HASH_VERSION);
    digest(std::iter::once(header).chain(operation_ids.iter().map(|id| field(id))))
}

/// Hash of the reviewed plan text together with each operation's payload
pub fn content_hash(content: &str, operations: &[StagedOperation]) -> String {
    let header = format!("tandem-staging-content/v{}", APPROVAL_HASH_VERSION);
    let body = std::iter::once(field(content)).chain(operations.iter().map(|op| {
        let payload = op
            .proposed_content
            .as_deref()
            .map(|c| format!("{:x}", Sha256::digest(c.as_bytes())))
            .unwrap_or_default();
        format!(
            "{}|{}|{}|{}",
            field(&op.id),
            op.kind.as_str(),
            field(&op.target),
            payload
        )
    }));
    digest(std::iter::once(header).chain(body))
}

// ============================================================================
// Execution
// ============================================================================

/// Applies one staged operation to the outside world
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn apply(&self, operation: &StagedOperation) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationOutcome {
    Applied,
    Failed { error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation_id: String,
    pub description: String,
    pub outcome: OperationOutcome,
}

/// Per-operation results of one approved batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub approval_id: String,
    pub results: Vec<OperationResult>,
}

impl BatchOutcome {
    fn count(&self, f: impl Fn(&OperationOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| f(&r.outcome)).count()
    }

    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, OperationOutcome::Applied))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, OperationOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, OperationOutcome::Skipped { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.skipped() == 0
    }

    pub fn first_error(&self) -> Option<&str> {
        self.results.iter().find_map(|r| match &r.outcome {
            OperationOutcome::Failed { error } => Some(error.as_str()),
            _ => None,
        })
    }
}

#[derive(Default)]
struct StagingState {
    operations: Vec<StagedOperation>,
    /// Plan text currently under review
    plan_content: String,
    approvals: HashMap<String, ApprovalRecord>,
    /// Applied operations per approval id, kept for undo
    executed: HashMap<String, Vec<StagedOperation>>,
}

impl StagingState {
    fn ordered_ids(&self) -> Vec<String> {
        self.operations.iter().map(|op| op.id.clone()).collect()
    }

    fn reset_to_staged(&mut self) {
        for op in &mut self.operations {
            if op.status == StagedStatus::ApprovedPendingExecution {
                op.status = StagedStatus::Staged;
            }
        }
    }
}

/// Per-run staging area. All mutation happens under one async mutex, held for
/// the whole of a batch execution so nothing can be staged mid-batch.
#[derive(Default)]
pub struct StagingStore {
    state: Mutex<StagingState>,
}

impl StagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the plan text of a recovered run
    pub fn with_plan_content(content: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(StagingState {
                plan_content: content.into(),
                ..Default::default()
            }),
        }
    }

    pub async fn stage(&self, operation: StagedOperation) -> String {
        let mut state = self.state.lock().await;
        let id = operation.id.clone();
        tracing::info!(operation_id = %id, kind = operation.kind.as_str(), "Staged operation for batch execution");
        state.operations.push(StagedOperation {
            status: StagedStatus::Staged,
            ..operation
        });
        id
    }

    /// Operations in staging (insertion) order
    pub async fn list(&self) -> Vec<StagedOperation> {
        self.state.lock().await.operations.clone()
    }

    pub async fn count(&self) -> usize {
        self.state.lock().await.operations.len()
    }

    /// Unstage one operation. Unknown ids are a no-op.
    pub async fn remove(&self, operation_id: &str) -> Option<StagedOperation> {
        let mut state = self.state.lock().await;
        let index = state.operations.iter().position(|op| op.id == operation_id)?;
        Some(state.operations.remove(index))
    }

    /// Unstage one operation the reviewer turned down
    pub async fn reject(&self, operation_id: &str) -> Option<StagedOperation> {
        self.remove(operation_id).await.map(|op| StagedOperation {
            status: StagedStatus::Rejected,
            ..op
        })
    }

    /// Drop every operation proposed by `origin`. Outstanding approvals that
    /// covered them will drift.
    pub async fn discard_from(&self, origin: &str) -> Vec<StagedOperation> {
        let mut state = self.state.lock().await;
        let (discarded, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.operations)
            .into_iter()
            .partition(|op| op.origin.as_deref() == Some(origin));
        state.operations = kept;
        discarded
    }

    /// Ids of the operations `origin` still has waiting, in staging order
    pub async fn pending_from(&self, origin: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .operations
            .iter()
            .filter(|op| op.origin.as_deref() == Some(origin))
            .map(|op| op.id.clone())
            .collect()
    }

    /// Drop every staged operation and outstanding approval
    pub async fn clear(&self) -> Vec<StagedOperation> {
        let mut state = self.state.lock().await;
        state.approvals.clear();
        std::mem::take(&mut state.operations)
    }

    /// Hand back the operations a batch applied, in execution order, for
    /// undo. A batch can be undone once.
    pub async fn take_executed(&self, approval_id: &str) -> Option<Vec<StagedOperation>> {
        self.state.lock().await.executed.remove(approval_id)
    }

    pub async fn plan_content(&self) -> String {
        self.state.lock().await.plan_content.clone()
    }

    /// Replace the plan text under review. Any approval taken against the old
    /// text will drift.
    pub async fn set_plan_content(&self, content: impl Into<String>) {
        self.state.lock().await.plan_content = content.into();
    }

    /// Record consent for `content` and exactly the operations `operation_ids`,
    /// which must be the currently staged set in staging order.
    pub async fn approve_and_prepare(
        &self,
        plan_id: &str,
        content: &str,
        operation_ids: &[String],
    ) -> Result<ApprovalRecord> {
        let mut state = self.state.lock().await;
        Self::prepare_locked(&mut state, plan_id, content, operation_ids)
    }

    /// Approve and run the batch in one critical section, so nothing can be
    /// staged between consent and execution. Drift refuses before anything
    /// is recorded or applied.
    pub async fn approve_and_execute(
        &self,
        plan_id: &str,
        content: &str,
        operation_ids: &[String],
        executor: &dyn OperationExecutor,
        cancel: Option<&CancellationToken>,
    ) -> Result<(ApprovalRecord, BatchOutcome)> {
        let mut state = self.state.lock().await;
        let record = Self::prepare_locked(&mut state, plan_id, content, operation_ids)?;
        let outcome = Self::execute_locked(&mut state, &record, executor, cancel).await?;
        Ok((record, outcome))
    }

    fn prepare_locked(
        state: &mut StagingState,
        plan_id: &str,
        content: &str,
        operation_ids: &[String],
    ) -> Result<ApprovalRecord> {
        let current = state.ordered_ids();
        if current != operation_ids {
            return Err(OrchestratorError::ApprovalDrift(format!(
                "approval covers {} operation(s) but {} are staged in a different set or order",
                operation_ids.len(),
                current.len()
            )));
        }

        state.plan_content = content.to_string();
        let record = ApprovalRecord {
            approval_id: Uuid::new_v4().to_string(),
            plan_id: plan_id.to_string(),
            content_hash: content_hash(content, &state.operations),
            operations_hash: operations_hash(&current),
            operation_ids: current,
            approved_at: Utc::now(),
            hash_version: APPROVAL_HASH_VERSION,
        };
        for op in &mut state.operations {
            op.status = StagedStatus::ApprovedPendingExecution;
        }
        state
            .approvals
            .insert(record.approval_id.clone(), record.clone());
        Ok(record)
    }

    /// Check a record against the current store without executing anything
    pub async fn verify(&self, record: &ApprovalRecord) -> Result<()> {
        let state = self.state.lock().await;
        Self::check_drift(&state, record)
    }

    fn check_drift(state: &StagingState, record: &ApprovalRecord) -> Result<()> {
        if record.hash_version != APPROVAL_HASH_VERSION {
            return Err(OrchestratorError::ApprovalDrift(format!(
                "approval was hashed with format v{}, current format is v{}",
                record.hash_version, APPROVAL_HASH_VERSION
            )));
        }
        if state.approvals.get(&record.approval_id) != Some(record) {
            return Err(OrchestratorError::ApprovalDrift(
                "approval is unknown or was already used".to_string(),
            ));
        }
        if operations_hash(&state.ordered_ids()) != record.operations_hash {
            return Err(OrchestratorError::ApprovalDrift(
                "staged operations were added, removed or reordered since approval".to_string(),
            ));
        }
        if content_hash(&state.plan_content, &state.operations) != record.content_hash {
            return Err(OrchestratorError::ApprovalDrift(
                "plan content changed since approval".to_string(),
            ));
        }
        Ok(())
    }

    /// Execute exactly the approved batch. On any drift nothing runs and the
    /// approval is withdrawn. Execution stops at the first failure; later
    /// operations are reported as skipped and stay staged for re-review.
    pub async fn execute_approved(
        &self,
        record: &ApprovalRecord,
        executor: &dyn OperationExecutor,
        cancel: Option<&CancellationToken>,
    ) -> Result<BatchOutcome> {
        let mut state = self.state.lock().await;
        Self::execute_locked(&mut state, record, executor, cancel).await
    }

    async fn execute_locked(
        state: &mut StagingState,
        record: &ApprovalRecord,
        executor: &dyn OperationExecutor,
        cancel: Option<&CancellationToken>,
    ) -> Result<BatchOutcome> {
        if let Err(err) = Self::check_drift(state, record) {
            state.approvals.remove(&record.approval_id);
            state.reset_to_staged();
            tracing::warn!(approval_id = %record.approval_id, "Refusing staged batch: {}", err);
            return Err(err);
        }
        state.approvals.remove(&record.approval_id);

        let operations = std::mem::take(&mut state.operations);
        let mut results = Vec::with_capacity(operations.len());
        let mut remaining = Vec::new();
        let mut applied = Vec::new();
        let mut halted: Option<String> = None;

        for mut op in operations {
            if halted.is_none() && cancel.is_some_and(|c| c.is_cancelled()) {
                halted = Some("batch cancelled".to_string());
            }
            if let Some(reason) = &halted {
                results.push(OperationResult {
                    operation_id: op.id.clone(),
                    description: op.description.clone(),
                    outcome: OperationOutcome::Skipped {
                        reason: reason.clone(),
                    },
                });
                op.status = StagedStatus::Staged;
                remaining.push(op);
                continue;
            }

            match executor.apply(&op).await {
                Ok(()) => {
                    tracing::info!(operation_id = %op.id, "Executed staged operation");
                    results.push(OperationResult {
                        operation_id: op.id.clone(),
                        description: op.description.clone(),
                        outcome: OperationOutcome::Applied,
                    });
                    op.status = StagedStatus::Executed;
                    applied.push(op);
                }
                Err(err) => {
                    tracing::error!(operation_id = %op.id, "Staged operation failed: {}", err);
                    results.push(OperationResult {
                        operation_id: op.id.clone(),
                        description: op.description.clone(),
                        outcome: OperationOutcome::Failed {
                            error: err.to_string(),
                        },
                    });
                    halted = Some(format!("operation {} failed", op.id));
                    op.status = StagedStatus::Staged;
                    remaining.push(op);
                }
            }
        }

        state.operations = remaining;
        if !applied.is_empty() {
            state.executed.insert(record.approval_id.clone(), applied);
        }
        Ok(BatchOutcome {
            approval_id: record.approval_id.clone(),
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingExecutor {
        applied: StdMutex<Vec<String>>,
        fail_target: Option<String>,
    }

    #[async_trait]
    impl OperationExecutor for RecordingExecutor {
        async fn apply(&self, operation: &StagedOperation) -> Result<()> {
            if self.fail_target.as_deref() == Some(operation.target.as_str()) {
                return Err(OrchestratorError::Execution("disk full".to_string()));
            }
            self.applied.lock().unwrap().push(operation.target.clone());
            Ok(())
        }
    }

    async fn stage_writes(store: &StagingStore, targets: &[&str]) -> Vec<String> {
        let mut ids = Vec::new();
        for target in targets {
            let op = StagedOperation::new(OperationKind::Write, *target).with_content("new");
            ids.push(store.stage(op).await);
        }
        ids
    }

    #[tokio::test]
    async fn removing_an_approved_operation_drifts_without_side_effects() {
        let store = StagingStore::new();
        let ids = stage_writes(&store, &["a.txt", "b.txt", "c.txt"]).await;
        let record = store.approve_and_prepare("plan", "write three files", &ids).await.unwrap();

        assert!(store.remove(&ids[1]).await.is_some());

        let executor = RecordingExecutor::default();
        let err = store.execute_approved(&record, &executor, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ApprovalDrift(_)));
        assert!(executor.applied.lock().unwrap().is_empty());
        assert_eq!(store.count().await, 2);
    }

    #[tokio::test]
    async fn adding_an_operation_after_approval_drifts() {
        let store = StagingStore::new();
        let ids = stage_writes(&store, &["a.txt"]).await;
        let record = store.approve_and_prepare("plan", "content", &ids).await.unwrap();
        stage_writes(&store, &["sneaky.txt"]).await;

        let executor = RecordingExecutor::default();
        assert!(store.execute_approved(&record, &executor, None).await.is_err());
        assert!(executor.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn edited_plan_text_drifts() {
        let store = StagingStore::new();
        let ids = stage_writes(&store, &["a.txt"]).await;
        let record = store.approve_and_prepare("plan", "original", &ids).await.unwrap();
        store.set_plan_content("edited").await;

        let err = store.verify(&record).await.unwrap_err();
        assert!(err.to_string().contains("plan content changed"));
    }

    #[tokio::test]
    async fn approval_must_match_staging_order() {
        let store = StagingStore::new();
        let mut ids = stage_writes(&store, &["a.txt", "b.txt"]).await;
        ids.reverse();
        let err = store.approve_and_prepare("plan", "c", &ids).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ApprovalDrift(_)));
    }

    #[tokio::test]
    async fn approved_batch_runs_once_in_insertion_order() {
        let store = StagingStore::new();
        let ids = stage_writes(&store, &["a.txt", "b.txt", "c.txt"]).await;
        let record = store.approve_and_prepare("plan", "c", &ids).await.unwrap();

        let executor = RecordingExecutor::default();
        let outcome = store.execute_approved(&record, &executor, None).await.unwrap();
        assert_eq!(outcome.applied(), 3);
        assert_eq!(*executor.applied.lock().unwrap(), vec!["a.txt", "b.txt", "c.txt"]);
        assert_eq!(store.count().await, 0);
        let executed = store.take_executed(&record.approval_id).await.unwrap();
        assert_eq!(executed.len(), 3);
        assert!(executed.iter().all(|op| op.status == StagedStatus::Executed));
        assert!(store.take_executed(&record.approval_id).await.is_none());

        // the record is consumed
        assert!(store.execute_approved(&record, &executor, None).await.is_err());
    }

    #[tokio::test]
    async fn partial_failure_stops_at_the_failing_operation() {
        let store = StagingStore::new();
        let ids = stage_writes(&store, &["a.txt", "b.txt", "c.txt"]).await;
        let record = store.approve_and_prepare("plan", "c", &ids).await.unwrap();

        let executor = RecordingExecutor {
            fail_target: Some("b.txt".to_string()),
            ..Default::default()
        };
        let outcome = store.execute_approved(&record, &executor, None).await.unwrap();
        assert_eq!(outcome.applied(), 1);
        assert_eq!(outcome.failed(), 1);
        assert_eq!(outcome.skipped(), 1);
        assert_eq!(outcome.first_error(), Some("Execution failed: disk full"));
        assert_eq!(*executor.applied.lock().unwrap(), vec!["a.txt"]);

        let left: Vec<String> = store.list().await.into_iter().map(|op| op.target).collect();
        assert_eq!(left, vec!["b.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn cancelled_batch_skips_everything() {
        let store = StagingStore::new();
        let ids = stage_writes(&store, &["a.txt", "b.txt"]).await;
        let record = store.approve_and_prepare("plan", "c", &ids).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let executor = RecordingExecutor::default();
        let outcome = store.execute_approved(&record, &executor, Some(&token)).await.unwrap();
        assert_eq!(outcome.skipped(), 2);
        assert!(executor.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn removal_is_idempotent_and_clear_empties() {
        let store = StagingStore::new();
        stage_writes(&store, &["a.txt", "b.txt"]).await;
        assert!(store.remove("missing").await.is_none());
        assert_eq!(store.count().await, 2);

        let cleared = store.clear().await;
        assert_eq!(cleared.len(), 2);
        assert!(store.list().await.is_empty());
        assert!(store.clear().await.is_empty());
    }

    #[tokio::test]
    async fn approve_and_execute_refuses_a_stale_set_before_recording_anything() {
        let store = StagingStore::new();
        let ids = stage_writes(&store, &["a.txt"]).await;
        stage_writes(&store, &["late.txt"]).await;

        let executor = RecordingExecutor::default();
        let err = store
            .approve_and_execute("plan", "c", &ids, &executor, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ApprovalDrift(_)));
        assert!(executor.applied.lock().unwrap().is_empty());
        assert!(store
            .list()
            .await
            .iter()
            .all(|op| op.status == StagedStatus::Staged));

        let ids: Vec<String> = store.list().await.into_iter().map(|op| op.id).collect();
        let (record, outcome) = store
            .approve_and_execute("plan", "c", &ids, &executor, None)
            .await
            .unwrap();
        assert_eq!(outcome.approval_id, record.approval_id);
        assert_eq!(outcome.applied(), 2);
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn operations_are_tracked_and_discarded_per_origin() {
        let store = StagingStore::new();
        let mine = store
            .stage(StagedOperation::new(OperationKind::Write, "a.txt").with_origin("A"))
            .await;
        store
            .stage(StagedOperation::new(OperationKind::Write, "b.txt").with_origin("B"))
            .await;
        store.stage(StagedOperation::new(OperationKind::Delete, "c.txt")).await;

        assert_eq!(store.pending_from("A").await, vec![mine.clone()]);
        let discarded = store.discard_from("A").await;
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].id, mine);
        assert!(store.pending_from("A").await.is_empty());
        assert_eq!(store.count().await, 2);
    }

    #[tokio::test]
    async fn rejected_operation_leaves_the_store() {
        let store = StagingStore::new();
        let ids = stage_writes(&store, &["a.txt"]).await;
        let rejected = store.reject(&ids[0]).await.unwrap();
        assert_eq!(rejected.status, StagedStatus::Rejected);
        assert_eq!(store.count().await, 0);
        assert!(store.reject(&ids[0]).await.is_none());
    }

    #[test]
    fn hashes_are_order_sensitive() {
        let a = vec!["1".to_string(), "2".to_string()];
        let b = vec!["2".to_string(), "1".to_string()];
        assert_ne!(operations_hash(&a), operations_hash(&b));
        assert_eq!(operations_hash(&a), operations_hash(&a.clone()));
        let hash = operations_hash(&a);
        let hex = hash.strip_prefix("sha256:").unwrap();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn diff_summary_counts_lines() {
        let op = StagedOperation::new(OperationKind::Edit, "src/lib.rs")
            .with_snapshot(Some(FileSnapshot {
                path: "src/lib.rs".to_string(),
                content: Some("a\nb\nc\n".to_string()),
                exists: true,
                is_directory: false,
            }))
            .with_content("a\nc\nd\ne\n");
        assert_eq!(op.diff_summary(), "Edit src/lib.rs (+2 -1 lines)");
        assert!(op.render_patch().contains("+d"));
    }

    #[test]
    fn read_actions_are_not_stageable() {
        let read = RequestedAction::on_path(ActionKind::Read, "a.txt");
        assert!(StagedOperation::from_action(&read).is_none());
        let shell = RequestedAction::shell("make build");
        let op = StagedOperation::from_action(&shell).unwrap();
        assert_eq!(op.kind, OperationKind::ShellCommand);
        assert_eq!(op.description, "Run: make build");
    }
}
