// Run Registry
// Live engines for one process, keyed by run id, over a shared artifact store

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use tandem_observability::ProcessKind;

use crate::agents::Generator;
use crate::budget::BudgetLedger;
use crate::config::OrchestratorConfig;
use crate::engine::{PlanReview, RunEngine};
use crate::error::{OrchestratorError, Result};
use crate::secrets::SecretStore;
use crate::staging::{ApprovalRecord, BatchOutcome, StagedOperation};
use crate::store::ArtifactStore;
use crate::types::{Run, RunEventRecord, RunSnapshot, RunSummary, Task};

/// Finished engines kept in memory so their staged batches can still be
/// reviewed or undone
const DEFAULT_FINISHED_CAPACITY: usize = 8;

pub struct RunRegistry {
    store: Arc<ArtifactStore>,
    generator: Arc<dyn Generator>,
    secrets: Arc<dyn SecretStore>,
    defaults: OrchestratorConfig,
    process: ProcessKind,
    runs: RwLock<HashMap<String, RunEngine>>,
    /// Terminal runs still in `runs`, oldest first
    finished: Mutex<VecDeque<String>>,
    finished_capacity: usize,
}

impl RunRegistry {
    pub fn new(
        store: Arc<ArtifactStore>,
        generator: Arc<dyn Generator>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            store,
            generator,
            secrets,
            defaults: OrchestratorConfig::default(),
            process: ProcessKind::Service,
            runs: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            finished_capacity: DEFAULT_FINISHED_CAPACITY,
        }
    }

    /// Config used when `create_run` is given none
    pub fn with_defaults(mut self, config: OrchestratorConfig) -> Self {
        self.defaults = config;
        self
    }

    pub fn with_process_kind(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    /// How many finished runs stay live before the oldest is dropped from
    /// memory (it remains on disk)
    pub fn with_finished_capacity(mut self, capacity: usize) -> Self {
        self.finished_capacity = capacity;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn create_run(
        &self,
        objective: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
        config: Option<OrchestratorConfig>,
    ) -> Result<String> {
        let objective = objective.into();
        if objective.trim().is_empty() {
            return Err(OrchestratorError::InvalidOperation(
                "Objective must not be empty".to_string(),
            ));
        }
        let workspace_root = workspace_root.into();
        if !workspace_root.is_dir() {
            return Err(OrchestratorError::NotFound(format!(
                "workspace {}",
                workspace_root.display()
            )));
        }
        let config = config.unwrap_or_else(|| self.defaults.clone());
        config.validate()?;

        let run_id = Uuid::new_v4().to_string();
        let run = Run::new(run_id.clone(), objective, config, workspace_root);
        let engine = self.engine_for(run);
        engine.register().await?;

        tracing::info!(run_id = %run_id, "Created orchestrator run");
        self.runs.write().await.insert(run_id.clone(), engine);
        Ok(run_id)
    }

    fn engine_for(&self, run: Run) -> RunEngine {
        RunEngine::new(run, self.store.clone(), self.generator.clone(), self.secrets.clone())
            .with_process_kind(self.process)
    }

    /// Live engine for `run_id`, rehydrating it from disk if needed
    pub async fn engine(&self, run_id: &str) -> Result<RunEngine> {
        if let Some(engine) = self.runs.read().await.get(run_id) {
            return Ok(engine.clone());
        }
        self.load_run(run_id).await
    }

    /// Recover a persisted run into a live engine. Runs that were mid-flight
    /// come back paused.
    pub async fn load_run(&self, run_id: &str) -> Result<RunEngine> {
        let engine = {
            let mut runs = self.runs.write().await;
            if let Some(engine) = runs.get(run_id) {
                return Ok(engine.clone());
            }
            if !self.store.run_exists(run_id) {
                return Err(OrchestratorError::NotFound(format!("run {}", run_id)));
            }
            let engine = self.engine_for(self.store.recover_run(run_id)?);
            runs.insert(run_id.to_string(), engine.clone());
            engine
        };
        self.retire_if_finished(&engine).await;
        Ok(engine)
    }

    /// Track a terminal engine and drop the oldest finished ones past the
    /// capacity
    async fn retire_if_finished(&self, engine: &RunEngine) {
        if !engine.status().await.is_terminal() {
            return;
        }
        let mut finished = self.finished.lock().await;
        if !finished.iter().any(|id| id == engine.run_id()) {
            finished.push_back(engine.run_id().to_string());
        }
        while finished.len() > self.finished_capacity {
            let Some(evicted) = finished.pop_front() else {
                break;
            };
            self.runs.write().await.remove(&evicted);
            tracing::debug!(run_id = %evicted, "Evicted finished run from memory");
        }
    }

    /// Run a driving call, then retire the engine if the run ended
    async fn drive<T, F, Fut>(&self, run_id: &str, call: F) -> Result<T>
    where
        F: FnOnce(RunEngine) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let engine = self.engine(run_id).await?;
        let result = call(engine.clone()).await;
        self.retire_if_finished(&engine).await;
        result
    }

    pub async fn active_run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every persisted run, newest first
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        self.store.list_runs()
    }

    pub fn events(&self, run_id: &str) -> Result<Vec<RunEventRecord>> {
        if !self.store.run_exists(run_id) {
            return Err(OrchestratorError::NotFound(format!("run {}", run_id)));
        }
        self.store.load_events(run_id)
    }

    /// Cancel the run if it is still live, then remove it from memory and disk
    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        ArtifactStore::validate_run_id(run_id)?;
        self.finished.lock().await.retain(|id| id != run_id);
        let engine = self.runs.write().await.remove(run_id);
        if let Some(engine) = engine {
            if !engine.status().await.is_terminal() {
                engine.cancel_and_finalize().await?;
            }
        } else if !self.store.run_exists(run_id) {
            return Err(OrchestratorError::NotFound(format!("run {}", run_id)));
        }
        self.store.delete_run(run_id)?;
        tracing::info!(run_id, "Deleted orchestrator run");
        Ok(())
    }

    // ========================================================================
    // Run control
    // ========================================================================

    pub async fn start(&self, run_id: &str) -> Result<()> {
        self.drive(run_id, |engine| async move { engine.start().await }).await
    }

    pub async fn plan_review(&self, run_id: &str) -> Result<PlanReview> {
        self.engine(run_id).await?.plan_review().await
    }

    pub async fn approve(&self, run_id: &str) -> Result<()> {
        self.drive(run_id, |engine| async move { engine.approve().await }).await
    }

    pub async fn approve_plan(&self, run_id: &str, review: &PlanReview) -> Result<()> {
        self.drive(run_id, |engine| async move { engine.approve_plan(review).await })
            .await
    }

    pub async fn request_revision(&self, run_id: &str, feedback: impl Into<String>) -> Result<()> {
        let feedback = feedback.into();
        self.drive(run_id, |engine| async move { engine.request_revision(feedback).await })
            .await
    }

    pub async fn pause(&self, run_id: &str) -> Result<()> {
        self.engine(run_id).await?.pause().await
    }

    pub async fn resume(&self, run_id: &str) -> Result<()> {
        self.drive(run_id, |engine| async move { engine.resume().await }).await
    }

    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        self.drive(run_id, |engine| async move { engine.cancel_and_finalize().await })
            .await
    }

    pub async fn snapshot(&self, run_id: &str) -> Result<RunSnapshot> {
        Ok(self.engine(run_id).await?.snapshot().await)
    }

    pub async fn list_tasks(&self, run_id: &str) -> Result<Vec<Task>> {
        Ok(self.engine(run_id).await?.tasks().await)
    }

    pub async fn budget(&self, run_id: &str) -> Result<BudgetLedger> {
        Ok(self.engine(run_id).await?.budget().await)
    }

    pub async fn subscribe(&self, run_id: &str) -> Result<broadcast::Receiver<RunEventRecord>> {
        Ok(self.engine(run_id).await?.subscribe())
    }

    // ========================================================================
    // Staging
    // ========================================================================

    pub async fn list_staged(&self, run_id: &str) -> Result<Vec<StagedOperation>> {
        Ok(self.engine(run_id).await?.list_staged().await)
    }

    pub async fn stage_operation(&self, run_id: &str, operation: StagedOperation) -> Result<String> {
        self.engine(run_id).await?.stage_operation(operation).await
    }

    pub async fn unstage(&self, run_id: &str, operation_id: &str) -> Result<Option<StagedOperation>> {
        Ok(self.engine(run_id).await?.unstage(operation_id).await)
    }

    pub async fn reject_staged(
        &self,
        run_id: &str,
        operation_id: &str,
        reason: &str,
    ) -> Result<Option<StagedOperation>> {
        Ok(self.engine(run_id).await?.reject_staged(operation_id, reason).await)
    }

    pub async fn clear_staged(&self, run_id: &str) -> Result<Vec<StagedOperation>> {
        Ok(self.engine(run_id).await?.clear_staged().await)
    }

    pub async fn approve_batch(&self, run_id: &str, operation_ids: &[String]) -> Result<ApprovalRecord> {
        self.engine(run_id).await?.approve_batch(operation_ids).await
    }

    pub async fn execute_approved_batch(
        &self,
        run_id: &str,
        record: &ApprovalRecord,
    ) -> Result<BatchOutcome> {
        self.engine(run_id).await?.execute_approved_batch(record).await
    }

    pub async fn undo_batch(&self, run_id: &str, approval_id: &str) -> Result<usize> {
        self.engine(run_id).await?.undo_batch(approval_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{ScriptedGenerator, ScriptedResponse};
    use crate::secrets::StaticSecretStore;
    use crate::types::{AgentRole, RunStatus};
    use tempfile::tempdir;

    fn generator() -> Arc<ScriptedGenerator> {
        let plan = r#"[{"id": "t1", "title": "Write docs", "description": "Add README"}]"#;
        Arc::new(
            ScriptedGenerator::new(HashMap::new())
                .with_role(
                    AgentRole::Planner,
                    vec![ScriptedResponse {
                        text: plan.to_string(),
                        ..Default::default()
                    }],
                )
                .with_role(
                    AgentRole::Builder,
                    vec![ScriptedResponse {
                        text: "done".to_string(),
                        ..Default::default()
                    }],
                )
                .with_role(
                    AgentRole::Validator,
                    vec![ScriptedResponse {
                        text: r#"{"passed": true, "feedback": "ok"}"#.to_string(),
                        ..Default::default()
                    }],
                ),
        )
    }

    fn registry(state: &std::path::Path) -> RunRegistry {
        RunRegistry::new(
            Arc::new(ArtifactStore::new(state).unwrap()),
            generator(),
            Arc::new(StaticSecretStore::new()),
        )
    }

    #[tokio::test]
    async fn create_rejects_invalid_input() {
        let state = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let registry = registry(state.path());

        assert!(registry.create_run("  ", workspace.path(), None).await.is_err());
        assert!(matches!(
            registry
                .create_run("Goal", workspace.path().join("missing"), None)
                .await,
            Err(OrchestratorError::NotFound(_))
        ));
        let mut config = OrchestratorConfig::default();
        config.max_parallel_tasks = 0;
        assert!(matches!(
            registry.create_run("Goal", workspace.path(), Some(config)).await,
            Err(OrchestratorError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn full_lifecycle_through_registry() {
        let state = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let registry = registry(state.path());

        let run_id = registry.create_run("Document the crate", workspace.path(), None).await.unwrap();
        registry.start(&run_id).await.unwrap();
        assert_eq!(registry.list_tasks(&run_id).await.unwrap().len(), 1);
        registry.approve(&run_id).await.unwrap();

        let snapshot = registry.snapshot(&run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(registry.list_runs().unwrap().len(), 1);
        assert!(!registry.events(&run_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn runs_survive_a_registry_restart() {
        let state = tempdir().unwrap();
        let workspace = tempdir().unwrap();

        let run_id = {
            let registry = registry(state.path());
            let run_id = registry.create_run("Goal", workspace.path(), None).await.unwrap();
            registry.start(&run_id).await.unwrap();
            run_id
        };

        let restarted = registry(state.path());
        assert!(restarted.active_run_ids().await.is_empty());
        let snapshot = restarted.snapshot(&run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::AwaitingApproval);
        assert_eq!(restarted.active_run_ids().await, vec![run_id.clone()]);

        restarted.approve(&run_id).await.unwrap();
        assert_eq!(
            restarted.snapshot(&run_id).await.unwrap().status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn finished_runs_are_evicted_past_capacity() {
        let state = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let registry = registry(state.path()).with_finished_capacity(1);

        let first = registry.create_run("First", workspace.path(), None).await.unwrap();
        registry.start(&first).await.unwrap();
        registry.approve(&first).await.unwrap();
        assert_eq!(registry.active_run_ids().await, vec![first.clone()]);

        let second = registry.create_run("Second", workspace.path(), None).await.unwrap();
        registry.start(&second).await.unwrap();
        assert_eq!(registry.active_run_ids().await.len(), 2);
        registry.approve(&second).await.unwrap();
        assert_eq!(registry.active_run_ids().await, vec![second.clone()]);

        // still on disk, and reading it back does not grow the map
        assert_eq!(
            registry.snapshot(&first).await.unwrap().status,
            RunStatus::Completed
        );
        assert_eq!(registry.active_run_ids().await, vec![first.clone()]);
        assert_eq!(registry.finished.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn delete_refuses_ids_outside_the_store() {
        let state = tempdir().unwrap();
        let registry = registry(state.path());
        assert!(matches!(
            registry.delete_run("../escape").await,
            Err(OrchestratorError::InvalidOperation(_))
        ));
        assert!(state.path().exists());
    }

    #[tokio::test]
    async fn delete_cancels_and_removes() {
        let state = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let registry = registry(state.path());

        let run_id = registry.create_run("Goal", workspace.path(), None).await.unwrap();
        registry.start(&run_id).await.unwrap();
        registry.delete_run(&run_id).await.unwrap();

        assert!(!registry.store().run_exists(&run_id));
        assert!(matches!(
            registry.snapshot(&run_id).await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            registry.delete_run(&run_id).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
