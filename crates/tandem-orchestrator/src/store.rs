// Artifact Store
// Run-scoped persistence: snapshots, the sequenced event log, task artifacts and
// crash recovery by event replay

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::budget::BudgetLedger;
use crate::error::{OrchestratorError, Result};
use crate::types::{RunEventRecord, Run, RunStatus, RunSummary, Task, TaskState};

/// Directory under a workspace root that holds orchestrator state
pub const ARTIFACT_DIR_NAME: &str = ".tandem";

const RUN_FILE: &str = "run.json";
const TASKS_FILE: &str = "tasks.json";
const BUDGET_FILE: &str = "budget.json";
const EVENTS_FILE: &str = "events.jsonl";
const SUMMARY_FILE: &str = "summary.md";
const TASKS_DIR: &str = "tasks";

// ============================================================================
// Artifact Store
// ============================================================================

/// Filesystem layout keyed by run id:
///
/// ```text
/// <base>/<run_id>/run.json
///                 tasks.json
///                 budget.json
///                 events.jsonl
///                 summary.md
///                 tasks/<task_id>/{patch.diff,notes.md,validation.json}
/// ```
pub struct ArtifactStore {
    base_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Store kept inside a workspace at `.tandem/orchestrator`
    pub fn for_workspace(workspace_root: &Path) -> Result<Self> {
        Self::new(workspace_root.join(ARTIFACT_DIR_NAME).join("orchestrator"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    /// Run ids become directory names: `[A-Za-z0-9._-]` only, and never `.`
    /// or `..`
    pub fn validate_run_id(run_id: &str) -> Result<()> {
        if run_id.is_empty() || run_id == "." || run_id == ".." {
            return Err(OrchestratorError::InvalidOperation(format!(
                "invalid run id '{}'",
                run_id
            )));
        }
        if run_id
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(OrchestratorError::InvalidOperation(format!(
                "run id must be [A-Za-z0-9._-] only (got '{}')",
                run_id
            )));
        }
        Ok(())
    }

    fn checked_run_dir(&self, run_id: &str) -> Result<PathBuf> {
        Self::validate_run_id(run_id)?;
        Ok(self.run_dir(run_id))
    }

    pub fn create_run_dir(&self, run_id: &str) -> Result<PathBuf> {
        let dir = self.checked_run_dir(run_id)?;
        fs::create_dir_all(dir.join(TASKS_DIR))?;
        Ok(dir)
    }

    /// Persist the run snapshot together with its task and budget files
    pub fn save_run(&self, run: &Run) -> Result<()> {
        let dir = self.create_run_dir(&run.run_id)?;
        atomic_write(&dir.join(TASKS_FILE), &serde_json::to_string_pretty(&run.tasks)?)?;
        atomic_write(&dir.join(BUDGET_FILE), &serde_json::to_string_pretty(&run.budget)?)?;
        // run.json last: its last_event_seq claims the other files are current
        atomic_write(&dir.join(RUN_FILE), &serde_json::to_string_pretty(run)?)
    }

    pub fn load_run(&self, run_id: &str) -> Result<Run> {
        let path = self.checked_run_dir(run_id)?.join(RUN_FILE);
        if !path.exists() {
            return Err(OrchestratorError::NotFound(format!("Run not found: {}", run_id)));
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    pub fn load_tasks(&self, run_id: &str) -> Result<Vec<Task>> {
        let content = fs::read_to_string(self.checked_run_dir(run_id)?.join(TASKS_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn load_budget(&self, run_id: &str) -> Result<BudgetLedger> {
        let content = fs::read_to_string(self.checked_run_dir(run_id)?.join(BUDGET_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Append one sequenced event as a JSON line
    pub fn append_event(&self, record: &RunEventRecord) -> Result<()> {
        let run_dir = self.checked_run_dir(&record.run_id)?;
        // Events can arrive before the first snapshot is written
        fs::create_dir_all(&run_dir)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(EVENTS_FILE))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// All readable events in log order. A torn trailing line from a crash is
    /// skipped.
    pub fn load_events(&self, run_id: &str) -> Result<Vec<RunEventRecord>> {
        let path = self.checked_run_dir(run_id)?.join(EVENTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunEventRecord>(&line) {
                Ok(record) => events.push(record),
                Err(e) => tracing::warn!(run_id, "Skipping unreadable event line: {}", e),
            }
        }
        Ok(events)
    }

    pub fn latest_event_seq(&self, run_id: &str) -> Result<u64> {
        Ok(self
            .load_events(run_id)?
            .iter()
            .map(|r| r.seq)
            .max()
            .unwrap_or(0))
    }

    pub fn save_summary(&self, run_id: &str, summary: &str) -> Result<()> {
        let dir = self.create_run_dir(run_id)?;
        atomic_write(&dir.join(SUMMARY_FILE), summary)
    }

    pub fn load_summary(&self, run_id: &str) -> Result<String> {
        Ok(fs::read_to_string(self.checked_run_dir(run_id)?.join(SUMMARY_FILE))?)
    }

    /// Write `tasks/<task_id>/<filename>`; returns the path relative to the
    /// run folder
    pub fn save_artifact(
        &self,
        run_id: &str,
        task_id: &str,
        filename: &str,
        content: &str,
    ) -> Result<String> {
        let dir = self.checked_run_dir(run_id)?.join(TASKS_DIR).join(task_id);
        fs::create_dir_all(&dir)?;
        atomic_write(&dir.join(filename), content)?;
        Ok(format!("{}/{}/{}", TASKS_DIR, task_id, filename))
    }

    pub fn load_artifact(&self, run_id: &str, task_id: &str, filename: &str) -> Result<String> {
        let path = self
            .checked_run_dir(run_id)?
            .join(TASKS_DIR)
            .join(task_id)
            .join(filename);
        fs::read_to_string(&path)
            .map_err(|_| OrchestratorError::NotFound(format!("Artifact not found: {}", path.display())))
    }

    /// Ids of every run directory under the base
    pub fn list_run_ids(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    runs.push(name.to_string());
                }
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// Summaries of every persisted run, newest first
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut summaries: Vec<RunSummary> = self
            .list_run_ids()?
            .iter()
            .filter_map(|id| match self.load_run(id) {
                Ok(run) => Some(run.to_summary()),
                Err(e) => {
                    tracing::debug!(run_id = %id, "Skipping run without snapshot: {}", e);
                    None
                }
            })
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    pub fn delete_run(&self, run_id: &str) -> Result<()> {
        let dir = self.checked_run_dir(run_id)?;
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn run_exists(&self, run_id: &str) -> bool {
        self.checked_run_dir(run_id)
            .map(|dir| dir.join(RUN_FILE).exists())
            .unwrap_or(false)
    }

    /// Rebuild a run after a crash: load the last snapshot, fold in every event
    /// logged after it, and park anything that was mid-flight. Tasks found
    /// Running go back to Pending, and so do tasks held for staged writes
    /// (staged operations live in memory and do not survive a restart). A
    /// run that was planning or executing comes back Paused so resuming
    /// re-validates its budget.
    pub fn recover_run(&self, run_id: &str) -> Result<Run> {
        let mut run = self.load_run(run_id)?;
        let events = self.load_events(run_id)?;

        let snapshot_seq = run.last_event_seq;
        let mut replayed = 0usize;
        for record in events.iter().filter(|r| r.seq > snapshot_seq) {
            run.apply_event(&record.event);
            run.last_event_seq = record.seq;
            run.updated_at = record.timestamp;
            replayed += 1;
        }

        for task in run.tasks.iter_mut() {
            if matches!(task.state, TaskState::Running | TaskState::AwaitingApproval) {
                task.state = TaskState::Pending;
            }
        }

        let resume_into = match run.status {
            RunStatus::Planning | RunStatus::RevisionRequested => Some(RunStatus::Planning),
            RunStatus::Executing => Some(RunStatus::Executing),
            _ => None,
        };
        if let Some(from) = resume_into {
            run.paused_from = Some(from);
            run.status = RunStatus::Paused;
        }

        tracing::info!(
            run_id,
            replayed,
            status = run.status.as_str(),
            "Recovered run from snapshot and event log"
        );
        Ok(run)
    }
}

/// Atomic write using temp file and rename
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
