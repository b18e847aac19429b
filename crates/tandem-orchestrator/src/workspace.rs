// Workspace
// Filesystem access scoped to the run's declared root, plus the executor that
// applies staged operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;

use crate::error::{OrchestratorError, Result};
use crate::locks::ResourceLimits;
use crate::policy::normalize_lexically;
use crate::staging::{OperationExecutor, OperationKind, StagedOperation};
use crate::store::ARTIFACT_DIR_NAME;
use crate::types::Task;

const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_CONTEXT_FILES: usize = 6;
const MAX_CONTEXT_BYTES_PER_FILE: usize = 8 * 1024;

/// Snapshot of a file's state for diffing and undo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    /// Workspace-relative path
    pub path: String,
    pub content: Option<String>,
    pub exists: bool,
    pub is_directory: bool,
}

#[derive(Clone)]
pub struct Workspace {
    root: PathBuf,
    shell_timeout: Duration,
    limits: Option<Arc<ResourceLimits>>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            shell_timeout: DEFAULT_SHELL_TIMEOUT,
            limits: None,
        }
    }

    /// Serialize writes and shell commands through the run's permits
    pub fn with_limits(mut self, limits: Arc<ResourceLimits>) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_shell_timeout(mut self, timeout: Duration) -> Self {
        self.shell_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for `path` inside the root, or `OutOfScope`
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let out_of_scope = || OrchestratorError::OutOfScope(path.display().to_string());
        let normalized = normalize_lexically(&joined).ok_or_else(out_of_scope)?;
        if !normalized.starts_with(&self.root) {
            return Err(out_of_scope());
        }
        // Symlinks may still point elsewhere once the target exists
        if let Ok(real) = std::fs::canonicalize(&normalized) {
            if !real.starts_with(&self.root) {
                return Err(out_of_scope());
            }
        }
        Ok(normalized)
    }

    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    pub async fn read(&self, path: impl AsRef<Path>) -> Result<String> {
        let resolved = self.resolve(path)?;
        Ok(fs::read_to_string(resolved).await?)
    }

    pub async fn write(&self, path: impl AsRef<Path>, content: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&resolved, content).await?;
        Ok(())
    }

    pub async fn delete(&self, path: impl AsRef<Path>) -> Result<()> {
        let resolved = self.resolve(path)?;
        let meta = fs::metadata(&resolved)
            .await
            .map_err(|_| OrchestratorError::NotFound(self.relative(&resolved)))?;
        if meta.is_dir() {
            fs::remove_dir_all(&resolved).await?;
        } else {
            fs::remove_file(&resolved).await?;
        }
        Ok(())
    }

    pub async fn snapshot(&self, path: impl AsRef<Path>) -> Result<FileSnapshot> {
        let resolved = self.resolve(path)?;
        let (exists, is_directory) = match fs::metadata(&resolved).await {
            Ok(meta) => (true, meta.is_dir()),
            Err(_) => (false, false),
        };
        let content = if exists && !is_directory {
            fs::read_to_string(&resolved).await.ok()
        } else {
            None
        };
        Ok(FileSnapshot {
            path: self.relative(&resolved),
            content,
            exists,
            is_directory,
        })
    }

    /// Put a file back the way a snapshot saw it
    pub async fn restore(&self, snapshot: &FileSnapshot) -> Result<()> {
        let resolved = self.resolve(&snapshot.path)?;
        if snapshot.exists {
            if let Some(content) = &snapshot.content {
                self.write(&snapshot.path, content).await?;
                tracing::info!("Reverted file: {}", snapshot.path);
            }
        } else if fs::metadata(&resolved).await.is_ok() {
            fs::remove_file(&resolved).await?;
            tracing::info!("Deleted file (undo create): {}", snapshot.path);
        }
        Ok(())
    }

    /// Gitignore-aware listing of workspace files, relative to the root
    pub async fn list(&self, limit: usize) -> Result<Vec<String>> {
        let root = self.root.clone();
        let mut files = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for entry in WalkBuilder::new(root.as_path()).build().flatten() {
                if !entry.file_type().map(|f| f.is_file()).unwrap_or(false) {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                if relative.starts_with(ARTIFACT_DIR_NAME) || relative.starts_with(".git/") {
                    continue;
                }
                files.push(relative);
            }
            files
        })
        .await
        .map_err(|e| OrchestratorError::Execution(format!("workspace scan failed: {}", e)))?;
        files.sort();
        files.truncate(limit);
        Ok(files)
    }

    /// Bounded description of the workspace handed to the planner
    pub async fn summary(&self) -> String {
        let files = match self.list(200).await {
            Ok(files) => files,
            Err(err) => {
                return format!(
                    "Workspace: {}\nWorkspace scan unavailable: {}",
                    self.root.display(),
                    err
                )
            }
        };

        let mut top_level: Vec<String> = files
            .iter()
            .map(|f| f.split('/').next().unwrap_or(f).to_string())
            .collect();
        top_level.dedup();

        let preview = if top_level.is_empty() {
            "(none)".to_string()
        } else {
            top_level.iter().take(20).cloned().collect::<Vec<_>>().join(", ")
        };
        let sparse_note = if files.is_empty() {
            "\nWorkspace appears empty. Plan to create starter files rather than inspect existing ones."
        } else {
            ""
        };

        format!(
            "Workspace: {}\nTop-level entries: {}\nFile count (first 200 scanned): {}{}",
            self.root.display(),
            preview,
            files.len(),
            sparse_note
        )
    }

    /// Only the files a task mentions by path or file name, each truncated
    pub async fn task_context(&self, task: &Task) -> String {
        let files = self.list(2000).await.unwrap_or_default();
        let haystack = format!(
            "{}\n{}\n{}",
            task.title,
            task.description,
            task.acceptance_criteria.join("\n")
        );

        let relevant: Vec<&String> = files
            .iter()
            .filter(|path| {
                let name = path.rsplit('/').next().unwrap_or(path);
                haystack.contains(path.as_str()) || (name.contains('.') && haystack.contains(name))
            })
            .take(MAX_CONTEXT_FILES)
            .collect();

        if relevant.is_empty() {
            return "No existing files are referenced by this task.".to_string();
        }

        let mut out = String::new();
        for path in relevant {
            let Ok(content) = self.read(path).await else {
                continue;
            };
            let truncated = truncate_on_char_boundary(&content, MAX_CONTEXT_BYTES_PER_FILE);
            out.push_str(&format!("### {}\n```\n{}\n```\n", path, truncated));
            if truncated.len() < content.len() {
                out.push_str("(truncated)\n");
            }
        }
        out
    }

    /// Run a shell command in the workspace root with a timeout. Non-zero exit
    /// is an error carrying stderr.
    pub async fn run_shell(&self, command: &str) -> Result<String> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.shell_timeout, child)
            .await
            .map_err(|_| {
                OrchestratorError::Timeout(format!(
                    "shell command exceeded {}s",
                    self.shell_timeout.as_secs()
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::Execution(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn truncate_on_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[async_trait]
impl OperationExecutor for Workspace {
    async fn apply(&self, operation: &StagedOperation) -> Result<()> {
        match operation.kind {
            OperationKind::Write | OperationKind::Edit | OperationKind::Delete => {
                let path = self.resolve(&operation.target)?;
                let _guard = match &self.limits {
                    Some(limits) => Some(limits.write_guard(&path).await?),
                    None => None,
                };
                if operation.kind == OperationKind::Delete {
                    self.delete(&path).await
                } else {
                    let content = operation.proposed_content.as_deref().ok_or_else(|| {
                        OrchestratorError::InvalidOperation(format!(
                            "{} has no content to write",
                            operation.description
                        ))
                    })?;
                    self.write(&path, content).await
                }
            }
            OperationKind::ShellCommand => {
                let _permit = match &self.limits {
                    Some(limits) => Some(limits.acquire_shell().await?),
                    None => None,
                };
                self.run_shell(&operation.target).await.map(|_| ())
            }
        }
    }
}
