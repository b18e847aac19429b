// Orchestrator Sub-Agents
// Role templates, prompt builders, output parsing and the generation capability
// every role is dispatched through.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{OrchestratorError, Result};
use crate::types::{AgentRole, Task, TaskState, ValidationResult};

const WRAPPER_KEYS: [&str; 5] = ["tasks", "plan", "steps", "items", "task_list"];
const DEFAULT_CRITERION: &str = "Task completed successfully";

// ============================================================================
// Generation capability
// ============================================================================

/// Tool advertised to a sub-agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

impl ToolSpec {
    fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
        }
    }
}

/// A tool invocation proposed by a sub-agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub role: AgentRole,
    pub prompt: String,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub tokens_used: u64,
}

/// Opaque "generate text given a prompt and tool schema" capability. Any
/// model or provider can sit behind it.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation>;
}

/// Rough token estimate used for budget reservations
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    (chars / 4).max(1)
}

// ============================================================================
// Role templates
// ============================================================================

/// Instruction header and tool schema for one role
pub struct RoleTemplate {
    pub role: AgentRole,
    pub instructions: &'static str,
    pub tools: Vec<ToolSpec>,
}

impl RoleTemplate {
    pub fn for_role(role: AgentRole) -> Self {
        let read_only = || {
            vec![
                ToolSpec::new("read", "Read a workspace file"),
                ToolSpec::new("search", "Search file contents"),
                ToolSpec::new("list", "List workspace files"),
            ]
        };
        match role {
            AgentRole::Planner => Self {
                role,
                instructions: "You are a Planning Agent for a multi-agent orchestration system.",
                tools: read_only(),
            },
            AgentRole::Builder => {
                let mut tools = read_only();
                tools.extend([
                    ToolSpec::new("diff", "Show pending changes"),
                    ToolSpec::new("write", "Create or replace a file: {path, content}"),
                    ToolSpec::new("edit", "Replace a file's content: {path, content}"),
                    ToolSpec::new("delete", "Delete a file: {path}"),
                    ToolSpec::new("bash", "Run a shell command: {command}"),
                ]);
                Self {
                    role,
                    instructions: "You are a Builder Agent for a multi-agent orchestration system.",
                    tools,
                }
            }
            AgentRole::Validator => {
                let mut tools = read_only();
                tools.push(ToolSpec::new("diff", "Show pending changes"));
                Self {
                    role,
                    instructions: "You are a Validator Agent for a multi-agent orchestration system.",
                    tools,
                }
            }
            AgentRole::Researcher => {
                let mut tools = read_only();
                tools.push(ToolSpec::new("webfetch", "Fetch a URL: {url}"));
                Self {
                    role,
                    instructions: "You are a Researcher Agent for a multi-agent orchestration system.",
                    tools,
                }
            }
        }
    }

    pub fn request(&self, body: String, max_tokens: u64) -> GenerationRequest {
        GenerationRequest {
            role: self.role,
            prompt: format!("{}\n\n{}", self.instructions, body),
            tools: self.tools.clone(),
            max_tokens,
        }
    }
}

// ============================================================================
// Prompt builders
// ============================================================================

/// Constraints for the Planner agent
pub struct PlannerConstraints {
    pub max_tasks: usize,
    pub research_enabled: bool,
}

impl Default for PlannerConstraints {
    fn default() -> Self {
        Self {
            max_tasks: 12,
            research_enabled: false,
        }
    }
}

/// Constraints for the Researcher agent
pub struct ResearcherConstraints {
    pub max_sources: usize,
    pub prohibited_domains: Vec<String>,
}

impl Default for ResearcherConstraints {
    fn default() -> Self {
        Self {
            max_sources: 30,
            prohibited_domains: Vec::new(),
        }
    }
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct AgentPrompts;

impl AgentPrompts {
    pub fn build_planner_prompt(
        objective: &str,
        workspace_summary: &str,
        constraints: &PlannerConstraints,
        revision_feedback: Option<&str>,
    ) -> String {
        let revision = revision_feedback
            .map(|f| format!("\n## Reviewer Feedback On The Previous Plan\n{}\n", f))
            .unwrap_or_default();

        format!(
            r#"## Objective
{objective}

## Workspace
{workspace_summary}
{revision}
## Constraints
- At most {max_tasks} tasks
- Research tasks allowed: {research}
- Each task must be finishable by one builder call

## Output
Return ONLY a JSON array. Each element has:
"id", "title", "description", "dependencies" (ids of earlier tasks),
"acceptance_criteria" (list of checkable statements) and optionally
"role" ("builder" or "researcher").

```json
[
  {{"id": "task_1", "title": "Add parser", "description": "Create src/parser.rs", "dependencies": [], "acceptance_criteria": ["parser.rs exists"]}},
  {{"id": "task_2", "title": "Wire parser", "description": "Call the parser from main", "dependencies": ["task_1"], "acceptance_criteria": ["main uses parser"]}}
]
```"#,
            objective = objective,
            workspace_summary = workspace_summary,
            revision = revision,
            max_tasks = constraints.max_tasks,
            research = constraints.research_enabled,
        )
    }

    pub fn build_builder_prompt(
        task: &Task,
        file_context: &str,
        previous_feedback: Option<&str>,
        restrictions: &[String],
    ) -> String {
        let previous = previous_feedback
            .map(|f| format!("\n## Feedback From The Previous Attempt\n{}\n", f))
            .unwrap_or_default();
        let restricted = if restrictions.is_empty() {
            String::new()
        } else {
            format!(
                "\n## Blocked Actions\nThese actions were refused by policy; do not retry them:\n{}\n",
                bullet_list(restrictions)
            )
        };

        format!(
            r#"## Task {id}: {title}
{description}

## Acceptance Criteria
{criteria}

## Relevant Files
{file_context}
{previous}{restricted}
## Rules
- Only touch files inside the workspace, using the write/edit/delete tools
- Keep changes minimal
- Finish with a short note describing what you changed and how to verify it"#,
            id = task.id,
            title = task.title,
            description = task.description,
            criteria = bullet_list(&task.acceptance_criteria),
            file_context = file_context,
            previous = previous,
            restricted = restricted,
        )
    }

    pub fn build_validator_prompt(task: &Task, change_summary: &str, builder_notes: &str) -> String {
        format!(
            r#"## Task Being Validated: {title}
{description}

## Acceptance Criteria
{criteria}

## Changes
```diff
{change_summary}
```

## Builder Notes
{builder_notes}

## Output
Return ONLY a JSON object:
{{"passed": true|false, "feedback": "...", "suggested_fixes": ["..."]}}
Every criterion must hold for "passed" to be true."#,
            title = task.title,
            description = task.description,
            criteria = bullet_list(&task.acceptance_criteria),
            change_summary = change_summary,
            builder_notes = builder_notes,
        )
    }

    pub fn build_researcher_prompt(question: &str, constraints: &ResearcherConstraints) -> String {
        format!(
            r#"## Research Question
{question}

## Constraints
- At most {max_sources} sources
- Never use these domains:
{prohibited}

## Output
1. A JSON array of sources: [{{"url": "...", "title": "...", "relevance": "..."}}]
2. A markdown list of key findings, each citing a source number"#,
            question = question,
            max_sources = constraints.max_sources,
            prohibited = bullet_list(&constraints.prohibited_domains),
        )
    }

    // ------------------------------------------------------------------------
    // Validator output
    // ------------------------------------------------------------------------

    pub fn parse_validation_result_strict(output: &str) -> std::result::Result<ValidationResult, String> {
        std::iter::once(output.trim().to_string())
            .chain(json_candidates(output))
            .filter_map(|candidate| serde_json::from_str::<Value>(&candidate).ok())
            .find_map(|value| validation_from_value(&value))
            .ok_or_else(|| "validator response did not match required JSON schema".to_string())
    }

    pub fn parse_validation_result_fallback(output: &str) -> Option<ValidationResult> {
        let lower = output.to_lowercase();
        let has = |needle: &str| lower.contains(needle);
        let passed = if has("\"passed\": true") || has("passed: true") {
            true
        } else if has("\"passed\": false") || has("passed: false") {
            false
        } else if has("all acceptance criteria are met") || has("criteria are satisfied") {
            true
        } else if has("not met") || has("does not meet") || has("missing") || has("not satisfied") {
            false
        } else if has("failed") && !has("not failed") {
            false
        } else if has("passed") && !has("not passed") {
            true
        } else {
            return None;
        };

        Some(ValidationResult {
            passed,
            feedback: output.lines().take(6).collect::<Vec<_>>().join(" ").trim().to_string(),
            suggested_fixes: Vec::new(),
        })
    }

    pub fn parse_validation_result(output: &str, allow_prose_fallback: bool) -> Option<ValidationResult> {
        match Self::parse_validation_result_strict(output) {
            Ok(result) => Some(result),
            Err(_) if allow_prose_fallback => Self::parse_validation_result_fallback(output),
            Err(_) => None,
        }
    }

    // ------------------------------------------------------------------------
    // Planner output
    // ------------------------------------------------------------------------

    pub fn parse_task_list_strict(output: &str) -> std::result::Result<Vec<ParsedTask>, String> {
        let tasks = parse_tasks_from_json(output)
            .ok_or_else(|| "planner response did not contain valid JSON task payload".to_string())?;
        let normalized = normalize_parsed_tasks(tasks)?;
        if normalized.is_empty() {
            return Err("planner produced an empty task list".to_string());
        }
        Ok(normalized)
    }

    pub fn parse_task_list_fallback(output: &str) -> Option<Vec<ParsedTask>> {
        let tasks = parse_tasks_from_markdown(output);
        if tasks.is_empty() {
            return None;
        }
        normalize_parsed_tasks(tasks).ok()
    }

    /// Strict JSON first; markdown checklist only when prose fallback is allowed
    pub fn parse_task_list(output: &str, allow_prose_fallback: bool) -> Result<Vec<ParsedTask>> {
        match Self::parse_task_list_strict(output) {
            Ok(tasks) => Ok(tasks),
            Err(strict_err) if allow_prose_fallback => Self::parse_task_list_fallback(output)
                .ok_or(OrchestratorError::PlanningFailed(strict_err)),
            Err(strict_err) => Err(OrchestratorError::PlanningFailed(strict_err)),
        }
    }
}

fn validation_from_value(value: &Value) -> Option<ValidationResult> {
    let object = value.as_object()?;
    let passed = object.get("passed")?.as_bool()?;
    let feedback = object
        .get("feedback")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            if passed { "Validation passed" } else { "Validation failed" }.to_string()
        });
    let suggested_fixes = object
        .get("suggested_fixes")
        .and_then(Value::as_array)
        .map(|fixes| {
            fixes
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(ValidationResult {
        passed,
        feedback,
        suggested_fixes,
    })
}

fn tasks_from_value(value: Value) -> Option<Vec<ParsedTask>> {
    let array = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => WRAPPER_KEYS
            .iter()
            .find_map(|key| map.remove(*key).filter(Value::is_array))?,
        _ => return None,
    };
    serde_json::from_value(array).ok()
}

fn parse_tasks_from_json(output: &str) -> Option<Vec<ParsedTask>> {
    std::iter::once(output.trim().to_string())
        .chain(json_candidates(output))
        .filter_map(|candidate| serde_json::from_str::<Value>(&candidate).ok())
        .find_map(tasks_from_value)
}

/// Fenced blocks first, then the widest bracketed spans
fn json_candidates(output: &str) -> Vec<String> {
    let mut out = Vec::new();

    let mut rest = output;
    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        let Some(end) = body.find("```") else {
            break;
        };
        let block = body[..end].trim();
        if !block.is_empty() {
            out.push(block.to_string());
        }
        rest = &body[end + 3..];
    }

    for (open, close) in [('[', ']'), ('{', '}')] {
        if let (Some(start), Some(end)) = (output.find(open), output.rfind(close)) {
            if start < end {
                out.push(output[start..=end].to_string());
            }
        }
    }

    out
}

fn parse_tasks_from_markdown(output: &str) -> Vec<ParsedTask> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("- ") || line.starts_with("* ") || line.starts_with(|c: char| c.is_ascii_digit()))
        .filter_map(|line| {
            let candidate = line
                .trim_start_matches("- ")
                .trim_start_matches("* ")
                .trim_start_matches("[ ] ")
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
                .trim();

            let (id, title) = match candidate.split_once(':') {
                Some((id, title)) if !id.trim().is_empty() && !id.contains(' ') && !title.trim().is_empty() => {
                    (id.trim().to_string(), title.trim().to_string())
                }
                _ if candidate.len() >= 4 => (String::new(), candidate.to_string()),
                _ => return None,
            };

            Some(ParsedTask {
                id,
                title: title.clone(),
                description: title,
                dependencies: Vec::new(),
                acceptance_criteria: Vec::new(),
                role: None,
            })
        })
        .collect()
}

fn normalize_parsed_tasks(tasks: Vec<ParsedTask>) -> std::result::Result<Vec<ParsedTask>, String> {
    let mut seen_ids = HashSet::<String>::new();
    let mut renamed: HashMap<String, String> = HashMap::new();
    let mut normalized = Vec::with_capacity(tasks.len());

    for (idx, mut task) in tasks.into_iter().enumerate() {
        task.id = task.id.trim().to_string();
        task.title = task.title.trim().to_string();
        task.description = task.description.trim().to_string();
        task.dependencies = task
            .dependencies
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
        task.acceptance_criteria = task
            .acceptance_criteria
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        if task.title.is_empty() {
            return Err(format!("task {} has empty title", idx + 1));
        }
        if task.description.is_empty() {
            task.description = task.title.clone();
        }
        if task.acceptance_criteria.is_empty() {
            task.acceptance_criteria = vec![DEFAULT_CRITERION.to_string()];
        }

        let base_id = if task.id.is_empty() {
            format!("task_{}", idx + 1)
        } else {
            task.id.clone()
        };
        let mut unique_id = base_id.clone();
        let mut suffix = 2usize;
        while seen_ids.contains(&unique_id) {
            unique_id = format!("{}_{}", base_id, suffix);
            suffix += 1;
        }
        // first occurrence keeps the name other tasks refer to
        renamed.entry(base_id).or_insert_with(|| unique_id.clone());
        seen_ids.insert(unique_id.clone());
        task.id = unique_id;
        normalized.push(task);
    }

    for task in &mut normalized {
        for dep in &mut task.dependencies {
            if let Some(target) = renamed.get(dep.as_str()) {
                *dep = target.clone();
            }
        }
    }

    Ok(normalized)
}

/// Parsed task from planner output
#[derive(Debug, Clone, Deserialize)]
pub struct ParsedTask {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub role: Option<AgentRole>,
}

impl From<ParsedTask> for Task {
    fn from(parsed: ParsedTask) -> Self {
        let mut task = Task::new(parsed.id, parsed.title, parsed.description)
            .with_dependencies(parsed.dependencies)
            .with_criteria(parsed.acceptance_criteria);
        task.assigned_role = match parsed.role {
            Some(AgentRole::Researcher) => AgentRole::Researcher,
            _ => AgentRole::Builder,
        };
        task.state = TaskState::Pending;
        task
    }
}

// ============================================================================
// Scripted generator
// ============================================================================

/// One canned reply. Entries with `when` are chosen whenever the prompt
/// contains that text and are never consumed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptedResponse {
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    /// Fail the call with this message instead of replying
    #[serde(default)]
    pub fail: Option<String>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScriptEntry {
    Text(String),
    Full(ScriptedResponse),
}

impl From<ScriptEntry> for ScriptedResponse {
    fn from(entry: ScriptEntry) -> Self {
        match entry {
            ScriptEntry::Text(text) => ScriptedResponse {
                text,
                ..Default::default()
            },
            ScriptEntry::Full(response) => response,
        }
    }
}

/// Replays canned responses per role. Unconditional entries are used in
/// order and the last one repeats.
pub struct ScriptedGenerator {
    script: HashMap<AgentRole, Vec<ScriptedResponse>>,
    cursors: Mutex<HashMap<AgentRole, usize>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(script: HashMap<AgentRole, Vec<ScriptedResponse>>) -> Self {
        Self {
            script,
            cursors: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// `{"planner": [...], "builder": [...], ...}` where each entry is a plain
    /// string or a full response object
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let parsed: HashMap<AgentRole, Vec<ScriptEntry>> = serde_json::from_str(raw)?;
        Ok(Self::new(
            parsed
                .into_iter()
                .map(|(role, entries)| (role, entries.into_iter().map(Into::into).collect()))
                .collect(),
        ))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn with_role(mut self, role: AgentRole, responses: Vec<ScriptedResponse>) -> Self {
        self.script.insert(role, responses);
        self
    }

    /// Number of generate calls served so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn pick(&self, role: AgentRole, prompt: &str) -> Option<ScriptedResponse> {
        let entries = self.script.get(&role)?;
        if let Some(hit) = entries
            .iter()
            .find(|e| e.when.as_deref().is_some_and(|w| prompt.contains(w)))
        {
            return Some(hit.clone());
        }
        let sequential: Vec<&ScriptedResponse> = entries.iter().filter(|e| e.when.is_none()).collect();
        let last = sequential.len().checked_sub(1)?;
        let mut cursors = self.cursors.lock().await;
        let cursor = cursors.entry(role).or_insert(0);
        let chosen = sequential[(*cursor).min(last)].clone();
        *cursor += 1;
        Some(chosen)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self.pick(request.role, &request.prompt).await.ok_or_else(|| {
            OrchestratorError::Generation(format!("no scripted response for role {}", request.role.as_str()))
        })?;

        if let Some(ms) = response.delay_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(message) = response.fail {
            return Err(OrchestratorError::Generation(message));
        }

        let tokens_used = response
            .tokens_used
            .unwrap_or_else(|| estimate_tokens(&request.prompt) + estimate_tokens(&response.text));
        Ok(Generation {
            text: response.text,
            tool_calls: response.tool_calls,
            tokens_used,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_validation_result_embedded_json() {
        let output = r#"
Here is my evaluation:
{
  "passed": true,
  "feedback": "All criteria met",
  "suggested_fixes": []
}
"#;
        let result = AgentPrompts::parse_validation_result(output, false).unwrap();
        assert!(result.passed);
        assert_eq!(result.feedback, "All criteria met");
    }

    #[test]
    fn test_parse_validation_result_failed() {
        let output = r#"{"passed": false, "feedback": "Missing feature", "suggested_fixes": ["Add X", "Fix Y"]}"#;
        let result = AgentPrompts::parse_validation_result(output, false).unwrap();
        assert!(!result.passed);
        assert_eq!(result.suggested_fixes, vec!["Add X", "Fix Y"]);
    }

    #[test]
    fn test_validation_prose_needs_fallback() {
        let output = "Looks good overall, passed.";
        assert!(AgentPrompts::parse_validation_result_strict(output).is_err());
        assert!(AgentPrompts::parse_validation_result(output, false).is_none());
        assert!(AgentPrompts::parse_validation_result(output, true).unwrap().passed);
        assert!(!AgentPrompts::parse_validation_result("Acceptance criteria not met", true).unwrap().passed);
    }

    #[test]
    fn test_parse_task_list_with_preamble() {
        let output = r#"
Here is the plan:
[
  {"id": "1", "title": "Task 1", "description": "Do thing 1", "dependencies": [], "acceptance_criteria": ["Done"]},
  {"id": "2", "title": "Task 2", "description": "Do thing 2", "dependencies": ["1"], "acceptance_criteria": ["Done"]}
]
"#;
        let tasks = AgentPrompts::parse_task_list(output, false).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].dependencies, vec!["1"]);
    }

    #[test]
    fn test_parse_task_list_wrapped_keys() {
        for key in ["tasks", "plan", "steps"] {
            let output = json!({
                key: [{"id": "task_1", "title": "Analyze", "description": "Analyze code"}]
            })
            .to_string();
            let tasks = AgentPrompts::parse_task_list(&output, false).unwrap();
            assert_eq!(tasks[0].id, "task_1");
            assert_eq!(tasks[0].acceptance_criteria, vec![DEFAULT_CRITERION]);
        }
    }

    #[test]
    fn test_parse_task_list_fenced_block() {
        let output = "Plan:\n```json\n[{\"title\": \"Write docs\", \"description\": \"Add README\"}]\n```\nDone.";
        let tasks = AgentPrompts::parse_task_list_strict(output).unwrap();
        assert_eq!(tasks[0].id, "task_1");
    }

    #[test]
    fn test_parse_task_list_markdown_fallback() {
        let output = "- task_1: Analyze existing codebase\n- task_2: Implement feature\n";
        assert!(AgentPrompts::parse_task_list(output, false).is_err());

        let tasks = AgentPrompts::parse_task_list(output, true).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "task_1");
        assert_eq!(tasks[1].title, "Implement feature");
    }

    #[test]
    fn test_parse_task_list_plain_checklist() {
        let output = "1. Analyze existing code structure\n2. Implement feature X\n";
        let tasks = AgentPrompts::parse_task_list(output, true).unwrap();
        assert_eq!(tasks[0].id, "task_1");
        assert_eq!(tasks[0].title, "Analyze existing code structure");
    }

    #[test]
    fn test_empty_plan_is_rejected() {
        let err = AgentPrompts::parse_task_list("[]", true).unwrap_err();
        assert!(matches!(err, OrchestratorError::PlanningFailed(_)));
    }

    #[test]
    fn test_duplicate_ids_are_suffixed() {
        let output = r#"[
  {"id":"task_1","title":"A","description":"Desc A"},
  {"id":"task_1","title":"B","description":"Desc B"},
  {"id":"task_3","title":"C","description":"Desc C","dependencies":["task_1"]}
]"#;
        let tasks = AgentPrompts::parse_task_list_strict(output).unwrap();
        assert_eq!(tasks[0].id, "task_1");
        assert_eq!(tasks[1].id, "task_1_2");
        assert_eq!(tasks[2].dependencies, vec!["task_1"]);
    }

    #[test]
    fn test_parsed_task_role() {
        let output = r#"[{"title":"Look up API","description":"Find docs","role":"researcher"}, {"title":"Build","description":"b","role":"validator"}]"#;
        let tasks: Vec<Task> = AgentPrompts::parse_task_list_strict(output)
            .unwrap()
            .into_iter()
            .map(Task::from)
            .collect();
        assert_eq!(tasks[0].assigned_role, AgentRole::Researcher);
        assert_eq!(tasks[1].assigned_role, AgentRole::Builder);
    }

    #[test]
    fn test_builder_prompt_lists_restrictions() {
        let task = Task::new("t1", "Fix", "Fix it").with_criteria(["tests pass"]);
        let prompt = AgentPrompts::build_builder_prompt(
            &task,
            "(none)",
            Some("missing error handling"),
            &["shell: cargo publish".to_string()],
        );
        assert!(prompt.contains("- tests pass"));
        assert!(prompt.contains("missing error handling"));
        assert!(prompt.contains("shell: cargo publish"));
    }

    #[test]
    fn test_role_templates_scope_tools() {
        let names = |role| {
            RoleTemplate::for_role(role)
                .tools
                .into_iter()
                .map(|t| t.name)
                .collect::<Vec<_>>()
        };
        assert!(!names(AgentRole::Validator).contains(&"write".to_string()));
        assert!(!names(AgentRole::Planner).contains(&"bash".to_string()));
        assert!(names(AgentRole::Builder).contains(&"write".to_string()));
        assert!(names(AgentRole::Researcher).contains(&"webfetch".to_string()));
    }

    #[tokio::test]
    async fn scripted_generator_replays_in_order_and_repeats_last() {
        let generator = ScriptedGenerator::from_json_str(
            r#"{
                "builder": ["first", {"text": "second", "tokens_used": 7}],
                "validator": [{"when": "Task Being Validated: Special", "text": "special"}, "default"]
            }"#,
        )
        .unwrap();

        let request = |role, prompt: &str| GenerationRequest {
            role,
            prompt: prompt.to_string(),
            tools: Vec::new(),
            max_tokens: 100,
        };

        let a = generator.generate(request(AgentRole::Builder, "p")).await.unwrap();
        let b = generator.generate(request(AgentRole::Builder, "p")).await.unwrap();
        let c = generator.generate(request(AgentRole::Builder, "p")).await.unwrap();
        assert_eq!((a.text.as_str(), b.text.as_str(), c.text.as_str()), ("first", "second", "second"));
        assert_eq!(b.tokens_used, 7);

        let special = generator
            .generate(request(AgentRole::Validator, "## Task Being Validated: Special"))
            .await
            .unwrap();
        assert_eq!(special.text, "special");
        let plain = generator.generate(request(AgentRole::Validator, "other")).await.unwrap();
        assert_eq!(plain.text, "default");

        assert!(generator.generate(request(AgentRole::Planner, "p")).await.is_err());
        assert_eq!(generator.calls(), 6);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens(&"a".repeat(400)), 100);
    }
}
