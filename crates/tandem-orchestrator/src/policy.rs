// Policy Gate
// Classifies every requested action into a risk tier and decides whether it
// runs, waits for approval, or is refused. Classification is a pure function
// of the action and the gate's configuration; it never touches the filesystem.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_observability::{looks_secret_like, redact_text};

use crate::config::OrchestratorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Read,
    Search,
    List,
    Diff,
    Write,
    Edit,
    Delete,
    Shell,
    Install,
    Network,
    VcsPush,
}

impl ActionKind {
    pub fn tier(self) -> PolicyTier {
        match self {
            Self::Read | Self::Search | Self::List | Self::Diff => PolicyTier::Safe,
            Self::Write | Self::Edit | Self::Delete => PolicyTier::Write,
            Self::Shell | Self::Install | Self::Network | Self::VcsPush => PolicyTier::Dangerous,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Search => "search",
            Self::List => "list",
            Self::Diff => "diff",
            Self::Write => "write",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Shell => "shell",
            Self::Install => "install",
            Self::Network => "network",
            Self::VcsPush => "vcs_push",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTier {
    Safe,
    Write,
    Dangerous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    AutoAllow,
    RequireApproval,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub tier: PolicyTier,
    pub action: PolicyAction,
    pub reason: String,
    /// Target looks like a credential; log it only through redaction
    pub redact: bool,
}

/// A single action a sub-agent wants to take
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedAction {
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Payload for write/edit actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl RequestedAction {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            path: None,
            command: None,
            url: None,
            content: None,
        }
    }

    pub fn on_path(kind: ActionKind, path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(kind)
        }
    }

    pub fn shell(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            kind: classify_command(&command),
            command: Some(command),
            ..Self::new(ActionKind::Shell)
        }
    }

    /// Map a tool call emitted by a sub-agent onto an action. Returns `None`
    /// for tools the gate does not know, which callers must treat as blocked.
    pub fn from_tool_call(tool: &str, args: &Value) -> Option<Self> {
        let path = ["filePath", "path", "file"]
            .iter()
            .find_map(|key| args.get(*key).and_then(Value::as_str))
            .map(PathBuf::from);
        let content = ["content", "new_content", "text"]
            .iter()
            .find_map(|key| args.get(*key).and_then(Value::as_str))
            .map(str::to_string);

        let normalized = tool.trim().to_ascii_lowercase().replace('-', "_");
        let action = match normalized.as_str() {
            "read" | "read_file" | "view" => Self::new(ActionKind::Read),
            "search" | "grep" | "glob" | "codesearch" => Self::new(ActionKind::Search),
            "list" | "ls" | "list_dir" => Self::new(ActionKind::List),
            "diff" => Self::new(ActionKind::Diff),
            "write" | "write_file" | "create_file" => Self::new(ActionKind::Write),
            "edit" | "edit_file" | "apply_patch" => Self::new(ActionKind::Edit),
            "delete" | "delete_file" | "remove" => Self::new(ActionKind::Delete),
            "bash" | "shell" | "run_command" => {
                let command = args
                    .get("command")
                    .or_else(|| args.get("cmd"))
                    .and_then(Value::as_str)?;
                Self::shell(command)
            }
            "install" | "install_package" => Self::new(ActionKind::Install),
            "webfetch" | "fetch" | "websearch" | "http" => Self {
                url: args
                    .get("url")
                    .or_else(|| args.get("query"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                ..Self::new(ActionKind::Network)
            },
            "git_push" | "push" => Self::new(ActionKind::VcsPush),
            _ => return None,
        };

        Some(Self {
            path: action.path.or(path),
            content: action.content.or(content),
            ..action
        })
    }

    /// Short human-readable target, redacted when it looks like a credential
    pub fn display_target(&self) -> String {
        let raw = self
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| self.command.clone())
            .or_else(|| self.url.clone())
            .unwrap_or_default();
        if looks_secret_like(&raw) {
            redact_text(&raw)
        } else {
            raw
        }
    }
}

/// Refine a shell command into the most specific dangerous kind
fn classify_command(command: &str) -> ActionKind {
    let lowered = command.trim().to_ascii_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    let has_pair = |a: &str, b: &str| words.windows(2).any(|w| w[0] == a && w[1] == b);

    if has_pair("git", "push") {
        ActionKind::VcsPush
    } else if ["npm", "pnpm", "yarn", "pip", "pip3", "cargo", "gem", "apt", "apt-get", "brew"]
        .iter()
        .any(|tool| has_pair(tool, "install") || has_pair(tool, "add"))
    {
        ActionKind::Install
    } else if words
        .iter()
        .any(|w| matches!(*w, "curl" | "wget" | "ssh" | "scp" | "nc"))
    {
        ActionKind::Network
    } else {
        ActionKind::Shell
    }
}

/// Resolve `.` and `..` without touching the filesystem. Returns `None` when
/// the path climbs above its starting point.
pub fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    Some(out)
}

/// Whether `path` (absolute, or relative to `root`) stays inside `root`
pub fn is_within_root(path: &Path, root: &Path) -> bool {
    let Some(root) = normalize_lexically(root) else {
        return false;
    };
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    match normalize_lexically(&joined) {
        Some(candidate) => candidate.starts_with(&root),
        None => false,
    }
}

#[derive(Debug, Clone)]
pub struct PolicyGate {
    workspace_root: PathBuf,
    require_write_approval: bool,
    allow_dangerous_actions: bool,
}

impl PolicyGate {
    pub fn new(workspace_root: impl Into<PathBuf>, config: &OrchestratorConfig) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            require_write_approval: config.require_write_approval,
            allow_dangerous_actions: config.allow_dangerous_actions,
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn classify(&self, action: &RequestedAction) -> PolicyDecision {
        let tier = action.kind.tier();
        let redact = [
            action.path.as_ref().map(|p| p.to_string_lossy().to_string()),
            action.command.clone(),
            action.url.clone(),
        ]
        .iter()
        .flatten()
        .any(|target| looks_secret_like(target));

        let decision = |verdict: PolicyAction, reason: String| PolicyDecision {
            tier,
            action: verdict,
            reason,
            redact,
        };

        if let Some(path) = &action.path {
            if !is_within_root(path, &self.workspace_root) {
                return decision(
                    PolicyAction::Block,
                    format!("out-of-scope: {} is outside the workspace root", action.display_target()),
                );
            }
        }
        if let Some(command) = &action.command {
            if let Some(escape) = self.command_escape(command) {
                return decision(
                    PolicyAction::Block,
                    format!("out-of-scope: command references {} outside the workspace root", escape),
                );
            }
        }

        match tier {
            PolicyTier::Safe => decision(
                PolicyAction::AutoAllow,
                format!("{} is read-only", action.kind.as_str()),
            ),
            PolicyTier::Write if self.require_write_approval => decision(
                PolicyAction::RequireApproval,
                format!("{} modifies the workspace", action.kind.as_str()),
            ),
            PolicyTier::Write => decision(
                PolicyAction::AutoAllow,
                "writes are auto-approved for this run".to_string(),
            ),
            PolicyTier::Dangerous if self.allow_dangerous_actions => decision(
                PolicyAction::RequireApproval,
                format!("{} is a dangerous action and always needs approval", action.kind.as_str()),
            ),
            PolicyTier::Dangerous => decision(
                PolicyAction::Block,
                format!("{} actions are disabled for this run", action.kind.as_str()),
            ),
        }
    }

    /// First token of a shell command that names a path outside the root
    fn command_escape(&self, command: &str) -> Option<String> {
        command
            .split_whitespace()
            .map(|token| token.trim_matches(|c| c == '"' || c == '\''))
            .find(|token| {
                let looks_like_path = token.starts_with('/') || token.starts_with("..") || token.starts_with('~');
                looks_like_path
                    && (token.starts_with('~') || !is_within_root(Path::new(token), &self.workspace_root))
            })
            .map(|token| {
                if looks_secret_like(token) {
                    redact_text(token)
                } else {
                    token.to_string()
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate(f: impl FnOnce(&mut OrchestratorConfig)) -> PolicyGate {
        let mut config = OrchestratorConfig::default();
        f(&mut config);
        PolicyGate::new("/work/project", &config)
    }

    #[test]
    fn paths_outside_root_are_blocked_under_every_toggle() {
        let targets = ["/etc/passwd", "../other/file.txt", "src/../../escape.rs", "/work/projectile/x"];
        for (auto_writes, dangerous) in [(false, false), (true, false), (false, true), (true, true)] {
            let gate = gate(|c| {
                c.require_write_approval = !auto_writes;
                c.allow_dangerous_actions = dangerous;
            });
            for target in targets {
                for kind in [ActionKind::Read, ActionKind::Write, ActionKind::Delete] {
                    let decision = gate.classify(&RequestedAction::on_path(kind, target));
                    assert_eq!(decision.action, PolicyAction::Block, "{target} {kind:?}");
                    assert!(decision.reason.starts_with("out-of-scope"));
                }
            }
        }
    }

    #[test]
    fn safe_actions_are_auto_allowed() {
        let gate = gate(|_| {});
        for kind in [ActionKind::Read, ActionKind::Search, ActionKind::List, ActionKind::Diff] {
            let decision = gate.classify(&RequestedAction::on_path(kind, "src/lib.rs"));
            assert_eq!(decision.tier, PolicyTier::Safe);
            assert_eq!(decision.action, PolicyAction::AutoAllow);
        }
    }

    #[test]
    fn writes_need_approval_unless_auto_approved() {
        let action = RequestedAction::on_path(ActionKind::Write, "/work/project/src/main.rs");
        assert_eq!(gate(|_| {}).classify(&action).action, PolicyAction::RequireApproval);
        assert_eq!(
            gate(|c| c.require_write_approval = false).classify(&action).action,
            PolicyAction::AutoAllow
        );
    }

    #[test]
    fn dangerous_actions_are_blocked_then_gated() {
        let action = RequestedAction::shell("cargo test");
        assert_eq!(gate(|_| {}).classify(&action).action, PolicyAction::Block);

        let enabled = gate(|c| {
            c.allow_dangerous_actions = true;
            c.require_write_approval = false;
        });
        assert_eq!(enabled.classify(&action).action, PolicyAction::RequireApproval);
    }

    #[test]
    fn shell_commands_refine_their_kind() {
        assert_eq!(RequestedAction::shell("git push origin main").kind, ActionKind::VcsPush);
        assert_eq!(RequestedAction::shell("npm install left-pad").kind, ActionKind::Install);
        assert_eq!(RequestedAction::shell("curl https://x.dev").kind, ActionKind::Network);
        assert_eq!(RequestedAction::shell("ls -la").kind, ActionKind::Shell);
    }

    #[test]
    fn shell_commands_cannot_reach_outside_root() {
        let gate = gate(|c| c.allow_dangerous_actions = true);
        let decision = gate.classify(&RequestedAction::shell("cat /etc/shadow"));
        assert_eq!(decision.action, PolicyAction::Block);
        let decision = gate.classify(&RequestedAction::shell("cat ~/.ssh/id_rsa"));
        assert_eq!(decision.action, PolicyAction::Block);
        assert!(decision.redact);
    }

    #[test]
    fn secret_targets_are_flagged_for_redaction() {
        let gate = gate(|_| {});
        let decision = gate.classify(&RequestedAction::on_path(ActionKind::Read, ".env"));
        assert_eq!(decision.action, PolicyAction::AutoAllow);
        assert!(decision.redact);

        let decision = gate.classify(&RequestedAction::on_path(ActionKind::Read, "README.md"));
        assert!(!decision.redact);
    }

    #[test]
    fn tool_calls_map_to_actions() {
        let action = RequestedAction::from_tool_call(
            "write",
            &json!({ "filePath": "src/a.rs", "content": "fn main() {}" }),
        )
        .unwrap();
        assert_eq!(action.kind, ActionKind::Write);
        assert_eq!(action.path, Some(PathBuf::from("src/a.rs")));
        assert_eq!(action.content.as_deref(), Some("fn main() {}"));

        let action = RequestedAction::from_tool_call("bash", &json!({ "command": "git push" })).unwrap();
        assert_eq!(action.kind, ActionKind::VcsPush);

        assert!(RequestedAction::from_tool_call("teleport", &json!({})).is_none());
    }

    #[test]
    fn lexical_normalization() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d")),
            Some(PathBuf::from("/a/c/d"))
        );
        assert_eq!(normalize_lexically(Path::new("a/../..")), None);
        assert!(is_within_root(Path::new("x/../y"), Path::new("/root")));
        assert!(!is_within_root(Path::new("/rooted"), Path::new("/root")));
    }
}
