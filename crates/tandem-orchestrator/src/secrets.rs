// Secret lookup for sub-agent prompts
// Secrets are resolved by name and must never reach a prompt, an artifact or
// the event log in clear text.

use std::collections::HashMap;

use serde_json::Value;

/// Name-keyed secret lookup
pub trait SecretStore: Send + Sync {
    fn get_secret(&self, name: &str) -> Option<String>;
}

/// Reads secrets from process environment variables
#[derive(Debug, Default, Clone)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get_secret(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

/// In-memory store, mostly for tests and embedding hosts that resolve secrets
/// themselves
#[derive(Debug, Default, Clone)]
pub struct StaticSecretStore {
    values: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn get_secret(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Replace every configured secret value in `text` with `[redacted:<name>]`,
/// then mask anything else that still looks like a credential.
pub fn scrub_prompt(text: &str, store: &dyn SecretStore, names: &[String]) -> String {
    let mut resolved: Vec<(&str, String)> = names
        .iter()
        .filter_map(|name| store.get_secret(name).map(|value| (name.as_str(), value)))
        .filter(|(_, value)| value.len() >= 4)
        .collect();
    // Longest first so a secret that contains another is replaced whole
    resolved.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    let mut out = text.to_string();
    for (name, value) in resolved {
        if out.contains(&value) {
            out = out.replace(&value, &format!("[redacted:{}]", name));
        }
    }
    tandem_observability::scrub_secrets(&out)
}

/// Mask secret-named fields in a JSON document (tool arguments, config dumps)
pub fn redact_secret_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                let lowered = key.to_ascii_lowercase();
                if ["api_key", "apikey", "token", "password", "secret"]
                    .iter()
                    .any(|needle| lowered.contains(needle))
                {
                    *field = Value::String("[REDACTED]".to_string());
                } else {
                    redact_secret_fields(field);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_secret_fields),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scrub_replaces_named_secret_values() {
        let store = StaticSecretStore::new().with("DEPLOY_TOKEN", "tok-aaaa-bbbb-cccc");
        let prompt = "Use tok-aaaa-bbbb-cccc to deploy";
        let scrubbed = scrub_prompt(prompt, &store, &["DEPLOY_TOKEN".to_string()]);
        assert_eq!(scrubbed, "Use [redacted:DEPLOY_TOKEN] to deploy");
    }

    #[test]
    fn unknown_secret_names_are_ignored() {
        let store = StaticSecretStore::new();
        let scrubbed = scrub_prompt("nothing here", &store, &["MISSING".to_string()]);
        assert_eq!(scrubbed, "nothing here");
    }

    #[test]
    fn secret_fields_are_masked_recursively() {
        let mut value = json!({
            "provider": {"api_key": "sk-live", "name": "x"},
            "items": [{"password": "hunter2"}]
        });
        redact_secret_fields(&mut value);
        assert_eq!(value["provider"]["api_key"], "[REDACTED]");
        assert_eq!(value["provider"]["name"], "x");
        assert_eq!(value["items"][0]["password"], "[REDACTED]");
    }
}
