//! mb-config
//!
//! Layered YAML configuration for the reconciliation daemon.
//!
//! - Documents are deep-merged in order (earlier = base, later = override).
//! - Leaf strings that look like credentials are rejected: secrets are read
//!   from the environment by name, never written into config files.
//! - The merged document is canonicalised and hashed so every process logs
//!   the exact configuration it booted with.
//! - [`Settings`] is the typed view the rest of the workspace consumes.
//!
//! Schedules that must change without a redeploy are *not* here; they live in
//! the `config_items` table under the keys built by [`schedule_key`].

mod keys;
mod settings;

pub use keys::{schedule_key, ScheduledJobKey, DEFAULT_KEY_PREFIX};
pub use settings::{
    BackoffSettings, DatabaseSettings, DestinationSettings, ExportSettings, HttpSettings,
    IdentifySettings, MatchingSettings, QueueLimits, QueueSettings, RedeliverySettings,
    RetrySettings, SchedulerSettings, SchemeMatchingSettings, Settings, WorkerSettings,
    MAX_RETRY_DELAY_SECS,
};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

/// Known secret-like prefixes. If any leaf string value in the effective
/// config starts with one of these, loading aborts with CONFIG_SECRET_DETECTED.
const SECRET_PREFIXES: &[&str] = &[
    "sk-",         // Stripe / OpenAI style
    "sk_live",     // Stripe live
    "sk_test",     // Stripe test
    "AKIA",        // AWS access key ID
    "-----BEGIN",  // PEM private keys
    "ghp_",        // GitHub PAT
    "xoxb-",       // Slack bot token
    "postgres://", // connection strings carry passwords
    "postgresql://",
];

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

impl LoadedConfig {
    /// Deserialize the merged document into [`Settings`]. Missing sections
    /// fall back to their defaults.
    pub fn settings(&self) -> Result<Settings> {
        let s: Settings = serde_json::from_value(self.config_json.clone())
            .context("config does not match settings schema")?;
        s.validate()?;
        Ok(s)
    }
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let raw =
            fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}"))?;
        docs.push(raw);
    }

    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = serde_json::json!({});
    for raw in yaml_docs {
        let v_yaml: serde_yaml::Value = serde_yaml::from_str(raw).context("invalid yaml")?;
        // An empty document deserializes to null; treat it as "no overrides".
        if v_yaml.is_null() {
            continue;
        }
        let v_json = serde_json::to_value(v_yaml).context("yaml->json conversion failed")?;
        merged = deep_merge(merged, v_json);
    }

    enforce_no_secret_literals(&merged)?;

    let canonical_json = canonicalize_json(&merged)?;
    let config_hash = sha256_hex(canonical_json.as_bytes());
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

fn canonicalize_json(v: &Value) -> Result<String> {
    // serde_json::Map is key-sorted (no preserve_order feature), so compact
    // serialization is already canonical.
    serde_json::to_string(v).context("canonical json serialize failed")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn enforce_no_secret_literals(v: &Value) -> Result<()> {
    let mut leaves = Vec::new();
    collect_leaf_pointers(v, "", &mut leaves);

    for ptr in leaves {
        if let Some(s) = v.pointer(&ptr).and_then(Value::as_str) {
            if looks_like_secret(s) {
                bail!("CONFIG_SECRET_DETECTED leaf={} value=REDACTED", ptr);
            }
        }
    }
    Ok(())
}

fn collect_leaf_pointers(v: &Value, prefix: &str, out: &mut Vec<String>) {
    match v {
        Value::Object(map) => {
            for (k, vv) in map.iter() {
                let next = format!("{}/{}", prefix, escape_pointer_token(k));
                collect_leaf_pointers(vv, &next, out);
            }
        }
        Value::Array(arr) => {
            for (i, vv) in arr.iter().enumerate() {
                let next = format!("{}/{}", prefix, i);
                collect_leaf_pointers(vv, &next, out);
            }
        }
        _ => out.push(prefix.to_string()),
    }
}

fn escape_pointer_token(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

fn looks_like_secret(s: &str) -> bool {
    let t = s.trim();
    if t.len() < 8 {
        return false;
    }
    SECRET_PREFIXES.iter().any(|p| t.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_layers_override_leaves_only() {
        let cfg = load_layered_yaml_from_strings(&[
            "retry:\n  base_delay_secs: 30\n  max_delay_secs: 600\n",
            "retry:\n  base_delay_secs: 5\n",
        ])
        .unwrap();
        assert_eq!(cfg.config_json["retry"]["base_delay_secs"], 5);
        assert_eq!(cfg.config_json["retry"]["max_delay_secs"], 600);
    }

    #[test]
    fn empty_document_is_ignored() {
        let cfg = load_layered_yaml_from_strings(&["debug: true\n", ""]).unwrap();
        assert_eq!(cfg.config_json["debug"], true);
    }

    #[test]
    fn short_strings_are_never_secrets() {
        assert!(!looks_like_secret("sk-1"));
        assert!(looks_like_secret("postgres://u:p@db/x"));
    }
}
