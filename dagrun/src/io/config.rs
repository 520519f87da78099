//! Configuration stored under `.dagrun/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use minijinja::Environment;
use serde::{Deserialize, Serialize};

use crate::io::paths::write_atomic;

/// Top-level configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DagConfig {
    pub runner: RunnerSection,
    pub executor: ExecutorSection,
}

/// How the loop restores consistency after each step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Maintenance {
    /// Reconcile upward from the node that changed.
    #[default]
    Incremental,
    /// Re-evaluate the whole subtree of the root.
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerSection {
    /// Step budget for one `dagrun run`.
    pub max_steps: u32,
    /// Take over `in_progress` nodes under the root (resume mode).
    pub resume: bool,
    /// Consecutive lost claims tolerated before a step fails.
    pub claim_retries: u32,
    pub maintenance: Maintenance,
    /// Reopen failed or empty expansions when nothing is selectable.
    pub repair: bool,
    /// Ask the executor (role `reviewer`) before promoting an expanded parent.
    pub review: bool,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            max_steps: 20,
            resume: false,
            claim_retries: 8,
            maintenance: Maintenance::Incremental,
            repair: false,
            review: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorSection {
    /// Command that receives the rendered prompt on stdin and prints a JSON
    /// result on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Cap on captured stdout/stderr per invocation.
    pub output_limit_bytes: usize,
    /// minijinja template; sees `node`, `route`, `role` and `payload_json`.
    pub prompt_template: String,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat >/dev/null; echo '{"outcome":"failure","provenance":"no executor configured"}'"#
                    .to_string(),
            ],
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
        }
    }
}

pub const DEFAULT_PROMPT_TEMPLATE: &str = r#"You are acting as {{ role }} for issue {{ node.id }}: {{ node.title }}
{% if node.body %}
{{ node.body }}
{% endif %}
{% if route == "decompose" -%}
Break this issue into smaller issues. Reply with one JSON object:
{"outcome": "expanded", "provenance": "...", "children": [{"key": "...", "title": "...", "blocked_by": []}]}
{%- else -%}
Payload: {{ payload_json }}
Do the work, then reply with one JSON object:
{"outcome": "success" | "failure" | "skipped", "provenance": "..."}
{%- endif %}
"#;

impl DagConfig {
    pub fn validate(&self) -> Result<()> {
        if self.runner.max_steps == 0 {
            return Err(anyhow!("runner.max_steps must be > 0"));
        }
        if self.runner.claim_retries == 0 {
            return Err(anyhow!("runner.claim_retries must be > 0"));
        }
        if self.executor.timeout_secs == 0 {
            return Err(anyhow!("executor.timeout_secs must be > 0"));
        }
        if self.executor.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        if self
            .executor
            .command
            .first()
            .is_none_or(|program| program.trim().is_empty())
        {
            return Err(anyhow!("executor.command must be a non-empty array"));
        }
        Environment::new()
            .template_from_str(&self.executor.prompt_template)
            .map_err(|err| anyhow!("executor.prompt_template does not parse: {err}"))?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DagConfig::default()`.
pub fn load_config(path: &Path) -> Result<DagConfig> {
    if !path.exists() {
        let cfg = DagConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DagConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DagConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, DagConfig::default());
        assert_eq!(cfg.runner.max_steps, 20);
        assert_eq!(cfg.runner.maintenance, Maintenance::Incremental);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = DagConfig::default();
        cfg.runner.maintenance = Maintenance::Full;
        cfg.runner.repair = true;
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[runner]\nmax_steps = 5\nmaintenance = \"full\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.runner.max_steps, 5);
        assert_eq!(cfg.runner.maintenance, Maintenance::Full);
        assert_eq!(cfg.runner.claim_retries, 8);
        assert_eq!(cfg.executor, ExecutorSection::default());
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = DagConfig::default();
        cfg.runner.max_steps = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = DagConfig::default();
        cfg.executor.command = vec![" ".to_string()];
        let err = cfg.validate().expect_err("blank command");
        assert!(err.to_string().contains("executor.command"));

        let mut cfg = DagConfig::default();
        cfg.executor.prompt_template = "{% if %}".to_string();
        let err = cfg.validate().expect_err("bad template");
        assert!(err.to_string().contains("prompt_template"));
    }
}
