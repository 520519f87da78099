//! Executor abstraction: the black box that does a node's actual work.
//!
//! The [`Executor`] trait decouples the loop from the backend. The subprocess
//! variant renders a prompt, pipes it to a configured command and parses one
//! JSON [`TerminalResult`] from its stdout. Tests use in-process executors
//! that return predetermined results.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Node, Route, TerminalResult};
use crate::io::config::ExecutorSection;
use crate::io::process::run_command_with_timeout;

/// One invocation of an executor for a claimed node.
#[derive(Debug, Clone, Serialize)]
pub struct RunRequest {
    pub node: Node,
    pub route: Route,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl RunRequest {
    pub fn new(node: Node, run_id: Option<&str>) -> Self {
        let route = Route::for_node(&node);
        let role = route.role(&node);
        Self {
            node,
            route,
            role,
            run_id: run_id.map(str::to_string),
        }
    }
}

/// Capability that turns a claimed node into exactly one terminal result.
pub trait Executor {
    fn run(&self, request: &RunRequest) -> Result<TerminalResult>;
}

/// In-process executor backed by a closure.
pub struct StubExecutor<F> {
    handler: F,
}

impl<F> StubExecutor<F>
where
    F: Fn(&RunRequest) -> Result<TerminalResult>,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> Executor for StubExecutor<F>
where
    F: Fn(&RunRequest) -> Result<TerminalResult>,
{
    fn run(&self, request: &RunRequest) -> Result<TerminalResult> {
        (self.handler)(request)
    }
}

/// Executor that spawns the configured command.
///
/// The rendered prompt goes to stdin. The child also sees `DAGRUN_DIR`,
/// `DAGRUN_ISSUE_ID`, `DAGRUN_ROUTE` and `DAGRUN_ROLE`, so it can call back
/// into `dagrun` (for example `dagrun expand`) against the same store.
#[derive(Debug, Clone)]
pub struct SubprocessExecutor {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    prompt_template: String,
}

impl SubprocessExecutor {
    pub fn from_config(section: &ExecutorSection, workdir: &Path) -> Self {
        Self {
            command: section.command.clone(),
            workdir: workdir.to_path_buf(),
            timeout: Duration::from_secs(section.timeout_secs),
            output_limit_bytes: section.output_limit_bytes,
            prompt_template: section.prompt_template.clone(),
        }
    }

    /// Render the prompt template for `request`.
    pub fn render_prompt(&self, request: &RunRequest) -> Result<String> {
        let payload_json = match &request.node.execution_spec {
            Some(spec) => serde_json::to_string(&spec.payload).context("serialize payload")?,
            None => "null".to_string(),
        };
        let env = Environment::new();
        let template = env
            .template_from_str(&self.prompt_template)
            .map_err(|err| anyhow!("parse prompt template: {err}"))?;
        template
            .render(context! {
                node => &request.node,
                route => request.route.as_str(),
                role => &request.role,
                payload_json => payload_json,
                run_id => &request.run_id,
            })
            .map_err(|err| anyhow!("render prompt for {}: {err}", request.node.id))
    }
}

impl Executor for SubprocessExecutor {
    #[instrument(skip_all, fields(id = %request.node.id, route = %request.route, role = %request.role))]
    fn run(&self, request: &RunRequest) -> Result<TerminalResult> {
        let prompt = self.render_prompt(request)?;
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("executor.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("DAGRUN_DIR", &self.workdir)
            .env("DAGRUN_ISSUE_ID", &request.node.id)
            .env("DAGRUN_ROUTE", request.route.as_str())
            .env("DAGRUN_ROLE", &request.role);
        if let Some(run_id) = &request.run_id {
            cmd.env("DAGRUN_RUN_ID", run_id);
        }

        info!(program = %program, "starting executor");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run executor for {}", request.node.id))?;
        if let Some(reason) = output.failure(self.timeout) {
            warn!(reason = %reason, "executor failed");
            return Err(anyhow!("executor for {} {reason}", request.node.id));
        }
        let result = parse_result(&output.stdout_text())
            .with_context(|| format!("parse executor output for {}", request.node.id))?;
        debug!(outcome = %result.outcome, children = result.children.len(), "executor returned");
        Ok(result)
    }
}

/// Parse a [`TerminalResult`] from executor stdout.
///
/// Accepts either the whole output as one JSON document or, for chatty
/// executors, the last non-empty line.
pub fn parse_result(stdout: &str) -> Result<TerminalResult> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("executor printed nothing"));
    }
    if let Ok(result) = serde_json::from_str(trimmed) {
        return Ok(result);
    }
    let last = trimmed
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or(trimmed);
    serde_json::from_str(last).context("executor output is not a JSON result")
}
