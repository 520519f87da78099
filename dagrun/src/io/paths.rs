//! On-disk layout under `.dagrun/` and `dagrun init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::core::graph::Graph;
use crate::io::config::{DagConfig, write_config};

/// All canonical paths within `.dagrun/` for a project root.
#[derive(Debug, Clone)]
pub struct DagPaths {
    pub root: PathBuf,
    pub dag_dir: PathBuf,
    pub graph_path: PathBuf,
    pub lock_path: PathBuf,
    pub events_path: PathBuf,
    pub config_path: PathBuf,
    pub runs_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl DagPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dag_dir = root.join(".dagrun");
        Self {
            root: root.clone(),
            dag_dir: dag_dir.clone(),
            graph_path: dag_dir.join("graph.json"),
            lock_path: dag_dir.join("graph.json.lock"),
            events_path: dag_dir.join("events.jsonl"),
            config_path: dag_dir.join("config.toml"),
            runs_dir: dag_dir.join("runs"),
            gitignore_path: dag_dir.join(".gitignore"),
        }
    }

    /// Where the report for `run_id` is written.
    pub fn run_report_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }
}

/// Options for `init_dag`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing graph, config and event log.
    pub force: bool,
}

/// Create `.dagrun/` scaffolding in `root` with an empty graph.
///
/// Fails if `.dagrun/` already exists unless `options.force` is set.
pub fn init_dag(root: &Path, options: &InitOptions) -> Result<DagPaths> {
    let paths = DagPaths::new(root);
    if paths.dag_dir.exists() && !options.force {
        return Err(anyhow!(
            "dagrun init: .dagrun already exists (use --force to overwrite)"
        ));
    }
    if paths.dag_dir.exists() && !paths.dag_dir.is_dir() {
        return Err(anyhow!("dagrun init: .dagrun exists but is not a directory"));
    }

    create_dir(&paths.dag_dir)?;
    create_dir(&paths.runs_dir)?;
    write_file(&paths.gitignore_path, DAG_GITIGNORE)?;
    write_graph_file(&paths.graph_path, &Graph::default())?;
    write_config(&paths.config_path, &DagConfig::default())?;
    write_file(&paths.events_path, "")?;
    if paths.lock_path.exists() {
        fs::remove_file(&paths.lock_path)
            .with_context(|| format!("remove stale lock {}", paths.lock_path.display()))?;
    }

    info!(dir = %paths.dag_dir.display(), "initialized dag store");
    Ok(paths)
}

/// Atomically write a graph document (temp file + rename).
pub fn write_graph_file(path: &Path, graph: &Graph) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(graph).context("serialize graph")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    create_dir(parent)?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const DAG_GITIGNORE: &str = "graph.json.lock\n*.tmp\nruns/\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_dag(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.dag_dir.is_dir());
        assert!(paths.runs_dir.is_dir());
        assert!(paths.graph_path.is_file());
        assert!(paths.config_path.is_file());
        assert!(paths.events_path.is_file());
        assert!(!paths.lock_path.exists());

        let raw = fs::read_to_string(&paths.graph_path).expect("read graph");
        let graph: Graph = serde_json::from_str(&raw).expect("parse graph");
        assert_eq!(graph, Graph::default());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
            DAG_GITIGNORE
        );
    }

    #[test]
    fn init_without_force_refuses_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_dag(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_dag(temp.path(), &InitOptions { force: false }).expect_err("second init");
        assert!(err.to_string().contains("already exists"));
        init_dag(temp.path(), &InitOptions { force: true }).expect("forced init");
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("graph.json");
        write_graph_file(&path, &Graph::default()).expect("write");
        assert!(path.is_file());
        assert!(!temp.path().join("nested").join("graph.json.tmp").exists());
    }
}
