//! Graph Store: durable node table with atomic read-modify-write.
//!
//! Every mutation goes through [`GraphStore::update`]. The closure sees a
//! private copy of the graph and its changes become visible only if it
//! returns `Ok`, which makes a claim a compare-and-swap: two callers racing on
//! the same node are serialized and the loser observes the winner's status.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::core::graph::Graph;
use crate::io::events::{Event, append_event, read_events};
use crate::io::paths::{DagPaths, write_graph_file};

const GRAPH_SCHEMA: &str = include_str!("../../schemas/graph.schema.json");

/// How many times `FileStore` tries to take the lock before giving up.
const LOCK_ATTEMPTS: u32 = 60;
const LOCK_BACKOFF_START: Duration = Duration::from_millis(5);
const LOCK_BACKOFF_MAX: Duration = Duration::from_millis(250);

/// Storage contract consumed by the engine.
pub trait GraphStore {
    /// A consistent copy of the current graph.
    fn snapshot(&self) -> Result<Graph>;

    /// Apply `f` atomically. On `Err` the store is left untouched.
    fn update<T>(&self, f: impl FnOnce(&mut Graph) -> Result<T>) -> Result<T>;

    /// Append one record to the event log.
    fn append_event(&self, event: &Event) -> Result<()>;

    /// All events recorded so far, oldest first.
    fn events(&self) -> Result<Vec<Event>>;
}

/// Prefix for generated node ids.
pub const ID_PREFIX: &str = "iss";

/// Fresh node id: `<prefix>-<8 hex>`.
pub fn new_node_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &hex[..8])
}

/// Fresh run id (32 hex chars).
pub fn new_run_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// In-process store. `Sync`, so tests can race claims across threads.
#[derive(Debug, Default)]
pub struct MemoryStore {
    graph: Mutex<Graph>,
    events: Mutex<Vec<Event>>,
}

impl MemoryStore {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph: Mutex::new(graph),
            events: Mutex::new(Vec::new()),
        }
    }
}

impl GraphStore for MemoryStore {
    fn snapshot(&self) -> Result<Graph> {
        let graph = self
            .graph
            .lock()
            .map_err(|_| anyhow!("graph lock poisoned"))?;
        Ok(graph.clone())
    }

    fn update<T>(&self, f: impl FnOnce(&mut Graph) -> Result<T>) -> Result<T> {
        let mut graph = self
            .graph
            .lock()
            .map_err(|_| anyhow!("graph lock poisoned"))?;
        let mut staged = graph.clone();
        let value = f(&mut staged)?;
        *graph = staged;
        Ok(value)
    }

    fn append_event(&self, event: &Event) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("event lock poisoned"))?
            .push(event.clone());
        Ok(())
    }

    fn events(&self) -> Result<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .map_err(|_| anyhow!("event lock poisoned"))?
            .clone())
    }
}

/// Store backed by `.dagrun/graph.json` and `.dagrun/events.jsonl`.
///
/// Writers take an exclusive lock file, so separate processes sharing one
/// directory serialize their updates.
pub struct FileStore {
    paths: DagPaths,
    schema: Validator,
    lock_attempts: u32,
}

impl FileStore {
    /// Open the store under `root`. Requires a prior `dagrun init`.
    pub fn open(root: &Path) -> Result<Self> {
        let paths = DagPaths::new(root);
        if !paths.graph_path.is_file() {
            return Err(anyhow!(
                "missing {} (run `dagrun init` first)",
                paths.graph_path.display()
            ));
        }
        let schema_value: Value =
            serde_json::from_str(GRAPH_SCHEMA).context("parse embedded graph schema")?;
        let schema =
            validator_for(&schema_value).map_err(|err| anyhow!("invalid graph schema: {err}"))?;
        Ok(Self {
            paths,
            schema,
            lock_attempts: LOCK_ATTEMPTS,
        })
    }

    /// Override how many times a writer tries to take the lock.
    pub fn with_lock_attempts(mut self, attempts: u32) -> Self {
        self.lock_attempts = attempts.max(1);
        self
    }

    pub fn paths(&self) -> &DagPaths {
        &self.paths
    }

    fn load(&self) -> Result<Graph> {
        let path = &self.paths.graph_path;
        let contents =
            fs::read_to_string(path).with_context(|| format!("read graph {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse graph {}", path.display()))?;
        if !self.schema.is_valid(&value) {
            let messages = self
                .schema
                .iter_errors(&value)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();
            return Err(anyhow!(
                "graph schema validation failed: {}",
                messages.join("; ")
            ));
        }
        serde_json::from_value(value)
            .with_context(|| format!("deserialize graph {}", path.display()))
    }

    fn lock(&self) -> Result<LockGuard> {
        LockGuard::acquire(&self.paths.lock_path, self.lock_attempts)
    }
}

impl GraphStore for FileStore {
    fn snapshot(&self) -> Result<Graph> {
        self.load()
    }

    #[instrument(skip_all, fields(graph = %self.paths.graph_path.display()))]
    fn update<T>(&self, f: impl FnOnce(&mut Graph) -> Result<T>) -> Result<T> {
        let _guard = self.lock()?;
        let mut graph = self.load()?;
        let value = f(&mut graph)?;
        write_graph_file(&self.paths.graph_path, &graph)?;
        debug!(nodes = graph.nodes.len(), edges = graph.edges.len(), "graph written");
        Ok(value)
    }

    fn append_event(&self, event: &Event) -> Result<()> {
        append_event(&self.paths.events_path, event)
    }

    fn events(&self) -> Result<Vec<Event>> {
        read_events(&self.paths.events_path)
    }
}

/// Exclusive lock file, removed on drop.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(path: &Path, attempts: u32) -> Result<Self> {
        let mut backoff = LOCK_BACKOFF_START;
        for attempt in 1..=attempts {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(attempt, "graph lock busy");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(LOCK_BACKOFF_MAX);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lock {}", path.display()));
                }
            }
        }
        warn!(lock = %path.display(), "gave up waiting for graph lock");
        Err(anyhow!(
            "graph is locked by another process ({}); remove it if no dagrun is running",
            path.display()
        ))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(err = %err, lock = %self.path.display(), "failed to release graph lock");
        }
    }
}
