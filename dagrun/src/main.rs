//! `dagrun`: issue-DAG orchestration CLI.
//!
//! Every command operates on `<dir>/.dagrun/` and prints JSON on stdout.
//! Diagnostics go to stderr (see `RUST_LOG`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use dagrun::core::graph::Graph;
use dagrun::core::index::DependencyIndex;
use dagrun::core::lifecycle::{close, expand, reopen};
use dagrun::core::reconcile::{accept_all, reconcile_subtree};
use dagrun::core::selector::ready_leaves;
use dagrun::core::types::{
    ChildSpec, ControlPolicy, DEFAULT_PRIORITY, ExecutionSpec, NodeDraft, NodeKind, Outcome,
};
use dagrun::core::validator::validate;
use dagrun::error::DagError;
use dagrun::exit_codes;
use dagrun::io::clock::now_rfc3339;
use dagrun::io::config::{Maintenance, load_config};
use dagrun::io::events::Event;
use dagrun::io::executor::SubprocessExecutor;
use dagrun::io::paths::{DagPaths, InitOptions, init_dag};
use dagrun::io::review::{AcceptAll, ExecutorReviewer, Reviewer};
use dagrun::io::store::{FileStore, GraphStore, ID_PREFIX, new_node_id, new_run_id};
use dagrun::logging;
use dagrun::looping::{RunConfig, RunReport, StopReason, reset_claims, run_loop, write_report};

/// Route recorded for results applied by hand.
const MANUAL_ROUTE: &str = "manual";

#[derive(Parser)]
#[command(name = "dagrun", version, about = "Issue-DAG orchestration engine")]
struct Cli {
    /// Directory containing `.dagrun/`.
    #[arg(long, global = true, env = "DAGRUN_DIR", default_value = ".")]
    dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.dagrun/` with an empty graph, default config and event log.
    Init {
        /// Overwrite an existing `.dagrun/`.
        #[arg(short, long)]
        force: bool,
    },
    /// Add a node.
    Create(CreateArgs),
    /// List ready leaves in selection order.
    Ready {
        /// Only consider the subtree of this node.
        #[arg(long)]
        root: Option<String>,
    },
    /// Print a node with its edges.
    Show { id: String },
    /// Close a node with an outcome.
    Close {
        id: String,
        #[arg(long)]
        outcome: Outcome,
    },
    /// Reopen a node; `--reorchestrate` also drops its execution spec.
    Reopen {
        id: String,
        #[arg(long)]
        reorchestrate: bool,
    },
    /// Add or remove an edge.
    Edge {
        #[command(subcommand)]
        action: EdgeAction,
    },
    /// Expand a claimed node into children.
    Expand(ExpandArgs),
    /// Drive a root until it reaches a final outcome or the loop stops.
    Run(RunArgs),
    /// Return `in_progress` nodes under a root to `open` after a crashed run.
    Reset { root: String },
    /// Check structural invariants under a root.
    Validate { root: String },
    /// Re-evaluate every control and expanded node under a root.
    Reconcile { root: String },
}

#[derive(Args)]
struct CreateArgs {
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    body: String,
    #[arg(long, default_value_t = DEFAULT_PRIORITY)]
    priority: u8,
    /// Attach the new node under this parent.
    #[arg(long)]
    parent: Option<String>,
    #[arg(long, default_value = "agent")]
    kind: NodeKind,
    /// Required for control nodes.
    #[arg(long)]
    policy: Option<ControlPolicy>,
    /// Executor role; implies an execution spec.
    #[arg(long)]
    spec_role: Option<String>,
    /// Execution payload as JSON; implies an execution spec.
    #[arg(long)]
    spec: Option<String>,
    /// Explicit id instead of a generated one.
    #[arg(long)]
    id: Option<String>,
}

#[derive(Subcommand)]
enum EdgeAction {
    /// `<src> <kind> <dst>`; kind is parent, blocks, related, blocked_by or child.
    Add { src: String, kind: String, dst: String },
    Rm { src: String, kind: String, dst: String },
}

#[derive(Args)]
struct ExpandArgs {
    id: String,
    /// Child title; repeat for several children.
    #[arg(long = "child", required_unless_present = "children")]
    titles: Vec<String>,
    /// Children as a JSON array of child specs.
    #[arg(long, conflicts_with = "titles")]
    children: Option<String>,
    /// Make each `--child` wait on the one before it.
    #[arg(long)]
    chain: bool,
}

#[derive(Args)]
struct RunArgs {
    root: String,
    #[arg(long)]
    max_steps: Option<u32>,
    /// Take over `in_progress` nodes under the root.
    #[arg(long)]
    resume: bool,
    /// Return `in_progress` nodes under the root to `open` before starting.
    #[arg(long, conflicts_with = "resume")]
    reset_in_progress: bool,
    /// Reopen failed or empty expansions when nothing is selectable.
    #[arg(long)]
    repair: bool,
    /// Reconcile the whole subtree after every step.
    #[arg(long)]
    full_maintenance: bool,
    /// Route collapse reviews through the executor.
    #[arg(long)]
    review: bool,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let dir = cli.dir;
    match cli.command {
        Command::Init { force } => cmd_init(&dir, force),
        Command::Create(args) => cmd_create(&dir, args),
        Command::Ready { root } => cmd_ready(&dir, root.as_deref()),
        Command::Show { id } => cmd_show(&dir, &id),
        Command::Close { id, outcome } => cmd_close(&dir, &id, outcome),
        Command::Reopen { id, reorchestrate } => cmd_reopen(&dir, &id, reorchestrate),
        Command::Edge { action } => cmd_edge(&dir, action),
        Command::Expand(args) => cmd_expand(&dir, args),
        Command::Run(args) => cmd_run(&dir, args),
        Command::Reset { root } => cmd_reset(&dir, &root),
        Command::Validate { root } => cmd_validate(&dir, &root),
        Command::Reconcile { root } => cmd_reconcile(&dir, &root),
    }
}

fn cmd_init(dir: &Path, force: bool) -> Result<i32> {
    let paths = init_dag(dir, &InitOptions { force })?;
    print_json(&json!({ "initialized": paths.dag_dir }))?;
    Ok(exit_codes::OK)
}

fn cmd_create(dir: &Path, args: CreateArgs) -> Result<i32> {
    let store = FileStore::open(dir)?;
    let execution_spec = match (&args.spec_role, &args.spec) {
        (None, None) => None,
        (role, payload) => Some(ExecutionSpec {
            role: role.clone(),
            payload: match payload {
                Some(raw) => serde_json::from_str(raw).context("parse --spec as JSON")?,
                None => Value::Null,
            },
        }),
    };
    let draft = NodeDraft {
        title: args.title,
        body: args.body,
        priority: args.priority,
        kind: args.kind,
        policy: args.policy,
        execution_spec,
    };
    let id = args.id.unwrap_or_else(|| new_node_id(ID_PREFIX));
    let now = now_rfc3339();
    let node = store.update(|graph| {
        graph.insert(id.clone(), draft, &now)?;
        if let Some(parent) = &args.parent {
            let edge = Graph::edge_from_raw(&id, "parent", parent)?;
            graph.add_edge(edge, &now)?;
        }
        Ok(graph.node(&id)?.clone())
    })?;
    info!(id = %node.id, "created");
    print_json(&node)?;
    Ok(exit_codes::OK)
}

fn cmd_ready(dir: &Path, root: Option<&str>) -> Result<i32> {
    let graph = FileStore::open(dir)?.snapshot()?;
    if let Some(root) = root {
        graph.node(root)?;
    }
    let index = DependencyIndex::build(&graph);
    print_json(&ready_leaves(&graph, &index, root))?;
    Ok(exit_codes::OK)
}

fn cmd_show(dir: &Path, id: &str) -> Result<i32> {
    let graph = FileStore::open(dir)?.snapshot()?;
    let node = graph.node(id)?;
    let index = DependencyIndex::build(&graph);
    let edges: Vec<_> = graph
        .edges
        .iter()
        .filter(|edge| edge.src == id || edge.dst == id)
        .collect();
    print_json(&json!({
        "node": node,
        "parents": index.parents(id),
        "children": index.children(id),
        "blocked_by": index.blockers(id),
        "edges": edges,
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_close(dir: &Path, id: &str, outcome: Outcome) -> Result<i32> {
    if outcome == Outcome::Expanded {
        bail!(DagError::transition(id, "use `dagrun expand` to expand a node"));
    }
    let store = FileStore::open(dir)?;
    let now = now_rfc3339();
    let node = store.update(|graph| {
        close(graph, id, outcome, &now)?;
        Ok(graph.node(id)?.clone())
    })?;
    let event = Event::result(id, outcome, MANUAL_ROUTE, "closed by hand");
    store.append_event(&event.in_run(run_from_env().as_deref()))?;
    print_json(&node)?;
    Ok(exit_codes::OK)
}

fn cmd_reopen(dir: &Path, id: &str, reorchestrate: bool) -> Result<i32> {
    let store = FileStore::open(dir)?;
    let now = now_rfc3339();
    let node = store.update(|graph| {
        reopen(graph, id, reorchestrate, &now)?;
        Ok(graph.node(id)?.clone())
    })?;
    store.append_event(&Event::reopen(id, MANUAL_ROUTE).in_run(run_from_env().as_deref()))?;
    print_json(&node)?;
    Ok(exit_codes::OK)
}

fn cmd_edge(dir: &Path, action: EdgeAction) -> Result<i32> {
    let store = FileStore::open(dir)?;
    let now = now_rfc3339();
    let (edge, changed) = match action {
        EdgeAction::Add { src, kind, dst } => store.update(|graph| {
            let edge = Graph::edge_from_raw(&src, &kind, &dst)?;
            let added = graph.add_edge(edge.clone(), &now)?;
            Ok((edge, added))
        })?,
        EdgeAction::Rm { src, kind, dst } => store.update(|graph| {
            let edge = Graph::edge_from_raw(&src, &kind, &dst)?;
            let removed = graph.remove_edge(&edge, &now);
            Ok((edge, removed))
        })?,
    };
    print_json(&json!({ "edge": edge, "changed": changed }))?;
    Ok(exit_codes::OK)
}

fn cmd_expand(dir: &Path, args: ExpandArgs) -> Result<i32> {
    let specs = match &args.children {
        Some(raw) => {
            serde_json::from_str::<Vec<ChildSpec>>(raw).context("parse --children as JSON")?
        }
        None => args
            .titles
            .iter()
            .map(|title| ChildSpec::new(NodeDraft::agent(title.as_str())))
            .collect(),
    };
    let specs = if args.chain {
        ChildSpec::chain(specs)
    } else {
        specs
    };
    let store = FileStore::open(dir)?;
    let now = now_rfc3339();
    let created = store.update(|graph| {
        let mut next_id = || new_node_id(ID_PREFIX);
        Ok(expand(graph, &args.id, &specs, &mut next_id, &now)?)
    })?;
    let event = Event::expansion(&args.id, &created);
    store.append_event(&event.in_run(run_from_env().as_deref()))?;
    print_json(&json!({ "id": args.id, "children": created }))?;
    Ok(exit_codes::OK)
}

fn cmd_run(dir: &Path, args: RunArgs) -> Result<i32> {
    let dir = fs::canonicalize(dir).with_context(|| format!("resolve {}", dir.display()))?;
    let store = FileStore::open(&dir)?;
    let paths = DagPaths::new(&dir);
    let cfg = load_config(&paths.config_path)?;

    let mut config = RunConfig::from_section(&cfg.runner);
    if let Some(max_steps) = args.max_steps {
        if max_steps == 0 {
            return Err(anyhow!("--max-steps must be >= 1"));
        }
        config.max_steps = max_steps;
    }
    config.resume |= args.resume;
    config.reset_in_progress = args.reset_in_progress;
    config.repair |= args.repair;
    if args.full_maintenance {
        config.maintenance = Maintenance::Full;
    }

    let executor = SubprocessExecutor::from_config(&cfg.executor, &dir);
    let run_id = new_run_id();
    let report = if args.review || cfg.runner.review {
        let reviewer = ExecutorReviewer::new(&executor, Some(run_id.as_str()));
        drive(&store, &executor, &reviewer, &args.root, &config, &run_id)?
    } else {
        drive(&store, &executor, &AcceptAll, &args.root, &config, &run_id)?
    };

    let report_path = paths.run_report_path(&run_id);
    write_report(&report_path, &report)?;
    print_json(&report)?;
    Ok(match report.stop_reason {
        StopReason::RootFinal => exit_codes::OK,
        StopReason::Error => exit_codes::RUN_ERROR,
        StopReason::NoExecutableLeaf | StopReason::MaxStepsExhausted => exit_codes::NOT_FINAL,
    })
}

fn drive<R: Reviewer>(
    store: &FileStore,
    executor: &SubprocessExecutor,
    reviewer: &R,
    root: &str,
    config: &RunConfig,
    run_id: &str,
) -> Result<RunReport> {
    run_loop(store, executor, reviewer, root, config, run_id, |step| {
        info!(
            step = step.step,
            id = %step.selected,
            outcome = %step.outcome,
            "step recorded"
        );
    })
}

fn cmd_reset(dir: &Path, root: &str) -> Result<i32> {
    let store = FileStore::open(dir)?;
    let reset = reset_claims(&store, root, run_from_env().as_deref())?;
    print_json(&json!({ "root": root, "reset": reset }))?;
    Ok(exit_codes::OK)
}

fn cmd_validate(dir: &Path, root: &str) -> Result<i32> {
    let graph = FileStore::open(dir)?.snapshot()?;
    let report = validate(&graph, root);
    print_json(&report)?;
    Ok(if report.is_ok() {
        exit_codes::OK
    } else {
        exit_codes::VALIDATION_FAILED
    })
}

fn cmd_reconcile(dir: &Path, root: &str) -> Result<i32> {
    let store = FileStore::open(dir)?;
    let now = now_rfc3339();
    let decisions =
        store.update(|graph| Ok(reconcile_subtree(graph, root, &now, &mut accept_all)?))?;
    let run = run_from_env();
    for decision in &decisions {
        for event in Event::for_decision(decision) {
            store.append_event(&event.in_run(run.as_deref()))?;
        }
    }
    print_json(&decisions)?;
    Ok(exit_codes::OK)
}

/// Run id of the enclosing `dagrun run`, when invoked by its executor.
fn run_from_env() -> Option<String> {
    std::env::var("DAGRUN_RUN_ID").ok().filter(|id| !id.is_empty())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}
