//! queue-sim: replay a build farm scenario through the step scheduler.
//!
//! Reads a TOML scenario of jobsets, builds and steps, dispatches the steps
//! to simulated machines, and prints a JSON report.
//!
//! Each step has a true single-core build time (`needs_secs`). An attempt on
//! `n` cores takes `needs_secs / n`; if that is longer than the grant's
//! permitted run time the attempt is killed and reported as resource
//! exhausted, so the step climbs the ladder until it fits or hits the
//! ceiling.
//!
//! ```toml
//! [[jobsets]]
//! name = "nixpkgs"
//! shares = 100
//!
//! [[builds]]
//! id = 1
//! jobset = "nixpkgs"
//! global_priority = 0
//!
//! [[steps]]
//! id = "/nix/store/...-hello.drv"
//! builds = [1]
//! needs_secs = 120
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use farm_core::{load_dotenv, Build, BuildId, SchedulerConfig, Step, StepId};
use farm_scheduler::{
    AttemptOutcome, AttemptReport, Dispatch, SchedulerMetrics, StepScheduler, Verdict,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Simulate dispatching a build farm scenario through the step scheduler.
#[derive(Parser, Debug)]
#[command(name = "queue-sim", version, about)]
struct Cli {
    /// Path to the scenario TOML file.
    scenario: PathBuf,

    /// Scheduler config TOML. Falls back to FARM_* environment variables.
    #[arg(long, env = "FARM_CONFIG")]
    config: Option<PathBuf>,

    /// Number of simulated build machines.
    #[arg(long, default_value_t = 4)]
    machines: usize,

    /// Cores per simulated machine.
    #[arg(long, default_value_t = 8)]
    machine_cores: u32,
}

// ── Scenario ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default)]
    jobsets: Vec<JobsetEntry>,
    #[serde(default)]
    builds: Vec<BuildEntry>,
    #[serde(default)]
    steps: Vec<StepEntry>,
}

#[derive(Debug, Deserialize)]
struct JobsetEntry {
    name: String,
    shares: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct BuildEntry {
    id: BuildId,
    jobset: String,
    #[serde(default)]
    global_priority: i32,
    #[serde(default)]
    local_priority: i32,
}

#[derive(Debug, Clone, Deserialize)]
struct StepEntry {
    id: String,
    builds: Vec<BuildId>,
    /// Build time on a single core.
    needs_secs: u64,
    /// Fail the build itself once it gets enough resources.
    #[serde(default)]
    fails: bool,
}

// ── Report ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
enum StepResult {
    Succeeded,
    Failed,
    Abandoned,
}

#[derive(Debug, Serialize)]
struct StepReport {
    id: String,
    result: StepResult,
    attempts: u32,
    final_rung: u32,
    simulated_secs: u64,
}

#[derive(Debug, Serialize)]
struct Report {
    config: SchedulerConfig,
    machines: usize,
    machine_cores: u32,
    metrics: SchedulerMetrics,
    shares: BTreeMap<String, f64>,
    steps: Vec<StepReport>,
}

// ── Simulation ──────────────────────────────────────────────────────

/// Resolve one attempt against the grant it was dispatched with.
fn simulate_attempt(dispatch: &Dispatch, entry: &StepEntry, machine_cores: u32) -> AttemptReport {
    let cores = dispatch.grant.cores_on(machine_cores);
    let run_secs = entry.needs_secs.div_ceil(u64::from(cores));
    let permitted = dispatch.grant.permitted_run_time;
    let started_at = Utc::now();

    if Duration::from_secs(run_secs) > permitted {
        AttemptReport::new(AttemptOutcome::ResourceExhausted, started_at, permitted)
    } else if entry.fails {
        AttemptReport::new(AttemptOutcome::LogicalFailure, started_at, Duration::from_secs(run_secs))
    } else {
        AttemptReport::new(AttemptOutcome::Success, started_at, Duration::from_secs(run_secs))
    }
}

/// Register jobsets and builds, and wrap every step for the scheduler.
fn load_scenario(
    scenario: &Scenario,
    sched: &StepScheduler,
) -> anyhow::Result<Vec<Arc<Step>>> {
    let shares = sched.shares();
    for js in &scenario.jobsets {
        shares
            .register(&js.name, js.shares)
            .with_context(|| format!("registering jobset {}", js.name))?;
    }

    let mut builds: HashMap<BuildId, Arc<Build>> = HashMap::new();
    for b in &scenario.builds {
        let jobset = shares.register(&b.jobset, None)?;
        let build = Build::with_priorities(b.id, jobset, b.global_priority, b.local_priority);
        if builds.insert(b.id, Arc::new(build)).is_some() {
            bail!("duplicate build id {}", b.id);
        }
    }

    let mut steps = Vec::with_capacity(scenario.steps.len());
    for s in &scenario.steps {
        let step = Step::new(s.id.as_str());
        for id in &s.builds {
            let build = builds
                .get(id)
                .with_context(|| format!("step {} depends on unknown build {}", s.id, id))?;
            step.add_build(Arc::clone(build));
        }
        steps.push(Arc::new(step));
    }
    Ok(steps)
}

async fn machine_loop(
    machine: usize,
    sched: Arc<StepScheduler>,
    entries: Arc<HashMap<StepId, StepEntry>>,
    machine_cores: u32,
    done: mpsc::Sender<(Dispatch, AttemptReport)>,
) -> anyhow::Result<()> {
    while let Some(dispatch) = sched.next_dispatch().await? {
        let entry = entries
            .get(dispatch.step.id())
            .with_context(|| format!("no scenario entry for step {}", dispatch.step.id()))?;
        let report = simulate_attempt(&dispatch, entry, machine_cores);
        debug!(
            machine,
            step = %dispatch.step.id(),
            outcome = %report.outcome,
            secs = report.duration.as_secs(),
            "Attempt finished"
        );
        if done.send((dispatch, report)).await.is_err() {
            break;
        }
    }
    Ok(())
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.machines == 0 {
        bail!("--machines must be at least 1");
    }

    let config = match &cli.config {
        Some(path) => SchedulerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            load_dotenv();
            SchedulerConfig::from_env().context("loading config from environment")?
        }
    };
    config.log_summary();

    let raw = std::fs::read_to_string(&cli.scenario)
        .with_context(|| format!("reading scenario {}", cli.scenario.display()))?;
    let scenario: Scenario = toml::from_str(&raw).context("parsing scenario")?;

    let machine_cores = config
        .machine_core_cap()
        .map_or(cli.machine_cores, |cap| cap.min(cli.machine_cores));
    let sched = Arc::new(StepScheduler::new(config.clone()));
    let steps = load_scenario(&scenario, &sched)?;
    let entries: Arc<HashMap<StepId, StepEntry>> = Arc::new(
        scenario
            .steps
            .iter()
            .map(|s| (StepId::from(s.id.as_str()), s.clone()))
            .collect(),
    );

    info!(
        steps = steps.len(),
        machines = cli.machines,
        machine_cores,
        "Starting simulation"
    );

    let (tx, mut rx) = mpsc::channel(64);
    let mut machines = Vec::with_capacity(cli.machines);
    for machine in 0..cli.machines {
        machines.push(tokio::spawn(machine_loop(
            machine,
            Arc::clone(&sched),
            Arc::clone(&entries),
            machine_cores,
            tx.clone(),
        )));
    }
    drop(tx);

    for step in &steps {
        sched.make_runnable(Arc::clone(step))?;
    }

    let mut outstanding = steps.len();
    let mut spent: HashMap<StepId, u64> = HashMap::new();
    let mut results: Vec<StepReport> = Vec::with_capacity(steps.len());

    if outstanding == 0 {
        sched.shutdown();
    }

    while outstanding > 0 {
        let Some((dispatch, report)) = rx.recv().await else {
            bail!("all machines stopped with {} steps outstanding", outstanding);
        };
        let id = dispatch.step.id().clone();
        let total = {
            let secs = spent.entry(id.clone()).or_default();
            *secs += report.duration.as_secs();
            *secs
        };

        let finished = match sched.report_attempt(&id, report) {
            Ok(Verdict::Finished) => Some(StepResult::Succeeded),
            Ok(Verdict::Released) => {
                sched.remove(&id)?;
                Some(StepResult::Failed)
            }
            Ok(Verdict::Retry(_)) => None,
            Err(e) if e.is_permanent_failure() => {
                warn!(step = %id, error = %e, "Step abandoned");
                Some(StepResult::Abandoned)
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(result) = finished {
            results.push(StepReport {
                id: id.to_string(),
                result,
                attempts: dispatch.attempt,
                final_rung: dispatch.grant.rung.get(),
                simulated_secs: total,
            });
            outstanding -= 1;
        }

        // Charges from this attempt change the shares other steps see.
        sched.refresh_all()?;

        if outstanding == 0 {
            sched.shutdown();
        }
    }

    for handle in machines {
        handle.await.context("machine task panicked")??;
    }

    let report = Report {
        config,
        machines: cli.machines,
        machine_cores,
        metrics: sched.metrics(),
        shares: sched.shares().snapshot(),
        steps: results,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!("Simulation finished");
    Ok(())
}
