use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use jostle::testrun::HostTestRunner;
use jostle::worker::{run_plan, WorkerPlan};

/// Subordinate mutation worker. Reads a plan, runs a batch of mutation
/// indices (or the warm-up), and reports one verdict line per index on
/// stdout.
#[derive(Debug, Parser)]
#[command(name = "jostle-worker", version)]
struct Cli {
    /// Plan file written by the scheduler.
    #[arg(long, value_name = "FILE")]
    plan: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let raw = fs::read(&cli.plan)
        .with_context(|| format!("reading plan file {}", cli.plan.display()))?;
    let plan: WorkerPlan = serde_json::from_slice(&raw).context("parsing plan file")?;

    let runner = HostTestRunner::new(
        plan.harness.clone(),
        plan.jvm_args.clone(),
        plan.properties.clone(),
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_plan(&plan, &runner, &mut out).context("running worker plan")?;
    out.flush()?;
    Ok(())
}
