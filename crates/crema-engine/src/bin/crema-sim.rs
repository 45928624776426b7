//! Runs the optimizer against the simulated espresso machine.
//!
//! Environment:
//! - `CREMA_CONFIG`: run configuration JSON (defaults otherwise)
//! - `CREMA_DATA_DIR`: run store root (defaults to the platform data dir)
//! - `CREMA_RUN_ID`: resume this run if stored, else start it under this id
//! - `CREMA_SIM_SEED`: simulator noise seed
//! - `CREMA_EXPORT_CSV`: write the trial history here when done
//! - `CREMA_ROAST_DATE`: roast date of the beans (YYYY-MM-DD), recorded with every shot

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crema_engine::report::{export_csv_file, export_text};
use crema_engine::{FileRunStore, Orchestrator, RunStore, SimulatedMachine, SimulatorConfig};
use crema_optimizer::ParameterSpace;
use crema_types::{BrewContext, RunConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::var("CREMA_CONFIG") {
        Ok(path) => RunConfig::from_json_file(&path)
            .with_context(|| format!("loading run config from {path}"))?,
        Err(_) => RunConfig::default(),
    };
    let store = match std::env::var("CREMA_DATA_DIR") {
        Ok(dir) => FileRunStore::new(&dir)?,
        Err(_) => FileRunStore::default_location()?,
    };
    let seed = match std::env::var("CREMA_SIM_SEED") {
        Ok(s) => s.parse().context("CREMA_SIM_SEED must be an integer")?,
        Err(_) => config.seed,
    };
    let machine = SimulatedMachine::new(SimulatorConfig {
        seed,
        ..SimulatorConfig::default()
    });

    let run_id = std::env::var("CREMA_RUN_ID").ok();
    let stored = match &run_id {
        Some(id) => store.list_runs()?.iter().any(|r| r == id),
        None => false,
    };
    let mut orchestrator = match run_id {
        Some(id) if stored => Orchestrator::resume(&id, machine, store)?,
        Some(id) => {
            Orchestrator::new(ParameterSpace::espresso_default(), config, machine, store)?
                .with_run_id(id)
        }
        None => Orchestrator::new(ParameterSpace::espresso_default(), config, machine, store)?,
    };

    if let Ok(date) = std::env::var("CREMA_ROAST_DATE") {
        let roasted = chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .context("CREMA_ROAST_DATE must be YYYY-MM-DD")?;
        let today = chrono::Local::now().date_naive();
        orchestrator.set_brew_context(Some(BrewContext::from_roast_date(roasted, today, true)));
    }

    let handle = orchestrator.cancellation_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let report = orchestrator.run().await?;
    println!("run {}: {}", report.run_id, report.termination);
    println!("{}", export_text(orchestrator.history()));

    if let Ok(path) = std::env::var("CREMA_EXPORT_CSV") {
        export_csv_file(orchestrator.history(), orchestrator.space(), &path)
            .with_context(|| format!("exporting history to {path}"))?;
    }
    Ok(())
}
