use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::signal;

use lifecycle_harness::config::{create_sample_config, load_config};
use lifecycle_harness::scenarios::{self, ScenarioKind, ScenarioOutcome};
use lifecycle_harness::simulator::{SimulatedProvider, SimulationProfile};
use lifecycle_harness::{CancelHandle, LifecycleOrchestrator, ScriptReport, TestResourceRegistry};

fn cli() -> Command {
    Command::new("lifecycle-harness")
        .version("0.1.0")
        .about("Lifecycle harness - Drives provisioning lifecycle scenarios and reclaims what they create")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config/harness.toml"),
        )
        .arg(
            Arg::new("scenario")
                .short('s')
                .long("scenario")
                .value_name("NAME[,NAME...]")
                .help("Scenarios to run, or `all`")
                .default_value("all"),
        )
        .arg(
            Arg::new("concurrent")
                .long("concurrent")
                .help("Run the selected scenarios concurrently")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("sweep-orphans")
                .long("sweep-orphans")
                .help("Reclaim resources left behind by earlier runs before starting")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("poll-interval-ms")
                .long("poll-interval-ms")
                .value_name("MILLIS")
                .help("Polling cadence for every wait"),
        )
        .arg(
            Arg::new("fetch-timeout-ms")
                .long("fetch-timeout-ms")
                .value_name("MILLIS")
                .help("Bound on a single status read; must be shorter than the poll interval"),
        )
        .arg(
            Arg::new("provision-timeout-secs")
                .long("provision-timeout-secs")
                .value_name("SECONDS")
                .help("Timeout for a freshly created resource to stabilize"),
        )
        .arg(
            Arg::new("marker-prefix")
                .long("marker-prefix")
                .value_name("PREFIX")
                .help("Prefix stamped on every created resource"),
        )
        .arg(
            Arg::new("run-label")
                .long("run-label")
                .value_name("LABEL")
                .help("Label distinguishing this run from others sharing the account"),
        )
        .arg(
            Arg::new("jitter-polls")
                .long("jitter-polls")
                .value_name("NUMBER")
                .help("Extra polls the simulated service may add to every phase")
                .value_parser(clap::value_parser!(u32))
                .default_value("0"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_name("NUMBER")
                .help("Seed for the simulated service's jitter")
                .value_parser(clap::value_parser!(u64))
                .default_value("0"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print reports as JSON instead of summary lines")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (error, warn, info, debug, trace)"),
        )
        .arg(
            Arg::new("write-sample-config")
                .long("write-sample-config")
                .value_name("FILE")
                .help("Write a default configuration file and exit"),
        )
}

#[derive(Serialize)]
struct ReportLine<'a> {
    name: &'a str,
    passed: bool,
    elapsed_ms: u128,
    error: Option<String>,
    cleanup_errors: Vec<String>,
    outcome: Option<&'a ScenarioOutcome>,
}

impl<'a> From<&'a ScriptReport<ScenarioOutcome>> for ReportLine<'a> {
    fn from(report: &'a ScriptReport<ScenarioOutcome>) -> Self {
        Self {
            name: &report.name,
            passed: report.is_success(),
            elapsed_ms: report.elapsed.as_millis(),
            error: report.result.as_ref().err().map(|e| e.to_string()),
            cleanup_errors: report.cleanup_errors.iter().map(|e| e.to_string()).collect(),
            outcome: report.result.as_ref().ok(),
        }
    }
}

fn selected_scenarios(matches: &ArgMatches) -> Result<Vec<ScenarioKind>> {
    let selection = matches
        .get_one::<String>("scenario")
        .map(String::as_str)
        .unwrap_or("all");

    if selection == "all" {
        return Ok(ScenarioKind::ALL.to_vec());
    }

    selection
        .split(',')
        .map(|name| name.trim().parse::<ScenarioKind>().map_err(Into::into))
        .collect()
}

fn simulation_profile(matches: &ArgMatches) -> SimulationProfile {
    SimulationProfile {
        jitter_polls: matches.get_one::<u32>("jitter-polls").copied().unwrap_or(0),
        seed: matches.get_one::<u64>("seed").copied().unwrap_or(0),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    if let Some(path) = matches.get_one::<String>("write-sample-config") {
        return create_sample_config(path);
    }

    // Load configuration from file, env, and CLI args
    let config_path = matches.get_one::<String>("config");
    let config = load_config(config_path.map(|s| s.as_str()), &matches)?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    let kinds = selected_scenarios(&matches)?;
    let provider = Arc::new(SimulatedProvider::new(simulation_profile(&matches)));
    let registry = Arc::new(TestResourceRegistry::new());
    let cancel = CancelHandle::new();
    let orchestrator =
        LifecycleOrchestrator::new(provider, registry.clone(), config, cancel.token())
            .context("Failed to build orchestrator")?;

    info!(
        "Lifecycle harness starting: {} scenario(s), marker {}",
        kinds.len(),
        orchestrator.marker()
    );

    // Ctrl+C cancels in-flight waits; teardown still issues deletes
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Shutdown signal received, cancelling in-flight waits...");
                cancel.cancel();
            }
        }
    });

    let mut failures = 0;

    if matches.get_flag("sweep-orphans") {
        let marker = orchestrator.marker().widen();
        match orchestrator.reclaim_orphans(&marker, None).await {
            Ok(report) => {
                info!(
                    "Orphan sweep reclaimed {} of {} discovered resource(s)",
                    report.reclaimed.len(),
                    report.discovered.len()
                );
                for failure in &report.failures {
                    error!("Orphan sweep: {failure}");
                }
                failures += report.failures.len();
            }
            Err(e) => {
                error!("Orphan discovery failed: {e}");
                failures += 1;
            }
        }
    }

    let reports = if matches.get_flag("concurrent") {
        scenarios::run_concurrently(&orchestrator, &kinds).await
    } else {
        scenarios::run_all(&orchestrator, &kinds).await
    };

    if matches.get_flag("json") {
        let lines: Vec<ReportLine> = reports.iter().map(ReportLine::from).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&lines).context("Failed to serialize reports")?
        );
    } else {
        for report in &reports {
            println!("{}", report.summary());
        }
    }
    failures += reports.iter().filter(|r| !r.is_success()).count();

    // Anything a script could not reclaim gets one more attempt
    if !registry.is_empty() {
        let leftovers = orchestrator.sweep().await;
        for failure in &leftovers {
            error!("Final sweep: {failure}");
        }
        failures += leftovers.len();
    }

    if failures > 0 {
        bail!("{failures} failure(s) across {} scenario(s)", reports.len());
    }

    info!("All {} scenario(s) passed", reports.len());
    Ok(())
}
