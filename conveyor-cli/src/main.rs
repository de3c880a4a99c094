//! Command-line shell for the conveyor catalog pipeline.
//!
//! Loads configuration once from the environment, wires the collaborators,
//! optionally restricts the run to a requested step subset, and maps the
//! run status to the exit code contract: 0 success, 1 aborted, 2 partial.

use anyhow::Context;
use conveyor::prelude::*;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

fn usage() -> String {
    let steps = StepId::all()
        .iter()
        .map(|id| format!("  {id}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Usage: conveyor [STEP...]\n\n\
         Runs the catalog pipeline. With no arguments the full pipeline runs\n\
         in declared order; with arguments, only the named steps run (the\n\
         selection must include every dependency of a selected step).\n\n\
         Steps:\n{steps}\n"
    )
}

fn parse_steps(args: &[String]) -> anyhow::Result<Vec<StepId>> {
    args.iter()
        .map(|raw| StepId::from_str(raw).map_err(anyhow::Error::from))
        .collect()
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print!("{}", usage());
        return ExitCode::SUCCESS;
    }

    let requested = match parse_steps(&args) {
        Ok(requested) => requested,
        Err(err) => {
            eprintln!("conveyor: {err}");
            eprintln!();
            eprint!("{}", usage());
            return ExitCode::from(1);
        }
    };

    match run(requested) {
        Ok(status) => match status {
            RunStatus::Success => ExitCode::SUCCESS,
            RunStatus::Aborted => ExitCode::from(1),
            RunStatus::Partial => ExitCode::from(2),
        },
        Err(err) => {
            eprintln!("conveyor: {err:#}");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run(requested: Vec<StepId>) -> anyhow::Result<RunStatus> {
    // Environment is read exactly once, here; components only ever see the
    // explicit configuration value.
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();

    for dir in [&config.data_dir, &config.report_dir, &config.evidence_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create directory {}", dir.display()))?;
    }
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create directory {}", parent.display()))?;
    }

    let store = Arc::new(
        DedupStore::open(&config.database_path)
            .await
            .context("opening record store")?,
    );
    let source = Arc::new(
        HttpCatalogSource::new(&config.api_endpoint, config.http_timeout)
            .context("building catalog source")?,
    );

    let sync = match &config.remote.base_url {
        Some(base_url) => {
            let objects = HttpObjectStore::new(
                base_url,
                config.remote.bearer_token.clone(),
                config.http_timeout,
            )
            .context("building remote object store")?;
            Some(Arc::new(SyncClient::new(
                Arc::new(objects),
                RetryExecutor::new(config.network_retry.clone()),
            )))
        }
        None => None,
    };

    let driver: Option<Arc<dyn FormDriver>> = match &config.form.url {
        Some(url) => Some(Arc::new(
            WebhookFormDriver::new(url, config.http_timeout).context("building form driver")?,
        )),
        None => None,
    };

    let mut probes: Vec<Arc<dyn DependencyProbe>> = vec![
        Arc::new(StoreProbe::new(store.clone())),
        Arc::new(
            EndpointProbe::new("catalog-api", &config.api_endpoint, config.probe_timeout)
                .context("building catalog probe")?,
        ),
    ];
    if let Some(base_url) = &config.remote.base_url {
        probes.push(Arc::new(
            EndpointProbe::new("remote-store", base_url, config.probe_timeout)
                .context("building remote probe")?,
        ));
    }
    if let Some(driver) = &driver {
        probes.push(Arc::new(DriverProbe::new(driver.clone())));
    }

    let run_id = Uuid::new_v4();
    let evidence = Arc::new(EvidenceLog::new(run_id));

    let mut plan = build_plan(
        &config,
        PipelineParts {
            source,
            store,
            sync,
            driver,
            evidence: evidence.clone(),
        },
    )?;
    if !requested.is_empty() {
        plan = plan.subset(&requested)?;
    }

    let orchestrator = Orchestrator::new(
        plan,
        RetryExecutor::new(config.retry.clone()),
        HealthChecker::new(probes, config.probe_timeout),
        evidence,
    )
    .with_run_timeout(config.run_timeout);

    let token = Arc::new(RunToken::new());
    let interrupt_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling run");
            interrupt_token.cancel("interrupted");
        }
    });

    let record = orchestrator.run(token, run_id).await;
    println!("{}", record.summary());
    Ok(record.overall)
}
