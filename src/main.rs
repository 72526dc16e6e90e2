use std::{process, sync::Arc};

use futures::StreamExt;
use serde::Serialize;
use soffio_memo::{
    config::{self, CleanupArgs, Command, FingerprintArgs, InspectArgs, Settings, SweepArgs},
    error::AppError,
    infra::{error::InfraError, telemetry},
    memo::{
        CacheEntry, CleanupReport, ExcludedKeys, MemoCache, Value, fingerprint_values,
        spawn_periodic_cleanup,
    },
    store::{self, EntryStore},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match cli_args.command {
        Command::Cleanup(args) => run_cleanup(&settings, args).await,
        Command::Sweep(args) => run_sweep(&settings, args).await,
        Command::Inspect(args) => run_inspect(&settings, args).await,
        Command::Fingerprint(args) => run_fingerprint(args),
    }
}

async fn open_cache(settings: &Settings) -> Result<MemoCache, AppError> {
    let store = store::open(&settings.store).await?;
    Ok(MemoCache::new(store))
}

async fn run_cleanup(settings: &Settings, args: CleanupArgs) -> Result<(), AppError> {
    let namespace = args.namespace.trim();
    if namespace.is_empty() {
        return Err(AppError::validation("cleanup requires a non-empty --namespace"));
    }

    let cache = open_cache(settings).await?;
    let report = cache.cleanup(args.max_age_minutes, namespace).await;
    print_report(namespace, &report);
    Ok(())
}

async fn run_sweep(settings: &Settings, args: SweepArgs) -> Result<(), AppError> {
    let policies = settings.cleanup.policies.clone();
    if policies.is_empty() {
        return Err(AppError::validation(
            "sweep requires at least one [[cleanup.policies]] entry",
        ));
    }

    let cache = open_cache(settings).await?;

    if !args.watch {
        for (namespace, report) in cache.sweep(&policies).await {
            print_report(&namespace, &report);
        }
        return Ok(());
    }

    info!(
        target = "soffio_memo::sweep",
        policies = policies.len(),
        interval_secs = settings.cleanup.interval.as_secs(),
        "Starting periodic cleanup"
    );
    let handle = spawn_periodic_cleanup(cache, policies, settings.cleanup.interval);

    let signal = tokio::signal::ctrl_c().await;
    handle.abort();
    let _ = handle.await;

    signal.map_err(InfraError::Signal)?;
    info!(target = "soffio_memo::sweep", "Periodic cleanup stopped");
    Ok(())
}

#[derive(Serialize)]
struct InspectRow<'a> {
    id: &'a str,
    age_minutes: i64,
    placeholder: bool,
    fields: usize,
}

impl<'a> InspectRow<'a> {
    fn new(entry: &'a CacheEntry, now: i64) -> Self {
        Self {
            id: entry.id.as_str(),
            age_minutes: entry.age_minutes(now),
            placeholder: entry.is_placeholder(),
            fields: entry.fields.len(),
        }
    }
}

async fn run_inspect(settings: &Settings, args: InspectArgs) -> Result<(), AppError> {
    let cache = open_cache(settings).await?;
    let store: Arc<dyn EntryStore> = Arc::clone(cache.store());
    let now = cache.now_minutes();

    let mut listed = 0usize;
    let mut unreadable = 0usize;
    let mut entries = store.iterate();
    while let Some(item) = entries.next().await {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                unreadable += 1;
                warn!(target = "soffio_memo::inspect", error = %err, "Skipping unreadable entry");
                continue;
            }
        };
        if entry.namespace != args.namespace {
            continue;
        }
        listed += 1;

        let row = InspectRow::new(&entry, now);
        if args.json {
            let line = serde_json::to_string(&row)
                .map_err(|err| AppError::unexpected(format!("failed to encode entry: {err}")))?;
            println!("{line}");
        } else {
            println!(
                "{}  age={}m  fields={}{}",
                row.id,
                row.age_minutes,
                row.fields,
                if row.placeholder { "  (empty result)" } else { "" }
            );
        }
    }

    info!(
        target = "soffio_memo::inspect",
        namespace = %args.namespace,
        listed,
        unreadable,
        "Inspection finished"
    );
    Ok(())
}

fn run_fingerprint(args: FingerprintArgs) -> Result<(), AppError> {
    let excluded: ExcludedKeys = args
        .exclude
        .iter()
        .map(|key| key.trim())
        .filter(|key| !key.is_empty())
        .collect();

    let values: Vec<Value> = args
        .args
        .iter()
        .map(|raw| match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(parsed) => Value::from(parsed),
            Err(_) => Value::from(raw.as_str()),
        })
        .collect();

    println!("{}", fingerprint_values(&excluded, &values));
    Ok(())
}

fn print_report(namespace: &str, report: &CleanupReport) {
    println!(
        "{namespace}: scanned={} matched={} deleted={} errors={}",
        report.scanned, report.matched, report.deleted, report.errors
    );
}
