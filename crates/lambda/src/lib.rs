// Scheduled-event handler: one invocation is one collection run.

use std::sync::Arc;

use anyhow::Context;
use iam_collector_core::{Collector, CollectorSettings, RunStatus, RunSummary};
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;

pub const PARAMETER_NAME_ENV: &str = "ACCOUNTS_PARAMETER_NAME";

/// Runs one collection. The payload is ignored; everything comes from the configuration parameter.
pub async fn handle_event(payload: Value, collector: &Collector) -> Result<Value, Error> {
    if let Some(source) = payload.get("source").and_then(Value::as_str) {
        info!(source, "invoked");
    }
    let summary = collector.run().await.map_err(|e| {
        error!(error = %e, "configuration error, nothing collected");
        Error::from(format!("configuration error: {e}"))
    })?;
    summary_response(&summary)
}

/// Serialized summary; a run where no account succeeded fails the invocation so it shows up in error metrics.
pub fn summary_response(summary: &RunSummary) -> Result<Value, Error> {
    if summary.status == RunStatus::Failed {
        let reasons: Vec<String> = summary.failures().map(|(account, f)| format!("{account}: {} ({})", f.kind, f.message)).collect();
        return Err(Error::from(format!(
            "no account succeeded ({} attempted): {}",
            summary.attempted,
            reasons.join("; ")
        )));
    }
    Ok(serde_json::to_value(summary)?)
}

/// Lambda runtime entry point
pub async fn run() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .without_time()
        .init();

    let parameter_name = std::env::var(PARAMETER_NAME_ENV).with_context(|| format!("{PARAMETER_NAME_ENV} must be set"))?;
    let settings = CollectorSettings::from_env();
    info!(
        parameter = %parameter_name,
        max_concurrency = settings.max_concurrency,
        max_attempts = settings.retry.max_attempts,
        run_timeout_secs = settings.run_timeout.as_secs(),
        "collector starting"
    );

    let sdk = iam_collector_clients::load_sdk_config().await;
    let collector = Arc::new(iam_collector_clients::collector(&sdk, parameter_name, settings));

    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        let collector = Arc::clone(&collector);
        async move { handle_event(event.payload, &collector).await }
    }))
    .await
}
