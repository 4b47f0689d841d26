//! OTX Pulse Sync — Binary Entrypoint
//! One incremental run: resume from the persisted watermark, or pass a single
//! ISO8601 argument to start from an explicit `modified_since` instead.
//!
//! See `README.md` for configuration.

use std::process::ExitCode;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use otx_pulse_sync::config::SyncConfig;
use otx_pulse_sync::fetch::HttpFetchClient;
use otx_pulse_sync::run::Runner;
use otx_pulse_sync::store::{DocumentStore, JsonDirStore, NoopStore};
use otx_pulse_sync::watermark::{StartPoint, WatermarkStore};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("otx_pulse_sync=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

/// A single optional positional argument: explicit ISO8601 since override.
fn resolve_start_point() -> anyhow::Result<StartPoint> {
    match std::env::args().nth(1) {
        None => Ok(StartPoint::FromWatermark),
        Some(arg) => {
            let ts = chrono::DateTime::parse_from_rfc3339(&arg)
                .with_context(|| format!("invalid since override {arg:?}, expected ISO8601"))?
                .with_timezone(&chrono::Utc);
            Ok(StartPoint::FromExplicitSince(ts))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env in local/dev; no-op when variables come from the real env.
    let _ = dotenvy::dotenv();
    init_tracing();

    match sync_once().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[fatal] {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn sync_once() -> anyhow::Result<()> {
    let cfg = SyncConfig::from_env();
    let start = resolve_start_point()?;

    let client = HttpFetchClient::from_config(&cfg)?;

    // Preflight: fail fast on bad credentials, before touching any state.
    let me = client
        .validate_credentials()
        .await
        .map_err(|e| anyhow::anyhow!("{e} ({})", e.kind()))?;
    tracing::info!(
        username = me.get("username").and_then(|v| v.as_str()).unwrap_or("?"),
        pulses = me.get("pulse_count").and_then(|v| v.as_u64()).unwrap_or(0),
        "authenticated against the pulse API"
    );

    let store: Box<dyn DocumentStore> = if cfg.dry_run {
        tracing::info!("dry run: documents will not be written");
        Box::new(NoopStore)
    } else {
        Box::new(JsonDirStore::new(
            &cfg.store_uri,
            &cfg.store_database,
            &cfg.store_collection,
        ))
    };
    let watermarks = WatermarkStore::new(&cfg.watermark_file);

    let runner = Runner::new(&cfg, &client, store.as_ref(), watermarks);
    let report = runner
        .run(start)
        .await
        .map_err(|e| anyhow::anyhow!("{e} ({})", e.kind()))?;

    println!(
        "[done] {} pages, {} upserted, {} failed, {} skipped -> {}",
        report.pages,
        report.records_upserted,
        report.records_failed,
        report.records_skipped,
        store.target()
    );
    if let Some(since) = report.watermark.since {
        println!(
            "[watermark] since={} -> {}",
            since.to_rfc3339(),
            cfg.watermark_file.display()
        );
    }
    Ok(())
}
