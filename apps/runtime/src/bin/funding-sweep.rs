use std::io::Write;

use admarket_runtime::{build_delivery_service, config::Config, frequency::MAX_WINDOW_HOURS};
use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use clap::Parser;
use serde_json::json;

/// Resume auto-paused campaigns whose advertisers are funded again.
#[derive(Parser, Debug)]
struct Args {
    /// Also delete frequency exposures older than the longest cap window.
    #[arg(long)]
    prune_frequency: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("load runtime config")?;
    if config.db_url.is_none() {
        bail!("DB_URL or DATABASE_URL must be set");
    }

    let delivery = build_delivery_service(&config).await?;
    let resumed = delivery.run_funding_sweep().await;
    let pruned = if args.prune_frequency {
        let cutoff = Utc::now() - Duration::hours(i64::from(MAX_WINDOW_HOURS));
        delivery
            .frequency()
            .prune_expired(cutoff)
            .await
            .context("prune frequency exposures")?
    } else {
        0
    };

    let summary = json!({
        "resumed_campaigns": resumed,
        "pruned_exposures": pruned,
    });
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &summary)?;
    writeln!(stdout)?;
    Ok(())
}
