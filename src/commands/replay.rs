//! Replay command implementation

use anyhow::{Context, Result};
use crypto_alerts::clock::ManualClock;
use crypto_alerts::feed::{StaticCandleFeed, VecSampleFeed};
use crypto_alerts::notify::LogNotifier;
use crypto_alerts::service::pump;
use crypto_alerts::{data, AlertEngine, AlertService, Settings};
use std::sync::Arc;
use tracing::info;

pub fn run(
    config_path: String,
    input: String,
    anchor: Option<f64>,
    candles_4h: Option<String>,
    candles_1d: Option<String>,
) -> Result<()> {
    info!("Starting replay");

    let mut settings = Settings::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    let samples = data::load_samples_csv(&input)?;
    if samples.is_empty() {
        anyhow::bail!("No samples in {}", input);
    }

    let candles = match (candles_4h, candles_1d) {
        (Some(four_hours), Some(one_day)) => {
            info!("Auto-anchor enabled from candle files");
            settings.auto_anchor.enabled = true;
            StaticCandleFeed::new(
                data::load_candles_csv(&four_hours)?,
                data::load_candles_csv(&one_day)?,
            )
        }
        (None, None) => StaticCandleFeed::empty(),
        _ => anyhow::bail!("--candles-4h and --candles-1d must be given together"),
    };

    let instrument = settings.instrument.clone();
    let runtime = tokio::runtime::Runtime::new()?;
    let (forwarded, stats) = runtime.block_on(async {
        let (service, handle) = AlertService::new(
            AlertEngine::new(settings),
            Arc::new(candles),
            LogNotifier,
            Arc::new(ManualClock::default()),
        );
        let task = tokio::spawn(service.run());

        if let Some(price) = anchor {
            handle.set_anchor(Some(price)).await?;
        }

        let mut feed = VecSampleFeed::new(samples);
        let forwarded = pump(&mut feed, &handle).await?;

        // end of input behaves like a disconnect
        handle.flush().await?;
        handle.shutdown().await?;

        let stats = task.await.context("Alert service task failed")?;
        Ok::<_, anyhow::Error>((forwarded, stats))
    })?;

    println!("\n{}", "=".repeat(60));
    println!("REPLAY RESULTS: {}", instrument);
    println!("{}", "=".repeat(60));
    println!("Samples read:       {}", forwarded);
    println!("Ticks processed:    {}", stats.ticks_processed);
    println!("Ticks rejected:     {}", stats.ticks_rejected);
    println!("Alerts emitted:     {}", stats.alerts_emitted);
    println!("Deliveries failed:  {}", stats.deliveries_failed);
    println!("Suppressed (limit): {}", stats.suppressed_by_limiter);
    println!("Throttled:          {}", stats.throttled);
    println!("Coalesced away:     {}", stats.coalesced_away);
    println!("Dropped at flush:   {}", stats.dropped_at_flush);
    println!("{}", "=".repeat(60));

    info!("Replay completed successfully");
    Ok(())
}
