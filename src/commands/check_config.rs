//! Check-config command implementation

use anyhow::Result;
use crypto_alerts::Settings;
use tracing::info;

pub fn run(config_path: String) -> Result<()> {
    let settings = Settings::from_file(&config_path)?;
    info!("Configuration {} is valid", config_path);

    println!("\n{}", "=".repeat(60));
    println!("CONFIGURATION");
    println!("{}", "=".repeat(60));
    println!("Instrument:         {}", settings.instrument);
    println!(
        "Thresholds 1m/5m/30m: {:.2}% / {:.2}% / {:.2}%",
        settings.timeframes.spike_1m_pct, settings.timeframes.move_5m_pct, settings.timeframes.move_30m_pct
    );
    println!(
        "Volatility clamp:   {:.2}x .. {:.2}x",
        settings.volatility.min_multiplier, settings.volatility.max_multiplier
    );
    println!(
        "Anchor TP / ML:     {:.2}% / {:.2}%",
        settings.anchor.take_profit_pct, settings.anchor.max_loss_pct
    );
    println!("Auto-anchor:        {}", if settings.auto_anchor.enabled { "on" } else { "off" });
    println!("{}", "=".repeat(60));

    Ok(())
}
