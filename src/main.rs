//! linkwatch - connection stability monitor
//!
//! Probes a host on a fixed interval, logs every tick to CSV and writes an
//! uptime report when monitoring ends.

mod config;
mod monitor;
mod probe;
mod report;
mod series;

use clap::Parser;
use config::{Cli, MonitorConfig};
use monitor::{Monitor, StopReason};
use probe::SystemPing;
use report::ReportOutcome;
use series::SeriesStore;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Diagnostics on stderr; stdout carries the status lines
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("linkwatch=info".parse()?))
        .init();

    let config = Cli::parse().into_config()?;

    if config.only_report {
        publish_report(&SeriesStore::new(&config.log_file), &config);
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, stopping after the current tick");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                tracing::error!("Cannot listen for interrupts: {}", e);
                // Keep the sender alive so the monitor is not told to stop
                std::future::pending::<()>().await;
            }
        }
    });

    let monitor = Monitor::new(config.clone(), SystemPing)?;
    print_banner(&config);
    let (summary, reason) = monitor.run(stop_rx).await;
    println!(
        "Stopped ({}): {} checks, {} connected, {} outages",
        match reason {
            StopReason::DurationElapsed => "duration elapsed",
            StopReason::Requested => "interrupted",
        },
        summary.ticks,
        summary.connected_ticks,
        summary.outages
    );

    publish_report(monitor.store(), &config);
    Ok(())
}

fn print_banner(config: &MonitorConfig) {
    println!("Monitoring {} every {:?} ({})", config.host, config.interval, config.check_method);
    println!("Logging to {}", config.log_file.display());
    match config.duration {
        Some(d) => println!("Stopping after {:?}; press Ctrl+C to stop early", d),
        None => println!("Press Ctrl+C to stop"),
    }
}

/// Report failures are printed, never fatal.
fn publish_report(store: &SeriesStore, config: &MonitorConfig) {
    match report::publish(store, &config.report_file, config.report_format) {
        Ok(ReportOutcome::NoData) => {
            println!("No data in {}, report not written", store.path().display());
        }
        Ok(ReportOutcome::Ready(_)) => {
            println!("Report saved to {}", config.report_file.display());
        }
        Err(e) => {
            tracing::error!("Report generation failed: {}", e);
        }
    }
}
