use anyhow::{ensure, Context, Result};
use log::{error, info, warn};
use seplosbms_lib::connector::SeplosBms;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::commandline::OutputFormat;

fn print_simple(topic: &str, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                print_simple(&format!("{topic}/{k}"), v);
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                print_simple(&format!("{topic}/{i}"), v);
            }
        }
        serde_json::Value::String(s) => println!("{topic} {s}"),
        serde_json::Value::Number(n) => println!("{topic} {n}"),
        serde_json::Value::Bool(b) => println!("{topic} {b}"),
        serde_json::Value::Null => {
            // Nothing to print for missing values
        }
    }
}

fn latest_samples<S>(bms: &SeplosBms<S>) -> Result<serde_json::Map<String, serde_json::Value>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut devices = serde_json::Map::new();
    for address in bms.devices() {
        devices.insert(
            address.to_string(),
            json!({
                "telemetry": serde_json::to_value(bms.latest_telemetry(address))?,
                "alarm": serde_json::to_value(bms.latest_alarm(address))?,
            }),
        );
    }
    Ok(devices)
}

fn report<S>(bms: &SeplosBms<S>, format: OutputFormat) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match format {
        OutputFormat::Console => {
            println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
            for address in bms.devices() {
                println!("{address} telemetry: {:?}", bms.latest_telemetry(address));
                println!("{address} alarm: {:?}", bms.latest_alarm(address));
            }
            println!("--------------------------");
        }
        OutputFormat::Simple => {
            for (address, value) in latest_samples(bms)? {
                print_simple(&format!("seplosbms/{address}"), &value);
            }
        }
        OutputFormat::Json => {
            let mut document = serde_json::Map::new();
            document.insert(
                "timestamp".to_string(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
            document.insert(
                "devices".to_string(),
                serde_json::Value::Object(latest_samples(bms)?),
            );
            println!(
                "{}",
                serde_json::to_string(&document).context("Cannot serialize samples")?
            );
        }
    }
    Ok(())
}

/// Polls all packs in the background and prints the latest samples until Ctrl-C.
pub async fn run<S>(
    bms: Arc<SeplosBms<S>>,
    format: OutputFormat,
    report_interval: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    ensure!(!report_interval.is_zero(), "Report interval must not be zero");
    info!("Starting daemon mode: format={format:?}, report_interval={report_interval:?}");
    let polling = if bms.devices().is_empty() {
        warn!("No devices found, nothing will be polled");
        None
    } else {
        let poller = bms.clone();
        Some(tokio::spawn(async move {
            poller.start_continuous_polling().await
        }))
    };

    let mut ticker = tokio::time::interval(report_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = report(&bms, format) {
                    error!("Cannot report samples: {e:?}");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Cannot listen for Ctrl-C")?;
                info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    bms.shutdown().await;
    if let Some(polling) = polling {
        polling.await.context("Polling task failed")?;
    }
    Ok(())
}
