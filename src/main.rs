//! hubmon CLI entry point

mod cli;

use crate::cli::demo::DemoTraffic;
use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use clap::Parser;
use hubmon::client::MonitorClient;
use hubmon::hub::memory::MemoryAdapter;
use hubmon::{Monitor, MonitorConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            auth_timeout_ms,
            debug,
            demo_interval_ms,
        } => {
            let config = MonitorConfig::new()
                .host(cli.host)
                .port(cli.port)
                .password(cli.password.unwrap_or_default())
                .auth_timeout(Duration::from_millis(auth_timeout_ms))
                .debug(debug)
                .on_error(|e| warn!(error = %e, "Monitor client error"));
            serve(config, demo_interval_ms).await
        }
        Commands::Watch { events } => {
            watch(&cli.host, cli.port, cli.password.as_deref(), events).await
        }
    }
}

async fn serve(config: MonitorConfig, demo_interval_ms: u64) -> Result<()> {
    let addr = config.bind_addr();
    let hub = Arc::new(MemoryAdapter::new());
    let monitor = Monitor::attach(hub.clone(), config)
        .await
        .with_context(|| format!("Failed to start monitor on {}", addr))?;
    let monitor = Arc::new(monitor);

    let demo = if demo_interval_ms > 0 {
        let traffic = DemoTraffic::new(monitor.clone(), hub);
        Some(tokio::spawn(traffic.run(Duration::from_millis(demo_interval_ms))))
    } else {
        None
    };

    info!("Starting hubmon, press Ctrl-C to stop...");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    if let Some(demo) = demo {
        demo.abort();
    }
    monitor.shutdown().await;

    Ok(())
}

async fn watch(host: &str, port: u16, password: Option<&str>, events: Vec<String>) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let mut client = MonitorClient::connect(addr.as_str(), password)
        .await
        .with_context(|| format!("Failed to connect to monitor at {}", addr))?;

    info!(addr = %addr, "Connected to monitor");

    while let Some(msg) = client.next_message().await? {
        // init and error are never filtered
        let always = msg.name == "init" || msg.name == "error";
        if !events.is_empty() && !always && !events.contains(&msg.name) {
            continue;
        }
        println!("{}", serde_json::to_string(&msg)?);
    }

    info!("Monitor closed the connection");
    Ok(())
}
