mod telemetry;

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;
use telemetry::{Board, CommandEcho};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Emulates Octa-Solar sensor boards posting readings and obeying relay commands.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Ingestor base URL
    #[arg(long, env = "SERVER_URL", default_value = "http://localhost:8080")]
    server_url: String,

    /// Number of simulated boards
    #[arg(long, env = "DEVICES", default_value_t = 1)]
    devices: usize,

    /// Milliseconds between readings per board
    #[arg(long, env = "INTERVAL_MS", default_value_t = 2000)]
    interval_ms: u64,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "TIMEOUT_MS", default_value_t = 500)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.devices > 0, "at least one device is required");
    anyhow::ensure!(args.interval_ms > 0, "interval must be positive");

    info!("Starting Octa-Solar simulator");
    info!(
        "Server: {}, Devices: {}, Interval: {}ms",
        args.server_url, args.devices, args.interval_ms
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(args.timeout_ms))
        .build()
        .context("failed to build HTTP client")?;
    let url = format!("{}/update", args.server_url.trim_end_matches('/'));

    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let mut tasks = Vec::with_capacity(args.devices);
    for n in 0..args.devices {
        let board = Board::new(
            format!("sim-{}-{}", &run_id[..8], n),
            format!("pump-{}", n),
        );
        tasks.push(tokio::spawn(run_board(
            board,
            client.clone(),
            url.clone(),
            Duration::from_millis(args.interval_ms),
        )));
    }

    tokio::select! {
        _ = join_boards(tasks) => {
            error!("All boards stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}

async fn join_boards(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            error!("Board task failed: {}", e);
        }
    }
}

async fn run_board(mut board: Board, client: reqwest::Client, url: String, interval: Duration) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(interval);
    let mut server_connected = false;
    let mut sent = 0u64;

    loop {
        ticker.tick().await;
        let reading = board.sample(&mut rng, interval.as_secs_f64());

        match post(&client, &url, &reading).await {
            Ok(echo) => {
                if !server_connected {
                    server_connected = true;
                    info!("{}: server connected", board.device_id);
                }
                if board.apply(&echo) {
                    info!(
                        "{}: relay switched {}",
                        board.device_id,
                        if board.relay_on { "ON" } else { "OFF" }
                    );
                }
                sent += 1;
                if sent % 100 == 0 {
                    info!("{}: posted {} readings", board.device_id, sent);
                }
            }
            Err(e) => {
                if server_connected {
                    server_connected = false;
                    warn!("{}: server connection failed: {:#}", board.device_id, e);
                } else {
                    warn!("{}: post failed: {:#}", board.device_id, e);
                }
            }
        }
    }
}

async fn post(
    client: &reqwest::Client,
    url: &str,
    reading: &telemetry::Reading,
) -> anyhow::Result<CommandEcho> {
    let echo = client
        .post(url)
        .json(reading)
        .send()
        .await?
        .error_for_status()?
        .json::<CommandEcho>()
        .await?;
    Ok(echo)
}
