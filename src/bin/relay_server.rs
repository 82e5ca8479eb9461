//! Relay server binary entry point
//!
//! Starts the peerdrop WebSocket relay so peers in different processes or on
//! different machines can exchange signaling traffic.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default address (0.0.0.0:9021)
//! cargo run --bin relay_server
//!
//! # Pick another address and log connection counts every 30s
//! cargo run --bin relay_server -- \
//!   --listen 127.0.0.1:4000 \
//!   --stats-interval-secs 30
//! ```

use clap::Parser;
use peerdrop::RelayServer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// peerdrop signaling relay
///
/// Forwards every text frame to all other connected clients, never back to
/// the sender. The relay holds no state and never inspects message contents.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:9021", env = "PEERDROP_RELAY_LISTEN")]
    listen: String,

    /// Seconds between connection-count log lines (0 disables)
    #[arg(long, default_value_t = 60, env = "PEERDROP_RELAY_STATS_INTERVAL")]
    stats_interval_secs: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Set up Ctrl+C handler at the very start
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, shutting down...");

        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }

        // Give graceful shutdown a bounded window
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_secs(3));
            eprintln!("Graceful shutdown timeout (3s), forcing exit");
            std::process::exit(0);
        });
    })
    .expect("Failed to set Ctrl+C handler");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("relay-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %args.listen,
        "peerdrop relay starting"
    );

    let server = RelayServer::bind(&args.listen).await?;
    info!("Relay ready at {}", server.url());

    if args.stats_interval_secs > 0 {
        info!(
            "Connection stats logging enabled (interval: {}s)",
            args.stats_interval_secs
        );
    }
    let mut stats_elapsed = std::time::Duration::ZERO;
    let poll = std::time::Duration::from_millis(100);

    info!("Relay running. Press Ctrl+C to shutdown.");
    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(poll).await;
        if args.stats_interval_secs == 0 {
            continue;
        }
        stats_elapsed += poll;
        if stats_elapsed.as_secs() >= args.stats_interval_secs {
            stats_elapsed = std::time::Duration::ZERO;
            info!(clients = server.client_count().await, "Relay stats");
        }
    }

    info!("Shutdown signal received, cleaning up...");
    server.shutdown().await;
    info!("Relay shut down gracefully");
    Ok(())
}

fn init_tracing() {
    // Initialize tracing with EnvFilter for RUST_LOG support
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
