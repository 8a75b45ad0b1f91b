mod api;
mod feed;
mod geo;
mod model;
mod seed;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::RwLock;

use model::Model;

#[derive(Parser)]
#[command(name = "fleet-eta")]
#[command(about = "Self-learning arrival-time prediction for GPS-tracked fleets")]
struct Args {
    /// Port to run the HTTP server on
    #[arg(short, long, env = "SERVER_PORT", default_value = "8080")]
    port: u16,

    /// CSV file of seed stops (label,lat,lon)
    #[arg(long, env = "STOPS_FILE", default_value = "stops.csv")]
    stops: PathBuf,

    /// URL returning a JSON array of ping records, polled continuously
    #[arg(long, env = "FEED_URL")]
    feed_url: Option<String>,

    /// Model snapshot restored on startup and saved while running
    #[arg(long, env = "SNAPSHOT_FILE", default_value = "model-snapshot.json")]
    snapshot: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    tracing::info!("starting fleet-eta service");

    let model = if args.snapshot.exists() {
        match Model::load(&args.snapshot, false) {
            Ok(model) => {
                tracing::info!(
                    stops = model.graph().stop_count(),
                    pings = model.total_pings(),
                    "restored model from snapshot"
                );
                model
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load model snapshot");
                return;
            }
        }
    } else {
        let stops = match seed::load_stops(&args.stops) {
            Ok(stops) => stops,
            Err(e) => {
                tracing::error!(error = %e, "failed to load seed stops");
                return;
            }
        };
        tracing::info!(stops = stops.len(), "seeded a fresh model");
        Model::new(&stops, false)
    };

    let model = Arc::new(RwLock::new(model));

    let api_model = model.clone();
    let port = args.port;
    let api_handle = tokio::spawn(async move {
        api::server::run_server(api_model, port).await;
    });

    match args.feed_url {
        Some(feed_url) => {
            let fetcher_model = model.clone();
            let snapshot = args.snapshot.clone();
            let fetcher_handle = tokio::spawn(async move {
                feed::run_fetcher(fetcher_model, feed_url, snapshot).await;
            });

            tokio::select! {
                _ = fetcher_handle => tracing::error!("fetcher task exited"),
                _ = api_handle => tracing::error!("API server exited"),
            }
        }
        None => {
            tracing::warn!("no feed URL configured, serving queries only");
            let _ = api_handle.await;
        }
    }
}
