use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::model::{Model, PingRecord};

const FETCH_INTERVAL_MS: u64 = 1_000;
const SAVE_EVERY_CYCLES: u64 = 30;

/// Poll the ping feed and stream every new ping into the model, snapshotting
/// the model to disk periodically.
pub async fn run_fetcher(model: Arc<RwLock<Model>>, feed_url: String, snapshot_path: PathBuf) {
    tracing::info!(url = %feed_url, interval_ms = FETCH_INTERVAL_MS, "starting ping fetcher");
    let client = reqwest::Client::new();

    let mut seen = SeenPings::default();
    let mut cycle: u64 = 0;

    loop {
        match fetch_and_ingest(&client, &feed_url, &model, &mut seen).await {
            Ok(count) => {
                if count > 0 {
                    tracing::debug!(count, "ingested pings");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "fetch error");
            }
        }

        cycle += 1;
        if cycle % SAVE_EVERY_CYCLES == 0 {
            let model = model.read().await;
            match model.save(&snapshot_path) {
                Ok(()) => tracing::info!(pings = model.total_pings(), "saved model snapshot"),
                Err(e) => tracing::warn!(error = %e, "failed to save model snapshot"),
            }
        }

        tokio::time::sleep(Duration::from_millis(FETCH_INTERVAL_MS)).await;
    }
}

/// Last ingested timestamp per vehicle. The feed reports current positions,
/// so consecutive polls usually repeat the previous ping; only strictly newer
/// ones are fed to the model, which also upholds its per-vehicle timestamp
/// ordering precondition.
#[derive(Default)]
struct SeenPings {
    latest: HashMap<String, DateTime<Utc>>,
}

impl SeenPings {
    fn is_new(&mut self, ping: &PingRecord) -> bool {
        match self.latest.get(&ping.vehicle_id) {
            Some(&seen) if ping.timestamp <= seen => false,
            _ => {
                self.latest.insert(ping.vehicle_id.clone(), ping.timestamp);
                true
            }
        }
    }
}

async fn fetch_and_ingest(
    client: &reqwest::Client,
    feed_url: &str,
    model: &RwLock<Model>,
    seen: &mut SeenPings,
) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    let response = client.get(feed_url).send().await?;
    let mut pings: Vec<PingRecord> = response.json().await?;
    pings.sort_by_key(|p| p.timestamp);

    let mut ingested = 0;
    {
        let mut model = model.write().await;
        for ping in &pings {
            if seen.is_new(ping) {
                model.ingest(ping);
                ingested += 1;
            }
        }
    }

    Ok(ingested)
}
