use std::path::Path;

use chrono::DateTime;

use crate::model::PingRecord;

/// Load the seed stop list from a CSV file with `label,lat,lon` rows. The
/// result feeds `Model::new`; rows without a label cannot name a stop and are
/// dropped here.
pub fn load_stops(
    path: impl AsRef<Path>,
) -> Result<Vec<PingRecord>, Box<dyn std::error::Error + Send + Sync>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut stops = Vec::new();

    for result in reader.records() {
        let record = result?;
        let label = record.get(0).unwrap_or("").to_string();
        let lat: f64 = record.get(1).unwrap_or("0").parse().unwrap_or(0.0);
        let lon: f64 = record.get(2).unwrap_or("0").parse().unwrap_or(0.0);

        if label.is_empty() {
            tracing::warn!("skipping stops row without a label");
            continue;
        }

        stops.push(PingRecord {
            lat,
            lon,
            speed: 0.0,
            heading: 0.0,
            vehicle_id: String::new(),
            timestamp: DateTime::UNIX_EPOCH,
            stop_label: Some(label),
        });
    }

    Ok(stops)
}
