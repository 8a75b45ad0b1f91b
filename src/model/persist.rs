use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use super::types::PingRecord;
use super::{ping_to_record, Model, ModelError};

/// The persisted form of a model: the seed stops plus the raw ping stream.
/// Derived state (labels, edges, statistics, memo caches) is rebuilt by
/// replaying the stream, never stored.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSnapshot {
    pub stops: Vec<PingRecord>,
    pub data: Vec<PingRecord>,
}

impl Model {
    /// Capture the seeds and every retained ping, ordered by timestamp.
    pub fn snapshot(&self) -> ModelSnapshot {
        let stops = self
            .graph
            .stops()
            .map(|(_, stop)| PingRecord {
                lat: stop.lat,
                lon: stop.lon,
                speed: 0.0,
                heading: 0.0,
                vehicle_id: String::new(),
                timestamp: DateTime::UNIX_EPOCH,
                stop_label: Some(stop.label.clone()),
            })
            .collect();

        let mut data: Vec<PingRecord> = self
            .history
            .lanes()
            .flat_map(|(_, lane)| {
                lane.iter()
                    .map(|(_, ping)| ping_to_record(lane.serial(), ping))
            })
            .collect();
        // stable sort keeps each lane's internal order for equal timestamps
        data.sort_by_key(|r| r.timestamp);

        ModelSnapshot { stops, data }
    }

    /// Rebuild a model by replaying a snapshot's ping stream through `ingest`.
    ///
    /// In simulation mode the virtual clock tracks each replayed ping's
    /// timestamp, so a retention sweep during replay sees the historical
    /// clock instead of eating data it has not replayed yet.
    pub fn from_snapshot(snapshot: &ModelSnapshot, simulation_mode: bool) -> Self {
        let mut model = Model::new(&snapshot.stops, simulation_mode);
        for record in &snapshot.data {
            if simulation_mode {
                // cannot fail: the model was just built in simulation mode
                let _ = model.set_time(record.timestamp);
            }
            model.ingest(record);
        }
        model
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, &self.snapshot())?;
        Ok(())
    }

    /// Load and replay a saved snapshot. A schema mismatch fails the whole
    /// load; no partial model is returned.
    pub fn load(path: impl AsRef<Path>, simulation_mode: bool) -> Result<Self, ModelError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let snapshot: ModelSnapshot = serde_json::from_reader(reader)?;
        Ok(Model::from_snapshot(&snapshot, simulation_mode))
    }
}
