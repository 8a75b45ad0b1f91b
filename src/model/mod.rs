mod estimate;
mod history;
mod ingest;
mod persist;
mod retention;
mod types;

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use history::HistoryStore;
pub use persist::ModelSnapshot;
pub use types::{Eta, EtaTableEntry, PingRecord, RouteGraph, StopId};

/// A ping within this distance of a stop is classified as being at it, and a
/// vehicle within it is reported as arriving.
pub(crate) const STOP_RADIUS_METERS: f64 = 60.0;

/// Retention sweeps only run once the model holds this many pings...
const SWEEP_TOTAL_THRESHOLD: u64 = 150_000;
/// ...and at least this many have arrived since the previous sweep.
const SWEEP_CYCLE_THRESHOLD: u64 = 5_000;
const RETENTION_DAYS: i64 = 5;

/// A vehicle drops out of the recent-position cache once its latest ping is
/// older than this.
const RECENT_POSITION_TTL_SECS: i64 = 3 * 60;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("cannot set the current time without enabling simulation mode at construction")]
    ClockNotSimulated,
    #[error("failed to read or write snapshot: {0}")]
    SnapshotIo(#[from] std::io::Error),
    #[error("malformed snapshot: {0}")]
    SnapshotFormat(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
enum Clock {
    Wall,
    Simulated(DateTime<Utc>),
}

/// The online ETA model: seeded stops, the lazily discovered edge graph, and
/// every vehicle's ping history. One instance per fleet; all mutation goes
/// through `ingest`, all reads through the query surface below.
///
/// Queries take `&mut self` because estimation fills memo caches as it reads.
#[derive(Debug)]
pub struct Model {
    graph: RouteGraph,
    history: HistoryStore,
    clock: Clock,
    total_pings: u64,
    sweep_cycle: u64,
}

impl Model {
    /// Build a model from the seed stop list. Records without a `stop_label`
    /// cannot name a stop and are skipped. The stop set is fixed from here on.
    ///
    /// With `simulation_mode` the model runs on a virtual clock that the
    /// caller advances via [`Model::set_time`]; otherwise it reads wall time.
    pub fn new(stops: &[PingRecord], simulation_mode: bool) -> Self {
        let mut graph = RouteGraph::default();
        for record in stops {
            match &record.stop_label {
                Some(label) => {
                    graph.add_stop(label.clone(), record.lat, record.lon);
                }
                None => {
                    tracing::warn!(
                        lat = record.lat,
                        lon = record.lon,
                        "skipping unlabeled seed stop"
                    );
                }
            }
        }

        Self {
            graph,
            history: HistoryStore::new(),
            clock: if simulation_mode {
                Clock::Simulated(Utc::now())
            } else {
                Clock::Wall
            },
            total_pings: 0,
            sweep_cycle: 0,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self.clock {
            Clock::Wall => Utc::now(),
            Clock::Simulated(t) => t,
        }
    }

    pub fn is_simulation(&self) -> bool {
        matches!(self.clock, Clock::Simulated(_))
    }

    /// Advance the virtual clock. Fails unless the model was constructed in
    /// simulation mode.
    pub fn set_time(&mut self, time: DateTime<Utc>) -> Result<(), ModelError> {
        match &mut self.clock {
            Clock::Simulated(current) => {
                *current = time;
                Ok(())
            }
            Clock::Wall => Err(ModelError::ClockNotSimulated),
        }
    }

    /// Feed one ping into the model: classify it against the stop set, detect
    /// arrival/departure transitions, and grow the edge graph. May run a
    /// retention sweep first when both thresholds have been crossed.
    pub fn ingest(&mut self, record: &PingRecord) {
        self.total_pings += 1;
        self.sweep_cycle += 1;

        if self.total_pings > SWEEP_TOTAL_THRESHOLD && self.sweep_cycle > SWEEP_CYCLE_THRESHOLD {
            let expiration = self.now() - Duration::days(RETENTION_DAYS);
            let removed = retention::sweep(&mut self.history, &mut self.graph, expiration);
            self.total_pings -= removed;
            self.sweep_cycle = 0;
            tracing::info!(removed, retained = self.total_pings, "retention sweep");
        }

        ingest::integrate(&mut self.history, &mut self.graph, record);
    }

    /// One entry per seeded stop, in seed order: the best estimate across all
    /// vehicles currently in the recent-position cache.
    pub fn eta_table(&mut self) -> Vec<EtaTableEntry> {
        self.prune_recent_positions();
        let now = self.now();
        let recent = self.history.recent_keys();

        let mut table = Vec::with_capacity(self.graph.stop_count());
        for i in 0..self.graph.stop_count() {
            let stop_id = StopId(i);
            let mut best = Eta::Unknown;
            for &key in &recent {
                let eta = estimate::estimate(&mut self.history, &self.graph, now, stop_id, key);
                best = best.min(eta);
            }
            table.push(EtaTableEntry::new(
                self.graph.stop(stop_id).label.clone(),
                best,
            ));
        }
        table
    }

    /// Most recent ping per vehicle, limited to vehicles heard from within
    /// the last three minutes.
    pub fn recent_positions(&mut self) -> HashMap<String, PingRecord> {
        self.prune_recent_positions();
        let mut positions = HashMap::new();
        for key in self.history.recent_keys() {
            if let Some(ping) = self.history.get(key) {
                let serial = self.history.lane(key.vehicle).serial();
                positions.insert(serial.to_string(), ping_to_record(serial, ping));
            }
        }
        positions
    }

    fn prune_recent_positions(&mut self) {
        let cutoff = self.now() - Duration::seconds(RECENT_POSITION_TTL_SECS);
        self.history.prune_recent(cutoff);
    }

    pub fn graph(&self) -> &RouteGraph {
        &self.graph
    }

    pub fn total_pings(&self) -> u64 {
        self.total_pings
    }

    pub(crate) fn history(&self) -> &HistoryStore {
        &self.history
    }
}

fn ping_to_record(serial: &str, ping: &types::Ping) -> PingRecord {
    PingRecord {
        lat: ping.lat,
        lon: ping.lon,
        speed: ping.speed_mph,
        heading: ping.heading_deg,
        vehicle_id: serial.to_string(),
        timestamp: ping.timestamp,
        stop_label: ping.stop_label.clone(),
    }
}
