use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use geo::Point;
use serde::{Deserialize, Serialize};

use crate::geo::distance_m;

/// One reported vehicle state, as it appears on the wire and in snapshots.
///
/// A record with `stop_label` set describes the canonical location of a stop
/// rather than a moving vehicle; the seed list is made of such records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRecord {
    pub lat: f64,
    pub lon: f64,
    /// Speed over ground in mph.
    pub speed: f64,
    /// Compass heading in degrees, [0, 360).
    pub heading: f64,
    pub vehicle_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_label: Option<String>,
}

impl PingRecord {
    pub fn point(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

/// Index of a stop in the model's stop arena. Stops are seeded once at
/// construction, so these never dangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StopId(pub(crate) usize);

/// Index of an edge in the model's edge arena. Edges are never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub(crate) usize);

/// Index of a vehicle lane in the history store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VehicleIdx(pub(crate) usize);

/// Identity of one ping: its lane plus a per-lane sequence number that
/// survives retention sweeps. A key resolves to nothing once the ping it
/// named has aged out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PingKey {
    pub vehicle: VehicleIdx,
    pub seq: u64,
}

/// A ping as stored in a vehicle lane: the reported fields plus the
/// classification and memo fields filled in over the ping's lifetime.
///
/// `stop` and `edge` are assigned at most once, during ingestion. The memo
/// fields are write-once per key; failed lookups are never cached so a later,
/// longer history can still resolve them.
#[derive(Debug, Clone)]
pub struct Ping {
    pub lat: f64,
    pub lon: f64,
    pub speed_mph: f64,
    pub heading_deg: f64,
    pub timestamp: DateTime<Utc>,
    pub stop_label: Option<String>,
    pub stop: Option<StopId>,
    pub edge: Option<EdgeId>,
    pub(crate) edge_speed_memo: Option<f64>,
    pub(crate) time_to_stop_memo: HashMap<StopId, Duration>,
}

impl Ping {
    pub fn from_record(record: &PingRecord) -> Self {
        Self {
            lat: record.lat,
            lon: record.lon,
            speed_mph: record.speed,
            heading_deg: record.heading,
            timestamp: record.timestamp,
            stop_label: record.stop_label.clone(),
            stop: None,
            edge: None,
            edge_speed_memo: None,
            time_to_stop_memo: HashMap::new(),
        }
    }

    pub fn point(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }

    pub fn is_at_stop(&self) -> bool {
        self.stop.is_some()
    }
}

/// A seeded stop: canonical location, the pings classified as "at this stop",
/// and the most recently observed dwell time.
#[derive(Debug, Clone)]
pub struct StopNode {
    pub label: String,
    pub lat: f64,
    pub lon: f64,
    pub pings: Vec<PingKey>,
    pub current_dwell: Option<Duration>,
}

impl StopNode {
    fn new(label: String, lat: f64, lon: f64) -> Self {
        Self {
            label,
            lat,
            lon,
            pings: Vec::new(),
            current_dwell: None,
        }
    }

    pub fn point(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

/// A directed stop-to-stop edge discovered from observed traversals, with its
/// travel-time statistics and the pings recorded along it.
#[derive(Debug, Clone)]
pub struct RouteEdge {
    pub from: StopId,
    pub to: StopId,
    avg_secs: f64,
    samples: u32,
    current: Duration,
    pub pings: Vec<PingKey>,
}

impl RouteEdge {
    fn new(from: StopId, to: StopId) -> Self {
        Self {
            from,
            to,
            avg_secs: 0.0,
            samples: 0,
            current: Duration::zero(),
            pings: Vec::new(),
        }
    }

    /// Fold one observed traversal duration into the running mean. Only the
    /// (mean, count) pair is kept; the raw samples are not retained.
    pub fn integrate_travel_time(&mut self, sample: Duration) {
        let sample_secs = sample.num_milliseconds() as f64 / 1_000.0;
        self.avg_secs =
            (self.avg_secs * self.samples as f64 + sample_secs) / (self.samples as f64 + 1.0);
        self.samples += 1;
        self.current = sample;
    }

    pub fn average_travel_time(&self) -> Duration {
        Duration::milliseconds((self.avg_secs * 1_000.0).round() as i64)
    }

    /// The most recently observed traversal duration.
    pub fn current_travel_time(&self) -> Duration {
        self.current
    }

    pub fn sample_count(&self) -> u32 {
        self.samples
    }
}

/// The stop/edge graph. The stop set is fixed after construction; edges are
/// created lazily, at most one per ordered (from, to) pair.
#[derive(Debug, Default)]
pub struct RouteGraph {
    stops: Vec<StopNode>,
    edges: Vec<RouteEdge>,
    edge_ids: HashMap<(StopId, StopId), EdgeId>,
}

impl RouteGraph {
    pub(crate) fn add_stop(&mut self, label: String, lat: f64, lon: f64) -> StopId {
        let id = StopId(self.stops.len());
        self.stops.push(StopNode::new(label, lat, lon));
        id
    }

    pub fn stop(&self, id: StopId) -> &StopNode {
        &self.stops[id.0]
    }

    pub(crate) fn stop_mut(&mut self, id: StopId) -> &mut StopNode {
        &mut self.stops[id.0]
    }

    pub fn stops(&self) -> impl Iterator<Item = (StopId, &StopNode)> {
        self.stops.iter().enumerate().map(|(i, s)| (StopId(i), s))
    }

    pub fn stop_count(&self) -> usize {
        self.stops.len()
    }

    pub fn edge(&self, id: EdgeId) -> &RouteEdge {
        &self.edges[id.0]
    }

    pub(crate) fn edge_mut(&mut self, id: EdgeId) -> &mut RouteEdge {
        &mut self.edges[id.0]
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &RouteEdge)> {
        self.edges.iter().enumerate().map(|(i, e)| (EdgeId(i), e))
    }

    pub fn edge_between(&self, from: StopId, to: StopId) -> Option<EdgeId> {
        self.edge_ids.get(&(from, to)).copied()
    }

    pub(crate) fn fetch_or_create_edge(&mut self, from: StopId, to: StopId) -> EdgeId {
        if let Some(id) = self.edge_between(from, to) {
            return id;
        }
        let id = EdgeId(self.edges.len());
        self.edges.push(RouteEdge::new(from, to));
        self.edge_ids.insert((from, to), id);
        id
    }

    /// Filter every stop's and edge's ping list down to the keys `keep`
    /// accepts. The stops and edges themselves always survive.
    pub(crate) fn retain_pings(&mut self, mut keep: impl FnMut(PingKey) -> bool) {
        for stop in &mut self.stops {
            stop.pings.retain(|&k| keep(k));
        }
        for edge in &mut self.edges {
            edge.pings.retain(|&k| keep(k));
        }
    }

    /// The stop of minimum geodesic distance to `point`, with that distance.
    pub fn nearest_stop(&self, point: Point<f64>) -> Option<(StopId, f64)> {
        self.stops
            .iter()
            .enumerate()
            .map(|(i, stop)| (StopId(i), distance_m(point, stop.point())))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Outcome of an ETA estimate. The variant order gives the comparison used
/// when picking the best estimate across vehicles: an arriving vehicle beats
/// any finite estimate, and any finite estimate beats not knowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Eta {
    /// A vehicle is within the arrival radius of the stop.
    Arriving,
    In(Duration),
    /// Not enough observed history to estimate.
    Unknown,
}

/// One row of the ETA table as served to clients. `eta_seconds` is null for
/// UNKNOWN; `arriving` is the out-of-band ARRIVING marker. No sentinel
/// magnitudes ever appear here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtaTableEntry {
    pub stop_label: String,
    pub eta_seconds: Option<i64>,
    pub arriving: bool,
}

impl EtaTableEntry {
    pub fn new(stop_label: String, eta: Eta) -> Self {
        let (eta_seconds, arriving) = match eta {
            Eta::Arriving => (None, true),
            Eta::In(d) => (Some(d.num_seconds()), false),
            Eta::Unknown => (None, false),
        };
        Self {
            stop_label,
            eta_seconds,
            arriving,
        }
    }
}
