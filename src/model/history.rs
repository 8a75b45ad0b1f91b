use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use super::types::{Ping, PingKey, VehicleIdx};

/// Chronological pings for one vehicle. Pings are fed in non-decreasing
/// timestamp order (an ingestion precondition), so retention always pops from
/// the front. Sequence numbers are assigned at ingest and never reused:
/// `base_seq` counts the pings that have aged off, keeping every `PingKey`
/// handed out earlier either valid or harmlessly dangling.
#[derive(Debug)]
pub struct VehicleLane {
    serial: String,
    pings: VecDeque<Ping>,
    base_seq: u64,
}

impl VehicleLane {
    fn new(serial: String) -> Self {
        Self {
            serial,
            pings: VecDeque::new(),
            base_seq: 0,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn push(&mut self, ping: Ping) -> u64 {
        self.pings.push_back(ping);
        self.base_seq + self.pings.len() as u64 - 1
    }

    pub fn get(&self, seq: u64) -> Option<&Ping> {
        let idx = seq.checked_sub(self.base_seq)?;
        self.pings.get(idx as usize)
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut Ping> {
        let idx = seq.checked_sub(self.base_seq)?;
        self.pings.get_mut(idx as usize)
    }

    pub fn len(&self) -> usize {
        self.pings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pings.is_empty()
    }

    pub fn first_seq(&self) -> u64 {
        self.base_seq
    }

    pub fn latest_seq(&self) -> Option<u64> {
        if self.pings.is_empty() {
            None
        } else {
            Some(self.base_seq + self.pings.len() as u64 - 1)
        }
    }

    /// How many pings precede `seq` in the retained lane.
    pub fn preceding_count(&self, seq: u64) -> u64 {
        seq.saturating_sub(self.base_seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Ping)> {
        let base = self.base_seq;
        self.pings
            .iter()
            .enumerate()
            .map(move |(i, p)| (base + i as u64, p))
    }

    /// Pings from `seq` (inclusive) to the end of the lane.
    pub fn iter_from(&self, seq: u64) -> impl Iterator<Item = (u64, &Ping)> {
        let skip = seq.saturating_sub(self.base_seq) as usize;
        let base = self.base_seq;
        self.pings
            .iter()
            .enumerate()
            .skip(skip)
            .map(move |(i, p)| (base + i as u64, p))
    }

    /// Pings from `seq` (inclusive) back to the start of the lane.
    pub fn iter_back_from(&self, seq: u64) -> impl Iterator<Item = (u64, &Ping)> + '_ {
        let end = seq
            .checked_sub(self.base_seq)
            .map(|idx| (idx as usize + 1).min(self.pings.len()))
            .unwrap_or(0);
        let base = self.base_seq;
        self.pings
            .range(..end)
            .enumerate()
            .rev()
            .map(move |(i, p)| (base + i as u64, p))
    }

    /// Drop lane-front pings older than `cutoff`, returning how many went.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while self
            .pings
            .front()
            .map(|p| p.timestamp < cutoff)
            .unwrap_or(false)
        {
            self.pings.pop_front();
            self.base_seq += 1;
            removed += 1;
        }
        removed
    }
}

/// All per-vehicle lanes plus the most-recent-ping cache the query surface
/// reads from.
#[derive(Debug, Default)]
pub struct HistoryStore {
    lanes: Vec<VehicleLane>,
    by_serial: HashMap<String, VehicleIdx>,
    recent: HashMap<VehicleIdx, PingKey>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lane_or_create(&mut self, serial: &str) -> VehicleIdx {
        if let Some(&idx) = self.by_serial.get(serial) {
            return idx;
        }
        let idx = VehicleIdx(self.lanes.len());
        self.lanes.push(VehicleLane::new(serial.to_string()));
        self.by_serial.insert(serial.to_string(), idx);
        idx
    }

    pub fn lane(&self, idx: VehicleIdx) -> &VehicleLane {
        &self.lanes[idx.0]
    }

    pub fn lane_mut(&mut self, idx: VehicleIdx) -> &mut VehicleLane {
        &mut self.lanes[idx.0]
    }

    pub fn lanes(&self) -> impl Iterator<Item = (VehicleIdx, &VehicleLane)> {
        self.lanes
            .iter()
            .enumerate()
            .map(|(i, l)| (VehicleIdx(i), l))
    }

    pub fn lanes_mut(&mut self) -> impl Iterator<Item = &mut VehicleLane> {
        self.lanes.iter_mut()
    }

    pub fn get(&self, key: PingKey) -> Option<&Ping> {
        self.lanes.get(key.vehicle.0)?.get(key.seq)
    }

    pub fn get_mut(&mut self, key: PingKey) -> Option<&mut Ping> {
        self.lanes.get_mut(key.vehicle.0)?.get_mut(key.seq)
    }

    pub fn contains(&self, key: PingKey) -> bool {
        self.get(key).is_some()
    }

    pub fn total_pings(&self) -> usize {
        self.lanes.iter().map(|l| l.len()).sum()
    }

    pub fn record_recent(&mut self, key: PingKey) {
        self.recent.insert(key.vehicle, key);
    }

    /// Drop recent-cache entries whose ping is older than `cutoff` or has
    /// aged out of its lane entirely.
    pub fn prune_recent(&mut self, cutoff: DateTime<Utc>) {
        let lanes = &self.lanes;
        self.recent.retain(|_, key| {
            lanes
                .get(key.vehicle.0)
                .and_then(|lane| lane.get(key.seq))
                .map(|p| p.timestamp >= cutoff)
                .unwrap_or(false)
        });
    }

    /// Snapshot of the recent-position keys, detached from the store so the
    /// caller can keep mutating memo state while iterating.
    pub fn recent_keys(&self) -> Vec<PingKey> {
        let mut keys: Vec<PingKey> = self.recent.values().copied().collect();
        keys.sort_by_key(|k| k.vehicle.0);
        keys
    }
}
