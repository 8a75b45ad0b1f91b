use chrono::{DateTime, Utc};

use super::history::HistoryStore;
use super::types::{Ping, PingKey, PingRecord, RouteGraph, StopId, VehicleIdx};
use super::STOP_RADIUS_METERS;

/// Classify one ping against the stop set and fold it into the graph.
///
/// The ping lands in its vehicle's lane and the recent-position cache first,
/// then gets labeled if a stop is within range. A label flip relative to the
/// previous ping of the same vehicle is a transition: unlabeled-to-labeled is
/// an arrival (which may create or update an edge), labeled-to-unlabeled is a
/// departure (which updates the stop's dwell time).
pub(crate) fn integrate(history: &mut HistoryStore, graph: &mut RouteGraph, record: &PingRecord) {
    let vehicle = history.lane_or_create(&record.vehicle_id);
    let ping = Ping::from_record(record);
    let point = ping.point();
    let timestamp = ping.timestamp;

    let seq = history.lane_mut(vehicle).push(ping);
    let key = PingKey { vehicle, seq };
    history.record_recent(key);

    let prev_at_stop = seq
        .checked_sub(1)
        .and_then(|s| history.lane(vehicle).get(s))
        .map(|p| p.is_at_stop())
        .unwrap_or(false);

    let nearest = graph.nearest_stop(point);
    match nearest {
        Some((stop_id, dist)) if dist < STOP_RADIUS_METERS => {
            let label = graph.stop(stop_id).label.clone();
            graph.stop_mut(stop_id).pings.push(key);
            if let Some(ping) = history.get_mut(key) {
                ping.stop = Some(stop_id);
                ping.stop_label = Some(label);
            }

            if !prev_at_stop {
                on_arrival(history, graph, vehicle, seq, stop_id, timestamp);
            }
        }
        _ => {
            if prev_at_stop {
                on_departure(history, graph, vehicle, seq);
            }
        }
    }
}

/// The vehicle just arrived at `stop_id`. If it was seen at a stop earlier,
/// the stretch in between is a traversal of the edge between the two stops:
/// integrate the elapsed time into the edge statistics and assign the edge to
/// every unlabeled ping recorded along the way.
fn on_arrival(
    history: &mut HistoryStore,
    graph: &mut RouteGraph,
    vehicle: VehicleIdx,
    seq: u64,
    stop_id: StopId,
    arrived_at: DateTime<Utc>,
) {
    let Some(prev) = seq.checked_sub(1) else {
        return;
    };

    let last_stop = history
        .lane(vehicle)
        .iter_back_from(prev)
        .find_map(|(_, p)| p.stop.map(|from| (from, p.timestamp)));
    let Some((from_stop, departed_at)) = last_stop else {
        // first stop visit ever seen for this vehicle, nothing to connect
        return;
    };

    // an edge back to the same stop is a leave-and-return loop
    let edge_id = graph.fetch_or_create_edge(from_stop, stop_id);
    graph
        .edge_mut(edge_id)
        .integrate_travel_time(arrived_at - departed_at);

    let mut traversal = Vec::new();
    for (s, p) in history.lane(vehicle).iter_back_from(prev) {
        if p.is_at_stop() {
            break;
        }
        traversal.push(PingKey { vehicle, seq: s });
    }
    for &k in &traversal {
        if let Some(p) = history.get_mut(k) {
            p.edge = Some(edge_id);
        }
    }
    graph.edge_mut(edge_id).pings.extend(traversal);
}

/// The vehicle just left a stop. The contiguous run of labeled pings ending
/// at the previous ping spans the visit; its bounds give the dwell time. If
/// tracking started inside the stop the arrival was never observed and the
/// dwell is left alone.
fn on_departure(history: &mut HistoryStore, graph: &mut RouteGraph, vehicle: VehicleIdx, seq: u64) {
    let Some(prev) = seq.checked_sub(1) else {
        return;
    };
    let lane = history.lane(vehicle);
    let Some(exit) = lane.get(prev) else {
        return;
    };
    let Some(exit_stop) = exit.stop else {
        return;
    };
    let exit_time = exit.timestamp;

    let mut arrival_time = None;
    let mut run_start = exit_time;
    for (_, p) in lane.iter_back_from(prev) {
        if p.is_at_stop() {
            run_start = p.timestamp;
        } else {
            arrival_time = Some(run_start);
            break;
        }
    }
    let Some(arrived_at) = arrival_time else {
        return;
    };

    graph.stop_mut(exit_stop).current_dwell = Some(exit_time - arrived_at);
}
