use std::cmp::Reverse;

use chrono::{DateTime, Duration, Utc};
use geo::Point;

use crate::geo::{distance_m, heading_difference_deg};

use super::history::HistoryStore;
use super::types::{EdgeId, Eta, PingKey, RouteGraph, StopId};
use super::STOP_RADIUS_METERS;

/// Examples must predate the query by this much; anything fresher is the
/// vehicle's current run, not history.
const EXAMPLE_MIN_AGE_MINS: i64 = 5;
/// Search radii tried in order until a tier yields enough matches.
const EXAMPLE_RADIUS_TIERS_M: [f64; 3] = [20.0, 50.0, 100.0];
const EXAMPLE_HEADING_TOLERANCE_DEG: f64 = 90.0;
const MIN_EXAMPLES_PER_TIER: usize = 2;

/// When averaging, only the most recent resolvable examples count.
const RECENT_EXAMPLE_LIMIT: usize = 4;
/// A single example this fresh outweighs the average of older ones.
const FRESH_EXAMPLE_WINDOW_HOURS: i64 = 2;

/// The fleet-wide speed baseline draws on pings at least this much older
/// than the query position.
const BASELINE_MIN_AGE_MINS: i64 = 15;
const BASELINE_RADIUS_M: f64 = 100.0;
const BASELINE_HEADING_TOLERANCE_DEG: f64 = 90.0;
const WIDE_BASELINE_RADIUS_M: f64 = 150.0;
const WIDE_BASELINE_HEADING_TOLERANCE_DEG: f64 = 135.0;
/// Local and baseline speed must differ by more than this before the guess
/// is rescaled.
const SPEED_DELTA_THRESHOLD_MPH: f64 = 5.0;

/// Fewer preceding pings than this cannot gauge traffic on an edge.
const MIN_PINGS_FOR_EDGE_SPEED: u64 = 20;
/// Pings at or below this speed are idling at lights or pulling away; they
/// would drag the edge average toward zero.
const IDLE_SPEED_FLOOR_MPH: f64 = 3.0;

/// The query position: a detached copy of the vehicle's latest ping, so the
/// history store stays free for memo writes while estimating.
struct QueryPosition {
    key: PingKey,
    point: Point<f64>,
    heading: f64,
    timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, PartialEq)]
enum Scope {
    Own,
    Fleet,
}

/// Estimate how long until the vehicle at `position` reaches `stop_id`.
///
/// Layered: within the arrival radius short-circuits to `Arriving`; otherwise
/// comparable historical positions are searched (own history first, the whole
/// fleet as fallback), resolved to observed travel times toward the stop, and
/// blended. The ambiguous multi-edge case is answered conservatively by the
/// longest candidate; the single-edge case is corrected for how current speed
/// compares to the historical baseline.
pub(crate) fn estimate(
    history: &mut HistoryStore,
    graph: &RouteGraph,
    now: DateTime<Utc>,
    stop_id: StopId,
    position: PingKey,
) -> Eta {
    let Some(ping) = history.get(position) else {
        return Eta::Unknown;
    };
    let pos = QueryPosition {
        key: position,
        point: ping.point(),
        heading: ping.heading_deg,
        timestamp: ping.timestamp,
    };

    if distance_m(graph.stop(stop_id).point(), pos.point) < STOP_RADIUS_METERS {
        return Eta::Arriving;
    }

    let example_cutoff = now - Duration::minutes(EXAMPLE_MIN_AGE_MINS);
    let mut examples = tiered_examples(history, example_cutoff, &pos, Scope::Own);
    if examples.is_empty() {
        examples = tiered_examples(history, example_cutoff, &pos, Scope::Fleet);
    }
    if examples.is_empty() {
        return Eta::Unknown;
    }

    let mut edges: Vec<EdgeId> = Vec::new();
    for &key in &examples {
        if let Some(edge) = history.get(key).and_then(|p| p.edge) {
            if !edges.contains(&edge) {
                edges.push(edge);
            }
        }
    }

    match edges.len() {
        0 => Eta::Unknown,
        1 => single_edge_estimate(history, now, &pos, stop_id, &examples),
        _ => forked_estimate(history, stop_id, &examples, &edges),
    }
}

/// Radius-tiered similarity search. Each tier is tried in order; the first
/// with enough matches wins, and the widest tier's result is used as-is even
/// when it stays under the minimum.
fn tiered_examples(
    history: &HistoryStore,
    cutoff: DateTime<Utc>,
    pos: &QueryPosition,
    scope: Scope,
) -> Vec<PingKey> {
    let mut found = Vec::new();
    for radius in EXAMPLE_RADIUS_TIERS_M {
        found = collect_examples(
            history,
            cutoff,
            pos,
            scope,
            radius,
            EXAMPLE_HEADING_TOLERANCE_DEG,
        );
        if found.len() >= MIN_EXAMPLES_PER_TIER {
            break;
        }
    }
    found
}

/// Unlabeled pings older than `cutoff` travelling the same way within
/// `radius` of the query position.
fn collect_examples(
    history: &HistoryStore,
    cutoff: DateTime<Utc>,
    pos: &QueryPosition,
    scope: Scope,
    radius: f64,
    heading_tolerance: f64,
) -> Vec<PingKey> {
    let mut out = Vec::new();
    for (vehicle, lane) in history.lanes() {
        if scope == Scope::Own && vehicle != pos.key.vehicle {
            continue;
        }
        for (seq, p) in lane.iter() {
            if p.timestamp >= cutoff || p.is_at_stop() {
                continue;
            }
            if heading_difference_deg(p.heading_deg, pos.heading) >= heading_tolerance {
                continue;
            }
            if distance_m(p.point(), pos.point) < radius {
                out.push(PingKey { vehicle, seq });
            }
        }
    }
    out
}

/// Examples span several edges: vehicles have been observed heading to
/// different places from here. Resolve the most recent example per edge and
/// answer with the longest: overestimating a wait beats underestimating it.
fn forked_estimate(
    history: &mut HistoryStore,
    stop_id: StopId,
    examples: &[PingKey],
    edges: &[EdgeId],
) -> Eta {
    let mut longest: Option<Duration> = None;
    for &edge in edges {
        let mut on_edge: Vec<(DateTime<Utc>, PingKey)> = examples
            .iter()
            .filter_map(|&k| {
                let p = history.get(k)?;
                (p.edge == Some(edge)).then_some((p.timestamp, k))
            })
            .collect();
        on_edge.sort_by_key(|&(t, _)| Reverse(t));

        for (_, key) in on_edge {
            if let Some(d) = historical_time_to_stop(history, key, stop_id) {
                longest = Some(longest.map_or(d, |cur| cur.max(d)));
                break;
            }
        }
    }
    longest.map(Eta::In).unwrap_or(Eta::Unknown)
}

/// All examples agree on one edge. Base the guess on the freshest resolvable
/// example (or the mean of the last few), then correct it for how the
/// vehicle's current pace compares to the historical baseline here.
fn single_edge_estimate(
    history: &mut HistoryStore,
    now: DateTime<Utc>,
    pos: &QueryPosition,
    stop_id: StopId,
    examples: &[PingKey],
) -> Eta {
    let mut ordered: Vec<(DateTime<Utc>, PingKey)> = examples
        .iter()
        .filter_map(|&k| history.get(k).map(|p| (p.timestamp, k)))
        .collect();
    ordered.sort_by_key(|&(t, _)| Reverse(t));

    let mut resolved: Vec<(DateTime<Utc>, Duration)> = Vec::new();
    for (t, key) in ordered {
        if resolved.len() == RECENT_EXAMPLE_LIMIT {
            break;
        }
        if let Some(d) = historical_time_to_stop(history, key, stop_id) {
            resolved.push((t, d));
        }
    }
    let Some(&(newest_time, newest_duration)) = resolved.first() else {
        return Eta::Unknown;
    };

    let guess = if newest_time > now - Duration::hours(FRESH_EXAMPLE_WINDOW_HOURS) {
        newest_duration
    } else {
        mean_duration(resolved.iter().map(|&(_, d)| d))
    };

    Eta::In(speed_corrected(history, pos, guess))
}

/// Scale the guess when the vehicle is running meaningfully faster or slower
/// than the fleet historically does at this spot. Skipped when either side of
/// the comparison cannot be computed.
fn speed_corrected(history: &mut HistoryStore, pos: &QueryPosition, guess: Duration) -> Duration {
    let Some(local) = average_speed_on_edge(history, pos.key) else {
        return guess;
    };

    let cutoff = pos.timestamp - Duration::minutes(BASELINE_MIN_AGE_MINS);
    let mut baseline_keys = collect_examples(
        history,
        cutoff,
        pos,
        Scope::Fleet,
        BASELINE_RADIUS_M,
        BASELINE_HEADING_TOLERANCE_DEG,
    );
    if baseline_keys.is_empty() {
        baseline_keys = collect_examples(
            history,
            cutoff,
            pos,
            Scope::Fleet,
            WIDE_BASELINE_RADIUS_M,
            WIDE_BASELINE_HEADING_TOLERANCE_DEG,
        );
    }

    let speeds: Vec<f64> = baseline_keys
        .into_iter()
        .filter_map(|k| average_speed_on_edge(history, k))
        .collect();
    if speeds.is_empty() {
        return guess;
    }
    let baseline = speeds.iter().sum::<f64>() / speeds.len() as f64;

    if (local - baseline).abs() > SPEED_DELTA_THRESHOLD_MPH {
        scale_duration(guess, baseline / local)
    } else {
        guess
    }
}

/// How long it took this example's vehicle to reach the stop, observed by
/// scanning its lane forward. Successes are memoized on the example ping;
/// misses are not, since later ingestion can extend the lane and resolve them.
fn historical_time_to_stop(
    history: &mut HistoryStore,
    example: PingKey,
    stop_id: StopId,
) -> Option<Duration> {
    let example_time = {
        let p = history.get(example)?;
        if let Some(&d) = p.time_to_stop_memo.get(&stop_id) {
            return Some(d);
        }
        p.timestamp
    };

    let elapsed = history
        .lane(example.vehicle)
        .iter_from(example.seq)
        .find(|(_, p)| p.stop == Some(stop_id))
        .map(|(_, p)| p.timestamp - example_time)?;

    if let Some(p) = history.get_mut(example) {
        p.time_to_stop_memo.insert(stop_id, elapsed);
    }
    Some(elapsed)
}

/// Mean speed of the ping's current edge traversal: lane pings walked
/// backward from it (inclusive) to the last stop visit, idle samples
/// excluded. Unset when the lane is too short to judge or nothing qualifies;
/// only computed means are memoized.
fn average_speed_on_edge(history: &mut HistoryStore, key: PingKey) -> Option<f64> {
    {
        let p = history.get(key)?;
        if let Some(avg) = p.edge_speed_memo {
            return Some(avg);
        }
    }

    let lane = history.lane(key.vehicle);
    if lane.preceding_count(key.seq) < MIN_PINGS_FOR_EDGE_SPEED {
        return None;
    }

    let mut sum = 0.0;
    let mut count = 0u32;
    for (_, p) in lane.iter_back_from(key.seq) {
        if p.is_at_stop() {
            break;
        }
        if p.speed_mph > IDLE_SPEED_FLOOR_MPH {
            sum += p.speed_mph;
            count += 1;
        }
    }
    if count == 0 {
        return None;
    }

    let mean = sum / count as f64;
    if let Some(p) = history.get_mut(key) {
        p.edge_speed_memo = Some(mean);
    }
    Some(mean)
}

fn mean_duration(durations: impl Iterator<Item = Duration>) -> Duration {
    let mut total_ms: i64 = 0;
    let mut count: i64 = 0;
    for d in durations {
        total_ms += d.num_milliseconds();
        count += 1;
    }
    if count == 0 {
        return Duration::zero();
    }
    Duration::milliseconds(total_ms / count)
}

fn scale_duration(d: Duration, factor: f64) -> Duration {
    Duration::milliseconds((d.num_milliseconds() as f64 * factor).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{Model, PingRecord, StopId};
    use super::*;

    const STOP_A: (f64, f64) = (33.650, -117.740);
    const STOP_B: (f64, f64) = (33.650, -117.730);
    const STOP_C: (f64, f64) = (33.656, -117.735);
    /// Mid-point of the A->B stretch, well clear of both stop radii.
    const MID: (f64, f64) = (33.650, -117.735);

    fn ping_with_speed(
        vehicle: &str,
        lat: f64,
        lon: f64,
        heading: f64,
        speed: f64,
        time: chrono::DateTime<Utc>,
    ) -> PingRecord {
        PingRecord {
            lat,
            lon,
            speed,
            heading,
            vehicle_id: vehicle.to_string(),
            timestamp: time,
            stop_label: None,
        }
    }

    fn stop_id(model: &Model, label: &str) -> StopId {
        model
            .graph
            .stops()
            .find(|(_, s)| s.label == label)
            .map(|(id, _)| id)
            .unwrap()
    }

    fn latest_key(model: &Model, serial: &str) -> PingKey {
        model
            .history
            .recent_keys()
            .into_iter()
            .find(|k| model.history.lane(k.vehicle).serial() == serial)
            .unwrap()
    }

    fn abc_model() -> Model {
        sim_model(
            &[
                stop_seed("A", STOP_A.0, STOP_A.1),
                stop_seed("B", STOP_B.0, STOP_B.1),
                stop_seed("C", STOP_C.0, STOP_C.1),
            ],
            at(0),
        )
    }

    /// Drive `vehicle` from `from` through MID to stop B, with the MID ping at
    /// `mid_time` and arrival at `arrive_time`.
    fn journey_via_mid(
        model: &mut Model,
        vehicle: &str,
        from: (f64, f64),
        depart_time: i64,
        mid_time: i64,
        arrive_time: i64,
    ) {
        ingest_at(model, &moving_ping(vehicle, from.0, from.1, 90.0, at(depart_time)));
        ingest_at(model, &moving_ping(vehicle, MID.0, MID.1, 90.0, at(mid_time)));
        ingest_at(model, &moving_ping(vehicle, STOP_B.0, STOP_B.1, 90.0, at(arrive_time)));
    }

    #[test]
    fn ambiguous_fork_returns_the_longest_candidate() {
        let mut model = abc_model();
        // same vehicle has headed to B from here along two different edges:
        // A->B taking 60 s from MID, C->B taking 120 s from MID
        journey_via_mid(&mut model, "bus-1", STOP_A, 0, 100, 160);
        journey_via_mid(&mut model, "bus-1", STOP_C, 1_000, 1_100, 1_220);

        model.set_time(at(9_990)).unwrap();
        model.ingest(&moving_ping("bus-1", MID.0, MID.1, 90.0, at(9_990)));
        model.set_time(at(10_000)).unwrap();

        let b = stop_id(&model, "B");
        let key = latest_key(&model, "bus-1");
        let eta = estimate(&mut model.history, &model.graph, at(10_000), b, key);
        assert_eq!(eta, Eta::In(Duration::seconds(120)));
    }

    #[test]
    fn fresh_single_edge_example_wins_over_the_mean() {
        let mut model = abc_model();
        journey_via_mid(&mut model, "bus-1", STOP_A, 0, 100, 160); // 60 s to B
        journey_via_mid(&mut model, "bus-1", STOP_A, 3_500, 3_600, 3_690); // 90 s to B

        model.set_time(at(6_990)).unwrap();
        model.ingest(&moving_ping("bus-1", MID.0, MID.1, 90.0, at(6_990)));
        model.set_time(at(7_000)).unwrap();

        let b = stop_id(&model, "B");
        let key = latest_key(&model, "bus-1");
        // the 3600 s example is within the 2 h freshness window: use it alone
        let eta = estimate(&mut model.history, &model.graph, at(7_000), b, key);
        assert_eq!(eta, Eta::In(Duration::seconds(90)));
    }

    #[test]
    fn stale_single_edge_examples_average_out() {
        let mut model = abc_model();
        journey_via_mid(&mut model, "bus-1", STOP_A, 0, 100, 160); // 60 s
        journey_via_mid(&mut model, "bus-1", STOP_A, 3_500, 3_600, 3_690); // 90 s

        model.set_time(at(10_990)).unwrap();
        model.ingest(&moving_ping("bus-1", MID.0, MID.1, 90.0, at(10_990)));
        model.set_time(at(11_000)).unwrap();

        let b = stop_id(&model, "B");
        let key = latest_key(&model, "bus-1");
        // both examples predate now - 2 h, so the guess is their mean
        let eta = estimate(&mut model.history, &model.graph, at(11_000), b, key);
        assert_eq!(eta, Eta::In(Duration::seconds(75)));
    }

    #[test]
    fn fleet_history_answers_for_a_vehicle_without_its_own() {
        let mut model = abc_model();
        journey_via_mid(&mut model, "bus-1", STOP_A, 0, 100, 160);

        // bus-2 has never been seen before
        model.set_time(at(9_990)).unwrap();
        model.ingest(&moving_ping("bus-2", MID.0, MID.1, 90.0, at(9_990)));
        model.set_time(at(10_000)).unwrap();

        let b = stop_id(&model, "B");
        let key = latest_key(&model, "bus-2");
        let eta = estimate(&mut model.history, &model.graph, at(10_000), b, key);
        assert_eq!(eta, Eta::In(Duration::seconds(60)));
    }

    #[test]
    fn opposite_heading_examples_are_ignored() {
        let mut model = abc_model();
        journey_via_mid(&mut model, "bus-1", STOP_A, 0, 100, 160);

        // query heading west; the eastbound example no longer matches
        model.set_time(at(9_990)).unwrap();
        model.ingest(&moving_ping("bus-1", MID.0, MID.1, 270.0, at(9_990)));
        model.set_time(at(10_000)).unwrap();

        let b = stop_id(&model, "B");
        let key = latest_key(&model, "bus-1");
        let eta = estimate(&mut model.history, &model.graph, at(10_000), b, key);
        assert_eq!(eta, Eta::Unknown);
    }

    #[test]
    fn time_to_stop_memoizes_hits_but_never_misses() {
        let mut model = abc_model();
        ingest_at(&mut model, &moving_ping("bus-1", STOP_A.0, STOP_A.1, 90.0, at(0)));
        ingest_at(&mut model, &moving_ping("bus-1", MID.0, MID.1, 90.0, at(100)));

        let b = stop_id(&model, "B");
        let mid_key = PingKey {
            vehicle: latest_key(&model, "bus-1").vehicle,
            seq: 1,
        };

        // no B visit yet: unresolvable, and the miss is not cached
        assert_eq!(historical_time_to_stop(&mut model.history, mid_key, b), None);
        assert!(model
            .history
            .get(mid_key)
            .unwrap()
            .time_to_stop_memo
            .is_empty());

        // once the vehicle reaches B the same lookup resolves and memoizes
        ingest_at(&mut model, &moving_ping("bus-1", STOP_B.0, STOP_B.1, 90.0, at(160)));
        assert_eq!(
            historical_time_to_stop(&mut model.history, mid_key, b),
            Some(Duration::seconds(60))
        );
        assert_eq!(
            model.history.get(mid_key).unwrap().time_to_stop_memo.get(&b),
            Some(&Duration::seconds(60))
        );
    }

    #[test]
    fn edge_speed_needs_enough_history_and_skips_idle_pings() {
        let mut model = abc_model();
        ingest_at(&mut model, &moving_ping("bus-1", STOP_A.0, STOP_A.1, 90.0, at(0)));

        // short lane: too little context to judge the edge
        ingest_at(
            &mut model,
            &ping_with_speed("bus-1", 33.650, -117.7385, 90.0, 20.0, at(10)),
        );
        let early = latest_key(&model, "bus-1");
        assert_eq!(average_speed_on_edge(&mut model.history, early), None);

        // grow the lane: ten pings at 20 mph, ten at 30 mph, a few idling
        let mut t = 20;
        for i in 0..22 {
            let speed = match i % 3 {
                0 => 20.0,
                1 => 30.0,
                _ => 2.0, // idling at a light, excluded
            };
            ingest_at(
                &mut model,
                &ping_with_speed("bus-1", 33.650, -117.7380, 90.0, speed, at(t)),
            );
            t += 10;
        }
        ingest_at(
            &mut model,
            &ping_with_speed("bus-1", 33.650, -117.7375, 90.0, 25.0, at(t)),
        );

        let probe = latest_key(&model, "bus-1");
        let avg = average_speed_on_edge(&mut model.history, probe).unwrap();
        // 8x20 + 7x30 + the first 20 and the probe's 25: (160+210+20+25)/17
        let expected = (8.0 * 20.0 + 7.0 * 30.0 + 20.0 + 25.0) / 17.0;
        approx::assert_relative_eq!(avg, expected, epsilon = 1e-9);
        // memoized on the ping now
        assert_eq!(
            model.history.get(probe).unwrap().edge_speed_memo,
            Some(avg)
        );
    }

    #[test]
    fn slow_running_vehicle_gets_a_scaled_up_eta() {
        let mut model = abc_model();

        // historical run at 30 mph: stop A, a trail of pings to MID, then B
        ingest_at(&mut model, &moving_ping("bus-1", STOP_A.0, STOP_A.1, 90.0, at(0)));
        let mut lon = -117.7395;
        let mut t = 10;
        for _ in 0..30 {
            ingest_at(
                &mut model,
                &ping_with_speed("bus-1", 33.650, lon, 90.0, 30.0, at(t)),
            );
            lon += 0.000_15;
            t += 10;
        }
        ingest_at(
            &mut model,
            &ping_with_speed("bus-1", MID.0, MID.1, 90.0, 30.0, at(310)),
        );
        ingest_at(&mut model, &moving_ping("bus-1", STOP_B.0, STOP_B.1, 90.0, at(400)));

        // today's run over the same stretch at 10 mph
        let day = 100_000;
        ingest_at(
            &mut model,
            &moving_ping("bus-1", STOP_A.0, STOP_A.1, 90.0, at(day)),
        );
        let mut lon = -117.7395;
        let mut t = day + 10;
        for _ in 0..25 {
            ingest_at(
                &mut model,
                &ping_with_speed("bus-1", 33.650, lon, 90.0, 10.0, at(t)),
            );
            lon += 0.000_15;
            t += 10;
        }
        ingest_at(
            &mut model,
            &ping_with_speed("bus-1", MID.0, MID.1, 90.0, 10.0, at(t)),
        );

        let now = at(t + 10);
        model.set_time(now).unwrap();
        let b = stop_id(&model, "B");
        let key = latest_key(&model, "bus-1");
        let eta = estimate(&mut model.history, &model.graph, now, b, key);

        // stale examples: MID at t=310 resolved 90 s, its neighbor 100 s, mean
        // 95 s; local 10 mph vs baseline 30 mph scales it by 3
        assert_eq!(eta, Eta::In(Duration::seconds(285)));
    }
}
