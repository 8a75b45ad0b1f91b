use chrono::{DateTime, Utc};

use super::history::HistoryStore;
use super::types::RouteGraph;

/// Evict every ping older than `expiration` from the vehicle lanes, then
/// scrub the now-dangling keys out of the stop and edge ping lists. Graph
/// shape and travel-time statistics are untouched; only raw samples age out.
/// Returns how many pings were removed.
pub(crate) fn sweep(
    history: &mut HistoryStore,
    graph: &mut RouteGraph,
    expiration: DateTime<Utc>,
) -> u64 {
    let mut removed: u64 = 0;
    for lane in history.lanes_mut() {
        removed += lane.evict_older_than(expiration) as u64;
    }

    graph.retain_pings(|key| history.contains(key));
    removed
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::{SWEEP_CYCLE_THRESHOLD, SWEEP_TOTAL_THRESHOLD};
    use chrono::Duration;

    /// Drive the model across both sweep thresholds through the public ingest
    /// path and check that exactly the aged pings disappear everywhere.
    #[test]
    fn sweep_evicts_only_expired_pings_once_thresholds_cross() {
        let t0 = at(1_000_000);
        let mut model = sim_model(&[stop_seed("A", 33.650, -117.740)], t0);

        // old era: enough pings to cross the total threshold, all of them
        // beyond the retention window by the time the sweep fires
        let old_count = SWEEP_TOTAL_THRESHOLD + 1;
        for i in 0..old_count {
            let t = t0 + Duration::seconds(i as i64 / 1_000);
            model.set_time(t).unwrap();
            model.ingest(&moving_ping("bus-1", 33.650, -117.738, 90.0, t));
        }
        assert_eq!(model.total_pings(), old_count);

        // new era: six days later, feed pings until the cycle threshold trips
        let new_era = t0 + Duration::days(6);
        let new_count = SWEEP_CYCLE_THRESHOLD + 1;
        for i in 0..new_count {
            let t = new_era + Duration::seconds(i as i64);
            model.set_time(t).unwrap();
            model.ingest(&moving_ping("bus-2", 33.650, -117.736, 90.0, t));
        }

        // every old-era ping was older than now - 5 days; only the new era survives
        assert_eq!(model.total_pings(), new_count);
        assert_eq!(model.history().total_pings() as u64, new_count);

        // a later query only sees the surviving vehicle
        let positions = model.recent_positions();
        assert!(!positions.contains_key("bus-1"));
        assert!(positions.contains_key("bus-2"));
    }

    #[test]
    fn sweep_scrubs_stop_and_edge_ping_lists_but_keeps_statistics() {
        let t0 = at(1_000_000);
        let mut model = sim_model(
            &[stop_seed("A", 33.650, -117.740), stop_seed("B", 33.650, -117.734)],
            t0,
        );

        // one observed A -> B traversal, old enough to age out entirely
        ingest_at(&mut model, &moving_ping("bus-1", 33.650, -117.740, 90.0, t0));
        ingest_at(
            &mut model,
            &moving_ping("bus-1", 33.650, -117.737, 90.0, t0 + Duration::seconds(100)),
        );
        ingest_at(
            &mut model,
            &moving_ping("bus-1", 33.650, -117.734, 90.0, t0 + Duration::seconds(200)),
        );

        // pad across the total threshold, then trip the cycle threshold after
        // the retention window has passed
        for i in 0..SWEEP_TOTAL_THRESHOLD {
            let t = t0 + Duration::seconds(300 + i as i64 / 1_000);
            model.set_time(t).unwrap();
            model.ingest(&moving_ping("bus-1", 33.680, -117.760, 90.0, t));
        }
        let new_era = t0 + Duration::days(6);
        for i in 0..=SWEEP_CYCLE_THRESHOLD {
            let t = new_era + Duration::seconds(i as i64);
            model.set_time(t).unwrap();
            model.ingest(&moving_ping("bus-1", 33.680, -117.760, 90.0, t));
        }

        let graph = model.graph();
        let (a, stop_a) = graph.stops().find(|(_, s)| s.label == "A").unwrap();
        let (b, _) = graph.stops().find(|(_, s)| s.label == "B").unwrap();
        assert!(stop_a.pings.is_empty());

        // the edge and its statistics survive even though its samples aged out
        let edge_id = graph.edge_between(a, b).expect("edge survives the sweep");
        let edge = graph.edge(edge_id);
        assert!(edge.pings.is_empty());
        assert_eq!(edge.average_travel_time(), Duration::seconds(200));
        assert_eq!(edge.sample_count(), 1);
    }
}
