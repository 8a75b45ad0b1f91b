use chrono::Duration;
use geo::{GeodesicDestination, GeodesicDistance, Point};

const METERS_PER_MILE: f64 = 1_609.344;

/// Speeds below this are treated as stationary for dead reckoning; GPS
/// headings are unreliable when the vehicle is barely moving.
const DEAD_RECKON_MIN_SPEED_MPH: f64 = 2.0;

/// Ellipsoidal (WGS84) distance between two points in meters.
pub fn distance_m(a: Point<f64>, b: Point<f64>) -> f64 {
    a.geodesic_distance(&b)
}

/// Angular distance between two compass headings, in [0, 180] degrees.
pub fn heading_difference_deg(h1: f64, h2: f64) -> f64 {
    let mut diff = (h1 - h2).abs() % 360.0;
    if diff > 180.0 {
        diff = 360.0 - diff;
    }
    diff
}

/// Point reached by travelling `meters` along `heading_deg` from `origin`.
pub fn project_forward(origin: Point<f64>, heading_deg: f64, meters: f64) -> Point<f64> {
    origin.geodesic_destination(heading_deg, meters)
}

/// Dead-reckoned position after `elapsed`, assuming the reported speed and
/// heading held. Stationary or zero-elapsed inputs come back unchanged.
pub fn estimated_position(
    origin: Point<f64>,
    speed_mph: f64,
    heading_deg: f64,
    elapsed: Duration,
) -> Point<f64> {
    if speed_mph < DEAD_RECKON_MIN_SPEED_MPH || elapsed.is_zero() {
        return origin;
    }

    let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
    let meters = speed_mph * hours * METERS_PER_MILE;
    project_forward(origin, heading_deg, meters)
}
