use serde::{Deserialize, Serialize};

/// A WGS-84 coordinate. Decodes from either the `[lat, lng]` or the
/// `{"lat": .., "lng": ..}` wire form; always written back as an object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LocationRepr {
    Pair(f64, f64),
    Object {
        #[serde(default)]
        lat: f64,
        #[serde(default)]
        lng: f64,
    },
}

impl<'de> Deserialize<'de> for Location {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match LocationRepr::deserialize(deserializer)? {
            LocationRepr::Pair(lat, lng) => Ok(Location { lat, lng }),
            LocationRepr::Object { lat, lng } => Ok(Location { lat, lng }),
        }
    }
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Location { lat, lng }
    }

    pub fn from_json(raw: &str) -> Option<Location> {
        serde_json::from_str(raw).ok()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, {}", self.lat, self.lng)
    }
}

const EARTH_RADIUS_KM: f64 = 6373.0;

/// Haversine great-circle distance in meters.
pub fn distance_meters(a: Location, b: Location) -> f64 {
    let lat1 = a.lat.to_radians();
    let lon1 = a.lng.to_radians();
    let lat2 = b.lat.to_radians();
    let lon2 = b.lng.to_radians();

    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let angle = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let circ = 2.0 * angle.sqrt().atan2((1.0 - angle).sqrt());

    EARTH_RADIUS_KM * circ * 1000.0
}

/// Travel speed assumed when the distance falls below the smallest tabulated
/// threshold.
pub const DEFAULT_SPEED_M_S: f64 = 16.67;

/// No spatial cooldown ever exceeds two hours.
pub const MAX_COOLDOWN_SECS: f64 = 7200.0;

// Distance thresholds (meters, descending) and the travel speed (m/s)
// assumed at or above each. The top row corresponds to roughly 650 km/h.
const SPEED_TABLE: &[(f64, f64)] = &[
    (1_335_000.0, 180.43),
    (1_100_000.0, 176.2820513),
    (1_020_000.0, 168.3168317),
    (1_007_000.0, 171.2585034),
    (948_000.0, 166.3157895),
    (900_000.0, 164.8351648),
    (897_000.0, 166.1111111),
    (839_000.0, 158.9015152),
    (802_000.0, 159.1269841),
    (751_000.0, 152.6422764),
    (700_000.0, 151.5151515),
    (650_000.0, 146.3963964),
    (600_000.0, 142.8571429),
    (550_000.0, 138.8888889),
    (500_000.0, 134.4086022),
    (450_000.0, 129.3103448),
    (400_000.0, 123.4567901),
    (350_000.0, 116.6666667),
    (328_000.0, 113.8888889),
    (300_000.0, 108.6956522),
    (250_000.0, 101.6260163),
    (201_000.0, 90.54054054),
    (175_000.0, 85.78431373),
    (150_000.0, 78.125),
    (125_000.0, 71.83908046),
    (100_000.0, 64.1025641),
    (90_000.0, 60.0),
    (80_000.0, 55.55555556),
    (70_000.0, 50.72463768),
    (60_000.0, 47.61904762),
    (45_000.0, 39.47368421),
    (40_000.0, 35.0877193),
    (35_000.0, 32.40740741),
    (30_000.0, 29.41176471),
    (25_000.0, 27.77777778),
    (20_000.0, 27.77777778),
    (15_000.0, 27.77777778),
    (10_000.0, 23.80952381),
    (8_000.0, 26.66666667),
    (5_000.0, 22.34137623),
    (4_000.0, 22.22222222),
];

/// Delay in seconds a softbanned account must wait before acting
/// `distance_m` away from its last softban location.
pub fn cooldown_seconds(distance_m: f64) -> f64 {
    let mut speed = DEFAULT_SPEED_M_S;
    for &(threshold, table_speed) in SPEED_TABLE {
        if distance_m >= threshold {
            speed = table_speed;
            break;
        }
    }
    (distance_m / speed).min(MAX_COOLDOWN_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_symmetry_and_identity() {
        let berlin = Location::new(52.52, 13.405);
        let paris = Location::new(48.8566, 2.3522);

        assert_eq!(distance_meters(berlin, berlin), 0.0);
        assert!((distance_meters(berlin, paris) - distance_meters(paris, berlin)).abs() < 1e-6);
    }

    #[test]
    fn test_distance_known_value() {
        // Berlin to Paris is roughly 878 km
        let berlin = Location::new(52.52, 13.405);
        let paris = Location::new(48.8566, 2.3522);
        let d = distance_meters(berlin, paris);
        assert!(d > 860_000.0 && d < 890_000.0, "got {}", d);
    }

    #[test]
    fn test_cooldown_below_smallest_threshold_uses_default_speed() {
        let d = 1_000.0;
        assert!((cooldown_seconds(d) - d / DEFAULT_SPEED_M_S).abs() < 1e-9);
    }

    #[test]
    fn test_cooldown_clamped_at_two_hours() {
        assert_eq!(cooldown_seconds(2_000_000.0), MAX_COOLDOWN_SECS);
        assert_eq!(cooldown_seconds(1_335_000.0), MAX_COOLDOWN_SECS);
    }

    #[test]
    fn test_cooldown_monotone_over_thresholds() {
        let mut last = 0.0;
        for &(threshold, _) in SPEED_TABLE.iter().rev() {
            let delay = cooldown_seconds(threshold);
            assert!(
                delay >= last,
                "cooldown not monotone at {} m: {} < {}",
                threshold,
                delay,
                last
            );
            last = delay;
        }
    }

    #[test]
    fn test_cooldown_spot_values() {
        // 10 km at 23.80952381 m/s
        assert!((cooldown_seconds(10_000.0) - 420.0).abs() < 0.1);
        // 90 km at 60 m/s
        assert!((cooldown_seconds(90_000.0) - 1_500.0).abs() < 0.1);
    }

    #[test]
    fn test_location_json_round_trip_object() {
        let loc = Location::new(52.52, 13.405);
        let parsed = Location::from_json(&loc.to_json()).unwrap();
        assert_eq!(parsed, loc);
    }

    #[test]
    fn test_location_json_list_form() {
        let parsed = Location::from_json("[52.52, 13.405]").unwrap();
        assert_eq!(parsed, Location::new(52.52, 13.405));

        let parsed = Location::from_json("[0, 0]").unwrap();
        assert_eq!(parsed, Location::new(0.0, 0.0));
    }

    #[test]
    fn test_location_json_object_form_with_missing_keys() {
        let parsed = Location::from_json(r#"{"lat": 52.52, "lng": 13.405}"#).unwrap();
        assert_eq!(parsed, Location::new(52.52, 13.405));

        let parsed = Location::from_json(r#"{"lat": 52.52}"#).unwrap();
        assert_eq!(parsed, Location::new(52.52, 0.0));
    }

    #[test]
    fn test_location_json_invalid() {
        assert!(Location::from_json("not json").is_none());
        assert!(Location::from_json("\"52.52\"").is_none());
    }
}
