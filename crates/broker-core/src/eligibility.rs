use crate::geo::{self, Location};
use chrono::NaiveDateTime;

/// Softban spatial predicate. Evaluated in code after the candidate row is
/// fetched since it depends on the request's scan location.
///
/// A candidate with no recorded softban always passes. A softbanned
/// candidate with no scan location in the request never passes. A recorded
/// softban with no usable location is treated as distance zero.
pub fn softban_cleared(
    softban_time: Option<NaiveDateTime>,
    softban_location: Option<&str>,
    scan_location: Option<Location>,
    now_epoch: i64,
) -> bool {
    let Some(ban_time) = softban_time else {
        return true;
    };
    let Some(scan) = scan_location else {
        return false;
    };

    let distance = softban_location
        .and_then(Location::from_json)
        .map(|loc| geo::distance_meters(loc, scan))
        .unwrap_or(0.0);
    let wait = geo::cooldown_seconds(distance);

    now_epoch > ban_time.and_utc().timestamp() + wait as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::datetime_from_epoch;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_no_softban_always_passes() {
        assert!(softban_cleared(None, None, None, NOW));
        assert!(softban_cleared(
            None,
            None,
            Some(Location::new(0.0, 0.0)),
            NOW
        ));
    }

    #[test]
    fn test_softban_without_scan_location_rejects() {
        let ban = datetime_from_epoch(NOW - 10_000);
        assert!(!softban_cleared(Some(ban), None, None, NOW));
    }

    #[test]
    fn test_softban_same_spot_clears_immediately() {
        // distance 0 means no wait at all
        let ban = datetime_from_epoch(NOW - 60);
        let here = Location::new(0.0, 0.0);
        assert!(softban_cleared(
            Some(ban),
            Some(&here.to_json()),
            Some(here),
            NOW
        ));
    }

    #[test]
    fn test_softban_far_away_blocks_until_wait_elapses() {
        // ~111 km north of the ban spot: wait is well over an hour
        let ban_spot = Location::new(0.0, 0.0);
        let scan = Location::new(1.0, 0.0);
        let ban = datetime_from_epoch(NOW - 60);
        assert!(!softban_cleared(
            Some(ban),
            Some(&ban_spot.to_json()),
            Some(scan),
            NOW
        ));

        // long after the wait the account is usable again
        let old_ban = datetime_from_epoch(NOW - 8_000);
        assert!(softban_cleared(
            Some(old_ban),
            Some(&ban_spot.to_json()),
            Some(scan),
            NOW
        ));
    }

    #[test]
    fn test_softban_unparseable_location_counts_as_distance_zero() {
        let ban = datetime_from_epoch(NOW - 60);
        assert!(softban_cleared(
            Some(ban),
            Some("garbage"),
            Some(Location::new(5.0, 5.0)),
            NOW
        ));
    }
}
