use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::model::MacAddress;

/// RSSI value BlueZ reports for devices that went out of range.
pub(crate) const RSSI_DEVICE_UNAVAILABLE: i16 = 0;

/// Time policy deciding LE device visibility and eviction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PresencePolicy {
    pub(crate) max_age_rssi: Duration,
    pub(crate) max_unavailability: Duration,
}

impl PresencePolicy {
    /// Whether a device belongs in a scan snapshot.
    pub(crate) fn visible(&self, last_seen: Instant, rssi: i16, now: Instant) -> bool {
        now.saturating_duration_since(last_seen) <= self.max_age_rssi
            && rssi != RSSI_DEVICE_UNAVAILABLE
    }

    /// Whether an unwatched device record should be dropped.
    pub(crate) fn expired(&self, last_seen: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_seen) > self.max_unavailability
    }
}

/// "Seen recently" map smoothing the flapping of classic inquiry.
///
/// A device the backend currently misses is still reported present when
/// its last sighting is within the artificial-availability window.
#[derive(Debug)]
pub(crate) struct ClassicPresenceCache {
    artificial_availability: Duration,
    seen: Mutex<HashMap<MacAddress, Instant>>,
}

impl ClassicPresenceCache {
    pub(crate) fn new(artificial_availability: Duration) -> Self {
        Self {
            artificial_availability,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Merges a raw detection result with the cache and returns the
    /// smoothed availability.
    pub(crate) fn smooth(&self, mac: MacAddress, detected: bool) -> bool {
        let mut seen = self.seen.lock().expect("classic presence lock poisoned");

        let Some(last_seen) = seen.get_mut(&mac) else {
            if detected {
                seen.insert(mac, Instant::now());
            }
            return detected;
        };

        if detected {
            *last_seen = Instant::now();
            return true;
        }

        let elapsed = last_seen.elapsed();
        if elapsed <= self.artificial_availability {
            debug!(
                %mac,
                seconds_ago = elapsed.as_secs(),
                "missing classic device declared available from recent sighting"
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn mac() -> MacAddress {
        "AA:BB:CC:DD:EE:01".parse().expect("mac should parse")
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_requires_fresh_rssi() {
        let policy = PresencePolicy {
            max_age_rssi: Duration::from_secs(30),
            max_unavailability: Duration::from_secs(600),
        };
        let seen_at = Instant::now();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(policy.visible(seen_at, -42, Instant::now()));
        assert!(!policy.visible(seen_at, RSSI_DEVICE_UNAVAILABLE, Instant::now()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!policy.visible(seen_at, -42, Instant::now()));
        assert!(!policy.expired(seen_at, Instant::now()));

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(policy.expired(seen_at, Instant::now()));
    }

    #[rstest]
    #[case(true, true)]
    #[case(false, false)]
    fn first_sighting_reports_the_backend_result(
        #[case] detected: bool,
        #[case] expected: bool,
    ) {
        let cache = ClassicPresenceCache::new(Duration::from_secs(30));
        assert_eq!(expected, cache.smooth(mac(), detected));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_device_stays_available_within_the_window() {
        let cache = ClassicPresenceCache::new(Duration::from_secs(30));
        assert!(cache.smooth(mac(), true));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(cache.smooth(mac(), false));

        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(!cache.smooth(mac(), false));
    }

    #[tokio::test(start_paused = true)]
    async fn detection_refreshes_the_window() {
        let cache = ClassicPresenceCache::new(Duration::from_secs(30));
        assert!(cache.smooth(mac(), true));

        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(cache.smooth(mac(), true));

        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(cache.smooth(mac(), false));
    }
}
