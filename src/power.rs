/// Power Status Collaborator
///
/// Platform battery probing lives outside the core; the engine only asks
/// whether bulk transfers should be deferred. On battery below 20 percent,
/// manifests and small files still flow but bulk bodies wait.
/// Minimum battery percentage for bulk transfers while unplugged.
pub const LOW_BATTERY_THRESHOLD: u8 = 20;

/// Files at or above this size count as bulk when battery-gated.
pub const BULK_TRANSFER_BYTES: u64 = 256 * 1024;

pub trait PowerStatus: Send + Sync {
    fn is_on_battery(&self) -> bool;
    /// None when the platform cannot report a percentage.
    fn battery_percent(&self) -> Option<u8>;

    /// Whether bulk (≥ 256 KiB) transfers may proceed right now.
    fn allows_bulk_transfers(&self) -> bool {
        if !self.is_on_battery() {
            return true;
        }
        match self.battery_percent() {
            Some(pct) => pct >= LOW_BATTERY_THRESHOLD,
            None => true,
        }
    }
}

/// Default provider for machines without a battery.
pub struct MainsPower;

impl PowerStatus for MainsPower {
    fn is_on_battery(&self) -> bool {
        false
    }

    fn battery_percent(&self) -> Option<u8> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBattery {
        on_battery: bool,
        percent: Option<u8>,
    }

    impl PowerStatus for FakeBattery {
        fn is_on_battery(&self) -> bool {
            self.on_battery
        }
        fn battery_percent(&self) -> Option<u8> {
            self.percent
        }
    }

    #[test]
    fn mains_power_always_allows() {
        assert!(MainsPower.allows_bulk_transfers());
    }

    #[test]
    fn low_battery_defers_bulk() {
        let low = FakeBattery { on_battery: true, percent: Some(15) };
        assert!(!low.allows_bulk_transfers());

        let ok = FakeBattery { on_battery: true, percent: Some(55) };
        assert!(ok.allows_bulk_transfers());

        let plugged = FakeBattery { on_battery: false, percent: Some(5) };
        assert!(plugged.allows_bulk_transfers());
    }
}
