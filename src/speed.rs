//! Device speed class → negotiated link bits/s (§3 Link properties).

/// Maps the speed class `rusb` reports for an opened device to the negotiated link rate in
/// bits per second. Unknown/high share a bucket per spec.
pub fn bits_per_second(speed: rusb::Speed) -> u32 {
    match speed {
        rusb::Speed::Low => 1_500_000,
        rusb::Speed::Full => 12_000_000,
        rusb::Speed::Super => 5_000_000_000,
        rusb::Speed::SuperPlus => 10_000_000_000,
        // High and anything the binding hasn't named yet.
        _ => 480_000_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_speed() {
        assert_eq!(bits_per_second(rusb::Speed::Low), 1_500_000);
    }

    #[test]
    fn full_speed() {
        assert_eq!(bits_per_second(rusb::Speed::Full), 12_000_000);
    }

    #[test]
    fn high_speed_falls_back_to_480m() {
        assert_eq!(bits_per_second(rusb::Speed::High), 480_000_000);
    }

    #[test]
    fn unknown_speed_falls_back_to_480m() {
        assert_eq!(bits_per_second(rusb::Speed::Unknown), 480_000_000);
    }

    #[test]
    fn super_speed() {
        assert_eq!(bits_per_second(rusb::Speed::Super), 5_000_000_000);
    }

    #[test]
    fn super_plus_speed() {
        assert_eq!(bits_per_second(rusb::Speed::SuperPlus), 10_000_000_000);
    }
}
