use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Event timestamp format: `<secs>.<millis>Z`.
pub fn format_ms(ms: u64) -> String {
    format!("{}.{:03}Z", ms / 1000, ms % 1000)
}

pub fn timestamp_now() -> String {
    format_ms(now_ms())
}

/// Parse a `<secs>.<millis>Z` timestamp back into epoch milliseconds.
pub fn parse_stamp_ms(stamp: &str) -> Option<u64> {
    let trimmed = stamp.strip_suffix('Z').unwrap_or(stamp);
    let (secs, millis) = match trimmed.split_once('.') {
        Some((secs, millis)) => (secs, millis),
        None => (trimmed, "0"),
    };
    let secs = secs.parse::<u64>().ok()?;
    let millis = millis.parse::<u64>().ok()?;
    Some(secs.saturating_mul(1000).saturating_add(millis.min(999)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_and_parse_round_trip_expected_same_ms() {
        let ms = 1_723_456_789_123u64;
        assert_eq!(parse_stamp_ms(&format_ms(ms)), Some(ms));
    }

    #[test]
    fn parse_stamp_ms_without_fraction_expected_seconds_only() {
        assert_eq!(parse_stamp_ms("12Z"), Some(12_000));
    }
}
