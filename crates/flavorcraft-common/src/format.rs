//! Human-readable formatting for progress and summary output

use byte_unit::{Byte, UnitType};
use std::time::Duration;

/// Format a byte count with a binary unit, e.g. `"812.4 MiB"`.
pub fn human_bytes(bytes: u64) -> String {
    let adjusted = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary);
    format!("{adjusted:.1}")
}

/// Format an integer with `,` thousands separators.
pub fn thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Rows per second over `elapsed`; zero when no time has passed.
pub fn rows_per_sec(rows: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        rows as f64 / secs
    } else {
        0.0
    }
}

/// Elapsed time in minutes with one decimal, e.g. `"12.5 min"`.
pub fn minutes(elapsed: Duration) -> String {
    format!("{:.1} min", elapsed.as_secs_f64() / 60.0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_thousands() {
        assert_eq!(thousands(0), "0");
        assert_eq!(thousands(999), "999");
        assert_eq!(thousands(1_000), "1,000");
        assert_eq!(thousands(9_100_000), "9,100,000");
    }

    #[test]
    fn test_rows_per_sec_zero_elapsed() {
        assert_eq!(rows_per_sec(10_000, Duration::ZERO), 0.0);
        assert_eq!(rows_per_sec(10_000, Duration::from_secs(4)), 2_500.0);
    }

    #[test]
    fn test_minutes() {
        assert_eq!(minutes(Duration::from_secs(90)), "1.5 min");
    }

    #[test]
    fn test_human_bytes_has_unit() {
        assert!(human_bytes(5 * 1024 * 1024).contains("MiB"));
    }

    proptest! {
        #[test]
        fn thousands_strips_back_to_number(value in any::<u64>()) {
            let formatted = thousands(value);
            prop_assert_eq!(formatted.replace(',', "").parse::<u64>().unwrap(), value);
        }
    }
}
