//! Postgres value formatting that matches what a live replication stream
//! produces, so the initial snapshot and subsequent log entries agree byte
//! for byte regardless of a connection's session defaults.

use chrono::{DateTime, NaiveDate, Utc};

/// `DateStyle='ISO, DMY'` formatting for a `date` column.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// `TimeZone='UTC'` formatting for a `timestamptz` column: Postgres's
/// default text output, not RFC 3339 (no literal `T`, `+00` not `Z`).
pub fn format_timestamptz(ts: DateTime<Utc>) -> String {
    format!("{}+00", ts.format("%Y-%m-%d %H:%M:%S"))
}

/// `extra_float_digits=1` formatting for `float4`/`float8`: full
/// round-trip precision, as a JSON string (doubles lose precision once
/// they pass through a JSON number in most client runtimes).
pub fn format_float(value: f64) -> String {
    let mut buf = ryu_like_shortest(value);
    if !buf.contains('.') && !buf.contains('e') {
        buf.push_str(".0");
    }
    buf
}

// `std`'s `{}` formatter for `f64` already produces the shortest string that
// round-trips, matching what Postgres emits with `extra_float_digits=1`.
// Named separately so the intent at the call site is documented, not just
// "format it".
fn ryu_like_shortest(value: f64) -> String {
    format!("{value}")
}

/// `bytea_output='hex'` formatting.
pub fn format_bytea(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(2 + bytes.len() * 2);
    s.push_str("\\x");
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// A Postgres `interval` value, decomposed the way the wire protocol and
/// `IntervalStyle='iso_8601'` text output represent it: months, days, and
/// sub-day microseconds are independent fields (a month is not a fixed
/// number of days).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PgInterval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

impl PgInterval {
    /// `IntervalStyle='iso_8601'` formatting, e.g. `P1DT12H59M10S`.
    pub fn to_iso8601(self) -> String {
        let years = self.months / 12;
        let months = self.months % 12;

        let mut secs_total = self.micros / 1_000_000;
        let micros_rem = (self.micros % 1_000_000).abs();
        let sign = if secs_total < 0 { "-" } else { "" };
        secs_total = secs_total.abs();
        let hours = secs_total / 3600;
        let minutes = (secs_total % 3600) / 60;
        let seconds = secs_total % 60;

        let mut date_part = String::new();
        if years != 0 {
            date_part.push_str(&format!("{years}Y"));
        }
        if months != 0 {
            date_part.push_str(&format!("{months}M"));
        }
        if self.days != 0 {
            date_part.push_str(&format!("{}D", self.days));
        }

        let has_time = hours != 0 || minutes != 0 || seconds != 0 || micros_rem != 0;
        let mut time_part = String::new();
        if has_time {
            time_part.push('T');
            if hours != 0 {
                time_part.push_str(&format!("{sign}{hours}H"));
            }
            if minutes != 0 {
                time_part.push_str(&format!("{sign}{minutes}M"));
            }
            if seconds != 0 || micros_rem != 0 || (hours == 0 && minutes == 0) {
                if micros_rem != 0 {
                    time_part.push_str(&format!("{sign}{seconds}.{micros_rem:06}S"));
                } else {
                    time_part.push_str(&format!("{sign}{seconds}S"));
                }
            }
        }

        if date_part.is_empty() && time_part.is_empty() {
            return "PT0S".to_string();
        }
        format!("P{date_part}{time_part}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn date_matches_iso_dmy_style() {
        assert_eq!(format_date(NaiveDate::from_ymd_opt(2022, 5, 17).unwrap()), "2022-05-17");
    }

    #[test]
    fn timestamptz_matches_postgres_default_text() {
        let ts = Utc.with_ymd_and_hms(2022, 1, 12, 0, 1, 0).unwrap();
        assert_eq!(format_timestamptz(ts), "2022-01-12 00:01:00+00");
    }

    #[test]
    fn float_round_trips_full_precision() {
        assert_eq!(format_float(1.234567890123456), "1.234567890123456");
    }

    #[test]
    fn bytea_matches_hex_output_format() {
        assert_eq!(format_bytea(&[0x05, 0x10, 0xfa]), "\\x0510fa");
    }

    #[test]
    fn interval_matches_iso_8601_style() {
        let interval = PgInterval {
            months: 0,
            days: 1,
            micros: (12 * 3600 + 59 * 60 + 10) * 1_000_000,
        };
        assert_eq!(interval.to_iso8601(), "P1DT12H59M10S");
    }

    #[test]
    fn zero_interval_is_pt0s() {
        assert_eq!(PgInterval::default().to_iso8601(), "PT0S");
    }
}
