//! Per-session logging and metadata records

pub mod logger;
pub mod metadata;

use chrono::{DateTime, Local};

pub use logger::{LogLevel, SessionLogger};

/// Session timestamps, also used in file names: `2024.05.01.10.20.30.123`
pub const TIME_FORMAT: &str = "%Y.%m.%d.%H.%M.%S%.3f";

pub const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub fn time_str(ts: &DateTime<Local>) -> String {
    ts.format(TIME_FORMAT).to_string()
}

pub fn iso_str(ts: &DateTime<Local>) -> String {
    ts.format(ISO_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_formats() {
        let ts = Local
            .with_ymd_and_hms(2024, 5, 1, 10, 20, 30)
            .unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(time_str(&ts), "2024.05.01.10.20.30.123");
        assert_eq!(iso_str(&ts), "2024-05-01T10:20:30.123000");
    }
}
