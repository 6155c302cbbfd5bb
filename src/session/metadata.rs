//! Structured session records embedded in the logs

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::info;

use super::{iso_str, time_str, SessionLogger};

/// Records are wrapped in this marker so they can be grepped out of a log.
pub const METADATA_MARKER: &str = "VIDCAP-METADATA-JSON";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    SessionBegin {
        #[serde(rename = "appName")]
        app_name: String,
        serial: String,
        #[serde(rename = "vDev")]
        v_dev: String,
        #[serde(rename = "aDev")]
        a_dev: String,
        cap_ts_start: String,
        cap_isotime_start: String,
        cx: u32,
        cy: u32,
        #[serde(rename = "frameRate")]
        frame_rate: u32,
        #[serde(rename = "autoRecovery")]
        auto_recovery: bool,
    },
    CaptureStop {
        message: String,
        cap_ts_start: String,
        cap_isotime_start: String,
        cap_ts_stop: String,
        cap_isotime_stop: String,
    },
    SessionEnd {
        message: String,
        cap_ts_start: String,
        cap_isotime_start: String,
    },
}

#[derive(Serialize)]
struct Envelope<'a> {
    version: &'static str,
    json_ts: String,
    json_isotime: String,
    #[serde(flatten)]
    record: &'a Record,
}

impl Record {
    pub fn to_line(&self, now: &DateTime<Local>) -> String {
        let envelope = Envelope {
            version: env!("CARGO_PKG_VERSION"),
            json_ts: time_str(now),
            json_isotime: iso_str(now),
            record: self,
        };
        let json = serde_json::to_string(&envelope).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e));
        format!("{}: {} :{}", METADATA_MARKER, json, METADATA_MARKER)
    }
}

/// Write a record to the main log and, when given, the session log.
pub fn log_record(record: &Record, session: Option<&SessionLogger>) {
    let line = record.to_line(&Local::now());
    info!("{}", line);
    if let Some(session) = session {
        session.info(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_line(line: &str) -> Option<serde_json::Value> {
        let start = line.find(METADATA_MARKER)? + METADATA_MARKER.len();
        let rest = line[start..].strip_prefix(':')?;
        let end = rest.rfind(&format!(":{}", METADATA_MARKER))?;
        serde_json::from_str(rest[..end].trim()).ok()
    }

    #[test]
    fn test_session_begin_line() {
        let record = Record::SessionBegin {
            app_name: "vidcap-agent".to_string(),
            serial: "B208".to_string(),
            v_dev: "USB Capture HDMI+".to_string(),
            a_dev: "hw:1,0".to_string(),
            cap_ts_start: "2024.05.01.10.20.30.123".to_string(),
            cap_isotime_start: "2024-05-01T10:20:30.123000".to_string(),
            cx: 1920,
            cy: 1080,
            frame_rate: 60,
            auto_recovery: true,
        };
        let line = record.to_line(&Local::now());
        assert!(line.starts_with("VIDCAP-METADATA-JSON: {"));
        assert!(line.ends_with("} :VIDCAP-METADATA-JSON"));

        let value = parse_line(&format!("10:20:31 [INFO] {}", line)).unwrap();
        assert_eq!(value["type"], "session_begin");
        assert_eq!(value["appName"], "vidcap-agent");
        assert_eq!(value["cx"], 1920);
        assert_eq!(value["autoRecovery"], true);
        assert!(value["json_isotime"].is_string());
        assert!(value["version"].is_string());
    }

    #[test]
    fn test_parse_line_without_marker() {
        assert!(parse_line("plain log line").is_none());
    }
}
