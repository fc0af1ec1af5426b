//! Append-only JSONL provenance event log, one file per environment.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    ApplyStarted {
        environment: String,
        run_id: String,
        operation: String,
        nodes: usize,
    },
    ResourceStarted {
        resource: String,
        plugin: String,
        action: String,
    },
    ResourceReady {
        resource: String,
        duration_seconds: f64,
        inputs_hash: String,
    },
    ResourceFailed {
        resource: String,
        error: String,
    },
    ResourceDestroyed {
        resource: String,
        duration_seconds: f64,
    },
    ApplyCompleted {
        environment: String,
        run_id: String,
        ready: u32,
        unchanged: u32,
        failed: u32,
        total_seconds: f64,
    },
    DriftDetected {
        resource: String,
        expected_hash: String,
        actual_hash: String,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_epoch(secs)
}

/// Format seconds since the epoch as an ISO 8601 UTC timestamp.
pub fn format_epoch(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (y, m, d) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Derive the event log path for an environment.
pub fn event_log_path(state_dir: &Path, datacenter: &str, environment: &str) -> PathBuf {
    state_dir
        .join(datacenter)
        .join(environment)
        .join("events.jsonl")
}

/// Appends events for one environment.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(state_dir: &Path, datacenter: &str, environment: &str) -> Self {
        Self {
            path: event_log_path(state_dir, datacenter, environment),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: ProvenanceEvent) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&TimestampedEvent {
            ts: now_iso8601(),
            event,
        })?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }

    /// Read every event back, skipping lines that fail to parse.
    pub fn read_all(&self) -> io::Result<Vec<TimestampedEvent>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventlog_now_iso8601_shape() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 20);
    }

    #[test]
    fn test_eventlog_format_epoch_known_dates() {
        assert_eq!(format_epoch(0), "1970-01-01T00:00:00Z");
        // 2000-02-29 is a leap day
        assert_eq!(format_epoch(951_782_400), "2000-02-29T00:00:00Z");
        assert_eq!(format_epoch(1_771_250_401), "2026-02-16T14:00:01Z");
        // 2100 is not a leap year
        assert_eq!(format_epoch(4_107_542_400), "2100-03-01T00:00:00Z");
    }

    #[test]
    fn test_eventlog_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_eventlog_path_layout() {
        let p = event_log_path(Path::new("/state"), "local", "dev");
        assert_eq!(p, PathBuf::from("/state/local/dev/events.jsonl"));
    }

    #[test]
    fn test_eventlog_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path(), "local", "dev");
        log.append(ProvenanceEvent::ResourceFailed {
            resource: "app/database/main".to_string(),
            error: "exit code 1".to_string(),
        })
        .unwrap();
        log.append(ProvenanceEvent::ResourceDestroyed {
            resource: "app/database/main".to_string(),
            duration_seconds: 0.5,
        })
        .unwrap();

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(raw.contains("\"event\":\"resource_failed\""));

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1].event,
            ProvenanceEvent::ResourceDestroyed { .. }
        ));
    }

    #[test]
    fn test_eventlog_read_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path(), "dc", "none");
        assert!(log.read_all().unwrap().is_empty());
    }
}
