//! Execution records for a single dump attempt.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default display format for `start` / `end`, e.g. `Mon Jan 02 03:04:05 PM UTC`.
pub const DEFAULT_TIME_FORMAT: &str = "%a %b %d %I:%M:%S %p %Z";

/// Outcome of one execution attempt of a job.
///
/// A `Stat` is created when a run begins and becomes terminal exactly once,
/// either through [`Stat::finish`] or by being created with [`Stat::skipped`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub name: String,
    pub start: String,
    /// Empty while the run is in flight.
    pub end: String,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub success: bool,
    pub skip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default = "default_time_format")]
    time_format: String,
}

fn default_time_format() -> String {
    DEFAULT_TIME_FORMAT.to_string()
}

impl Stat {
    /// Begin a new record stamped with the current time.
    pub fn new(name: impl Into<String>, time_format: &str) -> Self {
        let started_at = Utc::now();
        Self {
            name: name.into(),
            start: format_time(&started_at, time_format),
            end: String::new(),
            duration: Duration::ZERO,
            success: false,
            skip: false,
            error: None,
            started_at,
            time_format: time_format.to_string(),
        }
    }

    /// A terminal record for an attempt that never ran because another was
    /// still in flight.
    pub fn skipped(name: impl Into<String>, time_format: &str) -> Self {
        Self {
            skip: true,
            ..Self::new(name, time_format)
        }
    }

    /// Close the record. `success` is set iff `error` is `None`.
    pub fn finish(self, error: Option<String>) -> Self {
        let ended_at = Utc::now();
        let duration = (ended_at - self.started_at).to_std().unwrap_or_default();
        Self {
            end: format_time(&ended_at, &self.time_format),
            duration,
            success: error.is_none(),
            error,
            ..self
        }
    }

    pub fn is_failure(&self) -> bool {
        !self.success && !self.skip
    }

    /// Short human label used in notifications and the digest.
    pub fn status(&self) -> &'static str {
        if self.skip {
            "Skipped"
        } else if self.success {
            "Success"
        } else {
            "Failed"
        }
    }
}

/// Render `at` with a strftime string, falling back to RFC 3339 when the
/// format string contains an invalid specifier.
pub fn format_time(at: &DateTime<Utc>, format: &str) -> String {
    let mut out = String::new();
    match write!(out, "{}", at.format(format)) {
        Ok(()) => out,
        Err(_) => at.to_rfc3339(),
    }
}

/// Compact rendering like `1h2m3.500s` or `250ms`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    if total == 0 {
        let ms = d.as_secs_f64() * 1000.0;
        return if ms >= 1.0 {
            format!("{:.0}ms", ms)
        } else {
            format!("{}us", d.as_micros())
        };
    }

    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = (total % 60) as f64 + f64::from(d.subsec_millis()) / 1000.0;

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{}h", hours);
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{}m", minutes);
    }
    let _ = write!(out, "{:.3}s", secs);
    out
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}
