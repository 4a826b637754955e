//! TOML configuration for the cronguard daemon.
//!
//! The file path comes from `--config` or the `CRONGUARD_CONFIG` environment
//! variable. [`Config::validate`] fills in defaults and rejects incomplete
//! documents before anything is started.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::dumper::DumpSettings;
use crate::history::effective_retention;
use crate::notify::EmailSettings;
use crate::scheduler::{parse_schedule, OrchestratorSettings, ScheduleError, DIGEST_JOB};
use crate::stat::DEFAULT_TIME_FORMAT;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cronguard.toml";
const DB_FILE_NAME: &str = "cronguard.db";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required {0} configuration")]
    Missing(&'static str),

    #[error("invalid log_level '{0}'")]
    LogLevel(String),

    #[error("invalid time_format '{0}'")]
    TimeFormat(String),

    #[error("invalid duration '{0}'")]
    Duration(String),

    #[error("job name '{0}' is reserved")]
    ReservedName(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Diagnostic log file, appended to unless running with `--debug`.
    pub log_path: PathBuf,
    pub log_level: String,
    /// Directory holding the history database.
    pub lib_path: PathBuf,
    /// strftime string used for `Stat::start` / `Stat::end`.
    pub time_format: String,
    /// History entries kept per job. 0 means the default; negative disables
    /// history entirely.
    pub retention: i64,
    pub http: Option<HttpConfig>,
    pub dump: Option<DumpConfig>,
    /// Alerting and digest options for whichever notifier is in use.
    pub notify: NotifyConfig,
    pub email: Option<EmailConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("/var/log/cronguard.log"),
            log_level: "error".to_string(),
            lib_path: PathBuf::from("/var/lib/cronguard"),
            time_format: DEFAULT_TIME_FORMAT.to_string(),
            retention: 0,
            http: None,
            dump: None,
            notify: NotifyConfig::default(),
            email: None,
        }
    }
}

impl Config {
    /// Read, parse and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content).context("failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply defaults and check required fields.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.log_level.is_empty() {
            self.log_level = "error".to_string();
        }
        self.log_level = self.log_level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::LogLevel(self.log_level.clone()));
        }

        if self.time_format.is_empty() {
            self.time_format = DEFAULT_TIME_FORMAT.to_string();
        }
        if StrftimeItems::new(&self.time_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::TimeFormat(self.time_format.clone()));
        }

        if self.retention == 0 {
            self.retention = crate::history::DEFAULT_RETENTION as i64;
        }

        if let Some(http) = &mut self.http {
            if http.addr.is_empty() {
                http.addr = "127.0.0.1".to_string();
            }
            if http.port == 0 {
                http.port = 4060;
            }
        }

        self.notify.validate()?;
        if let Some(email) = &mut self.email {
            email.validate()?;
        }

        self.dump.as_mut().ok_or(ConfigError::Missing("dump"))?.validate()
    }

    pub fn db_path(&self) -> PathBuf {
        self.lib_path.join(DB_FILE_NAME)
    }

    /// Per-job bound for the history store.
    pub fn history_retention(&self) -> usize {
        effective_retention(usize::try_from(self.retention).unwrap_or(0))
    }

    pub fn dump_settings(&self) -> Result<DumpSettings, ConfigError> {
        let dump = self.dump.as_ref().ok_or(ConfigError::Missing("dump"))?;
        let output_path = dump
            .output_path
            .clone()
            .ok_or(ConfigError::Missing("dump.output_path"))?;

        let mut settings = DumpSettings::new(dump.job_name(), &dump.executable_path, output_path)
            .with_args(dump.executable_args.iter().cloned())
            .with_output_retention(effective_retention(dump.retention));
        if let Some(limit) = dump.time_limit()? {
            settings = settings.with_time_limit(limit);
        }
        settings.time_format = self.time_format.clone();
        Ok(settings)
    }

    pub fn orchestrator_settings(&self) -> Result<OrchestratorSettings, ConfigError> {
        let dump = self.dump.as_ref().ok_or(ConfigError::Missing("dump"))?;
        let mut settings = OrchestratorSettings::new(dump.schedule.clone());
        settings.history_retention = self.retention;

        // `[notify]` wins over the `[email]` keys. Without a mail transport
        // failures go to the log by default.
        settings.notify_on_failure = self
            .notify
            .on_failure
            .unwrap_or_else(|| self.email.as_ref().map_or(true, |e| e.on_failure));
        settings.history_schedule = self.notify.history_schedule.clone().or_else(|| {
            self.email
                .as_ref()
                .and_then(|e| e.history_schedule.clone())
        });
        Ok(settings)
    }

    /// SMTP settings, when an `[email]` section is present.
    pub fn email_settings(&self) -> Option<EmailSettings> {
        let email = self.email.as_ref()?;
        Some(EmailSettings {
            host: email.host.clone(),
            port: email.port,
            user: email.user.clone(),
            pass: email.pass.clone(),
            starttls: email.starttls,
            ssl: email.ssl,
            insecure_skip_verify: email.insecure_skip_verify,
            from: email.from.clone(),
            to: email.to.clone(),
            subject: email.subject.clone(),
            history_subject: email.history_subject.clone(),
            history_template: email.history_template.clone(),
            attach_log: Some(self.log_path.clone()),
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Health endpoint listener. Only served when the section is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub addr: String,
    pub port: u16,
}

impl HttpConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.addr, self.port)
            .parse()
            .with_context(|| format!("invalid http address {}:{}", self.addr, self.port))
    }
}

// ---------------------------------------------------------------------------
// Dump
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    /// Job label; defaults to the executable's file name.
    pub name: Option<String>,
    pub schedule: String,
    /// File the dump's standard output is written to.
    pub output_path: Option<PathBuf>,
    /// Previous artifacts kept next to `output_path`.
    pub retention: usize,
    pub executable_path: String,
    pub executable_args: Vec<String>,
    /// e.g. `30s`, `15m`, `1h30m`.
    pub time_limit: Option<String>,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            name: None,
            schedule: String::new(),
            output_path: None,
            retention: 0,
            executable_path: "mysqldump".to_string(),
            executable_args: vec![
                "--add-drop-database".to_string(),
                "--all-databases".to_string(),
            ],
            time_limit: None,
        }
    }
}

impl DumpConfig {
    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.retention == 0 {
            self.retention = crate::history::DEFAULT_RETENTION;
        }
        if self.executable_path.is_empty() {
            self.executable_path = "mysqldump".to_string();
        }
        if self.output_path.as_ref().map_or(true, |p| p.as_os_str().is_empty()) {
            return Err(ConfigError::Missing("dump.output_path"));
        }
        if self.schedule.trim().is_empty() {
            return Err(ConfigError::Missing("dump.schedule"));
        }
        parse_schedule(&self.schedule)?;
        self.time_limit()?;

        let name = self.job_name();
        if name == DIGEST_JOB {
            return Err(ConfigError::ReservedName(name));
        }
        Ok(())
    }

    pub fn job_name(&self) -> String {
        if let Some(name) = self.name.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }
        Path::new(&self.executable_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable_path.clone())
    }

    pub fn time_limit(&self) -> Result<Option<Duration>, ConfigError> {
        match self.time_limit.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => parse_duration(s).map(Some),
        }
    }
}

// ---------------------------------------------------------------------------
// Notify
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Alert on every failed backup. Unset means `[email] on_failure`, or
    /// on when there is no `[email]` section.
    pub on_failure: Option<bool>,
    /// Cron expression for the history digest.
    pub history_schedule: Option<String>,
}

impl NotifyConfig {
    fn validate(&mut self) -> Result<(), ConfigError> {
        validate_optional_schedule(&mut self.history_schedule)
    }
}

fn validate_optional_schedule(expr: &mut Option<String>) -> Result<(), ConfigError> {
    let trimmed = expr.as_deref().map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        *expr = None;
    } else {
        parse_schedule(trimmed)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Email
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub starttls: bool,
    pub ssl: bool,
    pub insecure_skip_verify: bool,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub history_subject: String,
    /// Cron expression for the history digest.
    pub history_schedule: Option<String>,
    pub history_template: Option<PathBuf>,
    /// Alert on every failed backup.
    pub on_failure: bool,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 25,
            user: String::new(),
            pass: String::new(),
            starttls: false,
            ssl: false,
            insecure_skip_verify: false,
            subject: "Database Backup Failure".to_string(),
            from: String::new(),
            to: Vec::new(),
            history_subject: "Database Backup History".to_string(),
            history_schedule: None,
            history_template: None,
            on_failure: false,
        }
    }
}

impl EmailConfig {
    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Missing("email.host"));
        }
        if self.from.is_empty() {
            return Err(ConfigError::Missing("email.from"));
        }
        if self.to.is_empty() {
            return Err(ConfigError::Missing("email.to"));
        }
        if self.port == 0 {
            self.port = 25;
        }
        if self.starttls {
            self.ssl = false;
        }
        if self.subject.is_empty() {
            self.subject = "Database Backup Failure".to_string();
        }
        if self.history_subject.is_empty() {
            self.history_subject = "Database Backup History".to_string();
        }
        validate_optional_schedule(&mut self.history_schedule)
    }
}

/// Parse durations like `500ms`, `30s`, `15m`, `2h` or `1h30m`.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let bad = || ConfigError::Duration(input.to_string());
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(bad());
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(bad)?;
        if digits == 0 {
            return Err(bad());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| bad())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            _ => return Err(bad()),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[dump]
schedule = "0 3 * * *"
output_path = "/tmp/backup.sql"
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.log_path, PathBuf::from("/var/log/cronguard.log"));
        assert_eq!(config.log_level, "error");
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/cronguard/cronguard.db"));
        assert_eq!(config.time_format, DEFAULT_TIME_FORMAT);
        assert_eq!(config.retention, 7);
        assert!(config.http.is_none());
        assert!(config.email.is_none());

        let dump = config.dump_settings().unwrap();
        assert_eq!(dump.name, "mysqldump");
        assert_eq!(dump.executable, "mysqldump");
        assert_eq!(dump.args, vec!["--add-drop-database", "--all-databases"]);
        assert_eq!(dump.output_retention, 7);
        assert!(dump.time_limit.is_none());
    }

    #[test]
    fn test_missing_dump_section() {
        let err = Config::from_toml("log_level = \"info\"").unwrap_err();
        let err = err.downcast::<ConfigError>().unwrap();
        assert!(matches!(err, ConfigError::Missing("dump")));
    }

    #[test]
    fn test_missing_schedule_and_output() {
        let mut config: Config = toml::from_str("[dump]\noutput_path = \"/tmp/x\"").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("dump.schedule"))
        ));

        let mut config: Config = toml::from_str("[dump]\nschedule = \"@daily\"").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("dump.output_path"))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_level = format!("log_level = \"loud\"\n{}", MINIMAL);
        assert!(Config::from_toml(&bad_level).is_err());

        let bad_format = format!("time_format = \"%Q\"\n{}", MINIMAL);
        assert!(Config::from_toml(&bad_format).is_err());

        let bad_cron = "[dump]\nschedule = \"whenever\"\noutput_path = \"/tmp/x\"";
        assert!(Config::from_toml(bad_cron).is_err());

        let bad_limit = format!("{}time_limit = \"soon\"\n", MINIMAL);
        assert!(Config::from_toml(&bad_limit).is_err());
    }

    #[test]
    fn test_email_and_http_defaults() {
        let doc = format!(
            r#"
retention = -1
[http]
[email]
host = "smtp.example.com"
from = "backup@example.com"
to = ["ops@example.com"]
starttls = true
ssl = true
history_schedule = "0 8 * * *"
on_failure = true
{}"#,
            MINIMAL
        );
        let config = Config::from_toml(&doc).unwrap();

        let http = config.http.as_ref().unwrap();
        assert_eq!(http.socket_addr().unwrap(), "127.0.0.1:4060".parse::<SocketAddr>().unwrap());

        let email = config.email_settings().unwrap();
        assert_eq!(email.port, 25);
        assert!(email.starttls);
        assert!(!email.ssl);
        assert_eq!(email.subject, "Database Backup Failure");
        assert_eq!(email.history_subject, "Database Backup History");
        assert_eq!(email.attach_log, Some(config.log_path.clone()));

        let orch = config.orchestrator_settings().unwrap();
        assert_eq!(orch.history_retention, -1);
        assert!(!orch.history_enabled());
        assert!(orch.notify_on_failure);
        assert_eq!(orch.history_schedule.as_deref(), Some("0 8 * * *"));
    }

    #[test]
    fn test_email_requires_recipients() {
        let doc = format!(
            "[email]\nhost = \"smtp.example.com\"\nfrom = \"a@example.com\"\n{}",
            MINIMAL
        );
        let err = Config::from_toml(&doc).unwrap_err();
        let err = err.downcast::<ConfigError>().unwrap();
        assert!(matches!(err, ConfigError::Missing("email.to")));
    }

    #[test]
    fn test_dump_name_and_time_limit() {
        let doc = r#"
[dump]
schedule = "@hourly"
output_path = "/tmp/pg.sql"
executable_path = "/usr/bin/pg_dumpall"
executable_args = []
time_limit = "1h30m"
retention = 3
"#;
        let config = Config::from_toml(doc).unwrap();
        let dump = config.dump_settings().unwrap();
        assert_eq!(dump.name, "pg_dumpall");
        assert!(dump.args.is_empty());
        assert_eq!(dump.output_retention, 3);
        assert_eq!(dump.time_limit, Some(Duration::from_secs(5400)));
    }

    #[test]
    fn test_failures_are_alerted_without_email() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert!(config.email_settings().is_none());
        let orch = config.orchestrator_settings().unwrap();
        assert!(orch.notify_on_failure);
        assert!(orch.history_schedule.is_none());

        let doc = format!(
            "[notify]\non_failure = false\nhistory_schedule = \"0 8 * * *\"\n{}",
            MINIMAL
        );
        let orch = Config::from_toml(&doc).unwrap().orchestrator_settings().unwrap();
        assert!(!orch.notify_on_failure);
        assert_eq!(orch.history_schedule.as_deref(), Some("0 8 * * *"));

        let bad = format!("[notify]\nhistory_schedule = \"often\"\n{}", MINIMAL);
        assert!(Config::from_toml(&bad).is_err());
    }

    #[test]
    fn test_reserved_job_name_rejected() {
        let doc = format!("{}name = \"{}\"\n", MINIMAL, DIGEST_JOB);
        let err = Config::from_toml(&doc).unwrap_err();
        let err = err.downcast::<ConfigError>().unwrap();
        assert!(matches!(err, ConfigError::ReservedName(_)));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5d").is_err());
    }
}
