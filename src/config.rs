use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// Session bounds. The server ignores requests from one caller spaced closer than 3s.
pub const MAX_ATTEMPTS_RANGE: (u32, u32) = (1, 300);
pub const RETRY_INTERVAL_RANGE_SECS: (f64, f64) = (3.0, 10.0);
pub const ARRIVAL_BUFFER_RANGE_MS: (f64, f64) = (0.0, 100.0);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub calibration: CalibrationConfig,
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
    pub lookup: LookupConfig,
    pub history_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub ntp_server: String,
    pub probe_timeout_ms: u64,
    pub samples: usize,       // server exchanges per calibration, best RTT wins
    pub ping_samples: usize,
    pub server_ntp_warn_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
    pub token_check_lead_ms: i64,
    pub recalibrate_every_secs: u64,
    pub final_calibration_lead_secs: u64,
    pub late_start_grace_secs: u64, // a target passed longer ago than this means tomorrow
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    pub base_url: String,
    pub program_level: String, // "LS" undergraduate
    pub cache_ttl_secs: u64,
    pub max_cached_departments: usize,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            calibration: CalibrationConfig::default(),
            scheduler: SchedulerConfig::default(),
            transport: TransportConfig::default(),
            lookup: LookupConfig::default(),
            history_dir: PathBuf::from(".crnsync"),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            ntp_server: "pool.ntp.org".to_string(),
            probe_timeout_ms: 3_000,
            samples: 5,
            ping_samples: 3,
            server_ntp_warn_ms: 500.0,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_ms: 100,
            token_check_lead_ms: 5_000,
            recalibrate_every_secs: 60,
            final_calibration_lead_secs: 20,
            late_start_grace_secs: 300,
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        LookupConfig {
            base_url: "https://obs.itu.edu.tr".to_string(),
            program_level: "LS".to_string(),
            cache_ttl_secs: 3_600,
            max_cached_departments: 50,
            request_timeout_ms: 15_000,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}

impl SystemConfig {
    /// Missing sections and fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}

/// Per-session settings. Construct through [`SessionConfig::new`] so every
/// bound is enforced; edits are not possible once a session runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub target_time_of_day: NaiveTime,
    pub max_attempts: u32,
    pub retry_interval_sec: f64,
    pub arrival_buffer_ms: f64,
}

impl SessionConfig {
    pub fn new(
        target_time_of_day: NaiveTime,
        max_attempts: u32,
        retry_interval_sec: f64,
        arrival_buffer_ms: f64,
    ) -> Self {
        SessionConfig {
            target_time_of_day,
            max_attempts,
            retry_interval_sec,
            arrival_buffer_ms,
        }
        .clamped()
    }

    /// Same settings forced into their documented ranges. NaN takes the lower bound.
    pub fn clamped(&self) -> Self {
        SessionConfig {
            target_time_of_day: self.target_time_of_day,
            max_attempts: self
                .max_attempts
                .clamp(MAX_ATTEMPTS_RANGE.0, MAX_ATTEMPTS_RANGE.1),
            retry_interval_sec: clamp_f64(self.retry_interval_sec, RETRY_INTERVAL_RANGE_SECS),
            arrival_buffer_ms: clamp_f64(self.arrival_buffer_ms, ARRIVAL_BUFFER_RANGE_MS),
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs_f64(clamp_f64(self.retry_interval_sec, RETRY_INTERVAL_RANGE_SECS))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::new(NaiveTime::default(), 60, 3.0, 5.0)
    }
}

fn clamp_f64(value: f64, (lo, hi): (f64, f64)) -> f64 {
    if value.is_nan() {
        lo
    } else {
        value.clamp(lo, hi)
    }
}

/// Accepts `HH:MM:SS` or `HH:MM`.
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .with_context(|| format!("Invalid time of day {:?} (expected HH:MM[:SS])", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nine() -> NaiveTime {
        NaiveTime::from_hms_opt(9, 0, 0).unwrap()
    }

    #[test]
    fn test_retry_interval_clamped() {
        assert_eq!(SessionConfig::new(nine(), 10, 1.0, 5.0).retry_interval_sec, 3.0);
        assert_eq!(SessionConfig::new(nine(), 10, 99.0, 5.0).retry_interval_sec, 10.0);
        assert_eq!(SessionConfig::new(nine(), 10, 4.5, 5.0).retry_interval_sec, 4.5);
        assert_eq!(SessionConfig::new(nine(), 10, f64::NAN, 5.0).retry_interval_sec, 3.0);
    }

    #[test]
    fn test_max_attempts_and_buffer_clamped() {
        let cfg = SessionConfig::new(nine(), 0, 3.0, -4.0);
        assert_eq!(cfg.max_attempts, 1);
        assert_eq!(cfg.arrival_buffer_ms, 0.0);

        let cfg = SessionConfig::new(nine(), 1_000, 3.0, 250.0);
        assert_eq!(cfg.max_attempts, 300);
        assert_eq!(cfg.arrival_buffer_ms, 100.0);
    }

    #[test]
    fn test_clamped_repairs_unchecked_values() {
        let raw = SessionConfig {
            target_time_of_day: nine(),
            max_attempts: 5_000,
            retry_interval_sec: 0.5,
            arrival_buffer_ms: 5.0,
        };
        let cfg = raw.clamped();
        assert_eq!(cfg.max_attempts, 300);
        assert_eq!(cfg.retry_interval_sec, 3.0);
        assert_eq!(raw.retry_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("09:00:00").unwrap(), nine());
        assert_eq!(parse_time_of_day("09:00").unwrap(), nine());
        assert!(parse_time_of_day("9am").is_err());
        assert!(parse_time_of_day("25:00").is_err());
    }

    #[test]
    fn test_system_config_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"calibration": {"samples": 9}, "transport": {"base_url": "https://example.test"}}"#,
        )
        .unwrap();

        let cfg = SystemConfig::load(&path).unwrap();
        assert_eq!(cfg.calibration.samples, 9);
        assert_eq!(cfg.calibration.ping_samples, 3);
        assert_eq!(cfg.transport.base_url, "https://example.test");
        assert_eq!(cfg.scheduler.tick_ms, 100);
    }

    #[test]
    fn test_system_config_defaults() {
        let cfg = SystemConfig::default();
        assert_eq!(cfg.scheduler.token_check_lead_ms, 5_000);
        assert_eq!(cfg.calibration.ntp_server, "pool.ntp.org");
        assert_eq!(cfg.scheduler.late_start_grace_secs, 300);
        assert_eq!(cfg.lookup.max_cached_departments, 50);
        assert_eq!(cfg.lookup.cache_ttl_secs, 3_600);
    }
}
