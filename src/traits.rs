use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::lookup::{CourseInfo, Department};
use crate::tracker::{CredentialCheck, Outcome, TrackedItem};

/// One reference-clock measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtpSample {
    /// reference - local, milliseconds
    pub offset_ms: f64,
    pub round_trip_ms: f64,
}

#[cfg_attr(test, mockall::automock)]
pub trait NtpSource: Send + Sync {
    fn sample(&self) -> Result<NtpSample>;
}

/// Local wall clock. Injected so calibration can be driven by a fake clock in tests.
#[cfg_attr(test, mockall::automock)]
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Epoch milliseconds with microsecond resolution.
pub fn epoch_ms(at: &DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1000.0
}

pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Durable key-value storage. Values are opaque strings.
#[cfg_attr(test, mockall::automock)]
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Server-side timestamps of one calibration exchange, epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerStamp {
    pub receive_ms: f64,
    pub transmit_ms: f64,
}

#[async_trait]
pub trait ServerProbe: Send + Sync {
    /// Full exchange: the server reports when it received and answered the request.
    async fn server_time(&self) -> Result<ServerStamp>;

    /// Minimal request with no server-side work, used for one-way latency.
    async fn ping(&self) -> Result<()>;
}

/// Reply of a single registration attempt as classified by the server.
pub type AttemptReply = Outcome;

#[async_trait]
pub trait RegistrationTransport: Send + Sync {
    /// Issue one attempt. `Err` means the exchange itself failed (transient).
    async fn attempt(&self, item: &TrackedItem) -> Result<AttemptReply>;

    async fn test_credential(&self) -> Result<CredentialCheck>;
}

/// Public course timetable, one page per department.
#[async_trait]
pub trait CourseCatalog: Send + Sync {
    async fn departments(&self) -> Result<Vec<Department>>;

    async fn courses(&self, department_id: u32) -> Result<Vec<CourseInfo>>;
}
