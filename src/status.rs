use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationResult;
use crate::history::Trend;
use crate::phase::Phase;
use crate::tracker::{CredentialCheck, ItemView};

/// Read-only session snapshot for whatever presents it (CLI, IPC, a UI).
///
/// Refreshed by the session controller on every tick and on every phase
/// change, shared as `Arc<RwLock<SessionStatus>>`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionStatus {
    pub phase: Phase,

    /// Operator label for the phase ("Kayıt saatine kalan", ...)
    pub phase_label: String,

    /// Remaining seconds, clamped at zero. `None` outside a session.
    pub countdown_secs: Option<f64>,

    /// Timer text: "02:05.3", "1:04:59", "KAYIT YAPILIYOR", ...
    pub display: String,

    /// Latest successful calibration
    pub calibration: Option<CalibrationResult>,

    /// True when the offset in use predates a failed calibration
    pub offset_stale: bool,

    pub trend: Option<Trend>,

    /// Result of the credential check run on entering token_check
    pub credential: Option<CredentialCheck>,

    pub acquire: Vec<ItemView>,
    pub release: Vec<ItemView>,

    /// Unix timestamp of last update
    pub updated_ts: u64,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus {
            phase: Phase::Idle,
            phase_label: Phase::Idle.label().to_string(),
            countdown_secs: None,
            display: String::new(),
            calibration: None,
            offset_stale: true,
            trend: None,
            credential: None,
            acquire: Vec::new(),
            release: Vec::new(),
            updated_ts: 0,
        }
    }
}

/// Phase label as shown above the timer. Outside a session it names the target.
pub fn describe_phase(phase: Phase, target: NaiveTime) -> String {
    match phase {
        Phase::Idle => format!("{} → {}", phase.label(), target.format("%H:%M:%S")),
        _ => phase.label().to_string(),
    }
}
