use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone};
use std::time::Duration;

use crate::phase::Phase;

pub const REGISTERING_TEXT: &str = "KAYIT YAPILIYOR";
pub const DONE_TEXT: &str = "TAMAMLANDI";

/// How long after the target a session may still start and fire at once.
pub const DEFAULT_LATE_GRACE_MS: i64 = 300_000;

/// Predictive remaining time, decremented locally between re-seeds.
///
/// Kept in integer microseconds so repeated ticks do not accumulate float
/// error. May go negative; display clamps, transitions use the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    remaining_us: i64,
}

impl Countdown {
    pub fn from_millis(ms: f64) -> Self {
        Countdown {
            remaining_us: (ms * 1000.0).round() as i64,
        }
    }

    pub fn from_secs(secs: f64) -> Self {
        Self::from_millis(secs * 1000.0)
    }

    pub fn tick(&mut self, elapsed: Duration) {
        let us = i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX);
        self.remaining_us = self.remaining_us.saturating_sub(us);
    }

    pub fn remaining_secs(&self) -> f64 {
        self.remaining_us as f64 / 1_000_000.0
    }

    pub fn remaining_ms(&self) -> i64 {
        self.remaining_us / 1000
    }

    /// Clamped at zero.
    pub fn display_secs(&self) -> f64 {
        self.remaining_secs().max(0.0)
    }

    /// Time left as a sleepable duration, zero once elapsed.
    pub fn remaining(&self) -> Duration {
        Duration::from_micros(self.remaining_us.max(0) as u64)
    }

    pub fn is_elapsed(&self) -> bool {
        self.remaining_us <= 0
    }
}

/// `H:MM:SS` while an hour or more remains, `MM:SS.d` on final approach.
pub fn format_remaining(remaining_ms: i64) -> String {
    let total = remaining_ms.max(0);
    let h = total / 3_600_000;
    let m = (total % 3_600_000) / 60_000;
    let s = (total % 60_000) / 1000;
    let tenths = (total % 1000) / 100;

    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}.{}", m, s, tenths)
    }
}

/// Operator-facing timer text for the current phase.
pub fn display(phase: Phase, countdown: Option<&Countdown>, target: NaiveTime) -> String {
    match countdown {
        Some(c) if !c.is_elapsed() => format_remaining(c.remaining_ms()),
        _ => match phase {
            Phase::Registering => REGISTERING_TEXT.to_string(),
            Phase::Done => DONE_TEXT.to_string(),
            _ => target.format("%H:%M:%S").to_string(),
        },
    }
}

/// Milliseconds from `local_now` until `target` on the server's clock, less the
/// arrival buffer.
///
/// The target resolves to its nearest occurrence on the server's calendar in
/// `local_now`'s time zone. An occurrence at most `late_grace_ms` behind counts
/// as already open and yields a negative value; anything older rolls to the
/// next day. `None` only when the target falls into a time-zone gap.
pub fn remaining_until<Tz: TimeZone>(
    target: NaiveTime,
    local_now: &DateTime<Tz>,
    offset_ms: f64,
    buffer_ms: f64,
    late_grace_ms: f64,
) -> Option<f64> {
    let server_now = local_now.clone() + ChronoDuration::microseconds((offset_ms * 1000.0).round() as i64);
    let today = server_now.date_naive();
    let until_on = |date: NaiveDate| -> Option<f64> {
        let server_target = local_now
            .timezone()
            .from_local_datetime(&date.and_time(target))
            .earliest()?;
        let until_us = (server_target - server_now.clone()).num_microseconds()?;
        Some(until_us as f64 / 1000.0)
    };

    let grace = late_grace_ms.max(0.0);
    let mut until = until_on(today)?;
    if until < -grace {
        until = until_on(today.succ_opt()?)?;
    } else if let Some(earlier) = today.pred_opt().and_then(until_on) {
        if earlier >= -grace {
            until = earlier;
        }
    }
    Some(until - buffer_ms)
}
