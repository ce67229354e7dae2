//! Offset-corrected countdown driving the session phase machine.
//!
//! The scheduler owns no timers. The caller feeds it elapsed time through
//! [`CountdownScheduler::advance`] and calibration results as they arrive;
//! it answers with phase changes.

use chrono::{DateTime, NaiveTime, TimeZone};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::calibration::CalibrationResult;
use crate::config::SessionConfig;
use crate::countdown::{self, remaining_until, Countdown, DEFAULT_LATE_GRACE_MS};
use crate::phase::{Phase, PhaseEvent, TransitionError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("target time {0} does not exist on the server's calendar day")]
    UnresolvableTarget(NaiveTime),
}

/// Best known server offset. Stale once a later calibration has failed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetEstimate {
    pub offset_ms: f64,
    pub accuracy_ms: Option<f64>,
    pub stale: bool,
}

impl OffsetEstimate {
    /// Server offset is authoritative; the NTP figures are diagnostics only.
    pub fn from_calibration(result: &CalibrationResult) -> Self {
        OffsetEstimate {
            offset_ms: result.server_offset_ms,
            accuracy_ms: Some(result.accuracy_ms),
            stale: false,
        }
    }

    /// Nothing measured yet: trust the local clock.
    pub fn unknown() -> Self {
        OffsetEstimate {
            offset_ms: 0.0,
            accuracy_ms: None,
            stale: true,
        }
    }
}

pub struct CountdownScheduler {
    phase: Phase,
    session: SessionConfig,
    token_check_lead_ms: i64,
    late_grace_ms: i64,
    countdown: Option<Countdown>,
    estimate: OffsetEstimate,
}

impl CountdownScheduler {
    pub fn new(session: SessionConfig, token_check_lead_ms: i64) -> Self {
        CountdownScheduler {
            phase: Phase::Idle,
            session: session.clamped(),
            token_check_lead_ms: token_check_lead_ms.max(0),
            late_grace_ms: DEFAULT_LATE_GRACE_MS,
            countdown: None,
            estimate: OffsetEstimate::unknown(),
        }
    }

    /// How far past the target a start still fires at once instead of
    /// waiting for the next day.
    pub fn with_late_grace(mut self, late_grace_ms: i64) -> Self {
        self.late_grace_ms = late_grace_ms.max(0);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    pub fn countdown(&self) -> Option<&Countdown> {
        self.countdown.as_ref()
    }

    pub fn estimate(&self) -> &OffsetEstimate {
        &self.estimate
    }

    pub fn display(&self) -> String {
        countdown::display(
            self.phase,
            self.countdown.as_ref(),
            self.session.target_time_of_day,
        )
    }

    fn apply(&mut self, event: PhaseEvent) -> Result<Phase, TransitionError> {
        let next = self.phase.next(event)?;
        info!("[SCHED] {} -> {} ({:?})", self.phase, next, event);
        self.phase = next;
        Ok(next)
    }

    /// idle -> waiting, seeding the countdown from `estimate` (or the local
    /// clock when nothing has been measured yet).
    pub fn start<Tz: TimeZone>(
        &mut self,
        local_now: &DateTime<Tz>,
        estimate: Option<OffsetEstimate>,
    ) -> Result<(), SchedulerError> {
        if self.phase != Phase::Idle {
            return Err(TransitionError {
                from: self.phase,
                event: PhaseEvent::SessionStarted,
            }
            .into());
        }
        self.estimate = estimate.unwrap_or_else(OffsetEstimate::unknown);
        let remaining = self.target_remaining_ms(local_now)?;
        self.apply(PhaseEvent::SessionStarted)?;
        self.countdown = Some(Countdown::from_millis(remaining));
        if remaining <= 0.0 {
            warn!("[SCHED] Target {} already passed, firing immediately", self.session.target_time_of_day);
        }
        Ok(())
    }

    fn target_remaining_ms<Tz: TimeZone>(&self, local_now: &DateTime<Tz>) -> Result<f64, SchedulerError> {
        remaining_until(
            self.session.target_time_of_day,
            local_now,
            self.estimate.offset_ms,
            self.session.arrival_buffer_ms,
            self.late_grace_ms as f64,
        )
        .ok_or(SchedulerError::UnresolvableTarget(self.session.target_time_of_day))
    }

    /// waiting -> calibrating. The countdown keeps running.
    pub fn begin_calibration(&mut self) -> Result<(), TransitionError> {
        self.apply(PhaseEvent::CalibrationStarted).map(|_| ())
    }

    /// calibrating -> waiting with a fresh offset; the countdown jumps to the
    /// corrected value without restarting the wait.
    pub fn apply_calibration<Tz: TimeZone>(
        &mut self,
        result: &CalibrationResult,
        local_now: &DateTime<Tz>,
    ) -> Result<(), SchedulerError> {
        self.apply(PhaseEvent::CalibrationEnded)?;
        self.estimate = OffsetEstimate::from_calibration(result);
        let remaining = self.target_remaining_ms(local_now)?;

        if let Some(prev) = self.countdown {
            let jump = remaining - prev.remaining_secs() * 1000.0;
            info!(
                "[SCHED] Re-seeded: {:.1}s remaining (jump {:+.1}ms, ±{:.1}ms)",
                remaining / 1000.0,
                jump,
                result.accuracy_ms
            );
        }
        self.countdown = Some(Countdown::from_millis(remaining));
        Ok(())
    }

    /// calibrating -> waiting keeping the last-known-good offset, now stale.
    pub fn calibration_failed(&mut self) -> Result<(), TransitionError> {
        self.apply(PhaseEvent::CalibrationEnded)?;
        self.estimate.stale = true;
        warn!(
            "[SCHED] Keeping previous offset {:+.1}ms (stale)",
            self.estimate.offset_ms
        );
        Ok(())
    }

    /// A calibration still running when the token window opens must give way.
    pub fn calibration_overdue(&self) -> bool {
        self.phase == Phase::Calibrating && self.in_token_window()
    }

    fn in_token_window(&self) -> bool {
        self.countdown
            .map_or(false, |c| c.remaining_ms() <= self.token_check_lead_ms)
    }

    /// Move the countdown forward and take whatever transition it triggers.
    /// Returns the new phase when it changed.
    pub fn advance(&mut self, elapsed: Duration) -> Option<Phase> {
        if !self.phase.is_counting() {
            return None;
        }
        let countdown = self.countdown.as_mut()?;
        countdown.tick(elapsed);
        let elapsed_out = countdown.is_elapsed();

        let event = match self.phase {
            Phase::Waiting if elapsed_out => PhaseEvent::TargetReached,
            Phase::Waiting if self.in_token_window() => PhaseEvent::TokenWindowOpened,
            Phase::TokenCheck if elapsed_out => PhaseEvent::TargetReached,
            _ => return None,
        };
        self.apply(event).ok()
    }

    /// Time until the next instant the scheduler needs to look at the clock.
    pub fn next_wake(&self, tick: Duration) -> Duration {
        match self.countdown {
            Some(c) if self.phase.is_counting() => {
                let remaining = c.remaining();
                if remaining.is_zero() {
                    Duration::ZERO
                } else {
                    remaining.min(tick)
                }
            }
            _ => tick,
        }
    }

    /// registering -> done once every item is settled.
    pub fn settle(&mut self) -> Result<(), TransitionError> {
        self.apply(PhaseEvent::AttemptsSettled).map(|_| ())
    }

    /// Teardown from any phase. The offset estimate survives for the next session.
    pub fn stop(&mut self) {
        if self.phase != Phase::Idle {
            let _ = self.apply(PhaseEvent::Stopped);
        }
        self.countdown = None;
    }
}
