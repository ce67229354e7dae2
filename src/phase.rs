//! Session phases and the transition table between them.
//!
//! Transitions are a pure function of (phase, event). Anything not listed in
//! [`Phase::next`] is rejected and leaves the caller's phase untouched.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Waiting,
    Calibrating,
    TokenCheck,
    Registering,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseEvent {
    SessionStarted,
    CalibrationStarted,
    /// Calibration finished, failed, or was abandoned; all return to waiting.
    CalibrationEnded,
    TokenWindowOpened,
    TargetReached,
    AttemptsSettled,
    /// Teardown or reset. Valid from every phase.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no transition from {from} on {event:?}")]
pub struct TransitionError {
    pub from: Phase,
    pub event: PhaseEvent,
}

impl Phase {
    pub fn next(self, event: PhaseEvent) -> Result<Phase, TransitionError> {
        use Phase::*;
        use PhaseEvent::*;

        let to = match (self, event) {
            (_, Stopped) => Idle,
            (Idle, SessionStarted) => Waiting,
            (Waiting, CalibrationStarted) => Calibrating,
            (Calibrating, CalibrationEnded) => Waiting,
            (Waiting, TokenWindowOpened) => TokenCheck,
            (Waiting, TargetReached) | (TokenCheck, TargetReached) => Registering,
            (Registering, AttemptsSettled) => Done,
            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(to)
    }

    /// Phases in which the countdown ticks.
    pub fn is_counting(&self) -> bool {
        matches!(self, Phase::Waiting | Phase::Calibrating | Phase::TokenCheck)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Phase::Waiting | Phase::Calibrating | Phase::TokenCheck => "Kayıt saatine kalan",
            Phase::Registering => "Kayıt devam ediyor",
            Phase::Done => "Tamamlandı",
            Phase::Idle => "Hedef",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Waiting => "waiting",
            Phase::Calibrating => "calibrating",
            Phase::TokenCheck => "token_check",
            Phase::Registering => "registering",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}
