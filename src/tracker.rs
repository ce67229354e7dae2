//! Tracked course codes and the latest outcome observed for each of them.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const CODE_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackError {
    #[error("CRN must be exactly 5 digits (e.g. 12345), got {0:?}")]
    InvalidCode(String),
    #[error("CRN {code} is already in the {kind} list")]
    Duplicate { code: String, kind: ItemKind },
    #[error("lists cannot be edited while a session is active")]
    Frozen,
}

/// A 5-digit course registration number. Validated by shape only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CourseCode(String);

impl CourseCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CourseCode {
    type Err = TrackError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.len() == CODE_LEN && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Ok(CourseCode(trimmed.to_string()))
        } else {
            Err(TrackError::InvalidCode(raw.to_string()))
        }
    }
}

impl TryFrom<String> for CourseCode {
    type Error = TrackError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<CourseCode> for String {
    fn from(code: CourseCode) -> Self {
        code.0
    }
}

impl fmt::Display for CourseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Course to register for.
    Acquire,
    /// Course to drop.
    Release,
}

impl ItemKind {
    pub fn action(&self) -> &'static str {
        match self {
            ItemKind::Acquire => "add",
            ItemKind::Release => "drop",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Acquire => f.write_str("acquire"),
            ItemKind::Release => f.write_str("release"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackedItem {
    pub kind: ItemKind,
    pub code: CourseCode,
}

impl fmt::Display for TrackedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.action(), self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Pending,
    Success,
    Already,
    Full,
    Conflict,
    Upgrade,
    Debounce,
    Error,
    Dropped,
}

impl OutcomeStatus {
    /// Operator-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            OutcomeStatus::Pending => "Bekliyor",
            OutcomeStatus::Success => "Başarılı",
            OutcomeStatus::Already => "Kayıtlı",
            OutcomeStatus::Full => "Dolu",
            OutcomeStatus::Conflict => "Çakışma",
            OutcomeStatus::Upgrade => "Yükseltme",
            OutcomeStatus::Debounce => "Tekrar",
            OutcomeStatus::Error => "Hata",
            OutcomeStatus::Dropped => "Bırakıldı",
        }
    }
}

impl FromStr for OutcomeStatus {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        Ok(match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => OutcomeStatus::Pending,
            "success" => OutcomeStatus::Success,
            "already" => OutcomeStatus::Already,
            "full" => OutcomeStatus::Full,
            "conflict" => OutcomeStatus::Conflict,
            "upgrade" => OutcomeStatus::Upgrade,
            "debounce" => OutcomeStatus::Debounce,
            "error" => OutcomeStatus::Error,
            "dropped" => OutcomeStatus::Dropped,
            other => anyhow::bail!("unknown outcome status {:?}", other),
        })
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeStatus::Pending => "pending",
            OutcomeStatus::Success => "success",
            OutcomeStatus::Already => "already",
            OutcomeStatus::Full => "full",
            OutcomeStatus::Conflict => "conflict",
            OutcomeStatus::Upgrade => "upgrade",
            OutcomeStatus::Debounce => "debounce",
            OutcomeStatus::Error => "error",
            OutcomeStatus::Dropped => "dropped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub message: String,
}

impl Outcome {
    pub fn new(status: OutcomeStatus, message: impl Into<String>) -> Self {
        Outcome {
            status,
            message: message.into(),
        }
    }

    pub fn pending() -> Self {
        Outcome::new(OutcomeStatus::Pending, "")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialCheck {
    pub valid: bool,
    pub message: String,
}

/// One row of a list view: the code and its latest outcome (`pending` when none yet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemView {
    pub code: CourseCode,
    pub outcome: Outcome,
}

/// Per-session acquire/release lists plus the last-write-wins outcome map.
#[derive(Debug, Default, Clone)]
pub struct OutcomeTracker {
    acquire: Vec<CourseCode>,
    release: Vec<CourseCode>,
    outcomes: HashMap<CourseCode, Outcome>,
    frozen: bool,
}

impl OutcomeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn list_mut(&mut self, kind: ItemKind) -> &mut Vec<CourseCode> {
        match kind {
            ItemKind::Acquire => &mut self.acquire,
            ItemKind::Release => &mut self.release,
        }
    }

    fn list(&self, kind: ItemKind) -> &[CourseCode] {
        match kind {
            ItemKind::Acquire => &self.acquire,
            ItemKind::Release => &self.release,
        }
    }

    /// Append a code to a list. Rejects malformed codes and duplicates without changing state.
    pub fn add(&mut self, kind: ItemKind, raw: &str) -> Result<CourseCode, TrackError> {
        if self.frozen {
            return Err(TrackError::Frozen);
        }
        let code: CourseCode = raw.parse()?;
        let list = self.list_mut(kind);
        if list.contains(&code) {
            return Err(TrackError::Duplicate { code: code.0, kind });
        }
        list.push(code.clone());
        debug!("[TRACK] {} += {}", kind, code);
        Ok(code)
    }

    /// Remove a code. Idempotent: returns whether anything was removed.
    pub fn remove(&mut self, kind: ItemKind, code: &str) -> Result<bool, TrackError> {
        if self.frozen {
            return Err(TrackError::Frozen);
        }
        let code = code.trim();
        let list = self.list_mut(kind);
        let before = list.len();
        list.retain(|c| c.as_str() != code);
        Ok(list.len() != before)
    }

    pub fn contains(&self, kind: ItemKind, code: &CourseCode) -> bool {
        self.list(kind).contains(code)
    }

    pub fn len(&self, kind: ItemKind) -> usize {
        self.list(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        self.acquire.is_empty() && self.release.is_empty()
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Record the latest outcome for a code, replacing any earlier one.
    pub fn upsert(&mut self, code: &CourseCode, outcome: Outcome) {
        info!("[TRACK] {} -> {} {}", code, outcome.status, outcome.message);
        self.outcomes.insert(code.clone(), outcome);
    }

    pub fn outcome(&self, code: &CourseCode) -> Outcome {
        self.outcomes.get(code).cloned().unwrap_or_else(Outcome::pending)
    }

    pub fn list_for(&self, kind: ItemKind) -> Vec<ItemView> {
        self.list(kind)
            .iter()
            .map(|code| ItemView {
                code: code.clone(),
                outcome: self.outcome(code),
            })
            .collect()
    }

    /// All tracked items, acquire list first, each in insertion order.
    pub fn items(&self) -> Vec<TrackedItem> {
        let acquire = self.acquire.iter().map(|code| TrackedItem {
            kind: ItemKind::Acquire,
            code: code.clone(),
        });
        let release = self.release.iter().map(|code| TrackedItem {
            kind: ItemKind::Release,
            code: code.clone(),
        });
        acquire.chain(release).collect()
    }

    /// Session reset: outcomes cleared, lists kept and editable again.
    pub fn reset(&mut self) {
        self.outcomes.clear();
        self.frozen = false;
    }
}
