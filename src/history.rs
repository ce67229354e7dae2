//! Bounded, durable log of past calibrations and the short-term RTT trend.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::calibration::CalibrationResult;
use crate::traits::KeyValueStore;

pub const HISTORY_KEY: &str = "crnsync-cal-history";
pub const MAX_ENTRIES: usize = 10;

/// Changes in one-way RTT smaller than this read as stable.
const STABLE_BAND_MS: f64 = 1.0;

const SPARK_LEVELS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationEntry {
    pub timestamp: i64,
    pub server_offset_ms: f64,
    pub rtt_one_way_ms: f64,
}

impl From<&CalibrationResult> for CalibrationEntry {
    fn from(result: &CalibrationResult) -> Self {
        CalibrationEntry {
            timestamp: result.measured_at_ms,
            server_offset_ms: result.server_offset_ms,
            rtt_one_way_ms: result.rtt_one_way_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    /// Latency grew: degrading.
    Up,
    /// Latency shrank: improving.
    Down,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trend {
    pub direction: TrendDirection,
    pub delta_ms: f64,
}

impl Trend {
    pub fn between(prev_ms: f64, recent_ms: f64) -> Self {
        let delta_ms = recent_ms - prev_ms;
        let direction = if delta_ms.abs() < STABLE_BAND_MS {
            TrendDirection::Stable
        } else if delta_ms > 0.0 {
            TrendDirection::Up
        } else {
            TrendDirection::Down
        };
        Trend {
            direction,
            delta_ms,
        }
    }

    pub fn label(&self) -> String {
        match self.direction {
            TrendDirection::Stable => "Stabil".to_string(),
            _ => format!("{:+}ms", self.delta_ms.round() as i64),
        }
    }
}

pub struct CalibrationHistory {
    entries: VecDeque<CalibrationEntry>,
    store: Box<dyn KeyValueStore>,
}

impl CalibrationHistory {
    /// Load persisted history. Unreadable or malformed content yields an empty history.
    pub fn load(store: Box<dyn KeyValueStore>) -> Self {
        let entries = match store.get(HISTORY_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<CalibrationEntry>>(&raw) {
                Ok(list) => {
                    let skip = list.len().saturating_sub(MAX_ENTRIES);
                    list.into_iter().skip(skip).collect()
                }
                Err(e) => {
                    warn!("[HIST] Discarding malformed history: {}", e);
                    VecDeque::new()
                }
            },
            Ok(None) => VecDeque::new(),
            Err(e) => {
                warn!("[HIST] History unreadable, starting empty: {}", e);
                VecDeque::new()
            }
        };
        debug!("[HIST] Loaded {} entries", entries.len());

        CalibrationHistory { entries, store }
    }

    /// Append a result, evicting the oldest entry beyond capacity, and persist.
    /// Persistence failures are logged and otherwise ignored.
    pub fn record(&mut self, result: &CalibrationResult) {
        self.entries.push_back(CalibrationEntry::from(result));
        while self.entries.len() > MAX_ENTRIES {
            self.entries.pop_front();
        }

        let list: Vec<_> = self.entries.iter().copied().collect();
        match serde_json::to_string(&list) {
            Ok(json) => {
                if let Err(e) = self.store.set(HISTORY_KEY, &json) {
                    warn!("[HIST] Failed to persist history: {}", e);
                }
            }
            Err(e) => warn!("[HIST] Failed to encode history: {}", e),
        }
    }

    /// Compares the one-way RTT of the last two entries. `None` with fewer than two.
    pub fn trend(&self) -> Option<Trend> {
        let n = self.entries.len();
        if n < 2 {
            return None;
        }
        Some(Trend::between(
            self.entries[n - 2].rtt_one_way_ms,
            self.entries[n - 1].rtt_one_way_ms,
        ))
    }

    pub fn entries(&self) -> impl Iterator<Item = &CalibrationEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&CalibrationEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn offset_series(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.server_offset_ms).collect()
    }

    pub fn rtt_series(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.rtt_one_way_ms).collect()
    }
}

/// Text sparkline scaled to the series' own min/max. Empty below two points.
pub fn sparkline(values: &[f64]) -> String {
    if values.len() < 2 {
        return String::new();
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = if max - min > 0.0 { max - min } else { 1.0 };
    let top = (SPARK_LEVELS.len() - 1) as f64;

    values
        .iter()
        .map(|v| {
            let level = (((v - min) / range) * top).round() as usize;
            SPARK_LEVELS[level.min(SPARK_LEVELS.len() - 1)]
        })
        .collect()
}
