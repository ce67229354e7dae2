//! Clock calibration against the registration server and an NTP reference.
//!
//! Each server exchange yields the classic four timestamps:
//! - t0: local send, t1: server receive, t2: server send, t3: local receive
//! - rtt = t3 - t0
//! - offset = ((t1 - t0) + (t2 - t3)) / 2
//! - accuracy = rtt / 2 (true offset lies within +-accuracy if latency is symmetric)
//!
//! Several exchanges are made and the one with the smallest round trip wins.
//! One-way latency comes from a separate ping with no server-side work, so
//! server processing time does not inflate it.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::CalibrationConfig;
use crate::traits::{epoch_ms, NtpSample, NtpSource, ServerProbe, WallClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Server,
    Ping,
    Reference,
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Server => f.write_str("server"),
            Probe::Ping => f.write_str("ping"),
            Probe::Reference => f.write_str("reference"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("{probe} probe timed out after {timeout_ms}ms")]
    Timeout { probe: Probe, timeout_ms: u64 },
    #[error("{probe} probe failed: {reason}")]
    Network { probe: Probe, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationResult {
    /// server - local
    pub server_offset_ms: f64,
    pub rtt_full_ms: f64,
    pub rtt_one_way_ms: f64,
    /// reference - local
    pub ntp_offset_ms: f64,
    pub server_ntp_diff_ms: f64,
    /// Half-width of the confidence interval around `server_offset_ms`.
    pub accuracy_ms: f64,
    pub measured_at_ms: i64,
}

impl CalibrationResult {
    /// One line for the operator, offsets signed.
    pub fn summary(&self) -> String {
        format!(
            "offset {:+.0}ms  rtt {:.0}ms  one-way {:.1}ms  ntp {:+.0}ms  server-ntp {:+.0}ms  accuracy ±{:.1}ms",
            self.server_offset_ms,
            self.rtt_full_ms,
            self.rtt_one_way_ms,
            self.ntp_offset_ms,
            self.server_ntp_diff_ms,
            self.accuracy_ms
        )
    }
}

/// Offset and round trip derived from one four-timestamp exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exchange {
    pub offset_ms: f64,
    pub rtt_ms: f64,
}

impl Exchange {
    pub fn from_timestamps(t0: f64, t1: f64, t2: f64, t3: f64) -> Self {
        Exchange {
            offset_ms: ((t1 - t0) + (t2 - t3)) / 2.0,
            // A local clock step mid-exchange can make this negative
            rtt_ms: (t3 - t0).max(0.0),
        }
    }

    pub fn accuracy_ms(&self) -> f64 {
        self.rtt_ms / 2.0
    }
}

pub struct CalibrationEngine<P, N, C> {
    probe: Arc<P>,
    ntp: Arc<N>,
    clock: Arc<C>,
    config: CalibrationConfig,
}

impl<P, N, C> CalibrationEngine<P, N, C>
where
    P: ServerProbe + 'static,
    N: NtpSource + 'static,
    C: WallClock + 'static,
{
    pub fn new(probe: Arc<P>, ntp: Arc<N>, clock: Arc<C>, config: CalibrationConfig) -> Self {
        CalibrationEngine {
            probe,
            ntp,
            clock,
            config,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.probe_timeout_ms)
    }

    fn timed_out(&self, probe: Probe) -> CalibrationError {
        CalibrationError::Timeout {
            probe,
            timeout_ms: self.config.probe_timeout_ms,
        }
    }

    /// Run one full calibration. Never retries internally; the caller decides.
    pub async fn calibrate(&self) -> Result<CalibrationResult, CalibrationError> {
        let exchange = self.best_server_exchange().await?;
        let one_way_ms = self.one_way_latency().await?;
        let reference = self.reference_sample().await?;

        let result = CalibrationResult {
            server_offset_ms: exchange.offset_ms,
            rtt_full_ms: exchange.rtt_ms,
            rtt_one_way_ms: one_way_ms,
            ntp_offset_ms: reference.offset_ms,
            server_ntp_diff_ms: exchange.offset_ms - reference.offset_ms,
            accuracy_ms: exchange.accuracy_ms(),
            measured_at_ms: self.clock.now().timestamp_millis(),
        };

        info!("[CAL] {}", result.summary());
        if result.server_ntp_diff_ms.abs() > self.config.server_ntp_warn_ms {
            warn!(
                "[CAL] Server clock disagrees with NTP reference by {:+.0}ms",
                result.server_ntp_diff_ms
            );
        }

        Ok(result)
    }

    /// Minimum-RTT exchange out of `samples` attempts. Individual failures are
    /// tolerated as long as one exchange completes.
    async fn best_server_exchange(&self) -> Result<Exchange, CalibrationError> {
        let mut best: Option<Exchange> = None;
        let mut last_err = None;

        for i in 0..self.config.samples.max(1) {
            match self.server_exchange().await {
                Ok(exchange) => {
                    debug!(
                        "[CAL] Exchange {}: offset {:+.2}ms rtt {:.2}ms",
                        i, exchange.offset_ms, exchange.rtt_ms
                    );
                    if best.map_or(true, |b| exchange.rtt_ms < b.rtt_ms) {
                        best = Some(exchange);
                    }
                }
                Err(e) => {
                    debug!("[CAL] Exchange {} failed: {}", i, e);
                    last_err = Some(e);
                }
            }
        }

        match (best, last_err) {
            (Some(exchange), _) => Ok(exchange),
            (None, Some(e)) => Err(e),
            (None, None) => Err(CalibrationError::Network {
                probe: Probe::Server,
                reason: "no exchanges attempted".to_string(),
            }),
        }
    }

    async fn server_exchange(&self) -> Result<Exchange, CalibrationError> {
        let t0 = epoch_ms(&self.clock.now());
        let stamp = tokio::time::timeout(self.timeout(), self.probe.server_time())
            .await
            .map_err(|_| self.timed_out(Probe::Server))?
            .map_err(|e| CalibrationError::Network {
                probe: Probe::Server,
                reason: e.to_string(),
            })?;
        let t3 = epoch_ms(&self.clock.now());

        Ok(Exchange::from_timestamps(
            t0,
            stamp.receive_ms,
            stamp.transmit_ms,
            t3,
        ))
    }

    async fn one_way_latency(&self) -> Result<f64, CalibrationError> {
        let mut best: Option<f64> = None;
        let mut last_err = None;

        for _ in 0..self.config.ping_samples.max(1) {
            let start = epoch_ms(&self.clock.now());
            let res = tokio::time::timeout(self.timeout(), self.probe.ping()).await;
            let end = epoch_ms(&self.clock.now());

            match res {
                Ok(Ok(())) => {
                    let rtt = (end - start).max(0.0);
                    if best.map_or(true, |b| rtt < b) {
                        best = Some(rtt);
                    }
                }
                Ok(Err(e)) => {
                    last_err = Some(CalibrationError::Network {
                        probe: Probe::Ping,
                        reason: e.to_string(),
                    })
                }
                Err(_) => last_err = Some(self.timed_out(Probe::Ping)),
            }
        }

        match (best, last_err) {
            (Some(rtt), _) => Ok(rtt / 2.0),
            (None, Some(e)) => Err(e),
            (None, None) => Err(CalibrationError::Network {
                probe: Probe::Ping,
                reason: "no pings attempted".to_string(),
            }),
        }
    }

    /// The NTP client is blocking, so it runs on the blocking pool.
    async fn reference_sample(&self) -> Result<NtpSample, CalibrationError> {
        let ntp = self.ntp.clone();
        let task = tokio::task::spawn_blocking(move || ntp.sample());

        match tokio::time::timeout(self.timeout(), task).await {
            Err(_) => Err(self.timed_out(Probe::Reference)),
            Ok(Err(join_err)) => Err(CalibrationError::Network {
                probe: Probe::Reference,
                reason: join_err.to_string(),
            }),
            Ok(Ok(Err(e))) => Err(CalibrationError::Network {
                probe: Probe::Reference,
                reason: e.to_string(),
            }),
            Ok(Ok(Ok(sample))) => Ok(sample),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockNtpSource, MockWallClock, ServerStamp};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;

    struct ScriptedProbe {
        stamps: Mutex<Vec<Result<ServerStamp>>>,
        ping_fails: bool,
    }

    impl ScriptedProbe {
        fn new(stamps: Vec<Result<ServerStamp>>) -> Self {
            ScriptedProbe {
                stamps: Mutex::new(stamps),
                ping_fails: false,
            }
        }
    }

    #[async_trait]
    impl ServerProbe for ScriptedProbe {
        async fn server_time(&self) -> Result<ServerStamp> {
            let mut stamps = self.stamps.lock().unwrap();
            if stamps.is_empty() {
                return Err(anyhow!("no more stamps"));
            }
            stamps.remove(0)
        }

        async fn ping(&self) -> Result<()> {
            if self.ping_fails {
                Err(anyhow!("connection refused"))
            } else {
                Ok(())
            }
        }
    }

    fn at_ms(ms: f64) -> DateTime<Utc> {
        Utc.timestamp_nanos((ms * 1_000_000.0) as i64)
    }

    /// Clock that returns the given instants in order.
    fn scripted_clock(times_ms: Vec<f64>) -> MockWallClock {
        let mut times = times_ms.into_iter();
        let mut clock = MockWallClock::new();
        clock
            .expect_now()
            .returning(move || at_ms(times.next().unwrap_or(0.0)));
        clock
    }

    fn config(samples: usize, ping_samples: usize) -> CalibrationConfig {
        CalibrationConfig {
            samples,
            ping_samples,
            ..CalibrationConfig::default()
        }
    }

    fn stamp(receive_ms: f64, transmit_ms: f64) -> Result<ServerStamp> {
        Ok(ServerStamp {
            receive_ms,
            transmit_ms,
        })
    }

    #[test]
    fn test_exchange_formula() {
        // Server 12ms ahead, 20ms each way, no processing
        let ex = Exchange::from_timestamps(1000.0, 1032.0, 1032.0, 1040.0);
        assert_eq!(ex.offset_ms, 12.0);
        assert_eq!(ex.rtt_ms, 40.0);
        assert_eq!(ex.accuracy_ms(), 20.0);
    }

    #[test]
    fn test_exchange_negative_offset() {
        // Server 30ms behind
        let ex = Exchange::from_timestamps(1000.0, 980.0, 985.0, 1020.0);
        assert_eq!(ex.offset_ms, -27.5);
        assert_eq!(ex.rtt_ms, 20.0);
    }

    #[tokio::test]
    async fn test_calibrate_full_result() {
        let _ = env_logger::builder().is_test(true).try_init();

        let probe = ScriptedProbe::new(vec![stamp(1032.0, 1032.0)]);
        // t0, t3, ping start, ping end, measured_at
        let clock = scripted_clock(vec![1000.0, 1040.0, 2000.0, 2037.0, 2040.0]);
        let mut ntp = MockNtpSource::new();
        ntp.expect_sample().times(1).returning(|| {
            Ok(NtpSample {
                offset_ms: 10.0,
                round_trip_ms: 30.0,
            })
        });

        let engine = CalibrationEngine::new(
            Arc::new(probe),
            Arc::new(ntp),
            Arc::new(clock),
            config(1, 1),
        );
        let result = engine.calibrate().await.unwrap();

        assert_eq!(result.server_offset_ms, 12.0);
        assert_eq!(result.rtt_full_ms, 40.0);
        assert_eq!(result.rtt_one_way_ms, 18.5);
        assert_eq!(result.ntp_offset_ms, 10.0);
        assert_eq!(result.server_ntp_diff_ms, 2.0);
        assert_eq!(result.accuracy_ms, 20.0);
        assert_eq!(result.measured_at_ms, 2040);
    }

    #[tokio::test]
    async fn test_minimum_rtt_exchange_wins() {
        let probe = ScriptedProbe::new(vec![
            stamp(1060.0, 1060.0),    // rtt 100, offset 10
            stamp(2015.0, 2015.0),    // rtt 20, offset 5
            Err(anyhow!("reset")),    // ignored
        ]);
        let clock = scripted_clock(vec![
            1000.0, 1100.0, // exchange 1
            2000.0, 2020.0, // exchange 2
            3000.0,         // exchange 3 fails before t3
            4000.0, 4010.0, // ping
            4010.0,
        ]);
        let mut ntp = MockNtpSource::new();
        ntp.expect_sample().returning(|| {
            Ok(NtpSample {
                offset_ms: 0.0,
                round_trip_ms: 10.0,
            })
        });

        let engine = CalibrationEngine::new(
            Arc::new(probe),
            Arc::new(ntp),
            Arc::new(clock),
            config(3, 1),
        );
        let result = engine.calibrate().await.unwrap();

        assert_eq!(result.rtt_full_ms, 20.0);
        assert_eq!(result.server_offset_ms, 5.0);
        assert_eq!(result.accuracy_ms, 10.0);
        assert_eq!(result.rtt_one_way_ms, 5.0);
    }

    #[tokio::test]
    async fn test_server_unreachable_is_network_error() {
        let probe = ScriptedProbe::new(vec![Err(anyhow!("unreachable"))]);
        let clock = scripted_clock(vec![0.0; 4]);
        let ntp = MockNtpSource::new();

        let engine = CalibrationEngine::new(
            Arc::new(probe),
            Arc::new(ntp),
            Arc::new(clock),
            config(1, 1),
        );
        let err = engine.calibrate().await.unwrap_err();

        assert!(matches!(
            err,
            CalibrationError::Network {
                probe: Probe::Server,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ping_failure_fails_calibration() {
        let mut probe = ScriptedProbe::new(vec![stamp(10.0, 10.0)]);
        probe.ping_fails = true;
        let clock = scripted_clock(vec![0.0, 20.0, 30.0, 40.0]);
        let ntp = MockNtpSource::new();

        let engine = CalibrationEngine::new(
            Arc::new(probe),
            Arc::new(ntp),
            Arc::new(clock),
            config(1, 1),
        );
        let err = engine.calibrate().await.unwrap_err();
        assert!(matches!(err, CalibrationError::Network { probe: Probe::Ping, .. }));
    }

    #[tokio::test]
    async fn test_reference_failure_fails_calibration() {
        let probe = ScriptedProbe::new(vec![stamp(10.0, 10.0)]);
        let clock = scripted_clock(vec![0.0, 20.0, 30.0, 40.0]);
        let mut ntp = MockNtpSource::new();
        ntp.expect_sample()
            .returning(|| Err(anyhow!("ntp server unreachable")));

        let engine = CalibrationEngine::new(
            Arc::new(probe),
            Arc::new(ntp),
            Arc::new(clock),
            config(1, 1),
        );
        let err = engine.calibrate().await.unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::Network {
                probe: Probe::Reference,
                ..
            }
        ));
        assert!(err.to_string().contains("ntp server unreachable"));
    }

    struct HangingProbe;

    #[async_trait]
    impl ServerProbe for HangingProbe {
        async fn server_time(&self) -> Result<ServerStamp> {
            std::future::pending::<Result<ServerStamp>>().await
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_probe_times_out() {
        let clock = scripted_clock(vec![0.0; 4]);
        let ntp = MockNtpSource::new();

        let engine = CalibrationEngine::new(
            Arc::new(HangingProbe),
            Arc::new(ntp),
            Arc::new(clock),
            CalibrationConfig {
                samples: 1,
                probe_timeout_ms: 250,
                ..CalibrationConfig::default()
            },
        );
        let err = engine.calibrate().await.unwrap_err();
        assert_eq!(
            err,
            CalibrationError::Timeout {
                probe: Probe::Server,
                timeout_ms: 250
            }
        );
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = CalibrationResult {
            server_offset_ms: 12.0,
            rtt_full_ms: 40.0,
            rtt_one_way_ms: 18.5,
            ntp_offset_ms: 10.0,
            server_ntp_diff_ms: 2.0,
            accuracy_ms: 20.0,
            measured_at_ms: 0,
        };
        let json = serde_json::to_value(result).unwrap();
        assert_eq!(json["serverOffsetMs"], 12.0);
        assert_eq!(json["rttOneWayMs"], 18.5);
        assert!(result.summary().contains("±20.0ms"));
        assert!(result.summary().contains("offset +12ms"));
    }
}
