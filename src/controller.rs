//! Session controller - drives one registration session end to end
//!
//! A single cooperative loop owns the countdown:
//! 1. **Waiting**: ticks the countdown, runs calibrations beside it and
//!    re-seeds the target whenever one lands
//! 2. **Token check**: a short window before zero in which the credential is
//!    tested; any calibration still running is abandoned
//! 3. **Registering**: hands the tracked items to the attempt coordinator
//!
//! Network work always runs on spawned tasks so it never stalls a tick.

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Local};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::calibration::{CalibrationEngine, CalibrationError, CalibrationResult};
use crate::config::{SchedulerConfig, SessionConfig};
use crate::coordinator::{AttemptCoordinator, ItemSummary};
use crate::history::CalibrationHistory;
use crate::phase::Phase;
use crate::scheduler::{CountdownScheduler, OffsetEstimate};
use crate::shutdown::Shutdown;
use crate::status::{describe_phase, SessionStatus};
use crate::tracker::{CredentialCheck, ItemKind, Outcome, OutcomeTracker, TrackedItem};
use crate::traits::{NtpSource, RegistrationTransport, ServerProbe, WallClock};

type CalibrationTask = JoinHandle<Result<CalibrationResult, CalibrationError>>;
type CredentialTask = JoinHandle<Result<CredentialCheck>>;

/// What a finished (or torn down) session leaves behind.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub final_phase: Phase,
    pub cancelled: bool,
    pub calibration: Option<CalibrationResult>,
    pub offset_stale: bool,
    pub credential: Option<CredentialCheck>,
    pub items: Vec<ItemSummary>,
}

enum Wake {
    Tick,
    Calibrated(Result<Result<CalibrationResult, CalibrationError>, JoinError>),
    Credential(Result<Result<CredentialCheck>, JoinError>),
    Shutdown,
}

/// Completes with the task's output, or never when there is no task.
async fn join_task<R>(task: &mut Option<JoinHandle<R>>) -> Result<R, JoinError> {
    match task.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

pub struct SessionController<P, N, C, T> {
    engine: Arc<CalibrationEngine<P, N, C>>,
    clock: Arc<C>,
    history: Arc<Mutex<CalibrationHistory>>,
    tracker: Arc<RwLock<OutcomeTracker>>,
    transport: Arc<T>,
    config: SchedulerConfig,
    zone: FixedOffset,

    // Carried across sessions
    last_calibration: Option<CalibrationResult>,
    estimate: Option<OffsetEstimate>,

    credential: Option<CredentialCheck>,

    // Shared snapshot for presentation
    status_shared: Arc<RwLock<SessionStatus>>,
}

impl<P, N, C, T> SessionController<P, N, C, T>
where
    P: ServerProbe + 'static,
    N: NtpSource + 'static,
    C: WallClock + 'static,
    T: RegistrationTransport + 'static,
{
    pub fn new(
        engine: CalibrationEngine<P, N, C>,
        clock: Arc<C>,
        history: CalibrationHistory,
        tracker: Arc<RwLock<OutcomeTracker>>,
        transport: Arc<T>,
        status_shared: Arc<RwLock<SessionStatus>>,
        config: SchedulerConfig,
    ) -> Self {
        SessionController {
            engine: Arc::new(engine),
            clock,
            history: Arc::new(Mutex::new(history)),
            tracker,
            transport,
            config,
            zone: *Local::now().offset(),
            last_calibration: None,
            estimate: None,
            credential: None,
            status_shared,
        }
    }

    /// Time zone the target time of day is read in. Defaults to the local one.
    pub fn with_zone(mut self, zone: FixedOffset) -> Self {
        self.zone = zone;
        self
    }

    pub fn get_status_shared(&self) -> Arc<RwLock<SessionStatus>> {
        self.status_shared.clone()
    }

    pub fn history(&self) -> Arc<Mutex<CalibrationHistory>> {
        self.history.clone()
    }

    pub fn tracker(&self) -> Arc<RwLock<OutcomeTracker>> {
        self.tracker.clone()
    }

    pub fn last_calibration(&self) -> Option<&CalibrationResult> {
        self.last_calibration.as_ref()
    }

    fn local_now(&self) -> DateTime<FixedOffset> {
        self.clock.now().with_timezone(&self.zone)
    }

    /// Standalone calibration outside a session. Success is recorded in the
    /// history and becomes the offset the next session starts from.
    pub async fn calibrate_once(&mut self) -> Result<CalibrationResult, CalibrationError> {
        let result = self.engine.calibrate().await?;
        self.accept_calibration(&result);
        Ok(result)
    }

    pub async fn check_credential(&mut self) -> CredentialCheck {
        let check = match self.transport.test_credential().await {
            Ok(check) => check,
            Err(e) => CredentialCheck {
                valid: false,
                message: e.to_string(),
            },
        };
        self.log_credential(&check);
        self.credential = Some(check.clone());
        check
    }

    fn accept_calibration(&mut self, result: &CalibrationResult) {
        if let Ok(mut history) = self.history.lock() {
            history.record(result);
        }
        self.last_calibration = Some(*result);
        self.estimate = Some(OffsetEstimate::from_calibration(result));
    }

    fn log_credential(&self, check: &CredentialCheck) {
        if check.valid {
            info!("[TOKEN] Credential valid {}", check.message);
        } else {
            warn!("[TOKEN] Credential rejected: {}", check.message);
        }
    }

    /// Run one session: count down to the corrected target, then fire every
    /// tracked item. Returns early, with the lists unfrozen, on teardown.
    pub async fn run(&mut self, session: SessionConfig, mut shutdown: Shutdown) -> Result<SessionReport> {
        let items = match self.tracker.write() {
            Ok(mut tracker) => {
                tracker.freeze();
                tracker.items()
            }
            Err(_) => anyhow::bail!("tracked item lists are unavailable"),
        };
        if items.is_empty() {
            warn!("[SESSION] No tracked items, the session will only count down");
        }
        self.credential = None;

        let grace_ms = i64::try_from(self.config.late_start_grace_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let mut sched = CountdownScheduler::new(session, self.config.token_check_lead_ms).with_late_grace(grace_ms);
        sched.start(&self.local_now(), self.estimate)?;
        info!(
            "[SESSION] Target {} in {} ({} item(s))",
            sched.session().target_time_of_day,
            sched.display(),
            items.len()
        );
        self.publish(&sched);

        let tick = Duration::from_millis(self.config.tick_ms.max(1));
        let recalibrate_every = Duration::from_secs(self.config.recalibrate_every_secs.max(1));
        let final_lead_ms =
            i64::try_from(self.config.final_calibration_lead_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let token_lead_ms = self.config.token_check_lead_ms;

        let mut calibration: Option<CalibrationTask> = None;
        let mut credential: Option<CredentialTask> = None;
        let mut next_calibration = Instant::now();
        let mut final_calibration_done = false;
        let mut last = Instant::now();

        loop {
            // Calibrations only start from waiting, and never inside the token window
            if calibration.is_none() && sched.phase() == Phase::Waiting {
                let remaining_ms = sched.countdown().map_or(0, |c| c.remaining_ms());
                if remaining_ms > token_lead_ms {
                    let final_due = !final_calibration_done && remaining_ms <= final_lead_ms;
                    if final_due || Instant::now() >= next_calibration {
                        final_calibration_done |= final_due;
                        sched.begin_calibration()?;
                        let engine = self.engine.clone();
                        calibration = Some(tokio::spawn(async move { engine.calibrate().await }));
                        next_calibration = Instant::now() + recalibrate_every;
                        self.publish(&sched);
                    }
                }
            }

            let wake = tokio::select! {
                _ = tokio::time::sleep(sched.next_wake(tick)) => Wake::Tick,
                joined = join_task(&mut calibration) => Wake::Calibrated(joined),
                joined = join_task(&mut credential) => Wake::Credential(joined),
                _ = shutdown.cancelled() => Wake::Shutdown,
            };

            let now = Instant::now();
            let mut changes: Vec<Phase> = sched.advance(now - last).into_iter().collect();
            last = now;

            match wake {
                Wake::Tick => {}
                Wake::Calibrated(joined) => {
                    calibration = None;
                    self.finish_calibration(&mut sched, joined)?;
                }
                Wake::Credential(joined) => {
                    credential = None;
                    let check = match joined {
                        Ok(Ok(check)) => check,
                        Ok(Err(e)) => CredentialCheck {
                            valid: false,
                            message: e.to_string(),
                        },
                        Err(e) => CredentialCheck {
                            valid: false,
                            message: e.to_string(),
                        },
                    };
                    self.log_credential(&check);
                    self.credential = Some(check);
                }
                Wake::Shutdown => {
                    info!("[SESSION] Teardown requested in {}", sched.phase());
                    if let Some(task) = calibration.take() {
                        task.abort();
                    }
                    if let Some(task) = credential.take() {
                        task.abort();
                    }
                    let pending = items.into_iter().map(Self::untouched).collect();
                    return Ok(self.teardown(&mut sched, pending));
                }
            }

            if sched.calibration_overdue() {
                if let Some(task) = calibration.take() {
                    task.abort();
                }
                warn!("[SESSION] Calibration still running at the token window, abandoning it");
                sched.calibration_failed()?;
                self.mark_stale();
            }
            changes.extend(sched.advance(Duration::ZERO));

            for phase in changes {
                if phase == Phase::TokenCheck && credential.is_none() {
                    debug!("[TOKEN] Checking credential");
                    let transport = self.transport.clone();
                    credential = Some(tokio::spawn(async move { transport.test_credential().await }));
                }
            }

            self.publish(&sched);
            if sched.phase() == Phase::Registering {
                break;
            }
        }

        if let Some(task) = credential.take() {
            debug!("[TOKEN] Credential check still running at zero, dropping it");
            task.abort();
        }

        let session = sched.session().clone();
        let coordinator = AttemptCoordinator::new(self.transport.clone(), self.tracker.clone());
        let attempts = coordinator.run(items, &session, shutdown.clone());
        tokio::pin!(attempts);
        let summaries = loop {
            tokio::select! {
                summaries = &mut attempts => break summaries,
                _ = tokio::time::sleep(tick) => self.publish(&sched),
            }
        };

        if shutdown.is_fired() {
            return Ok(self.teardown(&mut sched, summaries));
        }

        sched.settle()?;
        self.publish(&sched);

        let settled = summaries.iter().filter(|s| !s.exhausted).count();
        info!(
            "[SESSION] Done: {}/{} item(s) settled, {} exhausted",
            settled,
            summaries.len(),
            summaries.len() - settled
        );
        Ok(self.report(&sched, false, summaries))
    }

    fn finish_calibration(
        &mut self,
        sched: &mut CountdownScheduler,
        joined: Result<Result<CalibrationResult, CalibrationError>, JoinError>,
    ) -> Result<()> {
        let failure = match joined {
            Ok(Ok(result)) => {
                self.accept_calibration(&result);
                if sched.phase() == Phase::Calibrating {
                    sched.apply_calibration(&result, &self.local_now())?;
                }
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };

        warn!("[CAL] Calibration failed: {}", failure);
        if sched.phase() == Phase::Calibrating {
            sched.calibration_failed()?;
        }
        self.mark_stale();
        Ok(())
    }

    fn mark_stale(&mut self) {
        if let Some(estimate) = self.estimate.as_mut() {
            estimate.stale = true;
        }
    }

    fn untouched(item: TrackedItem) -> ItemSummary {
        ItemSummary {
            item,
            attempts: 0,
            outcome: Outcome::pending(),
            exhausted: false,
            cancelled: true,
        }
    }

    fn teardown(&mut self, sched: &mut CountdownScheduler, items: Vec<ItemSummary>) -> SessionReport {
        sched.stop();
        if let Ok(mut tracker) = self.tracker.write() {
            tracker.unfreeze();
        }
        self.publish(sched);
        self.report(sched, true, items)
    }

    fn report(&self, sched: &CountdownScheduler, cancelled: bool, items: Vec<ItemSummary>) -> SessionReport {
        SessionReport {
            final_phase: sched.phase(),
            cancelled,
            calibration: self.last_calibration,
            offset_stale: sched.estimate().stale,
            credential: self.credential.clone(),
            items,
        }
    }

    /// Clear outcomes and the credential result. Lists and history are kept.
    pub fn reset(&mut self) {
        if let Ok(mut tracker) = self.tracker.write() {
            tracker.reset();
        }
        self.credential = None;

        let trend = self.history.lock().ok().and_then(|h| h.trend());
        if let Ok(mut status) = self.status_shared.write() {
            *status = SessionStatus {
                calibration: self.last_calibration,
                offset_stale: self.estimate.map_or(true, |e| e.stale),
                trend,
                updated_ts: self.clock.now().timestamp().max(0) as u64,
                ..SessionStatus::default()
            };
        }
    }

    fn publish(&self, sched: &CountdownScheduler) {
        let (acquire, release) = match self.tracker.read() {
            Ok(tracker) => (
                tracker.list_for(ItemKind::Acquire),
                tracker.list_for(ItemKind::Release),
            ),
            Err(_) => (Vec::new(), Vec::new()),
        };
        let trend = self.history.lock().ok().and_then(|h| h.trend());
        let phase = sched.phase();

        if let Ok(mut status) = self.status_shared.write() {
            status.phase = phase;
            status.phase_label = describe_phase(phase, sched.session().target_time_of_day);
            status.countdown_secs = sched.countdown().map(|c| c.display_secs());
            status.display = sched.display();
            status.calibration = self.last_calibration;
            status.offset_stale = sched.estimate().stale;
            status.trend = trend;
            status.credential = self.credential.clone();
            status.acquire = acquire;
            status.release = release;
            status.updated_ts = self.clock.now().timestamp().max(0) as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationConfig;
    use crate::shutdown;
    use crate::store::MemoryStore;
    use crate::tracker::OutcomeStatus;
    use crate::traits::{epoch_ms, MockNtpSource, NtpSample, ServerStamp};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::{NaiveTime, TimeZone, Utc};
    use std::collections::VecDeque;

    /// Wall clock that moves with tokio's (paused) clock.
    struct TokioClock {
        base: DateTime<Utc>,
        start: Instant,
    }

    impl TokioClock {
        fn at(h: u32, m: u32, s: u32) -> Self {
            TokioClock {
                base: Utc.with_ymd_and_hms(2026, 2, 2, h, m, s).unwrap(),
                start: Instant::now(),
            }
        }
    }

    impl WallClock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            self.base + chrono::Duration::from_std(self.start.elapsed()).unwrap()
        }
    }

    /// Server whose clock runs `skew_ms` ahead of ours; `hang` never answers.
    struct SkewedServer {
        clock: Arc<TokioClock>,
        skew_ms: f64,
        hang: bool,
    }

    #[async_trait]
    impl ServerProbe for SkewedServer {
        async fn server_time(&self) -> Result<ServerStamp> {
            if self.hang {
                return std::future::pending::<Result<ServerStamp>>().await;
            }
            let t = epoch_ms(&self.clock.now()) + self.skew_ms;
            Ok(ServerStamp {
                receive_ms: t,
                transmit_ms: t,
            })
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Replies in order, then `success` forever.
    struct QueueTransport {
        replies: Mutex<VecDeque<Outcome>>,
        calls: Mutex<Vec<Instant>>,
        credential_ok: bool,
    }

    impl QueueTransport {
        fn new(replies: Vec<Outcome>) -> Self {
            QueueTransport {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
                credential_ok: true,
            }
        }
    }

    #[async_trait]
    impl RegistrationTransport for QueueTransport {
        async fn attempt(&self, _item: &TrackedItem) -> Result<Outcome> {
            self.calls.lock().unwrap().push(Instant::now());
            let next = self.replies.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| Outcome::new(OutcomeStatus::Success, "ok")))
        }

        async fn test_credential(&self) -> Result<CredentialCheck> {
            if self.credential_ok {
                Ok(CredentialCheck {
                    valid: true,
                    message: "token ok".to_string(),
                })
            } else {
                Err(anyhow!("401 unauthorized"))
            }
        }
    }

    fn reference_ntp() -> MockNtpSource {
        let mut ntp = MockNtpSource::new();
        ntp.expect_sample().returning(|| {
            Ok(NtpSample {
                offset_ms: 380.0,
                round_trip_ms: 12.0,
            })
        });
        ntp
    }

    fn build(
        clock: Arc<TokioClock>,
        server: SkewedServer,
        ntp: MockNtpSource,
        transport: Arc<QueueTransport>,
        probe_timeout_ms: u64,
    ) -> SessionController<SkewedServer, MockNtpSource, TokioClock, QueueTransport> {
        let engine = CalibrationEngine::new(
            Arc::new(server),
            Arc::new(ntp),
            clock.clone(),
            CalibrationConfig {
                samples: 1,
                ping_samples: 1,
                probe_timeout_ms,
                ..CalibrationConfig::default()
            },
        );
        let mut tracker = OutcomeTracker::new();
        tracker.add(ItemKind::Acquire, "24066").unwrap();

        SessionController::new(
            engine,
            clock,
            CalibrationHistory::load(Box::new(MemoryStore::new())),
            Arc::new(RwLock::new(tracker)),
            transport,
            Arc::new(RwLock::new(SessionStatus::default())),
            SchedulerConfig::default(),
        )
        .with_zone(FixedOffset::east_opt(0).unwrap())
    }

    fn nine_oclock(max_attempts: u32) -> SessionConfig {
        SessionConfig::new(NaiveTime::from_hms_opt(9, 0, 0).unwrap(), max_attempts, 3.0, 5.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_fires_at_corrected_target() {
        let _ = env_logger::builder().is_test(true).try_init();

        let clock = Arc::new(TokioClock::at(8, 59, 30));
        let server = SkewedServer {
            clock: clock.clone(),
            skew_ms: 400.0,
            hang: false,
        };
        let transport = Arc::new(QueueTransport::new(vec![
            Outcome::new(OutcomeStatus::Debounce, "slow down"),
            Outcome::new(OutcomeStatus::Success, "registered"),
        ]));
        let mut controller = build(clock.clone(), server, reference_ntp(), transport.clone(), 3_000);
        let start = Instant::now();

        let report = controller.run(nine_oclock(5), Shutdown::never()).await.unwrap();

        assert_eq!(report.final_phase, Phase::Done);
        assert!(!report.cancelled);
        assert!(!report.offset_stale);
        assert_eq!(report.calibration.unwrap().server_offset_ms, 400.0);
        assert_eq!(report.calibration.unwrap().server_ntp_diff_ms, 20.0);
        assert!(report.credential.as_ref().unwrap().valid);
        assert_eq!(report.items[0].attempts, 2);
        assert_eq!(report.items[0].outcome.status, OutcomeStatus::Success);

        // 30s to go on our clock, server 400ms ahead, 5ms arrival buffer
        let calls = transport.calls.lock().unwrap().clone();
        let fired = calls[0] - start;
        assert!(fired >= Duration::from_millis(29_595), "{:?}", fired);
        assert!(fired < Duration::from_millis(29_600), "{:?}", fired);
        assert!(calls[1] - calls[0] >= Duration::from_secs(3));

        // Initial calibration plus the final one before the token window
        assert_eq!(controller.history().lock().unwrap().len(), 2);

        let status = controller.get_status_shared().read().unwrap().clone();
        assert_eq!(status.phase, Phase::Done);
        assert_eq!(status.display, "TAMAMLANDI");
        assert_eq!(status.acquire[0].outcome.status, OutcomeStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_while_waiting() {
        let clock = Arc::new(TokioClock::at(8, 59, 0));
        let server = SkewedServer {
            clock: clock.clone(),
            skew_ms: 0.0,
            hang: false,
        };
        let transport = Arc::new(QueueTransport::new(vec![]));
        let mut controller = build(clock, server, reference_ntp(), transport.clone(), 3_000);
        let (trigger, shutdown) = shutdown::channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.fire();
        });
        let report = controller.run(nine_oclock(5), shutdown).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.final_phase, Phase::Idle);
        assert_eq!(report.items[0].attempts, 0);
        assert!(transport.calls.lock().unwrap().is_empty());

        let tracker = controller.tracker();
        assert!(!tracker.read().unwrap().is_frozen());
        assert_eq!(controller.get_status_shared().read().unwrap().phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_calibration_abandoned_at_token_window() {
        let clock = Arc::new(TokioClock::at(8, 59, 50));
        let server = SkewedServer {
            clock: clock.clone(),
            skew_ms: 0.0,
            hang: true,
        };
        let transport = Arc::new(QueueTransport {
            credential_ok: false,
            ..QueueTransport::new(vec![])
        });
        let mut controller = build(clock, server, MockNtpSource::new(), transport.clone(), 60_000);
        let start = Instant::now();

        let report = controller.run(nine_oclock(5), Shutdown::never()).await.unwrap();

        assert_eq!(report.final_phase, Phase::Done);
        assert!(report.calibration.is_none());
        assert!(report.offset_stale);
        // Invalid credential is recorded but does not stop the session
        let credential = report.credential.unwrap();
        assert!(!credential.valid);
        assert!(credential.message.contains("401"));

        let calls = transport.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0] - start, Duration::from_millis(9_995));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_outcomes() {
        let clock = Arc::new(TokioClock::at(8, 59, 58));
        let server = SkewedServer {
            clock: clock.clone(),
            skew_ms: 0.0,
            hang: false,
        };
        let transport = Arc::new(QueueTransport::new(vec![Outcome::new(OutcomeStatus::Full, "no seats")]));
        let mut controller = build(clock, server, reference_ntp(), transport, 3_000);

        let report = controller.run(nine_oclock(5), Shutdown::never()).await.unwrap();
        assert_eq!(report.items[0].outcome.status, OutcomeStatus::Full);

        controller.reset();
        let status = controller.get_status_shared().read().unwrap().clone();
        assert_eq!(status.phase, Phase::Idle);
        let tracker = controller.tracker();
        let view = tracker.read().unwrap().list_for(ItemKind::Acquire);
        assert_eq!(view[0].outcome.status, OutcomeStatus::Pending);
        assert!(!tracker.read().unwrap().is_frozen());
    }
}
