use anyhow::{Context, Result};
use chrono::NaiveTime;
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crnsync::calibration::{CalibrationEngine, CalibrationResult};
use crnsync::config::{parse_time_of_day, SessionConfig, SystemConfig};
use crnsync::controller::{SessionController, SessionReport};
use crnsync::history::{sparkline, CalibrationHistory};
use crnsync::http::{CatalogClient, HttpClient};
use crnsync::lookup::{CourseInfo, CourseLookup};
use crnsync::ntp::NtpClient;
use crnsync::phase::Phase;
use crnsync::shutdown;
use crnsync::status::SessionStatus;
use crnsync::store::JsonFileStore;
use crnsync::tracker::{CourseCode, ItemKind, OutcomeTracker};
use crnsync::traits::SystemWallClock;

type Controller = SessionController<HttpClient, NtpClient, SystemWallClock, HttpClient>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file; flags below override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Registration API base URL
    #[arg(long, global = true)]
    server: Option<String>,

    #[arg(long, global = true)]
    ntp_server: Option<String>,

    /// Bearer credential for registration requests
    #[arg(long, global = true, env = "CRNSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Where calibration history is kept
    #[arg(long, global = true)]
    history_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Measure the server clock offset once and record it
    Calibrate,
    /// Show recorded calibrations
    History,
    /// Ask the server whether the credential is accepted
    CheckToken,
    /// Show course name, instructor, seats and schedule for CRNs
    Lookup {
        #[arg(required = true)]
        codes: Vec<String>,
    },
    /// Count down to the registration time, then register and drop courses
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Registration opens at this time of day (HH:MM[:SS], local time)
    #[arg(long, value_parser = parse_time_of_day)]
    at: NaiveTime,

    /// CRNs to register for
    #[arg(long = "add", num_args = 1..)]
    acquire: Vec<String>,

    /// CRNs to drop
    #[arg(long = "drop", num_args = 1..)]
    release: Vec<String>,

    #[arg(long, default_value_t = 60)]
    max_attempts: u32,

    /// Seconds between attempts for the same CRN (3-10)
    #[arg(long, default_value_t = 3.0)]
    retry_interval: f64,

    /// Aim this many milliseconds early (0-100)
    #[arg(long, default_value_t = 5.0)]
    buffer_ms: f64,
}

fn load_config(cli: &Cli) -> Result<SystemConfig> {
    let mut config = match &cli.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };
    if let Some(server) = &cli.server {
        config.transport.base_url = server.clone();
    }
    if let Some(ntp_server) = &cli.ntp_server {
        config.calibration.ntp_server = ntp_server.clone();
    }
    if let Some(dir) = &cli.history_dir {
        config.history_dir = dir.clone();
    }
    Ok(config)
}

fn open_history(config: &SystemConfig) -> CalibrationHistory {
    CalibrationHistory::load(Box::new(JsonFileStore::new(config.history_dir.clone())))
}

fn build_controller(config: &SystemConfig, token: Option<String>, tracker: OutcomeTracker) -> Result<Controller> {
    let http = Arc::new(HttpClient::new(&config.transport, token)?);
    let ntp = Arc::new(NtpClient::new(
        &config.calibration.ntp_server,
        Duration::from_millis(config.calibration.probe_timeout_ms),
    ));
    let clock = Arc::new(SystemWallClock);
    let engine = CalibrationEngine::new(http.clone(), ntp, clock.clone(), config.calibration.clone());

    Ok(SessionController::new(
        engine,
        clock,
        open_history(config),
        Arc::new(RwLock::new(tracker)),
        http,
        Arc::new(RwLock::new(SessionStatus::default())),
        config.scheduler.clone(),
    ))
}

fn print_calibration(result: &CalibrationResult) {
    println!("Server offset   {:+.0} ms", result.server_offset_ms);
    println!("Round trip      {:.0} ms", result.rtt_full_ms);
    println!("One-way         {:.1} ms", result.rtt_one_way_ms);
    println!("NTP offset      {:+.0} ms", result.ntp_offset_ms);
    println!("Server - NTP    {:+.0} ms", result.server_ntp_diff_ms);
    println!("Accuracy        ±{:.1} ms", result.accuracy_ms);
}

fn print_history(history: &CalibrationHistory) {
    if history.is_empty() {
        println!("No calibrations recorded yet.");
        return;
    }
    for entry in history.entries() {
        let at = chrono::DateTime::from_timestamp_millis(entry.timestamp)
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| entry.timestamp.to_string());
        println!(
            "{}  offset {:+7.1} ms  one-way {:6.1} ms",
            at, entry.server_offset_ms, entry.rtt_one_way_ms
        );
    }
    println!("Offset  {}", sparkline(&history.offset_series()));
    println!("RTT     {}", sparkline(&history.rtt_series()));
    if let Some(trend) = history.trend() {
        println!("Trend   {}", trend.label());
    }
}

fn print_report(report: &SessionReport) {
    for summary in &report.items {
        let note = if summary.cancelled {
            " (cancelled)"
        } else if summary.exhausted {
            " (attempts exhausted)"
        } else {
            ""
        };
        println!(
            "{:<4} {}  {:>3} attempt(s)  {:<10} {}{}",
            summary.item.kind.action(),
            summary.item.code,
            summary.attempts,
            summary.outcome.status.label(),
            summary.outcome.message,
            note
        );
    }
    if let Some(check) = &report.credential {
        if !check.valid {
            println!("Credential was rejected during the session: {}", check.message);
        }
    }
}

async fn calibrate(config: SystemConfig, token: Option<String>) -> Result<()> {
    let mut controller = build_controller(&config, token, OutcomeTracker::new())?;
    let result = controller.calibrate_once().await.context("Calibration failed")?;
    print_calibration(&result);

    let history = controller.history();
    if let Ok(history) = history.lock() {
        println!();
        print_history(&history);
    }
    Ok(())
}

async fn check_token(config: SystemConfig, token: Option<String>) -> Result<()> {
    if token.is_none() {
        warn!("[TOKEN] No credential given (--token or CRNSYNC_TOKEN)");
    }
    let mut controller = build_controller(&config, token, OutcomeTracker::new())?;
    let check = controller.check_credential().await;
    println!("{} {}", if check.valid { "valid" } else { "invalid" }, check.message);
    if !check.valid {
        anyhow::bail!("credential rejected");
    }
    Ok(())
}

fn print_course(code: &CourseCode, info: Option<&CourseInfo>) {
    let Some(info) = info else {
        println!("{}  not found in the timetable", code);
        return;
    };
    let seats = if info.is_full() { " (full)" } else { "" };
    println!(
        "{}  {:<10} {}  [{}]  {}/{} enrolled{}",
        info.crn, info.course_code, info.course_name, info.instructor, info.enrolled, info.capacity, seats
    );
    for session in &info.sessions {
        println!(
            "       {} {}-{}  {} {}",
            session.day_label(),
            session.start_time,
            session.end_time,
            session.building,
            session.room
        );
    }
}

async fn lookup_courses(config: SystemConfig, codes: Vec<String>) -> Result<()> {
    let codes = codes
        .iter()
        .map(|raw| raw.parse::<CourseCode>())
        .collect::<Result<Vec<_>, _>>()?;

    let catalog = Arc::new(CatalogClient::new(&config.lookup)?);
    let mut courses = CourseLookup::new(catalog, &config.lookup);
    let results = courses.lookup(&codes).await;
    for (code, info) in &results {
        print_course(code, info.as_ref());
    }

    let missing = results.iter().filter(|(_, info)| info.is_none()).count();
    if missing > 0 {
        anyhow::bail!("{} CRN(s) not found", missing);
    }
    Ok(())
}

async fn run_session(config: SystemConfig, token: Option<String>, args: RunArgs) -> Result<()> {
    let mut tracker = OutcomeTracker::new();
    for code in &args.acquire {
        tracker.add(ItemKind::Acquire, code)?;
    }
    for code in &args.release {
        tracker.add(ItemKind::Release, code)?;
    }

    let session = SessionConfig::new(args.at, args.max_attempts, args.retry_interval, args.buffer_ms);
    if session.retry_interval_sec != args.retry_interval || session.max_attempts != args.max_attempts {
        warn!(
            "[SESSION] Settings clamped: {} attempts, {:.1}s apart",
            session.max_attempts, session.retry_interval_sec
        );
    }

    let mut controller = build_controller(&config, token, tracker)?;
    let (trigger, shutdown) = shutdown::channel();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        trigger.fire();
    })?;

    // Periodic status line while counting down
    let status = controller.get_status_shared();
    let printer = tokio::spawn(async move {
        let mut last_phase = None;
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            let snapshot = match status.read() {
                Ok(s) => s.clone(),
                Err(_) => continue,
            };
            if snapshot.phase == Phase::Done {
                break;
            }
            if last_phase != Some(snapshot.phase) || snapshot.phase.is_counting() {
                let stale = if snapshot.offset_stale { " (offset stale)" } else { "" };
                info!("[SESSION] {} {}{}", snapshot.phase_label, snapshot.display, stale);
                last_phase = Some(snapshot.phase);
            }
        }
    });

    let report = controller.run(session, shutdown).await;
    printer.abort();

    let report = report?;
    print_report(&report);
    if report.cancelled {
        warn!("[SESSION] Stopped before completion");
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let token = cli.token.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let outcome = runtime.block_on(async move {
        match cli.command {
            Command::Calibrate => calibrate(config, token).await,
            Command::History => {
                print_history(&open_history(&config));
                Ok(())
            }
            Command::CheckToken => check_token(config, token).await,
            Command::Lookup { codes } => lookup_courses(config, codes).await,
            Command::Run(args) => run_session(config, token, args).await,
        }
    });

    if let Err(e) = &outcome {
        error!("{:#}", e);
    }
    outcome
}
