//! Background jobs.
//!
//! - daily VCF distribution (5-field cron, evaluated in the configured timezone)
//! - ephemeral session file sweep (fixed interval)
//! - relational store probe (fixed interval), the only path back to the primary
//!
//! Each job is its own tokio task, stopped through a `CancellationToken`.
//! The cron engine is hand-written; jobs only need minute resolution.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config, session::SessionManager, settings::SettingsStore, vcf::VcfDistributor,
    Error, Result,
};

pub const JOB_VCF_DISTRIBUTION: &str = "vcf-distribution";
pub const JOB_SESSION_SWEEP: &str = "session-sweep";
pub const JOB_STORAGE_PROBE: &str = "storage-probe";

type JobFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;
type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Clone, Debug)]
enum Schedule {
    Cron { expr: CronExpr, raw: String },
    Every(Duration),
}

impl Schedule {
    fn describe(&self, tz: Tz) -> String {
        match self {
            Schedule::Cron { raw, .. } => format!("{raw} ({})", tz.name()),
            Schedule::Every(d) => format!("every {}s", d.as_secs()),
        }
    }

    fn next_run(
        &self,
        tz: Tz,
        last: Option<DateTime<Utc>>,
        started: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { expr, .. } => expr
                .next_after(Utc::now().with_timezone(&tz))
                .map(|t| t.with_timezone(&Utc)),
            Schedule::Every(d) => {
                let base = last.unwrap_or(started);
                chrono::Duration::from_std(*d).ok().map(|d| base + d)
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub name: String,
    pub schedule: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub runs: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub timezone: String,
    pub distribution_running: bool,
    pub jobs: Vec<JobStatus>,
}

#[derive(Clone)]
pub struct BackgroundScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    cfg: Arc<Config>,
    store: Arc<SettingsStore>,
    distributor: Arc<VcfDistributor>,
    state: tokio::sync::Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    jobs: BTreeMap<&'static str, JobEntry>,
    runs: HashMap<&'static str, JobRun>,
    started_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    schedule: Schedule,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone, Default)]
struct JobRun {
    last_run: Option<DateTime<Utc>>,
    last_result: Option<String>,
    runs: u64,
}

impl BackgroundScheduler {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<SettingsStore>,
        distributor: Arc<VcfDistributor>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                cfg,
                store,
                distributor,
                state: tokio::sync::Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Start all jobs, replacing any that are already running.
    pub async fn start(&self, sessions: SessionManager) -> Result<usize> {
        self.stop().await;
        let cfg = self.inner.cfg.clone();

        let expr = CronExpr::parse(&cfg.vcf_cron)
            .map_err(|e| Error::Config(format!("VCF_CRON {:?}: {e}", cfg.vcf_cron)))?;
        let distributor = self.inner.distributor.clone();
        self.spawn_job(
            JOB_VCF_DISTRIBUTION,
            Schedule::Cron {
                expr,
                raw: cfg.vcf_cron.clone(),
            },
            Arc::new(move || -> JobFuture { Box::pin(run_distribution(distributor.clone())) }),
        )
        .await;

        self.spawn_job(
            JOB_SESSION_SWEEP,
            Schedule::Every(cfg.cleanup_interval),
            Arc::new(move || -> JobFuture { Box::pin(run_sweep(sessions.clone())) }),
        )
        .await;

        let store = self.inner.store.clone();
        self.spawn_job(
            JOB_STORAGE_PROBE,
            Schedule::Every(cfg.storage_probe_interval),
            Arc::new(move || -> JobFuture { Box::pin(probe_storage(store.clone())) }),
        )
        .await;

        let mut st = self.inner.state.lock().await;
        st.started_at = Some(Utc::now());
        tracing::info!(
            "[CRON] Started {} jobs (VCF distribution at {:?} {})",
            st.jobs.len(),
            cfg.vcf_cron,
            cfg.vcf_timezone.name()
        );
        Ok(st.jobs.len())
    }

    pub async fn stop(&self) {
        let mut st = self.inner.state.lock().await;
        for (_, job) in std::mem::take(&mut st.jobs) {
            job.cancel.cancel();
            job.handle.abort();
        }
        st.started_at = None;
    }

    pub async fn status(&self) -> SchedulerStatus {
        let tz = self.inner.cfg.vcf_timezone;
        let st = self.inner.state.lock().await;
        let started = st.started_at.unwrap_or_else(Utc::now);
        let jobs = st
            .jobs
            .iter()
            .map(|(name, job)| {
                let run = st.runs.get(name).cloned().unwrap_or_default();
                JobStatus {
                    name: name.to_string(),
                    schedule: job.schedule.describe(tz),
                    next_run: job.schedule.next_run(tz, run.last_run, started),
                    last_run: run.last_run,
                    last_result: run.last_result,
                    runs: run.runs,
                }
            })
            .collect();
        SchedulerStatus {
            running: st.started_at.is_some(),
            timezone: tz.name().to_string(),
            distribution_running: self.inner.distributor.is_running(),
            jobs,
        }
    }

    async fn spawn_job(&self, name: &'static str, schedule: Schedule, job: JobFn) {
        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let task_schedule = schedule.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            scheduler
                .job_loop(name, task_schedule, job, task_cancel)
                .await;
        });

        let mut st = self.inner.state.lock().await;
        if let Some(old) = st.jobs.insert(
            name,
            JobEntry {
                schedule,
                cancel,
                handle,
            },
        ) {
            old.cancel.cancel();
            old.handle.abort();
        }
    }

    async fn job_loop(
        &self,
        name: &'static str,
        schedule: Schedule,
        job: JobFn,
        cancel: CancellationToken,
    ) {
        let tz = self.inner.cfg.vcf_timezone;
        loop {
            let wait = match &schedule {
                Schedule::Every(d) => *d,
                Schedule::Cron { expr, .. } => {
                    let Some(next) = expr.next_after(Utc::now().with_timezone(&tz)) else {
                        tracing::error!("[CRON] Job {name} has no next run (stopping)");
                        break;
                    };
                    (next.with_timezone(&Utc) - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(wait) => {}
            }

            tracing::debug!("[CRON] Running {name}");
            let outcome = match job().await {
                Ok(summary) => {
                    tracing::info!("[CRON] {name}: {summary}");
                    summary
                }
                Err(e) => {
                    tracing::warn!("[CRON] {name} failed: {e}");
                    format!("error: {e}")
                }
            };

            let mut st = self.inner.state.lock().await;
            let run = st.runs.entry(name).or_default();
            run.last_run = Some(Utc::now());
            run.last_result = Some(outcome);
            run.runs += 1;
        }
    }
}

async fn run_distribution(distributor: Arc<VcfDistributor>) -> Result<String> {
    let report = distributor.distribute().await?;
    Ok(format!(
        "sent={} failed={} skipped={} contacts={}",
        report.sent, report.failed, report.skipped, report.contact_count
    ))
}

async fn run_sweep(sessions: SessionManager) -> Result<String> {
    let removed = sessions.sweep_ephemeral_files().await?;
    Ok(format!("removed {removed} file(s)"))
}

async fn probe_storage(store: Arc<SettingsStore>) -> Result<String> {
    let status = store.status();
    if !status.primary_configured {
        return Ok("primary not configured".to_string());
    }
    if status.primary_available {
        return Ok("primary in use".to_string());
    }
    Ok(if store.probe_primary().await {
        "primary restored".to_string()
    } else {
        "primary still unavailable".to_string()
    })
}

// === Cron expression engine ===

#[derive(Clone, Debug)]
pub struct CronExpr {
    min: Field,
    hour: Field,
    dom: Field,
    mon: Field,
    dow: Field,
}

#[derive(Clone, Debug)]
struct Field {
    min: u32,
    max: u32,
    any: bool,
    allowed: Vec<bool>, // index = value
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts = expr.split_whitespace().collect::<Vec<_>>();
        if parts.len() != 5 {
            return Err(Error::Config(format!(
                "expected 5 fields, got {}",
                parts.len()
            )));
        }

        Ok(Self {
            min: Field::parse(parts[0], 0, 59, false)?,
            hour: Field::parse(parts[1], 0, 23, false)?,
            dom: Field::parse(parts[2], 1, 31, false)?,
            mon: Field::parse(parts[3], 1, 12, false)?,
            dow: Field::parse(parts[4], 0, 6, true)?,
        })
    }

    pub fn matches<Z: TimeZone>(&self, dt: &DateTime<Z>) -> bool {
        if !self.min.contains(dt.minute())
            || !self.hour.contains(dt.hour())
            || !self.mon.contains(dt.month())
        {
            return false;
        }

        // Both DOM and DOW restricted: either may match.
        let dom_match = self.dom.contains(dt.day());
        let dow_match = self.dow.contains(dt.weekday().num_days_from_sunday());
        match (self.dom.any, self.dow.any) {
            (true, true) => true,
            (true, false) => dow_match,
            (false, true) => dom_match,
            (false, false) => dom_match || dow_match,
        }
    }

    /// First matching minute strictly after `now`, searched up to a year ahead.
    pub fn next_after<Z: TimeZone>(&self, now: DateTime<Z>) -> Option<DateTime<Z>> {
        let mut t = now + chrono::Duration::minutes(1);
        t = t.with_second(0)?.with_nanosecond(0)?;

        let max_iters = 366usize * 24 * 60;
        for _ in 0..max_iters {
            if self.matches(&t) {
                return Some(t);
            }
            t = t + chrono::Duration::minutes(1);
        }
        None
    }
}

impl Field {
    fn parse(raw: &str, min: u32, max: u32, allow_7_as_0: bool) -> Result<Self> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(Self {
                min,
                max,
                any: true,
                allowed: vec![true; (max + 1) as usize],
            });
        }

        let mut allowed = vec![false; (max + 1) as usize];
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (base, step) = if let Some((a, b)) = part.split_once('/') {
                let step: u32 = b
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid step: {b}")))?;
                if step == 0 {
                    return Err(Error::Config("step must be > 0".to_string()));
                }
                (a.trim(), Some(step))
            } else {
                (part, None)
            };

            let (start, end) = if base == "*" {
                (min, max)
            } else if let Some((a, b)) = base.split_once('-') {
                (
                    parse_u32(a.trim(), allow_7_as_0)?,
                    parse_u32(b.trim(), allow_7_as_0)?,
                )
            } else {
                let a = parse_u32(base, allow_7_as_0)?;
                if step.is_some() {
                    (a, max)
                } else {
                    (a, a)
                }
            };

            let start = start.max(min);
            let end = end.min(max);
            if start > end {
                return Err(Error::Config(format!("invalid range: {base}")));
            }

            let step = step.unwrap_or(1);
            let mut v = start;
            while v <= end {
                allowed[v as usize] = true;
                v = v.saturating_add(step);
            }
        }

        let any = (min..=max).all(|v| allowed[v as usize]);
        Ok(Self {
            min,
            max,
            any,
            allowed,
        })
    }

    fn contains(&self, v: u32) -> bool {
        if v < self.min || v > self.max {
            return false;
        }
        self.allowed.get(v as usize).copied().unwrap_or(false)
    }
}

fn parse_u32(s: &str, allow_7_as_0: bool) -> Result<u32> {
    let v: u32 = s
        .parse()
        .map_err(|_| Error::Config(format!("invalid number: {s}")))?;
    Ok(if allow_7_as_0 && v == 7 { 0 } else { v })
}

// === Tests ===
