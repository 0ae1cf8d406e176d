use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, warn};

use crate::config::RunnerSettings;
use crate::error::{ExtractError, FailureKind};
use crate::models::ProductObservation;
use crate::normalize::{normalize_batch, NormalizeStats};
use crate::registry::ScrapeJob;
use crate::sink::{RunSnapshot, SinkOutcome, SinkRouter};

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub job_timeout: Duration,
    pub run_timeout: Duration,
    /// Extra attempts after the first, for transient failures only.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub concurrency: usize,
    pub show_progress: bool,
    pub normalize: bool,
}

impl RunConfig {
    pub fn from_settings(s: &RunnerSettings) -> Self {
        Self {
            job_timeout: Duration::from_secs(s.job_timeout_secs),
            run_timeout: Duration::from_secs(s.run_timeout_secs),
            max_retries: s.max_retries,
            base_backoff: Duration::from_millis(s.base_backoff_ms),
            concurrency: s.concurrency.max(1),
            show_progress: true,
            normalize: false,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from_settings(&RunnerSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success { observations: usize },
    Failed { kind: FailureKind, detail: String },
}

/// What happened to one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub site: String,
    pub outcome: JobOutcome,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Success { .. })
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub table: String,
    /// One entry per job, in job order.
    pub jobs: Vec<JobReport>,
    /// Everything handed to the sinks, in job order.
    pub batch: Vec<ProductObservation>,
    pub normalization: Option<NormalizeStats>,
    pub sink: SinkOutcome,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.jobs.iter().filter(|j| j.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.jobs.len() - self.succeeded()
    }
}

type JobResult = (usize, JobReport, Vec<ProductObservation>);

/// Executes a job set and hands the combined batch to the sinks once.
pub struct Runner {
    cfg: RunConfig,
}

impl Runner {
    pub fn new(cfg: RunConfig) -> Self {
        Self { cfg }
    }

    pub async fn run(&self, jobs: Vec<ScrapeJob>, sinks: &SinkRouter) -> RunReport {
        let started_at = Utc::now();
        let deadline = Instant::now() + self.cfg.run_timeout;
        let run_id = format!("run-{}", started_at.format("%Y%m%dT%H%M%SZ"));
        let total = jobs.len();
        info!(run_id = %run_id, jobs = total, concurrency = self.cfg.concurrency, "Starting run");

        let pb = self.progress_bar(total);
        let workers = Arc::new(Semaphore::new(self.cfg.concurrency.max(1)));
        let mut lanes: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let identities: Vec<(String, String)> = jobs
            .iter()
            .map(|j| (j.id.clone(), j.entry.site.clone()))
            .collect();

        // Workers send results, this task is the only writer
        let (tx, mut rx) = mpsc::channel::<JobResult>(self.cfg.concurrency.max(1) * 2);

        for (index, job) in jobs.into_iter().enumerate() {
            let lane = Arc::clone(
                lanes
                    .entry(job.host())
                    .or_insert_with(|| Arc::new(Semaphore::new(1))),
            );
            let workers = Arc::clone(&workers);
            let tx = tx.clone();
            let cfg = self.cfg.clone();

            tokio::spawn(async move {
                let (report, observations) =
                    run_job(&job, &cfg, lane, workers, deadline, started_at).await;
                let _ = tx.send((index, report, observations)).await;
            });
        }
        drop(tx);

        let mut slots: Vec<Option<(JobReport, Vec<ProductObservation>)>> =
            (0..total).map(|_| None).collect();
        while let Some((index, report, observations)) = rx.recv().await {
            match &report.outcome {
                JobOutcome::Success { observations } => info!(
                    job = %report.job_id,
                    observations,
                    attempts = report.attempts,
                    "Job succeeded"
                ),
                JobOutcome::Failed { kind, detail } => warn!(
                    job = %report.job_id,
                    kind = %kind,
                    attempts = report.attempts,
                    "Job failed: {}",
                    detail
                ),
            }
            pb.set_message(report.job_id.clone());
            pb.inc(1);
            slots[index] = Some((report, observations));
        }
        pb.finish_and_clear();

        let mut reports = Vec::with_capacity(total);
        let mut batch = Vec::new();
        for (slot, (job_id, site)) in slots.into_iter().zip(identities) {
            match slot {
                Some((report, observations)) => {
                    reports.push(report);
                    batch.extend(observations);
                }
                None => reports.push(JobReport {
                    job_id,
                    site,
                    outcome: JobOutcome::Failed {
                        kind: FailureKind::Aborted,
                        detail: "job task ended without reporting".into(),
                    },
                    attempts: 0,
                    elapsed_ms: 0,
                }),
            }
        }

        let normalization = if self.cfg.normalize {
            let (normalized, stats) = normalize_batch(batch);
            batch = normalized;
            info!(matched = stats.matched, unmatched = stats.unmatched, "Normalized batch");
            Some(stats)
        } else {
            None
        };

        let finished_at = Utc::now();
        let snapshot = RunSnapshot {
            run_id: &run_id,
            started_at,
            finished_at,
            table: sinks.table(),
            jobs: &reports,
            observations: &batch,
        };
        let sink = sinks.write(&snapshot).await;

        let report = RunReport {
            run_id,
            started_at,
            finished_at,
            table: sinks.table().to_string(),
            jobs: reports,
            batch,
            normalization,
            sink,
        };
        info!(
            run_id = %report.run_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            observations = report.batch.len(),
            "Run finished"
        );
        report
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.cfg.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb
    }
}

async fn run_job(
    job: &ScrapeJob,
    cfg: &RunConfig,
    lane: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    deadline: Instant,
    started_at: DateTime<Utc>,
) -> (JobReport, Vec<ProductObservation>) {
    let mut attempts = 0u32;
    let mut elapsed = Duration::ZERO;

    // One in-flight job per host, then a slot in the shared pool
    let permits = timeout_at(deadline, async {
        let host = lane.acquire_owned().await?;
        let worker = workers.acquire_owned().await?;
        Ok::<_, tokio::sync::AcquireError>((host, worker))
    })
    .await;

    let result = match permits {
        Ok(Ok(_permits)) if Instant::now() < deadline => {
            let clock = Instant::now();
            let fetched = timeout(cfg.job_timeout, fetch_with_retry(job, cfg, &mut attempts)).await;
            elapsed = clock.elapsed();
            match fetched {
                Err(_) => Err((
                    FailureKind::Timeout,
                    format!("no result within {}s", cfg.job_timeout.as_secs_f64()),
                )),
                Ok(Err(e)) => Err((e.kind(), e.detail().to_string())),
                Ok(Ok(observations)) => accept(observations, started_at),
            }
        }
        Ok(Ok(_)) | Err(_) => Err((
            FailureKind::Deadline,
            "run deadline passed before the job started".to_string(),
        )),
        Ok(Err(_)) => Err((FailureKind::Aborted, "worker pool closed".to_string())),
    };

    let (outcome, observations) = match result {
        Ok(observations) => (
            JobOutcome::Success {
                observations: observations.len(),
            },
            observations,
        ),
        Err((kind, detail)) => (JobOutcome::Failed { kind, detail }, Vec::new()),
    };
    let report = JobReport {
        job_id: job.id.clone(),
        site: job.entry.site.clone(),
        outcome,
        attempts,
        elapsed_ms: elapsed.as_millis() as u64,
    };
    (report, observations)
}

/// Transient failures are retried with exponential backoff; others return at once.
async fn fetch_with_retry(
    job: &ScrapeJob,
    cfg: &RunConfig,
    attempts: &mut u32,
) -> Result<Vec<ProductObservation>, ExtractError> {
    loop {
        *attempts += 1;
        match job.extractor.fetch(job).await {
            Err(e) if e.is_transient() && *attempts <= cfg.max_retries => {
                let backoff = cfg
                    .base_backoff
                    .saturating_mul(1u32 << (*attempts - 1).min(16));
                warn!(
                    job = %job.id,
                    "{} (attempt {}/{}), backing off {:.1}s",
                    e,
                    *attempts,
                    cfg.max_retries + 1,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }
}

/// Every observation must carry its identity; timestamps never precede the run.
fn accept(
    mut observations: Vec<ProductObservation>,
    started_at: DateTime<Utc>,
) -> Result<Vec<ProductObservation>, (FailureKind, String)> {
    for obs in &mut observations {
        obs.validate().map_err(|e| (e.kind(), e.detail().to_string()))?;
        if obs.collected_at < started_at {
            obs.collected_at = started_at;
        }
    }
    Ok(observations)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::extract::example::ExampleExtractor;
    use crate::extract::SiteExtractor;
    use crate::registry::testing::job_with;
    use crate::sink::local::read_snapshot;
    use crate::sink::LocalSink;

    /// `count` observations per call, after failing `flaky` times with `error`.
    struct Scripted {
        count: usize,
        flaky: u32,
        error: ExtractError,
        delay: Duration,
        calls: AtomicU32,
    }

    impl Scripted {
        fn ok(count: usize) -> Self {
            Self {
                count,
                flaky: 0,
                error: ExtractError::Network("unused".into()),
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }

        fn failing(flaky: u32, error: ExtractError) -> Self {
            Self {
                flaky,
                error,
                ..Self::ok(1)
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::ok(1)
            }
        }
    }

    #[async_trait]
    impl SiteExtractor for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch(&self, job: &ScrapeJob) -> Result<Vec<ProductObservation>, ExtractError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call <= self.flaky {
                return Err(self.error.clone());
            }
            Ok((0..self.count)
                .map(|i| {
                    let mut obs = job.observe(&format!("{} #{}", job.entry.brand, i), None);
                    obs.price = Some(10.0 + i as f64);
                    obs
                })
                .collect())
        }
    }

    fn job(id: &str, host: &str, extractor: Arc<dyn SiteExtractor>) -> ScrapeJob {
        let entry = CatalogEntry::new(
            id,
            "Kleenex",
            "Family Pack",
            "ColdStorage",
            &format!("https://{}/p/{}", host, id),
        );
        job_with(id, entry, extractor, &[])
    }

    fn fast_config() -> RunConfig {
        RunConfig {
            job_timeout: Duration::from_secs(5),
            run_timeout: Duration::from_secs(30),
            max_retries: 3,
            base_backoff: Duration::from_millis(1),
            concurrency: 4,
            show_progress: false,
            normalize: false,
        }
    }

    fn local_router(dir: &tempfile::TempDir) -> SinkRouter {
        SinkRouter::local_only(LocalSink::new(dir.path()), "tissue_prices", "test run")
    }

    #[tokio::test]
    async fn catalog_fields_and_canonical_url_reach_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let entry = CatalogEntry::new(
            "coldstorage-kleenex-family",
            "Kleenex",
            "Family Pack",
            "ColdStorage",
            "https://coldstorage.com.sg/kleenex-family-pack",
        )
        .with_size("10x200s");
        let job = job_with(
            "coldstorage-kleenex-family",
            entry,
            Arc::new(ExampleExtractor),
            &[("price", "12.50"), ("total_reviews", "34"), ("total_rating", "4.5")],
        );

        let report = Runner::new(fast_config()).run(vec![job], &local_router(&dir)).await;
        assert_eq!(report.batch.len(), 1);
        let record = &report.batch[0];
        assert_eq!(record.site, "ColdStorage");
        assert_eq!(record.description, "Family Pack");
        assert_eq!(record.size.as_deref(), Some("10x200s"));
        assert_eq!(record.price, Some(12.5));
        assert_eq!(record.total_reviews, Some(34));
        assert_eq!(record.total_rating, Some(4.5));
        assert_eq!(record.source_url, "https://coldstorage.com.sg/kleenex-family-pack");
    }

    #[tokio::test]
    async fn parse_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let failing = Arc::new(Scripted::failing(u32::MAX, ExtractError::Parse("layout".into())));
        let jobs = vec![
            job("a", "a.example", Arc::new(Scripted::ok(3))),
            job("b", "b.example", failing.clone()),
        ];

        let report = Runner::new(fast_config()).run(jobs, &local_router(&dir)).await;
        assert_eq!(report.jobs.len(), 2);
        assert_eq!(report.jobs[0].outcome, JobOutcome::Success { observations: 3 });
        assert!(matches!(
            &report.jobs[1].outcome,
            JobOutcome::Failed { kind: FailureKind::Parse, .. }
        ));
        // Parse errors are deterministic: no retry.
        assert_eq!(report.jobs[1].attempts, 1);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.batch.len(), 3);

        let local = read_snapshot(report.sink.local_path.as_ref().unwrap()).unwrap();
        assert_eq!(local.observations, report.batch);
        assert_eq!(local.jobs, report.jobs);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let flaky = Arc::new(Scripted::failing(2, ExtractError::Network("503".into())));
        let report = Runner::new(fast_config())
            .run(vec![job("flaky", "f.example", flaky.clone())], &local_router(&dir))
            .await;
        assert!(report.jobs[0].is_success());
        assert_eq!(report.jobs[0].attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let down = Arc::new(Scripted::failing(u32::MAX, ExtractError::Network("dns".into())));
        let report = Runner::new(fast_config())
            .run(vec![job("down", "d.example", down.clone())], &local_router(&dir))
            .await;
        assert!(matches!(
            &report.jobs[0].outcome,
            JobOutcome::Failed { kind: FailureKind::Network, detail } if detail == "dns"
        ));
        assert_eq!(report.jobs[0].attempts, 4);
        assert!(report.batch.is_empty());
        // An empty batch is still recorded locally.
        assert!(report.sink.local_path.is_some());
    }

    #[tokio::test]
    async fn slow_job_times_out_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = fast_config();
        cfg.job_timeout = Duration::from_millis(50);
        let jobs = vec![
            job("slow", "slow.example", Arc::new(Scripted::slow(Duration::from_secs(10)))),
            job("quick", "quick.example", Arc::new(Scripted::ok(2))),
        ];

        let report = Runner::new(cfg).run(jobs, &local_router(&dir)).await;
        assert!(matches!(
            report.jobs[0].outcome,
            JobOutcome::Failed { kind: FailureKind::Timeout, .. }
        ));
        assert_eq!(report.jobs[1].outcome, JobOutcome::Success { observations: 2 });
        assert_eq!(report.batch.len(), 2);
    }

    #[tokio::test]
    async fn deadline_stops_new_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = fast_config();
        cfg.run_timeout = Duration::from_millis(100);
        // Same host: the second job waits for the first one's lane.
        let jobs = vec![
            job("first", "same.example", Arc::new(Scripted::slow(Duration::from_millis(300)))),
            job("second", "same.example", Arc::new(Scripted::ok(1))),
        ];

        let report = Runner::new(cfg).run(jobs, &local_router(&dir)).await;
        assert!(report.jobs[0].is_success());
        assert!(matches!(
            report.jobs[1].outcome,
            JobOutcome::Failed { kind: FailureKind::Deadline, .. }
        ));
        assert_eq!(report.jobs[1].attempts, 0);
        assert_eq!(report.batch.len(), 1);
    }

    #[tokio::test]
    async fn invalid_observation_fails_the_job() {
        struct Blank;

        #[async_trait]
        impl SiteExtractor for Blank {
            fn name(&self) -> &'static str {
                "blank"
            }

            async fn fetch(&self, job: &ScrapeJob) -> Result<Vec<ProductObservation>, ExtractError> {
                let mut obs = job.observe("Ultra Soft", None);
                obs.brand = " ".into();
                Ok(vec![obs])
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let report = Runner::new(fast_config())
            .run(vec![job("blank", "b.example", Arc::new(Blank))], &local_router(&dir))
            .await;
        assert!(matches!(
            report.jobs[0].outcome,
            JobOutcome::Failed { kind: FailureKind::Validation, .. }
        ));
        assert!(report.batch.is_empty());
    }

    #[tokio::test]
    async fn one_report_per_job_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = fast_config();
        cfg.concurrency = 2;
        let jobs: Vec<ScrapeJob> = (0..7)
            .map(|i| {
                let extractor: Arc<dyn SiteExtractor> = if i % 3 == 0 {
                    Arc::new(Scripted::failing(u32::MAX, ExtractError::Validation("price".into())))
                } else {
                    Arc::new(Scripted::ok(i))
                };
                job(&format!("job-{}", i), &format!("h{}.example", i % 2), extractor)
            })
            .collect();

        let report = Runner::new(cfg).run(jobs, &local_router(&dir)).await;
        let ids: Vec<&str> = report.jobs.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, ["job-0", "job-1", "job-2", "job-3", "job-4", "job-5", "job-6"]);
        assert_eq!(report.failed(), 3);
        assert_eq!(report.batch.len(), 1 + 2 + 4 + 5);
        assert!(report.batch.iter().all(|o| o.collected_at >= report.started_at));
        // Batch follows job order.
        assert_eq!(report.batch[0].metadata["job_id"], "job-1");
        assert_eq!(report.batch.last().unwrap().metadata["job_id"], "job-5");
    }

    #[tokio::test]
    async fn normalization_counts_unmatched() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = fast_config();
        cfg.normalize = true;
        let report = Runner::new(cfg)
            .run(vec![job("a", "a.example", Arc::new(Scripted::ok(2)))], &local_router(&dir))
            .await;
        assert_eq!(
            report.normalization,
            Some(NormalizeStats { matched: 0, unmatched: 2 })
        );
        assert_eq!(report.batch.len(), 2);
    }

    /// Stamps its one observation an hour in the past.
    struct Backdated;

    #[async_trait]
    impl SiteExtractor for Backdated {
        fn name(&self) -> &'static str {
            "backdated"
        }

        async fn fetch(&self, job: &ScrapeJob) -> Result<Vec<ProductObservation>, ExtractError> {
            let mut obs = job.observe("Kleenex Family Pack", None);
            obs.price = Some(9.9);
            obs.collected_at = Utc::now() - chrono::Duration::hours(1);
            Ok(vec![obs])
        }
    }

    #[tokio::test]
    async fn collected_at_before_run_start_is_moved_up() {
        let dir = tempfile::tempdir().unwrap();
        let report = Runner::new(fast_config())
            .run(vec![job("a", "a.example", Arc::new(Backdated))], &local_router(&dir))
            .await;
        assert_eq!(report.batch.len(), 1);
        assert_eq!(report.batch[0].collected_at, report.started_at);

        let path = report.sink.local_path.as_ref().unwrap();
        let stored = read_snapshot(path).unwrap();
        assert_eq!(stored.observations[0].collected_at, report.started_at);
    }
}
