// Bounded job queue and worker pool
//
// `submit` never blocks: a full queue rejects the job. W workers share one
// receiver; each runs its job to completion, including cleanup, before
// taking the next one.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::captions;
use crate::downloader::{
    output, DownloadError, DownloadRequest, FallbackPolicy, FormatPlanner, MediaService,
    SourceCategory,
};
use crate::messaging::{ChatTarget, MessagingService};

pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;
const PREFIX_LEN: usize = 18;

/// One download request, immutable once queued
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub url: String,
    pub category: SourceCategory,
    /// Namespace for every file this job writes
    pub output_prefix: String,
    pub max_bytes: Option<u64>,
    pub concurrency_hint: u32,
    pub notify_on_failure: bool,
    pub delete_original_on_success: bool,
    pub target: ChatTarget,
    pub original_message_id: i64,
    pub sender_label: String,
    pub source_name: String,
}

/// Random 18 hex character prefix
pub fn new_output_prefix() -> String {
    let mut prefix = Uuid::new_v4().simple().to_string();
    prefix.truncate(PREFIX_LEN);
    prefix
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered {
        path: PathBuf,
        deleted_original: bool,
    },
    Failed {
        error: String,
        notified: bool,
    },
}

/// Emitted once per finished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: Uuid,
    pub prefix: String,
    pub outcome: JobOutcome,
    /// Download attempts made (metadata fetches not counted)
    pub attempts: usize,
    /// Files removed by the final cleanup
    pub removed: usize,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Delivered { .. })
    }
}

/// Accepts jobs without blocking
pub trait JobSink: Send + Sync {
    /// False when the job was not queued
    fn submit(&self, job: Job) -> bool;
}

/// Runs a single job end to end
pub struct JobRunner {
    media: Arc<dyn MediaService>,
    messenger: Arc<dyn MessagingService>,
    planner: FormatPlanner,
    policy: FallbackPolicy,
    output_folder: PathBuf,
}

impl JobRunner {
    pub fn new(
        media: Arc<dyn MediaService>,
        messenger: Arc<dyn MessagingService>,
        planner: FormatPlanner,
        policy: FallbackPolicy,
        output_folder: PathBuf,
    ) -> Self {
        Self {
            media,
            messenger,
            planner,
            policy,
            output_folder,
        }
    }

    pub fn output_folder(&self) -> &std::path::Path {
        &self.output_folder
    }

    /// Process `job`; cleanup runs whatever the outcome.
    pub async fn run(&self, job: &Job) -> JobReport {
        let mut attempts = 0;
        let result = self.execute(job, &mut attempts).await;

        let outcome = match result {
            Ok((path, deleted_original)) => JobOutcome::Delivered {
                path,
                deleted_original,
            },
            Err(e) => {
                let notified = job.notify_on_failure && self.notify_failure(job).await;
                JobOutcome::Failed {
                    error: e.to_string(),
                    notified,
                }
            }
        };

        let removed = output::cleanup(&job.output_prefix, &self.output_folder);

        JobReport {
            job_id: job.id,
            prefix: job.output_prefix.clone(),
            outcome,
            attempts,
            removed,
        }
    }

    async fn execute(
        &self,
        job: &Job,
        attempts: &mut usize,
    ) -> Result<(PathBuf, bool), DownloadError> {
        tokio::fs::create_dir_all(&self.output_folder).await?;

        let meta = self
            .policy
            .fetch_metadata(self.media.as_ref(), &job.url, job.category)
            .await?;
        let selection = self.planner.select(&meta, job.max_bytes);

        let request = DownloadRequest {
            url: &job.url,
            category: job.category,
            prefix: &job.output_prefix,
            folder: &self.output_folder,
            max_bytes: job.max_bytes,
            concurrent_fragments: job.concurrency_hint,
        };
        let report = self
            .policy
            .attempt(self.media.as_ref(), &request, &selection)
            .await;
        *attempts = report.attempts;
        let outcome = report.result?;

        let target_container = &self.planner.settings().target_container;
        let path = output::resolve(
            &outcome,
            &job.output_prefix,
            &self.output_folder,
            target_container,
        )
        .ok_or(DownloadError::OutputNotFound)?;

        let size = tokio::fs::metadata(&path).await?.len();
        if let Some(limit) = job.max_bytes {
            if size > limit {
                return Err(DownloadError::OversizedOutput { path, size, limit });
            }
        }

        let caption = captions::video_caption(&job.url, &job.source_name, &job.sender_label);
        self.messenger
            .send_media(job.target, &path, &caption)
            .await
            .map_err(|e| DownloadError::Delivery(e.to_string()))?;

        let deleted_original = job.delete_original_on_success
            && self
                .messenger
                .delete_message(job.target, job.original_message_id)
                .await;

        Ok((path, deleted_original))
    }

    pub(crate) async fn notify_failure(&self, job: &Job) -> bool {
        match self
            .messenger
            .send_text(job.target, captions::FAILURE_TEXT, false)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to send failure notice");
                false
            }
        }
    }
}

/// Fixed pool of workers over a bounded queue
pub struct JobScheduler {
    sender: StdMutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Spawn `workers` tasks on the current runtime.
    pub fn start(
        runner: Arc<JobRunner>,
        workers: usize,
        queue_capacity: usize,
        reports: Option<mpsc::UnboundedSender<JobReport>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let runner = Arc::clone(&runner);
                let reports = reports.clone();
                tokio::spawn(worker_loop(worker_id, rx, runner, reports))
            })
            .collect();

        info!(workers = workers.max(1), queue_capacity, "job scheduler started");

        Self {
            sender: StdMutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Close the queue and wait until every queued job has finished.
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("job scheduler stopped");
    }
}

impl JobSink for JobScheduler {
    fn submit(&self, job: Job) -> bool {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(sender) = guard.as_ref() else {
            warn!(job_id = %job.id, "scheduler is shut down, job rejected");
            return false;
        };

        match sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(job_id = %job.id, "job queue full, job rejected");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(job_id = %job.id, "job queue closed, job rejected");
                false
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    runner: Arc<JobRunner>,
    reports: Option<mpsc::UnboundedSender<JobReport>>,
) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };

        info!(worker_id, job_id = %job.id, url = %job.url, category = %job.category, "job started");

        let report = match AssertUnwindSafe(runner.run(&job)).catch_unwind().await {
            Ok(report) => report,
            Err(_) => {
                error!(worker_id, job_id = %job.id, "job panicked");
                let notified = job.notify_on_failure && runner.notify_failure(&job).await;
                JobReport {
                    job_id: job.id,
                    prefix: job.output_prefix.clone(),
                    outcome: JobOutcome::Failed {
                        error: "job panicked".to_string(),
                        notified,
                    },
                    attempts: 0,
                    removed: output::cleanup(&job.output_prefix, runner.output_folder()),
                }
            }
        };

        match &report.outcome {
            JobOutcome::Delivered { path, deleted_original } => info!(
                worker_id,
                job_id = %report.job_id,
                attempts = report.attempts,
                removed = report.removed,
                path = %path.display(),
                deleted_original,
                "job delivered"
            ),
            JobOutcome::Failed { error, notified } => warn!(
                worker_id,
                job_id = %report.job_id,
                attempts = report.attempts,
                removed = report.removed,
                notified,
                error = %error,
                "job failed"
            ),
        }

        if let Some(tx) = &reports {
            let _ = tx.send(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_prefix_shape() {
        let a = new_output_prefix();
        let b = new_output_prefix();
        assert_eq!(a.len(), 18);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
