//! Retention sweep of old tickets and orphaned media files, plus the timer
//! task that runs it.

use std::{collections::HashSet, sync::Arc, time::Duration};

use derive_more::{Display, From};
use serde::Serialize;
use time::{OffsetDateTime, UtcOffset};
use tokio::{
    sync::{watch, Mutex, RwLock},
    time::sleep,
};

use crate::{
    config::{self, TimeOfDay, Weekday},
    db::{self, SharedStore},
    media,
    service::Locks,
};

#[derive(Debug, Display, derive_more::Error, From)]
pub enum Error {
    #[display("{_0}")]
    Store(db::Error),

    #[display("{_0}")]
    Media(media::Error),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    /// The store failed; counts cover what was deleted before that.
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    pub tickets_deleted: usize,
    pub files_deleted: usize,
    pub errors: Vec<String>,
    pub status: Outcome,
    /// Stopped early by shutdown.
    pub cancelled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub media_files: usize,
    pub media_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub measured_at: OffsetDateTime,
}

/// Current media usage next to what the configured retention would free.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageAnalysis {
    pub current_usage: DiskUsage,
    pub cleanup_candidates: Candidates,
}

/// What a run with the given retention would remove right now.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidates {
    #[serde(with = "time::serde::rfc3339::option")]
    pub cutoff: Option<OffsetDateTime>,
    pub tickets: usize,
    pub files: usize,
    pub bytes: u64,
}

/// `now - retention`, or [`None`] when the retention reaches beyond any
/// representable time.
fn cutoff(now: OffsetDateTime, retention: Duration) -> Option<OffsetDateTime> {
    time::Duration::try_from(retention)
        .ok()
        .and_then(|retention| now.checked_sub(retention))
}

pub struct Cleaner {
    store: SharedStore,
    media: Arc<dyn media::Storage>,
    locks: Arc<Locks>,
    orphan_min_age: Duration,
}

impl Cleaner {
    pub fn new(
        store: SharedStore,
        media: Arc<dyn media::Storage>,
        locks: Arc<Locks>,
        orphan_min_age: Duration,
    ) -> Self {
        Self {
            store,
            media,
            locks,
            orphan_min_age,
        }
    }

    /// Deletes tickets created at or before `now - retention` together with
    /// their photos, then unreferenced media files.
    ///
    /// Stops between tickets once `shutdown` turns `true`. Individual file
    /// failures are recorded in the report and do not stop the run.
    pub async fn run(
        &self,
        retention: Duration,
        shutdown: &watch::Receiver<bool>,
    ) -> Report {
        let started_at = OffsetDateTime::now_utc();
        let mut report = Report {
            started_at,
            completed_at: started_at,
            tickets_deleted: 0,
            files_deleted: 0,
            errors: Vec::new(),
            status: Outcome::Completed,
            cancelled: false,
        };
        tracing::info!(retention_secs = retention.as_secs(), "cleanup started");

        if let Err(e) = self.sweep(retention, shutdown, &mut report).await {
            tracing::error!("cleanup failed: {e}");
            report.status = Outcome::Failed;
            report.errors.push(e.to_string());
        }

        report.completed_at = OffsetDateTime::now_utc();
        tracing::info!(
            tickets_deleted = report.tickets_deleted,
            files_deleted = report.files_deleted,
            errors = report.errors.len(),
            cancelled = report.cancelled,
            "cleanup finished",
        );
        report
    }

    async fn sweep(
        &self,
        retention: Duration,
        shutdown: &watch::Receiver<bool>,
        report: &mut Report,
    ) -> Result<(), db::Error> {
        let expired = match cutoff(report.started_at, retention) {
            Some(cutoff) => self.store.list_tickets_created_before(cutoff).await?,
            None => Vec::new(),
        };

        for listed in expired {
            if *shutdown.borrow() {
                report.cancelled = true;
                return Ok(());
            }

            let _guard = self.locks.lock(listed.id).await;
            // Photos may have been replaced since the listing.
            let Some(ticket) = self.store.get_ticket_by_id(listed.id).await?
            else {
                continue;
            };
            for name in ticket.photos() {
                self.remove_file(name, report).await;
            }
            if self.store.delete_ticket(ticket.id).await? {
                report.tickets_deleted += 1;
                tracing::debug!(ticket_id = %ticket.id, "expired ticket deleted");
            }
        }

        self.sweep_orphans(report).await
    }

    async fn sweep_orphans(&self, report: &mut Report) -> Result<(), db::Error> {
        let referenced = self.store.photo_paths().await?;
        let files = match self.media.list().await {
            Ok(files) => files,
            Err(e) => {
                report.errors.push(format!("listing media files: {e}"));
                return Ok(());
            }
        };

        let now = OffsetDateTime::now_utc();
        for file in files {
            let old_enough = cutoff(now, self.orphan_min_age)
                .map_or(false, |cutoff| file.modified <= cutoff);
            if old_enough && !referenced.contains(&file.name) {
                self.remove_file(&file.name, report).await;
            }
        }
        Ok(())
    }

    async fn remove_file(&self, name: &str, report: &mut Report) {
        let removed = match self.media.exists(name).await {
            Ok(false) => return,
            Ok(true) => self.media.delete(name).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => report.files_deleted += 1,
            Err(e) => {
                tracing::warn!(%name, "failed to delete media file: {e}");
                report.errors.push(format!("deleting {name}: {e}"));
            }
        }
    }

    pub async fn disk_usage(&self) -> Result<DiskUsage, Error> {
        let files = self.media.list().await?;
        Ok(DiskUsage {
            media_files: files.len(),
            media_bytes: files.iter().map(|f| f.size).sum(),
            measured_at: OffsetDateTime::now_utc(),
        })
    }

    pub async fn candidates(
        &self,
        retention: Duration,
    ) -> Result<Candidates, Error> {
        let cutoff = cutoff(OffsetDateTime::now_utc(), retention);
        let expired = match cutoff {
            Some(cutoff) => self.store.list_tickets_created_before(cutoff).await?,
            None => Vec::new(),
        };

        let names = expired
            .iter()
            .flat_map(|t| t.photos())
            .collect::<HashSet<_>>();
        let (mut files, mut bytes) = (0, 0);
        for name in names {
            if let Ok(size) = self.media.size(name).await {
                files += 1;
                bytes += size;
            }
        }

        Ok(Candidates {
            cutoff,
            tickets: expired.len(),
            files,
            bytes,
        })
    }

    pub async fn analyze(
        &self,
        retention: Duration,
    ) -> Result<StorageAnalysis, Error> {
        Ok(StorageAnalysis {
            current_usage: self.disk_usage().await?,
            cleanup_candidates: self.candidates(retention).await?,
        })
    }
}

/// Next `at` (UTC) strictly after `now`.
pub fn next_daily(now: OffsetDateTime, at: TimeOfDay) -> OffsetDateTime {
    let now = now.to_offset(UtcOffset::UTC);
    let today = now.replace_time(at.time());
    if today > now {
        today
    } else {
        today + time::Duration::days(1)
    }
}

/// Next `on` at `at` (UTC) strictly after `now`.
pub fn next_weekly(
    now: OffsetDateTime,
    on: Weekday,
    at: TimeOfDay,
) -> OffsetDateTime {
    let now = now.to_offset(UtcOffset::UTC);
    let target = time::Weekday::from(on).number_days_from_monday();
    let current = now.weekday().number_days_from_monday();
    let ahead = (7 + target - current) % 7;
    let candidate = now.replace_time(at.time())
        + time::Duration::days(ahead.into());
    if candidate > now {
        candidate
    } else {
        candidate + time::Duration::weeks(1)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Job {
    Cleanup,
    Analysis,
}

/// Due times of the scheduled jobs. A due time only moves forward once its
/// job has run, so neither job can starve the other.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Due {
    cleanup: OffsetDateTime,
    analysis: OffsetDateTime,
}

impl Due {
    fn new(now: OffsetDateTime, config: &config::Cleanup) -> Self {
        Self {
            cleanup: next_daily(now, config.daily_at),
            analysis: next_weekly(now, config.weekly_on, config.weekly_at),
        }
    }

    fn earliest(&self) -> OffsetDateTime {
        self.cleanup.min(self.analysis)
    }

    /// Jobs due at `now`, cleanup first.
    fn pending(&self, now: OffsetDateTime) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(2);
        if self.cleanup <= now {
            jobs.push(Job::Cleanup);
        }
        if self.analysis <= now {
            jobs.push(Job::Analysis);
        }
        jobs
    }

    /// Moves `job` to its next slot after both its due time and `now`.
    fn advance(
        &mut self,
        job: Job,
        now: OffsetDateTime,
        config: &config::Cleanup,
    ) {
        match job {
            Job::Cleanup => {
                self.cleanup =
                    next_daily(now.max(self.cleanup), config.daily_at);
            }
            Job::Analysis => {
                self.analysis = next_weekly(
                    now.max(self.analysis),
                    config.weekly_on,
                    config.weekly_at,
                );
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub cleanup_in_progress: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_cleanup: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_analysis: Option<OffsetDateTime>,
    pub last_report: Option<Report>,
}

/// Runs the daily cleanup and the weekly analysis at their configured times
/// until shutdown.
pub struct Scheduler {
    cleaner: Arc<Cleaner>,
    config: config::Cleanup,
    shutdown: watch::Receiver<bool>,
    status: RwLock<SchedulerStatus>,
    /// Held for the duration of a cleanup run.
    exclusive: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        cleaner: Arc<Cleaner>,
        config: config::Cleanup,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cleaner,
            config,
            shutdown,
            status: RwLock::default(),
            exclusive: Mutex::new(()),
        }
    }

    pub fn cleaner(&self) -> &Cleaner {
        &self.cleaner
    }

    pub fn retention(&self) -> Duration {
        self.config.retention
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.status.read().await.clone()
    }

    /// One cleanup run at a time; a second caller waits for the first.
    pub async fn run_cleanup(&self, retention: Duration) -> Report {
        let _exclusive = self.exclusive.lock().await;
        self.status.write().await.cleanup_in_progress = true;

        let report = self.cleaner.run(retention, &self.shutdown).await;

        let mut status = self.status.write().await;
        status.cleanup_in_progress = false;
        status.last_report = Some(report.clone());
        report
    }

    pub async fn analyze(&self) {
        match self.cleaner.analyze(self.config.retention).await {
            Ok(StorageAnalysis {
                current_usage: usage,
                cleanup_candidates: candidates,
            }) => tracing::info!(
                media_files = usage.media_files,
                media_bytes = usage.media_bytes,
                expired_tickets = candidates.tickets,
                expired_files = candidates.files,
                "weekly storage analysis",
            ),
            Err(e) => tracing::warn!("weekly storage analysis failed: {e}"),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        self.status.write().await.running = true;

        let mut due = Due::new(OffsetDateTime::now_utc(), &self.config);
        while !*shutdown.borrow() {
            {
                let mut status = self.status.write().await;
                status.next_cleanup = Some(due.cleanup);
                status.next_analysis = Some(due.analysis);
            }

            let wait = Duration::try_from(
                due.earliest() - OffsetDateTime::now_utc(),
            )
            .unwrap_or_default();
            tokio::select! {
                _ = sleep(wait) => {}
                changed = shutdown.changed() => {
                    // A dropped sender can never signal again.
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let now = OffsetDateTime::now_utc().max(due.earliest());
            for job in due.pending(now) {
                match job {
                    Job::Cleanup => {
                        self.run_cleanup(self.config.retention).await;
                    }
                    Job::Analysis => self.analyze().await,
                }
                due.advance(job, OffsetDateTime::now_utc(), &self.config);
            }
        }

        self.status.write().await.running = false;
        tracing::info!("cleanup scheduler stopped");
    }
}
