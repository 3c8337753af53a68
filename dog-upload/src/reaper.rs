use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::{SessionState, UploadEvent, UploadResult, UploadSessionStore};

/// Shortest sweep period; `tokio::time::interval` rejects zero
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// What one sweep cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Idle sessions expired and discarded
    pub expired: usize,
    /// Staging artifacts from earlier failed deletes now removed
    pub orphans_cleaned: usize,
    /// Completion receipts past retention
    pub pruned: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Idle session reaper for reclaiming abandoned uploads
pub struct SessionReaper {
    sessions: Arc<UploadSessionStore>,
    events: broadcast::Sender<UploadEvent>,
    idle_timeout: Duration,
    completed_retention: Duration,
    interval: Duration,
}

impl SessionReaper {
    pub fn new(
        sessions: Arc<UploadSessionStore>,
        events: broadcast::Sender<UploadEvent>,
        idle_timeout: Duration,
        completed_retention: Duration,
    ) -> Self {
        Self {
            sessions,
            events,
            idle_timeout,
            completed_retention,
            interval: Duration::from_secs(60),
        }
    }

    /// Sweep every `interval` instead of the default minute
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Run sweeps forever
    pub async fn start(self) {
        let mut ticker = interval(self.interval);

        info!(
            "Starting session reaper with interval {:?}, idle timeout {:?}",
            self.interval, self.idle_timeout
        );

        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// Run sweeps on a background task until the handle is shut down
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown, mut stop) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            loop {
                tokio::select! {
                    _ = &mut stop => {
                        debug!("Session reaper stopping");
                        break;
                    }
                    _ = ticker.tick() => self.sweep().await,
                }
            }
        });

        ReaperHandle { shutdown, task }
    }

    async fn sweep(&self) {
        match self.reap_once().await {
            Ok(report) if report.is_empty() => debug!("Nothing to reap"),
            Ok(report) => info!(
                "Reaped {} idle sessions, {} orphaned staging files, {} receipts",
                report.expired, report.orphans_cleaned, report.pruned
            ),
            Err(e) => warn!("Error during session reaping: {}", e),
        }
    }

    /// Run one sweep
    pub async fn reap_once(&self) -> UploadResult<ReapReport> {
        let now = Utc::now();
        let idle_cutoff = now - age(self.idle_timeout);
        let mut report = ReapReport::default();

        for handle in self.sessions.list_expired(idle_cutoff) {
            let mut session = handle.lock().await;
            // A chunk may have landed between listing and locking.
            if session.state != SessionState::Active || session.last_activity > idle_cutoff {
                continue;
            }

            session.state = SessionState::Expired;
            info!(
                "Expiring upload {} idle since {} at chunk {} of {}",
                session.upload_id(),
                session.last_activity,
                session.next_expected_index,
                session.declared_total
            );
            if let Err(e) = self.sessions.remove(&session).await {
                warn!("Expired upload {} left staging behind: {}", session.upload_id(), e);
            }

            let _ = self.events.send(UploadEvent::Expired {
                upload_id: session.upload_id().clone(),
                at: now,
            });
            report.expired += 1;
        }

        report.orphans_cleaned = self.sessions.retry_orphans().await;
        report.pruned = self
            .sessions
            .prune_completed(now - age(self.completed_retention));

        Ok(report)
    }
}

/// Handle to a reaper running on a background task
pub struct ReaperHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for its task to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!("Session reaper task ended abnormally: {}", e);
        }
    }
}

fn age(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStagingStore, NameReservations, StagingStore};
    use tracing_test::traced_test;

    fn setup(memory: &MemoryStagingStore) -> (Arc<UploadSessionStore>, broadcast::Sender<UploadEvent>) {
        let sessions = Arc::new(UploadSessionStore::new(
            Arc::new(memory.clone()),
            Arc::new(NameReservations::new(128)),
        ));
        let (events, _) = broadcast::channel(16);
        (sessions, events)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_idle_sessions_are_expired_and_discarded() {
        let memory = MemoryStagingStore::new();
        let (sessions, events) = setup(&memory);
        let mut rx = events.subscribe();

        let (idle, _) = sessions.resolve_or_create(&"idle".into(), 3, None).await.unwrap();
        {
            let mut session = idle.lock().await;
            memory.append(&session.staging, 0, b"A").await.unwrap();
            session.last_activity = Utc::now() - chrono::Duration::minutes(10);
        }
        let (fresh, _) = sessions.resolve_or_create(&"fresh".into(), 3, None).await.unwrap();

        let reaper = SessionReaper::new(
            sessions.clone(),
            events,
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        let report = reaper.reap_once().await.unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(idle.lock().await.state, SessionState::Expired);
        assert_eq!(fresh.lock().await.state, SessionState::Active);
        assert_eq!(sessions.len(), 1);
        assert_eq!(memory.staging_count(), 0);
        assert!(matches!(rx.recv().await.unwrap(), UploadEvent::Expired { .. }));
        assert!(logs_contain("Expiring upload idle"));
    }

    #[tokio::test]
    async fn test_failed_delete_is_retried_next_sweep() {
        let memory = MemoryStagingStore::new();
        let (sessions, events) = setup(&memory);
        let (idle, _) = sessions.resolve_or_create(&"idle".into(), 3, None).await.unwrap();
        memory.append(&idle.lock().await.staging, 0, b"A").await.unwrap();

        let reaper = SessionReaper::new(sessions.clone(), events, Duration::ZERO, Duration::from_secs(600));
        memory.fail_next_discards(1);

        let first = reaper.reap_once().await.unwrap();
        assert_eq!(first.expired, 1);
        assert_eq!(first.orphans_cleaned, 1);
        assert_eq!(memory.staging_count(), 0);
        assert!(reaper.reap_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_interval_still_sweeps() {
        let memory = MemoryStagingStore::new();
        let (sessions, events) = setup(&memory);
        sessions.resolve_or_create(&"idle".into(), 3, None).await.unwrap();

        let handle = SessionReaper::new(sessions.clone(), events, Duration::ZERO, Duration::ZERO)
            .with_interval(Duration::ZERO)
            .spawn();

        for _ in 0..100 {
            if sessions.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sessions.is_empty());
        assert!(!handle.task.is_finished());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawned_reaper_shuts_down() {
        let memory = MemoryStagingStore::new();
        let (sessions, events) = setup(&memory);
        sessions.resolve_or_create(&"idle".into(), 3, None).await.unwrap();

        let handle = SessionReaper::new(sessions.clone(), events, Duration::ZERO, Duration::ZERO)
            .with_interval(Duration::from_millis(10))
            .spawn();

        for _ in 0..100 {
            if sessions.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        assert!(sessions.is_empty());
    }
}
