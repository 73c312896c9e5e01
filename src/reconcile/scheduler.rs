//! Periodic reconciliation.
//!
//! Runs one pass per tick. A tick that finds another pass still running (in
//! this process or another process sharing the home directory) is skipped
//! rather than queued.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::pass::{PassReport, Reconciler};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(120);

/// Lock file name under the home directory
pub const LOCK_FILE: &str = "reconcile.lock";

/// Mutual exclusion for reconciliation passes
#[derive(Clone)]
pub struct RunGuard {
    local: Arc<Mutex<()>>,
    lock_path: PathBuf,
}

/// Held for the duration of one pass; releases both locks on drop
pub struct RunPermit {
    _local: OwnedMutexGuard<()>,
    file: File,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl RunGuard {
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            local: Arc::new(Mutex::new(())),
            lock_path: lock_path.into(),
        }
    }

    /// Guard using `<home>/reconcile.lock`
    pub fn in_home(home: &Path) -> Self {
        Self::new(home.join(LOCK_FILE))
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Take the guard without waiting. `Ok(None)` means a pass is running.
    pub fn try_acquire(&self) -> Result<Option<RunPermit>> {
        let local = match self.local.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => return Ok(None),
        };

        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock file: {}", self.lock_path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RunPermit {
                _local: local,
                file,
            })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e).context("Failed to lock reconcile.lock"),
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Result of one scheduler tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Ran(PassReport),

    /// Another pass held the guard
    Skipped,
}

pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    guard: RunGuard,
    interval: Duration,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, guard: RunGuard) -> Self {
        Self {
            reconciler,
            guard,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one guarded pass
    pub async fn tick(&self) -> Result<TickOutcome> {
        let Some(_permit) = self.guard.try_acquire()? else {
            info!(lock = %self.guard.lock_path().display(), "Reconciliation already running, skipping tick");
            return Ok(TickOutcome::Skipped);
        };

        let report = self
            .reconciler
            .run_pass()
            .await
            .context("Reconciliation pass failed")?;

        Ok(TickOutcome::Ran(report))
    }

    /// Tick on the configured interval until stopped
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(async move { self.run(stop_rx).await });
        SchedulerHandle { stop_tx, task }
    }

    async fn run(&self, mut stop_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = self.interval.as_secs(), "Reconciliation scheduler started");

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    info!("Reconciliation scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Ran(report)) => debug!(?report, "Tick complete"),
                        Ok(TickOutcome::Skipped) => {}
                        Err(e) => error!(error = %e, "Reconciliation tick failed"),
                    }
                }
            }
        }
    }
}

/// Handle for a running scheduler
pub struct SchedulerHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop after the current tick finishes
    pub async fn stop(self) -> Result<()> {
        if self.stop_tx.send(()).await.is_err() {
            warn!("Scheduler task already exited");
        }
        self.task.await.context("Scheduler task panicked")?;
        Ok(())
    }
}
