//! Worker runtime
//!
//! Pops jobs off a connection and runs them through their handlers, applying
//! the retry/failure policy. `daemon` is the long-running mode; `run_next_job`
//! processes a single job for cron-style setups and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::control::RestartStore;
use crate::error::{QueueError, QueueResult};
use crate::events::{ExitStatus, QueueEvent};
use crate::failed::FailedJobProvider;
use crate::handler::JobHandler;
use crate::job::ReservedJob;
use crate::manager::QueueManager;

/// Tuning for one worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Delay applied when a failing job is released for retry
    pub backoff: Duration,
    /// Resident-memory ceiling in megabytes
    pub memory_mb: u64,
    /// Default per-job timeout, used when the envelope declares none
    pub timeout: Duration,
    /// Idle sleep between polls of an empty queue
    pub sleep: Duration,
    /// Default attempt limit; 0 means unbounded
    pub max_tries: u32,
    /// Keep working through maintenance mode
    pub force: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            backoff: Duration::ZERO,
            memory_mb: 128,
            timeout: Duration::from_secs(60),
            sleep: Duration::from_secs(3),
            max_tries: 0,
            force: false,
        }
    }
}

impl WorkerOptions {
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Clone-able handle for stopping and pausing a worker from outside, e.g.
/// from an OS signal handler.
#[derive(Clone, Default)]
pub struct WorkerSignals {
    should_quit: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl WorkerSignals {
    /// Finish the current job, then exit.
    pub fn stop(&self) {
        self.should_quit.store(true, Ordering::SeqCst);
    }

    /// Idle without polling until resumed.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn should_quit(&self) -> bool {
        self.should_quit.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

type KillHandler = Arc<dyn Fn(i32) + Send + Sync>;
type LoopGate = Box<dyn Fn() -> bool + Send + Sync>;

/// The worker.
pub struct Worker {
    manager: Arc<QueueManager>,
    failed: Arc<dyn FailedJobProvider>,
    restart: Arc<dyn RestartStore>,
    signals: WorkerSignals,
    gates: Vec<LoopGate>,
    kill: KillHandler,
}

impl Worker {
    pub fn new(
        manager: Arc<QueueManager>,
        failed: Arc<dyn FailedJobProvider>,
        restart: Arc<dyn RestartStore>,
    ) -> Self {
        Self {
            manager,
            failed,
            restart,
            signals: WorkerSignals::default(),
            gates: Vec::new(),
            kill: Arc::new(|code| std::process::exit(code)),
        }
    }

    /// Replace the process-exit used when a job wedges past its timeout.
    pub fn with_kill_handler(mut self, kill: KillHandler) -> Self {
        self.kill = kill;
        self
    }

    /// Add a gate consulted every loop iteration; returning false makes the
    /// worker idle this pass.
    pub fn with_loop_gate(mut self, gate: LoopGate) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn signals(&self) -> WorkerSignals {
        self.signals.clone()
    }

    /// Run until told to stop. `queues` is a comma-separated priority list;
    /// earlier names are always drained first.
    pub async fn daemon(
        &self,
        connection: Option<&str>,
        queues: &str,
        options: &WorkerOptions,
    ) -> ExitStatus {
        let last_restart = self.restart.get();
        info!(queues, "worker started");

        loop {
            self.manager.events().emit(QueueEvent::Looping {
                connection: connection
                    .unwrap_or(self.manager.default_connection())
                    .to_string(),
                queue: queues.to_string(),
            });

            if !self.daemon_should_run(options) {
                sleep(options.sleep).await;
                if let Some(status) = self.stop_if_necessary(options, last_restart) {
                    return self.stop(status);
                }
                continue;
            }

            match self.get_next_job(connection, queues).await {
                Some(job) => {
                    let guard = self.arm_timeout(&*job, options);
                    let result = self.process(&*job, options).await;
                    guard.abort();
                    if let Err(e) = result {
                        debug!(job = job.name(), error = %e, "job finished with error");
                    }
                }
                None => sleep(options.sleep).await,
            }

            if let Some(status) = self.stop_if_necessary(options, last_restart) {
                return self.stop(status);
            }
        }
    }

    /// Process at most one job. Returns whether a job was found; the job's
    /// own failure (after the retry/failure tree ran) comes back as `Err`.
    pub async fn run_next_job(
        &self,
        connection: Option<&str>,
        queues: &str,
        options: &WorkerOptions,
    ) -> QueueResult<bool> {
        match self.get_next_job(connection, queues).await {
            Some(job) => {
                self.process(&*job, options).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn daemon_should_run(&self, options: &WorkerOptions) -> bool {
        if self.manager.is_down_for_maintenance().unwrap_or(false) && !options.force {
            return false;
        }
        if self.signals.is_paused() {
            return false;
        }
        self.gates.iter().all(|gate| gate())
    }

    async fn get_next_job(
        &self,
        connection: Option<&str>,
        queues: &str,
    ) -> Option<Box<dyn ReservedJob>> {
        let queue = match self.manager.connection(connection).await {
            Ok(queue) => queue,
            Err(e) => {
                error!(error = %e, "failed to resolve connection");
                if e.is_lost_connection() {
                    self.signals.stop();
                }
                return None;
            }
        };

        for name in queues.split(',').map(str::trim).filter(|q| !q.is_empty()) {
            match queue.pop(Some(name)).await {
                Ok(Some(job)) => return Some(job),
                Ok(None) => continue,
                Err(e) => {
                    error!(queue = name, error = %e, "failed to pop job");
                    if e.is_lost_connection() {
                        self.signals.stop();
                    }
                    return None;
                }
            }
        }
        None
    }

    /// Spawn the watchdog that kills the process if the job wedges. The
    /// window gets the idle-sleep added so a job finishing right at its
    /// limit is not raced by the guard.
    fn arm_timeout(&self, job: &dyn ReservedJob, options: &WorkerOptions) -> tokio::task::JoinHandle<()> {
        let timeout = job
            .timeout()
            .map(Duration::from_secs)
            .unwrap_or(options.timeout)
            + options.sleep;
        let name = job.name().to_string();
        let kill = self.kill.clone();
        tokio::spawn(async move {
            sleep(timeout).await;
            error!(job = %name, "job exceeded its timeout, killing worker");
            kill(ExitStatus::Error.code());
        })
    }

    async fn process(&self, job: &dyn ReservedJob, options: &WorkerOptions) -> QueueResult<()> {
        self.manager.events().emit(QueueEvent::Processing {
            connection: job.connection().to_string(),
            queue: job.queue().to_string(),
            job: job.name().to_string(),
            id: job.job_id().to_string(),
        });

        let handler = match self.manager.resolver().resolve(job.name()) {
            Ok(handler) => handler,
            Err(e) => {
                // Retrying cannot fix an unregistered handler.
                self.fail_job(job, None, &e).await?;
                return Err(e);
            }
        };

        self.fail_if_already_exceeds_max_attempts(job, &handler, options)
            .await?;

        match handler.fire(job, &job.envelope().data).await {
            Ok(()) => {
                if job.state().is_pending() {
                    job.delete().await?;
                }
                self.manager.events().emit(QueueEvent::Processed {
                    connection: job.connection().to_string(),
                    queue: job.queue().to_string(),
                    job: job.name().to_string(),
                    id: job.job_id().to_string(),
                });
                Ok(())
            }
            Err(e) => self.handle_job_error(job, &handler, e, options).await,
        }
    }

    /// A job re-delivered after its limit (e.g. a worker died mid-run) is
    /// failed before the handler ever fires.
    async fn fail_if_already_exceeds_max_attempts(
        &self,
        job: &dyn ReservedJob,
        handler: &Arc<dyn JobHandler>,
        options: &WorkerOptions,
    ) -> QueueResult<()> {
        let max_tries = job.max_tries().unwrap_or(options.max_tries);
        if max_tries == 0 || job.attempts() <= max_tries {
            return Ok(());
        }

        let e = QueueError::MaxAttemptsExceeded {
            job: job.name().to_string(),
            max_tries,
        };
        self.fail_job(job, Some(handler), &e).await?;
        Err(e)
    }

    async fn handle_job_error(
        &self,
        job: &dyn ReservedJob,
        handler: &Arc<dyn JobHandler>,
        e: QueueError,
        options: &WorkerOptions,
    ) -> QueueResult<()> {
        let max_tries = job.max_tries().unwrap_or(options.max_tries);
        if max_tries > 0 && job.attempts() >= max_tries {
            self.fail_job(job, Some(handler), &e).await?;
        }

        self.manager.events().emit(QueueEvent::ExceptionOccurred {
            connection: job.connection().to_string(),
            queue: job.queue().to_string(),
            job: job.name().to_string(),
            id: job.job_id().to_string(),
            error: e.to_string(),
        });
        error!(job = job.name(), attempts = job.attempts(), error = %e, "job failed");

        if job.state().is_pending() && !job.has_failed() {
            job.release(options.backoff).await?;
            debug!(job = job.name(), backoff = ?options.backoff, "job released for retry");
        }
        Err(e)
    }

    /// Terminal failure: delete from the backend, run the handler's hook,
    /// emit the event, and write the ledger. Guarded so it runs once per job.
    async fn fail_job(
        &self,
        job: &dyn ReservedJob,
        handler: Option<&Arc<dyn JobHandler>>,
        e: &QueueError,
    ) -> QueueResult<()> {
        if !job.mark_failed() {
            return Ok(());
        }
        job.delete().await?;

        if let Some(handler) = handler {
            handler.failed(e, &job.envelope().data).await;
        }

        self.manager.events().emit(QueueEvent::Failed {
            connection: job.connection().to_string(),
            queue: job.queue().to_string(),
            job: job.name().to_string(),
            id: job.job_id().to_string(),
            error: e.to_string(),
        });
        self.failed
            .log(job.connection(), job.queue(), job.raw_payload(), &e.to_string())
            .await?;
        warn!(job = job.name(), error = %e, "job terminally failed");
        Ok(())
    }

    fn stop_if_necessary(
        &self,
        options: &WorkerOptions,
        last_restart: Option<i64>,
    ) -> Option<ExitStatus> {
        if self.signals.should_quit() {
            return Some(ExitStatus::Success);
        }
        if memory_exceeded(options.memory_mb) {
            return Some(ExitStatus::MemoryExceeded);
        }
        if self.restart.get() != last_restart {
            return Some(ExitStatus::Success);
        }
        None
    }

    fn stop(&self, status: ExitStatus) -> ExitStatus {
        self.manager
            .events()
            .emit(QueueEvent::WorkerStopping { status });
        info!(status = ?status, "worker stopping");
        status
    }
}

/// Resident set size in megabytes, 0 where it cannot be read.
fn memory_usage_mb() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return 0;
        };
        vm_rss_kb(&status) / 1024
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

// The `VmRSS:` value is already in kB, independent of the kernel page size.
#[cfg(target_os = "linux")]
fn vm_rss_kb(status: &str) -> u64 {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn memory_exceeded(limit_mb: u64) -> bool {
    limit_mb > 0 && memory_usage_mb() >= limit_mb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_defaults() {
        let options = WorkerOptions::default();
        assert_eq!(options.max_tries, 0);
        assert_eq!(options.memory_mb, 128);
        assert_eq!(options.sleep, Duration::from_secs(3));
        assert!(!options.force);
    }

    #[test]
    fn options_builders() {
        let options = WorkerOptions::default()
            .with_max_tries(3)
            .with_backoff(Duration::from_secs(5))
            .with_force(true);
        assert_eq!(options.max_tries, 3);
        assert_eq!(options.backoff, Duration::from_secs(5));
        assert!(options.force);
    }

    #[test]
    fn signals_toggle() {
        let signals = WorkerSignals::default();
        assert!(!signals.should_quit());
        assert!(!signals.is_paused());

        signals.pause();
        assert!(signals.is_paused());
        signals.resume();
        assert!(!signals.is_paused());

        signals.stop();
        assert!(signals.should_quit());
    }

    #[test]
    fn memory_probe_does_not_panic() {
        let _ = memory_usage_mb();
        assert!(!memory_exceeded(0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn rss_comes_from_the_vmrss_line() {
        let status = "Name:\tworker\nVmPeak:\t  999999 kB\nVmRSS:\t   51200 kB\nThreads:\t4\n";
        assert_eq!(vm_rss_kb(status), 51200);
        assert_eq!(vm_rss_kb("Name:\tworker\n"), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn running_process_reports_a_nonzero_rss() {
        assert!(memory_usage_mb() > 0);
    }
}
