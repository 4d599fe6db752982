//! Runtime handle of one launched worker

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SimulatorError};
use crate::protocol::{SimulatorAddress, WorkerParameters};

/// What actually runs the worker
pub enum WorkerHandle {
    Os(Child),
    Embedded(JoinHandle<()>),
    /// Already reaped
    Gone,
}

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failed(String),
}

pub struct WorkerProcess {
    address: SimulatorAddress,
    parameters: WorkerParameters,
    pid: Option<u32>,
    home: Option<PathBuf>,
    /// Worker runs the simulator worker runtime and sends keep-alives
    speaks_protocol: bool,
    handle: Mutex<WorkerHandle>,
    last_seen: StdMutex<Instant>,
    ready: Notify,
    has_reported: AtomicBool,
    /// The agent asked this worker to stop, or it announced its own finish
    stopping: AtomicBool,
    timeout_reported: AtomicBool,
}

impl WorkerProcess {
    pub fn os(
        address: SimulatorAddress,
        parameters: WorkerParameters,
        child: Child,
        home: Option<PathBuf>,
        speaks_protocol: bool,
    ) -> Self {
        let pid = child.id();
        Self::build(address, parameters, WorkerHandle::Os(child), pid, home, speaks_protocol)
    }

    pub fn embedded(address: SimulatorAddress, parameters: WorkerParameters, task: JoinHandle<()>) -> Self {
        Self::build(address, parameters, WorkerHandle::Embedded(task), None, None, true)
    }

    fn build(
        address: SimulatorAddress,
        parameters: WorkerParameters,
        handle: WorkerHandle,
        pid: Option<u32>,
        home: Option<PathBuf>,
        speaks_protocol: bool,
    ) -> Self {
        Self {
            address,
            parameters,
            pid,
            home,
            speaks_protocol,
            handle: Mutex::new(handle),
            last_seen: StdMutex::new(Instant::now()),
            ready: Notify::new(),
            has_reported: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            timeout_reported: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> SimulatorAddress {
        self.address
    }

    pub fn parameters(&self) -> &WorkerParameters {
        &self.parameters
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn home(&self) -> Option<&PathBuf> {
        self.home.as_ref()
    }

    /// Identifier used in failure reports
    pub fn worker_id(&self) -> String {
        match self.pid {
            Some(pid) => format!("worker-{}-{}", self.address, pid),
            None => format!("worker-{}-embedded", self.address),
        }
    }

    pub fn speaks_protocol(&self) -> bool {
        self.speaks_protocol
    }

    /// Record a liveness signal
    pub fn touch(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Instant::now();
        }
        self.timeout_reported.store(false, Ordering::SeqCst);
        if !self.has_reported.swap(true, Ordering::SeqCst) {
            self.ready.notify_waiters();
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen.lock().map(|t| *t).unwrap_or_else(|_| Instant::now())
    }

    pub fn silent_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_seen())
    }

    pub fn has_reported(&self) -> bool {
        self.has_reported.load(Ordering::SeqCst)
    }

    /// Resolves once the first liveness signal arrived
    pub async fn wait_reported(&self) {
        loop {
            let notified = self.ready.notified();
            if self.has_reported() {
                return;
            }
            notified.await;
        }
    }

    /// Returns true the first time
    pub fn mark_stopping(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Returns true the first time a timeout is flagged since the last keep-alive
    pub fn flag_timeout(&self) -> bool {
        !self.timeout_reported.swap(true, Ordering::SeqCst)
    }

    /// Non-blocking exit check
    pub async fn try_exit(&self) -> Option<ExitOutcome> {
        let mut handle = self.handle.lock().await;
        let outcome = match &mut *handle {
            WorkerHandle::Os(child) => match child.try_wait() {
                Ok(Some(status)) if status.success() => ExitOutcome::Success,
                Ok(Some(status)) => ExitOutcome::Failed(format!("exited with {status}")),
                Ok(None) => return None,
                Err(e) => ExitOutcome::Failed(format!("wait failed: {e}")),
            },
            WorkerHandle::Embedded(task) if task.is_finished() => ExitOutcome::Success,
            WorkerHandle::Embedded(_) => return None,
            WorkerHandle::Gone => return None,
        };
        *handle = WorkerHandle::Gone;
        Some(outcome)
    }

    /// Stop the worker: SIGTERM, wait up to `grace`, then kill
    pub async fn terminate(&self, grace: Duration) -> Result<()> {
        self.mark_stopping();
        let mut handle = self.handle.lock().await;
        match &mut *handle {
            WorkerHandle::Os(child) => {
                send_sigterm(self.pid);
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => debug!("Worker {} exited with {}", self.address, status),
                    Ok(Err(e)) => {
                        return Err(SimulatorError::WorkerProcess(format!(
                            "waiting for {} failed: {e}",
                            self.address
                        )))
                    }
                    Err(_) => {
                        warn!("Worker {} ignored SIGTERM for {:?}, killing", self.address, grace);
                        child.kill().await?;
                    }
                }
            }
            WorkerHandle::Embedded(task) => {
                if tokio::time::timeout(grace, &mut *task).await.is_err() {
                    warn!("Embedded worker {} did not stop within {:?}, aborting", self.address, grace);
                    task.abort();
                }
            }
            WorkerHandle::Gone => {}
        }
        *handle = WorkerHandle::Gone;
        Ok(())
    }
}

#[cfg(unix)]
fn send_sigterm(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkerType;

    #[tokio::test]
    async fn test_embedded_exit_and_terminate() {
        let task = tokio::spawn(async {});
        let process = WorkerProcess::embedded(
            SimulatorAddress::worker(1, 1),
            WorkerParameters::new(WorkerType::Member),
            task,
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(process.try_exit().await, Some(ExitOutcome::Success));
        // Reaped once
        assert_eq!(process.try_exit().await, None);
        process.terminate(Duration::from_millis(10)).await.unwrap();
        assert!(process.is_stopping());
    }

    #[tokio::test]
    async fn test_embedded_terminate_aborts_stuck_worker() {
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let process = WorkerProcess::embedded(
            SimulatorAddress::worker(1, 2),
            WorkerParameters::new(WorkerType::Client),
            task,
        );
        process.terminate(Duration::from_millis(20)).await.unwrap();
        assert_eq!(process.try_exit().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_tracking() {
        let process = WorkerProcess::embedded(
            SimulatorAddress::worker(1, 3),
            WorkerParameters::new(WorkerType::Member),
            tokio::spawn(std::future::pending::<()>()),
        );
        assert!(!process.has_reported());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(process.silent_for() >= Duration::from_secs(30));

        assert!(process.flag_timeout());
        assert!(!process.flag_timeout());

        process.touch();
        process.wait_reported().await;
        assert!(process.silent_for() < Duration::from_secs(1));
        assert!(process.flag_timeout());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_os_process_exit_status() {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let process = WorkerProcess::os(
            SimulatorAddress::worker(2, 1),
            WorkerParameters::new(WorkerType::Member),
            child,
            None,
            false,
        );
        let mut outcome = None;
        for _ in 0..100 {
            outcome = process.try_exit().await;
            if outcome.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(matches!(outcome, Some(ExitOutcome::Failed(_))));
    }
}
