//! Worker liveness and exit monitoring
//!
//! One loop per agent. Exits are checked on every tick; missing keep-alives
//! only count while timeout detection is switched on by the coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::manager::WorkerProcessManager;
use super::process::ExitOutcome;
use crate::protocol::FailureKind;

/// Configuration for the timeout detector
#[derive(Debug, Clone)]
pub struct TimeoutDetectorConfig {
    /// Interval between checks (default: 1s)
    pub check_interval: Duration,
    /// Silence after which a worker is reported (default: 60s)
    pub threshold: Duration,
}

impl Default for TimeoutDetectorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            threshold: Duration::from_secs(60),
        }
    }
}

/// Outcome of one check cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub exited: usize,
    pub timed_out: usize,
}

pub struct WorkerTimeoutDetector {
    config: TimeoutDetectorConfig,
    manager: Arc<WorkerProcessManager>,
    detecting: AtomicBool,
    running: Arc<AtomicBool>,
}

impl WorkerTimeoutDetector {
    pub fn new(config: TimeoutDetectorConfig, manager: Arc<WorkerProcessManager>) -> Self {
        Self {
            config,
            manager,
            detecting: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start_detection(&self) {
        if !self.detecting.swap(true, Ordering::SeqCst) {
            // Silence before detection started does not count
            for process in self.manager.processes() {
                process.touch();
            }
            info!("Worker timeout detection started (threshold {:?})", self.config.threshold);
        }
    }

    pub fn stop_detection(&self) {
        if self.detecting.swap(false, Ordering::SeqCst) {
            info!("Worker timeout detection stopped");
        }
    }

    pub fn is_detecting(&self) -> bool {
        self.detecting.load(Ordering::SeqCst)
    }

    /// Spawn the monitoring loop; it runs until [`stop`](Self::stop)
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let detector = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(detector.config.check_interval);
            while detector.running.load(Ordering::SeqCst) {
                interval.tick().await;
                detector.check().await;
            }
            debug!("Worker monitor stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_detection();
    }

    /// Run one check cycle
    pub async fn check(&self) -> CheckReport {
        let mut report = CheckReport::default();
        let failures = self.manager.failure_handler().clone();
        let detecting = self.is_detecting();

        for process in self.manager.processes() {
            let address = process.address();

            if let Some(outcome) = process.try_exit().await {
                self.manager.remove(&address);
                report.exited += 1;
                if process.is_stopping() {
                    debug!("Worker {} exited as requested", address);
                    continue;
                }
                match outcome {
                    ExitOutcome::Success => {
                        failures
                            .handle(
                                "Worker exited normally",
                                FailureKind::WorkerFinished,
                                Some(&process),
                                None,
                                None,
                            )
                            .await;
                    }
                    ExitOutcome::Failed(reason) => {
                        failures
                            .handle(
                                "Worker terminated",
                                FailureKind::WorkerExit,
                                Some(&process),
                                None,
                                Some(reason),
                            )
                            .await;
                    }
                }
                continue;
            }

            if !detecting || !process.speaks_protocol() || process.is_stopping() {
                continue;
            }
            let silent = process.silent_for();
            if silent > self.config.threshold && process.flag_timeout() {
                report.timed_out += 1;
                warn!("Worker {} silent for {:?}", address, silent);
                failures
                    .handle(
                        format!("Worker has not sent a keep-alive for {}s", silent.as_secs()),
                        FailureKind::WorkerTimeout,
                        Some(&process),
                        None,
                        None,
                    )
                    .await;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::failure::FailureHandler;
    use crate::agent::launcher::{LaunchMode, WorkerProcessLauncher};
    use crate::protocol::{
        CreateWorkerOperation, Endpoint, OperationProcessor, Promise, SimulatorAddress,
        SimulatorOperation, WorkerParameters, WorkerType,
    };
    use crate::transport::MessageBus;
    use async_trait::async_trait;
    use std::path::Path;

    struct KeepAliveSink(Arc<WorkerProcessManager>);

    #[async_trait]
    impl OperationProcessor for KeepAliveSink {
        async fn process(&self, source: SimulatorAddress, operation: SimulatorOperation, _promise: Promise) {
            if operation == SimulatorOperation::KeepAlive {
                self.0.update_last_seen_timestamp(&source);
            }
        }
    }

    fn manager(bus: Arc<MessageBus>, mode: LaunchMode, home: &Path) -> Arc<WorkerProcessManager> {
        let endpoint = Endpoint::new(SimulatorAddress::agent(1), bus);
        let launcher = WorkerProcessLauncher::new(
            SimulatorAddress::agent(1),
            mode,
            home,
            Duration::from_secs(3600),
        );
        let failures = Arc::new(FailureHandler::new(endpoint.clone()));
        Arc::new(WorkerProcessManager::new(endpoint, launcher, failures, Duration::from_millis(100)))
    }

    async fn launch(manager: &Arc<WorkerProcessManager>, worker: u32, parameters: WorkerParameters) {
        let (promise, rx) = Promise::local();
        manager
            .launch(
                CreateWorkerOperation {
                    address: SimulatorAddress::worker(1, worker),
                    parameters,
                    delay_ms: 0,
                },
                promise,
            )
            .await
            .unwrap();
        rx.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_only_while_detecting() {
        let bus = MessageBus::new();
        let manager = manager(
            bus.clone(),
            LaunchMode::Embedded { transport: bus.clone() },
            Path::new("unused"),
        );
        Endpoint::new(SimulatorAddress::agent(1), bus.clone())
            .attach(Arc::new(KeepAliveSink(manager.clone())))
            .unwrap();
        // One keep-alive at start, then silence
        launch(&manager, 1, WorkerParameters::new(WorkerType::Member)).await;

        let detector = WorkerTimeoutDetector::new(
            TimeoutDetectorConfig {
                check_interval: Duration::from_secs(1),
                threshold: Duration::from_secs(10),
            },
            manager.clone(),
        );

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(detector.check().await.timed_out, 0);

        detector.start_detection();
        assert_eq!(detector.check().await.timed_out, 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(detector.check().await.timed_out, 1);
        // Reported once per silence
        assert_eq!(detector.check().await.timed_out, 0);
        assert_eq!(manager.failure_handler().failure_count(), 1);

        manager.update_last_seen_timestamp(&SimulatorAddress::worker(1, 1));
        detector.stop_detection();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(detector.check().await.timed_out, 0);
        assert_eq!(manager.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_is_reported_and_removed() {
        let home = tempfile::tempdir().unwrap();
        let manager = manager(
            MessageBus::new(),
            LaunchMode::Process {
                agent_endpoint: "127.0.0.1:9000".into(),
            },
            home.path(),
        );
        launch(
            &manager,
            1,
            WorkerParameters::new(WorkerType::Member).with_command("sh", &["-c", "sleep 0.1; exit 2"]),
        )
        .await;
        launch(
            &manager,
            2,
            WorkerParameters::new(WorkerType::Member).with_command("sh", &["-c", "sleep 0.1"]),
        )
        .await;
        manager.get(&SimulatorAddress::worker(1, 2)).unwrap().mark_stopping();

        let detector = WorkerTimeoutDetector::new(TimeoutDetectorConfig::default(), manager.clone());
        let mut exited = 0;
        for _ in 0..200 {
            exited += detector.check().await.exited;
            if exited == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(exited, 2);
        assert!(manager.is_empty());
        // The requested stop is not a failure
        assert_eq!(manager.failure_handler().failure_count(), 1);
    }
}
