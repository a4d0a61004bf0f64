/// Startup orchestration
/// resolve executable -> allocate port -> spawn -> poll health until ready,
/// racing every wait against port-conflict and exit signals from the supervisor

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use crate::backend_path::{resolve_executable, CandidatePath};
use crate::config::{BackendConfig, HealthConfig, PortConfig};
use crate::error::{HealthError, StartupFailure};
use crate::health::HealthProbe;
use crate::port_manager::find_available_port;
use crate::process::{BackendSupervisor, LaunchSpec, SupervisorEvent};

/// Terminal value of one startup attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    Ready(u16),
    Failed(StartupFailure),
}

/// Grace period and bounded retries for health polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub grace: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default())
    }
}

impl PollPolicy {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            grace: config.grace(),
            retry_delay: config.retry_delay(),
            // Zero attempts would never probe at all
            max_attempts: config.max_attempts.max(1),
        }
    }
}

/// Sequences resolution, port allocation, spawn and health polling into one outcome.
/// Not reentrant: a second `startup()` while one is running fails straight away.
pub struct StartupOrchestrator<P: HealthProbe> {
    supervisor: Arc<BackendSupervisor>,
    prober: P,
    candidates: Vec<CandidatePath>,
    ports: PortConfig,
    backend: BackendConfig,
    policy: PollPolicy,
    in_flight: AtomicBool,
}

impl<P: HealthProbe> StartupOrchestrator<P> {
    pub fn new(
        supervisor: Arc<BackendSupervisor>,
        prober: P,
        candidates: Vec<CandidatePath>,
        ports: PortConfig,
        backend: BackendConfig,
        policy: PollPolicy,
    ) -> Self {
        Self {
            supervisor,
            prober,
            candidates,
            ports,
            backend,
            policy,
            in_flight: AtomicBool::new(false),
        }
    }

    pub async fn startup(&self) -> StartupOutcome {
        self.startup_watched().await.0
    }

    /// Like `startup`, also handing back the supervisor event channel so the
    /// caller can keep watching the backend after it became ready
    pub async fn startup_watched(
        &self,
    ) -> (StartupOutcome, Option<UnboundedReceiver<SupervisorEvent>>) {
        let Some(_guard) = InFlightGuard::try_acquire(&self.in_flight) else {
            warn!("Startup requested while another startup is running");
            return (
                StartupOutcome::Failed(StartupFailure::Unknown(
                    "startup already in progress".to_string(),
                )),
                None,
            );
        };

        let executable = match resolve_executable(&self.candidates) {
            Ok(path) => path,
            Err(failure) => return (StartupOutcome::Failed(failure), None),
        };

        let ports = self.ports.clone();
        let port = match tokio::task::spawn_blocking(move || {
            find_available_port(ports.preferred_start, ports.fallback_start, ports.range_len)
        })
        .await
        {
            Ok(Ok(port)) => port,
            Ok(Err(failure)) => return (StartupOutcome::Failed(failure), None),
            Err(e) => {
                return (
                    StartupOutcome::Failed(StartupFailure::Unknown(format!(
                        "port search task failed: {}",
                        e
                    ))),
                    None,
                )
            }
        };
        info!("Using port: {}", port);

        let spec = LaunchSpec::for_backend(executable, port, &self.backend);
        let mut events = match self.supervisor.start(&spec) {
            Ok(events) => events,
            Err(failure) => return (StartupOutcome::Failed(failure), None),
        };

        let outcome = await_ready(&self.prober, port, &self.policy, &mut events).await;
        match &outcome {
            StartupOutcome::Ready(port) => {
                self.supervisor.mark_running();
                info!("✅ Backend ready on port {}", port);
            }
            StartupOutcome::Failed(failure) => {
                error!("Backend startup failed: {}", failure);
                // Never leave a half-started backend behind
                self.supervisor.stop();
            }
        }

        (outcome, Some(events))
    }
}

/// Grace period, then up to `max_attempts` probes spaced by `retry_delay`.
/// Supervisor signals preempt every wait and every in-flight probe.
pub async fn await_ready<P>(
    prober: &P,
    port: u16,
    policy: &PollPolicy,
    events: &mut UnboundedReceiver<SupervisorEvent>,
) -> StartupOutcome
where
    P: HealthProbe + ?Sized,
{
    info!(
        "Waiting {}ms for backend to initialize",
        policy.grace.as_millis()
    );
    tokio::select! {
        failure = next_failure(events) => return StartupOutcome::Failed(failure),
        _ = tokio::time::sleep(policy.grace) => {}
    }

    let mut attempts = 0;
    loop {
        let result: Result<(), HealthError> = tokio::select! {
            failure = next_failure(events) => return StartupOutcome::Failed(failure),
            result = prober.probe(port) => result,
        };
        attempts += 1;

        let last_error = match result {
            Ok(()) => {
                info!("Backend health check passed on attempt {}", attempts);
                return StartupOutcome::Ready(port);
            }
            Err(e) => e,
        };

        warn!(
            "Backend health check failed ({}/{}): {}",
            attempts, policy.max_attempts, last_error
        );
        if attempts >= policy.max_attempts {
            return StartupOutcome::Failed(StartupFailure::HealthCheckExhausted {
                attempts,
                last_error,
            });
        }

        tokio::select! {
            failure = next_failure(events) => return StartupOutcome::Failed(failure),
            _ = tokio::time::sleep(policy.retry_delay) => {}
        }
    }
}

/// Resolves with the first supervisor event that ends the startup.
/// Pends forever once the channel is closed.
async fn next_failure(events: &mut UnboundedReceiver<SupervisorEvent>) -> StartupFailure {
    loop {
        match events.recv().await {
            Some(event) => {
                if let Some(failure) = failure_for_event(event) {
                    return failure;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

fn failure_for_event(event: SupervisorEvent) -> Option<StartupFailure> {
    match event {
        SupervisorEvent::PortConflict { line, .. } => Some(StartupFailure::PortUnavailable {
            detail: format!("backend reported: {}", line),
        }),
        SupervisorEvent::Exited {
            requested: true, ..
        } => Some(StartupFailure::Unknown(
            "backend was stopped during startup".to_string(),
        )),
        SupervisorEvent::Exited {
            code: Some(0),
            requested: false,
        } => {
            // The backend may have handed off to a detached server; keep polling
            info!("Backend exited cleanly before becoming ready, continuing health checks");
            None
        }
        SupervisorEvent::Exited { code, .. } => Some(StartupFailure::ProcessExitedEarly { code }),
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{OutputStream, PortConflictDetector, ProcessState};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Fails until call number `healthy_on`, then reports healthy
    struct ScriptedProbe {
        healthy_on: Option<u32>,
        failure: HealthError,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn healthy_on(call: u32) -> Self {
            Self {
                healthy_on: Some(call),
                failure: HealthError::Unreachable("connection refused".to_string()),
                calls: AtomicU32::new(0),
            }
        }

        fn never(failure: HealthError) -> Self {
            Self {
                healthy_on: None,
                failure,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, _port: u16) -> Result<(), HealthError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.healthy_on {
                Some(n) if call >= n => Ok(()),
                _ => Err(self.failure.clone()),
            }
        }
    }

    fn within(elapsed: Duration, expected_secs: u64) -> bool {
        let expected = Duration::from_secs(expected_secs);
        elapsed >= expected && elapsed < expected + Duration::from_millis(500)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_third_probe() {
        let prober = ScriptedProbe::healthy_on(3);
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();

        let outcome = await_ready(&prober, 18060, &PollPolicy::default(), &mut rx).await;

        assert_eq!(outcome, StartupOutcome::Ready(18060));
        assert_eq!(prober.calls(), 3);
        // 3s grace + two 2s retry delays
        assert!(within(start.elapsed(), 7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let prober = ScriptedProbe::never(HealthError::BadStatus(503));
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();

        let outcome = await_ready(&prober, 18060, &PollPolicy::default(), &mut rx).await;

        assert_eq!(
            outcome,
            StartupOutcome::Failed(StartupFailure::HealthCheckExhausted {
                attempts: 5,
                last_error: HealthError::BadStatus(503),
            })
        );
        assert_eq!(prober.calls(), 5);
        // 3s grace + four 2s retry delays, no delay after the last attempt
        assert!(within(start.elapsed(), 11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_conflict_preempts_retry_wait() {
        let prober = ScriptedProbe::never(HealthError::Timeout);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            let _ = tx.send(SupervisorEvent::PortConflict {
                stream: OutputStream::Stderr,
                line: "bind: address already in use".to_string(),
            });
            // Keep the channel open past the retry delay
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let start = Instant::now();

        let outcome = await_ready(&prober, 18060, &PollPolicy::default(), &mut rx).await;

        assert!(matches!(
            outcome,
            StartupOutcome::Failed(StartupFailure::PortUnavailable { .. })
        ));
        assert_eq!(prober.calls(), 1);
        assert!(within(start.elapsed(), 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_conflict_during_grace_period() {
        let prober = ScriptedProbe::healthy_on(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SupervisorEvent::PortConflict {
            stream: OutputStream::Stdout,
            line: "端口被占用".to_string(),
        })
        .unwrap();

        let outcome = await_ready(&prober, 18060, &PollPolicy::default(), &mut rx).await;

        assert!(matches!(
            outcome,
            StartupOutcome::Failed(StartupFailure::PortUnavailable { .. })
        ));
        assert_eq!(prober.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_exit_with_error_code() {
        let prober = ScriptedProbe::never(HealthError::Unreachable("refused".to_string()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = tx.send(SupervisorEvent::Exited {
                code: Some(1),
                requested: false,
            });
        });

        let outcome = await_ready(&prober, 18060, &PollPolicy::default(), &mut rx).await;

        assert_eq!(
            outcome,
            StartupOutcome::Failed(StartupFailure::ProcessExitedEarly { code: Some(1) })
        );
        assert_eq!(prober.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_keeps_polling() {
        let prober = ScriptedProbe::healthy_on(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SupervisorEvent::Exited {
            code: Some(0),
            requested: false,
        })
        .unwrap();
        drop(tx);

        let outcome = await_ready(&prober, 18060, &PollPolicy::default(), &mut rx).await;

        assert_eq!(outcome, StartupOutcome::Ready(18060));
        assert_eq!(prober.calls(), 2);
    }

    #[test]
    fn test_policy_never_zero_attempts() {
        let config = HealthConfig {
            max_attempts: 0,
            ..HealthConfig::default()
        };
        assert_eq!(PollPolicy::from_config(&config).max_attempts, 1);
    }

    #[test]
    fn test_in_flight_guard() {
        let flag = AtomicBool::new(false);
        let first = InFlightGuard::try_acquire(&flag);
        assert!(first.is_some());
        assert!(InFlightGuard::try_acquire(&flag).is_none());
        drop(first);
        assert!(InFlightGuard::try_acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn test_missing_executable_never_spawns() {
        let supervisor = Arc::new(BackendSupervisor::new(PortConflictDetector::default()));
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = StartupOrchestrator::new(
            supervisor.clone(),
            ScriptedProbe::healthy_on(1),
            vec![CandidatePath::new(dir.path().join("backend").join("svc"))],
            PortConfig::default(),
            BackendConfig::default(),
            PollPolicy::default(),
        );

        let outcome = orchestrator.startup().await;

        assert_eq!(
            outcome,
            StartupOutcome::Failed(StartupFailure::ExecutableMissing { tried: 1 })
        );
        assert_eq!(supervisor.state(), ProcessState::Idle);
        assert!(supervisor.current().is_none());
        assert_eq!(orchestrator.prober.calls(), 0);
    }

    /// `/bin/sh -c <script> <port>` stands in for the backend: the headless
    /// flag becomes `-c` and the script sits where the port flag goes
    #[cfg(unix)]
    fn sh_orchestrator(
        supervisor: Arc<BackendSupervisor>,
        script: &str,
        policy: PollPolicy,
    ) -> StartupOrchestrator<ScriptedProbe> {
        let backend = BackendConfig {
            headless_flag: "-c".to_string(),
            port_flag: script.to_string(),
            ..BackendConfig::default()
        };
        StartupOrchestrator::new(
            supervisor,
            ScriptedProbe::never(HealthError::Unreachable("refused".to_string())),
            vec![CandidatePath::new(PathBuf::from("/bin/sh"))],
            PortConfig::default(),
            backend,
            policy,
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_backend_port_conflict_is_stopped() {
        let supervisor = Arc::new(BackendSupervisor::new(PortConflictDetector::default()));
        let policy = PollPolicy {
            grace: Duration::from_secs(20),
            retry_delay: Duration::from_secs(2),
            max_attempts: 5,
        };
        let orchestrator = sh_orchestrator(
            supervisor.clone(),
            "echo 'listen tcp: bind: address already in use'; sleep 30",
            policy,
        );

        let outcome = tokio::time::timeout(Duration::from_secs(10), orchestrator.startup())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            StartupOutcome::Failed(StartupFailure::PortUnavailable { .. })
        ));
        supervisor.wait_until_settled().await;
        assert_eq!(supervisor.state(), ProcessState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_backend_exit_code_one() {
        let supervisor = Arc::new(BackendSupervisor::new(PortConflictDetector::default()));
        let policy = PollPolicy {
            grace: Duration::from_secs(20),
            retry_delay: Duration::from_secs(2),
            max_attempts: 5,
        };
        let orchestrator = sh_orchestrator(supervisor.clone(), "exit 1", policy);

        let outcome = tokio::time::timeout(Duration::from_secs(10), orchestrator.startup())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StartupOutcome::Failed(StartupFailure::ProcessExitedEarly { code: Some(1) })
        );
        // Failed state is cleared by the orchestrator's stop()
        assert_eq!(supervisor.state(), ProcessState::Idle);
        assert_eq!(orchestrator.prober.calls(), 0);
    }
}
