pub mod app;
pub mod backend_path;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod port_manager;
pub mod process;
pub mod shell;
pub mod startup;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use app::{backend_url, APP_NAME, APP_VERSION};
use backend_path::{build_candidates, SearchRoots};
use config::ShellConfig;
use error::StartupFailure;
use health::{HealthProbe, HttpHealthProbe};
use process::{BackendSupervisor, PortConflictDetector, SupervisorEvent};
use shell::{resolve_locale, BrowserPresenter, Presenter, ShellEvent, ShellLifecycle};
use startup::{PollPolicy, StartupOrchestrator, StartupOutcome};

/// Chain a panic hook that stops the backend before the previous hook runs.
/// Holds only a weak handle, so the supervisor can still be dropped normally.
pub fn install_panic_cleanup(supervisor: &Arc<BackendSupervisor>) {
    let supervisor = Arc::downgrade(supervisor);
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Some(supervisor) = supervisor.upgrade() {
            supervisor.stop();
        }
        previous(info);
    }));
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received termination signal"),
    }
}

/// How the shell stopped serving a ready backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeEnd {
    /// The user asked to quit
    Quit,
    /// The backend went away on its own
    BackendLost(StartupFailure),
}

/// Keep watching the backend after it became ready until the user quits or it dies.
/// A clean exit 0 is logged and ignored, mirroring the startup rule.
pub async fn serve_until<F>(events: &mut UnboundedReceiver<SupervisorEvent>, quit: F) -> ServeEnd
where
    F: Future<Output = ()>,
{
    tokio::pin!(quit);
    let mut channel_open = true;

    loop {
        tokio::select! {
            _ = &mut quit => return ServeEnd::Quit,
            event = events.recv(), if channel_open => match event {
                Some(SupervisorEvent::PortConflict { stream, line }) => {
                    warn!("Backend reported a port conflict after startup [{}]: {}", stream, line);
                }
                Some(SupervisorEvent::Exited { requested: true, .. }) => return ServeEnd::Quit,
                Some(SupervisorEvent::Exited { code: Some(0), .. }) => {
                    info!("Backend exited cleanly while serving");
                }
                Some(SupervisorEvent::Exited { code, .. }) => {
                    return ServeEnd::BackendLost(StartupFailure::ProcessExitedEarly { code });
                }
                None => channel_open = false,
            },
        }
    }
}

/// Run startup unless the user quits first. A quit stops whatever startup has
/// spawned so far and yields `None` once the backend is gone.
pub async fn start_unless_quit<P, F>(
    orchestrator: &StartupOrchestrator<P>,
    lifecycle: &ShellLifecycle,
    quit: F,
) -> Option<(StartupOutcome, Option<UnboundedReceiver<SupervisorEvent>>)>
where
    P: HealthProbe,
    F: Future<Output = ()>,
{
    tokio::select! {
        started = orchestrator.startup_watched() => Some(started),
        _ = quit => {
            info!("Quit requested during startup");
            lifecycle.handle_and_settle(ShellEvent::BeforeQuit).await;
            None
        }
    }
}

async fn run_shell(config: ShellConfig, presenter: &BrowserPresenter) -> i32 {
    let detector = PortConflictDetector::new(
        &config.port_conflict.extra_patterns,
        config.port_conflict.replace_defaults,
    );
    let supervisor = Arc::new(BackendSupervisor::new(detector));
    install_panic_cleanup(&supervisor);
    let lifecycle = ShellLifecycle::new(supervisor.clone());

    let prober = match HttpHealthProbe::from_config(&config.health) {
        Ok(prober) => prober,
        Err(e) => {
            let failure = StartupFailure::Unknown(format!("failed to build HTTP client: {}", e));
            presenter.show_failure(&failure);
            return 1;
        }
    };

    let roots = SearchRoots::detect(config.backend.path.clone());
    let candidates = build_candidates(&roots, &config.backend.executable_names);
    info!("Backend candidates: {}", candidates.len());

    let orchestrator = StartupOrchestrator::new(
        supervisor.clone(),
        prober,
        candidates,
        config.ports.clone(),
        config.backend.clone(),
        PollPolicy::from_config(&config.health),
    );

    let quit = shutdown_signal();
    tokio::pin!(quit);

    let Some((outcome, events)) = start_unless_quit(&orchestrator, &lifecycle, &mut quit).await
    else {
        return 0;
    };
    let code = match (outcome, events) {
        (StartupOutcome::Ready(port), Some(mut events)) => {
            let url = backend_url(port);
            if let Err(e) = presenter.show_ready(&url) {
                // The service is up; the user can still open the URL by hand
                warn!("{:#}", e);
            }

            match serve_until(&mut events, &mut quit).await {
                ServeEnd::Quit => {
                    lifecycle.handle(ShellEvent::BeforeQuit);
                    0
                }
                ServeEnd::BackendLost(failure) => {
                    error!("Backend stopped unexpectedly: {}", failure);
                    log_recent_output(&supervisor);
                    presenter.show_failure(&failure);
                    1
                }
            }
        }
        (StartupOutcome::Ready(_), None) => {
            presenter.show_failure(&StartupFailure::Unknown(
                "backend ready without an event channel".to_string(),
            ));
            1
        }
        (StartupOutcome::Failed(failure), _) => {
            log_recent_output(&supervisor);
            presenter.show_failure(&failure);
            1
        }
    };

    lifecycle.handle(ShellEvent::AllWindowsClosed);
    supervisor.wait_until_settled().await;
    code
}

fn log_recent_output(supervisor: &BackendSupervisor) {
    let recent = supervisor.recent_output();
    if recent.is_empty() {
        return;
    }
    error!("Last {} backend output lines:", recent.len());
    for line in recent {
        error!("  {}", line);
    }
}

/// Entry point used by the binary. Returns the process exit code.
pub fn run() -> i32 {
    let config = ShellConfig::load();
    let log_file: Option<PathBuf> = logging::init_logging(&config.log_level);
    info!("Starting {} v{}", APP_NAME, APP_VERSION);

    let locale = resolve_locale(config.locale.as_deref(), |key| std::env::var(key).ok());
    let presenter = BrowserPresenter::new(locale, config.open_browser, log_file);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let failure = StartupFailure::Unknown(format!("failed to start async runtime: {}", e));
            presenter.show_failure(&failure);
            return 1;
        }
    };

    let code = runtime.block_on(run_shell(config, &presenter));
    info!("{} exiting with code {}", APP_NAME, code);
    code
}
