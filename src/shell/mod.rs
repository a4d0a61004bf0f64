/// Presentation side of the shell
/// The supervisor core only talks to a `Presenter`: hand over the URL when the
/// backend is ready, or the categorized failure text when it is not.
/// Host lifecycle events all funnel into `BackendSupervisor::stop`.

pub mod browser;
pub mod messages;

use std::sync::Arc;
use tracing::info;

use crate::error::StartupFailure;
use crate::process::BackendSupervisor;

pub use browser::BrowserPresenter;
pub use messages::{remediation_for, resolve_locale, Remediation, ShellLocale};

/// Receives the result of startup
pub trait Presenter: Send + Sync {
    /// Load `url` as the application's main content
    fn show_ready(&self, url: &str) -> anyhow::Result<()>;

    /// Blocking error report; the application terminates afterwards
    fn show_failure(&self, failure: &StartupFailure);
}

/// Host application signals that end the backend's life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellEvent {
    WindowClosed,
    AllWindowsClosed,
    BeforeQuit,
}

/// Routes host lifecycle signals to the supervisor
#[derive(Clone)]
pub struct ShellLifecycle {
    supervisor: Arc<BackendSupervisor>,
}

impl ShellLifecycle {
    pub fn new(supervisor: Arc<BackendSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Every exit path stops the backend; repeats are harmless
    pub fn handle(&self, event: ShellEvent) {
        info!("Shell event {:?}, stopping backend", event);
        self.supervisor.stop();
    }

    /// `handle`, then wait until the backend has actually gone away
    pub async fn handle_and_settle(&self, event: ShellEvent) {
        self.handle(event);
        self.supervisor.wait_until_settled().await;
    }
}
