use anyhow::{bail, Context};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{error, info};

use super::messages::{remediation_for, ShellLocale};
use super::Presenter;
use crate::error::StartupFailure;

/// Shows the backend UI in the system browser and failures on stderr
pub struct BrowserPresenter {
    locale: ShellLocale,
    open_browser: bool,
    log_file: Option<PathBuf>,
}

impl BrowserPresenter {
    pub fn new(locale: ShellLocale, open_browser: bool, log_file: Option<PathBuf>) -> Self {
        Self {
            locale,
            open_browser,
            log_file,
        }
    }

    /// Full failure text as shown to the user
    pub fn failure_text(&self, failure: &StartupFailure) -> String {
        let remediation = remediation_for(failure.category(), self.locale);
        let log_hint = self.log_file.as_ref().map(|p| p.display().to_string());
        remediation.render(self.locale, log_hint.as_deref())
    }
}

impl Presenter for BrowserPresenter {
    fn show_ready(&self, url: &str) -> anyhow::Result<()> {
        let notice = match self.locale {
            ShellLocale::ZhCn => "服务已启动，请在浏览器中访问",
            ShellLocale::EnUs => "Service is running at",
        };
        println!("{} {}", notice, url);

        if !self.open_browser {
            return Ok(());
        }

        info!("Opening browser: {}", url);
        open_in_browser(url).with_context(|| format!("failed to open browser for {}", url))
    }

    fn show_failure(&self, failure: &StartupFailure) {
        let remediation = remediation_for(failure.category(), self.locale);
        error!(
            "Presenting failure [{}]: {}",
            failure.category().as_str(),
            failure
        );
        eprintln!("=== {} ===\n{}", remediation.title, self.failure_text(failure));
    }
}

fn open_in_browser(url: &str) -> anyhow::Result<()> {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/c", "start", "", url]);
        cmd
    } else if cfg!(target_os = "macos") {
        let mut cmd = Command::new("open");
        cmd.arg(url);
        cmd
    } else if cfg!(target_os = "linux") {
        let mut cmd = Command::new("xdg-open");
        cmd.arg(url);
        cmd
    } else {
        bail!("unsupported platform: {}", std::env::consts::OS);
    };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(())
}
