use crate::error::FailureCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellLocale {
    ZhCn,
    EnUs,
}

/// User-facing failure text for one category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remediation {
    pub title: &'static str,
    pub reason: &'static str,
    pub steps: &'static [&'static str],
}

impl Remediation {
    /// Full dialog body; `log_hint` points the user at the log file
    pub fn render(&self, locale: ShellLocale, log_hint: Option<&str>) -> String {
        let (header, reason_label, steps_label, log_label) = match locale {
            ShellLocale::ZhCn => ("无法启动后端服务", "错误原因：", "解决方案：", "日志文件："),
            ShellLocale::EnUs => (
                "Unable to start the backend service",
                "Reason: ",
                "What to try:",
                "Log file: ",
            ),
        };

        let mut text = format!("{}\n\n{}{}\n\n{}\n", header, reason_label, self.reason, steps_label);
        for (index, step) in self.steps.iter().enumerate() {
            text.push_str(&format!("{}. {}\n", index + 1, step));
        }
        if let Some(log_hint) = log_hint {
            text.push_str(&format!("\n{}{}\n", log_label, log_hint));
        }
        text
    }
}

/// Normalize a raw locale string such as `zh_CN.UTF-8` or `en`
pub fn normalize_locale(raw: &str) -> Option<ShellLocale> {
    let lowered = raw.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return None;
    }
    if lowered.starts_with("zh") {
        return Some(ShellLocale::ZhCn);
    }
    if lowered.starts_with("en") {
        return Some(ShellLocale::EnUs);
    }
    None
}

/// Configured locale first, then LC_ALL and LANG; Chinese when nothing matches
pub fn resolve_locale<F>(configured: Option<&str>, lookup: F) -> ShellLocale
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(locale) = configured.and_then(normalize_locale) {
        return locale;
    }

    for key in ["LC_ALL", "LANG"] {
        if let Some(locale) = lookup(key).as_deref().and_then(normalize_locale) {
            return locale;
        }
    }

    ShellLocale::ZhCn
}

pub fn remediation_for(category: FailureCategory, locale: ShellLocale) -> Remediation {
    match locale {
        ShellLocale::ZhCn => remediation_zh(category),
        ShellLocale::EnUs => remediation_en(category),
    }
}

fn remediation_zh(category: FailureCategory) -> Remediation {
    match category {
        FailureCategory::PortUnavailable => Remediation {
            title: "启动失败",
            reason: "端口被占用",
            steps: &[
                "关闭其他可能占用端口的程序",
                "重启应用",
                "运行 kill-port 脚本清理端口",
                "重启计算机",
            ],
        },
        FailureCategory::ExecutableMissing => Remediation {
            title: "启动失败",
            reason: "后端程序文件缺失",
            steps: &[
                "重新安装或重新构建应用",
                "确保 backend/ 目录下有 xiaohongshu-mcp-desktop 可执行文件",
            ],
        },
        FailureCategory::ProcessSpawnError => Remediation {
            title: "启动失败",
            reason: "后端程序无法运行",
            steps: &[
                "检查后端程序文件是否有执行权限",
                "检查杀毒软件是否拦截了后端程序",
                "重新安装应用",
            ],
        },
        FailureCategory::ProcessExitedEarly => Remediation {
            title: "启动失败",
            reason: "后端进程异常退出",
            steps: &["重启应用", "检查系统资源", "查看日志获取更多信息"],
        },
        FailureCategory::HealthCheckExhausted => Remediation {
            title: "启动失败",
            reason: "后端服务启动超时",
            steps: &[
                "重启应用",
                "检查防火墙设置",
                "查看日志获取更多信息",
            ],
        },
        FailureCategory::Unknown => Remediation {
            title: "启动失败",
            reason: "未知错误",
            steps: &["重启应用", "检查系统资源", "查看日志获取更多信息"],
        },
    }
}

fn remediation_en(category: FailureCategory) -> Remediation {
    match category {
        FailureCategory::PortUnavailable => Remediation {
            title: "Startup failed",
            reason: "The port is already in use",
            steps: &[
                "Close other programs that may be using the port",
                "Restart the application",
                "Run the kill-port script to free the port",
                "Restart the computer",
            ],
        },
        FailureCategory::ExecutableMissing => Remediation {
            title: "Startup failed",
            reason: "The backend program is missing",
            steps: &[
                "Reinstall or rebuild the application",
                "Make sure backend/ contains the xiaohongshu-mcp-desktop executable",
            ],
        },
        FailureCategory::ProcessSpawnError => Remediation {
            title: "Startup failed",
            reason: "The backend program could not be launched",
            steps: &[
                "Check that the backend file is executable",
                "Check whether antivirus software blocked the backend",
                "Reinstall the application",
            ],
        },
        FailureCategory::ProcessExitedEarly => Remediation {
            title: "Startup failed",
            reason: "The backend process exited unexpectedly",
            steps: &[
                "Restart the application",
                "Check available system resources",
                "See the log file for details",
            ],
        },
        FailureCategory::HealthCheckExhausted => Remediation {
            title: "Startup failed",
            reason: "The backend did not become ready in time",
            steps: &[
                "Restart the application",
                "Check your firewall settings",
                "See the log file for details",
            ],
        },
        FailureCategory::Unknown => Remediation {
            title: "Startup failed",
            reason: "Unknown error",
            steps: &[
                "Restart the application",
                "Check available system resources",
                "See the log file for details",
            ],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL: [FailureCategory; 6] = [
        FailureCategory::PortUnavailable,
        FailureCategory::ExecutableMissing,
        FailureCategory::ProcessSpawnError,
        FailureCategory::ProcessExitedEarly,
        FailureCategory::HealthCheckExhausted,
        FailureCategory::Unknown,
    ];

    #[test]
    fn test_each_category_has_distinct_guidance() {
        for locale in [ShellLocale::ZhCn, ShellLocale::EnUs] {
            let reasons: HashSet<_> = ALL
                .iter()
                .map(|category| remediation_for(*category, locale).reason)
                .collect();
            assert_eq!(reasons.len(), ALL.len());
        }
    }

    #[test]
    fn test_normalize_locale() {
        assert_eq!(normalize_locale("zh_CN.UTF-8"), Some(ShellLocale::ZhCn));
        assert_eq!(normalize_locale("en-US"), Some(ShellLocale::EnUs));
        assert_eq!(normalize_locale("C"), None);
        assert_eq!(normalize_locale("  "), None);
    }

    #[test]
    fn test_resolve_locale_order() {
        let env = |key: &str| (key == "LANG").then(|| "en_US.UTF-8".to_string());
        assert_eq!(resolve_locale(Some("zh-CN"), env), ShellLocale::ZhCn);
        assert_eq!(resolve_locale(None, env), ShellLocale::EnUs);
        assert_eq!(resolve_locale(None, |_| None), ShellLocale::ZhCn);
    }

    #[test]
    fn test_render() {
        let text = remediation_for(FailureCategory::PortUnavailable, ShellLocale::EnUs)
            .render(ShellLocale::EnUs, Some("/tmp/shell.log"));
        assert!(text.starts_with("Unable to start the backend service"));
        assert!(text.contains("Reason: The port is already in use"));
        assert!(text.contains("1. Close other programs"));
        assert!(text.contains("Log file: /tmp/shell.log"));
    }
}
