use std::collections::VecDeque;

use parking_lot::Mutex;
use regex::{RegexSet, RegexSetBuilder};
use tracing::warn;

/// Phrases the backend (or its runtime) prints when the port is taken.
/// Matched case-insensitively as plain substrings.
pub const DEFAULT_PORT_CONFLICT_PHRASES: &[&str] = &[
    "端口被占用",
    "地址已在使用",
    "port already in use",
    "address already in use",
    "bind: address already in use",
    "eaddrinuse",
    // Windows WSAEADDRINUSE, English and Chinese locales
    "only one usage of each socket address",
    "通常每个套接字地址(协议/网络地址/端口)只允许使用一次",
];

/// Scans backend output lines for port-conflict messages
#[derive(Debug, Clone)]
pub struct PortConflictDetector {
    patterns: RegexSet,
}

impl PortConflictDetector {
    /// Built-in phrases plus `extra` regular expressions.
    /// Invalid extra patterns are logged and skipped.
    pub fn new(extra: &[String], replace_defaults: bool) -> Self {
        let mut sources: Vec<String> = if replace_defaults {
            Vec::new()
        } else {
            DEFAULT_PORT_CONFLICT_PHRASES
                .iter()
                .map(|phrase| regex::escape(phrase))
                .collect()
        };

        for pattern in extra {
            match regex::Regex::new(pattern) {
                Ok(_) => sources.push(pattern.clone()),
                Err(e) => warn!("Ignoring invalid port conflict pattern {:?}: {}", pattern, e),
            }
        }

        // Every source compiled on its own above, so the set cannot fail
        let patterns = RegexSetBuilder::new(&sources)
            .case_insensitive(true)
            .build()
            .unwrap_or_else(|_| RegexSet::empty());

        Self { patterns }
    }

    pub fn matches(&self, line: &str) -> bool {
        self.patterns.is_match(line)
    }
}

impl Default for PortConflictDetector {
    fn default() -> Self {
        Self::new(&[], false)
    }
}

/// Bounded buffer of the most recent output lines, for diagnostics
#[derive(Debug)]
pub struct RecentOutput {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl RecentOutput {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}
