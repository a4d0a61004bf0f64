use std::net::{SocketAddr, TcpListener};
use tracing::{debug, info, warn};

use crate::error::StartupFailure;

/// Contiguous span of ports `[start, start + len)` probed in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub len: u16,
}

impl PortRange {
    pub fn new(start: u16, len: u16) -> Self {
        Self { start, len }
    }

    /// Ports in the range, clipped at 65535
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        let start = self.start;
        (0..self.len).map_while(move |offset| start.checked_add(offset))
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let last = self.start.saturating_add(self.len.saturating_sub(1));
        write!(f, "{}-{}", self.start, last)
    }
}

/// Find a bindable port starting at `preferred_start`, falling back to the
/// secondary range when the preferred one is exhausted
pub fn find_available_port(
    preferred_start: u16,
    fallback_start: u16,
    range_len: u16,
) -> Result<u16, StartupFailure> {
    let ranges = [
        PortRange::new(preferred_start, range_len),
        PortRange::new(fallback_start, range_len),
    ];
    find_port_in_ranges(&ranges, is_port_available)
}

/// Probe `ranges` in priority order with `probe`, returning the first usable port
pub fn find_port_in_ranges<F>(ranges: &[PortRange], mut probe: F) -> Result<u16, StartupFailure>
where
    F: FnMut(u16) -> bool,
{
    for (index, range) in ranges.iter().enumerate() {
        if index > 0 {
            warn!("Ports {} all occupied, trying range {}", ranges[index - 1], range);
        } else {
            info!("Searching for available port in range {}", range);
        }

        for port in range.ports() {
            if probe(port) {
                info!("Found available port: {}", port);
                return Ok(port);
            }
            debug!("Port {} is in use", port);
        }
    }

    let tried = ranges
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    warn!("Could not find an available port in ranges {}", tried);
    Err(StartupFailure::PortUnavailable {
        detail: format!("no free port in {}", tried),
    })
}

/// Check if a specific port is available
pub fn is_port_available(port: u16) -> bool {
    // Bind 0.0.0.0 because that is what the backend listens on.
    // The listener is dropped right away, freeing the port again.
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).is_ok()
}
