use crate::error::SupervisorError;

pub const PORT_ANNOUNCEMENT_PREFIX: &str = "BACKEND_PORT:";

/// Extracts the port from a `BACKEND_PORT:<digits>` sentinel anywhere in `line`.
///
/// Digits that do not form a valid non-zero TCP port are not an announcement.
pub fn parse_port_announcement(line: &str) -> Option<u16> {
    let digits = line
        .match_indices(PORT_ANNOUNCEMENT_PREFIX)
        .map(|(index, prefix)| &line[index + prefix.len()..])
        .map(|rest| {
            let digits_len = rest
                .find(|ch: char| !ch.is_ascii_digit())
                .unwrap_or(rest.len());
            &rest[..digits_len]
        })
        .find(|digits| !digits.is_empty())?;
    match digits.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortScan {
    Discovered(u16),
    /// A port is already recorded; `announced` is whatever this line carried.
    Ignored { announced: Option<u16> },
    Pending,
    Exhausted { lines_seen: usize },
}

/// Incremental scanner: first announcement wins, later ones are ignored.
#[derive(Debug, Clone)]
pub struct PortDiscovery {
    port: Option<u16>,
    lines_seen: usize,
    max_lines: usize,
}

impl PortDiscovery {
    pub fn new(max_lines: usize) -> Self {
        Self {
            port: None,
            lines_seen: 0,
            max_lines: max_lines.max(1),
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn lines_seen(&self) -> usize {
        self.lines_seen
    }

    pub fn observe(&mut self, line: &str) -> PortScan {
        if self.port.is_some() {
            return PortScan::Ignored {
                announced: parse_port_announcement(line),
            };
        }
        if self.lines_seen >= self.max_lines {
            return PortScan::Exhausted {
                lines_seen: self.lines_seen,
            };
        }

        self.lines_seen += 1;
        if let Some(port) = parse_port_announcement(line) {
            self.port = Some(port);
            return PortScan::Discovered(port);
        }
        if self.lines_seen >= self.max_lines {
            return PortScan::Exhausted {
                lines_seen: self.lines_seen,
            };
        }
        PortScan::Pending
    }
}

/// Scans a finished sequence of lines for the first port announcement.
pub fn discover_port<I, S>(lines: I, max_lines: usize) -> Result<u16, SupervisorError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut discovery = PortDiscovery::new(max_lines);
    for line in lines {
        match discovery.observe(line.as_ref()) {
            PortScan::Discovered(port) => return Ok(port),
            PortScan::Exhausted { lines_seen } => {
                return Err(SupervisorError::PortAnnouncementMissing { lines_seen })
            }
            PortScan::Pending | PortScan::Ignored { .. } => {}
        }
    }
    Err(SupervisorError::PortAnnouncementMissing {
        lines_seen: discovery.lines_seen(),
    })
}
