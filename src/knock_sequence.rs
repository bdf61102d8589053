use crate::protocol::Protocol;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum number of ports a single `-m multiport` match accepts; a range takes two slots
const MULTIPORT_SLOTS: usize = 15;

/// Ordered list of distinct ports that have to be contacted to unlock the protected endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnockSequence {
    ports: Vec<u16>,
}

/// The port that is unlocked once a host completes the knock sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedEndpoint {
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// Destination ports routed into the knock chain: the knock ports plus the protected port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredPorts {
    ranges: Vec<PortRange>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KnockSequenceError {
    #[error("The knock sequence must contain at least one port")]
    Empty,

    #[error("Port {0} appears more than once in the knock sequence")]
    DuplicatePort(u16),

    #[error("Port {0} is both a knock port and the protected port")]
    ProtectedPortInSequence(u16),

    #[error("Knock port {port} is not covered by the knock port range {range}")]
    NotCoveredByRange { port: u16, range: PortRange },

    #[error("Too many monitored ports: {slots} multiport slots needed, at most 15 are supported")]
    TooManyPorts { slots: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("Invalid port '{0}'")]
    InvalidPort(String),

    #[error("Invalid port range '{0}': start must not exceed end")]
    Reversed(String),
}

impl KnockSequence {
    pub fn new(ports: Vec<u16>) -> Result<Self, KnockSequenceError> {
        if ports.is_empty() {
            return Err(KnockSequenceError::Empty);
        }

        let mut seen = HashSet::with_capacity(ports.len());
        for port in &ports {
            if !seen.insert(*port) {
                return Err(KnockSequenceError::DuplicatePort(*port));
            }
        }

        Ok(Self { ports })
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// The port expected at progress index `index`, `None` once the sequence is exhausted
    pub fn expected_at(&self, index: usize) -> Option<u16> {
        self.ports.get(index).copied()
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}

impl fmt::Display for KnockSequence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ports = self
            .ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(" -> ");
        write!(f, "{}", ports)
    }
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    fn multiport_slots(&self) -> usize {
        if self.start == self.end {
            1
        } else {
            2
        }
    }
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |p: &str| {
            u16::from_str(p.trim()).map_err(|_| PortRangeError::InvalidPort(p.trim().to_string()))
        };

        let range = match s.split_once(':') {
            Some((start, end)) => Self {
                start: parse_port(start)?,
                end: parse_port(end)?,
            },
            None => Self::single(parse_port(s)?),
        };

        if range.start > range.end {
            return Err(PortRangeError::Reversed(s.to_string()));
        }

        Ok(range)
    }
}

impl fmt::Display for PortRange {
    /// Formats the range the way `iptables` expects it (`start:end`)
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

impl MonitoredPorts {
    /// Without an explicit `knock_range` each knock port is monitored individually.
    pub fn new(
        sequence: &KnockSequence,
        knock_range: Option<PortRange>,
        protected: ProtectedEndpoint,
    ) -> Result<Self, KnockSequenceError> {
        if sequence.ports().contains(&protected.port) {
            return Err(KnockSequenceError::ProtectedPortInSequence(protected.port));
        }

        let mut ranges = match knock_range {
            Some(range) => {
                if let Some(port) = sequence.ports().iter().find(|p| !range.contains(**p)) {
                    return Err(KnockSequenceError::NotCoveredByRange {
                        port: *port,
                        range,
                    });
                }
                vec![range]
            }
            None => sequence.ports().iter().copied().map(PortRange::single).collect(),
        };

        if !ranges.iter().any(|r| r.contains(protected.port)) {
            ranges.push(PortRange::single(protected.port));
        }

        let slots: usize = ranges.iter().map(PortRange::multiport_slots).sum();
        if slots > MULTIPORT_SLOTS {
            return Err(KnockSequenceError::TooManyPorts { slots });
        }

        Ok(Self { ranges })
    }
}

impl fmt::Display for MonitoredPorts {
    /// Comma separated list as accepted by `-m multiport --dports`
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ranges = self
            .ranges
            .iter()
            .map(PortRange::to_string)
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}", ranges)
    }
}
