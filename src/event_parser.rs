use chrono::{DateTime, Utc};
use regex::Regex;
use std::net::Ipv4Addr;
use std::str::FromStr;

lazy_static::lazy_static! {
    static ref SOURCE_ADDRESS: Regex = Regex::new(r"(?:^|\s)SRC=(\S+)").unwrap();
    static ref DESTINATION_PORT: Regex = Regex::new(r"(?:^|\s)DPT=(\S+)").unwrap();
}

/// A connection attempt observed in the firewall log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnockEvent {
    pub source: Ipv4Addr,
    pub port: u16,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParsedLine {
    /// The line does not carry the log prefix of the knock chain
    Unrelated,
    /// The line carries the log prefix, but the address or port could not be extracted
    Malformed,
    Knock(KnockEvent),
}

pub struct EventParser {
    log_prefix: String,
}

impl EventParser {
    pub fn new(log_prefix: &str) -> Self {
        // The kernel log keeps trailing blanks of the prefix, but they are easily mangled by
        // syslog daemons, so only the significant part is matched.
        Self {
            log_prefix: log_prefix.trim().to_string(),
        }
    }

    pub fn parse(&self, line: &str) -> ParsedLine {
        if !self.has_prefix(line) {
            return ParsedLine::Unrelated;
        }

        let source = SOURCE_ADDRESS
            .captures(line)
            .and_then(|c| Ipv4Addr::from_str(&c[1]).ok());
        let port = DESTINATION_PORT
            .captures(line)
            .and_then(|c| u16::from_str(&c[1]).ok());

        match (source, port) {
            (Some(source), Some(port)) => ParsedLine::Knock(KnockEvent {
                source,
                port,
                observed_at: Utc::now(),
            }),
            _ => ParsedLine::Malformed,
        }
    }

    /// The prefix has to start a word, `PREKNOCK:` is not `KNOCK:`
    fn has_prefix(&self, line: &str) -> bool {
        line.match_indices(&self.log_prefix)
            .any(|(i, _)| i == 0 || line[..i].ends_with(char::is_whitespace))
    }
}
