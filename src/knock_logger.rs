use std::fmt::Display;
use std::net::Ipv4Addr;

pub struct KnockLogger {}

pub enum LogEntryKind {
    KnockAdvanced,
    KnockReset,
    KnockIgnored,
    SequenceCompleted,
    AccessGranted,
    GrantFailed,
    Trusted,
}

impl KnockLogger {
    pub fn log<M: Display>(&self, source: Ipv4Addr, kind: LogEntryKind, message: M) {
        let arrow = match kind {
            LogEntryKind::KnockAdvanced => "->",
            LogEntryKind::KnockReset => "|>",
            LogEntryKind::KnockIgnored => "~>",
            LogEntryKind::SequenceCompleted => "=>",
            LogEntryKind::AccessGranted => "<-",
            LogEntryKind::GrantFailed => "<!",
            LogEntryKind::Trusted => "<+",
        };

        println!("{source} {arrow} {message}");
    }
}
