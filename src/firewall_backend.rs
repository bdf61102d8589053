pub mod iptables;
#[cfg(test)]
pub mod memory;
pub mod noop;

use crate::knock_sequence::{MonitoredPorts, ProtectedEndpoint};
use ipnet::Ipv4Net;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Built-in chain that receives incoming traffic
pub const INPUT_CHAIN: &str = "INPUT";

pub type FirewallFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FirewallError>> + Send + 'a>>;

/// Primitive rule management operations of the host's packet filter
pub trait FirewallBackend: Send + Sync {
    fn create_chain<'a>(&'a self, chain: &'a str) -> FirewallFuture<'a, ()>;

    /// Deletes an empty, unreferenced chain
    fn delete_chain<'a>(&'a self, chain: &'a str) -> FirewallFuture<'a, ()>;

    fn flush_chain<'a>(&'a self, chain: &'a str) -> FirewallFuture<'a, ()>;

    fn append_rule<'a>(&'a self, chain: &'a str, rule: &'a Rule) -> FirewallFuture<'a, ()>;

    /// Inserts `rule` at `position` (1-based) of `chain`
    fn insert_rule<'a>(
        &'a self,
        chain: &'a str,
        position: usize,
        rule: &'a Rule,
    ) -> FirewallFuture<'a, ()>;

    /// Dumps the complete filter table in `iptables-save` format
    fn save_ruleset(&self) -> FirewallFuture<'_, String>;

    /// Atomically replaces the complete filter table by `ruleset` (`iptables-save` format)
    fn restore_ruleset<'a>(&'a self, ruleset: &'a str) -> FirewallFuture<'a, ()>;
}

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("Chain '{0}' does not exist")]
    NotFound(String),

    #[error("Chain '{0}' already exists")]
    AlreadyExists(String),

    #[error("Chain '{0}' is still referenced by other rules")]
    ChainInUse(String),

    #[error("Chain '{0}' still contains rules")]
    ChainNotEmpty(String),

    #[error("'{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Failed to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Match and target arguments of a single rule, as passed to `iptables -A <chain>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    args: Vec<String>,
}

impl Rule {
    fn new(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Routes new connections to the monitored ports into `chain`
    pub fn jump(chain: &str, protected: ProtectedEndpoint, ports: &MonitoredPorts) -> Self {
        Self::new(&[
            "-p",
            protected.protocol.iptables_name(),
            "-m",
            "multiport",
            "--dports",
            &ports.to_string(),
            "-j",
            chain,
        ])
    }

    pub fn accept_established() -> Self {
        Self::new(&[
            "-m",
            "conntrack",
            "--ctstate",
            "ESTABLISHED,RELATED",
            "-j",
            "ACCEPT",
        ])
    }

    pub fn log(log_prefix: &str) -> Self {
        Self::new(&["-j", "LOG", "--log-prefix", log_prefix])
    }

    pub fn reject(protected: ProtectedEndpoint) -> Self {
        Self::new(&[
            "-p",
            protected.protocol.iptables_name(),
            "--dport",
            &protected.port.to_string(),
            "-j",
            "REJECT",
        ])
    }

    pub fn accept_source(source: Ipv4Net, protected: ProtectedEndpoint) -> Self {
        Self::new(&[
            "-s",
            &source.to_string(),
            "-p",
            protected.protocol.iptables_name(),
            "--dport",
            &protected.port.to_string(),
            "-j",
            "ACCEPT",
        ])
    }

    pub fn args(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(String::as_str)
    }
}

impl fmt::Display for Rule {
    /// Renders the rule like `iptables-save` does, quoting arguments with blanks
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let args = self
            .args
            .iter()
            .map(|a| {
                if a.contains(char::is_whitespace) {
                    format!("\"{}\"", a)
                } else {
                    a.clone()
                }
            })
            .collect::<Vec<_>>();
        write!(f, "{}", args.join(" "))
    }
}

/// Returns whether a rule in `iptables-save` format jumps or branches to `chain`
pub fn references_chain(rule: &str, chain: &str) -> bool {
    let tokens = rule.split_whitespace().collect::<Vec<_>>();
    tokens
        .windows(2)
        .any(|w| (w[0] == "-j" || w[0] == "-g") && w[1] == chain)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::knock_sequence::KnockSequence;
    use crate::protocol::Protocol;
    use std::str::FromStr;

    const SSH: ProtectedEndpoint = ProtectedEndpoint {
        port: 22,
        protocol: Protocol::Tcp,
    };

    #[test]
    fn render_rules() {
        let sequence = KnockSequence::new(vec![2000, 2001]).unwrap();
        let ports = MonitoredPorts::new(&sequence, None, SSH).unwrap();

        assert_eq!(
            Rule::jump("KNOCK", SSH, &ports).to_string(),
            "-p tcp -m multiport --dports 2000,2001,22 -j KNOCK"
        );
        assert_eq!(
            Rule::log("KNOCK: ").to_string(),
            "-j LOG --log-prefix \"KNOCK: \""
        );
        assert_eq!(
            Rule::accept_source(Ipv4Net::from_str("10.0.0.5/32").unwrap(), SSH).to_string(),
            "-s 10.0.0.5/32 -p tcp --dport 22 -j ACCEPT"
        );
    }

    #[test]
    fn chain_references_match_whole_names() {
        assert!(references_chain("-A INPUT -p tcp -j KNOCK", "KNOCK"));
        assert!(references_chain("-A INPUT -p tcp -g KNOCK", "KNOCK"));
        assert!(!references_chain("-A INPUT -p tcp -j KNOCK2", "KNOCK"));
        assert!(!references_chain("-A KNOCK -j ACCEPT", "KNOCK"));
    }
}
