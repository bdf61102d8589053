use crate::knock_sequence::{KnockSequence, MonitoredPorts, PortRange, ProtectedEndpoint};
use crate::protocol::Protocol;
use anyhow::{bail, ensure, Context};
use clap::{Args, Parser, ValueEnum};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

/// `--log-prefix` of the iptables LOG target accepts at most 29 characters
const MAX_LOG_PREFIX_LEN: usize = 29;
/// iptables chain names are limited to 28 characters
const MAX_CHAIN_NAME_LEN: usize = 28;

#[derive(Debug, Parser)]
#[clap(name = "knock-firewall")]
pub struct ProgramConfig {
    #[clap(flatten)]
    pub knock: KnockConfig,

    #[clap(flatten)]
    pub event_source: EventSourceConfig,

    #[clap(flatten)]
    pub dispatcher: DispatcherConfig,

    /// Firewall backend
    #[clap(flatten)]
    pub firewall: FirewallConfig,
}

#[derive(Debug, Args)]
pub struct KnockConfig {
    /// Ports that have to be knocked in order, comma separated
    #[clap(long, env, value_delimiter = ',', required = true)]
    pub knock_sequence: Vec<u16>,

    /// Port that is opened for hosts completing the knock sequence
    #[clap(long, env)]
    pub protected_port: u16,

    /// Protocol of the knocks and the protected port (TCP or UDP)
    #[clap(long, env, default_value = "tcp")]
    pub protocol: Protocol,

    /// Port range (START:END) monitored instead of the individual knock ports
    #[clap(long, env)]
    pub knock_port_range: Option<PortRange>,

    /// Addresses or subnets that are allowed without knocking, comma separated
    #[clap(long, env, value_delimiter = ',', value_parser = parse_trusted_source)]
    pub trusted: Vec<Ipv4Net>,
}

#[derive(Debug, Args)]
pub struct EventSourceConfig {
    /// Kernel log file receiving the packets logged by the knock chain
    #[clap(long, env, default_value = "/var/log/kern.log")]
    pub log_file: PathBuf,

    /// Prefix of the log entries written by the knock chain
    #[clap(long, env, default_value = "KNOCK: ")]
    pub log_prefix: String,

    /// Interval for polling the log file for new entries, in milliseconds
    #[clap(long, env, default_value = "250")]
    pub poll_interval: u64,
}

#[derive(Debug, Args)]
pub struct DispatcherConfig {
    /// Maximum number of knocks processed concurrently
    #[clap(long, env, default_value = "10")]
    pub max_workers: usize,

    /// Time granted to pending knocks on shutdown, in seconds
    #[clap(long, env, default_value = "5")]
    pub grace_period: u64,
}

#[derive(Debug, Args)]
pub struct FirewallConfig {
    /// Firewall backend
    #[clap(long = "firewall", env = "FIREWALL", value_enum, ignore_case = true)]
    pub backend: FirewallKind,

    /// Firewall chain owned by the daemon (iptables backend only)
    #[clap(long, env, default_value = "KNOCK")]
    pub chain: String,

    /// Number of attempts for inserting a rule that allows a host
    #[clap(long, env, default_value = "3")]
    pub insert_attempts: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[allow(non_camel_case_types)]
pub enum FirewallKind {
    none,
    iptables,
}

/// The validated knock related part of the configuration
#[derive(Debug)]
pub struct KnockSetup {
    pub sequence: KnockSequence,
    pub protected: ProtectedEndpoint,
    pub monitored_ports: MonitoredPorts,
}

impl ProgramConfig {
    pub fn parse() -> Self {
        Parser::parse()
    }

    /// Checks the constraints clap cannot express and assembles the knock setup
    pub fn validate(&self) -> anyhow::Result<KnockSetup> {
        let prefix = &self.event_source.log_prefix;
        ensure!(!prefix.trim().is_empty(), "The log prefix must not be blank");
        ensure!(
            prefix.chars().count() <= MAX_LOG_PREFIX_LEN,
            "The log prefix '{}' is longer than {} characters",
            prefix,
            MAX_LOG_PREFIX_LEN
        );
        if prefix.contains(['"', '\'']) {
            bail!("The log prefix '{}' must not contain quotes", prefix);
        }

        let chain = &self.firewall.chain;
        ensure!(
            !chain.is_empty()
                && chain.len() <= MAX_CHAIN_NAME_LEN
                && !chain.starts_with('-')
                && !chain.contains(char::is_whitespace),
            "Invalid chain name '{}': expected 1 to {} characters without blanks",
            chain,
            MAX_CHAIN_NAME_LEN
        );

        ensure!(
            self.dispatcher.max_workers >= 1,
            "At least one worker is required"
        );
        ensure!(
            self.firewall.insert_attempts >= 1,
            "At least one insert attempt is required"
        );

        let sequence = KnockSequence::new(self.knock.knock_sequence.clone())
            .context("Invalid knock sequence")?;
        let protected = ProtectedEndpoint {
            port: self.knock.protected_port,
            protocol: self.knock.protocol,
        };
        let monitored_ports = MonitoredPorts::new(&sequence, self.knock.knock_port_range, protected)
            .context("Invalid set of monitored ports")?;

        Ok(KnockSetup {
            sequence,
            protected,
            monitored_ports,
        })
    }
}

/// Accepts a plain address (as a /32 subnet) or a subnet in CIDR notation
fn parse_trusted_source(input: &str) -> Result<Ipv4Net, String> {
    let input = input.trim();
    if let Ok(address) = Ipv4Addr::from_str(input) {
        return Ok(Ipv4Net::from(address));
    }
    Ipv4Net::from_str(input)
        .map(|net| net.trunc())
        .map_err(|_| format!("'{}' is neither an IPv4 address nor an IPv4 subnet", input))
}
