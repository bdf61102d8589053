use crate::firewall_backend::{FirewallBackend, FirewallError, FirewallFuture, Rule, INPUT_CHAIN};
use anyhow::Context;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

const IPTABLES: &str = "/usr/sbin/iptables";
const IPTABLES_SAVE: &str = "/usr/sbin/iptables-save";
const IPTABLES_RESTORE: &str = "/usr/sbin/iptables-restore";

pub struct IptablesFirewallBackend {
    _priv: (),
}

impl IptablesFirewallBackend {
    pub fn new() -> anyhow::Result<Self> {
        log::info!("Using iptables backend");

        // Listing a built-in chain fails early if iptables is missing or we lack privileges
        let output = std::process::Command::new(IPTABLES)
            .args(["-S", INPUT_CHAIN])
            .output()
            .with_context(|| format!("Failed to start {}", IPTABLES))?;

        if !output.status.success() {
            anyhow::bail!(
                "'{} -S {}' failed: [{}] {}",
                IPTABLES,
                INPUT_CHAIN,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }

        Ok(Self { _priv: () })
    }

    async fn run_iptables(chain: &str, args: &[&str]) -> Result<(), FirewallError> {
        Self::run_process(IPTABLES, args, None)
            .await
            .map(|_| ())
            .map_err(|e| classify_error(e, chain))
    }

    async fn run_process(
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<String, FirewallError> {
        let command = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        log::debug!("Running '{}'", command);

        let spawn_error = |source| FirewallError::Spawn {
            program: program.to_string(),
            source,
        };

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(spawn_error)?;
            // Closing stdin signals the end of the ruleset
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(FirewallError::CommandFailed {
                command,
                message: format!(
                    "[{}] {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim_end()
                ),
            })
        }
    }
}

/// Maps the error messages of iptables (legacy and nft flavour) to distinguishable errors
fn classify_error(error: FirewallError, chain: &str) -> FirewallError {
    if let FirewallError::CommandFailed { message, .. } = &error {
        if message.contains("No chain/target/match by that name")
            || message.contains("does not exist")
        {
            return FirewallError::NotFound(chain.to_string());
        } else if message.contains("Chain already exists") || message.contains("File exists") {
            return FirewallError::AlreadyExists(chain.to_string());
        } else if message.contains("Too many links") || message.contains("Device or resource busy")
        {
            return FirewallError::ChainInUse(chain.to_string());
        } else if message.contains("Directory not empty") {
            return FirewallError::ChainNotEmpty(chain.to_string());
        }
    }

    error
}

impl FirewallBackend for IptablesFirewallBackend {
    fn create_chain<'a>(&'a self, chain: &'a str) -> FirewallFuture<'a, ()> {
        Box::pin(async move { Self::run_iptables(chain, &["-N", chain]).await })
    }

    fn delete_chain<'a>(&'a self, chain: &'a str) -> FirewallFuture<'a, ()> {
        Box::pin(async move { Self::run_iptables(chain, &["-X", chain]).await })
    }

    fn flush_chain<'a>(&'a self, chain: &'a str) -> FirewallFuture<'a, ()> {
        Box::pin(async move { Self::run_iptables(chain, &["-F", chain]).await })
    }

    fn append_rule<'a>(&'a self, chain: &'a str, rule: &'a Rule) -> FirewallFuture<'a, ()> {
        Box::pin(async move {
            let mut args = vec!["-A", chain];
            args.extend(rule.args());
            Self::run_iptables(chain, &args).await
        })
    }

    fn insert_rule<'a>(
        &'a self,
        chain: &'a str,
        position: usize,
        rule: &'a Rule,
    ) -> FirewallFuture<'a, ()> {
        Box::pin(async move {
            let position = position.to_string();
            let mut args = vec!["-I", chain, position.as_str()];
            args.extend(rule.args());
            Self::run_iptables(chain, &args).await
        })
    }

    fn save_ruleset(&self) -> FirewallFuture<'_, String> {
        Box::pin(async move { Self::run_process(IPTABLES_SAVE, &["-t", "filter"], None).await })
    }

    fn restore_ruleset<'a>(&'a self, ruleset: &'a str) -> FirewallFuture<'a, ()> {
        Box::pin(async move {
            Self::run_process(IPTABLES_RESTORE, &[], Some(ruleset))
                .await
                .map(|_| ())
        })
    }
}
