use crate::firewall_backend::{references_chain, FirewallBackend, FirewallError, Rule, INPUT_CHAIN};
use crate::knock_sequence::{MonitoredPorts, ProtectedEndpoint};
use anyhow::{bail, Context};
use ipnet::Ipv4Net;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

const TEARDOWN_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Owns the dedicated knock chain and the jump rule routing traffic into it.
///
/// All modifications are serialized through a single write lock, since the rule order inside the
/// chain matters and the packet filter has no multi-writer transactions.
pub struct FirewallGateway {
    backend: Box<dyn FirewallBackend>,
    chain: String,
    insert_attempts: u32,
    write_lock: Mutex<()>,
}

/// A saved ruleset with every rule belonging to or jumping into a chain removed
#[derive(Debug, PartialEq, Eq)]
pub struct FilteredRuleset {
    pub ruleset: String,
    pub removed_rules: usize,
}

impl FirewallGateway {
    pub fn new(backend: Box<dyn FirewallBackend>, chain: String, insert_attempts: u32) -> Self {
        Self {
            backend,
            chain,
            insert_attempts: insert_attempts.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Builds the knock chain from scratch, replacing any leftover of a previous run.
    ///
    /// On failure the partially built chain is removed again before the error is returned.
    pub async fn install_base_chain(
        &self,
        protected: ProtectedEndpoint,
        monitored_ports: &MonitoredPorts,
        log_prefix: &str,
    ) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;

        self.remove_chain()
            .await
            .with_context(|| format!("Failed to remove stale chain '{}'", self.chain))?;

        if let Err(e) = self.build_chain(protected, monitored_ports, log_prefix).await {
            if let Err(cleanup_error) = self.remove_chain().await {
                log::error!(
                    "Failed to remove partially installed chain '{}': {:#}",
                    self.chain,
                    cleanup_error
                );
            }
            return Err(e)
                .with_context(|| format!("Failed to install firewall chain '{}'", self.chain));
        }

        log::info!(
            "Installed chain '{}' for ports {} ({})",
            self.chain,
            monitored_ports,
            protected.protocol
        );
        Ok(())
    }

    async fn build_chain(
        &self,
        protected: ProtectedEndpoint,
        monitored_ports: &MonitoredPorts,
        log_prefix: &str,
    ) -> Result<(), FirewallError> {
        let chain = self.chain.as_str();
        self.backend.create_chain(chain).await?;

        // Established connections must be accepted before the reject rule, and every new
        // connection that reaches the reject rule is logged, so every knock is observable.
        self.backend
            .append_rule(chain, &Rule::accept_established())
            .await?;
        self.backend
            .append_rule(chain, &Rule::log(log_prefix))
            .await?;
        self.backend
            .append_rule(chain, &Rule::reject(protected))
            .await?;

        // The jump rule comes last, so no traffic is routed into a partially built chain
        self.backend
            .insert_rule(
                INPUT_CHAIN,
                1,
                &Rule::jump(chain, protected, monitored_ports),
            )
            .await
    }

    /// Allows `source` to reach the protected endpoint, ahead of the reject rule.
    ///
    /// Failed insertions are retried up to the configured number of attempts.
    pub async fn insert_allow(
        &self,
        source: Ipv4Net,
        protected: ProtectedEndpoint,
    ) -> Result<(), FirewallError> {
        let rule = Rule::accept_source(source, protected);
        let mut attempt = 1;

        loop {
            let result = {
                let _guard = self.write_lock.lock().await;
                self.backend.insert_rule(&self.chain, 1, &rule).await
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.insert_attempts => {
                    log::warn!(
                        "Allowing {} failed (attempt {}/{}): {}",
                        source,
                        attempt,
                        self.insert_attempts,
                        e
                    );
                    sleep(RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Removes the chain and every reference to it. A missing chain is not an error.
    pub async fn teardown_chain(&self) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        self.remove_chain().await?;
        log::info!("Removed chain '{}'", self.chain);
        Ok(())
    }

    async fn remove_chain(&self) -> anyhow::Result<()> {
        let chain = self.chain.as_str();
        let mut last_error = None;

        for attempt in 1..=TEARDOWN_ATTEMPTS {
            // Step 1-3: drop every rule of and into the chain in a single restore, so the filter
            // never runs with only a part of the chain removed
            match self.backend.save_ruleset().await {
                Ok(saved) => {
                    let filtered = remove_chain_references(&saved, chain);
                    if filtered.removed_rules > 0 {
                        log::debug!(
                            "Removing {} rule(s) of chain '{}'",
                            filtered.removed_rules,
                            chain
                        );
                        if let Err(e) = self.backend.restore_ruleset(&filtered.ruleset).await {
                            log::warn!("Failed to restore filtered ruleset: {}", e);
                        }
                    }
                }
                Err(e) => log::warn!("Failed to save ruleset: {}", e),
            }

            // Step 4: the chain is expected to be empty and unreferenced by now
            match self.backend.flush_chain(chain).await {
                Ok(()) | Err(FirewallError::NotFound(_)) => (),
                Err(e) => log::warn!("Failed to flush chain '{}': {}", chain, e),
            }

            match self.backend.delete_chain(chain).await {
                Ok(()) | Err(FirewallError::NotFound(_)) => return Ok(()),
                Err(e @ (FirewallError::ChainInUse(_) | FirewallError::ChainNotEmpty(_))) => {
                    log::debug!(
                        "Chain '{}' could not be deleted yet (attempt {}/{}): {}",
                        chain,
                        attempt,
                        TEARDOWN_ATTEMPTS,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }

            sleep(RETRY_DELAY * attempt).await;
        }

        match last_error {
            Some(e) => Err(e).with_context(|| format!("Chain '{}' could not be deleted", chain)),
            None => bail!("Chain '{}' could not be deleted", chain),
        }
    }
}

/// Filters a ruleset in `iptables-save` format: rules inside `chain` and rules jumping to it are
/// dropped, the chain declaration itself is kept so that the chain survives the restore empty.
pub fn remove_chain_references(saved: &str, chain: &str) -> FilteredRuleset {
    let mut removed_rules = 0;
    let mut ruleset = String::with_capacity(saved.len());

    for line in saved.lines() {
        let in_chain = line
            .strip_prefix("-A ")
            .and_then(|rule| rule.split_whitespace().next())
            == Some(chain);

        if line.starts_with("-A ") && (in_chain || references_chain(line, chain)) {
            removed_rules += 1;
            continue;
        }

        ruleset.push_str(line);
        ruleset.push('\n');
    }

    FilteredRuleset {
        ruleset,
        removed_rules,
    }
}
