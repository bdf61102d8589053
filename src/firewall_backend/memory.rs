//! In-memory model of an iptables filter table.
//!
//! Mirrors the behaviour of iptables that the knock chain protocol relies on: jump targets must
//! exist, a chain can only be deleted when it is empty and unreferenced, and a restore either
//! replaces the whole table or leaves it untouched.

use crate::firewall_backend::{
    references_chain, FirewallBackend, FirewallError, FirewallFuture, Rule, INPUT_CHAIN,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

const BUILTIN_CHAINS: [&str; 3] = [INPUT_CHAIN, "FORWARD", "OUTPUT"];
const BUILTIN_TARGETS: [&str; 5] = ["ACCEPT", "DROP", "REJECT", "LOG", "RETURN"];

#[derive(Clone, Default)]
pub struct MemoryFirewallBackend {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    ruleset: Mutex<Ruleset>,
    journal: Mutex<Vec<String>>,
    pending_failures: Mutex<HashMap<String, usize>>,
    insert_gate: Mutex<Option<Arc<Semaphore>>>,
}

#[derive(Clone)]
struct Ruleset {
    chains: Vec<(String, Vec<String>)>,
}

impl Default for Ruleset {
    fn default() -> Self {
        Self {
            chains: BUILTIN_CHAINS
                .iter()
                .map(|c| (c.to_string(), Vec::new()))
                .collect(),
        }
    }
}

impl Ruleset {
    fn chain(&self, name: &str) -> Option<&Vec<String>> {
        self.chains.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    fn chain_mut(&mut self, name: &str) -> Result<&mut Vec<String>, FirewallError> {
        self.chains
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
            .ok_or_else(|| FirewallError::NotFound(name.to_string()))
    }

    fn check_target(&self, rule: &str) -> Result<(), FirewallError> {
        let tokens = rule.split_whitespace().collect::<Vec<_>>();
        for w in tokens.windows(2) {
            if (w[0] == "-j" || w[0] == "-g")
                && !BUILTIN_TARGETS.contains(&w[1])
                && self.chain(w[1]).is_none()
            {
                return Err(FirewallError::NotFound(w[1].to_string()));
            }
        }
        Ok(())
    }

    fn to_save_format(&self) -> String {
        let mut out = String::from("*filter\n");
        for (name, _) in &self.chains {
            let policy = if BUILTIN_CHAINS.contains(&name.as_str()) {
                "ACCEPT"
            } else {
                "-"
            };
            out.push_str(&format!(":{} {} [0:0]\n", name, policy));
        }
        for (name, rules) in &self.chains {
            for rule in rules {
                out.push_str(&format!("-A {} {}\n", name, rule));
            }
        }
        out.push_str("COMMIT\n");
        out
    }

    fn parse(input: &str) -> Result<Self, FirewallError> {
        let failed = |line_number: usize| FirewallError::CommandFailed {
            command: "iptables-restore".to_string(),
            message: format!("line {} failed", line_number + 1),
        };

        let mut ruleset = Ruleset::default();
        for (line_number, line) in input.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line == "*filter" || line == "COMMIT" {
                continue;
            }

            if let Some(declaration) = line.strip_prefix(':') {
                let name = declaration
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| failed(line_number))?;
                if ruleset.chain(name).is_none() {
                    ruleset.chains.push((name.to_string(), Vec::new()));
                }
            } else if let Some(rule) = line.strip_prefix("-A ") {
                let (name, rule) = rule.split_once(' ').ok_or_else(|| failed(line_number))?;
                ruleset
                    .chain_mut(name)
                    .map_err(|_| failed(line_number))?
                    .push(rule.trim().to_string());
            } else {
                return Err(failed(line_number));
            }
        }

        for (_, rules) in &ruleset.chains {
            for rule in rules {
                ruleset.check_target(rule)?;
            }
        }

        Ok(ruleset)
    }
}

impl MemoryFirewallBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts out with the given table in `iptables-save` format
    pub fn with_ruleset(ruleset: &str) -> Self {
        let backend = Self::new();
        *backend.inner.ruleset.lock().unwrap() =
            Ruleset::parse(ruleset).expect("Invalid initial ruleset");
        backend
    }

    /// Makes the next `count` invocations of an operation fail. `operation` is either a bare
    /// operation name (`insert_rule`) or one qualified by chain (`insert_rule KNOCK`).
    pub fn fail_next(&self, operation: &str, count: usize) {
        self.inner
            .pending_failures
            .lock()
            .unwrap()
            .insert(operation.to_string(), count);
    }

    /// Every rule insertion has to take a permit of `gate` first
    pub fn gate_inserts(&self, gate: Arc<Semaphore>) {
        *self.inner.insert_gate.lock().unwrap() = Some(gate);
    }

    pub fn rules(&self, chain: &str) -> Option<Vec<String>> {
        self.inner.ruleset.lock().unwrap().chain(chain).cloned()
    }

    pub fn save(&self) -> String {
        self.inner.ruleset.lock().unwrap().to_save_format()
    }

    /// Operations executed so far, e.g. `insert_rule KNOCK`
    pub fn journal(&self) -> Vec<String> {
        self.inner.journal.lock().unwrap().clone()
    }

    fn begin(&self, op: &'static str, chain: &str) -> Result<(), FirewallError> {
        let qualified = format!("{} {}", op, chain);
        self.inner.journal.lock().unwrap().push(qualified.clone());

        let mut failures = self.inner.pending_failures.lock().unwrap();
        for key in [qualified.as_str(), op] {
            if let Some(remaining) = failures.get_mut(key).filter(|r| **r > 0) {
                *remaining -= 1;
                return Err(FirewallError::CommandFailed {
                    command: qualified.clone(),
                    message: "injected failure".to_string(),
                });
            }
        }
        Ok(())
    }

    fn modify<T>(
        &self,
        f: impl FnOnce(&mut Ruleset) -> Result<T, FirewallError>,
    ) -> Result<T, FirewallError> {
        f(&mut self.inner.ruleset.lock().unwrap())
    }
}

impl FirewallBackend for MemoryFirewallBackend {
    fn create_chain<'a>(&'a self, chain: &'a str) -> FirewallFuture<'a, ()> {
        Box::pin(async move {
            self.begin("create_chain", chain)?;
            self.modify(|ruleset| {
                if ruleset.chain(chain).is_some() {
                    return Err(FirewallError::AlreadyExists(chain.to_string()));
                }
                ruleset.chains.push((chain.to_string(), Vec::new()));
                Ok(())
            })
        })
    }

    fn delete_chain<'a>(&'a self, chain: &'a str) -> FirewallFuture<'a, ()> {
        Box::pin(async move {
            self.begin("delete_chain", chain)?;
            self.modify(|ruleset| {
                let rules = ruleset
                    .chain(chain)
                    .ok_or_else(|| FirewallError::NotFound(chain.to_string()))?;
                if !rules.is_empty() {
                    return Err(FirewallError::ChainNotEmpty(chain.to_string()));
                }
                if ruleset
                    .chains
                    .iter()
                    .flat_map(|(_, rules)| rules)
                    .any(|rule| references_chain(rule, chain))
                {
                    return Err(FirewallError::ChainInUse(chain.to_string()));
                }
                ruleset.chains.retain(|(name, _)| name != chain);
                Ok(())
            })
        })
    }

    fn flush_chain<'a>(&'a self, chain: &'a str) -> FirewallFuture<'a, ()> {
        Box::pin(async move {
            self.begin("flush_chain", chain)?;
            self.modify(|ruleset| {
                ruleset.chain_mut(chain)?.clear();
                Ok(())
            })
        })
    }

    fn append_rule<'a>(&'a self, chain: &'a str, rule: &'a Rule) -> FirewallFuture<'a, ()> {
        Box::pin(async move {
            self.begin("append_rule", chain)?;
            self.modify(|ruleset| {
                let rule = rule.to_string();
                ruleset.check_target(&rule)?;
                ruleset.chain_mut(chain)?.push(rule);
                Ok(())
            })
        })
    }

    fn insert_rule<'a>(
        &'a self,
        chain: &'a str,
        position: usize,
        rule: &'a Rule,
    ) -> FirewallFuture<'a, ()> {
        Box::pin(async move {
            let gate = self.inner.insert_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.acquire().await.expect("Insert gate closed").forget();
            }

            self.begin("insert_rule", chain)?;
            self.modify(|ruleset| {
                let rule = rule.to_string();
                ruleset.check_target(&rule)?;
                let rules = ruleset.chain_mut(chain)?;
                if position == 0 || position > rules.len() + 1 {
                    return Err(FirewallError::CommandFailed {
                        command: format!("insert_rule {} {}", chain, position),
                        message: "Index of insertion too big".to_string(),
                    });
                }
                rules.insert(position - 1, rule);
                Ok(())
            })
        })
    }

    fn save_ruleset(&self) -> FirewallFuture<'_, String> {
        Box::pin(async move {
            self.begin("save_ruleset", "filter")?;
            Ok(self.save())
        })
    }

    fn restore_ruleset<'a>(&'a self, ruleset: &'a str) -> FirewallFuture<'a, ()> {
        Box::pin(async move {
            self.begin("restore_ruleset", "filter")?;
            let parsed = Ruleset::parse(ruleset)?;
            self.modify(|current| {
                *current = parsed;
                Ok(())
            })
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn referenced_chain_cannot_be_deleted() {
        let backend = MemoryFirewallBackend::new();
        backend.create_chain("KNOCK").await.unwrap();
        backend
            .append_rule(INPUT_CHAIN, &Rule::new(&["-j", "KNOCK"]))
            .await
            .unwrap();

        assert_matches!(
            backend.delete_chain("KNOCK").await,
            Err(FirewallError::ChainInUse(_))
        );
        assert_matches!(
            backend.delete_chain("MISSING").await,
            Err(FirewallError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn restore_is_all_or_nothing() {
        let backend = MemoryFirewallBackend::new();
        backend.create_chain("KNOCK").await.unwrap();
        let before = backend.save();

        let broken = "*filter\n:INPUT ACCEPT [0:0]\n-A INPUT -j MISSING\nCOMMIT\n";
        assert_matches!(
            backend.restore_ruleset(broken).await,
            Err(FirewallError::NotFound(_))
        );
        assert_eq!(backend.save(), before);
    }

    #[tokio::test]
    async fn save_and_restore_roundtrip_keeps_rules() {
        let backend = MemoryFirewallBackend::new();
        backend.create_chain("KNOCK").await.unwrap();
        backend
            .append_rule("KNOCK", &Rule::log("KNOCK: "))
            .await
            .unwrap();
        backend
            .insert_rule(INPUT_CHAIN, 1, &Rule::new(&["-p", "tcp", "-j", "KNOCK"]))
            .await
            .unwrap();

        let saved = backend.save();
        let other = MemoryFirewallBackend::new();
        other.restore_ruleset(&saved).await.unwrap();
        assert_eq!(other.save(), saved);
        assert_eq!(
            other.rules("KNOCK").unwrap(),
            vec!["-j LOG --log-prefix \"KNOCK: \"".to_string()]
        );
    }
}
