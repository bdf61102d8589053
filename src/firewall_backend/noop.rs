use crate::firewall_backend::{FirewallBackend, FirewallFuture, Rule};

pub struct NoopFirewallBackend {
    _priv: (),
}

impl NoopFirewallBackend {
    pub fn new() -> Self {
        log::info!("Firewall backend is disabled");
        Self { _priv: () }
    }
}

impl FirewallBackend for NoopFirewallBackend {
    fn create_chain<'a>(&'a self, _chain: &'a str) -> FirewallFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn delete_chain<'a>(&'a self, _chain: &'a str) -> FirewallFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn flush_chain<'a>(&'a self, _chain: &'a str) -> FirewallFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn append_rule<'a>(&'a self, _chain: &'a str, _rule: &'a Rule) -> FirewallFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn insert_rule<'a>(
        &'a self,
        _chain: &'a str,
        _position: usize,
        _rule: &'a Rule,
    ) -> FirewallFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn save_ruleset(&self) -> FirewallFuture<'_, String> {
        Box::pin(async { Ok(String::new()) })
    }

    fn restore_ruleset<'a>(&'a self, _ruleset: &'a str) -> FirewallFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}
