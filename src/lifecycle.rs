use crate::dispatcher::{Dispatcher, KnockProcessor};
use crate::event_parser::{EventParser, ParsedLine};
use crate::event_source::EventSource;
use crate::knock_logger::LogEntryKind;
use crate::knock_sequence::MonitoredPorts;
use anyhow::Context;
use ipnet::Ipv4Net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct IntakeSettings {
    pub log_prefix: String,
    pub monitored_ports: MonitoredPorts,
    pub max_workers: usize,
    pub grace_period: Duration,
}

/// Installs the knock chain, feeds log events to the workers and removes the chain again
pub struct LifecycleController {
    processor: Arc<KnockProcessor>,
    parser: EventParser,
    settings: IntakeSettings,
    torn_down: AtomicBool,
}

impl LifecycleController {
    pub fn new(processor: Arc<KnockProcessor>, settings: IntakeSettings) -> Self {
        Self {
            processor,
            parser: EventParser::new(&settings.log_prefix),
            settings,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Installs the knock chain and allows the pre-trusted sources.
    ///
    /// Any failure is fatal: intake must not start without the complete chain in place.
    pub async fn start(&self, trusted: &[Ipv4Net]) -> anyhow::Result<()> {
        let gateway = &self.processor.gateway;
        let protected = self.processor.tracker.protected();

        gateway
            .install_base_chain(
                protected,
                &self.settings.monitored_ports,
                &self.settings.log_prefix,
            )
            .await?;

        for source in trusted {
            if let Err(e) = gateway.insert_allow(*source, protected).await {
                self.teardown().await;
                return Err(e).with_context(|| format!("Failed to allow trusted source {}", source));
            }

            if source.prefix_len() == 32 {
                self.processor.tracker.mark_granted(source.addr());
            }
            self.processor.knock_logger.log(
                source.addr(),
                LogEntryKind::Trusted,
                format!("{} {}:{}", source, protected.protocol, protected.port),
            );
        }

        Ok(())
    }

    /// Processes events until `shutdown` is triggered or the source ends, then drains the
    /// workers and removes the knock chain.
    pub async fn run(
        &self,
        mut source: impl EventSource,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let dispatcher = Dispatcher::new(self.processor.clone(), self.settings.max_workers);

        let result = self.intake(&mut source, &dispatcher, &shutdown).await;

        dispatcher.shutdown(self.settings.grace_period).await;
        self.teardown().await;

        result
    }

    async fn intake(
        &self,
        source: &mut impl EventSource,
        dispatcher: &Dispatcher,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            let line = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                line = source.next_line() => line.context("Failed to read from event source")?,
            };

            let line = match line {
                Some(line) => line,
                None => {
                    log::info!("Event source ended");
                    return Ok(());
                }
            };

            match self.parser.parse(&line) {
                ParsedLine::Unrelated => (),
                ParsedLine::Malformed => log::warn!("Ignoring malformed knock log line: {}", line),
                ParsedLine::Knock(event) => {
                    // Blocks while all workers are busy
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(()),
                        r = dispatcher.submit(event) => r?,
                    }
                }
            }
        }
    }

    /// Removes the knock chain. Only the first invocation has an effect.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.processor.gateway.teardown_chain().await {
            log::error!(
                "Firewall chain '{}' could not be removed completely, manual cleanup required: {:#}",
                self.processor.gateway.chain(),
                e
            );
        }
    }
}
