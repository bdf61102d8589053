mod dispatcher;
mod event_parser;
mod event_source;
mod firewall_backend;
mod firewall_gateway;
mod knock_logger;
mod knock_sequence;
mod lifecycle;
mod program_config;
mod protocol;
mod sequence_tracker;

use crate::dispatcher::KnockProcessor;
use crate::event_source::LogFollower;
use crate::firewall_backend::iptables::IptablesFirewallBackend;
use crate::firewall_backend::noop::NoopFirewallBackend;
use crate::firewall_backend::FirewallBackend;
use crate::firewall_gateway::FirewallGateway;
use crate::knock_logger::KnockLogger;
use crate::lifecycle::{IntakeSettings, LifecycleController};
use crate::program_config::{FirewallKind, ProgramConfig};
use crate::sequence_tracker::SequenceTracker;
use anyhow::Context;
use env_logger::Env;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse options
    let config = ProgramConfig::parse();

    // Set up logging
    env_logger::Builder::from_env(Env::default().default_filter_or(if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_module_path(false)
    .init();

    run(config).await
}

async fn run(config: ProgramConfig) -> anyhow::Result<()> {
    let setup = config.validate().context("Invalid configuration")?;

    let follower = LogFollower::open(
        &config.event_source.log_file,
        Duration::from_millis(config.event_source.poll_interval),
    )
    .await
    .with_context(|| {
        format!(
            "Failed to open log file at '{}'",
            config.event_source.log_file.display()
        )
    })?;

    let firewall_backend: Box<dyn FirewallBackend> = match config.firewall.backend {
        FirewallKind::none => Box::new(NoopFirewallBackend::new()),
        FirewallKind::iptables => Box::new(
            IptablesFirewallBackend::new()
                .context("Failed to initialize iptables firewall backend")?,
        ),
    };

    log::info!(
        "Knock sequence {} unlocks {} port {}",
        setup.sequence,
        setup.protected.protocol,
        setup.protected.port
    );

    let processor = Arc::new(KnockProcessor {
        tracker: Arc::new(SequenceTracker::new(setup.sequence, setup.protected)),
        gateway: Arc::new(FirewallGateway::new(
            firewall_backend,
            config.firewall.chain.clone(),
            config.firewall.insert_attempts,
        )),
        knock_logger: KnockLogger {},
    });

    let controller = LifecycleController::new(
        processor,
        IntakeSettings {
            log_prefix: config.event_source.log_prefix.clone(),
            monitored_ports: setup.monitored_ports,
            max_workers: config.dispatcher.max_workers,
            grace_period: Duration::from_secs(config.dispatcher.grace_period),
        },
    );

    let shutdown = CancellationToken::new();
    let signal_handler = spawn_signal_handler(shutdown.clone())?;

    controller
        .start(&config.knock.trusted)
        .await
        .context("Failed to set up the firewall")?;

    log::info!("Daemon started!");

    // Run until a fatal error is encountered or one of the specified signals are received
    let result = controller.run(follower, shutdown).await;
    signal_handler.abort();
    result?;

    log::info!("Daemon stopped.");

    Ok(())
}

/// Cancels `shutdown` on SIGINT, SIGTERM or SIGQUIT. Later signals do not interrupt the teardown.
fn spawn_signal_handler(shutdown: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to listen for SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    let mut sigquit = signal(SignalKind::quit()).context("Failed to listen for SIGQUIT")?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigint.recv() => "SIGINT",
                Some(()) = sigterm.recv() => "SIGTERM",
                Some(()) = sigquit.recv() => "SIGQUIT",
                else => break,
            };

            if shutdown.is_cancelled() {
                log::warn!("Received {}, shutdown already in progress", name);
            } else {
                log::info!("Received {}, shutting down", name);
                shutdown.cancel();
            }
        }
    }))
}
