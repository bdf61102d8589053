use crate::event_parser::KnockEvent;
use crate::firewall_gateway::FirewallGateway;
use crate::knock_logger::{KnockLogger, LogEntryKind};
use crate::sequence_tracker::{SequenceTracker, Transition};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("The dispatcher has been shut down")]
    ShutDown,
}

/// Everything a worker needs to evaluate a knock
pub struct KnockProcessor {
    pub tracker: Arc<SequenceTracker>,
    pub gateway: Arc<FirewallGateway>,
    pub knock_logger: KnockLogger,
}

struct Job {
    event: KnockEvent,
    _permit: OwnedSemaphorePermit,
}

/// Knocks waiting behind the one currently evaluated, for every host with work in flight
type PendingKnocks = Arc<Mutex<HashMap<Ipv4Addr, VecDeque<Job>>>>;

/// Runs knock evaluations on a bounded number of workers.
///
/// At most `max_workers` events are accepted but not yet fully processed; `submit` waits for a
/// free slot beyond that. Every host with accepted knocks has its own worker that evaluates them
/// one after another in arrival order and exits once its queue is empty, so a host waiting for
/// its grant never holds up the knocks of another host.
pub struct Dispatcher {
    processor: Arc<KnockProcessor>,
    pending: PendingKnocks,
    processing_limit: Arc<Semaphore>,
    slots: u32,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(processor: Arc<KnockProcessor>, max_workers: usize) -> Self {
        let slots = max_workers.clamp(1, u32::MAX as usize) as u32;

        Self {
            processor,
            pending: Arc::new(Mutex::new(HashMap::new())),
            processing_limit: Arc::new(Semaphore::new(slots as usize)),
            slots,
            cancel: CancellationToken::new(),
        }
    }

    /// Hands `event` to the worker of its host, waiting while all slots are occupied
    pub async fn submit(&self, event: KnockEvent) -> Result<(), DispatchError> {
        let permit = self
            .processing_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::ShutDown)?;

        let job = Job {
            event,
            _permit: permit,
        };

        // The queue of a host is removed under the same lock by its worker, so a job either
        // joins a running worker or starts a new one
        match lock(&self.pending).entry(event.source) {
            Entry::Occupied(mut queue) => queue.get_mut().push_back(job),
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::new());
                tokio::spawn(run_host_worker(
                    self.processor.clone(),
                    self.pending.clone(),
                    self.cancel.clone(),
                    job,
                ));
            }
        }

        Ok(())
    }

    /// Waits up to `grace_period` for accepted events to be processed. Workers still busy after
    /// that are cancelled.
    pub async fn shutdown(self, grace_period: Duration) {
        // Every accepted event holds a slot until it is done, so all slots being free means
        // that nothing is queued or running anymore
        let drained = timeout(
            grace_period,
            self.processing_limit.acquire_many(self.slots),
        )
        .await;

        if drained.is_err() {
            log::warn!(
                "Knock processing did not finish within {:?}, cancelling",
                grace_period
            );
            self.cancel.cancel();
            let _ = self.processing_limit.acquire_many(self.slots).await;
        }
    }
}

fn lock(pending: &PendingKnocks) -> MutexGuard<'_, HashMap<Ipv4Addr, VecDeque<Job>>> {
    // Entries are only inserted, appended to or removed, a panic cannot leave them inconsistent
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_host_worker(
    processor: Arc<KnockProcessor>,
    pending: PendingKnocks,
    cancel: CancellationToken,
    first: Job,
) {
    let source = first.event.source;
    let mut abandoned = 0;
    let mut next = Some(first);

    while let Some(job) = next {
        if cancel.is_cancelled() {
            abandoned += 1;
            drop(job);
        } else {
            // Each job runs in its own task, so that a panic only takes down this single job.
            // The slot is released when the job (and with it the permit) is dropped.
            let processor = processor.clone();
            let job_cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                tokio::select! {
                    _ = job_cancel.cancelled() => {
                        log::warn!("Processing of knock from {} was cancelled", source);
                    }
                    _ = processor.process(job.event) => (),
                }
                drop(job);
            });

            if let Err(e) = handle.await {
                log::error!("Processing of knock from {} failed: {}", source, e);
            }
        }

        let mut queues = lock(&pending);
        next = queues.get_mut(&source).and_then(VecDeque::pop_front);
        if next.is_none() {
            queues.remove(&source);
        }
    }

    if abandoned > 0 {
        log::warn!(
            "Dropped {} queued knock(s) from {} during shutdown",
            abandoned,
            source
        );
    }
}

impl KnockProcessor {
    pub async fn process(&self, event: KnockEvent) {
        let KnockEvent {
            source,
            port,
            observed_at,
        } = event;

        log::debug!("Knock from {} on port {} (logged at {})", source, port, observed_at);

        match self.tracker.on_knock(source, port) {
            Transition::Advanced { progress } => {
                self.knock_logger.log(
                    source,
                    LogEntryKind::KnockAdvanced,
                    format!("{} ({}/{})", port, progress, self.tracker.sequence_len()),
                );
            }
            Transition::Reset => {
                self.knock_logger.log(source, LogEntryKind::KnockReset, port);
            }
            Transition::AlreadyGranted => {
                self.knock_logger.log(source, LogEntryKind::KnockIgnored, port);
            }
            Transition::Completed => {
                let protected = self.tracker.protected();
                self.knock_logger.log(
                    source,
                    LogEntryKind::SequenceCompleted,
                    format!("{} (sequence complete)", port),
                );

                match self.gateway.insert_allow(source.into(), protected).await {
                    Ok(()) => self.knock_logger.log(
                        source,
                        LogEntryKind::AccessGranted,
                        format!("{}:{}", protected.protocol, protected.port),
                    ),
                    Err(e) => {
                        // The host must not stay completed without its rule, let it knock again
                        self.tracker.revoke(source);
                        self.knock_logger.log(
                            source,
                            LogEntryKind::GrantFailed,
                            format!("{}:{} {}", protected.protocol, protected.port, e),
                        );
                        log::error!("Failed to grant access to {}: {}", source, e);
                    }
                }
            }
        }
    }
}
