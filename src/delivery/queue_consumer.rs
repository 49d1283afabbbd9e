//! Queue-mode coordinator
//!
//! Each message moves through `RECEIVED -> LEASED -> PIPELINE_RUNNING -> ACKED`.
//! While leased, a heartbeat task keeps renewing the message visibility. The
//! heartbeat is cancelled and joined before the message is deleted, so no
//! renewal can reach the queue after the acknowledgement.

use super::{is_eligible, UnitProcessor};
use crate::config::Config;
use crate::io::queue::{parse_message_body, JobQueue, QueueMessage};
use crate::types::{GvResult, SourceRef};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Queue consumer parameters
#[derive(Debug, Clone)]
pub struct ConsumerParams {
    /// Visibility timeout requested on every renewal
    pub lease: Duration,
    /// Pause after an empty receive
    pub idle: Duration,
    /// Messages requested per receive
    pub batch_size: i32,
    /// Keys outside this prefix are acknowledged without processing
    pub source_prefix: String,
}

impl Default for ConsumerParams {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            idle: Duration::from_secs(5),
            batch_size: 10,
            source_prefix: crate::config::DEFAULT_S3_PREFIX.to_string(),
        }
    }
}

impl ConsumerParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lease: config.lease,
            idle: config.queue_idle,
            source_prefix: config.source_prefix.clone(),
            ..Self::default()
        }
    }
}

/// An in-flight message and its lease-renewal heartbeat
pub struct LeaseHandle {
    stop: CancellationToken,
    heartbeat: JoinHandle<u32>,
}

impl LeaseHandle {
    /// Start renewing the message's lease: immediately, then every half lease
    pub fn acquire<Q: JobQueue + 'static>(queue: Arc<Q>, message: QueueMessage, lease: Duration) -> Self {
        let stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(queue, message, lease, stop.clone()));
        Self { stop, heartbeat }
    }

    /// Stop the heartbeat and wait for it to finish; returns the renewal count
    pub async fn release(self) -> u32 {
        self.stop.cancel();
        match self.heartbeat.await {
            Ok(renewals) => renewals,
            Err(e) => {
                log::warn!("Heartbeat task ended abnormally: {}", e);
                0
            }
        }
    }
}

async fn heartbeat<Q: JobQueue>(
    queue: Arc<Q>,
    message: QueueMessage,
    lease: Duration,
    stop: CancellationToken,
) -> u32 {
    let period = lease / 2;
    let mut renewals = 0;
    while !stop.is_cancelled() {
        // A renewal in flight must not hold up release
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            result = queue.extend_lease(&message, lease) => match result {
                Ok(()) => renewals += 1,
                Err(e) => log::warn!("Failed to extend message visibility: {}", e),
            },
        }
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }
    log::debug!("Stopping message visibility update after {} renewals", renewals);
    renewals
}

/// What happened to one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed (or ineligible) and deleted
    Acked,
    /// Left on the queue for redelivery or dead-lettering
    Left,
}

/// Counts from one [`QueueConsumer::drain`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub received: usize,
    pub acked: usize,
    pub left: usize,
    pub failed: usize,
}

/// Processes one leased message at a time
pub struct QueueConsumer<Q, P> {
    queue: Arc<Q>,
    processor: Arc<P>,
    params: ConsumerParams,
}

impl<Q, P> QueueConsumer<Q, P>
where
    Q: JobQueue + 'static,
    P: UnitProcessor,
{
    pub fn new(queue: Arc<Q>, processor: Arc<P>, params: ConsumerParams) -> Self {
        Self {
            queue,
            processor,
            params,
        }
    }

    /// Lease, process and acknowledge one message.
    ///
    /// Pipeline failures leave the message on the queue; only failing to
    /// delete a processed message is reported as an error.
    pub async fn handle(&self, message: QueueMessage) -> GvResult<Disposition> {
        let refs = match parse_message_body(&message.body) {
            Ok(refs) => refs,
            Err(e) => {
                log::error!("Leaving unreadable message on the queue: {}", e);
                return Ok(Disposition::Left);
            }
        };

        let (units, ineligible): (Vec<SourceRef>, Vec<SourceRef>) = refs
            .into_iter()
            .partition(|unit| is_eligible(unit, &self.params.source_prefix));
        for unit in &ineligible {
            log::info!("Skipping {}, not under prefix {}", unit, self.params.source_prefix);
        }

        if !units.is_empty() {
            let lease = LeaseHandle::acquire(Arc::clone(&self.queue), message.clone(), self.params.lease);
            let processor = Arc::clone(&self.processor);
            let result = tokio::task::spawn_blocking(move || {
                units.iter().try_for_each(|unit| processor.process(unit).map(|_| ()))
            })
            .await;
            let renewals = lease.release().await;
            log::debug!("Lease renewed {} times", renewals);

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_retryable() => {
                    log::warn!("{}; leaving message for redelivery", e);
                    return Ok(Disposition::Left);
                }
                Ok(Err(e)) => {
                    log::error!("Processing failed: {}", e);
                    return Ok(Disposition::Left);
                }
                Err(e) => {
                    log::error!("Pipeline task aborted: {}", e);
                    return Ok(Disposition::Left);
                }
            }
        }

        self.queue.delete(&message).await?;
        log::debug!("Message deleted");
        Ok(Disposition::Acked)
    }

    /// Receive and handle messages until the queue comes back empty
    pub async fn drain(&self) -> GvResult<DrainSummary> {
        let mut summary = DrainSummary::default();
        loop {
            let messages = self.queue.receive(self.params.batch_size).await?;
            if messages.is_empty() {
                return Ok(summary);
            }
            summary.received += messages.len();
            for message in messages {
                match self.handle(message).await {
                    Ok(Disposition::Acked) => summary.acked += 1,
                    Ok(Disposition::Left) => summary.left += 1,
                    Err(e) => {
                        log::error!("Failed to acknowledge message: {}", e);
                        summary.failed += 1;
                    }
                }
            }
        }
    }

    /// Drain forever, sweeping expired outputs after productive drains
    pub async fn run(&self) -> GvResult<()> {
        log::info!("Consuming queue with a {:?} lease", self.params.lease);
        loop {
            match self.drain().await {
                Ok(summary) if summary.acked > 0 => {
                    log::info!(
                        "Drained queue: {} received, {} acked, {} left",
                        summary.received,
                        summary.acked,
                        summary.left
                    );
                    let processor = Arc::clone(&self.processor);
                    match tokio::task::spawn_blocking(move || processor.sweep_expired(Utc::now())).await {
                        Ok(Ok(report)) => log::debug!("Removed {} expired images", report.deleted.len()),
                        Ok(Err(e)) => log::error!("Retention sweep failed: {}", e),
                        Err(e) => log::error!("Retention sweep aborted: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => log::error!("Queue receive failed: {}", e),
            }
            tokio::time::sleep(self.params.idle).await;
        }
    }
}
