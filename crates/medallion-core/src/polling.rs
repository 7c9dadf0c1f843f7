//! The trigger loop shared by every stage: prepare a micro-batch, process
//! it, then sleep until the next trigger or shutdown.

use async_trait::async_trait;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::emit;
use crate::metrics::events::{IterationCompleted, IterationDuration, IterationResultType};

/// Outcome of one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// A micro-batch was processed.
    ProcessedItems,
    /// Nothing new was found.
    NoItems,
    /// The processor asked the loop to stop.
    Shutdown,
}

/// Work driven by [`run_polling_loop`].
#[async_trait]
pub trait PollingProcessor {
    /// Work planned by `prepare` and handed to `process`.
    type State: Send;
    type Error: std::error::Error + Send;

    /// Plan the work of the next trigger.
    ///
    /// Returns `None` if there's no work to do.
    ///
    /// # Arguments
    /// * `cold_start` - True on the first trigger, when state must be recovered
    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error>;

    /// Carry out planned work.
    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;

    /// Whether the loop should stop after an iteration that found no work.
    fn is_finished(&self) -> bool {
        false
    }
}

/// Drive `processor` until it finishes or `shutdown` is cancelled.
///
/// 1. Call `prepare()` (with cold_start=true on the first iteration)
/// 2. Call `process()` when `prepare()` planned something
/// 3. Stop if there was no work and the processor reports it is finished
/// 4. Otherwise wait for poll_interval (plus random jitter) or shutdown
///
/// After an iteration that processed items the loop continues immediately,
/// so a backlog drains without waiting for the interval.
pub async fn run_polling_loop<P: PollingProcessor>(
    processor: &mut P,
    poll_interval: Duration,
    poll_jitter_secs: u64,
    shutdown: CancellationToken,
    name: &str,
) -> Result<(), P::Error> {
    let mut first_iteration = true;

    loop {
        let iteration_start = Instant::now();
        let shutdown_clone = shutdown.clone();
        let state = tokio::select! {
            biased;

            _ = shutdown_clone.cancelled() => {
                info!(target = name, "Shutdown requested during preparation");
                return Ok(());
            }

            result = async {
                let cold_start = first_iteration;
                first_iteration = false;
                processor.prepare(cold_start).await
            } => result?,
        };

        // Processing is not raced against shutdown: a micro-batch either
        // commits completely or is replayed on the next start.
        let result = match state {
            Some(s) => processor.process(s).await?,
            None => IterationResult::NoItems,
        };

        match result {
            IterationResult::Shutdown => break,
            IterationResult::NoItems => {
                emit!(IterationCompleted {
                    result: IterationResultType::NoItems,
                    target: name.to_string(),
                });
                emit!(IterationDuration {
                    duration: iteration_start.elapsed(),
                    target: name.to_string(),
                });

                if processor.is_finished() {
                    info!(target = name, "No more items available, stopping");
                    break;
                }
                debug!(
                    target = name,
                    "No new items, waiting {}ms before next poll",
                    poll_interval.as_millis()
                );
            }
            IterationResult::ProcessedItems => {
                emit!(IterationCompleted {
                    result: IterationResultType::Processed,
                    target: name.to_string(),
                });
                emit!(IterationDuration {
                    duration: iteration_start.elapsed(),
                    target: name.to_string(),
                });
                if shutdown.is_cancelled() {
                    info!(target = name, "Shutdown requested after processing");
                    break;
                }
                continue;
            }
        }

        let sleep_duration = poll_interval + random_jitter(poll_jitter_secs);
        if shutdown
            .run_until_cancelled(tokio::time::sleep(sleep_duration))
            .await
            .is_none()
        {
            info!(target = name, "Shutdown requested during poll wait");
            break;
        }
    }

    Ok(())
}

/// Random extra delay below `max_secs`.
pub fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
    } else {
        Duration::ZERO
    }
}
