use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::admission::AdmissionCoordinator;
use crate::metrics::RelayMetrics;
use crate::store::{RouteStore, StoreError};
use crate::topic::chunks::ChunkReassembler;
use crate::topic::{ConsensusLog, LogError, TopicId};

const FETCH_LIMIT: u32 = 100;

#[derive(Debug, thiserror::Error)]
enum TickError {
    #[error(transparent)]
    Log(#[from] LogError),
    // cursor persistence failures are fatal: continuing would risk admitting
    // the same message twice after a restart
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Polls one topic on a fixed cadence and drives each new message through
/// reassembly and admission, advancing the durable cursor message by message.
pub struct TopicConsumer {
    log: Arc<dyn ConsensusLog>,
    store: Arc<RouteStore>,
    admission: Arc<AdmissionCoordinator>,
    chunks: ChunkReassembler,
    topic: TopicId,
    poll_interval: Duration,
}

impl TopicConsumer {
    pub fn new(
        log: Arc<dyn ConsensusLog>,
        store: Arc<RouteStore>,
        admission: Arc<AdmissionCoordinator>,
        topic: TopicId,
        poll_interval: Duration,
    ) -> Self {
        Self {
            log,
            store,
            admission,
            chunks: ChunkReassembler::new(),
            topic,
            poll_interval,
        }
    }

    /// Runs until `stop` flips. Ticks never overlap: a stop signal is only
    /// honored between ticks, so in-flight admission always completes here.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> eyre::Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut synced = false;

        info!(topic = %self.topic, interval = ?self.poll_interval, "topic consumer started");
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    // a dropped sender counts as a stop request
                    if changed.is_err() || *stop.borrow() {
                        info!(topic = %self.topic, "topic consumer stopping");
                        return Ok(());
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            match self.tick(synced).await {
                Ok(()) => synced = true,
                Err(TickError::Log(err)) => {
                    // transient; retried next tick with the cursor unchanged
                    warn!(topic = %self.topic, %err, "log fetch failed, will retry");
                }
                Err(TickError::Store(err)) => {
                    return Err(eyre::Report::new(err)
                        .wrap_err("cursor persistence failed, refusing to continue"));
                }
            }
        }
    }

    async fn tick(&mut self, synced: bool) -> Result<(), TickError> {
        let cursor = self.store.cursor(&self.topic);
        let batch = self
            .log
            .messages_after(&self.topic, cursor, FETCH_LIMIT)
            .await?;

        // First successful tick of a fresh topic: seed the cursor past any
        // pre-existing history instead of replaying it. Operators who want a
        // replay clear the persisted store.
        if !synced && cursor <= 1 {
            if let Some(tail) = batch.iter().map(|m| m.sequence_number).max() {
                info!(
                    topic = %self.topic,
                    tail,
                    skipped = batch.len(),
                    "fresh topic, skipping history and seeding the cursor"
                );
                self.store.set_cursor(&self.topic, tail)?;
                RelayMetrics::set_consumer_cursor(&self.topic, tail);
            }
            return Ok(());
        }

        let mut messages = batch;
        messages.retain(|m| m.sequence_number > cursor);
        messages.sort_by_key(|m| m.sequence_number);

        for message in messages {
            let seq = message.sequence_number;
            RelayMetrics::increment_log_messages_count();

            if let Some(complete) = self.chunks.feed(message) {
                self.admission.admit(complete).await?;
            }

            // persisted before the next message so a crash never skips one
            self.store.set_cursor(&self.topic, seq)?;
            RelayMetrics::set_consumer_cursor(&self.topic, seq);
        }

        Ok(())
    }
}
