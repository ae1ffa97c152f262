//! Time-series persistence with bounded retries.

use m2mp_registry::{TimeSeriesStore, TimedSample};
use std::sync::Arc;
use std::time::Duration;

/// Stores samples, retrying a fixed number of times before giving up.
#[derive(Clone)]
pub struct SamplePersister {
    store: Arc<dyn TimeSeriesStore>,
    attempts: u32,
    delay: Duration,
}

impl SamplePersister {
    pub fn new(store: Arc<dyn TimeSeriesStore>, attempts: u32, delay: Duration) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn store_handle(&self) -> &Arc<dyn TimeSeriesStore> {
        &self.store
    }

    /// Stores one sample. Returns `false` once every attempt failed.
    pub async fn store(&self, sample: TimedSample) -> bool {
        for attempt in 1..=self.attempts {
            match self.store.append(sample.clone()) {
                Ok(()) => return true,
                Err(e) if attempt < self.attempts => {
                    tracing::debug!(
                        "Storing {} for {} failed (attempt {}): {}",
                        sample.data_type,
                        sample.key,
                        attempt,
                        e
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        "Giving up storing {} for {} after {} attempts: {}",
                        sample.data_type,
                        sample.key,
                        self.attempts,
                        e
                    );
                }
            }
        }
        false
    }

    /// Stores in the background so the session never waits on retries.
    pub fn spawn_store(&self, sample: TimedSample) -> tokio::task::JoinHandle<bool> {
        let persister = self.clone();
        tokio::spawn(async move { persister.store(sample).await })
    }
}
