use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::entity::EntityId;
use crate::error::{DestinationError, ExportError};
use crate::exporter::ExportStatus;
use crate::pipeline::State;

pub mod influxdb;
pub mod line_protocol;

#[async_trait]
pub trait StateRepository: Send + Sync {
    /// Writes one batch. A state with the same series, tags and timestamp as an
    /// existing point replaces it.
    async fn save(&self, states: &[State]) -> Result<(), DestinationError>;

    async fn get_last_exported_timestamp(
        &self,
        entity: &EntityId,
    ) -> Result<Option<DateTime<Utc>>, DestinationError>;
}

#[async_trait]
pub trait ExportStatusSink: Send + Sync {
    async fn save(&self, status: &ExportStatus) -> Result<(), DestinationError>;
}

/// What has been written so far during one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveStats {
    pub saved: usize,
    pub batches: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl SaveStats {
    fn record(&mut self, batch: &[State]) {
        self.saved += batch.len();
        self.batches += 1;
        for state in batch {
            self.first = Some(self.first.map_or(state.timestamp, |t| t.min(state.timestamp)));
            self.last = Some(self.last.map_or(state.timestamp, |t| t.max(state.timestamp)));
        }
    }
}

/// Drains `states` into the repository in batches of at most `batch_size`.
///
/// Whatever was read before an upstream error is still written, then the error is
/// returned. `stats` reflects every batch that made it to the repository.
pub async fn save_stream<S>(
    repository: &dyn StateRepository,
    states: S,
    batch_size: usize,
    stats: &mut SaveStats,
) -> Result<(), ExportError>
where
    S: Stream<Item = Result<State, ExportError>>,
{
    let batch_size = batch_size.max(1);
    let mut states = std::pin::pin!(states);
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(state) = states.next().await {
        match state {
            Ok(state) => {
                batch.push(state);
                if batch.len() >= batch_size {
                    flush(repository, &mut batch, stats).await?;
                }
            }
            Err(e) => {
                flush(repository, &mut batch, stats).await?;
                return Err(e);
            }
        }
    }

    flush(repository, &mut batch, stats).await
}

async fn flush(
    repository: &dyn StateRepository,
    batch: &mut Vec<State>,
    stats: &mut SaveStats,
) -> Result<(), ExportError> {
    if batch.is_empty() {
        return Ok(());
    }

    repository.save(batch).await?;
    stats.record(batch);
    debug!(size = batch.len(), saved = stats.saved, "saved batch");
    batch.clear();
    Ok(())
}
