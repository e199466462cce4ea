use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::destination::StateRepository;
use crate::entity::EntityId;
use crate::error::{ConsistencyViolation, ExportError};

const TIMESTAMP_LOOKUP_CONCURRENCY: usize = 8;

/// An exported entity and the time of its newest change in the source.
///
/// `source_ids` lists the raw identifiers whose states end up under `entity`; there is
/// more than one when renamed devices are aliased to the same destination identity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityStateTime {
    pub entity: EntityId,
    pub last_updated: DateTime<Utc>,
    pub source_ids: BTreeSet<String>,
}

impl EntityStateTime {
    pub fn new(entity: EntityId, last_updated: DateTime<Utc>) -> Self {
        Self {
            source_ids: BTreeSet::from([entity.to_string()]),
            entity,
            last_updated,
        }
    }

    pub fn with_source_ids(mut self, source_ids: BTreeSet<String>) -> Self {
        self.source_ids = source_ids;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lag {
    Finite(Duration),
    Infinite,
}

impl fmt::Display for Lag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lag::Finite(duration) => write!(f, "{duration}"),
            Lag::Infinite => f.write_str("infinite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityStateLag {
    pub entity: EntityId,
    pub source_ids: BTreeSet<String>,
    pub last_updated: DateTime<Utc>,
    pub stored: Option<DateTime<Utc>>,
}

impl EntityStateLag {
    pub fn lag(&self) -> Result<Lag, ConsistencyViolation> {
        let Some(stored) = self.stored else {
            return Ok(Lag::Infinite);
        };

        if stored > self.last_updated {
            return Err(ConsistencyViolation {
                entity: self.entity.clone(),
                stored,
                most_recent: self.last_updated,
            });
        }

        Ok(Lag::Finite(self.last_updated - stored))
    }
}

/// A contiguous fetch: everything from `from` on, optionally for some entities only.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub from: DateTime<Utc>,
    pub entity_ids: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingStrategy {
    Empty,
    /// Everybody is nearly caught up, one unfiltered query is enough.
    Simple { from: DateTime<Utc> },
    /// Some entities are far behind; one filtered query per entity, most lagging first.
    Channeled { lags: Vec<(EntityStateLag, Lag)> },
}

impl ProcessingStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessingStrategy::Empty => "empty",
            ProcessingStrategy::Simple { .. } => "simple",
            ProcessingStrategy::Channeled { .. } => "channeled",
        }
    }

    pub fn work_units(&self) -> Vec<WorkUnit> {
        match self {
            ProcessingStrategy::Empty => Vec::new(),
            ProcessingStrategy::Simple { from } => vec![WorkUnit {
                from: *from,
                entity_ids: None,
            }],
            ProcessingStrategy::Channeled { lags } => lags
                .iter()
                .map(|(lag, _)| WorkUnit {
                    from: lag.stored.unwrap_or(DateTime::UNIX_EPOCH),
                    entity_ids: Some(lag.source_ids.clone()),
                })
                .collect(),
        }
    }
}

pub struct ProcessingStrategyResolver {
    repository: Arc<dyn StateRepository>,
    lag_threshold: Duration,
}

impl ProcessingStrategyResolver {
    pub fn new(repository: Arc<dyn StateRepository>, lag_threshold: Duration) -> Self {
        Self {
            repository,
            lag_threshold,
        }
    }

    pub async fn resolve(
        &self,
        tracked: &[EntityStateTime],
    ) -> Result<ProcessingStrategy, ExportError> {
        if tracked.is_empty() {
            info!("no tracked entities, nothing to process");
            return Ok(ProcessingStrategy::Empty);
        }

        let lags: Vec<EntityStateLag> = futures::stream::iter(tracked.to_vec())
            .map(|state| {
                let repository = Arc::clone(&self.repository);
                async move {
                    let stored = repository
                        .get_last_exported_timestamp(&state.entity)
                        .await?;
                    Ok::<_, ExportError>(EntityStateLag {
                        entity: state.entity,
                        source_ids: state.source_ids,
                        last_updated: state.last_updated,
                        stored,
                    })
                }
            })
            .buffered(TIMESTAMP_LOOKUP_CONCURRENCY)
            .try_collect()
            .await?;

        let mut lags = lags
            .into_iter()
            .map(|lag| lag.lag().map(|value| (lag, value)))
            .collect::<Result<Vec<_>, _>>()?;

        let threshold = Lag::Finite(self.lag_threshold);
        let strategy = if lags.iter().any(|(_, lag)| *lag > threshold) {
            debug!(
                lagging = ?lags
                    .iter()
                    .filter(|(_, lag)| *lag > threshold)
                    .map(|(state, lag)| format!("{}: {lag}", state.entity))
                    .collect::<Vec<_>>(),
                "entities over the lag threshold"
            );
            lags.sort_by(|(_, a), (_, b)| b.cmp(a));
            ProcessingStrategy::Channeled { lags }
        } else {
            match lags.iter().filter_map(|(state, _)| state.stored).min() {
                Some(from) => ProcessingStrategy::Simple { from },
                None => ProcessingStrategy::Empty,
            }
        };

        info!(
            strategy = strategy.name(),
            from = ?strategy.work_units().first().map(|unit| unit.from),
            "resolved processing strategy"
        );
        Ok(strategy)
    }
}
