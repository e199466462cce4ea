use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SourceError;

pub mod api;
pub mod sql;

/// A state change as recorded by the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceState {
    pub id: i64,
    pub entity_id: String,
    pub state: String,
    pub last_updated: DateTime<Utc>,
}

/// One page of a work unit.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceStateQuery {
    pub from: DateTime<Utc>,
    pub entity_ids: Option<BTreeSet<String>>,
    pub offset: usize,
    pub limit: usize,
}

/// An entity known to the source, with the time of its latest change.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMetadata {
    pub entity_id: String,
    pub last_updated: DateTime<Utc>,
}

#[async_trait]
pub trait EntityMetadataProvider: Send + Sync {
    async fn get_entity_metadata(&self) -> Result<Vec<EntityMetadata>, SourceError>;
}

#[async_trait]
pub trait SourceStateProvider: Send + Sync {
    /// States changed at or after `query.from`, ordered by time.
    async fn get_states(&self, query: &SourceStateQuery) -> Result<Vec<SourceState>, SourceError>;
}
