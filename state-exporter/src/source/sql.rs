use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{QueryBuilder, Row};
use tracing::{debug, warn};

use super::{SourceState, SourceStateProvider, SourceStateQuery};
use crate::error::SourceError;

/// Reads state history straight from the Home Assistant recorder tables.
pub struct SqlStateProvider {
    pool: MySqlPool,
}

impl SqlStateProvider {
    pub fn new(database_url: &str, max_connections: u32) -> Result<Self, SourceError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(database_url)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceStateProvider for SqlStateProvider {
    async fn get_states(&self, query: &SourceStateQuery) -> Result<Vec<SourceState>, SourceError> {
        if query.limit == 0 || query.entity_ids.as_ref().is_some_and(|ids| ids.is_empty()) {
            return Ok(Vec::new());
        }

        let rows = build_states_query(query)
            .build()
            .fetch_all(&self.pool)
            .await?;

        let mut states = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(state) = parse_row(row)? {
                states.push(state);
            }
        }

        debug!(
            from = %query.from,
            offset = query.offset,
            limit = query.limit,
            fetched = states.len(),
            "fetched source states"
        );
        Ok(states)
    }
}

fn build_states_query(query: &SourceStateQuery) -> QueryBuilder<'_, MySql> {
    let mut builder = QueryBuilder::new(
        "SELECT s.state_id, s.state, s.last_updated_ts, m.entity_id FROM states_meta m \
         JOIN (SELECT state_id, state, last_updated_ts, metadata_id FROM states \
         WHERE state IS NOT NULL AND metadata_id IS NOT NULL AND last_updated_ts >= ",
    );
    builder.push_bind(to_epoch_seconds(query.from));

    if let Some(entity_ids) = &query.entity_ids {
        builder.push(
            " AND metadata_id IN (SELECT metadata_id FROM states_meta WHERE entity_id IN (",
        );
        let mut separated = builder.separated(", ");
        for entity_id in entity_ids {
            separated.push_bind(entity_id.as_str());
        }
        separated.push_unseparated("))");
    }

    builder.push(" ORDER BY last_updated_ts, state_id LIMIT ");
    builder.push_bind(query.limit as u64);
    builder.push(" OFFSET ");
    builder.push_bind(query.offset as u64);
    builder.push(") s ON s.metadata_id = m.metadata_id ORDER BY s.last_updated_ts, s.state_id");

    builder
}

fn parse_row(row: &MySqlRow) -> Result<Option<SourceState>, sqlx::Error> {
    let id: i64 = row.try_get("state_id")?;
    let state: Option<String> = row.try_get("state")?;
    let last_updated: Option<f64> = row.try_get("last_updated_ts")?;
    let entity_id: Option<String> = row.try_get("entity_id")?;

    match (state, last_updated.and_then(from_epoch_seconds), entity_id) {
        (Some(state), Some(last_updated), Some(entity_id)) => Ok(Some(SourceState {
            id,
            entity_id,
            state,
            last_updated,
        })),
        _ => {
            warn!(state_id = id, "skipping state row with missing values");
            Ok(None)
        }
    }
}

fn to_epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / 1_000_000.0
}

fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn query(entity_ids: Option<&[&str]>) -> SourceStateQuery {
        SourceStateQuery {
            from: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            entity_ids: entity_ids
                .map(|ids| ids.iter().map(|id| id.to_string()).collect::<BTreeSet<_>>()),
            offset: 10,
            limit: 5,
        }
    }

    #[test]
    fn test_unfiltered_query() {
        let query = query(None);
        let builder = build_states_query(&query);

        assert_eq!(
            builder.sql(),
            "SELECT s.state_id, s.state, s.last_updated_ts, m.entity_id FROM states_meta m \
             JOIN (SELECT state_id, state, last_updated_ts, metadata_id FROM states \
             WHERE state IS NOT NULL AND metadata_id IS NOT NULL AND last_updated_ts >= ? \
             ORDER BY last_updated_ts, state_id LIMIT ? OFFSET ?) s \
             ON s.metadata_id = m.metadata_id ORDER BY s.last_updated_ts, s.state_id"
        );
    }

    #[test]
    fn test_filtered_query() {
        let query = query(Some(&["sensor.plug_power", "sensor.lamp"]));
        let builder = build_states_query(&query);

        assert!(builder.sql().contains(
            "AND metadata_id IN (SELECT metadata_id FROM states_meta WHERE entity_id IN (?, ?))"
        ));
    }

    #[test]
    fn test_incomplete_rows_are_excluded_before_paging() {
        let query = query(Some(&["sensor.plug_power"]));
        let builder = build_states_query(&query);
        let sql = builder.sql();

        let predicate = sql
            .find("state IS NOT NULL AND metadata_id IS NOT NULL AND last_updated_ts >= ?")
            .unwrap();
        assert!(predicate < sql.find(" LIMIT ?").unwrap());
    }

    #[test]
    fn test_epoch_seconds() {
        let time = DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap();

        assert_eq!(to_epoch_seconds(time), 1_700_000_000.123456);
        assert_eq!(from_epoch_seconds(1_700_000_000.123456), Some(time));
        assert_eq!(from_epoch_seconds(f64::NAN), None);
    }
}
