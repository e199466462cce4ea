use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::entity::{EntityId, EntityIdResolver};
use crate::error::ConversionFailure;
use crate::mapping::StateMapper;
use crate::schema::{Schema, SchemaRegistry};
use crate::selector::EntityConfigurationResolver;
use crate::source::SourceState;
use crate::value::{StateValue, StateValueConverter};

/// A normalized, typed state ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub timestamp: DateTime<Utc>,
    pub entity_id: EntityId,
    pub series_name: String,
    pub value: StateValue,
}

/// Turns raw source states into [`State`]s. Records that cannot be resolved or converted
/// are logged and skipped.
pub struct StatePipeline {
    id_resolver: EntityIdResolver,
    configurations: Arc<EntityConfigurationResolver>,
    schemas: Arc<SchemaRegistry>,
    mapper: Arc<StateMapper>,
    converter: StateValueConverter,
}

impl StatePipeline {
    pub fn new(
        configurations: Arc<EntityConfigurationResolver>,
        schemas: Arc<SchemaRegistry>,
        mapper: Arc<StateMapper>,
    ) -> Self {
        Self {
            id_resolver: EntityIdResolver::new(configurations.devices()),
            configurations,
            schemas,
            mapper,
            converter: StateValueConverter,
        }
    }

    pub fn resolve_entity_id(&self, raw: &str) -> Option<EntityId> {
        self.id_resolver.resolve(raw)
    }

    /// Schema an entity is exported with, if it is configured at all.
    pub fn resolve_schema(&self, entity_id: &EntityId) -> Option<&Schema> {
        let Some(configuration) = self.configurations.resolve(entity_id) else {
            debug!(entity = %entity_id, "no configuration found for entity");
            return None;
        };

        let schema = self.schemas.get(&configuration.schema_name);
        if schema.is_none() {
            debug!(
                entity = %entity_id,
                schema = %configuration.schema_name,
                "schema not found for entity"
            );
        }
        schema
    }

    pub fn execute<'a, S, E>(&'a self, states: S) -> impl Stream<Item = Result<State, E>> + 'a
    where
        S: Stream<Item = Result<SourceState, E>> + 'a,
        E: 'a,
    {
        states.filter_map(move |state| {
            let processed = match state {
                Ok(state) => self.process(&state).map(Ok),
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(processed)
        })
    }

    pub fn process(&self, state: &SourceState) -> Option<State> {
        match self.process_single(state) {
            Ok(processed) => processed,
            Err(e) => {
                warn!(state_id = state.id, error = %e, "dropping state");
                None
            }
        }
    }

    fn process_single(&self, state: &SourceState) -> Result<Option<State>, ConversionFailure> {
        let Some(entity_id) = self.resolve_entity_id(&state.entity_id) else {
            return Ok(None);
        };
        let Some(schema) = self.resolve_schema(&entity_id) else {
            return Ok(None);
        };

        let entity_id = schema.destination_entity(&entity_id);
        let entity_schema = schema.entity_schema(entity_id.suffix.as_deref());

        if entity_schema.ignored_values.matches(&state.state) {
            debug!(state_id = state.id, entity = %entity_id, value = %state.state, "ignoring value");
            return Ok(None);
        }

        let mapped = match &entity_schema.state_mapping {
            Some(mapping) => self.mapper.map_state(mapping, &state.state),
            None => None,
        };

        let value = match mapped {
            Some(value) => value,
            None if entity_schema.state_mapping.is_some() && entity_schema.ignore_unmapped => {
                debug!(state_id = state.id, entity = %entity_id, value = %state.state, "ignoring unmapped value");
                return Ok(None);
            }
            None => self
                .converter
                .convert(&state.state, entity_schema.value_type)
                .ok_or_else(|| ConversionFailure {
                    entity: entity_id.clone(),
                    value: state.state.clone(),
                    value_type: entity_schema.value_type,
                })?,
        };

        Ok(Some(State {
            timestamp: state.last_updated,
            series_name: schema.series_name.clone(),
            entity_id,
            value,
        }))
    }
}
