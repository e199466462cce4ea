use std::collections::HashMap;

use crate::entity::EntityId;
use crate::error::ConfigurationError;
use crate::mapping::StateMapper;
use crate::matcher::MultiValueMatcher;
use crate::selector::WILDCARD;
use crate::value::ValueType;

/// How values of one suffix of a schema are typed, remapped and filtered.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    /// `None` applies to entities without a suffix, `*` to any suffix.
    pub suffix: Option<String>,
    pub value_type: ValueType,
    pub state_mapping: Option<String>,
    pub ignored_values: MultiValueMatcher,
    pub ignore_unmapped: bool,
}

impl EntitySchema {
    pub fn new(suffix: Option<&str>, value_type: ValueType) -> Self {
        Self {
            suffix: suffix.map(str::to_owned),
            value_type,
            state_mapping: None,
            ignored_values: MultiValueMatcher::default(),
            ignore_unmapped: false,
        }
    }

    pub fn with_state_mapping(mut self, mapping: &str) -> Self {
        self.state_mapping = Some(mapping.to_owned());
        self
    }

    pub fn with_ignored_values(mut self, matcher: MultiValueMatcher) -> Self {
        self.ignored_values = matcher;
        self
    }

    pub fn with_ignore_unmapped(mut self, ignore_unmapped: bool) -> Self {
        self.ignore_unmapped = ignore_unmapped;
        self
    }

    fn is_wildcard(&self) -> bool {
        self.suffix.as_deref() == Some(WILDCARD)
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pub series_name: String,
    pub device_aliases: HashMap<String, String>,
    pub entities: Vec<EntitySchema>,
    default_entity: EntitySchema,
}

impl Schema {
    pub fn new(name: &str, series_name: &str, entities: Vec<EntitySchema>) -> Self {
        Self {
            name: name.to_owned(),
            series_name: series_name.to_owned(),
            device_aliases: HashMap::new(),
            entities,
            default_entity: EntitySchema::new(Some(WILDCARD), ValueType::String),
        }
    }

    pub fn with_device_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.device_aliases = aliases;
        self
    }

    /// Exact suffix first, then the wildcard entry, then a plain string schema.
    pub fn entity_schema(&self, suffix: Option<&str>) -> &EntitySchema {
        self.entities
            .iter()
            .find(|entity| !entity.is_wildcard() && entity.suffix.as_deref() == suffix)
            .or_else(|| self.entities.iter().find(|entity| entity.is_wildcard()))
            .unwrap_or(&self.default_entity)
    }

    /// Identity an entity is stored under, after device aliasing.
    pub fn destination_entity(&self, entity_id: &EntityId) -> EntityId {
        match self.device_aliases.get(&entity_id.device) {
            Some(alias) => entity_id.with_device(alias),
            None => entity_id.clone(),
        }
    }
}

/// Schemas by name, validated against the registered state mappings.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Schema>,
}

impl SchemaRegistry {
    pub fn new(schemas: Vec<Schema>, mapper: &StateMapper) -> Result<Self, ConfigurationError> {
        let mut registry = HashMap::with_capacity(schemas.len());
        for schema in schemas {
            for entity in &schema.entities {
                if let Some(mapping) = &entity.state_mapping {
                    if !mapper.contains(mapping) {
                        return Err(ConfigurationError::UnknownStateMapping {
                            schema: schema.name.clone(),
                            mapping: mapping.clone(),
                        });
                    }
                }
            }

            if registry.contains_key(&schema.name) {
                return Err(ConfigurationError::DuplicatedSchema(schema.name));
            }
            registry.insert(schema.name.clone(), schema);
        }

        Ok(Self { schemas: registry })
    }

    pub fn get(&self, name: &str) -> Option<&Schema> {
        self.schemas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }
}
