use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::value::{StateValue, StateValueConverter, ValueType};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ValueMapping {
    pub from: String,
    pub to: String,
}

/// Named literal-to-value table, as configured.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateMapping {
    pub name: String,
    pub target_type: ValueType,
    #[serde(default)]
    pub mappings: Vec<ValueMapping>,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug)]
struct MappingTable {
    values: HashMap<String, StateValue>,
    default: Option<StateValue>,
}

/// Registry of state mappings, with every target value converted once at registration.
#[derive(Debug, Default)]
pub struct StateMapper {
    converter: StateValueConverter,
    tables: HashMap<String, MappingTable>,
}

impl StateMapper {
    pub fn new(mappings: Vec<StateMapping>) -> Result<Self, ConfigurationError> {
        let mut mapper = Self::default();
        for mapping in mappings {
            mapper.register(mapping)?;
        }
        Ok(mapper)
    }

    pub fn register(&mut self, mapping: StateMapping) -> Result<(), ConfigurationError> {
        if self.tables.contains_key(&mapping.name) {
            return Err(ConfigurationError::DuplicatedStateMapping(mapping.name));
        }

        let mut values = HashMap::with_capacity(mapping.mappings.len());
        for entry in &mapping.mappings {
            let value = self.convert(&mapping, &entry.to)?;
            // The first entry for a literal wins.
            values.entry(entry.from.clone()).or_insert(value);
        }

        let default = match &mapping.default {
            Some(default) => Some(self.convert(&mapping, default)?),
            None => None,
        };

        self.tables
            .insert(mapping.name, MappingTable { values, default });
        Ok(())
    }

    fn convert(&self, mapping: &StateMapping, value: &str) -> Result<StateValue, ConfigurationError> {
        self.converter
            .convert(value, mapping.target_type)
            .ok_or_else(|| ConfigurationError::InvalidMappingValue {
                mapping: mapping.name.clone(),
                value: value.to_owned(),
                value_type: mapping.target_type,
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn map_state(&self, name: &str, input: &str) -> Option<StateValue> {
        let Some(table) = self.tables.get(name) else {
            debug!(mapping = name, "state mapping not found");
            return None;
        };

        table
            .values
            .get(input)
            .or(table.default.as_ref())
            .cloned()
    }
}
