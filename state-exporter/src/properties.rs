//! The YAML file describing which entities are exported and how.
//!
//! ```yaml
//! entities:
//!   - selector:
//!       categories: [sensor]
//!       devices: [fridge_plug, old_fridge_plug]
//!       suffixes: [power, energy]
//!     schema: energy
//! schemas:
//!   - name: energy
//!     series_name: energy
//!     device_aliases:
//!       old_fridge_plug: fridge_plug
//!     entities:
//!       - suffix: power
//!         type: float
//!         ignored_values: [unavailable, unknown]
//! state_mappings:
//!   - name: on_off
//!     target_type: boolean
//!     mappings:
//!       - { from: "on", to: "true" }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::error::ConfigurationError;
use crate::mapping::{StateMapper, StateMapping};
use crate::matcher::MultiValueMatcher;
use crate::pipeline::StatePipeline;
use crate::schema::{EntitySchema, Schema, SchemaRegistry};
use crate::selector::{EntityConfigurationResolver, EntitySelector, WILDCARD};
use crate::value::ValueType;

#[derive(Debug, Clone, Deserialize)]
pub struct RootProperties {
    #[serde(default)]
    pub entities: Vec<EntityProperties>,
    #[serde(default)]
    pub schemas: Vec<SchemaProperties>,
    #[serde(default)]
    pub state_mappings: Vec<StateMapping>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityProperties {
    pub selector: SelectorProperties,
    pub schema: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorProperties {
    #[serde(default = "wildcard")]
    pub categories: Vec<String>,
    /// Aliased devices are listed under their raw name as well.
    pub devices: Vec<String>,
    /// Missing means any suffix, an explicit `null` means no suffix.
    #[serde(default = "wildcard_suffixes")]
    pub suffixes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaProperties {
    pub name: String,
    pub series_name: String,
    #[serde(default)]
    pub device_aliases: HashMap<String, String>,
    pub entities: Vec<EntitySchemaProperties>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntitySchemaProperties {
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub state_mapping: Option<String>,
    #[serde(default)]
    pub ignored_values: Vec<String>,
    #[serde(default)]
    pub ignore_unmapped: bool,
}

fn wildcard() -> Vec<String> {
    vec![WILDCARD.to_owned()]
}

fn wildcard_suffixes() -> Option<Vec<String>> {
    Some(wildcard())
}

/// Validated configuration, ready to build a pipeline from.
#[derive(Debug)]
pub struct ExportConfiguration {
    pub configurations: EntityConfigurationResolver,
    pub schemas: SchemaRegistry,
    pub mapper: StateMapper,
}

impl ExportConfiguration {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let configuration = Self::from_yaml(&text)?;
        info!(path = %path.display(), "loaded export configuration");
        Ok(configuration)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigurationError> {
        let root: RootProperties = serde_yaml::from_str(text)?;
        Self::try_from(root)
    }

    pub fn into_pipeline(self) -> StatePipeline {
        StatePipeline::new(
            Arc::new(self.configurations),
            Arc::new(self.schemas),
            Arc::new(self.mapper),
        )
    }
}

impl TryFrom<RootProperties> for ExportConfiguration {
    type Error = ConfigurationError;

    fn try_from(root: RootProperties) -> Result<Self, Self::Error> {
        let mapper = StateMapper::new(root.state_mappings)?;

        let schemas = root
            .schemas
            .into_iter()
            .map(Schema::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let schemas = SchemaRegistry::new(schemas, &mapper)?;

        let mut entries = Vec::with_capacity(root.entities.len());
        for entity in root.entities {
            if !schemas.contains(&entity.schema) {
                return Err(ConfigurationError::UnknownSchema(entity.schema));
            }
            let selector = EntitySelector::new(
                entity.selector.categories,
                entity.selector.devices,
                entity.selector.suffixes,
            )?;
            entries.push((selector, entity.schema));
        }
        let configurations = EntityConfigurationResolver::new(entries)?;

        Ok(Self {
            configurations,
            schemas,
            mapper,
        })
    }
}

impl TryFrom<SchemaProperties> for Schema {
    type Error = ConfigurationError;

    fn try_from(properties: SchemaProperties) -> Result<Self, Self::Error> {
        let entities = properties
            .entities
            .into_iter()
            .map(|entity| -> Result<EntitySchema, ConfigurationError> {
                let schema = EntitySchema::new(entity.suffix.as_deref(), entity.value_type)
                    .with_ignored_values(MultiValueMatcher::new(&entity.ignored_values)?)
                    .with_ignore_unmapped(entity.ignore_unmapped);
                Ok(match entity.state_mapping {
                    Some(mapping) => schema.with_state_mapping(&mapping),
                    None => schema,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(
            Schema::new(&properties.name, &properties.series_name, entities)
                .with_device_aliases(properties.device_aliases),
        )
    }
}
