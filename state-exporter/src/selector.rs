use std::collections::HashMap;
use std::fmt;

use crate::entity::EntityId;
use crate::error::ConfigurationError;

pub const WILDCARD: &str = "*";

/// Pattern over entity identities. Devices are always concrete so that the resolver
/// knows where the device ends and the suffix begins.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySelector {
    pub categories: Vec<String>,
    pub devices: Vec<String>,
    /// `None` selects entities without a suffix. A `*` entry selects any suffix, or none.
    pub suffixes: Option<Vec<String>>,
}

impl EntitySelector {
    pub fn new(
        categories: Vec<String>,
        devices: Vec<String>,
        suffixes: Option<Vec<String>>,
    ) -> Result<Self, ConfigurationError> {
        if devices.is_empty() {
            return Err(ConfigurationError::MissingDevices);
        }
        if devices.iter().any(|device| device == WILDCARD) {
            return Err(ConfigurationError::WildcardDevice);
        }

        Ok(Self {
            categories,
            devices,
            suffixes,
        })
    }

    pub fn matches(&self, id: &EntityId) -> bool {
        let category_matches = self
            .categories
            .iter()
            .any(|category| category == WILDCARD || *category == id.category);
        let device_matches = self.devices.iter().any(|device| *device == id.device);
        let suffix_matches = match (&self.suffixes, &id.suffix) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(suffixes), suffix) => suffixes.iter().any(|candidate| {
                candidate == WILDCARD || Some(candidate.as_str()) == suffix.as_deref()
            }),
        };

        category_matches && device_matches && suffix_matches
    }

    /// Cross-product of the selector's values, used to detect overlapping selectors.
    pub fn elemental_selectors(&self) -> Vec<ElementalEntitySelector> {
        let suffixes: Vec<Option<&String>> = match &self.suffixes {
            Some(suffixes) if !suffixes.is_empty() => suffixes.iter().map(Some).collect(),
            _ => vec![None],
        };

        let mut elemental = Vec::new();
        for category in &self.categories {
            for device in &self.devices {
                for suffix in &suffixes {
                    elemental.push(ElementalEntitySelector {
                        category: category.clone(),
                        device: device.clone(),
                        suffix: suffix.cloned(),
                    });
                }
            }
        }
        elemental
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementalEntitySelector {
    pub category: String,
    pub device: String,
    pub suffix: Option<String>,
}

impl fmt::Display for ElementalEntitySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "category: {}, device: {}, suffix: {}",
            self.category,
            self.device,
            self.suffix.as_deref().unwrap_or("none")
        )
    }
}

/// Entity paired with the schema it is exported with.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityConfiguration {
    pub entity_id: EntityId,
    pub schema_name: String,
}

/// Assigns schemas to entities. Selectors are tried in configured order.
#[derive(Debug)]
pub struct EntityConfigurationResolver {
    entries: Vec<(EntitySelector, String)>,
}

impl EntityConfigurationResolver {
    pub fn new(entries: Vec<(EntitySelector, String)>) -> Result<Self, ConfigurationError> {
        let mut counts: HashMap<ElementalEntitySelector, usize> = HashMap::new();
        for (selector, _) in &entries {
            for elemental in selector.elemental_selectors() {
                *counts.entry(elemental).or_default() += 1;
            }
        }

        let mut duplicates: Vec<ElementalEntitySelector> = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(elemental, _)| elemental)
            .collect();

        if !duplicates.is_empty() {
            duplicates.sort();
            return Err(ConfigurationError::DuplicatedEntitySelectors(duplicates));
        }

        Ok(Self { entries })
    }

    pub fn resolve(&self, entity_id: &EntityId) -> Option<EntityConfiguration> {
        self.entries
            .iter()
            .find(|(selector, _)| selector.matches(entity_id))
            .map(|(_, schema_name)| EntityConfiguration {
                entity_id: entity_id.clone(),
                schema_name: schema_name.clone(),
            })
    }

    /// Every device named by any selector.
    pub fn devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self
            .entries
            .iter()
            .flat_map(|(selector, _)| selector.devices.iter().cloned())
            .collect();
        devices.sort();
        devices.dedup();
        devices
    }

    pub fn schema_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, schema)| schema.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn selector(categories: &[&str], devices: &[&str], suffixes: Option<&[&str]>) -> EntitySelector {
        EntitySelector::new(strings(categories), strings(devices), suffixes.map(strings)).unwrap()
    }

    #[test]
    fn test_matches_category_wildcard() {
        let selector = selector(&["*"], &["living_room"], Some(&["temperature"]));

        assert!(selector.matches(&EntityId::new("sensor", "living_room", Some("temperature"))));
        assert!(selector.matches(&EntityId::new("climate", "living_room", Some("temperature"))));
        assert!(!selector.matches(&EntityId::new("sensor", "living_room", Some("humidity"))));
        assert!(!selector.matches(&EntityId::new("sensor", "bathroom", Some("temperature"))));
    }

    #[test]
    fn test_matches_suffix_none() {
        let selector = selector(&["sensor"], &["living_room"], None);

        assert!(selector.matches(&EntityId::new("sensor", "living_room", None)));
        assert!(!selector.matches(&EntityId::new("sensor", "living_room", Some("temperature"))));
    }

    #[test]
    fn test_matches_suffix_wildcard() {
        let selector = selector(&["sensor"], &["living_room"], Some(&["*"]));

        assert!(selector.matches(&EntityId::new("sensor", "living_room", Some("temperature"))));
        assert!(selector.matches(&EntityId::new("sensor", "living_room", None)));
    }

    #[test]
    fn test_rejects_device_wildcard() {
        let result = EntitySelector::new(strings(&["*"]), strings(&["*"]), None);
        assert!(matches!(result, Err(ConfigurationError::WildcardDevice)));

        let result = EntitySelector::new(strings(&["*"]), vec![], None);
        assert!(matches!(result, Err(ConfigurationError::MissingDevices)));
    }

    #[test]
    fn test_elemental_selectors() {
        let selector = selector(&["sensor", "switch"], &["plug"], Some(&["power", "energy"]));

        let elemental = selector.elemental_selectors();
        assert_eq!(elemental.len(), 4);
        assert_eq!(
            elemental[0].to_string(),
            "category: sensor, device: plug, suffix: power"
        );

        let none = self::selector(&["sensor"], &["plug"], None).elemental_selectors();
        assert_eq!(none.len(), 1);
        assert_eq!(none[0].suffix, None);
    }

    #[test]
    fn test_resolver_detects_duplicates() {
        let result = EntityConfigurationResolver::new(vec![
            (selector(&["sensor"], &["plug", "lamp"], Some(&["power"])), "a".to_owned()),
            (selector(&["sensor"], &["lamp"], Some(&["power", "energy"])), "b".to_owned()),
            (selector(&["sensor"], &["plug"], Some(&["energy"])), "c".to_owned()),
        ]);

        let Err(ConfigurationError::DuplicatedEntitySelectors(duplicates)) = result else {
            panic!("expected duplicated selectors error");
        };
        assert_eq!(
            duplicates,
            vec![ElementalEntitySelector {
                category: "sensor".to_owned(),
                device: "lamp".to_owned(),
                suffix: Some("power".to_owned()),
            }]
        );
    }

    #[test]
    fn test_duplicate_error_message() {
        let result = EntityConfigurationResolver::new(vec![
            (selector(&["sensor"], &["plug"], None), "a".to_owned()),
            (selector(&["sensor"], &["plug"], None), "b".to_owned()),
        ]);

        assert_eq!(
            result.unwrap_err().to_string(),
            "Found duplicated entity selectors: \n - category: sensor, device: plug, suffix: none"
        );
    }

    #[test]
    fn test_resolver_uses_first_match() {
        let resolver = EntityConfigurationResolver::new(vec![
            (selector(&["sensor"], &["plug"], Some(&["power"])), "power".to_owned()),
            (selector(&["*"], &["plug"], Some(&["*"])), "generic".to_owned()),
        ])
        .unwrap();

        let power = EntityId::new("sensor", "plug", Some("power"));
        assert_eq!(resolver.resolve(&power).unwrap().schema_name, "power");

        let energy = EntityId::new("sensor", "plug", Some("energy"));
        assert_eq!(resolver.resolve(&energy).unwrap().schema_name, "generic");

        let bare = EntityId::new("sensor", "plug", None);
        assert_eq!(resolver.resolve(&bare).unwrap().schema_name, "generic");
        assert_eq!(resolver.resolve(&EntityId::new("sensor", "lamp", None)), None);
        assert_eq!(resolver.devices(), vec!["plug".to_owned()]);
    }
}
