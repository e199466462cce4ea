use std::fmt;

use tracing::debug;

const CATEGORY_DELIMITER: char = '.';
const SUFFIX_DELIMITER: char = '_';

/// Structured identity of a tracked entity, e.g. `sensor.living_room_temperature`
/// is category `sensor`, device `living_room` and suffix `temperature`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    pub category: String,
    pub device: String,
    pub suffix: Option<String>,
}

impl EntityId {
    pub fn new(category: &str, device: &str, suffix: Option<&str>) -> Self {
        Self {
            category: category.to_owned(),
            device: device.to_owned(),
            suffix: suffix.map(str::to_owned),
        }
    }

    /// Same entity, reported under another device name.
    pub fn with_device(&self, device: &str) -> Self {
        Self {
            device: device.to_owned(),
            ..self.clone()
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.category, CATEGORY_DELIMITER, self.device)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "{SUFFIX_DELIMITER}{suffix}")?;
        }
        Ok(())
    }
}

/// Splits raw source identifiers into [`EntityId`]s using the set of known devices.
///
/// A device name may itself contain the suffix delimiter, so the split point can only
/// be found by matching against configured devices. When several devices are valid
/// prefixes of the same identifier, the longest one wins.
#[derive(Debug, Clone)]
pub struct EntityIdResolver {
    devices: Vec<String>,
}

impl EntityIdResolver {
    pub fn new<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut devices: Vec<String> = devices.into_iter().map(Into::into).collect();
        devices.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        devices.dedup();

        Self { devices }
    }

    pub fn resolve(&self, raw: &str) -> Option<EntityId> {
        let Some((category, remainder)) = raw.split_once(CATEGORY_DELIMITER) else {
            debug!(entity_id = raw, "entity id has no category delimiter");
            return None;
        };

        for device in &self.devices {
            if remainder == device {
                return Some(EntityId::new(category, device, None));
            }

            let suffix = remainder
                .strip_prefix(device.as_str())
                .and_then(|rest| rest.strip_prefix(SUFFIX_DELIMITER))
                .filter(|suffix| !suffix.is_empty());

            if let Some(suffix) = suffix {
                return Some(EntityId::new(category, device, Some(suffix)));
            }
        }

        debug!(entity_id = raw, "no configured device matches entity id");
        None
    }
}
