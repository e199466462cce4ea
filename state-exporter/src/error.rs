use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::entity::EntityId;
use crate::selector::ElementalEntitySelector;
use crate::value::ValueType;

/// Invalid static configuration. Always fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Found duplicated entity selectors: {}", format_selectors(.0))]
    DuplicatedEntitySelectors(Vec<ElementalEntitySelector>),
    #[error("Unable to register state mapping '{mapping}'. Value '{value}' cannot be represented as type {value_type}")]
    InvalidMappingValue {
        mapping: String,
        value: String,
        value_type: ValueType,
    },
    #[error("state mapping '{0}' is defined more than once")]
    DuplicatedStateMapping(String),
    #[error("schema '{0}' is defined more than once")]
    DuplicatedSchema(String),
    #[error("entity selector references unknown schema '{0}'")]
    UnknownSchema(String),
    #[error("schema '{schema}' references unknown state mapping '{mapping}'")]
    UnknownStateMapping { schema: String, mapping: String },
    #[error("entity selector must list at least one device")]
    MissingDevices,
    #[error("device wildcard is not allowed in entity selectors")]
    WildcardDevice,
    #[error("error while creating matcher for pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("setting {0} must be greater than zero")]
    ZeroSetting(&'static str),
    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

fn format_selectors(selectors: &[ElementalEntitySelector]) -> String {
    selectors
        .iter()
        .map(|selector| format!("\n - {selector}"))
        .collect()
}

/// Errors raised while reading from the source systems.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source database query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("entity metadata request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("entity metadata request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Errors raised by the destination store.
#[derive(Error, Debug)]
pub enum DestinationError {
    #[error("destination request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("destination rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed destination response: {0}")]
    MalformedResponse(String),
}

/// A stored export timestamp newer than anything the source knows about.
#[derive(Error, Debug)]
#[error("Stored state of entity {entity} ({stored}) is after most recent state ({most_recent})")]
pub struct ConsistencyViolation {
    pub entity: EntityId,
    pub stored: DateTime<Utc>,
    pub most_recent: DateTime<Utc>,
}

/// Anything that aborts a single export run.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Destination(#[from] DestinationError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyViolation),
}

#[derive(Error, Debug, PartialEq)]
pub enum SchedulerError {
    #[error("job '{0}' cannot be scheduled with an empty interval")]
    EmptyInterval(String),
    #[error("next launch time {next} of job '{job}' is not after current time {now}")]
    LaunchTimeNotAfterNow {
        job: String,
        next: DateTime<Utc>,
        now: DateTime<Utc>,
    },
}

/// A raw value that cannot be represented as the declared type.
#[derive(Error, Debug, PartialEq)]
#[error("value '{value}' of entity {entity} cannot be represented as type {value_type}")]
pub struct ConversionFailure {
    pub entity: EntityId,
    pub value: String,
    pub value_type: ValueType,
}
