pub mod app;
pub mod config;
pub mod destination;
pub mod entity;
pub mod error;
pub mod exporter;
pub mod flow;
pub mod health;
pub mod mapping;
pub mod matcher;
pub mod metrics_constants;
pub mod pipeline;
pub mod properties;
pub mod scheduler;
pub mod schema;
pub mod selector;
pub mod source;
pub mod strategy;
pub mod value;
