//! InfluxDB line protocol encoding, millisecond precision.

use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::value::StateValue;

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, StateValue)>,
    timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.to_owned(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        // Empty tag values are not representable.
        if !value.is_empty() {
            self.tags.push((key.to_owned(), value.to_owned()));
        }
        self
    }

    pub fn field(mut self, key: &str, value: StateValue) -> Self {
        self.fields.push((key.to_owned(), value));
        self
    }

    pub fn write_line(&self, out: &mut String) {
        escape_into(out, &self.measurement, &[',', ' ']);

        let mut tags: Vec<&(String, String)> = self.tags.iter().collect();
        tags.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in tags {
            out.push(',');
            escape_into(out, key, &[',', '=', ' ']);
            out.push('=');
            escape_into(out, value, &[',', '=', ' ']);
        }

        for (i, (key, value)) in self.fields.iter().enumerate() {
            out.push(if i == 0 { ' ' } else { ',' });
            escape_into(out, key, &[',', '=', ' ']);
            out.push('=');
            write_value(out, value);
        }

        // Writing to a String cannot fail.
        let _ = write!(out, " {}", self.timestamp.timestamp_millis());
    }
}

/// Newline separated lines for a batch of points.
pub fn encode(points: &[Point]) -> String {
    let mut out = String::with_capacity(points.len() * 96);
    for point in points {
        point.write_line(&mut out);
        out.push('\n');
    }
    out
}

fn write_value(out: &mut String, value: &StateValue) {
    match value {
        StateValue::String(value) => {
            out.push('"');
            escape_into(out, value, &['"', '\\']);
            out.push('"');
        }
        StateValue::Integer(value) => {
            let _ = write!(out, "{value}i");
        }
        StateValue::Float(value) => {
            let _ = write!(out, "{value}");
        }
        StateValue::Boolean(value) => {
            let _ = write!(out, "{value}");
        }
    }
}

fn escape_into(out: &mut String, value: &str, special: &[char]) {
    for c in value.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}
