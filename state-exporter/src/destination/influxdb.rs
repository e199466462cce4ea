use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde_json::json;
use tracing::{debug, info};

use super::line_protocol::{self, Point};
use super::{ExportStatusSink, StateRepository};
use crate::entity::EntityId;
use crate::error::DestinationError;
use crate::exporter::ExportStatus;
use crate::pipeline::State;
use crate::value::StateValue;

pub const STATUS_MEASUREMENT: &str = "state_exporter_status";
const DEFAULT_FIELD: &str = "value";

/// Minimal InfluxDB v2 HTTP client: line protocol writes and Flux queries.
#[derive(Clone)]
pub struct InfluxDbClient {
    client: Client,
    url: String,
    org: String,
    token: String,
}

impl InfluxDbClient {
    pub fn new(url: &str, org: &str, token: &str, timeout: Duration) -> Result<Self, DestinationError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_owned(),
            org: org.to_owned(),
            token: token.to_owned(),
        })
    }

    pub async fn write(&self, bucket: &str, points: &[Point]) -> Result<(), DestinationError> {
        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(format!("{}/api/v2/write", self.url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", bucket),
                ("precision", "ms"),
            ])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line_protocol::encode(points))
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }

    /// Runs a Flux query, returning the raw CSV response.
    pub async fn query(&self, flux: &str) -> Result<String, DestinationError> {
        let response = self
            .client
            .post(format!("{}/api/v2/query", self.url))
            .query(&[("org", self.org.as_str())])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(ACCEPT, "application/csv")
            .json(&json!({
                "query": flux,
                "type": "flux",
                "dialect": { "header": true, "annotations": [] },
            }))
            .send()
            .await?;

        Ok(check_status(response).await?.text().await?)
    }
}

async fn check_status(response: Response) -> Result<Response, DestinationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(DestinationError::Rejected {
        status: status.as_u16(),
        body,
    })
}

pub struct InfluxDbStateRepository {
    client: InfluxDbClient,
    bucket: String,
}

impl InfluxDbStateRepository {
    pub fn new(client: InfluxDbClient, bucket: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_owned(),
        }
    }
}

fn field_name(entity: &EntityId) -> &str {
    entity.suffix.as_deref().unwrap_or(DEFAULT_FIELD)
}

fn state_point(state: &State) -> Point {
    let entity = &state.entity_id;
    Point::new(&state.series_name, state.timestamp)
        .tag("category", &entity.category)
        .tag("device", &entity.device)
        .tag("suffix", entity.suffix.as_deref().unwrap_or_default())
        .field(field_name(entity), state.value.clone())
}

fn flux_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn last_timestamp_query(bucket: &str, entity: &EntityId) -> String {
    format!(
        "from(bucket: {bucket})\n\
         \x20 |> range(start: 0)\n\
         \x20 |> filter(fn: (r) => r[\"category\"] == {category} and r[\"device\"] == {device} and {suffix} and r[\"_field\"] == {field})\n\
         \x20 |> keep(columns: [\"_time\"])\n\
         \x20 |> group()\n\
         \x20 |> sort(columns: [\"_time\"], desc: true)\n\
         \x20 |> limit(n: 1)",
        bucket = flux_string(bucket),
        category = flux_string(&entity.category),
        device = flux_string(&entity.device),
        suffix = suffix_predicate(entity),
        field = flux_string(field_name(entity)),
    )
}

/// Points of suffix-less entities carry no `suffix` tag at all.
fn suffix_predicate(entity: &EntityId) -> String {
    match &entity.suffix {
        Some(suffix) => format!("r[\"suffix\"] == {}", flux_string(suffix)),
        None => "not exists r[\"suffix\"]".to_owned(),
    }
}

fn is_table_header(record: &csv::StringRecord) -> bool {
    record.get(1) == Some("result") && record.get(2) == Some("table")
}

/// Latest `_time` found in a CSV query response. Every table starts with its own header.
fn parse_last_time(body: &str) -> Result<Option<DateTime<Utc>>, DestinationError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut time_column = None;
    let mut latest: Option<DateTime<Utc>> = None;

    for record in reader.records() {
        let record = record.map_err(|e| DestinationError::MalformedResponse(e.to_string()))?;

        if is_table_header(&record) {
            time_column = record.iter().position(|column| column == "_time");
            if time_column.is_none() {
                return Err(DestinationError::MalformedResponse(format!(
                    "no _time column in header: {record:?}"
                )));
            }
            continue;
        }

        let value = time_column
            .and_then(|index| record.get(index))
            .ok_or_else(|| {
                DestinationError::MalformedResponse(format!("row is missing _time: {record:?}"))
            })?;
        let time = DateTime::parse_from_rfc3339(value)
            .map_err(|e| DestinationError::MalformedResponse(format!("invalid _time {value}: {e}")))?
            .with_timezone(&Utc);
        latest = latest.max(Some(time));
    }

    Ok(latest)
}

#[async_trait]
impl StateRepository for InfluxDbStateRepository {
    async fn save(&self, states: &[State]) -> Result<(), DestinationError> {
        let points: Vec<Point> = states.iter().map(state_point).collect();
        self.client.write(&self.bucket, &points).await?;
        debug!(count = points.len(), bucket = %self.bucket, "wrote states");
        Ok(())
    }

    async fn get_last_exported_timestamp(
        &self,
        entity: &EntityId,
    ) -> Result<Option<DateTime<Utc>>, DestinationError> {
        let body = self
            .client
            .query(&last_timestamp_query(&self.bucket, entity))
            .await?;
        parse_last_time(&body)
    }
}

/// Records run summaries in a dedicated bucket.
pub struct InfluxDbExportStatusSink {
    client: InfluxDbClient,
    bucket: String,
}

impl InfluxDbExportStatusSink {
    pub fn new(client: InfluxDbClient, bucket: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_owned(),
        }
    }
}

fn count(value: usize) -> StateValue {
    StateValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
}

fn status_point(status: &ExportStatus) -> Point {
    let mut point = Point::new(STATUS_MEASUREMENT, status.finished_at)
        .tag("status", if status.success { "success" } else { "failure" })
        .field("started_at", StateValue::Integer(status.started_at.timestamp_millis()))
        .field("finished_at", StateValue::Integer(status.finished_at.timestamp_millis()))
        .field("loaded_states", count(status.loaded_states))
        .field("saved_states", count(status.saved_states))
        .field("entities", count(status.entities));

    if let Some(first) = status.first_state_time {
        point = point.field("first_state_time", StateValue::Integer(first.timestamp_millis()));
    }
    if let Some(last) = status.last_state_time {
        point = point.field("last_state_time", StateValue::Integer(last.timestamp_millis()));
    }
    if let Some(error) = &status.error {
        point = point.field("error", StateValue::String(error.clone()));
    }
    point
}

#[async_trait]
impl ExportStatusSink for InfluxDbExportStatusSink {
    async fn save(&self, status: &ExportStatus) -> Result<(), DestinationError> {
        self.client
            .write(&self.bucket, &[status_point(status)])
            .await?;
        info!(bucket = %self.bucket, success = status.success, "saved export status");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;

    use super::*;

    fn client(server: &MockServer) -> InfluxDbClient {
        InfluxDbClient::new(&server.base_url(), "home", "secret", Duration::from_secs(5)).unwrap()
    }

    fn time(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    #[tokio::test]
    async fn test_save_states() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/api/v2/write")
                    .query_param("org", "home")
                    .query_param("bucket", "states")
                    .query_param("precision", "ms")
                    .header("authorization", "Token secret")
                    .body(
                        "energy,category=sensor,device=plug,suffix=power power=12.5 1700000000000\n\
                         energy,category=binary_sensor,device=plug value=true 1700000001000\n",
                    );
                then.status(204);
            })
            .await;

        let repository = InfluxDbStateRepository::new(client(&server), "states");
        let states = vec![
            State {
                timestamp: time(1_700_000_000_000),
                entity_id: EntityId::new("sensor", "plug", Some("power")),
                series_name: "energy".to_owned(),
                value: StateValue::Float(12.5),
            },
            State {
                timestamp: time(1_700_000_001_000),
                entity_id: EntityId::new("binary_sensor", "plug", None),
                series_name: "energy".to_owned(),
                value: StateValue::Boolean(true),
            },
        ];

        repository.save(&states).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_save_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/api/v2/write");
                then.status(400).body("unable to parse points");
            })
            .await;

        let repository = InfluxDbStateRepository::new(client(&server), "states");
        let state = State {
            timestamp: time(0),
            entity_id: EntityId::new("sensor", "plug", None),
            series_name: "energy".to_owned(),
            value: StateValue::Integer(1),
        };

        let err = repository.save(&[state]).await.unwrap_err();

        assert!(matches!(err, DestinationError::Rejected { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_get_last_exported_timestamp() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/api/v2/query")
                    .query_param("org", "home")
                    .header("accept", "application/csv")
                    .body_contains("r[\\\"device\\\"] == \\\"plug\\\"")
                    .body_contains("r[\\\"_field\\\"] == \\\"power\\\"");
                then.status(200).body(
                    ",result,table,_time\r\n,_result,0,2024-03-01T10:05:00.25Z\r\n\r\n",
                );
            })
            .await;

        let repository = InfluxDbStateRepository::new(client(&server), "states");
        let last = repository
            .get_last_exported_timestamp(&EntityId::new("sensor", "plug", Some("power")))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(last, Some("2024-03-01T10:05:00.250Z".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_never_exported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/api/v2/query");
                then.status(200).body("\r\n");
            })
            .await;

        let repository = InfluxDbStateRepository::new(client(&server), "states");
        let last = repository
            .get_last_exported_timestamp(&EntityId::new("sensor", "plug", None))
            .await
            .unwrap();

        assert_eq!(last, None);
    }

    #[test]
    fn test_parse_last_time_across_tables() {
        let csv = ",result,table,_time\n,_result,0,2024-03-01T10:00:00Z\n\n\
                   ,result,table,_time\n,_result,1,2024-03-01T11:00:00Z\n";

        assert_eq!(
            parse_last_time(csv).unwrap(),
            Some("2024-03-01T11:00:00Z".parse().unwrap())
        );
        assert!(parse_last_time(",result,table\n,_result,0\n").is_err());
    }

    #[test]
    fn test_parse_last_time_with_quoted_values() {
        let csv = ",result,table,device,_time\r\n\
                   ,_result,0,\"kitchen, left\",2024-03-01T10:00:00Z\r\n\
                   ,_result,0,\"say \"\"hi\"\"\",2024-03-01T09:00:00Z\r\n";

        assert_eq!(
            parse_last_time(csv).unwrap(),
            Some("2024-03-01T10:00:00Z".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_last_time_row_before_header() {
        assert!(matches!(
            parse_last_time(",_result,0,2024-03-01T10:00:00Z\n"),
            Err(DestinationError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_last_timestamp_query() {
        let query = last_timestamp_query("states", &EntityId::new("sensor", "plug\"x", None));

        assert!(query.starts_with("from(bucket: \"states\")"));
        assert!(query.contains("r[\"device\"] == \"plug\\\"x\""));
        assert!(query.contains("r[\"_field\"] == \"value\""));
        assert!(query.contains("not exists r[\"suffix\"]"));
    }

    #[test]
    fn test_last_timestamp_query_separates_suffix_from_bare_entity() {
        let bare = last_timestamp_query("states", &EntityId::new("sensor", "plug", None));
        let suffixed =
            last_timestamp_query("states", &EntityId::new("sensor", "plug", Some("value")));

        assert!(bare.contains("not exists r[\"suffix\"]"));
        assert!(!suffixed.contains("not exists"));
        assert!(suffixed.contains("r[\"suffix\"] == \"value\""));
        assert!(suffixed.contains("r[\"_field\"] == \"value\""));
    }

    #[tokio::test]
    async fn test_save_export_status() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.path("/api/v2/write")
                    .query_param("bucket", "status")
                    .body(
                        "state_exporter_status,status=failure started_at=1000i,finished_at=5000i,\
                         loaded_states=10i,saved_states=8i,entities=3i,first_state_time=2000i,\
                         last_state_time=3000i,error=\"source down\" 5000\n",
                    );
                then.status(204);
            })
            .await;

        let sink = InfluxDbExportStatusSink::new(client(&server), "status");
        let status = ExportStatus {
            started_at: time(1000),
            finished_at: time(5000),
            success: false,
            error: Some("source down".to_owned()),
            loaded_states: 10,
            saved_states: 8,
            entities: 3,
            first_state_time: Some(time(2000)),
            last_state_time: Some(time(3000)),
        };

        sink.save(&status).await.unwrap();

        mock.assert_async().await;
    }
}
