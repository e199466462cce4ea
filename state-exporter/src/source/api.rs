use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{EntityMetadata, EntityMetadataProvider};
use crate::error::SourceError;

#[derive(Debug, Deserialize)]
struct ApiState {
    entity_id: String,
    last_changed: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

/// Lists entities through the Home Assistant REST API.
pub struct ApiMetadataProvider {
    client: Client,
    states_url: String,
    token: String,
}

impl ApiMetadataProvider {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            states_url: format!("{}/api/states", base_url.trim_end_matches('/')),
            token: token.to_owned(),
        })
    }
}

#[async_trait]
impl EntityMetadataProvider for ApiMetadataProvider {
    async fn get_entity_metadata(&self) -> Result<Vec<EntityMetadata>, SourceError> {
        let response = self
            .client
            .get(&self.states_url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let states: Vec<ApiState> = response.json().await?;
        debug!(count = states.len(), "fetched entity metadata");

        Ok(states
            .into_iter()
            .map(|state| EntityMetadata {
                entity_id: state.entity_id,
                last_updated: state.last_changed.max(state.last_updated),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_get_entity_metadata() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/api/states")
                    .header("authorization", "Bearer secret");
                then.status(200).json_body(json!([
                    {
                        "entity_id": "sensor.plug_power",
                        "state": "12.5",
                        "last_changed": "2024-03-01T10:00:00+00:00",
                        "last_updated": "2024-03-01T10:05:00+00:00",
                        "attributes": {}
                    },
                    {
                        "entity_id": "light.lamp",
                        "state": "on",
                        "last_changed": "2024-03-01T12:00:00.123+01:00",
                        "last_updated": "2024-03-01T11:00:00+01:00"
                    }
                ]));
            })
            .await;

        let provider =
            ApiMetadataProvider::new(&server.base_url(), "secret", Duration::from_secs(5)).unwrap();
        let metadata = provider.get_entity_metadata().await.unwrap();

        mock.assert_async().await;
        assert_eq!(
            metadata,
            vec![
                EntityMetadata {
                    entity_id: "sensor.plug_power".to_owned(),
                    last_updated: "2024-03-01T10:05:00Z".parse().unwrap(),
                },
                EntityMetadata {
                    entity_id: "light.lamp".to_owned(),
                    last_updated: "2024-03-01T11:00:00.123Z".parse().unwrap(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_request() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/api/states");
                then.status(401).body("unauthorized");
            })
            .await;

        let provider =
            ApiMetadataProvider::new(&server.base_url(), "wrong", Duration::from_secs(5)).unwrap();
        let err = provider.get_entity_metadata().await.unwrap_err();

        assert!(matches!(err, SourceError::Rejected { status: 401, .. }));
    }
}
