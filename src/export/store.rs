use crate::config::InfluxConfig;
use crate::error::{ImporterError, Result};
use crate::export::point::BatchPoints;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

/// The time-series store the importer writes to.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Run an administrative statement such as `CREATE DATABASE`.
    async fn execute(&self, command: &str, database: &str) -> Result<()>;

    /// Write a batch of points.
    async fn write(&self, batch: &BatchPoints) -> Result<()>;
}

/// InfluxDB 1.x HTTP API client.
pub struct InfluxClient {
    client: reqwest::Client,
    query_url: reqwest::Url,
    write_url: reqwest::Url,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    error: Option<String>,
}

impl InfluxClient {
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let base: reqwest::Url = config.url.parse().map_err(|e| {
            ImporterError::Config(format!("Invalid influxdb.url '{}': {e}", config.url))
        })?;
        let query_url = endpoint(&base, "query")?;
        let write_url = endpoint(&base, "write")?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            query_url,
            write_url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn credentials(&self) -> Vec<(&'static str, &str)> {
        if self.username.is_empty() {
            Vec::new()
        } else {
            vec![("u", self.username.as_str()), ("p", self.password.as_str())]
        }
    }
}

/// Append `segment` to the base URL path, keeping any proxy prefix.
fn endpoint(base: &reqwest::Url, segment: &str) -> Result<reqwest::Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| ImporterError::Config(format!("Invalid influxdb.url '{base}'")))?
        .pop_if_empty()
        .push(segment);
    Ok(url)
}

#[async_trait]
impl StoreClient for InfluxClient {
    #[instrument(skip(self), fields(url = %self.query_url))]
    async fn execute(&self, command: &str, database: &str) -> Result<()> {
        let response = self
            .client
            .post(self.query_url.clone())
            .query(&[("q", command), ("db", database)])
            .query(&self.credentials())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ImporterError::Store(format!(
                "query returned {status}: {}",
                body.trim()
            )));
        }

        let parsed: QueryResponse = serde_json::from_str(&body)
            .map_err(|e| ImporterError::Store(format!("malformed query response: {e}")))?;
        if let Some(error) = parsed.error {
            return Err(ImporterError::Store(error));
        }
        if let Some(error) = parsed.results.into_iter().find_map(|r| r.error) {
            return Err(ImporterError::Store(error));
        }

        debug!("Query executed");
        Ok(())
    }

    #[instrument(skip(self, batch), fields(db = %batch.database(), points = batch.len()))]
    async fn write(&self, batch: &BatchPoints) -> Result<()> {
        let response = self
            .client
            .post(self.write_url.clone())
            .query(&[
                ("db", batch.database()),
                ("precision", batch.precision().as_str()),
            ])
            .query(&self.credentials())
            .body(batch.to_line_protocol())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ImporterError::Store(format!(
                "write returned {status}: {}",
                body.trim()
            )));
        }

        debug!("Batch written");
        Ok(())
    }
}

impl std::fmt::Debug for InfluxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxClient")
            .field("query_url", &self.query_url.as_str())
            .field("write_url", &self.write_url.as_str())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::point::{FieldValue, Point, Precision};
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeInflux {
        queries: Mutex<Vec<HashMap<String, String>>>,
        writes: Mutex<Vec<(HashMap<String, String>, String)>>,
        reject_writes: bool,
        query_error: Option<String>,
    }

    async fn query_handler(
        State(fake): State<Arc<FakeInflux>>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        fake.queries.lock().unwrap().push(params);
        let result = match &fake.query_error {
            Some(e) => serde_json::json!({ "results": [{ "statement_id": 0, "error": e }] }),
            None => serde_json::json!({ "results": [{ "statement_id": 0 }] }),
        };
        Json(result).into_response()
    }

    async fn write_handler(
        State(fake): State<Arc<FakeInflux>>,
        Query(params): Query<HashMap<String, String>>,
        body: String,
    ) -> Response {
        fake.writes.lock().unwrap().push((params, body));
        if fake.reject_writes {
            (StatusCode::BAD_REQUEST, "{\"error\":\"partial write\"}").into_response()
        } else {
            StatusCode::NO_CONTENT.into_response()
        }
    }

    async fn spawn_fake(fake: Arc<FakeInflux>) -> String {
        let app = Router::new()
            .route("/query", post(query_handler))
            .route("/write", post(write_handler))
            .with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn config(url: String, username: &str) -> InfluxConfig {
        InfluxConfig {
            url,
            username: username.to_string(),
            password: "pw".to_string(),
            timeout: Duration::from_secs(5),
            ..InfluxConfig::default()
        }
    }

    fn batch() -> BatchPoints {
        let mut batch = BatchPoints::new("lag", Precision::Seconds);
        let fields = BTreeMap::from([("lag".to_string(), FieldValue::Integer(5))]);
        batch.add_point(Point::new("consumer_metrics", BTreeMap::new(), fields, 100).unwrap());
        batch
    }

    #[tokio::test]
    async fn test_execute_sends_command_and_credentials() {
        let fake = Arc::new(FakeInflux::default());
        let url = spawn_fake(Arc::clone(&fake)).await;
        let client = InfluxClient::new(&config(url, "admin")).unwrap();

        client.execute("CREATE DATABASE \"lag\"", "lag").await.unwrap();

        let queries = fake.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].get("q").unwrap(), "CREATE DATABASE \"lag\"");
        assert_eq!(queries[0].get("db").unwrap(), "lag");
        assert_eq!(queries[0].get("u").unwrap(), "admin");
        assert_eq!(queries[0].get("p").unwrap(), "pw");
    }

    #[tokio::test]
    async fn test_execute_surfaces_statement_error() {
        let fake = Arc::new(FakeInflux {
            query_error: Some("authorization failed".to_string()),
            ..FakeInflux::default()
        });
        let url = spawn_fake(fake).await;
        let client = InfluxClient::new(&config(url, "")).unwrap();

        let err = client.execute("CREATE DATABASE \"lag\"", "lag").await.unwrap_err();
        assert!(err.to_string().contains("authorization failed"));
    }

    #[tokio::test]
    async fn test_write_posts_line_protocol() {
        let fake = Arc::new(FakeInflux::default());
        let url = spawn_fake(Arc::clone(&fake)).await;
        let client = InfluxClient::new(&config(url, "")).unwrap();

        client.write(&batch()).await.unwrap();

        let writes = fake.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        let (params, body) = &writes[0];
        assert_eq!(params.get("db").unwrap(), "lag");
        assert_eq!(params.get("precision").unwrap(), "s");
        assert!(!params.contains_key("u"));
        assert_eq!(body, "consumer_metrics lag=5i 100\n");
    }

    #[tokio::test]
    async fn test_write_rejection_is_an_error() {
        let fake = Arc::new(FakeInflux {
            reject_writes: true,
            ..FakeInflux::default()
        });
        let url = spawn_fake(fake).await;
        let client = InfluxClient::new(&config(url, "")).unwrap();

        let err = client.write(&batch()).await.unwrap_err();
        assert!(matches!(err, ImporterError::Store(_)));
        assert!(err.to_string().contains("partial write"));
    }

    #[test]
    fn test_endpoints_keep_path_prefix() {
        let client = InfluxClient::new(&config("http://proxy:80/influx".to_string(), "")).unwrap();
        assert_eq!(client.query_url.as_str(), "http://proxy/influx/query");
        assert_eq!(client.write_url.as_str(), "http://proxy/influx/write");

        let client = InfluxClient::new(&config("http://db:8086/".to_string(), "")).unwrap();
        assert_eq!(client.write_url.as_str(), "http://db:8086/write");
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let err = InfluxClient::new(&config("not a url".to_string(), "")).unwrap_err();
        assert!(matches!(err, ImporterError::Config(_)));

        let err = InfluxClient::new(&config("mailto:db@example.com".to_string(), "")).unwrap_err();
        assert!(matches!(err, ImporterError::Config(_)));
    }
}
