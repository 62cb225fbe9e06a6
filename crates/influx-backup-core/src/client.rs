//! InfluxDB client adapter
//!
//! The manager only needs a handful of administrative calls, expressed by
//! [`InfluxClient`]. [`HttpInfluxClient`] implements them against the
//! InfluxDB 1.x HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ManagerConfig;
use crate::errors::{BackupError, Result};

/// Liveness of one InfluxDB host as reported by `/ping`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingStatus {
    pub host: String,
    pub port: u16,
    pub online: bool,
    pub version: Option<String>,
}

/// One series of a statement result
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Series {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

/// Result of one statement in a `/query` call
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct StatementResult {
    #[serde(default)]
    pub statement_id: u32,
    #[serde(default)]
    pub series: Vec<Series>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
pub trait InfluxClient: Send + Sync {
    /// Probe the configured hosts, waiting at most `timeout`
    async fn ping(&self, timeout: Duration) -> Result<Vec<PingStatus>>;

    async fn database_names(&self) -> Result<Vec<String>>;

    async fn query(&self, statement: &str) -> Result<Vec<StatementResult>>;

    async fn create_database(&self, name: &str) -> Result<()>;
}

/// Quote an identifier for use in InfluxQL
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Parse a `/query` response body, surfacing any reported error
pub fn parse_query_response(body: &str) -> Result<Vec<StatementResult>> {
    let response: QueryResponse = serde_json::from_str(body)?;
    if let Some(error) = response.error {
        return Err(BackupError::Query(error));
    }
    if let Some(error) = response.results.iter().find_map(|r| r.error.clone()) {
        return Err(BackupError::Query(error));
    }
    Ok(response.results)
}

/// Pull the first column of every row of every series
fn first_column(results: &[StatementResult]) -> Vec<String> {
    results
        .iter()
        .flat_map(|r| r.series.iter())
        .flat_map(|s| s.values.iter())
        .filter_map(|row| row.first().and_then(Value::as_str).map(str::to_string))
        .collect()
}

/// InfluxDB 1.x HTTP API client
#[derive(Debug, Clone)]
pub struct HttpInfluxClient {
    http: reqwest::Client,
    host: String,
    port: u16,
    database: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpInfluxClient {
    pub fn new(config: &ManagerConfig) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    fn credentials(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(username) = &self.username {
            params.push(("u", username.clone()));
        }
        if let Some(password) = &self.password {
            params.push(("p", password.clone()));
        }
        params
    }
}

#[async_trait]
impl InfluxClient for HttpInfluxClient {
    async fn ping(&self, timeout: Duration) -> Result<Vec<PingStatus>> {
        let response = self
            .http
            .get(self.url("/ping"))
            .timeout(timeout)
            .send()
            .await;

        let status = match response {
            Ok(response) => {
                let version = response
                    .headers()
                    .get("X-Influxdb-Version")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                PingStatus {
                    host: self.host.clone(),
                    port: self.port,
                    online: response.status().is_success(),
                    version,
                }
            }
            Err(e) => {
                warn!("Ping to {}:{} failed: {}", self.host, self.port, e);
                PingStatus {
                    host: self.host.clone(),
                    port: self.port,
                    online: false,
                    version: None,
                }
            }
        };
        Ok(vec![status])
    }

    async fn database_names(&self) -> Result<Vec<String>> {
        let results = self.query("SHOW DATABASES").await?;
        Ok(first_column(&results))
    }

    async fn query(&self, statement: &str) -> Result<Vec<StatementResult>> {
        debug!("InfluxQL: {}", statement);

        let mut params = vec![("q", statement.to_string())];
        if !self.database.is_empty() {
            params.push(("db", self.database.clone()));
        }
        params.extend(self.credentials());

        let response = self
            .http
            .post(self.url("/query"))
            .form(&params)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        match parse_query_response(&body) {
            Ok(results) if status.is_success() => Ok(results),
            Ok(_) => Err(BackupError::Query(format!("HTTP {}: {}", status, body))),
            Err(BackupError::Query(message)) => Err(BackupError::Query(message)),
            Err(_) => Err(BackupError::Query(format!("HTTP {}: {}", status, body))),
        }
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.query(&format!("CREATE DATABASE {}", quote_identifier(name)))
            .await?;
        Ok(())
    }
}
