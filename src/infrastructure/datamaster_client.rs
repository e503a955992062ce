//! DataMaster API client
//!
//! Every command is a JSON `POST` of `{token, command, ...params}` to one
//! endpoint. A reply is `{"status": "success", "result": [...]}`; any other
//! status is an API-level error carrying the `error` field.
//!
//! Transport failures and retryable HTTP statuses (408, 429, 5xx) are retried
//! with exponential backoff plus jitter. API and decode errors are not.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::domain::{Client, PhoneSource, Project, RawPhoneRecord};
use crate::infrastructure::config::ApiConfig;

const USER_AGENT: &str = concat!("datamaster-collector/", env!("CARGO_PKG_VERSION"));

/// Errors of a single API call.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP error {status}")]
    Http {
        status: StatusCode,
        retry_after: Option<Duration>,
    },

    #[error("API error: {message}")]
    Api { message: String },

    #[error("Unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SourceError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => !e.is_builder() && !e.is_decode(),
            Self::Http { status, .. } => {
                status.is_server_error()
                    || matches!(*status, StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT)
            }
            Self::Api { .. } | Self::Decode(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientDto {
    #[serde(deserialize_with = "flexible_id")]
    id: i64,
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
struct ProjectDto {
    #[serde(deserialize_with = "flexible_id")]
    id: i64,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct PhoneDto {
    #[serde(default)]
    phone: Value,
    #[serde(default)]
    created_at: Option<String>,
}

/// Ids arrive as numbers or numeric strings depending on the command.
fn flexible_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(i64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) => Ok(id),
        RawId::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid id {text:?}"))),
    }
}

/// Unwraps the response envelope and decodes its `result` list.
fn decode_result<T: DeserializeOwned>(body: &[u8]) -> Result<Vec<T>, SourceError> {
    let envelope: Envelope = serde_json::from_slice(body)?;
    if envelope.status != "success" {
        return Err(SourceError::Api {
            message: envelope.error.unwrap_or_else(|| "Unknown".to_string()),
        });
    }
    if envelope.result.is_null() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_value(envelope.result)?)
}

impl PhoneDto {
    /// An entry without a usable phone field still yields a record, with empty
    /// text that the normalizer rejects. Dropping it could turn a non-empty
    /// page into an empty one, which ends pagination.
    fn into_record(self) -> RawPhoneRecord {
        let raw_text = match self.phone {
            Value::String(text) => text,
            Value::Number(number) => number.to_string(),
            _ => String::new(),
        };
        RawPhoneRecord::new(raw_text, self.created_at.unwrap_or_default())
    }
}

fn page_records(phones: Vec<PhoneDto>) -> Vec<RawPhoneRecord> {
    phones.into_iter().map(PhoneDto::into_record).collect()
}

/// `base * 2^(attempt-1)`, plus up to a quarter of that as jitter.
fn backoff_delay(base: Duration, attempt: u32, jitter_unit: f64) -> Duration {
    let exponential = base.saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)));
    exponential + exponential.mul_f64(jitter_unit.clamp(0.0, 1.0) / 4.0)
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub struct DataMasterClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    max_attempts: u32,
    base_delay: Duration,
}

impl DataMasterClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(USER_AGENT)
            .gzip(true)
            .build()
            .context("Failed to build HTTP client")?;

        info!("🌐 DataMaster client ready: {}", config.url);
        Ok(Self {
            http,
            api_url: config.url.clone(),
            token: config.token.clone(),
            max_attempts: config.max_retries.max(1),
            base_delay: config.retry_base_delay(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, command: &str, params: Value) -> Result<Vec<T>, SourceError> {
        let mut payload = Map::new();
        payload.insert("token".to_string(), Value::String(self.token.clone()));
        payload.insert("command".to_string(), Value::String(command.to_string()));
        if let Value::Object(extra) = params {
            payload.extend(extra);
        }
        let payload = Value::Object(payload);

        let mut attempt = 1;
        loop {
            match self.call_once(&payload).await.and_then(|body| decode_result(&body)) {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let mut delay = backoff_delay(self.base_delay, attempt, fastrand::f64());
                    if let SourceError::Http { retry_after: Some(retry_after), .. } = &e {
                        delay = delay.max(*retry_after);
                    }
                    warn!(
                        "⚠️ {} failed on attempt {}/{}: {}; retrying in {:?}",
                        command, attempt, self.max_attempts, e, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(&self, payload: &Value) -> Result<Vec<u8>, SourceError> {
        let response = self.http.post(&self.api_url).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http {
                status,
                retry_after: parse_retry_after(&response),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl PhoneSource for DataMasterClient {
    async fn list_clients(&self) -> Result<Vec<Client>> {
        let clients: Vec<ClientDto> = self.call("clients", json!({})).await?;
        info!("Retrieved {} clients", clients.len());
        Ok(clients
            .into_iter()
            .map(|dto| Client {
                id: dto.id,
                display_name: dto.username,
            })
            .collect())
    }

    async fn list_projects(&self, client_id: i64) -> Result<Vec<Project>> {
        let projects: Vec<ProjectDto> = self
            .call("gck_projects", json!({ "user_id": client_id }))
            .await?;
        Ok(projects
            .into_iter()
            .map(|dto| Project {
                id: dto.id,
                name: dto.name,
                client_id,
            })
            .collect())
    }

    async fn list_phone_page(&self, project_id: i64, page: u32) -> Result<Vec<RawPhoneRecord>> {
        let phones: Vec<PhoneDto> = self
            .call("gck_phones", json!({ "id": project_id, "page": page }))
            .await?;
        let records = page_records(phones);
        let unusable = records.iter().filter(|r| r.raw_text.is_empty()).count();
        if unusable > 0 {
            debug!("Project {} page {}: {} entries without a phone field", project_id, page, unusable);
        }
        Ok(records)
    }
}
