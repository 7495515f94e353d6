//! Downstream FHIR server client

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, LOCATION};
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

use super::Resource;

pub const FHIR_JSON: &str = "application/fhir+json";
pub const TENANT_HEADER: &str = "X-FHIR-TENANT-ID";

/// Longest error body kept when the server did not send an OperationOutcome
const MAX_MESSAGE_LEN: usize = 1024;

#[derive(Debug, Clone)]
pub struct FhirClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tenant: Option<String>,
}

/// Outcome of one entry inside a transaction or batch response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryResponse {
    pub status: u16,
    pub resource_type: Option<String>,
    pub logical_id: Option<String>,
    pub message: Option<String>,
}

impl EntryResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// What the server said about one submitted resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    pub status: u16,
    pub resource_type: Option<String>,
    pub logical_id: Option<String>,
    pub message: Option<String>,
    pub response_time_ms: i64,
    /// Per-entry results when a bundle was processed as a transaction or batch
    pub entries: Vec<EntryResponse>,
}

impl SubmitResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Anything that can accept a resource for storage
///
/// Transport failures are errors; a non-2xx answer is a successful call with
/// a failing [`SubmitResponse`].
#[async_trait]
pub trait FhirClient: Send + Sync {
    async fn submit(&self, resource: &Resource) -> Result<SubmitResponse>;
}

pub struct HttpFhirClient {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpFhirClient {
    pub fn new(config: &FhirClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(tenant) = &config.tenant {
            headers.insert(
                TENANT_HEADER,
                HeaderValue::from_str(tenant).context("Invalid tenant header value")?,
            );
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Method and URL a resource is sent to
    fn target(&self, resource: &Resource) -> (Method, String) {
        if resource.is_bundle() {
            return (Method::POST, self.base_url.clone());
        }
        let resource_type = resource.resource_type().unwrap_or_default();
        match resource.id() {
            Some(id) => (Method::PUT, format!("{}/{}/{}", self.base_url, resource_type, id)),
            None => (Method::POST, format!("{}/{}", self.base_url, resource_type)),
        }
    }
}

#[async_trait]
impl FhirClient for HttpFhirClient {
    async fn submit(&self, resource: &Resource) -> Result<SubmitResponse> {
        let (method, url) = self.target(resource);
        let body = serde_json::to_vec(resource.value()).context("Failed to serialize resource")?;

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(CONTENT_TYPE, FHIR_JSON)
            .header(reqwest::header::ACCEPT, FHIR_JSON)
            .body(body);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let started = Instant::now();
        let response = request
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))?;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read response from {}", url))?;
        let response_time_ms = started.elapsed().as_millis() as i64;

        debug!(%method, %url, status, response_time_ms, "Submitted resource");

        let json: Option<Value> = serde_json::from_str(&text).ok();
        let (resource_type, logical_id) = match location.as_deref().and_then(parse_location) {
            Some((t, id)) => (Some(t), Some(id)),
            None => (
                resource.resource_type().map(str::to_string),
                resource.id().map(str::to_string),
            ),
        };

        let success = (200..300).contains(&status);
        let message = if success {
            None
        } else {
            Some(
                json.as_ref()
                    .and_then(outcome_message)
                    .unwrap_or_else(|| truncate(&text)),
            )
        };

        let entries = match &json {
            Some(body) if resource.is_bundle() => entry_responses(body),
            _ => Vec::new(),
        };

        Ok(SubmitResponse {
            status,
            resource_type,
            logical_id,
            message,
            response_time_ms,
            entries,
        })
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Resource type and logical id from a Location value
///
/// Accepts relative (`Patient/123/_history/1`) and absolute URLs.
pub fn parse_location(location: &str) -> Option<(String, String)> {
    let path = location.split(['?', '#']).next().unwrap_or(location);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let end = segments
        .iter()
        .rposition(|s| *s == "_history")
        .unwrap_or(segments.len());
    if end < 2 {
        return None;
    }

    let resource_type = segments[end - 2];
    let id = segments[end - 1];
    if !resource_type.starts_with(|c: char| c.is_ascii_uppercase()) {
        return None;
    }
    Some((resource_type.to_string(), id.to_string()))
}

/// Leading status code of a FHIR status line such as `"201 Created"`
fn parse_status(status: &str) -> Option<u16> {
    status.split_whitespace().next()?.parse().ok()
}

/// First diagnostic of an OperationOutcome
fn outcome_message(value: &Value) -> Option<String> {
    if value.get("resourceType").and_then(Value::as_str) != Some("OperationOutcome") {
        return None;
    }
    let issue = value.get("issue")?.as_array()?.first()?;
    issue
        .get("diagnostics")
        .and_then(Value::as_str)
        .or_else(|| issue.get("details")?.get("text")?.as_str())
        .map(str::to_string)
}

fn entry_responses(body: &Value) -> Vec<EntryResponse> {
    let Some(entries) = body.get("entry").and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .map(|entry| {
            let response = entry.get("response");
            let status = response
                .and_then(|r| r.get("status"))
                .and_then(Value::as_str)
                .and_then(parse_status)
                .unwrap_or(0);
            let location = response
                .and_then(|r| r.get("location"))
                .and_then(Value::as_str)
                .and_then(parse_location);
            let message = response.and_then(|r| r.get("outcome")).and_then(outcome_message);

            EntryResponse {
                status,
                resource_type: location.as_ref().map(|(t, _)| t.clone()),
                logical_id: location.map(|(_, id)| id),
                message,
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_location() {
        assert_eq!(
            parse_location("Patient/123/_history/1"),
            Some(("Patient".into(), "123".into()))
        );
        assert_eq!(
            parse_location("https://fhir.example.org/api/v4/Observation/o-9/_history/3"),
            Some(("Observation".into(), "o-9".into()))
        );
        assert_eq!(
            parse_location("http://h/fhir/Encounter/e1"),
            Some(("Encounter".into(), "e1".into()))
        );
        assert_eq!(parse_location("x"), None);
    }

    #[test]
    fn test_outcome_message() {
        let outcome = json!({
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "error", "code": "invalid", "diagnostics": "bad gender"}]
        });
        assert_eq!(outcome_message(&outcome).as_deref(), Some("bad gender"));
        assert_eq!(outcome_message(&json!({"resourceType": "Patient"})), None);
    }

    #[test]
    fn test_entry_responses() {
        let body = json!({
            "resourceType": "Bundle",
            "type": "transaction-response",
            "entry": [
                {"response": {"status": "201 Created", "location": "Patient/p1/_history/1"}},
                {"response": {"status": "400 Bad Request", "outcome": {
                    "resourceType": "OperationOutcome",
                    "issue": [{"details": {"text": "nope"}}]
                }}}
            ]
        });
        let entries = entry_responses(&body);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_success());
        assert_eq!(entries[0].logical_id.as_deref(), Some("p1"));
        assert_eq!(entries[1].status, 400);
        assert_eq!(entries[1].message.as_deref(), Some("nope"));
    }

    #[test]
    fn test_target_routing() {
        let client = HttpFhirClient::new(&FhirClientConfig {
            base_url: "http://fhir/api/v4/".into(),
            timeout: Duration::from_secs(5),
            username: None,
            password: None,
            tenant: Some("default".into()),
        })
        .unwrap();

        let bundle = Resource::from_value(json!({"resourceType": "Bundle"})).unwrap();
        let with_id = Resource::from_value(json!({"resourceType": "Patient", "id": "p"})).unwrap();
        let without = Resource::from_value(json!({"resourceType": "Patient"})).unwrap();

        assert_eq!(client.target(&bundle), (Method::POST, "http://fhir/api/v4".to_string()));
        assert_eq!(client.target(&with_id), (Method::PUT, "http://fhir/api/v4/Patient/p".to_string()));
        assert_eq!(client.target(&without), (Method::POST, "http://fhir/api/v4/Patient".to_string()));
    }
}
