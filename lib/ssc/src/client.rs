//! SSC HTTP Client - the server gateway to the workflow backend

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;
use zeroize::Zeroize;

use crate::error::SscError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    GetCardStatus,
    ServerPersonalization,
    StartPinReset,
    PinResetVerify,
    PinResetConfirm,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::GetCardStatus => "get_card_status",
            Endpoint::ServerPersonalization => "server_personalization",
            Endpoint::StartPinReset => "start_pinreset",
            Endpoint::PinResetVerify => "pinreset_verify",
            Endpoint::PinResetConfirm => "pinreset_confirm",
        }
    }
}

/// Form fields of one backend request. Values may carry auth codes and are wiped on drop.
#[derive(Clone, Default)]
pub struct Payload {
    fields: Vec<(String, String)>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: &str, value: &str) -> Self {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.fields.iter().map(|(k, _)| k))
            .finish()
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        for (_, value) in &mut self.fields {
            value.zeroize();
        }
    }
}

/// A successfully transported response body, normalized to a JSON object.
///
/// Business errors live inside the body (`error` / `errors`); callers must
/// inspect [`ServerResponse::errors`] before decoding the payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerResponse {
    body: Map<String, Value>,
}

impl ServerResponse {
    pub fn from_json(value: Value) -> Result<Self, SscError> {
        match value {
            Value::Object(body) => Ok(Self { body }),
            other => Err(SscError::Decode(format!(
                "Expected a JSON object, got: {}",
                other
            ))),
        }
    }

    /// Decodes `a=1&msg.PARAMS.KEY_ID=k&errors=x&errors=y`. Dotted keys nest,
    /// repeated keys collect into arrays.
    pub fn from_query_string(raw: &str) -> Result<Self, SscError> {
        let mut body = Map::new();
        for (key, value) in url::form_urlencoded::parse(raw.trim().trim_start_matches('?').as_bytes()) {
            let path: Vec<&str> = key.split('.').collect();
            insert_path(&mut body, &path, Value::String(value.into_owned()))?;
        }
        Ok(Self { body })
    }

    pub fn parse(content_type: Option<&str>, raw: &str) -> Result<Self, SscError> {
        let is_json = content_type
            .map(|ct| ct.contains("json"))
            .unwrap_or(false)
            || raw.trim_start().starts_with('{');
        if is_json {
            let value: Value = serde_json::from_str(raw)
                .map_err(|e| SscError::Decode(format!("Invalid JSON body: {}", e)))?;
            Self::from_json(value)
        } else {
            Self::from_query_string(raw)
        }
    }

    /// All error identifiers from `error` and `errors`, in order.
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for key in ["error", "errors"] {
            match self.body.get(key) {
                Some(Value::String(s)) if !s.is_empty() => errors.push(s.clone()),
                Some(Value::Array(items)) => errors.extend(
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                ),
                _ => {}
            }
        }
        errors.dedup();
        errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors().is_empty()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SscError> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .map_err(|e| SscError::Decode(format!("Unexpected response payload: {}", e)))
    }
}

fn insert_path(map: &mut Map<String, Value>, path: &[&str], value: Value) -> Result<(), SscError> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(());
    };
    if rest.is_empty() {
        match map.get_mut(*head) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert((*head).to_string(), value);
            }
        }
        return Ok(());
    }
    let child = map
        .entry((*head).to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    match child {
        Value::Object(inner) => insert_path(inner, rest, value),
        _ => Err(SscError::Decode(format!(
            "Key {} is both a value and a group",
            head
        ))),
    }
}

/// Trait for the workflow backend (allows a scripted backend in tests).
///
/// One call issues exactly one request. No retries happen at this layer.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn request(&self, endpoint: Endpoint, payload: Payload) -> Result<ServerResponse, SscError>;
}

/// SSC API Client - posts form payloads to the backend, one request at a time
#[derive(Clone)]
pub struct SscClient {
    base_url: String,
    client: reqwest::Client,
    in_flight: Arc<Mutex<()>>,
}

impl SscClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()
            .unwrap_or_default();
        SscClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, endpoint: Endpoint) -> String {
        format!("{}/{}", self.base_url, endpoint.path())
    }
}

#[async_trait]
impl Gateway for SscClient {
    async fn request(&self, endpoint: Endpoint, payload: Payload) -> Result<ServerResponse, SscError> {
        let _guard = self.in_flight.lock().await;

        let url = self.url(endpoint);
        debug!(endpoint = endpoint.path(), fields = ?payload, "Backend request");

        let builder = match endpoint {
            Endpoint::GetCardStatus => self.client.get(&url).query(payload.fields()),
            _ => self.client.post(&url).form(payload.fields()),
        };
        let resp = builder.send().await?;

        if !resp.status().is_success() {
            return Err(SscError::ServerStatus(resp.status().as_u16()));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await?;

        ServerResponse::parse(content_type.as_deref(), &body)
    }
}

/// A recorded backend call of [`ScriptedGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub endpoint: Endpoint,
    pub fields: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// In-memory backend replaying canned responses in order.
///
/// Pairs with [`crate::token::SoftwareToken`] to run whole flows without a
/// server. Every request is recorded, values included, so keep it out of
/// production wiring.
#[derive(Default)]
pub struct ScriptedGateway {
    responses: StdMutex<VecDeque<Result<ServerResponse, SscError>>>,
    requests: StdMutex<Vec<RecordedRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: ServerResponse) -> &Self {
        self.lock_responses().push_back(Ok(response));
        self
    }

    /// Queue a JSON object body. Non-object values queue a decode failure.
    pub fn push_json(&self, body: Value) -> &Self {
        self.lock_responses()
            .push_back(ServerResponse::from_json(body));
        self
    }

    pub fn push_error(&self, error: SscError) -> &Self {
        self.lock_responses().push_back(Err(error));
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Requests sent to `endpoint` with `wf_action` (or any action when `None`).
    pub fn count(&self, endpoint: Endpoint, wf_action: Option<&str>) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.endpoint == endpoint)
            .filter(|r| wf_action.is_none() || r.get("wf_action") == wf_action)
            .count()
    }

    pub fn remaining(&self) -> usize {
        self.lock_responses().len()
    }

    fn lock_responses(&self) -> MutexGuard<'_, VecDeque<Result<ServerResponse, SscError>>> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn request(&self, endpoint: Endpoint, payload: Payload) -> Result<ServerResponse, SscError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedRequest {
                endpoint,
                fields: payload.fields().to_vec(),
            });
        self.lock_responses().pop_front().unwrap_or_else(|| {
            Err(SscError::Protocol(format!(
                "No scripted response for {}",
                endpoint.path()
            )))
        })
    }
}
