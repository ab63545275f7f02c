//! Call boundary to the remote management API.
//!
//! Every JSON endpoint answers with an [`Envelope`]; `code == 0` is success and
//! any other code is an application failure whose message can be shown as-is.
//! Binary exports bypass the envelope and arrive as raw bytes.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// A single gateway call. The path is kept as raw segments so the transport
/// can percent-encode table names and identifiers itself.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    pub method: Method,
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl GatewayRequest {
    #[must_use]
    pub fn new<S: Into<String>>(method: Method, segments: impl IntoIterator<Item = S>) -> Self {
        Self {
            method,
            segments: segments.into_iter().map(Into::into).collect(),
            query: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn get<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self::new(Method::Get, segments)
    }

    #[must_use]
    pub fn post<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self::new(Method::Post, segments)
    }

    #[must_use]
    pub fn put<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self::new(Method::Put, segments)
    }

    #[must_use]
    pub fn delete<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self::new(Method::Delete, segments)
    }

    /// Adds a query parameter. Absent and blank values are dropped so the
    /// server applies its own default.
    #[must_use]
    pub fn with_query(mut self, key: &str, value: Option<&str>) -> Self {
        if let Some(value) = value.filter(|value| !value.trim().is_empty()) {
            self.query.push((key.to_string(), value.to_string()));
        }
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn path(&self) -> String {
        self.segments.join("/")
    }

    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data,
        }
    }

    #[must_use]
    pub fn failure(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: Value::Null,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Unwraps the payload, turning a failure code into an application error.
    /// `default_message` stands in when the server sent no message.
    pub fn into_data(self, default_message: &str) -> Result<Value, GatewayError> {
        if self.is_success() {
            return Ok(self.data);
        }

        let message = if self.message.trim().is_empty() {
            default_message.to_string()
        } else {
            self.message
        };
        Err(GatewayError::Application {
            code: self.code,
            message,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("{message}")]
    Application { code: i64, message: String },
    #[error("unexpected payload from `{path}`: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl GatewayError {
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    #[must_use]
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Application { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn call(&self, request: GatewayRequest) -> Result<Envelope, TransportError>;

    async fn download(&self, request: GatewayRequest) -> Result<Vec<u8>, GatewayError>;
}

pub(crate) async fn request_value<G: GatewayClient + ?Sized>(
    gateway: &G,
    request: GatewayRequest,
    default_message: &str,
) -> Result<Value, GatewayError> {
    let method = request.method.as_str();
    let path = request.path();
    debug!(method, path = %path, "gateway call");

    let envelope = gateway.call(request).await.map_err(|error| {
        debug!(method, path = %path, %error, "gateway transport failure");
        GatewayError::Transport(error)
    })?;
    let code = envelope.code;
    envelope.into_data(default_message).inspect_err(|error| {
        debug!(method, path = %path, code, %error, "gateway rejected call");
    })
}

pub(crate) async fn request_data<G, T>(
    gateway: &G,
    request: GatewayRequest,
    default_message: &str,
) -> Result<T, GatewayError>
where
    G: GatewayClient + ?Sized,
    T: DeserializeOwned,
{
    let path = request.path();
    let data = request_value(gateway, request, default_message).await?;
    serde_json::from_value(data).map_err(|source| GatewayError::Decode { path, source })
}

/// Like [`request_data`] for list payloads; the server encodes an empty list
/// as `null`.
pub(crate) async fn request_list<G, T>(
    gateway: &G,
    request: GatewayRequest,
    default_message: &str,
) -> Result<Vec<T>, GatewayError>
where
    G: GatewayClient + ?Sized,
    T: DeserializeOwned,
{
    let items: Option<Vec<T>> = request_data(gateway, request, default_message).await?;
    Ok(items.unwrap_or_default())
}
