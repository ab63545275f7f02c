//! `reqwest` transport for the management gateway.
//!
//! The server answers failures with an envelope and a non-2xx status, so the
//! envelope is parsed whatever the status. Only network failures and bodies
//! that are not an envelope become [`TransportError`].

use async_trait::async_trait;
use dbm_core::config::GatewaySettings;
use dbm_core::gateway::{
    Envelope, GatewayClient, GatewayError, GatewayRequest, Method, TransportError,
};
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum HttpGatewayError {
    #[error("invalid gateway base url `{url}`: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: Url,
}

impl HttpGateway {
    pub fn new(settings: &GatewaySettings) -> Result<Self, HttpGatewayError> {
        let invalid = |reason: String| HttpGatewayError::InvalidBaseUrl {
            url: settings.base_url.clone(),
            reason,
        };
        let base_url =
            Url::parse(settings.base_url.trim()).map_err(|error| invalid(error.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("url cannot carry path segments".to_string()));
        }

        let client = Client::builder().timeout(settings.timeout()).build()?;
        Ok(Self { client, base_url })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Segments are percent-encoded one by one, so table names containing
    /// `/` or spaces stay a single path segment.
    pub fn url_for(&self, request: &GatewayRequest) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::new(format!("cannot extend base url `{}`", self.base_url)))?
            .pop_if_empty()
            .extend(&request.segments);
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn build(&self, request: &GatewayRequest) -> Result<RequestBuilder, TransportError> {
        let url = self.url_for(request)?;
        let builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
            Method::Put => self.client.put(url),
            Method::Delete => self.client.delete(url),
        };
        Ok(match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        })
    }
}

#[async_trait]
impl GatewayClient for HttpGateway {
    async fn call(&self, request: GatewayRequest) -> Result<Envelope, TransportError> {
        let response = self
            .build(&request)?
            .send()
            .await
            .map_err(to_transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(to_transport_error)?;
        trace!(%status, bytes = body.len(), "gateway response received");

        serde_json::from_slice::<Envelope>(&body).map_err(|error| {
            debug!(%status, %error, "gateway response is not an envelope");
            unreadable(status, &error)
        })
    }

    async fn download(&self, request: GatewayRequest) -> Result<Vec<u8>, GatewayError> {
        let response = self
            .build(&request)?
            .send()
            .await
            .map_err(to_transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.bytes().await.map_err(to_transport_error)?;
            let envelope = serde_json::from_slice::<Envelope>(&body)
                .map_err(|error| unreadable(status, &error))?;
            envelope.into_data("export failed")?;
            return Err(TransportError::new(format!("export failed with HTTP {status}")).into());
        }

        let mut payload = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            payload.extend_from_slice(&chunk.map_err(to_transport_error)?);
        }
        debug!(bytes = payload.len(), "download complete");
        Ok(payload)
    }
}

fn to_transport_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::new(format!("gateway request timed out: {error}"))
    } else if error.is_connect() {
        TransportError::new(format!("cannot reach gateway: {error}"))
    } else {
        TransportError::new(error.to_string())
    }
}

fn unreadable(status: StatusCode, error: &serde_json::Error) -> TransportError {
    TransportError::new(format!("HTTP {status}: unreadable gateway response: {error}"))
}
