//! Scripted in-memory gateway shared by the coordinator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use crate::gateway::{
    Envelope, GatewayClient, GatewayError, GatewayRequest, Method, TransportError,
};

enum Scripted {
    Envelope(Envelope),
    Transport(String),
    Gated(Arc<Notify>, Envelope),
    Bytes(Vec<u8>),
}

#[derive(Default)]
pub(crate) struct ScriptedGateway {
    responses: Mutex<HashMap<(Method, String), VecDeque<Scripted>>>,
    calls: Mutex<Vec<GatewayRequest>>,
}

impl ScriptedGateway {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, method: Method, path: &str, response: Scripted) {
        self.responses
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(response);
    }

    pub(crate) fn ok(&self, method: Method, path: &str, data: Value) {
        self.push(method, path, Scripted::Envelope(Envelope::success(data)));
    }

    pub(crate) fn fail(&self, method: Method, path: &str, code: i64, message: &str) {
        self.push(
            method,
            path,
            Scripted::Envelope(Envelope::failure(code, message)),
        );
    }

    pub(crate) fn transport_error(&self, method: Method, path: &str, message: &str) {
        self.push(method, path, Scripted::Transport(message.to_string()));
    }

    /// The response is held back until `gate` is notified.
    pub(crate) fn gated(&self, method: Method, path: &str, gate: Arc<Notify>, data: Value) {
        self.push(
            method,
            path,
            Scripted::Gated(gate, Envelope::success(data)),
        );
    }

    pub(crate) fn bytes(&self, method: Method, path: &str, payload: &[u8]) {
        self.push(method, path, Scripted::Bytes(payload.to_vec()));
    }

    pub(crate) fn calls(&self) -> Vec<GatewayRequest> {
        self.calls.lock().clone()
    }

    pub(crate) fn call_paths(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|call| format!("{} {}", call.method.as_str(), call.path()))
            .collect()
    }

    pub(crate) fn last_call(&self) -> Option<GatewayRequest> {
        self.calls.lock().last().cloned()
    }

    fn next(&self, request: &GatewayRequest) -> Option<Scripted> {
        self.calls.lock().push(request.clone());
        self.responses
            .lock()
            .get_mut(&(request.method, request.path()))
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl GatewayClient for ScriptedGateway {
    async fn call(&self, request: GatewayRequest) -> Result<Envelope, TransportError> {
        match self.next(&request) {
            Some(Scripted::Envelope(envelope)) => Ok(envelope),
            Some(Scripted::Gated(gate, envelope)) => {
                gate.notified().await;
                Ok(envelope)
            }
            Some(Scripted::Transport(message)) => Err(TransportError::new(message)),
            Some(Scripted::Bytes(_)) | None => Err(TransportError::new(format!(
                "no scripted response for {} {}",
                request.method.as_str(),
                request.path()
            ))),
        }
    }

    async fn download(&self, request: GatewayRequest) -> Result<Vec<u8>, GatewayError> {
        match self.next(&request) {
            Some(Scripted::Bytes(payload)) => Ok(payload),
            Some(Scripted::Envelope(envelope)) => {
                envelope.into_data("download failed")?;
                Err(TransportError::new("expected a binary payload").into())
            }
            Some(Scripted::Transport(message)) => Err(TransportError::new(message).into()),
            Some(Scripted::Gated(..)) | None => Err(TransportError::new(format!(
                "no scripted download for {} {}",
                request.method.as_str(),
                request.path()
            ))
            .into()),
        }
    }
}
