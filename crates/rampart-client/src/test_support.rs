//! Scripted transport for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use rampart_core::{
    HeaderMap, HeaderName, HeaderValue, RequestDescriptor, Response, StatusCode, Transport,
    TransportError,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Script {
    replies: VecDeque<Result<Response, TransportError>>,
    requests: Vec<RequestDescriptor>,
}

/// Replays queued replies in order and records every request it sees.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_status(&self, status: u16) {
        self.push_response(status, &[], "");
    }

    pub(crate) fn push_response(&self, status: u16, headers: &[(&str, &str)], body: &str) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        let status = StatusCode::from_u16(status).unwrap();
        self.script
            .lock()
            .replies
            .push_back(Ok(Response::new(status, map, body.to_string())));
    }

    pub(crate) fn push_error(&self, error: TransportError) {
        self.script.lock().replies.push_back(Err(error));
    }

    pub(crate) fn calls(&self) -> usize {
        self.script.lock().requests.len()
    }

    pub(crate) fn requests(&self) -> Vec<RequestDescriptor> {
        self.script.lock().requests.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: &RequestDescriptor,
        _timeout: Duration,
    ) -> Result<Response, TransportError> {
        let mut script = self.script.lock();
        script.requests.push(request.clone());
        script
            .replies
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::connect("script exhausted")))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
