//! Transport stubs standing in for remote services.

use async_trait::async_trait;
use parking_lot::Mutex;
use rampart_core::{
    HeaderMap, HeaderName, HeaderValue, RequestDescriptor, Response, StatusCode, Transport,
    TransportError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// Build a response from a status, header pairs and a body
pub fn response(status: u16, headers: &[(&str, &str)], body: &str) -> Response {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            HeaderName::from_bytes(name.as_bytes()).expect("valid header name"),
            HeaderValue::from_str(value).expect("valid header value"),
        );
    }
    Response::new(
        StatusCode::from_u16(status).expect("valid status"),
        map,
        body.to_string(),
    )
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Result<Response, TransportError>>,
    fallback: Option<Response>,
    requests: Vec<RequestDescriptor>,
}

/// Replays queued replies in order and records every request.
///
/// Once the queue is empty the repeat reply is used if one is set, otherwise
/// a connect error is returned.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    /// Empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply
    pub fn push(&self, reply: Response) -> &Self {
        self.script.lock().replies.push_back(Ok(reply));
        self
    }

    /// Queue a bare status
    pub fn push_status(&self, status: u16) -> &Self {
        self.push(response(status, &[], ""))
    }

    /// Queue a transport error
    pub fn push_error(&self, error: TransportError) -> &Self {
        self.script.lock().replies.push_back(Err(error));
        self
    }

    /// Reply used after the queue runs dry
    pub fn repeat(&self, reply: Response) -> &Self {
        self.script.lock().fallback = Some(reply);
        self
    }

    /// Requests received so far
    pub fn calls(&self) -> usize {
        self.script.lock().requests.len()
    }

    /// Copies of the requests received so far
    pub fn requests(&self) -> Vec<RequestDescriptor> {
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
        match script.replies.pop_front() {
            Some(reply) => reply,
            None => match &script.fallback {
                Some(reply) => Ok(reply.clone()),
                None => Err(TransportError::connect("script exhausted")),
            },
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Holds every request until released, answering 200.
///
/// Requests covered by [`fail_next`](Self::fail_next) fail at once instead.
///
/// Lets a test keep calls in flight while it inspects shared state.
#[derive(Clone)]
pub struct GatedTransport {
    entered: Arc<AtomicUsize>,
    failing: Arc<AtomicUsize>,
    arrived: Arc<Notify>,
    gate: Arc<Semaphore>,
}

impl Default for GatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GatedTransport {
    /// Closed gate
    pub fn new() -> Self {
        Self {
            entered: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicUsize::new(0)),
            arrived: Arc::new(Notify::new()),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Answer the next `n` requests with an immediate 500
    pub fn fail_next(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }

    /// Requests that reached the transport
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` requests reached the transport
    pub async fn wait_for(&self, n: usize) {
        loop {
            let notified = self.arrived.notified();
            if self.entered() >= n {
                return;
            }
            notified.await;
        }
    }

    /// Let `n` held requests complete
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn send(
        &self,
        _request: &RequestDescriptor,
        _timeout: Duration,
    ) -> Result<Response, TransportError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.arrived.notify_waiters();
        let fail = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Ok(response(500, &[], "failed"));
        }
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| TransportError::connect("gate closed"))?;
        permit.forget();
        Ok(response(200, &[], "released"))
    }

    fn name(&self) -> &'static str {
        "gated"
    }
}
