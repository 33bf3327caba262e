use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("truncated body: {0}")]
    Truncated(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Unix,
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(format!("unknown network '{other}', must be 'tcp' or 'unix'")),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Unix => f.write_str("unix"),
        }
    }
}

/// The fixed parameter set sent with every request.
///
/// Built once before a run starts and shared behind an `Arc`; there is no
/// way to mutate it afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParams {
    params: BTreeMap<String, String>,
}

impl RequestParams {
    pub fn for_script(document_root: &str, script: &str) -> Self {
        Self::from_pairs([
            ("SCRIPT_FILENAME", join_script_path(document_root, script)),
            ("GATEWAY_INTERFACE", "CGI/1.1".to_string()),
            ("SERVER_SOFTWARE", "fpm-bench".to_string()),
            ("REMOTE_ADDR", "127.0.0.1".to_string()),
        ])
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            params: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

fn join_script_path(document_root: &str, script: &str) -> String {
    let root = document_root.trim_end_matches('/');
    let script = script.trim_start_matches('/');
    if document_root.is_empty() {
        script.to_string()
    } else {
        format!("{root}/{script}")
    }
}

/// Response body; a body cut short by the transport only fails once read.
#[derive(Debug, Clone)]
pub struct Body {
    data: Bytes,
    error: Option<String>,
}

impl Body {
    pub fn complete(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            error: None,
        }
    }

    pub fn truncated(data: impl Into<Bytes>, reason: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            error: Some(reason.into()),
        }
    }

    pub fn read_all(self) -> Result<Bytes, ConnectionError> {
        match self.error {
            None => Ok(self.data),
            Some(reason) => Err(ConnectionError::Truncated(reason)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub proto_major: u8,
    pub proto_minor: u8,
    /// Numeric status; 0 when the responder sent no header block at all
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Body,
}

/// One persistent session to the responder. Owned by exactly one worker.
pub trait Connection: Send {
    fn set_keep_alive(&mut self, keep_alive: bool);

    fn get<'a>(
        &'a mut self,
        params: &'a RequestParams,
    ) -> BoxFuture<'a, Result<Response, ConnectionError>>;

    /// Release the session. Calling it more than once is a no-op.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Factory for connections to a single address.
pub trait Dialer: Send + Sync {
    fn name(&self) -> &'static str;

    fn dial(&self) -> BoxFuture<'_, Result<Box<dyn Connection>, ConnectionError>>;
}

/// Mock dialer for testing: every request succeeds after a fixed delay
/// unless configured otherwise.
#[derive(Debug, Clone)]
pub struct MockDialer {
    delay: Duration,
    status: u16,
    body: Bytes,
    fail_dial: bool,
    fail_requests: bool,
    truncate_body: bool,
    counters: Arc<MockCounters>,
}

#[derive(Debug, Default)]
struct MockCounters {
    dials: AtomicUsize,
    requests: AtomicUsize,
    closes: AtomicUsize,
}

impl MockDialer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            status: 200,
            body: Bytes::from_static(b"ok"),
            fail_dial: false,
            fail_requests: false,
            truncate_body: false,
            counters: Arc::new(MockCounters::default()),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn failing_dial(mut self) -> Self {
        self.fail_dial = true;
        self
    }

    pub fn failing_requests(mut self) -> Self {
        self.fail_requests = true;
        self
    }

    pub fn truncating_body(mut self) -> Self {
        self.truncate_body = true;
        self
    }

    pub fn dials(&self) -> usize {
        self.counters.dials.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.counters.requests.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

impl Dialer for MockDialer {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn dial(&self) -> BoxFuture<'_, Result<Box<dyn Connection>, ConnectionError>> {
        Box::pin(async move {
            self.counters.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail_dial {
                return Err(ConnectionError::Transport(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "mock dial refused",
                )));
            }
            Ok(Box::new(MockConnection {
                dialer: self.clone(),
                keep_alive: false,
                closed: false,
            }) as Box<dyn Connection>)
        })
    }
}

struct MockConnection {
    dialer: MockDialer,
    keep_alive: bool,
    closed: bool,
}

impl Connection for MockConnection {
    fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    fn get<'a>(
        &'a mut self,
        _params: &'a RequestParams,
    ) -> BoxFuture<'a, Result<Response, ConnectionError>> {
        Box::pin(async move {
            let d = &self.dialer;
            d.counters.requests.fetch_add(1, Ordering::SeqCst);
            sleep(d.delay).await;

            if d.fail_requests {
                return Err(ConnectionError::Transport(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "mock connection reset",
                )));
            }

            let body = if d.truncate_body {
                Body::truncated(d.body.clone(), "mock stream ended early")
            } else {
                Body::complete(d.body.clone())
            };

            let mut headers = BTreeMap::new();
            headers.insert(
                "Content-Type".to_string(),
                vec!["text/plain".to_string()],
            );

            Ok(Response {
                proto_major: 1,
                proto_minor: 1,
                status: d.status,
                headers,
                body,
            })
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed {
                self.closed = true;
                self.dialer.counters.closes.fetch_add(1, Ordering::SeqCst);
            }
        })
    }
}
