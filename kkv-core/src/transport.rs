//! Seams between the client and its collaborators.
//!
//! The client logic is written against these traits so that HTTP, the
//! notification bus and the point-read path can be substituted in tests.

use crate::{ChangeNotification, KkvResult, Value};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// Chunked response body. Chunk boundaries carry no meaning.
pub type ByteStream = BoxStream<'static, KkvResult<Bytes>>;

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// A response whose body is still arriving.
pub struct StreamingResponse {
    pub status: u16,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
    pub body: ByteStream,
}

impl StreamingResponse {
    pub fn new(status: u16, body: ByteStream) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

impl fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &"<stream>")
            .finish()
    }
}

/// One write attempt as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub topic: String,
    pub key: String,
    pub body: Bytes,
    /// Body is gzip compressed.
    pub gzip: bool,
}

/// HTTP-shaped access to the write proxy and the cache.
///
/// Implementations report connection-level failures as
/// [`KkvError::Transport`](crate::KkvError::Transport) and return every
/// received response, whatever its status, as `Ok`.
#[async_trait]
pub trait KkvTransport: Send + Sync {
    /// Send one write attempt to the proxy.
    async fn write(&self, request: WriteRequest) -> KkvResult<TransportResponse>;

    /// Read the current value of `key` from the cache.
    async fn read(&self, key: &str) -> KkvResult<TransportResponse>;

    /// Open the newline-delimited stream of every current value in the topic.
    async fn open_value_stream(&self) -> KkvResult<StreamingResponse>;
}

/// Resolves the current value of a key when a debounce window settles.
#[async_trait]
pub trait ValueFetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> KkvResult<Value>;
}

/// The process-wide change notification bus.
///
/// Each call to `subscribe` returns an independent stream of every
/// notification published from that point on. Dropping the stream
/// unsubscribes.
pub trait NotificationSource: Send + Sync {
    fn subscribe(&self) -> BoxStream<'static, ChangeNotification>;
}
