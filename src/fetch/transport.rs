use std::time::Duration;

use bytes::Bytes;
use futures_util::{future::BoxFuture, stream::{self, BoxStream}, StreamExt, TryStreamExt};
use reqwest::{header, Client, StatusCode};

use crate::error::{FetchError, TransportError};

pub type Body = BoxStream<'static, Result<Bytes, TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Whole artifact from byte 0; any partial content must be discarded.
    Full,
    /// Continuation from the requested offset.
    Resumed,
    /// The requested offset already equals the artifact size.
    AlreadyComplete,
}

pub struct Response {
    pub kind: ResponseKind,
    /// Total artifact size when the server reports it.
    pub total: Option<u64>,
    pub body: Body,
}

impl Response {
    pub fn new(kind: ResponseKind, total: Option<u64>, body: Body) -> Self {
        Self { kind, total, body }
    }
}

/// Source of artifact bytes. `offset > 0` asks for a continuation.
pub trait Transport: Send + Sync {
    fn get<'a>(&'a self, url: &'a str, offset: u64) -> BoxFuture<'a, Result<Response, TransportError>>;
}

/// reqwest-backed transport with a connection-establishment timeout and no
/// overall request timeout; stalls are detected by the downloader.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("modelfetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::ClientUnavailable)?;
        Ok(Self { client })
    }

    async fn request(&self, url: &str, offset: u64) -> Result<Response, TransportError> {
        let mut req = self.client.get(url);
        if offset > 0 {
            req = req.header(header::RANGE, format!("bytes={offset}-"));
        }
        let resp = req.send().await?;
        let status = resp.status();

        if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            // `Content-Range: bytes */<size>` tells us whether the partial is whole.
            return match content_range_total(resp.headers()) {
                Some(total) if total == offset => Ok(Response::new(
                    ResponseKind::AlreadyComplete,
                    Some(total),
                    stream::empty().boxed(),
                )),
                _ => Err(TransportError::RangeNotSatisfiable),
            };
        }
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let (kind, total) = if offset > 0 && status == StatusCode::PARTIAL_CONTENT {
            match content_range(resp.headers()) {
                Some(range) if range.first == offset => (
                    ResponseKind::Resumed,
                    range.total.or_else(|| resp.content_length().map(|len| offset + len)),
                ),
                // Whole file served as a single range.
                Some(range) if range.first == 0 && range.total == Some(range.last + 1) => {
                    (ResponseKind::Full, range.total)
                }
                other => {
                    return Err(TransportError::RangeMismatch { requested: offset, served: other.map(|r| r.first) })
                }
            }
        } else {
            (ResponseKind::Full, resp.content_length())
        };
        let body = resp.bytes_stream().map_err(TransportError::from).boxed();
        Ok(Response::new(kind, total, body))
    }
}

impl Transport for HttpTransport {
    fn get<'a>(&'a self, url: &'a str, offset: u64) -> BoxFuture<'a, Result<Response, TransportError>> {
        Box::pin(self.request(url, offset))
    }
}

/// `Content-Range: bytes <first>-<last>/<total>` of a 206 reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    first: u64,
    last: u64,
    total: Option<u64>,
}

fn content_range(headers: &header::HeaderMap) -> Option<ContentRange> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let (range, total) = value.trim().strip_prefix("bytes ")?.split_once('/')?;
    let (first, last) = range.split_once('-')?;
    Some(ContentRange {
        first: first.trim().parse().ok()?,
        last: last.trim().parse().ok()?,
        total: total.trim().parse().ok(),
    })
}

fn content_range_total(headers: &header::HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    value.rsplit_once('/')?.1.trim().parse().ok()
}
