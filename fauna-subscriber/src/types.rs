//! Public types: subscription options, request records, and errors.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::events::StreamEvent;

/// Field names the server accepts for the `fields` stream option.
pub const VALID_FIELDS: [&str; 6] = ["ref", "ts", "diff", "old", "new", "action"];

/// Configuration for a stream subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// Restricts which parts of each change record the server emits.
    /// Valid values are listed in [`VALID_FIELDS`]; anything else is a
    /// configuration error raised when the subscription is constructed.
    pub fields: Option<Vec<String>>,
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options with a field filter.
    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: Some(fields.into_iter().map(Into::into).collect()),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if let Some(fields) = &self.fields {
            for field in fields {
                if !VALID_FIELDS.contains(&field.as_str()) {
                    return Err(Error::Config(format!(
                        "valid fields options are {VALID_FIELDS:?}, provided {fields:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// An immutable record of one protocol exchange: the subscribe request plus
/// one received push chunk.
///
/// Built fresh for every chunk and shared between the event classifier, the
/// `Unknown` event variant, and the client-wide observer hook.
#[derive(Debug)]
pub struct RequestResult {
    pub method: &'static str,
    pub path: String,
    /// The original query expression.
    pub query: Value,
    /// The raw outgoing request body.
    pub request_body: Bytes,
    /// The raw incoming chunk.
    pub raw_chunk: String,
    /// The parsed chunk, or `None` if it was not valid JSON.
    pub parsed: Option<Value>,
    /// Headers of the streaming response.
    pub headers: HeaderMap,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
}

/// Callback invoked with every event the receive loop produces. The request
/// result is `None` only for the terminal client-side error event.
///
/// A panic unwinding out of the callback terminates the stream with a worker
/// error; it is delivered as a terminal error event like any other
/// client-side failure.
pub type EventCallback = Box<dyn FnMut(StreamEvent, Option<Arc<RequestResult>>) + Send>;

/// Cross-cutting hook invoked with every [`RequestResult`] produced on any
/// stream of the owning client. A panicking observer terminates the stream,
/// same as a panicking event callback.
pub type Observer = Box<dyn Fn(&RequestResult) + Send + Sync>;

/// Locks a mutex, recovering the guard if a panicking callback poisoned it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid subscription options; raised at construction, never as an event.
    #[error("invalid stream options: {0}")]
    Config(String),

    #[error("stream subscription already started")]
    AlreadyStarted,

    #[error("cannot close inactive stream subscription")]
    InactiveStream,

    /// Failure establishing the underlying network stream.
    #[error("failed to open stream: {0}")]
    StreamOpen(#[source] reqwest::Error),

    /// Transport failure while the stream was running.
    #[error("stream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to encode query expression: {0}")]
    Encode(#[from] serde_json::Error),

    /// A push frame whose shape violates the protocol contract.
    #[error("malformed push frame: {0}")]
    MalformedFrame(String),

    #[error("stream worker failed: {0}")]
    Worker(String),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}
