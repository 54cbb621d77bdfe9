//! Connection lifecycle and the receive loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::StreamClient;
use crate::events::{ErrorEvent, StreamEvent, classify};
use crate::protocol::{FrameBuffer, parse_json_or_none};
use crate::types::{Error, EventCallback, RequestResult, SubscriptionOptions, lock};

pub(crate) const STREAM_PATH: &str = "/stream";
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const HEADER_LAST_SEEN_TXN: &str = "X-Last-Seen-Txn";
const HEADER_QUERY_TIMEOUT: &str = "X-Query-Timeout";
const HEADER_TXN_TIME: &str = "x-txn-time";

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Connection lifecycle states. `Error` is absorbing: once entered, no
/// further events are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Open,
    Closed,
    Error,
}

/// Clonable handle for closing a stream, including from inside one of its
/// own event callbacks (a primary exit pattern: the callback observes the
/// event it was waiting for and requests termination).
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    cancel: CancellationToken,
    state: Arc<Mutex<State>>,
}

impl SubscriptionHandle {
    /// Closes the stream: the in-flight network read is aborted and no
    /// further events are delivered. Idempotent; closing an already-closed
    /// stream is a no-op.
    pub fn close(&self) {
        self.cancel.cancel();
        let mut state = lock(&self.state);
        if *state != State::Error {
            *state = State::Closed;
        }
    }
}

/// Owns one subscription's network stream and receive loop.
///
/// Constructed eagerly: option validation, query encoding, and transport
/// construction all happen here so failures surface before any request is
/// issued.
pub struct Connection {
    client: Arc<StreamClient>,
    expression: Value,
    payload: Bytes,
    fields: Option<String>,
    transport: Option<reqwest::Client>,
    state: Arc<Mutex<State>>,
    cancel: CancellationToken,
    last_error: Arc<Mutex<Option<Arc<Error>>>>,
    worker: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(
        client: Arc<StreamClient>,
        expression: Value,
        options: SubscriptionOptions,
    ) -> Result<Self, Error> {
        options.validate()?;
        let fields = options.fields.as_ref().map(|fields| fields.join(","));
        let payload = Bytes::from(serde_json::to_vec(&expression)?);
        let transport = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(Error::StreamOpen)?;
        Ok(Self {
            client,
            expression,
            payload,
            fields,
            transport: Some(transport),
            state: Arc::new(Mutex::new(State::Idle)),
            cancel: CancellationToken::new(),
            last_error: Arc::new(Mutex::new(None)),
            worker: None,
        })
    }

    pub fn state(&self) -> State {
        *lock(&self.state)
    }

    /// The stored terminal failure, if the receive loop ended with one.
    pub fn last_error(&self) -> Option<Arc<Error>> {
        lock(&self.last_error).clone()
    }

    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            cancel: self.cancel.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Initiates the stream subscription and runs the receive loop, inline
    /// in blocking mode or on a background worker otherwise.
    pub async fn subscribe(&mut self, on_event: EventCallback, blocking: bool) -> Result<(), Error> {
        {
            let mut state = lock(&self.state);
            if *state != State::Idle {
                return Err(Error::AlreadyStarted);
            }
            *state = State::Connecting;
        }
        let transport = self
            .transport
            .as_ref()
            .ok_or(Error::InactiveStream)?
            .clone();

        let mut url = url::Url::parse(&format!("{}{STREAM_PATH}", self.client.base_url()))?;
        if let Some(fields) = &self.fields {
            url.query_pairs_mut().append_pair("fields", fields);
        }

        // Headers are read at the moment of sending: the watermark may have
        // advanced since construction.
        let mut request = transport
            .post(url.clone())
            .header(AUTHORIZATION, self.client.auth_header())
            .header(HEADER_LAST_SEEN_TXN, self.client.txn_time_header_value())
            .body(self.payload.clone());
        if let Some(timeout_ms) = self.client.query_timeout_ms() {
            request = request.header(HEADER_QUERY_TIMEOUT, timeout_ms.to_string());
        }

        let start_time = SystemTime::now();
        debug!(url = %url, "opening stream");
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                *lock(&self.state) = State::Error;
                return Err(Error::StreamOpen(e));
            }
        };

        // The response headers seed the watermark before the first push is
        // processed. Status codes are deliberately not rejected here: error
        // responses carry an `errors` body frame that flows through the
        // classifier like any other push.
        if let Some(txn_time) = response
            .headers()
            .get(HEADER_TXN_TIME)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
        {
            self.client.sync_last_txn_time(txn_time);
        }
        let headers = response.headers().clone();
        *lock(&self.state) = State::Open;

        let receive = ReceiveLoop {
            byte_stream: Box::pin(response.bytes_stream()),
            frames: FrameBuffer::new(),
            headers,
            client: Arc::clone(&self.client),
            state: Arc::clone(&self.state),
            last_error: Arc::clone(&self.last_error),
            expression: self.expression.clone(),
            request_body: self.payload.clone(),
            on_event,
            start_time,
        };
        let cancel = self.cancel.clone();
        if blocking {
            run_receive_loop(receive, cancel).await;
        } else {
            self.worker = Some(tokio::spawn(run_receive_loop(receive, cancel)));
        }
        Ok(())
    }

    /// Closes the stream subscription by aborting its in-flight network
    /// read. Idempotent once the transport exists; closing a connection
    /// whose network object was never established is a lifecycle error.
    pub fn close(&self) -> Result<(), Error> {
        if self.transport.is_none() {
            return Err(Error::InactiveStream);
        }
        self.handle().close();
        Ok(())
    }

    /// Blocks until the background receive loop has terminated. No-op when
    /// no worker was spawned.
    pub async fn join(&mut self) -> Result<(), Error> {
        if let Some(worker) = self.worker.take() {
            worker
                .await
                .map_err(|e| Error::Worker(e.to_string()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("expression", &self.expression)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

struct ReceiveLoop {
    byte_stream: ByteStream,
    frames: FrameBuffer,
    headers: reqwest::header::HeaderMap,
    client: Arc<StreamClient>,
    state: Arc<Mutex<State>>,
    last_error: Arc<Mutex<Option<Arc<Error>>>>,
    expression: Value,
    request_body: Bytes,
    on_event: EventCallback,
    start_time: SystemTime,
}

/// One iteration per pushed chunk; frames are processed strictly in
/// transport order and never buffered past a close request.
async fn run_receive_loop(mut p: ReceiveLoop, cancel: CancellationToken) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("close requested, receive loop exiting");
                return;
            }
            chunk = p.byte_stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                let frames = p.frames.feed(&bytes);
                for raw in frames {
                    // A callback may have closed the stream; honor that
                    // before dispatching anything further.
                    if cancel.is_cancelled() {
                        return;
                    }
                    // A panicking callback or observer must not leave the
                    // connection stuck in Open; it ends the stream like any
                    // other client-side failure.
                    let outcome = catch_unwind(AssertUnwindSafe(|| process_frame(&mut p, raw)))
                        .unwrap_or_else(|_| Err(Error::Worker("event callback panicked".into())));
                    if let Err(failure) = outcome {
                        deliver_terminal_error(&mut p, &cancel, failure);
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                deliver_terminal_error(&mut p, &cancel, Error::Http(e));
                return;
            }
            None => {
                debug!("stream ended by server");
                let mut state = lock(&p.state);
                if *state == State::Open {
                    *state = State::Closed;
                }
                return;
            }
        }
    }
}

/// Wraps one push frame into a request result, classifies it, folds its
/// transaction time into the watermark, and dispatches it.
fn process_frame(p: &mut ReceiveLoop, raw: String) -> Result<(), Error> {
    let parsed = parse_json_or_none(&raw);
    let request_result = Arc::new(RequestResult {
        method: "POST",
        path: STREAM_PATH.to_string(),
        query: p.expression.clone(),
        request_body: p.request_body.clone(),
        raw_chunk: raw,
        parsed,
        headers: p.headers.clone(),
        start_time: p.start_time,
        end_time: SystemTime::now(),
    });
    let event = classify(&request_result)?;
    if let Some(txn_ts) = event.txn_ts() {
        p.client.sync_last_txn_time(txn_ts);
    }
    (p.on_event)(event, Some(Arc::clone(&request_result)));
    p.client.observe(&request_result);
    Ok(())
}

/// Captures a client-side failure, closes the connection, and delivers the
/// terminal error event exactly once. The loop must return right after.
fn deliver_terminal_error(p: &mut ReceiveLoop, cancel: &CancellationToken, failure: Error) {
    warn!(error = %failure, "stream terminated by client-side failure");
    cancel.cancel();
    *lock(&p.state) = State::Error;
    let failure = Arc::new(failure);
    *lock(&p.last_error) = Some(Arc::clone(&failure));
    let event = StreamEvent::Error(ErrorEvent::from_failure(&failure));
    if catch_unwind(AssertUnwindSafe(|| (p.on_event)(event, None))).is_err() {
        warn!("error callback panicked during terminal delivery");
    }
}
