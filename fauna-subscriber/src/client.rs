//! The owning client: endpoint, credentials, and the shared
//! last-seen-transaction-time watermark.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

use crate::subscribe::Subscription;
use crate::types::{Error, Observer, RequestResult, SubscriptionOptions};

pub(crate) const DEFAULT_DOMAIN: &str = "db.fauna.com";

const TXN_TIME_UNSET: i64 = -1;

/// Shared monotonically-non-decreasing transaction-time watermark.
///
/// Every active stream and every ordinary query on one client race on this
/// value; updates are a lock-free monotonic max, so a stale writer can never
/// clobber a fresher timestamp.
#[derive(Debug)]
pub struct LastTxnTime {
    time: AtomicI64,
}

impl LastTxnTime {
    pub fn new() -> Self {
        Self {
            time: AtomicI64::new(TXN_TIME_UNSET),
        }
    }

    /// The freshest transaction time seen, or `None` if not yet updated.
    pub fn get(&self) -> Option<i64> {
        let t = self.time.load(Ordering::SeqCst);
        (t > TXN_TIME_UNSET).then_some(t)
    }

    /// Folds a new transaction time into the watermark. Stale values are
    /// discarded to keep the watermark monotonic.
    pub fn update(&self, new_txn_time: i64) {
        self.time.fetch_max(new_txn_time, Ordering::SeqCst);
    }

    /// Rendering for the `X-Last-Seen-Txn` request header, read at the
    /// moment of sending.
    pub(crate) fn header_value(&self) -> String {
        self.get().unwrap_or(0).to_string()
    }
}

impl Default for LastTxnTime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for [`StreamClient::new`].
pub struct ClientConfig {
    /// Auth secret for the database endpoint.
    pub secret: String,
    /// Endpoint host. Defaults to `"db.fauna.com"`.
    pub host: String,
    /// `"http"` or `"https"`.
    pub scheme: String,
    /// Endpoint port. Defaults to 443 for https and 80 otherwise.
    pub port: Option<u16>,
    /// Optional per-query timeout, carried as the `X-Query-Timeout` header.
    /// Enforcement is delegated to the server.
    pub query_timeout_ms: Option<u64>,
    /// Callback invoked with every [`RequestResult`] produced on any stream.
    pub observer: Option<Observer>,
}

impl ClientConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            host: DEFAULT_DOMAIN.to_string(),
            scheme: "https".to_string(),
            port: None,
            query_timeout_ms: None,
            observer: None,
        }
    }
}

/// The owning client shared by all stream subscriptions: endpoint and
/// credentials, the transaction-time watermark, and the observer hook.
pub struct StreamClient {
    host: String,
    scheme: String,
    port: u16,
    secret: String,
    query_timeout_ms: Option<u64>,
    observer: Option<Observer>,
    last_txn_time: LastTxnTime,
}

impl StreamClient {
    pub fn new(config: ClientConfig) -> Self {
        let port = config
            .port
            .unwrap_or(if config.scheme == "https" { 443 } else { 80 });
        Self {
            host: config.host,
            scheme: config.scheme,
            port,
            secret: config.secret,
            query_timeout_ms: config.query_timeout_ms,
            observer: config.observer,
            last_txn_time: LastTxnTime::new(),
        }
    }

    /// Creates a stream subscription to the result of the given read-only
    /// expression. No request is issued until
    /// [`start`](Subscription::start) is called; register callbacks for the
    /// events of interest first, otherwise received events are ignored.
    pub fn stream(
        self: &Arc<Self>,
        expression: Value,
        options: SubscriptionOptions,
        blocking: bool,
    ) -> Result<Subscription, Error> {
        Subscription::new(Arc::clone(self), expression, options, blocking)
    }

    pub(crate) fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// The HTTP authorization header value, always current.
    pub(crate) fn auth_header(&self) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:", self.secret)))
    }

    pub(crate) fn query_timeout_ms(&self) -> Option<u64> {
        self.query_timeout_ms
    }

    /// The freshest transaction time reported to this client.
    pub fn last_txn_time(&self) -> Option<i64> {
        self.last_txn_time.get()
    }

    /// Syncs the freshest transaction time seen by this client. Has no
    /// effect if staler than the currently stored timestamp.
    pub fn sync_last_txn_time(&self, new_txn_time: i64) {
        self.last_txn_time.update(new_txn_time);
    }

    pub(crate) fn txn_time_header_value(&self) -> String {
        self.last_txn_time.header_value()
    }

    /// Forwards a request result to the observer hook, if one is registered.
    pub(crate) fn observe(&self, request_result: &RequestResult) {
        if let Some(observer) = &self.observer {
            observer(request_result);
        }
    }
}
