//! The subscription facade tying dispatch to a connection.

use std::sync::Arc;

use serde_json::Value;

use crate::client::StreamClient;
use crate::connection::{Connection, State, SubscriptionHandle};
use crate::dispatch::Dispatcher;
use crate::events::{EventType, StreamEvent};
use crate::types::{Error, RequestResult, SubscriptionOptions};

/// A stream subscription: callback registry plus the connection that feeds
/// it.
///
/// Created through [`StreamClient::stream`]. Register callbacks with
/// [`on`](Subscription::on), then call [`start`](Subscription::start). In
/// blocking mode `start` returns only once the stream has ended; otherwise
/// it returns as soon as the stream is open and events arrive on a
/// background worker until [`close`](Subscription::close) or the server
/// ends the stream.
pub struct Subscription {
    dispatcher: Dispatcher,
    connection: Connection,
    blocking: bool,
}

impl Subscription {
    pub(crate) fn new(
        client: Arc<StreamClient>,
        expression: Value,
        options: SubscriptionOptions,
        blocking: bool,
    ) -> Result<Self, Error> {
        let connection = Connection::new(client, expression, options)?;
        Ok(Self {
            dispatcher: Dispatcher::new(),
            connection,
            blocking,
        })
    }

    /// Registers a callback for a specific event type, replacing any
    /// previous one. May also be called after the stream has started; the
    /// registration takes effect from the next received event.
    pub fn on<F>(&self, event_type: EventType, callback: F)
    where
        F: FnMut(StreamEvent, Option<Arc<RequestResult>>) + Send + 'static,
    {
        self.dispatcher.on(event_type, callback);
    }

    /// Initiates the underlying stream.
    pub async fn start(&mut self) -> Result<(), Error> {
        let dispatcher = self.dispatcher.clone();
        self.connection
            .subscribe(
                Box::new(move |event, request_result| dispatcher.dispatch(event, request_result)),
                self.blocking,
            )
            .await
    }

    /// Stops the stream; no events are delivered after this returns.
    /// Idempotent once started.
    pub fn close(&self) -> Result<(), Error> {
        self.connection.close()
    }

    /// Waits for the background worker to finish. No-op in blocking mode,
    /// where `start` already returned only after the stream ended.
    pub async fn join(&mut self) -> Result<(), Error> {
        self.connection.join().await
    }

    /// A clonable handle for closing this stream, usable from inside an
    /// event callback.
    pub fn handle(&self) -> SubscriptionHandle {
        self.connection.handle()
    }

    pub fn state(&self) -> State {
        self.connection.state()
    }

    /// The terminal failure that ended the stream, if any.
    pub fn last_error(&self) -> Option<Arc<Error>> {
        self.connection.last_error()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("state", &self.state())
            .field("blocking", &self.blocking)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
