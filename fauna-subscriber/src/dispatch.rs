//! Event dispatch: routes classified events to registered callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{error, trace};

use crate::events::{EventType, StreamEvent};
use crate::types::{EventCallback, RequestResult, lock};

/// Registry mapping an event-type tag to a single callback; the last
/// registration for a tag wins.
///
/// Registration may happen before or after the stream is started: the
/// receive loop resolves callbacks at dispatch time, so a registration made
/// before the next chunk arrives is honored.
#[derive(Clone, Default)]
pub struct Dispatcher {
    callbacks: Arc<Mutex<HashMap<EventType, EventCallback>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for a specific event type, replacing any
    /// previous one.
    pub fn on<F>(&self, event_type: EventType, callback: F)
    where
        F: FnMut(StreamEvent, Option<Arc<RequestResult>>) + Send + 'static,
    {
        lock(&self.callbacks).insert(event_type, Box::new(callback));
    }

    /// Routes an event to the callback registered for its tag.
    ///
    /// Unhandled events are dropped, except error events: a silently dropped
    /// terminal error would mask stream death, so those are surfaced through
    /// a default handler that logs them.
    pub fn dispatch(&self, event: StreamEvent, request_result: Option<Arc<RequestResult>>) {
        let tag = event.event_type();
        // The callback is taken out of the registry while it runs, so a
        // callback that registers handlers does not deadlock.
        let taken = lock(&self.callbacks).remove(&tag);
        match taken {
            Some(mut callback) => {
                callback(event, request_result);
                lock(&self.callbacks).entry(tag).or_insert(callback);
            }
            None if tag == EventType::Error => {
                error!(?event, "unhandled stream error event");
            }
            None => {
                trace!(event_type = tag.as_str(), "no callback registered, dropping event");
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags: Vec<&'static str> = lock(&self.callbacks)
            .keys()
            .map(|t| t.as_str())
            .collect();
        f.debug_struct("Dispatcher").field("registered", &tags).finish()
    }
}
