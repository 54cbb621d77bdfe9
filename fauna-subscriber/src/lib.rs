//! Fauna change-feed streaming client.
//!
//! Subscribes to the change notifications of a document by holding a
//! long-lived HTTP request open and classifying the newline-delimited JSON
//! frames the server pushes back.
//!
//! # Features
//! - Callback registry per event type, with last-registration-wins semantics
//! - Field projection (`ref`, `ts`, `diff`, `old`, `new`, `action`)
//! - Shared monotonic last-seen-transaction-time watermark across streams
//! - Blocking and background receive modes
//! - Close from inside an event callback via a clonable handle
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), fauna_subscriber::Error> {
//! use std::sync::Arc;
//! use fauna_subscriber::{ClientConfig, EventType, StreamClient, SubscriptionOptions};
//!
//! let client = Arc::new(StreamClient::new(ClientConfig::new("my-secret")));
//! let mut sub = client.stream(
//!     serde_json::json!({"@ref": {"id": "1", "collection": {"@ref": {"id": "scores"}}}}),
//!     SubscriptionOptions::new(),
//!     true,
//! )?;
//!
//! let handle = sub.handle();
//! sub.on(EventType::Version, move |event, _| {
//!     println!("document changed at {:?}", event.txn_ts());
//!     handle.close();
//! });
//! sub.start().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod dispatch;
mod events;
mod protocol;
mod subscribe;
mod types;

pub use client::{ClientConfig, LastTxnTime, StreamClient};
pub use connection::{Connection, State, SubscriptionHandle};
pub use dispatch::Dispatcher;
pub use events::{ErrorEvent, EventType, StreamEvent, classify};
pub use subscribe::Subscription;
pub use types::{
    Error, EventCallback, Observer, RequestResult, SubscriptionOptions, VALID_FIELDS,
};
