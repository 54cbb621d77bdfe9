//! Subscribe to the change feed of a single document.
//!
//! ```sh
//! cargo run -p fauna-subscriber --example subscribe -- <SECRET> <COLLECTION> <ID> [HOST]
//! ```
//!
//! Or pass the secret via environment variable:
//! ```sh
//! FAUNA_SECRET=... cargo run -p fauna-subscriber --example subscribe \
//!     -- <COLLECTION> <ID> [HOST]
//! ```
//!
//! Each received event is printed to stdout (pipe to `jq` for formatting).
//! Stop with Ctrl-C, or the stream ends on its own after the first error
//! event.

use std::sync::Arc;

use fauna_subscriber::{
    ClientConfig, EventType, StreamClient, StreamEvent, SubscriptionOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let env_secret = std::env::var("FAUNA_SECRET").ok();

    let (secret, collection, id, host) = if let Some(ref secret) = env_secret {
        let collection = args
            .first()
            .ok_or("usage: subscribe <COLLECTION> <ID> [HOST]")?;
        let id = args.get(1).ok_or("usage: subscribe <COLLECTION> <ID> [HOST]")?;
        (secret.as_str(), collection.as_str(), id.as_str(), args.get(2).cloned())
    } else {
        let secret = args
            .first()
            .ok_or("usage: subscribe <SECRET> <COLLECTION> <ID> [HOST]")?;
        let collection = args
            .get(1)
            .ok_or("usage: subscribe <SECRET> <COLLECTION> <ID> [HOST]")?;
        let id = args
            .get(2)
            .ok_or("usage: subscribe <SECRET> <COLLECTION> <ID> [HOST]")?;
        (secret.as_str(), collection.as_str(), id.as_str(), args.get(3).cloned())
    };

    let mut config = ClientConfig::new(secret);
    if let Some(host) = host {
        config.host = host;
    }
    let client = Arc::new(StreamClient::new(config));

    let expression = serde_json::json!({
        "@ref": {
            "id": id,
            "collection": {"@ref": {"id": collection, "collection": {"@ref": {"id": "collections"}}}}
        }
    });

    eprintln!("streaming {collection}/{id} ...");

    let mut sub = client.stream(expression, SubscriptionOptions::new(), true)?;
    let handle = sub.handle();

    sub.on(EventType::Start, |event, _| {
        eprintln!("[start] txn={:?}", event.txn_ts());
    });
    sub.on(EventType::Version, |event, _| {
        if let StreamEvent::Version { data: Some(data), txn_ts } = &event {
            eprintln!("[version] txn={txn_ts:?}");
            println!("{data}");
        }
    });
    sub.on(EventType::HistoryRewrite, |event, _| {
        eprintln!("[history_rewrite] txn={:?}", event.txn_ts());
    });
    sub.on(EventType::Error, move |event, _| {
        if let StreamEvent::Error(err) = &event {
            eprintln!(
                "[error] code={} {}",
                err.code.as_deref().unwrap_or("-"),
                err.description.as_deref().unwrap_or("-"),
            );
        }
        handle.close();
    });

    // Blocking mode: returns once the stream has been closed or has failed.
    sub.start().await?;

    if let Some(failure) = sub.last_error() {
        eprintln!("stream terminated: {failure}");
    }

    Ok(())
}
