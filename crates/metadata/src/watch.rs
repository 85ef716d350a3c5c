//! Watch streams over collection changes.
//!
//! Events are published in-process after the owning transaction commits, in
//! commit-revision order per collection. A watcher that falls behind the
//! broadcast buffer surfaces `WatchLagged`; the caller re-lists and
//! re-subscribes.

use crate::collection::Record;
use crate::error::{MetadataError, MetadataResult};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Broadcast buffer per collection. Watchers slower than this many events
/// behind the writers are disconnected with `WatchLagged`.
const CHANNEL_CAPACITY: usize = 1024;

/// What happened to a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// An untyped change event as carried on the broadcast channel.
#[derive(Clone, Debug)]
pub struct RawEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value for `Put`, prior value for `Delete`.
    pub value: serde_json::Value,
    pub revision: i64,
}

/// Per-collection broadcast channels.
#[derive(Default)]
pub struct WatchHub {
    senders: Mutex<HashMap<&'static str, broadcast::Sender<RawEvent>>>,
}

impl WatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, collection: &'static str) -> broadcast::Receiver<RawEvent> {
        let mut senders = self.senders.lock().expect("watch hub poisoned");
        senders
            .entry(collection)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish committed events. Events for collections nobody watches are
    /// dropped.
    pub(crate) fn publish(&self, events: Vec<(&'static str, RawEvent)>) {
        let senders = self.senders.lock().expect("watch hub poisoned");
        for (collection, event) in events {
            if let Some(sender) = senders.get(collection) {
                // send only fails when there are no receivers
                let _ = sender.send(event);
            }
        }
    }
}

/// Which events a watcher wants to see.
#[derive(Clone, Debug)]
pub enum WatchFilter {
    All,
    Key(String),
    KeyPrefix(String),
    Index(&'static str, String),
}

impl WatchFilter {
    fn matches<T: Record>(&self, event: &RawEvent, record: &T) -> bool {
        match self {
            Self::All => true,
            Self::Key(key) => event.key == *key,
            Self::KeyPrefix(prefix) => event.key.starts_with(prefix),
            Self::Index(idx, value) => record
                .indexes()
                .iter()
                .any(|(i, v)| i == idx && v == value),
        }
    }
}

/// A typed change event.
#[derive(Clone, Debug)]
pub struct WatchEvent<T> {
    pub kind: EventKind,
    pub key: String,
    /// New record for `Put`, prior record for `Delete`.
    pub record: T,
    pub revision: i64,
}

/// A typed subscription to one collection.
pub struct Watcher<T: Record> {
    rx: broadcast::Receiver<RawEvent>,
    filter: WatchFilter,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> Watcher<T> {
    pub(crate) fn new(rx: broadcast::Receiver<RawEvent>, filter: WatchFilter) -> Self {
        Self {
            rx,
            filter,
            _marker: PhantomData,
        }
    }

    /// Next matching event. `Err(WatchLagged)` means events were missed and
    /// the caller must re-list; `Err(WatchClosed)` means the store is gone.
    pub async fn next(&mut self) -> MetadataResult<WatchEvent<T>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    let record: T = match serde_json::from_value(event.value.clone()) {
                        Ok(record) => record,
                        Err(e) => {
                            tracing::warn!(
                                collection = T::COLLECTION,
                                key = %event.key,
                                error = %e,
                                "Dropping undecodable watch event"
                            );
                            continue;
                        }
                    };
                    if self.filter.matches(&event, &record) {
                        return Ok(WatchEvent {
                            kind: event.kind,
                            key: event.key,
                            record,
                            revision: event.revision,
                        });
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        collection = T::COLLECTION,
                        skipped = skipped,
                        "Watcher lagged behind event stream"
                    );
                    return Err(MetadataError::WatchLagged);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(MetadataError::WatchClosed);
                }
            }
        }
    }
}
