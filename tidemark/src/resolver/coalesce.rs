//! Request coalescing for tile resolution.
//!
//! When several requests arrive for the same `(source, z, x, y)` while a
//! fetch is already running, only the first does any work; the rest
//! subscribe to its result. Uses `DashMap` for lock-free registration and a
//! broadcast channel per in-flight key.

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use super::ResolvedTile;

/// Key of one in-flight tile fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TileKey {
    pub source: String,
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

type Outcome = Option<ResolvedTile>;

pub(crate) struct Coalescer {
    in_flight: DashMap<TileKey, broadcast::Sender<Outcome>>,
}

pub(crate) enum Registration {
    /// First request for the key; caller must resolve and then `complete`.
    Lead,
    /// Another fetch is running; await its broadcast.
    Follower(broadcast::Receiver<Outcome>),
}

impl Coalescer {
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    /// Registers interest in a key.
    ///
    /// The entry API makes check-and-insert atomic, so under concurrent
    /// registration exactly one caller becomes the lead.
    pub fn register(&self, key: TileKey) -> Registration {
        match self.in_flight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                debug!(source = %key.source, tile = format!("{}/{}/{}", key.z, key.x, key.y),
                    "coalescing onto in-flight fetch");
                Registration::Follower(entry.get().subscribe())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(8);
                entry.insert(tx);
                Registration::Lead
            }
        }
    }

    /// Publishes the outcome and removes the key.
    ///
    /// Send errors are ignored; there may simply be no followers.
    pub fn complete(&self, key: &TileKey, outcome: Outcome) {
        if let Some((_, tx)) = self.in_flight.remove(key) {
            let _ = tx.send(outcome);
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
