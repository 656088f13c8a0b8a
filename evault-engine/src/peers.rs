//! # Replication Peers
//!
//! Registry of sessions that asked to receive the mutation stream.
//!
//! Each peer owns a bounded queue; its session drains the queue onto the
//! socket. Broadcasting clones the senders under the registry lock and
//! enqueues after releasing it, so registration never waits on delivery.
//! A peer whose queue is full is dropped from the set: its session sees the
//! stream end once the queued frames are drained and closes the connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tracing::{debug, warn};

pub type PeerId = u64;

/// Frames a peer may have queued before it is considered too slow.
pub const PEER_QUEUE_CAPACITY: usize = 65_536;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    peers: Mutex<HashMap<PeerId, Sender<Bytes>>>,
}

/// Shared set of replication peers.
#[derive(Clone)]
pub struct PeerSet {
    registry: Arc<Registry>,
    capacity: usize,
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::with_capacity(PEER_QUEUE_CAPACITY)
    }
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set whose peers may each queue up to `capacity` frames.
    pub fn with_capacity(capacity: usize) -> Self {
        PeerSet {
            registry: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    /// Adds a peer. It stays registered until the subscription is dropped
    /// or its queue overflows.
    pub fn register(&self) -> PeerSubscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.registry.peers.lock().insert(id, sender);
        debug!(peer = id, "replication peer registered");
        PeerSubscription {
            id,
            receiver,
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn len(&self) -> usize {
        self.registry.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues `frame` for every registered peer. Returns how many accepted it.
    ///
    /// Peers with a full queue are removed instead of waited on.
    pub fn broadcast(&self, frame: Bytes) -> usize {
        let targets: Vec<(PeerId, Sender<Bytes>)> = {
            let peers = self.registry.peers.lock();
            if peers.is_empty() {
                return 0;
            }
            peers.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        let mut delivered = 0;
        let mut lagging = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        peer = id,
                        capacity = self.capacity,
                        "replication peer fell behind; dropping it"
                    );
                    lagging.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(peer = id, "replication peer queue closed; skipping");
                }
            }
        }
        if !lagging.is_empty() {
            let mut peers = self.registry.peers.lock();
            for id in lagging {
                peers.remove(&id);
            }
        }
        delivered
    }
}

/// A registered peer's end of the stream.
pub struct PeerSubscription {
    id: PeerId,
    receiver: Receiver<Bytes>,
    registry: Arc<Registry>,
}

impl PeerSubscription {
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Waits for the next frame. `None` once the peer has been dropped from
    /// the set and its queue is drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Returns a queued frame without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for PeerSubscription {
    fn drop(&mut self) {
        self.registry.peers.lock().remove(&self.id);
        debug!(peer = self.id, "replication peer removed");
    }
}
