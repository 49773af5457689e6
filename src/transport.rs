use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::ServerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One message waiting to be written to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Raw terminal output, sent as a binary frame.
    Terminal(Bytes),
    /// Named-channel event, sent as a JSON text frame.
    Event(ServerEvent),
}

impl Outgoing {
    /// Unsolicited tree notices. A newer one makes a queued one redundant.
    fn is_tree_notice(&self) -> bool {
        matches!(
            self,
            Outgoing::Event(ServerEvent::TreeChanged)
                | Outgoing::Event(ServerEvent::TreeSnapshot { id: None, .. })
        )
    }

    fn same_event(&self, other: &Outgoing) -> bool {
        match (self, other) {
            (Outgoing::Event(a), Outgoing::Event(b)) => {
                std::mem::discriminant(a) == std::mem::discriminant(b)
            }
            _ => false,
        }
    }
}

/// Bounded FIFO between the broker and one client's socket writer.
///
/// Pushing never blocks. When the queue is full the oldest terminal output
/// is discarded and counted, so a slow client loses shell history instead
/// of stalling the broker or the other clients. Replies and control events
/// are never traded for output; they may run past `capacity` up to twice
/// its size, after which the oldest message goes regardless.
///
/// A tree notice replaces a queued notice of the same kind in place.
#[derive(Debug)]
pub struct Outbox {
    queue: Mutex<OutboxQueue>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

#[derive(Debug, Default)]
struct OutboxQueue {
    items: VecDeque<Outgoing>,
    closed: bool,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(OutboxQueue::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a message. Returns `false` if the outbox is closed.
    pub fn push(&self, message: Outgoing) -> bool {
        {
            let mut queue = self.queue.lock();
            if queue.closed {
                return false;
            }
            if message.is_tree_notice() {
                let queued = queue
                    .items
                    .iter_mut()
                    .find(|m| m.is_tree_notice() && m.same_event(&message));
                if let Some(queued) = queued {
                    *queued = message;
                    return true;
                }
            }
            if queue.items.len() >= self.capacity {
                let oldest_output = queue
                    .items
                    .iter()
                    .position(|m| matches!(m, Outgoing::Terminal(_)));
                let evict = match oldest_output {
                    Some(index) => Some(index),
                    // Nothing but replies queued: shed the new output instead.
                    None if matches!(message, Outgoing::Terminal(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                    None if queue.items.len() >= self.capacity * 2 => Some(0),
                    None => None,
                };
                if let Some(index) = evict {
                    queue.items.remove(index);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            queue.items.push_back(message);
        }
        self.notify.notify_one();
        true
    }

    /// Next message in push order, or `None` once closed. Anything still
    /// queued at close is discarded.
    pub async fn recv(&self) -> Option<Outgoing> {
        loop {
            {
                let mut queue = self.queue.lock();
                if queue.closed {
                    return None;
                }
                if let Some(message) = queue.items.pop_front() {
                    return Some(message);
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        {
            let mut queue = self.queue.lock();
            queue.closed = true;
            queue.items.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    /// Number of messages dropped since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Broker-side view of an attached client.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub outbox: Arc<Outbox>,
    /// Cancelled when the connection goes away; stops its file worker.
    pub cancel: CancellationToken,
}

impl Connection {
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            id: ConnectionId::new(),
            outbox: Arc::new(Outbox::new(outbound_capacity)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn send(&self, message: Outgoing) -> bool {
        self.outbox.push(message)
    }

    pub fn send_event(&self, event: ServerEvent) -> bool {
        self.outbox.push(Outgoing::Event(event))
    }

    /// Stop everything tied to this connection.
    pub fn close(&self) {
        self.cancel.cancel();
        self.outbox.close();
    }
}

/// Attached connections, owned by the broker loop.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection: Connection) {
        self.connections.insert(connection.id, connection);
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        self.connections.remove(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections for which `keep` returns true.
    pub fn select<F>(&self, mut keep: F) -> Vec<&Connection>
    where
        F: FnMut(&ConnectionId) -> bool,
    {
        self.connections.values().filter(|c| keep(&c.id)).collect()
    }

    pub fn broadcast(&self, message: &Outgoing) {
        for connection in self.connections.values() {
            connection.send(message.clone());
        }
    }

    /// Returns `false` if the connection is unknown or closed.
    pub fn send_to(&self, id: &ConnectionId, message: Outgoing) -> bool {
        match self.connections.get(id) {
            Some(connection) => connection.send(message),
            None => false,
        }
    }

    /// Close and remove every connection.
    pub fn close_all(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.close();
        }
    }
}
