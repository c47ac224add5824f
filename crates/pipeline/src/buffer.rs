//! Bounded multi-consumer fan-out.
//!
//! Every subscriber owns an independent ring: publishing never blocks and
//! never waits on a slow consumer. A full ring evicts its oldest
//! droppable entry (freshness over completeness); control events are
//! never displaced. A blocked producer would starve the UDP socket and
//! cause OS-level packet loss, which is strictly worse than these
//! application-level drops.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Whether an entry may be evicted under overflow. Data frames are;
/// lifecycle/teardown events are not.
pub trait Droppable {
    fn droppable(&self) -> bool;
}

struct State<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
    dropped: u64,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

pub struct QueueSender<T> {
    shared: Arc<Shared<T>>,
}

/// One consumer's view: an infinite, non-restartable sequence.
pub struct Subscription<T> {
    shared: Arc<Shared<T>>,
}

pub fn ring_queue<T: Droppable>(capacity: usize) -> (QueueSender<T>, Subscription<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            items: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
            dropped: 0,
        }),
        notify: Notify::new(),
    });
    (QueueSender { shared: shared.clone() }, Subscription { shared })
}

impl<T: Droppable> QueueSender<T> {
    /// Non-blocking. Evicts the oldest droppable entry when full; an item
    /// pushed after close is discarded.
    pub fn push(&self, item: T) {
        {
            let mut st = self.shared.state.lock();
            if st.closed {
                return;
            }
            if st.items.len() >= st.capacity {
                if let Some(pos) = st.items.iter().position(|i| i.droppable()) {
                    st.items.remove(pos);
                    st.dropped += 1;
                }
                // all entries are control events: briefly exceed capacity
            }
            st.items.push_back(item);
        }
        self.shared.notify.notify_one();
    }

    /// No more items will be pushed; the subscriber drains what remains.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }
}

impl<T> Subscription<T> {
    /// Next item in FIFO order. `None` once the queue is closed and fully
    /// drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut st = self.shared.state.lock();
                if let Some(item) = st.items.pop_front() {
                    return Some(item);
                }
                if st.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        // lets the publisher prune this queue instead of filling it
        self.shared.state.lock().closed = true;
    }
}

/// The buffer connecting the ingestion path to every consumer.
pub struct DeliveryBuffer<T> {
    subscribers: Mutex<Vec<QueueSender<T>>>,
}

impl<T: Droppable + Clone> DeliveryBuffer<T> {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()) }
    }

    /// Consumers pick their own capacity: live views stay small, the
    /// persistence consumer runs deep.
    pub fn subscribe(&self, capacity: usize) -> Subscription<T> {
        let (tx, rx) = ring_queue(capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Fans the event out to every live subscriber without blocking.
    pub fn publish(&self, event: T) {
        let mut subs = self.subscribers.lock();
        subs.retain(|s| !s.is_closed());
        for sub in subs.iter() {
            sub.push(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock();
        subs.retain(|s| !s.is_closed());
        subs.len()
    }
}

impl<T: Droppable + Clone> Default for DeliveryBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
