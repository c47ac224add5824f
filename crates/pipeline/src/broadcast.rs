//! Authorization-filtered live broadcast.
//!
//! Every observer owns a bounded drop-oldest queue; a single dispatch
//! loop reads the delivery buffer and forwards each frame only to
//! observers subscribed to that frame's resolved owner. A slow or dead
//! observer overflows or gets pruned without touching anyone else.

use futures::Stream;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use model::{Identity, OwnerId, TelemetrySample};

use crate::buffer::{ring_queue, Droppable, QueueSender, Subscription};
use crate::{AuthorizationCheck, PipelineError, PipelineEvent};

/// What an observer receives. `Closed` marks orderly teardown and is
/// never displaced by overflow.
#[derive(Clone, Debug)]
pub enum StreamMessage {
    Sample(Arc<TelemetrySample>),
    Closed,
}

impl Droppable for StreamMessage {
    fn droppable(&self) -> bool {
        matches!(self, StreamMessage::Sample(_))
    }
}

struct ObserverSlot {
    identity: Identity,
    owner: OwnerId,
    tx: QueueSender<StreamMessage>,
}

/// A live observer's read view of the stream. Dropping it cancels only
/// this subscription.
pub struct ObserverStream {
    owner: OwnerId,
    rx: Subscription<StreamMessage>,
}

impl std::fmt::Debug for ObserverStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverStream")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl ObserverStream {
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// `None` after `Closed` has been delivered and drained.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamMessage> {
        futures::stream::unfold(self, |mut s| async move {
            s.recv().await.map(|msg| (msg, s))
        })
    }
}

pub struct ObserverHub {
    observers: Mutex<Vec<ObserverSlot>>,
    auth: Arc<dyn AuthorizationCheck>,
    default_capacity: usize,
}

impl ObserverHub {
    pub fn new(auth: Arc<dyn AuthorizationCheck>, default_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            observers: Mutex::new(Vec::new()),
            auth,
            default_capacity,
        })
    }

    /// The authorization check happens here, once per connection, and is
    /// not re-checked per sample.
    pub fn subscribe(
        &self,
        identity: Identity,
        owner: OwnerId,
    ) -> Result<ObserverStream, PipelineError> {
        self.subscribe_with_capacity(identity, owner, self.default_capacity)
    }

    pub fn subscribe_with_capacity(
        &self,
        identity: Identity,
        owner: OwnerId,
        capacity: usize,
    ) -> Result<ObserverStream, PipelineError> {
        if !self.auth.allows(&identity, &owner) {
            warn!(%identity, %owner, "subscription refused");
            return Err(PipelineError::Unauthorized { identity, owner });
        }
        let (tx, rx) = ring_queue(capacity);
        info!(%identity, %owner, "observer subscribed");
        self.observers.lock().push(ObserverSlot { identity, owner: owner.clone(), tx });
        Ok(ObserverStream { owner, rx })
    }

    pub fn observer_count(&self) -> usize {
        let mut obs = self.observers.lock();
        obs.retain(|o| !o.tx.is_closed());
        obs.len()
    }

    /// Dispatch loop: runs until the buffer closes or a `Shutdown` event
    /// arrives, then tells every observer the stream is over.
    pub async fn run(self: Arc<Self>, mut events: Subscription<PipelineEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::Frame { sample, owner, .. } => {
                    let mut obs = self.observers.lock();
                    obs.retain(|o| !o.tx.is_closed());
                    for slot in obs.iter().filter(|o| o.owner == owner) {
                        slot.tx.push(StreamMessage::Sample(sample.clone()));
                    }
                }
                // summaries are the persistence consumer's concern
                PipelineEvent::SessionClosed(_) => {}
                PipelineEvent::Shutdown => break,
            }
        }
        let mut obs = self.observers.lock();
        for slot in obs.drain(..) {
            debug!(identity = %slot.identity, "closing observer stream");
            slot.tx.push(StreamMessage::Closed);
            slot.tx.close();
        }
    }
}
