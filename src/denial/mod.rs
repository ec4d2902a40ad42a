//! Access-denial observation sink.
//!
//! A non-blocking, bounded channel that search hands denial events to so the
//! query path never waits on logging them. Grounded on `spec.md` §9's
//! "drop-on-full policy... expose a counter" note; the bounded
//! channel + `AtomicU64` drop counter idiom follows the teacher's background
//! worker plumbing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{ChunkId, DocumentId, TenantId, Timestamp};

/// One observed access denial, matching `spec.md` §4.2.5's event shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenialEvent {
    /// Tenant the search was run against.
    pub tenant_id: TenantId,
    /// The caller's user id.
    pub user_id: String,
    /// The query text that surfaced this denial.
    pub query_text: String,
    /// The chunk that was denied.
    pub chunk_id: ChunkId,
    /// The chunk's parent document.
    pub document_id: DocumentId,
    /// The `GROUP` access level's group id that caused the denial.
    pub group_id: String,
    /// `1 / (1 + distance)` at the moment of denial.
    pub similarity: f32,
    /// When the denial was observed.
    pub timestamp: Timestamp,
}

/// A bounded, non-blocking sink for [`DenialEvent`]s.
///
/// `observe` never blocks the caller: when the channel is full, the event is
/// dropped and `dropped_count` is incremented rather than applying
/// backpressure to the search path.
#[derive(Clone)]
pub struct DenialSink {
    sender: Sender<DenialEvent>,
    dropped: Arc<AtomicU64>,
}

impl DenialSink {
    /// Creates a sink with the given channel capacity, returning the sink and
    /// the receiving half a background consumer should drain.
    pub fn new(capacity: usize) -> (Self, Receiver<DenialEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Enqueues a denial event. Drops it silently (after incrementing the
    /// drop counter and logging at `warn`) if the channel is full or the
    /// receiving end has been dropped.
    pub fn observe(&self, event: DenialEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("denial sink full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Total events dropped since this sink (or a clone sharing its counter)
    /// was created.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> DenialEvent {
        DenialEvent {
            tenant_id: TenantId::new(),
            user_id: "u1".to_string(),
            query_text: "roadmap".to_string(),
            chunk_id: ChunkId::new(),
            document_id: DocumentId::new(),
            group_id: "g1".to_string(),
            similarity: 0.5,
            timestamp: Timestamp::now(),
        }
    }

    #[test]
    fn observe_delivers_to_receiver() {
        let (sink, rx) = DenialSink::new(4);
        sink.observe(event());
        let received = rx.try_recv().unwrap();
        assert_eq!(received.user_id, "u1");
        assert_eq!(sink.dropped_count(), 0);
    }

    #[test]
    fn observe_drops_when_full_without_blocking() {
        let (sink, _rx) = DenialSink::new(1);
        sink.observe(event());
        sink.observe(event());
        assert_eq!(sink.dropped_count(), 1);
    }

    #[test]
    fn observe_after_receiver_dropped_increments_counter() {
        let (sink, rx) = DenialSink::new(1);
        drop(rx);
        sink.observe(event());
        assert_eq!(sink.dropped_count(), 1);
    }
}
