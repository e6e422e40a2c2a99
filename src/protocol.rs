//! Message protocols spoken between an entity and its journal and snapshot
//! store.
//!
//! The entity never shares memory with either collaborator: every
//! interaction is a request enum sent over a channel, with responses routed
//! back through a [`JournalReplyTo`]/[`SnapshotReplyTo`] handle that the
//! request carries. Journal and snapshot store implementations only need to
//! consume [`JournalRequest`]/[`SnapshotRequest`] values and answer on the
//! supplied reply handle; [`crate::MemoryJournal`] is the in-process
//! reference implementation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::mpsc;

use crate::error::{JournalError, SnapshotError};

/// A single event record as written to and replayed from the journal.
///
/// Created with placeholder identity fields when the event is emitted from a
/// command callback; the persistence id, sequence number, and writer uuid
/// are stamped only when the record moves into an outgoing write batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "E: Serialize", deserialize = "E: DeserializeOwned"))]
pub struct PersistentRepr<E> {
    /// The user event payload.
    pub payload: E,
    /// Journal partition key of the owning entity. Empty until finalized.
    pub persistence_id: String,
    /// Position in the entity's event stream. Zero until finalized.
    pub sequence_nr: u64,
    /// Identifies the writer incarnation that produced this record.
    /// Stamped on write, replayed verbatim, never verified.
    pub writer_uuid: String,
}

impl<E> PersistentRepr<E> {
    /// A record with placeholder identity, as emitted from a callback.
    pub(crate) fn new(payload: E) -> Self {
        Self {
            payload,
            persistence_id: String::new(),
            sequence_nr: 0,
            writer_uuid: String::new(),
        }
    }

    /// Stamp the identity fields assigned at batch-flush time.
    pub(crate) fn finalize(&mut self, persistence_id: &str, sequence_nr: u64, writer_uuid: &str) {
        self.persistence_id = persistence_id.to_string();
        self.sequence_nr = sequence_nr;
        self.writer_uuid = writer_uuid.to_string();
    }
}

/// An ordered, non-empty group of records written all-or-nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "E: Serialize", deserialize = "E: DeserializeOwned"))]
pub struct AtomicWrite<E> {
    /// The records of this write, in emission order.
    pub records: Vec<PersistentRepr<E>>,
}

/// One element of a write batch: either an atomic write of durable records,
/// or a non-persistent loopback payload that the journal echoes back via
/// [`JournalResponse::LoopMessageSuccess`] to keep deferred callbacks in
/// FIFO order with surrounding writes.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<E> {
    /// Records to append durably.
    Write(AtomicWrite<E>),
    /// A defer payload with no journal effect beyond ordering.
    Loopback(E),
}

/// Requests an entity sends to a journal.
#[derive(Debug)]
pub enum JournalRequest<E> {
    /// Append a batch of envelopes. The journal answers with one terminal
    /// [`WriteMessagesSuccessful`](JournalResponse::WriteMessagesSuccessful)
    /// or [`WriteMessagesFailed`](JournalResponse::WriteMessagesFailed) per
    /// request, plus one per-record confirmation for each record.
    WriteMessages {
        /// Envelopes in submission order.
        envelopes: Vec<Envelope<E>>,
        /// Where confirmations are delivered.
        reply_to: JournalReplyTo<E>,
        /// Writer incarnation, echoed back on per-record confirmations.
        instance_id: u32,
    },

    /// Redeliver stored events for one entity, in sequence order.
    ReplayMessages {
        /// First sequence number to deliver (inclusive).
        from_sequence_nr: u64,
        /// Last sequence number to deliver (inclusive).
        to_sequence_nr: u64,
        /// Upper bound on the number of delivered events.
        max: u64,
        /// Which entity's stream to replay.
        persistence_id: String,
        /// Where [`ReplayedMessage`](JournalResponse::ReplayedMessage)s and
        /// the replay terminal are delivered.
        reply_to: JournalReplyTo<E>,
    },

    /// Delete all events with `sequence_nr <= to_sequence_nr`. The journal's
    /// high-water sequence mark must survive the deletion.
    DeleteMessagesTo {
        /// Which entity's stream to delete from.
        persistence_id: String,
        /// Upper bound (inclusive) of the deletion.
        to_sequence_nr: u64,
        /// Where the delete confirmation is delivered.
        reply_to: JournalReplyTo<E>,
    },
}

/// Responses a journal sends back to an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalResponse<E> {
    /// One record of a write batch is durably stored.
    WriteMessageSuccess {
        /// The stored record, identity fields included.
        record: PersistentRepr<E>,
        /// Writer incarnation the originating request carried.
        instance_id: u32,
    },

    /// The journal validated and refused one record. Nothing was written;
    /// this is a logical failure and the entity continues.
    WriteMessageRejected {
        /// The refused record.
        record: PersistentRepr<E>,
        /// Why the journal refused it.
        cause: JournalError,
        /// Writer incarnation the originating request carried.
        instance_id: u32,
    },

    /// Infrastructure failure writing one record; durability unknown.
    WriteMessageFailure {
        /// The record whose fate is unknown.
        record: PersistentRepr<E>,
        /// The underlying failure.
        cause: JournalError,
        /// Writer incarnation the originating request carried.
        instance_id: u32,
    },

    /// Echo of a [`Envelope::Loopback`] payload, delivered in order with
    /// the write confirmations around it.
    LoopMessageSuccess {
        /// The defer payload.
        payload: E,
        /// Writer incarnation the originating request carried.
        instance_id: u32,
    },

    /// Terminal for a [`JournalRequest::WriteMessages`] batch that was
    /// processed (individual records may still have been rejected).
    /// Carries no instance id and is always acted on.
    WriteMessagesSuccessful,

    /// Terminal for a batch that failed as a whole. The per-record
    /// [`WriteMessageFailure`](JournalResponse::WriteMessageFailure)s carry
    /// the consequences; this message itself is informational.
    WriteMessagesFailed {
        /// The underlying failure.
        cause: JournalError,
    },

    /// One replayed event.
    ReplayedMessage {
        /// The stored record, as originally written.
        record: PersistentRepr<E>,
    },

    /// Replay finished. `highest_sequence_nr` is the journal's high-water
    /// mark for the entity, which may exceed the last delivered event when
    /// replay was bounded.
    ReplayMessagesSuccess {
        /// The journal's highest stored sequence number for the entity.
        highest_sequence_nr: u64,
    },

    /// Replay failed; the entity cannot safely serve commands.
    ReplayMessagesFailure {
        /// The underlying failure.
        cause: JournalError,
    },

    /// A [`JournalRequest::DeleteMessagesTo`] completed.
    DeleteMessagesSuccess {
        /// Upper bound of the completed deletion.
        to_sequence_nr: u64,
    },

    /// A [`JournalRequest::DeleteMessagesTo`] failed. Non-fatal.
    DeleteMessagesFailure {
        /// The underlying failure.
        cause: JournalError,
        /// Upper bound of the attempted deletion.
        to_sequence_nr: u64,
    },
}

/// Bounds on which stored snapshot may be offered during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSelectionCriteria {
    /// Highest acceptable snapshot sequence number (inclusive).
    pub max_sequence_nr: u64,
    /// Lowest acceptable snapshot sequence number (inclusive).
    pub min_sequence_nr: u64,
}

impl SnapshotSelectionCriteria {
    /// Accept any snapshot; the store picks the latest. The default.
    pub fn latest() -> Self {
        Self {
            max_sequence_nr: u64::MAX,
            min_sequence_nr: 0,
        }
    }

    /// Accept no snapshot: recovery replays the full event stream.
    pub fn none() -> Self {
        Self {
            max_sequence_nr: 0,
            min_sequence_nr: 0,
        }
    }

    /// Whether a snapshot taken at `sequence_nr` satisfies the criteria.
    pub fn matches(&self, sequence_nr: u64) -> bool {
        sequence_nr >= self.min_sequence_nr && sequence_nr <= self.max_sequence_nr
    }
}

impl Default for SnapshotSelectionCriteria {
    fn default() -> Self {
        Self::latest()
    }
}

/// Identity of a stored snapshot: whose state it is and how many events
/// had been applied when it was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// The entity the snapshot belongs to.
    pub persistence_id: String,
    /// Sequence number of the last event folded into the snapshot.
    pub sequence_nr: u64,
}

/// A snapshot selected by the store for recovery, paired with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedSnapshot<S> {
    /// Identity of the snapshot.
    pub metadata: SnapshotMetadata,
    /// The stored state.
    pub snapshot: S,
}

/// Requests an entity sends to a snapshot store.
#[derive(Debug)]
pub enum SnapshotRequest<S> {
    /// Load the best stored snapshot matching the criteria, if any.
    LoadSnapshot {
        /// Which entity's snapshot to load.
        persistence_id: String,
        /// Bounds on acceptable snapshots.
        criteria: SnapshotSelectionCriteria,
        /// Upper bound on the snapshot sequence number; echoed back on the
        /// result so the entity knows where replay should stop.
        to_sequence_nr: u64,
        /// Where the result is delivered.
        reply_to: SnapshotReplyTo<S>,
    },

    /// Store a snapshot of the entity's state.
    SaveSnapshot {
        /// Identity of the snapshot.
        metadata: SnapshotMetadata,
        /// The state to store.
        snapshot: S,
        /// Where the save confirmation is delivered.
        reply_to: SnapshotReplyTo<S>,
    },
}

/// Responses a snapshot store sends back to an entity.
#[derive(Debug, Clone)]
pub enum SnapshotResponse<S> {
    /// Result of a [`SnapshotRequest::LoadSnapshot`]. `None` means no
    /// stored snapshot matched and recovery starts from the beginning of
    /// the event stream.
    LoadSnapshotResult {
        /// The selected snapshot, if any.
        snapshot: Option<SelectedSnapshot<S>>,
        /// Echo of the request's `to_sequence_nr`.
        to_sequence_nr: u64,
    },

    /// A [`SnapshotRequest::SaveSnapshot`] completed.
    SaveSnapshotSuccess {
        /// Identity of the stored snapshot.
        metadata: SnapshotMetadata,
    },

    /// A [`SnapshotRequest::SaveSnapshot`] failed. Non-fatal.
    SaveSnapshotFailure {
        /// Identity of the snapshot that was not stored.
        metadata: SnapshotMetadata,
        /// The underlying failure.
        cause: SnapshotError,
    },
}

/// Delivery handle for journal responses, carried inside each request.
///
/// Wraps an arbitrary delivery closure rather than a concrete channel so a
/// journal implementation never learns the entity's mailbox type. Delivery
/// to a stopped entity is a silent no-op.
pub struct JournalReplyTo<E>(Arc<dyn Fn(JournalResponse<E>) + Send + Sync>);

impl<E> JournalReplyTo<E> {
    /// Build a reply handle from a delivery closure.
    pub fn new(deliver: impl Fn(JournalResponse<E>) + Send + Sync + 'static) -> Self {
        Self(Arc::new(deliver))
    }

    /// Deliver a response to the requesting entity.
    pub fn send(&self, response: JournalResponse<E>) {
        (self.0)(response);
    }
}

impl<E> Clone for JournalReplyTo<E> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<E> fmt::Debug for JournalReplyTo<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JournalReplyTo(..)")
    }
}

/// Delivery handle for snapshot-store responses. See [`JournalReplyTo`].
pub struct SnapshotReplyTo<S>(Arc<dyn Fn(SnapshotResponse<S>) + Send + Sync>);

impl<S> SnapshotReplyTo<S> {
    /// Build a reply handle from a delivery closure.
    pub fn new(deliver: impl Fn(SnapshotResponse<S>) + Send + Sync + 'static) -> Self {
        Self(Arc::new(deliver))
    }

    /// Deliver a response to the requesting entity.
    pub fn send(&self, response: SnapshotResponse<S>) {
        (self.0)(response);
    }
}

impl<S> Clone for SnapshotReplyTo<S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<S> fmt::Debug for SnapshotReplyTo<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SnapshotReplyTo(..)")
    }
}

/// Sending half of a journal's request channel.
///
/// Every entity writing to the journal holds its own clone; they all feed
/// the same journal task.
pub struct JournalClient<E> {
    sender: mpsc::UnboundedSender<JournalRequest<E>>,
}

impl<E> JournalClient<E> {
    /// Wrap the sending half of a journal's request channel.
    pub fn new(sender: mpsc::UnboundedSender<JournalRequest<E>>) -> Self {
        Self { sender }
    }

    /// Create a fresh request channel, returning the client and the
    /// receiving half a journal implementation consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JournalRequest<E>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }

    /// Submit a request to the journal.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Unavailable`] if the journal task has exited.
    pub fn send(&self, request: JournalRequest<E>) -> Result<(), JournalError> {
        self.sender
            .send(request)
            .map_err(|_| JournalError::Unavailable)
    }
}

// Not derived: deriving would put an `E: Clone` bound on the impl, and the
// event type plays no part in copying the sending half of a channel.
impl<E> Clone for JournalClient<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E> fmt::Debug for JournalClient<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JournalClient(..)")
    }
}

/// Sending half of a snapshot store's request channel. See [`JournalClient`].
pub struct SnapshotClient<S> {
    sender: mpsc::UnboundedSender<SnapshotRequest<S>>,
}

impl<S> SnapshotClient<S> {
    /// Wrap the sending half of a snapshot store's request channel.
    pub fn new(sender: mpsc::UnboundedSender<SnapshotRequest<S>>) -> Self {
        Self { sender }
    }

    /// Create a fresh request channel, returning the client and the
    /// receiving half a store implementation consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SnapshotRequest<S>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }

    /// Submit a request to the snapshot store.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Unavailable`] if the store task has exited.
    pub fn send(&self, request: SnapshotRequest<S>) -> Result<(), SnapshotError> {
        self.sender
            .send(request)
            .map_err(|_| SnapshotError::Unavailable)
    }
}

impl<S> Clone for SnapshotClient<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S> fmt::Debug for SnapshotClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SnapshotClient(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_starts_with_placeholder_identity() {
        let repr = PersistentRepr::new("payload".to_string());
        assert_eq!(repr.persistence_id, "");
        assert_eq!(repr.sequence_nr, 0);
        assert_eq!(repr.writer_uuid, "");
    }

    #[test]
    fn finalize_stamps_identity() {
        let mut repr = PersistentRepr::new("payload".to_string());
        repr.finalize("order-7", 42, "writer-a");
        assert_eq!(repr.persistence_id, "order-7");
        assert_eq!(repr.sequence_nr, 42);
        assert_eq!(repr.writer_uuid, "writer-a");
    }

    #[test]
    fn repr_serde_roundtrip() {
        let mut repr = PersistentRepr::new("payload".to_string());
        repr.finalize("order-7", 3, "writer-a");

        let json = serde_json::to_string(&repr).expect("serialization should succeed");
        let back: PersistentRepr<String> =
            serde_json::from_str(&json).expect("deserialization should succeed");

        assert_eq!(back, repr);
    }

    #[test]
    fn criteria_latest_matches_everything() {
        let criteria = SnapshotSelectionCriteria::latest();
        assert!(criteria.matches(1));
        assert!(criteria.matches(u64::MAX));
    }

    #[test]
    fn criteria_none_matches_no_stored_snapshot() {
        // Stored snapshots always have sequence_nr >= 1.
        let criteria = SnapshotSelectionCriteria::none();
        assert!(!criteria.matches(1));
        assert!(!criteria.matches(100));
    }

    #[test]
    fn criteria_bounds_are_inclusive() {
        let criteria = SnapshotSelectionCriteria {
            max_sequence_nr: 10,
            min_sequence_nr: 5,
        };
        assert!(criteria.matches(5));
        assert!(criteria.matches(10));
        assert!(!criteria.matches(4));
        assert!(!criteria.matches(11));
    }

    #[test]
    fn reply_to_invokes_delivery_closure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply_to = JournalReplyTo::new(move |response| {
            let _ = tx.send(response);
        });

        reply_to.send(JournalResponse::<String>::WriteMessagesSuccessful);

        assert_eq!(
            rx.try_recv().expect("response should be delivered"),
            JournalResponse::WriteMessagesSuccessful
        );
    }

    #[test]
    fn client_send_after_receiver_drop_is_unavailable() {
        let (client, receiver) = JournalClient::<String>::channel();
        drop(receiver);

        let result = client.send(JournalRequest::DeleteMessagesTo {
            persistence_id: "p".into(),
            to_sequence_nr: 1,
            reply_to: JournalReplyTo::new(|_| {}),
        });

        assert_eq!(result, Err(JournalError::Unavailable));
    }

    #[test]
    fn snapshot_client_send_after_receiver_drop_is_unavailable() {
        let (client, receiver) = SnapshotClient::<u64>::channel();
        drop(receiver);

        let result = client.send(SnapshotRequest::LoadSnapshot {
            persistence_id: "p".into(),
            criteria: SnapshotSelectionCriteria::latest(),
            to_sequence_nr: u64::MAX,
            reply_to: SnapshotReplyTo::new(|_| {}),
        });

        assert_eq!(result, Err(SnapshotError::Unavailable));
    }
}
