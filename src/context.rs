//! Per-entity persistence context: sequence counters, the outgoing batches,
//! and the persist API surface exposed to command callbacks.
//!
//! The context owns everything a callback may touch: the user state (via
//! `Deref`), the pending-invocation queue, and the two-stage write batch.
//! Events accumulate in `event_batch` while a callback runs; the flush
//! procedure stamps identity onto each record and moves it into
//! `journal_batch`, which is what actually goes to the journal -- at most
//! one submission in flight, except when the batch-size cap forces an
//! eager one.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use uuid::Uuid;

use crate::entity::PersistentEntity;
use crate::invocations::PendingInvocations;
use crate::protocol::{
    AtomicWrite, Envelope, JournalClient, JournalReplyTo, JournalRequest, PersistentRepr,
    SnapshotClient, SnapshotMetadata, SnapshotReplyTo, SnapshotRequest,
};

/// Process-wide incarnation counter. Each context construction takes the
/// next value, letting the entity discard journal replies addressed to a
/// previous incarnation of itself. Starts at 1 so 0 is never a live id;
/// wraparound is harmless because it cannot happen within a single journal
/// round-trip.
static INSTANCE_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

fn next_instance_id() -> u32 {
    INSTANCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// The persistence context handed to [`receive_command`] and to persist
/// handlers.
///
/// Derefs to the entity state `A`, so `ctx.some_field` reads and writes the
/// user's own state directly. The persist operations live here -- and only
/// here, which is what makes them callable exactly from command callbacks
/// and persist handlers, never from replay.
///
/// [`receive_command`]: crate::PersistentEntity::receive_command
pub struct EntityContext<A: PersistentEntity> {
    pub(crate) entity: A,
    pub(crate) persistence_id: String,
    pub(crate) instance_id: u32,
    writer_uuid: String,
    /// Next-to-assign counter; set to the journal's high-water mark at the
    /// end of replay, incremented once per record moved into the batch.
    sequence_nr: u64,
    /// Highest sequence number observed during replay or write
    /// confirmation. Never decreases.
    last_sequence_nr: u64,
    pub(crate) pending: PendingInvocations<A>,
    /// Envelopes emitted by the callback currently running.
    pub(crate) event_batch: Vec<Envelope<A::Event>>,
    /// Envelopes staged for the next journal submission.
    pub(crate) journal_batch: Vec<Envelope<A::Event>>,
    pub(crate) write_in_progress: bool,
    max_message_batch_size: usize,
    journal: JournalClient<A::Event>,
    snapshots: SnapshotClient<A::Snapshot>,
    journal_reply_to: JournalReplyTo<A::Event>,
    snapshot_reply_to: SnapshotReplyTo<A::Snapshot>,
    /// Set when a journal submission finds the request channel closed;
    /// the entity stops at the next dispatch point (durability unknown).
    pub(crate) journal_gone: bool,
}

impl<A: PersistentEntity> EntityContext<A> {
    pub(crate) fn new(
        entity: A,
        journal: JournalClient<A::Event>,
        snapshots: SnapshotClient<A::Snapshot>,
        journal_reply_to: JournalReplyTo<A::Event>,
        snapshot_reply_to: SnapshotReplyTo<A::Snapshot>,
        max_message_batch_size: usize,
    ) -> Self {
        let persistence_id = entity.persistence_id();
        Self {
            entity,
            persistence_id,
            instance_id: next_instance_id(),
            writer_uuid: Uuid::new_v4().to_string(),
            sequence_nr: 0,
            last_sequence_nr: 0,
            pending: PendingInvocations::new(),
            event_batch: Vec::new(),
            journal_batch: Vec::new(),
            write_in_progress: false,
            max_message_batch_size,
            journal,
            snapshots,
            journal_reply_to,
            snapshot_reply_to,
            journal_gone: false,
        }
    }

    /// The entity's stable journal and snapshot key.
    pub fn persistence_id(&self) -> &str {
        &self.persistence_id
    }

    /// Highest sequence number observed so far. Inside a persist handler
    /// this is the sequence number of the event being confirmed.
    pub fn last_sequence_nr(&self) -> u64 {
        self.last_sequence_nr
    }

    /// A borrow of the entity state. Equivalent to the `Deref` impl.
    pub fn state(&self) -> &A {
        &self.entity
    }

    /// A mutable borrow of the entity state.
    pub fn state_mut(&mut self) -> &mut A {
        &mut self.entity
    }

    /// Persist one event, deferring all further commands until `handler`
    /// has run.
    ///
    /// Between this call returning and `handler` running, no new command
    /// enters [`receive_command`]: intervening messages are stashed and
    /// redelivered afterwards. Multiple `persist` calls within one command
    /// compose -- every handler runs before the next command.
    ///
    /// [`receive_command`]: crate::PersistentEntity::receive_command
    pub fn persist<F>(&mut self, event: A::Event, handler: F)
    where
        F: FnOnce(&mut EntityContext<A>, A::Event) -> Result<(), A::Error> + Send + 'static,
    {
        self.pending.push_stashing(Box::new(handler));
        self.event_batch.push(Envelope::Write(AtomicWrite {
            records: vec![PersistentRepr::new(event)],
        }));
    }

    /// Persist several events in one atomic write, with the command-deferral
    /// guarantee of [`persist`](Self::persist). The handler runs once per
    /// event, in order. An empty `events` is a no-op.
    pub fn persist_all<F>(&mut self, events: Vec<A::Event>, handler: F)
    where
        F: Fn(&mut EntityContext<A>, A::Event) -> Result<(), A::Error> + Send + Sync + 'static,
    {
        if events.is_empty() {
            return;
        }
        let handler = Arc::new(handler);
        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let handler = Arc::clone(&handler);
            self.pending
                .push_stashing(Box::new(move |ctx, event| handler(ctx, event)));
            records.push(PersistentRepr::new(event));
        }
        self.event_batch
            .push(Envelope::Write(AtomicWrite { records }));
    }

    /// Persist one event without deferring commands: messages received
    /// before `handler` runs are processed normally. Handlers still run in
    /// submission order across all persist flavors.
    pub fn persist_async<F>(&mut self, event: A::Event, handler: F)
    where
        F: FnOnce(&mut EntityContext<A>, A::Event) -> Result<(), A::Error> + Send + 'static,
    {
        self.pending.push_async(Box::new(handler));
        self.event_batch.push(Envelope::Write(AtomicWrite {
            records: vec![PersistentRepr::new(event)],
        }));
    }

    /// Persist several events in one atomic write without deferring
    /// commands. The handler runs once per event, in order. An empty
    /// `events` is a no-op.
    pub fn persist_all_async<F>(&mut self, events: Vec<A::Event>, handler: F)
    where
        F: Fn(&mut EntityContext<A>, A::Event) -> Result<(), A::Error> + Send + Sync + 'static,
    {
        if events.is_empty() {
            return;
        }
        let handler = Arc::new(handler);
        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let handler = Arc::clone(&handler);
            self.pending
                .push_async(Box::new(move |ctx, event| handler(ctx, event)));
            records.push(PersistentRepr::new(event));
        }
        self.event_batch
            .push(Envelope::Write(AtomicWrite { records }));
    }

    /// Run `handler` after every handler for events persisted before this
    /// call, without persisting anything.
    ///
    /// With no persists outstanding the handler runs synchronously, inside
    /// this call. Otherwise the payload is bounced through the journal as a
    /// loopback envelope so FIFO order with surrounding writes holds.
    ///
    /// # Errors
    ///
    /// Propagates the handler's error when it runs synchronously.
    pub fn defer_async<F>(&mut self, event: A::Event, handler: F) -> Result<(), A::Error>
    where
        F: FnOnce(&mut EntityContext<A>, A::Event) -> Result<(), A::Error> + Send + 'static,
    {
        if self.pending.is_empty() {
            handler(self, event)
        } else {
            self.pending.push_async(Box::new(handler));
            self.event_batch.push(Envelope::Loopback(event));
            Ok(())
        }
    }

    /// Ask the journal to delete all events up to and including
    /// `to_sequence_nr`. Fire-and-forget; the outcome arrives through
    /// [`on_delete_messages_success`] / [`on_delete_messages_failure`].
    ///
    /// [`on_delete_messages_success`]: crate::PersistentEntity::on_delete_messages_success
    /// [`on_delete_messages_failure`]: crate::PersistentEntity::on_delete_messages_failure
    pub fn delete_messages(&mut self, to_sequence_nr: u64) {
        let request = JournalRequest::DeleteMessagesTo {
            persistence_id: self.persistence_id.clone(),
            to_sequence_nr,
            reply_to: self.journal_reply_to.clone(),
        };
        if self.journal.send(request).is_err() {
            self.journal_gone = true;
        }
    }

    /// Store a snapshot of the entity's state at the current
    /// `last_sequence_nr`. Fire-and-forget; the outcome arrives through
    /// [`on_snapshot_saved`] / [`on_snapshot_save_failure`].
    ///
    /// [`on_snapshot_saved`]: crate::PersistentEntity::on_snapshot_saved
    /// [`on_snapshot_save_failure`]: crate::PersistentEntity::on_snapshot_save_failure
    pub fn save_snapshot(&mut self, snapshot: A::Snapshot) {
        let metadata = SnapshotMetadata {
            persistence_id: self.persistence_id.clone(),
            sequence_nr: self.last_sequence_nr,
        };
        let request = SnapshotRequest::SaveSnapshot {
            metadata: metadata.clone(),
            snapshot,
            reply_to: self.snapshot_reply_to.clone(),
        };
        if let Err(cause) = self.snapshots.send(request) {
            self.entity.on_snapshot_save_failure(&metadata, &cause);
        }
    }

    pub(crate) fn update_last_sequence_nr(&mut self, sequence_nr: u64) {
        if sequence_nr > self.last_sequence_nr {
            self.last_sequence_nr = sequence_nr;
        }
    }

    pub(crate) fn set_last_sequence_nr(&mut self, sequence_nr: u64) {
        self.last_sequence_nr = sequence_nr;
    }

    /// Both counters jump to the journal's high-water mark when replay
    /// finishes, whether or not any event was delivered.
    pub(crate) fn set_counters_after_replay(&mut self, highest_sequence_nr: u64) {
        self.sequence_nr = highest_sequence_nr;
        self.last_sequence_nr = highest_sequence_nr;
    }

    fn next_sequence_nr(&mut self) -> u64 {
        self.sequence_nr += 1;
        self.sequence_nr
    }

    /// Move the callback's emitted envelopes into the journal batch,
    /// stamping identity onto each record, and pace submissions.
    ///
    /// A stashing persist must land in its own atomic submission, not
    /// coalesced with earlier async events, so any staged envelopes are
    /// submitted first when a stashing invocation is pending. After that,
    /// each envelope is staged and the batch submitted as soon as no write
    /// is in flight -- or immediately when the batch hits the size cap,
    /// even with one in flight.
    pub(crate) fn flush_batch(&mut self) {
        if self.pending.stashing_count() > 0 && !self.journal_batch.is_empty() {
            self.submit_journal_batch();
        }
        for envelope in std::mem::take(&mut self.event_batch) {
            let envelope = match envelope {
                Envelope::Write(mut write) => {
                    for record in &mut write.records {
                        let sequence_nr = self.next_sequence_nr();
                        record.finalize(&self.persistence_id, sequence_nr, &self.writer_uuid);
                    }
                    Envelope::Write(write)
                }
                loopback @ Envelope::Loopback(_) => loopback,
            };
            self.journal_batch.push(envelope);
            if !self.write_in_progress
                || self.journal_batch.len() >= self.max_message_batch_size
            {
                self.submit_journal_batch();
            }
        }
    }

    /// Submit whatever is staged, if anything. Called when the journal
    /// acknowledges a batch and on restart, so staged writes are never
    /// stranded.
    pub(crate) fn flush_journal_batch(&mut self) {
        if !self.journal_batch.is_empty() {
            self.submit_journal_batch();
        }
    }

    /// The journal finished a batch: hand it the next one, or go idle.
    pub(crate) fn on_write_batch_acknowledged(&mut self) {
        if self.journal_batch.is_empty() {
            self.write_in_progress = false;
        } else {
            self.submit_journal_batch();
        }
    }

    fn submit_journal_batch(&mut self) {
        let envelopes = std::mem::take(&mut self.journal_batch);
        tracing::debug!(
            persistence_id = %self.persistence_id,
            envelopes = envelopes.len(),
            "submitting write batch"
        );
        let request = JournalRequest::WriteMessages {
            envelopes,
            reply_to: self.journal_reply_to.clone(),
            instance_id: self.instance_id,
        };
        if self.journal.send(request).is_err() {
            self.journal_gone = true;
        }
        self.write_in_progress = true;
    }
}

impl<A: PersistentEntity> Deref for EntityContext<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.entity
    }
}

impl<A: PersistentEntity> DerefMut for EntityContext<A> {
    fn deref_mut(&mut self) -> &mut A {
        &mut self.entity
    }
}
