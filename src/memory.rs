//! In-memory journal and snapshot store.
//!
//! Both run as plain Tokio tasks consuming the request channels from
//! [`crate::protocol`], which makes them drop-in plugins for embedding and
//! the reference peers for entity tests. Nothing survives the process;
//! durability here means "ordered and acknowledged", not "on disk".
//!
//! The builders can inject failures per request kind so tests can exercise
//! the whole failure taxonomy: per-record write outcomes, replay failures,
//! delete failures, and snapshot save failures.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{JournalError, SnapshotError};
use crate::protocol::{
    Envelope, JournalClient, JournalRequest, JournalResponse, PersistentRepr, SelectedSnapshot,
    SnapshotClient, SnapshotRequest, SnapshotResponse,
};

/// Verdict for one record offered to the journal.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    /// Store the record and confirm it.
    Accept,
    /// Refuse the record (and its whole atomic write) without storing it.
    /// The entity continues.
    Reject(JournalError),
    /// Fail the entire batch as an infrastructure error. The entity stops.
    Fail(JournalError),
}

type OutcomeFn<E> = Arc<dyn Fn(&E) -> WriteOutcome + Send + Sync>;

/// Configures and spawns a [`MemoryJournal`] task.
pub struct MemoryJournalBuilder<E> {
    write_outcome: Option<OutcomeFn<E>>,
    replay_failure: Option<JournalError>,
    delete_failure: Option<JournalError>,
}

impl<E: Clone + Send + 'static> MemoryJournalBuilder<E> {
    /// Decide per record whether a write is accepted, rejected, or failed.
    /// The default accepts everything.
    pub fn write_outcome(
        mut self,
        outcome: impl Fn(&E) -> WriteOutcome + Send + Sync + 'static,
    ) -> Self {
        self.write_outcome = Some(Arc::new(outcome));
        self
    }

    /// Answer every replay request with the given failure.
    pub fn replay_failure(mut self, cause: JournalError) -> Self {
        self.replay_failure = Some(cause);
        self
    }

    /// Answer every delete request with the given failure.
    pub fn delete_failure(mut self, cause: JournalError) -> Self {
        self.delete_failure = Some(cause);
        self
    }

    /// Spawn the journal task onto the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn(self) -> JournalClient<E> {
        let (client, requests) = JournalClient::channel();
        tokio::spawn(run_journal(requests, self));
        client
    }
}

/// An append-only in-process journal, one event stream per persistence id.
///
/// Write batches are processed strictly in arrival order and confirmed the
/// way the entity's write pipeline expects: the batch terminal first, then
/// one confirmation per record. The high-water sequence mark survives
/// deletion, so a recovered entity never reuses sequence numbers.
pub struct MemoryJournal;

impl MemoryJournal {
    /// A builder for a journal with injected outcomes.
    pub fn builder<E: Clone + Send + 'static>() -> MemoryJournalBuilder<E> {
        MemoryJournalBuilder {
            write_outcome: None,
            replay_failure: None,
            delete_failure: None,
        }
    }

    /// Spawn a journal that accepts everything.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn<E: Clone + Send + 'static>() -> JournalClient<E> {
        Self::builder().spawn()
    }
}

struct JournalState<E> {
    streams: HashMap<String, Vec<PersistentRepr<E>>>,
    highest: HashMap<String, u64>,
}

async fn run_journal<E: Clone + Send + 'static>(
    mut requests: mpsc::UnboundedReceiver<JournalRequest<E>>,
    options: MemoryJournalBuilder<E>,
) {
    let mut state = JournalState {
        streams: HashMap::new(),
        highest: HashMap::new(),
    };
    while let Some(request) = requests.recv().await {
        match request {
            JournalRequest::WriteMessages {
                envelopes,
                reply_to,
                instance_id,
            } => write_messages(&mut state, &options, envelopes, &reply_to, instance_id),
            JournalRequest::ReplayMessages {
                from_sequence_nr,
                to_sequence_nr,
                max,
                persistence_id,
                reply_to,
            } => replay_messages(
                &state,
                &options,
                from_sequence_nr,
                to_sequence_nr,
                max,
                &persistence_id,
                &reply_to,
            ),
            JournalRequest::DeleteMessagesTo {
                persistence_id,
                to_sequence_nr,
                reply_to,
            } => {
                if let Some(cause) = &options.delete_failure {
                    reply_to.send(JournalResponse::DeleteMessagesFailure {
                        cause: cause.clone(),
                        to_sequence_nr,
                    });
                    continue;
                }
                if let Some(stream) = state.streams.get_mut(&persistence_id) {
                    stream.retain(|record| record.sequence_nr > to_sequence_nr);
                }
                tracing::debug!(%persistence_id, to_sequence_nr, "deleted events");
                reply_to.send(JournalResponse::DeleteMessagesSuccess { to_sequence_nr });
            }
        }
    }
}

fn outcome_for<E>(options: &MemoryJournalBuilder<E>, payload: &E) -> WriteOutcome {
    match &options.write_outcome {
        Some(decide) => decide(payload),
        None => WriteOutcome::Accept,
    }
}

fn write_messages<E: Clone>(
    state: &mut JournalState<E>,
    options: &MemoryJournalBuilder<E>,
    envelopes: Vec<Envelope<E>>,
    reply_to: &crate::protocol::JournalReplyTo<E>,
    instance_id: u32,
) {
    // An infrastructure failure anywhere fails the whole batch.
    let batch_failure = envelopes.iter().find_map(|envelope| match envelope {
        Envelope::Write(write) => write.records.iter().find_map(|record| {
            match outcome_for(options, &record.payload) {
                WriteOutcome::Fail(cause) => Some(cause),
                _ => None,
            }
        }),
        Envelope::Loopback(_) => None,
    });
    if let Some(cause) = batch_failure {
        reply_to.send(JournalResponse::WriteMessagesFailed {
            cause: cause.clone(),
        });
        for envelope in envelopes {
            match envelope {
                Envelope::Write(write) => {
                    for record in write.records {
                        reply_to.send(JournalResponse::WriteMessageFailure {
                            record,
                            cause: cause.clone(),
                            instance_id,
                        });
                    }
                }
                Envelope::Loopback(payload) => {
                    reply_to.send(JournalResponse::LoopMessageSuccess {
                        payload,
                        instance_id,
                    });
                }
            }
        }
        return;
    }

    reply_to.send(JournalResponse::WriteMessagesSuccessful);
    for envelope in envelopes {
        match envelope {
            Envelope::Write(write) => {
                // Rejection is atomic: one refused record refuses the
                // whole write, and none of it is stored.
                let rejection = write.records.iter().find_map(|record| {
                    match outcome_for(options, &record.payload) {
                        WriteOutcome::Reject(cause) => Some(cause),
                        _ => None,
                    }
                });
                match rejection {
                    Some(cause) => {
                        for record in write.records {
                            reply_to.send(JournalResponse::WriteMessageRejected {
                                record,
                                cause: cause.clone(),
                                instance_id,
                            });
                        }
                    }
                    None => {
                        for record in write.records {
                            let stream =
                                state.streams.entry(record.persistence_id.clone()).or_default();
                            let mark =
                                state.highest.entry(record.persistence_id.clone()).or_insert(0);
                            if record.sequence_nr > *mark {
                                *mark = record.sequence_nr;
                            }
                            stream.push(record.clone());
                            reply_to.send(JournalResponse::WriteMessageSuccess {
                                record,
                                instance_id,
                            });
                        }
                    }
                }
            }
            Envelope::Loopback(payload) => {
                reply_to.send(JournalResponse::LoopMessageSuccess {
                    payload,
                    instance_id,
                });
            }
        }
    }
}

fn replay_messages<E: Clone>(
    state: &JournalState<E>,
    options: &MemoryJournalBuilder<E>,
    from_sequence_nr: u64,
    to_sequence_nr: u64,
    max: u64,
    persistence_id: &str,
    reply_to: &crate::protocol::JournalReplyTo<E>,
) {
    if let Some(cause) = &options.replay_failure {
        reply_to.send(JournalResponse::ReplayMessagesFailure {
            cause: cause.clone(),
        });
        return;
    }
    let mut delivered: u64 = 0;
    if let Some(stream) = state.streams.get(persistence_id) {
        for record in stream {
            if record.sequence_nr < from_sequence_nr || record.sequence_nr > to_sequence_nr {
                continue;
            }
            if delivered >= max {
                break;
            }
            reply_to.send(JournalResponse::ReplayedMessage {
                record: record.clone(),
            });
            delivered += 1;
        }
    }
    let highest_sequence_nr = state.highest.get(persistence_id).copied().unwrap_or(0);
    tracing::debug!(
        persistence_id,
        delivered,
        highest_sequence_nr,
        "replay finished"
    );
    reply_to.send(JournalResponse::ReplayMessagesSuccess {
        highest_sequence_nr,
    });
}

/// Configures and spawns a [`MemorySnapshotStore`] task.
pub struct MemorySnapshotStoreBuilder {
    save_failure: Option<SnapshotError>,
}

impl MemorySnapshotStoreBuilder {
    /// Answer every save request with the given failure.
    pub fn save_failure(mut self, cause: SnapshotError) -> Self {
        self.save_failure = Some(cause);
        self
    }

    /// Spawn the snapshot store task onto the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn<S: Clone + Send + 'static>(self) -> SnapshotClient<S> {
        let (client, requests) = SnapshotClient::channel();
        tokio::spawn(run_snapshot_store(requests, self));
        client
    }
}

/// An in-process snapshot store keeping every saved snapshot per
/// persistence id and serving the newest one that matches the load
/// criteria.
pub struct MemorySnapshotStore;

impl MemorySnapshotStore {
    /// A builder for a store with injected failures.
    pub fn builder() -> MemorySnapshotStoreBuilder {
        MemorySnapshotStoreBuilder { save_failure: None }
    }

    /// Spawn a store that accepts everything.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn<S: Clone + Send + 'static>() -> SnapshotClient<S> {
        Self::builder().spawn()
    }
}

async fn run_snapshot_store<S: Clone + Send + 'static>(
    mut requests: mpsc::UnboundedReceiver<SnapshotRequest<S>>,
    options: MemorySnapshotStoreBuilder,
) {
    let mut stored: HashMap<String, Vec<(crate::protocol::SnapshotMetadata, S)>> = HashMap::new();
    while let Some(request) = requests.recv().await {
        match request {
            SnapshotRequest::LoadSnapshot {
                persistence_id,
                criteria,
                to_sequence_nr,
                reply_to,
            } => {
                let snapshot = stored.get(&persistence_id).and_then(|entries| {
                    entries
                        .iter()
                        .filter(|(metadata, _)| {
                            metadata.sequence_nr <= to_sequence_nr
                                && criteria.matches(metadata.sequence_nr)
                        })
                        .max_by_key(|(metadata, _)| metadata.sequence_nr)
                        .map(|(metadata, snapshot)| SelectedSnapshot {
                            metadata: metadata.clone(),
                            snapshot: snapshot.clone(),
                        })
                });
                reply_to.send(SnapshotResponse::LoadSnapshotResult {
                    snapshot,
                    to_sequence_nr,
                });
            }
            SnapshotRequest::SaveSnapshot {
                metadata,
                snapshot,
                reply_to,
            } => {
                if let Some(cause) = &options.save_failure {
                    reply_to.send(SnapshotResponse::SaveSnapshotFailure {
                        metadata,
                        cause: cause.clone(),
                    });
                    continue;
                }
                let entries = stored.entry(metadata.persistence_id.clone()).or_default();
                // A second save at the same sequence number replaces the first.
                entries.retain(|(existing, _)| existing.sequence_nr != metadata.sequence_nr);
                entries.push((metadata.clone(), snapshot));
                tracing::debug!(
                    persistence_id = %metadata.persistence_id,
                    sequence_nr = metadata.sequence_nr,
                    "snapshot saved"
                );
                reply_to.send(SnapshotResponse::SaveSnapshotSuccess { metadata });
            }
        }
    }
}
