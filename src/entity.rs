//! The `PersistentEntity` trait: the seam between user domain code and the
//! entity core.

use crate::context::EntityContext;
use crate::error::{JournalError, RecoveryFailure, SnapshotError};
use crate::protocol::{SnapshotMetadata, SnapshotSelectionCriteria};
use serde::{Deserialize, Serialize};

/// What the core delivers to [`receive_recover`](PersistentEntity::receive_recover)
/// while rebuilding state on startup.
#[derive(Debug)]
pub enum Recovered<E, S> {
    /// A previously saved snapshot, delivered at most once, before any event.
    SnapshotOffer {
        /// Identity of the snapshot.
        metadata: SnapshotMetadata,
        /// The stored state.
        snapshot: S,
    },
    /// One replayed event, in stream order.
    Event(E),
    /// Recovery is finished; delivered exactly once per incarnation, after
    /// all replayed events and before the first command.
    Completed,
}

/// How recovery should run for an entity: which snapshot to start from and
/// how far to replay.
///
/// The default recovers from the latest snapshot and replays the entire
/// remaining stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recovery {
    /// Bounds on the snapshot to start from.
    pub from_snapshot: SnapshotSelectionCriteria,
    /// Upper bound (inclusive) on replayed sequence numbers.
    pub to_sequence_nr: u64,
    /// Upper bound on the number of replayed events.
    pub replay_max: u64,
}

impl Recovery {
    /// Skip recovery entirely: no snapshot is loaded and no events are
    /// replayed. The entity starts empty but still learns the journal's
    /// high-water sequence mark, so new events are appended after the
    /// existing stream.
    pub fn none() -> Self {
        Self {
            from_snapshot: SnapshotSelectionCriteria::none(),
            to_sequence_nr: 0,
            replay_max: 0,
        }
    }
}

impl Default for Recovery {
    fn default() -> Self {
        Self {
            from_snapshot: SnapshotSelectionCriteria::latest(),
            to_sequence_nr: u64::MAX,
            replay_max: u64::MAX,
        }
    }
}

/// An event-sourced entity: handles commands by persisting events, rebuilds
/// its state from the journal on startup.
///
/// The implementing type itself is the entity's in-memory state.
///
/// # Associated Types
///
/// - `Command`: the messages this entity handles while live.
/// - `Event`: the facts it persists and recovers from.
/// - `Snapshot`: the state representation stored by the snapshot store.
/// - `Error`: failure type for callbacks; returning `Err` from a live
///   callback triggers the configured supervision strategy.
///
/// # Contract
///
/// - [`receive_command`](PersistentEntity::receive_command) decides: it may
///   inspect state and call the persist operations on the
///   [`EntityContext`], but must not assume an event is applied until the
///   corresponding persist handler runs.
/// - [`receive_recover`](PersistentEntity::receive_recover) folds: it must
///   deterministically apply snapshots and events to state, with no side
///   effects beyond the entity itself. It takes plain `&mut self`, so no
///   events can be emitted during replay.
/// - [`persistence_id`](PersistentEntity::persistence_id) must be stable
///   for the lifetime of the logical entity: it is the journal partition
///   key and the snapshot key.
pub trait PersistentEntity: Sized + Send + 'static {
    /// The messages this entity handles while live.
    type Command: Send + 'static;

    /// The facts this entity persists and recovers from.
    type Event: Clone + Send + 'static;

    /// State representation stored by the snapshot store.
    type Snapshot: Send + 'static;

    /// Failure type for callbacks.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Stable identity of this entity in the journal and snapshot store.
    fn persistence_id(&self) -> String;

    /// How recovery should run. Defaults to latest snapshot, full replay.
    fn recovery(&self) -> Recovery {
        Recovery::default()
    }

    /// Fold a recovered snapshot, event, or the completion signal into state.
    ///
    /// # Errors
    ///
    /// Returning `Err` aborts recovery: `on_replay_failure` fires and the
    /// entity stops without serving any command.
    fn receive_recover(
        &mut self,
        recovered: Recovered<Self::Event, Self::Snapshot>,
    ) -> Result<(), Self::Error>;

    /// Handle one command.
    ///
    /// The context derefs to the entity state and carries the persist
    /// operations; `ctx.persist(event, handler)` defers all further
    /// commands until `handler` has run, `ctx.persist_async` does not.
    ///
    /// # Errors
    ///
    /// Returning `Err` invokes the supervision strategy: by default the
    /// entity restarts and re-enters recovery.
    fn receive_command(
        ctx: &mut EntityContext<Self>,
        command: Self::Command,
    ) -> Result<(), Self::Error>;

    /// Called once when replay finishes, before `Recovered::Completed`.
    fn on_replay_success(&mut self) {}

    /// Called when recovery fails, with the replayed event in hand if the
    /// failure came from applying one. The entity stops afterwards.
    fn on_replay_failure(
        &mut self,
        cause: &RecoveryFailure<Self::Error>,
        event: Option<&Self::Event>,
    ) {
        let _ = event;
        tracing::error!(
            persistence_id = %self.persistence_id(),
            %cause,
            "recovery failed, entity will stop"
        );
    }

    /// Called when the journal rejects an event. The persist handler is
    /// never invoked for it and the entity continues.
    fn on_persist_rejected(&mut self, cause: &JournalError, event: &Self::Event, sequence_nr: u64) {
        let _ = event;
        tracing::warn!(
            persistence_id = %self.persistence_id(),
            sequence_nr,
            %cause,
            "journal rejected event, continuing without it"
        );
    }

    /// Called when the journal fails to write an event. Durability is
    /// unknown, so the entity stops afterwards.
    fn on_persist_failure(&mut self, cause: &JournalError, event: &Self::Event, sequence_nr: u64) {
        let _ = event;
        tracing::error!(
            persistence_id = %self.persistence_id(),
            sequence_nr,
            %cause,
            "event write failed, entity will stop"
        );
    }

    /// Called when a [`delete_messages`](EntityContext::delete_messages)
    /// request completes.
    fn on_delete_messages_success(&mut self, to_sequence_nr: u64) {
        tracing::debug!(
            persistence_id = %self.persistence_id(),
            to_sequence_nr,
            "events deleted"
        );
    }

    /// Called when a delete request fails. The entity continues.
    fn on_delete_messages_failure(&mut self, cause: &JournalError, to_sequence_nr: u64) {
        tracing::warn!(
            persistence_id = %self.persistence_id(),
            to_sequence_nr,
            %cause,
            "event deletion failed"
        );
    }

    /// Called when a [`save_snapshot`](EntityContext::save_snapshot)
    /// request completes.
    fn on_snapshot_saved(&mut self, metadata: &SnapshotMetadata) {
        tracing::debug!(
            persistence_id = %self.persistence_id(),
            sequence_nr = metadata.sequence_nr,
            "snapshot saved"
        );
    }

    /// Called when a snapshot save fails. The entity continues.
    fn on_snapshot_save_failure(&mut self, metadata: &SnapshotMetadata, cause: &SnapshotError) {
        tracing::warn!(
            persistence_id = %self.persistence_id(),
            sequence_nr = metadata.sequence_nr,
            %cause,
            "snapshot save failed"
        );
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use tokio::sync::mpsc;

    use super::{PersistentEntity, Recovered};
    use crate::context::EntityContext;
    use crate::error::{JournalError, RecoveryFailure, SnapshotError};
    use crate::protocol::SnapshotMetadata;

    /// Everything observable about a `Recorder`'s execution, in the order
    /// it happened. Tests assert on the probe stream to pin down command /
    /// handler interleavings.
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Probe {
        /// A command entered `receive_command`.
        Command {
            tag: String,
            last_sequence_nr: u64,
        },
        /// A persist handler ran for `event`.
        Handler {
            event: String,
            sequence_nr: u64,
        },
        /// A defer handler ran for `event`.
        Deferred {
            event: String,
        },
        /// An event was replayed into `receive_recover`.
        Recovered {
            event: String,
        },
        /// A snapshot was offered during recovery.
        SnapshotOffered {
            sequence_nr: u64,
            events: Vec<String>,
        },
        /// Recovery completed with the state recovered so far.
        RecoveryCompleted {
            applied: Vec<String>,
        },
        ReplayFailed {
            message: String,
        },
        Rejected {
            event: String,
            sequence_nr: u64,
        },
        PersistFailed {
            event: String,
        },
        Deleted {
            to_sequence_nr: u64,
        },
        DeleteFailed {
            to_sequence_nr: u64,
        },
        SnapshotSaved {
            sequence_nr: u64,
        },
        SnapshotSaveFailed {
            sequence_nr: u64,
        },
    }

    /// Commands driving each persistence operation of the core.
    #[derive(Debug)]
    pub(crate) enum RecorderCommand {
        /// Process without persisting; probes command order and counters.
        Mark(&'static str),
        Persist(&'static str),
        /// `persist_all` of two events in one atomic write.
        PersistPair(&'static str, &'static str),
        PersistAllEmpty,
        PersistAsync(&'static str),
        /// Two separate `persist_async` calls in one command.
        AsyncPair(&'static str, &'static str),
        /// One `persist_async` call per element.
        AsyncMany(Vec<&'static str>),
        PersistAllAsync(Vec<&'static str>),
        /// `persist_async` followed by `persist` in the same command.
        MixedAsyncThenPersist(&'static str, &'static str),
        Defer(&'static str),
        AsyncThenDefer(&'static str, &'static str),
        /// `persist` whose handler persists a second event.
        PersistChain(&'static str, &'static str),
        Delete(u64),
        TakeSnapshot,
        Fail(&'static str),
    }

    impl RecorderCommand {
        fn tag(&self) -> String {
            match self {
                RecorderCommand::Mark(tag) => (*tag).to_string(),
                RecorderCommand::Persist(e) => format!("persist:{e}"),
                RecorderCommand::PersistPair(a, b) => format!("persist-pair:{a}+{b}"),
                RecorderCommand::PersistAllEmpty => "persist-all-empty".to_string(),
                RecorderCommand::PersistAsync(e) => format!("persist-async:{e}"),
                RecorderCommand::AsyncPair(a, b) => format!("async-pair:{a}+{b}"),
                RecorderCommand::AsyncMany(_) => "async-many".to_string(),
                RecorderCommand::PersistAllAsync(_) => "persist-all-async".to_string(),
                RecorderCommand::MixedAsyncThenPersist(p, q) => format!("mixed:{p}+{q}"),
                RecorderCommand::Defer(e) => format!("defer:{e}"),
                RecorderCommand::AsyncThenDefer(a, d) => format!("async-then-defer:{a}+{d}"),
                RecorderCommand::PersistChain(a, b) => format!("chain:{a}+{b}"),
                RecorderCommand::Delete(to) => format!("delete:{to}"),
                RecorderCommand::TakeSnapshot => "take-snapshot".to_string(),
                RecorderCommand::Fail(reason) => format!("fail:{reason}"),
            }
        }
    }

    /// Test entity that records everything it does on a probe channel.
    pub(crate) struct Recorder {
        pub id: String,
        pub applied: Vec<String>,
        probe: mpsc::UnboundedSender<Probe>,
    }

    impl Recorder {
        pub(crate) fn new(id: impl Into<String>, probe: mpsc::UnboundedSender<Probe>) -> Self {
            Self {
                id: id.into(),
                applied: Vec::new(),
                probe,
            }
        }

        pub(crate) fn emit(&self, probe: Probe) {
            let _ = self.probe.send(probe);
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub(crate) enum RecorderError {
        #[error("induced failure: {0}")]
        Induced(String),
    }

    /// Persist handler shared by most commands: apply the event and probe it.
    fn record_event(ctx: &mut EntityContext<Recorder>, event: String) -> Result<(), RecorderError> {
        ctx.applied.push(event.clone());
        let sequence_nr = ctx.last_sequence_nr();
        ctx.emit(Probe::Handler { event, sequence_nr });
        Ok(())
    }

    fn record_deferred(
        ctx: &mut EntityContext<Recorder>,
        event: String,
    ) -> Result<(), RecorderError> {
        ctx.emit(Probe::Deferred { event });
        Ok(())
    }

    impl PersistentEntity for Recorder {
        type Command = RecorderCommand;
        type Event = String;
        type Snapshot = Vec<String>;
        type Error = RecorderError;

        fn persistence_id(&self) -> String {
            self.id.clone()
        }

        fn receive_recover(
            &mut self,
            recovered: Recovered<String, Vec<String>>,
        ) -> Result<(), RecorderError> {
            match recovered {
                Recovered::SnapshotOffer { metadata, snapshot } => {
                    self.emit(Probe::SnapshotOffered {
                        sequence_nr: metadata.sequence_nr,
                        events: snapshot.clone(),
                    });
                    self.applied = snapshot;
                }
                Recovered::Event(event) => {
                    self.emit(Probe::Recovered {
                        event: event.clone(),
                    });
                    self.applied.push(event);
                }
                Recovered::Completed => {
                    self.emit(Probe::RecoveryCompleted {
                        applied: self.applied.clone(),
                    });
                }
            }
            Ok(())
        }

        fn receive_command(
            ctx: &mut EntityContext<Self>,
            command: RecorderCommand,
        ) -> Result<(), RecorderError> {
            let probe = Probe::Command {
                tag: command.tag(),
                last_sequence_nr: ctx.last_sequence_nr(),
            };
            ctx.emit(probe);

            match command {
                RecorderCommand::Mark(_) => {}
                RecorderCommand::Persist(e) => ctx.persist(e.to_string(), record_event),
                RecorderCommand::PersistPair(a, b) => {
                    ctx.persist_all(vec![a.to_string(), b.to_string()], record_event);
                }
                RecorderCommand::PersistAllEmpty => ctx.persist_all(Vec::new(), record_event),
                RecorderCommand::PersistAsync(e) => {
                    ctx.persist_async(e.to_string(), record_event);
                }
                RecorderCommand::AsyncPair(a, b) => {
                    ctx.persist_async(a.to_string(), record_event);
                    ctx.persist_async(b.to_string(), record_event);
                }
                RecorderCommand::AsyncMany(events) => {
                    for e in events {
                        ctx.persist_async(e.to_string(), record_event);
                    }
                }
                RecorderCommand::PersistAllAsync(events) => {
                    let events = events.into_iter().map(str::to_string).collect();
                    ctx.persist_all_async(events, record_event);
                }
                RecorderCommand::MixedAsyncThenPersist(p, q) => {
                    ctx.persist_async(p.to_string(), record_event);
                    ctx.persist(q.to_string(), record_event);
                }
                RecorderCommand::Defer(d) => ctx.defer_async(d.to_string(), record_deferred)?,
                RecorderCommand::AsyncThenDefer(a, d) => {
                    ctx.persist_async(a.to_string(), record_event);
                    ctx.defer_async(d.to_string(), record_deferred)?;
                }
                RecorderCommand::PersistChain(a, b) => {
                    let b = b.to_string();
                    ctx.persist(a.to_string(), move |ctx, event| {
                        record_event(ctx, event)?;
                        ctx.persist(b, record_event);
                        Ok(())
                    });
                }
                RecorderCommand::Delete(to_sequence_nr) => ctx.delete_messages(to_sequence_nr),
                RecorderCommand::TakeSnapshot => {
                    let snapshot = ctx.applied.clone();
                    ctx.save_snapshot(snapshot);
                }
                RecorderCommand::Fail(reason) => {
                    return Err(RecorderError::Induced(reason.to_string()));
                }
            }
            Ok(())
        }

        fn on_replay_failure(
            &mut self,
            cause: &RecoveryFailure<RecorderError>,
            _event: Option<&String>,
        ) {
            self.emit(Probe::ReplayFailed {
                message: cause.to_string(),
            });
        }

        fn on_persist_rejected(&mut self, _cause: &JournalError, event: &String, sequence_nr: u64) {
            self.emit(Probe::Rejected {
                event: event.clone(),
                sequence_nr,
            });
        }

        fn on_persist_failure(&mut self, _cause: &JournalError, event: &String, _sequence_nr: u64) {
            self.emit(Probe::PersistFailed {
                event: event.clone(),
            });
        }

        fn on_delete_messages_success(&mut self, to_sequence_nr: u64) {
            self.emit(Probe::Deleted { to_sequence_nr });
        }

        fn on_delete_messages_failure(&mut self, _cause: &JournalError, to_sequence_nr: u64) {
            self.emit(Probe::DeleteFailed { to_sequence_nr });
        }

        fn on_snapshot_saved(&mut self, metadata: &SnapshotMetadata) {
            self.emit(Probe::SnapshotSaved {
                sequence_nr: metadata.sequence_nr,
            });
        }

        fn on_snapshot_save_failure(&mut self, metadata: &SnapshotMetadata, _cause: &SnapshotError) {
            self.emit(Probe::SnapshotSaveFailed {
                sequence_nr: metadata.sequence_nr,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_recovery_is_unbounded() {
        let recovery = Recovery::default();
        assert_eq!(recovery.from_snapshot, SnapshotSelectionCriteria::latest());
        assert_eq!(recovery.to_sequence_nr, u64::MAX);
        assert_eq!(recovery.replay_max, u64::MAX);
    }

    #[test]
    fn recovery_none_replays_nothing() {
        let recovery = Recovery::none();
        assert_eq!(recovery.from_snapshot, SnapshotSelectionCriteria::none());
        assert_eq!(recovery.to_sequence_nr, 0);
        assert_eq!(recovery.replay_max, 0);
    }

    #[test]
    fn recovery_serde_roundtrip() {
        let recovery = Recovery {
            from_snapshot: SnapshotSelectionCriteria {
                max_sequence_nr: 9,
                min_sequence_nr: 2,
            },
            to_sequence_nr: 20,
            replay_max: 5,
        };

        let json = serde_json::to_string(&recovery).expect("serialization should succeed");
        let back: Recovery = serde_json::from_str(&json).expect("deserialization should succeed");

        assert_eq!(back, recovery);
    }
}
