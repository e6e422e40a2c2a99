//! The entity task: a single-threaded loop that owns an
//! [`EntityContext`], drives recovery, and interleaves commands with
//! journal confirmations.
//!
//! The loop is a four-state machine. `RecoveryStarted` waits for the
//! snapshot store, `ReplayStarted` consumes the journal's replay,
//! `ProcessingCommands` is the live state, and `PersistingEvents` holds
//! commands back while a stashing persist is outstanding. Everything a
//! state does not consume is parked on the internal stash and redelivered
//! later, in arrival order.
//!
//! Public API: [`EntityHandle`] (cloneable async handle), [`spawn_entity`]
//! (factory that starts the task), and [`EntitySettings`].

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::context::EntityContext;
use crate::entity::{PersistentEntity, Recovered, Recovery};
use crate::error::{EntityGone, RecoveryFailure};
use crate::protocol::{
    JournalClient, JournalReplyTo, JournalRequest, JournalResponse, SnapshotClient,
    SnapshotReplyTo, SnapshotRequest, SnapshotResponse,
};
use crate::stash::InternalStash;

/// Plugin id resolved when settings do not name one.
pub const DEFAULT_PLUGIN_ID: &str = "default";

/// What to do when a live callback returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisionStrategy {
    /// Discard in-memory state and re-enter recovery with a fresh state
    /// value from the spawn factory. The default.
    Restart,
    /// Stop the entity.
    Stop,
}

/// Configuration for a spawned entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitySettings {
    /// Registry key of the journal to write to.
    pub journal_plugin_id: String,
    /// Registry key of the snapshot store to recover from.
    pub snapshot_plugin_id: String,
    /// Cap on the number of envelopes handed to the journal in one
    /// request. Reaching it forces a submission even with a write already
    /// in flight.
    pub max_message_batch_size: usize,
    /// Policy for errors returned from live callbacks.
    pub supervision: SupervisionStrategy,
}

impl EntitySettings {
    /// Set the journal plugin id.
    pub fn with_journal_plugin_id(mut self, id: impl Into<String>) -> Self {
        self.journal_plugin_id = id.into();
        self
    }

    /// Set the snapshot store plugin id.
    pub fn with_snapshot_plugin_id(mut self, id: impl Into<String>) -> Self {
        self.snapshot_plugin_id = id.into();
        self
    }

    /// Set the write batch size cap. Must be positive.
    pub fn with_max_message_batch_size(mut self, size: usize) -> Self {
        self.max_message_batch_size = size.max(1);
        self
    }

    /// Set the supervision strategy.
    pub fn with_supervision(mut self, supervision: SupervisionStrategy) -> Self {
        self.supervision = supervision;
        self
    }
}

impl Default for EntitySettings {
    fn default() -> Self {
        Self {
            journal_plugin_id: DEFAULT_PLUGIN_ID.to_string(),
            snapshot_plugin_id: DEFAULT_PLUGIN_ID.to_string(),
            max_message_batch_size: 200,
            supervision: SupervisionStrategy::Restart,
        }
    }
}

/// Everything that can land in an entity's mailbox.
pub(crate) enum EntityMessage<A: PersistentEntity> {
    Command(A::Command),
    Journal(JournalResponse<A::Event>),
    Snapshot(SnapshotResponse<A::Snapshot>),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RecoveryStarted,
    ReplayStarted,
    ProcessingCommands,
    PersistingEvents,
}

/// Outcome of dispatching one message.
enum Flow<E> {
    Continue,
    Stop,
    /// A live callback returned an error; the supervision strategy decides.
    Fail(E),
}

struct EntityActor<A: PersistentEntity> {
    ctx: EntityContext<A>,
    state: State,
    stash: InternalStash<EntityMessage<A>>,
    recovery: Recovery,
    factory: Box<dyn Fn() -> A + Send>,
    supervision: SupervisionStrategy,
    max_message_batch_size: usize,
    journal: JournalClient<A::Event>,
    snapshots: SnapshotClient<A::Snapshot>,
    journal_reply_to: JournalReplyTo<A::Event>,
    snapshot_reply_to: SnapshotReplyTo<A::Snapshot>,
    /// Set when the snapshot store is unreachable during startup; the
    /// entity cannot recover and stops at the next loop turn.
    halted: bool,
}

impl<A: PersistentEntity> EntityActor<A> {
    /// Enter `RecoveryStarted` and ask the snapshot store for a starting
    /// point. Runs at spawn and again after every restart.
    fn start_recovery(&mut self) {
        self.state = State::RecoveryStarted;
        self.recovery = self.ctx.entity.recovery();
        tracing::debug!(
            persistence_id = %self.ctx.persistence_id,
            instance_id = self.ctx.instance_id,
            "starting recovery"
        );
        let request = SnapshotRequest::LoadSnapshot {
            persistence_id: self.ctx.persistence_id.clone(),
            criteria: self.recovery.from_snapshot,
            to_sequence_nr: self.recovery.to_sequence_nr,
            reply_to: self.snapshot_reply_to.clone(),
        };
        if self.snapshots.send(request).is_err() {
            tracing::error!(
                persistence_id = %self.ctx.persistence_id,
                "snapshot store is not running; entity cannot recover"
            );
            self.halted = true;
        }
    }

    /// Next message to process: released stash entries first, then the
    /// mailbox. `None` means every handle is gone and the mailbox drained.
    async fn next_message(
        &mut self,
        mailbox: &mut mpsc::UnboundedReceiver<EntityMessage<A>>,
    ) -> Option<EntityMessage<A>> {
        if let Some(message) = self.stash.next_ready() {
            return Some(message);
        }
        mailbox.recv().await
    }

    fn dispatch(&mut self, message: EntityMessage<A>) -> Flow<A::Error> {
        match self.state {
            State::RecoveryStarted => self.on_recovery_started(message),
            State::ReplayStarted => self.on_replay_started(message),
            State::ProcessingCommands => self.on_processing_commands(message),
            State::PersistingEvents => self.on_persisting_events(message),
        }
    }

    fn on_recovery_started(&mut self, message: EntityMessage<A>) -> Flow<A::Error> {
        match message {
            EntityMessage::Snapshot(SnapshotResponse::LoadSnapshotResult {
                snapshot,
                to_sequence_nr,
            }) => {
                if let Some(selected) = snapshot {
                    self.ctx.set_last_sequence_nr(selected.metadata.sequence_nr);
                    let offer = Recovered::SnapshotOffer {
                        metadata: selected.metadata,
                        snapshot: selected.snapshot,
                    };
                    if let Err(error) = self.ctx.entity.receive_recover(offer) {
                        return self.fail_recovery(RecoveryFailure::Handler(error), None);
                    }
                }
                self.state = State::ReplayStarted;
                let request = JournalRequest::ReplayMessages {
                    from_sequence_nr: self.ctx.last_sequence_nr() + 1,
                    to_sequence_nr,
                    max: self.recovery.replay_max,
                    persistence_id: self.ctx.persistence_id.clone(),
                    reply_to: self.journal_reply_to.clone(),
                };
                if self.journal.send(request).is_err() {
                    self.ctx.journal_gone = true;
                }
                Flow::Continue
            }
            EntityMessage::Stop => Flow::Stop,
            other => {
                self.stash.stash(other);
                Flow::Continue
            }
        }
    }

    fn on_replay_started(&mut self, message: EntityMessage<A>) -> Flow<A::Error> {
        match message {
            EntityMessage::Journal(JournalResponse::ReplayedMessage { record }) => {
                self.ctx.update_last_sequence_nr(record.sequence_nr);
                let payload = record.payload.clone();
                if let Err(error) = self.ctx.entity.receive_recover(Recovered::Event(record.payload))
                {
                    return self.fail_recovery(RecoveryFailure::Handler(error), Some(&payload));
                }
                Flow::Continue
            }
            EntityMessage::Journal(JournalResponse::ReplayMessagesSuccess {
                highest_sequence_nr,
            }) => {
                self.ctx.set_counters_after_replay(highest_sequence_nr);
                self.ctx.entity.on_replay_success();
                self.stash.unstash_all();
                if let Err(error) = self.ctx.entity.receive_recover(Recovered::Completed) {
                    return self.fail_recovery(RecoveryFailure::Handler(error), None);
                }
                self.state = State::ProcessingCommands;
                tracing::debug!(
                    persistence_id = %self.ctx.persistence_id,
                    highest_sequence_nr,
                    "recovery completed"
                );
                Flow::Continue
            }
            EntityMessage::Journal(JournalResponse::ReplayMessagesFailure { cause }) => {
                self.fail_recovery(RecoveryFailure::Journal(cause), None)
            }
            EntityMessage::Stop => Flow::Stop,
            other => {
                self.stash.stash(other);
                Flow::Continue
            }
        }
    }

    fn fail_recovery(
        &mut self,
        cause: RecoveryFailure<A::Error>,
        event: Option<&A::Event>,
    ) -> Flow<A::Error> {
        self.ctx.entity.on_replay_failure(&cause, event);
        Flow::Stop
    }

    fn on_processing_commands(&mut self, message: EntityMessage<A>) -> Flow<A::Error> {
        match message {
            EntityMessage::Journal(response) => self.on_journal_response(response),
            EntityMessage::Snapshot(response) => self.on_snapshot_response(response),
            EntityMessage::Command(command) => {
                let _span =
                    tracing::info_span!("command", persistence_id = %self.ctx.persistence_id)
                        .entered();
                let result = A::receive_command(&mut self.ctx, command);
                let raised = result.is_err();
                if !self.ctx.event_batch.is_empty() {
                    self.ctx.flush_batch();
                }
                if self.ctx.pending.stashing_count() > 0 {
                    self.state = State::PersistingEvents;
                } else {
                    self.unstash(raised);
                }
                match result {
                    Ok(()) => Flow::Continue,
                    Err(error) => Flow::Fail(error),
                }
            }
            EntityMessage::Stop => Flow::Stop,
        }
    }

    fn on_persisting_events(&mut self, message: EntityMessage<A>) -> Flow<A::Error> {
        match message {
            EntityMessage::Journal(response) => self.on_journal_response(response),
            EntityMessage::Stop => Flow::Stop,
            other => {
                self.stash.stash(other);
                Flow::Continue
            }
        }
    }

    /// Write-pipeline replies, handled identically in `ProcessingCommands`
    /// and `PersistingEvents`. Per-record confirmations carry the writer
    /// incarnation; a mismatch means the reply belongs to a previous
    /// incarnation of this entity and is dropped. The batch terminals
    /// carry no incarnation and are always acted on.
    fn on_journal_response(&mut self, response: JournalResponse<A::Event>) -> Flow<A::Error> {
        match response {
            JournalResponse::WriteMessageSuccess {
                record,
                instance_id,
            } => {
                if instance_id != self.ctx.instance_id {
                    return Flow::Continue;
                }
                self.ctx.update_last_sequence_nr(record.sequence_nr);
                self.apply_front_handler(record.payload)
            }
            JournalResponse::LoopMessageSuccess {
                payload,
                instance_id,
            } => {
                if instance_id != self.ctx.instance_id {
                    return Flow::Continue;
                }
                self.apply_front_handler(payload)
            }
            JournalResponse::WriteMessageRejected {
                record,
                cause,
                instance_id,
            } => {
                if instance_id != self.ctx.instance_id {
                    return Flow::Continue;
                }
                self.ctx.update_last_sequence_nr(record.sequence_nr);
                self.complete_write(false);
                self.ctx
                    .entity
                    .on_persist_rejected(&cause, &record.payload, record.sequence_nr);
                Flow::Continue
            }
            JournalResponse::WriteMessageFailure {
                record,
                cause,
                instance_id,
            } => {
                if instance_id != self.ctx.instance_id {
                    return Flow::Continue;
                }
                self.complete_write(false);
                self.ctx
                    .entity
                    .on_persist_failure(&cause, &record.payload, record.sequence_nr);
                Flow::Stop
            }
            JournalResponse::WriteMessagesSuccessful => {
                self.ctx.on_write_batch_acknowledged();
                Flow::Continue
            }
            JournalResponse::WriteMessagesFailed { cause } => {
                // The per-record failures that follow stop the entity.
                tracing::debug!(
                    persistence_id = %self.ctx.persistence_id,
                    %cause,
                    "write batch failed"
                );
                Flow::Continue
            }
            JournalResponse::DeleteMessagesSuccess { to_sequence_nr } => {
                self.ctx.entity.on_delete_messages_success(to_sequence_nr);
                Flow::Continue
            }
            JournalResponse::DeleteMessagesFailure {
                cause,
                to_sequence_nr,
            } => {
                self.ctx
                    .entity
                    .on_delete_messages_failure(&cause, to_sequence_nr);
                Flow::Continue
            }
            JournalResponse::ReplayedMessage { .. }
            | JournalResponse::ReplayMessagesSuccess { .. }
            | JournalResponse::ReplayMessagesFailure { .. } => {
                tracing::warn!(
                    persistence_id = %self.ctx.persistence_id,
                    "replay message outside recovery; dropping"
                );
                Flow::Continue
            }
        }
    }

    fn on_snapshot_response(&mut self, response: SnapshotResponse<A::Snapshot>) -> Flow<A::Error> {
        match response {
            SnapshotResponse::SaveSnapshotSuccess { metadata } => {
                self.ctx.entity.on_snapshot_saved(&metadata);
                Flow::Continue
            }
            SnapshotResponse::SaveSnapshotFailure { metadata, cause } => {
                self.ctx.entity.on_snapshot_save_failure(&metadata, &cause);
                Flow::Continue
            }
            SnapshotResponse::LoadSnapshotResult { .. } => {
                tracing::warn!(
                    persistence_id = %self.ctx.persistence_id,
                    "snapshot load result outside recovery; dropping"
                );
                Flow::Continue
            }
        }
    }

    /// Run the front invocation's handler with the confirmed payload, then
    /// complete the write. The handler may itself persist; the batch is
    /// re-flushed after it returns so those events reach the journal.
    fn apply_front_handler(&mut self, payload: A::Event) -> Flow<A::Error> {
        let Some(handler) = self.ctx.pending.take_front_handler() else {
            tracing::warn!(
                persistence_id = %self.ctx.persistence_id,
                "write confirmation with no pending invocation; dropping"
            );
            return Flow::Continue;
        };
        let result = handler(&mut self.ctx, payload);
        self.ctx.flush_batch();
        let raised = result.is_err();
        self.complete_write(raised);
        match result {
            Ok(()) => Flow::Continue,
            Err(error) => Flow::Fail(error),
        }
    }

    /// Pop the completed invocation. Completing the last stashing
    /// invocation releases the entity back to `ProcessingCommands` and
    /// lets stashed commands through.
    fn complete_write(&mut self, raised: bool) {
        let kind = self.ctx.pending.pop_front();
        match self.state {
            State::PersistingEvents => {
                if kind.is_some() && self.ctx.pending.stashing_count() == 0 {
                    self.state = State::ProcessingCommands;
                    self.unstash(raised);
                }
            }
            State::ProcessingCommands => self.unstash(raised),
            State::RecoveryStarted | State::ReplayStarted => {}
        }
    }

    fn unstash(&mut self, all: bool) {
        if all {
            self.stash.unstash_all();
        } else {
            self.stash.unstash_one();
        }
    }

    /// Supervision chose `Restart`: perform the pre-restart duties, then
    /// re-enter recovery as a fresh incarnation.
    fn restart(&mut self, cause: A::Error) {
        tracing::warn!(
            persistence_id = %self.ctx.persistence_id,
            %cause,
            "callback failed; restarting entity"
        );
        // Confirmations addressed to this incarnation must not leak into
        // the next one; everything else is redelivered after recovery.
        self.stash.drain_filtered(|message| {
            !matches!(
                message,
                EntityMessage::Journal(
                    JournalResponse::WriteMessageSuccess { .. }
                        | JournalResponse::ReplayedMessage { .. }
                )
            )
        });
        self.ctx.flush_journal_batch();
        let entity = (self.factory)();
        self.ctx = EntityContext::new(
            entity,
            self.journal.clone(),
            self.snapshots.clone(),
            self.journal_reply_to.clone(),
            self.snapshot_reply_to.clone(),
            self.max_message_batch_size,
        );
        self.start_recovery();
    }
}

async fn run_entity<A: PersistentEntity>(
    mut actor: EntityActor<A>,
    mut mailbox: mpsc::UnboundedReceiver<EntityMessage<A>>,
) {
    actor.start_recovery();
    loop {
        if actor.halted {
            break;
        }
        if actor.ctx.journal_gone {
            tracing::error!(
                persistence_id = %actor.ctx.persistence_id,
                "journal is not running; stopping entity (durability unknown)"
            );
            break;
        }
        let Some(message) = actor.next_message(&mut mailbox).await else {
            break;
        };
        match actor.dispatch(message) {
            Flow::Continue => {}
            Flow::Stop => break,
            Flow::Fail(cause) => match actor.supervision {
                SupervisionStrategy::Restart => actor.restart(cause),
                SupervisionStrategy::Stop => {
                    tracing::error!(
                        persistence_id = %actor.ctx.persistence_id,
                        %cause,
                        "callback failed; stopping entity"
                    );
                    break;
                }
            },
        }
    }
    let stashed = actor.stash.depth();
    let invocations = actor.ctx.pending.len();
    if stashed > 0 || invocations > 0 {
        tracing::debug!(
            persistence_id = %actor.ctx.persistence_id,
            stashed,
            invocations,
            "discarding stashed messages and pending invocations on stop"
        );
    }
    tracing::debug!(persistence_id = %actor.ctx.persistence_id, "entity stopped");
}

/// Async handle to a running persistent entity.
///
/// Clones freely and may be shared across tasks. Once the last handle is
/// dropped, the entity finishes whatever is left in its mailbox and stops.
#[derive(Debug)]
pub struct EntityHandle<A: PersistentEntity> {
    sender: mpsc::UnboundedSender<EntityMessage<A>>,
}

// Hand-written impl: a derive would demand `A: Clone`, but duplicating a
// handle duplicates nothing except its mailbox sender.
impl<A: PersistentEntity> Clone for EntityHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: PersistentEntity> EntityHandle<A> {
    /// Deliver a command to the entity's mailbox.
    ///
    /// # Errors
    ///
    /// Returns [`EntityGone`] if the entity task has exited.
    pub fn send(&self, command: A::Command) -> Result<(), EntityGone> {
        self.sender
            .send(EntityMessage::Command(command))
            .map_err(|_| EntityGone)
    }

    /// Ask the entity to stop after the messages already in its mailbox.
    pub fn stop(&self) {
        let _ = self.sender.send(EntityMessage::Stop);
    }

    /// Whether the entity task is still running.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Spawn a persistent entity onto the current Tokio runtime.
///
/// The factory builds the initial state value, and builds it again after
/// every supervised restart. Recovery starts immediately: the snapshot
/// store is asked for a starting point, the journal replays the remaining
/// events, and only then are commands processed.
///
/// # Panics
///
/// Panics if called outside a Tokio runtime.
pub fn spawn_entity<A, F>(
    factory: F,
    journal: JournalClient<A::Event>,
    snapshots: SnapshotClient<A::Snapshot>,
    settings: EntitySettings,
) -> EntityHandle<A>
where
    A: PersistentEntity,
    F: Fn() -> A + Send + 'static,
{
    let (sender, mailbox) = mpsc::unbounded_channel();

    // Reply handles hold only a weak sender: a journal keeping a reply
    // handle must not keep a stopped entity's mailbox open.
    let weak = sender.downgrade();
    let journal_reply_to = JournalReplyTo::new({
        let weak = weak.clone();
        move |response| {
            if let Some(sender) = weak.upgrade() {
                let _ = sender.send(EntityMessage::Journal(response));
            }
        }
    });
    let snapshot_reply_to = SnapshotReplyTo::new(move |response| {
        if let Some(sender) = weak.upgrade() {
            let _ = sender.send(EntityMessage::Snapshot(response));
        }
    });

    let entity = factory();
    let ctx = EntityContext::new(
        entity,
        journal.clone(),
        snapshots.clone(),
        journal_reply_to.clone(),
        snapshot_reply_to.clone(),
        settings.max_message_batch_size,
    );
    let actor = EntityActor {
        ctx,
        state: State::RecoveryStarted,
        stash: InternalStash::new(),
        recovery: Recovery::default(),
        factory: Box::new(factory),
        supervision: settings.supervision,
        max_message_batch_size: settings.max_message_batch_size,
        journal,
        snapshots,
        journal_reply_to,
        snapshot_reply_to,
        halted: false,
    };
    tokio::spawn(run_entity(actor, mailbox));

    EntityHandle { sender }
}
