//! Event-sourced persistent entity core.
//!
//! `persistent-entity` provides the state machine that sits between a
//! user-defined command handler and an event journal: entities recover
//! their state from a snapshot plus replayed events before serving any
//! command, emitted events are appended in order through a batched write
//! pipeline with a single write in flight, and the `persist` family of
//! operations controls whether later commands may interleave with
//! outstanding writes. Journals and snapshot stores are reached purely by
//! message protocol; in-memory implementations of both are included.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`PersistentEntity`] | Domain model: handles commands, persists events, folds recovered state |
//! | [`EntityContext`] | Persist operations + entity state, handed to command callbacks |
//! | [`EntityHandle`] | Async handle to a running entity |
//! | [`PersistenceRegistry`] | Plugin ids → journals/snapshot stores, entity handle cache |
//! | [`MemoryJournal`] / [`MemorySnapshotStore`] | In-process protocol implementations |
//! | [`JournalRequest`] / [`JournalResponse`] | The journal wire protocol |
//!
//! # Quick Start
//!
//! ```no_run
//! use persistent_entity::{
//!     EntityContext, EntityHandle, EntitySettings, MemoryJournal, MemorySnapshotStore,
//!     PersistentEntity, Recovered, spawn_entity,
//! };
//!
//! struct Counter {
//!     id: String,
//!     value: u64,
//! }
//!
//! #[derive(Debug, Clone)]
//! enum CounterEvent {
//!     Incremented,
//! }
//!
//! enum CounterCommand {
//!     Increment,
//! }
//!
//! #[derive(Debug, thiserror::Error)]
//! enum CounterError {}
//!
//! impl PersistentEntity for Counter {
//!     type Command = CounterCommand;
//!     type Event = CounterEvent;
//!     type Snapshot = u64;
//!     type Error = CounterError;
//!
//!     fn persistence_id(&self) -> String {
//!         self.id.clone()
//!     }
//!
//!     fn receive_recover(
//!         &mut self,
//!         recovered: Recovered<CounterEvent, u64>,
//!     ) -> Result<(), CounterError> {
//!         match recovered {
//!             Recovered::SnapshotOffer { snapshot, .. } => self.value = snapshot,
//!             Recovered::Event(CounterEvent::Incremented) => self.value += 1,
//!             Recovered::Completed => {}
//!         }
//!         Ok(())
//!     }
//!
//!     fn receive_command(
//!         ctx: &mut EntityContext<Self>,
//!         command: CounterCommand,
//!     ) -> Result<(), CounterError> {
//!         match command {
//!             CounterCommand::Increment => {
//!                 // The handler runs once the event is durably appended;
//!                 // commands arriving in between are deferred.
//!                 ctx.persist(CounterEvent::Incremented, |ctx, _event| {
//!                     ctx.value += 1;
//!                     Ok(())
//!                 });
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let journal = MemoryJournal::spawn::<CounterEvent>();
//!     let snapshots = MemorySnapshotStore::spawn::<u64>();
//!     let handle: EntityHandle<Counter> = spawn_entity(
//!         || Counter { id: "counter-1".into(), value: 0 },
//!         journal,
//!         snapshots,
//!         EntitySettings::default(),
//!     );
//!     handle.send(CounterCommand::Increment).expect("entity running");
//! }
//! ```

mod actor;
pub use actor::{
    DEFAULT_PLUGIN_ID, EntityHandle, EntitySettings, SupervisionStrategy, spawn_entity,
};
mod context;
pub use context::EntityContext;
mod entity;
pub use entity::{PersistentEntity, Recovered, Recovery};
mod error;
pub use error::{
    EntityGone, JournalError, PluginError, RecoveryFailure, SnapshotError,
};
mod invocations;
mod memory;
pub use memory::{
    MemoryJournal, MemoryJournalBuilder, MemorySnapshotStore, MemorySnapshotStoreBuilder,
    WriteOutcome,
};
mod protocol;
pub use protocol::{
    AtomicWrite, Envelope, JournalClient, JournalReplyTo, JournalRequest, JournalResponse,
    PersistentRepr, SelectedSnapshot, SnapshotClient, SnapshotMetadata, SnapshotReplyTo,
    SnapshotRequest, SnapshotResponse, SnapshotSelectionCriteria,
};
mod registry;
pub use registry::PersistenceRegistry;
mod stash;
