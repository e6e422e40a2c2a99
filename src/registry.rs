//! Plugin registry: maps plugin ids to journal and snapshot-store clients
//! and hands out entity handles.
//!
//! Journals and stores are registered once at startup under string ids;
//! entities name the ids they want through [`EntitySettings`]. Resolution
//! happens eagerly at spawn so a misconfigured id fails the spawn call
//! instead of hanging a recovering entity.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::actor::{EntityHandle, EntitySettings, spawn_entity};
use crate::entity::PersistentEntity;
use crate::error::PluginError;
use crate::protocol::{JournalClient, SnapshotClient};

/// Live entity handles, one map for every entity type in the process.
///
/// `EntityHandle<A>` has no common supertrait across different `A`s, so
/// entries are stored behind `dyn Any` and keyed by the entity's `TypeId`
/// alongside its persistence id; `get` downcasts on the way out.
type HandleCache = HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>;

/// Registry of journals, snapshot stores, and live entity handles.
///
/// Plugin registration takes `&mut self` and happens at startup; after
/// that the registry is shared immutably (typically behind an `Arc`) and
/// only the handle cache mutates, behind its own lock.
pub struct PersistenceRegistry {
    journals: HashMap<String, Box<dyn Any + Send + Sync>>,
    snapshot_stores: HashMap<String, Box<dyn Any + Send + Sync>>,
    // `std::sync::Mutex` rather than an async lock: the critical section
    // is a map lookup and never held across an `.await` point.
    handles: Mutex<HandleCache>,
}

impl PersistenceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            journals: HashMap::new(),
            snapshot_stores: HashMap::new(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Register a journal client under a plugin id, replacing any previous
    /// registration for that id.
    pub fn register_journal<E: Send + 'static>(
        &mut self,
        plugin_id: impl Into<String>,
        journal: JournalClient<E>,
    ) {
        self.journals.insert(plugin_id.into(), Box::new(journal));
    }

    /// Register a snapshot store client under a plugin id, replacing any
    /// previous registration for that id.
    pub fn register_snapshot_store<S: Send + 'static>(
        &mut self,
        plugin_id: impl Into<String>,
        store: SnapshotClient<S>,
    ) {
        self.snapshot_stores.insert(plugin_id.into(), Box::new(store));
    }

    /// Resolve a journal client by plugin id.
    ///
    /// # Errors
    ///
    /// [`PluginError::UnknownJournal`] if nothing is registered under the
    /// id; [`PluginError::JournalTypeMismatch`] if the registered journal
    /// serves a different event type.
    pub fn journal<E: Send + 'static>(
        &self,
        plugin_id: &str,
    ) -> Result<JournalClient<E>, PluginError> {
        let entry = self
            .journals
            .get(plugin_id)
            .ok_or_else(|| PluginError::UnknownJournal(plugin_id.to_string()))?;
        entry
            .downcast_ref::<JournalClient<E>>()
            .cloned()
            .ok_or_else(|| PluginError::JournalTypeMismatch {
                id: plugin_id.to_string(),
            })
    }

    /// Resolve a snapshot store client by plugin id.
    ///
    /// # Errors
    ///
    /// [`PluginError::UnknownSnapshotStore`] if nothing is registered under
    /// the id; [`PluginError::SnapshotTypeMismatch`] if the registered
    /// store serves a different snapshot type.
    pub fn snapshot_store<S: Send + 'static>(
        &self,
        plugin_id: &str,
    ) -> Result<SnapshotClient<S>, PluginError> {
        let entry = self
            .snapshot_stores
            .get(plugin_id)
            .ok_or_else(|| PluginError::UnknownSnapshotStore(plugin_id.to_string()))?;
        entry
            .downcast_ref::<SnapshotClient<S>>()
            .cloned()
            .ok_or_else(|| PluginError::SnapshotTypeMismatch {
                id: plugin_id.to_string(),
            })
    }

    /// Spawn an entity against the plugins named in `settings`, without
    /// caching the handle.
    ///
    /// # Errors
    ///
    /// Any resolution error from [`journal`](Self::journal) or
    /// [`snapshot_store`](Self::snapshot_store); both are resolved before
    /// the entity task starts.
    pub fn spawn<A, F>(
        &self,
        factory: F,
        settings: &EntitySettings,
    ) -> Result<EntityHandle<A>, PluginError>
    where
        A: PersistentEntity,
        F: Fn() -> A + Send + 'static,
    {
        let journal = self.journal::<A::Event>(&settings.journal_plugin_id)?;
        let snapshots = self.snapshot_store::<A::Snapshot>(&settings.snapshot_plugin_id)?;
        Ok(spawn_entity(factory, journal, snapshots, settings.clone()))
    }

    /// A handle to the entity with the given persistence id, spawning it
    /// on first use and re-spawning it if its task has exited. The factory
    /// must build an entity whose `persistence_id()` matches.
    ///
    /// # Errors
    ///
    /// Any resolution error from [`spawn`](Self::spawn).
    pub fn get<A, F>(
        &self,
        persistence_id: &str,
        factory: F,
        settings: &EntitySettings,
    ) -> Result<EntityHandle<A>, PluginError>
    where
        A: PersistentEntity,
        F: Fn() -> A + Send + 'static,
    {
        let key = (TypeId::of::<A>(), persistence_id.to_string());
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = handles
            .get(&key)
            .and_then(|entry| entry.downcast_ref::<EntityHandle<A>>())
        {
            if handle.is_alive() {
                return Ok(handle.clone());
            }
            tracing::debug!(persistence_id, "cached entity handle is dead; re-spawning");
        }
        let handle = self.spawn(factory, settings)?;
        handles.insert(key, Box::new(handle.clone()));
        Ok(handle)
    }
}

impl Default for PersistenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::actor::DEFAULT_PLUGIN_ID;
    use crate::entity::test_fixtures::{Probe, Recorder, RecorderCommand};
    use crate::memory::{MemoryJournal, MemorySnapshotStore};

    fn memory_registry() -> PersistenceRegistry {
        let mut registry = PersistenceRegistry::new();
        registry.register_journal(DEFAULT_PLUGIN_ID, MemoryJournal::spawn::<String>());
        registry
            .register_snapshot_store(DEFAULT_PLUGIN_ID, MemorySnapshotStore::spawn::<Vec<String>>());
        registry
    }

    #[tokio::test]
    async fn resolves_registered_plugins_by_id_and_type() {
        let registry = memory_registry();
        assert!(registry.journal::<String>(DEFAULT_PLUGIN_ID).is_ok());
        assert!(
            registry
                .snapshot_store::<Vec<String>>(DEFAULT_PLUGIN_ID)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn unknown_plugin_id_fails_fast() {
        let registry = memory_registry();
        assert!(matches!(
            registry.journal::<String>("missing"),
            Err(PluginError::UnknownJournal(id)) if id == "missing"
        ));
        assert!(matches!(
            registry.snapshot_store::<Vec<String>>("missing"),
            Err(PluginError::UnknownSnapshotStore(id)) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn mismatched_event_type_fails_fast() {
        let registry = memory_registry();
        assert!(matches!(
            registry.journal::<u64>(DEFAULT_PLUGIN_ID),
            Err(PluginError::JournalTypeMismatch { .. })
        ));
        assert!(matches!(
            registry.snapshot_store::<u64>(DEFAULT_PLUGIN_ID),
            Err(PluginError::SnapshotTypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn spawn_fails_before_starting_the_entity_on_bad_settings() {
        let registry = memory_registry();
        let (probe_tx, _probes) = mpsc::unbounded_channel();
        let settings = EntitySettings::default().with_journal_plugin_id("missing");

        let result = registry.spawn::<Recorder, _>(
            move || Recorder::new("never-runs", probe_tx.clone()),
            &settings,
        );

        assert!(matches!(result, Err(PluginError::UnknownJournal(_))));
    }

    #[tokio::test]
    async fn get_caches_live_handles_and_respawns_dead_ones() {
        let registry = memory_registry();
        let (probe_tx, mut probes) = mpsc::unbounded_channel();
        let settings = EntitySettings::default();

        let factory = move || Recorder::new("cached", probe_tx.clone());
        let handle = registry
            .get("cached", factory.clone(), &settings)
            .expect("spawn should succeed");
        match tokio::time::timeout(Duration::from_secs(5), probes.recv())
            .await
            .expect("recovery should complete")
            .expect("probe channel open")
        {
            Probe::RecoveryCompleted { .. } => {}
            other => panic!("expected RecoveryCompleted, got {other:?}"),
        }

        // Second lookup reuses the live handle: no second recovery runs.
        let again = registry
            .get("cached", factory.clone(), &settings)
            .expect("lookup should succeed");
        again.send(RecorderCommand::Mark("still-first")).expect("send");
        match tokio::time::timeout(Duration::from_secs(5), probes.recv())
            .await
            .expect("command should run")
            .expect("probe channel open")
        {
            Probe::Command { tag, .. } => assert_eq!(tag, "still-first"),
            other => panic!("expected Command, got {other:?}"),
        }

        // After a stop, the next lookup spawns a fresh incarnation.
        handle.stop();
        drop(handle);
        drop(again);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let revived = registry
                    .get("cached", factory.clone(), &settings)
                    .expect("respawn should succeed");
                if revived.is_alive() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("entity should be re-spawned");
    }
}
