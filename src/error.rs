//! Crate-level error types for the journal, snapshot store, and entity handles.

use thiserror::Error;

/// Error reported by a journal for a write, replay, or delete operation.
///
/// The two write-side variants carry very different policies: a
/// [`Rejected`](JournalError::Rejected) record was validated and refused
/// before anything was written, so the entity keeps running; an
/// [`Io`](JournalError::Io) failure leaves durability indeterminate, so the
/// entity stops.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JournalError {
    /// The journal validated the record and refused it (e.g. serialization
    /// or size limits). Nothing was written; the event is treated as
    /// never-persisted.
    #[error("event rejected by journal: {0}")]
    Rejected(String),

    /// Infrastructure failure while writing, replaying, or deleting.
    /// Whether the affected records are durable is unknown.
    #[error("journal I/O failure: {0}")]
    Io(String),

    /// The journal task has exited and its request channel is closed.
    #[error("journal is no longer running")]
    Unavailable,
}

/// Error reported by a snapshot store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// The store failed to persist or load a snapshot.
    #[error("snapshot store failure: {0}")]
    Store(String),

    /// The snapshot store task has exited and its request channel is closed.
    #[error("snapshot store is no longer running")]
    Unavailable,
}

/// Why recovery of an entity failed.
///
/// Generic over `E`, the entity's own error type, because a user
/// `receive_recover` callback refusing a replayed event is a recovery
/// failure just like the journal reporting one.
#[derive(Debug, Error)]
pub enum RecoveryFailure<E: std::error::Error + Send + Sync + 'static> {
    /// The journal could not replay the event stream.
    #[error("journal replay failed: {0}")]
    Journal(JournalError),

    /// The entity's recovery callback returned an error for a replayed
    /// event, a snapshot offer, or the recovery-completed signal.
    #[error(transparent)]
    Handler(E),
}

/// Error resolving a plugin id through a
/// [`PersistenceRegistry`](crate::PersistenceRegistry).
#[derive(Debug, Error)]
pub enum PluginError {
    /// No journal was registered under the requested plugin id.
    #[error("no journal registered under plugin id {0:?}")]
    UnknownJournal(String),

    /// No snapshot store was registered under the requested plugin id.
    #[error("no snapshot store registered under plugin id {0:?}")]
    UnknownSnapshotStore(String),

    /// A journal is registered under the id, but for a different event type.
    #[error("journal {id:?} serves a different event type")]
    JournalTypeMismatch {
        /// The plugin id that was looked up.
        id: String,
    },

    /// A snapshot store is registered under the id, but for a different
    /// snapshot type.
    #[error("snapshot store {id:?} serves a different snapshot type")]
    SnapshotTypeMismatch {
        /// The plugin id that was looked up.
        id: String,
    },
}

/// The entity task has exited, so no further commands can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("persistent entity is no longer running")]
pub struct EntityGone;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("account is frozen")]
    struct AccountFrozen;

    #[test]
    fn journal_error_rejected_display() {
        let err = JournalError::Rejected("payload too large".into());
        assert_eq!(
            err.to_string(),
            "event rejected by journal: payload too large"
        );
    }

    #[test]
    fn journal_error_unavailable_display() {
        assert_eq!(
            JournalError::Unavailable.to_string(),
            "journal is no longer running"
        );
    }

    #[test]
    fn recovery_failure_journal_display() {
        let err: RecoveryFailure<AccountFrozen> =
            RecoveryFailure::Journal(JournalError::Io("disk gone".into()));
        assert_eq!(
            err.to_string(),
            "journal replay failed: journal I/O failure: disk gone"
        );
    }

    #[test]
    fn recovery_failure_handler_is_transparent() {
        let err: RecoveryFailure<AccountFrozen> = RecoveryFailure::Handler(AccountFrozen);
        assert_eq!(err.to_string(), "account is frozen");
    }

    #[test]
    fn plugin_error_display_names_the_id() {
        let err = PluginError::UnknownJournal("validation".into());
        assert!(err.to_string().contains("\"validation\""));
    }

    #[test]
    fn entity_gone_display() {
        assert_eq!(
            EntityGone.to_string(),
            "persistent entity is no longer running"
        );
    }

    // Every error type here ends up inside mailbox messages at some point,
    // so losing Send or Sync on any of them is a compile break worth
    // catching in this file rather than at a distant call site.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<JournalError>();
            assert_send_sync::<SnapshotError>();
            assert_send_sync::<RecoveryFailure<AccountFrozen>>();
            assert_send_sync::<PluginError>();
            assert_send_sync::<EntityGone>();
        }
    };
}
