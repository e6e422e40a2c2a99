//! FIFO of event-handler invocations awaiting journal confirmation.

use std::collections::VecDeque;

use crate::context::EntityContext;
use crate::entity::PersistentEntity;

/// A persist handler awaiting its write confirmation.
pub(crate) type Handler<A> = Box<
    dyn FnOnce(
            &mut EntityContext<A>,
            <A as PersistentEntity>::Event,
        ) -> Result<(), <A as PersistentEntity>::Error>
        + Send,
>;

/// Which persist flavor queued an invocation. Stashing invocations defer
/// further commands until their handler has run; Async ones do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InvocationKind {
    Stashing,
    Async,
}

struct PendingInvocation<A: PersistentEntity> {
    kind: InvocationKind,
    // `None` once the handler has been taken for invocation; the entry
    // itself stays queued until the write completes, so the stashing
    // counter keeps matching the queue while the handler runs.
    handler: Option<Handler<A>>,
}

/// FIFO of pending invocations plus the count of Stashing entries.
///
/// Invariant: `stashing_count` equals the number of Stashing entries in
/// the queue at every quiescent point.
pub(crate) struct PendingInvocations<A: PersistentEntity> {
    queue: VecDeque<PendingInvocation<A>>,
    stashing_count: usize,
}

impl<A: PersistentEntity> PendingInvocations<A> {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            stashing_count: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn stashing_count(&self) -> usize {
        self.stashing_count
    }

    pub(crate) fn push_stashing(&mut self, handler: Handler<A>) {
        self.stashing_count += 1;
        self.queue.push_back(PendingInvocation {
            kind: InvocationKind::Stashing,
            handler: Some(handler),
        });
    }

    pub(crate) fn push_async(&mut self, handler: Handler<A>) {
        self.queue.push_back(PendingInvocation {
            kind: InvocationKind::Async,
            handler: Some(handler),
        });
    }

    /// Take the front entry's handler for invocation, leaving the entry
    /// queued until [`pop_front`](Self::pop_front) completes the write.
    pub(crate) fn take_front_handler(&mut self) -> Option<Handler<A>> {
        self.queue
            .front_mut()
            .and_then(|invocation| invocation.handler.take())
    }

    /// Complete the front invocation, maintaining the stashing counter.
    pub(crate) fn pop_front(&mut self) -> Option<InvocationKind> {
        let invocation = self.queue.pop_front()?;
        if invocation.kind == InvocationKind::Stashing {
            self.stashing_count -= 1;
        }
        Some(invocation.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::test_fixtures::Recorder;

    fn noop() -> Handler<Recorder> {
        Box::new(|_, _| Ok(()))
    }

    #[test]
    fn counter_tracks_stashing_entries() {
        let mut pending = PendingInvocations::<Recorder>::new();
        pending.push_async(noop());
        pending.push_stashing(noop());
        pending.push_stashing(noop());
        pending.push_async(noop());

        assert_eq!(pending.len(), 4);
        assert_eq!(pending.stashing_count(), 2);

        assert_eq!(pending.pop_front(), Some(InvocationKind::Async));
        assert_eq!(pending.stashing_count(), 2);
        assert_eq!(pending.pop_front(), Some(InvocationKind::Stashing));
        assert_eq!(pending.stashing_count(), 1);
        assert_eq!(pending.pop_front(), Some(InvocationKind::Stashing));
        assert_eq!(pending.stashing_count(), 0);
        assert_eq!(pending.pop_front(), Some(InvocationKind::Async));
        assert_eq!(pending.pop_front(), None);
    }

    #[test]
    fn take_front_handler_leaves_entry_queued() {
        let mut pending = PendingInvocations::<Recorder>::new();
        pending.push_stashing(noop());

        let handler = pending.take_front_handler();
        assert!(handler.is_some());
        // The entry is still queued, and the counter still includes it.
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.stashing_count(), 1);
        // A second take yields nothing until the entry is popped.
        assert!(pending.take_front_handler().is_none());

        assert_eq!(pending.pop_front(), Some(InvocationKind::Stashing));
        assert_eq!(pending.stashing_count(), 0);
        assert!(pending.is_empty());
    }

    #[test]
    fn pop_on_empty_queue_is_none() {
        let mut pending = PendingInvocations::<Recorder>::new();
        assert_eq!(pending.pop_front(), None);
        assert_eq!(pending.stashing_count(), 0);
    }
}
