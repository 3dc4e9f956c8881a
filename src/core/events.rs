/// Change notifications delivered synchronously to registered listeners.

use crate::schema::connection::BoardConnection;
use crate::schema::node::Node;

#[derive(Debug, Clone)]
pub enum TreeEvent {
    /// Carries the node as it is after the new rank was applied.
    NodeAllocated(Node),
    /// Carries the node after its rank was reset to 0.
    NodeDeallocated(Node),
    BoardConnected(BoardConnection),
    BoardDisconnected(BoardConnection),
    StatsRecalculated,
}

/// Receives tree events. Implemented for any `FnMut(&TreeEvent)`.
pub trait TreeListener {
    fn on_event(&mut self, event: &TreeEvent);
}

impl<F> TreeListener for F
where
    F: FnMut(&TreeEvent),
{
    fn on_event(&mut self, event: &TreeEvent) {
        self(event)
    }
}

/// Handle returned by [`Listeners::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registered listeners, notified in subscription order.
#[derive(Default)]
pub struct Listeners {
    entries: Vec<(ListenerId, Box<dyn TreeListener>)>,
    next_id: u64,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Box<dyn TreeListener>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    /// Remove a listener, handing it back. Unknown ids return `None`.
    pub fn unsubscribe(&mut self, id: ListenerId) -> Option<Box<dyn TreeListener>> {
        let index = self.entries.iter().position(|(entry_id, _)| *entry_id == id)?;
        Some(self.entries.remove(index).1)
    }

    pub fn emit(&mut self, event: &TreeEvent) {
        for (_, listener) in &mut self.entries {
            listener.on_event(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}
