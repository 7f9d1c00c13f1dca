//! Aggregate root abstraction.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::event::DomainEvent;

/// Trait for aggregate roots that reconstitute from event history.
///
/// `Default` is the empty initial state a stream starts from; the serde
/// bounds give the snapshot form. Fields holding uncommitted events should
/// be `#[serde(skip)]` so they never end up in a snapshot.
pub trait AggregateRoot: Default + Serialize + DeserializeOwned + Send + Sync {
    /// The event type this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Apply an event to mutate internal state (used during reconstitution).
    ///
    /// Must be deterministic: the same events in the same order always
    /// produce the same state.
    fn apply(&mut self, event: &Self::Event);

    /// Returns uncommitted events produced by command handling.
    fn uncommitted_events(&self) -> &[Self::Event];

    /// Clears uncommitted events after persistence.
    fn clear_uncommitted_events(&mut self);

    /// Drains the uncommitted events.
    fn take_uncommitted_events(&mut self) -> Vec<Self::Event> {
        let events = self.uncommitted_events().to_vec();
        self.clear_uncommitted_events();
        events
    }
}

/// Replays `events` onto `state` in order.
pub fn replay<'a, A, I>(mut state: A, events: I) -> A
where
    A: AggregateRoot,
    I: IntoIterator<Item = &'a A::Event>,
    A::Event: 'a,
{
    for event in events {
        state.apply(event);
    }
    state
}
