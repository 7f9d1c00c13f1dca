//! Command context threaded from a command handler into event metadata.

use uuid::Uuid;

use crate::event::EventDraft;

/// Tracing identifiers of the command that produced a batch of events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandContext {
    /// Correlation ID to trace this command through the system.
    pub correlation_id: Option<Uuid>,
    /// The command or event that caused the resulting events.
    pub causation_id: Option<Uuid>,
    /// Principal issuing the command.
    pub actor_id: Option<String>,
}

impl CommandContext {
    /// A context correlated (and caused) by a fresh command id.
    #[must_use]
    pub fn new(command_id: Uuid) -> Self {
        Self {
            correlation_id: Some(command_id),
            causation_id: Some(command_id),
            actor_id: None,
        }
    }

    /// Sets the acting principal.
    #[must_use]
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Stamps this context onto a draft.
    #[must_use]
    pub fn stamp(&self, mut draft: EventDraft) -> EventDraft {
        if let Some(id) = self.correlation_id {
            draft = draft.with_correlation_id(id);
        }
        if let Some(id) = self.causation_id {
            draft = draft.with_causation_id(id);
        }
        if let Some(actor) = &self.actor_id {
            draft = draft.with_actor_id(actor.clone());
        }
        draft
    }
}
