//! The participant contract shared by every store.

use std::any::Any;
use std::fmt;

use async_trait::async_trait;

use crate::Result;

/// Lifecycle of a participant.
///
/// The only transitions are `Active -> Committed` and `Active -> Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Active,
    Committed,
    Aborted,
}

impl ParticipantState {
    /// Whether the participant has committed or aborted.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ParticipantState::Active)
    }
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantState::Active => write!(f, "active"),
            ParticipantState::Committed => write!(f, "committed"),
            ParticipantState::Aborted => write!(f, "aborted"),
        }
    }
}

/// One store session taking part in a use case.
///
/// `commit` and `rollback` are no-ops once the participant is terminal.
/// `dispose` releases the store session exactly once, whatever the
/// terminal state, and later calls do nothing.
#[async_trait]
pub trait TransactionParticipant: Send + Any {
    /// Store kind, used in logs.
    fn name(&self) -> &str;

    /// Current state.
    fn state(&self) -> ParticipantState;

    /// Whether `dispose` has run.
    fn is_disposed(&self) -> bool;

    /// Make the participant's writes durable.
    async fn commit(&mut self) -> Result<()>;

    /// Discard the participant's writes.
    async fn rollback(&mut self) -> Result<()>;

    /// Release the store session.
    async fn dispose(&mut self) -> Result<()>;

    /// Upcast for typed access through a context.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for typed access through a context.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
