//! Coordination of several participants as one logical unit.

use std::fmt;
use std::future::Future;

use scoped_futures::ScopedBoxFuture;
use tracing::{debug, error, warn};

use crate::{ParticipantState, Result, TransactionError, TransactionParticipant};

/// Future returned by a use case run inside a context.
type ScopeFuture<'a, 'c, T, E> = ScopedBoxFuture<'a, 'c, std::result::Result<T, E>>;

/// Terminal state of a [`TransactionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Pending,
    Committed,
    RolledBack,
}

impl ContextState {
    fn as_str(&self) -> &'static str {
        match self {
            ContextState::Pending => "pending",
            ContextState::Committed => "committed",
            ContextState::RolledBack => "rolled back",
        }
    }
}

/// Keyed registry of the participants taking part in one use case.
///
/// Participants are committed in registration order. There is no two-phase
/// commit: a failure part-way through leaves earlier participants committed
/// and the rest are rolled back by the caller (or by [`TransactionContext::scope`]).
///
/// A context dropped before [`TransactionContext::dispose`] ran (for example
/// because the future driving it was cancelled) rolls back and disposes its
/// participants on the current tokio runtime.
pub struct TransactionContext {
    participants: Vec<(String, Box<dyn TransactionParticipant>)>,
    state: ContextState,
    disposed: bool,
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionContext {
    pub fn new() -> Self {
        Self {
            participants: Vec::new(),
            state: ContextState::Pending,
            disposed: false,
        }
    }

    /// Run `f` inside a fresh context.
    ///
    /// On success the participants are committed; if `f` or the commit fails
    /// every open participant is rolled back. The participants are disposed
    /// in every case before this returns.
    ///
    /// ```rust,ignore
    /// let id = TransactionContext::run(|ctx| {
    ///     async move {
    ///         let users = ctx
    ///             .get_or_register("document", || DocumentParticipant::begin(&store))
    ///             .await?;
    ///         users.session_mut().insert("users", "u-1", json!({"name": "Ada"}));
    ///         Ok::<_, TransactionError>("u-1")
    ///     }
    ///     .scope_boxed()
    /// })
    /// .await?;
    /// ```
    pub async fn run<'a, F, T, E>(f: F) -> std::result::Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut TransactionContext) -> ScopeFuture<'a, 'c, T, E> + 'a,
        E: From<TransactionError> + fmt::Display,
    {
        Self::new().scope(f).await
    }

    /// Like [`TransactionContext::run`], on an existing context.
    pub async fn scope<'a, F, T, E>(mut self, f: F) -> std::result::Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut TransactionContext) -> ScopeFuture<'a, 'c, T, E> + 'a,
        E: From<TransactionError> + fmt::Display,
    {
        let outcome = match f(&mut self).await {
            Ok(value) => match self.commit().await {
                Ok(()) => Ok(value),
                Err(e) => {
                    self.rollback_logged().await;
                    Err(E::from(e))
                }
            },
            Err(e) => {
                debug!(error = %e, "Use case failed, rolling back");
                self.rollback_logged().await;
                Err(e)
            }
        };

        if let Err(e) = self.dispose().await {
            warn!(error = %e, "Failed to release transaction sessions");
        }
        outcome
    }

    /// Register `participant` under `key`.
    ///
    /// When a participant is already registered under `key` it is kept and
    /// returned, and `participant` is dropped without being disposed. Use
    /// [`TransactionContext::get_or_register`] to avoid opening a session
    /// that may be thrown away.
    pub fn register<P>(
        &mut self,
        key: impl Into<String>,
        participant: P,
    ) -> Result<&mut dyn TransactionParticipant>
    where
        P: TransactionParticipant,
    {
        self.ensure_pending()?;
        let key = key.into();
        let index = match self.position(&key) {
            Some(index) => index,
            None => {
                debug!(key = %key, store = participant.name(), "Participant registered");
                let participant: Box<dyn TransactionParticipant> = Box::new(participant);
                self.participants.push((key, participant));
                self.participants.len() - 1
            }
        };
        Ok(self.participants[index].1.as_mut())
    }

    /// Typed participant under `key`, opening one with `open` when absent.
    pub async fn get_or_register<P, F, Fut>(&mut self, key: &str, open: F) -> Result<&mut P>
    where
        P: TransactionParticipant,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<P>>,
    {
        self.ensure_pending()?;
        if self.position(key).is_none() {
            let participant = open().await?;
            debug!(key, store = participant.name(), "Participant registered");
            let participant: Box<dyn TransactionParticipant> = Box::new(participant);
            self.participants.push((key.to_string(), participant));
        }
        self.get_mut::<P>(key)?
            .ok_or_else(|| TransactionError::ParticipantType {
                key: key.to_string(),
                expected: std::any::type_name::<P>(),
            })
    }

    /// Participant under `key`.
    pub fn get(&self, key: &str) -> Option<&dyn TransactionParticipant> {
        self.position(key).map(|index| self.participants[index].1.as_ref())
    }

    /// Typed participant under `key`.
    ///
    /// Returns `Ok(None)` when nothing is registered under `key`, and an
    /// error when the registered participant has another type.
    pub fn get_mut<P: TransactionParticipant>(&mut self, key: &str) -> Result<Option<&mut P>> {
        let Some(index) = self.position(key) else {
            return Ok(None);
        };
        self.participants[index]
            .1
            .as_any_mut()
            .downcast_mut::<P>()
            .map(Some)
            .ok_or_else(|| TransactionError::ParticipantType {
                key: key.to_string(),
                expected: std::any::type_name::<P>(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// State of every participant, in registration order.
    pub fn participant_states(&self) -> Vec<(&str, ParticipantState)> {
        self.participants
            .iter()
            .map(|(key, p)| (key.as_str(), p.state()))
            .collect()
    }

    /// Commit every participant in registration order.
    ///
    /// Committing twice is a no-op; committing after a rollback is an error.
    /// If a participant fails the context stays pending so it can still be
    /// rolled back.
    pub async fn commit(&mut self) -> Result<()> {
        match self.state {
            ContextState::Committed => return Ok(()),
            ContextState::RolledBack => return Err(TransactionError::AlreadyRolledBack),
            ContextState::Pending => {}
        }

        for (key, participant) in self.participants.iter_mut() {
            participant
                .commit()
                .await
                .map_err(|e| TransactionError::participant(key.as_str(), e))?;
        }

        self.state = ContextState::Committed;
        debug!(participants = self.participants.len(), "Transaction committed");
        Ok(())
    }

    /// Roll back every participant that is still active.
    ///
    /// All participants are attempted even if one fails; the first failure is
    /// returned. Rolling back twice, or after a commit, is a no-op.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.state != ContextState::Pending {
            return Ok(());
        }

        let mut first_error = None;
        for (key, participant) in self.participants.iter_mut() {
            if let Err(e) = participant.rollback().await {
                error!(key = %key, error = %e, "Participant rollback failed");
                first_error.get_or_insert(TransactionError::participant(key.as_str(), e));
            }
        }

        self.state = ContextState::RolledBack;
        first_error.map_or(Ok(()), Err)
    }

    /// Release every participant's session. Runs at most once.
    pub async fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let mut first_error = None;
        for (key, participant) in self.participants.iter_mut() {
            if let Err(e) = participant.dispose().await {
                warn!(key = %key, error = %e, "Participant dispose failed");
                first_error.get_or_insert(TransactionError::participant(key.as_str(), e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn rollback_logged(&mut self) {
        if let Err(e) = self.rollback().await {
            error!(error = %e, "Rollback failed");
        }
    }

    fn ensure_pending(&self) -> Result<()> {
        match self.state {
            ContextState::Pending => Ok(()),
            other => Err(TransactionError::Closed(other.as_str())),
        }
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.participants.iter().position(|(k, _)| k == key)
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("participants", &self.participant_states())
            .field("state", &self.state)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if self.disposed || self.participants.is_empty() {
            return;
        }

        let participants = std::mem::take(&mut self.participants);
        warn!(
            participants = participants.len(),
            "Transaction context dropped before dispose, releasing sessions in the background"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for (key, mut participant) in participants {
                        if let Err(e) = participant.rollback().await {
                            error!(key = %key, error = %e, "Background rollback failed");
                        }
                        if let Err(e) = participant.dispose().await {
                            error!(key = %key, error = %e, "Background dispose failed");
                        }
                    }
                });
            }
            Err(_) => {
                error!("No tokio runtime available, store sessions were not released");
            }
        }
    }
}
