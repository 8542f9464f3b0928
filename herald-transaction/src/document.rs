//! Document store participant.

use std::any::Any;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{ParticipantState, Result, TransactionParticipant};

/// A session on a document store that supports multi-document transactions.
#[async_trait]
pub trait DocumentSession: Send + 'static {
    /// Begin a transaction on this session.
    async fn start_transaction(&mut self) -> Result<()>;

    /// Commit the open transaction.
    async fn commit_transaction(&mut self) -> Result<()>;

    /// Abort the open transaction.
    async fn abort_transaction(&mut self) -> Result<()>;

    /// Release the session.
    async fn end_session(&mut self) -> Result<()>;

    /// Whether a transaction is currently open on this session.
    fn in_transaction(&self) -> bool;
}

/// Produces document sessions.
#[async_trait]
pub trait DocumentClient: Send + Sync {
    type Session: DocumentSession;

    /// Open a new session.
    async fn start_session(&self) -> Result<Self::Session>;
}

/// Participant wrapping one document session with an open transaction.
pub struct DocumentParticipant<S> {
    session: S,
    state: ParticipantState,
    disposed: bool,
}

impl<S: DocumentSession> DocumentParticipant<S> {
    /// Open a session on `client` and start a transaction on it.
    pub async fn begin<C>(client: &C) -> Result<Self>
    where
        C: DocumentClient<Session = S> + ?Sized,
    {
        let mut session = client.start_session().await?;
        if let Err(e) = session.start_transaction().await {
            if let Err(end_err) = session.end_session().await {
                warn!(error = %end_err, "Failed to end session after transaction start failed");
            }
            return Err(e);
        }
        Ok(Self::from_session(session))
    }

    /// Wrap a session whose transaction is already started.
    pub fn from_session(session: S) -> Self {
        Self {
            session,
            state: ParticipantState::Active,
            disposed: false,
        }
    }

    /// The wrapped session, for issuing writes.
    pub fn session(&self) -> &S {
        &self.session
    }

    /// The wrapped session, for issuing writes.
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

#[async_trait]
impl<S: DocumentSession> TransactionParticipant for DocumentParticipant<S> {
    fn name(&self) -> &str {
        "document"
    }

    fn state(&self) -> ParticipantState {
        self.state
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }

    async fn commit(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.session.commit_transaction().await?;
        self.state = ParticipantState::Committed;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.state = ParticipantState::Aborted;
        if self.session.in_transaction() {
            self.session.abort_transaction().await?;
        } else {
            debug!("Document session has no open transaction, nothing to abort");
        }
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.session.end_session().await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
