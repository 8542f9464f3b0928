//! Key-value store participant.

use std::any::Any;

use async_trait::async_trait;
use tracing::debug;

use crate::{ParticipantState, Result, TransactionParticipant};

/// A batched command set that is applied atomically on `exec`.
#[async_trait]
pub trait KeyValuePipeline: Send + 'static {
    /// Number of commands waiting for `exec`.
    fn queued(&self) -> usize;

    /// Apply every queued command atomically.
    async fn exec(&mut self) -> Result<()>;

    /// Drop every queued command.
    async fn discard(&mut self) -> Result<()>;

    /// Release the connection behind the pipeline.
    async fn quit(&mut self) -> Result<()>;
}

/// Participant wrapping one key-value pipeline.
pub struct KeyValueParticipant<P> {
    pipeline: P,
    state: ParticipantState,
    disposed: bool,
}

impl<P: KeyValuePipeline> KeyValueParticipant<P> {
    pub fn new(pipeline: P) -> Self {
        Self {
            pipeline,
            state: ParticipantState::Active,
            disposed: false,
        }
    }

    /// The wrapped pipeline, for queueing commands.
    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    /// The wrapped pipeline, for queueing commands.
    pub fn pipeline_mut(&mut self) -> &mut P {
        &mut self.pipeline
    }
}

#[async_trait]
impl<P: KeyValuePipeline> TransactionParticipant for KeyValueParticipant<P> {
    fn name(&self) -> &str {
        "key-value"
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
        if self.pipeline.queued() > 0 {
            self.pipeline.exec().await?;
        }
        self.state = ParticipantState::Committed;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.state = ParticipantState::Aborted;
        if self.pipeline.queued() > 0 {
            self.pipeline.discard().await?;
        } else {
            debug!("Pipeline is empty, nothing to discard");
        }
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.pipeline.quit().await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingPipeline {
        queued: usize,
        execs: u32,
        discards: u32,
        quits: u32,
    }

    #[async_trait]
    impl KeyValuePipeline for CountingPipeline {
        fn queued(&self) -> usize {
            self.queued
        }

        async fn exec(&mut self) -> Result<()> {
            self.execs += 1;
            self.queued = 0;
            Ok(())
        }

        async fn discard(&mut self) -> Result<()> {
            self.discards += 1;
            self.queued = 0;
            Ok(())
        }

        async fn quit(&mut self) -> Result<()> {
            self.quits += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_empty_pipeline_commits_without_exec() {
        let mut participant = KeyValueParticipant::new(CountingPipeline::default());

        participant.commit().await.unwrap();

        assert_eq!(participant.state(), ParticipantState::Committed);
        assert_eq!(participant.pipeline().execs, 0);
    }

    #[tokio::test]
    async fn test_rollback_discards_queued_commands_once() {
        let mut participant = KeyValueParticipant::new(CountingPipeline {
            queued: 2,
            ..Default::default()
        });

        participant.rollback().await.unwrap();
        participant.rollback().await.unwrap();
        participant.commit().await.unwrap();

        assert_eq!(participant.state(), ParticipantState::Aborted);
        assert_eq!(participant.pipeline().discards, 1);
        assert_eq!(participant.pipeline().execs, 0);
    }

    #[tokio::test]
    async fn test_dispose_quits_once_after_commit() {
        let mut participant = KeyValueParticipant::new(CountingPipeline {
            queued: 1,
            ..Default::default()
        });

        participant.commit().await.unwrap();
        participant.dispose().await.unwrap();
        participant.dispose().await.unwrap();

        assert_eq!(participant.pipeline().execs, 1);
        assert_eq!(participant.pipeline().quits, 1);
    }
}
