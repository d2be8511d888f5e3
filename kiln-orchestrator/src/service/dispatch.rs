//! Dispatcher
//!
//! Hands committed build graphs to the execution engine's intake. The
//! hand-off is fire-and-forget: nothing the engine does afterwards is
//! awaited, and a failed hand-off is reported, never retried.

use async_trait::async_trait;
use kiln_core::runtime;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::Config;

/// Errors handing a graph to the engine
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The engine stopped consuming
    #[error("engine intake is closed")]
    Closed,

    /// The engine is not keeping up
    #[error("engine intake is full")]
    Full,

    /// Any other intake-specific failure
    #[error("engine intake unreachable: {0}")]
    Unreachable(String),
}

/// Execution engine intake
///
/// Accepts one build graph for asynchronous processing; no result of the
/// processing itself is returned.
#[async_trait]
pub trait EngineIntake: Send + Sync {
    async fn submit(&self, build: runtime::Build) -> Result<(), DispatchError>;
}

/// Bounded in-process queue feeding an engine task
///
/// The engine side owns the [`mpsc::Receiver`] returned by [`ChannelIntake::new`].
#[derive(Debug, Clone)]
pub struct ChannelIntake {
    sender: mpsc::Sender<runtime::Build>,
}

impl ChannelIntake {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<runtime::Build>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn from_config(config: &Config) -> (Self, mpsc::Receiver<runtime::Build>) {
        Self::new(config.intake_capacity)
    }
}

#[async_trait]
impl EngineIntake for ChannelIntake {
    async fn submit(&self, build: runtime::Build) -> Result<(), DispatchError> {
        self.sender.try_send(build).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DispatchError::Full,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

/// Submits build graphs to an injected intake
#[derive(Clone)]
pub struct Dispatcher {
    intake: Arc<dyn EngineIntake>,
}

impl Dispatcher {
    pub fn new(intake: Arc<dyn EngineIntake>) -> Self {
        Self { intake }
    }

    /// Submit `build` once
    pub async fn dispatch(&self, build: runtime::Build) -> Result<(), DispatchError> {
        let build_id = build.id;
        let steps = build.steps().count();

        self.intake.submit(build).await?;

        tracing::info!("Build {} dispatched ({} steps)", build_id, steps);

        Ok(())
    }
}
