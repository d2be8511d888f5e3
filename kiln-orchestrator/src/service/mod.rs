//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services orchestrate between repositories and contain domain logic.

pub mod allocator;
pub mod build;
pub mod dispatch;
pub mod persister;

pub use build::{BuildService, MaterializeError};
pub use dispatch::{ChannelIntake, DispatchError, Dispatcher, EngineIntake};
