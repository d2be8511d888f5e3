//! Kiln Orchestrator
//!
//! Turns triggers into durable, dispatched builds.
//!
//! Architecture:
//! - Configuration: database and engine intake settings from the environment
//! - Repositories: pipeline lookups and transactional build writes (Postgres or in-memory)
//! - Services: version allocation, persistence, dispatch and the trigger entry points
//!
//! A trigger resolves a definition document, allocates the next version
//! number, builds one canonical graph, persists it atomically and only then
//! hands the execution-ready graph to the engine intake.

pub mod config;
pub mod db;
pub mod repository;
pub mod service;

pub use config::Config;
pub use repository::{BuildStore, MemoryStore, PgStore, StoreError};
pub use service::{BuildService, ChannelIntake, Dispatcher, EngineIntake, MaterializeError};
