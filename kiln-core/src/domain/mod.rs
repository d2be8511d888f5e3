//! Core domain types
//!
//! This module contains the entities Kiln stores. Pipelines are owned by the
//! surrounding service; versions and build rows are written by the
//! orchestrator when a trigger is materialized.

pub mod build;
pub mod pipeline;
pub mod version;
