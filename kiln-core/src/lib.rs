//! Kiln Core
//!
//! Core types for the Kiln build materializer.
//!
//! This crate contains:
//! - Domain types: stored pipelines, versions and the persisted build rows
//! - Definitions: the declarative pipeline document, its validator and normalizer
//! - Graph: the canonical build graph and its persisted/runtime projections
//! - Runtime: the execution-ready graph handed to an execution engine

pub mod definition;
pub mod domain;
pub mod graph;
pub mod id;
pub mod runtime;
