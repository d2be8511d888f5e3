//! Identifier generation
//!
//! Every node of a build graph gets a fresh ID at creation time. The
//! generator is injected so tests can assert on predictable IDs.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Source of globally unique, opaque IDs
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> Uuid;
}

/// Random v4 UUIDs
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn new_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Counter-backed IDs (`00000000-0000-0000-0000-000000000001`, ...)
///
/// Unique within one generator only.
#[derive(Debug, Default)]
pub struct SequentialGenerator {
    next: AtomicU64,
}

impl SequentialGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialGenerator {
    fn new_id(&self) -> Uuid {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        Uuid::from_u128(n as u128)
    }
}
