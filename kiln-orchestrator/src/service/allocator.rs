//! Version Allocator
//!
//! Picks the next version number of a pipeline inside the materialization's
//! write transaction. The transaction holds the pipeline's sequence lock from
//! the max-read until it commits or rolls back, so two triggers on the same
//! pipeline never see the same maximum.

use uuid::Uuid;

use crate::repository::{Result, StoreTransaction};

/// Lock the pipeline's sequence and return the next free number
pub async fn allocate_number(tx: &mut dyn StoreTransaction, pipeline_id: Uuid) -> Result<i64> {
    let max = tx.lock_max_number(pipeline_id).await?;
    let number = next_number(max);

    tracing::debug!("Allocated version {} for pipeline {}", number, pipeline_id);

    Ok(number)
}

/// Numbers start at 1 and grow by one
pub fn next_number(max: Option<i64>) -> i64 {
    max.map_or(1, |n| n + 1)
}
