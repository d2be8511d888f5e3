//! Persister
//!
//! Writes the persisted projection of a build graph: one version row, one
//! build row, then every stage and step row, in graph order. Either all rows
//! commit together or the transaction is rolled back and none are visible.

use kiln_core::graph::PersistedGraph;

use crate::repository::{Result, StoreTransaction};

/// Write `records` through `tx` and commit
///
/// On any write failure the transaction is rolled back before the error is
/// returned.
pub async fn persist(mut tx: Box<dyn StoreTransaction>, records: &PersistedGraph) -> Result<()> {
    if let Err(err) = write_rows(tx.as_mut(), records).await {
        if let Err(rollback_err) = tx.rollback().await {
            tracing::warn!(
                "Rollback of version {} failed: {}",
                records.version.id,
                rollback_err
            );
        }
        return Err(err);
    }

    tx.commit().await?;

    tracing::debug!(
        "Persisted version {} (build {}, {} stages, {} steps)",
        records.version.number,
        records.build.id,
        records.stages.len(),
        records.steps.len()
    );

    Ok(())
}

async fn write_rows(tx: &mut dyn StoreTransaction, records: &PersistedGraph) -> Result<()> {
    tx.insert_version(&records.version).await?;
    tx.insert_build(&records.build).await?;

    for stage in &records.stages {
        tx.insert_stage(stage).await?;
    }

    for step in &records.steps {
        tx.insert_step(step).await?;
    }

    Ok(())
}
