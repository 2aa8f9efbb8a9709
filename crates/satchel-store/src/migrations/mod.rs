//! Schema migrations, tracked through `PRAGMA user_version`.
//!
//! Every open walks [`STEPS`] and applies the ones above the stored version,
//! each in its own transaction together with the version bump. Several
//! processes may open the database at once, so the version is re-read under
//! the write lock before a step runs.

pub mod v001_initial;

use rusqlite::{Connection, TransactionBehavior};
use tracing::info;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Append only. The position + 1 is the version a step produces.
const STEPS: &[(&str, Step)] = &[("v001_initial", v001_initial::up)];

fn user_version(conn: &Connection) -> Result<usize> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    usize::try_from(v).map_err(|_| StoreError::Migration(format!("negative user_version {v}")))
}

pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let found = user_version(conn)?;
    if found > STEPS.len() {
        return Err(StoreError::Migration(format!(
            "database is at version {found}, this build knows {}",
            STEPS.len()
        )));
    }

    for (index, (name, step)) in STEPS.iter().enumerate().skip(found) {
        let target = index + 1;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if user_version(&tx)? >= target {
            continue;
        }
        info!(migration = name, target, "applying database migration");
        step(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", target as i64)?;
        tx.commit()?;
    }

    Ok(())
}
