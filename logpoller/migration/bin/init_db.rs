//! Create the log poller tables on an empty database, or apply whatever
//! migrations an existing one is missing.

use common::*;

mod common;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), DbErr> {
    let db = init().await?;

    let pending = Migrator::get_pending_migrations(&db).await?;
    if pending.is_empty() {
        tracing::info!("Log poller schema is up to date");
        return Ok(());
    }
    for migration in &pending {
        tracing::info!(migration = migration.name(), "Applying migration");
    }
    Migrator::up(&db, None).await?;

    Ok(())
}
