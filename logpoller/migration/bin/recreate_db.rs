//! Drop every log poller table and create them again from the migrations.

use common::*;

mod common;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), DbErr> {
    let db = init().await?;

    Migrator::down(&db, None).await?;
    Migrator::up(&db, None).await?;

    Ok(())
}
