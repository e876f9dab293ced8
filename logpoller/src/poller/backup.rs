use tracing::{info, instrument, warn};

use super::reconcile::BackfillMode;
use super::PollerCore;
use crate::client::LogPollerClient;
use crate::db::LogPollerDb;
use crate::LogPollerResult;

impl<C, D> PollerCore<C, D>
where
    C: LogPollerClient,
    D: LogPollerDb,
{
    /// Re-fetch every block that became finalized since the last pass and
    /// make the stored logs of that range match the chain.
    ///
    /// Covers nodes that answered the first query for a block with missing
    /// logs, which the hash based reorg check cannot notice.
    #[instrument(skip(self))]
    pub(crate) async fn backup_poll_and_save_logs(&self) -> LogPollerResult<()> {
        let next = *self.backup_next_block.lock();
        let next = match next {
            Some(next) => next,
            None => {
                let Some(last) = self.db.select_latest_block().await? else {
                    warn!("Backup log poller ran before first successful log poller run, skipping");
                    return Ok(());
                };
                let start = last
                    .finalized_block_number
                    .saturating_sub(1)
                    .min(
                        last.block_number
                            .saturating_sub(self.opts.backup_poller_block_delay),
                    );
                *self.backup_next_block.lock() = Some(start);
                start
            }
        };

        let (_, finalized) = self.latest_blocks().await?;
        let Some(last_safe) = finalized.checked_sub(1).filter(|last| *last >= next) else {
            return Ok(());
        };

        info!(start = next, end = last_safe, "Backup poller started backfilling logs");
        self.backfill(next, last_safe, finalized, BackfillMode::Replace)
            .await?;
        info!(start = next, end = last_safe, "Backup poller finished backfilling");
        *self.backup_next_block.lock() = Some(last_safe + 1);
        Ok(())
    }
}
