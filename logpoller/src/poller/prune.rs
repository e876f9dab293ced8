use tracing::{debug, instrument};

use super::PollerCore;
use crate::client::LogPollerClient;
use crate::db::LogPollerDb;
use crate::LogPollerResult;

impl<C, D> PollerCore<C, D>
where
    C: LogPollerClient,
    D: LogPollerDb,
{
    /// Delete blocks more than `keep_finalized_blocks_depth` below the latest
    /// finalized block. Returns whether everything eligible is gone.
    #[instrument(skip(self))]
    pub(crate) async fn prune_old_blocks(&self) -> LogPollerResult<bool> {
        let Some(latest) = self.db.select_latest_block().await? else {
            return Ok(true);
        };
        let keep = self.opts.keep_finalized_blocks_depth;
        if latest.finalized_block_number <= keep {
            return Ok(true);
        }
        // 1-2-3-4-5(finalized)-6-7(latest) keeping 3 removes up to 2
        let page = self.opts.log_prune_page_size;
        let removed = self
            .db
            .delete_blocks_before(latest.finalized_block_number - keep, page)
            .await?;
        debug!(removed, "Pruned old blocks");
        Ok(page == 0 || removed < page)
    }

    /// Delete logs past the retention of every filter matching them.
    /// Returns whether everything eligible is gone.
    #[instrument(skip(self))]
    pub(crate) async fn prune_expired_logs(&self) -> LogPollerResult<bool> {
        let page = self.opts.log_prune_page_size;
        let removed = self.db.delete_expired_logs(page).await?;
        debug!(removed, "Pruned expired logs");
        Ok(page == 0 || removed < page)
    }
}
