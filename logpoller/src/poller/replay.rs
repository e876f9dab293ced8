use std::future::Future;
use std::sync::atomic::Ordering;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconcile::BackfillMode;
use super::{PollerCore, ReplayRequest};
use crate::client::LogPollerClient;
use crate::db::LogPollerDb;
use crate::{LogPollerError, LogPollerResult};

impl<C, D> PollerCore<C, D>
where
    C: LogPollerClient,
    D: LogPollerDb,
{
    /// Run `fut` unless the service stops or the caller gives up first.
    async fn unless_cancelled<T>(
        &self,
        caller: &CancellationToken,
        fut: impl Future<Output = LogPollerResult<T>>,
    ) -> LogPollerResult<T> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(LogPollerError::Shutdown),
            _ = caller.cancelled() => Err(LogPollerError::ReplayRequestAborted),
            res = fut => res,
        }
    }

    /// Re-process the chain from `from_block`. Blocks up to the stored
    /// finalized block are backfilled right away, the rest is handed to the
    /// main loop and awaited.
    ///
    /// Cancelling `caller` before the main loop accepted the request fails
    /// with [`LogPollerError::ReplayRequestAborted`] and the request is
    /// dropped unprocessed. Once accepted, the replay completes anyway and
    /// [`LogPollerError::ReplayInProgress`] is returned.
    pub(crate) async fn replay(
        &self,
        caller: &CancellationToken,
        from_block: u64,
    ) -> LogPollerResult<()> {
        debug!(from_block, "Replaying from block");
        let latest = self
            .unless_cancelled(caller, async {
                self.client
                    .head_by_number(None)
                    .await
                    .map_err(LogPollerError::from)
            })
            .await?;
        if from_block < 1 || from_block > latest.number {
            return Err(LogPollerError::InvalidReplayBlock {
                requested: from_block,
                latest: latest.number,
            });
        }

        // nothing below the saved finalized block can reorg, so no race with
        // the main loop
        let saved_finalized = self
            .unless_cancelled(caller, async {
                self.db
                    .select_latest_block()
                    .await
                    .map(|last| last.map_or(0, |b| b.finalized_block_number))
                    .map_err(LogPollerError::from)
            })
            .await?;
        if from_block <= saved_finalized {
            self.unless_cancelled(
                caller,
                self.backfill(from_block, saved_finalized, saved_finalized, BackfillMode::Append),
            )
            .await?;
        }

        let from_block = from_block.max(saved_finalized + 1);
        if from_block > latest.number {
            return Ok(());
        }

        let (accepted, mut accepted_rx) = oneshot::channel();
        let (respond, done) = oneshot::channel();
        let request = ReplayRequest {
            from_block,
            accepted,
            respond,
        };
        self.unless_cancelled(caller, async {
            self.replay_tx
                .send(request)
                .await
                .map_err(|_| LogPollerError::Shutdown)
        })
        .await?;

        // queued is not accepted, the caller may still withdraw the request
        tokio::select! {
            biased;
            res = &mut accepted_rx => res.map_err(|_| LogPollerError::Shutdown)?,
            _ = self.shutdown.cancelled() => return Err(LogPollerError::Shutdown),
            _ = caller.cancelled() => {
                // closing first settles a race with the main loop accepting
                accepted_rx.close();
                if accepted_rx.try_recv().is_err() {
                    return Err(LogPollerError::ReplayRequestAborted);
                }
            }
        }

        tokio::select! {
            biased;
            res = done => res.unwrap_or(Err(LogPollerError::Shutdown)),
            _ = self.shutdown.cancelled() => Err(LogPollerError::Shutdown),
            // the main loop finishes the replay regardless
            _ = caller.cancelled() => Err(LogPollerError::ReplayInProgress),
        }
    }

    /// `min(requested, last processed block)`, so a replay never skips
    /// blocks that were not processed yet.
    pub(crate) async fn get_replay_from_block(&self, requested: u64) -> LogPollerResult<u64> {
        Ok(match self.db.select_latest_block().await? {
            Some(last) => requested.min(last.block_number),
            None => requested,
        })
    }

    pub(crate) async fn handle_replay_request(&self, request: ReplayRequest) {
        let ReplayRequest {
            from_block: requested,
            accepted,
            respond,
        } = request;
        if respond.is_closed() || accepted.send(()).is_err() {
            debug!(requested, "Replay request withdrawn by caller, skipping");
            return;
        }
        let result = self.execute_replay(requested).await;
        let result = if self.shutdown.is_cancelled() {
            Err(LogPollerError::Shutdown)
        } else {
            result
        };
        if let Err(Err(err)) = respond.send(result) {
            // the caller stopped waiting
            error!(?err, requested, "Replay failed");
        }
    }

    async fn execute_replay(&self, requested: u64) -> LogPollerResult<()> {
        let from_block = self.get_replay_from_block(requested).await.map_err(|err| {
            error!(?err, "Error executing replay, could not get from block");
            err
        })?;
        if !self.filters_loaded.load(Ordering::SeqCst) {
            warn!(from_block, requested, "Received replay request before filters loaded");
            self.load_filters().await.map_err(|err| {
                error!(?err, from_block, "Failed loading filters during replay");
                err
            })?;
        }
        info!(from_block, requested, "Executing replay");
        self.poll_and_save_logs(from_block).await?;
        info!(from_block, requested, "Executing replay finished");
        Ok(())
    }
}
