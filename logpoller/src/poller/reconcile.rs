use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;

use ethers::types::Log as EthLog;
use sea_orm::prelude::TimeDateTime;
use tracing::{debug, error, info, instrument, warn};

use super::{FinalityPolicy, PollerCore};
use crate::client::{
    block_tag, BatchElem, BlockSelector, ClientError, ClientResult, LogPollerClient,
};
use crate::db::LogPollerDb;
use crate::{date_time, Head, Log, LogPollerBlock, LogPollerError, LogPollerResult};

/// How a backfilled range is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BackfillMode {
    /// Insert what was fetched next to what is stored
    Append,
    /// Replace the stored matching logs of the range with what was fetched
    Replace,
}

impl<C, D> PollerCore<C, D>
where
    C: LogPollerClient,
    D: LogPollerDb,
{
    /// The chain head and the number of the latest finalized block.
    pub(crate) async fn latest_blocks(&self) -> LogPollerResult<(Head, u64)> {
        match self.opts.finality {
            FinalityPolicy::Depth(depth) => {
                let latest = self.client.head_by_number(None).await?;
                let finalized = latest.number.saturating_sub(depth);
                Ok((latest, finalized))
            }
            FinalityPolicy::Tag => {
                let mut heads = self
                    .batch_fetch_heads(vec!["latest".to_owned(), "finalized".to_owned()])
                    .await?
                    .into_iter();
                let (Some(latest), Some(finalized)) = (heads.next(), heads.next()) else {
                    return Err(LogPollerError::BlocksNotFound(vec![]));
                };
                let (latest, finalized) = (latest?, finalized?);
                debug!(
                    latest = latest.number,
                    finalized = finalized.number,
                    "Latest blocks read from chain"
                );
                Ok((latest, finalized.number))
            }
        }
    }

    /// Fetch and store everything from `current` up to the chain head,
    /// rewinding first if the chain reorganised under the stored blocks.
    #[instrument(skip(self))]
    pub(crate) async fn poll_and_save_logs(&self, mut current: u64) -> LogPollerResult<()> {
        debug!("Polling for logs");
        let (latest, finalized) = self.latest_blocks().await?;
        if current > latest.number {
            // a chain that got shorter is caught once it outgrows us again
            debug!(latest = latest.number, "No new blocks since last poll");
            return Ok(());
        }

        let known = (current == latest.number).then_some(latest);
        let mut head = self.current_block_maybe_handle_reorg(current, known).await?;
        current = head.number;

        // finalized blocks go in batches without reorg checks, the block
        // at `finalized` is still stored for the next parent check
        if let Some(last_safe) = finalized.checked_sub(1).filter(|last| *last >= current) {
            info!(start = current, end = last_safe, "Backfilling logs");
            self.backfill(current, last_safe, finalized, BackfillMode::Append)
                .await?;
            current = last_safe + 1;
        }
        if current > head.number {
            head = self.current_block_maybe_handle_reorg(current, None).await?;
            current = head.number;
        }

        loop {
            let query = self
                .registry
                .aggregate()
                .await
                .log_query(BlockSelector::Hash(head.hash));
            let eth_logs = self.client.filter_logs(&query).await?;
            debug!(
                logs = eth_logs.len(),
                block = current,
                hash = ?head.hash,
                timestamp = head.timestamp,
                "Unfinalized log query"
            );
            let block = LogPollerBlock::new(
                self.db.chain_id(),
                head.hash,
                current,
                date_time::from_unix_timestamp_s(head.timestamp),
                finalized,
            );
            let timestamps = BTreeMap::from([(current, block.block_timestamp)]);
            let logs = self.convert_logs(&eth_logs, &timestamps)?;
            self.db.insert_logs_with_block(&logs, &block).await?;

            current += 1;
            if current > latest.number {
                return Ok(());
            }
            head = self.current_block_maybe_handle_reorg(current, None).await?;
            current = head.number;
        }
    }

    /// The chain block at `number`, or the first block after the common
    /// ancestor when the stored parent no longer matches. A successful check
    /// clears the finality violation flag.
    pub(crate) async fn current_block_maybe_handle_reorg(
        &self,
        number: u64,
        known: Option<Head>,
    ) -> LogPollerResult<Head> {
        let result = self.check_reorg(number, known).await;
        if result.is_ok() {
            self.finality_violated.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn check_reorg(&self, number: u64, known: Option<Head>) -> LogPollerResult<Head> {
        let head = match known {
            Some(head) => head,
            None => {
                let head = self.client.head_by_number(Some(number)).await?;
                if head.number != number {
                    warn!(
                        block = number,
                        got = head.number,
                        "Unable to get current block, rpc returned incorrect block"
                    );
                    return Err(LogPollerError::BlockMismatch {
                        have: head.number,
                        want: number,
                    });
                }
                head
            }
        };

        let expected_parent = match number.checked_sub(1) {
            Some(parent) => self.db.select_block_by_number(parent).await?,
            None => None,
        };
        let Some(expected_parent) = expected_parent else {
            info!(
                block = number,
                "Do not have previous block, first poll ever on new chain or after backfill"
            );
            return Ok(head);
        };
        if head.parent_hash == expected_parent.block_hash {
            return Ok(head);
        }

        let after_lca = self
            .find_block_after_lca(head, expected_parent.finalized_block_number)
            .await?;
        info!(
            block_after_lca = after_lca.number,
            block = number,
            "Reorg detected"
        );
        self.db.delete_logs_and_blocks_after(after_lca.number).await?;
        Ok(after_lca)
    }

    /// Walk the chain's parents down from `current` until one matches the
    /// stored block at its height. Never walks below `finalized`.
    pub(crate) async fn find_block_after_lca(
        &self,
        current: Head,
        finalized: u64,
    ) -> LogPollerResult<Head> {
        let mut after_lca = current;
        let mut parent = self.client.head_by_hash(current.parent_hash).await?;
        while parent.number >= finalized {
            if parent.number.checked_add(1) != Some(after_lca.number) {
                // each step must go exactly one block down
                return Err(LogPollerError::BlockMismatch {
                    have: parent.number,
                    want: after_lca.number.saturating_sub(1),
                });
            }
            let ours = self
                .db
                .select_block_by_number(parent.number)
                .await?
                .ok_or_else(|| LogPollerError::BlocksNotFound(vec![parent.number]))?;
            if ours.block_hash == parent.hash {
                return Ok(after_lca);
            }
            after_lca = parent;
            if parent.number == 0 {
                break;
            }
            parent = self.client.head_by_hash(parent.parent_hash).await?;
        }

        error!(
            critical = true,
            block = current.number,
            finalized,
            finality = ?self.opts.finality,
            "Reorg greater than finality depth detected"
        );
        self.finality_violated.store(true, Ordering::SeqCst);
        Err(LogPollerError::ReorgTooDeep {
            block: current.number,
            finalized,
        })
    }

    /// Fetch the logs of `[start, end]` in ranges of at most
    /// `backfill_batch_size` blocks, halving the range while the node
    /// reports too many results. Blocks written along the logs carry
    /// `finalized` as their finalized block number.
    #[instrument(skip(self))]
    pub(crate) async fn backfill(
        &self,
        start: u64,
        end: u64,
        finalized: u64,
        mode: BackfillMode,
    ) -> LogPollerResult<()> {
        let mut batch_size = self.opts.backfill_batch_size.max(1);
        let mut from = start;
        while from <= end {
            let to = from.saturating_add(batch_size - 1).min(end);
            let aggregate = self.registry.aggregate().await;
            let query = aggregate.log_query(BlockSelector::Range { from, to });
            let eth_logs = match self.client.filter_logs(&query).await {
                Ok(logs) => logs,
                Err(err) if !err.is_limit_exceeded() => {
                    error!(?err, from, to, "Unable to query for logs");
                    return Err(err.into());
                }
                Err(err) if batch_size == 1 => {
                    error!(
                        critical = true,
                        ?err,
                        from,
                        to,
                        backfill_batch_size = self.opts.backfill_batch_size,
                        "Too many log results in a single block, failed to retrieve logs! \
                         Node may be running in a degraded state."
                    );
                    return Err(err.into());
                }
                Err(err) => {
                    batch_size /= 2;
                    warn!(
                        ?err,
                        from,
                        to,
                        new_batch_size = batch_size,
                        backfill_batch_size = self.opts.backfill_batch_size,
                        "Too many log results, halving block range batch size. \
                         Consider increasing the backfill batch size if this happens frequently"
                    );
                    continue;
                }
            };

            let (logs, last_block) = if eth_logs.is_empty() {
                (vec![], None)
            } else {
                let blocks = self.blocks_from_logs(&eth_logs).await?;
                let timestamps = blocks
                    .iter()
                    .map(|b| (b.block_number, b.block_timestamp))
                    .collect();
                let logs = self.convert_logs(&eth_logs, &timestamps)?;
                let last_block = blocks.into_iter().last().map(|mut block| {
                    block.finalized_block_number = finalized;
                    block
                });
                (logs, last_block)
            };
            debug!(from, to, logs = logs.len(), "Backfill found logs");

            match (mode, last_block) {
                (BackfillMode::Append, Some(block)) => {
                    self.db.insert_logs_with_block(&logs, &block).await?
                }
                (BackfillMode::Append, None) => {}
                (BackfillMode::Replace, block) => {
                    self.db
                        .replace_logs_in_range(
                            from,
                            to,
                            &aggregate.addresses,
                            &aggregate.event_sigs,
                            &logs,
                            block.as_ref(),
                        )
                        .await?
                }
            }
            from = to + 1;
        }
        Ok(())
    }

    /// Blocks of `logs` in ascending order, one per distinct number.
    async fn blocks_from_logs(&self, logs: &[EthLog]) -> LogPollerResult<Vec<LogPollerBlock>> {
        let numbers = logs
            .iter()
            .map(|log| {
                log.block_number
                    .map(|n| n.as_u64())
                    .ok_or(LogPollerError::MalformedLog("block number"))
            })
            .collect::<LogPollerResult<BTreeSet<u64>>>()?;
        self.get_blocks_range(&numbers.into_iter().collect::<Vec<_>>())
            .await
    }

    /// Convert rpc logs, taking block timestamps from `timestamps`.
    pub(crate) fn convert_logs(
        &self,
        logs: &[EthLog],
        timestamps: &BTreeMap<u64, TimeDateTime>,
    ) -> LogPollerResult<Vec<Log>> {
        let chain_id = self.db.chain_id();
        logs.iter()
            .map(|log| {
                let block_number = log
                    .block_number
                    .ok_or(LogPollerError::MalformedLog("block number"))?
                    .as_u64();
                let event_sig = *log
                    .topics
                    .first()
                    .ok_or(LogPollerError::MalformedLog("event signature"))?;
                Ok(Log {
                    evm_chain_id: chain_id,
                    log_index: log
                        .log_index
                        .ok_or(LogPollerError::MalformedLog("log index"))?
                        .low_u64(),
                    block_hash: log
                        .block_hash
                        .ok_or(LogPollerError::MalformedLog("block hash"))?,
                    block_number,
                    block_timestamp: timestamps
                        .get(&block_number)
                        .copied()
                        .ok_or(LogPollerError::BlocksNotFound(vec![block_number]))?,
                    address: log.address,
                    event_sig,
                    topics: log.topics.clone(),
                    tx_hash: log
                        .transaction_hash
                        .ok_or(LogPollerError::MalformedLog("transaction hash"))?,
                    data: log.data.to_vec(),
                    created_at: date_time::now(),
                })
            })
            .collect()
    }

    /// Blocks for `numbers`, in the same order, from the store where
    /// possible and from the chain otherwise.
    pub(crate) async fn get_blocks_range(
        &self,
        numbers: &[u64],
    ) -> LogPollerResult<Vec<LogPollerBlock>> {
        let (Some(min), Some(max)) = (numbers.iter().min(), numbers.iter().max()) else {
            return Ok(vec![]);
        };
        let requested: BTreeSet<u64> = numbers.iter().copied().collect();

        let mut found: BTreeMap<u64, LogPollerBlock> = match self.db.get_blocks_range(*min, *max).await
        {
            Ok(blocks) => blocks
                .into_iter()
                .filter(|b| requested.contains(&b.block_number))
                .map(|b| (b.block_number, b))
                .collect(),
            Err(err) => {
                warn!(
                    ?err,
                    ?numbers,
                    "Error while retrieving blocks from the blocks table, falling back to RPC"
                );
                BTreeMap::new()
            }
        };

        let remaining: Vec<u64> = requested
            .iter()
            .copied()
            .filter(|n| !found.contains_key(n))
            .collect();
        if !remaining.is_empty() {
            debug!(?remaining, "Falling back to RPC for blocks not in the blocks table");
            let chain_id = self.db.chain_id();
            let heads = self
                .batch_fetch_heads(remaining.iter().map(|n| block_tag(*n)).collect())
                .await?;
            for head in heads {
                let head = match head {
                    Ok(head) => head,
                    // reported below
                    Err(ClientError::BlockNotFound(_)) => continue,
                    Err(err) => return Err(err.into()),
                };
                let timestamp = date_time::from_unix_timestamp_s(head.timestamp);
                let mut block = LogPollerBlock::new(chain_id, head.hash, head.number, timestamp, 0);
                block.created_at = timestamp;
                found.insert(head.number, block);
            }
        }

        let missing: Vec<u64> = numbers
            .iter()
            .copied()
            .filter(|n| !found.contains_key(n))
            .collect();
        if !missing.is_empty() {
            return Err(LogPollerError::BlocksNotFound(missing));
        }
        Ok(numbers.iter().filter_map(|n| found.get(n).cloned()).collect())
    }

    /// `eth_getBlockByNumber` for every tag, in batches of `rpc_batch_size`.
    /// A failed batch fails the whole call, a failed element only its own
    /// result.
    async fn batch_fetch_heads(&self, tags: Vec<String>) -> LogPollerResult<Vec<ClientResult<Head>>> {
        let mut batch: Vec<BatchElem> = tags.into_iter().map(BatchElem::block_by_number).collect();
        for chunk in batch.chunks_mut(self.opts.rpc_batch_size.max(1) as usize) {
            self.client.batch_call(chunk).await?;
        }
        Ok(batch.into_iter().map(BatchElem::into_head).collect())
    }
}
