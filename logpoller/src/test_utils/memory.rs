use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, H256};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::date_time;
use crate::db::{validate_logs, DbError, DbResult, LogPollerDb};
use crate::query::{Expression, LimitAndSort, SortBy, SortDirection};
use crate::{Confirmations, Filter, Log, LogPollerBlock};

#[derive(Debug, Default)]
struct Tables {
    blocks: BTreeMap<u64, LogPollerBlock>,
    /// keyed by `(block_number, log_index)`
    logs: BTreeMap<(u64, u64), Log>,
    filters: BTreeMap<String, Filter>,
}

/// In-memory [`LogPollerDb`] with the same semantics as the postgres store.
#[derive(Debug)]
pub struct MemoryDb {
    chain_id: u64,
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    /// `(read, resume)` for the next paused filter load
    filter_load_pause: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl MemoryDb {
    /// Empty store for `chain_id`.
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            tables: Mutex::new(Tables::default()),
            fail_writes: AtomicBool::new(false),
            filter_load_pause: Mutex::new(None),
        }
    }

    /// Make every following write fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, AtomicOrdering::SeqCst);
    }

    /// Stall the next `load_filters` after it read the table. The first
    /// handle is notified once the read happened, the load returns after the
    /// second one is notified.
    pub fn pause_next_filter_load(&self) -> (Arc<Notify>, Arc<Notify>) {
        let pause = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        *self.filter_load_pause.lock() = Some(pause.clone());
        pause
    }

    /// Every stored log in `(block_number, log_index)` order.
    pub fn all_logs(&self) -> Vec<Log> {
        self.tables.lock().logs.values().cloned().collect()
    }

    /// Every stored block in ascending order.
    pub fn all_blocks(&self) -> Vec<LogPollerBlock> {
        self.tables.lock().blocks.values().cloned().collect()
    }

    fn check_write(&self) -> DbResult<()> {
        if self.fail_writes.load(AtomicOrdering::SeqCst) {
            return Err(DbError::Other("injected write failure".into()));
        }
        Ok(())
    }

    fn put_block(tables: &mut Tables, block: &LogPollerBlock) {
        match tables.blocks.get(&block.block_number) {
            Some(stored) if stored.block_hash == block.block_hash => {}
            _ => {
                tables.blocks.insert(block.block_number, block.clone());
            }
        }
    }

    fn put_logs(tables: &mut Tables, logs: &[Log]) {
        for log in logs {
            tables
                .logs
                .entry((log.block_number, log.log_index))
                .or_insert_with(|| log.clone());
        }
    }
}

fn eval(expr: &Expression, log: &Log, latest: Option<&LogPollerBlock>) -> DbResult<bool> {
    Ok(match expr {
        Expression::And(exprs) => {
            for expr in exprs {
                if !eval(expr, log, latest)? {
                    return Ok(false);
                }
            }
            true
        }
        Expression::Or(exprs) => {
            for expr in exprs {
                if eval(expr, log, latest)? {
                    return Ok(true);
                }
            }
            false
        }
        Expression::Address(address) => log.address == *address,
        Expression::EventSig(sig) => log.event_sig == *sig,
        Expression::Topic { index, op, value } => {
            if !(1..=3).contains(index) {
                return Err(DbError::InvalidQuery(format!("topic index {index}")));
            }
            log.topic(*index).map_or(false, |topic| op.compare(&topic, value))
        }
        Expression::DataWord { index, op, value } => log
            .data_word(*index)
            .map_or(false, |word| op.compare(&word, value)),
        Expression::Block { number, op } => op.compare(&log.block_number, number),
        Expression::Timestamp { at, op } => op.compare(&log.block_timestamp, at),
        Expression::CreatedAt { at, op } => op.compare(&log.created_at, at),
        Expression::TxHash(hash) => log.tx_hash == *hash,
        Expression::Confirmations(Confirmations::Unconfirmed) => true,
        Expression::Confirmations(confs) => latest
            .and_then(|latest| confs.max_block(latest))
            .map_or(false, |max| log.block_number <= max),
    })
}

fn directed(ordering: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

fn sequence(log: &Log) -> (u64, H256, u64) {
    (log.block_number, log.tx_hash, log.log_index)
}

fn sort_and_limit(mut logs: Vec<Log>, limit_and_sort: &LimitAndSort) -> Vec<Log> {
    let mut keys = Vec::new();
    let cursor = limit_and_sort
        .limit
        .and_then(|limit| limit.cursor.map(|cursor| (cursor, limit.direction)));
    if let Some((cursor, direction)) = cursor {
        let at = (cursor.block_number, cursor.tx_hash, cursor.log_index);
        logs.retain(|log| directed(sequence(log).cmp(&at), direction) == Ordering::Greater);
        keys.push(SortBy::Sequence(direction));
    }
    keys.extend(limit_and_sort.sort_by.iter().copied());

    if keys.is_empty() {
        logs.sort_by_key(|log| (log.block_number, log.log_index));
    } else {
        logs.sort_by(|a, b| {
            keys.iter().fold(Ordering::Equal, |ord, key| {
                ord.then_with(|| match *key {
                    SortBy::Block(d) => directed(a.block_number.cmp(&b.block_number), d),
                    SortBy::Timestamp(d) => directed(a.block_timestamp.cmp(&b.block_timestamp), d),
                    SortBy::Sequence(d) => directed(sequence(a).cmp(&sequence(b)), d),
                })
            })
        });
    }
    if let Some(limit) = limit_and_sort.limit {
        logs.truncate(limit.count as usize);
    }
    logs
}

#[async_trait]
impl LogPollerDb for MemoryDb {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn insert_evm_chain(&self) -> DbResult<()> {
        self.check_write()
    }

    async fn insert_block(&self, block: &LogPollerBlock) -> DbResult<()> {
        self.check_write()?;
        Self::put_block(&mut self.tables.lock(), block);
        Ok(())
    }

    async fn insert_logs(&self, logs: &[Log]) -> DbResult<()> {
        self.check_write()?;
        validate_logs(self.chain_id, logs)?;
        Self::put_logs(&mut self.tables.lock(), logs);
        Ok(())
    }

    async fn insert_logs_with_block(&self, logs: &[Log], block: &LogPollerBlock) -> DbResult<()> {
        self.check_write()?;
        validate_logs(self.chain_id, logs)?;
        let mut tables = self.tables.lock();
        Self::put_block(&mut tables, block);
        Self::put_logs(&mut tables, logs);
        Ok(())
    }

    async fn replace_logs_in_range(
        &self,
        start: u64,
        end: u64,
        addresses: &[Address],
        event_sigs: &[H256],
        logs: &[Log],
        block: Option<&LogPollerBlock>,
    ) -> DbResult<()> {
        self.check_write()?;
        validate_logs(self.chain_id, logs)?;
        let mut tables = self.tables.lock();
        tables.logs.retain(|(number, _), log| {
            !((start..=end).contains(number)
                && addresses.contains(&log.address)
                && event_sigs.contains(&log.event_sig))
        });
        Self::put_logs(&mut tables, logs);
        if let Some(block) = block {
            Self::put_block(&mut tables, block);
        }
        Ok(())
    }

    async fn delete_logs_and_blocks_after(&self, start: u64) -> DbResult<()> {
        self.check_write()?;
        let mut tables = self.tables.lock();
        tables.blocks.retain(|number, _| *number < start);
        tables.logs.retain(|(number, _), _| *number < start);
        Ok(())
    }

    async fn delete_blocks_before(&self, end: u64, limit: u64) -> DbResult<u64> {
        self.check_write()?;
        let mut tables = self.tables.lock();
        let Some(oldest) = tables.blocks.keys().next().copied() else {
            return Ok(0);
        };
        let upper = if limit > 0 {
            oldest.saturating_add(limit - 1).min(end)
        } else {
            end
        };
        let before = tables.blocks.len();
        tables.blocks.retain(|number, _| *number > upper);
        Ok((before - tables.blocks.len()) as u64)
    }

    async fn delete_expired_logs(&self, limit: u64) -> DbResult<u64> {
        self.check_write()?;
        let mut tables = self.tables.lock();
        let filters: Vec<_> = tables.filters.values().cloned().collect();
        let expired: Vec<_> = tables
            .logs
            .iter()
            .filter(|(_, log)| {
                let matching: Vec<_> = filters
                    .iter()
                    .filter(|f| f.matches(&log.address, &log.event_sig))
                    .collect();
                if matching.is_empty() || matching.iter().any(|f| f.retention.is_zero()) {
                    return false;
                }
                let retention = matching
                    .iter()
                    .map(|f| f.retention)
                    .max()
                    .unwrap_or_default();
                log.block_timestamp <= date_time::ago(retention)
            })
            .map(|(key, _)| *key)
            .take(if limit > 0 { limit as usize } else { usize::MAX })
            .collect();
        for key in &expired {
            tables.logs.remove(key);
        }
        Ok(expired.len() as u64)
    }

    async fn insert_filter(&self, filter: &Filter) -> DbResult<()> {
        self.check_write()?;
        self.tables
            .lock()
            .filters
            .insert(filter.name.clone(), filter.clone());
        Ok(())
    }

    async fn delete_filter(&self, name: &str) -> DbResult<u64> {
        self.check_write()?;
        Ok(self.tables.lock().filters.remove(name).map_or(0, |_| 1))
    }

    async fn load_filters(&self) -> DbResult<BTreeMap<String, Filter>> {
        let filters = self.tables.lock().filters.clone();
        let pause = self.filter_load_pause.lock().take();
        if let Some((read, resume)) = pause {
            read.notify_one();
            resume.notified().await;
        }
        Ok(filters)
    }

    async fn select_block_by_number(&self, number: u64) -> DbResult<Option<LogPollerBlock>> {
        Ok(self.tables.lock().blocks.get(&number).cloned())
    }

    async fn select_latest_block(&self) -> DbResult<Option<LogPollerBlock>> {
        Ok(self.tables.lock().blocks.values().next_back().cloned())
    }

    async fn select_oldest_block(&self, min_allowed: u64) -> DbResult<Option<LogPollerBlock>> {
        Ok(self
            .tables
            .lock()
            .blocks
            .range(min_allowed..)
            .next()
            .map(|(_, block)| block.clone()))
    }

    async fn get_blocks_range(&self, start: u64, end: u64) -> DbResult<Vec<LogPollerBlock>> {
        if start > end {
            return Ok(vec![]);
        }
        Ok(self
            .tables
            .lock()
            .blocks
            .range(start..=end)
            .map(|(_, block)| block.clone())
            .collect())
    }

    async fn filtered_logs(
        &self,
        filter: &[Expression],
        limit_and_sort: &LimitAndSort,
    ) -> DbResult<Vec<Log>> {
        let tables = self.tables.lock();
        let latest = tables.blocks.values().next_back();
        let mut matched = Vec::new();
        for log in tables.logs.values() {
            if eval(&Expression::And(filter.to_vec()), log, latest)? {
                matched.push(log.clone());
            }
        }
        drop(tables);
        Ok(sort_and_limit(matched, limit_and_sort))
    }
}
