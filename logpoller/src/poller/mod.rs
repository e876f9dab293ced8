//! The polling engine: a main loop following the chain tip and a background
//! loop running the backup poller and pruning, sharing one store, one chain
//! client and one filter registry.

use std::collections::BTreeMap;
use std::fmt::{self, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, info_span, warn, Instrument};

use crate::api::check_topic_index;
use crate::client::LogPollerClient;
use crate::db::LogPollerDb;
use crate::query::{Expression, LimitAndSort};
use crate::{
    Filter, FilterRegistry, Log, LogPollerApi, LogPollerBlock, LogPollerError, LogPollerResult,
};

mod backup;
mod prune;
mod reconcile;
mod replay;

#[cfg(test)]
mod tests;

/// When a block is considered final.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalityPolicy {
    /// A fixed number of blocks behind the head
    Depth(u64),
    /// Whatever the node reports for the `finalized` block tag
    Tag,
}

impl Default for FinalityPolicy {
    fn default() -> Self {
        FinalityPolicy::Depth(50)
    }
}

impl Serialize for FinalityPolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            FinalityPolicy::Depth(depth) => serializer.serialize_u64(*depth),
            FinalityPolicy::Tag => serializer.serialize_str("finalized"),
        }
    }
}

impl<'de> Deserialize<'de> for FinalityPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de;

        struct FinalityPolicyVisitor;

        impl<'de> de::Visitor<'de> for FinalityPolicyVisitor {
            type Value = FinalityPolicy;

            fn expecting(&self, f: &mut Formatter) -> fmt::Result {
                f.write_str("finality as a block depth or \"finalized\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(FinalityPolicy::Depth(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                let v = u64::try_from(v).map_err(de::Error::custom)?;
                self.visit_u64(v)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match v.parse::<u64>() {
                    Ok(v) => self.visit_u64(v),
                    Err(_) if v == "finalized" => Ok(FinalityPolicy::Tag),
                    Err(_) => Err(de::Error::invalid_value(de::Unexpected::Str(v), &self)),
                }
            }
        }

        deserializer.deserialize_any(FinalityPolicyVisitor)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Tuning of the log poller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Opts {
    /// Interval between polls of the chain head, in milliseconds
    #[serde(with = "millis", rename = "poll_period_ms")]
    pub poll_period: Duration,
    /// When a block is considered final
    pub finality: FinalityPolicy,
    /// Width of the block ranges fetched while backfilling
    pub backfill_batch_size: u64,
    /// Maximum calls per JSON-RPC batch
    pub rpc_batch_size: u64,
    /// Number of blocks kept below the finalized block
    pub keep_finalized_blocks_depth: u64,
    /// Backup poller interval in poll periods, zero disables it
    pub backup_poller_block_delay: u64,
    /// Rows removed per pruning pass, zero removes everything eligible
    pub log_prune_page_size: u64,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(15),
            finality: FinalityPolicy::default(),
            backfill_batch_size: 1000,
            rpc_batch_size: 100,
            keep_finalized_blocks_depth: 1000,
            backup_poller_block_delay: 100,
            log_prune_page_size: 0,
        }
    }
}

/// A request to re-process the chain from `from_block` in the main loop.
#[derive(Debug)]
pub(crate) struct ReplayRequest {
    pub from_block: u64,
    /// Signalled once the main loop takes the request on
    pub accepted: oneshot::Sender<()>,
    pub respond: oneshot::Sender<LogPollerResult<()>>,
}

/// State shared by the two loops and the API.
#[derive(Debug)]
pub(crate) struct PollerCore<C, D> {
    pub client: C,
    pub db: D,
    pub opts: Opts,
    pub registry: FilterRegistry,
    pub finality_violated: AtomicBool,
    pub filters_loaded: AtomicBool,
    /// First block of the next backup pass, unset until its first run
    pub backup_next_block: Mutex<Option<u64>>,
    pub shutdown: CancellationToken,
    pub replay_tx: mpsc::Sender<ReplayRequest>,
}

/// Scale `period` by a random factor in `[0.9, 1.1]`.
pub(crate) fn with_jitter(period: Duration) -> Duration {
    period.mul_f64(rand::thread_rng().gen_range(0.9..=1.1))
}

/// Indexes the logs matched by the registered filters for one chain.
#[derive(Debug)]
pub struct LogPoller<C, D> {
    core: Arc<PollerCore<C, D>>,
    name: String,
    replay_rx: Mutex<Option<mpsc::Receiver<ReplayRequest>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<C, D> LogPoller<C, D>
where
    C: LogPollerClient + 'static,
    D: LogPollerDb + 'static,
{
    /// A stopped log poller. Nothing touches the chain or the store until
    /// [`start`](Self::start).
    pub fn new(client: C, db: D, opts: Opts) -> Self {
        let (replay_tx, replay_rx) = mpsc::channel(1);
        let name = format!("LogPoller({})", client.chain_id());
        let core = PollerCore {
            client,
            db,
            opts,
            registry: FilterRegistry::default(),
            finality_violated: AtomicBool::new(false),
            filters_loaded: AtomicBool::new(false),
            backup_next_block: Mutex::new(None),
            shutdown: CancellationToken::new(),
            replay_tx,
        };
        Self {
            core: Arc::new(core),
            name,
            replay_rx: Mutex::new(Some(replay_rx)),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn core(&self) -> &PollerCore<C, D> {
        &self.core
    }

    /// Spawn the main and background loops. Fails on any call but the first.
    pub fn start(&self) -> LogPollerResult<()> {
        let Some(replay_rx) = self.replay_rx.lock().take() else {
            return Err(LogPollerError::AlreadyStarted);
        };
        info!(name = %self.name, "Starting log poller");
        let main = tokio::spawn(
            self.core
                .clone()
                .run(replay_rx)
                .instrument(info_span!("LogPoller", name = %self.name)),
        );
        let background = tokio::spawn(
            self.core
                .clone()
                .run_background()
                .instrument(info_span!("LogPollerBackground", name = %self.name)),
        );
        self.tasks.lock().extend([main, background]);
        Ok(())
    }

    /// Stop both loops and wait for them. A pending replay fails with
    /// [`LogPollerError::Shutdown`].
    pub async fn close(&self) -> LogPollerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(name = %self.name, "Stopping log poller");
        self.core.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                error!(?err, "Log poller task panicked");
            }
        }
        Ok(())
    }

    /// Error while a reorg deeper than the finality depth is unresolved.
    pub fn healthy(&self) -> LogPollerResult<()> {
        if self.core.finality_violated.load(Ordering::SeqCst) {
            return Err(LogPollerError::FinalityViolated);
        }
        Ok(())
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replay from `from_block` in the background, logging the outcome.
    pub fn replay_async(&self, from_block: u64) {
        let core = self.core.clone();
        let task = tokio::spawn(async move {
            let shutdown = core.shutdown.clone();
            if let Err(err) = core.replay(&shutdown, from_block).await {
                error!(?err, from_block, "Async replay failed");
            }
        });
        self.tasks.lock().push(task);
    }

    /// Block until the main loop re-processed the chain from `from_block`.
    pub async fn replay(&self, cancel: &CancellationToken, from_block: u64) -> LogPollerResult<()> {
        self.core.replay(cancel, from_block).await
    }
}

#[async_trait]
impl<C, D> LogPollerApi for LogPoller<C, D>
where
    C: LogPollerClient + 'static,
    D: LogPollerDb + 'static,
{
    fn start(&self) -> LogPollerResult<()> {
        LogPoller::start(self)
    }

    async fn close(&self) -> LogPollerResult<()> {
        LogPoller::close(self).await
    }

    fn healthy(&self) -> LogPollerResult<()> {
        LogPoller::healthy(self)
    }

    fn name(&self) -> &str {
        LogPoller::name(self)
    }

    async fn replay(&self, cancel: &CancellationToken, from_block: u64) -> LogPollerResult<()> {
        LogPoller::replay(self, cancel, from_block).await
    }

    fn replay_async(&self, from_block: u64) {
        LogPoller::replay_async(self, from_block)
    }

    async fn register_filter(&self, filter: Filter) -> LogPollerResult<()> {
        self.core.registry.register(&self.core.db, filter).await
    }

    async fn unregister_filter(&self, name: &str) -> LogPollerResult<()> {
        self.core.registry.unregister(&self.core.db, name).await
    }

    async fn has_filter(&self, name: &str) -> bool {
        self.core.registry.has_filter(name).await
    }

    async fn get_filters(&self) -> BTreeMap<String, Filter> {
        self.core.registry.filters().await
    }

    async fn latest_block(&self) -> LogPollerResult<Option<LogPollerBlock>> {
        Ok(self.core.db.select_latest_block().await?)
    }

    async fn block_by_number(&self, number: u64) -> LogPollerResult<Option<LogPollerBlock>> {
        Ok(self.core.db.select_block_by_number(number).await?)
    }

    async fn get_blocks_range(&self, numbers: &[u64]) -> LogPollerResult<Vec<LogPollerBlock>> {
        self.core.get_blocks_range(numbers).await
    }

    async fn filtered_logs(
        &self,
        filter: &[Expression],
        limit_and_sort: &LimitAndSort,
        query_name: &str,
    ) -> LogPollerResult<Vec<Log>> {
        for index in filter.iter().flat_map(Expression::topic_indices) {
            check_topic_index(index)?;
        }
        let logs = self
            .core
            .db
            .filtered_logs(filter, limit_and_sort)
            .instrument(debug_span!("filtered_logs", query = query_name))
            .await?;
        Ok(logs)
    }
}

impl<C, D> PollerCore<C, D>
where
    C: LogPollerClient,
    D: LogPollerDb,
{
    async fn run(self: Arc<Self>, mut replay_rx: mpsc::Receiver<ReplayRequest>) {
        let poll_tick = sleep(Duration::ZERO);
        tokio::pin!(poll_tick);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(request) = replay_rx.recv() => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.handle_replay_request(request) => {}
                    }
                }
                _ = &mut poll_tick => {
                    poll_tick
                        .as_mut()
                        .reset(Instant::now() + with_jitter(self.opts.poll_period));
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.poll_tick() => {}
                    }
                }
            }
        }
        // pending requests fail with `Shutdown` once their sender is dropped
        replay_rx.close();
        debug!("Main loop stopped");
    }

    async fn run_background(self: Arc<Self>) {
        // stagger the backup poller behind the first poll
        let backup_tick = sleep(Duration::from_millis(100));
        // let the node settle before pruning
        let block_prune_tick = sleep(Duration::from_secs(5 * 60));
        let log_prune_tick = sleep(Duration::from_secs(10 * 60));
        tokio::pin!(backup_tick, block_prune_tick, log_prune_tick);
        let period = self.opts.poll_period;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = &mut backup_tick => {
                    let delay = self.opts.backup_poller_block_delay;
                    if delay == 0 {
                        // disabled
                        backup_tick.as_mut().reset(Instant::now() + with_jitter(period * 1000));
                        continue;
                    }
                    let delay = u32::try_from(delay).unwrap_or(u32::MAX);
                    backup_tick
                        .as_mut()
                        .reset(Instant::now() + with_jitter(period.saturating_mul(delay)));
                    if !self.filters_loaded.load(Ordering::SeqCst) {
                        warn!("Backup log poller ran before filters loaded, skipping");
                        continue;
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        res = self.backup_poll_and_save_logs() => if let Err(err) = res {
                            warn!(?err, "Backup poller failed");
                        }
                    }
                }
                _ = &mut block_prune_tick => {
                    let next = match self.prune_old_blocks().await {
                        Ok(true) => period * 1000,
                        // faster while pruning can't keep up
                        Ok(false) => period * 100,
                        Err(err) => {
                            error!(?err, "Unable to prune old blocks");
                            period * 1000
                        }
                    };
                    block_prune_tick.as_mut().reset(Instant::now() + with_jitter(next));
                }
                _ = &mut log_prune_tick => {
                    // 2401 = 7^5 shares no factor with 1000
                    let next = match self.prune_expired_logs().await {
                        Ok(true) => period * 2401,
                        Ok(false) => period * 241,
                        Err(err) => {
                            error!(?err, "Unable to prune expired logs");
                            period * 2401
                        }
                    };
                    log_prune_tick.as_mut().reset(Instant::now() + with_jitter(next));
                }
            }
        }
        debug!("Background loop stopped");
    }

    pub(crate) async fn load_filters(&self) -> LogPollerResult<()> {
        self.registry.load(&self.db).await?;
        self.filters_loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// One tick of the main loop: resume after the latest stored block, or
    /// at the latest finalized block on a fresh chain.
    pub(crate) async fn poll_tick(&self) {
        if !self.filters_loaded.load(Ordering::SeqCst) {
            if let Err(err) = self.load_filters().await {
                error!(?err, "Failed loading filters in main log poller loop, retrying later");
                return;
            }
        }

        let start = match self.db.select_latest_block().await {
            Ok(Some(last)) => last.block_number + 1,
            Ok(None) => match self.latest_blocks().await {
                Ok((latest, 0)) => {
                    warn!(
                        latest = latest.number,
                        "Insufficient number of blocks on chain, waiting for finality depth"
                    );
                    return;
                }
                Ok((_, finalized)) => finalized,
                Err(err) => {
                    warn!(?err, "Unable to get latest for first poll");
                    return;
                }
            },
            Err(err) => {
                error!(?err, "Unable to get starting block");
                return;
            }
        };

        if let Err(err) = self.poll_and_save_logs(start).await {
            warn!(?err, start, "Polling for logs failed, retrying");
        }
    }
}
