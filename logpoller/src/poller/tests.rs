use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, Log as EthLog, H256};
use ethers::utils::keccak256;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use super::reconcile::BackfillMode;
use super::*;
use crate::client::{BatchElem, ClientError, ClientResult, LogQuery};
use crate::query::{Comparator, SortBy, SortDirection};
use crate::test_utils::{MemoryDb, SimulatedChain};
use crate::{date_time, evm_word, Confirmations, Head};

mockall::mock! {
    pub Client {}

    impl Debug for Client {
        fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
    }

    #[async_trait]
    impl LogPollerClient for Client {
        fn chain_id(&self) -> u64;
        async fn head_by_number(&self, number: Option<u64>) -> ClientResult<Head>;
        async fn head_by_hash(&self, hash: H256) -> ClientResult<Head>;
        async fn filter_logs(&self, query: &LogQuery) -> ClientResult<Vec<EthLog>>;
        async fn batch_call(&self, batch: &mut [BatchElem]) -> ClientResult<()>;
    }
}

const CHAIN_ID: u64 = 1337;

type TestPoller = LogPoller<Arc<SimulatedChain>, Arc<MemoryDb>>;

fn event_sig(signature: &str) -> H256 {
    H256::from(keccak256(signature))
}

fn address(i: u64) -> Address {
    Address::from_low_u64_be(i)
}

fn test_opts() -> Opts {
    Opts {
        poll_period: Duration::from_millis(10),
        finality: FinalityPolicy::Depth(2),
        backfill_batch_size: 3,
        rpc_batch_size: 2,
        keep_finalized_blocks_depth: 100,
        backup_poller_block_delay: 0,
        log_prune_page_size: 0,
    }
}

fn setup_with(opts: Opts) -> (Arc<SimulatedChain>, Arc<MemoryDb>, TestPoller) {
    let chain = Arc::new(SimulatedChain::new(CHAIN_ID));
    let db = Arc::new(MemoryDb::new(CHAIN_ID));
    let lp = LogPoller::new(chain.clone(), db.clone(), opts);
    (chain, db, lp)
}

fn setup() -> (Arc<SimulatedChain>, Arc<MemoryDb>, TestPoller) {
    setup_with(test_opts())
}

fn block_numbers(logs: &[Log]) -> Vec<u64> {
    logs.iter().map(|log| log.block_number).collect()
}

async fn wait_for_block(lp: &TestPoller, number: u64) {
    timeout(Duration::from_secs(5), async {
        loop {
            let latest = lp.latest_block().await.unwrap();
            if latest.map_or(false, |b| b.block_number >= number) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("log poller did not reach block");
}

#[tokio::test]
async fn reorg_removes_orphaned_logs() {
    let (chain, _db, lp) = setup();
    let (emitter, log1) = (address(0xa), event_sig("Log1(uint256)"));
    lp.register_filter(Filter::new("log1", [log1], [emitter]))
        .await
        .unwrap();

    for number in 1..=6 {
        if number == 2 || number == 5 {
            chain.emit(emitter, vec![log1], evm_word(number).as_bytes().to_vec());
        }
        chain.mine();
    }

    lp.core().poll_and_save_logs(1).await.unwrap();
    let logs = lp.logs(1, 6, log1, emitter).await.unwrap();
    assert_eq!(block_numbers(&logs), vec![2, 5]);
    assert_eq!(logs[0].data_word(0), Some(evm_word(2)));

    // replace blocks 5 and 6, the new block 5 carries no Log1
    let orphaned = chain.head_at(5).unwrap();
    chain.fork(4);
    chain.mine_many(3);
    assert_ne!(chain.head_at(5).unwrap().hash, orphaned.hash);

    lp.core().poll_tick().await;
    let logs = lp.logs(1, 6, log1, emitter).await.unwrap();
    assert_eq!(block_numbers(&logs), vec![2]);

    let latest = lp.latest_block().await.unwrap().unwrap();
    assert_eq!(latest.block_number, 7);
    assert_eq!(latest.block_hash, chain.latest().hash);
    let block5 = lp.block_by_number(5).await.unwrap().unwrap();
    assert_eq!(block5.block_hash, chain.head_at(5).unwrap().hash);
    assert!(lp.healthy().is_ok());
}

#[tokio::test]
async fn repeated_reorgs_converge_on_the_canonical_chain() {
    let (chain, db, lp) = setup();
    let emitter = address(0xa);
    let sig = event_sig("Transfer(address,address,uint256)");
    lp.register_filter(Filter::new("transfers", [sig], [emitter]))
        .await
        .unwrap();

    chain.mine_many(4);
    lp.core().poll_and_save_logs(1).await.unwrap();

    for round in 0..3u64 {
        let fork_at = chain.latest().number - 1;
        chain.fork(fork_at);
        chain.emit(emitter, vec![sig, evm_word(round)], vec![]);
        chain.mine();
        chain.mine();
        lp.core().poll_tick().await;

        let latest = chain.latest();
        for block in db.all_blocks() {
            if block.block_number > latest.number.saturating_sub(2) {
                let canonical = chain.head_at(block.block_number).unwrap();
                assert_eq!(block.block_hash, canonical.hash, "round {round}");
            }
        }
        let canonical_hashes: Vec<H256> = (0..=latest.number)
            .filter_map(|n| chain.head_at(n))
            .map(|h| h.hash)
            .collect();
        assert!(db
            .all_logs()
            .iter()
            .all(|log| canonical_hashes.contains(&log.block_hash)));
    }
    assert_eq!(db.all_logs().len(), 3);
}

#[tokio::test]
async fn reorg_below_finality_is_reported() {
    let (chain, db, lp) = setup();
    lp.register_filter(Filter::new("f", [event_sig("E()")], [address(1)]))
        .await
        .unwrap();
    chain.mine_many(6);
    lp.core().poll_and_save_logs(1).await.unwrap();
    assert_eq!(
        db.all_blocks().iter().map(|b| b.block_number).collect::<Vec<_>>(),
        vec![4, 5, 6]
    );

    // everything above 2 changes, past the finalized block 4
    chain.fork(2);
    chain.mine_many(5);

    let err = lp.core().poll_and_save_logs(7).await.unwrap_err();
    assert!(matches!(
        err,
        LogPollerError::ReorgTooDeep {
            block: 7,
            finalized: 4
        }
    ));
    assert!(matches!(lp.healthy(), Err(LogPollerError::FinalityViolated)));
    // nothing was rewound
    assert_eq!(db.all_blocks().len(), 3);

    // once the stored blocks are dropped the next check succeeds again
    db.delete_logs_and_blocks_after(3).await.unwrap();
    lp.core().poll_and_save_logs(3).await.unwrap();
    assert!(lp.healthy().is_ok());
    assert_eq!(
        lp.latest_block().await.unwrap().unwrap().block_hash,
        chain.latest().hash
    );
}

#[tokio::test]
async fn walk_rejects_parents_that_skip_heights() {
    let parent = Head {
        hash: H256::repeat_byte(2),
        parent_hash: H256::repeat_byte(1),
        number: 3,
        timestamp: 0,
    };
    let mut client = MockClient::new();
    client.expect_chain_id().return_const(CHAIN_ID);
    client
        .expect_head_by_hash()
        .returning(move |_| Ok(parent));
    let lp = LogPoller::new(client, MemoryDb::new(CHAIN_ID), test_opts());

    let current = Head {
        hash: H256::repeat_byte(3),
        parent_hash: parent.hash,
        number: 5,
        timestamp: 0,
    };
    let err = lp.core().find_block_after_lca(current, 1).await.unwrap_err();
    assert!(matches!(err, LogPollerError::BlockMismatch { have: 3, want: 4 }));
}

#[tokio::test]
async fn wrong_block_from_rpc_is_a_mismatch() {
    let mut client = MockClient::new();
    client.expect_chain_id().return_const(CHAIN_ID);
    client.expect_head_by_number().returning(|_| {
        Ok(Head {
            hash: H256::repeat_byte(4),
            parent_hash: H256::repeat_byte(3),
            number: 4,
            timestamp: 0,
        })
    });
    let lp = LogPoller::new(client, MemoryDb::new(CHAIN_ID), test_opts());

    let err = lp
        .core()
        .current_block_maybe_handle_reorg(5, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LogPollerError::BlockMismatch { have: 4, want: 5 }));
}

#[tokio::test]
async fn backfill_halves_the_range_on_limit_errors() {
    let (chain, db, lp) = setup_with(Opts {
        backfill_batch_size: 8,
        ..test_opts()
    });
    let (emitter, sig) = (address(0xa), event_sig("Tick(uint256)"));
    lp.register_filter(Filter::new("ticks", [sig], [emitter]))
        .await
        .unwrap();
    for i in 1..=8 {
        chain.emit(emitter, vec![sig], evm_word(i).as_bytes().to_vec());
        chain.mine();
    }
    chain.set_range_limit(Some(2));

    lp.core()
        .backfill(1, 8, 8, BackfillMode::Append)
        .await
        .unwrap();

    // [1, 8] and [1, 4] fail, then four ranges of two blocks
    assert_eq!(chain.filter_calls(), 6);
    assert_eq!(block_numbers(&db.all_logs()), (1..=8).collect::<Vec<_>>());
    // only the last block of every range is written
    assert!(db.all_blocks().iter().all(|b| b.finalized_block_number == 8));
    assert_eq!(
        db.all_blocks().iter().map(|b| b.block_number).collect::<Vec<_>>(),
        vec![2, 4, 6, 8]
    );
}

#[tokio::test]
#[traced_test]
async fn backfill_gives_up_on_a_single_block() {
    let (chain, db, lp) = setup_with(Opts {
        backfill_batch_size: 4,
        ..test_opts()
    });
    lp.register_filter(Filter::new("f", [event_sig("E()")], [address(1)]))
        .await
        .unwrap();
    chain.mine_many(4);
    chain.set_range_limit(Some(0));

    let err = lp
        .core()
        .backfill(1, 4, 4, BackfillMode::Append)
        .await
        .unwrap_err();
    assert!(matches!(err, LogPollerError::Client(ref e) if e.is_limit_exceeded()));
    // 4, 2, 1
    assert_eq!(chain.filter_calls(), 3);
    assert!(db.all_logs().is_empty());
    assert!(logs_contain("Node may be running in a degraded state"));
}

#[tokio::test]
async fn backfill_aborts_on_other_rpc_errors() {
    let mut client = MockClient::new();
    client.expect_chain_id().return_const(CHAIN_ID);
    client
        .expect_filter_logs()
        .times(1)
        .returning(|_| Err(ClientError::Provider("connection reset".into())));
    let lp = LogPoller::new(client, MemoryDb::new(CHAIN_ID), test_opts());

    let err = lp
        .core()
        .backfill(1, 10, 10, BackfillMode::Append)
        .await
        .unwrap_err();
    assert!(matches!(err, LogPollerError::Client(ClientError::Provider(_))));
}

#[tokio::test]
async fn backup_poller_repairs_missed_logs() {
    let (chain, db, lp) = setup_with(Opts {
        backup_poller_block_delay: 100,
        ..test_opts()
    });
    let (emitter, sig) = (address(0xa), event_sig("Deposit(uint256)"));
    lp.register_filter(Filter::new("deposits", [sig], [emitter]))
        .await
        .unwrap();
    for number in 1..=10 {
        if number == 2 || number == 3 {
            chain.emit(emitter, vec![sig], vec![]);
        }
        chain.mine();
    }

    // a lagging node misses block 3 during the first backfill
    chain.hide_logs(3, true);
    lp.core().poll_and_save_logs(1).await.unwrap();
    assert_eq!(block_numbers(&db.all_logs()), vec![2]);

    // a log the chain does not have
    let mut stale = db.all_logs()[0].clone();
    stale.block_number = 5;
    stale.log_index = 7;
    db.insert_logs(&[stale]).await.unwrap();

    chain.hide_logs(3, false);
    lp.core().backup_poll_and_save_logs().await.unwrap();
    assert_eq!(block_numbers(&db.all_logs()), vec![2, 3]);
    assert_eq!(*lp.core().backup_next_block.lock(), Some(8));

    // nothing finalized since
    let calls = chain.filter_calls();
    lp.core().backup_poll_and_save_logs().await.unwrap();
    assert_eq!(chain.filter_calls(), calls);
}

#[tokio::test]
async fn backup_poller_waits_for_the_first_poll() {
    let (chain, db, lp) = setup();
    chain.mine_many(10);
    lp.core().backup_poll_and_save_logs().await.unwrap();
    assert_eq!(chain.filter_calls(), 0);
    assert!(db.all_logs().is_empty());
    assert_eq!(*lp.core().backup_next_block.lock(), None);
}

#[tokio::test]
async fn first_poll_starts_at_the_finalized_block() {
    let (chain, db, lp) = setup();
    let (emitter, sig) = (address(0xa), event_sig("E(uint256)"));
    lp.register_filter(Filter::new("e", [sig], [emitter]))
        .await
        .unwrap();
    chain.emit(emitter, vec![sig], vec![]);
    chain.mine_many(10);

    lp.core().poll_tick().await;
    // the log in block 1 is older than the finalized block 8
    assert!(db.all_logs().is_empty());
    assert_eq!(
        db.all_blocks().iter().map(|b| b.block_number).collect::<Vec<_>>(),
        vec![8, 9, 10]
    );
    assert!(lp.core().filters_loaded.load(Ordering::SeqCst));
}

#[tokio::test]
async fn fresh_chain_waits_for_a_finalized_block() {
    let (chain, db, lp) = setup();
    chain.mine_many(2);
    lp.core().poll_tick().await;
    assert!(db.all_blocks().is_empty());
}

#[tokio::test]
async fn finalized_tag_is_read_from_the_node() {
    let (chain, db, lp) = setup_with(Opts {
        finality: FinalityPolicy::Tag,
        ..test_opts()
    });
    lp.register_filter(Filter::new("f", [event_sig("E()")], [address(1)]))
        .await
        .unwrap();
    chain.set_finality_depth(3);
    let head = chain.mine_many(10);

    let (latest, finalized) = lp.core().latest_blocks().await.unwrap();
    assert_eq!(latest, head);
    assert_eq!(finalized, 7);

    lp.core().poll_and_save_logs(7).await.unwrap();
    assert!(db.all_blocks().iter().all(|b| b.finalized_block_number == 7));
}

#[tokio::test]
async fn replay_indexes_a_late_filter() {
    let (chain, db, lp) = setup();
    let (a, b) = (address(0xa), address(0xb));
    let sig = event_sig("Sent(uint256)");
    db.insert_filter(&Filter::new("a", [sig], [a])).await.unwrap();
    for number in 1..=10 {
        match number {
            3 => chain.emit(a, vec![sig], vec![]),
            4 | 9 => chain.emit(b, vec![sig], vec![]),
            _ => {}
        }
        chain.mine();
    }

    lp.start().unwrap();
    wait_for_block(&lp, 10).await;
    assert!(lp.has_filter("a").await);
    assert!(lp.logs(1, 10, sig, b).await.unwrap().is_empty());

    lp.register_filter(Filter::new("b", [sig], [b])).await.unwrap();
    timeout(Duration::from_secs(5), lp.replay(&CancellationToken::new(), 1))
        .await
        .expect("replay timed out")
        .unwrap();

    assert_eq!(block_numbers(&lp.logs(1, 10, sig, b).await.unwrap()), vec![4, 9]);
    assert_eq!(block_numbers(&lp.logs(1, 10, sig, a).await.unwrap()), vec![3]);

    lp.close().await.unwrap();
    assert!(matches!(
        lp.replay(&CancellationToken::new(), 1).await,
        Err(LogPollerError::Shutdown)
    ));
}

#[tokio::test]
async fn replay_rejects_blocks_outside_the_chain() {
    let (chain, _db, lp) = setup();
    chain.mine_many(5);
    let cancel = CancellationToken::new();
    assert!(matches!(
        lp.replay(&cancel, 0).await,
        Err(LogPollerError::InvalidReplayBlock {
            requested: 0,
            latest: 5
        })
    ));
    assert!(matches!(
        lp.replay(&cancel, 6).await,
        Err(LogPollerError::InvalidReplayBlock { requested: 6, .. })
    ));
}

#[tokio::test]
async fn cancelled_replay_is_aborted() {
    let (chain, _db, lp) = setup();
    chain.mine_many(5);
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        lp.replay(&cancel, 1).await,
        Err(LogPollerError::ReplayRequestAborted)
    ));
}

#[tokio::test]
async fn replay_withdrawn_while_queued_is_not_run() {
    let (chain, db, lp) = setup();
    db.insert_filter(&Filter::new("f", [event_sig("E()")], [address(1)]))
        .await
        .unwrap();
    chain.mine_many(5);

    // the main loop is not running, so the request sits in the queue
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    });
    assert!(matches!(
        lp.replay(&cancel, 4).await,
        Err(LogPollerError::ReplayRequestAborted)
    ));

    let mut replay_rx = lp.replay_rx.lock().take().unwrap();
    let request = replay_rx.try_recv().unwrap();
    lp.core().handle_replay_request(request).await;
    assert!(db.all_blocks().is_empty());
}

#[tokio::test]
async fn replay_cancelled_after_acceptance_still_completes() {
    let (chain, db, lp) = setup();
    let (emitter, sig) = (address(0xa), event_sig("E()"));
    db.insert_filter(&Filter::new("f", [sig], [emitter]))
        .await
        .unwrap();
    for number in 1..=5 {
        if number == 4 {
            chain.emit(emitter, vec![sig], vec![]);
        }
        chain.mine();
    }

    let mut replay_rx = lp.replay_rx.lock().take().unwrap();
    // the replay stalls loading filters, after the request was accepted
    let (read, resume) = db.pause_next_filter_load();
    let cancel = CancellationToken::new();

    let caller = async {
        let res = lp.replay(&cancel, 4).await;
        resume.notify_one();
        res
    };
    let main_loop = async {
        let request = replay_rx.recv().await.unwrap();
        lp.core().handle_replay_request(request).await;
    };
    let canceller = async {
        read.notified().await;
        cancel.cancel();
    };
    let (res, (), ()) = tokio::join!(caller, main_loop, canceller);

    assert!(matches!(res, Err(LogPollerError::ReplayInProgress)));
    assert_eq!(
        db.all_blocks().iter().map(|b| b.block_number).collect::<Vec<_>>(),
        vec![4, 5]
    );
    assert_eq!(block_numbers(&db.all_logs()), vec![4]);
}

#[tokio::test]
async fn close_fails_a_replay_running_in_the_main_loop() {
    let (chain, db, lp) = setup_with(Opts {
        // only the immediate first tick
        poll_period: Duration::from_secs(3600),
        ..test_opts()
    });
    lp.register_filter(Filter::new("f", [event_sig("E()")], [address(1)]))
        .await
        .unwrap();
    chain.mine_many(5);
    lp.start().unwrap();
    wait_for_block(&lp, 5).await;

    // make the replay reload filters and stall there
    let (read, _resume) = db.pause_next_filter_load();
    lp.core().filters_loaded.store(false, Ordering::SeqCst);

    let cancel = CancellationToken::new();
    let closer = async {
        read.notified().await;
        lp.close().await
    };
    let (res, closed) = tokio::join!(lp.replay(&cancel, 4), closer);

    closed.unwrap();
    assert!(matches!(res, Err(LogPollerError::Shutdown)));
}

#[tokio::test]
async fn failed_block_commit_is_retried_on_the_next_tick() {
    let (chain, db, lp) = setup();
    let (emitter, sig) = (address(0xa), event_sig("E()"));
    lp.register_filter(Filter::new("f", [sig], [emitter]))
        .await
        .unwrap();
    for _ in 1..=4 {
        chain.emit(emitter, vec![sig], vec![]);
        chain.mine();
    }
    lp.core().poll_and_save_logs(1).await.unwrap();
    assert_eq!(block_numbers(&db.all_logs()), vec![1, 2, 3, 4]);

    for _ in 5..=6 {
        chain.emit(emitter, vec![sig], vec![]);
        chain.mine();
    }
    db.fail_writes(true);
    lp.core().poll_tick().await;
    assert_eq!(lp.latest_block().await.unwrap().unwrap().block_number, 4);
    assert_eq!(block_numbers(&db.all_logs()), vec![1, 2, 3, 4]);

    db.fail_writes(false);
    lp.core().poll_tick().await;
    assert_eq!(lp.latest_block().await.unwrap().unwrap().block_number, 6);
    assert_eq!(block_numbers(&db.all_logs()), vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn start_twice_fails() {
    let (_chain, _db, lp) = setup();
    lp.start().unwrap();
    assert!(matches!(lp.start(), Err(LogPollerError::AlreadyStarted)));
    lp.close().await.unwrap();
    // closing again is a no-op
    lp.close().await.unwrap();
    assert_eq!(lp.name(), "LogPoller(1337)");
}

#[tokio::test]
async fn blocks_range_falls_back_to_rpc() {
    let (chain, db, lp) = setup();
    chain.mine_many(5);
    let stored = LogPollerBlock::new(
        CHAIN_ID,
        H256::repeat_byte(0x22),
        2,
        date_time::now(),
        1,
    );
    db.insert_block(&stored).await.unwrap();

    let blocks = lp.get_blocks_range(&[3, 2, 1]).await.unwrap();
    assert_eq!(
        blocks.iter().map(|b| b.block_number).collect::<Vec<_>>(),
        vec![3, 2, 1]
    );
    assert_eq!(blocks[1], stored);
    assert_eq!(blocks[0].block_hash, chain.head_at(3).unwrap().hash);
    assert_eq!(blocks[0].finalized_block_number, 0);
    assert_eq!(blocks[0].created_at, blocks[0].block_timestamp);

    assert!(lp.get_blocks_range(&[]).await.unwrap().is_empty());
    assert!(matches!(
        lp.get_blocks_range(&[4, 99]).await,
        Err(LogPollerError::BlocksNotFound(missing)) if missing == vec![99]
    ));
}

#[tokio::test]
async fn typed_queries() {
    let (chain, _db, lp) = setup();
    let emitter = address(0xa);
    let (sent, acked) = (event_sig("Sent(uint256)"), event_sig("Acked(uint256)"));
    lp.register_filter(Filter::new("sent", [sent, acked], [emitter]))
        .await
        .unwrap();

    // block n carries Sent(n) with data word n, and Acked(n) for even n
    for n in 1..=6 {
        let data = [evm_word(n).as_bytes(), evm_word(n * 10).as_bytes()].concat();
        chain.emit(emitter, vec![sent, evm_word(n)], data);
        if n % 2 == 0 {
            chain.emit(emitter, vec![acked, evm_word(n)], vec![]);
        }
        chain.mine();
    }
    lp.core().poll_and_save_logs(1).await.unwrap();

    let logs = lp
        .indexed_logs(sent, emitter, 1, &[evm_word(2), evm_word(5)], Confirmations::Unconfirmed)
        .await
        .unwrap();
    assert_eq!(block_numbers(&logs), vec![2, 5]);

    let logs = lp
        .indexed_logs_topic_range(sent, emitter, 1, evm_word(3), evm_word(4), Confirmations::Unconfirmed)
        .await
        .unwrap();
    assert_eq!(block_numbers(&logs), vec![3, 4]);

    let logs = lp
        .logs_data_word_greater_than(sent, emitter, 1, evm_word(40), Confirmations::Unconfirmed)
        .await
        .unwrap();
    assert_eq!(block_numbers(&logs), vec![4, 5, 6]);

    let logs = lp
        .logs_data_word_between(sent, emitter, 0, 1, evm_word(20), Confirmations::Unconfirmed)
        .await
        .unwrap();
    assert_eq!(block_numbers(&logs), vec![2, 3, 4, 5, 6]);

    // finalized block is 4
    let latest = lp
        .latest_log_by_event_sig_with_confs(sent, emitter, Confirmations::Finalized)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.block_number, 4);
    let latest = lp
        .latest_log_by_event_sig_with_confs(sent, emitter, Confirmations::Blocks(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.block_number, 5);

    let unacked = lp
        .indexed_logs_with_sigs_excluding(emitter, sent, acked, 1, 1, 6, Confirmations::Unconfirmed)
        .await
        .unwrap();
    assert_eq!(block_numbers(&unacked), vec![1, 3, 5]);

    let latest = lp
        .latest_log_event_sigs_addrs_with_confs(1, &[sent, acked], &[emitter], Confirmations::Unconfirmed)
        .await
        .unwrap();
    assert_eq!(
        latest.iter().map(|l| (l.block_number, l.event_sig)).collect::<Vec<_>>(),
        vec![(6, sent), (6, acked)]
    );
    let block = lp
        .latest_block_by_event_sigs_addrs_with_confs(1, &[acked], &[emitter], Confirmations::Finalized)
        .await
        .unwrap();
    assert_eq!(block, 4);
    let block = lp
        .latest_block_by_event_sigs_addrs_with_confs(1, &[acked], &[address(0xdead)], Confirmations::Unconfirmed)
        .await
        .unwrap();
    assert_eq!(block, 0);

    let tx_hash = logs[0].tx_hash;
    let by_tx = lp.indexed_logs_by_tx_hash(sent, emitter, tx_hash).await.unwrap();
    assert_eq!(by_tx, vec![logs[0].clone()]);

    let desc = lp
        .filtered_logs(
            &[Expression::Address(emitter), Expression::block_range(2, 3)],
            &LimitAndSort::sorted([SortBy::Block(SortDirection::Desc)]),
            "desc",
        )
        .await
        .unwrap();
    assert_eq!(block_numbers(&desc), vec![3, 2, 2]);

    let bad_topic = [Expression::Topic {
        index: 4,
        op: Comparator::Eq,
        value: H256::zero(),
    }];
    assert!(matches!(
        lp.filtered_logs(&bad_topic, &LimitAndSort::default(), "bad").await,
        Err(LogPollerError::InvalidTopicIndex(4))
    ));
    assert!(matches!(
        lp.indexed_logs(sent, emitter, 0, &[], Confirmations::Unconfirmed).await,
        Err(LogPollerError::InvalidTopicIndex(0))
    ));
}

#[tokio::test]
async fn pruning_respects_finality_and_retention() {
    let (chain, db, lp) = setup_with(Opts {
        keep_finalized_blocks_depth: 2,
        ..test_opts()
    });
    let (kept, expiring) = (address(0xa), address(0xb));
    let sig = event_sig("E()");
    lp.register_filter(Filter::new("kept", [sig], [kept]))
        .await
        .unwrap();
    lp.register_filter(Filter::new("expiring", [sig], [expiring]).with_retention(Duration::from_secs(3600)))
        .await
        .unwrap();
    for _ in 1..=20 {
        chain.emit(kept, vec![sig], vec![]);
        chain.emit(expiring, vec![sig], vec![]);
        chain.mine();
    }
    lp.core().poll_and_save_logs(1).await.unwrap();

    // finalized block 18, keeping 2 below it
    assert!(lp.core().prune_old_blocks().await.unwrap());
    let blocks: Vec<u64> = db.all_blocks().iter().map(|b| b.block_number).collect();
    assert!(blocks.iter().all(|n| *n > 16), "{blocks:?}");
    assert!(blocks.ends_with(&[18, 19, 20]));

    // simulated blocks are years old
    assert!(lp.core().prune_expired_logs().await.unwrap());
    let logs = db.all_logs();
    assert_eq!(logs.len(), 20);
    assert!(logs.iter().all(|log| log.address == kept));
}

#[tokio::test]
async fn filters_survive_a_restart() {
    let (chain, db, lp) = setup();
    let sig = event_sig("E()");
    lp.register_filter(Filter::new("one", [sig], [address(1)]))
        .await
        .unwrap();
    lp.register_filter(Filter::new("two", [sig], [address(2)]))
        .await
        .unwrap();
    lp.unregister_filter("one").await.unwrap();
    assert!(!lp.has_filter("one").await);

    let restarted = LogPoller::new(chain.clone(), db.clone(), test_opts());
    assert!(!restarted.has_filter("two").await);
    restarted.core().poll_tick().await;
    assert!(restarted.has_filter("two").await);
    assert_eq!(
        restarted.get_filters().await.into_keys().collect::<Vec<_>>(),
        vec!["two".to_owned()]
    );
}

#[test]
fn opts_deserialize_with_defaults() {
    let opts: Opts = serde_json::from_str(r#"{ "finality": "finalized" }"#).unwrap();
    assert_eq!(opts.finality, FinalityPolicy::Tag);
    assert_eq!(opts.poll_period, Duration::from_secs(15));

    let opts: Opts =
        serde_json::from_str(r#"{ "finality": "12", "poll_period_ms": 250 }"#).unwrap();
    assert_eq!(opts.finality, FinalityPolicy::Depth(12));
    assert_eq!(opts.poll_period, Duration::from_millis(250));

    assert!(serde_json::from_str::<Opts>(r#"{ "finality": "safe" }"#).is_err());

    let json = serde_json::to_value(FinalityPolicy::Depth(3)).unwrap();
    assert_eq!(json, serde_json::json!(3));
    let json = serde_json::to_value(FinalityPolicy::Tag).unwrap();
    assert_eq!(json, serde_json::json!("finalized"));
}

#[test]
fn jitter_stays_within_ten_percent() {
    let period = Duration::from_secs(10);
    for _ in 0..100 {
        let jittered = with_jitter(period);
        assert!(jittered >= Duration::from_secs(9) && jittered <= Duration::from_secs(11));
    }
}
