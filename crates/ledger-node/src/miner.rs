//! Block production: the polling loop, the single mining task, commit and broadcast.

use crate::node::Shared;
use crate::peer;
use ledger_core::mine::mine_block_cancellable;
use ledger_core::{now_millis, Block};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

/// The in-flight mining task and what it is mining.
pub(crate) struct MiningJob {
    transactions: Vec<String>,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl MiningJob {
    pub(crate) fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }
}

pub(crate) async fn production_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => maybe_start_mining(&shared),
        }
    }
    debug!("block production loop stopped");
}

/// Drafts a block for the pool head on top of the current tip and starts mining it, unless
/// the pool is empty or a mining task is already running.
fn maybe_start_mining(shared: &Arc<Shared>) {
    let Some(transaction) = shared.pool.peek() else {
        return;
    };
    let chain = shared.snapshot();
    if chain
        .iter()
        .any(|b| b.transactions().iter().any(|t| *t == transaction))
    {
        shared.pool.remove_all(std::slice::from_ref(&transaction));
        return;
    }
    let Some(tip) = chain.last() else {
        return;
    };
    if shared
        .mining_active
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let candidate = Block::new(tip.hash(), now_millis(), vec![transaction.clone()]);
    let cancel = Arc::new(AtomicBool::new(false));
    let mut slot = shared.mining_slot();
    let handle = tokio::spawn(
        run_mining_job(Arc::clone(shared), candidate, Arc::clone(&cancel))
            .instrument(shared.span.clone()),
    );
    *slot = Some(MiningJob {
        transactions: vec![transaction],
        cancel,
        handle,
    });
}

async fn run_mining_job(shared: Arc<Shared>, mut candidate: Block, cancel: Arc<AtomicBool>) {
    let difficulty = shared.config.difficulty;
    let check_interval = shared.config.cancel_check_interval;
    let token = Arc::clone(&cancel);
    let mined = tokio::task::spawn_blocking(move || {
        mine_block_cancellable(&mut candidate, difficulty, &token, check_interval)
            .map(|stats| (candidate, stats))
    })
    .await;

    match mined {
        Ok(Some((block, stats))) if !cancel.load(Ordering::Acquire) => {
            debug!(attempts = stats.attempts, hash_rate = stats.hash_rate(), "proof of work found");
            commit_mined(&shared, block).await;
        }
        Ok(_) => debug!("mining abandoned"),
        Err(err) => warn!(%err, "mining task failed"),
    }
    shared.mining_active.store(false, Ordering::Release);
}

/// Appends a freshly mined block if it still sits on the current tip, then broadcasts it.
async fn commit_mined(shared: &Shared, block: Block) {
    let committed = {
        let mut chain = shared.chain.lock().await;
        let tip = chain.tip();
        let linked = tip.is_some_and(|t| t.hash() == block.previous_hash());
        if linked && chain.is_valid_new_block(&block, tip) {
            chain.append(block.clone());
            shared.pool.prune(chain.blocks());
            shared.publish(&chain);
            info!(len = chain.len(), hash = block.hash(), "mined block appended");
            true
        } else {
            debug!(hash = block.hash(), "mined block is stale, dropping it");
            false
        }
    };
    if committed {
        broadcast(shared, &block).await;
    }
}

/// Sends `block` to every other peer. Failures are logged and not retried.
pub(crate) async fn broadcast(shared: &Shared, block: &Block) {
    let limit = shared.config.io_timeout();
    let mut sends = JoinSet::new();
    for addr in shared.config.other_peers() {
        let addr = addr.to_string();
        let block = block.clone();
        sends.spawn(async move {
            let outcome = peer::send_block(&addr, &block, limit).await;
            (addr, outcome)
        });
    }
    while let Some(joined) = sends.join_next().await {
        match joined {
            Ok((addr, Err(err))) => warn!(peer = %addr, %err, "broadcast failed"),
            Ok((addr, Ok(()))) => debug!(peer = %addr, "block sent"),
            Err(err) => warn!(%err, "broadcast task failed"),
        }
    }
}

/// Flags the running mining task for cancellation when it is mining exactly `transactions`.
pub(crate) fn cancel_mining_for(shared: &Shared, transactions: &[String]) {
    let slot = shared.mining_slot();
    if let Some(job) = slot.as_ref() {
        if job.transactions == transactions && !job.handle.is_finished() {
            job.cancel();
            debug!(?transactions, "cancelled mining for a block that arrived from a peer");
        }
    }
}

/// Cancels whatever is being mined and waits for the task to wind down.
pub(crate) async fn cancel_active(shared: &Shared) {
    let job = shared.mining_slot().take();
    if let Some(job) = job {
        job.cancel();
        if let Err(err) = job.handle.await {
            warn!(%err, "mining task ended abnormally");
        }
    }
}
