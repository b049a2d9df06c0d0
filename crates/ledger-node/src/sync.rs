//! Received-block handling and pull-based fork resolution.

use crate::miner::cancel_mining_for;
use crate::node::Shared;
use crate::peer;
use ledger_core::chain::is_valid_chain;
use ledger_core::pow::total_work;
use ledger_core::{Block, Chain};
use tracing::{debug, info, warn};

/// Appends `block` when it extends the local tip; otherwise asks the other peers for their
/// chains to resolve the fork. Blocks that fail the hash, proof-of-work or duplicate checks
/// are dropped.
pub(crate) async fn handle_received_block(shared: &Shared, block: Block) {
    let mut chain = shared.chain.lock().await;
    let Some(tip) = chain.tip().cloned() else {
        return;
    };
    if !chain.is_valid_new_block(&block, Some(&tip)) {
        debug!(hash = block.hash(), "ignoring invalid or already known block");
        return;
    }

    if block.previous_hash() == tip.hash() {
        let transactions = block.transactions().to_vec();
        info!(hash = block.hash(), len = chain.len() + 1, "appending block from peer");
        chain.append(block);
        shared.pool.prune(chain.blocks());
        shared.publish(&chain);
        cancel_mining_for(shared, &transactions);
        return;
    }

    debug!(
        hash = block.hash(),
        previous = block.previous_hash(),
        "block does not link to our tip, synchronizing"
    );
    synchronize(shared, &mut chain, &block).await;
}

/// Replaces the chain with the best valid peer chain, then re-applies `trigger` if it now
/// links to the tip. The pool is pruned whatever the outcome.
async fn synchronize(shared: &Shared, chain: &mut Chain, trigger: &Block) {
    let candidates = collect_peer_chains(shared).await;
    if let Some(best) = choose_best_chain(candidates, chain.difficulty(), 0, 0) {
        info!(len = best.len(), work = total_work(&best), "replacing chain with peer chain");
        chain.replace_all(best);
    }

    if !chain.contains_transactions(trigger.transactions()) {
        let tip = chain.tip().cloned();
        let links = tip.as_ref().is_some_and(|t| t.hash() == trigger.previous_hash());
        if links && chain.is_valid_new_block(trigger, tip.as_ref()) {
            info!(hash = trigger.hash(), "re-applied triggering block after sync");
            chain.append(trigger.clone());
            cancel_mining_for(shared, trigger.transactions());
        }
    }

    shared.pool.prune(chain.blocks());
    shared.publish(chain);
}

/// Pulls peer chains once and adopts the best one only when it is both longer and heavier
/// than what this node already holds.
pub(crate) async fn catch_up(shared: &Shared) {
    let mut chain = shared.chain.lock().await;
    let candidates = collect_peer_chains(shared).await;
    let len = chain.len();
    let work = chain.total_work();
    match choose_best_chain(candidates, chain.difficulty(), len, work) {
        Some(best) => {
            info!(from = len, to = best.len(), "caught up with peers");
            chain.replace_all(best);
            shared.pool.prune(chain.blocks());
            shared.publish(&chain);
        }
        None => debug!(len, "no peer chain ahead of ours"),
    }
}

/// Fetches the chain of every other peer in index order, skipping the ones that fail.
async fn collect_peer_chains(shared: &Shared) -> Vec<Vec<Block>> {
    let limit = shared.config.io_timeout();
    let mut chains = Vec::new();
    for addr in shared.config.other_peers() {
        match peer::fetch_chain(addr, limit).await {
            Ok(blocks) => chains.push(blocks),
            Err(err) => warn!(peer = addr, %err, "could not fetch chain"),
        }
    }
    chains
}

/// Scans `candidates` in order and keeps the first one that is longer than the best so far
/// and carries more work than the best so far. Invalid chains are skipped. The scan starts
/// from `floor_len` and `floor_work`.
pub(crate) fn choose_best_chain(
    candidates: Vec<Vec<Block>>,
    difficulty: usize,
    floor_len: usize,
    floor_work: u64,
) -> Option<Vec<Block>> {
    let mut best: Option<Vec<Block>> = None;
    let mut best_len = floor_len;
    let mut best_work = floor_work;
    for candidate in candidates {
        if !is_valid_chain(&candidate, difficulty) {
            debug!(len = candidate.len(), "discarding invalid peer chain");
            continue;
        }
        let work = total_work(&candidate);
        if candidate.len() > best_len && work > best_work {
            best_len = candidate.len();
            best_work = work;
            best = Some(candidate);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::chain::genesis_block;
    use ledger_core::now_millis;

    const DIFFICULTY: usize = 1;

    fn extend(mut blocks: Vec<Block>, txs: &[&str]) -> Vec<Block> {
        for tx in txs {
            let previous = blocks.last().unwrap().hash().to_string();
            let mut block = Block::new(previous, now_millis(), vec![tx.to_string()]);
            block.mine(DIFFICULTY);
            blocks.push(block);
        }
        blocks
    }

    fn with_work_at_least(txs: &[&str], prefix: &str, min: u64) -> Vec<Block> {
        // Pads the transaction text until the mined nonces sum past `min`.
        let mut salt = 0;
        loop {
            let salted: Vec<String> = txs.iter().map(|t| format!("{prefix}{t}-{salt}")).collect();
            let refs: Vec<&str> = salted.iter().map(String::as_str).collect();
            let chain = extend(vec![genesis_block()], &refs);
            if total_work(&chain) > min {
                return chain;
            }
            salt += 1;
        }
    }

    #[test]
    fn first_longer_and_heavier_candidate_wins() {
        let short = extend(vec![genesis_block()], &["1"]);
        let long = with_work_at_least(&["1", "2", "3"], "a", total_work(&short));
        let chosen = choose_best_chain(vec![short.clone(), long.clone()], DIFFICULTY, 0, 0);
        assert_eq!(chosen, Some(long));
    }

    #[test]
    fn longer_but_lighter_candidate_is_rejected() {
        let heavy = with_work_at_least(&["1", "2"], "h", 60);
        let light_long = (0..)
            .map(|salt| {
                let txs: Vec<String> = ["x", "y", "z"]
                    .iter()
                    .map(|t| format!("{t}-{salt}"))
                    .collect();
                let refs: Vec<&str> = txs.iter().map(String::as_str).collect();
                extend(vec![genesis_block()], &refs)
            })
            .find(|c| total_work(c) < total_work(&heavy))
            .unwrap();
        let chosen = choose_best_chain(vec![heavy.clone(), light_long], DIFFICULTY, 0, 0);
        assert_eq!(chosen, Some(heavy));
    }

    #[test]
    fn invalid_candidates_are_skipped() {
        let mut broken = extend(vec![genesis_block()], &["1", "2"]);
        broken.remove(1);
        assert_eq!(choose_best_chain(vec![broken, Vec::new()], DIFFICULTY, 0, 0), None);
    }

    #[test]
    fn floor_blocks_equal_chains() {
        let local = extend(vec![genesis_block()], &["1"]);
        let same = local.clone();
        let chosen = choose_best_chain(vec![same], DIFFICULTY, local.len(), total_work(&local));
        assert_eq!(chosen, None);
    }
}
