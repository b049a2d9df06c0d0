use crate::{pow::meets_difficulty, Block};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Clone, Copy, Debug)]
pub struct MiningStats {
    pub attempts: u64,
    pub elapsed: Duration,
}

impl MiningStats {
    pub fn hash_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return self.attempts as f64;
        }
        self.attempts as f64 / secs
    }
}

/// Searches nonces sequentially from the block's current nonce until the hash carries
/// `difficulty` leading zero hex digits. `cancel` is polled every `check_interval` attempts;
/// `None` means the search was abandoned and the block holds whatever nonce it reached.
pub fn mine_block_cancellable(
    block: &mut Block,
    difficulty: usize,
    cancel: &AtomicBool,
    check_interval: u64,
) -> Option<MiningStats> {
    let check_interval = check_interval.max(1);
    let started = Instant::now();
    let mut attempts = 0u64;

    debug!(transactions = ?block.transactions(), difficulty, "mining block");

    while !meets_difficulty(block.hash(), difficulty) {
        if attempts % check_interval == 0 && cancel.load(Ordering::Relaxed) {
            debug!(attempts, "mining cancelled");
            return None;
        }
        block.set_nonce(block.nonce().wrapping_add(1));
        attempts += 1;
    }

    let stats = MiningStats {
        attempts,
        elapsed: started.elapsed(),
    };
    info!(
        "Mined block {:?} with nonce {} and hash {} in {:?}",
        block.transactions(),
        block.nonce(),
        block.hash(),
        stats.elapsed
    );
    Some(stats)
}
