use crate::constants::{GENESIS_PREVIOUS_HASH, GENESIS_TRANSACTION, HASH_HEX_SIZE};
use crate::error::LedgerError;
use crate::pow::{meets_difficulty, total_work};
use crate::{now_millis, Block};
use rayon::prelude::*;
use tracing::{debug, info, warn};

/// The genesis block: previous hash `"0"`, single transaction `"0"`, stamped with creation time.
/// Its hash does not depend on the timestamp, so every node starts from the same genesis hash.
pub fn genesis_block() -> Block {
    Block::new(
        GENESIS_PREVIOUS_HASH,
        now_millis(),
        vec![GENESIS_TRANSACTION.to_string()],
    )
}

/// Full validation of a standalone block sequence: every block's stored hash matches its
/// content, every non-genesis block meets `difficulty`, and each block links to its predecessor.
pub fn is_valid_chain(blocks: &[Block], difficulty: usize) -> bool {
    let self_consistent = blocks
        .par_iter()
        .enumerate()
        .all(|(i, b)| b.has_valid_hash() && (i == 0 || meets_difficulty(b.hash(), difficulty)));
    if !self_consistent {
        return false;
    }
    blocks
        .windows(2)
        .all(|pair| pair[1].previous_hash() == pair[0].hash())
}

/// In-memory block sequence owned by one node. Index 0 is the genesis block.
#[derive(Clone, Debug)]
pub struct Chain {
    blocks: Vec<Block>,
    difficulty: usize,
}

impl Chain {
    pub fn new(difficulty: usize) -> Result<Self, LedgerError> {
        if difficulty > HASH_HEX_SIZE {
            return Err(LedgerError::DifficultyOutOfRange {
                difficulty,
                max: HASH_HEX_SIZE,
            });
        }
        Ok(Self {
            blocks: vec![genesis_block()],
            difficulty,
        })
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn total_work(&self) -> u64 {
        total_work(&self.blocks)
    }

    /// Unchecked append; callers validate first.
    pub fn append(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// Checks the candidate's own hash, its proof-of-work, and that its first transaction is
    /// not already recorded anywhere in this chain. Linkage to `previous` is not checked here;
    /// only the first transaction takes part in the duplicate check.
    pub fn is_valid_new_block(&self, candidate: &Block, previous: Option<&Block>) -> bool {
        if previous.is_none() {
            return false;
        }
        if !candidate.has_valid_hash() {
            debug!(hash = candidate.hash(), "block hash does not match its content");
            return false;
        }
        if !meets_difficulty(candidate.hash(), self.difficulty) {
            debug!(
                hash = candidate.hash(),
                difficulty = self.difficulty,
                "block misses pow target"
            );
            return false;
        }
        match candidate.first_transaction() {
            Some(tx) if self.contains_transaction(tx) => {
                debug!(transaction = tx, "duplicate transaction in block");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Sum of nonces of every block strictly after the block hashed `start_hash`;
    /// 0 when that block is absent.
    pub fn calculate_work(&self, start_hash: &str) -> u64 {
        match self.position(start_hash) {
            Some(idx) => total_work(&self.blocks[idx + 1..]),
            None => 0,
        }
    }

    /// An incoming run of blocks extends this chain when its first block links to the current
    /// tip, every block validates against its predecessor, and its total work exceeds the work
    /// this chain holds past the tip.
    pub fn is_valid_extension(&self, incoming: &[Block]) -> bool {
        let (Some(first), Some(tip)) = (incoming.first(), self.tip()) else {
            return false;
        };
        if first.previous_hash() != tip.hash() {
            return false;
        }

        let mut previous = tip;
        for block in incoming {
            if block.previous_hash() != previous.hash()
                || !self.is_valid_new_block(block, Some(previous))
            {
                return false;
            }
            previous = block;
        }

        total_work(incoming) > self.calculate_work(tip.hash())
    }

    /// Truncates the chain after the block that `incoming[0]` links to and appends `incoming`.
    /// Returns `false` (and leaves the chain untouched) when no such block exists.
    pub fn splice_extension(&mut self, incoming: Vec<Block>) -> bool {
        let Some(first) = incoming.first() else {
            return false;
        };
        let Some(idx) = self.position(first.previous_hash()) else {
            warn!(
                linking_hash = first.previous_hash(),
                "linking block is not in the current chain"
            );
            return false;
        };
        self.blocks.truncate(idx + 1);
        self.blocks.extend(incoming);
        info!(len = self.blocks.len(), "chain updated from the linking block");
        true
    }

    /// Wholesale replacement; validity is the caller's concern.
    pub fn replace_all(&mut self, blocks: Vec<Block>) {
        self.blocks = blocks;
    }

    pub fn find_block(&self, hash: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.hash() == hash)
    }

    /// The blocks from the one hashed `hash` to the tip, inclusive; empty if absent.
    pub fn suffix_from(&self, hash: &str) -> &[Block] {
        match self.position(hash) {
            Some(idx) => &self.blocks[idx..],
            None => &[],
        }
    }

    pub fn contains_transaction(&self, transaction: &str) -> bool {
        self.blocks
            .iter()
            .any(|b| b.transactions().iter().any(|t| t == transaction))
    }

    /// True when every transaction in the list is somewhere in the chain.
    pub fn contains_transactions(&self, transactions: &[String]) -> bool {
        transactions.iter().all(|t| self.contains_transaction(t))
    }

    pub fn contains_block(&self, block: &Block) -> bool {
        self.blocks.iter().any(|b| b == block)
    }

    fn position(&self, hash: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.hash() == hash)
    }
}
