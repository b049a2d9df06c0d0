use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod chain;
pub mod constants;
pub mod error;
pub mod mine;
pub mod pool;

pub use chain::Chain;
pub use error::LedgerError;
pub use pool::TxPool;

/// Lowercase hex rendering of a SHA-256 digest.
pub type Hash = String;

/// Milliseconds since the unix epoch; 0 if the clock is before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Canonical text form of a transaction list as it enters the block hash: `[a, b, c]`.
pub fn serialize_transactions(transactions: &[String]) -> String {
    format!("[{}]", transactions.join(", "))
}

/// `H(previous_hash ‖ serialize(transactions) ‖ nonce)`. The timestamp is not part of the
/// digest.
pub fn calculate_hash(previous_hash: &str, transactions: &[String], nonce: u64) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(serialize_transactions(transactions).as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    previous_hash: Hash,
    timestamp: u64,
    transactions: Vec<String>,
    nonce: u64,
    hash: Hash,
}

impl Block {
    /// Builds a block with `nonce = 0` and its hash already computed. No argument validation.
    pub fn new(previous_hash: impl Into<Hash>, timestamp: u64, transactions: Vec<String>) -> Self {
        let previous_hash = previous_hash.into();
        let hash = calculate_hash(&previous_hash, &transactions, 0);
        Self {
            previous_hash,
            timestamp,
            transactions,
            nonce: 0,
            hash,
        }
    }

    pub fn previous_hash(&self) -> &str {
        &self.previous_hash
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn transactions(&self) -> &[String] {
        &self.transactions
    }

    pub fn first_transaction(&self) -> Option<&str> {
        self.transactions.first().map(String::as_str)
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// The stored hash. For blocks received off the wire this may not match the content;
    /// compare against [`Block::calculate_hash`].
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn calculate_hash(&self) -> Hash {
        calculate_hash(&self.previous_hash, &self.transactions, self.nonce)
    }

    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    pub(crate) fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
        self.hash = self.calculate_hash();
    }

    /// Proof-of-work: bumps the nonce until the hash starts with `difficulty` zero hex digits.
    /// Runs until it succeeds; use [`Block::mine_cancellable`] when the work may need abandoning.
    pub fn mine(&mut self, difficulty: usize) {
        let never = AtomicBool::new(false);
        mine::mine_block_cancellable(self, difficulty, &never, u64::MAX);
    }

    /// Same search as [`Block::mine`], polling `cancel` every `check_interval` attempts.
    /// Returns `false` if the search was abandoned.
    pub fn mine_cancellable(
        &mut self,
        difficulty: usize,
        cancel: &AtomicBool,
        check_interval: u64,
    ) -> bool {
        mine::mine_block_cancellable(self, difficulty, cancel, check_interval).is_some()
    }
}

// Two nodes mining the same transaction on the same parent find the same nonce; only the
// timestamp differs, so it is left out of equality.
impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.nonce == other.nonce
            && self.hash == other.hash
            && self.previous_hash == other.previous_hash
            && self.transactions == other.transactions
    }
}

impl Eq for Block {}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block{{hash={}, previous_hash={}, timestamp={}, transactions={}, nonce={}}}",
            self.hash,
            self.previous_hash,
            self.timestamp,
            serialize_transactions(&self.transactions),
            self.nonce
        )
    }
}

pub mod pow {
    /// Number of leading `'0'` characters in a hex hash.
    pub fn leading_zero_digits(hash: &str) -> usize {
        hash.bytes().take_while(|b| *b == b'0').count()
    }

    /// True when the first `difficulty` characters of `hash` are all `'0'`.
    pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
        hash.len() >= difficulty && leading_zero_digits(hash) >= difficulty
    }

    /// Coarse work metric: the sum of nonces.
    pub fn total_work<'a>(blocks: impl IntoIterator<Item = &'a super::Block>) -> u64 {
        blocks
            .into_iter()
            .fold(0u64, |acc, b| acc.saturating_add(b.nonce()))
    }
}
