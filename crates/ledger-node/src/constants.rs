pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
/// Pause after an accept error that is not tied to a single connection.
pub const ACCEPT_BACKOFF_MS: u64 = 100;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub const INVALID_TRANSACTION: &str = "Invalid transaction.";
pub const TRANSACTION_ACCEPTED: &str = "Transaction received and added to the pool.";
