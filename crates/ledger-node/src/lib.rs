//! A minimal peer-to-peer ledger node: transaction intake, proof-of-work block production,
//! block gossip and pull-based fork resolution over two TCP endpoints.

pub mod config;
pub mod constants;
pub mod error;
mod miner;
mod node;
pub mod peer;
mod sync;
pub mod wire;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::Node;
