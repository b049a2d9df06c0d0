use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use ledger_core::{now_millis, Block};
use ledger_node::peer;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ledger-cli")]
#[command(about = "CLI client for the proof-of-work ledger node")]
struct Cli {
    /// Give up on a node after this many milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a transaction to a node's client port
    Submit {
        #[arg(long, default_value = "127.0.0.1:6000")]
        node: String,
        transaction: String,
    },
    /// Print a node's chain, fetched from its peer port
    Chain {
        #[arg(long, default_value = "127.0.0.1:5000")]
        node: String,
        /// Emit the raw JSON records instead of one line per block
        #[arg(long)]
        json: bool,
    },
    /// Mine a block by hand and push it to a node's peer port
    Push {
        #[arg(long, default_value = "127.0.0.1:5000")]
        node: String,
        /// Hash to build on; defaults to the node's current tip
        #[arg(long)]
        parent: Option<String>,
        #[arg(long, default_value_t = 4)]
        difficulty: usize,
        #[arg(required = true)]
        transactions: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    let limit = cli.timeout_ms.map(Duration::from_millis);
    match cli.cmd {
        Command::Submit { node, transaction } => {
            let reply = peer::submit_transaction(&node, &transaction, limit).await?;
            println!("{reply}");
        }
        Command::Chain { node, json } => {
            let chain = peer::fetch_chain(&node, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&chain)?);
            } else {
                for (height, block) in chain.iter().enumerate() {
                    println!("{height:>4} {block}");
                }
            }
        }
        Command::Push {
            node,
            parent,
            difficulty,
            transactions,
        } => {
            let parent = match parent {
                Some(hash) => hash,
                None => {
                    let chain = peer::fetch_chain(&node, limit).await?;
                    chain
                        .last()
                        .map(|tip| tip.hash().to_string())
                        .ok_or_else(|| anyhow!("{node} returned an empty chain"))?
                }
            };
            let mut block = Block::new(parent, now_millis(), transactions);
            let mined = tokio::task::spawn_blocking(move || {
                block.mine(difficulty);
                block
            })
            .await?;
            info!(hash = mined.hash(), nonce = mined.nonce(), "block mined");
            peer::send_block(&node, &mined, limit).await?;
            println!("{mined}");
        }
    }
    Ok(())
}
