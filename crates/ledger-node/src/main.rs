use clap::Parser;
use ledger_node::{Node, NodeConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ledger-node", about = "Run one node of the proof-of-work ledger network")]
struct Args {
    /// Port accepting client transactions
    #[arg(long, default_value_t = 6000)]
    client_port: u16,

    /// Port accepting peer blocks and chain requests
    #[arg(long, default_value_t = 5000)]
    peer_port: u16,

    /// Peer endpoints of every node in the network, this one included
    #[arg(long, value_delimiter = ',', default_value = "127.0.0.1:5000")]
    peers: Vec<String>,

    /// Position of this node in --peers
    #[arg(long, default_value_t = 0)]
    index: usize,

    /// Required leading zero hex digits
    #[arg(long, default_value_t = 4)]
    difficulty: usize,

    #[arg(long, default_value = "127.0.0.1")]
    bind_host: String,

    #[arg(long)]
    max_connections: Option<usize>,

    /// Timeout for outbound peer calls, in milliseconds
    #[arg(long)]
    io_timeout_ms: Option<u64>,

    /// Skip the chain catch-up with peers at startup
    #[arg(long)]
    no_sync_on_start: bool,
}

impl From<Args> for NodeConfig {
    fn from(args: Args) -> Self {
        let mut config = NodeConfig::new(
            args.client_port,
            args.peer_port,
            args.peers,
            args.index,
            args.difficulty,
        );
        config.bind_host = args.bind_host;
        config.max_connections = args.max_connections;
        config.io_timeout_ms = args.io_timeout_ms;
        config.sync_on_start = !args.no_sync_on_start;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let node = Node::new(NodeConfig::from(Args::parse()))?;
    node.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    node.stop().await;
    Ok(())
}
