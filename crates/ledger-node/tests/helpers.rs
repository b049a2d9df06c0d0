#![allow(dead_code)]

use anyhow::{bail, Result};
use ledger_core::Block;
use ledger_node::{peer, Node, NodeConfig};
use std::net::TcpListener;
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);
const POLL: Duration = Duration::from_millis(50);

/// Reserves `count` distinct local ports by binding them all before releasing any.
pub fn free_ports(count: usize) -> Result<Vec<u16>> {
    let listeners = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0"))
        .collect::<std::io::Result<Vec<_>>>()?;
    let ports = listeners
        .iter()
        .map(|l| l.local_addr().map(|a| a.port()))
        .collect::<std::io::Result<Vec<_>>>()?;
    Ok(ports)
}

pub struct Cluster {
    pub nodes: Vec<Node>,
}

impl Cluster {
    pub async fn start(size: usize, difficulty: usize) -> Result<Self> {
        let ports = free_ports(size * 2)?;
        let (client_ports, peer_ports) = ports.split_at(size);
        let peers: Vec<String> = peer_ports
            .iter()
            .map(|p| format!("127.0.0.1:{p}"))
            .collect();

        let mut nodes = Vec::with_capacity(size);
        for index in 0..size {
            let config = NodeConfig::new(
                client_ports[index],
                peer_ports[index],
                peers.clone(),
                index,
                difficulty,
            );
            let node = Node::new(config)?;
            node.start().await?;
            nodes.push(node);
        }
        Ok(Self { nodes })
    }

    pub fn client_addr(&self, index: usize) -> String {
        format!("127.0.0.1:{}", self.nodes[index].config().client_port)
    }

    pub fn peer_addr(&self, index: usize) -> String {
        format!("127.0.0.1:{}", self.nodes[index].config().peer_port)
    }

    pub async fn submit(&self, index: usize, transaction: &str) -> Result<String> {
        Ok(peer::submit_transaction(&self.client_addr(index), transaction, None).await?)
    }

    /// Sends `transaction` to every running node's client port.
    pub async fn broadcast(&self, transaction: &str) -> Result<()> {
        for (index, node) in self.nodes.iter().enumerate() {
            if node.is_running().await {
                self.submit(index, transaction).await?;
            }
        }
        Ok(())
    }

    /// Pushes `block` to every node's peer port except `sender`'s, in index order.
    pub async fn broadcast_block(&self, block: &Block, sender: usize) -> Result<()> {
        for index in (0..self.nodes.len()).filter(|i| *i != sender) {
            peer::send_block(&self.peer_addr(index), block, None).await?;
        }
        Ok(())
    }

    pub fn chains(&self) -> Vec<Vec<Block>> {
        self.nodes.iter().map(Node::chain).collect()
    }

    pub fn chains_of(&self, indices: &[usize]) -> Vec<Vec<Block>> {
        indices.iter().map(|i| self.nodes[*i].chain()).collect()
    }

    /// Polls every node's chain until `done` holds.
    pub async fn wait_for(&self, what: &str, done: impl Fn(&[Vec<Block>]) -> bool) -> Result<()> {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        loop {
            if done(&self.chains()) {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("timed out waiting for {what}: lengths {:?}", lengths(&self.chains()));
            }
            sleep(POLL).await;
        }
    }

    pub async fn wait_for_len(&self, len: usize) -> Result<()> {
        self.wait_for(&format!("every chain to reach length {len}"), |chains| {
            chains.iter().all(|c| c.len() == len)
        })
        .await
    }

    /// Waits until no chain has changed for `quiet`.
    pub async fn settle(&self, quiet: Duration) -> Result<()> {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        let mut last = self.chains();
        let mut stable_since = Instant::now();
        loop {
            sleep(POLL).await;
            let now = self.chains();
            if now != last {
                last = now;
                stable_since = Instant::now();
            } else if stable_since.elapsed() >= quiet {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("chains never settled: lengths {:?}", lengths(&last));
            }
        }
    }

    pub async fn stop_all(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }
}

pub fn lengths(chains: &[Vec<Block>]) -> Vec<usize> {
    chains.iter().map(Vec::len).collect()
}

pub fn all_equal(chains: &[Vec<Block>]) -> bool {
    chains.windows(2).all(|pair| pair[0] == pair[1])
}

/// Mines a block on top of `parent` off the async runtime.
pub async fn mine_on(
    parent: &Block,
    transactions: Vec<String>,
    difficulty: usize,
) -> Result<Block> {
    let mut block = Block::new(parent.hash(), ledger_core::now_millis(), transactions);
    let mined = tokio::task::spawn_blocking(move || {
        block.mine(difficulty);
        block
    })
    .await?;
    Ok(mined)
}
