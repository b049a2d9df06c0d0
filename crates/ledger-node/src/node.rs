use crate::config::NodeConfig;
use crate::constants::{ACCEPT_BACKOFF_MS, INVALID_TRANSACTION, TRANSACTION_ACCEPTED};
use crate::error::{NodeError, Result};
use crate::miner::{self, MiningJob};
use crate::sync;
use crate::wire::{
    read_message, write_message, ChainResponse, ClientRequest, ClientResponse, PeerMessage,
};
use ledger_core::{Block, Chain, TxPool};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// State shared by every task a node spawns.
pub(crate) struct Shared {
    pub(crate) config: NodeConfig,
    /// Every append, splice and replace happens while this is held.
    pub(crate) chain: Mutex<Chain>,
    /// Last committed chain, readable without the lock.
    snapshot: watch::Sender<Arc<Vec<Block>>>,
    pub(crate) pool: TxPool,
    pub(crate) mining_active: AtomicBool,
    mining: std::sync::Mutex<Option<MiningJob>>,
    pub(crate) span: Span,
}

impl Shared {
    pub(crate) fn publish(&self, chain: &Chain) {
        self.snapshot.send_replace(Arc::new(chain.blocks().to_vec()));
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<Block>> {
        Arc::clone(&self.snapshot.borrow())
    }

    pub(crate) fn mining_slot(&self) -> MutexGuard<'_, Option<MiningJob>> {
        self.mining.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Client-side admission: non-empty and not already recorded in the chain.
    pub(crate) fn accept_transaction(&self, transaction: String) -> bool {
        if transaction.is_empty() {
            return false;
        }
        let chain = self.snapshot();
        if chain
            .iter()
            .any(|b| b.transactions().iter().any(|t| *t == transaction))
        {
            return false;
        }
        debug!(transaction = %transaction, "transaction added to the pool");
        self.pool.push(transaction);
        true
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    client_addr: SocketAddr,
    peer_addr: SocketAddr,
}

/// One ledger node: a chain, a transaction pool, two listeners, a block producer and at
/// most one mining task.
///
/// `start` and `stop` may alternate any number of times; the chain and pool survive a stop.
pub struct Node {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

#[derive(Clone, Copy, Debug)]
enum Endpoint {
    Client,
    Peer,
}

impl Endpoint {
    fn role(self) -> &'static str {
        match self {
            Endpoint::Client => "client",
            Endpoint::Peer => "peer",
        }
    }
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let chain = Chain::new(config.difficulty)?;
        let (snapshot, _) = watch::channel(Arc::new(chain.blocks().to_vec()));
        let span = info_span!("node", index = config.index);
        let shared = Shared {
            config,
            chain: Mutex::new(chain),
            snapshot,
            pool: TxPool::new(),
            mining_active: AtomicBool::new(false),
            mining: std::sync::Mutex::new(None),
            span,
        };
        Ok(Self {
            shared: Arc::new(shared),
            running: Mutex::new(None),
        })
    }

    /// Binds both listeners and launches the accept loops and the block producer.
    /// A bind failure leaves the node stopped.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(NodeError::AlreadyRunning);
        }

        let config = &self.shared.config;
        let client = bind(Endpoint::Client, config.client_bind_addr()).await?;
        let peer = bind(Endpoint::Peer, config.peer_bind_addr()).await?;
        let client_addr = client.local_addr()?;
        let peer_addr = peer.local_addr()?;

        let (shutdown, _) = watch::channel(false);
        let span = self.shared.span.clone();
        let mut tasks = vec![
            tokio::spawn(
                accept_loop(
                    Arc::clone(&self.shared),
                    client,
                    Endpoint::Client,
                    shutdown.subscribe(),
                )
                .instrument(span.clone()),
            ),
            tokio::spawn(
                accept_loop(
                    Arc::clone(&self.shared),
                    peer,
                    Endpoint::Peer,
                    shutdown.subscribe(),
                )
                .instrument(span.clone()),
            ),
            tokio::spawn(
                miner::production_loop(Arc::clone(&self.shared), shutdown.subscribe())
                    .instrument(span.clone()),
            ),
        ];
        if config.sync_on_start {
            let shared = Arc::clone(&self.shared);
            let mut stop = shutdown.subscribe();
            tasks.push(tokio::spawn(
                async move {
                    tokio::select! {
                        _ = stop.changed() => {}
                        _ = sync::catch_up(&shared) => {}
                    }
                }
                .instrument(span.clone()),
            ));
        }

        span.in_scope(|| info!(%client_addr, %peer_addr, "node started"));
        *running = Some(Running {
            shutdown,
            tasks,
            client_addr,
            peer_addr,
        });
        Ok(())
    }

    /// Closes both listeners, ends every loop, abandons any mining and waits for all of it.
    /// Stopping a stopped node does nothing.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return;
        };
        current.shutdown.send_replace(true);
        for task in current.tasks {
            if let Err(err) = task.await {
                self.shared.span.in_scope(|| warn!(%err, "node task ended abnormally"));
            }
        }
        miner::cancel_active(&self.shared).await;
        self.shared.span.in_scope(|| info!("node stopped"));
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn is_mining(&self) -> bool {
        self.shared.mining_active.load(Ordering::Acquire)
    }

    pub async fn client_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.client_addr)
    }

    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.peer_addr)
    }

    /// The last committed chain.
    pub fn chain(&self) -> Vec<Block> {
        self.shared.snapshot().as_ref().clone()
    }

    /// Receives every committed chain from now on.
    pub fn subscribe_chain(&self) -> watch::Receiver<Arc<Vec<Block>>> {
        self.shared.snapshot.subscribe()
    }

    pub fn pool_snapshot(&self) -> Vec<String> {
        self.shared.pool.snapshot()
    }

    /// Same admission as the client port; returns whether the transaction was pooled.
    pub fn submit_transaction(&self, transaction: impl Into<String>) -> bool {
        self.shared.accept_transaction(transaction.into())
    }

    /// Handles `block` exactly as if a peer had sent it.
    pub async fn submit_block(&self, block: Block) {
        sync::handle_received_block(&self.shared, block)
            .instrument(self.shared.span.clone())
            .await;
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(current) = running.take() {
                current.shutdown.send_replace(true);
            }
        }
        if let Some(job) = self.shared.mining_slot().take() {
            job.cancel();
        }
    }
}

async fn bind(endpoint: Endpoint, addr: String) -> Result<TcpListener> {
    TcpListener::bind(&addr)
        .await
        .map_err(|source| NodeError::Bind {
            role: endpoint.role(),
            addr,
            source,
        })
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    endpoint: Endpoint,
    mut shutdown: watch::Receiver<bool>,
) {
    let limit = shared
        .config
        .max_connections
        .map(|n| Arc::new(Semaphore::new(n)));
    let mut handlers = JoinSet::new();

    loop {
        let permit = match &limit {
            Some(semaphore) => tokio::select! {
                _ = shutdown.changed() => break,
                permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
            },
            None => None,
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            Some(_) = handlers.join_next(), if !handlers.is_empty() => continue,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(role = endpoint.role(), %err, "accept failed");
                        let delay = accept_retry_delay(&err);
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = shutdown.changed() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        continue;
                    }
                };
                debug!(role = endpoint.role(), %remote, "connection accepted");
                let shared = Arc::clone(&shared);
                handlers.spawn(
                    async move {
                        let _permit = permit;
                        let outcome = match endpoint {
                            Endpoint::Client => handle_client(&shared, stream).await,
                            Endpoint::Peer => handle_peer(&shared, stream).await,
                        };
                        if let Err(err) = outcome {
                            warn!(role = endpoint.role(), %remote, %err, "connection dropped");
                        }
                    }
                    .instrument(Span::current()),
                );
            }
        }
    }

    handlers.shutdown().await;
    debug!(role = endpoint.role(), "listener closed");
}

/// Errors tied to one connection are retried at once; anything else (descriptor
/// exhaustion, out of memory) waits before the listener is polled again.
fn accept_retry_delay(err: &io::Error) -> Duration {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => Duration::ZERO,
        _ => Duration::from_millis(ACCEPT_BACKOFF_MS),
    }
}

async fn handle_client(shared: &Shared, mut stream: TcpStream) -> Result<()> {
    let request: ClientRequest = read_message(&mut stream).await?;
    if !shared.accept_transaction(request.transaction) {
        write_message(&mut stream, &ClientResponse::new(INVALID_TRANSACTION)).await?;
    }
    // The acceptance line goes out after a rejection too; clients read the first reply.
    write_message(&mut stream, &ClientResponse::new(TRANSACTION_ACCEPTED)).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn handle_peer(shared: &Shared, mut stream: TcpStream) -> Result<()> {
    match read_message(&mut stream).await? {
        PeerMessage::Block { block } => {
            debug!(hash = block.hash(), "block received from peer");
            sync::handle_received_block(shared, block).await;
        }
        PeerMessage::RequestChain => {
            let chain = shared.snapshot().as_ref().clone();
            write_message(&mut stream, &ChainResponse { chain }).await?;
            stream.shutdown().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer;

    fn solo(difficulty: usize) -> NodeConfig {
        let mut config = NodeConfig::new(0, 0, vec!["127.0.0.1:0".to_string()], 0, difficulty);
        config.sync_on_start = false;
        config
    }

    #[test]
    fn accept_errors_back_off_unless_per_connection() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_retry_delay(&aborted), Duration::ZERO);
        // EMFILE: the listener keeps failing until a descriptor frees up.
        let exhausted = io::Error::from_raw_os_error(24);
        assert_eq!(
            accept_retry_delay(&exhausted),
            Duration::from_millis(ACCEPT_BACKOFF_MS)
        );
        assert!(accept_retry_delay(&io::Error::other("boom")) > Duration::ZERO);
    }

    #[tokio::test]
    async fn new_node_holds_only_genesis() {
        let node = Node::new(solo(2)).unwrap();
        let chain = node.chain();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].transactions(), ["0".to_string()]);
        assert!(!node.is_running().await);
        assert!(!node.is_mining());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = NodeConfig::new(0, 0, vec![], 0, 2);
        assert!(matches!(Node::new(config), Err(NodeError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let node = Node::new(solo(2)).unwrap();
        node.start().await.unwrap();
        assert!(matches!(node.start().await, Err(NodeError::AlreadyRunning)));
        node.stop().await;
        assert!(!node.is_running().await);
        node.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_leaves_node_stopped() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let mut config = solo(2);
        config.peer_port = port;
        let node = Node::new(config).unwrap();
        let err = node.start().await.unwrap_err();
        assert!(matches!(err, NodeError::Bind { role: "peer", .. }));
        assert!(!node.is_running().await);
    }

    #[tokio::test]
    async fn admission_rules() {
        let node = Node::new(solo(2)).unwrap();
        assert!(!node.submit_transaction(""));
        assert!(!node.submit_transaction("0"));
        assert!(node.submit_transaction("1"));
        assert!(node.submit_transaction("1"));
        assert_eq!(node.pool_snapshot(), vec!["1".to_string(), "1".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_port_double_acknowledges_rejections() {
        let node = Node::new(solo(2)).unwrap();
        node.start().await.unwrap();
        let addr = node.client_addr().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &ClientRequest { transaction: "0".into() })
            .await
            .unwrap();
        let first: ClientResponse = read_message(&mut stream).await.unwrap();
        let second: ClientResponse = read_message(&mut stream).await.unwrap();
        assert_eq!(first.message, INVALID_TRANSACTION);
        assert_eq!(second.message, TRANSACTION_ACCEPTED);

        node.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_node_mines_pooled_transaction() {
        let node = Node::new(solo(2)).unwrap();
        node.start().await.unwrap();
        let client = node.client_addr().await.unwrap().to_string();
        let peer_addr = node.peer_addr().await.unwrap().to_string();

        let reply = peer::submit_transaction(&client, "1", None).await.unwrap();
        assert_eq!(reply, TRANSACTION_ACCEPTED);

        let mut updates = node.subscribe_chain();
        tokio::time::timeout(Duration::from_secs(10), updates.wait_for(|c| c.len() == 2))
            .await
            .unwrap()
            .unwrap();

        let fetched = peer::fetch_chain(&peer_addr, None).await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[1].transactions(), ["1".to_string()]);
        assert!(ledger_core::chain::is_valid_chain(&fetched, 2));

        let reply = peer::submit_transaction(&client, "1", None).await.unwrap();
        assert_eq!(reply, INVALID_TRANSACTION);

        node.stop().await;
        assert!(node.pool_snapshot().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_keeps_chain() {
        let node = Node::new(solo(1)).unwrap();
        node.start().await.unwrap();
        node.submit_transaction("1");
        let mut updates = node.subscribe_chain();
        tokio::time::timeout(Duration::from_secs(10), updates.wait_for(|c| c.len() == 2))
            .await
            .unwrap()
            .unwrap();
        node.stop().await;

        node.start().await.unwrap();
        assert_eq!(node.chain().len(), 2);
        node.stop().await;
    }
}
