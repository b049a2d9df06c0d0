//! Outbound calls: one connection per exchange, closed afterwards.

use crate::error::{NodeError, Result};
use crate::wire::{
    read_message, write_message, ChainResponse, ClientRequest, ClientResponse, PeerMessage,
};
use ledger_core::Block;
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

async fn bounded<T>(limit: Option<Duration>, call: impl Future<Output = Result<T>>) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| NodeError::Timeout(limit))?,
        None => call.await,
    }
}

/// Asks the node listening on `addr` (a peer port) for its whole chain.
pub async fn fetch_chain(addr: &str, limit: Option<Duration>) -> Result<Vec<Block>> {
    bounded(limit, async {
        let mut stream = TcpStream::connect(addr).await?;
        write_message(&mut stream, &PeerMessage::RequestChain).await?;
        let response: ChainResponse = read_message(&mut stream).await?;
        Ok(response.chain)
    })
    .await
}

/// Pushes `block` to a peer port. Nothing comes back.
pub async fn send_block(addr: &str, block: &Block, limit: Option<Duration>) -> Result<()> {
    bounded(limit, async {
        let mut stream = TcpStream::connect(addr).await?;
        let message = PeerMessage::Block {
            block: block.clone(),
        };
        write_message(&mut stream, &message).await?;
        stream.shutdown().await?;
        Ok(())
    })
    .await
}

/// Sends one transaction to a client port and returns the first acknowledgement.
pub async fn submit_transaction(
    addr: &str,
    transaction: &str,
    limit: Option<Duration>,
) -> Result<String> {
    bounded(limit, async {
        let mut stream = TcpStream::connect(addr).await?;
        let request = ClientRequest {
            transaction: transaction.to_string(),
        };
        write_message(&mut stream, &request).await?;
        let reply: ClientResponse = read_message(&mut stream).await?;
        Ok(reply.message)
    })
    .await
}
