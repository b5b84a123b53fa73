// src/core/listener.rs

//! TCP listener accepting supervisor RPCs and dispatching them to the
//! local agent.

use crate::core::agent::LocalAgent;
use crate::core::protocol::ServerCodec;
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Runs the accept loop until shutdown. Each connection is served on its
/// own task; a connection may carry any number of request/response pairs.
pub async fn run(
    bind_addr: String,
    agent: Arc<LocalAgent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("supervisor RPC listener on {}", bind_addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        let agent = agent.clone();
                        tokio::spawn(async move {
                            debug!("accepted supervisor connection from {}", addr);
                            if let Err(e) = handle_connection(socket, agent).await {
                                warn!("error serving supervisor connection from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => warn!("failed to accept supervisor connection: {}", e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("supervisor RPC listener shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(socket: TcpStream, agent: Arc<LocalAgent>) -> Result<()> {
    let mut framed = Framed::new(socket, ServerCodec);
    while let Some(decoded) = framed.next().await {
        let request = match decoded {
            Ok(request) => request,
            Err(e) => {
                warn!("error decoding supervisor request: {}", e);
                break;
            }
        };
        // Un-committed proposals expire lazily, on the next inbound request.
        agent.expire_stale_prepare();
        let response = agent.handle(request).await;
        if let Err(e) = framed.send(response).await {
            warn!("error sending supervisor response: {}", e);
            break;
        }
    }
    Ok(())
}
