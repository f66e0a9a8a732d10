//! TCP server listener
//!
//! Binds the listener, accepts connections and runs one handler task per
//! connection until a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::replication::replica;
use crate::server::connection::Connection;
use crate::server::handler::Handler;
use crate::server::ServerContext;

/// The carmine TCP server
pub struct Server {
    /// TCP listener
    listener: TcpListener,

    /// Shared node state
    ctx: Arc<ServerContext>,
}

impl Server {
    /// Bind the listener and assemble the node state. A configured port of
    /// 0 binds an ephemeral port; the actual port is what gets advertised
    /// to a primary.
    pub async fn new(config: Config) -> Result<Self> {
        let listener = TcpListener::bind(config.address()).await?;
        let local_addr = listener.local_addr()?;
        info!("server listening on {local_addr}");

        let ctx = Arc::new(ServerContext::new(config, local_addr.port()));
        Ok(Self { listener, ctx })
    }

    /// Handle on the shared node state
    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// Address the listener actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// One-shot replica attachment per the configuration. Must complete
    /// before `run` starts accepting traffic; a no-op on primaries.
    pub async fn attach_to_primary(&self) -> Result<()> {
        if let Some((host, port)) = self.ctx.config.replica_of.clone() {
            replica::sync_with_primary(self.ctx.clone(), &host, port).await?;
        }
        Ok(())
    }

    /// Accept connections until a ctrl-c shutdown signal
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("accepted connection from {addr}");
                            let handler = Handler::new(Connection::new(stream), self.ctx.clone());
                            tokio::spawn(async move {
                                if let Err(e) = handler.run().await {
                                    // Non-conforming peers are dropped without
                                    // a goodbye; the error only reaches the log
                                    warn!("connection from {addr} closed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("failed to accept connection: {e}");
                        }
                    }
                }
                _ = signal::ctrl_c() => {
                    info!("shutdown signal received");
                    return Ok(());
                }
            }
        }
    }
}
