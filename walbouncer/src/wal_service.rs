//! The WAL service: accepts standby connections and serves each one in its
//! own task. Sessions share nothing; every task owns its socket, its
//! connection to the primary and its filter state.

use anyhow::Context;
use postgres_backend::{AuthType, PostgresBackend};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info_span, Instrument};

use crate::handler::WalProxyHandler;
use crate::WalBouncerConf;

/// Accept incoming connections and spawn a session task for each.
pub async fn task_main(conf: WalBouncerConf, listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (socket, peer_addr) = listener.accept().await.context("accept")?;
        debug!("accepted connection from {}", peer_addr);
        let conf = conf.clone();
        tokio::spawn(
            async move {
                if let Err(err) = handle_socket(socket, conf).await {
                    error!("connection handler exited: {:#}", err);
                }
            }
            .instrument(info_span!("standby", %peer_addr)),
        );
    }
}

/// One session: the whole life of a standby connection.
async fn handle_socket(socket: TcpStream, conf: WalBouncerConf) -> anyhow::Result<()> {
    socket.set_nodelay(true)?;
    let peer_addr = socket.peer_addr()?;

    let mut handler = WalProxyHandler::new(conf);
    let pgbackend = PostgresBackend::new(socket, AuthType::Trust, peer_addr);
    // the replication protocol between the standby and us
    pgbackend.run(&mut handler).await?;
    Ok(())
}
