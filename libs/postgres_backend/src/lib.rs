//! Server-side of the Postgres protocol: accepts a frontend connection,
//! walks it through startup and authentication and then drives the simple
//! query loop, handing parsed queries to a `Handler`.
//!
//! Only what a replication endpoint needs is implemented: trust auth, the
//! simple query protocol and CopyBoth streaming. SSL negotiation is answered
//! with 'N' and cancel requests end the connection.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use pq_proto::framed::{ConnectionError, Framed};
use pq_proto::{BeMessage, FeMessage, FeStartupPacket, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// An error happened while querying.
///
/// A streaming connection is always terminated, but other errors are
/// reported to the client with ErrorResponse and the session continues.
#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    /// The connection was lost while processing the query.
    #[error(transparent)]
    Disconnected(#[from] ConnectionError),
    /// Some other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<io::Error> for QueryError {
    fn from(e: io::Error) -> Self {
        QueryError::Disconnected(ConnectionError::Io(e))
    }
}

impl From<ProtocolError> for QueryError {
    fn from(e: ProtocolError) -> Self {
        QueryError::Disconnected(ConnectionError::Protocol(e))
    }
}

/// Ways the CopyBoth stream of a replication command can end.
///
/// It always does end with an error of this type; `Result` is used only for
/// `?` convenience.
#[derive(thiserror::Error, Debug)]
pub enum CopyStreamHandlerEnd {
    /// The client sent CopyDone and the handshake completed: back to the
    /// query loop.
    #[error("copy stream finished")]
    CopyDone,
    /// Streaming ended on our initiative, with the given (logged) reason.
    #[error("ending streaming: {0}")]
    ServerInitiated(String),
    #[error(transparent)]
    Disconnected(#[from] ConnectionError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<io::Error> for CopyStreamHandlerEnd {
    fn from(e: io::Error) -> Self {
        CopyStreamHandlerEnd::Disconnected(ConnectionError::Io(e))
    }
}

impl From<ProtocolError> for CopyStreamHandlerEnd {
    fn from(e: ProtocolError) -> Self {
        CopyStreamHandlerEnd::Disconnected(ConnectionError::Protocol(e))
    }
}

impl From<QueryError> for CopyStreamHandlerEnd {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Disconnected(e) => CopyStreamHandlerEnd::Disconnected(e),
            QueryError::Other(e) => CopyStreamHandlerEnd::Other(e),
        }
    }
}

/// Authentication of incoming connections. The proxy trusts its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Trust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtoState {
    Initialization,
    Established,
    Closed,
}

pub struct PostgresBackend<IO> {
    framed: Framed<IO>,
    pub auth_type: AuthType,
    peer_addr: SocketAddr,
    state: ProtoState,
}

/// Implementors of this trait give the backend its behavior: they see the
/// startup parameters and execute the queries.
#[async_trait::async_trait]
pub trait Handler<IO: AsyncRead + AsyncWrite + Unpin + Send> {
    /// Called on the startup packet, before authentication. Gives the
    /// handler a chance to record parameters and reject the connection.
    fn startup(
        &mut self,
        pgb: &mut PostgresBackend<IO>,
        sm: &FeStartupPacket,
    ) -> Result<(), QueryError>;

    /// Called once after authentication succeeded, before the first
    /// ReadyForQuery: the place to report ParameterStatus values and
    /// BackendKeyData.
    async fn greet(&mut self, _pgb: &mut PostgresBackend<IO>) -> Result<(), QueryError> {
        Ok(())
    }

    /// Execute one simple-protocol query. CommandComplete is on the handler;
    /// ReadyForQuery is sent by the loop afterwards.
    async fn process_query(
        &mut self,
        pgb: &mut PostgresBackend<IO>,
        query_string: &str,
    ) -> Result<(), QueryError>;
}

impl<IO: AsyncRead + AsyncWrite + Unpin + Send> PostgresBackend<IO> {
    pub fn new(socket: IO, auth_type: AuthType, peer_addr: SocketAddr) -> Self {
        PostgresBackend {
            framed: Framed::new(socket),
            auth_type,
            peer_addr,
            state: ProtoState::Initialization,
        }
    }

    pub fn get_peer_addr(&self) -> &SocketAddr {
        &self.peer_addr
    }

    /// Read one frontend message. `Ok(None)` on clean EOF between messages.
    ///
    /// This is cancellation-safe: a partially received message is kept in
    /// the read buffer across calls.
    pub async fn read_message(&mut self) -> Result<Option<FeMessage>, ConnectionError> {
        if self.state == ProtoState::Closed {
            return Ok(None);
        }
        self.framed.read_message().await
    }

    /// Try to read a message without waiting: returns `Ok(None)` if nothing
    /// complete has arrived yet.
    pub async fn read_message_if_ready(&mut self) -> Result<Option<FeMessage>, ConnectionError> {
        match tokio::time::timeout(Duration::ZERO, self.read_message()).await {
            Ok(res) => res,
            Err(_elapsed) => Ok(None),
        }
    }

    /// Write a message into the output buffer, without flushing.
    pub fn write_message_noflush(
        &mut self,
        message: &BeMessage<'_>,
    ) -> Result<&mut Self, ProtocolError> {
        self.framed.write_message(message)?;
        Ok(self)
    }

    /// Write a message and flush everything buffered so far.
    pub async fn write_message(&mut self, message: &BeMessage<'_>) -> Result<&mut Self, QueryError> {
        self.write_message_noflush(message)?;
        self.flush().await?;
        Ok(self)
    }

    /// Flush the output buffer into the socket.
    pub async fn flush(&mut self) -> Result<(), io::Error> {
        self.framed.flush().await
    }

    /// Serve the connection: startup handshake, then the query loop, until
    /// the client disconnects or a fatal error happens.
    pub async fn run(mut self, handler: &mut (impl Handler<IO> + Send)) -> Result<(), QueryError> {
        let ret = self.run_message_loop(handler).await;
        // Try to shut down the socket cleanly whatever happened.
        let _ = self.framed.shutdown().await;
        match ret {
            Ok(()) => Ok(()),
            Err(QueryError::Disconnected(e)) => {
                info!("peer disconnected: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_message_loop(
        &mut self,
        handler: &mut (impl Handler<IO> + Send),
    ) -> Result<(), QueryError> {
        self.handle_startup(handler).await?;
        if self.state != ProtoState::Established {
            return Ok(()); // cancel request, or EOF during startup
        }

        handler.greet(self).await?;

        let mut send_ready_for_query = true;
        loop {
            if send_ready_for_query {
                self.write_message(&BeMessage::ReadyForQuery).await?;
                send_ready_for_query = false;
            }

            let msg = match self.read_message().await? {
                Some(msg) => msg,
                None => break, // client went away
            };
            debug!("got message {:?}", msg);

            match msg {
                FeMessage::Query(body) => {
                    let query_string = std::str::from_utf8(&body)
                        .map_err(|e| QueryError::Other(anyhow::anyhow!("non-UTF8 query: {e}")))?;
                    if let Err(e) = handler.process_query(self, query_string).await {
                        match e {
                            QueryError::Disconnected(_) => return Err(e),
                            QueryError::Other(e) => {
                                info!("query handler for '{}' failed: {:#}", query_string, e);
                                self.write_message_noflush(&BeMessage::ErrorResponse(
                                    &e.to_string(),
                                ))?;
                            }
                        }
                    }
                    send_ready_for_query = true;
                }
                FeMessage::Sync => {
                    send_ready_for_query = true;
                }
                FeMessage::Flush => {
                    self.flush().await?;
                }
                FeMessage::Terminate => break,
                // Copy sub-protocol messages arriving outside streaming are
                // lost leftovers; ignore them.
                FeMessage::CopyData(_) | FeMessage::CopyDone | FeMessage::CopyFail => {}
                FeMessage::Parse
                | FeMessage::Bind
                | FeMessage::Execute
                | FeMessage::Describe
                | FeMessage::Close
                | FeMessage::FunctionCall => {
                    let err = "extended query protocol is not permitted on this endpoint";
                    self.write_message(&BeMessage::ErrorResponse(err)).await?;
                    return Err(QueryError::Other(anyhow::anyhow!(err)));
                }
            }
        }

        Ok(())
    }

    /// Read the startup packet(s), answering SSL negotiation on the way, and
    /// authenticate.
    async fn handle_startup(&mut self, handler: &mut impl Handler<IO>) -> Result<(), QueryError> {
        assert_eq!(self.state, ProtoState::Initialization);

        loop {
            let msg = match self.framed.read_startup_message().await? {
                Some(msg) => msg,
                None => {
                    self.state = ProtoState::Closed;
                    return Ok(()); // client never sent anything
                }
            };
            info!("received {}", msg);

            match msg {
                FeStartupPacket::SslRequest => {
                    // No SSL support: decline and wait for the real packet.
                    self.framed.write_raw_byte(b'N');
                    self.flush().await?;
                }
                FeStartupPacket::CancelRequest { .. } => {
                    // Nothing to cancel, and this connection carries nothing
                    // else by protocol definition.
                    self.state = ProtoState::Closed;
                    return Ok(());
                }
                sm @ FeStartupPacket::StartupMessage { .. } => {
                    if let Err(e) = handler.startup(self, &sm) {
                        if let QueryError::Other(e) = &e {
                            // let the client know why it was turned away
                            self.write_message(&BeMessage::ErrorResponse(&e.to_string()))
                                .await?;
                        }
                        return Err(e);
                    }

                    match self.auth_type {
                        AuthType::Trust => {
                            self.write_message_noflush(&BeMessage::AuthenticationOk)?;
                        }
                    }
                    self.state = ProtoState::Established;
                    return Ok(());
                }
            }
        }
    }

    /// Log the way a copy stream ended and report it to the client if the
    /// connection still permits that.
    pub async fn handle_copy_stream_end(&mut self, end: CopyStreamHandlerEnd) {
        match &end {
            CopyStreamHandlerEnd::CopyDone => {
                debug!("copy stream ended by the client");
            }
            CopyStreamHandlerEnd::ServerInitiated(reason) => {
                info!("{}", reason);
            }
            CopyStreamHandlerEnd::Disconnected(e) => {
                info!("copy stream client disconnected: {}", e);
            }
            CopyStreamHandlerEnd::Other(e) => {
                info!("copy stream failed: {:#}", e);
                let _ = self
                    .write_message(&BeMessage::ErrorResponse(&e.to_string()))
                    .await;
            }
        }
    }
}
