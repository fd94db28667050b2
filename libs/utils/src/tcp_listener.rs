use std::io;
use std::net::TcpListener;

/// Bind a TCP listener in non-blocking mode, ready to be handed to tokio.
pub fn bind(sockaddr: &str) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(sockaddr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}
