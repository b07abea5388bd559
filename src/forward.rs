//! Single round trip to the upstream resolver over UDP.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no reply from upstream within {0:?}")]
    Timeout(Duration),
}

/// Sends a raw query to one upstream resolver and waits for exactly one
/// reply datagram. A fresh outbound socket is opened per call; there is no
/// pooling, retry or fallback.
pub struct Forwarder {
    upstream: SocketAddr,
    wait: Duration,
}

impl Forwarder {
    pub fn new(upstream: SocketAddr, wait: Duration) -> Self {
        Self { upstream, wait }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    pub async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, ForwardError> {
        let bind_addr = if self.upstream.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.upstream).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; 4096];
        let len = timeout(self.wait, socket.recv(&mut buf))
            .await
            .map_err(|_| ForwardError::Timeout(self.wait))??;
        buf.truncate(len);
        Ok(buf)
    }
}
