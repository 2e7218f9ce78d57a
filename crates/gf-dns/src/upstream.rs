use crate::wire::is_truncated;
use gf_core::BYPASS_MARK;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, UdpSocket};
use tracing::{debug, warn};

const UDP_TIMEOUT: Duration = Duration::from_secs(2);
const TCP_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_UDP_REPLY: usize = 4096;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream query timed out")]
    Timeout,
}

/// Forwards wire-format queries to the upstream resolver over sockets
/// carrying the bypass mark, so the NAT redirect does not loop them back
/// into the proxy.
#[derive(Debug, Clone)]
pub struct Forwarder {
    upstream: SocketAddr,
    mark: u32,
}

impl Forwarder {
    pub fn new(upstream: SocketAddr) -> Self {
        Self {
            upstream,
            mark: BYPASS_MARK,
        }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Forward a query and return the upstream reply verbatim. UDP first;
    /// a truncated reply is retried over TCP.
    pub async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let reply = self.forward_udp(query).await?;
        if is_truncated(&reply) {
            debug!("upstream reply truncated, retrying over TCP");
            return self.forward_tcp(query).await;
        }
        Ok(reply)
    }

    async fn forward_udp(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let bind = if self.upstream.is_ipv4() {
            SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0)
        };

        let socket = UdpSocket::bind(bind).await?;
        self.mark_socket(&socket);
        socket.connect(self.upstream).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; MAX_UDP_REPLY];
        let len = tokio::time::timeout(UDP_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| UpstreamError::Timeout)??;
        buf.truncate(len);
        Ok(buf)
    }

    async fn forward_tcp(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        tokio::time::timeout(TCP_TIMEOUT, self.exchange_tcp(query))
            .await
            .map_err(|_| UpstreamError::Timeout)?
    }

    async fn exchange_tcp(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let socket = if self.upstream.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        self.mark_socket(&socket);

        let mut stream = socket.connect(self.upstream).await?;
        stream.write_u16(query.len() as u16).await?;
        stream.write_all(query).await?;

        let len = stream.read_u16().await? as usize;
        let mut reply = vec![0u8; len];
        stream.read_exact(&mut reply).await?;
        Ok(reply)
    }

    // Losing the mark is survivable: without CAP_NET_ADMIN the NAT redirect
    // is absent too, so upstream queries cannot loop anyway.
    fn mark_socket(&self, socket: &impl std::os::fd::AsFd) {
        if let Err(e) = nix::sys::socket::setsockopt(socket, nix::sys::socket::sockopt::Mark, &self.mark)
        {
            warn!("failed to set bypass mark on upstream socket: {}", e);
        }
    }
}
