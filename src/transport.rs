use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

/// Non-blocking send / blocking receive of bounded datagrams. Datagram
///  boundaries are preserved; there is no reliability and no ordering.
///
/// This seam exists so that the retry and receive machinery can be exercised
///  against mocks and fault-injecting wrappers instead of a real socket.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    /// Hand one datagram to the kernel. Fails only on local errors - a
    ///  returned `Ok` says nothing about delivery.
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    /// Block until one datagram arrives. Returns the number of bytes written
    ///  into `buf` and the sender's address.
    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding UDP socket to {:?}", addr))?;
        Ok(UdpTransport { socket })
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        trace!("sending {} byte datagram to {:?}", buf.len(), to);
        self.socket
            .send_to(buf, to)
            .await
            .with_context(|| format!("sending datagram to {:?}", to))?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        let (num_read, from) = self.socket.recv_from(buf).await.context("receiving datagram")?;
        trace!("received {} byte datagram from {:?}", num_read, from);
        Ok((num_read, from))
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr().context("querying local socket address")
    }
}
