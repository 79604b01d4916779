use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    /// Errors are logged rather than returned: UDP is lossy anyway, and the reliability layer
    ///  retransmits whatever matters
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }
}
