use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::bail;

use crate::packet::MAX_APPENDED_ACKS;

pub struct UdpConfig {
    pub self_addr: SocketAddr,

    /// Upper bound for outgoing datagrams including all headers and appended acks. Viewers
    ///  assume 1200 bytes (the protocol's MTU) and may drop anything bigger.
    ///
    /// Received datagrams may be up to twice this size, bigger ones are dropped.
    pub max_datagram_size: usize,

    /// This is the number of buffers that will be pooled at a given time - buffers in excess of this
    ///  number are discarded when they are returned.
    pub buffer_pool_size: usize,

    /// A reliable datagram that was not acknowledged for this long is sent again
    pub resend_timeout: Duration,

    /// Total number of transmissions of a reliable datagram, including the first one. When a
    ///  datagram that was sent this many times times out, the circuit is considered failed.
    pub max_send_attempts: u32,

    /// Interval of the sweep that resends datagrams, flushes acks and checks for inactive circuits.
    ///  This is the granularity of all timeouts.
    pub sweep_interval: Duration,

    /// Number of recently received reliable sequence numbers remembered per circuit for
    ///  suppressing duplicates
    pub dedup_window_size: usize,

    /// Maximum number of pending acks piggybacked onto a single outgoing datagram. Acks that do
    ///  not fit are sent in a separate PacketAck message on the next sweep.
    pub max_appended_acks: usize,

    pub circuit_inactivity_timeout: Duration,

    /// Time a closing circuit waits for its in-flight datagrams to be acknowledged
    pub closing_timeout: Duration,

    /// Capacity of the queue between the receive loop and the dispatch worker. When it is full,
    ///  the receive loop waits (and the OS starts dropping datagrams).
    pub dispatch_queue_size: usize,

    /// Capacity of each circuit's structured event queue. When it is full, the oldest event
    ///  is dropped.
    pub max_queued_events: usize,

    /// Limit for the size of a zero-decoded payload, bounding the memory a small malicious
    ///  datagram can make us allocate
    pub max_zero_decoded_size: usize,
}

impl UdpConfig {
    /// Defaults for a simulator listening on the protocol's conventional port on all IPV4
    ///  interfaces
    pub fn default_ipv4() -> UdpConfig {
        UdpConfig {
            self_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 9000)),
            max_datagram_size: 1200,
            buffer_pool_size: 4096,
            resend_timeout: Duration::from_secs(3),
            max_send_attempts: 3,
            sweep_interval: Duration::from_millis(100),
            dedup_window_size: 1024,
            max_appended_acks: 64,
            circuit_inactivity_timeout: Duration::from_secs(60),
            closing_timeout: Duration::from_secs(5),
            dispatch_queue_size: 1024,
            max_queued_events: 256,
            max_zero_decoded_size: 8192,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < 100 {
            bail!("max datagram size is too small");
        }
        if self.max_send_attempts == 0 {
            bail!("reliable datagrams must be sent at least once");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must not be zero");
        }
        if self.resend_timeout < self.sweep_interval {
            bail!("resend timeout {:?} is shorter than the sweep interval {:?}", self.resend_timeout, self.sweep_interval);
        }
        if self.dedup_window_size == 0 {
            bail!("dedup window must not be empty");
        }
        if self.max_appended_acks > MAX_APPENDED_ACKS {
            bail!("at most {} acks can be appended to a datagram", MAX_APPENDED_ACKS);
        }
        if self.dispatch_queue_size == 0 {
            bail!("dispatch queue size must not be zero");
        }
        if self.max_queued_events == 0 {
            bail!("event queue size must not be zero");
        }
        if self.max_zero_decoded_size < self.max_datagram_size {
            bail!("max zero-decoded size must be at least the max datagram size");
        }
        Ok(())
    }
}
