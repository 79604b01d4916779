use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::buffers::buffer_pool::SendBufferPool;
use crate::config::UdpConfig;
use crate::dedup_window::DedupWindow;
use crate::error::TransportError;
use crate::event_queue::EventQueue;
use crate::messages::{AnyMessage, CloseCircuit, CompletePingCheck, PacketAck, StartPingCheck};
use crate::packet::{append_acks, set_resent, write_datagram, ReceivedPacket, MAX_APPENDED_ACKS};
use crate::packet_header::PacketFlags;
use crate::registry::{MessageTypeInfo, MessageTypeRegistry};
use crate::send_pipeline::SendSocket;
use crate::sequence_number::SequenceNumber;
use crate::structured::StructuredMessage;

/// ```ascii
/// Open --first datagram after the handshake--> Established
/// Open | Established --LogoutReply sent / local close--> Closing
/// Closing --in-flight table drained or closing timeout--> Closed
/// any --timeout / retries exhausted / CloseCircuit received--> Closed
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CircuitState {
    Open,
    Established,
    Closing,
    Closed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CloseReason {
    Logout,
    /// The peer sent CloseCircuit
    ClosedByPeer,
    /// Closed locally through the end point
    Shutdown,
    /// Nothing was received for the configured inactivity timeout
    Timeout,
    /// A reliable datagram was not acknowledged in time, however often it was resent
    RetryExhausted { sequence: SequenceNumber },
}

impl CloseReason {
    fn notifies_peer(&self) -> bool {
        matches!(self, CloseReason::Logout | CloseReason::Shutdown)
    }
}

/// What identifies a circuit for handlers and event subscribers
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CircuitInfo {
    pub addr: SocketAddr,
    pub circuit_code: u32,
    pub agent_id: Uuid,
    pub session_id: Uuid,
    /// Trusted circuits connect internal services, and only they may carry trusted-only
    ///  message types
    pub trusted: bool,
}

/// What happens to a datagram after the circuit processed it
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Dispatch(AnyMessage),
    /// Duplicates and transport-level messages: nothing to dispatch
    Consumed,
    /// The datagram closed the circuit
    Closed(CloseReason),
}

struct InFlight {
    /// The datagram as it was first sent, without appended acks
    datagram: Vec<u8>,
    sent_at: Instant,
    attempts: u32,
}

struct CircuitInner {
    state: CircuitState,
    next_sequence: SequenceNumber,
    in_flight: BTreeMap<SequenceNumber, InFlight>,
    received: DedupWindow,
    pending_acks: Vec<SequenceNumber>,
    last_received: Instant,
    closing_since: Option<Instant>,
    close_reason: Option<CloseReason>,
}

/// The reliability engine for a single peer. All mutable state is behind a per-circuit lock,
///  so inbound processing, application sends and the sweep for one circuit are serialized
///  while different circuits proceed independently.
pub struct Circuit {
    info: CircuitInfo,
    config: Arc<UdpConfig>,
    registry: Arc<MessageTypeRegistry>,
    send_socket: Arc<dyn SendSocket>,
    buffer_pool: Arc<SendBufferPool>,
    event_queue: EventQueue,
    closed: AtomicBool,
    inner: Mutex<CircuitInner>,
}

impl Circuit {
    pub fn new(
        info: CircuitInfo,
        config: Arc<UdpConfig>,
        registry: Arc<MessageTypeRegistry>,
        send_socket: Arc<dyn SendSocket>,
        buffer_pool: Arc<SendBufferPool>,
    ) -> Circuit {
        Circuit {
            event_queue: EventQueue::new(config.max_queued_events),
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Open,
                next_sequence: SequenceNumber::FIRST,
                in_flight: BTreeMap::new(),
                received: DedupWindow::new(config.dedup_window_size),
                pending_acks: Vec::new(),
                last_received: Instant::now(),
                closing_since: None,
                close_reason: None,
            }),
            closed: AtomicBool::new(false),
            info,
            config,
            registry,
            send_socket,
            buffer_pool,
        }
    }

    pub fn info(&self) -> &CircuitInfo {
        &self.info
    }

    pub fn addr(&self) -> SocketAddr {
        self.info.addr
    }

    /// Lock-free check whether the circuit reached [CircuitState::Closed]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub fn event_queue(&self) -> &EventQueue {
        &self.event_queue
    }

    /// Queues a message for delivery over the structured fallback channel instead of UDP
    pub fn enqueue_event<M: StructuredMessage>(&self, msg: &M) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::CircuitClosed(self.info.addr));
        }
        self.event_queue.enqueue(msg);
        Ok(())
    }

    /// Sends a message with the attributes its type is registered with
    pub async fn send_default(&self, msg: &AnyMessage) -> Result<SequenceNumber, TransportError> {
        let reliable = self.registry.attributes_of(msg)?.reliable;
        self.send(msg, reliable).await
    }

    pub async fn send(&self, msg: &AnyMessage, reliable: bool) -> Result<SequenceNumber, TransportError> {
        if self.registry.attributes_of(msg)?.trusted && !self.info.trusted {
            warn!(target: "gridwire::security", "refusing to send trusted-only {} on untrusted circuit {:?}", msg.name(), self.info.addr);
            return Err(TransportError::UntrustedViolation { message_type: msg.message_type(), circuit: self.info.addr });
        }

        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::Closed {
            return Err(TransportError::CircuitClosed(self.info.addr));
        }

        let sequence = self.send_locked(&mut inner, msg, reliable).await?;

        if let AnyMessage::LogoutReply(_) = msg {
            self.begin_closing_locked(&mut inner, CloseReason::Logout);
        }
        Ok(sequence)
    }

    /// Sends a liveness probe. The peer's reply is consumed by the circuit.
    pub async fn ping(&self, ping_id: u8) -> Result<SequenceNumber, TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::Closed {
            return Err(TransportError::CircuitClosed(self.info.addr));
        }

        // key order is numeric order, which is not the sending order after a wraparound
        let oldest_unacked = inner.in_flight.keys()
            .copied()
            .reduce(|oldest, seq| if oldest.is_newer_than(seq) { seq } else { oldest })
            .unwrap_or(inner.next_sequence);
        self.send_locked(&mut inner, &StartPingCheck { ping_id, oldest_unacked }.into(), false).await
    }

    async fn send_locked(&self, inner: &mut CircuitInner, msg: &AnyMessage, reliable: bool) -> Result<SequenceNumber, TransportError> {
        let mut flags = if reliable { PacketFlags::RELIABLE } else { PacketFlags::empty() };
        if self.registry.attributes_of(msg)?.zero_coded {
            flags |= PacketFlags::ZERO_CODED;
        }
        let sequence = inner.next_sequence;

        let mut buf = self.buffer_pool.get_from_pool();
        write_datagram(&mut buf, flags, sequence, msg);
        if buf.len() > self.config.max_datagram_size {
            let len = buf.len();
            self.buffer_pool.return_to_pool(buf);
            debug!("{} for {:?} does not fit into a datagram: {} bytes", msg.name(), self.info.addr, len);
            return Err(TransportError::OversizedMessage { len, max: self.config.max_datagram_size });
        }

        inner.next_sequence = sequence.next();
        if reliable {
            inner.in_flight.insert(sequence, InFlight {
                datagram: buf.to_vec(),
                sent_at: Instant::now(),
                attempts: 1,
            });
        }
        self.append_pending_acks(inner, &mut buf);

        trace!("sending {} as {:?} to {:?}", msg.name(), sequence, self.info.addr);
        self.send_socket.do_send_packet(self.info.addr, &buf).await;
        self.buffer_pool.return_to_pool(buf);
        Ok(sequence)
    }

    fn append_pending_acks(&self, inner: &mut CircuitInner, buf: &mut BytesMut) {
        let room = self.config.max_datagram_size.saturating_sub(buf.len() + 1) / 4;
        let count = inner.pending_acks.len()
            .min(self.config.max_appended_acks)
            .min(room);
        if count > 0 {
            let acks = inner.pending_acks.drain(..count).collect::<Vec<_>>();
            append_acks(buf, &acks);
        }
    }

    /// Processes a datagram that was decoded successfully, `msg_type` being the registry entry
    ///  it was decoded with. Errors mean that the datagram is dropped without being acknowledged.
    pub async fn on_inbound(&self, packet: &ReceivedPacket, msg_type: &MessageTypeInfo, msg: AnyMessage) -> Result<Inbound, TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::Closed {
            return Err(TransportError::CircuitClosed(self.info.addr));
        }
        if msg_type.attributes.trusted && !self.info.trusted {
            return Err(TransportError::UntrustedViolation { message_type: msg_type.id, circuit: self.info.addr });
        }

        inner.last_received = Instant::now();
        if inner.state == CircuitState::Open && !matches!(msg, AnyMessage::UseCircuitCode(_)) {
            debug!("circuit {:?} is established", self.info.addr);
            inner.state = CircuitState::Established;
        }

        for &ack in &packet.appended_acks {
            self.on_ack(&mut inner, ack);
        }

        let sequence = packet.header.sequence;
        if packet.is_reliable() {
            inner.pending_acks.push(sequence);
        }
        if !inner.received.insert(sequence) {
            debug!("duplicate datagram {:?} from {:?} - not dispatching", sequence, self.info.addr);
            return Ok(Inbound::Consumed);
        }

        match msg {
            AnyMessage::PacketAck(ack) => {
                for seq in ack.packets {
                    self.on_ack(&mut inner, seq);
                }
                Ok(Inbound::Consumed)
            }
            AnyMessage::StartPingCheck(ping) => {
                self.send_locked(&mut inner, &CompletePingCheck { ping_id: ping.ping_id }.into(), false).await?;
                Ok(Inbound::Consumed)
            }
            AnyMessage::CompletePingCheck(ping) => {
                trace!("ping {} completed by {:?}", ping.ping_id, self.info.addr);
                Ok(Inbound::Consumed)
            }
            AnyMessage::CloseCircuit(_) => {
                self.finish_closing(&mut inner, CloseReason::ClosedByPeer).await;
                Ok(Inbound::Closed(CloseReason::ClosedByPeer))
            }
            msg => Ok(Inbound::Dispatch(msg)),
        }
    }

    fn on_ack(&self, inner: &mut CircuitInner, sequence: SequenceNumber) {
        if inner.in_flight.remove(&sequence).is_some() {
            trace!("{:?} acknowledged by {:?}", sequence, self.info.addr);
        }
        else {
            trace!("ignoring ack for {:?} from {:?}: not in flight", sequence, self.info.addr);
        }
    }

    /// Starts an orderly shutdown: the circuit stays usable until its in-flight datagrams are
    ///  acknowledged or the closing timeout expires
    pub async fn begin_closing(&self, reason: CloseReason) {
        let mut inner = self.inner.lock().await;
        self.begin_closing_locked(&mut inner, reason);
    }

    fn begin_closing_locked(&self, inner: &mut CircuitInner, reason: CloseReason) {
        match inner.state {
            CircuitState::Open | CircuitState::Established => {
                debug!("circuit {:?} is closing: {:?}", self.info.addr, reason);
                inner.state = CircuitState::Closing;
                inner.closing_since = Some(Instant::now());
                inner.close_reason = Some(reason);
            }
            CircuitState::Closing | CircuitState::Closed => {}
        }
    }

    /// Periodic housekeeping: resends unacknowledged datagrams, flushes pending acks and
    ///  enforces timeouts. Returns the reason if the circuit closed during this sweep.
    pub async fn sweep(&self, now: Instant) -> Option<CloseReason> {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::Closed {
            return None;
        }

        if now.duration_since(inner.last_received) >= self.config.circuit_inactivity_timeout {
            info!("nothing received from {:?} for {:?}", self.info.addr, self.config.circuit_inactivity_timeout);
            self.finish_closing(&mut inner, CloseReason::Timeout).await;
            return Some(CloseReason::Timeout);
        }

        if let Some(sequence) = self.resend_expired(&mut inner, now).await {
            let reason = CloseReason::RetryExhausted { sequence };
            self.finish_closing(&mut inner, reason.clone()).await;
            return Some(reason);
        }

        self.flush_acks(&mut inner).await;

        if inner.state == CircuitState::Closing {
            let timed_out = inner.closing_since
                .map(|since| now.duration_since(since) >= self.config.closing_timeout)
                .unwrap_or(true);

            if inner.in_flight.is_empty() || timed_out {
                let reason = inner.close_reason.clone().unwrap_or(CloseReason::Shutdown);
                self.finish_closing(&mut inner, reason.clone()).await;
                return Some(reason);
            }
        }
        None
    }

    /// Returns the sequence number of a datagram that ran out of attempts, if any
    async fn resend_expired(&self, inner: &mut CircuitInner, now: Instant) -> Option<SequenceNumber> {
        let expired = inner.in_flight.iter()
            .filter(|(_, f)| now.duration_since(f.sent_at) >= self.config.resend_timeout)
            .map(|(&seq, _)| seq)
            .collect::<Vec<_>>();

        for sequence in expired {
            let Some(in_flight) = inner.in_flight.get_mut(&sequence) else {
                continue;
            };

            let attempts = in_flight.attempts;
            if attempts >= self.config.max_send_attempts {
                warn!("{}", TransportError::RetryExhausted { circuit: self.info.addr, sequence, attempts });
                inner.in_flight.remove(&sequence);
                return Some(sequence);
            }

            in_flight.attempts += 1;
            in_flight.sent_at = now;
            set_resent(&mut in_flight.datagram);

            debug!("resending {:?} to {:?} (attempt {})", sequence, self.info.addr, in_flight.attempts);
            self.send_socket.do_send_packet(self.info.addr, &in_flight.datagram).await;
        }
        None
    }

    async fn flush_acks(&self, inner: &mut CircuitInner) {
        while !inner.pending_acks.is_empty() {
            let count = inner.pending_acks.len().min(MAX_APPENDED_ACKS);
            let packets = inner.pending_acks.drain(..count).collect();
            if let Err(e) = self.send_locked(inner, &PacketAck { packets }.into(), false).await {
                warn!("error flushing acks to {:?}: {}", self.info.addr, e);
                return;
            }
        }
    }

    async fn finish_closing(&self, inner: &mut CircuitInner, reason: CloseReason) {
        self.flush_acks(inner).await;
        if reason.notifies_peer() {
            if let Err(e) = self.send_locked(inner, &CloseCircuit.into(), false).await {
                debug!("could not send CloseCircuit to {:?}: {}", self.info.addr, e);
            }
        }

        info!("circuit {:?} closed: {:?}", self.info.addr, reason);
        inner.state = CircuitState::Closed;
        inner.in_flight.clear();
        inner.received.clear();
        inner.pending_acks.clear();
        inner.close_reason = Some(reason);
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use tokio::time;
    use crate::messages::{HealthMessage, Message, KickUser, LogoutReply, LogoutRequest, UseCircuitCode};
    use crate::message_type::MessageTypeId;
    use crate::packet_header::PacketHeader;
    use crate::registry::{decode_any, MessageAttributes};
    use crate::send_pipeline::MockSendSocket;
    use super::*;

    type Sent = Arc<StdMutex<Vec<Vec<u8>>>>;

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], 13000))
    }

    fn info(trusted: bool) -> CircuitInfo {
        CircuitInfo {
            addr: peer(),
            circuit_code: 77,
            agent_id: Uuid::from_u128(1),
            session_id: Uuid::from_u128(2),
            trusted,
        }
    }

    fn config() -> UdpConfig {
        let mut config = UdpConfig::default_ipv4();
        config.resend_timeout = Duration::from_secs(1);
        config.sweep_interval = Duration::from_millis(100);
        config.circuit_inactivity_timeout = Duration::from_secs(60);
        config.closing_timeout = Duration::from_secs(5);
        config.max_appended_acks = 3;
        config
    }

    fn registry() -> Arc<MessageTypeRegistry> {
        Arc::new(MessageTypeRegistry::with_builtin_messages().unwrap())
    }

    fn circuit_with(config: UdpConfig, trusted: bool) -> (Circuit, Sent) {
        circuit_with_registry(config, trusted, registry())
    }

    fn circuit_with_registry(config: UdpConfig, trusted: bool, registry: Arc<MessageTypeRegistry>) -> (Circuit, Sent) {
        let sent: Sent = Default::default();
        let sent2 = sent.clone();

        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .withf(|to, _| *to == peer())
            .returning(move |_, buf| sent2.lock().unwrap().push(buf.to_vec()));

        let circuit = Circuit::new(
            info(trusted),
            Arc::new(config),
            registry,
            Arc::new(send_socket),
            Arc::new(SendBufferPool::new(1200, 10)),
        );
        (circuit, sent)
    }

    fn circuit() -> (Circuit, Sent) {
        circuit_with(config(), false)
    }

    fn sent_packets(sent: &Sent) -> Vec<ReceivedPacket> {
        sent.lock().unwrap().iter()
            .map(|d| ReceivedPacket::parse(d, 8192).unwrap())
            .collect()
    }

    fn take_sent(sent: &Sent) -> Vec<ReceivedPacket> {
        let result = sent_packets(sent);
        sent.lock().unwrap().clear();
        result
    }

    fn inbound(sequence: u32, flags: PacketFlags, acks: Vec<u32>) -> ReceivedPacket {
        ReceivedPacket {
            header: PacketHeader::new(flags, SequenceNumber::from_raw(sequence)),
            payload: vec![],
            appended_acks: acks.into_iter().map(SequenceNumber::from_raw).collect(),
        }
    }

    /// Feeds a message to the circuit the way the end point does, with its builtin registration
    async fn receive(circuit: &Circuit, packet: &ReceivedPacket, msg: AnyMessage) -> Result<Inbound, TransportError> {
        let msg_type = *registry().get(msg.message_type()).unwrap();
        circuit.on_inbound(packet, &msg_type, msg).await
    }

    fn health() -> AnyMessage {
        HealthMessage { health: 75.5 }.into()
    }

    fn logout_request() -> AnyMessage {
        LogoutRequest { agent_id: Uuid::from_u128(1), session_id: Uuid::from_u128(2) }.into()
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap()
    }

    #[test]
    fn test_sequence_numbers_increase() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit();

            let mut previous = None;
            for reliable in [true, false, true, true, false] {
                let seq = circuit.send(&health(), reliable).await.unwrap();
                if let Some(prev) = previous {
                    assert!(seq.is_newer_than(prev));
                    assert_eq!(seq, SequenceNumber::next(&prev));
                }
                previous = Some(seq);
            }

            let sequences = sent_packets(&sent).iter().map(|p| p.header.sequence.to_raw()).collect::<Vec<_>>();
            assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        });
    }

    #[test]
    fn test_reliable_send_is_tracked() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit();
            circuit.send(&health(), true).await.unwrap();
            circuit.send(&health(), false).await.unwrap();

            let packets = sent_packets(&sent);
            assert!(packets[0].is_reliable());
            assert!(!packets[1].is_reliable());

            let inner = circuit.inner.lock().await;
            assert_eq!(inner.in_flight.keys().copied().collect::<Vec<_>>(), vec![SequenceNumber::from_raw(1)]);
            assert_eq!(inner.in_flight[&SequenceNumber::from_raw(1)].attempts, 1);
        });
    }

    #[rstest]
    #[case::appended(vec![1], vec![])]
    #[case::appended_twice(vec![1, 1], vec![])]
    #[case::appended_unknown(vec![7], vec![1])]
    fn test_appended_acks_remove_in_flight(#[case] acks: Vec<u32>, #[case] expected_in_flight: Vec<u32>) {
        paused_runtime().block_on(async {
            let (circuit, _) = circuit();
            circuit.send(&health(), true).await.unwrap();

            let result = receive(&circuit, &inbound(1, PacketFlags::ACKS_APPENDED, acks), health()).await.unwrap();
            assert_eq!(result, Inbound::Dispatch(health()));

            let inner = circuit.inner.lock().await;
            assert_eq!(
                inner.in_flight.keys().map(|s| s.to_raw()).collect::<Vec<_>>(),
                expected_in_flight);
        });
    }

    #[test]
    fn test_packet_ack_message_removes_in_flight() {
        paused_runtime().block_on(async {
            let (circuit, _) = circuit();
            circuit.send(&health(), true).await.unwrap();
            circuit.send(&health(), true).await.unwrap();

            let ack = PacketAck { packets: vec![SequenceNumber::from_raw(2)] };
            let result = receive(&circuit, &inbound(1, PacketFlags::empty(), vec![]), ack.into()).await.unwrap();
            assert_eq!(result, Inbound::Consumed);

            let inner = circuit.inner.lock().await;
            assert_eq!(inner.in_flight.keys().map(|s| s.to_raw()).collect::<Vec<_>>(), vec![1]);
        });
    }

    #[test]
    fn test_duplicate_is_acked_but_not_dispatched() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit();

            let first = receive(&circuit, &inbound(5, PacketFlags::RELIABLE, vec![]), health()).await.unwrap();
            assert_eq!(first, Inbound::Dispatch(health()));

            let resent = receive(&circuit, &inbound(5, PacketFlags::RELIABLE | PacketFlags::RESENT, vec![]), health()).await.unwrap();
            assert_eq!(resent, Inbound::Consumed);

            circuit.sweep(Instant::now()).await;
            let packets = take_sent(&sent);
            assert_eq!(packets.len(), 1);

            let (_, msg) = registry().decode_message(&packets[0].payload).unwrap();
            assert_eq!(msg, AnyMessage::PacketAck(PacketAck { packets: vec![SequenceNumber::from_raw(5), SequenceNumber::from_raw(5)] }));
        });
    }

    #[test]
    fn test_pending_acks_are_piggybacked() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit();
            for seq in 10..15 {
                receive(&circuit, &inbound(seq, PacketFlags::RELIABLE, vec![]), health()).await.unwrap();
            }
            // unreliable datagrams are not acknowledged
            receive(&circuit, &inbound(15, PacketFlags::empty(), vec![]), health()).await.unwrap();

            circuit.send(&health(), true).await.unwrap();
            circuit.send(&health(), false).await.unwrap();
            circuit.send(&health(), false).await.unwrap();

            let acks = take_sent(&sent).into_iter()
                .map(|p| p.appended_acks.iter().map(|s| s.to_raw()).collect::<Vec<_>>())
                .collect::<Vec<_>>();
            assert_eq!(acks, vec![vec![10, 11, 12], vec![13, 14], vec![]]);

            // stored datagrams do not carry acks
            let inner = circuit.inner.lock().await;
            let stored = ReceivedPacket::parse(&inner.in_flight[&SequenceNumber::from_raw(1)].datagram, 8192).unwrap();
            assert!(stored.appended_acks.is_empty());
            assert!(!stored.header.flags.contains(PacketFlags::ACKS_APPENDED));
        });
    }

    #[test]
    fn test_resend_and_retry_exhausted() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit();
            circuit.send(&health(), true).await.unwrap();
            let original = take_sent(&sent);
            assert!(!original[0].header.flags.contains(PacketFlags::RESENT));

            time::advance(Duration::from_millis(500)).await;
            assert_eq!(circuit.sweep(Instant::now()).await, None);
            assert!(take_sent(&sent).is_empty());

            time::advance(Duration::from_millis(500)).await;
            assert_eq!(circuit.sweep(Instant::now()).await, None);
            let resent = take_sent(&sent);
            assert_eq!(resent.len(), 1);
            assert_eq!(resent[0].header.sequence, SequenceNumber::from_raw(1));
            assert_eq!(resent[0].header.flags, PacketFlags::RELIABLE | PacketFlags::RESENT);
            assert_eq!(resent[0].payload, original[0].payload);

            time::advance(Duration::from_secs(1)).await;
            assert_eq!(circuit.sweep(Instant::now()).await, None);
            assert_eq!(take_sent(&sent).len(), 1);
            assert_eq!(circuit.inner.lock().await.in_flight[&SequenceNumber::from_raw(1)].attempts, 3);

            time::advance(Duration::from_secs(1)).await;
            assert_eq!(
                circuit.sweep(Instant::now()).await,
                Some(CloseReason::RetryExhausted { sequence: SequenceNumber::from_raw(1) }));
            assert!(take_sent(&sent).is_empty());
            assert!(circuit.is_closed());
            assert_eq!(circuit.state().await, CircuitState::Closed);

            // no further retransmission
            time::advance(Duration::from_secs(5)).await;
            assert_eq!(circuit.sweep(Instant::now()).await, None);
            assert!(take_sent(&sent).is_empty());
        });
    }

    #[test]
    fn test_acked_datagram_is_not_resent() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit();
            circuit.send(&health(), true).await.unwrap();
            receive(&circuit, &inbound(1, PacketFlags::ACKS_APPENDED, vec![1]), health()).await.unwrap();
            take_sent(&sent);

            time::advance(Duration::from_secs(2)).await;
            assert_eq!(circuit.sweep(Instant::now()).await, None);
            assert!(take_sent(&sent).is_empty());
        });
    }

    #[test]
    fn test_state_transitions() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit();
            assert_eq!(circuit.state().await, CircuitState::Open);

            let use_circuit_code: AnyMessage = UseCircuitCode { code: 77, session_id: Uuid::from_u128(2), agent_id: Uuid::from_u128(1) }.into();
            receive(&circuit, &inbound(1, PacketFlags::RELIABLE, vec![]), use_circuit_code).await.unwrap();
            assert_eq!(circuit.state().await, CircuitState::Open);

            receive(&circuit, &inbound(2, PacketFlags::RELIABLE, vec![]), logout_request()).await.unwrap();
            assert_eq!(circuit.state().await, CircuitState::Established);

            let reply = LogoutReply { agent_id: Uuid::from_u128(1), session_id: Uuid::from_u128(2), item_ids: vec![] };
            circuit.send(&reply.into(), true).await.unwrap();
            assert_eq!(circuit.state().await, CircuitState::Closing);

            // closing waits for the reply to be acknowledged
            assert_eq!(circuit.sweep(Instant::now()).await, None);
            assert_eq!(circuit.state().await, CircuitState::Closing);

            receive(&circuit, &inbound(3, PacketFlags::ACKS_APPENDED, vec![1]), health()).await.unwrap();
            take_sent(&sent);
            assert_eq!(circuit.sweep(Instant::now()).await, Some(CloseReason::Logout));
            assert_eq!(circuit.state().await, CircuitState::Closed);

            let final_messages = take_sent(&sent);
            let last = final_messages.last().unwrap();
            assert_eq!(&last.payload, &[0xff, 0xff, 0xff, 0xfd]);

            assert!(matches!(circuit.send(&health(), true).await, Err(TransportError::CircuitClosed(_))));
            assert!(matches!(
                receive(&circuit, &inbound(4, PacketFlags::RELIABLE, vec![]), health()).await,
                Err(TransportError::CircuitClosed(_))));
        });
    }

    #[test]
    fn test_closing_times_out() {
        paused_runtime().block_on(async {
            let (circuit, _) = circuit_with({
                let mut config = config();
                config.resend_timeout = Duration::from_secs(10);
                config
            }, false);

            circuit.send(&health(), true).await.unwrap();
            circuit.begin_closing(CloseReason::Shutdown).await;

            time::advance(Duration::from_secs(4)).await;
            assert_eq!(circuit.sweep(Instant::now()).await, None);

            time::advance(Duration::from_secs(1)).await;
            assert_eq!(circuit.sweep(Instant::now()).await, Some(CloseReason::Shutdown));
        });
    }

    #[test]
    fn test_inactivity_timeout() {
        paused_runtime().block_on(async {
            let (circuit, _) = circuit();

            time::advance(Duration::from_secs(59)).await;
            receive(&circuit, &inbound(1, PacketFlags::empty(), vec![]), health()).await.unwrap();

            time::advance(Duration::from_secs(59)).await;
            assert_eq!(circuit.sweep(Instant::now()).await, None);

            time::advance(Duration::from_secs(1)).await;
            assert_eq!(circuit.sweep(Instant::now()).await, Some(CloseReason::Timeout));
        });
    }

    #[test]
    fn test_close_circuit_from_peer() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit();
            circuit.send(&health(), true).await.unwrap();
            take_sent(&sent);

            let result = receive(&circuit, &inbound(1, PacketFlags::empty(), vec![]), CloseCircuit.into()).await.unwrap();
            assert_eq!(result, Inbound::Closed(CloseReason::ClosedByPeer));
            assert!(circuit.is_closed());
            // no CloseCircuit is sent back
            assert!(take_sent(&sent).is_empty());
            assert!(circuit.inner.lock().await.in_flight.is_empty());
        });
    }

    #[test]
    fn test_ping_is_answered() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit();
            let ping = StartPingCheck { ping_id: 4, oldest_unacked: SequenceNumber::from_raw(1) };
            let result = receive(&circuit, &inbound(1, PacketFlags::empty(), vec![]), ping.into()).await.unwrap();
            assert_eq!(result, Inbound::Consumed);

            let packets = take_sent(&sent);
            assert_eq!(packets.len(), 1);
            assert_eq!(packets[0].payload, vec![2, 4]);
        });
    }

    #[test]
    fn test_ping_reports_oldest_unacked() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit();
            circuit.send(&health(), false).await.unwrap();
            circuit.send(&health(), true).await.unwrap();
            circuit.send(&health(), true).await.unwrap();
            take_sent(&sent);

            circuit.ping(9).await.unwrap();
            let packets = take_sent(&sent);
            assert_eq!(packets[0].payload, vec![1, 9, 2, 0, 0, 0]);
        });
    }

    #[test]
    fn test_ping_after_wraparound() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit();
            circuit.inner.lock().await.next_sequence = SequenceNumber::from_raw(u32::MAX - 1);

            let sequences = [
                circuit.send(&health(), true).await.unwrap(),
                circuit.send(&health(), true).await.unwrap(),
                circuit.send(&health(), true).await.unwrap(),
            ];
            assert_eq!(sequences.map(|s| s.to_raw()), [u32::MAX - 1, u32::MAX, 1]);
            take_sent(&sent);

            circuit.ping(9).await.unwrap();
            let packets = take_sent(&sent);
            assert_eq!(packets[0].header.sequence, SequenceNumber::from_raw(2));
            assert_eq!(packets[0].payload, vec![1, 9, 0xfe, 0xff, 0xff, 0xff]);
        });
    }

    fn health_registered_as(id: MessageTypeId, trusted: bool) -> MessageTypeRegistry {
        let mut registry = MessageTypeRegistry::with_builtin_messages().unwrap();
        registry.register(id, decode_any::<HealthMessage>, MessageAttributes {
            name: "RegionHealth",
            reliable: true,
            trusted,
            zero_coded: false,
        }).unwrap();
        registry
    }

    #[test]
    fn test_inbound_trust_follows_registration() {
        paused_runtime().block_on(async {
            let registry = health_registered_as(MessageTypeId::low(500), true);
            let msg_type = *registry.get(MessageTypeId::low(500)).unwrap();

            let (circuit, _) = circuit();
            assert!(matches!(
                circuit.on_inbound(&inbound(1, PacketFlags::RELIABLE, vec![]), &msg_type, health()).await,
                Err(TransportError::UntrustedViolation { message_type, .. }) if message_type == MessageTypeId::low(500)));

            // the same message decoded through its builtin registration is fine
            assert_eq!(receive(&circuit, &inbound(2, PacketFlags::RELIABLE, vec![]), health()).await.unwrap(), Inbound::Dispatch(health()));

            let (trusted, _) = circuit_with(config(), true);
            assert_eq!(
                trusted.on_inbound(&inbound(1, PacketFlags::RELIABLE, vec![]), &msg_type, health()).await.unwrap(),
                Inbound::Dispatch(health()));
        });
    }

    #[test]
    fn test_outbound_attributes_follow_registration() {
        paused_runtime().block_on(async {
            let mut registry = MessageTypeRegistry::new();
            registry.register(HealthMessage::TYPE, decode_any::<HealthMessage>, MessageAttributes {
                name: "HealthMessage",
                reliable: false,
                trusted: true,
                zero_coded: false,
            }).unwrap();
            registry.register(LogoutReply::TYPE, decode_any::<LogoutReply>, MessageAttributes {
                name: "LogoutReply",
                reliable: true,
                trusted: false,
                zero_coded: false,
            }).unwrap();
            let registry = Arc::new(registry);

            let (circuit, sent) = circuit_with_registry(config(), false, registry.clone());
            assert!(matches!(circuit.send(&health(), true).await, Err(TransportError::UntrustedViolation { .. })));
            assert!(matches!(
                circuit.send(&logout_request(), true).await,
                Err(TransportError::UnknownMessageType(id)) if id == LogoutRequest::TYPE));
            assert!(take_sent(&sent).is_empty());

            let reply = LogoutReply { agent_id: Uuid::nil(), session_id: Uuid::nil(), item_ids: vec![] };
            circuit.send_default(&reply.into()).await.unwrap();
            let packets = take_sent(&sent);
            assert_eq!(packets[0].header.flags, PacketFlags::RELIABLE);

            let (trusted, sent) = circuit_with_registry(config(), true, registry);
            trusted.send_default(&health()).await.unwrap();
            assert!(!take_sent(&sent)[0].is_reliable());
        });
    }

    #[test]
    fn test_trusted_only_messages_on_untrusted_circuit() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit();
            let kick: AnyMessage = KickUser {
                target_ip: std::net::Ipv4Addr::LOCALHOST,
                target_port: 1,
                agent_id: Uuid::nil(),
                session_id: Uuid::nil(),
                reason: String::new(),
            }.into();

            assert!(matches!(circuit.send(&kick, true).await, Err(TransportError::UntrustedViolation { .. })));
            assert!(matches!(
                receive(&circuit, &inbound(1, PacketFlags::RELIABLE, vec![]), kick.clone()).await,
                Err(TransportError::UntrustedViolation { .. })));

            // not acknowledged
            circuit.sweep(Instant::now()).await;
            assert!(take_sent(&sent).is_empty());

            let (trusted, _) = circuit_with(config(), true);
            assert_eq!(
                receive(&trusted, &inbound(1, PacketFlags::RELIABLE, vec![]), kick.clone()).await.unwrap(),
                Inbound::Dispatch(kick.clone()));
            assert!(trusted.send(&kick, true).await.is_ok());
        });
    }

    #[test]
    fn test_oversized_message() {
        paused_runtime().block_on(async {
            let (circuit, sent) = circuit_with({
                let mut config = config();
                config.max_datagram_size = 40;
                config
            }, false);

            let use_circuit_code = UseCircuitCode { code: 1, session_id: Uuid::from_u128(2), agent_id: Uuid::from_u128(1) };
            assert!(matches!(
                circuit.send(&use_circuit_code.into(), true).await,
                Err(TransportError::OversizedMessage { len: 46, max: 40 })));
            assert!(take_sent(&sent).is_empty());

            // the sequence number was not used up
            assert_eq!(circuit.send(&health(), true).await.unwrap(), SequenceNumber::FIRST);
        });
    }

    #[test]
    fn test_enqueue_event() {
        paused_runtime().block_on(async {
            let (circuit, _) = circuit();
            let msg = crate::messages::instant_message::tests::sample_im("hi");
            circuit.enqueue_event(&msg).unwrap();
            assert_eq!(circuit.event_queue().len(), 1);

            receive(&circuit, &inbound(1, PacketFlags::empty(), vec![]), CloseCircuit.into()).await.unwrap();
            assert!(matches!(circuit.enqueue_event(&msg), Err(TransportError::CircuitClosed(_))));
        });
    }
}
