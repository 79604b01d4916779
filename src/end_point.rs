use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::buffers::buffer_pool::SendBufferPool;
use crate::circuit::{Circuit, CircuitInfo, CloseReason, Inbound};
use crate::circuit_events::{CircuitClosedData, CircuitEvent, CircuitEventNotifier, CircuitOpenedData};
use crate::config::UdpConfig;
use crate::dispatch::{spawn_dispatch_worker, DispatchJob, DispatchRouter};
use crate::error::TransportError;
use crate::messages::{AnyMessage, UseCircuitCode};
use crate::packet::ReceivedPacket;
use crate::registry::{MessageTypeInfo, MessageTypeRegistry};
use crate::send_pipeline::SendSocket;
use crate::sequence_number::SequenceNumber;
use crate::structured::StructuredMessage;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuthorizationResult {
    Rejected,
    Accepted { trusted: bool },
}

/// Decides whether a peer's `UseCircuitCode` opens a circuit, and how far the circuit is
///  trusted. This is the session service's business, the transport only asks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CircuitAuthorizer: Send + Sync + 'static {
    async fn authorize(&self, addr: SocketAddr, request: &UseCircuitCode) -> AuthorizationResult;
}

/// EndPoint is where the parts of the transport come together: It listens on a UdpSocket,
///  opens circuits for authorized peers, runs inbound datagrams through their circuits and hands
///  decoded messages to the dispatch worker. Application code sends messages through it.
///
/// A shared sweep task drives retransmission, ack flushing and timeouts for all circuits.
pub struct EndPoint {
    self_addr: SocketAddr,
    receive_socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    dispatch_worker: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        self.dispatch_worker.abort();
        self.sweeper.abort();
    }
}

/// The part of the end point that the receive loop, handshake tasks and the sweeper share
struct Shared {
    send_socket: Arc<dyn SendSocket>,
    circuits: RwLock<FxHashMap<SocketAddr, Arc<Circuit>>>,
    /// Peers whose `UseCircuitCode` is currently with the authorizer
    pending_handshakes: Mutex<FxHashSet<SocketAddr>>,
    registry: Arc<MessageTypeRegistry>,
    authorizer: Arc<dyn CircuitAuthorizer>,
    dispatch_sender: mpsc::Sender<DispatchJob>,
    events: CircuitEventNotifier,
    config: Arc<UdpConfig>,
    buffer_pool: Arc<SendBufferPool>,
}

impl EndPoint {
    pub async fn new(
        config: Arc<UdpConfig>,
        registry: Arc<MessageTypeRegistry>,
        router: Arc<DispatchRouter>,
        authorizer: Arc<dyn CircuitAuthorizer>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        let self_addr = receive_socket.local_addr()?;
        info!("bound receive socket to {:?}", self_addr);

        let (dispatch_sender, dispatch_receiver) = mpsc::channel(config.dispatch_queue_size);
        let dispatch_worker = spawn_dispatch_worker(router, dispatch_receiver);

        let shared = Arc::new(Shared {
            send_socket: Arc::new(receive_socket.clone()),
            circuits: Default::default(),
            pending_handshakes: Default::default(),
            registry,
            authorizer,
            dispatch_sender,
            events: CircuitEventNotifier::new(),
            buffer_pool: Arc::new(SendBufferPool::new(config.max_datagram_size, config.buffer_pool_size)),
            config,
        });
        let sweeper = tokio::spawn(shared.clone().sweep_loop());

        Ok(EndPoint {
            self_addr,
            receive_socket,
            shared,
            dispatch_worker,
            sweeper,
        })
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.shared.events.subscribe()
    }

    pub async fn circuit(&self, addr: SocketAddr) -> Option<Arc<Circuit>> {
        self.shared.circuit(addr).await
    }

    pub async fn circuits(&self) -> Vec<CircuitInfo> {
        self.shared.circuits.read().await
            .values()
            .map(|c| c.info().clone())
            .collect()
    }

    async fn existing_circuit(&self, addr: SocketAddr) -> Result<Arc<Circuit>, TransportError> {
        self.circuit(addr).await
            .ok_or(TransportError::UnknownCircuit(addr))
    }

    pub async fn send(&self, to: SocketAddr, msg: impl Into<AnyMessage>, reliable: bool) -> Result<SequenceNumber, TransportError> {
        self.existing_circuit(to).await?
            .send(&msg.into(), reliable).await
    }

    /// Sends a message reliably or not, depending on how its type is registered
    pub async fn send_default(&self, to: SocketAddr, msg: impl Into<AnyMessage>) -> Result<SequenceNumber, TransportError> {
        self.existing_circuit(to).await?
            .send_default(&msg.into()).await
    }

    pub async fn ping(&self, to: SocketAddr, ping_id: u8) -> Result<SequenceNumber, TransportError> {
        self.existing_circuit(to).await?
            .ping(ping_id).await
    }

    /// Queues a message for the structured side channel of a circuit
    pub async fn enqueue_event<M: StructuredMessage>(&self, to: SocketAddr, msg: &M) -> Result<(), TransportError> {
        self.existing_circuit(to).await?
            .enqueue_event(msg)
    }

    /// Starts closing a circuit. It is removed (and the `Closed` event sent) once its in-flight
    ///  datagrams are acknowledged or the closing timeout expires.
    pub async fn close_circuit(&self, addr: SocketAddr) -> Result<(), TransportError> {
        self.existing_circuit(addr).await?
            .begin_closing(CloseReason::Shutdown).await;
        Ok(())
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let max_len = 2 * self.shared.config.max_datagram_size;
        // one spare byte, so that a datagram exceeding the limit fills the buffer completely
        let mut buf = vec![0u8; max_len + 1];
        loop {
            let (num_read, from) = match self.receive_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            if num_read > max_len {
                span.in_scope(|| debug!("dropping datagram from {:?}: more than {} bytes", from, max_len));
                continue;
            }

            self.on_datagram(from, &buf[..num_read])
                .instrument(span)
                .await;
        }
    }

    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        self.shared.on_datagram(from, datagram).await
    }
}

impl Shared {
    async fn circuit(&self, addr: SocketAddr) -> Option<Arc<Circuit>> {
        self.circuits.read().await
            .get(&addr)
            .cloned()
    }

    async fn on_datagram(self: &Arc<Self>, from: SocketAddr, datagram: &[u8]) {
        trace!("received datagram from {:?}: {:?}", from, datagram);

        let packet = match ReceivedPacket::parse(datagram, self.config.max_zero_decoded_size) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping datagram from {:?}: {}", from, TransportError::from(e));
                return;
            }
        };

        let (msg_type, msg) = match self.registry.decode_message(&packet.payload) {
            Ok((msg_type, msg)) => (*msg_type, msg),
            Err(e) => {
                debug!("dropping datagram {:?} from {:?}: {}", packet.header.sequence, from, e);
                return;
            }
        };

        match self.circuit(from).await {
            Some(circuit) => self.on_inbound(circuit, &packet, &msg_type, msg).await,
            None => self.begin_handshake(from, packet, msg_type, msg).await,
        }
    }

    async fn on_inbound(&self, circuit: Arc<Circuit>, packet: &ReceivedPacket, msg_type: &MessageTypeInfo, msg: AnyMessage) {
        match circuit.on_inbound(packet, msg_type, msg).await {
            Ok(Inbound::Dispatch(msg)) => {
                trace!("dispatching {} from {:?}", msg.name(), circuit.addr());
                if self.dispatch_sender.send(DispatchJob { circuit, msg_type: *msg_type, msg }).await.is_err() {
                    error!("dispatch worker is gone - dropping message");
                }
            }
            Ok(Inbound::Consumed) => {}
            Ok(Inbound::Closed(reason)) => {
                self.remove_circuit(&circuit, reason).await;
            }
            Err(e @ TransportError::UntrustedViolation { .. }) => {
                warn!(target: "gridwire::security", "dropping datagram: {}", e);
            }
            Err(e) => {
                debug!("dropping datagram {:?} from {:?}: {}", packet.header.sequence, circuit.addr(), e);
            }
        }
    }

    /// Hands a `UseCircuitCode` from an unknown peer to the authorizer in a separate task, so a
    ///  slow authorizer does not hold up the receive loop. Further datagrams from the peer are
    ///  dropped until the authorizer answered, reliable ones are resent by the peer anyway.
    async fn begin_handshake(self: &Arc<Self>, from: SocketAddr, packet: ReceivedPacket, msg_type: MessageTypeInfo, msg: AnyMessage) {
        let AnyMessage::UseCircuitCode(request) = &msg else {
            debug!("{} from {:?} without a circuit - dropping", msg.name(), from);
            return;
        };
        let request = request.clone();

        if !self.pending_handshakes.lock().await.insert(from) {
            debug!("handshake with {:?} is in progress - dropping {}", from, msg.name());
            return;
        }

        let shared = self.clone();
        tokio::spawn(async move {
            let circuit = shared.handshake(from, &request).await;
            shared.pending_handshakes.lock().await.remove(&from);

            if let Some(circuit) = circuit {
                shared.on_inbound(circuit, &packet, &msg_type, msg).await;
            }
        }.in_current_span());
    }

    /// Opens a circuit if the authorizer accepts the request
    async fn handshake(&self, from: SocketAddr, request: &UseCircuitCode) -> Option<Arc<Circuit>> {
        let trusted = match self.authorizer.authorize(from, request).await {
            AuthorizationResult::Accepted { trusted } => trusted,
            AuthorizationResult::Rejected => {
                info!("circuit code {} from {:?} was rejected", request.code, from);
                return None;
            }
        };

        let info = CircuitInfo {
            addr: from,
            circuit_code: request.code,
            agent_id: request.agent_id,
            session_id: request.session_id,
            trusted,
        };

        let circuit = {
            let mut circuits = self.circuits.write().await;
            if let Some(existing) = circuits.get(&from) {
                return Some(existing.clone());
            }

            info!("opening circuit {} for {:?} (trusted: {})", request.code, from, trusted);
            let circuit = Arc::new(Circuit::new(
                info.clone(),
                self.config.clone(),
                self.registry.clone(),
                self.send_socket.clone(),
                self.buffer_pool.clone(),
            ));
            circuits.insert(from, circuit.clone());
            circuit
        };

        self.events.send_event(CircuitEvent::Opened(CircuitOpenedData { circuit: info }));
        Some(circuit)
    }

    /// Removes a closed circuit and notifies subscribers, unless some other code path already did
    async fn remove_circuit(&self, circuit: &Arc<Circuit>, reason: CloseReason) {
        let removed = {
            let mut circuits = self.circuits.write().await;
            match circuits.get(&circuit.addr()) {
                Some(c) if Arc::ptr_eq(c, circuit) => circuits.remove(&circuit.addr()).is_some(),
                _ => false,
            }
        };

        if removed {
            debug!("removed circuit {:?}", circuit.addr());
            self.events.send_event(CircuitEvent::Closed(CircuitClosedData {
                circuit: circuit.info().clone(),
                reason,
            }));
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticks = tokio::time::interval(self.config.sweep_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;

            let now = Instant::now();
            let snapshot = self.circuits.read().await
                .values()
                .cloned()
                .collect::<Vec<_>>();

            for circuit in snapshot {
                if let Some(reason) = circuit.sweep(now).await {
                    self.remove_circuit(&circuit, reason).await;
                }
            }
        }
    }
}
