use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::circuit::{Circuit, CircuitInfo};
use crate::error::TransportError;
use crate::message_type::MessageTypeId;
use crate::messages::AnyMessage;
use crate::registry::MessageTypeInfo;

/// Application code that processes decoded messages, e.g. scene logic or an instant message
///  router
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Returns `Ok(true)` if the handler took care of the message and `Ok(false)` if it declined
    ///  it. Errors are reported and contained at the dispatch boundary.
    async fn handle(&self, circuit: &CircuitInfo, msg: &AnyMessage) -> anyhow::Result<bool>;
}

/// How a message is delivered if several handlers are registered for its type. Handlers are
///  always called in registration order.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FanOutPolicy {
    /// Stop at the first handler that reports success
    #[default]
    FirstSuccess,
    /// Deliver to every handler
    All,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    Handled,
    /// All handlers declined or failed
    NotHandled,
    NoHandler,
    /// The message type's trust level does not match the circuit's
    Rejected,
}

#[derive(Default)]
struct Route {
    policy: FanOutPolicy,
    handlers: Vec<Arc<dyn MessageHandler>>,
}

/// Routes messages to handlers by message type. Like the registry, it is set up before the end
///  point starts and only read afterwards.
#[derive(Default)]
pub struct DispatchRouter {
    routes: FxHashMap<MessageTypeId, Route>,
}

impl DispatchRouter {
    pub fn new() -> DispatchRouter {
        Default::default()
    }

    pub fn register_handler(&mut self, message_type: MessageTypeId, handler: Arc<dyn MessageHandler>) {
        self.routes.entry(message_type)
            .or_default()
            .handlers.push(handler);
    }

    pub fn set_fan_out_policy(&mut self, message_type: MessageTypeId, policy: FanOutPolicy) {
        self.routes.entry(message_type)
            .or_default()
            .policy = policy;
    }

    /// Routes by the registry entry the message was decoded with, so that a type registered under
    ///  its own message number and trust level is treated as such
    pub async fn dispatch(&self, circuit: &CircuitInfo, msg_type: &MessageTypeInfo, msg: &AnyMessage) -> DispatchOutcome {
        if msg_type.attributes.trusted && !circuit.trusted {
            warn!(target: "gridwire::security", "{}", TransportError::UntrustedViolation { message_type: msg_type.id, circuit: circuit.addr });
            return DispatchOutcome::Rejected;
        }

        let Some(route) = self.routes.get(&msg_type.id).filter(|r| !r.handlers.is_empty()) else {
            debug!("no handler for {} from {:?} - ignoring", msg.name(), circuit.addr);
            return DispatchOutcome::NoHandler;
        };

        let mut handled = false;
        for handler in &route.handlers {
            match invoke(handler.as_ref(), circuit, msg_type.id, msg).await {
                Ok(true) => {
                    handled = true;
                    if route.policy == FanOutPolicy::FirstSuccess {
                        break;
                    }
                }
                Ok(false) => {
                    trace!("handler declined {} from {:?}", msg.name(), circuit.addr);
                }
                Err(e) => {
                    warn!("{}", e);
                }
            }
        }

        if handled {
            DispatchOutcome::Handled
        }
        else {
            DispatchOutcome::NotHandled
        }
    }
}

/// Calls a handler, turning both errors and panics into [TransportError::HandlerFault]
async fn invoke(handler: &dyn MessageHandler, circuit: &CircuitInfo, message_type: MessageTypeId, msg: &AnyMessage) -> Result<bool, TransportError> {
    let result = AssertUnwindSafe(async { handler.handle(circuit, msg).await })
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(handled)) => Ok(handled),
        Ok(Err(e)) => Err(TransportError::HandlerFault { message_type, reason: format!("{:#}", e) }),
        Err(panic) => Err(TransportError::HandlerFault { message_type, reason: panic_message(panic.as_ref()) }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    }
    else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    }
    else {
        "panic".to_string()
    }
}

/// A message waiting for the dispatch worker
pub struct DispatchJob {
    pub circuit: Arc<Circuit>,
    pub msg_type: MessageTypeInfo,
    pub msg: AnyMessage,
}

/// The receive loop hands decoded messages to this worker instead of calling handlers itself.
///  Messages for circuits that were closed in the meantime are dropped.
pub fn spawn_dispatch_worker(router: Arc<DispatchRouter>, mut receiver: mpsc::Receiver<DispatchJob>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = receiver.recv().await {
            if job.circuit.is_closed() {
                debug!("circuit {:?} is closed - not dispatching {}", job.circuit.addr(), job.msg.name());
                continue;
            }
            router.dispatch(job.circuit.info(), &job.msg_type, &job.msg).await;
        }
        info!("dispatch queue closed, shutting down dispatch worker");
    })
}

/// Wraps a handler that does long-running work: messages are put into a bounded queue and
///  processed by a separate task, so that the dispatch worker is never blocked by it.
///
/// A queued message counts as handled. Overflowing the queue is reported as a handler error.
pub struct QueuedHandler {
    sender: mpsc::Sender<(CircuitInfo, AnyMessage)>,
}

impl QueuedHandler {
    pub fn new(handler: Arc<dyn MessageHandler>, queue_size: usize) -> QueuedHandler {
        let (sender, mut receiver) = mpsc::channel::<(CircuitInfo, AnyMessage)>(queue_size);

        tokio::spawn(async move {
            while let Some((circuit, msg)) = receiver.recv().await {
                if let Err(e) = invoke(handler.as_ref(), &circuit, msg.message_type(), &msg).await {
                    warn!("{}", e);
                }
            }
        });

        QueuedHandler { sender }
    }
}

#[async_trait]
impl MessageHandler for QueuedHandler {
    async fn handle(&self, circuit: &CircuitInfo, msg: &AnyMessage) -> anyhow::Result<bool> {
        match self.sender.try_send((circuit.clone(), msg.clone())) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Err(anyhow!("handler queue is full, dropping {}", msg.name())),
            Err(TrySendError::Closed(_)) => Err(anyhow!("handler queue is closed, dropping {}", msg.name())),
        }
    }
}
