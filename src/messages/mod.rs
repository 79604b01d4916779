//! Typed messages and their binary codec.
//!
//! Every message type implements [Message]: `serialize` writes the body only (the transport
//!  header and the message number are the framing step's business), and `decode` reads the
//!  fields back in exactly the same order. Single blocks are written field by field; repeated
//!  blocks are preceded by an 8-bit count.
//!
//! [AnyMessage] is the tagged union over all message types known to this crate, it is what the
//!  registry produces and what handlers receive.

pub mod control;
pub mod session;
pub mod agent;
pub mod instant_message;
pub mod map;

use std::fmt::Debug;

use bytes::BytesMut;

use crate::buffers::buf_ext::ensure_consumed;
use crate::error::DecodeResult;
use crate::message_type::MessageTypeId;

pub use agent::HealthMessage;
pub use control::{CloseCircuit, CompletePingCheck, OpenCircuit, PacketAck, StartPingCheck};
pub use instant_message::{ImprovedInstantMessage, InstantMessageDialog};
pub use map::{MapBlock, MapBlockReply};
pub use session::{CompleteAgentMovement, KickUser, LogoutReply, LogoutRequest, UseCircuitCode};

pub trait Message: Debug + Clone + PartialEq + Send + Sync + Sized + 'static {
    const TYPE: MessageTypeId;
    const NAME: &'static str;

    // The attributes below are what `MessageTypeRegistry::register_message` registers the type
    //  with. At runtime, the registry entry is what counts.

    /// Trusted messages may only travel on circuits to authenticated internal peers, in
    ///  either direction
    const TRUSTED: bool = false;

    /// Whether the body is zero-coded on the wire when sending
    const ZERO_CODED: bool = false;

    /// Whether the message is sent reliably unless the caller decides otherwise
    const RELIABLE: bool = true;

    fn serialize(&self, buf: &mut BytesMut);

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self>;

    fn message_type(&self) -> MessageTypeId {
        Self::TYPE
    }
}

/// Decodes a complete message body, failing if any bytes are left over
pub fn decode_exact<M: Message>(body: &[u8]) -> DecodeResult<M> {
    let mut buf = body;
    let result = M::decode(&mut buf)?;
    ensure_consumed(buf)?;
    Ok(result)
}

macro_rules! define_messages {
    ($($name:ident),* $(,)?) => {
        #[derive(Debug, Clone, PartialEq)]
        pub enum AnyMessage {
            $($name($name),)*
        }

        impl AnyMessage {
            pub fn message_type(&self) -> MessageTypeId {
                match self {
                    $(AnyMessage::$name(_) => <$name as Message>::TYPE,)*
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(AnyMessage::$name(_) => <$name as Message>::NAME,)*
                }
            }

            pub fn serialize(&self, buf: &mut BytesMut) {
                match self {
                    $(AnyMessage::$name(msg) => msg.serialize(buf),)*
                }
            }
        }

        $(
        impl From<$name> for AnyMessage {
            fn from(value: $name) -> Self {
                AnyMessage::$name(value)
            }
        }
        )*

        /// Registers all message types of this crate
        pub(crate) fn register_builtin(registry: &mut crate::registry::MessageTypeRegistry) -> anyhow::Result<()> {
            $(registry.register_message::<$name>()?;)*
            Ok(())
        }
    }
}

define_messages! {
    PacketAck,
    OpenCircuit,
    CloseCircuit,
    StartPingCheck,
    CompletePingCheck,
    UseCircuitCode,
    CompleteAgentMovement,
    LogoutRequest,
    LogoutReply,
    KickUser,
    HealthMessage,
    ImprovedInstantMessage,
    MapBlockReply,
}
