use std::collections::hash_map::Entry;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{DecodeResult, TransportError};
use crate::message_type::MessageTypeId;
use crate::messages::{decode_exact, register_builtin, AnyMessage, Message};

/// Decodes a complete message body, i.e. the bytes after the message number
pub type DecodeFn = fn(&[u8]) -> DecodeResult<AnyMessage>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MessageAttributes {
    pub name: &'static str,
    pub reliable: bool,
    pub trusted: bool,
    pub zero_coded: bool,
}

#[derive(Copy, Clone, Debug)]
pub struct MessageTypeInfo {
    pub id: MessageTypeId,
    pub attributes: MessageAttributes,
    pub decode: DecodeFn,
}

/// The result of looking up the message number at the start of a (zero-decoded) payload
#[derive(Copy, Clone, Debug)]
pub struct Resolved<'a> {
    pub info: &'a MessageTypeInfo,
    pub bytes_consumed: usize,
}

/// Maps message numbers to decoders and per-type metadata. It is populated once before the end
///  point starts and shared read-only afterwards.
#[derive(Default)]
pub struct MessageTypeRegistry {
    types: FxHashMap<MessageTypeId, MessageTypeInfo>,
}

impl MessageTypeRegistry {
    pub fn new() -> MessageTypeRegistry {
        Default::default()
    }

    /// A registry with all message types defined in this crate
    pub fn with_builtin_messages() -> anyhow::Result<MessageTypeRegistry> {
        let mut result = Self::new();
        register_builtin(&mut result)?;
        Ok(result)
    }

    pub fn register(&mut self, id: MessageTypeId, decode: DecodeFn, attributes: MessageAttributes) -> anyhow::Result<()> {
        if !id.is_encodable() {
            bail!("message type {:?} ({}) cannot be encoded unambiguously", id, attributes.name);
        }

        match self.types.entry(id) {
            Entry::Occupied(e) => {
                Err(anyhow!("registering {} as {:?}, which is already taken by {}", attributes.name, id, e.get().attributes.name))
            }
            Entry::Vacant(e) => {
                debug!("registering message type {} as {:?}", attributes.name, id);
                e.insert(MessageTypeInfo { id, attributes, decode });
                Ok(())
            }
        }
    }

    pub fn register_message<M: Message>(&mut self) -> anyhow::Result<()>
    where AnyMessage: From<M>
    {
        self.register(M::TYPE, decode_any::<M>, MessageAttributes {
            name: M::NAME,
            reliable: M::RELIABLE,
            trusted: M::TRUSTED,
            zero_coded: M::ZERO_CODED,
        })
    }

    pub fn get(&self, id: MessageTypeId) -> Option<&MessageTypeInfo> {
        self.types.get(&id)
    }

    /// The attributes registered for the message's type. Sending looks them up here, so the
    ///  registration decides about reliability, trust and zero-coding on the way out as well.
    pub fn attributes_of(&self, msg: &AnyMessage) -> Result<&MessageAttributes, TransportError> {
        self.get(msg.message_type())
            .map(|info| &info.attributes)
            .ok_or(TransportError::UnknownMessageType(msg.message_type()))
    }

    /// Reads the message number from the start of `header_bytes`. A registry miss is reported as
    ///  [TransportError::UnknownMessageType], as opposed to [TransportError::MalformedPacket] for
    ///  bytes that cannot even be read as a message number.
    pub fn resolve(&self, header_bytes: &[u8]) -> Result<Resolved<'_>, TransportError> {
        let mut buf = header_bytes;
        let id = MessageTypeId::deser(&mut buf)?;
        match self.types.get(&id) {
            Some(info) => Ok(Resolved {
                info,
                bytes_consumed: header_bytes.len() - buf.len(),
            }),
            None => Err(TransportError::UnknownMessageType(id)),
        }
    }

    /// Resolves the message number and decodes the rest of the payload as the message's body
    pub fn decode_message(&self, payload: &[u8]) -> Result<(&MessageTypeInfo, AnyMessage), TransportError> {
        let resolved = self.resolve(payload)?;
        let msg = (resolved.info.decode)(&payload[resolved.bytes_consumed..])?;
        Ok((resolved.info, msg))
    }
}

pub(crate) fn decode_any<M: Message>(body: &[u8]) -> DecodeResult<AnyMessage>
where AnyMessage: From<M>
{
    decode_exact::<M>(body).map(AnyMessage::from)
}
