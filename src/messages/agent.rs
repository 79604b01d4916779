use bytes::BytesMut;

use crate::buffers::buf_ext::{BufExt, BufMutExt};
use crate::error::DecodeResult;
use crate::message_type::MessageTypeId;
use crate::messages::Message;

/// The agent's health in percent. The application value is a double, the wire carries it as
///  a 32-bit float.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthMessage {
    pub health: f64,
}

impl Message for HealthMessage {
    const TYPE: MessageTypeId = MessageTypeId::low(138);
    const NAME: &'static str = "HealthMessage";
    const ZERO_CODED: bool = true;

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_f64_as_f32_le(self.health);
    }

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        Ok(HealthMessage {
            health: buf.read_f32_as_f64()?,
        })
    }
}
