//! Messages around a viewer session's lifecycle: joining with a circuit code, completing the
//!  arrival in a region, logging out, and being kicked by an internal service.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::buffers::buf_ext::{BufExt, BufMutExt};
use crate::error::DecodeResult;
use crate::message_type::MessageTypeId;
use crate::messages::Message;

/// First message on a new circuit. The circuit code ties the UDP circuit to a session that was
///  set up out of band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UseCircuitCode {
    pub code: u32,
    pub session_id: Uuid,
    pub agent_id: Uuid,
}

impl Message for UseCircuitCode {
    const TYPE: MessageTypeId = MessageTypeId::low(3);
    const NAME: &'static str = "UseCircuitCode";

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.code);
        buf.put_uuid(&self.session_id);
        buf.put_uuid(&self.agent_id);
    }

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        Ok(UseCircuitCode {
            code: buf.read_u32_le()?,
            session_id: buf.read_uuid()?,
            agent_id: buf.read_uuid()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompleteAgentMovement {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}

impl Message for CompleteAgentMovement {
    const TYPE: MessageTypeId = MessageTypeId::low(249);
    const NAME: &'static str = "CompleteAgentMovement";

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_u32_le(self.circuit_code);
    }

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        Ok(CompleteAgentMovement {
            agent_id: buf.read_uuid()?,
            session_id: buf.read_uuid()?,
            circuit_code: buf.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogoutRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

impl Message for LogoutRequest {
    const TYPE: MessageTypeId = MessageTypeId::low(252);
    const NAME: &'static str = "LogoutRequest";

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
    }

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        Ok(LogoutRequest {
            agent_id: buf.read_uuid()?,
            session_id: buf.read_uuid()?,
        })
    }
}

/// Confirms a logout, listing inventory items the receiver should refresh.
///
/// Peers require at least one inventory block, so an empty list goes on the wire as a single
///  block holding the nil UUID. Decoding maps that placeholder back to an empty list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogoutReply {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub item_ids: Vec<Uuid>,
}

impl Message for LogoutReply {
    const TYPE: MessageTypeId = MessageTypeId::low(253);
    const NAME: &'static str = "LogoutReply";
    const ZERO_CODED: bool = true;

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);

        if self.item_ids.is_empty() {
            buf.put_u8(1);
            buf.put_uuid(&Uuid::nil());
            return;
        }

        let count = buf.put_count8(self.item_ids.len());
        for item_id in &self.item_ids[..count] {
            buf.put_uuid(item_id);
        }
    }

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        let agent_id = buf.read_uuid()?;
        let session_id = buf.read_uuid()?;

        let count = buf.read_u8()? as usize;
        let mut item_ids = Vec::with_capacity(count);
        for _ in 0..count {
            item_ids.push(buf.read_uuid()?);
        }
        if item_ids == [Uuid::nil()] {
            item_ids.clear();
        }

        Ok(LogoutReply {
            agent_id,
            session_id,
            item_ids,
        })
    }
}

/// Sent by internal services to make a simulator disconnect an agent. Only valid on trusted
///  circuits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KickUser {
    pub target_ip: Ipv4Addr,
    pub target_port: u16,
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub reason: String,
}

impl Message for KickUser {
    const TYPE: MessageTypeId = MessageTypeId::low(163);
    const NAME: &'static str = "KickUser";
    const TRUSTED: bool = true;

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_ipv4(self.target_ip);
        buf.put_ip_port(self.target_port);
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_string_len16(&self.reason);
    }

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        Ok(KickUser {
            target_ip: buf.read_ipv4()?,
            target_port: buf.read_ip_port()?,
            agent_id: buf.read_uuid()?,
            session_id: buf.read_uuid()?,
            reason: buf.read_string_len16()?,
        })
    }
}
