//! Circuit housekeeping messages that the transport layer consumes itself.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use crate::buffers::buf_ext::{BufExt, BufMutExt};
use crate::error::DecodeResult;
use crate::message_type::MessageTypeId;
use crate::messages::Message;
use crate::sequence_number::SequenceNumber;

/// Explicit acknowledgement of reliable datagrams, for acks that do not fit into (or have no)
///  outgoing datagram to piggyback on.
///
/// The sequence numbers are part of the message body, so unlike appended acks they are
///  little-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketAck {
    pub packets: Vec<SequenceNumber>,
}

impl Message for PacketAck {
    const TYPE: MessageTypeId = MessageTypeId::fixed(0xfb);
    const NAME: &'static str = "PacketAck";
    const RELIABLE: bool = false;

    fn serialize(&self, buf: &mut BytesMut) {
        let count = buf.put_count8(self.packets.len());
        for seq in &self.packets[..count] {
            buf.put_u32_le(seq.to_raw());
        }
    }

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        let count = buf.read_u8()? as usize;
        let mut packets = Vec::with_capacity(count);
        for _ in 0..count {
            packets.push(SequenceNumber::from_raw(buf.read_u32_le()?));
        }
        Ok(PacketAck { packets })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenCircuit {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Message for OpenCircuit {
    const TYPE: MessageTypeId = MessageTypeId::fixed(0xfc);
    const NAME: &'static str = "OpenCircuit";
    const RELIABLE: bool = false;

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_ipv4(self.ip);
        buf.put_ip_port(self.port);
    }

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        Ok(OpenCircuit {
            ip: buf.read_ipv4()?,
            port: buf.read_ip_port()?,
        })
    }
}

/// Announces that the sender tears down the circuit. It has no body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseCircuit;

impl Message for CloseCircuit {
    const TYPE: MessageTypeId = MessageTypeId::fixed(0xfd);
    const NAME: &'static str = "CloseCircuit";
    const RELIABLE: bool = false;

    fn serialize(&self, _buf: &mut BytesMut) {
    }

    fn decode(_buf: &mut &[u8]) -> DecodeResult<Self> {
        Ok(CloseCircuit)
    }
}

/// Liveness probe; the receiver answers with a [CompletePingCheck] carrying the same ping id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartPingCheck {
    pub ping_id: u8,
    /// The oldest sequence number the sender still waits on an ack for
    pub oldest_unacked: SequenceNumber,
}

impl Message for StartPingCheck {
    const TYPE: MessageTypeId = MessageTypeId::high(1);
    const NAME: &'static str = "StartPingCheck";
    const RELIABLE: bool = false;

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ping_id);
        buf.put_u32_le(self.oldest_unacked.to_raw());
    }

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        Ok(StartPingCheck {
            ping_id: buf.read_u8()?,
            oldest_unacked: SequenceNumber::from_raw(buf.read_u32_le()?),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletePingCheck {
    pub ping_id: u8,
}

impl Message for CompletePingCheck {
    const TYPE: MessageTypeId = MessageTypeId::high(2);
    const NAME: &'static str = "CompletePingCheck";
    const RELIABLE: bool = false;

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ping_id);
    }

    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        Ok(CompletePingCheck {
            ping_id: buf.read_u8()?,
        })
    }
}
