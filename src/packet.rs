//! Framing of complete datagrams.
//!
//! ```ascii
//! 0: packet header (flags, sequence number BE, extra header)
//! *: message number (1, 2 or 4 bytes)    \  zero-coded together if ZERO_CODED is set
//! *: message body                        /
//! *: appended acks (u32 BE each)         \  only if ACKS_APPENDED is set, never zero-coded
//! last byte: number of appended acks     /
//! ```

use bytes::{BufMut, BytesMut};

use crate::buffers::zero_coding::{zero_decode, zero_encode};
use crate::error::{DecodeError, DecodeResult};
use crate::messages::AnyMessage;
use crate::packet_header::{PacketFlags, PacketHeader};
use crate::sequence_number::SequenceNumber;

/// Upper bound for the number of acks appended to a single datagram: the count is a single byte
pub const MAX_APPENDED_ACKS: usize = u8::MAX as usize;

/// A datagram taken apart on the transport level. The payload (message number and body) is
///  already zero-decoded, but not yet interpreted.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedPacket {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
    pub appended_acks: Vec<SequenceNumber>,
}

impl ReceivedPacket {
    pub fn parse(datagram: &[u8], max_zero_decoded_len: usize) -> DecodeResult<ReceivedPacket> {
        let mut buf = datagram;
        let header = PacketHeader::deser(&mut buf)?;

        let (payload, appended_acks) = if header.flags.contains(PacketFlags::ACKS_APPENDED) {
            split_appended_acks(buf)?
        }
        else {
            (buf, Vec::new())
        };

        let payload = if header.flags.contains(PacketFlags::ZERO_CODED) {
            zero_decode(payload, max_zero_decoded_len)?
        }
        else {
            payload.to_vec()
        };

        Ok(ReceivedPacket {
            header,
            payload,
            appended_acks,
        })
    }

    pub fn is_reliable(&self) -> bool {
        self.header.flags.contains(PacketFlags::RELIABLE)
    }
}

fn split_appended_acks(buf: &[u8]) -> DecodeResult<(&[u8], Vec<SequenceNumber>)> {
    let Some((&count, rest)) = buf.split_last() else {
        return Err(DecodeError::InvalidAckCount { count: 0, len: 0 });
    };
    let count = count as usize;

    let acks_len = count * 4;
    if acks_len > rest.len() {
        return Err(DecodeError::InvalidAckCount { count, len: buf.len() });
    }

    let (payload, raw_acks) = rest.split_at(rest.len() - acks_len);
    let acks = raw_acks.chunks_exact(4)
        .map(|chunk| SequenceNumber::from_raw(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
        .collect();
    Ok((payload, acks))
}

/// Writes a complete datagram for a message, without appended acks.
///
/// ZERO_CODED in `flags` requests zero-coding of the payload. It is applied only if that makes
///  the datagram shorter, and the flag in the written header says whether it was.
pub fn write_datagram(buf: &mut BytesMut, flags: PacketFlags, sequence: SequenceNumber, msg: &AnyMessage) {
    let start = buf.len();
    PacketHeader::new(flags - PacketFlags::ZERO_CODED, sequence).ser(buf);

    if !flags.contains(PacketFlags::ZERO_CODED) {
        write_payload(buf, msg);
        return;
    }

    let mut plain = BytesMut::with_capacity(buf.capacity() - buf.len());
    write_payload(&mut plain, msg);

    let payload_start = buf.len();
    zero_encode(&plain, buf);
    if buf.len() - payload_start < plain.len() {
        buf[start + PacketHeader::FLAGS_OFFSET] |= PacketFlags::ZERO_CODED.bits();
    }
    else {
        buf.truncate(payload_start);
        buf.put_slice(&plain);
    }
}

fn write_payload(buf: &mut BytesMut, msg: &AnyMessage) {
    msg.message_type().ser(buf);
    msg.serialize(buf);
}

/// Appends acks to a complete datagram in `buf`, setting the ACKS_APPENDED flag. At most
///  [MAX_APPENDED_ACKS] fit into a datagram, the number of acks actually written is returned.
pub fn append_acks(buf: &mut BytesMut, acks: &[SequenceNumber]) -> usize {
    let count = acks.len().min(MAX_APPENDED_ACKS);
    if count == 0 {
        return 0;
    }

    buf[PacketHeader::FLAGS_OFFSET] |= PacketFlags::ACKS_APPENDED.bits();
    for ack in &acks[..count] {
        buf.put_u32(ack.to_raw());
    }
    buf.put_u8(count as u8);
    count
}

/// Marks a stored datagram as a retransmission
pub fn set_resent(datagram: &mut [u8]) {
    datagram[PacketHeader::FLAGS_OFFSET] |= PacketFlags::RESENT.bits();
}
