use bitflags::bitflags;
use bytes::BufMut;

use crate::buffers::buf_ext::BufExt;
use crate::error::{DecodeError, DecodeResult};
use crate::sequence_number::SequenceNumber;

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct PacketFlags: u8 {
        const RELIABLE = 0x01;
        const ZERO_CODED = 0x10;
        const RESENT = 0x20;
        const ACKS_APPENDED = 0x40;
    }
}

/// Fixed transport header at the start of every datagram:
///
/// ```ascii
/// 0: flags (u8)
/// 1: sequence number (u32 BE)
/// 5: extra header length L (u8)
/// 6: extra header (L bytes, protocol reserved)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: SequenceNumber,
    pub extra_header: Vec<u8>,
}

impl PacketHeader {
    pub const FIXED_LEN: usize = 6;

    /// Offset of the flags byte, for patching the RESENT bit into stored datagrams
    pub const FLAGS_OFFSET: usize = 0;

    pub fn new(flags: PacketFlags, sequence: SequenceNumber) -> PacketHeader {
        PacketHeader {
            flags,
            sequence,
            extra_header: Vec::new(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_LEN + self.extra_header.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.sequence.to_raw());
        buf.put_u8(self.extra_header.len() as u8);
        buf.put_slice(&self.extra_header);
    }

    /// Unknown flag bits are ignored rather than rejected
    pub fn deser(buf: &mut &[u8]) -> DecodeResult<PacketHeader> {
        if buf.len() < Self::FIXED_LEN {
            return Err(DecodeError::ShortHeader);
        }

        let flags = PacketFlags::from_bits_truncate(buf.read_u8()?);
        let sequence = SequenceNumber::from_raw(buf.read_u32_be()?);
        let extra_len = buf.read_u8()? as usize;
        let extra_header = buf.read_raw(extra_len)?;

        Ok(PacketHeader {
            flags,
            sequence,
            extra_header,
        })
    }
}
