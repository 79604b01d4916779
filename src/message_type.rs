use bytes::BufMut;

use crate::buffers::buf_ext::BufExt;
use crate::error::DecodeResult;

/// Frequency class of a message type. It determines how many bytes the message number takes
///  in the datagram, with the hottest messages getting the shortest encoding.
///
/// ```ascii
/// High:   NN             (1..=254)
/// Medium: FF NN          (1..=254)
/// Low:    FF FF NN NN    (u16 big-endian)
/// Fixed:  FF FF FF NN    (distinguished single-byte codes, 0xFA..=0xFE in practice)
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum MessageFrequency {
    High,
    Medium,
    Low,
    Fixed,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MessageTypeId {
    pub frequency: MessageFrequency,
    pub number: u16,
}

impl MessageTypeId {
    const ESCAPE: u8 = 0xff;

    pub const fn high(number: u8) -> MessageTypeId {
        MessageTypeId { frequency: MessageFrequency::High, number: number as u16 }
    }
    pub const fn medium(number: u8) -> MessageTypeId {
        MessageTypeId { frequency: MessageFrequency::Medium, number: number as u16 }
    }
    pub const fn low(number: u16) -> MessageTypeId {
        MessageTypeId { frequency: MessageFrequency::Low, number }
    }
    pub const fn fixed(number: u8) -> MessageTypeId {
        MessageTypeId { frequency: MessageFrequency::Fixed, number: number as u16 }
    }

    /// Number of header bytes this id occupies on the wire
    pub fn serialized_len(&self) -> usize {
        match self.frequency {
            MessageFrequency::High => 1,
            MessageFrequency::Medium => 2,
            MessageFrequency::Low | MessageFrequency::Fixed => 4,
        }
    }

    /// An id can only be registered if its encoding cannot be mistaken for another
    ///  frequency class
    pub fn is_encodable(&self) -> bool {
        match self.frequency {
            MessageFrequency::High | MessageFrequency::Medium => self.number > 0 && self.number < Self::ESCAPE as u16,
            MessageFrequency::Low => self.number > 0 && (self.number >> 8) != Self::ESCAPE as u16,
            MessageFrequency::Fixed => self.number <= u8::MAX as u16,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self.frequency {
            MessageFrequency::High => {
                buf.put_u8(self.number as u8);
            }
            MessageFrequency::Medium => {
                buf.put_u8(Self::ESCAPE);
                buf.put_u8(self.number as u8);
            }
            MessageFrequency::Low => {
                buf.put_u8(Self::ESCAPE);
                buf.put_u8(Self::ESCAPE);
                buf.put_u16(self.number);
            }
            MessageFrequency::Fixed => {
                buf.put_u8(Self::ESCAPE);
                buf.put_u8(Self::ESCAPE);
                buf.put_u8(Self::ESCAPE);
                buf.put_u8(self.number as u8);
            }
        }
    }

    pub fn deser(buf: &mut &[u8]) -> DecodeResult<MessageTypeId> {
        let b0 = buf.read_u8()?;
        if b0 != Self::ESCAPE {
            return Ok(Self::high(b0));
        }

        let b1 = buf.read_u8()?;
        if b1 != Self::ESCAPE {
            return Ok(Self::medium(b1));
        }

        let b2 = buf.read_u8()?;
        let b3 = buf.read_u8()?;
        if b2 != Self::ESCAPE {
            return Ok(Self::low(u16::from_be_bytes([b2, b3])));
        }
        Ok(Self::fixed(b3))
    }
}
