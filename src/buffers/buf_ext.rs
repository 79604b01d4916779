use std::net::Ipv4Addr;

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::error::{DecodeError, DecodeResult};

macro_rules! checked_read_impl {
    ($reader: ident, $ty:ty, $getter: ident) => {
        fn $reader(&mut self) -> DecodeResult<$ty> {
            self.ensure_remaining(std::mem::size_of::<$ty>())?;
            Ok(self.$getter())
        }
    }
}

/// Read side of the binary cursor: every read checks the remaining length first and fails with
///  [DecodeError::BufferUnderflow] instead of panicking.
///
/// Body fields are little-endian unless the getter's name says otherwise. The big-endian getters
///  are for the fields the protocol keeps in network byte order (IP ports, header sequence
///  numbers and appended acks).
pub trait BufExt: Buf {
    fn ensure_remaining(&self, needed: usize) -> DecodeResult<()> {
        if self.remaining() < needed {
            return Err(DecodeError::BufferUnderflow { needed, remaining: self.remaining() });
        }
        Ok(())
    }

    checked_read_impl!(read_u8, u8, get_u8);
    checked_read_impl!(read_u16_le, u16, get_u16_le);
    checked_read_impl!(read_u32_le, u32, get_u32_le);
    checked_read_impl!(read_u64_le, u64, get_u64_le);

    checked_read_impl!(read_i8, i8, get_i8);
    checked_read_impl!(read_i16_le, i16, get_i16_le);
    checked_read_impl!(read_i32_le, i32, get_i32_le);
    checked_read_impl!(read_i64_le, i64, get_i64_le);

    checked_read_impl!(read_f32_le, f32, get_f32_le);

    checked_read_impl!(read_u16_be, u16, get_u16);
    checked_read_impl!(read_u32_be, u32, get_u32);

    fn read_bool(&mut self) -> DecodeResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// 'double' application values travel as 32-bit floats
    fn read_f32_as_f64(&mut self) -> DecodeResult<f64> {
        Ok(self.read_f32_le()? as f64)
    }

    fn read_uuid(&mut self) -> DecodeResult<Uuid> {
        let mut raw = [0u8; 16];
        self.ensure_remaining(raw.len())?;
        self.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    fn read_vector3(&mut self) -> DecodeResult<[f32; 3]> {
        Ok([self.read_f32_le()?, self.read_f32_le()?, self.read_f32_le()?])
    }

    fn read_ipv4(&mut self) -> DecodeResult<Ipv4Addr> {
        let mut raw = [0u8; 4];
        self.ensure_remaining(raw.len())?;
        self.copy_to_slice(&mut raw);
        Ok(Ipv4Addr::from(raw))
    }

    fn read_ip_port(&mut self) -> DecodeResult<u16> {
        self.read_u16_be()
    }

    fn read_bytes_len8(&mut self) -> DecodeResult<Vec<u8>> {
        let len = self.read_u8()? as usize;
        self.read_raw(len)
    }

    fn read_bytes_len16(&mut self) -> DecodeResult<Vec<u8>> {
        let len = self.read_u16_le()? as usize;
        self.read_raw(len)
    }

    fn read_raw(&mut self, len: usize) -> DecodeResult<Vec<u8>> {
        self.ensure_remaining(len)?;
        let mut result = vec![0u8; len];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    fn read_string_len8(&mut self) -> DecodeResult<String> {
        let raw = self.read_bytes_len8()?;
        string_from_wire(raw)
    }

    fn read_string_len16(&mut self) -> DecodeResult<String> {
        let raw = self.read_bytes_len16()?;
        string_from_wire(raw)
    }
}

/// Strings on the wire carry a terminating NUL inside their length prefix
fn string_from_wire(mut raw: Vec<u8>) -> DecodeResult<String> {
    if raw.last() == Some(&0) {
        raw.pop();
    }
    String::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)
}

/// Write side of the binary cursor. The current write position is the buffer's length, which is
///  all a caller needs to come back and patch a field later.
pub trait BufMutExt: BufMut {
    fn put_bool(&mut self, value: bool) {
        self.put_u8(if value { 1 } else { 0 });
    }

    fn put_f64_as_f32_le(&mut self, value: f64) {
        self.put_f32_le(value as f32);
    }

    fn put_uuid(&mut self, value: &Uuid) {
        self.put_slice(value.as_bytes());
    }

    fn put_vector3(&mut self, value: &[f32; 3]) {
        for v in value {
            self.put_f32_le(*v);
        }
    }

    fn put_ipv4(&mut self, value: Ipv4Addr) {
        self.put_slice(&value.octets());
    }

    fn put_ip_port(&mut self, value: u16) {
        self.put_u16(value);
    }

    /// Writes at most 255 bytes, truncating longer values
    fn put_bytes_len8(&mut self, value: &[u8]) {
        let len = value.len().min(u8::MAX as usize);
        self.put_u8(len as u8);
        self.put_slice(&value[..len]);
    }

    /// Writes at most 65535 bytes, truncating longer values
    fn put_bytes_len16(&mut self, value: &[u8]) {
        let len = value.len().min(u16::MAX as usize);
        self.put_u16_le(len as u16);
        self.put_slice(&value[..len]);
    }

    fn put_string_len8(&mut self, value: &str) {
        self.put_bytes_len8(&string_to_wire(value, u8::MAX as usize));
    }

    fn put_string_len16(&mut self, value: &str) {
        self.put_bytes_len16(&string_to_wire(value, u16::MAX as usize));
    }

    /// Writes a block count, clamping to 255. Returns the number of blocks the caller must
    ///  actually write.
    fn put_count8(&mut self, num_blocks: usize) -> usize {
        let count = clamp_to_u8(num_blocks);
        self.put_u8(count);
        count as usize
    }
}

/// Appends the terminating NUL, truncating at a character boundary so that the result fits
///  `max_len` bytes. The empty string is sent without a terminator.
fn string_to_wire(value: &str, max_len: usize) -> Vec<u8> {
    if value.is_empty() {
        return Vec::new();
    }

    let mut end = value.len().min(max_len - 1);
    while !value.is_char_boundary(end) {
        end -= 1;
    }

    let mut result = Vec::with_capacity(end + 1);
    result.extend_from_slice(&value.as_bytes()[..end]);
    result.push(0);
    result
}

/// Saturating narrowing for fields whose application domain is wider than their wire width
pub fn clamp_to_u8<T: TryInto<u8>>(value: T) -> u8 {
    value.try_into().unwrap_or(u8::MAX)
}

/// Fails if a body decoder left bytes unread: message bodies must be consumed exactly
pub fn ensure_consumed(buf: &[u8]) -> DecodeResult<()> {
    if buf.is_empty() {
        Ok(())
    }
    else {
        Err(DecodeError::TrailingBytes(buf.len()))
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
