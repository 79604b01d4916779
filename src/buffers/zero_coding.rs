//! Run-length compression of zero bytes as used in the datagram body.
//!
//! ```ascii
//! plain:   01 00 00 00 02 00
//! encoded: 01 00 03 02 00 01
//! ```
//!
//! Every zero byte on the wire is followed by a count of how many zero bytes it stands for.
//!  Runs longer than 255 are split into consecutive runs.

use bytes::{BufMut, BytesMut};

use crate::error::{DecodeError, DecodeResult};

pub fn zero_encode(plain: &[u8], out: &mut BytesMut) {
    out.reserve(plain.len());

    let mut zero_run: u8 = 0;
    for &b in plain {
        if b == 0 {
            if zero_run == u8::MAX {
                out.put_u8(0);
                out.put_u8(zero_run);
                zero_run = 0;
            }
            zero_run += 1;
            continue;
        }

        if zero_run > 0 {
            out.put_u8(0);
            out.put_u8(zero_run);
            zero_run = 0;
        }
        out.put_u8(b);
    }

    if zero_run > 0 {
        out.put_u8(0);
        out.put_u8(zero_run);
    }
}

/// Expands a zero-coded buffer. A run count of 0 expands to nothing, which is what peers in the
///  wild do with it.
pub fn zero_decode(encoded: &[u8], max_decoded_len: usize) -> DecodeResult<Vec<u8>> {
    let mut result = Vec::with_capacity(encoded.len() * 2);

    let mut iter = encoded.iter();
    while let Some(&b) = iter.next() {
        if b != 0 {
            result.push(b);
        }
        else {
            let &count = iter.next()
                .ok_or(DecodeError::TruncatedZeroRun)?;
            result.resize(result.len() + count as usize, 0);
        }

        if result.len() > max_decoded_len {
            return Err(DecodeError::ZeroDecodedTooLarge(max_decoded_len));
        }
    }
    Ok(result)
}
