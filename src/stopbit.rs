/*! Stop-bit transfer primitives.

Every integer-shaped quantity in FAST travels as a sequence of 7-bit
groups, most significant first, where the byte carrying `0x80` is the
last. Strings ride the same convention: the final character has the
high bit set, and a lone stop byte is the null string.

All readers here are restartable: on underflow they rewind their own
partial consumption, ask the buffer to refill, and retry. Only a dry
refill source turns an underflow into an error.
*/

use crate::buffer::Buffer;
use crate::{Error, Result};

/// Longest legal stop-bit integer: nine groups of seven bits.
const MAX_GROUPS: usize = 9;

/// Longest ASCII string accepted from the wire, including the
/// terminating character.
pub const STRING_MAX_BYTES: usize = 256;

/// Read a stop-bit unsigned integer.
pub fn parse_uint(buf: &mut Buffer) -> Result<u64> {
    loop {
        let mut result: u64 = 0;
        let mut taken = 0;
        while taken < MAX_GROUPS {
            let Some(c) = buf.take() else { break };
            taken += 1;
            if c & 0x80 != 0 {
                return Ok((result << 7) | u64::from(c & 0x7f));
            }
            result = (result << 7) | u64::from(c);
        }
        if taken == MAX_GROUPS {
            return Err(Error::Garbled("stop bit missing within nine bytes"));
        }
        buf.rewind(taken);
        if buf.fill()? == 0 {
            return Err(Error::Garbled("unexpected end of stream"));
        }
    }
}

/// Read a stop-bit signed integer.
///
/// Bit `0x40` of the first group is the sign; seeding the accumulator
/// with -1 makes the arithmetic shifts sign-extend.
pub fn parse_int(buf: &mut Buffer) -> Result<i64> {
    loop {
        let Some(first) = buf.first() else {
            if buf.fill()? == 0 {
                return Err(Error::Garbled("unexpected end of stream"));
            }
            continue;
        };
        let mut result: i64 = if first & 0x40 != 0 { -1 } else { 0 };
        let mut taken = 0;
        while taken < MAX_GROUPS {
            let Some(c) = buf.take() else { break };
            taken += 1;
            if c & 0x80 != 0 {
                return Ok((result << 7) | i64::from(c & 0x7f));
            }
            result = (result << 7) | i64::from(c);
        }
        if taken == MAX_GROUPS {
            return Err(Error::Garbled("stop bit missing within nine bytes"));
        }
        buf.rewind(taken);
        if buf.fill()? == 0 {
            return Err(Error::Garbled("unexpected end of stream"));
        }
    }
}

/// Read a stop-bit ASCII string, returning its characters.
///
/// The byte with the high bit set contributes its low seven bits as
/// the final character. A lone stop byte therefore comes back as one
/// NUL character, which is the null-string encoding.
pub fn parse_ascii(buf: &mut Buffer) -> Result<Vec<u8>> {
    'retry: loop {
        let mut out = Vec::new();
        while out.len() < STRING_MAX_BYTES - 1 {
            let Some(c) = buf.take() else {
                buf.rewind(out.len());
                if buf.fill()? == 0 {
                    return Err(Error::Garbled("unexpected end of stream"));
                }
                continue 'retry;
            };
            if c & 0x80 != 0 {
                out.push(c & 0x7f);
                return Ok(out);
            }
            out.push(c);
        }
        return Err(Error::Garbled("string missing stop bit"));
    }
}

/// Read exactly `len` raw bytes (the body of a length-prefixed
/// unicode string).
pub fn parse_bytes(buf: &mut Buffer, len: usize) -> Result<Vec<u8>> {
    while buf.len() < len {
        if buf.fill()? == 0 {
            return Err(Error::Garbled("unexpected end of stream"));
        }
    }
    let out = buf.slice()[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

/// Groups needed to transfer `v` unsigned.
fn transfer_size_uint(v: u64) -> Result<usize> {
    for n in 1..MAX_GROUPS {
        if v >> (7 * n) == 0 {
            return Ok(n);
        }
    }
    if v >> 63 == 0 {
        Ok(MAX_GROUPS)
    } else {
        Err(Error::Garbled("integer too wide for stop-bit transfer"))
    }
}

/// Groups needed to transfer `v` signed: the smallest span whose top
/// bit still sign-extends to the value.
fn transfer_size_int(v: i64) -> Result<usize> {
    for n in 1..=MAX_GROUPS {
        let top = v >> (7 * n - 1);
        if top == 0 || top == -1 {
            return Ok(n);
        }
    }
    Err(Error::Garbled("integer too wide for stop-bit transfer"))
}

/// Write a stop-bit unsigned integer.
pub fn transfer_uint(buf: &mut Buffer, v: u64) -> Result<()> {
    let size = transfer_size_uint(v)?;
    if buf.remaining() < size {
        return Err(Error::Overflow);
    }
    for g in (1..size).rev() {
        buf.put(((v >> (7 * g)) & 0x7f) as u8)?;
    }
    buf.put((v & 0x7f) as u8 | 0x80)
}

/// Write a stop-bit signed integer.
pub fn transfer_int(buf: &mut Buffer, v: i64) -> Result<()> {
    let size = transfer_size_int(v)?;
    if buf.remaining() < size {
        return Err(Error::Overflow);
    }
    for g in (1..size).rev() {
        buf.put(((v >> (7 * g)) & 0x7f) as u8)?;
    }
    buf.put((v & 0x7f) as u8 | 0x80)
}

/// Write a stop-bit ASCII string. `None` is the null string, which
/// shares the lone stop byte with the empty string.
pub fn transfer_ascii(buf: &mut Buffer, value: Option<&[u8]>) -> Result<()> {
    let Some(s) = value else { return buf.put(0x80) };
    if s.is_empty() {
        return buf.put(0x80);
    }
    if s.iter().any(|&c| c & 0x80 != 0) {
        return Err(Error::Garbled("non-ascii character in string"));
    }
    if buf.remaining() < s.len() {
        return Err(Error::Overflow);
    }
    let (head, last) = s.split_at(s.len() - 1);
    for &c in head {
        buf.put(c)?;
    }
    buf.put(last[0] | 0x80)
}

/// Write raw bytes (the body of a length-prefixed unicode string).
pub fn transfer_bytes(buf: &mut Buffer, s: &[u8]) -> Result<()> {
    buf.put_slice(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Feeds one byte per read, to exercise the rewind-refill-retry
    // path of every primitive.
    struct Drip {
        data: Vec<u8>,
        pos: usize,
    }

    impl std::io::Read for Drip {
        fn read(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
            if self.pos == self.data.len() || dst.is_empty() {
                return Ok(0);
            }
            dst[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    fn dripping(data: &[u8]) -> Buffer {
        Buffer::new(64).with_source(Box::new(Drip {
            data: data.to_vec(),
            pos: 0,
        }))
    }

    #[test]
    fn uint_wire_forms() -> Result<()> {
        for (value, wire) in [
            (0u64, vec![0x80]),
            (1, vec![0x81]),
            (127, vec![0xff]),
            (128, vec![0x01, 0x80]),
            (300, vec![0x02, 0xac]),
            (u64::from(u32::MAX), vec![0x0f, 0x7f, 0x7f, 0x7f, 0xff]),
        ] {
            let mut out = Buffer::new(16);
            transfer_uint(&mut out, value)?;
            assert_eq!(out.slice(), wire, "encoding {value}");
            let mut inp = Buffer::from_slice(&wire);
            assert_eq!(parse_uint(&mut inp)?, value);
        }
        Ok(())
    }

    #[test]
    fn int_wire_forms() -> Result<()> {
        for (value, wire) in [
            (0i64, vec![0x80]),
            (63, vec![0xbf]),
            (64, vec![0x00, 0xc0]),
            (-1, vec![0xff]),
            (-2, vec![0xfe]),
            (-64, vec![0xc0]),
            (-65, vec![0x7f, 0xbf]),
            (12345, vec![0x00, 0x60, 0xb9]),
        ] {
            let mut out = Buffer::new(16);
            transfer_int(&mut out, value)?;
            assert_eq!(out.slice(), wire, "encoding {value}");
            let mut inp = Buffer::from_slice(&wire);
            assert_eq!(parse_int(&mut inp)?, value);
        }
        Ok(())
    }

    #[test]
    fn extreme_magnitudes() -> Result<()> {
        // Nine groups carry 63 payload bits: [-2^62, 2^62) signed,
        // [0, 2^63) unsigned. Anything wider must be refused.
        for value in [(1i64 << 62) - 1, -(1i64 << 62)] {
            let mut out = Buffer::new(16);
            transfer_int(&mut out, value)?;
            let mut inp = Buffer::from_slice(out.slice());
            assert_eq!(parse_int(&mut inp)?, value);
        }
        let mut out = Buffer::new(16);
        transfer_uint(&mut out, (1 << 63) - 1)?;
        let mut inp = Buffer::from_slice(out.slice());
        assert_eq!(parse_uint(&mut inp)?, (1 << 63) - 1);

        let mut out = Buffer::new(16);
        assert!(transfer_uint(&mut out, u64::MAX).is_err());
        assert!(transfer_int(&mut out, i64::MAX).is_err());
        assert!(transfer_int(&mut out, i64::MIN).is_err());
        Ok(())
    }

    #[test]
    fn missing_stop_bit_is_garbled() {
        let mut inp = Buffer::from_slice(&[0; 10]);
        assert!(matches!(parse_uint(&mut inp), Err(Error::Garbled(_))));
        let mut inp = Buffer::from_slice(&[0x01; 12]);
        assert!(matches!(parse_int(&mut inp), Err(Error::Garbled(_))));
    }

    #[test]
    fn truncated_stream_is_garbled() {
        let mut inp = Buffer::from_slice(&[0x02]);
        assert!(matches!(parse_uint(&mut inp), Err(Error::Garbled(_))));
    }

    #[test]
    fn refill_mid_integer() -> Result<()> {
        let mut buf = dripping(&[0x02, 0xac]);
        assert_eq!(parse_uint(&mut buf)?, 300);
        let mut buf = dripping(&[0x00, 0x60, 0xb9]);
        assert_eq!(parse_int(&mut buf)?, 12345);
        Ok(())
    }

    #[test]
    fn ascii_wire_forms() -> Result<()> {
        let mut out = Buffer::new(16);
        transfer_ascii(&mut out, Some(b"AB"))?;
        assert_eq!(out.slice(), &[0x41, 0xc2]);
        let mut inp = Buffer::from_slice(&[0x41, 0xc2]);
        assert_eq!(parse_ascii(&mut inp)?, b"AB");

        // Null and empty collapse to the lone stop byte.
        let mut out = Buffer::new(16);
        transfer_ascii(&mut out, None)?;
        assert_eq!(out.slice(), &[0x80]);
        let mut out = Buffer::new(16);
        transfer_ascii(&mut out, Some(b""))?;
        assert_eq!(out.slice(), &[0x80]);
        let mut inp = Buffer::from_slice(&[0x80]);
        assert_eq!(parse_ascii(&mut inp)?, &[0u8]);
        Ok(())
    }

    #[test]
    fn ascii_refill_mid_string() -> Result<()> {
        let mut buf = dripping(&[b'h', b'i', 0x80 | b'!']);
        assert_eq!(parse_ascii(&mut buf)?, b"hi!");
        Ok(())
    }

    #[test]
    fn ascii_rejects_high_bytes() {
        let mut out = Buffer::new(16);
        assert!(matches!(
            transfer_ascii(&mut out, Some(&[0x41, 0xff])),
            Err(Error::Garbled(_))
        ));
    }

    #[test]
    fn unterminated_ascii_is_garbled() {
        let mut inp = Buffer::from_slice(&[b'x'; STRING_MAX_BYTES + 8]);
        assert!(matches!(parse_ascii(&mut inp), Err(Error::Garbled(_))));
    }

    #[test]
    fn raw_bytes() -> Result<()> {
        let mut buf = dripping(&[1, 2, 3, 4, 5]);
        assert_eq!(parse_bytes(&mut buf, 4)?, &[1, 2, 3, 4]);
        assert_eq!(buf.len(), 0);
        assert!(matches!(parse_bytes(&mut buf, 4), Err(Error::Garbled(_))));
        Ok(())
    }

    #[test]
    fn overflow_reported_before_commit() {
        let mut out = Buffer::new(2);
        assert!(matches!(transfer_uint(&mut out, 1 << 21), Err(Error::Overflow)));
        assert!(out.is_empty());
    }
}
