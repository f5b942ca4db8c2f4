//! Minimal OSC 1.0 message codec.
//!
//! Only the subset the protocol actually uses is implemented: messages
//! (no bundles) with the argument types `i f d s b t`. All fields are
//! big-endian and padded to 4-byte boundaries as per the OSC spec.
//!
//! Messages in this protocol have fixed signatures, so the writer takes
//! the address pattern *and* the complete type tag string up front and
//! arguments are appended afterwards. This avoids the tag-string
//! back-patching a general-purpose OSC encoder needs, and keeps encoding
//! a single forward pass over a caller-provided buffer.

use crate::WireError;

#[inline(always)]
const fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// Forward-only OSC message writer over a borrowed buffer.
///
/// All methods fail with [`WireError::Overflow`] when the buffer runs
/// out; the buffer is typically a stack array of [`crate::MAX_PACKET_SIZE`]
/// bytes.
pub struct OscWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> OscWriter<'a> {
    /// Starts a message with the given address pattern and complete type
    /// tag string (without the leading comma).
    pub fn new(buf: &'a mut [u8], pattern: &str, tags: &str) -> Result<Self, WireError> {
        let mut w = Self { buf, pos: 0 };
        w.put_str(pattern)?;
        w.put_tag_string(tags)?;
        Ok(w)
    }

    /// Starts a message whose address pattern is assembled from the
    /// domain, a type word, a numeric id and a verb, e.g.
    /// `/aoo/sink/7/data`.
    pub fn with_id(
        buf: &'a mut [u8],
        type_word: &str,
        id: crate::Id,
        verb: &str,
        tags: &str,
    ) -> Result<Self, WireError> {
        let mut pattern = arrayvec::ArrayString::<64>::new();
        use core::fmt::Write;
        write!(pattern, "{}{}/{}{}", crate::pattern::DOMAIN, type_word, id, verb)
            .map_err(|_| WireError::Overflow)?;
        Self::new(buf, &pattern, tags)
    }

    /// Number of bytes written so far.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Finishes the message and returns the encoded bytes.
    #[inline(always)]
    pub fn finish(self) -> &'a [u8] {
        &self.buf[..self.pos]
    }

    #[inline]
    fn reserve(&mut self, n: usize) -> Result<&mut [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Overflow)?;
        if end > self.buf.len() {
            return Err(WireError::Overflow);
        }
        let out = &mut self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn put_str(&mut self, s: &str) -> Result<(), WireError> {
        let padded = pad4(s.len() + 1);
        let out = self.reserve(padded)?;
        out[..s.len()].copy_from_slice(s.as_bytes());
        out[s.len()..].fill(0);
        Ok(())
    }

    fn put_tag_string(&mut self, tags: &str) -> Result<(), WireError> {
        let padded = pad4(tags.len() + 2);
        let out = self.reserve(padded)?;
        out[0] = b',';
        out[1..1 + tags.len()].copy_from_slice(tags.as_bytes());
        out[1 + tags.len()..].fill(0);
        Ok(())
    }

    #[inline]
    pub fn i32(&mut self, v: i32) -> Result<(), WireError> {
        self.reserve(4)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    #[inline]
    pub fn f32(&mut self, v: f32) -> Result<(), WireError> {
        self.reserve(4)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    #[inline]
    pub fn f64(&mut self, v: f64) -> Result<(), WireError> {
        self.reserve(8)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Writes an OSC time tag (`t`).
    #[inline]
    pub fn time(&mut self, v: crate::time::NtpTime) -> Result<(), WireError> {
        self.reserve(8)?.copy_from_slice(&v.as_u64().to_be_bytes());
        Ok(())
    }

    #[inline]
    pub fn str(&mut self, s: &str) -> Result<(), WireError> {
        self.put_str(s)
    }

    pub fn blob(&mut self, data: &[u8]) -> Result<(), WireError> {
        let size = i32::try_from(data.len()).map_err(|_| WireError::Overflow)?;
        self.i32(size)?;
        let padded = pad4(data.len());
        let out = self.reserve(padded)?;
        out[..data.len()].copy_from_slice(data);
        out[data.len()..].fill(0);
        Ok(())
    }
}

/// Cursor-style OSC message reader.
///
/// Arguments are pulled in declaration order, checking each against the
/// type tag string; any disagreement yields [`WireError::BadFormat`],
/// mirroring how the receive paths treat malformed traffic (drop and
/// count, never trust).
pub struct OscReader<'a> {
    pattern: &'a str,
    tags: &'a [u8],
    tag_pos: usize,
    data: &'a [u8],
    pos: usize,
}

#[inline]
fn read_padded_str(data: &[u8], pos: usize) -> Result<(&str, usize), WireError> {
    let rem = data.get(pos..).ok_or(WireError::BadFormat)?;
    let len = rem
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::BadFormat)?;
    let s = core::str::from_utf8(&rem[..len]).map_err(|_| WireError::BadFormat)?;
    let next = pos + pad4(len + 1);
    if next > data.len() {
        return Err(WireError::BadFormat);
    }
    Ok((s, next))
}

impl<'a> OscReader<'a> {
    /// Parses the address pattern and type tag string of an OSC message.
    pub fn parse(data: &'a [u8]) -> Result<Self, WireError> {
        if data.len() < 4 || data[0] != b'/' {
            return Err(WireError::BadFormat);
        }
        let (pattern, pos) = read_padded_str(data, 0)?;
        // A message without arguments may omit the tag string entirely.
        if pos == data.len() {
            return Ok(Self {
                pattern,
                tags: &[],
                tag_pos: 0,
                data,
                pos,
            });
        }
        let (tag_str, pos) = read_padded_str(data, pos)?;
        let tags = tag_str.as_bytes();
        if tags.first() != Some(&b',') {
            return Err(WireError::BadFormat);
        }
        Ok(Self {
            pattern,
            tags: &tags[1..],
            tag_pos: 0,
            data,
            pos,
        })
    }

    #[inline(always)]
    pub fn pattern(&self) -> &'a str {
        self.pattern
    }

    /// Number of arguments not yet consumed.
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.tags.len() - self.tag_pos
    }

    #[inline]
    fn expect_tag(&mut self, tag: u8) -> Result<(), WireError> {
        if self.tags.get(self.tag_pos) == Some(&tag) {
            self.tag_pos += 1;
            Ok(())
        } else {
            Err(WireError::BadFormat)
        }
    }

    #[inline]
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::BadFormat)?;
        let out = self.data.get(self.pos..end).ok_or(WireError::BadFormat)?;
        self.pos = end;
        Ok(out)
    }

    #[inline]
    pub fn i32(&mut self) -> Result<i32, WireError> {
        self.expect_tag(b'i')?;
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    #[inline]
    pub fn f32(&mut self) -> Result<f32, WireError> {
        self.expect_tag(b'f')?;
        Ok(f32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    #[inline]
    pub fn f64(&mut self) -> Result<f64, WireError> {
        self.expect_tag(b'd')?;
        Ok(f64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    #[inline]
    pub fn time(&mut self) -> Result<crate::time::NtpTime, WireError> {
        self.expect_tag(b't')?;
        let raw = u64::from_be_bytes(self.take(8)?.try_into().unwrap());
        Ok(crate::time::NtpTime::from_u64(raw))
    }

    pub fn str(&mut self) -> Result<&'a str, WireError> {
        self.expect_tag(b's')?;
        let (s, next) = read_padded_str(self.data, self.pos)?;
        self.pos = next;
        Ok(s)
    }

    pub fn blob(&mut self) -> Result<&'a [u8], WireError> {
        self.expect_tag(b'b')?;
        let size = i32::from_be_bytes(self.take(4)?.try_into().unwrap());
        let size = usize::try_from(size).map_err(|_| WireError::BadFormat)?;
        let out = self.take(pad4(size))?;
        Ok(&out[..size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_message() {
        let mut buf = [0u8; 64];
        let w = OscWriter::new(&mut buf, "/aoo/server/query", "").unwrap();
        let bytes = w.finish().to_vec();
        let r = OscReader::parse(&bytes).unwrap();
        assert_eq!(r.pattern(), "/aoo/server/query");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn all_argument_types() {
        let mut buf = [0u8; 256];
        let mut w = OscWriter::new(&mut buf, "/aoo/peer/msg", "ifdstb").unwrap();
        w.i32(-7).unwrap();
        w.f32(0.5).unwrap();
        w.f64(48e3).unwrap();
        w.str("hello").unwrap();
        w.time(crate::time::NtpTime::from_u64(0x1122334455667788)).unwrap();
        w.blob(&[1, 2, 3]).unwrap();
        let bytes = w.finish().to_vec();

        // everything 4-byte aligned
        assert_eq!(bytes.len() % 4, 0);

        let mut r = OscReader::parse(&bytes).unwrap();
        assert_eq!(r.i32().unwrap(), -7);
        assert_eq!(r.f32().unwrap(), 0.5);
        assert_eq!(r.f64().unwrap(), 48e3);
        assert_eq!(r.str().unwrap(), "hello");
        assert_eq!(r.time().unwrap().as_u64(), 0x1122334455667788);
        assert_eq!(r.blob().unwrap(), &[1, 2, 3]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn type_mismatch_is_bad_format() {
        let mut buf = [0u8; 64];
        let mut w = OscWriter::new(&mut buf, "/aoo/peer/ping", "i").unwrap();
        w.i32(1).unwrap();
        let bytes = w.finish().to_vec();
        let mut r = OscReader::parse(&bytes).unwrap();
        assert_eq!(r.str(), Err(WireError::BadFormat));
    }

    #[test]
    fn truncated_blob_is_bad_format() {
        let mut buf = [0u8; 64];
        let mut w = OscWriter::new(&mut buf, "/aoo/peer/msg", "b").unwrap();
        w.blob(&[0; 16]).unwrap();
        let bytes = w.finish();
        let mut r = OscReader::parse(&bytes[..bytes.len() - 8]).unwrap();
        assert_eq!(r.blob(), Err(WireError::BadFormat));
    }

    #[test]
    fn writer_overflow() {
        let mut buf = [0u8; 16];
        let mut w = OscWriter::new(&mut buf, "/aoo/x", "b").unwrap();
        assert_eq!(w.blob(&[0; 64]), Err(WireError::Overflow));
    }

    #[test]
    fn id_pattern() {
        let mut buf = [0u8; 64];
        let w =
            OscWriter::with_id(&mut buf, crate::pattern::TYPE_SINK, 42, "/data", "").unwrap();
        let bytes = w.finish().to_vec();
        let r = OscReader::parse(&bytes).unwrap();
        assert_eq!(r.pattern(), "/aoo/sink/42/data");
    }
}
