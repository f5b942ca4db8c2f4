//! Opaque typed metadata blobs carried by the control plane.

use crate::osc::{OscReader, OscWriter};
use crate::WireError;

/// Data type of an unspecified/absent metadata blob.
pub const DATA_UNSPECIFIED: i32 = -1;

/// An opaque `(type, bytes)` pair attached to users, groups, messages
/// and custom requests. The type is application-defined.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub dtype: i32,
    pub data: Vec<u8>,
}

impl Metadata {
    pub fn new(dtype: i32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            dtype,
            data: data.into(),
        }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// Writes a metadata argument pair (`i` type + `b` payload). An absent
/// blob is written as `(DATA_UNSPECIFIED, empty)`.
pub fn write_metadata(w: &mut OscWriter, md: Option<&Metadata>) -> Result<(), WireError> {
    match md {
        Some(md) => {
            w.i32(md.dtype)?;
            w.blob(&md.data)
        }
        None => {
            w.i32(DATA_UNSPECIFIED)?;
            w.blob(&[])
        }
    }
}

/// Reads an optional metadata pair. Messages may omit trailing metadata
/// entirely, so running out of arguments yields `None` rather than an
/// error.
pub fn read_metadata(r: &mut OscReader) -> Result<Option<Metadata>, WireError> {
    if r.remaining() < 2 {
        return Ok(None);
    }
    let dtype = r.i32()?;
    let data = r.blob()?;
    if dtype == DATA_UNSPECIFIED && data.is_empty() {
        return Ok(None);
    }
    Ok(Some(Metadata {
        dtype,
        data: data.to_vec(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_and_absent() {
        let mut buf = [0u8; 128];
        let mut w = OscWriter::new(&mut buf, "/aoo/client/msg", "ibib").unwrap();
        write_metadata(&mut w, Some(&Metadata::new(3, *b"conf"))).unwrap();
        write_metadata(&mut w, None).unwrap();
        let bytes = w.finish().to_vec();

        let mut r = OscReader::parse(&bytes).unwrap();
        assert_eq!(read_metadata(&mut r).unwrap(), Some(Metadata::new(3, *b"conf")));
        assert_eq!(read_metadata(&mut r).unwrap(), None);
        // trailing metadata omitted entirely
        assert_eq!(read_metadata(&mut r).unwrap(), None);
    }
}
