//! Binary encode/decode helpers shared by the log, meta-page, and page
//! header formats: little-endian integers, length-prefixed blobs and
//! strings, and the `Encodeable`/`Decodeable` traits everything else in
//! the crate builds its own wire format on top of.

use std::convert::TryInto;
use std::io::Read;
use std::mem::size_of;

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable: Sized {
    fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self>;
}

pub fn read_exact<R: Read>(reader: &mut R, n: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Append-only little-endian byte buffer builder.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable>(&mut self, value: &T) {
        self.buf.extend_from_slice(&value.encode());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed byte string: u32 length, then payload.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write(&(bytes.len() as u32));
        self.write_bytes(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_blob(s.as_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

pub fn read_blob<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let len = u32::decode_from(reader)?;
    read_exact(reader, len as usize)
}

pub fn read_string<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let bytes = read_blob(reader)?;
    String::from_utf8(bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

macro_rules! impl_int_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
                    let bytes = read_exact(reader, size_of::<Self>())?;
                    Ok(Self::from_le_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    }
}

impl_int_serialization!(for u8, u16, u32, u64, i8, i16, i32, i64);

impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(u8::decode_from(reader)? != 0)
    }
}

impl Encodeable for crate::ids::Fid {
    fn encode(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Decodeable for crate::ids::Fid {
    fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let bytes = read_exact(reader, 20)?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(crate::ids::Fid(arr))
    }
}

impl Encodeable for crate::ids::Lsn {
    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write(&self.file);
        w.write(&self.offset);
        w.into_bytes()
    }
}

impl Decodeable for crate::ids::Lsn {
    fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let file = u32::decode_from(reader)?;
        let offset = u32::decode_from(reader)?;
        Ok(crate::ids::Lsn { file, offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Lsn;
    use std::io::Cursor;

    #[test]
    fn lsn_round_trips() {
        let lsn = Lsn::new(3, 400);
        let bytes = lsn.encode();
        let mut cursor = Cursor::new(bytes);
        let back = Lsn::decode_from(&mut cursor).unwrap();
        assert_eq!(lsn, back);
    }

    #[test]
    fn blob_round_trips() {
        let mut w = Writer::new();
        w.write_blob(b"hello world");
        let bytes = w.into_bytes();
        let mut cursor = Cursor::new(bytes);
        let back = read_blob(&mut cursor).unwrap();
        assert_eq!(back, b"hello world");
    }
}
