//! SSH wire-format primitives (RFC 4251 Section 5).
//!
//! Every SSH message is built out of a handful of primitive encodings:
//! `byte`, `boolean`, `uint32`, `string`, `mpint`, and `name-list`. The
//! writers here append to a [`BytesMut`], the [`Reader`] consumes a byte
//! slice with bounds checking on every access.

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

/// Appends an SSH `string` (uint32 length + raw bytes).
pub fn put_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Appends an SSH `boolean` (single byte, 0 or 1).
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Appends an SSH `name-list` (comma-separated names as a `string`).
pub fn put_name_list(buf: &mut BytesMut, names: &[String]) {
    let joined = names.join(",");
    put_string(buf, joined.as_bytes());
}

/// Appends an SSH `mpint` built from big-endian magnitude bytes.
///
/// Leading zeros are stripped; a zero byte is prepended when the high bit
/// of the leading byte is set, so the value always parses as positive.
pub fn put_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    let trimmed: &[u8] = match magnitude.iter().position(|&b| b != 0) {
        Some(idx) => &magnitude[idx..],
        None => &[],
    };

    if trimmed.is_empty() {
        buf.put_u32(0);
        return;
    }

    if trimmed[0] & 0x80 != 0 {
        buf.put_u32(trimmed.len() as u32 + 1);
        buf.put_u8(0);
    } else {
        buf.put_u32(trimmed.len() as u32);
    }
    buf.put_slice(trimmed);
}

/// Bounds-checked cursor over a received message body.
///
/// Each `take_*` method advances past the field it decodes and fails with a
/// `Protocol` error instead of panicking when the message is truncated.
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader over `data` starting at offset 0.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Returns the number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Returns true when every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn need(&self, count: usize, what: &str) -> SkiffResult<()> {
        if self.remaining() < count {
            return Err(SkiffError::Protocol(format!(
                "Truncated message: expected {} more byte(s) for {}, have {}",
                count,
                what,
                self.remaining()
            )));
        }
        Ok(())
    }

    /// Reads one `byte`.
    pub fn take_u8(&mut self, what: &str) -> SkiffResult<u8> {
        self.need(1, what)?;
        let b = self.data[self.offset];
        self.offset += 1;
        Ok(b)
    }

    /// Reads one `boolean`.
    pub fn take_bool(&mut self, what: &str) -> SkiffResult<bool> {
        Ok(self.take_u8(what)? != 0)
    }

    /// Reads one big-endian `uint32`.
    pub fn take_u32(&mut self, what: &str) -> SkiffResult<u32> {
        self.need(4, what)?;
        let bytes = [
            self.data[self.offset],
            self.data[self.offset + 1],
            self.data[self.offset + 2],
            self.data[self.offset + 3],
        ];
        self.offset += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Reads a fixed-size run of raw bytes.
    pub fn take_raw(&mut self, count: usize, what: &str) -> SkiffResult<&'a [u8]> {
        self.need(count, what)?;
        let slice = &self.data[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    /// Reads an SSH `string` as raw bytes.
    pub fn take_string(&mut self, what: &str) -> SkiffResult<&'a [u8]> {
        let len = self.take_u32(what)? as usize;
        self.take_raw(len, what)
    }

    /// Reads an SSH `string` and validates it as UTF-8.
    pub fn take_str(&mut self, what: &str) -> SkiffResult<String> {
        let bytes = self.take_string(what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SkiffError::Protocol(format!("Field {} is not valid UTF-8", what)))
    }

    /// Reads an SSH `name-list` into its component names.
    pub fn take_name_list(&mut self, what: &str) -> SkiffResult<Vec<String>> {
        let joined = self.take_str(what)?;
        if joined.is_empty() {
            return Ok(Vec::new());
        }
        Ok(joined.split(',').map(str::to_string).collect())
    }

    /// Reads an SSH `mpint` as big-endian magnitude bytes.
    ///
    /// Negative values are not used anywhere in the SSH2 client protocol and
    /// are rejected.
    pub fn take_mpint(&mut self, what: &str) -> SkiffResult<&'a [u8]> {
        let bytes = self.take_string(what)?;
        if let Some(first) = bytes.first() {
            if first & 0x80 != 0 {
                return Err(SkiffError::Protocol(format!(
                    "Field {} is a negative mpint",
                    what
                )));
            }
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, b"ssh-userauth");

        let data = buf.to_vec();
        let mut reader = Reader::new(&data);
        assert_eq!(reader.take_str("service").unwrap(), "ssh-userauth");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_name_list_round_trip() {
        let names = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &names);

        let data = buf.to_vec();
        let mut reader = Reader::new(&data);
        assert_eq!(reader.take_name_list("ciphers").unwrap(), names);
    }

    #[test]
    fn test_empty_name_list() {
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &[]);

        let data = buf.to_vec();
        let mut reader = Reader::new(&data);
        assert!(reader.take_name_list("languages").unwrap().is_empty());
    }

    #[test]
    fn test_mpint_zero() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0, 0, 0]);
        assert_eq!(buf.to_vec(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_mpint_high_bit_padding() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x80, 0x01]);
        assert_eq!(buf.to_vec(), vec![0, 0, 0, 3, 0, 0x80, 0x01]);

        let data = buf.to_vec();
        let mut reader = Reader::new(&data);
        let value = reader.take_mpint("e").unwrap();
        assert_eq!(value, &[0, 0x80, 0x01]);
    }

    #[test]
    fn test_mpint_strips_leading_zeros() {
        let mut buf = BytesMut::new();
        put_mpint(&mut buf, &[0x00, 0x00, 0x12, 0x34]);
        assert_eq!(buf.to_vec(), vec![0, 0, 0, 2, 0x12, 0x34]);
    }

    #[test]
    fn test_truncated_string_rejected() {
        let data = vec![0, 0, 0, 10, b'x'];
        let mut reader = Reader::new(&data);
        assert!(reader.take_string("field").is_err());
    }

    #[test]
    fn test_negative_mpint_rejected() {
        let data = vec![0, 0, 0, 1, 0xff];
        let mut reader = Reader::new(&data);
        assert!(reader.take_mpint("k").is_err());
    }

    #[test]
    fn test_take_u32_and_bool() {
        let data = vec![0, 0, 0, 42, 1];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.take_u32("port").unwrap(), 42);
        assert!(reader.take_bool("want_reply").unwrap());
        assert!(reader.take_u8("extra").is_err());
    }
}
