//! Big-endian primitives for the journal format
//!
//! Byte strings and UTF-8 strings are prefixed with a `u32` length, lists and
//! maps with a `u32` element count. Timestamps are Unix milliseconds with
//! `i64::MIN` standing for "unset".

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{DecodeError, Error, Result};

const UNSET_TIMESTAMP: i64 = i64::MIN;

/// Appends journal primitives to a byte buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn put_i8(&mut self, value: i8) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a length or element count.
    pub fn put_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| Error::InvalidInput(format!("field of {len} elements is too long")))?;
        self.put_u32(len);
        Ok(())
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.put_len(value.len())?;
        self.buf.extend_from_slice(value);
        Ok(())
    }

    pub fn put_str(&mut self, value: &str) -> Result<()> {
        self.put_bytes(value.as_bytes())
    }

    pub fn put_timestamp(&mut self, value: Option<DateTime<Utc>>) {
        self.put_i64(value.map_or(UNSET_TIMESTAMP, |ts| ts.timestamp_millis()));
    }

    pub fn put_byte_list<'a, I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Vec<u8>>,
        I::IntoIter: ExactSizeIterator,
    {
        let values = values.into_iter();
        self.put_len(values.len())?;
        for value in values {
            self.put_bytes(value)?;
        }
        Ok(())
    }

    pub fn put_string_list(&mut self, values: &[String]) -> Result<()> {
        self.put_len(values.len())?;
        for value in values {
            self.put_str(value)?;
        }
        Ok(())
    }

    pub fn put_id_list(&mut self, values: &[i64]) -> Result<()> {
        self.put_len(values.len())?;
        for value in values {
            self.put_i64(*value);
        }
        Ok(())
    }

    pub fn put_attributes(&mut self, values: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<()> {
        self.put_len(values.len())?;
        for (key, value) in values {
            self.put_bytes(key)?;
            self.put_bytes(value)?;
        }
        Ok(())
    }
}

/// Reads journal primitives from a byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, needed: usize) -> std::result::Result<&'a [u8], DecodeError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(DecodeError::UnexpectedEof { needed, remaining });
        }
        let slice = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> std::result::Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> std::result::Result<u8, DecodeError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn get_bool(&mut self) -> std::result::Result<bool, DecodeError> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_i8(&mut self) -> std::result::Result<i8, DecodeError> {
        Ok(i8::from_be_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> std::result::Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> std::result::Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> std::result::Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> std::result::Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    /// Read an element count, capped by what the remaining bytes could hold
    /// so corrupt counts never drive large allocations.
    fn get_count(&mut self) -> std::result::Result<(usize, usize), DecodeError> {
        let count = self.get_u32()? as usize;
        Ok((count, count.min(self.remaining())))
    }

    pub fn get_bytes(&mut self) -> std::result::Result<Vec<u8>, DecodeError> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_string(&mut self) -> std::result::Result<String, DecodeError> {
        String::from_utf8(self.get_bytes()?).map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn get_timestamp(&mut self) -> std::result::Result<Option<DateTime<Utc>>, DecodeError> {
        let millis = self.get_i64()?;
        if millis == UNSET_TIMESTAMP {
            return Ok(None);
        }
        DateTime::from_timestamp_millis(millis)
            .map(Some)
            .ok_or(DecodeError::InvalidTimestamp(millis))
    }

    pub fn get_byte_list(&mut self) -> std::result::Result<Vec<Vec<u8>>, DecodeError> {
        let (count, capacity) = self.get_count()?;
        let mut out = Vec::with_capacity(capacity);
        for _ in 0..count {
            out.push(self.get_bytes()?);
        }
        Ok(out)
    }

    pub fn get_string_list(&mut self) -> std::result::Result<Vec<String>, DecodeError> {
        let (count, capacity) = self.get_count()?;
        let mut out = Vec::with_capacity(capacity);
        for _ in 0..count {
            out.push(self.get_string()?);
        }
        Ok(out)
    }

    pub fn get_id_list(&mut self) -> std::result::Result<Vec<i64>, DecodeError> {
        let (count, capacity) = self.get_count()?;
        let mut out = Vec::with_capacity(capacity);
        for _ in 0..count {
            out.push(self.get_i64()?);
        }
        Ok(out)
    }

    pub fn get_attributes(
        &mut self,
    ) -> std::result::Result<BTreeMap<Vec<u8>, Vec<u8>>, DecodeError> {
        let (count, _) = self.get_count()?;
        let mut out = BTreeMap::new();
        for _ in 0..count {
            let key = self.get_bytes()?;
            let value = self.get_bytes()?;
            out.insert(key, value);
        }
        Ok(out)
    }

    /// Read `count` elements with `read`, sized for `count` only as far as the
    /// remaining input allows.
    pub fn get_list_with<T>(
        &mut self,
        mut read: impl FnMut(&mut Self) -> std::result::Result<T, DecodeError>,
    ) -> std::result::Result<Vec<T>, DecodeError> {
        let (count, capacity) = self.get_count()?;
        let mut out = Vec::with_capacity(capacity);
        for _ in 0..count {
            out.push(read(self)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_integers_are_big_endian() {
        let mut writer = WireWriter::new();
        writer.put_u32(1);
        writer.put_i64(-2);
        assert_eq!(
            writer.into_bytes(),
            vec![0, 0, 0, 1, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe]
        );
    }

    #[test]
    fn test_strings_and_lists() {
        let mut writer = WireWriter::new();
        writer.put_str("héllo").unwrap();
        writer
            .put_string_list(&["a".to_string(), String::new()])
            .unwrap();
        writer.put_timestamp(None);
        let bytes = writer.into_bytes();

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.get_string().unwrap(), "héllo");
        assert_eq!(
            reader.get_string_list().unwrap(),
            vec!["a".to_string(), String::new()]
        );
        assert_eq!(reader.get_timestamp().unwrap(), None);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_short_input_reports_eof() {
        let mut reader = WireReader::new(&[0, 0, 0, 9, b'x']);
        assert_eq!(
            reader.get_bytes(),
            Err(DecodeError::UnexpectedEof {
                needed: 9,
                remaining: 1
            })
        );
    }

    #[test]
    fn test_huge_count_does_not_allocate() {
        let bytes = u32::MAX.to_be_bytes();
        let mut reader = WireReader::new(&bytes);
        assert!(matches!(
            reader.get_id_list(),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        let mut writer = WireWriter::new();
        writer.put_bytes(&[0xff, 0xfe]).unwrap();
        let bytes = writer.into_bytes();
        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.get_string(), Err(DecodeError::InvalidUtf8));
    }
}
