//! Bounded-size packet writer with DNS name compression (RFC 1035 §4.1.4).
//!
//! The writer keeps a dictionary from every label-suffix already emitted to
//! its byte offset. Writing a name walks its suffixes: the first suffix found
//! in the dictionary becomes a two-byte pointer, everything before it is
//! written as length-prefixed labels and recorded for later names in the
//! same packet.
use std::collections::HashMap;

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::{MdnsError, MdnsResult};
use crate::name::DnsName;

/// Offsets above this cannot be expressed in a 14-bit pointer
const MAX_POINTER_OFFSET: usize = 0x3FFF;

pub struct PacketWriter {
    buf: Vec<u8>,
    limit: usize,
    // case-folded label-suffix -> offset of its first occurrence
    dict: HashMap<String, u16>,
}

/// Snapshot for rollback, used when a record would overflow the MTU budget.
#[derive(Debug, Clone, Copy)]
pub struct WriterMark(usize);

impl PacketWriter {
    /// Unbounded writer (tests, offload packets)
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Writer that fails with `ShortBuffer` past `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            dict: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn ensure(&mut self, more: usize) -> MdnsResult<()> {
        if self.buf.len().saturating_add(more) > self.limit {
            return Err(MdnsError::ShortBuffer);
        }
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> MdnsResult<usize> {
        self.ensure(1)?;
        self.buf.write_u8(v)?;
        Ok(1)
    }

    pub fn write_u16(&mut self, v: u16) -> MdnsResult<usize> {
        self.ensure(2)?;
        self.buf.write_u16::<BigEndian>(v)?;
        Ok(2)
    }

    pub fn write_u32(&mut self, v: u32) -> MdnsResult<usize> {
        self.ensure(4)?;
        self.buf.write_u32::<BigEndian>(v)?;
        Ok(4)
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> MdnsResult<usize> {
        self.ensure(v.len())?;
        self.buf.extend_from_slice(v);
        Ok(v.len())
    }

    /// Overwrite two bytes in place; used to patch rdlength after the rdata
    /// size is known.
    pub fn patch_u16(&mut self, pos: usize, v: u16) {
        let be = v.to_be_bytes();
        self.buf[pos] = be[0];
        self.buf[pos + 1] = be[1];
    }

    pub fn mark(&self) -> WriterMark {
        WriterMark(self.buf.len())
    }

    /// Roll back to `mark`, dropping dictionary entries that point into the
    /// discarded tail.
    pub fn rewind(&mut self, mark: WriterMark) {
        self.buf.truncate(mark.0);
        let cut = mark.0;
        self.dict.retain(|_, off| (*off as usize) < cut);
    }

    /// Write `name` with compression, returning the number of bytes emitted.
    ///
    /// ```
    /// use mdnslib::name::DnsName;
    /// use mdnslib::network_order::PacketWriter;
    ///
    /// let mut w = PacketWriter::new();
    /// let name = DnsName::try_from("host.local").unwrap();
    /// assert_eq!(w.write_name(&name).unwrap(), 12);
    /// // the second occurrence collapses to a two-byte pointer
    /// assert_eq!(w.write_name(&name).unwrap(), 2);
    /// assert_eq!(&w.bytes()[12..], &[0xC0, 0x00]);
    /// ```
    pub fn write_name(&mut self, name: &DnsName) -> MdnsResult<usize> {
        let labels = name.labels();
        let start = self.buf.len();

        let mut idx = 0usize;
        loop {
            if idx == labels.len() {
                // root
                self.write_u8(0)?;
                break;
            }

            let key = suffix_key(&labels[idx..]);
            if let Some(&off) = self.dict.get(&key) {
                self.write_u16(0xC000 | off)?;
                break;
            }

            let off = self.buf.len();
            if off <= MAX_POINTER_OFFSET {
                self.dict.insert(key, off as u16);
            }

            let label = labels[idx].as_bytes();
            debug_assert!(label.len() <= 63);
            self.write_u8(label.len() as u8)?;
            self.write_bytes(label)?;
            idx += 1;
        }

        Ok(self.buf.len() - start)
    }
}

impl Default for PacketWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn suffix_key(labels: &[String]) -> String {
    let mut key = String::new();
    for l in labels {
        key.push_str(&l.to_ascii_lowercase());
        key.push('.');
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_suffix_is_compressed() {
        let mut w = PacketWriter::new();
        let a = DnsName::try_from("alpha.example.local").unwrap();
        let b = DnsName::try_from("beta.example.local").unwrap();

        w.write_name(&a).unwrap();
        let before = w.len();
        w.write_name(&b).unwrap();

        // "beta" label (5 bytes) + pointer to "example.local" (2 bytes)
        assert_eq!(w.len() - before, 7);
        // pointer aims at offset 6, the start of "example"
        assert_eq!(&w.bytes()[before + 5..], &[0xC0, 0x06]);
    }

    #[test]
    fn compression_is_case_insensitive() {
        let mut w = PacketWriter::new();
        w.write_name(&DnsName::try_from("Host.Local").unwrap()).unwrap();
        let n = w.write_name(&DnsName::try_from("host.local").unwrap()).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn limit_is_enforced() {
        let mut w = PacketWriter::with_limit(4);
        assert!(w.write_u32(1).is_ok());
        assert!(matches!(w.write_u8(1), Err(MdnsError::ShortBuffer)));
    }

    #[test]
    fn rewind_drops_dict_entries() {
        let mut w = PacketWriter::new();
        w.write_name(&DnsName::try_from("keep.local").unwrap()).unwrap();
        let mark = w.mark();
        w.write_name(&DnsName::try_from("drop.other").unwrap()).unwrap();
        w.rewind(mark);

        // "drop.other" suffixes must be forgotten: writing it again emits the
        // full name, not a dangling pointer
        let n = w.write_name(&DnsName::try_from("drop.other").unwrap()).unwrap();
        assert_eq!(n, 1 + 4 + 1 + 5 + 1);
        // while "local" from before the mark still compresses
        let n = w.write_name(&DnsName::try_from("x.local").unwrap()).unwrap();
        assert_eq!(n, 1 + 1 + 2);
    }
}
