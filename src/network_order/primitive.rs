//! Primitive integer conversions to/from network order
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{MdnsError, MdnsResult};
use crate::network_order::{FromNetworkOrder, PacketWriter, ToNetworkOrder};

impl ToNetworkOrder for u8 {
    /// ```
    /// use mdnslib::network_order::{PacketWriter, ToNetworkOrder};
    ///
    /// let mut buffer = PacketWriter::new();
    /// assert!(255_u8.to_network_bytes(&mut buffer).is_ok());
    /// assert_eq!(buffer.bytes(), &[0xFF]);
    /// ```
    fn to_network_bytes(&self, buffer: &mut PacketWriter) -> MdnsResult<usize> {
        buffer.write_u8(*self)
    }
}

impl FromNetworkOrder for u8 {
    fn from_network_bytes(&mut self, buffer: &mut Cursor<&[u8]>) -> MdnsResult<()> {
        *self = buffer.read_u8().map_err(|_| MdnsError::ShortBuffer)?;
        Ok(())
    }
}

impl ToNetworkOrder for u16 {
    /// ```
    /// use mdnslib::network_order::{PacketWriter, ToNetworkOrder};
    ///
    /// let mut buffer = PacketWriter::new();
    /// assert!(0x1234_u16.to_network_bytes(&mut buffer).is_ok());
    /// assert_eq!(buffer.bytes(), &[0x12, 0x34]);
    /// ```
    fn to_network_bytes(&self, buffer: &mut PacketWriter) -> MdnsResult<usize> {
        buffer.write_u16(*self)
    }
}

impl FromNetworkOrder for u16 {
    /// ```
    /// use std::io::Cursor;
    /// use mdnslib::network_order::FromNetworkOrder;
    ///
    /// let b = vec![0x12, 0x34];
    /// let mut buffer = Cursor::new(b.as_slice());
    /// let mut v = 0u16;
    /// assert!(v.from_network_bytes(&mut buffer).is_ok());
    /// assert_eq!(v, 0x1234);
    /// ```
    fn from_network_bytes(&mut self, buffer: &mut Cursor<&[u8]>) -> MdnsResult<()> {
        *self = buffer
            .read_u16::<BigEndian>()
            .map_err(|_| MdnsError::ShortBuffer)?;
        Ok(())
    }
}

impl ToNetworkOrder for u32 {
    fn to_network_bytes(&self, buffer: &mut PacketWriter) -> MdnsResult<usize> {
        buffer.write_u32(*self)
    }
}

impl FromNetworkOrder for u32 {
    /// ```
    /// use std::io::Cursor;
    /// use mdnslib::network_order::FromNetworkOrder;
    ///
    /// let b = vec![0x12, 0x34, 0x56, 0x78];
    /// let mut buffer = Cursor::new(b.as_slice());
    /// let mut v = 0u32;
    /// assert!(v.from_network_bytes(&mut buffer).is_ok());
    /// assert_eq!(v, 0x12345678);
    /// ```
    fn from_network_bytes(&mut self, buffer: &mut Cursor<&[u8]>) -> MdnsResult<()> {
        *self = buffer
            .read_u32::<BigEndian>()
            .map_err(|_| MdnsError::ShortBuffer)?;
        Ok(())
    }
}
