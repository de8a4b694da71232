use crate::{bytes::*, Error};
use core::fmt;

/// Specifies whether a device address is randomly generated or a LAN MAC address.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AddressKind {
    /// Publicly registered IEEE 802-2001 LAN MAC address.
    Public,
    /// Randomly generated address.
    Random,
}

/// A Bluetooth device address.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    bytes: [u8; 6],
    kind: AddressKind,
}

impl DeviceAddress {
    /// Size of an address in a handover block: 6 address bytes followed by the kind.
    pub const SIZE: usize = 7;

    /// Creates a device address from 6 raw Bytes (LSB first, as sent over the air).
    pub fn new(bytes: [u8; 6], kind: AddressKind) -> Self {
        DeviceAddress { bytes, kind }
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Returns the raw bytes making up this address.
    pub fn raw(&self) -> &[u8; 6] {
        &self.bytes
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.bytes.iter().rev().enumerate() {
            if i != 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        write!(f, "({:?})", self.kind)
    }
}

impl ToBytes for DeviceAddress {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.bytes)?;
        writer.write_u8(match self.kind {
            AddressKind::Public => 0,
            AddressKind::Random => 1,
        })
    }
}

impl<'a> FromBytes<'a> for DeviceAddress {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let raw = bytes.read_array()?;
        let kind = match bytes.read_u8()? {
            0 => AddressKind::Public,
            1 => AddressKind::Random,
            _ => return Err(Error::InvalidRange),
        };
        Ok(DeviceAddress::new(raw, kind))
    }
}
