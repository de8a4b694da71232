use crate::bytes::*;
use crate::Error;
use core::fmt;
use heapless::Vec;

/// Number of data channels.
pub const NUM_DATA_CHANNELS: u8 = 37;

/// A map marking data channels as used or unused.
///
/// A channel map must mark at least 2 channels as used.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    raw: [u8; 5],
    num_used_channels: u8,
}

impl ChannelMap {
    /// Create a new channel map from the raw format used in Connection Request PDUs (`ChM`).
    ///
    /// The first byte (LSB) contains flags for data channels 0 to 7, where the least significant
    /// bit is the flag for channel 0, and so on. The 3 most significant bits of the last byte are
    /// reserved and ignored.
    pub fn from_raw(mut raw: [u8; 5]) -> Self {
        raw[4] &= 0b11111;
        Self {
            raw,
            num_used_channels: raw.iter().map(|b| b.count_ones() as u8).sum(),
        }
    }

    /// Returns the raw bytes encoding this channel map.
    pub fn to_raw(&self) -> [u8; 5] {
        self.raw
    }

    /// Creates a new channel map that marks all data channels as used.
    pub fn with_all_channels() -> Self {
        Self {
            raw: [0xff, 0xff, 0xff, 0xff, 0b11111],
            num_used_channels: NUM_DATA_CHANNELS,
        }
    }

    /// Returns the number of data channels marked as used by this map.
    pub fn num_used_channels(&self) -> u8 {
        self.num_used_channels
    }

    /// Returns whether the given data channel is marked as used.
    pub fn is_used(&self, channel: u8) -> bool {
        match self.raw.get(usize::from(channel / 8)) {
            Some(byte) => byte & (1 << (channel % 8)) != 0,
            None => false,
        }
    }

    /// Returns an iterator over all data channels marked as used in this map.
    pub fn iter_used(&self) -> impl Iterator<Item = u8> + '_ {
        crate::utils::set_bits(&self.raw)
    }

    /// Returns the remapping table: all used channels in ascending order.
    pub fn remapping_table(&self) -> Vec<u8, { NUM_DATA_CHANNELS as usize }> {
        self.iter_used().collect()
    }

    /// Maps an unmapped channel to the data channel actually used (Channel Selection Algorithm #1).
    ///
    /// Returns `None` if no channel is used.
    pub fn remap(&self, unmapped: u8) -> Option<u8> {
        if self.is_used(unmapped) {
            return Some(unmapped);
        }
        if self.num_used_channels == 0 {
            return None;
        }
        self.iter_used()
            .nth(usize::from(unmapped % self.num_used_channels))
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.raw[..4] {
            write!(f, "{:08b}", b.reverse_bits())?;
        }
        write!(f, "{:05b}", self.raw[4].reverse_bits() >> 3)?;
        Ok(())
    }
}

impl fmt::Debug for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self, self.raw)
    }
}

impl ToBytes for ChannelMap {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.raw)
    }
}

impl<'a> FromBytes<'a> for ChannelMap {
    /// Reads a channel map, rejecting maps with fewer than 2 used channels.
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let map = ChannelMap::from_raw(bytes.read_array()?);
        if map.num_used_channels() < 2 {
            return Err(Error::InvalidRange);
        }
        Ok(map)
    }
}
