//! CS channel maps and step channel selection (algorithm #3b).
//!
//! The usable channels of a configuration are listed in ascending order ("filtered"), and two
//! independently shuffled copies of that list are consumed by a cursor each: one for mode-0 steps
//! and one for all other steps. A copy is reshuffled from the DRBG whenever its cursor runs off the
//! end. The main-mode copy is additionally shuffled right before the first non-mode-0 step of every
//! procedure.

use super::drbg::Drbg;
use super::{StepMode, TransactionId};
use crate::bytes::*;
use crate::crypto::BlockCipher;
use crate::utils::{set_bits, HexSlice};
use crate::Error;
use core::fmt;
use heapless::Vec;

/// Length of a CS channel map in bytes.
pub const CS_CHANNEL_MAP_LEN: usize = 10;

/// Maximum number of usable CS channels.
pub const CS_FILTERED_CHAN_MAX_SIZE: usize = 72;

/// Minimum number of channels a CS channel map must enable.
pub const CS_MIN_NUM_CHANNELS: u8 = 15;

/// Largest bitmap accepted by [`filter_channel_map`].
///
/// [`filter_channel_map`]: fn.filter_channel_map.html
pub const MAX_BITMAP_LEN: usize = 10;

/// Channels that must never be used for Channel Sounding: 0, 1, 23-25, and 77-79.
const RESTRICTED: [u8; CS_CHANNEL_MAP_LEN] = [0x03, 0, 0x80, 0x03, 0, 0, 0, 0, 0, 0xe0];

/// Channel indices extracted from a bitmap.
pub type ChannelIndices = Vec<u8, { MAX_BITMAP_LEN * 8 }>;

/// Filtered (or shuffled) CS channel indices.
pub type CsChannels = Vec<u8, CS_FILTERED_CHAN_MAX_SIZE>;

/// Returns the index of every set bit in `bitmap`, in ascending order.
///
/// Returns `Error::InvalidRange` if `bitmap` is longer than [`MAX_BITMAP_LEN`].
///
/// [`MAX_BITMAP_LEN`]: constant.MAX_BITMAP_LEN.html
pub fn filter_channel_map(bitmap: &[u8]) -> Result<ChannelIndices, Error> {
    if bitmap.len() > MAX_BITMAP_LEN {
        return Err(Error::InvalidRange);
    }
    let mut indices = ChannelIndices::new();
    for channel in set_bits(bitmap) {
        indices.push(channel).map_err(|_| Error::InvalidRange)?;
    }
    Ok(indices)
}

/// Returns whether `channel` may be used by a CS step.
pub fn is_valid_cs_channel(channel: u8) -> bool {
    let byte = usize::from(channel / 8);
    byte < CS_CHANNEL_MAP_LEN && RESTRICTED[byte] & (1 << (channel % 8)) == 0
}

/// A validated CS channel map.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct CsChannelMap {
    raw: [u8; CS_CHANNEL_MAP_LEN],
    num_used_channels: u8,
}

impl CsChannelMap {
    /// Creates a channel map from its over-the-air representation.
    ///
    /// Returns `Error::InvalidRange` if a restricted channel is enabled or fewer than
    /// [`CS_MIN_NUM_CHANNELS`] channels are enabled.
    ///
    /// [`CS_MIN_NUM_CHANNELS`]: constant.CS_MIN_NUM_CHANNELS.html
    pub fn new(raw: [u8; CS_CHANNEL_MAP_LEN]) -> Result<Self, Error> {
        if raw.iter().zip(&RESTRICTED).any(|(byte, mask)| byte & mask != 0) {
            return Err(Error::InvalidRange);
        }
        let num_used_channels = raw.iter().map(|b| b.count_ones() as u8).sum();
        if num_used_channels < CS_MIN_NUM_CHANNELS {
            return Err(Error::InvalidRange);
        }
        Ok(Self {
            raw,
            num_used_channels,
        })
    }

    /// Creates a channel map enabling every channel CS may use.
    pub fn with_all_channels() -> Self {
        let mut raw = [0xff; CS_CHANNEL_MAP_LEN];
        for (byte, mask) in raw.iter_mut().zip(&RESTRICTED) {
            *byte &= !mask;
        }
        Self {
            raw,
            num_used_channels: CS_FILTERED_CHAN_MAX_SIZE as u8,
        }
    }

    /// Returns the raw bytes encoding this channel map.
    pub fn to_raw(&self) -> [u8; CS_CHANNEL_MAP_LEN] {
        self.raw
    }

    /// Returns the number of channels enabled by this map.
    pub fn num_used_channels(&self) -> u8 {
        self.num_used_channels
    }

    /// Returns whether `channel` is enabled.
    pub fn is_used(&self, channel: u8) -> bool {
        self.raw
            .get(usize::from(channel / 8))
            .map_or(false, |byte| byte & (1 << (channel % 8)) != 0)
    }

    /// Returns the enabled channels in ascending order.
    pub fn filtered(&self) -> CsChannels {
        set_bits(&self.raw).collect()
    }
}

impl fmt::Debug for CsChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} channels ({:?})", self.num_used_channels, HexSlice(&self.raw))
    }
}

impl ToBytes for CsChannelMap {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.raw)
    }
}

impl<'a> FromBytes<'a> for CsChannelMap {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        CsChannelMap::new(bytes.read_array()?)
    }
}

/// Shuffles `source` into `dest` using the inside-out Fisher-Yates shuffle (`cr1`).
///
/// `dest` is resized to the length of `source`. Each position `i` swaps with a position drawn by
/// `hr1(i + 1)`.
pub fn shuffle<C: BlockCipher>(
    cipher: &C,
    drbg: &mut Drbg,
    transaction: TransactionId,
    source: &[u8],
    dest: &mut CsChannels,
) {
    dest.clear();
    for (i, &value) in source.iter().take(CS_FILTERED_CHAN_MAX_SIZE).enumerate() {
        let j = usize::from(drbg.hr1(cipher, transaction, (i + 1) as u8));
        // Cannot fail: `source` is truncated to the capacity.
        let _ = dest.push(value);
        if j != i {
            dest[i] = dest[j];
            dest[j] = value;
        }
    }
}

/// The two shuffled channel arrays.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelArray {
    Mode0,
    NonMode0,
}

impl ChannelArray {
    fn transaction(self) -> TransactionId {
        match self {
            ChannelArray::Mode0 => TransactionId::ChannelSelectionMode0,
            ChannelArray::NonMode0 => TransactionId::ChannelSelectionNonMode0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
struct ShuffledChannels {
    channels: CsChannels,
    cursor: u8,
    /// How often this array has been exhausted and reshuffled.
    repetitions: u8,
}

impl ShuffledChannels {
    fn is_exhausted(&self) -> bool {
        usize::from(self.cursor) >= self.channels.len()
    }

    fn next(&mut self) -> Result<u8, Error> {
        let channel = *self
            .channels
            .get(usize::from(self.cursor))
            .ok_or(Error::InvalidRange)?;
        self.cursor += 1;
        Ok(channel)
    }
}

/// Channel selection state of one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSelection {
    filtered: CsChannels,
    mode0: ShuffledChannels,
    non_mode0: ShuffledChannels,
    non_mode0_shuffled: bool,
}

impl ChannelSelection {
    /// Creates the selection state for `map` and shuffles the mode-0 array.
    pub fn new<C: BlockCipher>(map: &CsChannelMap, cipher: &C, drbg: &mut Drbg) -> Self {
        let mut selection = Self {
            filtered: map.filtered(),
            mode0: ShuffledChannels::default(),
            non_mode0: ShuffledChannels::default(),
            non_mode0_shuffled: false,
        };
        selection.shuffle_index_array(ChannelArray::Mode0, cipher, drbg);
        selection
    }

    /// Reshuffles `array` and rewinds its cursor.
    pub fn shuffle_index_array<C: BlockCipher>(
        &mut self,
        array: ChannelArray,
        cipher: &C,
        drbg: &mut Drbg,
    ) {
        let target = match array {
            ChannelArray::Mode0 => &mut self.mode0,
            ChannelArray::NonMode0 => &mut self.non_mode0,
        };
        shuffle(
            cipher,
            drbg,
            array.transaction(),
            &self.filtered,
            &mut target.channels,
        );
        target.cursor = 0;
        trace!("CS {:?} channels reshuffled", array);
    }

    /// Marks the start of a new procedure.
    ///
    /// The non-mode-0 array is reshuffled before its next use.
    pub fn start_procedure(&mut self) {
        self.non_mode0_shuffled = false;
        self.non_mode0.repetitions = 0;
    }

    /// Returns the channel for the next step of `mode`.
    pub fn select<C: BlockCipher>(
        &mut self,
        mode: StepMode,
        cipher: &C,
        drbg: &mut Drbg,
    ) -> Result<u8, Error> {
        let channel = if mode == StepMode::Mode0 {
            if self.mode0.is_exhausted() {
                self.mode0.repetitions = self.mode0.repetitions.wrapping_add(1);
                self.shuffle_index_array(ChannelArray::Mode0, cipher, drbg);
            }
            self.mode0.next()?
        } else {
            if !self.non_mode0_shuffled {
                self.shuffle_index_array(ChannelArray::NonMode0, cipher, drbg);
                self.non_mode0_shuffled = true;
            } else if self.non_mode0.is_exhausted() {
                self.non_mode0.repetitions = self.non_mode0.repetitions.wrapping_add(1);
                self.shuffle_index_array(ChannelArray::NonMode0, cipher, drbg);
            }
            self.non_mode0.next()?
        };
        debug_assert!(is_valid_cs_channel(channel));
        Ok(channel)
    }

    /// Returns the usable channels in ascending order.
    pub fn filtered(&self) -> &[u8] {
        &self.filtered
    }

    /// Returns how often the non-mode-0 channels were fully cycled in this procedure.
    pub fn non_mode0_repetitions(&self) -> u8 {
        self.non_mode0.repetitions
    }

    /// Returns the size of the serialized state.
    pub fn snapshot_size(&self) -> usize {
        6 + 3 * self.filtered.len()
    }
}

impl ToBytes for ChannelSelection {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.filtered.len() as u8)?;
        writer.write_u8(self.mode0.cursor)?;
        writer.write_u8(self.mode0.repetitions)?;
        writer.write_u8(self.non_mode0.cursor)?;
        writer.write_u8(self.non_mode0.repetitions)?;
        writer.write_bool(self.non_mode0_shuffled)?;
        writer.write_slice(&self.filtered)?;
        writer.write_slice(&self.mode0.channels)?;
        writer.write_slice(&self.non_mode0.channels)?;
        Ok(())
    }
}

impl<'a> FromBytes<'a> for ChannelSelection {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let len = bytes.read_u8()?;
        let mode0_cursor = bytes.read_u8()?;
        let mode0_repetitions = bytes.read_u8()?;
        let non_mode0_cursor = bytes.read_u8()?;
        let non_mode0_repetitions = bytes.read_u8()?;
        let non_mode0_shuffled = bytes.read_bool()?;
        if usize::from(len) > CS_FILTERED_CHAN_MAX_SIZE || mode0_cursor > len || non_mode0_cursor > len
        {
            return Err(Error::InvalidRange);
        }

        let mut read_channels = || -> Result<CsChannels, Error> {
            let slice = bytes.read_slice(usize::from(len))?;
            if !slice.iter().all(|&ch| is_valid_cs_channel(ch)) {
                return Err(Error::InvalidRange);
            }
            CsChannels::from_slice(slice).map_err(|_| Error::InvalidRange)
        };
        let filtered = read_channels()?;
        let mode0 = read_channels()?;
        let non_mode0 = read_channels()?;

        Ok(Self {
            filtered,
            mode0: ShuffledChannels {
                channels: mode0,
                cursor: mode0_cursor,
                repetitions: mode0_repetitions,
            },
            non_mode0: ShuffledChannels {
                channels: non_mode0,
                cursor: non_mode0_cursor,
                repetitions: non_mode0_repetitions,
            },
            non_mode0_shuffled,
        })
    }
}
