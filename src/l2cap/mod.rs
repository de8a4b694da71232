//! L2CAP connection-oriented channel state, as far as it travels with a handover.
//!
//! Channels are multiplexed over a connection and belong to a *PSM* (Protocol/Service
//! Multiplexer), which is registered once per device and defines the MTU, MPS and credit policy of
//! all its channels. A handover moves the channel records of one connection plus the PSM records
//! they refer to.
//!
//! ```notrust
//! Channel record (16 Bytes)
//! LSB                                                                                   MSB
//! +-----+-------+-------+---------+----------+----------+----------+--------------+-----+--------+
//! | CID | State | Ident | Credits | Peer CID | Peer MTU | Peer MPS | Peer credits | PSM | Status |
//! |     |       |       |         |          |          |          |              | idx |        |
//! +-----+-------+-------+---------+----------+----------+----------+--------------+-----+--------+
//!   2B     1B      1B       2B        2B          2B         2B          2B         1B     1B
//!
//! PSM record (12 Bytes)
//! LSB                                                                        MSB
//! +-----+-----+-----+-----------------+------------------+--------------+-----+
//! | PSM | MTU | MPS | Initial credits | Credit threshold | Max channels | PSM |
//! |     |     |     |                 |                  |              | idx |
//! +-----+-----+-----+-----------------+------------------+--------------+-----+
//!   2B    2B    2B          2B                 2B                1B        1B
//! ```
//!
//! The *PSM index* is the serving device's identifier of a PSM. It only links channel records to
//! PSM records within one snapshot and has no meaning on the candidate.

mod table;

pub use self::table::ChannelTable;

use crate::bytes::*;
use crate::link::ConnHandle;
use crate::Error;
use core::fmt;

/// An L2CAP channel identifier (CID).
///
/// Channels `0x0040`-`0x007F` are dynamically allocated for LE credit based connections.
#[derive(PartialEq, Eq, Hash, Copy, Clone)]
pub struct Channel(u16);

impl Channel {
    /// The null channel identifier. Must not be used as a destination endpoint.
    pub const NULL: Self = Channel(0x0000);

    /// The channel used by the Attribute Protocol (ATT).
    pub const ATT: Self = Channel(0x0004);

    /// LE L2CAP signaling channel.
    pub const LE_SIGNALING: Self = Channel(0x0005);

    /// LE Security Manager channel.
    pub const LE_SECURITY_MANAGER: Self = Channel(0x0006);

    pub const fn from_raw(raw: u16) -> Self {
        Channel(raw)
    }

    /// Returns the channel identifier (CID) as a raw `u16`.
    pub fn as_raw(&self) -> u16 {
        self.0
    }

    /// Returns whether this CID lies in the LE dynamic range.
    pub fn is_dynamic(&self) -> bool {
        (0x0040..=0x007f).contains(&self.0)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

impl FromBytes<'_> for Channel {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(Channel(bytes.read_u16_le()?))
    }
}

impl ToBytes for Channel {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.0)
    }
}

/// An LE Protocol/Service Multiplexer value.
#[derive(PartialEq, Eq, Hash, Copy, Clone)]
pub struct Psm(u16);

impl Psm {
    /// First PSM of the range assigned dynamically.
    pub const DYNAMIC_START: u16 = 0x0080;

    /// Last valid LE PSM.
    pub const MAX: u16 = 0x00ff;

    pub const fn from_raw(raw: u16) -> Self {
        Psm(raw)
    }

    pub fn as_raw(&self) -> u16 {
        self.0
    }

    /// Whether this is a valid LE PSM (`0x0001`-`0x00FF`).
    pub fn is_valid(&self) -> bool {
        (1..=Self::MAX).contains(&self.0)
    }

    /// Whether this PSM was assigned dynamically rather than being a SIG-assigned one.
    pub fn is_dynamic(&self) -> bool {
        (Self::DYNAMIC_START..=Self::MAX).contains(&self.0)
    }
}

impl fmt::Debug for Psm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Psm({:#06X})", self.0)
    }
}

enum_with_unknown! {
    /// Connection state of a channel.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ChannelState(u8) {
        Closed = 0,
        PendingConnect = 1,
        Open = 2,
        PendingDisconnect = 3,
    }
}

/// A connection-oriented channel, as carried in a handover snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    /// Local CID.
    pub cid: Channel,
    pub state: ChannelState,
    /// Signaling identifier of the last request sent on this channel.
    pub ident: u8,
    /// Number of K-frames the local device may still send.
    pub credits: u16,
    pub peer_cid: Channel,
    pub peer_mtu: u16,
    pub peer_mps: u16,
    /// Number of K-frames the peer may still send.
    pub peer_credits: u16,
    /// Index of the PSM record this channel belongs to.
    pub psm_index: u8,
    pub status: u8,
}

impl ChannelRecord {
    pub const SIZE: usize = 16;
}

impl ToBytes for ChannelRecord {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        self.cid.to_bytes(writer)?;
        writer.write_u8(self.state.into())?;
        writer.write_u8(self.ident)?;
        writer.write_u16_le(self.credits)?;
        self.peer_cid.to_bytes(writer)?;
        writer.write_u16_le(self.peer_mtu)?;
        writer.write_u16_le(self.peer_mps)?;
        writer.write_u16_le(self.peer_credits)?;
        writer.write_u8(self.psm_index)?;
        writer.write_u8(self.status)
    }
}

impl<'a> FromBytes<'a> for ChannelRecord {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let record = Self {
            cid: Channel::from_bytes(bytes)?,
            state: ChannelState::from(bytes.read_u8()?),
            ident: bytes.read_u8()?,
            credits: bytes.read_u16_le()?,
            peer_cid: Channel::from_bytes(bytes)?,
            peer_mtu: bytes.read_u16_le()?,
            peer_mps: bytes.read_u16_le()?,
            peer_credits: bytes.read_u16_le()?,
            psm_index: bytes.read_u8()?,
            status: bytes.read_u8()?,
        };
        if !record.cid.is_dynamic()
            || !record.peer_cid.is_dynamic()
            || matches!(record.state, ChannelState::Unknown(_))
        {
            return Err(Error::InvalidRange);
        }
        Ok(record)
    }
}

/// A registered PSM, as carried in a handover snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PsmRecord {
    pub psm: Psm,
    /// Largest SDU the local upper layer accepts.
    pub mtu: u16,
    /// Largest PDU payload the local L2CAP layer accepts.
    pub mps: u16,
    pub initial_peer_credits: u16,
    /// The peer is given new credits when its count drops below this.
    pub peer_credit_threshold: u16,
    pub max_channels: u8,
    pub psm_index: u8,
}

impl PsmRecord {
    pub const SIZE: usize = 12;

    /// Whether `other` registers the same service parameters, ignoring PSM value and index.
    pub fn same_parameters(&self, other: &PsmRecord) -> bool {
        self.mtu == other.mtu
            && self.mps == other.mps
            && self.initial_peer_credits == other.initial_peer_credits
            && self.peer_credit_threshold == other.peer_credit_threshold
            && self.max_channels == other.max_channels
    }
}

impl ToBytes for PsmRecord {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.psm.as_raw())?;
        writer.write_u16_le(self.mtu)?;
        writer.write_u16_le(self.mps)?;
        writer.write_u16_le(self.initial_peer_credits)?;
        writer.write_u16_le(self.peer_credit_threshold)?;
        writer.write_u8(self.max_channels)?;
        writer.write_u8(self.psm_index)
    }
}

impl<'a> FromBytes<'a> for PsmRecord {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let record = Self {
            psm: Psm(bytes.read_u16_le()?),
            mtu: bytes.read_u16_le()?,
            mps: bytes.read_u16_le()?,
            initial_peer_credits: bytes.read_u16_le()?,
            peer_credit_threshold: bytes.read_u16_le()?,
            max_channels: bytes.read_u8()?,
            psm_index: bytes.read_u8()?,
        };
        if !record.psm.is_valid()
            || record.mtu < 23
            || !(23..=65533).contains(&record.mps)
            || record.max_channels == 0
        {
            return Err(Error::InvalidRange);
        }
        Ok(record)
    }
}

/// The channel multiplexing layer of the host, as seen by the handover serializer.
///
/// Enumeration is by index so that implementations need not allocate. The PSM records returned by
/// [`psm`] are those referenced by the connection's channels, and the `psm_index` fields returned
/// by [`channel`] and [`psm`] must agree.
///
/// [`psm`]: #tymethod.psm
/// [`channel`]: #tymethod.channel
pub trait Multiplexer {
    /// Returns the number of channels open on `conn`.
    fn channel_count(&self, conn: ConnHandle) -> usize;

    /// Returns the `index`th channel of `conn`.
    fn channel(&self, conn: ConnHandle, index: usize) -> Option<ChannelRecord>;

    /// Returns the number of PSMs used by the channels of `conn`.
    fn psm_count(&self, conn: ConnHandle) -> usize;

    /// Returns the `index`th PSM used by the channels of `conn`.
    fn psm(&self, conn: ConnHandle, index: usize) -> Option<PsmRecord>;

    /// Looks up the local registration of `psm`.
    fn lookup_psm(&self, psm: Psm) -> Option<PsmRecord>;

    /// Returns an unused dynamic PSM, if any is left.
    fn allocate_psm(&self) -> Option<Psm>;

    /// Registers a PSM.
    ///
    /// Fails if the PSM is already registered or the registration table is full.
    fn register_psm(&mut self, record: &PsmRecord) -> Result<(), Error>;

    /// Removes the registration of `psm`.
    fn unregister_psm(&mut self, psm: Psm);

    /// Opens a channel on `conn`, belonging to the registered `psm`.
    fn register_channel(
        &mut self,
        conn: ConnHandle,
        psm: Psm,
        record: &ChannelRecord,
    ) -> Result<(), Error>;

    /// Drops all channels of `conn`.
    fn remove_channels(&mut self, conn: ConnHandle);
}

impl<M: Multiplexer + ?Sized> Multiplexer for &'_ mut M {
    fn channel_count(&self, conn: ConnHandle) -> usize {
        (**self).channel_count(conn)
    }

    fn channel(&self, conn: ConnHandle, index: usize) -> Option<ChannelRecord> {
        (**self).channel(conn, index)
    }

    fn psm_count(&self, conn: ConnHandle) -> usize {
        (**self).psm_count(conn)
    }

    fn psm(&self, conn: ConnHandle, index: usize) -> Option<PsmRecord> {
        (**self).psm(conn, index)
    }

    fn lookup_psm(&self, psm: Psm) -> Option<PsmRecord> {
        (**self).lookup_psm(psm)
    }

    fn allocate_psm(&self) -> Option<Psm> {
        (**self).allocate_psm()
    }

    fn register_psm(&mut self, record: &PsmRecord) -> Result<(), Error> {
        (**self).register_psm(record)
    }

    fn unregister_psm(&mut self, psm: Psm) {
        (**self).unregister_psm(psm)
    }

    fn register_channel(
        &mut self,
        conn: ConnHandle,
        psm: Psm,
        record: &ChannelRecord,
    ) -> Result<(), Error> {
        (**self).register_channel(conn, psm, record)
    }

    fn remove_channels(&mut self, conn: ConnHandle) {
        (**self).remove_channels(conn)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn psm_record(psm: u16) -> PsmRecord {
        PsmRecord {
            psm: Psm::from_raw(psm),
            mtu: 512,
            mps: 247,
            initial_peer_credits: 10,
            peer_credit_threshold: 2,
            max_channels: 2,
            psm_index: 0,
        }
    }

    pub(crate) fn channel_record(cid: u16) -> ChannelRecord {
        ChannelRecord {
            cid: Channel::from_raw(cid),
            state: ChannelState::Open,
            ident: 3,
            credits: 8,
            peer_cid: Channel::from_raw(0x0041),
            peer_mtu: 256,
            peer_mps: 100,
            peer_credits: 9,
            psm_index: 0,
            status: 0,
        }
    }

    #[test]
    fn record_sizes() {
        let mut buf = [0; ChannelRecord::SIZE + PsmRecord::SIZE];
        let mut writer = ByteWriter::new(&mut buf);
        channel_record(0x0040).to_bytes(&mut writer).unwrap();
        psm_record(0x0080).to_bytes(&mut writer).unwrap();
        assert_eq!(writer.space_left(), 0);

        let mut reader = ByteReader::new(&buf);
        assert_eq!(ChannelRecord::from_bytes(&mut reader), Ok(channel_record(0x0040)));
        assert_eq!(PsmRecord::from_bytes(&mut reader), Ok(psm_record(0x0080)));
    }

    #[test]
    fn record_validation() {
        let mut buf = [0; ChannelRecord::SIZE];
        channel_record(0x0004)
            .to_bytes(&mut ByteWriter::new(&mut buf))
            .unwrap();
        assert_eq!(
            ChannelRecord::from_bytes(&mut ByteReader::new(&buf)),
            Err(Error::InvalidRange)
        );

        let mut buf = [0; PsmRecord::SIZE];
        psm_record(0x0100)
            .to_bytes(&mut ByteWriter::new(&mut buf))
            .unwrap();
        assert_eq!(
            PsmRecord::from_bytes(&mut ByteReader::new(&buf)),
            Err(Error::InvalidRange)
        );
    }
}
