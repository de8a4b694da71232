use super::{ChannelMap, ConnHandle, DeviceAddress, FeatureSet, SeqStat, NUM_DATA_CHANNELS};
use crate::bytes::*;
use crate::time::Duration;
use crate::Error;
use core::fmt;
use zeroize::Zeroize;

/// Role of the local device on a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkRole {
    Central,
    Peripheral,
}

enum_with_unknown! {
    /// PHY used for data packets on a connection.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Phy(u8) {
        Le1M = 1,
        Le2M = 2,
        Coded = 3,
    }
}

/// Transmit power of the local device.
///
/// Stored in a single byte: bit 0 adds half a dB, bits 1 to 7 hold the power in dBm as a 7-bit
/// two's complement value.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct TxPower(u8);

impl TxPower {
    /// Creates a transmit power of `dbm` (plus 0.5 dB if `half_db` is set).
    ///
    /// Returns `Error::InvalidRange` if `dbm` does not fit in 7 bits.
    pub fn new(dbm: i8, half_db: bool) -> Result<Self, Error> {
        if !(-64..=63).contains(&dbm) {
            return Err(Error::InvalidRange);
        }
        Ok(TxPower(((dbm as u8) << 1) | u8::from(half_db)))
    }

    pub fn from_raw(raw: u8) -> Self {
        TxPower(raw)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }

    /// The integer part of the power, in dBm.
    pub fn dbm(&self) -> i8 {
        (self.0 as i8) >> 1
    }

    pub fn half_db(&self) -> bool {
        self.0 & 1 != 0
    }
}

impl fmt::Debug for TxPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let half = if self.half_db() { ".5" } else { "" };
        write!(f, "{}{}dBm", self.dbm(), half)
    }
}

/// Encryption context of a connection.
///
/// Key material is zeroized on drop and omitted from the `Debug` output.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct EncryptionState {
    pub enabled: bool,
    pub iv: [u8; 8],
    pub skd: [u8; 16],
    pub session_key: [u8; 16],
    pub ltk: [u8; 16],
    pub rand: [u8; 8],
    pub ediv: u16,
    pub tx_packet_counter: u32,
    pub rx_packet_counter: u32,
}

impl EncryptionState {
    const SIZE: usize = 1 + 8 + 16 + 16 + 16 + 8 + 2 + 4 + 4;
}

impl Drop for EncryptionState {
    fn drop(&mut self) {
        self.iv.zeroize();
        self.skd.zeroize();
        self.session_key.zeroize();
        self.ltk.zeroize();
        self.rand.zeroize();
    }
}

impl fmt::Debug for EncryptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionState")
            .field("enabled", &self.enabled)
            .field("tx_packet_counter", &self.tx_packet_counter)
            .field("rx_packet_counter", &self.rx_packet_counter)
            .finish()
    }
}

impl ToBytes for EncryptionState {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_bool(self.enabled)?;
        writer.write_slice(&self.iv)?;
        writer.write_slice(&self.skd)?;
        writer.write_slice(&self.session_key)?;
        writer.write_slice(&self.ltk)?;
        writer.write_slice(&self.rand)?;
        writer.write_u16_le(self.ediv)?;
        writer.write_u32_le(self.tx_packet_counter)?;
        writer.write_u32_le(self.rx_packet_counter)
    }
}

impl<'a> FromBytes<'a> for EncryptionState {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(Self {
            enabled: bytes.read_bool()?,
            iv: bytes.read_array()?,
            skd: bytes.read_array()?,
            session_key: bytes.read_array()?,
            ltk: bytes.read_array()?,
            rand: bytes.read_array()?,
            ediv: bytes.read_u16_le()?,
            tx_packet_counter: bytes.read_u32_le()?,
            rx_packet_counter: bytes.read_u32_le()?,
        })
    }
}

/// Version information reported by the peer in `LL_VERSION_IND`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: u8,
    pub company_id: u16,
    pub subversion: u16,
}

/// Maximum PDU sizes and air times in one direction pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DataLength {
    pub max_tx_octets: u16,
    pub max_tx_time: u16,
    pub max_rx_octets: u16,
    pub max_rx_time: u16,
}

impl Default for DataLength {
    /// The lengths every connection starts with.
    fn default() -> Self {
        Self {
            max_tx_octets: 27,
            max_tx_time: 328,
            max_rx_octets: 27,
            max_rx_time: 328,
        }
    }
}

impl ToBytes for DataLength {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.max_tx_octets)?;
        writer.write_u16_le(self.max_tx_time)?;
        writer.write_u16_le(self.max_rx_octets)?;
        writer.write_u16_le(self.max_rx_time)
    }
}

impl<'a> FromBytes<'a> for DataLength {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(Self {
            max_tx_octets: bytes.read_u16_le()?,
            max_tx_time: bytes.read_u16_le()?,
            max_rx_octets: bytes.read_u16_le()?,
            max_rx_time: bytes.read_u16_le()?,
        })
    }
}

/// The state of an established connection, as carried in a handover snapshot.
///
/// `event_counter`, `unmapped_channel` and `time_to_next_event` all describe the *next*
/// connection event. [`advance_by`] moves them forward in time.
///
/// [`advance_by`]: #method.advance_by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub handle: ConnHandle,
    pub role: LinkRole,
    pub access_address: u32,
    /// CRC initialization value (24 bits).
    pub crc_init: u32,
    pub phy: Phy,
    pub seq_stat: SeqStat,
    pub tx_power: TxPower,
    /// Whether no packet has been received on this connection yet.
    pub first_packet: bool,
    pub event_counter: u16,
    pub time_to_next_event: Duration,
    /// Sleep clock accuracy of the central (0-7).
    pub sca: u8,
    /// Connection interval in units of 1.25 ms.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in units of 10 ms.
    pub supervision_timeout: u16,
    pub channel_map: ChannelMap,
    pub unmapped_channel: u8,
    pub hop: u8,
    /// Channel selection algorithm in use (1 or 2).
    pub csa: u8,
    pub encryption: EncryptionState,
    pub peer_features: FeatureSet,
    pub peer_version: Option<VersionInfo>,
    pub peer_address: DeviceAddress,
    pub local_lengths: DataLength,
    pub remote_lengths: DataLength,
}

impl ConnectionRecord {
    /// Size of a serialized record.
    pub const SIZE: usize = 35
        + EncryptionState::SIZE
        + 8
        + 6
        + DeviceAddress::SIZE
        + 2 * 8;

    /// Creates a record for a freshly established connection with default parameters.
    pub fn new(handle: ConnHandle, role: LinkRole, peer_address: DeviceAddress) -> Self {
        Self {
            handle,
            role,
            access_address: 0,
            crc_init: 0,
            phy: Phy::Le1M,
            seq_stat: SeqStat::default(),
            tx_power: TxPower::default(),
            first_packet: true,
            event_counter: 0,
            time_to_next_event: Duration::ZERO,
            sca: 0,
            interval: 24,
            latency: 0,
            supervision_timeout: 100,
            channel_map: ChannelMap::with_all_channels(),
            unmapped_channel: 0,
            hop: 5,
            csa: 1,
            encryption: EncryptionState::default(),
            peer_features: FeatureSet::empty(),
            peer_version: None,
            peer_address,
            local_lengths: DataLength::default(),
            remote_lengths: DataLength::default(),
        }
    }

    /// Returns the data channel of the next connection event.
    pub fn channel(&self) -> Option<u8> {
        self.channel_map.remap(self.unmapped_channel)
    }

    /// Moves the record `elapsed` into the future.
    ///
    /// Every connection event passed in the meantime increments the event counter and hops the
    /// unmapped channel once.
    pub fn advance_by(&mut self, elapsed: Duration) {
        if elapsed < self.time_to_next_event {
            self.time_to_next_event = self.time_to_next_event - elapsed;
            return;
        }

        let interval = Duration::from_conn_interval_units(self.interval).as_micros().max(1);
        let late = (elapsed - self.time_to_next_event).as_micros();
        let events = late / interval + 1;

        self.event_counter = self.event_counter.wrapping_add(events as u16);
        let hops = (u32::from(self.hop) * (events % u32::from(NUM_DATA_CHANNELS)))
            % u32::from(NUM_DATA_CHANNELS);
        self.unmapped_channel =
            ((u32::from(self.unmapped_channel) + hops) % u32::from(NUM_DATA_CHANNELS)) as u8;
        self.time_to_next_event = Duration::from_micros(interval - late % interval);

        trace!(
            "{:?}: skipped {} events, next is #{} in {}",
            self.handle,
            events,
            self.event_counter,
            self.time_to_next_event
        );
    }
}

impl ToBytes for ConnectionRecord {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.handle.raw())?;
        writer.write_u8(match self.role {
            LinkRole::Central => 0,
            LinkRole::Peripheral => 1,
        })?;
        writer.write_u32_le(self.access_address)?;
        writer.write_slice(&self.crc_init.to_le_bytes()[..3])?;
        writer.write_u8(self.phy.into())?;
        writer.write_u8(self.seq_stat.to_raw())?;
        writer.write_u8(self.tx_power.raw())?;
        writer.write_bool(self.first_packet)?;
        writer.write_u16_le(self.event_counter)?;
        writer.write_u32_le(self.time_to_next_event.as_micros())?;
        writer.write_u8(self.sca)?;
        writer.write_u16_le(self.interval)?;
        writer.write_u16_le(self.latency)?;
        writer.write_u16_le(self.supervision_timeout)?;
        self.channel_map.to_bytes(writer)?;
        writer.write_u8(self.unmapped_channel)?;
        writer.write_u8(self.hop)?;
        writer.write_u8(self.csa)?;
        self.encryption.to_bytes(writer)?;
        self.peer_features.to_bytes(writer)?;

        let version = self.peer_version.unwrap_or(VersionInfo {
            version: 0,
            company_id: 0,
            subversion: 0,
        });
        writer.write_bool(self.peer_version.is_some())?;
        writer.write_u8(version.version)?;
        writer.write_u16_le(version.company_id)?;
        writer.write_u16_le(version.subversion)?;

        self.peer_address.to_bytes(writer)?;
        self.local_lengths.to_bytes(writer)?;
        self.remote_lengths.to_bytes(writer)
    }
}

impl<'a> FromBytes<'a> for ConnectionRecord {
    /// Reads a record, rejecting out-of-range link parameters with `Error::InvalidRange`.
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let handle = ConnHandle::new(bytes.read_u16_le()?);
        let role = match bytes.read_u8()? {
            0 => LinkRole::Central,
            1 => LinkRole::Peripheral,
            _ => return Err(Error::InvalidRange),
        };
        let access_address = bytes.read_u32_le()?;
        let crc = bytes.read_slice(3)?;
        let crc_init = u32::from_le_bytes([crc[0], crc[1], crc[2], 0]);
        let phy = Phy::from(bytes.read_u8()?);
        let seq_stat = SeqStat::from_raw(bytes.read_u8()?);
        let tx_power = TxPower::from_raw(bytes.read_u8()?);
        let first_packet = bytes.read_bool()?;
        let event_counter = bytes.read_u16_le()?;
        let time_to_next_event = Duration::from_micros(bytes.read_u32_le()?);
        let sca = bytes.read_u8()?;
        let interval = bytes.read_u16_le()?;
        let latency = bytes.read_u16_le()?;
        let supervision_timeout = bytes.read_u16_le()?;
        let channel_map = ChannelMap::from_bytes(bytes)?;
        let unmapped_channel = bytes.read_u8()?;
        let hop = bytes.read_u8()?;
        let csa = bytes.read_u8()?;
        let encryption = EncryptionState::from_bytes(bytes)?;
        let peer_features = FeatureSet::from_bytes(bytes)?;

        let version_valid = bytes.read_bool()?;
        let version = VersionInfo {
            version: bytes.read_u8()?,
            company_id: bytes.read_u16_le()?,
            subversion: bytes.read_u16_le()?,
        };

        let peer_address = DeviceAddress::from_bytes(bytes)?;
        let local_lengths = DataLength::from_bytes(bytes)?;
        let remote_lengths = DataLength::from_bytes(bytes)?;

        let valid = handle.is_valid()
            && matches!(phy, Phy::Le1M | Phy::Le2M | Phy::Coded)
            && sca <= 7
            && (6..=3200).contains(&interval)
            && latency <= 499
            && (10..=3200).contains(&supervision_timeout)
            && unmapped_channel < NUM_DATA_CHANNELS
            && (5..=16).contains(&hop)
            && (csa == 1 || csa == 2);
        if !valid {
            return Err(Error::InvalidRange);
        }

        Ok(Self {
            handle,
            role,
            access_address,
            crc_init,
            phy,
            seq_stat,
            tx_power,
            first_packet,
            event_counter,
            time_to_next_event,
            sca,
            interval,
            latency,
            supervision_timeout,
            channel_map,
            unmapped_channel,
            hop,
            csa,
            encryption,
            peer_features,
            peer_version: if version_valid { Some(version) } else { None },
            peer_address,
            local_lengths,
            remote_lengths,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::link::{AddressKind, SeqNum};

    pub(crate) fn record(handle: u16) -> ConnectionRecord {
        let mut rec = ConnectionRecord::new(
            ConnHandle::new(handle),
            LinkRole::Central,
            DeviceAddress::new([1, 2, 3, 4, 5, 6], AddressKind::Random),
        );
        rec.access_address = 0x8e89_bed6 ^ u32::from(handle);
        rec.crc_init = 0x55_5555;
        rec.hop = 7;
        rec.time_to_next_event = Duration::from_micros(10_000);
        rec.peer_features = FeatureSet::CHANNEL_SOUNDING | FeatureSet::LE_ENCRYPTION;
        rec
    }

    #[test]
    fn tx_power() {
        let p = TxPower::new(-20, true).unwrap();
        assert_eq!(p.dbm(), -20);
        assert!(p.half_db());
        assert_eq!(TxPower::new(63, false).unwrap().dbm(), 63);
        assert_eq!(TxPower::new(-64, false).unwrap().dbm(), -64);
        assert_eq!(TxPower::new(64, false), Err(Error::InvalidRange));
        assert_eq!(format!("{:?}", p), "-20.5dBm");
    }

    #[test]
    fn serialized_size() {
        let mut rec = record(3);
        rec.peer_version = Some(VersionInfo {
            version: 0x0e,
            company_id: 0x000d,
            subversion: 0x1234,
        });
        rec.seq_stat.nesn = SeqNum::ONE;
        rec.encryption.enabled = true;
        rec.encryption.ltk = [0xaa; 16];
        rec.encryption.tx_packet_counter = 77;

        let mut buf = [0; ConnectionRecord::SIZE + 4];
        let mut writer = ByteWriter::new(&mut buf);
        rec.to_bytes(&mut writer).unwrap();
        assert_eq!(writer.space_left(), 4);

        let mut reader = ByteReader::new(&buf[..ConnectionRecord::SIZE]);
        assert_eq!(ConnectionRecord::from_bytes(&mut reader).unwrap(), rec);
        assert!(reader.is_empty());

        let mut short = [0; ConnectionRecord::SIZE - 1];
        assert_eq!(rec.to_bytes(&mut ByteWriter::new(&mut short)), Err(Error::Eof));
    }

    #[test]
    fn rejects_bad_parameters() {
        let mut rec = record(3);
        rec.hop = 17;
        let mut buf = [0; ConnectionRecord::SIZE];
        rec.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();
        assert_eq!(
            ConnectionRecord::from_bytes(&mut ByteReader::new(&buf)),
            Err(Error::InvalidRange)
        );
    }

    #[test]
    fn advance() {
        let mut rec = record(1);
        rec.advance_by(Duration::from_micros(5_000));
        assert_eq!(rec.time_to_next_event.as_micros(), 5_000);
        assert_eq!(rec.event_counter, 0);

        // 30 ms interval: pass the pending event and two more, 1 ms into the third interval
        rec.advance_by(Duration::from_micros(5_000 + 2 * 30_000 + 1_000));
        assert_eq!(rec.event_counter, 3);
        assert_eq!(rec.unmapped_channel, 21);
        assert_eq!(rec.time_to_next_event.as_micros(), 29_000);
        assert_eq!(rec.channel(), Some(21));

        rec.advance_by(Duration::from_micros(29_000));
        assert_eq!(rec.event_counter, 4);
        assert_eq!(rec.unmapped_channel, 28);
        assert_eq!(rec.time_to_next_event.as_micros(), 30_000);
    }
}
