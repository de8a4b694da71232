use crate::{bytes::*, Error};
use bitflags::bitflags;

bitflags! {
    /// A set of optional Link Layer features, as exchanged with `LL_FEATURE_REQ`/`LL_FEATURE_RSP`.
    ///
    /// Only features relevant to Channel Sounding and handover are named. Unnamed bits received
    /// from a peer are dropped.
    pub struct FeatureSet: u64 {
        /// Low-Energy data encryption.
        const LE_ENCRYPTION = (1 << 0);

        /// Connection parameters request procedure.
        const CONN_PARAM_REQ = (1 << 1);

        /// Support for the LL Control PDU `LL_REJECT_IND_EXT`.
        const EXTENDED_REJECT_INDICATION = (1 << 2);

        /// Peripheral-initiated feature exchange.
        const PERIPHERAL_FEATURE_EXCHANGE = (1 << 3);

        /// Low-Energy Link-Layer ping exchange.
        const LE_PING = (1 << 4);

        /// Data channel PDUs with more than 27 Bytes of payload.
        const LE_PACKET_LENGTH_EXTENSION = (1 << 5);

        /// Support for untrackable randomized device addresses (LL Privacy).
        const LL_PRIVACY = (1 << 6);

        /// Extended scan filter policies.
        const EXT_SCANNER_FILTER_POLICIES = (1 << 7);

        /// The LE 2M PHY.
        const LE_2M_PHY = (1 << 8);

        /// The LE Coded PHY.
        const LE_CODED_PHY = (1 << 11);

        /// Channel Selection Algorithm #2.
        const CHANNEL_SELECTION_ALGORITHM_2 = (1 << 14);

        /// Channel Sounding, Link Layer part.
        ///
        /// Both devices need this bit set before CS security can be started or a CS procedure can
        /// be enabled on their connection.
        const CHANNEL_SOUNDING = (1 << 46);

        /// Channel Sounding, host part.
        const CHANNEL_SOUNDING_HOST_SUPPORT = (1 << 47);
    }
}

impl FeatureSet {
    /// Returns the feature set supported by this controller.
    pub fn supported() -> Self {
        FeatureSet::LE_ENCRYPTION
            | FeatureSet::LE_PACKET_LENGTH_EXTENSION
            | FeatureSet::LE_2M_PHY
            | FeatureSet::CHANNEL_SELECTION_ALGORITHM_2
            | FeatureSet::CHANNEL_SOUNDING
    }
}

impl ToBytes for FeatureSet {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u64_le(self.bits())
    }
}

impl<'a> FromBytes<'a> for FeatureSet {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let raw = bytes.read_u64_le()?;
        Ok(Self::from_bits_truncate(raw))
    }
}
