//! Link-Layer connection state.
//!
//! A connection that is handed over to another controller carries everything needed to keep
//! following the peer: timing anchors, the hopping state, the acknowledgement bits, the encryption
//! context, and what was learned about the peer. [`ConnectionRecord`] holds all of it and is the
//! first part of every handover snapshot.
//!
//! [`ConnectionRecord`]: struct.ConnectionRecord.html

mod channel_map;
mod connection;
mod device_address;
mod features;
mod seq_num;

pub use self::channel_map::{ChannelMap, NUM_DATA_CHANNELS};
pub use self::connection::{
    ConnectionRecord, DataLength, EncryptionState, LinkRole, Phy, TxPower, VersionInfo,
};
pub use self::device_address::{AddressKind, DeviceAddress};
pub use self::features::FeatureSet;
pub use self::seq_num::{SeqNum, SeqStat};

#[cfg(test)]
pub(crate) use self::connection::tests as testing;

use core::fmt;

/// Handle of a connection, as used by the host to refer to it.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConnHandle(u16);

impl ConnHandle {
    /// Highest handle value a controller may assign.
    pub const MAX: u16 = 0x0eff;

    pub const fn new(raw: u16) -> Self {
        ConnHandle(raw)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Whether the handle lies in the range a controller may assign.
    pub fn is_valid(&self) -> bool {
        self.0 <= Self::MAX
    }
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnHandle({:#06X})", self.0)
    }
}
