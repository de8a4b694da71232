//! Channel Sounding (CS) link-layer core.
//!
//! A CS *procedure* is made of *subevents*, each of which runs a number of *steps* on the radio.
//! Every step is parameterized by values drawn from a deterministic random bit generator that both
//! devices seed identically during the CS security start, so both sides agree on the channel,
//! access addresses, and antenna order of every step without exchanging them over the air.
//!
//! The module is split into:
//!
//! * [`drbg`]: the AES-based random bit generator and its `hr1` helper.
//! * [`channel`]: channel map filtering and the shuffled channel index arrays.
//! * [`select`]: access address, tone extension, antenna permutation, and random sequence
//!   selection.
//! * [`timing`]: step durations and subevent capacity.
//! * [`config`]: configuration and procedure parameters.
//! * [`step`]: step descriptors and the double-buffered step lists.
//! * [`procedure`]: the procedure/subevent/step state machine.
//! * [`report`]: result events handed to the host.
//!
//! [`drbg`]: drbg/index.html
//! [`channel`]: channel/index.html
//! [`select`]: select/index.html
//! [`timing`]: timing/index.html
//! [`config`]: config/index.html
//! [`step`]: step/index.html
//! [`procedure`]: procedure/index.html
//! [`report`]: report/index.html

pub mod channel;
pub mod config;
pub mod drbg;
pub mod procedure;
pub mod report;
pub mod select;
pub mod step;
pub mod timing;

use crate::link::ConnHandle;
use crate::Error;

/// Maximum number of configurations that can be valid on a connection at the same time.
pub const MAX_CONFIGS: usize = 4;

/// Minimum number of steps in a subevent.
pub const CS_MIN_STEPS_PER_SUBEVENT: u8 = 2;

/// Maximum number of steps in a subevent.
pub const CS_MAX_STEPS_PER_SUBEVENT: u8 = 160;

/// Maximum number of steps (of all modes) in a procedure.
pub const CS_MAX_STEPS_PER_PROCEDURE: u16 = 256;

/// Maximum number of subevents in a procedure.
pub const CS_MAX_SUBEVENTS_PER_PROCEDURE: u16 = 32;

/// Shortest permitted subevent, in microseconds.
pub const CS_MIN_SUBEVENT_LEN_US: u32 = 1_250;

/// Longest permitted subevent, in microseconds.
pub const CS_MAX_SUBEVENT_LEN_US: u32 = 4_000_000;

/// Capacity of a single step buffer handed to the radio scheduler.
pub const CS_MAX_NUM_STEPS_IN_TX_BUFF: usize = 30;

/// Maximum number of antenna paths.
pub const CS_MAX_ANTENNA_PATHS: u8 = 4;

/// Identifies the owner of a CS session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionId {
    /// The session of a connection.
    Connection(ConnHandle),
    /// The CS test mode, which runs without a connection.
    Test,
}

/// Identifies the purpose of a DRBG draw.
///
/// Each transaction has its own random bit cache and transaction counter, so draws for one purpose
/// never shift the bits used for another.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionId {
    ChannelSelectionNonMode0 = 0,
    ChannelSelectionMode0 = 1,
    SubModeInsertion = 2,
    ToneSlot = 3,
    AntennaPathPermutation = 4,
    AccessAddress = 5,
    SoundingSequencePosition = 6,
    SoundingSequenceSelection = 7,
    RandomSequence = 8,
    BacktrackingResistance = 9,
}

impl TransactionId {
    /// Number of distinct transaction identifiers.
    pub const COUNT: usize = 10;

    /// Returns the transaction's raw identifier, as used in the DRBG nonce.
    pub fn raw(self) -> u8 {
        self as u8
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.raw())
    }
}

/// The mode of a CS step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepMode {
    /// Frequency offset measurement between the devices.
    Mode0,
    /// Round-trip time measurement using CS_SYNC packets.
    Mode1,
    /// Phase-based ranging using tone exchanges.
    Mode2,
    /// Combined RTT and phase-based ranging.
    Mode3,
}

impl StepMode {
    /// Converts a raw mode number.
    ///
    /// Returns `Error::InvalidStepMode` for values above 3.
    pub fn from_raw(raw: u8) -> Result<Self, Error> {
        Ok(match raw {
            0 => StepMode::Mode0,
            1 => StepMode::Mode1,
            2 => StepMode::Mode2,
            3 => StepMode::Mode3,
            _ => return Err(Error::InvalidStepMode),
        })
    }

    /// Returns the raw mode number.
    pub fn raw(self) -> u8 {
        match self {
            StepMode::Mode0 => 0,
            StepMode::Mode1 => 1,
            StepMode::Mode2 => 2,
            StepMode::Mode3 => 3,
        }
    }

    /// Whether steps of this mode exchange CS_SYNC packets.
    pub fn has_sync_packets(self) -> bool {
        self != StepMode::Mode2
    }

    /// Whether steps of this mode exchange tones over the antenna paths.
    pub fn has_tones(self) -> bool {
        self == StepMode::Mode2 || self == StepMode::Mode3
    }
}

/// The role of the local device in a CS procedure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Reflector,
}

impl Role {
    pub fn from_raw(raw: u8) -> Result<Self, Error> {
        match raw {
            0 => Ok(Role::Initiator),
            1 => Ok(Role::Reflector),
            _ => Err(Error::InvalidValue),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Role::Initiator => 0,
            Role::Reflector => 1,
        }
    }
}

/// Antenna Configuration Index: the number of antennas used by initiator and reflector.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Aci {
    /// 1 initiator antenna, 1 reflector antenna.
    A1B1,
    A2B1,
    A3B1,
    A4B1,
    A1B2,
    A1B3,
    A1B4,
    /// 2 initiator antennas, 2 reflector antennas.
    A2B2,
}

impl Aci {
    /// Converts a raw ACI value.
    ///
    /// Returns `Error::InvalidRange` for values above 7.
    pub fn from_raw(raw: u8) -> Result<Self, Error> {
        Ok(match raw {
            0 => Aci::A1B1,
            1 => Aci::A2B1,
            2 => Aci::A3B1,
            3 => Aci::A4B1,
            4 => Aci::A1B2,
            5 => Aci::A1B3,
            6 => Aci::A1B4,
            7 => Aci::A2B2,
            _ => return Err(Error::InvalidRange),
        })
    }

    pub fn raw(self) -> u8 {
        match self {
            Aci::A1B1 => 0,
            Aci::A2B1 => 1,
            Aci::A3B1 => 2,
            Aci::A4B1 => 3,
            Aci::A1B2 => 4,
            Aci::A1B3 => 5,
            Aci::A1B4 => 6,
            Aci::A2B2 => 7,
        }
    }

    /// Returns the number of antennas used by the initiator and the reflector.
    pub fn antennas(self) -> (u8, u8) {
        match self {
            Aci::A1B1 => (1, 1),
            Aci::A2B1 => (2, 1),
            Aci::A3B1 => (3, 1),
            Aci::A4B1 => (4, 1),
            Aci::A1B2 => (1, 2),
            Aci::A1B3 => (1, 3),
            Aci::A1B4 => (1, 4),
            Aci::A2B2 => (2, 2),
        }
    }

    /// Returns the number of antenna paths (`N_AP`).
    pub fn num_antenna_paths(self) -> u8 {
        let (initiator, reflector) = self.antennas();
        initiator * reflector
    }

    /// Returns the number of antennas the device in `role` switches between.
    pub fn local_antennas(self, role: Role) -> u8 {
        let (initiator, reflector) = self.antennas();
        match role {
            Role::Initiator => initiator,
            Role::Reflector => reflector,
        }
    }
}

enum_with_unknown! {
    /// Content of the CS_SYNC payload used for round-trip time measurement.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum RttType(u8) {
        AaOnly = 0,
        SoundingSequence32 = 1,
        SoundingSequence96 = 2,
        RandomSequence32 = 3,
        RandomSequence64 = 4,
        RandomSequence96 = 5,
        RandomSequence128 = 6,
    }
}

impl RttType {
    /// Returns the length of the CS_SYNC payload in bytes.
    pub fn payload_len(self) -> u8 {
        match self {
            RttType::SoundingSequence32 | RttType::RandomSequence32 => 4,
            RttType::RandomSequence64 => 8,
            RttType::SoundingSequence96 | RttType::RandomSequence96 => 12,
            RttType::RandomSequence128 => 16,
            RttType::AaOnly | RttType::Unknown(_) => 0,
        }
    }

    /// Whether the payload is a DRBG-generated random sequence.
    pub fn is_random_sequence(self) -> bool {
        match self {
            RttType::RandomSequence32
            | RttType::RandomSequence64
            | RttType::RandomSequence96
            | RttType::RandomSequence128 => true,
            _ => false,
        }
    }
}

enum_with_unknown! {
    /// PHY used for CS_SYNC packets.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum SyncPhy(u8) {
        Le1M = 1,
        Le2M = 2,
        Le2M2Bt = 3,
    }
}

enum_with_unknown! {
    /// Channel selection algorithm used for non-mode-0 steps.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ChannelSelectionAlgorithm(u8) {
        /// Algorithm #3b: shuffled channel index arrays.
        Algorithm3b = 0,
        /// Algorithm #3c: channel hopping shapes. Not supported.
        Algorithm3c = 1,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::drbg::{Drbg, AES_KNOWN_ANSWER};
    use crate::crypto::Aes128Cipher;

    /// A DRBG instantiated from the AES known-answer vectors.
    pub(crate) fn test_drbg() -> Drbg {
        let kat = &AES_KNOWN_ANSWER;
        Drbg::instantiate(&Aes128Cipher, &kat.iv, &kat.cs_in, &kat.pv).unwrap()
    }
}
