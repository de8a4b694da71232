use core::{
    fmt::{self, Write},
    ops::{Add, AddAssign},
};

/// A 1-bit data packet sequence number.
///
/// Supports wrapping addition, matching the acknowledgement scheme of the Link Layer.
#[derive(PartialEq, Eq, Copy, Clone, Default)]
pub struct SeqNum(bool);

impl SeqNum {
    pub const ZERO: Self = SeqNum(false);
    pub const ONE: Self = SeqNum(true);
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char(if self.0 { '1' } else { '0' })
    }
}

impl fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

impl Add for SeqNum {
    type Output = Self;

    #[allow(clippy::suspicious_arithmetic_impl)] // `^` is 1-bit addition
    fn add(self, rhs: Self) -> Self {
        SeqNum(self.0 ^ rhs.0)
    }
}

impl AddAssign for SeqNum {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Acknowledgement state of a connection: the local sequence numbers and flow control bits.
///
/// Packed into a single byte in handover blocks:
///
/// ```notrust
/// LSB                                   MSB
/// +----+------+----------+--------------+
/// | SN | NESN | peer MD  | (reserved)   |
/// +----+------+----------+--------------+
///  1 bit 1 bit  1 bit       5 bits
/// ```
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
pub struct SeqStat {
    /// Sequence number of the next packet to transmit.
    pub sn: SeqNum,
    /// Next expected sequence number.
    pub nesn: SeqNum,
    /// Whether the peer indicated more data in its last packet.
    pub peer_more_data: bool,
}

impl SeqStat {
    const SN: u8 = 1 << 0;
    const NESN: u8 = 1 << 1;
    const MD: u8 = 1 << 2;

    /// Decodes the packed representation, ignoring reserved bits.
    pub fn from_raw(raw: u8) -> Self {
        Self {
            sn: SeqNum(raw & Self::SN != 0),
            nesn: SeqNum(raw & Self::NESN != 0),
            peer_more_data: raw & Self::MD != 0,
        }
    }

    pub fn to_raw(&self) -> u8 {
        let mut raw = 0;
        if self.sn.0 {
            raw |= Self::SN;
        }
        if self.nesn.0 {
            raw |= Self::NESN;
        }
        if self.peer_more_data {
            raw |= Self::MD;
        }
        raw
    }
}
