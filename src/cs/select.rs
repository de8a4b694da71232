//! Per-step selection of access addresses, tone extensions, antenna permutations, and random
//! sequences.
//!
//! All functions draw from the DRBG under their own transaction ID, so the order in which different
//! kinds of values are selected within a step does not matter for interoperability. Draws of the
//! same kind must happen in the same order on both devices.

use super::drbg::Drbg;
use super::{Aci, Role, TransactionId};
use crate::crypto::BlockCipher;
use crate::utils::Hex;
use crate::Error;

/// Largest permitted [`autocorrelation`] score of a CS access address.
///
/// [`autocorrelation`]: fn.autocorrelation.html
pub const AA_MAX_AUTOCORRELATION: u8 = 16;

/// Longest permitted run of identical bits in a CS access address.
pub const AA_MAX_RUN_LENGTH: u8 = 6;

/// Candidate draws per access address before giving up.
const AA_MAX_ATTEMPTS: u8 = 32;

/// Antenna path orders, indexed by antenna permutation index.
///
/// The first `n!` rows permute paths `0..n` and leave the remaining paths in place, so the table
/// serves every number of antenna paths.
pub const ANTENNA_PERMUTATIONS: [[u8; 4]; 24] = [
    [0, 1, 2, 3],
    [1, 0, 2, 3],
    [0, 2, 1, 3],
    [1, 2, 0, 3],
    [2, 0, 1, 3],
    [2, 1, 0, 3],
    [0, 1, 3, 2],
    [1, 0, 3, 2],
    [0, 2, 3, 1],
    [1, 2, 3, 0],
    [2, 0, 3, 1],
    [2, 1, 3, 0],
    [0, 3, 1, 2],
    [1, 3, 0, 2],
    [0, 3, 2, 1],
    [1, 3, 2, 0],
    [2, 3, 0, 1],
    [2, 3, 1, 0],
    [3, 0, 1, 2],
    [3, 1, 0, 2],
    [3, 0, 2, 1],
    [3, 1, 2, 0],
    [3, 2, 0, 1],
    [3, 2, 1, 0],
];

const FACTORIAL: [u8; 5] = [1, 1, 2, 6, 24];

/// Combines two 32-bit draws into a candidate access address.
///
/// Odd bit positions come from `si`, even bit positions from `sj`.
pub fn aa_selection_rules(si: u32, sj: u32) -> u32 {
    (si & 0xaaaa_aaaa) | (sj & 0x5555_5555)
}

/// Scores how strongly `s` correlates with itself shifted by 1 to 4 bits.
///
/// For each shift `k`, the overlapping `32 - k` bits of `s` and `s >> k` are compared, and the score
/// is the largest absolute difference between agreeing and disagreeing bits. Constant and
/// alternating patterns score high, random-looking values low.
pub fn autocorrelation(s: u32) -> u8 {
    (1..=4u32).fold(0, |best, shift| {
        let bits = 32 - shift;
        let mask = (1u32 << bits) - 1;
        let agree = (!(s ^ (s >> shift)) & mask).count_ones() as i32;
        let disagree = bits as i32 - agree;
        best.max((agree - disagree).abs() as u8)
    })
}

/// Returns the length of the longest run of identical bits in `s`.
pub fn longest_run(s: u32) -> u8 {
    let mut longest = 1;
    let mut current = 1;
    for i in 1..32 {
        if (s >> i) & 1 == (s >> (i - 1)) & 1 {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 1;
        }
    }
    longest
}

/// Returns whether `aa` is acceptable as a CS access address.
pub fn is_valid_access_address(aa: u32) -> bool {
    autocorrelation(aa) <= AA_MAX_AUTOCORRELATION && longest_run(aa) <= AA_MAX_RUN_LENGTH
}

fn draw_access_address<C: BlockCipher>(
    cipher: &C,
    drbg: &mut Drbg,
    exclude: Option<u32>,
) -> Result<u32, Error> {
    for _ in 0..AA_MAX_ATTEMPTS {
        let si = drbg.random_bits(cipher, TransactionId::AccessAddress, 32);
        let sj = drbg.random_bits(cipher, TransactionId::AccessAddress, 32);
        let aa = aa_selection_rules(si, sj);
        if is_valid_access_address(aa) && Some(aa) != exclude {
            return Ok(aa);
        }
    }
    warn!("no valid CS access address after {} attempts", AA_MAX_ATTEMPTS);
    Err(Error::Failure)
}

/// Selects the access addresses of the next step.
///
/// Returns `(aa_rx, aa_tx)` for the local device. The initiator-to-reflector address is drawn
/// first, then the reflector-to-initiator address, which is guaranteed to differ from the first.
pub fn select_access_addresses<C: BlockCipher>(
    role: Role,
    cipher: &C,
    drbg: &mut Drbg,
) -> Result<(u32, u32), Error> {
    let initiator_aa = draw_access_address(cipher, drbg, None)?;
    let reflector_aa = draw_access_address(cipher, drbg, Some(initiator_aa))?;
    trace!(
        "CS AA initiator {:?} reflector {:?}",
        Hex(initiator_aa),
        Hex(reflector_aa)
    );
    Ok(match role {
        Role::Initiator => (reflector_aa, initiator_aa),
        Role::Reflector => (initiator_aa, reflector_aa),
    })
}

/// Draws whether the next tone exchange has a tone extension slot.
pub fn tone_extension<C: BlockCipher>(cipher: &C, drbg: &mut Drbg) -> bool {
    drbg.random_bits(cipher, TransactionId::ToneSlot, 1) == 1
}

/// Draws the antenna permutation index of the next tone exchange.
///
/// The result is below `N_AP!` for the number of antenna paths of `aci`, and differs from
/// `previous` whenever more than one permutation exists.
pub fn next_antenna_permutation<C: BlockCipher>(
    aci: Aci,
    previous: Option<u8>,
    cipher: &C,
    drbg: &mut Drbg,
) -> u8 {
    let count = FACTORIAL[usize::from(aci.num_antenna_paths())];
    if count == 1 {
        return 0;
    }
    loop {
        let index = drbg.hr1(cipher, TransactionId::AntennaPathPermutation, count);
        if Some(index) != previous {
            return index;
        }
    }
}

/// Maps an antenna index through a mapping that packs 2 bits per antenna.
pub fn map_antenna_mux_index(mapping: u8, index: u8) -> u8 {
    (mapping >> (2 * (index & 0b11))) & 0b11
}

/// Reverses the byte order of both random sequence payloads.
///
/// The DRBG produces sequences LSB-first, but the last generated byte goes on air first.
///
/// Returns `Error::InvalidArgument` if the payloads differ in length.
pub fn reverse_payload(pl1: &mut [u8], pl2: &mut [u8]) -> Result<(), Error> {
    if pl1.len() != pl2.len() {
        return Err(Error::InvalidArgument);
    }
    pl1.reverse();
    pl2.reverse();
    Ok(())
}

/// Maximum CS_SYNC payload length in bytes.
pub const PAYLOAD_MAX_LEN: usize = 16;

/// A CS_SYNC payload of up to 128 bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    bytes: [u8; PAYLOAD_MAX_LEN],
    len: u8,
}

impl Payload {
    /// Creates a zero-filled payload of `len` bytes.
    ///
    /// Returns `Error::InvalidArgument` if `len` exceeds [`PAYLOAD_MAX_LEN`].
    ///
    /// [`PAYLOAD_MAX_LEN`]: constant.PAYLOAD_MAX_LEN.html
    pub fn zeroed(len: u8) -> Result<Self, Error> {
        if usize::from(len) > PAYLOAD_MAX_LEN {
            return Err(Error::InvalidArgument);
        }
        Ok(Payload {
            bytes: [0; PAYLOAD_MAX_LEN],
            len,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..usize::from(self.len)]
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Generates the random sequences of the next step.
///
/// The initiator's sequence is drawn first. Returns `(tx, rx)` for the local device.
pub fn random_sequences<C: BlockCipher>(
    role: Role,
    len: u8,
    cipher: &C,
    drbg: &mut Drbg,
) -> Result<(Payload, Payload), Error> {
    let mut initiator = Payload::zeroed(len)?;
    let mut reflector = Payload::zeroed(len)?;
    drbg.fill(cipher, TransactionId::RandomSequence, initiator.as_mut_slice());
    drbg.fill(cipher, TransactionId::RandomSequence, reflector.as_mut_slice());
    reverse_payload(initiator.as_mut_slice(), reflector.as_mut_slice())?;
    Ok(match role {
        Role::Initiator => (initiator, reflector),
        Role::Reflector => (reflector, initiator),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aes128Cipher;
    use crate::cs::testing::test_drbg;

    #[test]
    fn selection_rules() {
        assert_eq!(aa_selection_rules(0xffff_ffff, 0), 0xaaaa_aaaa);
        assert_eq!(aa_selection_rules(0, 0xffff_ffff), 0x5555_5555);
        assert_eq!(aa_selection_rules(0x1234_5678, 0x1234_5678), 0x1234_5678);
    }

    #[test]
    fn access_address_scoring() {
        assert_eq!(autocorrelation(0), 31);
        assert_eq!(autocorrelation(0xaaaa_aaaa), 31);
        assert_eq!(autocorrelation(0xf0f0_f0f0), 28);
        assert_eq!(autocorrelation(0x8e89_bed6), 3);
        assert_eq!(autocorrelation(0x1234_5678), 3);

        assert_eq!(longest_run(0), 32);
        assert_eq!(longest_run(0xaaaa_aaaa), 1);
        assert_eq!(longest_run(0x8e89_bed6), 5);
        assert_eq!(longest_run(0x0000_00ff), 24);

        assert!(is_valid_access_address(0x8e89_bed6));
        assert!(!is_valid_access_address(0xf0f0_f0f0));
        assert!(!is_valid_access_address(0x8000_0001));
    }

    #[test]
    fn access_addresses_valid_and_agreed() {
        let cipher = Aes128Cipher;
        let (mut initiator, mut reflector) = (test_drbg(), test_drbg());
        for _ in 0..64 {
            let (i_rx, i_tx) = select_access_addresses(Role::Initiator, &cipher, &mut initiator).unwrap();
            let (r_rx, r_tx) = select_access_addresses(Role::Reflector, &cipher, &mut reflector).unwrap();
            assert!(is_valid_access_address(i_rx));
            assert!(is_valid_access_address(i_tx));
            assert_ne!(i_rx, i_tx);
            assert_eq!(i_tx, r_rx);
            assert_eq!(i_rx, r_tx);
            initiator.advance_step();
            reflector.advance_step();
        }
    }

    #[test]
    fn permutation_table() {
        for n in 1..=4 {
            for row in &ANTENNA_PERMUTATIONS[..usize::from(FACTORIAL[n])] {
                let mut head = row[..n].to_vec();
                head.sort_unstable();
                assert_eq!(head, (0..n as u8).collect::<Vec<_>>());
                assert!(row[n..].iter().zip((n as u8)..).all(|(&a, b)| a == b));
            }
        }
    }

    #[test]
    fn antenna_permutation_never_repeats() {
        let cipher = Aes128Cipher;
        let mut drbg = test_drbg();
        for raw in 0..8 {
            let aci = Aci::from_raw(raw).unwrap();
            let count = FACTORIAL[usize::from(aci.num_antenna_paths())];
            let mut previous = None;
            for _ in 0..50 {
                let index = next_antenna_permutation(aci, previous, &cipher, &mut drbg);
                assert!(index < count);
                if count > 1 {
                    assert_ne!(Some(index), previous);
                }
                previous = Some(index);
            }
        }
    }

    #[test]
    fn antenna_mux_mapping() {
        // Antenna 0 -> 2, 1 -> 0, 2 -> 3, 3 -> 1
        let mapping = 0b01_11_00_10;
        assert_eq!(map_antenna_mux_index(mapping, 0), 2);
        assert_eq!(map_antenna_mux_index(mapping, 1), 0);
        assert_eq!(map_antenna_mux_index(mapping, 2), 3);
        assert_eq!(map_antenna_mux_index(mapping, 3), 1);
    }

    #[test]
    fn payload_reversal() {
        let (mut a, mut b) = ([1, 2, 3], [4, 5, 6]);
        reverse_payload(&mut a, &mut b).unwrap();
        assert_eq!((a, b), ([3, 2, 1], [6, 5, 4]));
        assert_eq!(
            reverse_payload(&mut [1, 2], &mut [3]),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn random_sequences_match_between_roles() {
        let cipher = Aes128Cipher;
        let (mut a, mut b) = (test_drbg(), test_drbg());
        let (i_tx, i_rx) = random_sequences(Role::Initiator, 12, &cipher, &mut a).unwrap();
        let (r_tx, r_rx) = random_sequences(Role::Reflector, 12, &cipher, &mut b).unwrap();
        assert_eq!(i_tx, r_rx);
        assert_eq!(i_rx, r_tx);
        assert_eq!(i_tx.len(), 12);
        assert_ne!(i_tx, i_rx);

        // The first generated byte is sent last.
        let mut c = test_drbg();
        let first = c.random_bits(&cipher, TransactionId::RandomSequence, 8) as u8;
        assert_eq!(i_tx.as_slice()[11], first);

        assert_eq!(
            random_sequences(Role::Initiator, 17, &cipher, &mut a),
            Err(Error::InvalidArgument)
        );
    }
}
