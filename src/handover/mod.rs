//! Connection handover: moving a live connection to another controller.
//!
//! The serving controller captures the connection in a *snapshot*, a flat buffer made of three
//! size-prefixed blocks:
//!
//! ```notrust
//! +------+-------------------+------+-------------+------+-------------------------------------+
//! | size | ConnectionRecord  | size | CS session  | size | #ch | #psm | channels  | PSMs       |
//! | (4B) | (fixed size)      | (4B) | (0 = none)  | (4B) | (2B)| (2B) | 16B each  | 12B each   |
//! +------+-------------------+------+-------------+------+-------------------------------------+
//! ```
//!
//! All sizes are little endian. The candidate controller parses the whole snapshot into a
//! [`Snapshot`] before registering anything, so malformed input never leaves partial state behind.
//!
//! [`Snapshot`]: struct.Snapshot.html

use crate::bytes::*;
use crate::cs::procedure::CsSession;
use crate::cs::SessionId;
use crate::l2cap::{ChannelRecord, Multiplexer, Psm, PsmRecord};
use crate::link::{ConnHandle, ConnectionRecord};
use crate::time::Duration;
use crate::Error;
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

/// Size of the header in front of every snapshot block.
pub const BLOCK_HEADER_SIZE: usize = 4;

/// Size of the channel and PSM counts in front of the multiplexing records.
pub const MUX_HEADER_SIZE: usize = 4;

/// Maximum number of channels a snapshot may carry.
pub const MAX_SNAPSHOT_CHANNELS: usize = 16;

/// Maximum number of PSMs a snapshot may carry.
pub const MAX_SNAPSHOT_PSMS: usize = 8;

/// Parameters of the candidate controller that apply to an incoming snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct CandidateParams {
    /// Time elapsed between taking the snapshot and applying it.
    ///
    /// The connection's timing is moved forward by this much.
    pub time_delta: Duration,
}

/// Returns the exact size of the snapshot of a connection.
pub fn snapshot_size<M: Multiplexer + ?Sized>(
    record: &ConnectionRecord,
    cs: &CsSession,
    mux: &M,
) -> usize {
    let conn = record.handle;
    BLOCK_HEADER_SIZE
        + ConnectionRecord::SIZE
        + BLOCK_HEADER_SIZE
        + cs.snapshot_size()
        + BLOCK_HEADER_SIZE
        + MUX_HEADER_SIZE
        + mux.channel_count(conn) * ChannelRecord::SIZE
        + mux.psm_count(conn) * PsmRecord::SIZE
}

/// Writes a block behind a size header, filling in the header afterwards.
fn write_block<F>(writer: &mut ByteWriter<'_>, f: F) -> Result<(), Error>
where
    F: FnOnce(&mut ByteWriter<'_>) -> Result<(), Error>,
{
    let mut header = writer.split_off(BLOCK_HEADER_SIZE)?;
    let start = writer.space_left();
    f(writer)?;
    header.write_u32_le((start - writer.space_left()) as u32)
}

/// Writes the snapshot of a connection to `buf`.
///
/// Returns the number of bytes written, which is equal to what [`snapshot_size`] returns for the
/// same state. Fails with `Error::InsufficientMemory` if `buf` is too small.
///
/// [`snapshot_size`]: fn.snapshot_size.html
pub fn write_snapshot<M: Multiplexer + ?Sized>(
    record: &ConnectionRecord,
    cs: &CsSession,
    mux: &M,
    buf: &mut [u8],
) -> Result<usize, Error> {
    let size = snapshot_size(record, cs, mux);
    if buf.len() < size {
        return Err(Error::InsufficientMemory);
    }

    let conn = record.handle;
    let mut writer = ByteWriter::new(&mut buf[..size]);
    write_block(&mut writer, |w| record.to_bytes(w))?;
    write_block(&mut writer, |w| cs.to_bytes(w))?;
    write_block(&mut writer, |w| {
        let channels = mux.channel_count(conn);
        let psms = mux.psm_count(conn);
        w.write_u16_le(channels as u16)?;
        w.write_u16_le(psms as u16)?;
        for index in 0..channels {
            mux.channel(conn, index).ok_or(Error::Failure)?.to_bytes(w)?;
        }
        for index in 0..psms {
            mux.psm(conn, index).ok_or(Error::Failure)?.to_bytes(w)?;
        }
        Ok(())
    })?;

    if writer.space_left() != 0 {
        // The multiplexer changed its mind between sizing and writing.
        return Err(Error::Failure);
    }
    Ok(size)
}

/// Skips over a size-prefixed block and returns the data behind it.
///
/// Returns `None` if the block is absent (declares a size of 0) or extends past the end of `buf`.
pub fn advance_past_block(buf: &[u8]) -> Option<&[u8]> {
    if buf.len() < BLOCK_HEADER_SIZE {
        return None;
    }
    let size = LittleEndian::read_u32(&buf[..BLOCK_HEADER_SIZE]) as usize;
    if size == 0 {
        return None;
    }
    buf.get(BLOCK_HEADER_SIZE.checked_add(size)?..)
}

/// A fully parsed snapshot that has not been applied yet.
#[derive(Debug)]
pub struct Snapshot {
    pub record: ConnectionRecord,
    pub cs: CsSession,
    pub channels: Vec<ChannelRecord, MAX_SNAPSHOT_CHANNELS>,
    pub psms: Vec<PsmRecord, MAX_SNAPSHOT_PSMS>,
}

fn read_block<'a>(bytes: &mut ByteReader<'a>) -> Result<ByteReader<'a>, Error> {
    let size = bytes.read_u32_le()? as usize;
    bytes.split_off(size)
}

fn expect_consumed(block: &ByteReader<'_>) -> Result<(), Error> {
    if block.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidMemorySize)
    }
}

impl Snapshot {
    /// Parses a snapshot for the connection `handle` on this controller.
    ///
    /// The handle stored in the snapshot is replaced by `handle`. Truncated blocks and blocks
    /// whose declared size does not match their contents fail with `Error::InvalidMemorySize`,
    /// invalid field values and counts with `Error::InvalidRange`, and data behind the last block
    /// with `Error::Failure`.
    pub fn parse(handle: ConnHandle, buf: &[u8]) -> Result<Self, Error> {
        Self::parse_blocks(handle, buf).map_err(|e| match e {
            Error::Eof => Error::InvalidMemorySize,
            Error::InvalidValue => Error::InvalidRange,
            e => e,
        })
    }

    fn parse_blocks(handle: ConnHandle, buf: &[u8]) -> Result<Self, Error> {
        let mut bytes = ByteReader::new(buf);

        let mut block = read_block(&mut bytes)?;
        if block.bytes_left() != ConnectionRecord::SIZE {
            return Err(Error::InvalidMemorySize);
        }
        let mut record = ConnectionRecord::from_bytes(&mut block)?;
        record.handle = handle;

        let mut block = read_block(&mut bytes)?;
        let id = SessionId::Connection(handle);
        let cs = if block.is_empty() {
            CsSession::new(id)
        } else {
            CsSession::read_snapshot(id, &mut block)?
        };
        expect_consumed(&block)?;

        let mut block = read_block(&mut bytes)?;
        let (channels, psms) = read_mux_block(&mut block)?;
        expect_consumed(&block)?;

        if !bytes.is_empty() {
            return Err(Error::Failure);
        }
        Ok(Snapshot {
            record,
            cs,
            channels,
            psms,
        })
    }

    /// Registers the snapshot's PSMs and channels with `mux`, for the connection of the snapshot.
    ///
    /// A PSM that is already registered locally with the same parameters is reused. If the local
    /// registration differs, the PSM is registered under a newly allocated dynamic PSM instead.
    ///
    /// Either everything is registered, or nothing is: on failure, all registrations made so far
    /// are undone and `Error::AllocationError` is returned. On success, the returned
    /// [`Registration`] can still undo them.
    ///
    /// [`Registration`]: struct.Registration.html
    pub fn register_channels<M: Multiplexer + ?Sized>(
        &self,
        mux: &mut M,
    ) -> Result<Registration, Error> {
        let mut registration = Registration {
            conn: self.record.handle,
            psms: Vec::new(),
        };
        if let Err(e) = self.try_register(mux, &mut registration.psms) {
            warn!("handover: registering channels of {:?} failed: {}", registration.conn, e);
            registration.undo(mux);
            return Err(Error::AllocationError);
        }
        Ok(registration)
    }

    fn try_register<M: Multiplexer + ?Sized>(
        &self,
        mux: &mut M,
        registered: &mut Vec<Psm, MAX_SNAPSHOT_PSMS>,
    ) -> Result<(), Error> {
        let conn = self.record.handle;
        let mut local = Vec::<(u8, Psm), MAX_SNAPSHOT_PSMS>::new();

        for record in &self.psms {
            let psm = match mux.lookup_psm(record.psm) {
                Some(existing) if existing.same_parameters(record) => record.psm,
                Some(_) => {
                    let psm = mux.allocate_psm().ok_or(Error::AllocationError)?;
                    debug!("handover: {:?} collides, remapped to {:?}", record.psm, psm);
                    mux.register_psm(&PsmRecord { psm, ..*record })?;
                    registered.push(psm).map_err(|_| Error::AllocationError)?;
                    psm
                }
                None => {
                    mux.register_psm(record)?;
                    registered
                        .push(record.psm)
                        .map_err(|_| Error::AllocationError)?;
                    record.psm
                }
            };
            local
                .push((record.psm_index, psm))
                .map_err(|_| Error::AllocationError)?;
        }

        for channel in &self.channels {
            let psm = local
                .iter()
                .find(|(index, _)| *index == channel.psm_index)
                .map(|&(_, psm)| psm)
                .ok_or(Error::InvalidRange)?;
            mux.register_channel(conn, psm, channel)?;
        }
        Ok(())
    }
}

/// What [`Snapshot::register_channels`] added to a multiplexer.
///
/// [`Snapshot::register_channels`]: struct.Snapshot.html#method.register_channels
#[derive(Debug, PartialEq, Eq)]
pub struct Registration {
    conn: ConnHandle,
    /// PSMs registered by the snapshot. Reused local PSMs are not listed.
    psms: Vec<Psm, MAX_SNAPSHOT_PSMS>,
}

impl Registration {
    /// Removes the connection's channels and the PSMs registered for it.
    pub fn undo<M: Multiplexer + ?Sized>(self, mux: &mut M) {
        mux.remove_channels(self.conn);
        for &psm in &self.psms {
            mux.unregister_psm(psm);
        }
    }
}

type MuxRecords = (
    Vec<ChannelRecord, MAX_SNAPSHOT_CHANNELS>,
    Vec<PsmRecord, MAX_SNAPSHOT_PSMS>,
);

fn read_mux_block(bytes: &mut ByteReader<'_>) -> Result<MuxRecords, Error> {
    let num_channels = usize::from(bytes.read_u16_le()?);
    let num_psms = usize::from(bytes.read_u16_le()?);
    if num_channels > MAX_SNAPSHOT_CHANNELS || num_psms > MAX_SNAPSHOT_PSMS {
        return Err(Error::InvalidRange);
    }

    let mut channels = Vec::new();
    for _ in 0..num_channels {
        let channel = ChannelRecord::from_bytes(bytes)?;
        if channels.iter().any(|c: &ChannelRecord| c.cid == channel.cid) {
            return Err(Error::InvalidRange);
        }
        channels.push(channel).map_err(|_| Error::InvalidRange)?;
    }
    let mut psms = Vec::new();
    for _ in 0..num_psms {
        let psm = PsmRecord::from_bytes(bytes)?;
        if psms
            .iter()
            .any(|p: &PsmRecord| p.psm_index == psm.psm_index || p.psm == psm.psm)
        {
            return Err(Error::InvalidRange);
        }
        psms.push(psm).map_err(|_| Error::InvalidRange)?;
    }

    let dangling = channels
        .iter()
        .any(|c| !psms.iter().any(|p| p.psm_index == c.psm_index));
    if dangling {
        return Err(Error::InvalidRange);
    }
    Ok((channels, psms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2cap::tests::{channel_record, psm_record};
    use crate::l2cap::ChannelTable;
    use crate::link::testing::record;

    type Table = ChannelTable<8, 4>;

    fn serving_table(conn: ConnHandle) -> Table {
        let mut table = Table::new();
        table.register_psm(&psm_record(0x0080)).unwrap();
        table.register_psm(&psm_record(0x0025)).unwrap();
        table
            .register_channel(conn, Psm::from_raw(0x0080), &channel_record(0x0040))
            .unwrap();
        table
            .register_channel(conn, Psm::from_raw(0x0025), &channel_record(0x0042))
            .unwrap();
        table
    }

    fn snapshot(handle: u16) -> std::vec::Vec<u8> {
        let rec = record(handle);
        let cs = CsSession::new(SessionId::Connection(rec.handle));
        let table = serving_table(rec.handle);
        let size = snapshot_size(&rec, &cs, &table);
        let mut buf = vec![0; size + 3];
        assert_eq!(write_snapshot(&rec, &cs, &table, &mut buf), Ok(size));
        buf.truncate(size);
        buf
    }

    #[test]
    fn size_matches_written() {
        let rec = record(5);
        let cs = CsSession::new(SessionId::Connection(rec.handle));
        let table = serving_table(rec.handle);
        let size = snapshot_size(&rec, &cs, &table);
        assert_eq!(
            size,
            4 + ConnectionRecord::SIZE + 4 + cs.snapshot_size() + 4 + 4 + 2 * 16 + 2 * 12
        );

        let mut small = vec![0; size - 1];
        assert_eq!(
            write_snapshot(&rec, &cs, &table, &mut small),
            Err(Error::InsufficientMemory)
        );
    }

    #[test]
    fn block_navigation() {
        let buf = snapshot(5);
        let cs = advance_past_block(&buf).unwrap();
        assert_eq!(buf.len() - cs.len(), 4 + ConnectionRecord::SIZE);
        let mux = advance_past_block(cs).unwrap();
        assert_eq!(LittleEndian::read_u16(&mux[4..]), 2);
        assert_eq!(advance_past_block(mux), Some(&[][..]));

        assert_eq!(advance_past_block(&[0, 0, 0, 0, 1]), None);
        assert_eq!(advance_past_block(&[5, 0, 0, 0, 1]), None);
        assert_eq!(advance_past_block(&[0, 0]), None);
    }

    #[test]
    fn parse_and_register() {
        let buf = snapshot(5);
        let snapshot = Snapshot::parse(ConnHandle::new(9), &buf).unwrap();
        assert_eq!(snapshot.record.handle, ConnHandle::new(9));
        assert_eq!(snapshot.channels.len(), 2);

        // 0x0025 exists locally with other parameters, 0x0080 with the same ones.
        let mut candidate = Table::new();
        let mut other = psm_record(0x0025);
        other.mtu = 100;
        candidate.register_psm(&other).unwrap();
        candidate.register_psm(&psm_record(0x0080)).unwrap();

        snapshot.register_channels(&mut candidate).unwrap();
        let conn = ConnHandle::new(9);
        assert_eq!(candidate.channel_count(conn), 2);
        assert_eq!(candidate.total_psms(), 3);
        let remapped = candidate.lookup_psm(Psm::from_raw(0x0081)).unwrap();
        assert!(remapped.same_parameters(&psm_record(0x0025)));
    }

    #[test]
    fn failed_registration_rolls_back() {
        let buf = snapshot(5);
        let snapshot = Snapshot::parse(ConnHandle::new(9), &buf).unwrap();

        // Room for the PSMs, but only one channel.
        let mut candidate = ChannelTable::<1, 4>::new();
        assert_eq!(
            snapshot.register_channels(&mut candidate),
            Err(Error::AllocationError)
        );
        assert_eq!(candidate.total_channels(), 0);
        assert_eq!(candidate.total_psms(), 0);
    }

    #[test]
    fn undo_keeps_reused_psms() {
        let buf = snapshot(5);
        let snapshot = Snapshot::parse(ConnHandle::new(9), &buf).unwrap();

        let mut candidate = Table::new();
        let mut other = psm_record(0x0025);
        other.mtu = 100;
        candidate.register_psm(&other).unwrap();
        candidate.register_psm(&psm_record(0x0080)).unwrap();
        candidate
            .register_channel(ConnHandle::new(3), Psm::from_raw(0x0080), &channel_record(0x0050))
            .unwrap();

        let registration = snapshot.register_channels(&mut candidate).unwrap();
        assert_eq!(candidate.total_psms(), 3);
        registration.undo(&mut candidate);

        assert_eq!(candidate.channel_count(ConnHandle::new(9)), 0);
        assert_eq!(candidate.channel_count(ConnHandle::new(3)), 1);
        assert_eq!(candidate.total_psms(), 2);
        assert!(candidate.lookup_psm(Psm::from_raw(0x0081)).is_none());
        assert_eq!(candidate.lookup_psm(Psm::from_raw(0x0025)), Some(other));
        assert!(candidate.lookup_psm(Psm::from_raw(0x0080)).is_some());
    }

    #[test]
    fn malformed_input() {
        let buf = snapshot(5);
        let conn = ConnHandle::new(9);

        let mut trailing = buf.clone();
        trailing.push(0);
        assert_eq!(Snapshot::parse(conn, &trailing).unwrap_err(), Error::Failure);

        // Record block declaring the wrong size
        let mut bad = buf.clone();
        bad[0] -= 1;
        assert_eq!(Snapshot::parse(conn, &bad).unwrap_err(), Error::InvalidMemorySize);

        // Channel count beyond what a snapshot may carry
        let mux = buf.len() - (4 + 2 * 16 + 2 * 12);
        let mut bad = buf.clone();
        bad[mux] = MAX_SNAPSHOT_CHANNELS as u8 + 1;
        assert_eq!(Snapshot::parse(conn, &bad).unwrap_err(), Error::InvalidRange);

        for len in 0..buf.len() {
            assert!(
                Snapshot::parse(conn, &buf[..len]).is_err(),
                "parsed snapshot truncated to {} bytes",
                len
            );
        }
    }
}
