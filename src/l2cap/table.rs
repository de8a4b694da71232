use super::{ChannelRecord, Multiplexer, Psm, PsmRecord};
use crate::link::ConnHandle;
use crate::Error;

#[derive(Debug, Copy, Clone)]
struct Entry {
    conn: ConnHandle,
    psm_slot: usize,
    record: ChannelRecord,
}

/// A fixed-capacity channel and PSM registry.
///
/// Holds up to `CHANNELS` channels (over all connections) and `PSMS` registered PSMs. The PSM
/// index reported for a PSM is its slot in the table. A PSM admits at most `max_channels`
/// channels, counted over all connections.
#[derive(Debug)]
pub struct ChannelTable<const CHANNELS: usize, const PSMS: usize> {
    psms: [Option<PsmRecord>; PSMS],
    channels: [Option<Entry>; CHANNELS],
}

impl<const CHANNELS: usize, const PSMS: usize> ChannelTable<CHANNELS, PSMS> {
    pub fn new() -> Self {
        Self {
            psms: [None; PSMS],
            channels: [None; CHANNELS],
        }
    }

    /// Returns the number of channels open on all connections.
    pub fn total_channels(&self) -> usize {
        self.channels.iter().flatten().count()
    }

    /// Returns the number of registered PSMs.
    pub fn total_psms(&self) -> usize {
        self.psms.iter().flatten().count()
    }

    fn psm_slot(&self, psm: Psm) -> Option<usize> {
        self.psms
            .iter()
            .position(|slot| matches!(slot, Some(rec) if rec.psm == psm))
    }

    fn entries(&self, conn: ConnHandle) -> impl Iterator<Item = &Entry> + '_ {
        self.channels
            .iter()
            .flatten()
            .filter(move |entry| entry.conn == conn)
    }

    /// PSM slots referenced by the channels of `conn`, in slot order.
    fn used_slots(&self, conn: ConnHandle) -> impl Iterator<Item = usize> + '_ {
        (0..PSMS).filter(move |&slot| self.entries(conn).any(|entry| entry.psm_slot == slot))
    }

    fn slot_record(&self, slot: usize) -> Option<PsmRecord> {
        let mut record = self.psms.get(slot).copied().flatten()?;
        record.psm_index = slot as u8;
        Some(record)
    }
}

impl<const CHANNELS: usize, const PSMS: usize> Default for ChannelTable<CHANNELS, PSMS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CHANNELS: usize, const PSMS: usize> Multiplexer for ChannelTable<CHANNELS, PSMS> {
    fn channel_count(&self, conn: ConnHandle) -> usize {
        self.entries(conn).count()
    }

    fn channel(&self, conn: ConnHandle, index: usize) -> Option<ChannelRecord> {
        self.entries(conn).nth(index).map(|entry| ChannelRecord {
            psm_index: entry.psm_slot as u8,
            ..entry.record
        })
    }

    fn psm_count(&self, conn: ConnHandle) -> usize {
        self.used_slots(conn).count()
    }

    fn psm(&self, conn: ConnHandle, index: usize) -> Option<PsmRecord> {
        let slot = self.used_slots(conn).nth(index)?;
        self.slot_record(slot)
    }

    fn lookup_psm(&self, psm: Psm) -> Option<PsmRecord> {
        self.slot_record(self.psm_slot(psm)?)
    }

    fn allocate_psm(&self) -> Option<Psm> {
        (Psm::DYNAMIC_START..=Psm::MAX)
            .map(Psm::from_raw)
            .find(|&psm| self.psm_slot(psm).is_none())
    }

    fn register_psm(&mut self, record: &PsmRecord) -> Result<(), Error> {
        if !record.psm.is_valid() {
            return Err(Error::InvalidArgument);
        }
        if self.psm_slot(record.psm).is_some() {
            return Err(Error::AllocationError);
        }
        let slot = self
            .psms
            .iter()
            .position(Option::is_none)
            .ok_or(Error::AllocationError)?;
        self.psms[slot] = Some(*record);
        Ok(())
    }

    fn unregister_psm(&mut self, psm: Psm) {
        if let Some(slot) = self.psm_slot(psm) {
            self.psms[slot] = None;
            for entry in &mut self.channels {
                if matches!(entry, Some(e) if e.psm_slot == slot) {
                    *entry = None;
                }
            }
        }
    }

    fn register_channel(
        &mut self,
        conn: ConnHandle,
        psm: Psm,
        record: &ChannelRecord,
    ) -> Result<(), Error> {
        let psm_slot = self.psm_slot(psm).ok_or(Error::InvalidArgument)?;
        let max_channels = self.psms[psm_slot].map_or(0, |rec| usize::from(rec.max_channels));

        if self.entries(conn).any(|entry| entry.record.cid == record.cid) {
            return Err(Error::AllocationError);
        }
        if self
            .channels
            .iter()
            .flatten()
            .filter(|entry| entry.psm_slot == psm_slot)
            .count()
            >= max_channels
        {
            return Err(Error::AllocationError);
        }

        let free = self
            .channels
            .iter_mut()
            .find(|entry| entry.is_none())
            .ok_or(Error::AllocationError)?;
        *free = Some(Entry {
            conn,
            psm_slot,
            record: *record,
        });
        Ok(())
    }

    fn remove_channels(&mut self, conn: ConnHandle) {
        for entry in &mut self.channels {
            if matches!(entry, Some(e) if e.conn == conn) {
                *entry = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2cap::tests::{channel_record, psm_record};
    use crate::l2cap::Channel;

    const A: ConnHandle = ConnHandle::new(1);
    const B: ConnHandle = ConnHandle::new(2);

    #[test]
    fn enumerates_per_connection() {
        let mut table = ChannelTable::<4, 3>::new();
        table.register_psm(&psm_record(0x0025)).unwrap();
        table.register_psm(&psm_record(0x0080)).unwrap();
        table
            .register_channel(A, Psm::from_raw(0x0080), &channel_record(0x0040))
            .unwrap();
        table
            .register_channel(B, Psm::from_raw(0x0025), &channel_record(0x0040))
            .unwrap();
        table
            .register_channel(A, Psm::from_raw(0x0025), &channel_record(0x0041))
            .unwrap();

        assert_eq!(table.channel_count(A), 2);
        assert_eq!(table.psm_count(A), 2);
        assert_eq!(table.psm_count(B), 1);

        // The channel's PSM index points at the matching PSM record.
        let ch = table.channel(A, 0).unwrap();
        let psm = (0..table.psm_count(A))
            .filter_map(|i| table.psm(A, i))
            .find(|rec| rec.psm_index == ch.psm_index)
            .unwrap();
        assert_eq!(psm.psm, Psm::from_raw(0x0080));
        assert!(table.channel(A, 2).is_none());

        table.remove_channels(A);
        assert_eq!(table.channel_count(A), 0);
        assert_eq!(table.total_channels(), 1);
        assert_eq!(table.total_psms(), 2);
    }

    #[test]
    fn registration_limits() {
        let mut table = ChannelTable::<2, 1>::new();
        let psm = Psm::from_raw(0x0080);
        table.register_psm(&psm_record(0x0080)).unwrap();
        assert_eq!(
            table.register_psm(&psm_record(0x0080)),
            Err(Error::AllocationError)
        );
        assert_eq!(
            table.register_psm(&psm_record(0x0081)),
            Err(Error::AllocationError)
        );
        assert_eq!(table.allocate_psm(), Some(Psm::from_raw(0x0081)));

        table.register_channel(A, psm, &channel_record(0x0040)).unwrap();
        assert_eq!(
            table.register_channel(A, psm, &channel_record(0x0040)),
            Err(Error::AllocationError)
        );
        assert_eq!(
            table.register_channel(A, Psm::from_raw(0x0001), &channel_record(0x0042)),
            Err(Error::InvalidArgument)
        );
        table.register_channel(A, psm, &channel_record(0x0041)).unwrap();
        // `max_channels` is 2
        assert_eq!(
            table.register_channel(B, psm, &channel_record(0x0040)),
            Err(Error::AllocationError)
        );

        table.unregister_psm(psm);
        assert_eq!(table.total_channels(), 0);
        assert!(table.lookup_psm(psm).is_none());
        assert_eq!(table.channel(A, 0).map(|c| c.cid), None::<Channel>);
    }
}
