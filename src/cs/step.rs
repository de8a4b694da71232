//! Step descriptors, step results, and the double-buffered step lists.
//!
//! The procedure state machine fills a free buffer while the radio scheduler works on the other
//! one. A buffer handed to the scheduler is only writable again after the scheduler returned it.

use super::select::Payload;
use super::{StepMode, CS_MAX_NUM_STEPS_IN_TX_BUFF};
use crate::Error;
use heapless::Vec;

/// Number of step buffers per session.
pub const STEP_BUFFER_COUNT: usize = 2;

/// Maximum length of the measurement data of a single step.
///
/// A mode-3 step on 4 antenna paths reports 20 bytes of RTT data and 5 tone records of 4 bytes.
pub const STEP_RESULT_MAX_LEN: usize = 40;

/// A fully parameterized step, ready for the radio.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CsStep {
    pub mode: StepMode,
    pub channel: u8,
    /// Access address of the packet received by the local device.
    pub aa_rx: u32,
    /// Access address of the packet transmitted by the local device.
    pub aa_tx: u32,
    pub tone_extension: bool,
    /// Index into the antenna permutation table.
    pub antenna_permutation: u8,
    pub payload_tx: Payload,
    pub payload_rx: Payload,
}

impl CsStep {
    /// Creates a step on `channel` without any packet or tone parameters.
    pub fn new(mode: StepMode, channel: u8) -> Self {
        Self {
            mode,
            channel,
            aa_rx: 0,
            aa_tx: 0,
            tone_extension: false,
            antenna_permutation: 0,
            payload_tx: Payload::default(),
            payload_rx: Payload::default(),
        }
    }
}

/// Measurement data of one executed step, as reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub mode: StepMode,
    pub channel: u8,
    pub data: Vec<u8, STEP_RESULT_MAX_LEN>,
}

impl StepResult {
    /// Creates a result record.
    ///
    /// Returns `Error::InvalidArgument` if `data` exceeds [`STEP_RESULT_MAX_LEN`].
    ///
    /// [`STEP_RESULT_MAX_LEN`]: constant.STEP_RESULT_MAX_LEN.html
    pub fn new(mode: StepMode, channel: u8, data: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            mode,
            channel,
            data: Vec::from_slice(data).map_err(|_| Error::InvalidArgument)?,
        })
    }
}

/// Identifies one of the step buffers of a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufferId(u8);

impl BufferId {
    /// Creates a buffer ID from its raw index.
    ///
    /// Returns `Error::InvalidArgument` if the index is out of range.
    pub fn new(raw: u8) -> Result<Self, Error> {
        if usize::from(raw) < STEP_BUFFER_COUNT {
            Ok(BufferId(raw))
        } else {
            Err(Error::InvalidArgument)
        }
    }

    pub fn raw(&self) -> u8 {
        self.0
    }

    fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Ownership state of a step buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferState {
    /// Available for filling.
    Free,
    /// Holds steps not yet handed to the scheduler.
    Filled,
    /// Owned by the radio scheduler.
    InFlight,
}

/// A list of steps handed to the scheduler as a unit.
pub type StepList = Vec<CsStep, CS_MAX_NUM_STEPS_IN_TX_BUFF>;

#[derive(Debug)]
struct StepBuffer {
    steps: StepList,
    state: BufferState,
    /// Buffers are submitted in the order they were filled.
    sequence: u32,
}

/// The pair of step buffers of a session.
#[derive(Debug)]
pub struct StepBuffers {
    buffers: [StepBuffer; STEP_BUFFER_COUNT],
    next_sequence: u32,
}

impl StepBuffers {
    pub fn new() -> Self {
        let empty = || StepBuffer {
            steps: Vec::new(),
            state: BufferState::Free,
            sequence: 0,
        };
        Self {
            buffers: [empty(), empty()],
            next_sequence: 0,
        }
    }

    /// Returns the state of buffer `id`.
    pub fn state(&self, id: BufferId) -> BufferState {
        self.buffers[id.index()].state
    }

    /// Returns the steps stored in buffer `id`.
    pub fn steps(&self, id: BufferId) -> &[CsStep] {
        &self.buffers[id.index()].steps
    }

    /// Returns a free buffer, emptied and ready to be filled.
    pub fn acquire(&mut self) -> Option<(BufferId, &mut StepList)> {
        let index = self
            .buffers
            .iter()
            .position(|buf| buf.state == BufferState::Free)?;
        let buffer = &mut self.buffers[index];
        buffer.steps.clear();
        Some((BufferId(index as u8), &mut buffer.steps))
    }

    /// Marks buffer `id` as filled with steps.
    ///
    /// Returns `Error::CommandDisallowed` if the buffer is not free, and `Error::InvalidArgument`
    /// if it holds no steps.
    pub fn mark_filled(&mut self, id: BufferId) -> Result<(), Error> {
        let sequence = self.next_sequence;
        let buffer = &mut self.buffers[id.index()];
        if buffer.state != BufferState::Free {
            return Err(Error::CommandDisallowed);
        }
        if buffer.steps.is_empty() {
            return Err(Error::InvalidArgument);
        }
        buffer.state = BufferState::Filled;
        buffer.sequence = sequence;
        self.next_sequence = sequence.wrapping_add(1);
        Ok(())
    }

    /// Returns the filled buffer that was filled first, if any.
    pub fn next_filled(&self) -> Option<BufferId> {
        self.buffers
            .iter()
            .enumerate()
            .filter(|(_, buf)| buf.state == BufferState::Filled)
            .min_by_key(|(_, buf)| buf.sequence)
            .map(|(index, _)| BufferId(index as u8))
    }

    /// Hands buffer `id` to the scheduler and returns its steps.
    ///
    /// Returns `Error::CommandDisallowed` if the buffer is not filled.
    pub fn submit(&mut self, id: BufferId) -> Result<&[CsStep], Error> {
        let buffer = &mut self.buffers[id.index()];
        if buffer.state != BufferState::Filled {
            return Err(Error::CommandDisallowed);
        }
        buffer.state = BufferState::InFlight;
        Ok(&buffer.steps)
    }

    /// Takes buffer `id` back from the scheduler.
    ///
    /// Returns `Error::CommandDisallowed` if the buffer was not in flight.
    pub fn release(&mut self, id: BufferId) -> Result<(), Error> {
        let buffer = &mut self.buffers[id.index()];
        if buffer.state != BufferState::InFlight {
            return Err(Error::CommandDisallowed);
        }
        buffer.state = BufferState::Free;
        buffer.steps.clear();
        Ok(())
    }

    /// Frees the buffers the scheduler does not hold.
    ///
    /// In-flight buffers stay untouched until they are returned through `release`.
    pub fn release_idle(&mut self) {
        for buffer in &mut self.buffers {
            if buffer.state != BufferState::InFlight {
                buffer.state = BufferState::Free;
                buffer.steps.clear();
            }
        }
    }

    /// Frees all buffers, regardless of their state.
    ///
    /// Only valid once the scheduler has dropped the buffers it holds.
    pub fn release_all(&mut self) {
        for buffer in &mut self.buffers {
            buffer.state = BufferState::Free;
            buffer.steps.clear();
        }
    }

    /// Whether any buffer is filled or in flight.
    pub fn is_busy(&self) -> bool {
        self.buffers.iter().any(|buf| buf.state != BufferState::Free)
    }

    /// Whether any buffer is owned by the scheduler.
    pub fn has_in_flight(&self) -> bool {
        self.buffers
            .iter()
            .any(|buf| buf.state == BufferState::InFlight)
    }
}

impl Default for StepBuffers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buffers: &mut StepBuffers, channel: u8) -> BufferId {
        let (id, steps) = buffers.acquire().unwrap();
        steps.push(CsStep::new(StepMode::Mode0, channel)).unwrap();
        buffers.mark_filled(id).unwrap();
        id
    }

    #[test]
    fn buffer_lifecycle() {
        let mut buffers = StepBuffers::new();
        assert!(!buffers.is_busy());

        let first = fill(&mut buffers, 2);
        let second = fill(&mut buffers, 3);
        assert_ne!(first, second);
        assert!(buffers.acquire().is_none());

        assert_eq!(buffers.next_filled(), Some(first));
        assert_eq!(buffers.submit(first).unwrap()[0].channel, 2);
        assert_eq!(buffers.state(first), BufferState::InFlight);
        assert_eq!(buffers.next_filled(), Some(second));

        // In-flight buffers stay untouched until returned.
        assert_eq!(buffers.mark_filled(first), Err(Error::CommandDisallowed));
        assert_eq!(buffers.submit(first).unwrap_err(), Error::CommandDisallowed);
        assert_eq!(buffers.steps(first)[0].channel, 2);

        buffers.release(first).unwrap();
        assert_eq!(buffers.release(first), Err(Error::CommandDisallowed));
        let (again, _) = buffers.acquire().unwrap();
        assert_eq!(again, first);
        assert!(buffers.is_busy());
        assert!(!buffers.has_in_flight());
    }

    #[test]
    fn submission_follows_fill_order() {
        let mut buffers = StepBuffers::new();
        let a = fill(&mut buffers, 2);
        let b = fill(&mut buffers, 3);
        buffers.submit(a).unwrap();
        buffers.release(a).unwrap();
        let c = fill(&mut buffers, 4);
        assert_eq!(c, a);
        assert_eq!(buffers.next_filled(), Some(b));
    }

    #[test]
    fn idle_release_keeps_in_flight() {
        let mut buffers = StepBuffers::new();
        let a = fill(&mut buffers, 2);
        let b = fill(&mut buffers, 3);
        buffers.submit(a).unwrap();

        buffers.release_idle();
        assert_eq!(buffers.state(a), BufferState::InFlight);
        assert_eq!(buffers.steps(a)[0].channel, 2);
        assert_eq!(buffers.state(b), BufferState::Free);
        assert!(buffers.has_in_flight());

        // Only the free buffer can be refilled.
        let c = fill(&mut buffers, 4);
        assert_eq!(c, b);
        assert!(buffers.acquire().is_none());
        buffers.release(a).unwrap();
        assert!(!buffers.has_in_flight());
    }

    #[test]
    fn empty_buffers_cannot_be_filled() {
        let mut buffers = StepBuffers::new();
        let (id, _) = buffers.acquire().unwrap();
        assert_eq!(buffers.mark_filled(id), Err(Error::InvalidArgument));
        buffers.release_all();
        assert!(!buffers.is_busy());
    }

    #[test]
    fn ids_and_results() {
        assert!(BufferId::new(1).is_ok());
        assert_eq!(BufferId::new(2), Err(Error::InvalidArgument));
        assert!(StepResult::new(StepMode::Mode2, 10, &[0; STEP_RESULT_MAX_LEN]).is_ok());
        assert_eq!(
            StepResult::new(StepMode::Mode2, 10, &[0; STEP_RESULT_MAX_LEN + 1]),
            Err(Error::InvalidArgument)
        );
    }
}
