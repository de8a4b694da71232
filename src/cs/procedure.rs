//! The CS procedure state machine.
//!
//! A [`CsSession`] drives procedures of one connection (or of the test mode) through
//!
//! ```notrust
//! Idle -> ProcedureInit -> SubeventInit -> StepBuild -> AwaitingResult
//!                               ^                            |
//!                               +----------------------------+--> ProcedureComplete / Disabled
//! ```
//!
//! Steps are built into the two step buffers ahead of time and handed to the [`RadioScheduler`],
//! which reports back through [`CsSession::on_buffer_consumed`] and
//! [`CsSession::on_step_results`]. When a procedure completes and another one is due, the next
//! procedure is prepared without filling any buffers; it is launched by the next call to
//! [`CsSession::start_procedure`].
//!
//! [`CsSession`]: struct.CsSession.html
//! [`RadioScheduler`]: trait.RadioScheduler.html
//! [`CsSession::on_buffer_consumed`]: struct.CsSession.html#method.on_buffer_consumed
//! [`CsSession::on_step_results`]: struct.CsSession.html#method.on_step_results
//! [`CsSession::start_procedure`]: struct.CsSession.html#method.start_procedure

use super::channel::ChannelSelection;
use super::config::{CsConfig, ProcedureParams};
use super::drbg::Drbg;
use super::report::{report_results, CsEvent, DoneStatus, Host, ResultHeader};
use super::select::{
    next_antenna_permutation, random_sequences, select_access_addresses, tone_extension,
    ANTENNA_PERMUTATIONS,
};
use super::step::{BufferId, BufferState, CsStep, StepBuffers, StepResult};
use super::timing::{antenna_switch_time, num_steps_per_subevent, T_SW_OPTIONS};
use super::{
    SessionId, StepMode, TransactionId, CS_MAX_NUM_STEPS_IN_TX_BUFF, CS_MAX_STEPS_PER_PROCEDURE,
    CS_MAX_STEPS_PER_SUBEVENT, CS_MAX_SUBEVENTS_PER_PROCEDURE, MAX_CONFIGS,
};
use crate::bytes::*;
use crate::crypto::BlockCipher;
use crate::Error;
use core::cmp;

/// Interface to the radio command scheduler that executes steps.
pub trait RadioScheduler {
    /// Hands a buffer of steps to the radio.
    ///
    /// The steps are owned by the scheduler until it reports the buffer as consumed.
    fn submit(&mut self, session: SessionId, buffer: BufferId, steps: &[CsStep])
        -> Result<(), Error>;

    /// Aborts all pending steps of `session`.
    fn cancel(&mut self, session: SessionId);
}

impl<S: RadioScheduler + ?Sized> RadioScheduler for &'_ mut S {
    fn submit(
        &mut self,
        session: SessionId,
        buffer: BufferId,
        steps: &[CsStep],
    ) -> Result<(), Error> {
        (**self).submit(session, buffer, steps)
    }

    fn cancel(&mut self, session: SessionId) {
        (**self).cancel(session)
    }
}

/// The collaborators a session calls into.
pub struct Env<'a, C, S, H> {
    pub cipher: &'a C,
    pub scheduler: &'a mut S,
    pub host: &'a mut H,
}

/// State of the procedure state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcedureState {
    Idle,
    ProcedureInit,
    SubeventInit,
    StepBuild,
    AwaitingResult,
    ProcedureComplete,
    Disabled,
}

impl ProcedureState {
    pub fn raw(self) -> u8 {
        match self {
            ProcedureState::Idle => 0,
            ProcedureState::ProcedureInit => 1,
            ProcedureState::SubeventInit => 2,
            ProcedureState::StepBuild => 3,
            ProcedureState::AwaitingResult => 4,
            ProcedureState::ProcedureComplete => 5,
            ProcedureState::Disabled => 6,
        }
    }

    pub fn from_raw(raw: u8) -> Result<Self, Error> {
        Ok(match raw {
            0 => ProcedureState::Idle,
            1 => ProcedureState::ProcedureInit,
            2 => ProcedureState::SubeventInit,
            3 => ProcedureState::StepBuild,
            4 => ProcedureState::AwaitingResult,
            5 => ProcedureState::ProcedureComplete,
            6 => ProcedureState::Disabled,
            _ => return Err(Error::InvalidRange),
        })
    }

    /// Whether steps are being built or executed.
    pub fn is_running(self) -> bool {
        match self {
            ProcedureState::StepBuild | ProcedureState::AwaitingResult => true,
            _ => false,
        }
    }
}

/// A configuration together with its procedure parameters and channel selection state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSlot {
    pub config: CsConfig,
    pub params: ProcedureParams,
    channels: Option<ChannelSelection>,
}

impl ConfigSlot {
    pub fn new(config: CsConfig, params: ProcedureParams) -> Self {
        Self {
            config,
            params,
            channels: None,
        }
    }

    /// Returns the channel selection state, once the first procedure has been initialized.
    pub fn channels(&self) -> Option<&ChannelSelection> {
        self.channels.as_ref()
    }

    fn snapshot_size(&self) -> usize {
        CsConfig::SIZE
            + ProcedureParams::SIZE
            + 1
            + self.channels.as_ref().map_or(0, ChannelSelection::snapshot_size)
    }
}

/// Progress of the current procedure.
///
/// Together with the DRBG and the channel selection state, this is everything needed to resume
/// the procedure sequence on another controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProcedureProgress {
    pub state: ProcedureState,
    pub config_id: u8,
    /// A procedure has been prepared by `start_step_list_gen` and awaits its start.
    pub next_procedure_pending: bool,
    /// Procedures completed since the procedure sequence was initialized.
    pub procedures_done: u16,
    /// Subevents completed in the current procedure.
    pub subevents_done: u16,
    pub steps_per_subevent: u8,
    /// Antenna switch period in microseconds.
    pub t_sw: u8,
    /// Non-mode-0 steps left in the current procedure.
    pub main_steps_remaining: u16,
    /// Steps of all modes built in the current procedure.
    pub procedure_steps: u16,
    /// Steps of all modes in the current subevent.
    pub subevent_steps: u8,
    pub subevent_steps_built: u8,
    pub subevent_results: u8,
    /// Main-mode steps until the next sub-mode step.
    pub main_run_remaining: u8,
    pub previous_permutation: Option<u8>,
}

impl ProcedureProgress {
    /// Serialized size in bytes.
    pub const SIZE: usize = 18;

    fn new(config_id: u8) -> Self {
        Self {
            state: ProcedureState::Idle,
            config_id,
            next_procedure_pending: false,
            procedures_done: 0,
            subevents_done: 0,
            steps_per_subevent: 0,
            t_sw: 0,
            main_steps_remaining: 0,
            procedure_steps: 0,
            subevent_steps: 0,
            subevent_steps_built: 0,
            subevent_results: 0,
            main_run_remaining: 0,
            previous_permutation: None,
        }
    }
}

impl Default for ProcedureProgress {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ToBytes for ProcedureProgress {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.state.raw())?;
        writer.write_u8(self.config_id)?;
        writer.write_bool(self.next_procedure_pending)?;
        writer.write_u16_le(self.procedures_done)?;
        writer.write_u16_le(self.subevents_done)?;
        writer.write_u8(self.steps_per_subevent)?;
        writer.write_u8(self.t_sw)?;
        writer.write_u16_le(self.main_steps_remaining)?;
        writer.write_u16_le(self.procedure_steps)?;
        writer.write_u8(self.subevent_steps)?;
        writer.write_u8(self.subevent_steps_built)?;
        writer.write_u8(self.subevent_results)?;
        writer.write_u8(self.main_run_remaining)?;
        writer.write_u8(self.previous_permutation.unwrap_or(0xff))?;
        Ok(())
    }
}

impl<'a> FromBytes<'a> for ProcedureProgress {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let progress = ProcedureProgress {
            state: ProcedureState::from_raw(bytes.read_u8()?)?,
            config_id: bytes.read_u8()?,
            next_procedure_pending: bytes.read_bool()?,
            procedures_done: bytes.read_u16_le()?,
            subevents_done: bytes.read_u16_le()?,
            steps_per_subevent: bytes.read_u8()?,
            t_sw: bytes.read_u8()?,
            main_steps_remaining: bytes.read_u16_le()?,
            procedure_steps: bytes.read_u16_le()?,
            subevent_steps: bytes.read_u8()?,
            subevent_steps_built: bytes.read_u8()?,
            subevent_results: bytes.read_u8()?,
            main_run_remaining: bytes.read_u8()?,
            previous_permutation: match bytes.read_u8()? {
                0xff => None,
                index => Some(index),
            },
        };

        let ok = usize::from(progress.config_id) < MAX_CONFIGS
            && progress.subevents_done <= CS_MAX_SUBEVENTS_PER_PROCEDURE
            && progress.steps_per_subevent <= CS_MAX_STEPS_PER_SUBEVENT
            && T_SW_OPTIONS.contains(&progress.t_sw)
            && progress.main_steps_remaining <= CS_MAX_STEPS_PER_PROCEDURE
            && progress.procedure_steps <= CS_MAX_STEPS_PER_PROCEDURE
            && progress.subevent_steps_built <= progress.subevent_steps
            && progress.subevent_results <= progress.subevent_steps_built
            && progress
                .previous_permutation
                .map_or(true, |index| usize::from(index) < ANTENNA_PERMUTATIONS.len());
        if ok {
            Ok(progress)
        } else {
            Err(Error::InvalidRange)
        }
    }
}

/// CS state of one connection, or of the test mode.
#[derive(Debug)]
pub struct CsSession {
    id: SessionId,
    drbg: Option<Drbg>,
    slots: [Option<ConfigSlot>; MAX_CONFIGS],
    local_t_sw: u8,
    remote_t_sw: u8,
    progress: ProcedureProgress,
    buffers: StepBuffers,
    test_mode: bool,
}

impl CsSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            drbg: None,
            slots: Default::default(),
            local_t_sw: 0,
            remote_t_sw: 0,
            progress: ProcedureProgress::default(),
            buffers: StepBuffers::new(),
            test_mode: false,
        }
    }

    /// Creates a test mode session that reports `TestEnded` once its procedures end.
    pub fn new_test() -> Self {
        let mut session = Self::new(SessionId::Test);
        session.test_mode = true;
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_test(&self) -> bool {
        self.test_mode
    }

    /// Installs the DRBG created by the CS security start.
    pub fn install_drbg(&mut self, drbg: Drbg) {
        self.drbg = Some(drbg);
    }

    pub fn drbg(&self) -> Option<&Drbg> {
        self.drbg.as_ref()
    }

    /// Sets the antenna switch periods supported by the local and the remote device.
    ///
    /// Returns `Error::InvalidRange` for unsupported periods.
    pub fn set_antenna_switch_times(&mut self, local: u8, remote: u8) -> Result<(), Error> {
        if !T_SW_OPTIONS.contains(&local) || !T_SW_OPTIONS.contains(&remote) {
            return Err(Error::InvalidRange);
        }
        self.local_t_sw = local;
        self.remote_t_sw = remote;
        Ok(())
    }

    /// Stores a configuration and its procedure parameters in the slot given by the config ID.
    ///
    /// Returns `Error::CommandDisallowed` if a procedure of that configuration is running.
    pub fn configure(&mut self, config: CsConfig, params: ProcedureParams) -> Result<(), Error> {
        config.validate()?;
        params.validate()?;
        if self.is_active(config.id) {
            return Err(Error::CommandDisallowed);
        }
        let slot = self
            .slots
            .get_mut(usize::from(config.id))
            .ok_or(Error::InvalidConfigId)?;
        *slot = Some(ConfigSlot::new(config, params));
        Ok(())
    }

    /// Removes a configuration.
    pub fn remove_config(&mut self, config_id: u8) -> Result<(), Error> {
        if self.is_active(config_id) {
            return Err(Error::CommandDisallowed);
        }
        let slot = self
            .slots
            .get_mut(usize::from(config_id))
            .ok_or(Error::InvalidConfigId)?;
        slot.take().ok_or(Error::InvalidConfigId)?;
        Ok(())
    }

    /// Sets the procedure enable flag of a configuration.
    pub fn set_enabled(&mut self, config_id: u8, enabled: bool) -> Result<(), Error> {
        self.slot_mut(config_id)?.params.enabled = enabled;
        Ok(())
    }

    pub fn slot(&self, config_id: u8) -> Option<&ConfigSlot> {
        self.slots.get(usize::from(config_id))?.as_ref()
    }

    fn slot_mut(&mut self, config_id: u8) -> Result<&mut ConfigSlot, Error> {
        self.slots
            .get_mut(usize::from(config_id))
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidConfigId)
    }

    pub fn progress(&self) -> &ProcedureProgress {
        &self.progress
    }

    pub fn state(&self) -> ProcedureState {
        self.progress.state
    }

    pub fn buffer_state(&self, id: BufferId) -> BufferState {
        self.buffers.state(id)
    }

    /// Whether a procedure of `config_id` is running or pending.
    fn is_active(&self, config_id: u8) -> bool {
        self.progress.config_id == config_id
            && (self.progress.state.is_running() || self.progress.next_procedure_pending)
    }

    /// Whether the session state can be captured consistently.
    ///
    /// This is the case when no step is built or in flight.
    pub fn can_snapshot(&self) -> bool {
        !self.buffers.is_busy() && !self.progress.state.is_running()
    }

    /// Checks the preconditions of starting a procedure of `config_id`.
    fn check_ready(&self, config_id: u8) -> Result<(), Error> {
        let slot = self.slot(config_id).ok_or(Error::InvalidConfigId)?;
        if !slot.params.enabled {
            return Err(Error::NoProcedure);
        }
        if self.drbg.is_none() {
            return Err(Error::InsufficientSecurity);
        }
        Ok(())
    }

    /// Sets up the procedure sequence of `config_id`.
    ///
    /// Builds the channel arrays on first use, computes the subevent capacity and the step budget,
    /// and prepares the first subevent.
    pub fn init_procedure<C: BlockCipher>(&mut self, cipher: &C, config_id: u8) -> Result<(), Error> {
        self.check_ready(config_id)?;
        self.buffers.release_idle();
        self.progress = ProcedureProgress::new(config_id);
        self.progress.state = ProcedureState::ProcedureInit;

        let slot = self
            .slots
            .get_mut(usize::from(config_id))
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidConfigId)?;
        let drbg = self.drbg.as_mut().ok_or(Error::InsufficientSecurity)?;

        let t_sw = antenna_switch_time(
            slot.params.aci,
            slot.config.role,
            self.local_t_sw,
            self.remote_t_sw,
        )?;
        self.progress.t_sw = t_sw;
        self.progress.steps_per_subevent = num_steps_per_subevent(&slot.config, &slot.params, t_sw)?;
        if slot.channels.is_none() {
            slot.channels = Some(ChannelSelection::new(
                &slot.config.channel_map,
                cipher,
                drbg,
            ));
        }
        debug!(
            "CS {:?} config {} init: {} steps/subevent, T_SW {}us",
            self.id, config_id, self.progress.steps_per_subevent, t_sw
        );

        self.start_step_list_gen(cipher)
    }

    /// Prepares the step list generation of the next procedure of the active configuration.
    ///
    /// This resets the per-procedure counters and the non-mode-0 channel order, and sets up the
    /// first subevent. No buffers are filled.
    pub fn start_step_list_gen<C: BlockCipher>(&mut self, cipher: &C) -> Result<(), Error> {
        let config_id = self.progress.config_id;
        let slot = self
            .slots
            .get_mut(usize::from(config_id))
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidConfigId)?;
        let drbg = self.drbg.as_mut().ok_or(Error::InsufficientSecurity)?;
        let channels = slot.channels.as_mut().ok_or(Error::NoProcedure)?;
        channels.start_procedure();

        let budget = u16::from(slot.config.chm_repetition) * channels.filtered().len() as u16;
        let progress = &mut self.progress;
        progress.main_steps_remaining = cmp::min(budget, CS_MAX_STEPS_PER_PROCEDURE);
        progress.subevents_done = 0;
        progress.procedure_steps = 0;
        progress.previous_permutation = None;
        progress.main_run_remaining = draw_main_run(&slot.config, cipher, drbg);

        if self.init_subevent()? {
            Ok(())
        } else {
            Err(Error::InvalidRange)
        }
    }

    /// Returns the number of main-mode steps of the next subevent, 0 if the procedure is over.
    fn next_subevent_main_steps(&self) -> Result<u8, Error> {
        let slot = self
            .slot(self.progress.config_id)
            .ok_or(Error::InvalidConfigId)?;
        let progress = &self.progress;
        if progress.subevents_done >= CS_MAX_SUBEVENTS_PER_PROCEDURE {
            return Ok(0);
        }
        let mode0 = slot.config.mode0_steps;
        let room = CS_MAX_STEPS_PER_PROCEDURE
            .saturating_sub(progress.procedure_steps)
            .saturating_sub(mode0.into());
        let per_subevent = progress.steps_per_subevent.saturating_sub(mode0);
        let main = cmp::min(
            u16::from(per_subevent),
            cmp::min(progress.main_steps_remaining, room),
        );
        Ok(main as u8)
    }

    /// Sets up the next subevent.
    ///
    /// Returns `false` if the procedure has no further subevents.
    pub fn init_subevent(&mut self) -> Result<bool, Error> {
        let main = self.next_subevent_main_steps()?;
        if main == 0 {
            return Ok(false);
        }
        self.calculate_subevent_steps(main)?;
        self.progress.state = ProcedureState::SubeventInit;
        trace!(
            "CS {:?} subevent {}: {} steps",
            self.id,
            self.progress.subevents_done,
            self.progress.subevent_steps
        );
        Ok(true)
    }

    /// Sets the step counters of the current subevent for `num_main_mode_steps` main-mode steps
    /// following the mode-0 steps.
    pub fn calculate_subevent_steps(&mut self, num_main_mode_steps: u8) -> Result<(), Error> {
        let mode0 = self
            .slot(self.progress.config_id)
            .ok_or(Error::InvalidConfigId)?
            .config
            .mode0_steps;
        let total = mode0
            .checked_add(num_main_mode_steps)
            .filter(|&total| total <= CS_MAX_STEPS_PER_SUBEVENT)
            .ok_or(Error::InvalidRange)?;
        let progress = &mut self.progress;
        progress.subevent_steps = total;
        progress.subevent_steps_built = 0;
        progress.subevent_results = 0;
        Ok(())
    }

    /// Builds the next step of the current subevent, which must be of `mode`.
    pub fn setup_step<C: BlockCipher>(&mut self, cipher: &C, mode: StepMode) -> Result<CsStep, Error> {
        let CsSession {
            drbg,
            slots,
            progress,
            ..
        } = self;
        let drbg = drbg.as_mut().ok_or(Error::InsufficientSecurity)?;
        let slot = slots
            .get_mut(usize::from(progress.config_id))
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidConfigId)?;
        build_step(cipher, drbg, slot, progress, mode)
    }

    /// Fills all free step buffers with the remaining steps of the current subevent.
    ///
    /// The first buffer of a subevent starts with its mode-0 steps, later buffers continue in
    /// main mode. Returns the number of buffers filled.
    pub fn setup_step_buffers<C: BlockCipher>(&mut self, cipher: &C) -> Result<u8, Error> {
        let mut filled = 0;
        while self.progress.subevent_steps_built < self.progress.subevent_steps {
            let CsSession {
                id,
                drbg,
                slots,
                progress,
                buffers,
                ..
            } = &mut *self;
            let drbg = drbg.as_mut().ok_or(Error::InsufficientSecurity)?;
            let slot = slots
                .get_mut(usize::from(progress.config_id))
                .and_then(Option::as_mut)
                .ok_or(Error::InvalidConfigId)?;
            let continuation = progress.subevent_steps_built != 0;
            let (buffer, steps) = match buffers.acquire() {
                Some(free) => free,
                None => break,
            };

            while steps.len() < CS_MAX_NUM_STEPS_IN_TX_BUFF
                && progress.subevent_steps_built < progress.subevent_steps
            {
                let mode = next_step_mode(cipher, drbg, &slot.config, progress);
                let step = build_step(cipher, drbg, slot, progress, mode)?;
                steps.push(step).map_err(|_| Error::InsufficientMemory)?;
            }
            trace!(
                "CS {:?} buffer {} filled with {} steps ({})",
                id,
                buffer.raw(),
                steps.len(),
                if continuation { "continuation" } else { "new subevent" }
            );
            buffers.mark_filled(buffer)?;
            filled += 1;
        }
        Ok(filled)
    }

    /// Hands all filled buffers to the scheduler, in the order they were filled.
    fn submit_filled<S: RadioScheduler>(&mut self, scheduler: &mut S) -> Result<(), Error> {
        while let Some(buffer) = self.buffers.next_filled() {
            let steps = self.buffers.submit(buffer)?;
            scheduler.submit(self.id, buffer, steps)?;
            debug!(
                "CS {:?} submitted buffer {} ({} steps)",
                self.id,
                buffer.raw(),
                steps.len()
            );
        }
        Ok(())
    }

    fn run_subevent<C, S, H>(&mut self, env: &mut Env<'_, C, S, H>) -> Result<(), Error>
    where
        C: BlockCipher,
        S: RadioScheduler,
        H: Host,
    {
        self.progress.state = ProcedureState::StepBuild;
        self.setup_step_buffers(env.cipher)?;
        self.progress.state = ProcedureState::AwaitingResult;
        self.submit_filled(env.scheduler)
    }

    /// Starts a procedure of `config_id`.
    ///
    /// If a procedure of this configuration has been prepared by `start_step_list_gen`, it is
    /// launched directly. Otherwise the procedure sequence is initialized first.
    ///
    /// Precondition failures are returned without side effects. Failures after that disable the
    /// procedure and are also reported to the host.
    pub fn start_procedure<C, S, H>(
        &mut self,
        env: &mut Env<'_, C, S, H>,
        config_id: u8,
    ) -> Result<(), Error>
    where
        C: BlockCipher,
        S: RadioScheduler,
        H: Host,
    {
        if self.progress.state.is_running() {
            return Err(Error::CommandDisallowed);
        }
        self.check_ready(config_id)?;

        let resume = self.progress.next_procedure_pending && self.progress.config_id == config_id;
        let result = if resume {
            self.progress.next_procedure_pending = false;
            self.run_subevent(env)
        } else {
            self.init_procedure(env.cipher, config_id)
                .and_then(|_| self.run_subevent(env))
        };
        match result {
            Ok(()) => {
                info!(
                    "CS {:?} config {} procedure {} started",
                    self.id, config_id, self.progress.procedures_done
                );
                Ok(())
            }
            Err(e) => {
                self.fail(env, e);
                Err(e)
            }
        }
    }

    /// Called by the radio scheduler when it no longer needs the steps in `buffer`.
    pub fn on_buffer_consumed<C, S, H>(
        &mut self,
        env: &mut Env<'_, C, S, H>,
        buffer: BufferId,
    ) -> Result<(), Error>
    where
        C: BlockCipher,
        S: RadioScheduler,
        H: Host,
    {
        if self.buffers.state(buffer) != BufferState::InFlight {
            // Buffers are released early on cancellation.
            debug!("CS {:?} stale buffer {} returned", self.id, buffer.raw());
            return Ok(());
        }
        self.buffers.release(buffer)?;
        if self.progress.state != ProcedureState::AwaitingResult {
            return Ok(());
        }

        let result = self
            .setup_step_buffers(env.cipher)
            .and_then(|_| self.submit_filled(env.scheduler));
        if let Err(e) = result {
            self.fail(env, e);
            return Err(e);
        }
        Ok(())
    }

    /// Called by the radio scheduler with the results of executed steps, in step order.
    ///
    /// The results are forwarded to the host. When the subevent is complete, the next subevent is
    /// started, or the procedure completes.
    pub fn on_step_results<C, S, H>(
        &mut self,
        env: &mut Env<'_, C, S, H>,
        results: &[StepResult],
    ) -> Result<(), Error>
    where
        C: BlockCipher,
        S: RadioScheduler,
        H: Host,
    {
        if self.progress.state != ProcedureState::AwaitingResult {
            return Err(Error::CommandDisallowed);
        }
        let outstanding = usize::from(self.progress.subevent_steps - self.progress.subevent_results);
        let results = if results.len() > outstanding {
            warn!(
                "CS {:?} dropping {} excess step results",
                self.id,
                results.len() - outstanding
            );
            &results[..outstanding]
        } else {
            results
        };

        let continuation = self.progress.subevent_results != 0;
        self.progress.subevent_results += results.len() as u8;
        let subevent_complete = self.progress.subevent_results == self.progress.subevent_steps;
        if subevent_complete {
            self.progress.subevents_done += 1;
        }
        let more_subevents = subevent_complete && self.next_subevent_main_steps()? != 0;

        let slot = self
            .slot(self.progress.config_id)
            .ok_or(Error::InvalidConfigId)?;
        let header = ResultHeader {
            session: self.id,
            config_id: self.progress.config_id,
            start_event_counter: slot.params.start_conn_event.wrapping_add(
                self.progress
                    .procedures_done
                    .wrapping_mul(slot.params.procedure_interval),
            ),
            procedure_counter: self.drbg.as_ref().map_or(0, Drbg::procedure_counter),
        };
        let status = |done| {
            if done {
                DoneStatus::Complete
            } else {
                DoneStatus::Partial
            }
        };
        report_results(
            env.host,
            &header,
            continuation,
            results,
            status(subevent_complete),
            status(subevent_complete && !more_subevents),
        );

        if !subevent_complete {
            return Ok(());
        }
        let result = if more_subevents {
            self.init_subevent().and_then(|_| self.run_subevent(env))
        } else {
            self.complete_procedure(env)
        };
        if let Err(e) = result {
            self.fail(env, e);
            return Err(e);
        }
        Ok(())
    }

    fn complete_procedure<C, S, H>(&mut self, env: &mut Env<'_, C, S, H>) -> Result<(), Error>
    where
        C: BlockCipher,
        S: RadioScheduler,
        H: Host,
    {
        self.progress.state = ProcedureState::ProcedureComplete;
        self.drbg
            .as_mut()
            .ok_or(Error::InsufficientSecurity)?
            .backtrack(env.cipher);
        self.progress.procedures_done = self.progress.procedures_done.saturating_add(1);

        let params = self
            .slot(self.progress.config_id)
            .ok_or(Error::InvalidConfigId)?
            .params;
        let another = params.enabled
            && (params.procedure_count == 0 || self.progress.procedures_done < params.procedure_count);
        info!(
            "CS {:?} procedure {} complete",
            self.id, self.progress.procedures_done
        );
        if another {
            self.start_step_list_gen(env.cipher)?;
            self.progress.next_procedure_pending = true;
        } else {
            self.finish_and_reset_procedure(env);
        }
        Ok(())
    }

    /// Ends the procedure sequence after its last procedure.
    pub fn finish_and_reset_procedure<C, S, H>(&mut self, env: &mut Env<'_, C, S, H>)
    where
        H: Host,
    {
        self.procedure_cleanup(env.host);
        self.progress.state = ProcedureState::Idle;
    }

    /// Releases the step buffers not held by the scheduler, clears the pending procedure, and
    /// resets the counters.
    ///
    /// In-flight buffers are released when the scheduler returns them. Ends the test mode if it
    /// was active. Calling this more than once has no further effect. The DRBG is not touched.
    pub fn procedure_cleanup<H: Host>(&mut self, host: &mut H) {
        self.buffers.release_idle();
        let progress = &mut self.progress;
        progress.next_procedure_pending = false;
        progress.subevents_done = 0;
        progress.main_steps_remaining = 0;
        progress.procedure_steps = 0;
        progress.subevent_steps = 0;
        progress.subevent_steps_built = 0;
        progress.subevent_results = 0;
        if self.test_mode {
            self.test_mode = false;
            host.on_event(CsEvent::TestEnded);
            info!("CS test ended");
        }
    }

    /// Disables procedures of `config_id` and reports this with `status` to the host.
    ///
    /// Can be called in any state. Steps owned by the scheduler are cancelled.
    pub fn disable_procedure<C, S, H>(
        &mut self,
        env: &mut Env<'_, C, S, H>,
        config_id: u8,
        status: Result<(), Error>,
    ) -> Result<(), Error>
    where
        S: RadioScheduler,
        H: Host,
    {
        self.slot_mut(config_id)?.params.enabled = false;
        if self.progress.config_id == config_id {
            self.abort_buffers(env.scheduler);
            self.procedure_cleanup(env.host);
            self.progress.state = ProcedureState::Disabled;
        }
        env.host.on_event(CsEvent::ProcedureDisabled {
            session: self.id,
            config_id,
            status,
        });
        info!("CS {:?} config {} disabled: {:?}", self.id, config_id, status);
        Ok(())
    }

    /// Aborts the running procedure after an error.
    fn fail<C, S, H>(&mut self, env: &mut Env<'_, C, S, H>, error: Error)
    where
        S: RadioScheduler,
        H: Host,
    {
        error!("CS {:?} procedure failed: {}", self.id, error);
        self.abort_buffers(env.scheduler);
        self.procedure_cleanup(env.host);
        self.progress.state = ProcedureState::Disabled;
        env.host.on_event(CsEvent::ProcedureDisabled {
            session: self.id,
            config_id: self.progress.config_id,
            status: Err(error),
        });
    }

    /// Takes all buffers back from the scheduler by cancelling its pending steps.
    fn abort_buffers<S: RadioScheduler>(&mut self, scheduler: &mut S) {
        if self.buffers.has_in_flight() {
            scheduler.cancel(self.id);
        }
        self.buffers.release_all();
    }

    /// Cancels everything and ends the test mode.
    pub fn stop<S: RadioScheduler, H: Host>(&mut self, scheduler: &mut S, host: &mut H) {
        scheduler.cancel(self.id);
        self.buffers.release_all();
        self.procedure_cleanup(host);
        self.progress.state = ProcedureState::Idle;
    }

    /// Returns the size of the serialized session.
    pub fn snapshot_size(&self) -> usize {
        1 + self.drbg.as_ref().map_or(0, |_| Drbg::SNAPSHOT_SIZE)
            + ProcedureProgress::SIZE
            + 2
            + 1
            + self
                .slots
                .iter()
                .flatten()
                .map(ConfigSlot::snapshot_size)
                .sum::<usize>()
    }

    /// Restores a session serialized with `to_bytes`.
    pub fn read_snapshot(id: SessionId, bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let drbg = if bytes.read_bool()? {
            Some(Drbg::from_bytes(bytes)?)
        } else {
            None
        };
        let progress = ProcedureProgress::from_bytes(bytes)?;
        let local_t_sw = bytes.read_u8()?;
        let remote_t_sw = bytes.read_u8()?;
        let valid = bytes.read_u8()?;
        if valid >> MAX_CONFIGS != 0 {
            return Err(Error::InvalidRange);
        }

        let mut session = CsSession::new(id);
        session.drbg = drbg;
        session.set_antenna_switch_times(local_t_sw, remote_t_sw)?;
        for index in crate::utils::set_bits(&[valid]) {
            let config = CsConfig::from_bytes(bytes)?;
            let params = ProcedureParams::from_bytes(bytes)?;
            if config.id != index {
                return Err(Error::InvalidRange);
            }
            session.slots[usize::from(index)] = Some(ConfigSlot::new(config, params));
        }
        for slot in session.slots.iter_mut().flatten() {
            if bytes.read_bool()? {
                let channels = ChannelSelection::from_bytes(bytes)?;
                if channels.filtered() != &slot.config.channel_map.filtered()[..] {
                    return Err(Error::InvalidRange);
                }
                slot.channels = Some(channels);
            }
        }

        // Only quiescent sessions are captured.
        if progress.state.is_running() {
            return Err(Error::InvalidRange);
        }
        if progress.next_procedure_pending {
            let ready = session
                .slot(progress.config_id)
                .map_or(false, |slot| slot.channels.is_some());
            if !ready || session.drbg.is_none() {
                return Err(Error::InvalidRange);
            }
        }
        session.progress = progress;
        Ok(session)
    }
}

impl ToBytes for CsSession {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match &self.drbg {
            Some(drbg) => {
                writer.write_bool(true)?;
                drbg.to_bytes(writer)?;
            }
            None => writer.write_bool(false)?,
        }
        self.progress.to_bytes(writer)?;
        writer.write_u8(self.local_t_sw)?;
        writer.write_u8(self.remote_t_sw)?;

        let valid = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .fold(0u8, |bitmap, (index, _)| bitmap | 1 << index);
        writer.write_u8(valid)?;
        for slot in self.slots.iter().flatten() {
            slot.config.to_bytes(writer)?;
            slot.params.to_bytes(writer)?;
        }
        for slot in self.slots.iter().flatten() {
            match &slot.channels {
                Some(channels) => {
                    writer.write_bool(true)?;
                    channels.to_bytes(writer)?;
                }
                None => writer.write_bool(false)?,
            }
        }
        Ok(())
    }
}

/// Draws the number of main-mode steps before the next sub-mode step.
fn draw_main_run<C: BlockCipher>(config: &CsConfig, cipher: &C, drbg: &mut Drbg) -> u8 {
    if config.sub_mode.is_none() {
        return 0;
    }
    let min = config.main_mode_min_steps;
    let range = config.main_mode_max_steps.saturating_sub(min).saturating_add(1);
    min.saturating_add(drbg.hr1(cipher, TransactionId::SubModeInsertion, range))
}

/// Returns the mode of the next step of the subevent.
fn next_step_mode<C: BlockCipher>(
    cipher: &C,
    drbg: &mut Drbg,
    config: &CsConfig,
    progress: &mut ProcedureProgress,
) -> StepMode {
    if progress.subevent_steps_built < config.mode0_steps {
        return StepMode::Mode0;
    }
    match config.sub_mode {
        Some(sub_mode) if progress.main_run_remaining == 0 => {
            progress.main_run_remaining = draw_main_run(config, cipher, drbg);
            sub_mode
        }
        Some(_) => {
            progress.main_run_remaining -= 1;
            config.main_mode
        }
        None => config.main_mode,
    }
}

/// Draws all parameters of a step, in the fixed draw order, and advances the DRBG.
fn build_step<C: BlockCipher>(
    cipher: &C,
    drbg: &mut Drbg,
    slot: &mut ConfigSlot,
    progress: &mut ProcedureProgress,
    mode: StepMode,
) -> Result<CsStep, Error> {
    let channels = slot.channels.as_mut().ok_or(Error::NoProcedure)?;
    let config = &slot.config;

    let channel = channels.select(mode, cipher, drbg)?;
    let mut step = CsStep::new(mode, channel);
    if mode.has_sync_packets() {
        let (aa_rx, aa_tx) = select_access_addresses(config.role, cipher, drbg)?;
        step.aa_rx = aa_rx;
        step.aa_tx = aa_tx;
        if mode != StepMode::Mode0 && config.rtt_type.is_random_sequence() {
            let (tx, rx) =
                random_sequences(config.role, config.rtt_type.payload_len(), cipher, drbg)?;
            step.payload_tx = tx;
            step.payload_rx = rx;
        }
    }
    if mode.has_tones() {
        step.tone_extension = tone_extension(cipher, drbg);
        let permutation =
            next_antenna_permutation(slot.params.aci, progress.previous_permutation, cipher, drbg);
        step.antenna_permutation = permutation;
        progress.previous_permutation = Some(permutation);
    }
    drbg.advance_step();

    progress.subevent_steps_built += 1;
    progress.procedure_steps += 1;
    if mode != StepMode::Mode0 {
        progress.main_steps_remaining = progress.main_steps_remaining.saturating_sub(1);
    }
    Ok(step)
}
