//! The controller: connections, their CS sessions, and connection handover.
//!
//! [`Controller`] owns all collaborators given by the application's [`Config`] and routes host
//! commands (by connection handle) and radio scheduler callbacks (by [`SessionId`]) to the right
//! [`CsSession`].
//!
//! [`Controller`]: struct.Controller.html
//! [`Config`]: ../config/trait.Config.html
//! [`SessionId`]: ../cs/enum.SessionId.html
//! [`CsSession`]: ../cs/procedure/struct.CsSession.html

use crate::config::Config;
use crate::cs::config::{CsConfig, ProcedureParams};
use crate::cs::drbg::{SecurityVectors, VectorHalves};
use crate::cs::procedure::{CsSession, Env};
use crate::cs::step::{BufferId, StepResult};
use crate::cs::SessionId;
use crate::handover::{self, CandidateParams, Snapshot};
use crate::l2cap::Multiplexer;
use crate::link::{ConnHandle, ConnectionRecord, FeatureSet};
use crate::Error;
use heapless::Vec;

/// Maximum number of simultaneous connections.
pub const MAX_CONNECTIONS: usize = 4;

/// A connection known to the controller.
#[derive(Debug)]
pub struct Connection {
    record: ConnectionRecord,
    cs: CsSession,
    handover_in_progress: bool,
}

impl Connection {
    fn new(record: ConnectionRecord, cs: CsSession) -> Self {
        Self {
            record,
            cs,
            handover_in_progress: false,
        }
    }

    pub fn handle(&self) -> ConnHandle {
        self.record.handle
    }

    pub fn record(&self) -> &ConnectionRecord {
        &self.record
    }

    pub fn cs(&self) -> &CsSession {
        &self.cs
    }

    /// Whether a snapshot of this connection has been handed out and the handover is not closed.
    pub fn is_handover_in_progress(&self) -> bool {
        self.handover_in_progress
    }
}

/// A Channel Sounding capable link-layer controller.
pub struct Controller<C: Config> {
    cipher: C::Cipher,
    scheduler: C::Scheduler,
    host: C::Host,
    mux: C::Multiplexer,
    connections: Vec<Connection, MAX_CONNECTIONS>,
    test: Option<CsSession>,
}

impl<C: Config> Controller<C> {
    pub fn new(
        cipher: C::Cipher,
        scheduler: C::Scheduler,
        host: C::Host,
        mux: C::Multiplexer,
    ) -> Self {
        Self {
            cipher,
            scheduler,
            host,
            mux,
            connections: Vec::new(),
            test: None,
        }
    }

    pub fn scheduler(&self) -> &C::Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut C::Scheduler {
        &mut self.scheduler
    }

    pub fn host(&self) -> &C::Host {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut C::Host {
        &mut self.host
    }

    pub fn mux(&self) -> &C::Multiplexer {
        &self.mux
    }

    pub fn mux_mut(&mut self) -> &mut C::Multiplexer {
        &mut self.mux
    }

    pub fn connection(&self, handle: ConnHandle) -> Option<&Connection> {
        self.connections.iter().find(|c| c.handle() == handle)
    }

    fn connection_mut(&mut self, handle: ConnHandle) -> Result<&mut Connection, Error> {
        self.connections
            .iter_mut()
            .find(|c| c.handle() == handle)
            .ok_or(Error::InvalidConnection)
    }

    /// Returns the test mode session, if test mode was started.
    pub fn test_session(&self) -> Option<&CsSession> {
        self.test.as_ref()
    }

    fn insert(&mut self, connection: Connection) -> Result<(), Error> {
        if self.connection(connection.handle()).is_some() {
            return Err(Error::Failure);
        }
        self.connections
            .push(connection)
            .map_err(|_| Error::AllocationError)
    }

    /// Adds an established connection.
    ///
    /// Fails with `Error::Failure` if the handle is in use, and with `Error::AllocationError` if
    /// the connection table is full.
    pub fn add_connection(&mut self, record: ConnectionRecord) -> Result<(), Error> {
        let cs = CsSession::new(SessionId::Connection(record.handle));
        self.insert(Connection::new(record, cs))?;
        debug!("added {:?}", self.connections.last().map(Connection::handle));
        Ok(())
    }

    /// Drops a connection, cancelling its steps and closing its channels.
    pub fn remove_connection(&mut self, handle: ConnHandle) -> Result<ConnectionRecord, Error> {
        let index = self
            .connections
            .iter()
            .position(|c| c.handle() == handle)
            .ok_or(Error::InvalidConnection)?;
        let mut connection = self.connections.swap_remove(index);
        connection.cs.stop(&mut self.scheduler, &mut self.host);
        self.mux.remove_channels(handle);
        info!("{:?} removed", handle);
        Ok(connection.record)
    }

    /// Runs `f` with the session `id` and the collaborators it needs.
    fn with_session<R, F>(&mut self, id: SessionId, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut CsSession, &mut Env<'_, C::Cipher, C::Scheduler, C::Host>) -> Result<R, Error>,
    {
        let Controller {
            cipher,
            scheduler,
            host,
            connections,
            test,
            ..
        } = self;
        let session = match id {
            SessionId::Connection(handle) => {
                &mut connections
                    .iter_mut()
                    .find(|c| c.handle() == handle)
                    .ok_or(Error::InvalidConnection)?
                    .cs
            }
            SessionId::Test => test.as_mut().ok_or(Error::NoProcedure)?,
        };
        let mut env = Env {
            cipher: &*cipher,
            scheduler,
            host,
        };
        f(session, &mut env)
    }

    /// Starts CS security on a connection, installing a DRBG derived from both devices' vector
    /// halves.
    ///
    /// Requires the peer to support Channel Sounding.
    pub fn start_security(
        &mut self,
        handle: ConnHandle,
        central: &VectorHalves,
        peripheral: &VectorHalves,
    ) -> Result<(), Error> {
        let drbg = SecurityVectors::combine(central, peripheral).instantiate(&self.cipher)?;
        let connection = self.connection_mut(handle)?;
        if !connection
            .record
            .peer_features
            .contains(FeatureSet::CHANNEL_SOUNDING)
        {
            return Err(Error::UnsupportedFeature);
        }
        if connection.cs.state().is_running() {
            return Err(Error::CommandDisallowed);
        }
        connection.cs.install_drbg(drbg);
        info!("{:?}: CS security started", handle);
        Ok(())
    }

    /// Sets the antenna switch periods of the local and the remote device.
    pub fn set_antenna_switch_times(
        &mut self,
        handle: ConnHandle,
        local: u8,
        remote: u8,
    ) -> Result<(), Error> {
        self.connection_mut(handle)?
            .cs
            .set_antenna_switch_times(local, remote)
    }

    /// Creates or replaces a CS configuration and its procedure parameters.
    pub fn create_config(
        &mut self,
        handle: ConnHandle,
        config: CsConfig,
        params: ProcedureParams,
    ) -> Result<(), Error> {
        self.connection_mut(handle)?.cs.configure(config, params)
    }

    pub fn remove_config(&mut self, handle: ConnHandle, config_id: u8) -> Result<(), Error> {
        self.connection_mut(handle)?.cs.remove_config(config_id)
    }

    /// Enables or disables procedures of a configuration.
    ///
    /// Disabling stops a running procedure and reports `ProcedureDisabled` to the host.
    pub fn set_procedure_enable(
        &mut self,
        handle: ConnHandle,
        config_id: u8,
        enable: bool,
    ) -> Result<(), Error> {
        if enable {
            self.connection_mut(handle)?.cs.set_enabled(config_id, true)
        } else {
            self.disable_procedure(handle, config_id, Ok(()))
        }
    }

    /// Disables procedures of a configuration and reports `status` to the host.
    pub fn disable_procedure(
        &mut self,
        handle: ConnHandle,
        config_id: u8,
        status: Result<(), Error>,
    ) -> Result<(), Error> {
        self.with_session(SessionId::Connection(handle), |cs, env| {
            cs.disable_procedure(env, config_id, status)
        })
    }

    /// Starts a CS procedure on a connection.
    ///
    /// Not allowed while a handover of the connection is in progress. Requires the peer to
    /// support Channel Sounding.
    pub fn start_procedure(&mut self, handle: ConnHandle, config_id: u8) -> Result<(), Error> {
        let connection = self.connection_mut(handle)?;
        if connection.handover_in_progress {
            return Err(Error::CommandDisallowed);
        }
        let features = connection.record.peer_features & FeatureSet::supported();
        if !features.contains(FeatureSet::CHANNEL_SOUNDING) {
            return Err(Error::UnsupportedFeature);
        }
        self.with_session(SessionId::Connection(handle), |cs, env| {
            cs.start_procedure(env, config_id)
        })
    }

    /// Starts a CS test procedure, which runs without a connection.
    ///
    /// The test ends with a `TestEnded` event once its procedures are done, or when it is stopped.
    pub fn start_test_procedure(
        &mut self,
        vectors: &SecurityVectors,
        config: CsConfig,
        params: ProcedureParams,
        t_sw: u8,
    ) -> Result<(), Error> {
        if self.test.as_ref().map_or(false, CsSession::is_test) {
            return Err(Error::CommandDisallowed);
        }
        let mut session = CsSession::new_test();
        session.install_drbg(vectors.instantiate(&self.cipher)?);
        session.set_antenna_switch_times(t_sw, t_sw)?;
        let config_id = config.id;
        session.configure(config, params)?;
        self.test = Some(session);

        let result = self.with_session(SessionId::Test, |cs, env| cs.start_procedure(env, config_id));
        if result.is_err() {
            self.test = None;
        }
        result
    }

    /// Stops the CS test mode.
    pub fn stop_test_procedure(&mut self) -> Result<(), Error> {
        let mut session = self.test.take().ok_or(Error::CommandDisallowed)?;
        session.stop(&mut self.scheduler, &mut self.host);
        Ok(())
    }

    /// Called by the radio scheduler when it is done with a step buffer of `session`.
    pub fn on_buffer_consumed(&mut self, session: SessionId, buffer: BufferId) -> Result<(), Error> {
        self.with_session(session, |cs, env| cs.on_buffer_consumed(env, buffer))
    }

    /// Called by the radio scheduler with the results of executed steps of `session`.
    pub fn on_step_results(
        &mut self,
        session: SessionId,
        results: &[StepResult],
    ) -> Result<(), Error> {
        self.with_session(session, |cs, env| cs.on_step_results(env, results))
    }

    /// Returns the exact size of the handover snapshot of a connection.
    ///
    /// Fails with `Error::InvalidDataSize` if the connection is unknown.
    pub fn snapshot_size(&self, handle: ConnHandle) -> Result<usize, Error> {
        let connection = self.connection(handle).ok_or(Error::InvalidDataSize)?;
        Ok(handover::snapshot_size(
            &connection.record,
            &connection.cs,
            &self.mux,
        ))
    }

    /// Writes the handover snapshot of a connection to `buf` and returns its size.
    ///
    /// Fails with `Error::CommandDisallowed` while steps of the connection are built or executed,
    /// and with `Error::InsufficientMemory` if `buf` is smaller than [`snapshot_size`]. On
    /// success, procedures of the connection cannot be started until [`close_serving`] is called.
    ///
    /// [`snapshot_size`]: #method.snapshot_size
    /// [`close_serving`]: #method.close_serving
    pub fn populate_snapshot(&mut self, handle: ConnHandle, buf: &mut [u8]) -> Result<usize, Error> {
        let Controller {
            connections, mux, ..
        } = self;
        let connection = connections
            .iter_mut()
            .find(|c| c.handle() == handle)
            .ok_or(Error::InvalidConnection)?;
        if !connection.cs.can_snapshot() {
            return Err(Error::CommandDisallowed);
        }

        let written = handover::write_snapshot(&connection.record, &connection.cs, &*mux, buf)
            .map_err(|e| {
                error!("handover: snapshot of {:?} failed: {}", handle, e);
                e
            })?;
        connection.handover_in_progress = true;
        info!("handover: {:?} captured in {} bytes", handle, written);
        Ok(written)
    }

    /// Takes over a connection from a snapshot made by another controller.
    ///
    /// The connection is registered under `handle`. Nothing is registered if this fails: see
    /// [`Snapshot::parse`] and [`Snapshot::register_channels`] for the error conditions. A handle
    /// that is already in use fails with `Error::Failure`.
    ///
    /// [`Snapshot::parse`]: ../handover/struct.Snapshot.html#method.parse
    /// [`Snapshot::register_channels`]: ../handover/struct.Snapshot.html#method.register_channels
    pub fn apply_snapshot(
        &mut self,
        handle: ConnHandle,
        buf: &[u8],
        params: CandidateParams,
    ) -> Result<(), Error> {
        if self.connection(handle).is_some() || self.mux.channel_count(handle) != 0 {
            return Err(Error::Failure);
        }
        if self.connections.is_full() {
            return Err(Error::AllocationError);
        }

        let mut snapshot = Snapshot::parse(handle, buf).map_err(|e| {
            warn!("handover: rejected snapshot for {:?}: {}", handle, e);
            e
        })?;
        snapshot.record.advance_by(params.time_delta);
        let registration = snapshot.register_channels(&mut self.mux)?;

        let Snapshot { record, cs, .. } = snapshot;
        if let Err(e) = self.insert(Connection::new(record, cs)) {
            registration.undo(&mut self.mux);
            return Err(e);
        }
        info!("handover: took over {:?}", handle);
        Ok(())
    }

    /// Ends the handover of a connection on the serving controller.
    ///
    /// If the candidate took over, the connection and its channels are dropped. Otherwise the
    /// connection resumes normal operation here.
    pub fn close_serving(&mut self, handle: ConnHandle, success: bool) -> Result<(), Error> {
        let connection = self.connection_mut(handle)?;
        if !connection.handover_in_progress {
            return Err(Error::CommandDisallowed);
        }
        if success {
            self.remove_connection(handle)?;
        } else {
            connection.handover_in_progress = false;
            info!("handover: {:?} stays here", handle);
        }
        Ok(())
    }
}
