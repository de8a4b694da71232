//! CS configurations and procedure parameters.

use super::channel::CsChannelMap;
use super::timing::{T_FCS_OPTIONS, T_IP_OPTIONS, T_PM_OPTIONS};
use super::{
    Aci, ChannelSelectionAlgorithm, Role, RttType, StepMode, SyncPhy, CS_MAX_SUBEVENT_LEN_US,
    CS_MIN_SUBEVENT_LEN_US, MAX_CONFIGS,
};
use crate::bytes::*;
use crate::Error;

/// Raw sub-mode value meaning "no sub-mode".
const SUB_MODE_UNUSED: u8 = 0xff;

/// Maximum number of subevents in a CS event.
pub const MAX_SUBEVENTS_PER_EVENT: u8 = 32;

/// Interlude and frequency change timing of a configuration, in microseconds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StepTiming {
    /// Interlude between CS_SYNC packets (`T_IP1`).
    pub t_ip1: u8,
    /// Interlude between tone exchanges (`T_IP2`).
    pub t_ip2: u8,
    /// Frequency change period (`T_FCS`).
    pub t_fcs: u8,
    /// Tone measurement period (`T_PM`).
    pub t_pm: u8,
}

impl StepTiming {
    fn validate(&self) -> Result<(), Error> {
        let ok = T_IP_OPTIONS.contains(&self.t_ip1)
            && T_IP_OPTIONS.contains(&self.t_ip2)
            && T_FCS_OPTIONS.contains(&self.t_fcs)
            && T_PM_OPTIONS.contains(&self.t_pm);
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidRange)
        }
    }
}

/// A CS configuration, as created by the CS configuration procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct CsConfig {
    pub id: u8,
    pub role: Role,
    pub channel_map: CsChannelMap,
    /// Number of times the channel map is cycled through for non-mode-0 steps (1-3).
    pub chm_repetition: u8,
    pub main_mode: StepMode,
    pub sub_mode: Option<StepMode>,
    /// Minimum number of main-mode steps between two sub-mode steps.
    pub main_mode_min_steps: u8,
    /// Maximum number of main-mode steps between two sub-mode steps.
    pub main_mode_max_steps: u8,
    pub main_mode_repetition: u8,
    /// Number of mode-0 steps at the start of every subevent (1-3).
    pub mode0_steps: u8,
    pub sync_phy: SyncPhy,
    pub rtt_type: RttType,
    pub channel_selection: ChannelSelectionAlgorithm,
    pub timing: StepTiming,
}

impl CsConfig {
    /// Serialized size in bytes.
    pub const SIZE: usize = 26;

    /// Checks all fields against their permitted ranges.
    pub fn validate(&self) -> Result<(), Error> {
        if usize::from(self.id) >= MAX_CONFIGS {
            return Err(Error::InvalidConfigId);
        }
        if self.main_mode == StepMode::Mode0 {
            return Err(Error::InvalidStepMode);
        }
        if let Some(sub) = self.sub_mode {
            if sub == StepMode::Mode0 || sub == self.main_mode {
                return Err(Error::InvalidStepMode);
            }
            if self.main_mode_min_steps == 0 || self.main_mode_min_steps > self.main_mode_max_steps
            {
                return Err(Error::InvalidRange);
            }
        }
        if !(1..=3).contains(&self.mode0_steps)
            || !(1..=3).contains(&self.chm_repetition)
            || self.main_mode_repetition > 3
        {
            return Err(Error::InvalidRange);
        }
        if self.channel_selection != ChannelSelectionAlgorithm::Algorithm3b {
            return Err(Error::UnsupportedFeature);
        }
        if let SyncPhy::Unknown(_) = self.sync_phy {
            return Err(Error::InvalidValue);
        }
        if let RttType::Unknown(_) = self.rtt_type {
            return Err(Error::InvalidValue);
        }
        self.timing.validate()
    }
}

impl ToBytes for CsConfig {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.id)?;
        writer.write_u8(self.role.raw())?;
        self.channel_map.to_bytes(writer)?;
        writer.write_u8(self.chm_repetition)?;
        writer.write_u8(self.main_mode.raw())?;
        writer.write_u8(self.sub_mode.map_or(SUB_MODE_UNUSED, StepMode::raw))?;
        writer.write_u8(self.main_mode_min_steps)?;
        writer.write_u8(self.main_mode_max_steps)?;
        writer.write_u8(self.main_mode_repetition)?;
        writer.write_u8(self.mode0_steps)?;
        writer.write_u8(self.sync_phy.into())?;
        writer.write_u8(self.rtt_type.into())?;
        writer.write_u8(self.channel_selection.into())?;
        writer.write_u8(self.timing.t_ip1)?;
        writer.write_u8(self.timing.t_ip2)?;
        writer.write_u8(self.timing.t_fcs)?;
        writer.write_u8(self.timing.t_pm)?;
        Ok(())
    }
}

impl<'a> FromBytes<'a> for CsConfig {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let config = CsConfig {
            id: bytes.read_u8()?,
            role: Role::from_raw(bytes.read_u8()?)?,
            channel_map: CsChannelMap::from_bytes(bytes)?,
            chm_repetition: bytes.read_u8()?,
            main_mode: StepMode::from_raw(bytes.read_u8()?)?,
            sub_mode: match bytes.read_u8()? {
                SUB_MODE_UNUSED => None,
                raw => Some(StepMode::from_raw(raw)?),
            },
            main_mode_min_steps: bytes.read_u8()?,
            main_mode_max_steps: bytes.read_u8()?,
            main_mode_repetition: bytes.read_u8()?,
            mode0_steps: bytes.read_u8()?,
            sync_phy: bytes.read_u8()?.into(),
            rtt_type: bytes.read_u8()?.into(),
            channel_selection: bytes.read_u8()?.into(),
            timing: StepTiming {
                t_ip1: bytes.read_u8()?,
                t_ip2: bytes.read_u8()?,
                t_fcs: bytes.read_u8()?,
                t_pm: bytes.read_u8()?,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

/// Parameters of the procedures run with a configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProcedureParams {
    /// Whether procedures are currently enabled for the configuration.
    pub enabled: bool,
    /// Connection event counter of the first CS event.
    pub start_conn_event: u16,
    /// Maximum procedure length, in units of 0.625 ms.
    pub max_procedure_len: u16,
    /// Connection events between the starts of two procedures.
    pub procedure_interval: u16,
    /// Number of procedures to run. 0 runs procedures until they are disabled.
    pub procedure_count: u16,
    /// Connection events between the starts of two CS events.
    pub event_interval: u16,
    pub subevents_per_event: u8,
    /// Time between the starts of two subevents, in units of 0.625 ms.
    pub subevent_interval: u16,
    /// Subevent length in microseconds.
    pub subevent_len: u32,
    pub aci: Aci,
    pub preferred_peer_antenna: u8,
    pub phy: u8,
    pub tx_power_delta: i8,
}

impl ProcedureParams {
    /// Serialized size in bytes.
    pub const SIZE: usize = 24;

    /// Checks all fields against their permitted ranges.
    pub fn validate(&self) -> Result<(), Error> {
        let ok = (CS_MIN_SUBEVENT_LEN_US..=CS_MAX_SUBEVENT_LEN_US).contains(&self.subevent_len)
            && (1..=MAX_SUBEVENTS_PER_EVENT).contains(&self.subevents_per_event)
            && self.max_procedure_len != 0
            && self.event_interval != 0
            && (1..=0x0f).contains(&self.preferred_peer_antenna);
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidRange)
        }
    }
}

impl ToBytes for ProcedureParams {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_bool(self.enabled)?;
        writer.write_u16_le(self.start_conn_event)?;
        writer.write_u16_le(self.max_procedure_len)?;
        writer.write_u16_le(self.procedure_interval)?;
        writer.write_u16_le(self.procedure_count)?;
        writer.write_u16_le(self.event_interval)?;
        writer.write_u8(self.subevents_per_event)?;
        writer.write_u16_le(self.subevent_interval)?;
        writer.write_u32_le(self.subevent_len)?;
        writer.write_u8(self.aci.raw())?;
        writer.write_u8(self.preferred_peer_antenna)?;
        writer.write_u8(self.phy)?;
        writer.write_i8(self.tx_power_delta)?;
        // Reserved
        writer.write_u16_le(0)?;
        Ok(())
    }
}

impl<'a> FromBytes<'a> for ProcedureParams {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let params = ProcedureParams {
            enabled: bytes.read_bool()?,
            start_conn_event: bytes.read_u16_le()?,
            max_procedure_len: bytes.read_u16_le()?,
            procedure_interval: bytes.read_u16_le()?,
            procedure_count: bytes.read_u16_le()?,
            event_interval: bytes.read_u16_le()?,
            subevents_per_event: bytes.read_u8()?,
            subevent_interval: bytes.read_u16_le()?,
            subevent_len: bytes.read_u32_le()?,
            aci: Aci::from_raw(bytes.read_u8()?)?,
            preferred_peer_antenna: bytes.read_u8()?,
            phy: bytes.read_u8()?,
            tx_power_delta: bytes.read_i8()?,
        };
        bytes.read_u16_le()?;
        params.validate()?;
        Ok(params)
    }
}
