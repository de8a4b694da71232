//! Step durations and subevent capacity.
//!
//! All values are in microseconds.

use super::config::{CsConfig, ProcedureParams};
use super::{
    Aci, Role, StepMode, SyncPhy, CS_MAX_STEPS_PER_SUBEVENT, CS_MAX_SUBEVENT_LEN_US,
    CS_MIN_STEPS_PER_SUBEVENT, CS_MIN_SUBEVENT_LEN_US,
};
use crate::time::Duration;
use crate::Error;

/// Ramp-down time after a transmission.
pub const T_RD: Duration = Duration::from_micros(5);

/// Guard time before a tone following a CS_SYNC packet.
pub const T_GD: Duration = Duration::from_micros(10);

/// Frequency measurement period of mode-0 steps.
pub const T_FM: Duration = Duration::from_micros(80);

/// Permitted `T_IP1`/`T_IP2` values.
pub const T_IP_OPTIONS: [u8; 8] = [10, 20, 30, 40, 50, 60, 80, 145];

/// Permitted `T_FCS` values.
pub const T_FCS_OPTIONS: [u8; 10] = [15, 20, 30, 40, 50, 60, 80, 100, 120, 150];

/// Permitted `T_PM` values.
pub const T_PM_OPTIONS: [u8; 3] = [10, 20, 40];

/// Permitted antenna switch periods (`T_SW`).
pub const T_SW_OPTIONS: [u8; 5] = [0, 1, 2, 4, 10];

fn micros(value: u8) -> Duration {
    Duration::from_micros(value.into())
}

/// Returns the air time of a CS_SYNC packet carrying `payload_len` bytes after the access address.
pub fn t_sync(phy: SyncPhy, payload_len: u8) -> Duration {
    let payload_bits = u32::from(payload_len) * 8;
    match phy {
        // 8 bit preamble, 32 bit access address, 4 bit trailer
        SyncPhy::Le1M | SyncPhy::Unknown(_) => Duration::from_micros(44 + payload_bits),
        // 16 bit preamble at 2 Mbit/s
        SyncPhy::Le2M | SyncPhy::Le2M2Bt => Duration::from_micros(26 + payload_bits / 2),
    }
}

fn tone_exchange(config: &CsConfig, num_antenna_paths: u8, t_sw: u8) -> Duration {
    (micros(t_sw) + micros(config.timing.t_pm)) * (u32::from(num_antenna_paths) + 1)
}

/// Duration of a mode-0 step.
pub fn mode0_duration(config: &CsConfig) -> Duration {
    let t_sy = t_sync(config.sync_phy, 0);
    micros(config.timing.t_fcs)
        + (t_sy + T_RD) * 2
        + micros(config.timing.t_ip1)
        + T_GD
        + T_FM
}

/// Duration of a mode-1 step.
pub fn mode1_duration(config: &CsConfig) -> Duration {
    let t_sy = t_sync(config.sync_phy, config.rtt_type.payload_len());
    micros(config.timing.t_fcs) + (t_sy + T_RD) * 2 + micros(config.timing.t_ip1)
}

/// Duration of a mode-2 step.
pub fn mode2_duration(config: &CsConfig, num_antenna_paths: u8, t_sw: u8) -> Duration {
    micros(config.timing.t_fcs)
        + micros(config.timing.t_ip2)
        + (tone_exchange(config, num_antenna_paths, t_sw) + T_RD) * 2
}

/// Duration of a mode-3 step.
pub fn mode3_duration(config: &CsConfig, num_antenna_paths: u8, t_sw: u8) -> Duration {
    let t_sy = t_sync(config.sync_phy, config.rtt_type.payload_len());
    micros(config.timing.t_fcs)
        + micros(config.timing.t_ip2)
        + (t_sy + T_GD + tone_exchange(config, num_antenna_paths, t_sw) + T_RD) * 2
}

/// Duration of a step of `mode`.
pub fn step_duration(config: &CsConfig, mode: StepMode, num_antenna_paths: u8, t_sw: u8) -> Duration {
    match mode {
        StepMode::Mode0 => mode0_duration(config),
        StepMode::Mode1 => mode1_duration(config),
        StepMode::Mode2 => mode2_duration(config, num_antenna_paths, t_sw),
        StepMode::Mode3 => mode3_duration(config, num_antenna_paths, t_sw),
    }
}

/// Returns the number of steps (including the mode-0 steps) that fit into one subevent.
///
/// Non-mode-0 steps are all accounted with the duration of the longer of main mode and sub-mode,
/// so the steps never overrun the subevent. The result is capped at
/// [`CS_MAX_STEPS_PER_SUBEVENT`].
///
/// Returns `Error::InvalidRange` if the subevent length is out of range, or if the subevent
/// cannot hold the mode-0 steps, one main-mode step, and at least
/// [`CS_MIN_STEPS_PER_SUBEVENT`] steps in total.
///
/// [`CS_MAX_STEPS_PER_SUBEVENT`]: ../constant.CS_MAX_STEPS_PER_SUBEVENT.html
/// [`CS_MIN_STEPS_PER_SUBEVENT`]: ../constant.CS_MIN_STEPS_PER_SUBEVENT.html
pub fn num_steps_per_subevent(
    config: &CsConfig,
    params: &ProcedureParams,
    t_sw: u8,
) -> Result<u8, Error> {
    if !(CS_MIN_SUBEVENT_LEN_US..=CS_MAX_SUBEVENT_LEN_US).contains(&params.subevent_len) {
        return Err(Error::InvalidRange);
    }
    let n_ap = params.aci.num_antenna_paths();
    let mode0 = mode0_duration(config) * u32::from(config.mode0_steps);
    let available = Duration::from_micros(params.subevent_len)
        .checked_sub(mode0)
        .ok_or(Error::InvalidRange)?;

    let mut per_step = step_duration(config, config.main_mode, n_ap, t_sw);
    if let Some(sub) = config.sub_mode {
        per_step = per_step.max(step_duration(config, sub, n_ap, t_sw));
    }
    let main_steps = available.as_micros() / per_step.as_micros().max(1);
    if main_steps == 0 {
        return Err(Error::InvalidRange);
    }

    let total = (u32::from(config.mode0_steps) + main_steps).min(CS_MAX_STEPS_PER_SUBEVENT.into());
    if total < CS_MIN_STEPS_PER_SUBEVENT.into() {
        return Err(Error::InvalidRange);
    }
    Ok(total as u8)
}

/// Selects the antenna switch period for `aci`.
///
/// Only devices switching between more than one antenna contribute their switch period. Returns
/// `Error::InvalidRange` if a switch period is not one of [`T_SW_OPTIONS`].
///
/// [`T_SW_OPTIONS`]: constant.T_SW_OPTIONS.html
pub fn antenna_switch_time(aci: Aci, role: Role, local_t_sw: u8, remote_t_sw: u8) -> Result<u8, Error> {
    if !T_SW_OPTIONS.contains(&local_t_sw) || !T_SW_OPTIONS.contains(&remote_t_sw) {
        return Err(Error::InvalidRange);
    }
    let (initiator_t_sw, reflector_t_sw) = match role {
        Role::Initiator => (local_t_sw, remote_t_sw),
        Role::Reflector => (remote_t_sw, local_t_sw),
    };
    let (initiator_antennas, reflector_antennas) = aci.antennas();
    let initiator = if initiator_antennas > 1 { initiator_t_sw } else { 0 };
    let reflector = if reflector_antennas > 1 { reflector_t_sw } else { 0 };
    Ok(initiator.max(reflector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cs::config::tests::{config, params};
    use crate::cs::RttType;

    #[test]
    fn sync_durations() {
        assert_eq!(t_sync(SyncPhy::Le1M, 0).as_micros(), 44);
        assert_eq!(t_sync(SyncPhy::Le1M, 16).as_micros(), 172);
        assert_eq!(t_sync(SyncPhy::Le2M, 0).as_micros(), 26);
        assert_eq!(t_sync(SyncPhy::Le2M, 4).as_micros(), 42);
    }

    #[test]
    fn mode_durations() {
        let mut c = config();
        assert_eq!(mode0_duration(&c).as_micros(), 268);
        assert_eq!(mode1_duration(&c).as_micros(), 178);
        assert_eq!(mode2_duration(&c, 1, 0).as_micros(), 130);
        assert_eq!(mode2_duration(&c, 4, 4).as_micros(), 230);
        assert_eq!(mode3_duration(&c, 1, 0).as_micros(), 238);

        c.rtt_type = RttType::RandomSequence128;
        assert_eq!(mode1_duration(&c).as_micros(), 434);
        assert_eq!(step_duration(&c, StepMode::Mode0, 1, 0).as_micros(), 268);
    }

    #[test]
    fn steps_per_subevent() {
        let c = config();
        let mut p = params();
        assert_eq!(num_steps_per_subevent(&c, &p, 0), Ok(73));
        p.subevent_len = 1_250;
        assert_eq!(num_steps_per_subevent(&c, &p, 0), Ok(6));
        p.subevent_len = 4_000_000;
        assert_eq!(num_steps_per_subevent(&c, &p, 0), Ok(160));
        p.subevent_len = 1_000;
        assert_eq!(num_steps_per_subevent(&c, &p, 0), Err(Error::InvalidRange));
    }

    #[test]
    fn mode0_steps_must_fit() {
        let mut c = config();
        c.timing.t_fcs = 150;
        c.timing.t_ip1 = 145;
        c.rtt_type = RttType::RandomSequence128;
        c.main_mode = StepMode::Mode3;
        let mut p = params();
        p.subevent_len = 1_250;
        p.aci = Aci::A2B2;
        assert_eq!(num_steps_per_subevent(&c, &p, 10), Err(Error::InvalidRange));
    }

    #[test]
    fn steps_never_overrun() {
        let mut c = config();
        c.sub_mode = Some(StepMode::Mode1);
        c.main_mode_min_steps = 1;
        c.main_mode_max_steps = 3;
        c.rtt_type = RttType::RandomSequence64;
        for &aci in &[Aci::A1B1, Aci::A2B1, Aci::A1B4, Aci::A2B2] {
            for len in (1_250..200_000).step_by(3_331) {
                let mut p = params();
                p.aci = aci;
                p.subevent_len = len;
                let n_ap = aci.num_antenna_paths();
                if let Ok(steps) = num_steps_per_subevent(&c, &p, 4) {
                    assert!(steps <= CS_MAX_STEPS_PER_SUBEVENT);
                    let main = step_duration(&c, StepMode::Mode2, n_ap, 4)
                        .max(step_duration(&c, StepMode::Mode1, n_ap, 4));
                    let used = mode0_duration(&c) * u32::from(c.mode0_steps)
                        + main * u32::from(steps - c.mode0_steps);
                    assert!(used.as_micros() <= len, "{} steps overrun {}us", steps, len);
                }
            }
        }
    }

    #[test]
    fn switch_time() {
        assert_eq!(antenna_switch_time(Aci::A1B1, Role::Initiator, 10, 10), Ok(0));
        assert_eq!(antenna_switch_time(Aci::A2B1, Role::Initiator, 4, 10), Ok(4));
        assert_eq!(antenna_switch_time(Aci::A2B1, Role::Reflector, 4, 10), Ok(10));
        assert_eq!(antenna_switch_time(Aci::A2B2, Role::Reflector, 1, 2), Ok(2));
        assert_eq!(antenna_switch_time(Aci::A1B2, Role::Initiator, 0, 3), Err(Error::InvalidRange));
    }
}
