//! Sense-power rail and the latching valve that shares it.
//!
//! The valve is driven through an H-bridge between `Aux` and `SensePower`.
//! A short pulse in one direction latches it open, the other direction
//! latches it closed. Both lines rest low.

use log::{debug, info};

use crate::{
    config::OutputConfig,
    io::{OutputLine, Outputs, Sensors},
    types::OperatingMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputAction {
    SensePower { on: bool },
    ValvePulse { open: bool },
}

/// Powers the soil sensor only for the duration of the read.
pub fn read_soil_powered(
    sensors: &mut dyn Sensors,
    outputs: &mut dyn Outputs,
    cfg: &OutputConfig,
) -> Option<u16> {
    outputs.set_line(OutputLine::SensePower, true);
    outputs.hold(cfg.soil_settle_ms);
    let raw = sensors.read_soil_raw();
    outputs.set_line(OutputLine::SensePower, false);
    debug!("soil sensor read {raw:?}");
    raw
}

/// Output request from the portal. Valve nodes pulse the bridge; every other
/// mode switches the sense-power rail and leaves it there.
pub fn switch_output(
    mode: OperatingMode,
    on: bool,
    outputs: &mut dyn Outputs,
    cfg: &OutputConfig,
) -> OutputAction {
    if mode != OperatingMode::LatchingValve {
        info!("sense power {}", if on { "on" } else { "off" });
        outputs.set_line(OutputLine::SensePower, on);
        return OutputAction::SensePower { on };
    }

    let (drive, ground) = if on {
        (OutputLine::Aux, OutputLine::SensePower)
    } else {
        (OutputLine::SensePower, OutputLine::Aux)
    };
    info!(
        "pulsing valve {} for {}ms",
        if on { "open" } else { "closed" },
        cfg.valve_pulse_ms
    );
    outputs.set_line(ground, false);
    outputs.set_line(drive, true);
    outputs.hold(cfg.valve_pulse_ms);
    outputs.set_line(drive, false);
    OutputAction::ValvePulse { open: on }
}
