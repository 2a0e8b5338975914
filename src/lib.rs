/*
Copyright (c) 2020 Todd Stellanova
LICENSE: BSD3 (see LICENSE file)
*/
#![cfg_attr(not(test), no_std)]

//! Control and timing driver for the Sony IMX678 image sensor
//! This imaging sensor has multiple interfaces:
//! - Two-wire i2c for configuration registers (i2c)
//! - MIPI CSI-2 pixel data out, on 2 or 4 lanes
//! - frame sync in/out (XVS, XHS)
//! This driver is concerned only with the i2c interface. It maps camera
//! controls onto the sensor's timing registers and sequences the sensor
//! between standby and streaming.

#[macro_use]
mod macros;

pub mod bus;
pub mod config;
pub mod controls;
pub mod modes;
pub mod power;
pub mod regs;
pub mod sensor;
pub mod timing;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError, LinkConfig, SyncMode, DEFAULT_I2C_ADDRESS};
pub use controls::{ControlId, ControlInfo, GainMode};
pub use modes::{BusFormat, Rect, SelectionTarget, SensorMode, SUPPORTED_MODES};
pub use power::{GpioPowerSequencer, PowerSequencer};
pub use sensor::{Imx678, StreamState, TimingState};

/// Errors in this crate
#[derive(Debug)]
pub enum Error<CommE, PwrE> {
    /// Sensor communication error
    Comm(CommE),

    /// The power sequencer failed to bring the sensor up or down
    Power(PwrE),

    /// Bring-up configuration the sensor cannot run with
    Config(ConfigError),

    /// Control value outside the range published when it was written
    OutOfRange {
        control: ControlId,
        value: u32,
        min: u32,
        max: u32,
    },

    /// The control is fixed by the mode and link
    ReadOnly(ControlId),

    /// Not allowed while the sensor is streaming
    Busy,

    /// No mode is offered for this media bus format code
    UnsupportedFormat(u32),
}

impl<CommE, PwrE> From<ConfigError> for Error<CommE, PwrE> {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}
