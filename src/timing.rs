/*
Copyright (c) 2020 Todd Stellanova
LICENSE: BSD3 (see LICENSE file)
*/

//! Line and frame timing derived from the readout mode and the MIPI link.
//!
//! HMAX is counted in periods of the 74.25 MHz reference clock, VMAX in lines.
//! The link decides how short a line may be; the minimum HMAX of each mode is
//! derived once per link and cached here, leaving the static mode table alone.

use crate::config::LinkConfig;
use crate::modes::{self, SensorMode, MODE_COUNT, SUPPORTED_MODES};
use crate::regs::{EXPOSURE_DEFAULT, EXPOSURE_MIN, HMAX_MAX, PIXEL_RATE, SHR_MIN, VMAX_MAX};

/// Inclusive control range with the value the control resets to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Range {
    pub min: u32,
    pub max: u32,
    pub default: u32,
}

/// Everything published when a mode becomes active
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FramingLimits {
    pub pixel_rate: u64,
    pub hblank: Range,
    pub vblank: Range,
    pub exposure: Range,
    pub default_hmax: u32,
    pub default_vmax: u32,
}

/// Per-instance minimum line lengths for every mode
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimingEngine {
    min_hmax: [u32; MODE_COUNT],
}

impl TimingEngine {
    pub fn new(link: &LinkConfig) -> Self {
        let mut engine = Self {
            min_hmax: [0; MODE_COUNT],
        };
        engine.configure_link(link);
        engine
    }

    /// Recompute the minimum HMAX of every mode for a link
    pub fn configure_link(&mut self, link: &LinkConfig) {
        let base = link.hmax_base();
        log_info!(
            "update minimum HMAX: base {} for {:?} lanes",
            base,
            link.lanes()
        );
        for (slot, mode) in self.min_hmax.iter_mut().zip(SUPPORTED_MODES.iter()) {
            *slot = base / mode.hmax_div;
        }
    }

    /// Minimum HMAX of a mode on the configured link.
    /// Modes outside the table fall back to their own table value.
    pub fn min_hmax(&self, mode: &SensorMode) -> u32 {
        modes::index_of(mode)
            .map(|idx| self.min_hmax[idx])
            .unwrap_or(mode.min_hmax)
    }

    /// Default HMAX equals the minimum: the fastest line the link allows
    pub fn default_hmax(&self, mode: &SensorMode) -> u32 {
        self.min_hmax(mode)
    }

    /// Pixel rate in pixels per second
    pub fn pixel_rate(&self, mode: &SensorMode) -> u64 {
        mode.width as u64 * PIXEL_RATE / self.min_hmax(mode) as u64
    }

    pub fn limits(&self, mode: &SensorMode) -> FramingLimits {
        let pixel_rate = self.pixel_rate(mode);
        let default_hmax = self.default_hmax(mode);

        let default_hblank = blank_for_line(default_hmax, pixel_rate, mode.width);
        let max_hblank = blank_for_line(HMAX_MAX, pixel_rate, mode.width);

        let exposure_max = exposure_max(mode.default_vmax);

        FramingLimits {
            pixel_rate,
            hblank: Range {
                min: 0,
                max: max_hblank,
                default: default_hblank,
            },
            vblank: Range {
                min: mode.min_vmax - mode.height,
                max: VMAX_MAX - mode.height,
                default: mode.default_vmax - mode.height,
            },
            exposure: Range {
                min: EXPOSURE_MIN,
                max: exposure_max,
                default: EXPOSURE_DEFAULT.min(exposure_max),
            },
            default_hmax,
            default_vmax: mode.default_vmax,
        }
    }

    /// HMAX for a horizontal blanking in pixels
    pub fn hmax_for_hblank(&self, mode: &SensorMode, hblank: u32) -> u32 {
        let hmax = (mode.width as u64 + hblank as u64) * PIXEL_RATE / self.pixel_rate(mode);
        hmax.min(HMAX_MAX as u64) as u32
    }
}

/// Pixels of blanking in a line of `hmax` reference clocks
fn blank_for_line(hmax: u32, pixel_rate: u64, width: u32) -> u32 {
    let line = hmax as u64 * pixel_rate / PIXEL_RATE;
    line.saturating_sub(width as u64) as u32
}

/// Frame length for a vertical blanking in lines; always even
pub fn vmax_for_vblank(mode: &SensorMode, vblank: u32) -> u32 {
    mode.height.saturating_add(vblank).min(VMAX_MAX) & !1
}

/// Shutter position for an exposure in lines; always even
pub fn shr_for_exposure(vmax: u32, exposure: u32) -> u32 {
    vmax.saturating_sub(exposure) & !1
}

/// Longest exposure a frame of `vmax` lines allows
pub fn exposure_max(vmax: u32) -> u32 {
    vmax.saturating_sub(SHR_MIN).max(EXPOSURE_MIN)
}
