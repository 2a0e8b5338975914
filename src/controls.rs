/*
Copyright (c) 2020 Todd Stellanova
LICENSE: BSD3 (see LICENSE file)
*/

//! User facing controls: their published ranges and current values.
//!
//! Ranges move with the active mode (blanking, exposure) and the gain mode
//! (analog gain). Whenever a range moves the current value is clamped into
//! it, so a stale value can never be replayed to the sensor.

use crate::regs::{
    ANA_GAIN_DEFAULT, ANA_GAIN_MAX_NORMAL, ANA_GAIN_MIN_HCG, ANA_GAIN_MIN_NORMAL, ANA_GAIN_STEP,
    BLKLEVEL_DEFAULT, EXPOSURE_DEFAULT, EXPOSURE_MAX, EXPOSURE_MIN, EXPOSURE_STEP, HMAX_MAX,
    VMAX_MAX,
};
use crate::timing::{self, FramingLimits};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlId {
    /// Read only, fixed by mode and link
    PixelRate,
    /// Read only, fixed at bring-up
    LinkFreq,
    /// Exposure in lines
    Exposure,
    /// Analog gain in register units
    AnalogGain,
    /// 0 = low conversion gain, 1 = high conversion gain
    GainMode,
    VBlank,
    HBlank,
    HFlip,
    VFlip,
    BlackLevel,
}

/// Order in which controls are written back to the sensor at stream start
pub const REPLAY_ORDER: [ControlId; 8] = [
    ControlId::VBlank,
    ControlId::HBlank,
    ControlId::BlackLevel,
    ControlId::Exposure,
    ControlId::AnalogGain,
    ControlId::HFlip,
    ControlId::VFlip,
    ControlId::GainMode,
];

/// Conversion gain of the pixel, selected through FDG_SEL
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GainMode {
    /// Low conversion gain
    Normal = 0,
    HighConversionGain = 1,
}

impl GainMode {
    pub fn from_flag(flag: u32) -> Self {
        if flag != 0 {
            GainMode::HighConversionGain
        } else {
            GainMode::Normal
        }
    }

    /// Analog gain range available in this mode.
    /// HDR would lower the ceiling, but it is never selected here.
    pub fn gain_range(self) -> (u32, u32) {
        match self {
            GainMode::Normal => (ANA_GAIN_MIN_NORMAL, ANA_GAIN_MAX_NORMAL),
            GainMode::HighConversionGain => (ANA_GAIN_MIN_HCG, ANA_GAIN_MAX_NORMAL),
        }
    }
}

/// Snapshot of a control as reported to callers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlInfo {
    pub min: u64,
    pub max: u64,
    pub step: u64,
    pub default: u64,
    pub value: u64,
    pub read_only: bool,
    /// Held immutable while streaming
    pub grabbed: bool,
}

/// Value rejected against the range published at the time of the write
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RangeViolation {
    pub min: u32,
    pub max: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Control {
    min: u32,
    max: u32,
    step: u32,
    default: u32,
    value: u32,
    grabbed: bool,
}

impl Control {
    pub const fn new(min: u32, max: u32, step: u32, default: u32) -> Self {
        Self {
            min,
            max,
            step,
            default,
            value: default,
            grabbed: false,
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn default_value(&self) -> u32 {
        self.default
    }

    pub fn is_grabbed(&self) -> bool {
        self.grabbed
    }

    pub fn grab(&mut self, grabbed: bool) {
        self.grabbed = grabbed;
    }

    pub fn clamp(&self, value: u32) -> u32 {
        value.max(self.min).min(self.max)
    }

    pub fn validate(&self, value: u32) -> Result<(), RangeViolation> {
        let on_step = self.step <= 1 || (value.wrapping_sub(self.min)) % self.step == 0;
        if value < self.min || value > self.max || !on_step {
            return Err(RangeViolation {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    /// Store a value already checked with `validate`
    pub fn set(&mut self, value: u32) {
        self.value = value;
    }

    /// Publish a new range and clamp the current value into it.
    /// Returns true when the current value had to move.
    pub fn modify_range(&mut self, min: u32, max: u32, default: u32) -> bool {
        self.min = min;
        self.max = max.max(min);
        self.default = self.clamp(default);
        let clamped = self.clamp(self.value);
        let moved = clamped != self.value;
        self.value = clamped;
        moved
    }

    fn info(&self) -> ControlInfo {
        ControlInfo {
            min: self.min as u64,
            max: self.max as u64,
            step: self.step as u64,
            default: self.default as u64,
            value: self.value as u64,
            read_only: false,
            grabbed: self.grabbed,
        }
    }
}

/// Every control of one device instance
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlSet {
    pixel_rate: u64,
    link_freq: u64,
    pub exposure: Control,
    pub analog_gain: Control,
    pub gain_mode: Control,
    pub vblank: Control,
    pub hblank: Control,
    pub hflip: Control,
    pub vflip: Control,
    pub black_level: Control,
}

impl ControlSet {
    /// Controls with their bring-up ranges. Mode dependent ranges are
    /// placeholders until `apply_framing` runs.
    pub fn new(link_freq: u64) -> Self {
        Self {
            pixel_rate: 0xFFFF,
            link_freq,
            exposure: Control::new(EXPOSURE_MIN, EXPOSURE_MAX, EXPOSURE_STEP, EXPOSURE_DEFAULT),
            analog_gain: Control::new(
                ANA_GAIN_MIN_NORMAL,
                ANA_GAIN_MAX_NORMAL,
                ANA_GAIN_STEP,
                ANA_GAIN_DEFAULT,
            ),
            gain_mode: Control::new(0, 1, 1, GainMode::Normal as u32),
            vblank: Control::new(0, VMAX_MAX, 1, 0),
            hblank: Control::new(0, HMAX_MAX, 1, 0),
            hflip: Control::new(0, 1, 1, 0),
            vflip: Control::new(0, 1, 1, 0),
            // the register is 12 bits wide, larger values are clamped on write
            black_level: Control::new(0, 0xFFFF, 1, BLKLEVEL_DEFAULT),
        }
    }

    pub fn pixel_rate(&self) -> u64 {
        self.pixel_rate
    }

    pub fn link_freq(&self) -> u64 {
        self.link_freq
    }

    pub fn set_link_freq(&mut self, hz: u64) {
        self.link_freq = hz;
    }

    pub fn gain_mode(&self) -> GainMode {
        GainMode::from_flag(self.gain_mode.value())
    }

    /// Writable control behind an id; None for the read-only ones
    pub fn get_mut(&mut self, id: ControlId) -> Option<&mut Control> {
        match id {
            ControlId::PixelRate | ControlId::LinkFreq => None,
            ControlId::Exposure => Some(&mut self.exposure),
            ControlId::AnalogGain => Some(&mut self.analog_gain),
            ControlId::GainMode => Some(&mut self.gain_mode),
            ControlId::VBlank => Some(&mut self.vblank),
            ControlId::HBlank => Some(&mut self.hblank),
            ControlId::HFlip => Some(&mut self.hflip),
            ControlId::VFlip => Some(&mut self.vflip),
            ControlId::BlackLevel => Some(&mut self.black_level),
        }
    }

    pub fn get(&self, id: ControlId) -> Option<&Control> {
        match id {
            ControlId::PixelRate | ControlId::LinkFreq => None,
            ControlId::Exposure => Some(&self.exposure),
            ControlId::AnalogGain => Some(&self.analog_gain),
            ControlId::GainMode => Some(&self.gain_mode),
            ControlId::VBlank => Some(&self.vblank),
            ControlId::HBlank => Some(&self.hblank),
            ControlId::HFlip => Some(&self.hflip),
            ControlId::VFlip => Some(&self.vflip),
            ControlId::BlackLevel => Some(&self.black_level),
        }
    }

    pub fn info(&self, id: ControlId) -> ControlInfo {
        let fixed = |v: u64| ControlInfo {
            min: v,
            max: v,
            step: 1,
            default: v,
            value: v,
            read_only: true,
            grabbed: false,
        };
        match id {
            ControlId::PixelRate => fixed(self.pixel_rate),
            ControlId::LinkFreq => fixed(self.link_freq),
            other => match self.get(other) {
                Some(ctrl) => ctrl.info(),
                None => fixed(0),
            },
        }
    }

    pub fn value(&self, id: ControlId) -> u64 {
        self.info(id).value
    }

    /// Publish the ranges of a newly selected mode and reset blanking to
    /// the mode defaults. Exposure keeps its value unless it falls outside.
    pub fn apply_framing(&mut self, limits: &FramingLimits) {
        self.pixel_rate = limits.pixel_rate;

        self.hblank
            .modify_range(limits.hblank.min, limits.hblank.max, limits.hblank.default);
        self.hblank.set(limits.hblank.default);

        self.vblank
            .modify_range(limits.vblank.min, limits.vblank.max, limits.vblank.default);
        self.vblank.set(limits.vblank.default);

        self.exposure.modify_range(
            limits.exposure.min,
            limits.exposure.max,
            limits.exposure.default,
        );
    }

    /// Republish the exposure range for a frame of `vmax` lines.
    /// Returns true when the current exposure was pulled down.
    pub fn update_exposure_limits(&mut self, vmax: u32) -> bool {
        let max = timing::exposure_max(vmax);
        let default = self.exposure.default_value();
        self.exposure.modify_range(EXPOSURE_MIN, max, default)
    }

    /// Republish the analog gain range for the current gain mode.
    /// Returns true when the current gain had to be clamped.
    pub fn update_gain_limits(&mut self) -> bool {
        let (min, max) = self.gain_mode().gain_range();
        let default = self.analog_gain.default_value();
        self.analog_gain.modify_range(min, max, default)
    }

    /// Flips cannot change while the sensor is streaming
    pub fn grab_flips(&mut self, grabbed: bool) {
        self.hflip.grab(grabbed);
        self.vflip.grab(grabbed);
    }
}
