/*
Copyright (c) 2020 Todd Stellanova
LICENSE: BSD3 (see LICENSE file)
*/

//! Bring-up configuration: MIPI link, input clock and sync mode.
//! Everything here is validated once, before the device is usable.

use core::fmt;

/// Default 7-bit i2c address of the IMX678
pub const DEFAULT_I2C_ADDRESS: u8 = 0x1A;

/// Number of link frequency tiers the sensor supports
pub const LINK_FREQ_TIERS: usize = 8;

/// Link frequencies in Hz, indexed by tier
pub const LINK_FREQS: [u64; LINK_FREQ_TIERS] = [
    297_000_000,
    360_000_000,
    445_500_000,
    594_000_000,
    720_000_000,
    891_000_000,
    1_039_500_000,
    1_188_000_000,
];

/// DATARATE_SEL value for each tier
const LINK_FREQ_REG_VALUES: [u8; LINK_FREQ_TIERS] = [0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, 0x00];

/// Minimum HMAX of the 4-lane all-pixel readout for each tier.
/// Doubles with 2 lanes; each mode scales it down by its own divisor.
const HMAX_BASE_4LANE: [u16; LINK_FREQ_TIERS] = [1584, 1320, 1100, 792, 660, 550, 440, 396];

/// (input clock Hz, INCK_SEL value)
const INCK_TABLE: [(u32, u8); 8] = [
    (74_250_000, 0x00),
    (37_125_000, 0x01),
    (72_000_000, 0x02),
    (27_000_000, 0x03),
    (24_000_000, 0x04),
    (36_000_000, 0x05),
    (18_000_000, 0x06),
    (13_500_000, 0x07),
];

/// Bring-up failures. Any of these makes the device unusable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Only 2 and 4 data lanes are wired up on this sensor
    UnsupportedLaneCount(u8),
    /// Link frequency in Hz is not one of the supported tiers
    UnsupportedLinkFrequency(u64),
    /// Link tier index out of range
    UnsupportedLinkIndex(usize),
    /// Input clock rate in Hz has no INCK_SEL setting
    UnsupportedClock(u32),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnsupportedLaneCount(n) => {
                write!(f, "only 2 or 4 data lanes are supported, got {}", n)
            }
            ConfigError::UnsupportedLinkFrequency(hz) => {
                write!(f, "link frequency not supported: {} Hz", hz)
            }
            ConfigError::UnsupportedLinkIndex(idx) => {
                write!(f, "link frequency index out of range: {}", idx)
            }
            ConfigError::UnsupportedClock(hz) => {
                write!(f, "unsupported XCLK rate {} Hz", hz)
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LaneCount {
    Two = 2,
    Four = 4,
}

impl LaneCount {
    pub fn from_count(lanes: u8) -> Result<Self, ConfigError> {
        match lanes {
            2 => Ok(LaneCount::Two),
            4 => Ok(LaneCount::Four),
            other => Err(ConfigError::UnsupportedLaneCount(other)),
        }
    }

    /// LANEMODE register value
    pub fn lane_mode(self) -> u8 {
        match self {
            LaneCount::Two => 0x01,
            LaneCount::Four => 0x03,
        }
    }
}

/// Negotiated MIPI link, fixed once the board description has been read.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    lanes: LaneCount,
    freq_index: usize,
}

impl LinkConfig {
    pub fn new(lanes: u8, freq_index: usize) -> Result<Self, ConfigError> {
        let lanes = LaneCount::from_count(lanes)?;
        if freq_index >= LINK_FREQ_TIERS {
            return Err(ConfigError::UnsupportedLinkIndex(freq_index));
        }
        Ok(Self { lanes, freq_index })
    }

    /// Resolve a link frequency in Hz (as a board description gives it) to its tier.
    pub fn from_frequency(lanes: u8, link_freq_hz: u64) -> Result<Self, ConfigError> {
        let idx = LINK_FREQS
            .iter()
            .position(|&hz| hz == link_freq_hz)
            .ok_or(ConfigError::UnsupportedLinkFrequency(link_freq_hz))?;
        Self::new(lanes, idx)
    }

    pub fn lanes(&self) -> LaneCount {
        self.lanes
    }

    pub fn freq_index(&self) -> usize {
        self.freq_index
    }

    pub fn link_freq_hz(&self) -> u64 {
        LINK_FREQS[self.freq_index]
    }

    /// DATARATE_SEL register value
    pub fn data_rate_sel(&self) -> u8 {
        LINK_FREQ_REG_VALUES[self.freq_index]
    }

    /// Minimum HMAX of the all-pixel readout on this link, before any mode divisor
    pub fn hmax_base(&self) -> u32 {
        let base = HMAX_BASE_4LANE[self.freq_index] as u32;
        match self.lanes {
            LaneCount::Two => base * 2,
            LaneCount::Four => base,
        }
    }
}

/// Frame sync arrangement between the sensor and the rest of the system
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Sensor generates XVS and XHS and drives both out
    InternalLeader = 0,
    /// Sensor generates XHS, but aligns its frames to an XVS input
    ExternalLeader = 1,
    /// Both XVS and XHS are inputs
    Follower = 2,
}

impl SyncMode {
    /// Out of range values fall back to internal leader.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => SyncMode::InternalLeader,
            1 => SyncMode::ExternalLeader,
            2 => SyncMode::Follower,
            other => {
                log_warn!("sync-mode {} out of range, using 0", other);
                SyncMode::InternalLeader
            }
        }
    }

    pub fn is_leader(self) -> bool {
        self != SyncMode::Follower
    }

    pub fn name(self) -> &'static str {
        match self {
            SyncMode::InternalLeader => "Internal Sync Leader Mode",
            SyncMode::ExternalLeader => "External Sync Leader Mode",
            SyncMode::Follower => "Follower Mode",
        }
    }
}

/// Everything the board description supplies at bring-up
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    pub i2c_address: u8,
    pub lanes: u8,
    pub link_freq_hz: u64,
    pub xclk_hz: u32,
    pub sync_mode: SyncMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            i2c_address: DEFAULT_I2C_ADDRESS,
            lanes: 4,
            link_freq_hz: LINK_FREQS[5],
            xclk_hz: 24_000_000,
            sync_mode: SyncMode::InternalLeader,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let link = LinkConfig::from_frequency(self.lanes, self.link_freq_hz)?;
        let inck_sel = inck_sel_for(self.xclk_hz)?;
        log_info!(
            "data lanes: {}, link speed: {} Hz, XCLK {} Hz -> INCK_SEL 0x{:02x}, {}",
            self.lanes,
            self.link_freq_hz,
            self.xclk_hz,
            inck_sel,
            self.sync_mode.name()
        );
        Ok(ValidatedConfig {
            i2c_address: self.i2c_address,
            link,
            inck_sel,
            sync_mode: self.sync_mode,
        })
    }
}

/// Configuration after all table lookups have succeeded
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ValidatedConfig {
    pub i2c_address: u8,
    pub link: LinkConfig,
    pub inck_sel: u8,
    pub sync_mode: SyncMode,
}

/// INCK_SEL register value for an input clock rate
pub fn inck_sel_for(xclk_hz: u32) -> Result<u8, ConfigError> {
    INCK_TABLE
        .iter()
        .find(|(hz, _)| *hz == xclk_hz)
        .map(|(_, sel)| *sel)
        .ok_or(ConfigError::UnsupportedClock(xclk_hz))
}
