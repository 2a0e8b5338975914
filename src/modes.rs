/*
Copyright (c) 2020 Todd Stellanova
LICENSE: BSD3 (see LICENSE file)
*/

//! Static catalog of readout modes and the media bus formats they are offered in.

use crate::regs::{MODE_1080_REGS, MODE_4K_REGS, VMAX_DEFAULT};

/// Native array, including the optical black and margin pixels
pub const NATIVE_WIDTH: u32 = 3856;
pub const NATIVE_HEIGHT: u32 = 2180;

/// Active pixel array
pub const PIXEL_ARRAY_LEFT: u32 = 8;
pub const PIXEL_ARRAY_TOP: u32 = 8;
pub const PIXEL_ARRAY_WIDTH: u32 = 3840;
pub const PIXEL_ARRAY_HEIGHT: u32 = 2160;

/// Embedded metadata stream geometry
pub const EMBEDDED_LINE_WIDTH: u32 = 16384;
pub const NUM_EMBEDDED_LINES: u32 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

const PIXEL_ARRAY: Rect = Rect {
    left: PIXEL_ARRAY_LEFT,
    top: PIXEL_ARRAY_TOP,
    width: PIXEL_ARRAY_WIDTH,
    height: PIXEL_ARRAY_HEIGHT,
};

/// Media bus format codes
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusFormat {
    Sbggr12 = 0x3008,
    Sgbrg12 = 0x3010,
    Sgrbg12 = 0x3011,
    Srggb12 = 0x3012,
    /// Embedded metadata lines
    SensorData = 0x7002,
}

/// Bayer orders in flip order: none, h flip, v flip, h and v flip.
/// The IMX678 shifts its readout window on flip, so the negotiated order is kept.
pub const BAYER_CODES: [BusFormat; 4] = [
    BusFormat::Srggb12,
    BusFormat::Sgrbg12,
    BusFormat::Sgbrg12,
    BusFormat::Sbggr12,
];

impl BusFormat {
    pub fn from_code(code: u32) -> Option<Self> {
        BAYER_CODES
            .iter()
            .chain(core::iter::once(&BusFormat::SensorData))
            .copied()
            .find(|f| *f as u32 == code)
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// One readout mode. Immutable for the life of the program.
#[derive(Debug, PartialEq, Eq)]
pub struct SensorMode {
    pub width: u32,
    pub height: u32,
    /// Scales the link-derived minimum HMAX down for this readout
    pub hmax_div: u32,
    /// Table HMAX values; the driver derives the live ones from the link
    pub min_hmax: u32,
    pub default_hmax: u32,
    pub min_vmax: u32,
    pub default_vmax: u32,
    /// Analog crop rectangle
    pub crop: Rect,
    /// Applied verbatim each time streaming starts in this mode
    pub regs: &'static [(u16, u8)],
}

/// Number of entries in `SUPPORTED_MODES`
pub const MODE_COUNT: usize = 2;

pub static SUPPORTED_MODES: [SensorMode; MODE_COUNT] = [
    // 1080p, 2x2 binned
    SensorMode {
        width: 1928,
        height: 1090,
        hmax_div: 1,
        min_hmax: 366,
        default_hmax: 366,
        min_vmax: VMAX_DEFAULT,
        default_vmax: VMAX_DEFAULT,
        crop: PIXEL_ARRAY,
        regs: MODE_1080_REGS,
    },
    // 4K, all pixel
    SensorMode {
        width: 3856,
        height: 2180,
        hmax_div: 1,
        min_hmax: 550,
        default_hmax: 550,
        min_vmax: VMAX_DEFAULT,
        default_vmax: VMAX_DEFAULT,
        crop: PIXEL_ARRAY,
        regs: MODE_4K_REGS,
    },
];

/// Position of a mode in `SUPPORTED_MODES`
pub fn index_of(mode: &SensorMode) -> Option<usize> {
    SUPPORTED_MODES.iter().position(|m| core::ptr::eq(m, mode))
}

/// Modes offered for a media bus format. Empty when the format is unsupported.
pub fn lookup(code: u32) -> &'static [SensorMode] {
    match BusFormat::from_code(code) {
        Some(BusFormat::SensorData) | None => &[],
        Some(_) => &SUPPORTED_MODES,
    }
}

/// Mode closest to the requested size, by summed width and height distance.
/// An exact match wins; ties go to the earlier entry.
pub fn nearest(modes: &'static [SensorMode], width: u32, height: u32) -> Option<&'static SensorMode> {
    let mut best: Option<(&'static SensorMode, u32)> = None;
    for mode in modes.iter() {
        let err = abs_diff(mode.width, width) + abs_diff(mode.height, height);
        if best.map_or(true, |(_, best_err)| err < best_err) {
            best = Some((mode, err));
        }
        if err == 0 {
            break;
        }
    }
    best.map(|(mode, _)| mode)
}

fn abs_diff(a: u32, b: u32) -> u32 {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Format offered at `index` on the image stream. One Bayer family is exposed.
pub fn enum_format(index: usize) -> Option<BusFormat> {
    if index < BAYER_CODES.len() / 4 {
        Some(BAYER_CODES[index * 4])
    } else {
        None
    }
}

/// Frame size offered at `index` for a format
pub fn enum_frame_size(code: u32, index: usize) -> Option<(u32, u32)> {
    if code == BusFormat::SensorData.code() {
        return if index == 0 {
            Some((EMBEDDED_LINE_WIDTH, NUM_EMBEDDED_LINES))
        } else {
            None
        };
    }
    lookup(code).get(index).map(|m| (m.width, m.height))
}

/// Rectangles reported through the selection interface
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SelectionTarget {
    /// Crop of the active mode
    Crop,
    CropDefault,
    CropBounds,
    NativeSize,
}

/// Rectangle for every target that does not depend on the active mode
pub fn fixed_selection(target: SelectionTarget) -> Option<Rect> {
    match target {
        SelectionTarget::Crop => None,
        SelectionTarget::CropDefault | SelectionTarget::CropBounds => Some(PIXEL_ARRAY),
        SelectionTarget::NativeSize => Some(Rect {
            left: 0,
            top: 0,
            width: NATIVE_WIDTH,
            height: NATIVE_HEIGHT,
        }),
    }
}
