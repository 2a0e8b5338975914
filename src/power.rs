/*
Copyright (c) 2020 Todd Stellanova
LICENSE: BSD3 (see LICENSE file)
*/

//! Power sequencing and power reference counting.

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::OutputPin;

use crate::regs::XCLR_DELAY_MS;

/// Board specific supply, clock and reset bring-up.
///
/// `power_on` must leave the sensor ready for register access, including
/// any settle time after reset is released. `power_off` undoes it in
/// reverse order and returns immediately.
pub trait PowerSequencer {
    type Error;

    fn power_on<D: DelayMs<u32>>(&mut self, delay: &mut D) -> Result<(), Self::Error>;

    fn power_off(&mut self) -> Result<(), Self::Error>;
}

/// Sequencer for boards whose supplies and clock are always on and where the
/// only control is the XCLR reset line (active low).
pub struct GpioPowerSequencer<RST> {
    xclr: RST,
}

impl<RST, PinE> GpioPowerSequencer<RST>
where
    RST: OutputPin<Error = PinE>,
{
    pub fn new(xclr: RST) -> Self {
        Self { xclr }
    }

    pub fn release(self) -> RST {
        self.xclr
    }
}

impl<RST, PinE> PowerSequencer for GpioPowerSequencer<RST>
where
    RST: OutputPin<Error = PinE>,
{
    type Error = PinE;

    fn power_on<D: DelayMs<u32>>(&mut self, delay: &mut D) -> Result<(), PinE> {
        self.xclr.set_high()?;
        // the sensor may not leave standby before this
        delay.delay_ms(XCLR_DELAY_MS);
        Ok(())
    }

    fn power_off(&mut self) -> Result<(), PinE> {
        self.xclr.set_low()
    }
}

/// Number of outstanding power references; the sensor is powered while it is nonzero.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PowerRefs {
    users: u32,
}

impl PowerRefs {
    pub fn in_use(&self) -> bool {
        self.users > 0
    }

    /// Take a reference. Returns true if this is the first, so power must come up.
    pub fn get(&mut self) -> bool {
        self.users += 1;
        self.users == 1
    }

    /// Undo a `get` whose power-up failed
    pub fn cancel(&mut self) {
        self.users = self.users.saturating_sub(1);
    }

    /// Drop a reference. Returns true if it was the last, so power must go down.
    pub fn put(&mut self) -> bool {
        if self.users == 0 {
            return false;
        }
        self.users -= 1;
        self.users == 0
    }

    /// Forget every reference, after the supply went away underneath us
    pub fn reset(&mut self) {
        self.users = 0;
    }
}
