/*
Copyright (c) 2020 Todd Stellanova
LICENSE: BSD3 (see LICENSE file)
*/

//! Recording bus and power fakes for long write sequences and fault injection.

use std::cell::RefCell;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Write, WriteRead};

use crate::power::PowerSequencer;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FakeError;

#[derive(Default)]
struct State {
    writes: Vec<(u16, Vec<u8>)>,
    reads: Vec<u16>,
    fail_on: Option<u16>,
    fail_power_on: bool,
    power_ons: usize,
    power_offs: usize,
}

/// Shared view of everything the fakes saw
#[derive(Clone, Default)]
pub struct Log(Rc<RefCell<State>>);

impl Log {
    /// Successful writes as (register, value bytes)
    pub fn writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.0.borrow().writes.clone()
    }

    pub fn reads(&self) -> Vec<u16> {
        self.0.borrow().reads.clone()
    }

    pub fn count(&self, reg: u16) -> usize {
        self.0.borrow().writes.iter().filter(|(r, _)| *r == reg).count()
    }

    /// Last value written to `reg`, little-endian
    pub fn last_value(&self, reg: u16) -> Option<u32> {
        self.0
            .borrow()
            .writes
            .iter()
            .rev()
            .find(|(r, _)| *r == reg)
            .map(|(_, bytes)| {
                bytes
                    .iter()
                    .rev()
                    .fold(0u32, |acc, b| (acc << 8) | *b as u32)
            })
    }

    pub fn clear(&self) {
        let mut state = self.0.borrow_mut();
        state.writes.clear();
        state.reads.clear();
    }

    /// Fail every transfer addressed to `reg`
    pub fn fail_on(&self, reg: u16) {
        self.0.borrow_mut().fail_on = Some(reg);
    }

    pub fn fail_on_none(&self) {
        self.0.borrow_mut().fail_on = None;
    }

    pub fn fail_power_on(&self, fail: bool) {
        self.0.borrow_mut().fail_power_on = fail;
    }

    pub fn power_ons(&self) -> usize {
        self.0.borrow().power_ons
    }

    pub fn power_offs(&self) -> usize {
        self.0.borrow().power_offs
    }
}

pub struct FakeBus {
    log: Log,
}

impl FakeBus {
    pub fn with_power() -> (FakeBus, FakePower, Log) {
        let log = Log::default();
        (
            FakeBus { log: log.clone() },
            FakePower { log: log.clone() },
            log,
        )
    }
}

fn reg_of(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

impl Write for FakeBus {
    type Error = FakeError;

    fn write(&mut self, _address: u8, bytes: &[u8]) -> Result<(), FakeError> {
        let reg = reg_of(bytes);
        let mut state = self.log.0.borrow_mut();
        if state.fail_on == Some(reg) {
            return Err(FakeError);
        }
        state.writes.push((reg, bytes[2..].to_vec()));
        Ok(())
    }
}

impl WriteRead for FakeBus {
    type Error = FakeError;

    fn write_read(&mut self, _address: u8, bytes: &[u8], buffer: &mut [u8]) -> Result<(), FakeError> {
        let reg = reg_of(bytes);
        let mut state = self.log.0.borrow_mut();
        if state.fail_on == Some(reg) {
            return Err(FakeError);
        }
        state.reads.push(reg);
        for b in buffer.iter_mut() {
            *b = 0x32;
        }
        Ok(())
    }
}

pub struct FakePower {
    log: Log,
}

impl PowerSequencer for FakePower {
    type Error = FakeError;

    fn power_on<D: DelayMs<u32>>(&mut self, delay: &mut D) -> Result<(), FakeError> {
        let mut state = self.log.0.borrow_mut();
        if state.fail_power_on {
            return Err(FakeError);
        }
        state.power_ons += 1;
        delay.delay_ms(1);
        Ok(())
    }

    fn power_off(&mut self) -> Result<(), FakeError> {
        self.log.0.borrow_mut().power_offs += 1;
        Ok(())
    }
}
