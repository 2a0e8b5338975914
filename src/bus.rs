/*
Copyright (c) 2020 Todd Stellanova
LICENSE: BSD3 (see LICENSE file)
*/

//! Register access over two-wire i2c.
//! The IMX678 uses 16-bit big-endian register addresses; multi-byte
//! register values are sent least significant byte first.

use embedded_hal::blocking::i2c::{Write, WriteRead};

/// Register transport bound to one sensor address
pub struct RegisterBus<I2C> {
    address: u8,
    i2c: I2C,
}

impl<I2C, CommE> RegisterBus<I2C>
where
    I2C: Write<Error = CommE> + WriteRead<Error = CommE>,
{
    pub fn new(i2c: I2C, address: u8) -> Self {
        Self { address, i2c }
    }

    pub fn release(self) -> I2C {
        self.i2c
    }

    /// Read up to 4 bytes starting at `reg`, assembled big-endian
    pub fn read(&mut self, reg: u16, len: usize) -> Result<u32, CommE> {
        let len = len.min(4);
        let mut recv_buf = [0u8; 4];
        self.i2c
            .write_read(self.address, &reg.to_be_bytes(), &mut recv_buf[4 - len..])?;
        Ok(u32::from_be_bytes(recv_buf))
    }

    /// Write the low `width` bytes of `val` (1 to 3) to consecutive registers
    pub fn write(&mut self, reg: u16, width: usize, val: u32) -> Result<(), CommE> {
        let width = width.clamp(1, 3);
        let mut write_buf = [0u8; 5];
        write_buf[..2].copy_from_slice(&reg.to_be_bytes());
        write_buf[2..2 + width].copy_from_slice(&val.to_le_bytes()[..width]);
        self.i2c.write(self.address, &write_buf[..2 + width])
    }

    /// Write a list of single byte registers, stopping at the first failure
    pub fn write_list(&mut self, regs: &[(u16, u8)]) -> Result<(), CommE> {
        for &(reg, val) in regs {
            if let Err(e) = self.write(reg, 1, val as u32) {
                log_error!("failed to write reg 0x{:04x}", reg);
                return Err(e);
            }
        }
        Ok(())
    }
}
