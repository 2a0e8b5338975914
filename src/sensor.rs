/*
Copyright (c) 2020 Todd Stellanova
LICENSE: BSD3 (see LICENSE file)
*/

//! The IMX678 device: control writes, mode selection and the
//! standby/streaming state machine.
//!
//! All mutable state, the bus included, sits behind one lock. Each public
//! call takes it for its whole duration, register I/O included, so range
//! updates, clamping and the resulting writes are never interleaved with
//! another caller's.

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::i2c::{Write, WriteRead};
use spin::Mutex;

use crate::bus::RegisterBus;
use crate::config::{Config, LinkConfig, SyncMode, ValidatedConfig};
use crate::controls::{ControlId, ControlInfo, ControlSet, GainMode, REPLAY_ORDER};
use crate::modes::{self, BusFormat, Rect, SelectionTarget, SensorMode, SUPPORTED_MODES};
use crate::power::{PowerRefs, PowerSequencer};
use crate::regs::{
    Register, BLKLEVEL_DEFAULT, BLKLEVEL_MAX, COMMON_REGS, MODE_STANDBY, MODE_STREAMING,
    STREAM_DELAY_MS,
};
use crate::timing::{self, TimingEngine};
use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    Standby,
    Streaming,
}

/// Frame and line length as last programmed (or to be programmed) into the sensor
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimingState {
    pub vmax: u32,
    pub hmax: u32,
}

struct Device<I2C, P, D> {
    bus: RegisterBus<I2C>,
    power: P,
    refs: PowerRefs,
    delay: D,
    config: ValidatedConfig,
    timing: TimingEngine,
    mode: &'static SensorMode,
    format: BusFormat,
    regs: TimingState,
    controls: ControlSet,
    stream: StreamState,
    /// Cleared on every power down
    common_regs_written: bool,
}

/// Main driver struct
pub struct Imx678<I2C, P, D> {
    inner: Mutex<Device<I2C, P, D>>,
}

impl<I2C, CommE, P, D> Device<I2C, P, D>
where
    I2C: Write<Error = CommE> + WriteRead<Error = CommE>,
    P: PowerSequencer,
    D: DelayMs<u32>,
{
    fn write_reg(
        &mut self,
        reg: Register,
        width: usize,
        val: u32,
    ) -> Result<(), Error<CommE, P::Error>> {
        // controls set while unpowered are replayed at stream start
        if !self.refs.in_use() {
            log_debug!("unpowered, skipping reg 0x{:04x}", reg.addr());
            return Ok(());
        }
        self.bus.write(reg.addr(), width, val).map_err(|e| {
            log_error!("failed to write reg 0x{:04x}", reg.addr());
            Error::Comm(e)
        })
    }

    fn write_exposure(&mut self) -> Result<(), Error<CommE, P::Error>> {
        let exposure = self.controls.exposure.value();
        let shr = timing::shr_for_exposure(self.regs.vmax, exposure);
        log_debug!(
            "exposure {} lines, VMAX {}, HMAX {}, SHR {}",
            exposure,
            self.regs.vmax,
            self.regs.hmax,
            shr
        );
        self.write_reg(Register::Shr, 3, shr)
    }

    fn write_gain(&mut self) -> Result<(), Error<CommE, P::Error>> {
        let gain = self.controls.analog_gain.value();
        log_debug!(
            "analogue gain = {} ({})",
            gain,
            match self.controls.gain_mode() {
                GainMode::Normal => "LCG",
                GainMode::HighConversionGain => "HCG",
            }
        );
        self.write_reg(Register::AnalogGain, 2, gain)
    }

    /// Bring derived state in line with a control's current value and,
    /// when powered, push it to the sensor.
    fn apply(&mut self, id: ControlId) -> Result<(), Error<CommE, P::Error>> {
        match id {
            ControlId::PixelRate | ControlId::LinkFreq => Ok(()),
            ControlId::Exposure => self.write_exposure(),
            ControlId::AnalogGain => self.write_gain(),
            ControlId::GainMode => {
                // the new range is in place before anything is written
                if self.controls.update_gain_limits() {
                    self.write_gain()?;
                }
                let flag = self.controls.gain_mode.value();
                log_debug!("conversion gain select: {}", flag);
                self.write_reg(Register::FdgSel0, 1, flag)
            }
            ControlId::VBlank => {
                let vblank = self.controls.vblank.value();
                self.regs.vmax = timing::vmax_for_vblank(self.mode, vblank);
                if self.controls.update_exposure_limits(self.regs.vmax) {
                    log_info!(
                        "exposure limited to {} by VMAX {}",
                        self.controls.exposure.value(),
                        self.regs.vmax
                    );
                }
                log_debug!("vblank {}, VMAX {}", vblank, self.regs.vmax);
                self.write_reg(Register::Vmax, 3, self.regs.vmax)?;
                // SHR counts back from VMAX: rewrite it so the exposure in lines holds
                self.write_exposure()
            }
            ControlId::HBlank => {
                let hblank = self.controls.hblank.value();
                self.regs.hmax = self.timing.hmax_for_hblank(self.mode, hblank);
                log_debug!("hblank {}, HMAX {}", hblank, self.regs.hmax);
                self.write_reg(Register::Hmax, 2, self.regs.hmax)
            }
            ControlId::HFlip => {
                let flip = self.controls.hflip.value();
                self.write_reg(Register::WinModeH, 1, flip)
            }
            ControlId::VFlip => {
                let flip = self.controls.vflip.value();
                self.write_reg(Register::WinModeV, 1, flip)
            }
            ControlId::BlackLevel => {
                let level = self.controls.black_level.value().min(BLKLEVEL_MAX);
                self.write_reg(Register::BlkLevel, 2, level)
            }
        }
    }

    fn set_ctrl(&mut self, id: ControlId, value: u32) -> Result<(), Error<CommE, P::Error>> {
        let ctrl = self.controls.get_mut(id).ok_or(Error::ReadOnly(id))?;
        if ctrl.is_grabbed() {
            return Err(Error::Busy);
        }
        ctrl.validate(value).map_err(|range| Error::OutOfRange {
            control: id,
            value,
            min: range.min,
            max: range.max,
        })?;
        ctrl.set(value);
        log_debug!("{:?} : {}", id, value);
        // the new value stays; the next stream start replays it
        self.apply(id)
    }

    /// Republish every mode dependent range and reset the frame timing to
    /// the mode defaults.
    fn set_framing_limits(&mut self) {
        let limits = self.timing.limits(self.mode);
        self.regs = TimingState {
            vmax: limits.default_vmax,
            hmax: limits.default_hmax,
        };
        self.controls.apply_framing(&limits);
        log_info!(
            "mode {} x {}: HBLANK {}, VBLANK {}, pixel rate {}",
            self.mode.width,
            self.mode.height,
            limits.hblank.default,
            limits.vblank.default,
            limits.pixel_rate
        );
        let hblank = self.apply(ControlId::HBlank);
        let vblank = self.apply(ControlId::VBlank);
        if hblank.is_err() || vblank.is_err() {
            log_warn!("mode timing not applied to the sensor");
        }
    }

    fn change_mode(
        &mut self,
        mode: &'static SensorMode,
        format: BusFormat,
    ) -> Result<(), Error<CommE, P::Error>> {
        if core::ptr::eq(mode, self.mode) && format == self.format {
            return Ok(());
        }
        if self.stream == StreamState::Streaming {
            return Err(Error::Busy);
        }
        self.mode = mode;
        self.format = format;
        self.set_framing_limits();
        Ok(())
    }

    fn configure_link(&mut self, link: LinkConfig) -> Result<(), Error<CommE, P::Error>> {
        if self.stream == StreamState::Streaming {
            return Err(Error::Busy);
        }
        self.config.link = link;
        self.timing.configure_link(&link);
        self.controls.set_link_freq(link.link_freq_hz());
        // DATARATE_SEL and LANEMODE live in the one-time block
        self.common_regs_written = false;
        self.set_framing_limits();
        Ok(())
    }

    fn power_get(&mut self) -> Result<(), Error<CommE, P::Error>> {
        if self.refs.get() {
            if let Err(e) = self.power.power_on(&mut self.delay) {
                log_error!("failed to power on");
                self.refs.cancel();
                return Err(Error::Power(e));
            }
            log_info!("powered on");
        }
        Ok(())
    }

    fn power_put(&mut self) -> Result<(), Error<CommE, P::Error>> {
        if self.refs.put() {
            // force the one-time block on the next power up
            self.common_regs_written = false;
            self.power.power_off().map_err(Error::Power)?;
            log_info!("powered off");
        }
        Ok(())
    }

    fn power_lost(&mut self) {
        log_warn!("power lost");
        self.refs.reset();
        self.common_regs_written = false;
        if self.stream == StreamState::Streaming {
            self.stream = StreamState::Standby;
            self.controls.grab_flips(false);
        }
    }

    fn probe(&mut self) -> Result<(), Error<CommE, P::Error>> {
        self.power_get()?;
        // no chip id register, so any readable register will do
        let read = self.bus.read(Register::BlkLevel.addr(), 1);
        self.power_put()?;
        match read {
            Ok(_) => {
                log_info!("reg read success, device found");
                Ok(())
            }
            Err(e) => {
                log_error!("failed to read chip reg");
                Err(Error::Comm(e))
            }
        }
    }

    fn write_common_regs(&mut self) -> Result<(), Error<CommE, P::Error>> {
        self.bus.write_list(COMMON_REGS).map_err(|e| {
            log_error!("failed to set common settings");
            Error::Comm(e)
        })?;
        let inck_sel = self.config.inck_sel as u32;
        let data_rate = self.config.link.data_rate_sel() as u32;
        let lane_mode = self.config.link.lanes().lane_mode() as u32;
        self.write_reg(Register::InckSel, 1, inck_sel)?;
        self.write_reg(Register::BlkLevel, 2, BLKLEVEL_DEFAULT)?;
        self.write_reg(Register::DataRateSel, 1, data_rate)?;
        self.write_reg(Register::LaneMode, 1, lane_mode)?;

        match self.config.sync_mode {
            SyncMode::InternalLeader => {
                self.write_reg(Register::ExtMode, 1, 0x00)?;
                // XHS and XVS both driven out
                self.write_reg(Register::XxsDrv, 1, 0x00)?;
                self.write_reg(Register::XxsOutSel, 1, 0x0A)?;
            }
            SyncMode::ExternalLeader => {
                self.write_reg(Register::ExtMode, 1, 0x01)?;
                // XHS out, XVS in
                self.write_reg(Register::XxsDrv, 1, 0x03)?;
                self.write_reg(Register::XxsOutSel, 1, 0x08)?;
            }
            SyncMode::Follower => {
                self.write_reg(Register::XxsDrv, 1, 0x0F)?;
                self.write_reg(Register::XxsOutSel, 1, 0x00)?;
            }
        }
        log_info!("{}, common regs written", self.config.sync_mode.name());
        Ok(())
    }

    /// Program the sensor and leave standby. The caller holds a power reference.
    fn start_streaming(&mut self) -> Result<(), Error<CommE, P::Error>> {
        if !self.common_regs_written {
            self.write_common_regs()?;
            self.common_regs_written = true;
        }

        self.bus.write_list(self.mode.regs).map_err(|e| {
            log_error!("failed to set mode");
            Error::Comm(e)
        })?;

        // from here on failures are logged and streaming goes ahead
        let _ = self.write_reg(Register::DigitalClamp, 1, 0);

        for id in REPLAY_ORDER.iter() {
            if self.apply(*id).is_err() {
                log_error!("failed to apply {:?}", id);
            }
        }

        if self.config.sync_mode.is_leader() {
            let _ = self.write_reg(Register::Xmsta, 1, 0x00);
        }

        let _ = self.write_reg(Register::ModeSelect, 1, MODE_STREAMING as u32);
        log_info!("start streaming");
        self.delay.delay_ms(STREAM_DELAY_MS);
        Ok(())
    }

    fn stop_streaming(&mut self) {
        log_info!("stop streaming");
        if self
            .write_reg(Register::ModeSelect, 1, MODE_STANDBY as u32)
            .is_err()
        {
            log_error!("failed to stop stream");
        }
    }

    fn set_stream(&mut self, enable: bool) -> Result<(), Error<CommE, P::Error>> {
        if enable == (self.stream == StreamState::Streaming) {
            return Ok(());
        }

        if enable {
            self.power_get()?;
            if let Err(e) = self.start_streaming() {
                let _ = self.power_put();
                return Err(e);
            }
            self.stream = StreamState::Streaming;
            self.controls.grab_flips(true);
        } else {
            self.stop_streaming();
            self.stream = StreamState::Standby;
            self.controls.grab_flips(false);
            self.power_put()?;
        }
        Ok(())
    }

    fn suspend(&mut self) {
        if self.stream == StreamState::Streaming {
            self.stop_streaming();
        }
    }

    fn resume(&mut self) -> Result<(), Error<CommE, P::Error>> {
        if self.stream != StreamState::Streaming {
            return Ok(());
        }
        if let Err(e) = self.start_streaming() {
            self.stop_streaming();
            self.stream = StreamState::Standby;
            self.controls.grab_flips(false);
            let _ = self.power_put();
            return Err(e);
        }
        Ok(())
    }
}

impl<I2C, CommE, P, D> Imx678<I2C, P, D>
where
    I2C: Write<Error = CommE> + WriteRead<Error = CommE>,
    P: PowerSequencer,
    D: DelayMs<u32>,
{
    /// Create an instance from the board configuration.
    /// Nothing is written to the sensor until it is powered; any
    /// configuration error is fatal.
    pub fn new(i2c: I2C, power: P, delay: D, config: Config) -> Result<Self, Error<CommE, P::Error>> {
        let config = config.validate().map_err(Error::Config)?;
        let mut dev = Device {
            bus: RegisterBus::new(i2c, config.i2c_address),
            power,
            refs: PowerRefs::default(),
            delay,
            config,
            timing: TimingEngine::new(&config.link),
            mode: &SUPPORTED_MODES[0],
            format: BusFormat::Srggb12,
            regs: TimingState { vmax: 0, hmax: 0 },
            controls: ControlSet::new(config.link.link_freq_hz()),
            stream: StreamState::Standby,
            common_regs_written: false,
        };
        dev.set_framing_limits();
        Ok(Self {
            inner: Mutex::new(dev),
        })
    }

    /// Give back the bus, the power sequencer and the delay
    pub fn release(self) -> (I2C, P, D) {
        let dev = self.inner.into_inner();
        (dev.bus.release(), dev.power, dev.delay)
    }

    /// Power up just long enough to check that the sensor answers
    pub fn probe(&self) -> Result<(), Error<CommE, P::Error>> {
        self.inner.lock().probe()
    }

    /// Switch to another link. Recomputes the minimum line length of every
    /// mode and republishes the active mode's ranges.
    pub fn configure_link(&self, lanes: u8, freq_index: usize) -> Result<(), Error<CommE, P::Error>> {
        let link = LinkConfig::new(lanes, freq_index).map_err(Error::Config)?;
        log_info!("configure link: {} lanes, tier {}", lanes, freq_index);
        self.inner.lock().configure_link(link)
    }

    pub fn link(&self) -> LinkConfig {
        self.inner.lock().config.link
    }

    /// Pick the mode nearest to the requested size for a format and make it active
    pub fn set_format(
        &self,
        code: u32,
        width: u32,
        height: u32,
    ) -> Result<&'static SensorMode, Error<CommE, P::Error>> {
        let format = BusFormat::from_code(code).ok_or(Error::UnsupportedFormat(code))?;
        let mode =
            modes::nearest(modes::lookup(code), width, height).ok_or(Error::UnsupportedFormat(code))?;
        self.inner.lock().change_mode(mode, format)?;
        Ok(mode)
    }

    /// A mode was selected by format negotiation elsewhere
    pub fn on_mode_changed(&self, mode: &'static SensorMode) -> Result<(), Error<CommE, P::Error>> {
        let mut dev = self.inner.lock();
        let format = dev.format;
        dev.change_mode(mode, format)
    }

    pub fn mode(&self) -> &'static SensorMode {
        self.inner.lock().mode
    }

    pub fn format(&self) -> BusFormat {
        self.inner.lock().format
    }

    pub fn selection(&self, target: SelectionTarget) -> Rect {
        match modes::fixed_selection(target) {
            Some(rect) => rect,
            None => self.inner.lock().mode.crop,
        }
    }

    pub fn timing(&self) -> TimingState {
        self.inner.lock().regs
    }

    /// Set a control. Out of range values are rejected before anything is
    /// written. A failed register write is returned, but the new value stays
    /// and reaches the sensor at the next stream start.
    pub fn set_ctrl(&self, id: ControlId, value: u32) -> Result<(), Error<CommE, P::Error>> {
        self.inner.lock().set_ctrl(id, value)
    }

    pub fn ctrl(&self, id: ControlId) -> u64 {
        self.inner.lock().controls.value(id)
    }

    pub fn query_ctrl(&self, id: ControlId) -> ControlInfo {
        self.inner.lock().controls.info(id)
    }

    /// Exposure in lines
    pub fn set_exposure(&self, lines: u32) -> Result<(), Error<CommE, P::Error>> {
        self.set_ctrl(ControlId::Exposure, lines)
    }

    pub fn set_analog_gain(&self, gain: u32) -> Result<(), Error<CommE, P::Error>> {
        self.set_ctrl(ControlId::AnalogGain, gain)
    }

    pub fn set_gain_mode(&self, mode: GainMode) -> Result<(), Error<CommE, P::Error>> {
        self.set_ctrl(ControlId::GainMode, mode as u32)
    }

    pub fn set_vblank(&self, lines: u32) -> Result<(), Error<CommE, P::Error>> {
        self.set_ctrl(ControlId::VBlank, lines)
    }

    pub fn set_hblank(&self, pixels: u32) -> Result<(), Error<CommE, P::Error>> {
        self.set_ctrl(ControlId::HBlank, pixels)
    }

    pub fn set_hflip(&self, flip: bool) -> Result<(), Error<CommE, P::Error>> {
        self.set_ctrl(ControlId::HFlip, flip as u32)
    }

    pub fn set_vflip(&self, flip: bool) -> Result<(), Error<CommE, P::Error>> {
        self.set_ctrl(ControlId::VFlip, flip as u32)
    }

    pub fn set_black_level(&self, level: u32) -> Result<(), Error<CommE, P::Error>> {
        self.set_ctrl(ControlId::BlackLevel, level)
    }

    /// Start or stop streaming. Asking for the current state does nothing.
    pub fn set_stream(&self, enable: bool) -> Result<(), Error<CommE, P::Error>> {
        self.inner.lock().set_stream(enable)
    }

    pub fn start_streaming(&self) -> Result<(), Error<CommE, P::Error>> {
        self.set_stream(true)
    }

    pub fn stop_streaming(&self) -> Result<(), Error<CommE, P::Error>> {
        self.set_stream(false)
    }

    pub fn stream_state(&self) -> StreamState {
        self.inner.lock().stream
    }

    /// Take a power reference. Control writes only reach the sensor while one is held.
    pub fn power_get(&self) -> Result<(), Error<CommE, P::Error>> {
        self.inner.lock().power_get()
    }

    pub fn power_put(&self) -> Result<(), Error<CommE, P::Error>> {
        self.inner.lock().power_put()
    }

    pub fn is_powered(&self) -> bool {
        self.inner.lock().refs.in_use()
    }

    /// The supply was removed without going through `power_put`
    pub fn power_lost(&self) {
        self.inner.lock().power_lost()
    }

    /// Put a streaming sensor in standby, remembering that it was streaming
    pub fn suspend(&self) {
        self.inner.lock().suspend()
    }

    /// Restart streaming if the sensor was streaming when suspended
    pub fn resume(&self) -> Result<(), Error<CommE, P::Error>> {
        self.inner.lock().resume()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBus, FakePower, Log};
    use embedded_hal_mock::delay::MockNoop;

    type Sensor = Imx678<FakeBus, FakePower, MockNoop>;

    fn sensor() -> (Sensor, Log) {
        sensor_with(Config::default())
    }

    fn sensor_with(config: Config) -> (Sensor, Log) {
        let (bus, power, log) = FakeBus::with_power();
        let imx = Imx678::new(bus, power, MockNoop::new(), config).unwrap();
        (imx, log)
    }

    fn select_4k(imx: &Sensor) {
        let mode = imx.set_format(BusFormat::Srggb12.code(), 3856, 2180).unwrap();
        assert_eq!(mode.width, 3856);
    }

    #[test]
    fn bad_configuration_is_fatal() {
        let (bus, power, _log) = FakeBus::with_power();
        let cfg = Config {
            lanes: 3,
            ..Config::default()
        };
        match Imx678::new(bus, power, MockNoop::new(), cfg) {
            Err(Error::Config(e)) => assert_eq!(e, crate::ConfigError::UnsupportedLaneCount(3)),
            _ => panic!("expected a configuration error"),
        }
    }

    #[test]
    fn nothing_is_written_while_unpowered() {
        let (imx, log) = sensor();
        select_4k(&imx);
        imx.set_exposure(500).unwrap();
        imx.set_analog_gain(100).unwrap();
        assert!(log.writes().is_empty());
        assert_eq!(imx.ctrl(ControlId::Exposure), 500);
        assert_eq!(imx.ctrl(ControlId::AnalogGain), 100);
    }

    #[test]
    fn exposure_maps_to_even_shr() {
        let (imx, log) = sensor();
        select_4k(&imx);
        imx.power_get().unwrap();
        imx.set_exposure(1001).unwrap();
        // (2250 - 1001) & !1
        assert_eq!(log.last_value(Register::Shr.addr()), Some(1248));
    }

    #[test]
    fn out_of_range_is_rejected_before_any_write() {
        let (imx, log) = sensor();
        select_4k(&imx);
        imx.power_get().unwrap();
        match imx.set_exposure(2243) {
            Err(Error::OutOfRange { control, min, max, .. }) => {
                assert_eq!(control, ControlId::Exposure);
                assert_eq!((min, max), (2, 2242));
            }
            _ => panic!("expected a range error"),
        }
        assert_eq!(imx.ctrl(ControlId::Exposure), 1000);
        assert!(log.writes().is_empty());
    }

    #[test]
    fn read_only_controls_reject_writes() {
        let (imx, _log) = sensor();
        match imx.set_ctrl(ControlId::PixelRate, 1) {
            Err(Error::ReadOnly(ControlId::PixelRate)) => {}
            _ => panic!("pixel rate must be read only"),
        }
    }

    #[test]
    fn hcg_clamps_gain_and_writes_it() {
        let (imx, log) = sensor();
        imx.power_get().unwrap();
        imx.set_analog_gain(10).unwrap();
        log.clear();

        imx.set_gain_mode(GainMode::HighConversionGain).unwrap();
        let info = imx.query_ctrl(ControlId::AnalogGain);
        assert_eq!((info.min, info.max, info.value), (34, 240, 34));
        assert_eq!(
            log.writes(),
            vec![
                (Register::AnalogGain.addr(), vec![34, 0]),
                (Register::FdgSel0.addr(), vec![1]),
            ]
        );

        log.clear();
        imx.set_gain_mode(GainMode::Normal).unwrap();
        let info = imx.query_ctrl(ControlId::AnalogGain);
        assert_eq!((info.min, info.max, info.value), (0, 240, 34));
        assert_eq!(log.writes(), vec![(Register::FdgSel0.addr(), vec![0])]);
    }

    #[test]
    fn gain_range_follows_mode_even_when_unpowered() {
        let (imx, log) = sensor();
        imx.set_gain_mode(GainMode::HighConversionGain).unwrap();
        assert_eq!(imx.ctrl(ControlId::AnalogGain), 34);
        assert!(imx.set_analog_gain(20).is_err());
        assert!(log.writes().is_empty());
    }

    #[test]
    fn shorter_frame_pulls_exposure_down() {
        let (imx, log) = sensor();
        select_4k(&imx);
        imx.power_get().unwrap();
        imx.set_vblank(1000).unwrap();
        imx.set_exposure(3000).unwrap();
        log.clear();

        // VMAX 2180 + 101 = 2281 -> 2280
        imx.set_vblank(101).unwrap();
        assert_eq!(imx.timing().vmax, 2280);
        let exposure = imx.query_ctrl(ControlId::Exposure);
        assert_eq!((exposure.value, exposure.max), (2272, 2272));
        assert_eq!(log.last_value(Register::Vmax.addr()), Some(2280));
        // 2280 - 2272
        assert_eq!(log.last_value(Register::Shr.addr()), Some(8));
    }

    #[test]
    fn default_hblank_reproduces_default_hmax() {
        let (imx, log) = sensor();
        select_4k(&imx);
        imx.power_get().unwrap();
        imx.set_hblank(400).unwrap();
        assert_ne!(imx.timing().hmax, 550);
        let default = imx.query_ctrl(ControlId::HBlank).default as u32;
        imx.set_hblank(default).unwrap();
        assert_eq!(imx.timing().hmax, 550);
        assert_eq!(log.last_value(Register::Hmax.addr()), Some(550));
    }

    #[test]
    fn pixel_rate_for_4k_on_fastest_4_lane_hmax() {
        let (imx, _log) = sensor();
        select_4k(&imx);
        assert_eq!(imx.ctrl(ControlId::PixelRate), 520_560_000);
        assert_eq!(imx.query_ctrl(ControlId::HBlank).default, 0);
        assert_eq!(imx.ctrl(ControlId::LinkFreq), 891_000_000);
    }

    #[test]
    fn black_level_is_clamped_to_12_bits() {
        let (imx, log) = sensor();
        imx.power_get().unwrap();
        imx.set_black_level(5000).unwrap();
        assert_eq!(imx.ctrl(ControlId::BlackLevel), 5000);
        assert_eq!(log.last_value(Register::BlkLevel.addr()), Some(4095));
    }

    #[test]
    fn stream_start_sequence() {
        let (imx, log) = sensor();
        select_4k(&imx);
        imx.set_exposure(1500).unwrap();
        imx.start_streaming().unwrap();

        let writes = log.writes();
        let common = COMMON_REGS.len();
        for (i, (reg, val)) in COMMON_REGS.iter().enumerate() {
            assert_eq!(writes[i], (*reg, vec![*val]));
        }
        let after_common: Vec<u16> = writes[common..].iter().map(|(reg, _)| *reg).collect();
        assert_eq!(
            &after_common[..9],
            &[
                Register::InckSel.addr(),
                Register::BlkLevel.addr(),
                Register::DataRateSel.addr(),
                Register::LaneMode.addr(),
                Register::ExtMode.addr(),
                Register::XxsDrv.addr(),
                Register::XxsOutSel.addr(),
                0x301B,
                Register::DigitalClamp.addr(),
            ]
        );
        assert_eq!(writes[common + 7], (0x301B, vec![0x00]));
        assert_eq!(log.last_value(Register::DataRateSel.addr()), Some(0x02));
        assert_eq!(log.last_value(Register::LaneMode.addr()), Some(0x03));
        // replayed with the value set while unpowered
        assert_eq!(log.last_value(Register::Shr.addr()), Some(750));

        let tail: Vec<u16> = writes[writes.len() - 2..].iter().map(|(reg, _)| *reg).collect();
        assert_eq!(tail, vec![Register::Xmsta.addr(), Register::ModeSelect.addr()]);
        assert_eq!(log.last_value(Register::ModeSelect.addr()), Some(0));
        assert_eq!(imx.stream_state(), StreamState::Streaming);
        assert!(imx.is_powered());
    }

    #[test]
    fn follower_does_not_start_the_leader() {
        let cfg = Config {
            sync_mode: SyncMode::Follower,
            lanes: 2,
            ..Config::default()
        };
        let (imx, log) = sensor_with(cfg);
        imx.start_streaming().unwrap();
        assert_eq!(log.count(Register::Xmsta.addr()), 0);
        assert_eq!(log.count(Register::ExtMode.addr()), 0);
        assert_eq!(log.last_value(Register::XxsDrv.addr()), Some(0x0F));
        assert_eq!(log.last_value(Register::XxsOutSel.addr()), Some(0x00));
        assert_eq!(log.last_value(Register::LaneMode.addr()), Some(0x01));
    }

    #[test]
    fn external_leader_takes_xvs_in() {
        let cfg = Config {
            sync_mode: SyncMode::ExternalLeader,
            ..Config::default()
        };
        let (imx, log) = sensor_with(cfg);
        imx.start_streaming().unwrap();
        assert_eq!(log.last_value(Register::ExtMode.addr()), Some(0x01));
        assert_eq!(log.last_value(Register::XxsDrv.addr()), Some(0x03));
        assert_eq!(log.last_value(Register::XxsOutSel.addr()), Some(0x08));
        assert_eq!(log.count(Register::Xmsta.addr()), 1);
    }

    #[test]
    fn starting_twice_is_a_no_op() {
        let (imx, log) = sensor();
        imx.start_streaming().unwrap();
        log.clear();
        imx.start_streaming().unwrap();
        assert!(log.writes().is_empty());
        assert_eq!(log.power_ons(), 1);
    }

    #[test]
    fn stop_writes_standby_and_powers_down() {
        let (imx, log) = sensor();
        imx.start_streaming().unwrap();
        log.clear();
        imx.stop_streaming().unwrap();
        assert_eq!(log.writes(), vec![(Register::ModeSelect.addr(), vec![1])]);
        assert_eq!(imx.stream_state(), StreamState::Standby);
        assert!(!imx.is_powered());
        assert_eq!(log.power_offs(), 1);
    }

    #[test]
    fn common_block_is_written_once_per_power_cycle() {
        let (imx, log) = sensor();
        // an extra reference keeps power up across the stop
        imx.power_get().unwrap();
        imx.start_streaming().unwrap();
        imx.stop_streaming().unwrap();
        log.clear();
        imx.start_streaming().unwrap();
        assert_eq!(log.count(COMMON_REGS[0].0), 0);
        imx.stop_streaming().unwrap();

        // full power cycle
        imx.power_put().unwrap();
        imx.power_get().unwrap();
        log.clear();
        imx.start_streaming().unwrap();
        assert_eq!(log.count(COMMON_REGS[0].0), 1);
    }

    #[test]
    fn power_loss_forces_standby_and_reprogramming() {
        let (imx, log) = sensor();
        imx.start_streaming().unwrap();
        imx.power_lost();
        assert_eq!(imx.stream_state(), StreamState::Standby);
        assert!(!imx.is_powered());
        imx.set_hflip(true).unwrap();

        log.clear();
        imx.start_streaming().unwrap();
        assert_eq!(log.count(COMMON_REGS[0].0), 1);
        assert_eq!(log.last_value(Register::WinModeH.addr()), Some(1));
    }

    #[test]
    fn flips_are_locked_while_streaming() {
        let (imx, _log) = sensor();
        imx.start_streaming().unwrap();
        match imx.set_vflip(true) {
            Err(Error::Busy) => {}
            _ => panic!("flip must be rejected mid-stream"),
        }
        assert!(imx.query_ctrl(ControlId::VFlip).grabbed);
        imx.stop_streaming().unwrap();
        imx.set_vflip(true).unwrap();
        assert_eq!(imx.ctrl(ControlId::VFlip), 1);
    }

    #[test]
    fn common_block_failure_aborts_start() {
        let (imx, log) = sensor();
        log.fail_on(COMMON_REGS[10].0);
        assert!(matches!(imx.start_streaming(), Err(Error::Comm(_))));
        assert_eq!(imx.stream_state(), StreamState::Standby);
        assert!(!imx.is_powered());
        assert_eq!(log.count(Register::ModeSelect.addr()), 0);

        log.fail_on_none();
        log.clear();
        imx.start_streaming().unwrap();
        assert_eq!(log.count(COMMON_REGS[0].0), 1);
    }

    #[test]
    fn mode_blob_failure_aborts_start() {
        let (imx, log) = sensor();
        log.fail_on(0x301B);
        assert!(imx.start_streaming().is_err());
        assert_eq!(imx.stream_state(), StreamState::Standby);
        assert_eq!(log.count(Register::ModeSelect.addr()), 0);
    }

    #[test]
    fn late_failures_do_not_abort_start() {
        let (imx, log) = sensor();
        log.fail_on(Register::DigitalClamp.addr());
        imx.start_streaming().unwrap();
        assert_eq!(imx.stream_state(), StreamState::Streaming);
        assert_eq!(log.last_value(Register::ModeSelect.addr()), Some(0));
    }

    #[test]
    fn failed_control_write_is_returned_and_replayed_later() {
        let (imx, log) = sensor();
        imx.power_get().unwrap();
        log.fail_on(Register::AnalogGain.addr());
        assert!(matches!(imx.set_analog_gain(120), Err(Error::Comm(_))));
        assert_eq!(imx.ctrl(ControlId::AnalogGain), 120);
        assert_eq!(log.count(Register::AnalogGain.addr()), 0);

        log.fail_on(Register::Shr.addr());
        assert!(matches!(imx.set_exposure(1200), Err(Error::Comm(_))));
        assert_eq!(imx.ctrl(ControlId::Exposure), 1200);

        log.fail_on_none();
        imx.start_streaming().unwrap();
        assert_eq!(log.last_value(Register::AnalogGain.addr()), Some(120));
        // default 1080p VMAX 2250
        assert_eq!(log.last_value(Register::Shr.addr()), Some(1050));
    }

    #[test]
    fn power_on_failure_leaves_standby() {
        let (imx, log) = sensor();
        log.fail_power_on(true);
        assert!(matches!(imx.start_streaming(), Err(Error::Power(_))));
        assert_eq!(imx.stream_state(), StreamState::Standby);
        assert!(!imx.is_powered());
        assert!(log.writes().is_empty());
    }

    #[test]
    fn mode_change_is_refused_while_streaming() {
        let (imx, _log) = sensor();
        imx.start_streaming().unwrap();
        assert!(matches!(
            imx.set_format(BusFormat::Srggb12.code(), 3856, 2180),
            Err(Error::Busy)
        ));
        // selecting the active mode again is harmless
        assert!(imx.set_format(BusFormat::Srggb12.code(), 1928, 1090).is_ok());
    }

    #[test]
    fn unsupported_format_is_rejected() {
        let (imx, _log) = sensor();
        assert!(matches!(
            imx.set_format(0x2008, 1920, 1080),
            Err(Error::UnsupportedFormat(0x2008))
        ));
        assert!(matches!(
            imx.set_format(BusFormat::SensorData.code(), 1920, 1080),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn mode_change_resets_blanking_and_clamps_exposure() {
        let (imx, log) = sensor();
        select_4k(&imx);
        imx.set_vblank(5000).unwrap();
        imx.set_exposure(7000).unwrap();
        imx.power_get().unwrap();
        log.clear();

        let mode = imx.set_format(BusFormat::Srggb12.code(), 1920, 1080).unwrap();
        imx.on_mode_changed(mode).unwrap();
        assert_eq!(imx.mode().width, 1928);
        assert_eq!(imx.ctrl(ControlId::VBlank), 2250 - 1090);
        assert_eq!(imx.ctrl(ControlId::Exposure), 2242);
        assert_eq!(imx.timing(), TimingState { vmax: 2250, hmax: 550 });
        assert_eq!(log.last_value(Register::Vmax.addr()), Some(2250));
        assert_eq!(log.last_value(Register::Hmax.addr()), Some(550));
        assert_eq!(imx.selection(SelectionTarget::Crop), mode.crop);
    }

    #[test]
    fn link_change_recomputes_line_timing() {
        let (imx, log) = sensor();
        select_4k(&imx);
        imx.configure_link(2, 3).unwrap();
        // 792 * 2 lanes
        assert_eq!(imx.timing().hmax, 1584);
        assert_eq!(imx.ctrl(ControlId::PixelRate), 3856 * 74_250_000 / 1584);
        assert_eq!(imx.ctrl(ControlId::LinkFreq), 594_000_000);
        assert!(matches!(
            imx.configure_link(3, 0),
            Err(Error::Config(crate::ConfigError::UnsupportedLaneCount(3)))
        ));

        imx.start_streaming().unwrap();
        assert_eq!(log.last_value(Register::DataRateSel.addr()), Some(0x04));
        assert_eq!(log.last_value(Register::LaneMode.addr()), Some(0x01));
        assert!(matches!(imx.configure_link(4, 5), Err(Error::Busy)));
    }

    #[test]
    fn probe_reads_and_powers_back_down() {
        let (imx, log) = sensor();
        imx.probe().unwrap();
        assert_eq!(log.reads(), vec![Register::BlkLevel.addr()]);
        assert_eq!((log.power_ons(), log.power_offs()), (1, 1));

        log.fail_on(Register::BlkLevel.addr());
        assert!(matches!(imx.probe(), Err(Error::Comm(_))));
        assert!(!imx.is_powered());
    }

    #[test]
    fn suspend_and_resume_restart_the_stream() {
        let (imx, log) = sensor();
        imx.start_streaming().unwrap();
        log.clear();
        imx.suspend();
        assert_eq!(log.writes(), vec![(Register::ModeSelect.addr(), vec![1])]);
        assert_eq!(imx.stream_state(), StreamState::Streaming);

        log.clear();
        imx.resume().unwrap();
        assert_eq!(log.last_value(Register::ModeSelect.addr()), Some(0));
        assert_eq!(log.count(COMMON_REGS[0].0), 0);
    }

    #[test]
    fn failed_resume_falls_back_to_standby() {
        let (imx, log) = sensor();
        imx.start_streaming().unwrap();
        imx.suspend();
        log.fail_on(0x301B);
        assert!(imx.resume().is_err());
        assert_eq!(imx.stream_state(), StreamState::Standby);
        assert!(!imx.is_powered());
    }
}
