//! Hardware abstraction for the digital test board
//!
//! The core only ever talks to the board through this trait. Every
//! method is a blocking USB transaction on real hardware, so callers
//! must interleave status polls with buffer drains during long runs.
//!
//! The firmware test loops come in four shapes - per-pixel or
//! whole-ROC, on a single ROC or on all ROCs of a module in
//! parallel. A test picks its four entry points by filling a
//! [`ScanRoutines`] table; entries can be absent, the loop expander
//! falls back accordingly.
//!

use pxar_dataclasses::events::{Event, RawEvent};

use crate::dut::PixelConfig;

/// One test loop on one pixel of one ROC
pub type PixelSerialFn   = fn(&mut dyn TestboardHal, u8, u8, u8, &[i32]) -> Vec<Event>;
/// One test loop on one pixel, on several ROCs in parallel
pub type PixelParallelFn = fn(&mut dyn TestboardHal, &[u8], u8, u8, &[i32]) -> Vec<Event>;
/// One test loop over the full pixel matrix of one ROC
pub type RocSerialFn     = fn(&mut dyn TestboardHal, u8, &[i32]) -> Vec<Event>;
/// One test loop over the full pixel matrix, on several ROCs in parallel
pub type RocParallelFn   = fn(&mut dyn TestboardHal, &[u8], &[i32]) -> Vec<Event>;

/// The four possible firmware entry points of one test
///
/// Replaces the member-function-pointer table of earlier
/// implementations: any entry may be absent and the loop
/// expander matches on what is there.
pub struct ScanRoutines {
  pub pixel      : Option<PixelSerialFn>,
  pub multipixel : Option<PixelParallelFn>,
  pub roc        : Option<RocSerialFn>,
  pub multiroc   : Option<RocParallelFn>,
}

impl ScanRoutines {

  /// Plain calibrate pulses, no DAC sweep. Parameters: [flags, nTriggers]
  pub fn calibrate() -> Self {
    Self {
      pixel      : Some(|hal, i2c, col, row, param| hal.single_roc_one_pixel_calibrate(i2c, col, row, param)),
      multipixel : Some(|hal, i2cs, col, row, param| hal.multi_roc_one_pixel_calibrate(i2cs, col, row, param)),
      roc        : Some(|hal, i2c, param| hal.single_roc_all_pixels_calibrate(i2c, param)),
      multiroc   : Some(|hal, i2cs, param| hal.multi_roc_all_pixels_calibrate(i2cs, param)),
    }
  }

  /// 1D DAC sweep. Parameters: [dacReg, dacMin, dacMax, flags, nTriggers, dacStep]
  pub fn dac_scan() -> Self {
    Self {
      pixel      : Some(|hal, i2c, col, row, param| hal.single_roc_one_pixel_dac_scan(i2c, col, row, param)),
      multipixel : Some(|hal, i2cs, col, row, param| hal.multi_roc_one_pixel_dac_scan(i2cs, col, row, param)),
      roc        : Some(|hal, i2c, param| hal.single_roc_all_pixels_dac_scan(i2c, param)),
      multiroc   : Some(|hal, i2cs, param| hal.multi_roc_all_pixels_dac_scan(i2cs, param)),
    }
  }

  /// 2D DAC sweep. Parameters: [dac1Reg, dac1Min, dac1Max, dac2Reg,
  /// dac2Min, dac2Max, flags, nTriggers, dac1Step, dac2Step]
  pub fn dac_dac_scan() -> Self {
    Self {
      pixel      : Some(|hal, i2c, col, row, param| hal.single_roc_one_pixel_dac_dac_scan(i2c, col, row, param)),
      multipixel : Some(|hal, i2cs, col, row, param| hal.multi_roc_one_pixel_dac_dac_scan(i2cs, col, row, param)),
      roc        : Some(|hal, i2c, param| hal.single_roc_all_pixels_dac_dac_scan(i2c, param)),
      multiroc   : Some(|hal, i2cs, param| hal.multi_roc_all_pixels_dac_dac_scan(i2cs, param)),
    }
  }

  /// 2D DAC sweep for threshold extraction. The whole-ROC entries
  /// stay absent - a full-matrix 2D sweep would run for years and
  /// overflow the DTB buffer long before that.
  pub fn threshold_dac_dac_scan() -> Self {
    Self {
      pixel      : Some(|hal, i2c, col, row, param| hal.single_roc_one_pixel_dac_dac_scan(i2c, col, row, param)),
      multipixel : Some(|hal, i2cs, col, row, param| hal.multi_roc_one_pixel_dac_dac_scan(i2cs, col, row, param)),
      roc        : None,
      multiroc   : None,
    }
  }
}

/// Operations the core invokes on the test board
pub trait TestboardHal {

  // ---- board status ----

  /// Firmware/API handshake succeeded
  fn compatible(&self) -> bool;
  /// Board is initialized and ready for DUT traffic
  fn status(&self) -> bool;

  // ---- testboard configuration ----

  fn init_testboard(&mut self,
                    sig_delays : &std::collections::HashMap<u8, u8>,
                    pg_setup   : &[(u16, u8)],
                    pg_sum     : u32,
                    va         : f64,
                    vd         : f64,
                    ia         : f64,
                    id         : f64);
  fn set_testboard_delays(&mut self, sig_delays : &std::collections::HashMap<u8, u8>);
  fn setup_pattern_generator(&mut self, pg_setup : &[(u16, u8)], pg_sum : u32);
  fn set_testboard_power(&mut self, va : f64, vd : f64, ia : f64, id : f64);

  // ---- power and telemetry ----

  fn pon(&mut self);
  fn poff(&mut self);
  fn hv_on(&mut self);
  fn hv_off(&mut self);
  fn get_tb_va(&mut self) -> f64;
  fn get_tb_vd(&mut self) -> f64;
  fn get_tb_ia(&mut self) -> f64;
  fn get_tb_id(&mut self) -> f64;

  // ---- probes and clock ----

  fn signal_probe_d1(&mut self, signal : u8);
  fn signal_probe_d2(&mut self, signal : u8);
  fn signal_probe_a1(&mut self, signal : u8);
  fn signal_probe_a2(&mut self, signal : u8);
  fn set_clock_stretch(&mut self, src : u8, width : u16, delay : u16);

  // ---- DUT programming ----

  fn set_hub_id(&mut self, hub_id : u8);
  fn init_tbm_core(&mut self, tbm_type : u8, dacs : &std::collections::HashMap<u8, u8>);
  fn init_roc(&mut self, i2c : u8, roc_type : u8, dacs : &std::collections::HashMap<u8, u8>);
  fn tbm_set_reg(&mut self, register : u8, value : u8);
  fn roc_set_dac(&mut self, i2c : u8, register : u8, value : u8);

  /// Mask the whole ROC (mask = true, pixels ignored) or load the
  /// supplied trim/mask state in one go (mask = false)
  fn roc_set_mask(&mut self, i2c : u8, mask : bool, pixels : &[PixelConfig]);
  fn pixel_set_calibrate(&mut self, i2c : u8, column : u8, row : u8, flags : u16);
  fn roc_clear_calibrate(&mut self, i2c : u8);
  fn all_columns_set_enable(&mut self, i2c : u8, enable : bool);

  /// Upload the configured I2C addresses to the NIOS soft core
  fn setup_i2c_values(&mut self, i2cs : &[u8]);
  /// Upload the full trim table of one ROC to the NIOS soft core, so
  /// the firmware side parallel routines run without per-pixel
  /// round-trips
  fn setup_trim_values(&mut self, i2c : u8, pixels : &[PixelConfig]);

  // ---- DAQ ----

  fn daq_start(&mut self, deser160phase : u8, n_tbms : u8, buffersize : u32);
  fn daq_stop(&mut self);
  fn daq_clear(&mut self);
  /// Number of 16bit words currently held in the DTB event buffer
  fn daq_buffer_status(&mut self) -> u32;
  fn daq_trigger(&mut self, n_trig : u32, period : u16);
  fn daq_trigger_loop(&mut self, period : u16);
  fn daq_trigger_loop_halt(&mut self);
  fn daq_buffer(&mut self) -> Vec<u16>;
  fn daq_all_raw_events(&mut self) -> Vec<RawEvent>;
  fn daq_all_events(&mut self) -> Vec<Event>;
  fn daq_event(&mut self) -> Option<Event>;
  fn daq_raw_event(&mut self) -> Option<RawEvent>;

  // ---- firmware test loops ----

  fn single_roc_one_pixel_calibrate(&mut self, i2c : u8, column : u8, row : u8, param : &[i32]) -> Vec<Event>;
  fn multi_roc_one_pixel_calibrate(&mut self, i2cs : &[u8], column : u8, row : u8, param : &[i32]) -> Vec<Event>;
  fn single_roc_all_pixels_calibrate(&mut self, i2c : u8, param : &[i32]) -> Vec<Event>;
  fn multi_roc_all_pixels_calibrate(&mut self, i2cs : &[u8], param : &[i32]) -> Vec<Event>;

  fn single_roc_one_pixel_dac_scan(&mut self, i2c : u8, column : u8, row : u8, param : &[i32]) -> Vec<Event>;
  fn multi_roc_one_pixel_dac_scan(&mut self, i2cs : &[u8], column : u8, row : u8, param : &[i32]) -> Vec<Event>;
  fn single_roc_all_pixels_dac_scan(&mut self, i2c : u8, param : &[i32]) -> Vec<Event>;
  fn multi_roc_all_pixels_dac_scan(&mut self, i2cs : &[u8], param : &[i32]) -> Vec<Event>;

  fn single_roc_one_pixel_dac_dac_scan(&mut self, i2c : u8, column : u8, row : u8, param : &[i32]) -> Vec<Event>;
  fn multi_roc_one_pixel_dac_dac_scan(&mut self, i2cs : &[u8], column : u8, row : u8, param : &[i32]) -> Vec<Event>;
  fn single_roc_all_pixels_dac_dac_scan(&mut self, i2c : u8, param : &[i32]) -> Vec<Event>;
  fn multi_roc_all_pixels_dac_dac_scan(&mut self, i2cs : &[u8], param : &[i32]) -> Vec<Event>;
}
