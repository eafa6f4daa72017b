//! The pxar core API
//!
//! Owns the DUT model and the HAL exclusively. Callers hand in
//! register settings by name, the API validates them against the
//! dictionaries, keeps the model up to date and drives the test
//! board. Test functions expand into firmware loop calls via
//! [`expand_loop`](Api::expand_loop) and hand the event stream to
//! the repackers.
//!
//! Error conventions follow the validator/operational split: broken
//! configurations return a ConfigError, everything operational
//! (board not ready, DAQ not running, unknown name at runtime)
//! degrades to bool/empty returns with a log message.
//!

use std::time::Instant;

use pxar_dataclasses::constants::*;
use pxar_dataclasses::dictionaries::{DeviceDictionary,
                                     PatternGeneratorDictionary,
                                     ProbeDictionary,
                                     RegisterDictionary,
                                     RegisterKind};
use pxar_dataclasses::errors::ConfigError;
use pxar_dataclasses::events::{Event, Pixel, RawEvent};

use crate::dut::{PixelConfig, RocConfig, TbmConfig, DUT};
use crate::hal::{ScanRoutines, TestboardHal};
use crate::repack::{repack_dac_dac_scan_data,
                    repack_dac_scan_data,
                    repack_map_data,
                    repack_threshold_dac_scan_data,
                    repack_threshold_map_data};

/// The pxar core API instance
///
/// One instance owns one test board and the module attached to it.
pub struct Api<H : TestboardHal> {
  pub hal   : H,
  pub dut   : DUT,
  registers : RegisterDictionary,
  devices   : DeviceDictionary,
  probes    : ProbeDictionary,
  pg_dict   : PatternGeneratorDictionary,
  daq_running            : bool,
  daq_buffersize         : u32,
  ndecode_errors_lastdaq : u32,
}

impl<H : TestboardHal> Api<H> {

  pub fn new(hal : H) -> Self {
    Self::with_buffer_size(hal, DTB_SOURCE_BUFFER_SIZE)
  }

  /// Mainly for tests: run against a smaller DAQ buffer so the
  /// back-pressure paths can be exercised without filling the full
  /// DTB memory
  pub fn with_buffer_size(hal : H, daq_buffersize : u32) -> Self {
    info!("Instanciating API for pxar-core");
    Self {
      hal,
      dut       : DUT::new(),
      registers : RegisterDictionary::new(),
      devices   : DeviceDictionary::new(),
      probes    : ProbeDictionary::new(),
      pg_dict   : PatternGeneratorDictionary::new(),
      daq_running            : false,
      daq_buffersize         : daq_buffersize,
      ndecode_errors_lastdaq : 0,
    }
  }

  pub fn get_version(&self) -> String {
    format!("pxar-core v{}", env!("CARGO_PKG_VERSION"))
  }

  /// HAL and DUT are both ready for test traffic
  pub fn status(&self) -> bool {
    self.hal.status() && self.dut.status()
  }

  // ---- configuration validators (C3) ----

  /// Look up a register by name and clamp the value to its size.
  /// Returns (register id, clamped value), or None for unknown names.
  pub fn verify_register(&self, name : &str, value : u8, kind : RegisterKind) -> Option<(u8, u8)> {
    let name = name.to_lowercase();
    let entry = match self.registers.get_register(&name, kind) {
      Some(entry) => entry,
      None        => {
        error!("Invalid register name \"{}\".", name);
        return None;
      }
    };
    let mut value = value;
    if value > entry.size {
      warn!("Register range overflow, set register \"{}\" ({}) to {} (was: {})",
            name, entry.id, entry.size, value);
      value = entry.size;
    }
    debug!("Verified register \"{}\" ({}): {} (max {})", name, entry.id, value, entry.size);
    Some((entry.id, value))
  }

  /// Device code for a device type name, None for unknown types
  pub fn string_to_device_code(&self, name : &str) -> Option<u8> {
    let name = name.to_lowercase();
    debug!("Looking up device type for \"{}\"", name);
    let code = self.devices.get_dev_code(&name);
    match code {
      Some(code) => debug!("Device type return: {}", code),
      None       => error!("Unknown device \"{}\"!", name),
    }
    code
  }

  /// Validate power settings and store them in the DUT
  ///
  /// Recognised keys are va, vd, ia, id. Negative values fall back
  /// to the default limit, values above the limit are clamped.
  pub fn check_testboard_power(&mut self, power_settings : &[(&str, f64)]) -> Result<(), ConfigError> {
    let mut va = POWER_LIMIT_VA;
    let mut vd = POWER_LIMIT_VD;
    let mut ia = POWER_LIMIT_IA;
    let mut id = POWER_LIMIT_ID;

    for (key, value) in power_settings {
      let key = key.to_lowercase();
      if *value < 0.0 {
        error!("Negative value for power setting \"{}\". Using default limit.", key);
        continue;
      }
      match key.as_str() {
        "va" => {
          if *value > va { warn!("Limiting \"{}\" to {}", key, va); } else { va = *value; }
        }
        "vd" => {
          if *value > vd { warn!("Limiting \"{}\" to {}", key, vd); } else { vd = *value; }
        }
        "ia" => {
          if *value > ia { warn!("Limiting \"{}\" to {}", key, ia); } else { ia = *value; }
        }
        "id" => {
          if *value > id { warn!("Limiting \"{}\" to {}", key, id); } else { id = *value; }
        }
        _ => {
          error!("Unknown power setting {}! Skipping.", key);
        }
      }
    }

    if va < POWER_MINIMUM || vd < POWER_MINIMUM || ia < POWER_MINIMUM || id < POWER_MINIMUM {
      error!("Power settings are not sufficient. Please check and re-configure!");
      return Err(ConfigError::InsufficientPower);
    }

    self.dut.va = va;
    self.dut.vd = vd;
    self.dut.ia = ia;
    self.dut.id = id;
    Ok(())
  }

  /// Validate DTB signal delays and store them in the DUT.
  /// Duplicate names overwrite each other with a warning.
  pub fn check_testboard_delays(&mut self, sig_delays : &[(&str, u8)]) {
    let mut delays = std::collections::HashMap::<u8, u8>::new();
    for &(name, value) in sig_delays {
      let (register, value) = match self.verify_register(name, value, RegisterKind::Dtb) {
        Some(verified) => verified,
        None           => continue,
      };
      if let Some(old) = delays.insert(register, value) {
        warn!("Overwriting existing DTB delay setting \"{}\" value {} with {}", name, old, value);
      }
    }
    self.dut.sig_delays = delays;
  }

  /// Validate a pattern generator setup and store it in the DUT
  ///
  /// Signal strings may combine several mnemonics with ';'. An
  /// interior zero delay is fatal since it stops the pattern
  /// generator early, a missing terminator is fixed up.
  pub fn verify_pattern_generator(&mut self, pg_setup : &[(&str, u8)]) -> Result<(), ConfigError> {
    let mut patterns = Vec::<(u16, u8)>::new();

    if pg_setup.len() > PG_MAX_CMDS {
      error!("Pattern too long ({} entries) for pattern generator. Only {} entries allowed!",
             pg_setup.len(), PG_MAX_CMDS);
      return Err(ConfigError::PatternGeneratorTooLong);
    }
    debug!("Pattern generator setup with {} entries provided.", pg_setup.len());

    for (n, (name, delay)) in pg_setup.iter().enumerate() {
      let last = n + 1 == pg_setup.len();

      if *delay == 0 && !last {
        error!("Found delay = 0 on early entry! This stops the pattern generator at position {}.", n);
        return Err(ConfigError::PatternGeneratorEarlyStop);
      }
      let mut delay = *delay;
      if last && delay != 0 {
        warn!("No delay = 0 found on last entry. Setting last delay to 0 to stop the pattern generator.");
        delay = 0;
      }

      let mut signal : u16 = 0;
      for token in name.to_lowercase().split(';') {
        match self.pg_dict.get_signal(token) {
          Some(sig) => {
            signal |= sig;
            debug!("Found PG signal {} ({:04x})", token, sig);
          }
          None => {
            error!("Could not find pattern generator signal \"{}\" in the dictionary!", token);
            return Err(ConfigError::UnknownPatternSignal);
          }
        }
      }
      patterns.push((signal, delay));
    }

    self.dut.pg_setup = patterns;
    self.dut.pg_sum   = Self::get_pattern_generator_delay_sum(&self.dut.pg_setup);
    Ok(())
  }

  /// Total pattern generator cycle length: sum of all delays plus
  /// one clock cycle per command, plus one more clock cycle
  pub fn get_pattern_generator_delay_sum(pg_setup : &[(u16, u8)]) -> u32 {
    let mut delay_sum : u32 = 0;
    for (_, delay) in pg_setup {
      delay_sum += *delay as u32 + 1;
    }
    delay_sum += 1;
    debug!("Sum of Pattern generator delays: {} clk", delay_sum);
    delay_sum
  }

  // ---- testboard setup ----

  /// Validate the full testboard configuration and bring the board up
  pub fn init_testboard(&mut self,
                        sig_delays     : &[(&str, u8)],
                        power_settings : &[(&str, f64)],
                        pg_setup       : &[(&str, u8)]) -> Result<bool, ConfigError> {
    if !self.hal.compatible() {
      return Ok(false);
    }
    self.check_testboard_power(power_settings)?;
    self.check_testboard_delays(sig_delays);
    self.verify_pattern_generator(pg_setup)?;

    self.hal.init_testboard(&self.dut.sig_delays, &self.dut.pg_setup, self.dut.pg_sum,
                            self.dut.va, self.dut.vd, self.dut.ia, self.dut.id);
    Ok(true)
  }

  pub fn set_testboard_delays(&mut self, sig_delays : &[(&str, u8)]) -> bool {
    if !self.hal.status() {
      error!("Signal delays not updated!");
      return false;
    }
    self.check_testboard_delays(sig_delays);
    self.hal.set_testboard_delays(&self.dut.sig_delays);
    debug!("Testboard signal delays updated.");
    true
  }

  pub fn set_pattern_generator(&mut self, pg_setup : &[(&str, u8)]) -> Result<bool, ConfigError> {
    if !self.hal.status() {
      error!("Pattern generator not updated!");
      return Ok(false);
    }
    self.verify_pattern_generator(pg_setup)?;
    self.hal.setup_pattern_generator(&self.dut.pg_setup, self.dut.pg_sum);
    debug!("Pattern generator verified and updated.");
    Ok(true)
  }

  pub fn set_testboard_power(&mut self, power_settings : &[(&str, f64)]) -> Result<bool, ConfigError> {
    if !self.hal.status() {
      error!("Voltages/current limits not updated!");
      return Ok(false);
    }
    self.check_testboard_power(power_settings)?;
    self.hal.set_testboard_power(self.dut.va, self.dut.vd, self.dut.ia, self.dut.id);
    debug!("Voltages/current limits updated.");
    Ok(true)
  }

  // ---- DUT initialization (C2/C3) and programming (C4) ----

  /// Validate a full DUT configuration, store it in the model and
  /// program the device
  pub fn init_dut(&mut self,
                  hub_id     : u8,
                  tbm_type   : &str,
                  tbm_dacs   : &[Vec<(&str, u8)>],
                  roc_type   : &str,
                  roc_dacs   : &[Vec<(&str, u8)>],
                  roc_pixels : &[Vec<PixelConfig>]) -> Result<bool, ConfigError> {

    if !self.hal.status() {
      return Ok(false);
    }

    // Sanity checks of the supplied configuration
    if roc_dacs.len() != roc_pixels.len() {
      error!("Hm, we have {} DAC configs but {} pixel configs.", roc_dacs.len(), roc_pixels.len());
      error!("This cannot end well...");
      return Err(ConfigError::DacPixelConfigMismatch);
    }
    if roc_dacs.is_empty() {
      error!("No DAC/pixel configurations for any ROC supplied!");
      return Err(ConfigError::NoRocConfigs);
    }

    for (n, pixels) in roc_pixels.iter().enumerate() {
      if pixels.is_empty() {
        warn!("No pixel configured for ROC {}!", n);
      }
      if pixels.len() > ROC_NUMPIXELS as usize {
        error!("Too many pixels (N_pixel={} > {}) configured for ROC {}!",
               pixels.len(), ROC_NUMPIXELS, n);
        return Err(ConfigError::TooManyPixels);
      }
      let mut nduplicates = 0;
      for px in pixels {
        if pixels.iter().filter(|other| other.column == px.column && other.row == px.row).count() > 1 {
          error!("Config for pixel in column {} and row {} present multiple times in ROC {}!",
                 px.column, px.row, n);
          nduplicates += 1;
        }
      }
      if nduplicates > 0 {
        return Err(ConfigError::DuplicatePixels);
      }
      if pixels.iter().any(|px| px.column >= ROC_NUMCOLS || px.row >= ROC_NUMROWS) {
        error!("Found pixels with values for column and row outside of valid address range on ROC {}!", n);
        return Err(ConfigError::PixelOutsideAddressRange);
      }
    }

    debug!("We have {} DAC configs and {} pixel configs.", roc_dacs.len(), roc_pixels.len());

    // Store the hub id:
    self.dut.hub_id = hub_id;

    // Initialize TBM cores. Even list entries are alpha cores, odd
    // ones beta cores:
    debug!("Received settings for {} TBM cores.", tbm_dacs.len());
    self.dut.tbms.clear();
    for (n, dacs) in tbm_dacs.iter().enumerate() {
      debug!("Processing TBM Core {}", n);
      let tbm_code = match self.string_to_device_code(tbm_type) {
        Some(code) => code,
        None       => return Ok(false),
      };
      let mut newtbm = TbmConfig::new(tbm_code);
      let core = if n % 2 == 0 { 0xe0 } else { 0xf0 };
      for &(name, value) in dacs {
        let (register, value) = match self.verify_register(name, value, RegisterKind::Tbm) {
          Some(verified) => verified,
          None           => continue,
        };
        let register = core | register;
        if let Some(old) = newtbm.dacs.insert(register, value) {
          warn!("Overwriting existing DAC \"{}\" value {} with {}", name, old, value);
        }
      }
      self.dut.tbms.push(newtbm);
    }

    // If we only got one core configuration, re-use it for the
    // second TBM core by flipping the core selector bit:
    if self.dut.tbms.len() == 1 {
      debug!("Only register settings for one TBM core supplied. Duplicating to second core.");
      let mut newtbm = TbmConfig::new(self.dut.tbms[0].tbm_type);
      for (&register, &value) in &self.dut.tbms[0].dacs {
        newtbm.dacs.insert(register ^ (1 << 4), value);
      }
      self.dut.tbms.push(newtbm);
    }

    // Initialize ROCs. The I2C address is the position in the list:
    self.dut.rocs.clear();
    for (n, dacs) in roc_dacs.iter().enumerate() {
      let roc_code = match self.string_to_device_code(roc_type) {
        Some(code) => code,
        None       => return Ok(false),
      };
      let mut newroc = RocConfig::new(roc_code, n as u8);
      debug!("I2C address for the next ROC is: {}", newroc.i2c_address);

      for &(name, value) in dacs {
        let (register, value) = match self.verify_register(name, value, RegisterKind::Roc) {
          Some(verified) => verified,
          None           => continue,
        };
        if let Some(old) = newroc.dacs.insert(register, value) {
          warn!("Overwriting existing DAC \"{}\" value {} with {}", name, old, value);
        }
      }

      for px in &roc_pixels[n] {
        let mut px = *px;
        if px.trim > 15 {
          warn!("Pixel {},{} trim value {} exceeds limit. Set to 15.", px.column, px.row, px.trim);
          px.trim = 15;
        }
        newroc.pixels.push(px);
      }

      self.dut.rocs.push(newroc);
    }

    // All data is stored in the DUT struct, now programming it.
    self.dut.initialized = true;
    Ok(self.program_dut())
  }

  /// Flush the validated model state to the hardware
  pub fn program_dut(&mut self) -> bool {
    if !self.dut.initialized {
      error!("DUT not initialized, unable to program it.");
      return false;
    }

    // First thing to do: startup DUT power if not yet done
    self.hal.pon();
    self.hal.set_hub_id(self.dut.hub_id);

    if self.dut.get_n_enabled_tbms() > 0 {
      debug!("Programming TBMs...");
    }
    for tbm in self.dut.tbms.iter().filter(|t| t.enable) {
      self.hal.init_tbm_core(tbm.tbm_type, &tbm.dacs);
    }

    if self.dut.get_n_enabled_rocs() > 0 {
      debug!("Programming ROCs...");
    }
    for roc in self.dut.rocs.iter().filter(|r| r.enable) {
      self.hal.init_roc(roc.i2c_address, roc.roc_type, &roc.dacs);
    }

    // As last step, mask all pixels in the device:
    self.mask_and_trim(false);

    // The DUT is programmed, everything all right:
    self.dut.programmed = true;
    true
  }

  // ---- power and probes ----

  pub fn hv_on(&mut self) {
    self.hal.hv_on();
  }

  pub fn hv_off(&mut self) {
    self.hal.hv_off();
  }

  /// Power off the DUT. The model is preserved, only the programmed
  /// state is lost.
  pub fn poff(&mut self) {
    self.hal.poff();
    self.dut.programmed = false;
  }

  /// Power on and re-program the DUT from the preserved model
  pub fn pon(&mut self) -> bool {
    self.program_dut()
  }

  pub fn get_tb_va(&mut self) -> f64 {
    if !self.hal.status() { return 0.0; }
    self.hal.get_tb_va()
  }

  pub fn get_tb_vd(&mut self) -> f64 {
    if !self.hal.status() { return 0.0; }
    self.hal.get_tb_vd()
  }

  pub fn get_tb_ia(&mut self) -> f64 {
    if !self.hal.status() { return 0.0; }
    self.hal.get_tb_ia()
  }

  pub fn get_tb_id(&mut self) -> f64 {
    if !self.hal.status() { return 0.0; }
    self.hal.get_tb_id()
  }

  /// Route a signal to one of the four probe outputs (d1, d2, a1, a2)
  pub fn signal_probe(&mut self, probe : &str, name : &str) -> bool {
    if !self.hal.status() {
      return false;
    }
    let probe = probe.to_lowercase();
    let name  = name.to_lowercase();

    if probe.starts_with('d') {
      let signal = match self.probes.get_digital_signal(&name) {
        Some(signal) => signal,
        None         => {
          error!("Invalid digital probe signal \"{}\" selected!", name);
          return false;
        }
      };
      debug!("Digital probe signal lookup for \"{}\" returned signal: {}", name, signal);
      if probe == "d1" {
        self.hal.signal_probe_d1(signal);
        return true;
      } else if probe == "d2" {
        self.hal.signal_probe_d2(signal);
        return true;
      }
    } else if probe.starts_with('a') {
      let signal = match self.probes.get_analog_signal(&name) {
        Some(signal) => signal,
        None         => {
          error!("Invalid analog probe signal \"{}\" selected!", name);
          return false;
        }
      };
      debug!("Analog probe signal lookup for \"{}\" returned signal: {}", name, signal);
      if probe == "a1" {
        self.hal.signal_probe_a1(signal);
        return true;
      } else if probe == "a2" {
        self.hal.signal_probe_a2(signal);
        return true;
      }
    }

    error!("Invalid probe name \"{}\" selected!", probe);
    false
  }

  pub fn set_clock_stretch(&mut self, src : u8, delay : u16, width : u16) {
    debug!("Set Clock Stretch {} {} {}", src, delay, width);
    self.hal.set_clock_stretch(src, width, delay);
  }

  // ---- register writes ----

  /// Set a DAC on all enabled ROCs
  pub fn set_dac(&mut self, dac_name : &str, dac_value : u8) -> bool {
    if !self.status() {
      return false;
    }
    let (register, value) = match self.verify_register(dac_name, dac_value, RegisterKind::Roc) {
      Some(verified) => verified,
      None           => return false,
    };
    let enabled = self.dut.get_enabled_roc_ids();
    for &roc_id in &enabled {
      let roc = &mut self.dut.rocs[roc_id as usize];
      match roc.dacs.insert(register, value) {
        None    => warn!("DAC \"{}\" was not initialized. Created with value {}", dac_name, value),
        Some(_) => debug!("DAC \"{}\" updated with value {}", dac_name, value),
      }
      let i2c = roc.i2c_address;
      self.hal.roc_set_dac(i2c, register, value);
    }
    true
  }

  /// Set a DAC on one ROC by its position, even if that ROC is disabled
  pub fn set_roc_dac(&mut self, dac_name : &str, dac_value : u8, roc_id : usize) -> bool {
    if !self.status() {
      return false;
    }
    let (register, value) = match self.verify_register(dac_name, dac_value, RegisterKind::Roc) {
      Some(verified) => verified,
      None           => return false,
    };
    if roc_id >= self.dut.rocs.len() {
      error!("ROC {} does not exist in the DUT!", roc_id);
      return false;
    }
    let roc = &mut self.dut.rocs[roc_id];
    match roc.dacs.insert(register, value) {
      None    => warn!("DAC \"{}\" was not initialized. Created with value {}", dac_name, value),
      Some(_) => debug!("DAC \"{}\" updated with value {}", dac_name, value),
    }
    let i2c = roc.i2c_address;
    self.hal.roc_set_dac(i2c, register, value);
    true
  }

  /// Current value of a DAC on the ROC at the given position
  pub fn get_dac(&self, roc_id : usize, dac_name : &str) -> Option<u8> {
    let entry = self.registers.get_register(&dac_name.to_lowercase(), RegisterKind::Roc)?;
    self.dut.get_dac(roc_id, entry.id)
  }

  /// Maximum permitted value of a ROC DAC, 0 for unknown names
  pub fn get_dac_range(&self, dac_name : &str) -> u8 {
    match self.registers.get_register(&dac_name.to_lowercase(), RegisterKind::Roc) {
      Some(entry) => entry.size,
      None        => {
        error!("Invalid register name \"{}\".", dac_name);
        0
      }
    }
  }

  /// Set a register on one TBM core. The core selector nibble is
  /// taken over from the existing registers of that core.
  pub fn set_tbm_core_reg(&mut self, reg_name : &str, reg_value : u8, tbm_id : usize) -> bool {
    if !self.status() {
      return false;
    }
    let (register, value) = match self.verify_register(reg_name, reg_value, RegisterKind::Tbm) {
      Some(verified) => verified,
      None           => return false,
    };
    if tbm_id >= self.dut.tbms.len() {
      error!("TBM {} is not existing in the DUT!", tbm_id);
      return false;
    }
    let register = self.dut.tbms[tbm_id].core_selector() | register;
    match self.dut.tbms[tbm_id].dacs.insert(register, value) {
      None    => warn!("Register \"{}\" ({:02x}) was not initialized. Created with value {}",
                       reg_name, register, value),
      Some(_) => debug!("Register \"{}\" ({:02x}) updated with value {}", reg_name, register, value),
    }
    self.hal.tbm_set_reg(register, value);
    true
  }

  /// Set a register on all TBM cores
  pub fn set_tbm_reg(&mut self, reg_name : &str, reg_value : u8) -> bool {
    for tbm_id in 0..self.dut.tbms.len() {
      if !self.set_tbm_core_reg(reg_name, reg_value, tbm_id) {
        return false;
      }
    }
    true
  }

  /// Intended to read back DAC settings through the ROC readback
  /// chain.
  pub fn get_readback_value(&self, _parameter_name : &str) -> i32 {
    if !self.status() { return -1; }
    error!("NOT IMPLEMENTED YET! (File a bug report if you need this urgently...)");
    -1
  }

  // ---- mask/trim helpers (C4) ----

  /// Mask the whole DUT (trim = false) or load the configured
  /// trim/mask state on every ROC (trim = true)
  pub fn mask_and_trim(&mut self, trim : bool) {
    for roc_id in 0..self.dut.rocs.len() {
      self.mask_and_trim_roc(trim, roc_id);
    }
  }

  /// Mask or trim a single ROC in one go
  pub fn mask_and_trim_roc(&mut self, trim : bool, roc_id : usize) {
    let roc = match self.dut.rocs.get(roc_id) {
      Some(roc) => roc,
      None      => {
        warn!("ROC {} does not exist in the DUT!", roc_id);
        return;
      }
    };
    let i2c = roc.i2c_address;
    if trim {
      debug!("ROC@I2C {} features {} masked pixels.", i2c,
             roc.pixels.iter().filter(|px| px.mask).count());
      debug!("Unmasking and trimming ROC@I2C {} in one go.", i2c);
      let pixels = roc.pixels.clone();
      self.hal.roc_set_mask(i2c, false, &pixels);
    } else {
      debug!("Masking ROC@I2C {} in one go.", i2c);
      self.hal.roc_set_mask(i2c, true, &[]);
    }
  }

  /// Upload I2C addresses and the full trim tables to the NIOS soft
  /// core, so the firmware side parallel routines can run without
  /// per-pixel round-trips
  pub fn mask_and_trim_nios(&mut self) {
    let i2cs = self.dut.get_roc_i2c_addr();
    self.hal.setup_i2c_values(&i2cs);
    for roc_id in 0..self.dut.rocs.len() {
      let i2c    = self.dut.rocs[roc_id].i2c_address;
      let pixels = self.dut.rocs[roc_id].pixels.clone();
      self.hal.setup_trim_values(i2c, &pixels);
    }
  }

  /// Set or clear the calibrate bits in the enabled PUCs of all ROCs
  pub fn set_calibrate_bits(&mut self, enable : bool) {
    for roc_id in 0..self.dut.rocs.len() {
      let i2c = self.dut.rocs[roc_id].i2c_address;
      debug!("Configuring calibrate bits in all enabled PUCs of ROC@I2C {}", i2c);
      if enable {
        let armed : Vec<(u8, u8)> = self.dut.rocs[roc_id].pixels.iter()
          .filter(|px| px.enable)
          .map(|px| (px.column, px.row))
          .collect();
        for (column, row) in armed {
          self.hal.pixel_set_calibrate(i2c, column, row, 0);
        }
      } else {
        self.hal.roc_clear_calibrate(i2c);
      }
    }
  }

  // ---- the loop expander (C5) ----

  /// Expand one test over the enabled pixels and ROCs of the DUT
  ///
  /// Picks the most efficient of the four firmware entry points:
  /// whole-module parallel calls when more than one ROC is enabled
  /// and the caller did not force serial execution, per-ROC or
  /// per-pixel calls otherwise. Returns the concatenated event
  /// stream in HAL production order.
  pub fn expand_loop(&mut self, fns : &ScanRoutines, param : Vec<i32>, flags : u16) -> Vec<Event> {
    let mut data = Vec::<Event>::new();
    let timer = Instant::now();

    // Mask discipline first. Unless we run unmasked, transmit the new
    // trim values to the NIOS core and mask the whole DUT:
    if (flags & FLAG_FORCE_UNMASKED) == 0 {
      self.mask_and_trim_nios();
      self.mask_and_trim(false);
    } else if (flags & FLAG_FORCE_SERIAL) != 0 {
      // unmasked serial: each ROC gets trimmed right before its call
      self.mask_and_trim(false);
    } else {
      // unmasked parallel: trim the whole DUT once
      self.mask_and_trim(true);
    }

    // Parallel routines need more than one enabled ROC and no
    // FORCE_SERIAL from the caller:
    if self.dut.get_n_enabled_rocs() > 1 && (flags & FLAG_FORCE_SERIAL) == 0 {
      let rocs_i2c = self.dut.get_enabled_roc_i2c_addr();

      if self.dut.get_all_pixel_enable() && fns.multiroc.is_some() {
        debug!("\"The Loop\" contains one call to 'multirocfn'");
        data = (fns.multiroc.unwrap())(&mut self.hal, &rocs_i2c, &param);
      } else if let Some(multipixelfn) = fns.multipixel {
        // The enabled pixel list is taken from the first enabled ROC;
        // it is the caller's responsibility that all enabled ROCs
        // share the same test range.
        let enabled_rocs   = self.dut.get_enabled_roc_ids();
        let enabled_pixels = self.dut.get_enabled_pixels(enabled_rocs[0]);
        debug!("\"The Loop\" contains {} calls to 'multipixelfn'", enabled_pixels.len());
        for px in &enabled_pixels {
          let buffer = multipixelfn(&mut self.hal, &rocs_i2c, px.column, px.row, &param);
          data.extend(buffer);
        }
      }
    }
    // Either we only have one ROC enabled or we force serial test
    // execution:
    else {
      let enabled_rocs = self.dut.get_enabled_roc_ids();

      if self.dut.get_all_pixel_enable() && fns.roc.is_some() {
        let rocfn = fns.roc.unwrap();
        debug!("\"The Loop\" contains {} calls to 'rocfn'", enabled_rocs.len());
        for &roc_id in &enabled_rocs {
          // Serial unmasked execution trims each ROC right before
          // its own call:
          if (flags & FLAG_FORCE_SERIAL) != 0 && (flags & FLAG_FORCE_UNMASKED) != 0 {
            self.mask_and_trim_roc(true, roc_id as usize);
          }
          let i2c = self.dut.rocs[roc_id as usize].i2c_address;
          let rocdata = rocfn(&mut self.hal, i2c, &param);
          data.extend(rocdata);
        }
      } else if let Some(pixelfn) = fns.pixel {
        debug!("\"The Loop\" contains {} enabled ROCs.", enabled_rocs.len());
        for &roc_id in &enabled_rocs {
          let i2c = self.dut.rocs[roc_id as usize].i2c_address;
          let enabled_pixels = self.dut.get_enabled_pixels(roc_id);
          debug!("\"The Loop\" for the current ROC contains {} calls to 'pixelfn'",
                 enabled_pixels.len());
          for px in &enabled_pixels {
            let buffer = pixelfn(&mut self.hal, i2c, px.column, px.row, &param);
            data.extend(buffer);
          }
        }
      } else {
        error!("LOOP EXPANSION FAILED -- NO MATCHING FUNCTION TO CALL?!");
        // no exception here: this can only be a bug in the calling
        // test code, not a runtime problem
        return data;
      }
    }

    // check that we ended up with data
    if data.is_empty() {
      error!("NO DATA FROM TEST FUNCTION -- are any TBMs/ROCs/PIXs enabled?!");
      return data;
    }

    // update the internal decoder error count for this data sample
    self.get_decoder_error_count(&data);

    // Test is over, mask the whole device again:
    self.mask_and_trim(false);

    info!("Test took {} ms.", timer.elapsed().as_millis());
    data
  }

  fn get_decoder_error_count(&mut self, data : &[Event]) {
    self.ndecode_errors_lastdaq = data.iter().map(|evt| evt.n_decoder_errors).sum();
    if self.ndecode_errors_lastdaq > 0 {
      error!("A total of {} pixels could not be decoded in this DAQ readout.",
             self.ndecode_errors_lastdaq);
    }
  }

  fn order_bounds(dac_min : u8, dac_max : u8) -> (u8, u8) {
    if dac_min > dac_max {
      warn!("Swapping upper and lower bound.");
      (dac_max, dac_min)
    } else {
      (dac_min, dac_max)
    }
  }

  /// Reset a swept DAC back to its configured value on all enabled ROCs
  fn restore_dac(&mut self, dac_name : &str, register : u8) {
    let enabled = self.dut.get_enabled_roc_ids();
    for &roc_id in &enabled {
      let i2c = self.dut.rocs[roc_id as usize].i2c_address;
      match self.dut.get_dac(roc_id as usize, register) {
        Some(old) => {
          debug!("Reset DAC \"{}\" to original value {}", dac_name, old);
          self.hal.roc_set_dac(i2c, register, old);
        }
        None => {
          debug!("DAC \"{}\" was never configured on ROC {}, nothing to restore.", dac_name, roc_id);
        }
      }
    }
  }

  // ---- test functions (C5 + C7/C8 entry points) ----

  /// Mean pulse height per pixel versus one DAC
  pub fn get_pulseheight_vs_dac(&mut self,
                                dac_name   : &str,
                                dac_step   : u8,
                                dac_min    : u8,
                                dac_max    : u8,
                                flags      : u16,
                                n_triggers : u16) -> Vec<(u8, Vec<Pixel>)> {
    if !self.status() {
      return Vec::new();
    }
    let (dac_min, dac_max) = Self::order_bounds(dac_min, dac_max);
    let (register, dac_max) = match self.verify_register(dac_name, dac_max, RegisterKind::Roc) {
      Some(verified) => verified,
      None           => return Vec::new(),
    };

    let fns = ScanRoutines::dac_scan();
    let param = vec![register as i32, dac_min as i32, dac_max as i32,
                     flags as i32, n_triggers as i32, dac_step as i32];
    let data = self.expand_loop(&fns, param, flags);
    let result = repack_dac_scan_data(data, dac_step, dac_min, dac_max, n_triggers, flags, false);

    self.restore_dac(dac_name, register);
    result
  }

  /// Efficiency per pixel versus one DAC
  pub fn get_efficiency_vs_dac(&mut self,
                               dac_name   : &str,
                               dac_step   : u8,
                               dac_min    : u8,
                               dac_max    : u8,
                               flags      : u16,
                               n_triggers : u16) -> Vec<(u8, Vec<Pixel>)> {
    if !self.status() {
      return Vec::new();
    }
    let (dac_min, dac_max) = Self::order_bounds(dac_min, dac_max);
    let (register, dac_max) = match self.verify_register(dac_name, dac_max, RegisterKind::Roc) {
      Some(verified) => verified,
      None           => return Vec::new(),
    };

    let fns = ScanRoutines::dac_scan();
    let param = vec![register as i32, dac_min as i32, dac_max as i32,
                     flags as i32, n_triggers as i32, dac_step as i32];
    let data = self.expand_loop(&fns, param, flags);
    let result = repack_dac_scan_data(data, dac_step, dac_min, dac_max, n_triggers, flags, true);

    self.restore_dac(dac_name, register);
    result
  }

  /// Threshold in dac1 versus dac2, bucketed by dac2
  pub fn get_threshold_vs_dac(&mut self,
                              dac1_name  : &str,
                              dac1_step  : u8,
                              dac1_min   : u8,
                              dac1_max   : u8,
                              dac2_name  : &str,
                              dac2_step  : u8,
                              dac2_min   : u8,
                              dac2_max   : u8,
                              threshold  : u8,
                              flags      : u16,
                              n_triggers : u16) -> Vec<(u8, Vec<Pixel>)> {
    if !self.status() {
      return Vec::new();
    }
    let (dac1_min, dac1_max) = Self::order_bounds(dac1_min, dac1_max);
    let (dac2_min, dac2_max) = Self::order_bounds(dac2_min, dac2_max);
    let (dac1_register, dac1_max) = match self.verify_register(dac1_name, dac1_max, RegisterKind::Roc) {
      Some(verified) => verified,
      None           => return Vec::new(),
    };
    let (dac2_register, dac2_max) = match self.verify_register(dac2_name, dac2_max, RegisterKind::Roc) {
      Some(verified) => verified,
      None           => return Vec::new(),
    };
    if threshold == 0 || threshold > 100 {
      error!("Threshold level of {}% is not possible!", threshold);
      return Vec::new();
    }

    // The whole-ROC entries stay disabled here, see ScanRoutines:
    let fns = ScanRoutines::threshold_dac_dac_scan();
    let param = vec![dac1_register as i32, dac1_min as i32, dac1_max as i32,
                     dac2_register as i32, dac2_min as i32, dac2_max as i32,
                     flags as i32, n_triggers as i32, dac1_step as i32, dac2_step as i32];
    let data = self.expand_loop(&fns, param, flags);
    let result = repack_threshold_dac_scan_data(data, dac1_step, dac1_min, dac1_max,
                                                dac2_step, dac2_min, dac2_max,
                                                threshold, n_triggers, flags);

    self.restore_dac(dac1_name, dac1_register);
    self.restore_dac(dac2_name, dac2_register);
    result
  }

  /// Threshold versus DAC over the full dac1 range at 50% level
  pub fn get_threshold_vs_dac_full(&mut self,
                                   dac1_name  : &str,
                                   dac2_name  : &str,
                                   dac2_min   : u8,
                                   dac2_max   : u8,
                                   flags      : u16,
                                   n_triggers : u16) -> Vec<(u8, Vec<Pixel>)> {
    let dac1_max = self.get_dac_range(dac1_name);
    self.get_threshold_vs_dac(dac1_name, 1, 0, dac1_max,
                              dac2_name, 1, dac2_min, dac2_max,
                              50, flags, n_triggers)
  }

  /// Mean pulse height per pixel versus two DACs
  pub fn get_pulseheight_vs_dacdac(&mut self,
                                   dac1_name  : &str,
                                   dac1_step  : u8,
                                   dac1_min   : u8,
                                   dac1_max   : u8,
                                   dac2_name  : &str,
                                   dac2_step  : u8,
                                   dac2_min   : u8,
                                   dac2_max   : u8,
                                   flags      : u16,
                                   n_triggers : u16) -> Vec<(u8, (u8, Vec<Pixel>))> {
    self.dac_dac_scan(dac1_name, dac1_step, dac1_min, dac1_max,
                      dac2_name, dac2_step, dac2_min, dac2_max,
                      flags, n_triggers, false)
  }

  /// Efficiency per pixel versus two DACs
  pub fn get_efficiency_vs_dacdac(&mut self,
                                  dac1_name  : &str,
                                  dac1_step  : u8,
                                  dac1_min   : u8,
                                  dac1_max   : u8,
                                  dac2_name  : &str,
                                  dac2_step  : u8,
                                  dac2_min   : u8,
                                  dac2_max   : u8,
                                  flags      : u16,
                                  n_triggers : u16) -> Vec<(u8, (u8, Vec<Pixel>))> {
    self.dac_dac_scan(dac1_name, dac1_step, dac1_min, dac1_max,
                      dac2_name, dac2_step, dac2_min, dac2_max,
                      flags, n_triggers, true)
  }

  fn dac_dac_scan(&mut self,
                  dac1_name  : &str,
                  dac1_step  : u8,
                  dac1_min   : u8,
                  dac1_max   : u8,
                  dac2_name  : &str,
                  dac2_step  : u8,
                  dac2_min   : u8,
                  dac2_max   : u8,
                  flags      : u16,
                  n_triggers : u16,
                  efficiency : bool) -> Vec<(u8, (u8, Vec<Pixel>))> {
    if !self.status() {
      return Vec::new();
    }
    let (dac1_min, dac1_max) = Self::order_bounds(dac1_min, dac1_max);
    let (dac2_min, dac2_max) = Self::order_bounds(dac2_min, dac2_max);
    let (dac1_register, dac1_max) = match self.verify_register(dac1_name, dac1_max, RegisterKind::Roc) {
      Some(verified) => verified,
      None           => return Vec::new(),
    };
    let (dac2_register, dac2_max) = match self.verify_register(dac2_name, dac2_max, RegisterKind::Roc) {
      Some(verified) => verified,
      None           => return Vec::new(),
    };

    let fns = ScanRoutines::dac_dac_scan();
    let param = vec![dac1_register as i32, dac1_min as i32, dac1_max as i32,
                     dac2_register as i32, dac2_min as i32, dac2_max as i32,
                     flags as i32, n_triggers as i32, dac1_step as i32, dac2_step as i32];
    let data = self.expand_loop(&fns, param, flags);
    let result = repack_dac_dac_scan_data(data, dac1_step, dac1_min, dac1_max,
                                          dac2_step, dac2_min, dac2_max,
                                          n_triggers, flags, efficiency);

    self.restore_dac(dac1_name, dac1_register);
    self.restore_dac(dac2_name, dac2_register);
    result
  }

  /// Mean pulse height of every pixel at the current DAC settings
  pub fn get_pulseheight_map(&mut self, flags : u16, n_triggers : u16) -> Vec<Pixel> {
    if !self.status() {
      return Vec::new();
    }
    let fns = ScanRoutines::calibrate();
    let param = vec![flags as i32, n_triggers as i32];
    let data = self.expand_loop(&fns, param, flags);
    repack_map_data(data, n_triggers, flags, false)
  }

  /// Efficiency of every pixel at the current DAC settings
  pub fn get_efficiency_map(&mut self, flags : u16, n_triggers : u16) -> Vec<Pixel> {
    if !self.status() {
      return Vec::new();
    }
    let fns = ScanRoutines::calibrate();
    let param = vec![flags as i32, n_triggers as i32];
    let data = self.expand_loop(&fns, param, flags);
    repack_map_data(data, n_triggers, flags, true)
  }

  /// Per-pixel threshold map from a 1D efficiency sweep
  pub fn get_threshold_map(&mut self,
                           dac_name   : &str,
                           dac_step   : u8,
                           dac_min    : u8,
                           dac_max    : u8,
                           threshold  : u8,
                           flags      : u16,
                           n_triggers : u16) -> Vec<Pixel> {
    if !self.status() {
      return Vec::new();
    }
    let (dac_min, dac_max) = Self::order_bounds(dac_min, dac_max);
    let (register, dac_max) = match self.verify_register(dac_name, dac_max, RegisterKind::Roc) {
      Some(verified) => verified,
      None           => return Vec::new(),
    };
    if threshold == 0 || threshold > 100 {
      error!("Threshold level of {}% is not possible!", threshold);
      return Vec::new();
    }

    let fns = ScanRoutines::dac_scan();
    let param = vec![register as i32, dac_min as i32, dac_max as i32,
                     flags as i32, n_triggers as i32, dac_step as i32];
    let data = self.expand_loop(&fns, param, flags);
    let result = repack_threshold_map_data(data, dac_step, dac_min, dac_max,
                                           threshold, n_triggers, flags);

    self.restore_dac(dac_name, register);
    result
  }

  /// Threshold map over the full DAC range at 50% level
  pub fn get_threshold_map_full(&mut self, dac_name : &str, flags : u16, n_triggers : u16) -> Vec<Pixel> {
    let dac_max = self.get_dac_range(dac_name);
    self.get_threshold_map(dac_name, 1, 0, dac_max, 50, flags, n_triggers)
  }

  // ---- DAQ (C6) ----

  /// Open a DAQ session: trim the DUT, arm the calibrate bits,
  /// attach all columns to the readout and start the deserializer
  pub fn daq_start(&mut self) -> bool {
    if !self.status() {
      return false;
    }
    if self.daq_running {
      debug!("DAQ already running!");
      return false;
    }

    // Clearing previously initialized DAQ sessions:
    self.hal.daq_clear();
    debug!("Starting new DAQ session...");

    // Setup the configured mask and trim state of the DUT:
    self.mask_and_trim(true);
    // Set the calibrate bits in the PUCs (we use the test range for that):
    self.set_calibrate_bits(true);

    // Attaching all columns to the readout:
    for roc_id in 0..self.dut.rocs.len() {
      let i2c = self.dut.rocs[roc_id].i2c_address;
      self.hal.all_columns_set_enable(i2c, true);
    }

    // Pick the deserializer according to the number of enabled TBMs:
    let deser_phase = self.dut.sig_delays.get(&SIG_DESER160PHASE).copied().unwrap_or(0);
    let n_tbms = self.dut.get_n_enabled_tbms() as u8;
    self.hal.daq_start(deser_phase, n_tbms, self.daq_buffersize);

    self.daq_running = true;
    true
  }

  /// DAQ session running and buffer not about to overflow
  pub fn daq_status(&mut self) -> bool {
    self.daq_status_fill().0
  }

  /// Like [`daq_status`](Api::daq_status), additionally reporting the
  /// buffer fill level in percent
  pub fn daq_status_fill(&mut self) -> (bool, u8) {
    if !self.daq_running {
      debug!("DAQ not running!");
      return (false, 0);
    }

    // Only fill the buffer up to 90% in order not to lose data:
    let filled_buffer = self.hal.daq_buffer_status();
    let per_full = (filled_buffer as f32 / self.daq_buffersize as f32 * 100.0) as u8;
    if filled_buffer as f32 > DTB_BUFFER_OVERFLOW_FRACTION * self.daq_buffersize as f32 {
      warn!("DAQ buffer about to overflow!");
      return (false, per_full);
    }

    debug!("Everything alright, buffer size {}/{}", filled_buffer, self.daq_buffersize);
    (true, per_full)
  }

  /// Fire a number of pattern generator cycles. The period is raised
  /// to the pattern generator cycle length if set too small; the
  /// effective period is returned.
  pub fn daq_trigger(&mut self, n_trig : u32, period : u16) -> u16 {
    if !self.daq_status() {
      return 0;
    }
    let period = self.clamp_period(period);
    self.hal.daq_trigger(n_trig, period);
    period
  }

  /// Start the free running trigger loop
  pub fn daq_trigger_loop(&mut self, period : u16) -> u16 {
    if !self.daq_status() {
      return 0;
    }
    let period = self.clamp_period(period);
    self.hal.daq_trigger_loop(period);
    period
  }

  /// Halt the free running trigger loop
  pub fn daq_trigger_loop_halt(&mut self) {
    self.hal.daq_trigger_loop_halt();
  }

  fn clamp_period(&self, period : u16) -> u16 {
    // The pattern generator loop does not work for delay periods
    // smaller than the pattern length itself:
    if (period as u32) < self.dut.pg_sum {
      let period = self.dut.pg_sum as u16;
      warn!("Loop period setting too small for configured Pattern generator. Forcing loop delay to {} clk", period);
      warn!("To suppress this warning supply a larger delay setting");
      return period;
    }
    period
  }

  /// Drain the DTB buffer as one raw word blob
  pub fn daq_get_buffer(&mut self) -> Vec<u16> {
    self.hal.daq_buffer()
  }

  /// Drain the DTB buffer as undecoded per-trigger records
  pub fn daq_get_raw_event_buffer(&mut self) -> Vec<RawEvent> {
    self.hal.daq_all_raw_events()
  }

  /// Drain the DTB buffer as decoded events, updating the decoder
  /// error counter
  pub fn daq_get_event_buffer(&mut self) -> Vec<Event> {
    let data = self.hal.daq_all_events();
    self.get_decoder_error_count(&data);
    data
  }

  /// The next decoded event from the FIFO, None while not running
  pub fn daq_get_event(&mut self) -> Option<Event> {
    if !self.daq_status() {
      return None;
    }
    self.hal.daq_event()
  }

  /// The next raw record from the FIFO, None while not running
  pub fn daq_get_raw_event(&mut self) -> Option<RawEvent> {
    if !self.daq_status() {
      return None;
    }
    self.hal.daq_raw_event()
  }

  /// Decoder errors accumulated during the last loop expansion or
  /// decoded buffer drain
  pub fn daq_get_ndecoder_errors(&self) -> u32 {
    self.ndecode_errors_lastdaq
  }

  /// Close the DAQ session: stop the deserializer, mask the DUT,
  /// clear the calibrate bits and detach all columns
  pub fn daq_stop(&mut self) -> bool {
    if !self.status() {
      return false;
    }
    if !self.daq_running {
      info!("No DAQ running, not executing daqStop command.");
      return false;
    }

    self.daq_running = false;
    self.hal.daq_stop();

    // Mask all pixels in the device again:
    self.mask_and_trim(false);
    // Reset all the calibrate bits and signals:
    self.set_calibrate_bits(false);

    // Detaching all columns from the readout:
    for roc_id in 0..self.dut.rocs.len() {
      let i2c = self.dut.rocs[roc_id].i2c_address;
      self.hal.all_columns_set_enable(i2c, false);
    }

    true
  }
}
