//! Software stand-in for the USB attached test board
//!
//! Replays the firmware test loops in the exact order the DTB
//! produces them: pixels iterate column major (row innermost over
//! the readout token, wrapping to the next column), swept DACs run
//! inside the pixel loop, and every sweep point yields one event
//! per trigger - empty when the pixel did not fire.
//!
//! The pixel response is a simple threshold model which tests can
//! tune: a pixel registers a hit once the swept DAC (or the current
//! Vcal setting for plain calibrate pulses) reaches `threshold`, and
//! answers with pulse height `ph_offset + ph_slope * dac`.
//!
//! Every register-level call is appended to `call_log`, so tests can
//! assert which firmware routines a loop expansion actually used.
//!

use std::collections::{HashMap, HashSet, VecDeque};

use pxar_dataclasses::events::{Event, Pixel, RawEvent};
use pxar_dataclasses::constants::{ROC_NUMCOLS, ROC_NUMROWS};

use crate::dut::PixelConfig;
use crate::hal::TestboardHal;

/// Vcal register id, used for the calibrate pulse response
const REG_VCAL : u8 = 0x19;

struct EmulatedRoc {
  dacs            : HashMap<u8, u8>,
  /// trim table last uploaded to the NIOS soft core
  trim_table      : Vec<PixelConfig>,
  /// trim/mask state last loaded into the pixel matrix
  trim_loaded     : Vec<PixelConfig>,
  masked          : bool,
  calibrate       : HashSet<(u8, u8)>,
  columns_enabled : bool,
}

impl EmulatedRoc {
  fn new(dacs : HashMap<u8, u8>) -> Self {
    Self {
      dacs,
      trim_table      : Vec::new(),
      trim_loaded     : Vec::new(),
      masked          : true,
      calibrate       : HashSet::new(),
      columns_enabled : false,
    }
  }

  /// Masked according to the NIOS trim table (empty table means
  /// nothing is masked, the firmware then trims with defaults)
  fn nios_masked(&self, column : u8, row : u8) -> bool {
    self.trim_table.iter()
      .find(|px| px.column == column && px.row == row)
      .map(|px| px.mask)
      .unwrap_or(false)
  }

  /// Ready to answer triggers in a DAQ session
  fn armed(&self, column : u8, row : u8) -> bool {
    if self.masked || !self.columns_enabled {
      return false;
    }
    if !self.calibrate.contains(&(column, row)) {
      return false;
    }
    self.trim_loaded.iter()
      .any(|px| px.column == column && px.row == row && !px.mask)
  }
}

/// Emulated DTB, the only HAL implementation shipped with the crate
pub struct DTBEmulator {
  powered     : bool,
  hv          : bool,
  initialized : bool,
  hub_id      : u8,
  delays      : HashMap<u8, u8>,
  pg_setup    : Vec<(u16, u8)>,
  pg_sum      : u32,
  power       : (f64, f64, f64, f64),
  probes      : HashMap<&'static str, u8>,
  rocs        : HashMap<u8, EmulatedRoc>,
  i2c_setup   : Vec<u8>,
  n_tbm_inits : u32,
  tbm_regs    : HashMap<u8, u8>,

  daq_running          : bool,
  trigger_loop_running : bool,
  fifo                 : VecDeque<Event>,

  /// events synthesized per daqBufferStatus poll while the trigger
  /// loop is running
  pub trigger_loop_yield       : u32,
  /// decoder errors injected into every synthesized event
  pub decoder_errors_per_event : u32,
  /// swept DAC value at which a pixel starts to fire
  pub threshold                : u8,
  pub ph_offset                : i16,
  pub ph_slope                 : i16,
  /// register level call trace for tests
  pub call_log                 : Vec<String>,
}

impl DTBEmulator {

  pub fn new() -> Self {
    Self {
      powered     : false,
      hv          : false,
      initialized : false,
      hub_id      : 0,
      delays      : HashMap::new(),
      pg_setup    : Vec::new(),
      pg_sum      : 0,
      power       : (0.0, 0.0, 0.0, 0.0),
      probes      : HashMap::new(),
      rocs        : HashMap::new(),
      i2c_setup   : Vec::new(),
      n_tbm_inits : 0,
      tbm_regs    : HashMap::new(),
      daq_running          : false,
      trigger_loop_running : false,
      fifo                 : VecDeque::new(),
      trigger_loop_yield       : 16,
      decoder_errors_per_event : 0,
      threshold                : 0,
      ph_offset                : 20,
      ph_slope                 : 1,
      call_log                 : Vec::new(),
    }
  }

  fn pulse_height(&self, dac : u8) -> i16 {
    let ph = self.ph_offset as i32 + self.ph_slope as i32 * dac as i32;
    ph.clamp(i16::MIN as i32, i16::MAX as i32) as i16
  }

  /// Response of the pixel matrix to a calibrate pulse at the
  /// current Vcal setting of the given ROC
  fn cal_response(&self, i2c : u8) -> (bool, i16) {
    let vcal = self.rocs.get(&i2c)
      .and_then(|roc| roc.dacs.get(&REG_VCAL))
      .copied()
      .unwrap_or(0);
    (vcal >= self.threshold, self.pulse_height(vcal))
  }

  fn scan_event(&self, hits : &[(u8, i16)], column : u8, row : u8) -> Event {
    let mut event = Event::new();
    for &(roc_id, value) in hits {
      let mut px = Pixel::new();
      px.roc_id = roc_id;
      px.column = column;
      px.row    = row;
      px.value  = value;
      event.pixels.push(px);
    }
    event.n_decoder_errors = self.decoder_errors_per_event;
    event
  }

  /// nTriggers events for one pixel at one sweep point. The DAC
  /// response is identical on all addressed ROCs, but masking via
  /// the NIOS trim table is per ROC.
  fn sweep_point(&self,
                 i2cs      : &[u8],
                 column    : u8,
                 row       : u8,
                 dac       : u8,
                 n_trig    : i32,
                 nios_mask : bool) -> Vec<Event> {
    let hit = dac >= self.threshold;
    let ph  = self.pulse_height(dac);
    let mut hits = Vec::new();
    if hit {
      for &i2c in i2cs {
        let masked = nios_mask
          && self.rocs.get(&i2c).map(|r| r.nios_masked(column, row)).unwrap_or(false);
        if !masked {
          hits.push((i2c, ph));
        }
      }
    }
    let mut events = Vec::new();
    for _ in 0..n_trig {
      events.push(self.scan_event(&hits, column, row));
    }
    events
  }

  /// nTriggers calibrate events for one pixel
  fn cal_point(&self,
               i2cs      : &[u8],
               column    : u8,
               row       : u8,
               n_trig    : i32,
               nios_mask : bool) -> Vec<Event> {
    let mut hits = Vec::new();
    for &i2c in i2cs {
      let (hit, ph) = self.cal_response(i2c);
      let masked = nios_mask
        && self.rocs.get(&i2c).map(|r| r.nios_masked(column, row)).unwrap_or(false);
      if hit && !masked {
        hits.push((i2c, ph));
      }
    }
    let mut events = Vec::new();
    for _ in 0..n_trig {
      events.push(self.scan_event(&hits, column, row));
    }
    events
  }

  fn dac_scan(&self, i2cs : &[u8], column : u8, row : u8, param : &[i32], nios_mask : bool) -> Vec<Event> {
    let dac_min = p(param, 1) as u8;
    let dac_max = p(param, 2) as u8;
    let n_trig  = p(param, 4);
    let step    = (p(param, 5).max(1)) as usize;
    let mut events = Vec::new();
    for dac in (dac_min..=dac_max).step_by(step) {
      events.extend(self.sweep_point(i2cs, column, row, dac, n_trig, nios_mask));
    }
    events
  }

  fn dac_dac_scan(&self, i2cs : &[u8], column : u8, row : u8, param : &[i32], nios_mask : bool) -> Vec<Event> {
    let dac1_min = p(param, 1) as u8;
    let dac1_max = p(param, 2) as u8;
    let dac2_min = p(param, 4) as u8;
    let dac2_max = p(param, 5) as u8;
    let n_trig   = p(param, 7);
    let step1    = (p(param, 8).max(1)) as usize;
    let step2    = (p(param, 9).max(1)) as usize;
    let mut events = Vec::new();
    for dac1 in (dac1_min..=dac1_max).step_by(step1) {
      for _dac2 in (dac2_min..=dac2_max).step_by(step2) {
        // response is driven by the first DAC only
        events.extend(self.sweep_point(i2cs, column, row, dac1, n_trig, nios_mask));
      }
    }
    events
  }

  /// Full matrix raster: row innermost, wrapping to the next column
  fn all_pixels<F>(&self, mut point : F) -> Vec<Event>
    where F : FnMut(u8, u8) -> Vec<Event> {
    let mut events = Vec::new();
    for column in 0..ROC_NUMCOLS {
      for row in 0..ROC_NUMROWS {
        events.extend(point(column, row));
      }
    }
    events
  }

  fn daq_event_now(&self) -> Event {
    let mut event = Event::new();
    for (&i2c, roc) in &self.rocs {
      let (hit, ph) = self.cal_response(i2c);
      if !hit {
        continue;
      }
      let mut armed : Vec<(u8, u8)> = roc.calibrate.iter()
        .filter(|&&(c, r)| roc.armed(c, r))
        .copied()
        .collect();
      armed.sort();
      for (column, row) in armed {
        let mut px = Pixel::new();
        px.roc_id = i2c;
        px.column = column;
        px.row    = row;
        px.value  = ph;
        event.pixels.push(px);
      }
    }
    event.pixels.sort();
    event.n_decoder_errors = self.decoder_errors_per_event;
    event
  }

  fn push_triggers(&mut self, n : u32) {
    for _ in 0..n {
      let event = self.daq_event_now();
      self.fifo.push_back(event);
    }
  }

  fn fifo_words(&self) -> u32 {
    self.fifo.iter().map(|e| 2 + 2 * e.pixels.len() as u32).sum()
  }

  fn encode(event : &Event) -> Vec<u16> {
    let mut words = vec![0x8000u16];
    for px in &event.pixels {
      words.push(((px.column as u16) << 8) | px.row as u16);
      words.push(px.value as u16);
    }
    words.push(0xc000);
    words
  }
}

impl Default for DTBEmulator {
  fn default() -> Self {
    Self::new()
  }
}

fn p(param : &[i32], idx : usize) -> i32 {
  param.get(idx).copied().unwrap_or(0)
}

impl TestboardHal for DTBEmulator {

  fn compatible(&self) -> bool {
    true
  }

  fn status(&self) -> bool {
    self.initialized
  }

  fn init_testboard(&mut self,
                    sig_delays : &HashMap<u8, u8>,
                    pg_setup   : &[(u16, u8)],
                    pg_sum     : u32,
                    va : f64, vd : f64, ia : f64, id : f64) {
    self.call_log.push(String::from("InitTestboard"));
    self.delays   = sig_delays.clone();
    self.pg_setup = pg_setup.to_vec();
    self.pg_sum   = pg_sum;
    self.power    = (va, vd, ia, id);
    self.initialized = true;
  }

  fn set_testboard_delays(&mut self, sig_delays : &HashMap<u8, u8>) {
    self.call_log.push(String::from("SetTestboardDelays"));
    self.delays = sig_delays.clone();
  }

  fn setup_pattern_generator(&mut self, pg_setup : &[(u16, u8)], pg_sum : u32) {
    self.call_log.push(String::from("SetupPatternGenerator"));
    self.pg_setup = pg_setup.to_vec();
    self.pg_sum   = pg_sum;
  }

  fn set_testboard_power(&mut self, va : f64, vd : f64, ia : f64, id : f64) {
    self.call_log.push(String::from("SetTestboardPower"));
    self.power = (va, vd, ia, id);
  }

  fn pon(&mut self) {
    self.call_log.push(String::from("Pon"));
    self.powered = true;
  }

  fn poff(&mut self) {
    self.call_log.push(String::from("Poff"));
    self.powered = false;
  }

  fn hv_on(&mut self) {
    self.call_log.push(String::from("HVon"));
    self.hv = true;
  }

  fn hv_off(&mut self) {
    self.call_log.push(String::from("HVoff"));
    self.hv = false;
  }

  fn get_tb_va(&mut self) -> f64 { self.power.0 }
  fn get_tb_vd(&mut self) -> f64 { self.power.1 }
  fn get_tb_ia(&mut self) -> f64 { self.power.2 }
  fn get_tb_id(&mut self) -> f64 { self.power.3 }

  fn signal_probe_d1(&mut self, signal : u8) { self.probes.insert("d1", signal); }
  fn signal_probe_d2(&mut self, signal : u8) { self.probes.insert("d2", signal); }
  fn signal_probe_a1(&mut self, signal : u8) { self.probes.insert("a1", signal); }
  fn signal_probe_a2(&mut self, signal : u8) { self.probes.insert("a2", signal); }

  fn set_clock_stretch(&mut self, src : u8, width : u16, delay : u16) {
    self.call_log.push(format!("SetClockStretch {} {} {}", src, width, delay));
  }

  fn set_hub_id(&mut self, hub_id : u8) {
    self.call_log.push(format!("SetHubId {}", hub_id));
    self.hub_id = hub_id;
  }

  fn init_tbm_core(&mut self, _tbm_type : u8, dacs : &HashMap<u8, u8>) {
    self.call_log.push(String::from("InitTBMCore"));
    self.n_tbm_inits += 1;
    for (&reg, &value) in dacs {
      self.tbm_regs.insert(reg, value);
    }
  }

  fn init_roc(&mut self, i2c : u8, _roc_type : u8, dacs : &HashMap<u8, u8>) {
    self.call_log.push(format!("InitROC {}", i2c));
    self.rocs.insert(i2c, EmulatedRoc::new(dacs.clone()));
  }

  fn tbm_set_reg(&mut self, register : u8, value : u8) {
    self.call_log.push(format!("TbmSetReg {:02x} {}", register, value));
    self.tbm_regs.insert(register, value);
  }

  fn roc_set_dac(&mut self, i2c : u8, register : u8, value : u8) {
    self.call_log.push(format!("RocSetDAC {} {:02x} {}", i2c, register, value));
    if let Some(roc) = self.rocs.get_mut(&i2c) {
      roc.dacs.insert(register, value);
    }
  }

  fn roc_set_mask(&mut self, i2c : u8, mask : bool, pixels : &[PixelConfig]) {
    self.call_log.push(format!("RocSetMask {} {}", i2c, mask));
    if let Some(roc) = self.rocs.get_mut(&i2c) {
      if mask {
        roc.masked = true;
      } else {
        roc.masked      = false;
        roc.trim_loaded = pixels.to_vec();
      }
    }
  }

  fn pixel_set_calibrate(&mut self, i2c : u8, column : u8, row : u8, _flags : u16) {
    if let Some(roc) = self.rocs.get_mut(&i2c) {
      roc.calibrate.insert((column, row));
    }
  }

  fn roc_clear_calibrate(&mut self, i2c : u8) {
    self.call_log.push(format!("RocClearCalibrate {}", i2c));
    if let Some(roc) = self.rocs.get_mut(&i2c) {
      roc.calibrate.clear();
    }
  }

  fn all_columns_set_enable(&mut self, i2c : u8, enable : bool) {
    self.call_log.push(format!("AllColumnsSetEnable {} {}", i2c, enable));
    if let Some(roc) = self.rocs.get_mut(&i2c) {
      roc.columns_enabled = enable;
    }
  }

  fn setup_i2c_values(&mut self, i2cs : &[u8]) {
    self.call_log.push(String::from("SetupI2CValues"));
    self.i2c_setup = i2cs.to_vec();
  }

  fn setup_trim_values(&mut self, i2c : u8, pixels : &[PixelConfig]) {
    self.call_log.push(format!("SetupTrimValues {}", i2c));
    if let Some(roc) = self.rocs.get_mut(&i2c) {
      roc.trim_table = pixels.to_vec();
    }
  }

  fn daq_start(&mut self, _deser160phase : u8, _n_tbms : u8, _buffersize : u32) {
    self.call_log.push(String::from("DaqStart"));
    self.daq_running = true;
  }

  fn daq_stop(&mut self) {
    self.call_log.push(String::from("DaqStop"));
    self.daq_running          = false;
    self.trigger_loop_running = false;
  }

  fn daq_clear(&mut self) {
    self.call_log.push(String::from("DaqClear"));
    self.fifo.clear();
    self.trigger_loop_running = false;
  }

  fn daq_buffer_status(&mut self) -> u32 {
    if self.trigger_loop_running {
      // the free running pattern generator keeps filling the buffer
      self.push_triggers(self.trigger_loop_yield);
    }
    self.fifo_words()
  }

  fn daq_trigger(&mut self, n_trig : u32, period : u16) {
    self.call_log.push(format!("DaqTrigger {} {}", n_trig, period));
    self.push_triggers(n_trig);
  }

  fn daq_trigger_loop(&mut self, period : u16) {
    self.call_log.push(format!("DaqTriggerLoop {}", period));
    self.trigger_loop_running = true;
  }

  fn daq_trigger_loop_halt(&mut self) {
    self.call_log.push(String::from("DaqTriggerLoopHalt"));
    self.trigger_loop_running = false;
  }

  fn daq_buffer(&mut self) -> Vec<u16> {
    let mut words = Vec::new();
    while let Some(event) = self.fifo.pop_front() {
      words.extend(Self::encode(&event));
    }
    words
  }

  fn daq_all_raw_events(&mut self) -> Vec<RawEvent> {
    let mut raw = Vec::new();
    while let Some(event) = self.fifo.pop_front() {
      raw.push(RawEvent { data : Self::encode(&event) });
    }
    raw
  }

  fn daq_all_events(&mut self) -> Vec<Event> {
    self.fifo.drain(..).collect()
  }

  fn daq_event(&mut self) -> Option<Event> {
    self.fifo.pop_front()
  }

  fn daq_raw_event(&mut self) -> Option<RawEvent> {
    self.fifo.pop_front().map(|event| RawEvent { data : Self::encode(&event) })
  }

  fn single_roc_one_pixel_calibrate(&mut self, i2c : u8, column : u8, row : u8, param : &[i32]) -> Vec<Event> {
    self.call_log.push(format!("SingleRocOnePixelCalibrate {}", i2c));
    self.cal_point(&[i2c], column, row, p(param, 1), false)
  }

  fn multi_roc_one_pixel_calibrate(&mut self, i2cs : &[u8], column : u8, row : u8, param : &[i32]) -> Vec<Event> {
    self.call_log.push(String::from("MultiRocOnePixelCalibrate"));
    self.cal_point(i2cs, column, row, p(param, 1), false)
  }

  fn single_roc_all_pixels_calibrate(&mut self, i2c : u8, param : &[i32]) -> Vec<Event> {
    self.call_log.push(format!("SingleRocAllPixelsCalibrate {}", i2c));
    let n_trig = p(param, 1);
    self.all_pixels(|column, row| self.cal_point(&[i2c], column, row, n_trig, true))
  }

  fn multi_roc_all_pixels_calibrate(&mut self, i2cs : &[u8], param : &[i32]) -> Vec<Event> {
    self.call_log.push(String::from("MultiRocAllPixelsCalibrate"));
    let n_trig = p(param, 1);
    self.all_pixels(|column, row| self.cal_point(i2cs, column, row, n_trig, true))
  }

  fn single_roc_one_pixel_dac_scan(&mut self, i2c : u8, column : u8, row : u8, param : &[i32]) -> Vec<Event> {
    self.call_log.push(format!("SingleRocOnePixelDacScan {}", i2c));
    self.dac_scan(&[i2c], column, row, param, false)
  }

  fn multi_roc_one_pixel_dac_scan(&mut self, i2cs : &[u8], column : u8, row : u8, param : &[i32]) -> Vec<Event> {
    self.call_log.push(String::from("MultiRocOnePixelDacScan"));
    self.dac_scan(i2cs, column, row, param, false)
  }

  fn single_roc_all_pixels_dac_scan(&mut self, i2c : u8, param : &[i32]) -> Vec<Event> {
    self.call_log.push(format!("SingleRocAllPixelsDacScan {}", i2c));
    self.all_pixels(|column, row| self.dac_scan(&[i2c], column, row, param, true))
  }

  fn multi_roc_all_pixels_dac_scan(&mut self, i2cs : &[u8], param : &[i32]) -> Vec<Event> {
    self.call_log.push(String::from("MultiRocAllPixelsDacScan"));
    self.all_pixels(|column, row| self.dac_scan(i2cs, column, row, param, true))
  }

  fn single_roc_one_pixel_dac_dac_scan(&mut self, i2c : u8, column : u8, row : u8, param : &[i32]) -> Vec<Event> {
    self.call_log.push(format!("SingleRocOnePixelDacDacScan {}", i2c));
    self.dac_dac_scan(&[i2c], column, row, param, false)
  }

  fn multi_roc_one_pixel_dac_dac_scan(&mut self, i2cs : &[u8], column : u8, row : u8, param : &[i32]) -> Vec<Event> {
    self.call_log.push(String::from("MultiRocOnePixelDacDacScan"));
    self.dac_dac_scan(i2cs, column, row, param, false)
  }

  fn single_roc_all_pixels_dac_dac_scan(&mut self, i2c : u8, param : &[i32]) -> Vec<Event> {
    self.call_log.push(format!("SingleRocAllPixelsDacDacScan {}", i2c));
    self.all_pixels(|column, row| self.dac_dac_scan(&[i2c], column, row, param, true))
  }

  fn multi_roc_all_pixels_dac_dac_scan(&mut self, i2cs : &[u8], param : &[i32]) -> Vec<Event> {
    self.call_log.push(String::from("MultiRocAllPixelsDacDacScan"));
    self.all_pixels(|column, row| self.dac_dac_scan(i2cs, column, row, param, true))
  }
}
