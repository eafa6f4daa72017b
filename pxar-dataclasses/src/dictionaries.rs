//! Name to register-code lookup tables
//!
//! All lookups are case insensitive. The tables are immutable
//! value objects, built once at startup and passed by reference
//! to the validators - no hidden global state.
//!
//! Each register entry carries the maximum permitted value
//! ("size"). Looking up an unknown name returns None, so callers
//! can tell "unknown name" from "known name, value overflow".
//!

use std::collections::HashMap;

/// Register families living in separate address spaces
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterKind {
  Roc,
  Tbm,
  Dtb,
}

/// Register id plus the maximum permitted value
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RegisterEntry {
  pub id   : u8,
  pub size : u8,
}

/// ROC DACs, TBM base registers and DTB delay signals
pub struct RegisterDictionary {
  roc : HashMap<&'static str, RegisterEntry>,
  tbm : HashMap<&'static str, RegisterEntry>,
  dtb : HashMap<&'static str, RegisterEntry>,
}

impl RegisterDictionary {

  pub fn new() -> Self {
    let mut roc = HashMap::new();
    roc.insert("vdig"       , RegisterEntry { id : 0x01, size : 15  });
    roc.insert("vana"       , RegisterEntry { id : 0x02, size : 255 });
    roc.insert("vsf"        , RegisterEntry { id : 0x03, size : 255 });
    roc.insert("vsh"        , RegisterEntry { id : 0x03, size : 255 });
    roc.insert("vcomp"      , RegisterEntry { id : 0x04, size : 15  });
    roc.insert("vwllpr"     , RegisterEntry { id : 0x07, size : 255 });
    roc.insert("vwllsh"     , RegisterEntry { id : 0x09, size : 255 });
    roc.insert("vhlddel"    , RegisterEntry { id : 0x0a, size : 255 });
    roc.insert("vtrim"      , RegisterEntry { id : 0x0b, size : 255 });
    roc.insert("vthrcomp"   , RegisterEntry { id : 0x0c, size : 255 });
    roc.insert("vibias_bus" , RegisterEntry { id : 0x0d, size : 255 });
    roc.insert("vbias_sf"   , RegisterEntry { id : 0x0e, size : 15  });
    roc.insert("voffsetop"  , RegisterEntry { id : 0x0f, size : 255 });
    roc.insert("vibiasop"   , RegisterEntry { id : 0x10, size : 255 });
    roc.insert("voffsetro"  , RegisterEntry { id : 0x11, size : 255 });
    roc.insert("vion"       , RegisterEntry { id : 0x12, size : 255 });
    roc.insert("vibias_ph"  , RegisterEntry { id : 0x13, size : 255 });
    roc.insert("vibias_dac" , RegisterEntry { id : 0x14, size : 255 });
    roc.insert("vibias_roc" , RegisterEntry { id : 0x15, size : 255 });
    roc.insert("vicolor"    , RegisterEntry { id : 0x16, size : 255 });
    roc.insert("vcal"       , RegisterEntry { id : 0x19, size : 255 });
    roc.insert("caldel"     , RegisterEntry { id : 0x1a, size : 255 });
    roc.insert("ctrlreg"    , RegisterEntry { id : 0xfd, size : 255 });
    roc.insert("wbc"        , RegisterEntry { id : 0xfe, size : 255 });
    roc.insert("readback"   , RegisterEntry { id : 0xff, size : 15  });

    let mut tbm = HashMap::new();
    tbm.insert("base0" , RegisterEntry { id : 0x00, size : 255 });
    tbm.insert("base2" , RegisterEntry { id : 0x02, size : 255 });
    tbm.insert("base4" , RegisterEntry { id : 0x04, size : 255 });
    tbm.insert("base8" , RegisterEntry { id : 0x08, size : 255 });
    tbm.insert("basea" , RegisterEntry { id : 0x0a, size : 255 });
    tbm.insert("basec" , RegisterEntry { id : 0x0c, size : 255 });
    tbm.insert("basee" , RegisterEntry { id : 0x0e, size : 255 });

    let mut dtb = HashMap::new();
    dtb.insert("clk"           , RegisterEntry { id : 0, size : 255 });
    dtb.insert("ctr"           , RegisterEntry { id : 1, size : 255 });
    dtb.insert("sda"           , RegisterEntry { id : 2, size : 255 });
    dtb.insert("tin"           , RegisterEntry { id : 3, size : 255 });
    // the deserializer phase register, queried again at daqStart
    dtb.insert("deser160phase" , RegisterEntry { id : 4, size : 7   });
    dtb.insert("level"         , RegisterEntry { id : 5, size : 15  });
    dtb.insert("triggerdelay"  , RegisterEntry { id : 6, size : 255 });
    dtb.insert("tindelay"      , RegisterEntry { id : 7, size : 255 });
    dtb.insert("toutdelay"     , RegisterEntry { id : 8, size : 255 });

    Self { roc, tbm, dtb }
  }

  /// Look up a register by name, case insensitive
  pub fn get_register(&self, name : &str, kind : RegisterKind) -> Option<RegisterEntry> {
    let name = name.to_lowercase();
    let table = match kind {
      RegisterKind::Roc => &self.roc,
      RegisterKind::Tbm => &self.tbm,
      RegisterKind::Dtb => &self.dtb,
    };
    let entry = table.get(name.as_str()).copied();
    if entry.is_none() {
      debug!("Register \"{}\" not found in the {:?} dictionary!", name, kind);
    }
    entry
  }

  /// Maximum permitted value for a register id, 0 for unknown ids
  pub fn get_size(&self, id : u8, kind : RegisterKind) -> u8 {
    let table = match kind {
      RegisterKind::Roc => &self.roc,
      RegisterKind::Tbm => &self.tbm,
      RegisterKind::Dtb => &self.dtb,
    };
    for entry in table.values() {
      if entry.id == id {
        return entry.size;
      }
    }
    0
  }
}

impl Default for RegisterDictionary {
  fn default() -> Self {
    Self::new()
  }
}

/// Device type strings to device codes
pub struct DeviceDictionary {
  devices : HashMap<&'static str, u8>,
}

impl DeviceDictionary {

  pub fn new() -> Self {
    let mut devices = HashMap::new();
    devices.insert("psi46v2"       , 0x01);
    devices.insert("psi46xdb"      , 0x02);
    devices.insert("psi46dig"      , 0x03);
    devices.insert("psi46dig_trig" , 0x04);
    devices.insert("psi46digv2_b"  , 0x05);
    devices.insert("psi46digv2"    , 0x06);
    devices.insert("psi46digv21"   , 0x07);
    devices.insert("tbm08"         , 0x20);
    devices.insert("tbm08a"        , 0x21);
    devices.insert("tbm08b"        , 0x22);
    devices.insert("tbm09"         , 0x23);
    Self { devices }
  }

  pub fn get_dev_code(&self, name : &str) -> Option<u8> {
    self.devices.get(name.to_lowercase().as_str()).copied()
  }
}

impl Default for DeviceDictionary {
  fn default() -> Self {
    Self::new()
  }
}

/// Scope probe signal mnemonics for the four DTB probe outputs
///
/// d1/d2 select from the digital table, a1/a2 from the analog one.
pub struct ProbeDictionary {
  digital : HashMap<&'static str, u8>,
  analog  : HashMap<&'static str, u8>,
}

impl ProbeDictionary {

  pub fn new() -> Self {
    let mut digital = HashMap::new();
    digital.insert("off"    , 0);
    digital.insert("clk"    , 1);
    digital.insert("sda"    , 2);
    digital.insert("pgtok"  , 3);
    digital.insert("pgtrg"  , 4);
    digital.insert("pgcal"  , 5);
    digital.insert("pgresr" , 6);
    digital.insert("pgrest" , 7);
    digital.insert("pgsync" , 8);
    digital.insert("ctr"    , 9);
    digital.insert("tin"    , 10);
    digital.insert("tout"   , 11);

    let mut analog = HashMap::new();
    analog.insert("off"    , 0);
    analog.insert("tin"    , 1);
    analog.insert("sdata1" , 2);
    analog.insert("sdata2" , 3);
    analog.insert("ctr"    , 4);
    analog.insert("clk"    , 5);
    analog.insert("sda"    , 6);
    analog.insert("tout"   , 7);

    Self { digital, analog }
  }

  pub fn get_digital_signal(&self, name : &str) -> Option<u8> {
    self.digital.get(name.to_lowercase().as_str()).copied()
  }

  pub fn get_analog_signal(&self, name : &str) -> Option<u8> {
    self.analog.get(name.to_lowercase().as_str()).copied()
  }
}

impl Default for ProbeDictionary {
  fn default() -> Self {
    Self::new()
  }
}

/// Pattern generator signal mnemonics
///
/// Several names map to the same bit. A "delay" entry issues no
/// signal at all, it only spends clock cycles.
pub struct PatternGeneratorDictionary {
  signals : HashMap<&'static str, u16>,
}

impl PatternGeneratorDictionary {

  pub fn new() -> Self {
    use crate::constants::*;
    let mut signals = HashMap::new();
    signals.insert("pg_tok"   , PG_TOK);
    signals.insert("tok"      , PG_TOK);
    signals.insert("token"    , PG_TOK);
    signals.insert("pg_trg"   , PG_TRG);
    signals.insert("trg"      , PG_TRG);
    signals.insert("trigger"  , PG_TRG);
    signals.insert("pg_cal"   , PG_CAL);
    signals.insert("cal"      , PG_CAL);
    signals.insert("calibrate", PG_CAL);
    signals.insert("pg_resr"  , PG_RESR);
    signals.insert("resr"     , PG_RESR);
    signals.insert("resetroc" , PG_RESR);
    signals.insert("pg_rest"  , PG_REST);
    signals.insert("rest"     , PG_REST);
    signals.insert("resettbm" , PG_REST);
    signals.insert("pg_sync"  , PG_SYNC);
    signals.insert("sync"     , PG_SYNC);
    signals.insert("delay"    , PG_NONE);
    signals.insert("empty"    , PG_NONE);
    Self { signals }
  }

  pub fn get_signal(&self, name : &str) -> Option<u16> {
    self.signals.get(name.to_lowercase().as_str()).copied()
  }
}

impl Default for PatternGeneratorDictionary {
  fn default() -> Self {
    Self::new()
  }
}
