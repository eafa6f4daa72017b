//! Specific error types
//!
//! Fatal configuration problems surface as ConfigError, everything
//! operational degrades to bool/empty returns in the core.
//!

use std::error::Error;
use std::fmt;

extern crate serde;
extern crate serde_json;

////////////////////////////////////////

/// Unrecoverable problems in a caller supplied DUT or testboard
/// configuration. Thrown by the validators before anything is
/// written to the hardware.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum ConfigError {
  DacPixelConfigMismatch,
  NoRocConfigs,
  TooManyPixels,
  DuplicatePixels,
  PixelOutsideAddressRange,
  PatternGeneratorTooLong,
  PatternGeneratorEarlyStop,
  UnknownPatternSignal,
  InsufficientPower,
  UnknownDeviceType,
}

impl fmt::Display for ConfigError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = serde_json::to_string(self).unwrap_or(
      String::from("Error: cannot unwrap this ConfigError"));
    write!(f, "<ConfigError : {}>", disp)
  }
}

impl Error for ConfigError {
}

////////////////////////////////////////

/// Problems with a register access on the testboard
#[derive(Debug, Copy, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum RegisterError {
  UnknownRegister,
  ValueOverflow,
}

impl fmt::Display for RegisterError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = serde_json::to_string(self).unwrap_or(
      String::from("Error: cannot unwrap this RegisterError"));
    write!(f, "<RegisterError : {}>", disp)
  }
}

impl Error for RegisterError {
}

////////////////////////////////////////

/// Problems during a DAQ session
#[derive(Debug, Copy, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum DaqError {
  NotRunning,
  AlreadyRunning,
  BufferOverflowImminent,
}

impl fmt::Display for DaqError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = serde_json::to_string(self).unwrap_or(
      String::from("Error: cannot unwrap this DaqError"));
    write!(f, "<DaqError : {}>", disp)
  }
}

impl Error for DaqError {
}
