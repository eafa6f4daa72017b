//! pxar core
//!
//! The software layer between a test driver and the digital test
//! board (DTB) carrying a pixel module. It keeps an in-memory model
//! of the device under test, validates caller supplied register
//! settings against the dictionaries, drives parameterised test
//! loops over pixels and DACs and reduces the resulting event
//! stream into per-pixel results.
//!
//! The hardware itself sits behind the [`hal::TestboardHal`] trait.
//! A software stand-in, [`emulator::DTBEmulator`], ships with the
//! crate and backs the test suite.
//!

pub mod api;
pub mod dut;
pub mod emulator;
pub mod hal;
pub mod repack;

extern crate pretty_env_logger;
#[macro_use] extern crate log;

pub use api::Api;
pub use dut::{PixelConfig, RocConfig, TbmConfig, DUT};
