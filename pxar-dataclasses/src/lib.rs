//! pxar dataclasses
//!
//! Data model shared between the pxar core and its callers:
//! decoded events and pixels, register dictionaries, hardware
//! constants and the error types of the configuration layer.
//!
//! * features: "random" - provides "::from_random" for the event
//!   structs allowing to populate them with random data for tests.
//!

pub mod constants;
pub mod dictionaries;
pub mod errors;
pub mod events;

#[macro_use] extern crate log;

cfg_if::cfg_if! {
  if #[cfg(feature = "random")]  {
    /// Populate a struct with random values, mainly
    /// useful for testing purposes
    pub trait FromRandom {
      fn from_random() -> Self;
    }
  }
}
