//! Decoded event formats delivered by the DTB deserializer
//!
//! The structure is the following
//!
//! - RawEvent - the undecoded 16bit word stream of a single trigger,
//!              bracketed by the deserializer
//!
//! - Event    - decoded record of a single trigger: TBM header/trailer
//!              and the pixel hits. Decoding problems are counted, not
//!              raised.
//!
//! - Pixel    - a single pixel hit with its pulse height (or hit count
//!              after condensation). Identity is (roc_id, column, row),
//!              the value/variance fields never take part in comparisons.
//!

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use colored::Colorize;

cfg_if::cfg_if! {
  if #[cfg(feature = "random")]  {
    use crate::FromRandom;
    extern crate rand;
    use rand::Rng;
  }
}

use crate::constants::{ROC_NUMCOLS, ROC_NUMROWS};

/// A single pixel hit
///
/// After the condensation stage, value holds the hit count
/// (efficiency mode) or the rounded mean pulse height and
/// variance the sample variance over the trigger group.
#[derive(Debug, Copy, Clone, serde::Deserialize, serde::Serialize)]
pub struct Pixel {
  pub roc_id   : u8,
  pub column   : u8,
  pub row      : u8,
  pub value    : i16,
  pub variance : f64,
}

impl Pixel {
  pub fn new() -> Self {
    Self {
      roc_id   : 0,
      column   : 0,
      row      : 0,
      value    : 0,
      variance : 0.0,
    }
  }

  /// The identity triple used for comparisons and map keys
  pub fn id(&self) -> (u8, u8, u8) {
    (self.roc_id, self.column, self.row)
  }
}

impl Default for Pixel {
  fn default() -> Self {
    Self::new()
  }
}

// Identity is the pixel address, never the measured value
impl PartialEq for Pixel {
  fn eq(&self, other : &Self) -> bool {
    self.id() == other.id()
  }
}

impl Eq for Pixel {
}

impl Hash for Pixel {
  fn hash<H: Hasher>(&self, state : &mut H) {
    self.id().hash(state);
  }
}

impl PartialOrd for Pixel {
  fn partial_cmp(&self, other : &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Pixel {
  fn cmp(&self, other : &Self) -> Ordering {
    self.id().cmp(&other.id())
  }
}

impl fmt::Display for Pixel {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<Pixel: ROC {} [{},{}] value {} var {:.3}>",
           self.roc_id, self.column, self.row, self.value, self.variance)
  }
}

cfg_if::cfg_if! {
  if #[cfg(feature = "random")]  {
    impl FromRandom for Pixel {
      fn from_random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
          roc_id   : rng.gen_range(0..16),
          column   : rng.gen_range(0..ROC_NUMCOLS),
          row      : rng.gen_range(0..ROC_NUMROWS),
          value    : rng.gen_range(0..256),
          variance : 0.0,
        }
      }
    }
  }
}

/// A decoded single trigger record
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Event {
  pub header           : u16,
  pub trailer          : u16,
  pub pixels           : Vec<Pixel>,
  pub n_decoder_errors : u32,
}

impl Event {
  pub fn new() -> Self {
    Self {
      header           : 0,
      trailer          : 0,
      pixels           : Vec::<Pixel>::new(),
      n_decoder_errors : 0,
    }
  }
}

impl Default for Event {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for Event {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let mut repr = format!("<Event: header {:04x} trailer {:04x} n_pixels {}",
                           self.header, self.trailer, self.pixels.len());
    if self.n_decoder_errors > 0 {
      repr += &format!("\n  !! {} DECODER ERRORS!", self.n_decoder_errors).red().bold().to_string();
    }
    repr += ">";
    write!(f, "{}", repr)
  }
}

cfg_if::cfg_if! {
  if #[cfg(feature = "random")]  {
    impl FromRandom for Event {
      fn from_random() -> Self {
        let mut rng  = rand::thread_rng();
        let n_pixels = rng.gen_range(0..10);
        let mut pixels = Vec::<Pixel>::new();
        for _ in 0..n_pixels {
          pixels.push(Pixel::from_random());
        }
        Self {
          header           : rng.gen(),
          trailer          : rng.gen(),
          pixels,
          n_decoder_errors : 0,
        }
      }
    }
  }
}

/// The undecoded word stream of a single trigger
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RawEvent {
  pub data : Vec<u16>,
}

impl RawEvent {
  pub fn new() -> Self {
    Self {
      data : Vec::<u16>::new(),
    }
  }
}

impl Default for RawEvent {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for RawEvent {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<RawEvent: {} words>", self.data.len())
  }
}
