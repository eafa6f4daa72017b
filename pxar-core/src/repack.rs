//! Reduction of the linear event stream into per-pixel results
//!
//! The HAL delivers one event per trigger, grouped in contiguous
//! runs of nTriggers events per sweep point. The condenser folds
//! each run into a single event holding hit counts (efficiency) or
//! mean/variance (pulse height), the repackers then re-index the
//! condensed stream by swept DAC value and extract threshold maps.
//!
//! Sweep parameter order is the contract here: the outer DAC moves
//! slowest, the pixel position is outermost for full-matrix scans.
//! The DAC counters cycle back to their minimum on each new round,
//! which is how data from several pixels ends up in the same DAC
//! bucket.
//!

use std::collections::HashMap;

use pxar_dataclasses::constants::{FLAG_CHECK_ORDER,
                                  FLAG_NOSORT,
                                  FLAG_RISING_EDGE,
                                  ROC_NUMCOLS,
                                  ROC_NUMROWS};
use pxar_dataclasses::events::{Event, Pixel};

/// Fold runs of nTriggers events into one event per sweep point
///
/// In efficiency mode the folded pixel value is the hit count over
/// the run. In pulse height mode it is the rounded mean, with the
/// sample variance (Welford) in the variance field.
pub fn condense_triggers(data : Vec<Event>, n_triggers : u16, efficiency : bool) -> Vec<Event> {
  let mut packed = Vec::<Event>::new();

  if n_triggers == 0 || data.len() % n_triggers as usize != 0 {
    error!("Data size does not correspond to {} triggers! Aborting data processing!", n_triggers);
    return packed;
  }

  for group in data.chunks(n_triggers as usize) {
    let mut evt   = Event::new();
    let mut index = HashMap::<(u8, u8, u8), usize>::new();
    let mut count = Vec::<u32>::new();
    let mut mean  = Vec::<f64>::new();
    let mut m2    = Vec::<f64>::new();

    for event in group {
      for px in &event.pixels {
        match index.get(&px.id()) {
          // Pixel is known:
          Some(&i) => {
            if efficiency {
              evt.pixels[i].value += 1;
            } else {
              count[i] += 1;
              let x     = px.value as f64;
              let delta = x - mean[i];
              mean[i] += delta / count[i] as f64;
              m2[i]   += delta * (x - mean[i]);
            }
          }
          // Pixel is new:
          None => {
            let mut new_px = *px;
            if efficiency {
              new_px.value = 1;
            }
            index.insert(px.id(), evt.pixels.len());
            count.push(1);
            mean.push(px.value as f64);
            m2.push(0.0);
            evt.pixels.push(new_px);
          }
        }
      }
    }

    if !efficiency {
      for (i, px) in evt.pixels.iter_mut().enumerate() {
        px.value = mean[i].round() as i16;
        px.variance = if count[i] > 1 {
          m2[i] / (count[i] as f64 - 1.0)
        } else {
          0.0
        };
      }
    }
    packed.push(evt);
  }

  packed
}

/// Repack data taken without a DAC sweep into one long pixel map
///
/// With FLAG_CHECK_ORDER every condensed group is checked against
/// the expected raster position (row innermost); pixels out of
/// place get value -1 but are still delivered.
pub fn repack_map_data(data : Vec<Event>, n_triggers : u16, flags : u16, efficiency : bool) -> Vec<Pixel> {
  let mut result = Vec::<Pixel>::new();
  debug!("Simple Map Repack of {} data blocks, returning {}.",
         data.len(), if efficiency { "efficiency" } else { "averaged pulse height" });

  let packed = condense_triggers(data, n_triggers, efficiency);

  // Keep track of the pixel to be expected:
  let mut expected_column : u8 = 0;
  let mut expected_row    : u8 = 0;

  for evt in &packed {
    for px in &evt.pixels {
      let mut px = *px;
      if (flags & FLAG_CHECK_ORDER) != 0
          && (px.column != expected_column || px.row != expected_row) {
        error!("This pixel doesn't belong here: {}. Expected [{},{},x]",
               px, expected_column, expected_row);
        px.value = -1;
      }
      result.push(px);
    }

    if (flags & FLAG_CHECK_ORDER) != 0 {
      expected_row += 1;
      if expected_row >= ROC_NUMROWS {
        expected_row = 0;
        expected_column += 1;
      }
      if expected_column >= ROC_NUMCOLS {
        expected_row = 0;
        expected_column = 0;
      }
    }
  }

  if (flags & FLAG_NOSORT) == 0 {
    result.sort();
  }

  debug!("Correctly repacked Map data for delivery.");
  result
}

/// Repack a 1D DAC sweep into (dac value, pixel list) buckets
pub fn repack_dac_scan_data(data       : Vec<Event>,
                            dac_step   : u8,
                            dac_min    : u8,
                            dac_max    : u8,
                            n_triggers : u16,
                            _flags     : u16,
                            efficiency : bool) -> Vec<(u8, Vec<Pixel>)> {
  let mut result = Vec::<(u8, Vec<Pixel>)>::new();

  if dac_step == 0 {
    error!("DAC step size 0 makes no sense!");
    return result;
  }
  // The register size clamp can push the upper bound below the lower one:
  if dac_max < dac_min {
    error!("Invalid DAC range {} - {}!", dac_min, dac_max);
    return result;
  }

  let packed = condense_triggers(data, n_triggers, efficiency);

  let n_points = (dac_max - dac_min) as usize / dac_step as usize + 1;
  if packed.len() % n_points != 0 {
    error!("Data size not as expected! {} data blocks do not fit to {} DAC values!",
           packed.len(), n_points);
    return result;
  }

  debug!("Packing DAC range {} - {} (step size {}), data has {} entries.",
         dac_min, dac_max, dac_step, packed.len());

  // Prepare the result vector
  let mut dac = dac_min as usize;
  while dac <= dac_max as usize {
    result.push((dac as u8, Vec::new()));
    dac += dac_step as usize;
  }

  // Separate the data into the DAC buckets, potentially several rounds:
  let mut current_dac = dac_min as usize;
  for evt in &packed {
    if current_dac > dac_max as usize {
      current_dac = dac_min as usize;
    }
    let idx = (current_dac - dac_min as usize) / dac_step as usize;
    result[idx].1.extend(evt.pixels.iter().copied());
    current_dac += dac_step as usize;
  }

  debug!("Correctly repacked DacScan data for delivery.");
  result
}

/// Repack a 2D DAC sweep into (dac1, (dac2, pixel list)) entries,
/// the inner DAC counter resetting on every outer step
pub fn repack_dac_dac_scan_data(data       : Vec<Event>,
                                dac1_step  : u8,
                                dac1_min   : u8,
                                dac1_max   : u8,
                                dac2_step  : u8,
                                dac2_min   : u8,
                                dac2_max   : u8,
                                n_triggers : u16,
                                _flags     : u16,
                                efficiency : bool) -> Vec<(u8, (u8, Vec<Pixel>))> {
  let mut result = Vec::<(u8, (u8, Vec<Pixel>))>::new();

  if dac1_step == 0 || dac2_step == 0 {
    error!("DAC step size 0 makes no sense!");
    return result;
  }
  // The register size clamp can push an upper bound below its lower one:
  if dac1_max < dac1_min || dac2_max < dac2_min {
    error!("Invalid DAC range [{} - {}]x[{} - {}]!", dac1_min, dac1_max, dac2_min, dac2_max);
    return result;
  }

  let packed = condense_triggers(data, n_triggers, efficiency);

  let n1 = (dac1_max - dac1_min) as usize / dac1_step as usize + 1;
  let n2 = (dac2_max - dac2_min) as usize / dac2_step as usize + 1;
  if packed.len() % (n1 * n2) != 0 {
    error!("Data size not as expected! {} data blocks do not fit to {} DAC values!",
           packed.len(), n1 * n2);
    return result;
  }

  debug!("Packing DAC range [{} - {}, step size {}]x[{} - {}, step size {}], data has {} entries.",
         dac1_min, dac1_max, dac1_step, dac2_min, dac2_max, dac2_step, packed.len());

  // Prepare the result vector
  let mut dac1 = dac1_min as usize;
  while dac1 <= dac1_max as usize {
    let mut dac2 = dac2_min as usize;
    while dac2 <= dac2_max as usize {
      result.push((dac1 as u8, (dac2 as u8, Vec::new())));
      dac2 += dac2_step as usize;
    }
    dac1 += dac1_step as usize;
  }

  let mut current1 = dac1_min as usize;
  let mut current2 = dac2_min as usize;
  for evt in &packed {
    if current2 > dac2_max as usize {
      current2 = dac2_min as usize;
      current1 += dac1_step as usize;
    }
    if current1 > dac1_max as usize {
      current1 = dac1_min as usize;
    }
    let idx = (current1 - dac1_min as usize) / dac1_step as usize * n2
            + (current2 - dac2_min as usize) / dac2_step as usize;
    result[idx].1.1.extend(evt.pixels.iter().copied());
    current2 += dac2_step as usize;
  }

  debug!("Correctly repacked DacDacScan data for delivery.");
  result
}

/// Extract a per-pixel threshold map from a 1D efficiency sweep
///
/// The threshold is the DAC value whose efficiency comes closest to
/// ceil(nTriggers * level / 100). The scan direction follows
/// FLAG_RISING_EDGE; starting from the far end for falling edges
/// makes sure the correct edge wins even if the efficiency jumps
/// from zero straight to its maximum. Only steps that approach the
/// threshold with rising efficiency are accepted, which filters
/// oscillating pixels.
pub fn repack_threshold_map_data(data            : Vec<Event>,
                                 dac_step        : u8,
                                 dac_min         : u8,
                                 dac_max         : u8,
                                 threshold_level : u8,
                                 n_triggers      : u16,
                                 flags           : u16) -> Vec<Pixel> {
  let mut result = Vec::<Pixel>::new();

  // Using the ceiling function to take the higher threshold when in doubt:
  let threshold = (n_triggers as f64 * threshold_level as f64 / 100.0).ceil() as i32;
  debug!("Scanning for threshold level {}, {} edge", threshold,
         if (flags & FLAG_RISING_EDGE) == 0 { "falling" } else { "rising" });

  // First, pack the data as it would be a regular DAC scan:
  let packed_dac = repack_dac_scan_data(data, dac_step, dac_min, dac_max, n_triggers, flags, true);

  let buckets : Vec<&(u8, Vec<Pixel>)> = if (flags & FLAG_RISING_EDGE) != 0 {
    packed_dac.iter().collect()
  } else {
    packed_dac.iter().rev().collect()
  };

  let mut index    = HashMap::<(u8, u8, u8), usize>::new();
  let mut oldvalue = Vec::<i16>::new();

  for (dac, pixels) in buckets {
    for px in pixels {
      match index.get(&px.id()) {
        // Pixel is known:
        Some(&i) => {
          let delta_old = (oldvalue[i] as i32 - threshold).abs();
          let delta_new = (px.value as i32 - threshold).abs();
          let positive_slope = px.value > oldvalue[i];
          // Only monotone steps towards the threshold count:
          if !positive_slope {
            continue;
          }
          if delta_new >= delta_old {
            continue;
          }
          result[i].value = *dac as i16;
          oldvalue[i] = px.value;
        }
        // Pixel is new, just adding it:
        None => {
          index.insert(px.id(), result.len());
          oldvalue.push(px.value);
          let mut new_px = *px;
          new_px.value = *dac as i16;
          result.push(new_px);
        }
      }
    }
  }

  if (flags & FLAG_NOSORT) == 0 {
    result.sort();
  }

  debug!("Correctly repacked&analyzed ThresholdMap data for delivery.");
  result
}

/// Threshold extraction over a 2D sweep, bucketed by the second DAC
pub fn repack_threshold_dac_scan_data(data            : Vec<Event>,
                                      dac1_step       : u8,
                                      dac1_min        : u8,
                                      dac1_max        : u8,
                                      dac2_step       : u8,
                                      dac2_min        : u8,
                                      dac2_max        : u8,
                                      threshold_level : u8,
                                      n_triggers      : u16,
                                      flags           : u16) -> Vec<(u8, Vec<Pixel>)> {
  let mut result = Vec::<(u8, Vec<Pixel>)>::new();

  let threshold = (n_triggers as f64 * threshold_level as f64 / 100.0).ceil() as i32;
  debug!("Scanning for threshold level {}, {} edge", threshold,
         if (flags & FLAG_RISING_EDGE) == 0 { "falling" } else { "rising" });

  // First, pack the data as it would be a regular DacDac scan:
  let packed_dacdac = repack_dac_dac_scan_data(data, dac1_step, dac1_min, dac1_max,
                                               dac2_step, dac2_min, dac2_max,
                                               n_triggers, flags, true);

  let entries : Vec<&(u8, (u8, Vec<Pixel>))> = if (flags & FLAG_RISING_EDGE) != 0 {
    packed_dacdac.iter().collect()
  } else {
    packed_dacdac.iter().rev().collect()
  };

  // Per dac2 bucket bookkeeping of the last accepted efficiency:
  let mut oldvalue = HashMap::<u8, HashMap<(u8, u8, u8), i16>>::new();

  for (dac1, (dac2, pixels)) in entries {
    for px in pixels {
      // Find the current dac2 bucket in the result vector:
      let bucket = match result.iter().position(|(dac, _)| dac == dac2) {
        Some(b) => b,
        None    => {
          result.push((*dac2, Vec::new()));
          oldvalue.insert(*dac2, HashMap::new());
          result.len() - 1
        }
      };
      let old = oldvalue.get_mut(dac2).unwrap();

      match result[bucket].1.iter().position(|known| known == px) {
        // Pixel is known:
        Some(i) => {
          let last = old[&px.id()];
          let delta_old = (last as i32 - threshold).abs();
          let delta_new = (px.value as i32 - threshold).abs();
          let positive_slope = px.value > last;
          if !positive_slope {
            continue;
          }
          if delta_new >= delta_old {
            continue;
          }
          result[bucket].1[i].value = *dac1 as i16;
          old.insert(px.id(), px.value);
        }
        // Pixel is new, just adding it:
        None => {
          old.insert(px.id(), px.value);
          let mut new_px = *px;
          new_px.value = *dac1 as i16;
          result[bucket].1.push(new_px);
        }
      }
    }
  }

  if (flags & FLAG_NOSORT) == 0 {
    result.sort_by_key(|(dac, _)| *dac);
    for (_, pixels) in result.iter_mut() {
      pixels.sort();
    }
  }

  debug!("Correctly repacked&analyzed ThresholdDacScan data for delivery.");
  result
}
