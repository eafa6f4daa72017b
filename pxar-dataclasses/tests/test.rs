#[cfg(test)]
pub mod tests {

  use pxar_dataclasses::constants::*;
  use pxar_dataclasses::dictionaries::{RegisterDictionary,
                                       RegisterKind,
                                       DeviceDictionary,
                                       ProbeDictionary,
                                       PatternGeneratorDictionary};
  use pxar_dataclasses::events::{Event, Pixel};
  use pxar_dataclasses::FromRandom;

  #[test]
  fn register_lookup_is_case_insensitive() {
    let dict = RegisterDictionary::new();
    let lower = dict.get_register("vcal", RegisterKind::Roc).unwrap();
    let upper = dict.get_register("VCAL", RegisterKind::Roc).unwrap();
    let mixed = dict.get_register("VcAl", RegisterKind::Roc).unwrap();
    assert_eq!(lower, upper);
    assert_eq!(lower, mixed);
    assert_eq!(lower.id, 0x19);
    assert_eq!(lower.size, 255);
  }

  #[test]
  fn register_lookup_unknown_name() {
    let dict = RegisterDictionary::new();
    assert!(dict.get_register("notaregister", RegisterKind::Roc).is_none());
    assert!(dict.get_register("vcal", RegisterKind::Tbm).is_none());
    assert!(dict.get_register("base0", RegisterKind::Roc).is_none());
  }

  #[test]
  fn register_families_are_separate() {
    let dict = RegisterDictionary::new();
    let tbm = dict.get_register("base0", RegisterKind::Tbm).unwrap();
    assert_eq!(tbm.id, 0x00);
    let dtb = dict.get_register("deser160phase", RegisterKind::Dtb).unwrap();
    assert_eq!(dtb.id, SIG_DESER160PHASE);
    assert_eq!(dtb.size, 7);
  }

  #[test]
  fn register_size_by_id() {
    let dict = RegisterDictionary::new();
    assert_eq!(dict.get_size(0x19, RegisterKind::Roc), 255);
    assert_eq!(dict.get_size(0x01, RegisterKind::Roc), 15);
    // unknown id reports size 0
    assert_eq!(dict.get_size(0xab, RegisterKind::Roc), 0);
  }

  #[test]
  fn device_codes() {
    let dict = DeviceDictionary::new();
    assert_eq!(dict.get_dev_code("psi46digv21"), Some(0x07));
    assert_eq!(dict.get_dev_code("TBM08B"), Some(0x22));
    assert_eq!(dict.get_dev_code("psi00"), None);
  }

  #[test]
  fn probe_signals() {
    let dict = ProbeDictionary::new();
    assert!(dict.get_digital_signal("pgtrg").is_some());
    assert!(dict.get_analog_signal("sdata1").is_some());
    assert!(dict.get_digital_signal("sdata1").is_none());
  }

  #[test]
  fn pg_signals_share_bits_across_aliases() {
    let dict = PatternGeneratorDictionary::new();
    assert_eq!(dict.get_signal("resetroc"), Some(PG_RESR));
    assert_eq!(dict.get_signal("resr"), Some(PG_RESR));
    assert_eq!(dict.get_signal("PG_RESR"), Some(PG_RESR));
    assert_eq!(dict.get_signal("trg"), Some(PG_TRG));
    assert_eq!(dict.get_signal("delay"), Some(PG_NONE));
    assert_eq!(dict.get_signal("nosuchsignal"), None);
  }

  #[test]
  fn random_pixels_stay_in_address_range() {
    for _n in 0..100 {
      let px = Pixel::from_random();
      assert!(px.column < ROC_NUMCOLS);
      assert!(px.row < ROC_NUMROWS);
    }
  }

  #[test]
  fn random_events_carry_no_decoder_errors() {
    for _n in 0..100 {
      let event = Event::from_random();
      assert_eq!(event.n_decoder_errors, 0);
    }
  }
}
