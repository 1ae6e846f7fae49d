// Copyright (c) 2019-2022, The rh264e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause

//! Hypothetical reference decoder buffering model.
//!
//! Tracks the coded picture buffer as a leaky bucket in seconds: the
//! nominal removal time advances by one frame tick per access unit, the
//! final arrival time advances by the time the coded bytes occupy on the
//! wire. The difference bounds the size of the next access unit.

use crate::api::{EncoderConfig, RateControlMethod};

/// 90 kHz clock used by the buffering period SEI fields.
const HRD_CLOCK: f64 = 90_000.0;

#[derive(Clone, Debug, Default)]
pub struct Hrd {
  bitrate: u32, // bits per second
  cbr: bool,
  hrd_in_90k: u32, // cpb size in 90 kHz clock units
  tick: f64,       // duration of one field
  trn_cur: f64,    // nominal removal time of the next access unit
  taf_prv: f64,    // final arrival time of the previous access unit
  required: bool,
}

impl Hrd {
  pub fn new(cfg: &EncoderConfig) -> Self {
    let mut hrd = Hrd::default();
    hrd.reset(cfg);
    hrd
  }

  /// Reconfigures the model. A reset restarts the bucket at the
  /// configured initial delay.
  pub fn reset(&mut self, cfg: &EncoderConfig) {
    self.required = cfg.rc.method.needs_hrd();
    if !self.required {
      return;
    }

    self.cbr = cfg.rc.method == RateControlMethod::Cbr;

    let max_bitrate = if cfg.rc.max_bitrate != 0 && !self.cbr {
      cfg.rc.max_bitrate.max(cfg.rc.target_bitrate)
    } else {
      cfg.rc.target_bitrate
    };
    // H.264 HRD codes bitrate as value * 2^(6 + scale); assume scale 0
    self.bitrate = (max_bitrate >> 6) << 6;

    let cpb_bytes = if cfg.rc.cpb_size_bytes != 0 {
      cfg.rc.cpb_size_bytes
    } else {
      self.bitrate / 8 // one second of stream
    };
    let initial_delay_bytes = if cfg.rc.initial_delay_bytes != 0 {
      cfg.rc.initial_delay_bytes.min(cpb_bytes)
    } else if self.cbr {
      cpb_bytes / 2
    } else {
      cpb_bytes
    };

    self.hrd_in_90k =
      (8.0 * cpb_bytes as f64 / self.bitrate as f64 * HRD_CLOCK) as u32;
    self.tick = 0.5 * cfg.frame_rate.den as f64 / cfg.frame_rate.num as f64;
    self.taf_prv = 0.0;
    self.trn_cur = 8.0 * initial_delay_bytes as f64 / self.bitrate as f64;
    self.trn_cur = self.init_cpb_removal_delay() as f64 / HRD_CLOCK;
  }

  /// Advances the model past one coded access unit of `size` bytes.
  pub fn remove_access_unit(
    &mut self, size: u32, interlace: bool, buffering_period: bool,
  ) {
    if !self.required {
      return;
    }

    let init_delay = self.init_cpb_removal_delay();

    let tai_earliest = if buffering_period {
      self.trn_cur - init_delay as f64 / HRD_CLOCK
    } else {
      self.trn_cur - self.hrd_in_90k as f64 / HRD_CLOCK
    };

    // VBR may pause delivery; arrival never precedes the earliest allowed
    // time. CBR delivers back to back.
    let tai_cur = if !self.cbr {
      self.taf_prv.max(tai_earliest)
    } else {
      self.taf_prv
    };

    self.taf_prv = tai_cur + 8.0 * size as f64 / self.bitrate as f64;
    self.trn_cur += self.tick * if interlace { 1.0 } else { 2.0 };
  }

  /// initial_cpb_removal_delay of a buffering period starting now, in
  /// 90 kHz units.
  pub fn init_cpb_removal_delay(&self) -> u32 {
    if !self.required {
      return 0;
    }

    let delay = (self.trn_cur - self.taf_prv).max(0.0);
    let delay_90k = (HRD_CLOCK * delay + 0.5) as u32;

    if delay_90k == 0 {
      1 // zero is not a legal removal delay
    } else if delay_90k > self.hrd_in_90k && !self.cbr {
      self.hrd_in_90k // cannot exceed the buffer
    } else {
      delay_90k
    }
  }

  /// initial_cpb_removal_delay_offset; the sum with the delay is constant
  /// over a buffering period.
  pub fn init_cpb_removal_delay_offset(&self) -> u32 {
    if !self.required {
      return 0;
    }
    self.hrd_in_90k - self.init_cpb_removal_delay()
  }

  /// Number of bits the model allows for the next access unit without
  /// underflowing the buffer.
  pub fn max_frame_size(&self, buffering_period: bool) -> u32 {
    if !self.required {
      return 0;
    }

    let init_delay = self.init_cpb_removal_delay();
    let tai_earliest = if buffering_period {
      self.trn_cur - init_delay as f64 / HRD_CLOCK
    } else {
      self.trn_cur - self.hrd_in_90k as f64 / HRD_CLOCK
    };
    let tai_cur =
      if !self.cbr { self.taf_prv.max(tai_earliest) } else { self.taf_prv };

    ((self.trn_cur - tai_cur) * self.bitrate as f64) as u32
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::{EncoderConfig, RateControlMethod};

  fn cbr_config() -> EncoderConfig {
    let mut cfg = EncoderConfig::default();
    cfg.rc.method = RateControlMethod::Cbr;
    cfg.rc.target_bitrate = 4_000_000;
    cfg.rc.cpb_size_bytes = 500_000;
    cfg.rc.initial_delay_bytes = 250_000;
    cfg
  }

  #[test]
  fn delay_offset_sum_is_constant() {
    let mut hrd = Hrd::new(&cbr_config());
    let sum = hrd.init_cpb_removal_delay() + hrd.init_cpb_removal_delay_offset();
    for i in 0..30 {
      hrd.remove_access_unit(16_000 + i * 200, false, i == 0);
      assert_eq!(
        hrd.init_cpb_removal_delay() + hrd.init_cpb_removal_delay_offset(),
        sum
      );
    }
  }

  #[test]
  fn max_frame_size_shrinks_after_big_frame() {
    let mut hrd = Hrd::new(&cbr_config());
    let before = hrd.max_frame_size(true);
    // a frame much larger than the per-frame budget drains headroom
    hrd.remove_access_unit(200_000, false, true);
    let after = hrd.max_frame_size(false);
    assert!(after < before);
  }

  #[test]
  fn unused_for_cqp() {
    let cfg = EncoderConfig::default();
    let mut hrd = Hrd::new(&cfg);
    hrd.remove_access_unit(50_000, false, true);
    assert_eq!(hrd.max_frame_size(false), 0);
    assert_eq!(hrd.init_cpb_removal_delay(), 0);
  }
}
