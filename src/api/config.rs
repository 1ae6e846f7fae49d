// Copyright (c) 2019-2022, The rh264e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause

use thiserror::Error;

use arrayvec::ArrayVec;
use log::info;

use crate::api::util::{PicStruct, Rational};
use crate::dpb::MAX_DPB_SIZE;

/// Enumeration of possible invalid configuration errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum InvalidConfig {
  /// The width is invalid.
  #[error("invalid width {0} (expected >= 16, multiple of 16)")]
  InvalidWidth(u16),
  /// The height is invalid.
  #[error("invalid height {0} (expected >= 16, multiple of 16)")]
  InvalidHeight(u16),
  /// Framerate numerator or denominator is invalid.
  #[error("invalid framerate {0}/{1} (expected > 0)")]
  InvalidFrameRate(u64, u64),
  /// GOP reference distance is invalid.
  #[error("invalid gop ref dist {0} (expected >= 1, <= gop size)")]
  InvalidGopRefDist(u16),
  /// Number of reference frames is invalid.
  #[error("invalid num ref frame {actual} (expected >= 1, <= {max})")]
  InvalidNumRefFrame {
    /// The actual value.
    actual: u8,
    /// The maximal supported value.
    max: u8,
  },
  /// B-pyramid requested with a reference distance it cannot express.
  #[error("b-pyramid requires gop ref dist > 2")]
  BPyramidRefDist,
  /// A bitrate-driven rate control method was configured without a target.
  #[error("the rate control requires a target bitrate")]
  TargetBitrateNeeded,
  /// The coded picture buffer cannot hold two average frames.
  #[error("invalid cpb size {0} bytes (expected >= two average frames)")]
  InvalidCpbSize(u32),
  /// A lookahead method was configured with a window that is too short.
  #[error("invalid lookahead depth {0} (expected >= 2, <= 100)")]
  InvalidLookAheadDepth(u16),
  /// Per-frame-type quantizer bounds are inverted or out of range.
  #[error("invalid qp range [{min}, {max}] (expected within [1, 51])")]
  InvalidQpRange {
    /// Lower bound.
    min: u8,
    /// Upper bound.
    max: u8,
  },
  /// Temporal layer scales are not dyadic or exceed the supported count.
  #[error("invalid temporal layer structure")]
  InvalidTemporalLayers,
  /// log2_max_frame_num outside the range the slice header can code.
  #[error("invalid log2 max frame num {0} (expected >= 4, <= 16)")]
  InvalidLog2MaxFrameNum(u8),
}

/// Rate control method selecting the quantizer strategy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RateControlMethod {
  /// Fixed, caller-supplied quantizers per frame type.
  #[default]
  ConstantQp,
  /// Single-pass constant bitrate with HRD compliance.
  Cbr,
  /// Single-pass variable bitrate with HRD compliance.
  Vbr,
  /// Lookahead bitrate control over a window of analyzed frames.
  LookAhead,
  /// Lookahead bitrate control additionally bounded by the HRD model.
  LookAheadHrd,
  /// Lookahead constant-quality control, no bitrate feedback.
  LookAheadCrf,
  /// Lookahead bitrate control over statistics evaluated by an external
  /// analysis pass.
  LookAheadExternal,
}

impl RateControlMethod {
  /// Whether the method consumes a lookahead window of complexity stats.
  #[inline]
  pub fn is_lookahead(self) -> bool {
    matches!(
      self,
      RateControlMethod::LookAhead
        | RateControlMethod::LookAheadHrd
        | RateControlMethod::LookAheadCrf
        | RateControlMethod::LookAheadExternal
    )
  }

  /// Whether the method needs the HRD buffering model.
  #[inline]
  pub fn needs_hrd(self) -> bool {
    matches!(
      self,
      RateControlMethod::Cbr
        | RateControlMethod::Vbr
        | RateControlMethod::LookAheadHrd
    )
  }
}

/// GOP pattern parameters.
#[derive(Clone, Copy, Debug)]
pub struct GopConfig {
  /// Distance between I frames, in display order.
  pub pic_size: u16,
  /// Distance between consecutive reference frames (1 disables B frames).
  pub ref_dist: u16,
  /// Number of GOPs between IDR frames, minus one.
  pub idr_interval: u16,
  /// Strict pattern: never promote the trailing B of a GOP to P.
  pub strict: bool,
  /// Closed GOP: frames do not reference across GOP boundaries.
  pub closed: bool,
  /// Hierarchical B references within a mini-GOP.
  pub b_pyramid: bool,
}

impl Default for GopConfig {
  fn default() -> Self {
    GopConfig {
      pic_size: 30,
      ref_dist: 1,
      idr_interval: 0,
      strict: false,
      closed: false,
      b_pyramid: false,
    }
  }
}

impl GopConfig {
  /// Distance between IDR frames in display order.
  #[inline]
  pub fn idr_dist(&self) -> u32 {
    self.pic_size.max(1) as u32 * (self.idr_interval as u32 + 1)
  }
}

/// Rate control parameters.
#[derive(Clone, Debug)]
pub struct RateControlConfig {
  /// Selected strategy.
  pub method: RateControlMethod,
  /// Fixed quantizers for I, P and B frames (`ConstantQp` only).
  pub constant_qp: [u8; 3],
  /// Target bitrate in bits per second.
  pub target_bitrate: u32,
  /// Peak bitrate in bits per second (VBR family; 0 derives from target).
  pub max_bitrate: u32,
  /// Coded picture buffer size in bytes (0 derives a default).
  pub cpb_size_bytes: u32,
  /// Initial CPB fullness in bytes (0 derives a default).
  pub initial_delay_bytes: u32,
  /// Number of future frames analyzed before a quantizer is final.
  pub lookahead_depth: u16,
  /// Frames at the end of the window still waiting for their statistics.
  pub lookahead_dependency: u16,
  /// Downscale factor of the lookahead analysis (1, 2 or 4).
  pub lookahead_downscale: u16,
  /// Quality target for `LookAheadCrf`, acts like a base quantizer.
  pub crf_quality: u8,
  /// Per-frame-type quantizer lower bounds (I, P, B); 0 means default.
  pub min_qp: [u8; 3],
  /// Per-frame-type quantizer upper bounds (I, P, B); 0 means default.
  pub max_qp: [u8; 3],
  /// Sample count of the per-quantizer rate regression window.
  pub regression_window: u32,
  /// Neighbouring quantizers updated alongside a reported one.
  pub qp_update_range: u16,
  /// Sliding-window size in frames for average-bitrate enforcement
  /// (0 disables the window).
  pub window_size: u16,
  /// Maximum average bitrate over the sliding window, bits per second.
  pub window_max_bitrate: u32,
  /// Whether a non-compliant frame may be re-encoded at another quantizer.
  pub enable_recode: bool,
}

impl Default for RateControlConfig {
  fn default() -> Self {
    RateControlConfig {
      method: RateControlMethod::ConstantQp,
      constant_qp: [26, 28, 30],
      target_bitrate: 0,
      max_bitrate: 0,
      cpb_size_bytes: 0,
      initial_delay_bytes: 0,
      lookahead_depth: 0,
      lookahead_dependency: 0,
      lookahead_downscale: 1,
      crf_quality: 23,
      min_qp: [0; 3],
      max_qp: [0; 3],
      regression_window: 20,
      qp_update_range: 4,
      window_size: 0,
      window_max_bitrate: 0,
      enable_recode: true,
    }
  }
}

/// Static parameters of one encoding session.
///
/// Validated once by [`EncoderConfig::validate`]; immutable afterwards.
/// A parameter change mid-stream is expressed as a reset with a new config.
#[derive(Clone, Debug)]
pub struct EncoderConfig {
  /// Luma width in pixels.
  pub width: u16,
  /// Luma height in pixels.
  pub height: u16,
  /// Frames (or field pairs) per second.
  pub frame_rate: Rational,
  /// Progressive or field coding.
  pub pic_struct: PicStruct,
  /// GOP pattern.
  pub gop: GopConfig,
  /// Rate control.
  pub rc: RateControlConfig,
  /// Size of the decoded picture buffer in frames.
  pub num_ref_frame: u8,
  /// Depth of the asynchronous queue the caller keeps filled.
  pub async_depth: u16,
  /// The caller supplies frames already in encoding order.
  pub encoded_order: bool,
  /// Frame-rate scale of each temporal layer, base layer first.
  /// Empty means a single layer.
  pub temporal_scales: ArrayVec<u16, 8>,
  /// log2 of the frame_num wrap-around modulus.
  pub log2_max_frame_num: u8,
}

impl Default for EncoderConfig {
  fn default() -> Self {
    EncoderConfig {
      width: 1280,
      height: 720,
      frame_rate: Rational::new(30, 1),
      pic_struct: PicStruct::Progressive,
      gop: GopConfig::default(),
      rc: RateControlConfig::default(),
      num_ref_frame: 4,
      async_depth: 1,
      encoded_order: false,
      temporal_scales: ArrayVec::new(),
      log2_max_frame_num: 8,
    }
  }
}

impl EncoderConfig {
  /// Number of 16x16 macroblocks per frame.
  #[inline]
  pub fn num_mbs(&self) -> u32 {
    (self.width as u32 / 16) * (self.height as u32 / 16)
  }

  /// Frames per second as a float.
  #[inline]
  pub fn frame_rate_f64(&self) -> f64 {
    self.frame_rate.as_f64()
  }

  /// Number of temporal layers (at least one).
  #[inline]
  pub fn num_temporal_layers(&self) -> usize {
    self.temporal_scales.len().max(1)
  }

  /// Upper bound on how far encode order trails display order, used for
  /// DPB output delay bookkeeping.
  pub fn num_reorder_frames(&self) -> u32 {
    let ref_dist = self.gop.ref_dist as u32;
    if ref_dist <= 1 {
      0
    } else if self.gop.b_pyramid {
      32 - (ref_dist - 1).leading_zeros()
    } else {
      1
    }
  }

  /// Checks the configuration for coherence.
  ///
  /// # Errors
  ///
  /// Returns the first [`InvalidConfig`] violation found.
  pub fn validate(&self) -> Result<(), InvalidConfig> {
    use InvalidConfig::*;

    if self.width < 16 || self.width % 16 != 0 {
      return Err(InvalidWidth(self.width));
    }
    if self.height < 16 || self.height % 16 != 0 {
      return Err(InvalidHeight(self.height));
    }
    if self.frame_rate.num == 0 || self.frame_rate.den == 0 {
      return Err(InvalidFrameRate(self.frame_rate.num, self.frame_rate.den));
    }
    if self.gop.ref_dist == 0
      || self.gop.ref_dist as u32 > self.gop.pic_size.max(1) as u32
    {
      return Err(InvalidGopRefDist(self.gop.ref_dist));
    }
    if self.gop.b_pyramid && self.gop.ref_dist <= 2 {
      return Err(BPyramidRefDist);
    }
    if self.num_ref_frame == 0 || self.num_ref_frame as usize > MAX_DPB_SIZE
    {
      return Err(InvalidNumRefFrame {
        actual: self.num_ref_frame,
        max: MAX_DPB_SIZE as u8,
      });
    }

    let rc = &self.rc;
    if rc.method != RateControlMethod::ConstantQp
      && rc.method != RateControlMethod::LookAheadCrf
      && rc.target_bitrate == 0
    {
      return Err(TargetBitrateNeeded);
    }
    if rc.method.needs_hrd() && rc.cpb_size_bytes != 0 {
      let bits_per_frame =
        (rc.target_bitrate as f64 / self.frame_rate_f64()) as u32;
      if 8 * rc.cpb_size_bytes < 2 * bits_per_frame {
        return Err(InvalidCpbSize(rc.cpb_size_bytes));
      }
    }
    // the external variant learns its window size from the statistics
    if rc.method.is_lookahead()
      && rc.method != RateControlMethod::LookAheadExternal
      && !(2..=100).contains(&rc.lookahead_depth)
    {
      return Err(InvalidLookAheadDepth(rc.lookahead_depth));
    }
    for i in 0..3 {
      let min = rc.min_qp[i];
      let max = rc.max_qp[i];
      if min > 51 || max > 51 || (max != 0 && min > max) {
        return Err(InvalidQpRange { min, max });
      }
    }

    if !self.temporal_scales.is_empty() {
      // dyadic layers only, base layer scale 1
      if self.temporal_scales[0] != 1 {
        return Err(InvalidTemporalLayers);
      }
      for w in self.temporal_scales.windows(2) {
        if w[1] != w[0] * 2 {
          return Err(InvalidTemporalLayers);
        }
      }
    }

    if !(4..=16).contains(&self.log2_max_frame_num) {
      return Err(InvalidLog2MaxFrameNum(self.log2_max_frame_num));
    }

    Ok(())
  }

  /// Validates and logs the accepted session parameters.
  pub fn log_accepted(&self) -> Result<(), InvalidConfig> {
    self.validate()?;
    info!(
      "{}x{}{} @ {}/{} fps, gop {}x{} refdist {} {:?}",
      self.width,
      self.height,
      if self.pic_struct.is_field() { "i" } else { "p" },
      self.frame_rate.num,
      self.frame_rate.den,
      self.gop.pic_size,
      self.gop.idr_interval + 1,
      self.gop.ref_dist,
      self.rc.method,
    );
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn default_config_is_valid() {
    assert_eq!(EncoderConfig::default().validate(), Ok(()));
  }

  #[test]
  fn rejects_contradictions() {
    let mut cfg = EncoderConfig::default();
    cfg.gop.ref_dist = 60;
    assert_eq!(cfg.validate(), Err(InvalidConfig::InvalidGopRefDist(60)));

    let mut cfg = EncoderConfig::default();
    cfg.rc.method = RateControlMethod::Cbr;
    assert_eq!(cfg.validate(), Err(InvalidConfig::TargetBitrateNeeded));

    let mut cfg = EncoderConfig::default();
    cfg.rc.min_qp = [30, 0, 0];
    cfg.rc.max_qp = [20, 0, 0];
    assert!(matches!(
      cfg.validate(),
      Err(InvalidConfig::InvalidQpRange { .. })
    ));
  }

  #[test]
  fn reorder_depth() {
    let mut cfg = EncoderConfig::default();
    assert_eq!(cfg.num_reorder_frames(), 0);
    cfg.gop.ref_dist = 3;
    assert_eq!(cfg.num_reorder_frames(), 1);
    cfg.gop.ref_dist = 8;
    cfg.gop.b_pyramid = true;
    assert_eq!(cfg.num_reorder_frames(), 3);
  }
}
