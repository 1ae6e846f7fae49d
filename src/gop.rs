// Copyright (c) 2019-2022, The rh264e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause

use crate::api::{extend_frame_type, EncoderConfig, FrameType, GopConfig};
use crate::util::FieldPair;

/// Placement of a B frame within its mini-GOP.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BiFrameLocation {
  /// Index of the run of B frames between two references.
  pub mini_gop_count: u32,
  /// Position within the mini-GOP, in encoding order.
  pub encoding_order: u32,
  /// Whether this B frame serves as a reference for other B frames.
  pub ref_frame: bool,
  /// Pyramid level: how deep the frame's interval is below the mini-GOP
  /// midpoint. Level 0 is a non-pyramid B.
  pub level: u32,
}

// Recursive bisection of the open interval of a mini-GOP.
//
// Frames at the midpoint of an interval are encoded before the frames of
// the two half-intervals, so they are available as references earlier;
// this is what realizes the B-pyramid. `before` counts frames of earlier
// sub-intervals already assigned an encoding slot.
fn encoding_order_in_interval(
  display_order: u32, begin: u32, end: u32, level: &mut u32, before: u32,
  is_ref: &mut bool,
) -> u32 {
  debug_assert!(display_order >= begin);
  debug_assert!(display_order < end);

  *is_ref = end - begin > 1;

  let pivot = (begin + end) / 2;
  if display_order == pivot {
    return *level + before;
  }
  *level += 1;
  if display_order < pivot {
    encoding_order_in_interval(display_order, begin, pivot, level, before, is_ref)
  } else {
    encoding_order_in_interval(
      display_order,
      pivot + 1,
      end,
      level,
      before + pivot - begin,
      is_ref,
    )
  }
}

/// Pure GOP-pattern generator.
///
/// Yields the frame type of the current input-order position without any
/// pipeline state; the position advances modulo the IDR distance.
#[derive(Clone, Debug)]
pub struct FrameTypeGenerator {
  frame_order: u32, // in display order
  gop_pic_size: u32,
  gop_ref_dist: u32,
  idr_dist: u32,
  strict: bool,
  closed: bool,
  b_pyramid: bool,
}

impl FrameTypeGenerator {
  pub fn new(gop: &GopConfig) -> Self {
    FrameTypeGenerator {
      frame_order: 0,
      gop_pic_size: gop.pic_size.max(1) as u32,
      gop_ref_dist: gop.ref_dist.max(1) as u32,
      idr_dist: gop.idr_dist(),
      strict: gop.strict,
      closed: gop.closed,
      b_pyramid: gop.b_pyramid,
    }
  }

  /// Frame type pair for the current position.
  pub fn get(&self) -> FieldPair<FrameType> {
    extend_frame_type(frame_type_at_order(
      self.frame_order,
      self.gop_pic_size,
      self.gop_ref_dist,
      self.idr_dist,
      self.strict,
      self.closed,
    ))
  }

  /// Mini-GOP placement of the current position, meaningful for B frames.
  pub fn bi_frame_location(&self) -> BiFrameLocation {
    let mut loc = BiFrameLocation::default();

    if self.b_pyramid {
      let mut is_ref = false;
      let order_in_mini_gop =
        (self.frame_order % self.gop_pic_size % self.gop_ref_dist).max(1) - 1;

      loc.level = 1;
      loc.encoding_order = encoding_order_in_interval(
        order_in_mini_gop,
        0,
        self.gop_ref_dist - 1,
        &mut loc.level,
        0,
        &mut is_ref,
      );
      loc.mini_gop_count =
        self.frame_order % self.gop_pic_size / self.gop_ref_dist;
      loc.ref_frame = is_ref;
    }

    loc
  }

  /// Advances to the next display position.
  pub fn next(&mut self) {
    self.frame_order = (self.frame_order + 1) % self.idr_dist;
  }
}

/// Frame type for an absolute display position, without generator state.
pub fn frame_type_at(config: &EncoderConfig, frame_order: u32) -> FieldPair<FrameType> {
  let gop = &config.gop;
  extend_frame_type(frame_type_at_order(
    frame_order,
    gop.pic_size.max(1) as u32,
    gop.ref_dist.max(1) as u32,
    gop.idr_dist(),
    gop.strict,
    gop.closed,
  ))
}

fn frame_type_at_order(
  frame_order: u32, gop_pic_size: u32, gop_ref_dist: u32, idr_dist: u32,
  strict: bool, closed: bool,
) -> FrameType {
  if frame_order % idr_dist == 0 {
    return FrameType::I | FrameType::REF | FrameType::IDR;
  }
  if frame_order % gop_pic_size == 0 {
    return FrameType::I | FrameType::REF;
  }
  if frame_order % gop_pic_size % gop_ref_dist == 0 {
    return FrameType::P | FrameType::REF;
  }
  if !strict
    && (((frame_order + 1) % gop_pic_size == 0 && closed)
      || (frame_order + 1) % idr_dist == 0)
  {
    // the last B before a closed-GOP boundary or IDR has no backward
    // reference, code it as P
    return FrameType::P | FrameType::REF;
  }
  FrameType::B
}

/// Temporal layer index of a frame, counted from the layer structure's
/// starting point (normally the last IDR in display order).
pub fn temporal_layer_index(config: &EncoderConfig, frame_order: u32) -> u8 {
  let scales = &config.temporal_scales;
  if scales.is_empty() {
    return 0;
  }
  let max_scale = *scales.last().unwrap() as u32;
  for (i, &scale) in scales.iter().enumerate() {
    if frame_order % (max_scale / scale as u32) == 0 {
      return i as u8;
    }
  }
  scales.len() as u8 - 1
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::EncoderConfig;

  fn generator(
    pic_size: u16, ref_dist: u16, idr_interval: u16, strict: bool,
    closed: bool, pyramid: bool,
  ) -> FrameTypeGenerator {
    FrameTypeGenerator::new(&GopConfig {
      pic_size,
      ref_dist,
      idr_interval,
      strict,
      closed,
      b_pyramid: pyramid,
    })
  }

  fn type_letters(mut g: FrameTypeGenerator, n: usize) -> String {
    let mut s = String::new();
    for _ in 0..n {
      s.push_str(&format!("{:?}", g.get().top));
      g.next();
    }
    s
  }

  #[test]
  fn gop_pattern_counts() {
    // exactly one IDR per IDR interval, one I per GOP, a reference every
    // ref_dist positions, B frames in between
    let s = type_letters(generator(8, 4, 3, false, false, false), 16);
    assert_eq!(s, "I*bbbPbbbIbbbPbbb");

    // idr_interval 1: IDR every second GOP, plain I in between; the B
    // right before the IDR is promoted to P
    let s = type_letters(generator(4, 2, 1, false, false, false), 16);
    assert_eq!(s, "I*bPbIbPPI*bPbIbPP");
  }

  #[test]
  fn trailing_b_promoted_unless_strict() {
    // closed GOP: the B at the end of every GOP becomes P
    let s = type_letters(generator(4, 2, 1, false, true, false), 8);
    assert_eq!(s, "I*bPPIbPP");

    // strict GOP keeps the trailing B even before an IDR
    let s = type_letters(generator(4, 2, 0, true, false, false), 8);
    assert_eq!(s, "I*bPbI*bPb");
  }

  #[test]
  fn pyramid_bisection() {
    // ref_dist 4 => 3 B frames; the middle one is encoded first and is a
    // reference for its neighbours
    let mut g = generator(16, 4, 0, false, false, true);
    g.next(); // position 1, first B
    let l1 = g.bi_frame_location();
    g.next();
    let l2 = g.bi_frame_location();
    g.next();
    let l3 = g.bi_frame_location();

    assert_eq!(l2.encoding_order, 1); // midpoint goes first
    assert!(l2.ref_frame);
    assert_eq!((l1.encoding_order, l3.encoding_order), (2, 3));
    assert!(!l1.ref_frame && !l3.ref_frame);
    assert!(l1.level > l2.level);
    assert_eq!(l1.mini_gop_count, 0);

    // next mini-gop
    g.next(); // P at 4
    g.next(); // B at 5
    assert_eq!(g.bi_frame_location().mini_gop_count, 1);
  }

  #[test]
  fn temporal_layers_dyadic() {
    let mut cfg = EncoderConfig::default();
    cfg.temporal_scales.try_extend_from_slice(&[1, 2, 4]).unwrap();
    let idx: Vec<u8> =
      (0..8).map(|fo| temporal_layer_index(&cfg, fo)).collect();
    assert_eq!(idx, vec![0, 2, 1, 2, 0, 2, 1, 2]);
  }
}
