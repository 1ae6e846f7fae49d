// Copyright (c) 2019-2022, The rh264e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause

use std::cmp::Ordering;
use std::ops::{Deref, DerefMut};

use arrayvec::ArrayVec;

use crate::util::FieldPair;

/// Capacity of a decoded picture buffer snapshot.
pub const MAX_DPB_SIZE: usize = 16;
/// Supported temporal layers.
pub const MAX_TEMPORAL_LAYERS: usize = 8;
/// Reference picture list capacity. One slot above the coded maximum of 32
/// so the list-modification algorithm has room for its insertion scratch.
pub const MAX_REF_LIST: usize = 33;

/// Sentinel for "no slot assigned".
pub const NO_INDEX: u32 = u32::MAX;
pub const NO_INDEX_U8: u8 = u8::MAX;

/// A reference picture list. Each entry packs a DPB index in the low seven
/// bits and the field parity in the top bit.
pub type RefList = ArrayVec<u8, MAX_REF_LIST>;

#[inline]
pub fn entry_index(r: u8) -> usize {
  (r & 127) as usize
}

#[inline]
pub fn entry_parity(r: u8) -> usize {
  (r >> 7) as usize
}

#[inline]
pub fn make_entry(index: usize, parity: usize) -> u8 {
  debug_assert!(index < MAX_DPB_SIZE);
  index as u8 | ((parity as u8) << 7)
}

/// One entry of a DPB snapshot.
///
/// Stores bookkeeping only; `recon_idx` is a weak reference into the shared
/// reconstructed-picture pool, which owns the picture's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DpbFrame {
  pub poc: FieldPair<i32>,
  pub frame_order: u32,
  pub frame_num: u16,
  pub frame_num_wrap: i32,
  pub pic_num: FieldPair<i32>,
  pub long_term_pic_num: FieldPair<u8>,
  /// Long-term frame index plus one; 0 means short-term.
  pub long_term_idx_plus1: u8,
  pub long_term: bool,
  /// Protected from sliding-window eviction until a newer key reference
  /// arrives.
  pub key_ref: bool,
  pub temporal_id: u8,
  pub ref_pic_flag: FieldPair<bool>,
  pub recon_idx: u32,
}

/// A DPB snapshot: an ordered, fixed-capacity set of reference pictures.
/// Insertion order encodes decoding order, not display order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dpb {
  frames: ArrayVec<DpbFrame, MAX_DPB_SIZE>,
  /// Per-temporal-layer MaxLongTermFrameIdx plus one.
  pub max_long_term_idx_plus1: [u8; MAX_TEMPORAL_LAYERS],
}

impl Deref for Dpb {
  type Target = ArrayVec<DpbFrame, MAX_DPB_SIZE>;

  #[inline]
  fn deref(&self) -> &Self::Target {
    &self.frames
  }
}

impl DerefMut for Dpb {
  #[inline]
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.frames
  }
}

/// Memory management control operation (H.264 7.4.3.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mmco {
  /// Mark a short-term picture unused (operand: difference of pic nums
  /// minus one).
  ShortTermToUnused(u32),
  /// Mark a long-term picture unused (operand: its long-term pic num).
  LongTermToUnused(u32),
  /// Convert a short-term picture to long-term (difference of pic nums
  /// minus one, assigned long-term frame index).
  ShortTermToLongTerm(u32, u32),
  /// Set MaxLongTermFrameIdx (operand: the new value plus one).
  SetMaxLongTermIdx(u32),
  /// Mark the current picture long-term (operand: long-term frame index).
  CurrentToLongTerm(u32),
}

/// The dec_ref_pic_marking() content predicted for one field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
  pub no_output_of_prior_pics: bool,
  /// IDR only: the new picture enters the DPB as long-term.
  pub long_term_reference: bool,
  pub mmco: ArrayVec<Mmco, 32>,
}

impl RefPicMarking {
  pub fn clear(&mut self) {
    *self = RefPicMarking::default();
  }
}

/// Repetition of the previous picture's marking, carried so the SEI
/// collaborator can emit a dec_ref_pic_marking_repetition message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingRepeat {
  pub present: bool,
  pub original_idr: bool,
  pub original_frame_num: u16,
  pub original_field_pic: bool,
  pub original_bottom_field: bool,
  pub marking: RefPicMarking,
}

/// A ref_pic_list_modification() command (H.264 7.4.3.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefListMod {
  /// Short-term picture, pic num below the prediction (abs diff minus one).
  ShortTermSub(u16),
  /// Short-term picture, pic num above the prediction (abs diff minus one).
  ShortTermAdd(u16),
  /// Long-term picture (its long-term pic num).
  LongTerm(u16),
}

pub type RefListModList = ArrayVec<RefListMod, 32>;

// Accessors keyed by a packed reference-list entry.

#[inline]
pub fn pic_num(dpb: &Dpb, r: u8) -> i32 {
  dpb[entry_index(r)].pic_num[entry_parity(r)]
}

/// `pic_num` of a usable short-term reference, or a sentinel that never
/// matches a real pic num. Mirrors the standard's PicNumF (8.2.4.3).
#[inline]
pub fn pic_num_f(dpb: &Dpb, r: u8) -> i32 {
  let f = &dpb[entry_index(r)];
  if f.ref_pic_flag[entry_parity(r)] && !f.long_term {
    f.pic_num[entry_parity(r)]
  } else {
    i32::MAX
  }
}

#[inline]
pub fn long_term_pic_num(dpb: &Dpb, r: u8) -> u8 {
  dpb[entry_index(r)].long_term_pic_num[entry_parity(r)]
}

/// LongTermPicNumF: the long-term pic num of a usable long-term reference,
/// or a sentinel that never matches.
#[inline]
pub fn long_term_pic_num_f(dpb: &Dpb, r: u8) -> u32 {
  let f = &dpb[entry_index(r)];
  if f.ref_pic_flag[entry_parity(r)] && f.long_term {
    f.long_term_pic_num[entry_parity(r)] as u32
  } else {
    u32::MAX
  }
}

#[inline]
pub fn poc_of_entry(dpb: &Dpb, r: u8) -> i32 {
  dpb[entry_index(r)].poc[entry_parity(r)]
}

// Eviction orderings.
//
// Two orderings for the sliding-window victim exist on purpose: the plain
// frame-num-wrap order and the key-reference-aware variant protect
// different pictures, and both behaviors are depended upon by different
// code paths. They are kept as named policies rather than unified.

fn long_term_class(f: &DpbFrame) -> u8 {
  f.long_term as u8
}

/// Short-term entries first, by ascending wrapped frame number; long-term
/// entries last, by ascending long-term pic num.
pub fn order_by_frame_num_wrap(lhs: &DpbFrame, rhs: &DpbFrame) -> Ordering {
  long_term_class(lhs).cmp(&long_term_class(rhs)).then_with(|| {
    if lhs.long_term {
      lhs.long_term_pic_num.top.cmp(&rhs.long_term_pic_num.top)
    } else {
      lhs.frame_num_wrap.cmp(&rhs.frame_num_wrap)
    }
  })
}

/// As [`order_by_frame_num_wrap`], but non-key references sort before key
/// references, so a key reference is only evicted when nothing else is
/// left.
pub fn order_by_frame_num_wrap_key_ref(
  lhs: &DpbFrame, rhs: &DpbFrame,
) -> Ordering {
  long_term_class(lhs).cmp(&long_term_class(rhs)).then_with(|| {
    if lhs.long_term {
      lhs.long_term_pic_num.top.cmp(&rhs.long_term_pic_num.top)
    } else {
      (lhs.key_ref as u8)
        .cmp(&(rhs.key_ref as u8))
        .then(lhs.frame_num_wrap.cmp(&rhs.frame_num_wrap))
    }
  })
}

/// Short-term entries first; within a class, oldest display order first.
pub fn order_by_display_order(lhs: &DpbFrame, rhs: &DpbFrame) -> Ordering {
  long_term_class(lhs)
    .cmp(&long_term_class(rhs))
    .then(lhs.frame_order.cmp(&rhs.frame_order))
}

/// As [`order_by_display_order`] with non-key references preferred as
/// victims.
pub fn order_by_display_order_key_ref(
  lhs: &DpbFrame, rhs: &DpbFrame,
) -> Ordering {
  long_term_class(lhs).cmp(&long_term_class(rhs)).then_with(|| {
    if lhs.long_term {
      lhs.frame_order.cmp(&rhs.frame_order)
    } else {
      (lhs.key_ref as u8)
        .cmp(&(rhs.key_ref as u8))
        .then(lhs.frame_order.cmp(&rhs.frame_order))
    }
  })
}

/// Number of DPB entries later than `frame_order` in display order.
pub fn count_future_refs(dpb: &Dpb, frame_order: u32) -> usize {
  dpb.iter().filter(|f| f.frame_order > frame_order).count()
}

#[cfg(test)]
mod test {
  use super::*;

  fn st(frame_num_wrap: i32, frame_order: u32) -> DpbFrame {
    DpbFrame {
      frame_num_wrap,
      frame_order,
      ref_pic_flag: FieldPair::same(true),
      ..Default::default()
    }
  }

  fn lt(idx: u8, frame_order: u32) -> DpbFrame {
    DpbFrame {
      long_term: true,
      long_term_idx_plus1: idx + 1,
      long_term_pic_num: FieldPair::same(idx),
      frame_order,
      ref_pic_flag: FieldPair::same(true),
      ..Default::default()
    }
  }

  #[test]
  fn entry_packing() {
    let e = make_entry(5, 1);
    assert_eq!(entry_index(e), 5);
    assert_eq!(entry_parity(e), 1);
  }

  #[test]
  fn frame_num_wrap_order_prefers_short_term() {
    let victims =
      [lt(0, 0), st(7, 7), st(3, 3)];
    let min = victims.iter().min_by(|a, b| order_by_frame_num_wrap(a, b));
    assert_eq!(min.unwrap().frame_num_wrap, 3);
  }

  #[test]
  fn key_ref_order_protects_key_references() {
    let mut a = st(3, 3);
    a.key_ref = true;
    let b = st(7, 7);
    let victims = [a, b];
    let plain =
      victims.iter().min_by(|a, b| order_by_frame_num_wrap(a, b)).unwrap();
    let keyed = victims
      .iter()
      .min_by(|a, b| order_by_frame_num_wrap_key_ref(a, b))
      .unwrap();
    // the two policies intentionally disagree here
    assert_eq!(plain.frame_num_wrap, 3);
    assert_eq!(keyed.frame_num_wrap, 7);
  }

  #[test]
  fn future_ref_count() {
    let mut dpb = Dpb::default();
    dpb.push(st(0, 0));
    dpb.push(st(1, 5));
    assert_eq!(count_future_refs(&dpb, 2), 1);
    assert_eq!(count_future_refs(&dpb, 6), 0);
  }
}
