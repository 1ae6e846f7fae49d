// Copyright (c) 2019-2022, The rh264e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause
#![deny(missing_docs)]

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use thiserror::*;

use crate::util::FieldPair;

/// A rational number.
#[derive(Clone, Copy, Debug)]
pub struct Rational {
  /// Numerator.
  pub num: u64,
  /// Denominator.
  pub den: u64,
}

impl Rational {
  /// Creates a rational number from the given numerator and denominator.
  pub const fn new(num: u64, den: u64) -> Self {
    Rational { num, den }
  }

  /// Returns the rational number as a floating-point number.
  pub fn as_f64(self) -> f64 {
    self.num as f64 / self.den as f64
  }
}

/// Status that can be returned by the scheduling entry points.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum EncoderStatus {
  /// All free task, reconstruction or bitstream slots are in flight.
  ///
  /// This is transient: the same call is expected to succeed once a
  /// previously submitted task completes. It must not be treated as fatal.
  #[error("device busy")]
  DeviceBusy,
  /// No frame can be chosen for encoding yet.
  ///
  /// Emitted while the reordering buffer waits for a future reference, or
  /// when flushing an already empty queue. Not an error.
  #[error("need more data")]
  NeedMoreData,
  /// Request parameters contradict the configured stream.
  ///
  /// Rejected synchronously, before any state mutation.
  #[error("invalid parameter")]
  InvalidParam,
  /// The hardware reported a failure for a submitted task.
  #[error("device failed")]
  DeviceFailed,
}

/// Picture structure of the input sequence.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PicStruct {
  /// Frame pictures.
  #[default]
  Progressive,
  /// Field pictures, top field first.
  FieldTff,
  /// Field pictures, bottom field first.
  FieldBff,
}

impl PicStruct {
  /// Whether the sequence codes two fields per frame.
  #[inline]
  pub fn is_field(self) -> bool {
    self != PicStruct::Progressive
  }
}

/// Frame type of one field: a base type (I, P or B) plus marker bits.
///
/// Stored as a bit set because a picture is routinely "P and a reference"
/// or "I and an IDR", and the per-field pair of a frame may combine
/// different base types (an I/P field pair).
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct FrameType(u8);

impl FrameType {
  /// Type not decided yet.
  pub const UNKNOWN: FrameType = FrameType(0);
  /// Intra-coded.
  pub const I: FrameType = FrameType(0x01);
  /// Predicted from list 0.
  pub const P: FrameType = FrameType(0x02);
  /// Bi-predicted.
  pub const B: FrameType = FrameType(0x04);
  /// Used as a reference by other pictures.
  pub const REF: FrameType = FrameType(0x40);
  /// Instantaneous decoder refresh.
  pub const IDR: FrameType = FrameType(0x80);

  /// Whether all bits of `other` are set in `self`.
  #[inline]
  pub fn contains(self, other: FrameType) -> bool {
    self.0 & other.0 == other.0
  }

  /// Whether any bit of `other` is set in `self`.
  #[inline]
  pub fn intersects(self, other: FrameType) -> bool {
    self.0 & other.0 != 0
  }

  /// Whether the base type is intra.
  #[inline]
  pub fn is_intra(self) -> bool {
    self.intersects(FrameType::I)
  }

  /// Whether the base type is B.
  #[inline]
  pub fn is_b(self) -> bool {
    self.intersects(FrameType::B)
  }

  /// Whether the picture is a reference.
  #[inline]
  pub fn is_ref(self) -> bool {
    self.intersects(FrameType::REF)
  }

  /// Whether the picture is an IDR.
  #[inline]
  pub fn is_idr(self) -> bool {
    self.intersects(FrameType::IDR)
  }

  /// Whether a type has been assigned.
  #[inline]
  pub fn is_known(self) -> bool {
    self.0 != 0
  }
}

impl BitOr for FrameType {
  type Output = FrameType;

  #[inline]
  fn bitor(self, rhs: FrameType) -> FrameType {
    FrameType(self.0 | rhs.0)
  }
}

impl BitOrAssign for FrameType {
  #[inline]
  fn bitor_assign(&mut self, rhs: FrameType) {
    self.0 |= rhs.0;
  }
}

impl BitAnd for FrameType {
  type Output = FrameType;

  #[inline]
  fn bitand(self, rhs: FrameType) -> FrameType {
    FrameType(self.0 & rhs.0)
  }
}

impl fmt::Debug for FrameType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let base = if self.is_intra() {
      'I'
    } else if self.intersects(FrameType::P) {
      'P'
    } else if self.is_b() {
      'B'
    } else {
      'x'
    };
    let c =
      if self.is_ref() { base } else { base.to_ascii_lowercase() };
    if self.is_idr() {
      write!(f, "{c}*")
    } else {
      write!(f, "{c}")
    }
  }
}

/// Expands a frame-level type into a per-field pair.
///
/// The second field never carries the IDR bit, and the second field of an
/// intra frame is coded as P (it predicts from the first field).
pub fn extend_frame_type(ty: FrameType) -> FieldPair<FrameType> {
  let mut second = FrameType(ty.0 & !FrameType::IDR.0);
  if ty.is_intra() {
    second = FrameType(second.0 & !FrameType::I.0) | FrameType::P;
  }
  FieldPair::new(ty, second)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn frame_type_bits() {
    let t = FrameType::I | FrameType::REF | FrameType::IDR;
    assert!(t.is_intra() && t.is_ref() && t.is_idr());
    assert!(!t.is_b());
    assert_eq!(format!("{t:?}"), "I*");
    assert_eq!(format!("{:?}", FrameType::B), "b");
  }

  #[test]
  fn second_field_is_never_idr() {
    let p = extend_frame_type(FrameType::I | FrameType::REF | FrameType::IDR);
    assert!(p.top.is_idr());
    assert!(!p.bot.is_idr());
    assert!(p.bot.contains(FrameType::P | FrameType::REF));

    let p = extend_frame_type(FrameType::B);
    assert_eq!(p.top, p.bot);
  }
}
