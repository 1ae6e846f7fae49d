// Copyright (c) 2019-2022, The rh264e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause

/// Running encode statistics, readable as a snapshot at any time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodeStats {
  /// Frames buffered inside the encoder, not yet assigned to hardware.
  pub num_cached_frame: u32,
  /// Frames completed since the session started.
  pub num_frame: u32,
  /// Bits produced by completed frames.
  pub num_bit: u64,
}
