// Copyright (c) 2019-2022, The rh264e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause

//! rh264e is the scheduling, reference-management and rate-control core
//! of a hardware H.264 encoder. It decides, for every input frame, what
//! to encode, in what order, against which references and how aggressively
//! to compress it, and hands fully configured units of work to a hardware
//! submission layer.
//!
//! The crate deliberately stops at the hardware boundary: kernel dispatch,
//! frame memory, NAL bit packing and SEI byte layout are collaborators,
//! parameterized by the structures produced here.
//!
//! The pieces, leaf first:
//!
//! * [`hrd::Hrd`] tracks the buffering-model leaky bucket.
//! * [`gop::FrameTypeGenerator`] turns display positions into frame types.
//! * [`rate`] holds the interchangeable rate-control strategies.
//! * [`task::TaskManager`] owns the task, reconstruction and bitstream
//!   pools and the DPB state machine.
//! * [`pipeline::AsyncRoutineEmulator`] sequences the multi-stage
//!   asynchronous pipeline from a single-threaded driving loop.

#![allow(clippy::too_many_arguments)]

pub mod dpb;
pub mod gop;
pub mod hrd;
pub mod pipeline;
pub mod rate;
pub mod reflist;
pub mod stats;
pub mod task;
pub mod util;

mod api;

pub use api::*;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;
