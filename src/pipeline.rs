// Copyright (c) 2019-2022, The rh264e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause

//! Stage-flow sequencer for the asynchronous hardware pipeline.
//!
//! Models each pipeline stage as a token queue. A stage fires once its
//! input queue reaches the stage's greediness (its batch size), or, while
//! flushing, as soon as the queue is non-empty. Firing moves one token to
//! the next stage. This lets a single-threaded driving loop sequence a
//! deep multi-stage pipeline without any real concurrency: a later stage
//! can never consume more tokens than an earlier stage produced.

use crate::api::{EncoderConfig, RateControlMethod};

/// Pipeline stages in firing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Stage {
  AcceptFrame = 0,
  StartSceneChangeDetect,
  WaitSceneChangeDetect,
  StartLookahead,
  WaitLookahead,
  StartHistogram,
  WaitHistogram,
  StartEncode,
  WaitEncode,
}

pub const STAGE_COUNT: usize = 9;

const STAGES: [Stage; STAGE_COUNT] = [
  Stage::AcceptFrame,
  Stage::StartSceneChangeDetect,
  Stage::WaitSceneChangeDetect,
  Stage::StartLookahead,
  Stage::WaitLookahead,
  Stage::StartHistogram,
  Stage::WaitHistogram,
  Stage::StartEncode,
  Stage::WaitEncode,
];

/// Set of stages that fired during one `go` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stages(u32);

impl Stages {
  pub const NONE: Stages = Stages(0);
  /// Nothing new arrived but the pipeline still holds work: call `go`
  /// again immediately to keep draining.
  pub const RESTART: Stages = Stages(1 << STAGE_COUNT);

  #[inline]
  pub fn of(stage: Stage) -> Stages {
    Stages(1 << stage as usize)
  }

  #[inline]
  pub fn contains(self, other: Stages) -> bool {
    self.0 & other.0 == other.0
  }

  #[inline]
  pub fn is_empty(self) -> bool {
    self.0 == 0
  }
}

impl std::ops::BitOr for Stages {
  type Output = Stages;

  #[inline]
  fn bitor(self, rhs: Stages) -> Stages {
    Stages(self.0 | rhs.0)
  }
}

impl std::ops::BitOrAssign for Stages {
  #[inline]
  fn bitor_assign(&mut self, rhs: Stages) {
    self.0 |= rhs.0;
  }
}

/// The sequencer. One instance per driving loop; state is only queue
/// fullness and flush flags, reset by [`AsyncRoutineEmulator::new`].
#[derive(Clone, Debug)]
pub struct AsyncRoutineEmulator {
  greediness: [u32; STAGE_COUNT],
  queue_fullness: [u32; STAGE_COUNT + 1],
  queue_flush: [bool; STAGE_COUNT + 1],
}

impl AsyncRoutineEmulator {
  pub fn new(cfg: &EncoderConfig) -> Self {
    let mut greediness = [1u32; STAGE_COUNT];
    let deep = cfg.async_depth > 1;
    let reorder_batch =
      if cfg.encoded_order { 1 } else { cfg.gop.ref_dist.max(1) as u32 };

    match cfg.rc.method {
      RateControlMethod::ConstantQp => {
        greediness[Stage::StartLookahead as usize] = reorder_batch;
        greediness[Stage::WaitEncode as usize] = 1 + deep as u32;
        if deep {
          // reference P frames are submitted ahead so ENC and PAK of
          // consecutive frames overlap
          let b_frames = cfg.gop.ref_dist > 1;
          greediness[Stage::StartEncode as usize] += b_frames as u32;
          greediness[Stage::WaitEncode as usize] += b_frames as u32
            + (cfg.async_depth > 2 && cfg.gop.ref_dist > 2) as u32;
        }
      }
      m if m.is_lookahead() => {
        greediness[Stage::StartLookahead as usize] = reorder_batch;
        greediness[Stage::WaitLookahead as usize] = 1 + deep as u32;
        greediness[Stage::StartEncode as usize] =
          cfg.rc.lookahead_depth.max(1) as u32;
        greediness[Stage::WaitEncode as usize] = 1 + deep as u32;
      }
      _ => {
        greediness[Stage::StartLookahead as usize] = reorder_batch;
        greediness[Stage::WaitEncode as usize] = 1 + deep as u32;
      }
    }

    AsyncRoutineEmulator {
      greediness,
      queue_fullness: [0; STAGE_COUNT + 1],
      queue_flush: [false; STAGE_COUNT + 1],
    }
  }

  /// Frames the pipeline holds once every stage is saturated; the number
  /// of inputs needed before the first output appears.
  pub fn total_greediness(&self) -> u32 {
    self.greediness.iter().map(|&g| g - 1).sum::<u32>() + 1
  }

  pub fn stage_greediness(&self, stage: Stage) -> u32 {
    self.greediness[stage as usize]
  }

  fn check_stage_output(&mut self, stage: usize) -> bool {
    let fired = self.queue_fullness[stage] >= self.greediness[stage]
      || (self.queue_fullness[stage] > 0 && self.queue_flush[stage]);
    if fired {
      self.queue_fullness[stage] -= 1;
      self.queue_fullness[stage + 1] += 1;
    }
    // the flush propagates once this stage has fully drained
    self.queue_flush[stage + 1] =
      self.queue_flush[stage] && self.queue_fullness[stage] == 0;
    fired
  }

  /// One scheduling step. `has_input` pushes a token into the accept
  /// stage; false starts (or continues) a flush.
  pub fn go(&mut self, has_input: bool) -> Stages {
    if has_input {
      self.queue_fullness[Stage::AcceptFrame as usize] += 1;
    } else {
      self.queue_flush[Stage::AcceptFrame as usize] = true;
    }

    let mut stages = Stages::NONE;
    for (i, &stage) in STAGES.iter().enumerate() {
      if self.check_stage_output(i) {
        stages |= Stages::of(stage);
      }
    }

    if !has_input
      && !stages.is_empty()
      && !stages.contains(Stages::of(Stage::WaitEncode))
    {
      stages |= Stages::RESTART;
    }

    stages
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::{EncoderConfig, RateControlMethod};

  fn la_config(lookahead: u16, ref_dist: u16) -> EncoderConfig {
    let mut cfg = EncoderConfig::default();
    cfg.rc.method = RateControlMethod::LookAhead;
    cfg.rc.target_bitrate = 1_000_000;
    cfg.rc.lookahead_depth = lookahead;
    cfg.gop.ref_dist = ref_dist;
    cfg.gop.pic_size = 32;
    cfg
  }

  #[test]
  fn cqp_passthrough_fires_every_stage_per_input() {
    let mut emu = AsyncRoutineEmulator::new(&EncoderConfig::default());
    assert_eq!(emu.total_greediness(), 1);

    // with all-ones greediness a token falls straight through
    let fired = emu.go(true);
    for s in STAGES {
      assert!(fired.contains(Stages::of(s)), "{s:?} did not fire");
    }
  }

  #[test]
  fn stages_wait_for_their_batch() {
    let cfg = la_config(4, 2);
    let mut emu = AsyncRoutineEmulator::new(&cfg);
    // accept=1, la start batches 2, encode start batches 4
    assert_eq!(emu.stage_greediness(Stage::StartLookahead), 2);
    assert_eq!(emu.stage_greediness(Stage::StartEncode), 4);

    let fired = emu.go(true);
    assert!(fired.contains(Stages::of(Stage::AcceptFrame)));
    assert!(!fired.contains(Stages::of(Stage::StartLookahead)));

    let fired = emu.go(true);
    // second token fills the lookahead batch
    assert!(fired.contains(Stages::of(Stage::StartLookahead)));
    assert!(!fired.contains(Stages::of(Stage::StartEncode)));
  }

  #[test]
  fn total_greediness_inputs_then_flush_drains_everything() {
    let cfg = la_config(6, 3);
    let mut emu = AsyncRoutineEmulator::new(&cfg);
    let total = emu.total_greediness();

    let mut outputs = 0;
    for _ in 0..total {
      let fired = emu.go(true);
      if fired.contains(Stages::of(Stage::WaitEncode)) {
        outputs += 1;
      }
    }
    // saturating the pipeline produces exactly one output
    assert_eq!(outputs, 1);

    // flush: every remaining token must come out, then silence
    let mut flush_calls = 0;
    loop {
      let fired = emu.go(false);
      if fired.contains(Stages::of(Stage::WaitEncode)) {
        outputs += 1;
      }
      if fired.is_empty() {
        break;
      }
      flush_calls += 1;
      assert!(flush_calls < 1000, "pipeline does not drain");
    }
    assert_eq!(outputs, total);
    assert_eq!(emu.queue_fullness[..STAGE_COUNT].iter().sum::<u32>(), 0);
  }

  #[test]
  fn restart_signals_more_drain_work() {
    let cfg = la_config(4, 2);
    let mut emu = AsyncRoutineEmulator::new(&cfg);
    emu.go(true);
    emu.go(true);

    let fired = emu.go(false);
    // something fired but not the terminal stage: the driving loop must
    // call again without waiting for input
    assert!(!fired.is_empty());
    if !fired.contains(Stages::of(Stage::WaitEncode)) {
      assert!(fired.contains(Stages::RESTART));
    }
  }
}
