// Copyright (c) 2019-2022, The rh264e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause

use super::*;
use crate::api::{EncoderConfig, FrameType, PicStruct};
use crate::dpb::Mmco;

fn config(pic_size: u16, ref_dist: u16, num_ref: u8, closed: bool) -> EncoderConfig {
  let mut cfg = EncoderConfig::default();
  cfg.gop.pic_size = pic_size;
  cfg.gop.ref_dist = ref_dist;
  cfg.gop.closed = closed;
  cfg.num_ref_frame = num_ref;
  cfg
}

fn ok_feedback(bytes: u32) -> HwFeedback {
  HwFeedback {
    bs_data_length: crate::util::FieldPair::same(bytes),
    success: true,
    ..Default::default()
  }
}

// Feeds `frames` surfaces in display order, then flushes; completes each
// assigned task immediately. Returns (display order, frame type) in
// encoding order.
fn drive(
  mgr: &TaskManager, frames: u32, mut on_task: impl FnMut(&DdiTask),
) -> Vec<(u32, FrameType)> {
  let mut out = Vec::new();
  let mut emit = |mgr: &TaskManager, id: TaskId| {
    let info = mgr
      .with_task(id, |t| {
        on_task(t);
        (t.frame_order, t.frame_type())
      })
      .unwrap();
    mgr.confirm_task(id).unwrap();
    mgr.complete_task(id, &ok_feedback(1000)).unwrap();
    info
  };

  for i in 0..frames {
    match mgr.assign_task(
      EncodeCtrl::default(),
      Some(SurfaceHandle(i)),
      Some(BitstreamHandle(i)),
    ) {
      Ok(id) => out.push(emit(mgr, id)),
      Err(EncoderStatus::NeedMoreData) => {}
      Err(e) => panic!("unexpected status {e:?} at frame {i}"),
    }
  }
  loop {
    match mgr.assign_task(EncodeCtrl::default(), None, None) {
      Ok(id) => out.push(emit(mgr, id)),
      Err(EncoderStatus::NeedMoreData) => break,
      Err(e) => panic!("unexpected status {e:?} during flush"),
    }
  }
  out
}

#[test]
fn reordering_scenario_gop30_refdist3() {
  // 35 frames in display order with reordering enabled: the classic
  // IPP...B pattern must come out as 0,3,1,2,6,4,5,... with a fresh IDR
  // at display position 30
  let mgr = TaskManager::new(config(30, 3, 4, true)).unwrap();
  let order = drive(&mgr, 35, |_| {});

  assert_eq!(order.len(), 35);
  let display: Vec<u32> = order.iter().map(|o| o.0).collect();
  assert_eq!(&display[..7], &[0, 3, 1, 2, 6, 4, 5]);

  let (_, ty0) = order[0];
  assert!(ty0.is_idr());
  let idr = order.iter().find(|o| o.0 == 30).unwrap();
  assert!(idr.1.is_idr(), "frame 30 must start a new IDR");

  // closed gop: the B right before the IDR was promoted to P
  let promoted = order.iter().find(|o| o.0 == 29).unwrap();
  assert!(promoted.1.contains(FrameType::P | FrameType::REF));

  // every frame came out exactly once
  let mut sorted = display.clone();
  sorted.sort_unstable();
  assert_eq!(sorted, (0..35).collect::<Vec<_>>());
}

#[test]
fn encode_order_is_monotonic() {
  let mgr = TaskManager::new(config(30, 3, 4, false)).unwrap();
  let mut last_enc = None;
  drive(&mgr, 20, |t| {
    if let Some(prev) = last_enc {
      assert_eq!(t.enc_order, prev + 1);
    }
    last_enc = Some(t.enc_order);
  });
}

#[test]
fn dpb_never_exceeds_num_ref_frame_and_evicts_lru() {
  let mgr = TaskManager::new(config(64, 1, 2, false)).unwrap();
  drive(&mgr, 8, |t| {
    assert!(t.dpb_post_encoding.len() <= 2);
    if t.frame_order >= 3 {
      // with two slots the window holds exactly the two newest frames
      let mut orders: Vec<u32> =
        t.dpb_post_encoding.iter().map(|f| f.frame_order).collect();
      orders.sort_unstable();
      assert_eq!(orders, vec![t.frame_order - 1, t.frame_order]);
      // sliding window needs no explicit commands
      assert!(t.marking[0].mmco.is_empty());
    }
  });
}

#[test]
fn frame_num_and_poc_bookkeeping() {
  // B frames are non-references: frame_num must not advance past them
  let mgr = TaskManager::new(config(30, 2, 4, false)).unwrap();
  let mut seen = Vec::new();
  drive(&mgr, 10, |t| {
    seen.push((t.frame_order, t.frame_num, t.poc(0)));
    if t.frame_order == 0 {
      assert_eq!(t.frame_num, 0);
      assert_eq!(t.poc(0), 0);
    }
    assert_eq!(t.poc(0), 2 * t.frame_order as i32);
  });
  // display 2 is the second reference: frame_num 1; the B between them
  // reuses frame_num 2 of its backward reference era
  let p2 = seen.iter().find(|s| s.0 == 2).unwrap();
  assert_eq!(p2.1, 1);
  let b1 = seen.iter().find(|s| s.0 == 1).unwrap();
  assert_eq!(b1.1, 2);
}

#[test]
fn no_op_ref_list_modification_is_empty() {
  let mgr = TaskManager::new(config(64, 1, 4, false)).unwrap();
  drive(&mgr, 6, |t| {
    // without application control the initial list is already the wanted
    // list, so the modification commands must collapse to nothing
    assert!(t.ref_list_mod0[0].is_empty());
    assert!(t.ref_list_mod1[0].is_empty());
    if t.frame_order >= 2 {
      assert!(t.list0[0].len() >= 2);
    }
  });
}

#[test]
fn preferred_ref_reorders_and_emits_modification() {
  let mgr = TaskManager::new(config(64, 1, 4, false)).unwrap();
  for i in 0..4u32 {
    let mut ctrl = EncodeCtrl::default();
    if i == 3 {
      // prefer the oldest reference; the init list has it last
      let mut rl = RefListCtrl::default();
      rl.preferred.push(0);
      ctrl.ref_list_ctrl = Some(rl);
    }
    let id = mgr
      .assign_task(ctrl, Some(SurfaceHandle(i)), Some(BitstreamHandle(i)))
      .unwrap();
    if i == 3 {
      mgr
        .with_task(id, |t| {
          let dpb = &t.dpb[0];
          assert_eq!(dpb[crate::dpb::entry_index(t.list0[0][0])].frame_order, 0);
          assert!(!t.ref_list_mod0[0].is_empty());
        })
        .unwrap();
    }
    mgr.confirm_task(id).unwrap();
    mgr.complete_task(id, &ok_feedback(500)).unwrap();
  }
}

#[test]
fn rejected_ref_emits_mmco_and_leaves_dpb() {
  let mgr = TaskManager::new(config(64, 1, 4, false)).unwrap();
  for i in 0..4u32 {
    let mut ctrl = EncodeCtrl::default();
    if i == 3 {
      let mut rl = RefListCtrl::default();
      rl.rejected.push(1);
      ctrl.ref_list_ctrl = Some(rl);
    }
    let id = mgr
      .assign_task(ctrl, Some(SurfaceHandle(i)), Some(BitstreamHandle(i)))
      .unwrap();
    if i == 3 {
      mgr
        .with_task(id, |t| {
          assert!(t
            .dpb_post_encoding
            .iter()
            .all(|f| f.frame_order != 1));
          // rejecting frame 1 from frame 3: diff_of_pic_nums_minus_1 = 1
          assert_eq!(t.marking[0].mmco[0], Mmco::ShortTermToUnused(1));
        })
        .unwrap();
    }
    mgr.confirm_task(id).unwrap();
    mgr.complete_task(id, &ok_feedback(500)).unwrap();
  }
}

#[test]
fn current_frame_long_term_promotion() {
  let mgr = TaskManager::new(config(64, 1, 4, false)).unwrap();
  for i in 0..3u32 {
    let mut ctrl = EncodeCtrl::default();
    if i == 2 {
      let mut rl = RefListCtrl::default();
      rl.long_term.push(2);
      ctrl.ref_list_ctrl = Some(rl);
    }
    let id = mgr
      .assign_task(ctrl, Some(SurfaceHandle(i)), Some(BitstreamHandle(i)))
      .unwrap();
    if i == 2 {
      mgr
        .with_task(id, |t| {
          assert_eq!(t.long_term_frame_idx, 0);
          assert!(t
            .marking[0]
            .mmco
            .contains(&Mmco::SetMaxLongTermIdx(1)));
          assert!(t.marking[0].mmco.contains(&Mmco::CurrentToLongTerm(0)));
          let lt = t
            .dpb_post_encoding
            .iter()
            .find(|f| f.frame_order == 2)
            .unwrap();
          assert!(lt.long_term);
          assert_eq!(lt.long_term_idx_plus1, 1);
        })
        .unwrap();
    }
    mgr.confirm_task(id).unwrap();
    mgr.complete_task(id, &ok_feedback(500)).unwrap();
  }
}

#[test]
fn interlaced_bitstream_slots_report_busy() {
  let mut cfg = config(30, 1, 2, false);
  cfg.pic_struct = PicStruct::FieldTff;
  let mut pools = PoolSizes::from_config(&cfg);
  pools.bitstream = 2; // exactly one interlaced frame in flight
  let mgr = TaskManager::with_pools(cfg, pools).unwrap();

  let first = mgr
    .assign_task(
      EncodeCtrl::default(),
      Some(SurfaceHandle(0)),
      Some(BitstreamHandle(0)),
    )
    .unwrap();

  // both slots are held by the first field pair: transient busy, not an
  // error
  let second = mgr.assign_task(
    EncodeCtrl::default(),
    Some(SurfaceHandle(1)),
    Some(BitstreamHandle(1)),
  );
  assert_eq!(second.unwrap_err(), EncoderStatus::DeviceBusy);

  mgr.confirm_task(first).unwrap();
  mgr.complete_task(first, &ok_feedback(800)).unwrap();

  // the retry with the same input goes through once the slots are freed
  let second = mgr.assign_task(
    EncodeCtrl::default(),
    Some(SurfaceHandle(1)),
    Some(BitstreamHandle(1)),
  );
  assert!(second.is_ok());
}

#[test]
fn interlaced_field_pair_references() {
  let mut cfg = config(30, 1, 4, false);
  cfg.pic_struct = PicStruct::FieldTff;
  let mgr = TaskManager::new(cfg).unwrap();

  let id0 = mgr
    .assign_task(
      EncodeCtrl::default(),
      Some(SurfaceHandle(0)),
      Some(BitstreamHandle(0)),
    )
    .unwrap();
  mgr
    .with_task(id0, |t| {
      // second field of the IDR frame predicts from the first field
      assert!(t.ty.top.is_idr());
      assert!(t.ty.bot.contains(FrameType::P));
      assert_eq!(t.list0[1].len(), 1);
      assert_eq!(crate::dpb::entry_parity(t.list0[1][0]), 0);
      // both fields of the frame are references after encoding
      let back = t.dpb_post_encoding.last().unwrap();
      assert!(back.ref_pic_flag.top && back.ref_pic_flag.bot);
    })
    .unwrap();
  mgr.confirm_task(id0).unwrap();
  mgr.complete_task(id0, &ok_feedback(800)).unwrap();

  let id1 = mgr
    .assign_task(
      EncodeCtrl::default(),
      Some(SurfaceHandle(1)),
      Some(BitstreamHandle(1)),
    )
    .unwrap();
  mgr
    .with_task(id1, |t| {
      // a P field alternates same-parity and opposite-parity references
      assert_eq!(t.list0[0].len(), 2);
      assert_eq!(crate::dpb::entry_parity(t.list0[0][0]), 0);
      assert_eq!(crate::dpb::entry_parity(t.list0[0][1]), 1);
    })
    .unwrap();
  mgr.confirm_task(id1).unwrap();
  mgr.complete_task(id1, &ok_feedback(800)).unwrap();
}

#[test]
fn cancel_rolls_back_reservations() {
  let mgr = TaskManager::new(config(30, 1, 2, false)).unwrap();
  // many more cycles than any pool holds: a leaked slot would surface as
  // DeviceBusy
  for i in 0..20u32 {
    let id = mgr
      .assign_task(
        EncodeCtrl::default(),
        Some(SurfaceHandle(i)),
        Some(BitstreamHandle(i)),
      )
      .unwrap();
    mgr.cancel_task(id).unwrap();
    assert_eq!(mgr.count_running_tasks(), 0);
  }
}

#[test]
fn failed_hardware_still_releases_resources() {
  let mgr = TaskManager::new(config(30, 1, 2, false)).unwrap();
  for i in 0..20u32 {
    let id = mgr
      .assign_task(
        EncodeCtrl::default(),
        Some(SurfaceHandle(i)),
        Some(BitstreamHandle(i)),
      )
      .unwrap();
    mgr.confirm_task(id).unwrap();
    let failed = HwFeedback { success: false, ..Default::default() };
    assert_eq!(
      mgr.complete_task(id, &failed),
      Err(EncoderStatus::DeviceFailed)
    );
  }
}

#[test]
fn stale_task_id_is_rejected() {
  let mgr = TaskManager::new(config(30, 1, 2, false)).unwrap();
  let id = mgr
    .assign_task(
      EncodeCtrl::default(),
      Some(SurfaceHandle(0)),
      Some(BitstreamHandle(0)),
    )
    .unwrap();
  mgr.confirm_task(id).unwrap();
  mgr.complete_task(id, &ok_feedback(100)).unwrap();
  // the slot was recycled; the old generation must not resolve
  assert_eq!(
    mgr.complete_task(id, &ok_feedback(100)),
    Err(EncoderStatus::InvalidParam)
  );
}

#[test]
fn contradictory_forced_type_is_rejected() {
  let mgr = TaskManager::new(config(30, 1, 2, false)).unwrap();
  let ctrl = EncodeCtrl {
    frame_type: Some(FrameType::I | FrameType::B),
    ..Default::default()
  };
  assert_eq!(
    mgr.assign_task(ctrl, Some(SurfaceHandle(0)), Some(BitstreamHandle(0))),
    Err(EncoderStatus::InvalidParam)
  );
}

#[test]
fn forced_idr_mid_stream() {
  let mgr = TaskManager::new(config(64, 1, 4, false)).unwrap();
  for i in 0..6u32 {
    let mut ctrl = EncodeCtrl::default();
    if i == 3 {
      ctrl.frame_type =
        Some(FrameType::I | FrameType::REF | FrameType::IDR);
    }
    let id = mgr
      .assign_task(ctrl, Some(SurfaceHandle(i)), Some(BitstreamHandle(i)))
      .unwrap();
    mgr
      .with_task(id, |t| {
        if i == 3 {
          assert!(t.frame_type().is_idr());
          assert_eq!(t.frame_num, 0);
          assert_eq!(t.poc(0), 0);
          // an idr references nothing and empties the dpb
          assert!(t.list0[0].is_empty());
          assert!(t.dpb_post_encoding.len() == 1);
        }
        if i == 4 {
          // the new gop references only the idr
          assert_eq!(t.dpb[0].len(), 1);
          assert_eq!(t.dpb[0][0].frame_order, 3);
        }
      })
      .unwrap();
    mgr.confirm_task(id).unwrap();
    mgr.complete_task(id, &ok_feedback(500)).unwrap();
  }
}

#[test]
fn b_pyramid_mini_gop_order() {
  let mut cfg = config(32, 4, 4, false);
  cfg.gop.b_pyramid = true;
  let mgr = TaskManager::new(cfg).unwrap();
  let order = drive(&mgr, 9, |_| {});
  let display: Vec<u32> = order.iter().map(|o| o.0).collect();
  // mini-gop of three Bs: the middle B (2) is a pyramid reference and is
  // encoded before its neighbours
  assert_eq!(&display[..5], &[0, 4, 2, 1, 3]);
}

#[test]
fn stats_track_frames_and_bits() {
  let mgr = TaskManager::new(config(30, 1, 2, false)).unwrap();
  for i in 0..5u32 {
    let id = mgr
      .assign_task(
        EncodeCtrl::default(),
        Some(SurfaceHandle(i)),
        Some(BitstreamHandle(i)),
      )
      .unwrap();
    mgr.confirm_task(id).unwrap();
    mgr.complete_task(id, &ok_feedback(1000)).unwrap();
  }
  let stats = mgr.stats();
  assert_eq!(stats.num_frame, 5);
  assert_eq!(stats.num_bit, 5 * 8 * 1000);
  assert_eq!(stats.num_cached_frame, 0);
}
