// Copyright (c) 2019-2022, The rh264e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause

//! Reference picture list construction and DPB update prediction.
//!
//! Everything here mutates a [`DdiTask`] in place: the task carries the
//! per-field DPB snapshots the hardware will see, and this module fills in
//! the initial lists (8.2.4.2), the application-driven modifications, the
//! ref_pic_list_modification commands and the dec_ref_pic_marking commands
//! that reproduce the predicted DPB transition on the decoder side.

use crate::api::{EncoderConfig, FrameType};
use crate::dpb::*;
use crate::task::{DdiTask, RefListCtrl};
use crate::util::FieldPair;

/// Recomputes pic nums and long-term pic nums of every DPB entry relative
/// to the current picture (8.2.4.1).
pub fn update_dpb_frames(task: &mut DdiTask, field: usize, frame_num_max: u32) {
  let progressive = !task.field_pic;
  let frame_num = task.frame_num;
  let dpb = &mut task.dpb[field];

  for r in dpb.iter_mut() {
    if r.long_term_idx_plus1 > 0 {
      let idx = r.long_term_idx_plus1 - 1;
      if progressive {
        r.long_term_pic_num = FieldPair::same(idx);
      } else {
        r.long_term_pic_num = FieldPair::new(
          2 * idx + (field == 0) as u8,
          2 * idx + (field == 1) as u8,
        );
      }
    } else {
      r.frame_num_wrap = if r.frame_num > frame_num {
        r.frame_num as i32 - frame_num_max as i32
      } else {
        r.frame_num as i32
      };
      if progressive {
        r.pic_num = FieldPair::same(r.frame_num_wrap);
      } else {
        r.pic_num = FieldPair::new(
          2 * r.frame_num_wrap + (field == 0) as i32,
          2 * r.frame_num_wrap + (field == 1) as i32,
        );
      }
    }
  }
}

// 8.2.4.2.5 "Initialisation process for reference picture lists in fields":
// redistribute a frame-level list into a field list by alternating
// same-parity and opposite-parity picks.
fn process_fields(
  bottom: usize, dpb: &Dpb, pic_list_frm: &RefList, pic_list_fld: &mut RefList,
) {
  let mut same = pic_list_frm.iter();
  let mut opp = pic_list_frm.iter();

  pic_list_fld.clear();

  loop {
    let s = same.by_ref().find(|&&r| dpb[entry_index(r)].ref_pic_flag[bottom]);
    if let Some(&r) = s {
      pic_list_fld.push(make_entry(entry_index(r), bottom));
    }
    let o =
      opp.by_ref().find(|&&r| dpb[entry_index(r)].ref_pic_flag[1 - bottom]);
    if let Some(&r) = o {
      pic_list_fld.push(make_entry(entry_index(r), 1 - bottom));
    }
    if s.is_none() && o.is_none() {
      break;
    }
  }
}

/// Builds the initial reference lists for one field of a task per the
/// reference picture list initialisation process (8.2.4.2).
pub fn init_ref_pic_list(task: &mut DdiTask, field: usize) {
  let mut list0_frm = RefList::new(); // lists built as if the picture were a frame
  let mut list1_frm = RefList::new();

  let ty = task.ty[field];
  let cur_poc = task.poc(0);
  let dpb = task.dpb[field].clone();

  if ty.is_idr() {
    // an IDR has no inter references, lists stay empty
  } else if ty.contains(FrameType::P) {
    // 8.2.4.2.1-2: short-term by descending wrapped frame number, then
    // long-term by ascending long-term frame index
    for i in 0..dpb.len() {
      if !dpb[i].long_term {
        list0_frm.push(i as u8);
      }
    }
    list0_frm
      .sort_by(|&a, &b| {
        dpb[entry_index(b)].frame_num_wrap.cmp(&dpb[entry_index(a)].frame_num_wrap)
      });

    let first_long_term = list0_frm.len();
    for i in 0..dpb.len() {
      if dpb[i].long_term {
        list0_frm.push(i as u8);
      }
    }
    list0_frm[first_long_term..].sort_by(|&a, &b| {
      long_term_pic_num(&dpb, a).cmp(&long_term_pic_num(&dpb, b))
    });
  } else if ty.is_b() {
    // 8.2.4.2.3-4: L0 descending POC before the current picture, L1
    // ascending POC after it, then each list padded by the other's
    // entries, then long-term references
    for i in 0..dpb.len() {
      if !dpb[i].long_term {
        if dpb[i].poc.top <= cur_poc {
          list0_frm.push(i as u8);
        } else {
          list1_frm.push(i as u8);
        }
      }
    }
    list0_frm.sort_by(|&a, &b| {
      poc_of_entry(&dpb, b).cmp(&poc_of_entry(&dpb, a))
    });
    list1_frm.sort_by(|&a, &b| {
      poc_of_entry(&dpb, a).cmp(&poc_of_entry(&dpb, b))
    });

    let l0 = list0_frm.len();
    let l1 = list1_frm.len();
    for i in 0..l1 {
      list0_frm.push(list1_frm[i]);
    }
    for i in 0..l0 {
      list1_frm.push(list0_frm[i]);
    }

    let first_lt_l0 = list0_frm.len();
    let first_lt_l1 = list1_frm.len();
    for i in 0..dpb.len() {
      if dpb[i].long_term {
        list0_frm.push(i as u8);
        list1_frm.push(i as u8);
      }
    }
    list0_frm[first_lt_l0..].sort_by(|&a, &b| {
      long_term_pic_num(&dpb, a).cmp(&long_term_pic_num(&dpb, b))
    });
    list1_frm[first_lt_l1..].sort_by(|&a, &b| {
      long_term_pic_num(&dpb, a).cmp(&long_term_pic_num(&dpb, b))
    });
  }

  let list0 = &mut task.list0[field];
  let list1 = &mut task.list1[field];

  if !task.field_pic {
    *list0 = list0_frm;
    *list1 = list1_frm;
  } else {
    process_fields(field, &dpb, &list0_frm, list0);
    process_fields(field, &dpb, &list1_frm, list1);
  }

  // "When the reference picture list RefPicList1 has more than one entry
  //  and RefPicList1 is identical to the reference picture list
  //  RefPicList0, the first two entries RefPicList1[0] and RefPicList1[1]
  //  are switched."
  if list1.len() > 1 && list0 == list1 {
    list1.swap(0, 1);
  }

  task.init_size_list0[field] = list0.len() as u32;
  task.init_size_list1[field] = list1.len() as u32;
}

fn find_by_frame_order(
  list: &[u8], dpb: &Dpb, frame_order: u32,
) -> Option<usize> {
  list
    .iter()
    .position(|&r| dpb[entry_index(r)].frame_order == frame_order)
}

// Move the application's preferred references to the front (in the order
// given) and drop the rejected ones, then clamp the list length.
fn reorder_ref_pic_list(
  list: &mut RefList, dpb: &Dpb, ctrl: &RefListCtrl, num_active: usize,
) {
  let mut begin = 0;
  for &fo in &ctrl.preferred {
    if let Some(pos) = find_by_frame_order(&list[begin..], dpb, fo) {
      let r = list.remove(begin + pos);
      list.insert(begin, r);
      begin += 1;
    }
  }
  for &fo in &ctrl.rejected {
    if let Some(pos) = find_by_frame_order(&list[begin..], dpb, fo) {
      list.remove(begin + pos);
    }
  }
  if num_active > 0 && list.len() > num_active {
    list.truncate(num_active);
  }
}

fn idx_of_first_same_parity(list: &RefList, field: usize) -> Option<usize> {
  list.iter().position(|&r| entry_parity(r) == field)
}

/// Applies application control and internal constraints on top of the
/// initial lists, then derives the modification command lists.
pub fn modify_ref_pic_lists(
  cfg: &EncoderConfig, task: &mut DdiTask, field: usize,
) {
  let dpb = task.dpb[field].clone();
  let cur_poc = task.poc(field);
  let ty = task.ty[field];
  let is_field = task.field_pic;
  let init_list0 = task.list0[field].clone();
  let init_list1 = task.list1[field].clone();

  {
    let list0 = &mut task.list0[field];
    let list1 = &mut task.list1[field];

    if cfg.gop.closed || task.frame_order_i < task.frame_order {
      // remove references displayed before the most recent I frame: always
      // for closed GOPs, and for frames following that I in display order
      // when the GOP is open
      let first_intra_poc =
        2 * (task.frame_order_i.wrapping_sub(task.frame_order_idr)) as i32;
      list0.retain(|&mut r| {
        dpb[entry_index(r)].long_term
          || poc_of_entry(&dpb, r) >= first_intra_poc
      });
      list1.retain(|&mut r| {
        dpb[entry_index(r)].long_term
          || poc_of_entry(&dpb, r) >= first_intra_poc
      });
    }

    // drivers accept a single backward reference for progressive B frames
    let max_active_l1 = if is_field { 2 } else { 1 };

    let ctrl = task.ctrl.ref_list_ctrl.clone();
    if let Some(ctrl) = ctrl {
      let num_active_l0 = ctrl.num_active_l0 as usize;
      let num_active_l1 =
        (ctrl.num_active_l1 as usize).min(max_active_l1);
      let backup0 = list0.clone();

      if ty.intersects(FrameType::P) || ty.is_b() {
        reorder_ref_pic_list(list0, &dpb, &ctrl, num_active_l0);
      }
      if ty.is_b() {
        reorder_ref_pic_list(list1, &dpb, &ctrl, num_active_l1);
      }
      if !cfg.temporal_scales.is_empty() {
        let tid = task.temporal_id;
        list0.retain(|&mut r| dpb[entry_index(r)].temporal_id <= tid);
      }
      if !backup0.is_empty() && list0.is_empty() {
        // an empty L0 cannot be encoded, discard the customization
        *list0 = backup0;
      }
    } else {
      if ty.is_b() {
        // cut forward references from L1 and backward references from L0
        let backup0 = list0.clone();
        let backup1 = list1.clone();

        list0.retain(|&mut r| poc_of_entry(&dpb, r) <= cur_poc);
        list1.retain(|&mut r| poc_of_entry(&dpb, r) >= cur_poc);

        if list0.is_empty() {
          list0.push(backup0[0]);
        }
        if list1.is_empty() {
          list1.push(backup1[0]);
        }

        // a field's first list entry must have the same parity; revert the
        // cut if it removed every same-parity entry
        if is_field && idx_of_first_same_parity(list0, field).is_none() {
          *list0 = backup0;
        }
        if is_field && idx_of_first_same_parity(list1, field).is_none() {
          *list1 = backup1;
        }
      }

      if !cfg.temporal_scales.is_empty() {
        let tid = task.temporal_id;
        list0.retain(|&mut r| dpb[entry_index(r)].temporal_id <= tid);
        list1.retain(|&mut r| dpb[entry_index(r)].temporal_id <= tid);
        list0.sort_by(|&a, &b| {
          poc_of_entry(&dpb, b).cmp(&poc_of_entry(&dpb, a))
        });
        list1.sort_by(|&a, &b| {
          poc_of_entry(&dpb, a).cmp(&poc_of_entry(&dpb, b))
        });
      } else if cfg.gop.b_pyramid && ty.intersects(FrameType::P) {
        if !is_field {
          list0.sort_by(|&a, &b| {
            poc_of_entry(&dpb, b).cmp(&poc_of_entry(&dpb, a))
          });
        } else {
          // POC descending separately within each parity
          for l in 0..list0.len() {
            for r in (l + 1)..list0.len() {
              if entry_parity(list0[l]) == entry_parity(list0[r])
                && poc_of_entry(&dpb, list0[r]) > poc_of_entry(&dpb, list0[l])
              {
                list0.swap(l, r);
              }
            }
          }
        }
      }

      if ty.is_b() && list1.len() > max_active_l1 {
        list1.truncate(max_active_l1);
      }
    }
  }

  let cur_pic_num = task.pic_num[field];
  let mut init0 = init_list0;
  let mut init1 = init_list1;
  init0.truncate(task.list0[field].len());
  init1.truncate(task.list1[field].len());

  task.ref_list_mod0[field] =
    create_ref_list_mod(&dpb, init0, &task.list0[field], cur_pic_num, true);
  task.ref_list_mod1[field] =
    create_ref_list_mod(&dpb, init1, &task.list1[field], cur_pic_num, true);
}

// Insert `target` at `ref_idx` and drop the first later entry that refers
// to the same picture, keeping the list length unchanged. This mirrors the
// standard's modification process (8.2.4.3): the moved picture is removed
// from its old position.
fn shift_insert(
  list: &mut RefList, ref_idx: usize, target: u8, keep: impl Fn(u8) -> bool,
) {
  list.insert(ref_idx, target);
  let mut n = ref_idx + 1;
  for c in (ref_idx + 1)..list.len() {
    if keep(list[c]) {
      let v = list[c];
      list[n] = v;
      n += 1;
    }
  }
  list.truncate(n);
}

/// Reduces the difference between an initial list and the modified list to
/// ref_pic_list_modification commands. With `optimize` set the result is
/// empty whenever the lists already match, the no-op case the slice header
/// encodes with a single flag.
pub fn create_ref_list_mod(
  dpb: &Dpb, mut init_list: RefList, mod_list: &RefList, cur_pic_num: i32,
  optimize: bool,
) -> RefListModList {
  debug_assert_eq!(init_list.len(), mod_list.len());

  let mut mods = RefListModList::new();
  let mut pic_num_pred = cur_pic_num;

  for ref_idx in 0..mod_list.len() {
    if optimize && init_list.as_slice() == mod_list.as_slice() {
      return mods;
    }

    let target = mod_list[ref_idx];
    if dpb[entry_index(target)].long_term {
      let ltpn = long_term_pic_num(dpb, target);
      mods.push(RefListMod::LongTerm(ltpn as u16));
      shift_insert(&mut init_list, ref_idx, target, |e| {
        long_term_pic_num_f(dpb, e) != ltpn as u32
      });
    } else {
      let pn = pic_num(dpb, target);
      if pn > pic_num_pred {
        mods.push(RefListMod::ShortTermAdd((pn - pic_num_pred - 1) as u16));
      } else if pn < pic_num_pred {
        mods.push(RefListMod::ShortTermSub((pic_num_pred - pn - 1) as u16));
      } else {
        debug_assert!(false, "can't reorder ref list");
        break;
      }
      shift_insert(&mut init_list, ref_idx, target, |e| {
        pic_num_f(dpb, e) != pn
      });
      pic_num_pred = pn;
    }
    init_list.truncate(mod_list.len());
  }

  mods
}

fn init_new_dpb_frame(task: &DdiTask, fid: usize) -> DpbFrame {
  let mut r = DpbFrame {
    poc: FieldPair::new(task.poc(0), task.poc(1)),
    frame_order: task.frame_order,
    frame_num: task.frame_num,
    frame_num_wrap: task.frame_num as i32,
    pic_num: task.pic_num,
    long_term_pic_num: task.long_term_pic_num,
    long_term_idx_plus1: task.long_term_frame_idx.wrapping_add(1),
    long_term: task.long_term_frame_idx != NO_INDEX_U8,
    key_ref: task.key_reference,
    temporal_id: task.temporal_id,
    recon_idx: task.idx_recon,
    ref_pic_flag: FieldPair::new(
      task.ty.top.is_ref(),
      task.ty.bot.is_ref(),
    ),
  };
  if task.field_pic {
    // only the field being marked is a reference yet
    r.ref_pic_flag[1 - fid] = false;
  }
  r
}

fn set_max_long_term_idx(
  dpb: &mut Dpb, from_tidx: usize, val: u8,
) {
  for v in dpb.max_long_term_idx_plus1[from_tidx..].iter_mut() {
    *v = val;
  }
}

/// Predicts the DPB state after this field is encoded and emits the MMCO
/// commands that realize it (sliding window where possible, adaptive
/// marking where required).
pub fn mark_decoded_ref_pictures(
  cfg: &EncoderConfig, task: &mut DdiTask, fid: usize,
) {
  let init_dpb = task.dpb[fid].clone();
  let mut curr = init_dpb.clone();
  let mut marking = RefPicMarking::default();
  let ty = task.ty[fid];
  let num_ref_frame = cfg.num_ref_frame as usize;

  if !ty.is_ref() {
    // non-reference frames don't change the dpb
    store_marking_result(task, fid, curr, marking);
    return;
  }

  let ctrl = task.ctrl.ref_list_ctrl.clone();

  if ty.is_idr() {
    curr.clear();
    set_max_long_term_idx(&mut curr, 0, 0);
    marking.long_term_reference = false;

    if let Some(ctrl) = &ctrl {
      if ctrl.long_term.contains(&task.frame_order) {
        marking.long_term_reference = true;
        task.long_term_frame_idx = 0;
      }
    }

    curr.push(init_new_dpb_frame(task, fid));
    set_max_long_term_idx(&mut curr, 0, marking.long_term_reference as u8);
  } else {
    let ffid = task.first_field();
    let mut curr_frame_added =
      fid != ffid && task.ty[ffid].is_ref();

    // long-term frame indices in use
    let mut used_lt_idx = [false; MAX_DPB_SIZE];
    for f in init_dpb.iter() {
      if f.long_term_idx_plus1 > 0 {
        used_lt_idx[f.long_term_idx_plus1 as usize - 1] = true;
      }
    }

    if let Some(ctrl) = &ctrl {
      for &fo in &ctrl.rejected {
        if let Some(pos) = curr.iter().position(|f| f.frame_order == fo) {
          let r = curr[pos];
          if r.long_term {
            debug_assert!(!task.field_pic);
            marking
              .mmco
              .push(Mmco::LongTermToUnused(r.long_term_pic_num.top as u32));
            used_lt_idx[r.long_term_idx_plus1 as usize - 1] = false;
          } else {
            marking.mmco.push(Mmco::ShortTermToUnused(
              (task.pic_num[fid] - r.pic_num.top - 1) as u32,
            ));
            if task.field_pic {
              // the second field leaves the dpb as well
              marking.mmco.push(Mmco::ShortTermToUnused(
                (task.pic_num[fid] - r.pic_num.bot - 1) as u32,
              ));
            }
          }
          curr.remove(pos);
        }
      }

      for &fo in &ctrl.long_term {
        let pos = curr.iter().position(|f| f.frame_order == fo);
        if let Some(pos) = pos {
          if !curr[pos].long_term && cfg.temporal_scales.is_empty() {
            debug_assert!(!task.field_pic);
            // promote a short-term entry in place
            let lt_idx =
              used_lt_idx.iter().position(|&u| !u).unwrap_or(MAX_DPB_SIZE);
            debug_assert!(lt_idx < MAX_DPB_SIZE);
            if lt_idx >= MAX_DPB_SIZE {
              break;
            }
            let lt_idx8 = lt_idx as u8;
            if lt_idx8 >= curr.max_long_term_idx_plus1[task.temporal_idx as usize]
            {
              marking.mmco.push(Mmco::SetMaxLongTermIdx(lt_idx as u32 + 1));
              set_max_long_term_idx(
                &mut curr,
                task.temporal_idx as usize,
                lt_idx8 + 1,
              );
            }
            marking.mmco.push(Mmco::ShortTermToLongTerm(
              (task.pic_num[fid] - curr[pos].pic_num.top - 1) as u32,
              lt_idx as u32,
            ));
            used_lt_idx[lt_idx] = true;
            curr[pos].long_term_idx_plus1 = lt_idx8 + 1;
            curr[pos].long_term = true;
            curr[pos].long_term_pic_num = FieldPair::same(lt_idx8);
          }
        } else if fo == task.frame_order {
          // the current frame itself becomes long-term

          // make room first if the dpb is full
          if curr.len() == num_ref_frame {
            let victim_pos = min_position(&curr, order_by_frame_num_wrap);
            let Some(mut victim_pos) = victim_pos else { break };
            if curr[victim_pos].long_term {
              // no short-term entry left, drop the oldest long-term
              victim_pos =
                min_position(&curr, order_by_display_order).unwrap();
              debug_assert!(curr[victim_pos].long_term);
              marking.mmco.push(Mmco::LongTermToUnused(
                curr[victim_pos].long_term_pic_num.top as u32,
              ));
              used_lt_idx
                [curr[victim_pos].long_term_idx_plus1 as usize - 1] = false;
            } else {
              marking.mmco.push(Mmco::ShortTermToUnused(
                (task.pic_num[fid] - curr[victim_pos].pic_num.top - 1) as u32,
              ));
            }
            curr.remove(victim_pos);
          }

          let lt_idx =
            used_lt_idx.iter().position(|&u| !u).unwrap_or(MAX_DPB_SIZE);
          debug_assert!(lt_idx < MAX_DPB_SIZE);
          if lt_idx >= MAX_DPB_SIZE {
            break;
          }
          let lt_idx8 = lt_idx as u8;
          if lt_idx8 >= curr.max_long_term_idx_plus1[task.temporal_idx as usize]
          {
            marking.mmco.push(Mmco::SetMaxLongTermIdx(lt_idx as u32 + 1));
            set_max_long_term_idx(
              &mut curr,
              task.temporal_idx as usize,
              lt_idx8 + 1,
            );
          }
          marking.mmco.push(Mmco::CurrentToLongTerm(lt_idx as u32));
          used_lt_idx[lt_idx] = true;
          task.long_term_frame_idx = lt_idx8;
          task.long_term_pic_num = FieldPair::same(lt_idx8);

          curr.push(init_new_dpb_frame(task, fid));
          debug_assert!(curr.len() <= num_ref_frame);
          curr_frame_added = true;
        }
      }
    }

    if !curr_frame_added {
      if curr.len() == num_ref_frame {
        let default_victim =
          min_position(&curr, order_by_frame_num_wrap).unwrap();
        let mut victim_pos = if cfg.gop.b_pyramid {
          min_position(&curr, order_by_display_order_key_ref).unwrap()
        } else {
          min_position(&curr, order_by_frame_num_wrap_key_ref).unwrap()
        };

        if curr[victim_pos].long_term {
          // no short-term entry left, drop the oldest long-term
          victim_pos = min_position(&curr, order_by_display_order).unwrap();
          debug_assert!(curr[victim_pos].long_term);
          marking.mmco.push(Mmco::LongTermToUnused(
            curr[victim_pos].long_term_pic_num.top as u32,
          ));
        } else if !marking.mmco.is_empty() || victim_pos != default_victim {
          // adaptive marking is already in effect, so the sliding window
          // will not run; remove the victim explicitly
          marking.mmco.push(Mmco::ShortTermToUnused(
            (task.pic_num[fid] - curr[victim_pos].pic_num.top - 1) as u32,
          ));
          if task.field_pic {
            marking.mmco.push(Mmco::ShortTermToUnused(
              (task.pic_num[fid] - curr[victim_pos].pic_num.bot - 1) as u32,
            ));
          }
        }
        curr.remove(victim_pos);
      }

      curr.push(init_new_dpb_frame(task, fid));
      debug_assert!(curr.len() <= num_ref_frame);
    }
  }

  store_marking_result(task, fid, curr, marking);
}

fn store_marking_result(
  task: &mut DdiTask, fid: usize, curr: Dpb, marking: RefPicMarking,
) {
  task.marking[fid] = marking;
  if fid == task.fid(1) {
    task.dpb_post_encoding = curr;
  } else {
    task.dpb[1 - fid] = curr;
  }
}

fn min_position(
  dpb: &Dpb, cmp: fn(&DpbFrame, &DpbFrame) -> std::cmp::Ordering,
) -> Option<usize> {
  if dpb.is_empty() {
    return None;
  }
  let mut best = 0;
  for i in 1..dpb.len() {
    if cmp(&dpb[i], &dpb[best]) == std::cmp::Ordering::Less {
      best = i;
    }
  }
  Some(best)
}

/// Internal reference-list control for temporal scalability: reference
/// frames of the lower layers are parked as long-term so that higher-layer
/// frames never evict them through the sliding window.
pub fn create_additional_dpb_commands(cfg: &EncoderConfig, task: &mut DdiTask) {
  if task.ctrl.ref_list_ctrl.is_some() {
    return; // the application's control wins
  }
  let num_layers = cfg.temporal_scales.len();
  let ref_pic =
    task.ty.top.is_ref() || task.ty.bot.is_ref();

  if !ref_pic || num_layers <= 1 || (task.temporal_idx as usize + 1) == num_layers
  {
    return;
  }

  let dpb = &task.dpb[0];
  let mut ctrl = RefListCtrl::default();

  // oldest reference of the same layer makes room for the new one
  let mut to_remove = dpb
    .iter()
    .filter(|f| f.temporal_id == task.temporal_id)
    .min_by_key(|f| f.frame_order);
  if to_remove.is_none() && dpb.len() == cfg.num_ref_frame as usize {
    // nothing from the same layer, free a slot from the highest layer
    to_remove = dpb
      .iter()
      .filter(|f| f.temporal_id as usize == num_layers - 1)
      .min_by_key(|f| f.frame_order);
  }

  if cfg.gop.ref_dist > 1
    && task.temporal_idx == 0
    && dpb.iter().filter(|f| f.temporal_id == 0).count() < 2
    && dpb.len() < cfg.num_ref_frame as usize
  {
    // keep two base-layer references alive for the B frames above
    to_remove = None;
  }

  if let Some(r) = to_remove {
    ctrl.rejected.push(r.frame_order);
  }
  ctrl.long_term.push(task.frame_order);
  task.ctrl.ref_list_ctrl = Some(ctrl);
  task.internal_list_ctrl = true;
}
