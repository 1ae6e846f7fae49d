// Copyright (c) 2019-2022, The rh264e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause

//! The task manager: converts a stream of input surfaces in display order
//! into fully configured hardware tasks in encoding order.
//!
//! All pools (tasks, reconstructed pictures, raw copies, bitstream
//! buffers) live behind one exclusive lock; the entry points never block,
//! resource exhaustion is reported as a transient status instead.

use std::sync::Mutex;

use arrayvec::ArrayVec;
use log::debug;

use crate::api::{
  EncoderConfig, EncoderStatus, FrameType, PicStruct, RateControlMethod,
};
use crate::dpb::{
  count_future_refs, Dpb, RefList, RefListModList, RefPicMarking,
  RefPicMarkingRepeat, NO_INDEX, NO_INDEX_U8,
};
use crate::gop::{temporal_layer_index, BiFrameLocation, FrameTypeGenerator};
use crate::reflist::{
  create_additional_dpb_commands, init_ref_pic_list, mark_decoded_ref_pictures,
  modify_ref_pic_lists, update_dpb_frames,
};
use crate::stats::EncodeStats;
use crate::util::FieldPair;

/// Opaque handle of an application input surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceHandle(pub u32);

/// Opaque handle of an application bitstream buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitstreamHandle(pub u32);

/// Application reference-list control attached to one frame.
#[derive(Clone, Debug, Default)]
pub struct RefListCtrl {
  /// Frame orders to move to the front of list 0/1, most preferred first.
  pub preferred: ArrayVec<u32, 32>,
  /// Frame orders to drop from the reference lists and the DPB.
  pub rejected: ArrayVec<u32, 16>,
  /// Frame orders to promote to long-term (the current frame order marks
  /// the frame itself long-term).
  pub long_term: ArrayVec<u32, 16>,
  /// Override of the active reference count in list 0 (0 keeps default).
  pub num_active_l0: u8,
  /// Override of the active reference count in list 1 (0 keeps default).
  pub num_active_l1: u8,
}

/// Per-frame encode controls supplied by the application.
#[derive(Clone, Debug, Default)]
pub struct EncodeCtrl {
  /// Forced frame type (e.g. an IDR request); None lets the GOP pattern
  /// decide.
  pub frame_type: Option<FrameType>,
  /// Forced quantizer for this frame.
  pub qp: Option<u8>,
  /// Reference list control.
  pub ref_list_ctrl: Option<RefListCtrl>,
  /// Protect this reference from sliding-window eviction.
  pub key_reference: bool,
  /// Scene change reported by the analysis stage.
  pub scene_change: bool,
}

/// Hardware execution result for a completed task.
#[derive(Clone, Debug, Default)]
pub struct HwFeedback {
  /// Coded bytes per field.
  pub bs_data_length: FieldPair<u32>,
  /// Leading filler bytes the hardware may prepend, per field.
  pub num_leading_ff: FieldPair<u32>,
  /// Quantizer the hardware reports having used, per field.
  pub qp: FieldPair<u8>,
  /// Mean absolute difference reported per field.
  pub mad: FieldPair<u32>,
  /// Whether execution succeeded.
  pub success: bool,
}

/// Stable reference to a pooled task. Valid only while the slot's
/// generation matches, so a recycled slot invalidates old ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskId {
  idx: u16,
  gen: u32,
}

/// One unit of hardware work: a frame, or two fields of one frame.
#[derive(Clone, Debug)]
pub struct DdiTask {
  // ordering
  pub frame_order: u32,
  pub enc_order: u32,
  /// Display order of the most recent IDR, POC base.
  pub frame_order_idr: u32,
  /// Display order of the most recent I frame.
  pub frame_order_i: u32,
  pub enc_order_idr: u32,
  pub enc_order_i: u32,
  pub ty: FieldPair<FrameType>,
  pub loc: BiFrameLocation,
  pub pic_struct: PicStruct,
  pub field_pic: bool,

  // numbering
  pub frame_num: u16,
  pub pic_num: FieldPair<i32>,
  pub idr_pic_id: u16,
  pub long_term_frame_idx: u8,
  pub long_term_pic_num: FieldPair<u8>,
  pub temporal_id: u8,
  pub temporal_idx: u8,
  pub key_reference: bool,

  // hrd / sei timing
  pub cpb_removal: FieldPair<u32>,
  pub dpb_output_delay: u32,
  pub init_cpb_removal: u32,
  pub init_cpb_removal_offset: u32,

  // references
  pub dpb: FieldPair<Dpb>,
  pub dpb_post_encoding: Dpb,
  pub list0: FieldPair<RefList>,
  pub list1: FieldPair<RefList>,
  pub init_size_list0: FieldPair<u32>,
  pub init_size_list1: FieldPair<u32>,
  pub ref_list_mod0: FieldPair<RefListModList>,
  pub ref_list_mod1: FieldPair<RefListModList>,
  pub marking: FieldPair<RefPicMarking>,
  pub marking_repeat: FieldPair<RefPicMarkingRepeat>,
  pub reference: FieldPair<bool>,
  pub nal_ref_idc: FieldPair<u8>,
  pub internal_list_ctrl: bool,

  // application data
  pub ctrl: EncodeCtrl,
  pub surface: Option<SurfaceHandle>,
  pub bitstream: Option<BitstreamHandle>,

  // pool slots
  pub idx_raw: u32,
  pub idx_recon: u32,
  pub idx_bs: FieldPair<u32>,

  // rate control
  pub cqp_value: FieldPair<u8>,
  pub min_qp: u8,
  pub max_qp: u8,
  pub repack: u32,
  pub min_frame_size: u32,

  // hardware feedback
  pub bs_data_length: FieldPair<u32>,
  pub num_leading_ff: FieldPair<u32>,
  pub qp_reported: FieldPair<u8>,
  pub mad: FieldPair<u32>,
}

impl Default for DdiTask {
  fn default() -> Self {
    DdiTask {
      frame_order: 0,
      enc_order: u32::MAX,
      frame_order_idr: 0,
      frame_order_i: 0,
      enc_order_idr: 0,
      enc_order_i: 0,
      ty: FieldPair::same(FrameType::UNKNOWN),
      loc: BiFrameLocation::default(),
      pic_struct: PicStruct::Progressive,
      field_pic: false,
      frame_num: 0,
      pic_num: FieldPair::same(0),
      idr_pic_id: u16::MAX,
      long_term_frame_idx: NO_INDEX_U8,
      long_term_pic_num: FieldPair::same(NO_INDEX_U8),
      temporal_id: 0,
      temporal_idx: 0,
      key_reference: false,
      cpb_removal: FieldPair::same(0),
      dpb_output_delay: 0,
      init_cpb_removal: 0,
      init_cpb_removal_offset: 0,
      dpb: FieldPair::new(Dpb::default(), Dpb::default()),
      dpb_post_encoding: Dpb::default(),
      list0: FieldPair::new(RefList::new(), RefList::new()),
      list1: FieldPair::new(RefList::new(), RefList::new()),
      init_size_list0: FieldPair::same(0),
      init_size_list1: FieldPair::same(0),
      ref_list_mod0: FieldPair::new(RefListModList::new(), RefListModList::new()),
      ref_list_mod1: FieldPair::new(RefListModList::new(), RefListModList::new()),
      marking: FieldPair::new(RefPicMarking::default(), RefPicMarking::default()),
      marking_repeat: FieldPair::new(
        RefPicMarkingRepeat::default(),
        RefPicMarkingRepeat::default(),
      ),
      reference: FieldPair::same(false),
      nal_ref_idc: FieldPair::same(0),
      internal_list_ctrl: false,
      ctrl: EncodeCtrl::default(),
      surface: None,
      bitstream: None,
      idx_raw: NO_INDEX,
      idx_recon: NO_INDEX,
      idx_bs: FieldPair::same(NO_INDEX),
      cqp_value: FieldPair::same(0),
      min_qp: 0,
      max_qp: 0,
      repack: 0,
      min_frame_size: 0,
      bs_data_length: FieldPair::same(0),
      num_leading_ff: FieldPair::same(0),
      qp_reported: FieldPair::same(0),
      mad: FieldPair::same(0),
    }
  }
}

impl DdiTask {
  /// Parity of the field coded first.
  #[inline]
  pub fn first_field(&self) -> usize {
    (self.pic_struct == PicStruct::FieldBff) as usize
  }

  /// Parity of the field coded in position `order` (0 or 1).
  #[inline]
  pub fn fid(&self, order: usize) -> usize {
    if self.field_pic {
      self.first_field() ^ order
    } else {
      0
    }
  }

  /// Frame type of the field coded first.
  #[inline]
  pub fn frame_type(&self) -> FrameType {
    self.ty[self.first_field()]
  }

  /// Picture order count of one field.
  #[inline]
  pub fn poc(&self, parity: usize) -> i32 {
    (2 * (self.frame_order.wrapping_sub(self.frame_order_idr) & 0x7fff_ffff))
      as i32
      + (parity != self.first_field()) as i32
  }

  /// Number of coded pictures in this task (1 frame or 2 fields).
  #[inline]
  pub fn picture_count(&self) -> usize {
    if self.field_pic {
      2
    } else {
      1
    }
  }
}

// A pool of identical slots addressed by index. Slots have no content
// here; the indices parameterize externally allocated memory.
#[derive(Debug)]
struct SlotPool {
  used: Vec<bool>,
}

impl SlotPool {
  fn new(size: usize) -> Self {
    SlotPool { used: vec![false; size] }
  }

  fn acquire(&mut self) -> Option<u32> {
    let idx = self.used.iter().position(|&u| !u)?;
    self.used[idx] = true;
    Some(idx as u32)
  }

  fn release(&mut self, idx: u32) {
    if idx != NO_INDEX {
      debug_assert!(self.used[idx as usize]);
      self.used[idx as usize] = false;
    }
  }
}

/// Pool dimensions of one session.
#[derive(Clone, Copy, Debug)]
pub struct PoolSizes {
  pub tasks: usize,
  pub recon: usize,
  pub raw: usize,
  pub bitstream: usize,
}

impl PoolSizes {
  /// Derives pool sizes sufficient for the configured reordering depth,
  /// lookahead window and asynchronous queue.
  pub fn from_config(cfg: &EncoderConfig) -> Self {
    let depth = cfg.async_depth.max(1) as usize;
    let reorder = cfg.gop.ref_dist.max(1) as usize;
    let lookahead = cfg.rc.lookahead_depth as usize;
    let fields = if cfg.pic_struct.is_field() { 2 } else { 1 };
    PoolSizes {
      tasks: reorder + lookahead + depth + 1,
      recon: cfg.num_ref_frame as usize + depth + 1,
      raw: reorder + lookahead + depth + 1,
      bitstream: depth * fields,
    }
  }
}

struct TaskManagerState {
  tasks: Vec<DdiTask>,
  gens: Vec<u32>,
  free_tasks: Vec<u16>,
  /// Accepted surfaces waiting for a type-resolvable pick, display order.
  reordering: Vec<u16>,
  /// Assigned tasks in flight.
  encoding: Vec<u16>,
  recon: SlotPool,
  raw: SlotPool,
  bitstream: SlotPool,
  ftg: FrameTypeGenerator,
  /// Display order of the next accepted surface.
  frame_order: u32,
  /// Running state as of the last confirmed task.
  last: DdiTask,
  stats: EncodeStats,
}

/// The central task state machine. See the module documentation.
pub struct TaskManager {
  config: EncoderConfig,
  inner: Mutex<TaskManagerState>,
}

impl TaskManager {
  /// Creates a manager with pool sizes derived from the configuration.
  ///
  /// # Errors
  ///
  /// Propagates configuration validation failures as `InvalidParam`.
  pub fn new(config: EncoderConfig) -> Result<Self, EncoderStatus> {
    let pools = PoolSizes::from_config(&config);
    TaskManager::with_pools(config, pools)
  }

  /// Creates a manager with explicit pool sizes.
  pub fn with_pools(
    config: EncoderConfig, pools: PoolSizes,
  ) -> Result<Self, EncoderStatus> {
    config.validate().map_err(|_| EncoderStatus::InvalidParam)?;
    let state = TaskManagerState {
      tasks: (0..pools.tasks).map(|_| DdiTask::default()).collect(),
      gens: vec![0; pools.tasks],
      free_tasks: (0..pools.tasks as u16).rev().collect(),
      reordering: Vec::new(),
      encoding: Vec::new(),
      recon: SlotPool::new(pools.recon),
      raw: SlotPool::new(pools.raw),
      bitstream: SlotPool::new(pools.bitstream),
      ftg: FrameTypeGenerator::new(&config.gop),
      frame_order: 0,
      last: DdiTask::default(),
      stats: EncodeStats::default(),
    };
    Ok(TaskManager { config, inner: Mutex::new(state) })
  }

  /// Accepts an input surface (None flushes) and, if possible, returns the
  /// next task in encoding order with fully resolved references.
  ///
  /// # Errors
  ///
  /// - `DeviceBusy` when a pool is exhausted; retry after a completion.
  /// - `NeedMoreData` when no buffered frame is encodable yet.
  /// - `InvalidParam` for contradictory per-frame control.
  pub fn assign_task(
    &self, ctrl: EncodeCtrl, surface: Option<SurfaceHandle>,
    bitstream: Option<BitstreamHandle>,
  ) -> Result<TaskId, EncoderStatus> {
    let state = &mut *self.inner.lock().unwrap();

    if let Some(ty) = ctrl.frame_type {
      let base =
        ty.intersects(FrameType::I) as u8
          + ty.intersects(FrameType::P) as u8
          + ty.is_b() as u8;
      if base != 1 || (ty.is_idr() && !ty.is_intra()) {
        return Err(EncoderStatus::InvalidParam);
      }
    }

    if let Some(surface) = surface {
      self.accept_surface(state, ctrl, surface, bitstream)?;
    }

    let flush = surface.is_none();
    let pos = self.reorder(state, flush).ok_or(EncoderStatus::NeedMoreData)?;

    self.start_task(state, pos)
  }

  fn accept_surface(
    &self, state: &mut TaskManagerState, ctrl: EncodeCtrl,
    surface: SurfaceHandle, bitstream: Option<BitstreamHandle>,
  ) -> Result<(), EncoderStatus> {
    // a retry after DeviceBusy arrives with the same surface; the frame
    // is already buffered, don't accept it twice
    if state
      .reordering
      .iter()
      .any(|&i| state.tasks[i as usize].surface == Some(surface))
    {
      return Ok(());
    }

    let Some(idx) = state.free_tasks.pop() else {
      return Err(EncoderStatus::DeviceBusy);
    };
    let Some(idx_raw) = state.raw.acquire() else {
      state.free_tasks.push(idx);
      return Err(EncoderStatus::DeviceBusy);
    };

    let mut ty = match ctrl.frame_type {
      Some(forced) => crate::api::extend_frame_type(forced),
      None => state.ftg.get(),
    };
    let loc = state.ftg.bi_frame_location();
    if loc.ref_frame {
      // a pyramid B serves as reference for its mini-gop neighbours
      ty.top |= FrameType::REF;
      ty.bot |= FrameType::REF;
    }
    if !self.config.pic_struct.is_field() {
      ty.bot = ty.top;
    }

    let task = &mut state.tasks[idx as usize];
    *task = DdiTask {
      frame_order: state.frame_order,
      ty,
      loc,
      pic_struct: self.config.pic_struct,
      field_pic: self.config.pic_struct.is_field(),
      key_reference: ctrl.key_reference,
      ctrl,
      surface: Some(surface),
      bitstream,
      idx_raw,
      ..DdiTask::default()
    };

    debug!(
      "accept frame {} type {:?}",
      state.frame_order, task.frame_type()
    );

    state.ftg.next();
    state.frame_order = state.frame_order.wrapping_add(1);
    state.reordering.push(idx);
    state.stats.num_cached_frame = state.reordering.len() as u32;
    Ok(())
  }

  // Chooses the next frame to encode out of the display-order buffer:
  // the earliest non-B frame, or the earliest B frame that already has a
  // backward reference. Under flush the trailing B is promoted to P so
  // the buffer can drain.
  fn reorder(
    &self, state: &mut TaskManagerState, flush: bool,
  ) -> Option<usize> {
    if self.config.encoded_order {
      return if state.reordering.is_empty() { None } else { Some(0) };
    }

    let strict = self.config.gop.strict;
    let dpb = &state.last.dpb_post_encoding;

    let mut top = None;
    for (pos, &idx) in state.reordering.iter().enumerate() {
      let t = &state.tasks[idx as usize];
      if !t.frame_type().is_b()
        || count_future_refs(dpb, t.frame_order) > 0
      {
        top = Some(pos);
        break;
      }
    }

    if let Some(pos) = top {
      let idx = state.reordering[pos];
      if state.tasks[idx as usize].frame_type().is_b() {
        // B pyramid: of the remaining B frames of this mini-gop, the one
        // with the lowest encoding order goes first
        let mini_gop = state.tasks[idx as usize].loc.mini_gop_count;
        let mut best = pos;
        for (p, &i) in state.reordering.iter().enumerate().skip(pos + 1) {
          let t = &state.tasks[i as usize];
          if !t.frame_type().is_b() || t.loc.mini_gop_count != mini_gop {
            break;
          }
          if state.tasks[state.reordering[best] as usize].loc.encoding_order
            > t.loc.encoding_order
          {
            best = p;
          }
        }
        return Some(best);
      }

      // a forced IDR cuts the mini-gop short: the B frame right before it
      // has lost its backward reference, encode it as P now
      if pos > 0
        && state.tasks[idx as usize].ctrl.frame_type.map_or(false, |t| t.is_idr())
        && !strict
      {
        let prev_idx = state.reordering[pos - 1];
        let prev = &mut state.tasks[prev_idx as usize];
        if prev.frame_type().is_b() {
          prev.ty = FieldPair::same(FrameType::P | FrameType::REF);
          return Some(pos - 1);
        }
      }
      return Some(pos);
    }

    if flush && !state.reordering.is_empty() {
      if strict {
        return Some(0);
      }
      // promote the last buffered B to P and retry
      let last_idx = *state.reordering.last().unwrap();
      let t = &mut state.tasks[last_idx as usize];
      debug_assert!(t.frame_type().is_b());
      t.ty = FieldPair::same(FrameType::P | FrameType::REF);
      return self.reorder(state, flush);
    }

    None
  }

  fn start_task(
    &self, state: &mut TaskManagerState, pos: usize,
  ) -> Result<TaskId, EncoderStatus> {
    let idx = state.reordering[pos];

    // reserve output resources before any task state is touched
    let Some(idx_recon) = state.recon.acquire() else {
      return Err(EncoderStatus::DeviceBusy);
    };
    let fields = if self.config.pic_struct.is_field() { 2 } else { 1 };
    let mut idx_bs = FieldPair::same(NO_INDEX);
    for f in 0..fields {
      match state.bitstream.acquire() {
        Some(b) => idx_bs[f] = b,
        None => {
          state.recon.release(idx_recon);
          state.bitstream.release(idx_bs[0]);
          return Err(EncoderStatus::DeviceBusy);
        }
      }
    }

    let mut task = std::mem::take(&mut state.tasks[idx as usize]);
    task.idx_recon = idx_recon;
    task.idx_bs = idx_bs;
    configure_task(&self.config, &mut task, &state.last);
    state.tasks[idx as usize] = task;

    state.reordering.remove(pos);
    state.encoding.push(idx);
    state.stats.num_cached_frame = state.reordering.len() as u32;

    let t = &state.tasks[idx as usize];
    debug!(
      "assign frame {} enc order {} type {:?} l0 {} l1 {}",
      t.frame_order,
      t.enc_order,
      t.frame_type(),
      t.list0.top.len(),
      t.list1.top.len()
    );

    Ok(TaskId { idx, gen: state.gens[idx as usize] })
  }

  fn check_id(
    state: &TaskManagerState, id: TaskId,
  ) -> Result<usize, EncoderStatus> {
    let idx = id.idx as usize;
    if idx >= state.tasks.len()
      || state.gens[idx] != id.gen
      || !state.encoding.contains(&id.idx)
    {
      return Err(EncoderStatus::InvalidParam);
    }
    Ok(idx)
  }

  /// Shared read access to an assigned task, for hardware submission.
  pub fn with_task<R>(
    &self, id: TaskId, f: impl FnOnce(&DdiTask) -> R,
  ) -> Result<R, EncoderStatus> {
    let state = self.inner.lock().unwrap();
    let idx = Self::check_id(&state, id)?;
    Ok(f(&state.tasks[idx]))
  }

  /// Commits the task's provisional state as the manager's running state.
  /// Call once the task is definitely going to be submitted.
  pub fn confirm_task(&self, id: TaskId) -> Result<(), EncoderStatus> {
    let state = &mut *self.inner.lock().unwrap();
    let idx = Self::check_id(state, id)?;
    state.last = state.tasks[idx].clone();
    Ok(())
  }

  /// Releases everything a finished task held and recycles it. Resources
  /// are released even when the hardware reported a failure; the failure
  /// is then propagated as `DeviceFailed`.
  pub fn complete_task(
    &self, id: TaskId, feedback: &HwFeedback,
  ) -> Result<(), EncoderStatus> {
    let state = &mut *self.inner.lock().unwrap();
    let idx = Self::check_id(state, id)?;

    {
      let task = &mut state.tasks[idx];
      task.bs_data_length = feedback.bs_data_length;
      task.num_leading_ff = feedback.num_leading_ff;
      task.qp_reported = feedback.qp;
      task.mad = feedback.mad;

      state.stats.num_frame += 1;
      state.stats.num_bit += 8
        * (feedback.bs_data_length.top as u64
          + if task.field_pic { feedback.bs_data_length.bot as u64 } else { 0 });
    }

    self.release_task(state, idx);

    if feedback.success {
      Ok(())
    } else {
      Err(EncoderStatus::DeviceFailed)
    }
  }

  /// Rolls back a task that was assigned but will never be confirmed,
  /// freeing its tentative reservations.
  pub fn cancel_task(&self, id: TaskId) -> Result<(), EncoderStatus> {
    let state = &mut *self.inner.lock().unwrap();
    let idx = Self::check_id(state, id)?;
    self.release_task(state, idx);
    Ok(())
  }

  fn release_task(&self, state: &mut TaskManagerState, idx: usize) {
    state.encoding.retain(|&i| i as usize != idx);

    let task = std::mem::take(&mut state.tasks[idx]);
    state.raw.release(task.idx_raw);
    state.bitstream.release(task.idx_bs.top);
    if task.field_pic {
      state.bitstream.release(task.idx_bs.bot);
    }

    // a reconstructed picture stays allocated while any live DPB snapshot
    // still references it
    let mut referenced = vec![false; state.recon.used.len()];
    fn mark(referenced: &mut [bool], dpb: &Dpb) {
      for f in dpb.iter() {
        if f.recon_idx != NO_INDEX {
          referenced[f.recon_idx as usize] = true;
        }
      }
    }
    mark(&mut referenced, &state.last.dpb_post_encoding);
    if state.last.idx_recon != NO_INDEX {
      referenced[state.last.idx_recon as usize] = true;
    }
    for &i in &state.encoding {
      let t = &state.tasks[i as usize];
      mark(&mut referenced, &t.dpb.top);
      mark(&mut referenced, &t.dpb.bot);
      mark(&mut referenced, &t.dpb_post_encoding);
      if t.idx_recon != NO_INDEX {
        referenced[t.idx_recon as usize] = true;
      }
    }
    for (i, &r) in referenced.iter().enumerate() {
      if !r && state.recon.used[i] {
        state.recon.release(i as u32);
      }
    }

    state.gens[idx] = state.gens[idx].wrapping_add(1);
    state.free_tasks.push(idx as u16);
  }

  /// Number of tasks currently assigned to the hardware queue.
  pub fn count_running_tasks(&self) -> usize {
    self.inner.lock().unwrap().encoding.len()
  }

  /// Read-only statistics snapshot.
  pub fn stats(&self) -> EncodeStats {
    self.inner.lock().unwrap().stats
  }
}

fn qp_bounds(cfg: &EncoderConfig, ty: FrameType) -> (u8, u8) {
  let i = if ty.is_intra() {
    0
  } else if ty.intersects(FrameType::P) {
    1
  } else {
    2
  };
  let mut min = cfg.rc.min_qp[i];
  let mut max = cfg.rc.max_qp[i];
  if max > 51 {
    max = 0;
  }
  if min > 51 || (max != 0 && min > max) {
    min = 0;
  }
  (min, max)
}

fn cqp_value(cfg: &EncoderConfig, ctrl: &EncodeCtrl, ty: FrameType) -> u8 {
  if let Some(qp) = ctrl.qp {
    return qp.min(51);
  }
  if cfg.rc.method != RateControlMethod::ConstantQp {
    return 0;
  }
  let i = if ty.is_intra() {
    0
  } else if ty.intersects(FrameType::P) {
    1
  } else {
    2
  };
  cfg.rc.constant_qp[i]
}

// Fills in everything derived from the running state of the encoder:
// numbering, timing, temporal layer, reference lists and the predicted
// DPB transition. `prev` is the last confirmed task.
fn configure_task(cfg: &EncoderConfig, task: &mut DdiTask, prev: &DdiTask) {
  let frame_num_max = 1u32 << cfg.log2_max_frame_num;
  let ffid = task.fid(0);
  let sfid = task.fid(1);
  // parity of the other field, for the per-parity pair writes below
  let other = 1 - ffid;
  let prev_sfid = prev.fid(1);

  let idr_pic_flag = task.frame_type().is_idr();
  let intra_pic_flag = task.frame_type().is_intra();
  let prev_idr_frame_flag = prev.frame_type().is_idr();
  let prev_i_frame_flag = prev.frame_type().is_intra();
  let prev_ref_pic_flag = prev.frame_type().is_ref();
  let prev_idr_pic_flag = prev.ty[prev_sfid].is_idr();

  let frame_num_increment =
    (prev_ref_pic_flag || prev.nal_ref_idc.top != 0) as u32;

  task.frame_order_idr =
    if idr_pic_flag { task.frame_order } else { prev.frame_order_idr };
  task.frame_order_i =
    if intra_pic_flag { task.frame_order } else { prev.frame_order_i };
  task.enc_order = prev.enc_order.wrapping_add(1);
  task.enc_order_idr =
    if prev_idr_frame_flag { prev.enc_order } else { prev.enc_order_idr };
  task.enc_order_i =
    if prev_i_frame_flag { prev.enc_order } else { prev.enc_order_i };

  task.frame_num = if idr_pic_flag {
    0
  } else {
    ((prev.frame_num as u32 + frame_num_increment as u32) % frame_num_max)
      as u16
  };
  let field = task.field_pic as i32;
  task.pic_num =
    FieldPair::same(task.frame_num as i32 * (field + 1) + field);

  task.idr_pic_id = prev.idr_pic_id.wrapping_add(idr_pic_flag as u16);

  let num_reorder = cfg.num_reorder_frames();
  task.dpb_output_delay =
    2 * (task.frame_order + num_reorder).wrapping_sub(task.enc_order);
  // a buffering period starts at every IDR; removal delays restart there
  task.cpb_removal[ffid] =
    2 * task.enc_order.wrapping_sub(task.enc_order_idr);
  task.cpb_removal[other] =
    if idr_pic_flag { 1 } else { task.cpb_removal[ffid] + 1 };

  task.temporal_idx = temporal_layer_index(
    cfg,
    task.frame_order.wrapping_sub(task.frame_order_idr),
  );
  task.temporal_id = task.temporal_idx;

  task.reference[ffid] = task.ty[ffid].is_ref();
  task.reference[other] = task.ty[other].is_ref();
  task.nal_ref_idc[ffid] = task.reference[ffid] as u8;
  task.nal_ref_idc[other] = task.reference[other] as u8;

  // repetition of the previous picture's marking for the SEI collaborator
  task.marking_repeat[ffid] = RefPicMarkingRepeat {
    present: prev_idr_pic_flag
      || !prev.marking[prev_sfid].mmco.is_empty(),
    original_idr: prev_idr_pic_flag,
    original_frame_num: prev.frame_num,
    original_field_pic: prev.field_pic,
    original_bottom_field: prev.field_pic && prev_sfid == 1,
    marking: prev.marking[prev_sfid].clone(),
  };

  task.cqp_value[0] = cqp_value(cfg, &task.ctrl, task.ty[0]);
  task.cqp_value[1] = cqp_value(cfg, &task.ctrl, task.ty[1]);
  let (min_qp, max_qp) = qp_bounds(cfg, task.ty[ffid]);
  task.min_qp = min_qp;
  task.max_qp = max_qp;

  task.dpb[ffid] = prev.dpb_post_encoding.clone();

  create_additional_dpb_commands(cfg, task);

  update_dpb_frames(task, ffid, frame_num_max);
  init_ref_pic_list(task, ffid);
  modify_ref_pic_lists(cfg, task, ffid);
  mark_decoded_ref_pictures(cfg, task, ffid);

  if task.field_pic {
    update_dpb_frames(task, sfid, frame_num_max);
    init_ref_pic_list(task, sfid);
    modify_ref_pic_lists(cfg, task, sfid);

    // the second field of the just-added frame becomes a short-term
    // reference as well
    task.dpb_post_encoding = task.dpb[sfid].clone();
    if task.reference[sfid] {
      if let Some(back) = task.dpb_post_encoding.last_mut() {
        back.ref_pic_flag[sfid] = true;
      }
    }
  }
}

#[cfg(test)]
mod test;
