// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! The reorder engine: frames enter in display order and leave in
//! decode order. Non-B frames pass straight through; B frames wait
//! until their forward anchors have been emitted and enough backward
//! references are live.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::dpb::DpbManager;
use crate::frame::{FrameArena, FrameId};
use crate::gop::GopPlan;
use crate::{Error, Result, SliceType};

#[derive(Default)]
pub struct ReorderEngine {
    reorder_list: VecDeque<FrameId>,
    pub cur_frame_index: u32,
    pub cur_frame_num: u32,
    pub total_idr_count: u32,
}

impl ReorderEngine {
    pub fn new() -> Self {
        ReorderEngine::default()
    }

    pub fn is_empty(&self) -> bool {
        self.reorder_list.is_empty()
    }

    /// Begin the next GOP from scratch. Called on flush.
    pub fn reset(&mut self) {
        self.cur_frame_index = 0;
        self.cur_frame_num = 0;
    }

    /// Admits a frame (display order) and/or marks the end of the
    /// stream. Starting a new GOP clears the reference set and flags the
    /// frame as a sync point; `end_of_stream` promotes the last buffered
    /// B to P so the GOP terminates cleanly.
    pub fn push(
        &mut self,
        id: Option<FrameId>,
        arena: &mut FrameArena,
        dpb: &mut DpbManager,
        plan: &GopPlan,
        force_keyframe: bool,
        end_of_stream: bool,
    ) -> Result<()> {
        if self.cur_frame_index > plan.idr_period {
            return Err(Error::invariant("GOP index ran past the IDR period"));
        }

        if let Some(id) = id {
            if self.cur_frame_index == plan.idr_period {
                // A new GOP must start with an empty reorder queue.
                if !self.reorder_list.is_empty() {
                    return Err(Error::invariant("starting a GOP with buffered frames"));
                }

                self.cur_frame_index = 0;
                self.cur_frame_num = 0;
            }

            let poc = ((self.cur_frame_index * 2) % plan.max_pic_order_cnt) as i32;

            let frame = arena.get_mut(id);
            frame.poc = poc;
            frame.assign_role(self.cur_frame_index, plan.entry(self.cur_frame_index));

            if self.cur_frame_index == 0 {
                debug_assert_eq!(frame.poc, 0);
                trace!(
                    system_frame_number = frame.system_frame_number,
                    "an IDR frame starts a new GOP"
                );

                arena.get_mut(id).sync_point = true;
                dpb.clear(arena);
            }

            if force_keyframe {
                let frame = arena.get_mut(id);
                debug!(
                    system_frame_number = frame.system_frame_number,
                    from = %frame.slice_type,
                    "promoting a force-keyframe to I"
                );
                frame.slice_type = SliceType::I;
                frame.is_reference = true;
            }

            let frame = arena.get(id);
            trace!(
                system_frame_number = frame.system_frame_number,
                poc = frame.poc,
                slice_type = %frame.slice_type,
                "push frame"
            );

            self.cur_frame_index += 1;
            self.reorder_list.push_back(id);
        }

        // Terminate the GOP: the last buffered frame becomes a non-B,
        // and the next push starts a fresh GOP.
        if end_of_stream && self.cur_frame_index < plan.idr_period {
            self.cur_frame_index = plan.idr_period;

            if let Some(last) = self.reorder_list.back() {
                let frame = arena.get_mut(*last);
                if frame.slice_type == SliceType::B {
                    frame.slice_type = SliceType::P;
                    frame.is_reference = true;
                }
            }
        }

        Ok(())
    }

    /// Pops the next frame in decode order, or `None` if no frame is
    /// ready yet. Assigns `frame_num` on the way out.
    pub fn pop(
        &mut self,
        arena: &mut FrameArena,
        dpb: &DpbManager,
        plan: &GopPlan,
    ) -> Option<FrameId> {
        if self.reorder_list.is_empty() {
            return None;
        }

        // The most recent non-B goes out immediately.
        let tail = *self.reorder_list.back().unwrap();
        if arena.get(tail).slice_type != SliceType::B {
            self.reorder_list.pop_back();
            return Some(self.finish_pop(tail, arena, plan));
        }

        if plan.b_pyramid {
            let id = self.pop_pyramid_b(arena, dpb, plan)?;
            return Some(self.finish_pop(id, arena, plan));
        }

        debug_assert!(plan.ref_num_list1 > 0);

        // At the GOP boundary everything must drain.
        if self.cur_frame_index == plan.idr_period {
            let head = self.reorder_list.pop_front().unwrap();
            return Some(self.finish_pop(head, arena, plan));
        }

        // Otherwise a B waits for its backward references.
        let head = *self.reorder_list.front().unwrap();
        if dpb.count_backward_refs(arena, arena.get(head).poc) >= plan.ref_num_list1 as usize {
            self.reorder_list.pop_front();
            return Some(self.finish_pop(head, arena, plan));
        }

        None
    }

    /// Pyramid selection: start from the deepest-level, lowest-POC
    /// candidate, then redirect to any of its anchors still waiting in
    /// the queue; anchors must be emitted first.
    fn pop_pyramid_b(
        &mut self,
        arena: &FrameArena,
        dpb: &DpbManager,
        plan: &GopPlan,
    ) -> Option<FrameId> {
        debug_assert_eq!(plan.ref_num_list1, 1);

        let mut best: Option<(usize, FrameId)> = None;
        for (index, id) in self.reorder_list.iter().enumerate() {
            let Some((_, best_id)) = best else {
                best = Some((index, *id));
                continue;
            };

            let candidate = arena.get(*id);
            let current = arena.get(best_id);
            if current.pyramid_level < candidate.pyramid_level {
                best = Some((index, *id));
                continue;
            }

            if current.poc > candidate.poc {
                best = Some((index, *id));
            }
        }

        let (mut index, mut best_id) = best?;

        'again: loop {
            let frame = arena.get(best_id);
            debug_assert_ne!(frame.left_ref_poc_diff, 0);
            debug_assert_ne!(frame.right_ref_poc_diff, 0);

            for (i, id) in self.reorder_list.iter().enumerate() {
                if *id == best_id {
                    continue;
                }

                let other = arena.get(*id);
                if other.poc == frame.poc + frame.left_ref_poc_diff
                    || other.poc == frame.poc + frame.right_ref_poc_diff
                {
                    best_id = *id;
                    index = i;
                    continue 'again;
                }
            }

            break;
        }

        // Its backward anchor must already be a live reference.
        if dpb.count_backward_refs(arena, arena.get(best_id).poc) >= plan.ref_num_list1 as usize {
            let removed = self.reorder_list.remove(index).unwrap();
            debug_assert_eq!(removed, best_id);
            Some(best_id)
        } else {
            None
        }
    }

    fn finish_pop(&mut self, id: FrameId, arena: &mut FrameArena, plan: &GopPlan) -> FrameId {
        debug_assert!(self.cur_frame_num < plan.max_frame_num);

        let frame = arena.get_mut(id);
        frame.frame_num = self.cur_frame_num;

        if frame.is_reference {
            self.cur_frame_num += 1;
        }

        if frame.frame_num == 0 {
            self.total_idr_count += 1;
        }

        trace!(
            system_frame_number = frame.system_frame_number,
            slice_type = %frame.slice_type,
            poc = frame.poc,
            frame_num = frame.frame_num,
            is_reference = frame.is_reference,
            pyramid_level = frame.pyramid_level,
            "pop frame"
        );

        id
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::EncoderConfig;
    use crate::dpb::Eviction;
    use crate::frame::FrameRecord;
    use crate::gop;
    use crate::VideoCodec;

    struct Harness {
        arena: FrameArena,
        dpb: DpbManager,
        reorder: ReorderEngine,
        plan: gop::GopPlan,
        next_snr: u64,
    }

    impl Harness {
        fn new(idr_period: u32, num_bframes: u32, b_pyramid: bool, num_ref: u32) -> Self {
            let mut cfg = EncoderConfig::new(VideoCodec::H265, 1280, 720, (30, 1));
            cfg.idr_period = idr_period;
            cfg.num_bframes = num_bframes;
            cfg.b_pyramid = b_pyramid;
            cfg.num_ref_frames = num_ref;

            let plan = gop::plan(&cfg, 16, 16);
            let dpb = DpbManager::new(plan.num_ref_frames, plan.b_pyramid, plan.required_dpb_size());

            Harness {
                arena: FrameArena::new(),
                dpb,
                reorder: ReorderEngine::new(),
                plan,
                next_snr: 0,
            }
        }

        fn push(&mut self, force_keyframe: bool) {
            let snr = self.next_snr;
            self.next_snr += 1;
            let id = self.arena.insert(FrameRecord::new(None, snr, snr));
            self.reorder
                .push(
                    Some(id),
                    &mut self.arena,
                    &mut self.dpb,
                    &self.plan,
                    force_keyframe,
                    false,
                )
                .unwrap();
        }

        fn eos(&mut self) {
            self.reorder
                .push(
                    None,
                    &mut self.arena,
                    &mut self.dpb,
                    &self.plan,
                    false,
                    true,
                )
                .unwrap();
        }

        /// Pops every ready frame, running the DPB admission a real
        /// encode would perform.
        fn drain(&mut self) -> Vec<(u64, SliceType, i32, u32)> {
            let mut out = Vec::new();
            while let Some(id) = self.reorder.pop(&mut self.arena, &self.dpb, &self.plan) {
                let frame = self.arena.get(id);
                out.push((
                    frame.system_frame_number,
                    frame.slice_type,
                    frame.poc,
                    frame.frame_num,
                ));

                if frame.is_reference {
                    let eviction = self.dpb.plan_eviction(&self.arena, id);
                    if let Eviction::Evict { victim, explicit } = eviction {
                        if explicit {
                            let victim_num = self.arena.get(victim).frame_num as i32;
                            self.arena.get_mut(id).unused_reference_pic_num = victim_num;
                        }
                    }
                    self.dpb.assign_slot(&mut self.arena, id).unwrap();
                    self.dpb
                        .commit_reference(&mut self.arena, id, eviction)
                        .unwrap();
                } else {
                    self.arena.remove(id);
                }
            }
            out
        }
    }

    #[test]
    fn test_ip_stream_passes_through() {
        let mut h = Harness::new(33, 0, false, 1);

        let mut emitted = Vec::new();
        for _ in 0..33 {
            h.push(false);
            emitted.extend(h.drain());
        }

        assert_eq!(emitted.len(), 33);
        assert_eq!(emitted[0].1, SliceType::I);
        assert!(emitted[1..].iter().all(|e| e.1 == SliceType::P));

        // Display order survives, and frame_num counts every frame
        // since all of them are references.
        for (i, (snr, _, _, frame_num)) in emitted.iter().enumerate() {
            assert_eq!(*snr, i as u64);
            assert_eq!(*frame_num, i as u32);
        }
    }

    #[test]
    fn test_pyramid_emission_order() {
        let mut h = Harness::new(8, 3, true, 3);

        let mut emitted = Vec::new();
        for _ in 0..8 {
            h.push(false);
            emitted.extend(h.drain());
        }

        // I(0), P(4), then the level-0 B, its two leaves, the final P,
        // and the trailing mini-pyramid.
        let order: Vec<(u64, SliceType)> = emitted.iter().map(|e| (e.0, e.1)).collect();
        assert_eq!(
            order,
            vec![
                (0, SliceType::I),
                (4, SliceType::P),
                (2, SliceType::B),
                (1, SliceType::B),
                (3, SliceType::B),
                (7, SliceType::P),
                (6, SliceType::B),
                (5, SliceType::B),
            ]
        );

        // Every B displays strictly between already-emitted anchors.
        for (index, (_, ty, poc, _)) in emitted.iter().enumerate() {
            if *ty != SliceType::B {
                continue;
            }

            let before = emitted[..index].iter().any(|e| e.2 < *poc);
            let after = emitted[..index].iter().any(|e| e.2 > *poc);
            assert!(before && after, "B frame emitted before its anchors");
        }
    }

    #[test]
    fn test_pyramid_explicit_eviction() {
        let mut h = Harness::new(8, 3, true, 3);

        let mut emitted = Vec::new();
        for _ in 0..8 {
            h.push(false);
            emitted.extend(h.drain());
        }

        // The second level-0 B (display 6, frame_num 4) displaces the
        // first one (frame_num 2), which is not the DPB head.
        let announcer = emitted.iter().find(|e| e.0 == 6).unwrap();
        assert_eq!(announcer.3, 4);
        // Its record was committed to the DPB; snoop the arena through
        // the reference list.
        let unused: Vec<i32> = h
            .dpb
            .references()
            .iter()
            .map(|id| h.arena.get(*id).unused_reference_pic_num)
            .collect();
        assert!(unused.contains(&2));
    }

    #[test]
    fn test_force_keyframe_promotes() {
        let mut h = Harness::new(10, 0, false, 2);

        for _ in 0..5 {
            h.push(false);
            h.drain();
        }

        h.push(true);
        let emitted = h.drain();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].1, SliceType::I);

        let id = h.dpb.references().last().copied().unwrap();
        assert!(h.arena.get(id).is_reference);
    }

    #[test]
    fn test_flush_promotes_last_b() {
        let mut h = Harness::new(16, 2, false, 2);

        for _ in 0..7 {
            h.push(false);
            h.drain();
        }

        h.eos();
        let emitted = h.drain();

        // Everything left the queue.
        assert!(h.reorder.is_empty());
        // The final display frame went out as a P.
        let last_display = emitted.iter().max_by_key(|e| e.0).unwrap();
        assert_eq!(last_display.1, SliceType::P);

        // A flush resets the GOP counters, and the next frame opens a
        // fresh GOP.
        h.reorder.reset();
        assert_eq!(h.reorder.cur_frame_index, 0);
        assert_eq!(h.reorder.cur_frame_num, 0);

        h.push(false);
        let emitted = h.drain();
        assert_eq!(emitted[0].1, SliceType::I);
    }

    #[test]
    fn test_frame_count_preserved_across_gops() {
        let mut h = Harness::new(8, 3, true, 3);

        let mut emitted = Vec::new();
        for _ in 0..24 {
            h.push(false);
            emitted.extend(h.drain());
        }
        h.eos();
        emitted.extend(h.drain());

        // Property 1: the multiset of emitted frames matches admission.
        let mut snrs: Vec<u64> = emitted.iter().map(|e| e.0).collect();
        snrs.sort_unstable();
        assert_eq!(snrs, (0..24).collect::<Vec<u64>>());

        // Property 3: every GOP lead-in is an IDR sync point.
        assert_eq!(h.reorder.total_idr_count, 3);
    }
}
