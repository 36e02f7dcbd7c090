// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! The decoded-picture-buffer manager: the bounded set of live
//! references, eviction, list0/list1 construction, DPB slot assignment,
//! and the detection of reference-list order changes the decoder must be
//! told about.

use tracing::trace;

use crate::frame::{FrameArena, FrameId};
use crate::{Error, Result, SliceType};

/// A single reference-picture-list modification operation, as carried in
/// the slice header. Both codecs terminate the list with opcode 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefListModOp {
    /// `modification_of_pic_nums_idc = 0`: subtract from the prediction.
    ShortTermSubtract { abs_diff_pic_num_minus1: u32 },
    /// `modification_of_pic_nums_idc = 1`: add to the prediction.
    ShortTermAdd { abs_diff_pic_num_minus1: u32 },
    /// `modification_of_pic_nums_idc = 3`: end of the operation list.
    End,
}

/// A memory-management control operation for the slice header's
/// decoded-reference-picture marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcoOp {
    /// Opcode 1: mark a short-term reference as unused.
    UnmarkShortTerm { difference_of_pic_nums_minus1: u32 },
    /// Opcode 0: end of the operation list.
    End,
}

/// What to do with the reference set when a new reference is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// There is room; nothing leaves.
    None,
    /// `victim` leaves the reference set. `explicit` means the sliding
    /// window would have evicted someone else, so the slice header must
    /// announce it with an MMCO.
    Evict { victim: FrameId, explicit: bool },
}

pub struct DpbManager {
    /// Live references, sorted by `frame_num` ascending.
    ref_list: Vec<FrameId>,
    /// Slot occupancy; the owning frame's image view stays on the frame.
    slots: Vec<Option<FrameId>>,
    current_slot_index: usize,
    num_ref_frames: u32,
    b_pyramid: bool,
}

impl DpbManager {
    pub fn new(num_ref_frames: u32, b_pyramid: bool, max_dpb_slots: usize) -> Self {
        DpbManager {
            ref_list: Vec::with_capacity(num_ref_frames as usize),
            slots: vec![None; max_dpb_slots.max(1)],
            current_slot_index: 0,
            num_ref_frames,
            b_pyramid,
        }
    }

    pub fn len(&self) -> usize {
        self.ref_list.len()
    }

    pub fn references(&self) -> &[FrameId] {
        &self.ref_list
    }

    /// Drops every reference, freeing arena records and slots. Runs at
    /// every IDR.
    pub fn clear(&mut self, arena: &mut FrameArena) {
        for id in self.ref_list.drain(..) {
            arena.remove(id);
        }

        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// How many live references display after `poc`. The reorder engine
    /// gates B emission on this.
    pub fn count_backward_refs(&self, arena: &FrameArena, poc: i32) -> usize {
        self.ref_list
            .iter()
            .filter(|id| {
                let ref_poc = arena.get(**id).poc;
                debug_assert_ne!(ref_poc, poc);
                ref_poc > poc
            })
            .count()
    }

    /// Picks the reference to drop when `current` (a reference) joins a
    /// full DPB. Sliding window except for b-pyramid B frames, which
    /// displace the lowest-POC B reference and may need to announce it.
    pub fn plan_eviction(&self, arena: &FrameArena, current: FrameId) -> Eviction {
        if self.ref_list.is_empty() || (self.ref_list.len() as u32) < self.num_ref_frames {
            return Eviction::None;
        }

        let head = self.ref_list[0];

        if !self.b_pyramid || arena.get(current).slice_type != SliceType::B {
            return Eviction::Evict {
                victim: head,
                explicit: false,
            };
        }

        // Choose the B reference with the lowest POC.
        let victim = self
            .ref_list
            .iter()
            .copied()
            .filter(|id| arena.get(*id).slice_type == SliceType::B)
            .min_by_key(|id| arena.get(*id).poc);

        match victim {
            Some(victim) if victim != head => {
                let victim_frame = arena.get(victim);
                let current_frame = arena.get(current);
                trace!(
                    victim_poc = victim_frame.poc,
                    victim_pic_num = victim_frame.frame_num,
                    poc = current_frame.poc,
                    pic_num = current_frame.frame_num,
                    "replacing a reference explicitly with memory_management_control_operation=1"
                );

                Eviction::Evict {
                    victim,
                    explicit: true,
                }
            }
            Some(victim) => Eviction::Evict {
                victim,
                explicit: false,
            },
            // No B reference around; back to the sliding window.
            None => Eviction::Evict {
                victim: head,
                explicit: false,
            },
        }
    }

    /// Reserves a DPB slot for a frame about to be reconstructed,
    /// scanning cyclically from `current_slot_index` for a free one.
    pub fn assign_slot(&mut self, arena: &mut FrameArena, id: FrameId) -> Result<usize> {
        let n = self.slots.len();
        for offset in 0..n {
            let index = (self.current_slot_index + offset) % n;
            if self.slots[index].is_none() {
                self.slots[index] = Some(id);
                self.current_slot_index = (index + 1) % n;
                arena.get_mut(id).dpb_slot_index = index as i32;
                return Ok(index);
            }
        }

        Err(Error::invariant("no free DPB slot"))
    }

    /// Commits `current` to the reference set after its encode was
    /// recorded, removing `victim` first. Keeps the list sorted by
    /// `frame_num`.
    pub fn commit_reference(
        &mut self,
        arena: &mut FrameArena,
        current: FrameId,
        eviction: Eviction,
    ) -> Result<()> {
        if let Eviction::Evict { victim, .. } = eviction {
            let index = self
                .ref_list
                .iter()
                .position(|id| *id == victim)
                .ok_or_else(|| Error::invariant("eviction victim left the reference list"))?;
            self.ref_list.remove(index);

            let victim = arena.remove(victim);
            if victim.dpb_slot_index >= 0 {
                self.slots[victim.dpb_slot_index as usize] = None;
            }
        }

        self.ref_list.push(current);
        self.ref_list
            .sort_by_key(|id| arena.get(*id).frame_num);

        if self.ref_list.len() as u32 > self.num_ref_frames {
            return Err(Error::invariant("reference list overflow"));
        }

        Ok(())
    }

    /// list0: past references, nearest (highest POC) first. list1:
    /// future references, nearest (lowest POC) first. Both truncated to
    /// the per-list caps; both empty for I slices.
    pub fn build_lists(
        &self,
        arena: &FrameArena,
        current: FrameId,
        ref_num_list0: u32,
        ref_num_list1: u32,
    ) -> (Vec<FrameId>, Vec<FrameId>) {
        let frame = arena.get(current);
        if frame.slice_type == SliceType::I {
            return (Vec::new(), Vec::new());
        }

        let mut list0: Vec<FrameId> = self
            .ref_list
            .iter()
            .copied()
            .filter(|id| arena.get(*id).poc <= frame.poc)
            .collect();
        list0.sort_by_key(|id| std::cmp::Reverse(arena.get(*id).poc));
        list0.truncate(ref_num_list0 as usize);

        let mut list1 = Vec::new();
        if frame.slice_type == SliceType::B {
            list1 = self
                .ref_list
                .iter()
                .copied()
                .filter(|id| arena.get(*id).poc > frame.poc)
                .collect();
            list1.sort_by_key(|id| arena.get(*id).poc);
            list1.truncate(ref_num_list1 as usize);
        }

        (list0, list1)
    }
}

/// Whether `list` deviates from the implicit order the decoder would
/// construct (by `frame_num`, descending for list0, ascending for
/// list1).
fn needs_reorder(arena: &FrameArena, list: &[FrameId], ascending: bool) -> bool {
    list.windows(2).any(|pair| {
        let diff = arena.get(pair[1]).frame_num as i64 - arena.get(pair[0]).frame_num as i64;
        debug_assert_ne!(diff, 0);
        if ascending {
            diff < 0
        } else {
            diff > 0
        }
    })
}

/// Builds the modification operations that transform the implicit list
/// into `list`, terminated with the end opcode. `None` when the implicit
/// order already matches.
pub fn ref_list_modifications(
    arena: &FrameArena,
    list: &[FrameId],
    cur_frame_num: u32,
    ascending: bool,
) -> Option<Vec<RefListModOp>> {
    if list.len() <= 1 || !needs_reorder(arena, list, ascending) {
        return None;
    }

    let mut by_pic_num: Vec<FrameId> = list.to_vec();
    if ascending {
        by_pic_num.sort_by_key(|id| arena.get(*id).frame_num);
    } else {
        by_pic_num.sort_by_key(|id| std::cmp::Reverse(arena.get(*id).frame_num));
    }

    // Operations are only needed up to the last mismatching position.
    let mut modification_num = 0;
    for (i, id) in list.iter().enumerate() {
        if by_pic_num[i] != *id {
            modification_num = i + 1;
        }
    }
    assert!(modification_num > 0);

    let mut ops = Vec::with_capacity(modification_num + 1);
    let mut pic_num_pred = cur_frame_num as i64;
    for id in &list[..modification_num] {
        let pic_num = arena.get(*id).frame_num as i64;
        let diff = pic_num - pic_num_pred;
        pic_num_pred = pic_num;
        debug_assert_ne!(diff, 0);

        if diff > 0 {
            ops.push(RefListModOp::ShortTermAdd {
                abs_diff_pic_num_minus1: (diff - 1) as u32,
            });
        } else {
            ops.push(RefListModOp::ShortTermSubtract {
                abs_diff_pic_num_minus1: (-diff - 1) as u32,
            });
        }
    }

    ops.push(RefListModOp::End);
    Some(ops)
}

/// The explicit unmark sequence for a frame that displaces a reference
/// the sliding window would have kept.
pub fn mmco_unmark_ops(cur_frame_num: u32, unused_frame_num: u32) -> Vec<MmcoOp> {
    vec![
        MmcoOp::UnmarkShortTerm {
            difference_of_pic_nums_minus1: cur_frame_num - unused_frame_num - 1,
        },
        MmcoOp::End,
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::FrameRecord;

    fn reference(
        arena: &mut FrameArena,
        dpb: &mut DpbManager,
        frame_num: u32,
        poc: i32,
        slice_type: SliceType,
    ) -> FrameId {
        let mut frame = FrameRecord::new(None, frame_num as u64, frame_num as u64);
        frame.frame_num = frame_num;
        frame.poc = poc;
        frame.slice_type = slice_type;
        let id = arena.insert(frame);

        let eviction = dpb.plan_eviction(arena, id);
        dpb.assign_slot(arena, id).unwrap();
        dpb.commit_reference(arena, id, eviction).unwrap();
        id
    }

    #[test]
    fn test_sliding_window_eviction() {
        let mut arena = FrameArena::new();
        let mut dpb = DpbManager::new(2, false, 3);

        reference(&mut arena, &mut dpb, 0, 0, SliceType::I);
        reference(&mut arena, &mut dpb, 1, 2, SliceType::P);
        assert_eq!(dpb.len(), 2);

        // Admitting a third reference pushes out the oldest.
        let mut frame = FrameRecord::new(None, 2, 2);
        frame.frame_num = 2;
        frame.poc = 4;
        frame.slice_type = SliceType::P;
        let id = arena.insert(frame);

        let eviction = dpb.plan_eviction(&arena, id);
        let Eviction::Evict { victim, explicit } = eviction else {
            panic!("expected an eviction");
        };
        assert!(!explicit);
        assert_eq!(arena.get(victim).frame_num, 0);

        dpb.assign_slot(&mut arena, id).unwrap();
        dpb.commit_reference(&mut arena, id, eviction).unwrap();
        assert_eq!(dpb.len(), 2);

        let frame_nums: Vec<u32> = dpb
            .references()
            .iter()
            .map(|id| arena.get(*id).frame_num)
            .collect();
        assert_eq!(frame_nums, vec![1, 2]);
    }

    #[test]
    fn test_pyramid_evicts_lowest_poc_b_with_announcement() {
        let mut arena = FrameArena::new();
        let mut dpb = DpbManager::new(3, true, 4);

        reference(&mut arena, &mut dpb, 0, 0, SliceType::I);
        reference(&mut arena, &mut dpb, 1, 8, SliceType::P);
        reference(&mut arena, &mut dpb, 2, 4, SliceType::B);

        // A B reference arriving into a full DPB displaces the B with
        // the lowest POC, which is not the head.
        let mut frame = FrameRecord::new(None, 3, 3);
        frame.frame_num = 3;
        frame.poc = 12;
        frame.slice_type = SliceType::B;
        let id = arena.insert(frame);

        let Eviction::Evict { victim, explicit } = dpb.plan_eviction(&arena, id) else {
            panic!("expected an eviction");
        };
        assert!(explicit);
        assert_eq!(arena.get(victim).frame_num, 2);

        // MMCO: unmark pic_num 2 from frame_num 3, then end.
        assert_eq!(
            mmco_unmark_ops(3, 2),
            vec![
                MmcoOp::UnmarkShortTerm {
                    difference_of_pic_nums_minus1: 0
                },
                MmcoOp::End
            ]
        );
    }

    #[test]
    fn test_pyramid_ip_frames_keep_sliding_window() {
        let mut arena = FrameArena::new();
        let mut dpb = DpbManager::new(2, true, 3);

        reference(&mut arena, &mut dpb, 0, 0, SliceType::I);
        reference(&mut arena, &mut dpb, 1, 4, SliceType::B);

        let mut frame = FrameRecord::new(None, 2, 2);
        frame.frame_num = 2;
        frame.poc = 8;
        frame.slice_type = SliceType::P;
        let id = arena.insert(frame);

        let Eviction::Evict { victim, explicit } = dpb.plan_eviction(&arena, id) else {
            panic!("expected an eviction");
        };
        assert!(!explicit);
        assert_eq!(arena.get(victim).frame_num, 0);
    }

    #[test]
    fn test_list_construction() {
        let mut arena = FrameArena::new();
        let mut dpb = DpbManager::new(4, true, 5);

        reference(&mut arena, &mut dpb, 0, 0, SliceType::I);
        reference(&mut arena, &mut dpb, 1, 8, SliceType::P);
        reference(&mut arena, &mut dpb, 2, 4, SliceType::B);

        // A B frame at POC 2 sees [4, 0] behind it and [8] ahead.
        let mut frame = FrameRecord::new(None, 3, 3);
        frame.poc = 2;
        frame.slice_type = SliceType::B;
        let id = arena.insert(frame);

        let (list0, list1) = dpb.build_lists(&arena, id, 2, 1);
        let pocs0: Vec<i32> = list0.iter().map(|id| arena.get(*id).poc).collect();
        let pocs1: Vec<i32> = list1.iter().map(|id| arena.get(*id).poc).collect();
        assert_eq!(pocs0, vec![0]);
        assert_eq!(pocs1, vec![8]);

        // An I slice gets no reference lists at all.
        arena.get_mut(id).slice_type = SliceType::I;
        let (list0, list1) = dpb.build_lists(&arena, id, 2, 1);
        assert!(list0.is_empty() && list1.is_empty());
    }

    #[test]
    fn test_truncation_to_list_caps() {
        let mut arena = FrameArena::new();
        let mut dpb = DpbManager::new(4, false, 5);

        for i in 0..4 {
            reference(&mut arena, &mut dpb, i, 2 * i as i32, SliceType::P);
        }

        let mut frame = FrameRecord::new(None, 4, 4);
        frame.poc = 8;
        frame.slice_type = SliceType::P;
        let id = arena.insert(frame);

        let (list0, _) = dpb.build_lists(&arena, id, 2, 0);
        let pocs: Vec<i32> = list0.iter().map(|id| arena.get(*id).poc).collect();
        // Nearest past first, truncated to two entries.
        assert_eq!(pocs, vec![6, 4]);
    }

    #[test]
    fn test_no_modification_for_implicit_order() {
        let mut arena = FrameArena::new();
        let mut dpb = DpbManager::new(2, false, 3);

        reference(&mut arena, &mut dpb, 0, 0, SliceType::I);
        reference(&mut arena, &mut dpb, 1, 2, SliceType::P);

        let mut frame = FrameRecord::new(None, 2, 2);
        frame.frame_num = 2;
        frame.poc = 4;
        frame.slice_type = SliceType::P;
        let id = arena.insert(frame);

        let (list0, _) = dpb.build_lists(&arena, id, 2, 0);
        // POC order and frame_num order agree, so the implicit list
        // stands.
        assert_eq!(ref_list_modifications(&arena, &list0, 2, false), None);
    }

    #[test]
    fn test_modification_ops_terminated() {
        let mut arena = FrameArena::new();

        // Two references whose POC order disagrees with their frame_num
        // order: frame_num 1 displays later than frame_num 2.
        let mut a = FrameRecord::new(None, 0, 0);
        a.frame_num = 1;
        a.poc = 8;
        let a = arena.insert(a);

        let mut b = FrameRecord::new(None, 1, 1);
        b.frame_num = 2;
        b.poc = 4;
        let b = arena.insert(b);

        // list0 by POC descending: [a (pic 1), b (pic 2)], but the
        // implicit order is [b, a].
        let ops = ref_list_modifications(&arena, &[a, b], 3, false).unwrap();
        assert_eq!(
            ops,
            vec![
                RefListModOp::ShortTermSubtract {
                    abs_diff_pic_num_minus1: 1
                },
                RefListModOp::ShortTermAdd {
                    abs_diff_pic_num_minus1: 0
                },
                RefListModOp::End
            ]
        );
    }
}
