// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! Frame records and the arena that owns them. Reference lists, the DPB
//! and the reorder queue all hold stable [`FrameId`] indices instead of
//! references, which keeps the cyclic frame↔slot↔list graph simple.

use std::sync::Arc;

use bytes::Bytes;

use crate::gop::GopEntry;
use crate::gpu::VkImage;
use crate::SliceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u32);

/// One frame admitted to the encoder, from admission until its output
/// has been emitted and no later frame references it.
pub struct FrameRecord {
    /// The caller's GPU-resident YUV image. `None` only in tests.
    pub input: Option<Arc<VkImage>>,
    /// Raw CEA-708 caption data attached to the input frame, if any.
    pub captions: Option<Bytes>,

    /// Monotonic counter assigned at admission.
    pub system_frame_number: u64,
    /// Display-order index since the encoder started, for PTS.
    pub total_frame_count: u64,

    /// Position inside the current GOP; 0 is the IDR.
    pub gop_index: u32,
    /// Wrapping decode-order counter, bumped only by references.
    pub frame_num: u32,
    pub poc: i32,

    pub slice_type: SliceType,
    pub is_reference: bool,
    pub pyramid_level: u32,
    pub left_ref_poc_diff: i32,
    pub right_ref_poc_diff: i32,

    /// `frame_num` of a reference this frame explicitly unmarks, or -1.
    /// A non-negative value makes the slice header carry an explicit
    /// memory-management control operation.
    pub unused_reference_pic_num: i32,
    /// DPB slot reserved for the reconstructed picture, or -1.
    pub dpb_slot_index: i32,

    pub sync_point: bool,
    /// Per-frame QP chosen by the adaptive quality loop.
    pub quality: u32,
}

impl FrameRecord {
    pub fn new(input: Option<Arc<VkImage>>, system_frame_number: u64, total: u64) -> Self {
        FrameRecord {
            input,
            captions: None,
            system_frame_number,
            total_frame_count: total,
            gop_index: 0,
            frame_num: 0,
            poc: 0,
            slice_type: SliceType::I,
            is_reference: true,
            pyramid_level: 0,
            left_ref_poc_diff: 0,
            right_ref_poc_diff: 0,
            unused_reference_pic_num: -1,
            dpb_slot_index: -1,
            sync_point: false,
            quality: 0,
        }
    }

    pub fn assign_role(&mut self, gop_index: u32, entry: &GopEntry) {
        self.gop_index = gop_index;
        self.slice_type = entry.slice_type;
        self.is_reference = entry.is_reference;
        self.pyramid_level = entry.pyramid_level;
        self.left_ref_poc_diff = entry.left_ref_poc_diff;
        self.right_ref_poc_diff = entry.right_ref_poc_diff;
    }
}

/// Vector-plus-free-list arena with stable indices.
#[derive(Default)]
pub struct FrameArena {
    slots: Vec<Option<FrameRecord>>,
    free: Vec<u32>,
}

impl FrameArena {
    pub fn new() -> Self {
        FrameArena::default()
    }

    pub fn insert(&mut self, frame: FrameRecord) -> FrameId {
        match self.free.pop() {
            Some(index) => {
                debug_assert!(self.slots[index as usize].is_none());
                self.slots[index as usize] = Some(frame);
                FrameId(index)
            }
            None => {
                self.slots.push(Some(frame));
                FrameId(self.slots.len() as u32 - 1)
            }
        }
    }

    pub fn get(&self, id: FrameId) -> &FrameRecord {
        self.slots[id.0 as usize].as_ref().expect("stale frame id")
    }

    pub fn get_mut(&mut self, id: FrameId) -> &mut FrameRecord {
        self.slots[id.0 as usize].as_mut().expect("stale frame id")
    }

    pub fn remove(&mut self, id: FrameId) -> FrameRecord {
        let frame = self.slots[id.0 as usize].take().expect("stale frame id");
        self.free.push(id.0);
        frame
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_arena_reuses_slots() {
        let mut arena = FrameArena::new();

        let a = arena.insert(FrameRecord::new(None, 0, 0));
        let b = arena.insert(FrameRecord::new(None, 1, 1));
        assert_eq!(arena.len(), 2);

        arena.remove(a);
        let c = arena.insert(FrameRecord::new(None, 2, 2));

        // The freed slot is reused, and ids stay stable.
        assert_eq!(a, c);
        assert_eq!(arena.get(b).system_frame_number, 1);
        assert_eq!(arena.get(c).system_frame_number, 2);
        assert_eq!(arena.len(), 2);
    }
}
