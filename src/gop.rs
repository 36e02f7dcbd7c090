// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! GOP planning: turns an [`EncoderConfig`] and the GPU's reference-list
//! limits into a per-slot table of slice types, reference flags and
//! pyramid levels, plus the derived `frame_num`/POC wrap counters.

use tracing::{debug, info};

use crate::config::EncoderConfig;
use crate::SliceType;

pub const MAX_GOP_SIZE: u32 = 1024;

/// The role of one display-order position within a GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopEntry {
    pub slice_type: SliceType,
    pub is_reference: bool,
    pub pyramid_level: u32,
    /// POC distance to the backward anchor. Only meaningful for B slots.
    pub left_ref_poc_diff: i32,
    /// POC distance to the forward anchor. Only meaningful for B slots.
    pub right_ref_poc_diff: i32,
}

/// A fully resolved GOP structure. Recomputed whenever the format or the
/// staged configuration changes.
#[derive(Debug, Clone)]
pub struct GopPlan {
    pub idr_period: u32,
    /// Distance between anchors (P or I): `1 + num_bframes`. 0 for
    /// intra-only streams.
    pub ip_period: u32,
    /// Distance between non-IDR I insertions, in slots. 0 when no extra
    /// I frames are inserted.
    pub i_period: u32,
    pub num_bframes: u32,
    pub num_iframes: u32,
    pub b_pyramid: bool,
    pub highest_pyramid_level: u32,
    pub num_ref_frames: u32,
    pub ref_num_list0: u32,
    pub ref_num_list1: u32,
    /// Worst-case display-vs-decode delay, used to derive DTS.
    pub num_reorder_frames: u32,

    pub log2_max_frame_num: u32,
    pub max_frame_num: u32,
    pub log2_max_pic_order_cnt: u32,
    pub max_pic_order_cnt: u32,

    pub entries: Vec<GopEntry>,
}

impl GopPlan {
    pub fn entry(&self, gop_index: u32) -> &GopEntry {
        &self.entries[gop_index as usize]
    }

    /// DPB image slots needed: every live reference plus the picture
    /// being reconstructed.
    pub fn required_dpb_size(&self) -> usize {
        self.num_ref_frames as usize + 1
    }
}

/// `log2_max_frame_num`, constrained to [4, 16] by both codecs.
fn log2_max_num(mut num: u32) -> u32 {
    let mut ret = 0;
    while num != 0 {
        ret += 1;
        num >>= 1;
    }

    ret.clamp(4, 16)
}

#[derive(Debug, Clone, Copy, Default)]
struct PyramidInfo {
    level: u32,
    left_ref_poc_diff: i32,
    right_ref_poc_diff: i32,
}

/// Levels a run of `len` B slots between two anchors: the middle B takes
/// the current level and splits the run, recursing until
/// `highest_level`, where the remaining leaves share the deepest level.
fn set_pyramid_info(info: &mut [PyramidInfo], current_level: u32, highest_level: u32) {
    let len = info.len();
    assert!(len >= 1);

    if current_level == highest_level || len == 1 {
        for (index, entry) in info.iter_mut().enumerate() {
            entry.level = current_level;
            entry.left_ref_poc_diff = (index as i32 + 1) * -2;
            entry.right_ref_poc_diff = (len - index) as i32 * 2;
        }

        return;
    }

    let index = len / 2;
    info[index].level = current_level;
    info[index].left_ref_poc_diff = (index as i32 + 1) * -2;
    info[index].right_ref_poc_diff = (len - index) as i32 * 2;

    let (left, right) = info.split_at_mut(index);
    if !left.is_empty() {
        set_pyramid_info(left, current_level + 1, highest_level);
    }

    let right = &mut right[1..];
    if !right.is_empty() {
        set_pyramid_info(right, current_level + 1, highest_level);
    }
}

/// Computes the GOP structure. `max_refs_list0` and `max_refs_list1`
/// come from the GPU's capability query; list1 support gates B frames
/// entirely.
pub fn plan(cfg: &EncoderConfig, max_refs_list0: u32, max_refs_list1: u32) -> GopPlan {
    // An IDR roughly every second if the caller didn't say.
    let mut idr_period = if cfg.idr_period == 0 {
        cfg.fps.0.div_ceil(cfg.fps.1)
    } else {
        cfg.idr_period
    };

    if idr_period > MAX_GOP_SIZE {
        info!(idr_period = MAX_GOP_SIZE, "lowering the GOP size");
        idr_period = MAX_GOP_SIZE;
    }

    let mut num_bframes = cfg.num_bframes;
    if idr_period > 8 {
        if num_bframes > (idr_period - 1) / 2 {
            num_bframes = (idr_period - 1) / 2;
            info!(num_bframes, "lowering the number of B frames");
        }
    } else {
        // Both ends of the GOP must be anchors.
        let cap = idr_period.saturating_sub(2);
        if num_bframes > cap {
            num_bframes = cap;
            info!(num_bframes, "lowering the number of B frames");
        }
    }

    let mut num_ref_frames = cfg.num_ref_frames;
    let mut num_iframes = cfg.num_iframes;
    let mut b_pyramid = cfg.b_pyramid;
    let mut highest_pyramid_level = 0;

    let mut list0 = max_refs_list0.min(num_ref_frames);
    let mut list1 = max_refs_list1.min(num_ref_frames);

    let ref_num_list0;
    let ref_num_list1;
    let ip_period;
    let mut i_period = 0;

    if list0 == 0 {
        info!("no reference support, falling back to an intra-only stream");

        num_ref_frames = 0;
        ip_period = 0;
        num_bframes = 0;
        b_pyramid = false;
        num_iframes = idr_period - 1;
        ref_num_list0 = 0;
        ref_num_list1 = 0;
    } else {
        if num_ref_frames <= 1 {
            info!(
                num_ref_frames,
                "not enough references for B frames, falling back to I/P"
            );
            num_bframes = 0;
            list1 = 0;
        }

        // b_pyramid needs a B reference besides the two anchors.
        if b_pyramid && num_ref_frames <= 2 {
            info!(num_ref_frames, "not enough references for b-pyramid");
            b_pyramid = false;
        }

        if list1 == 0 && num_bframes > 0 {
            info!("no backward reference support, falling back to I/P");
            num_bframes = 0;
            b_pyramid = false;
        }

        if num_bframes == 0 {
            list1 = 0;
        }

        if num_bframes <= 1 {
            b_pyramid = false;
        }

        // The pyramid only ever references one backward anchor.
        if b_pyramid {
            list1 = 1;
        }

        if num_ref_frames > list0 + list1 {
            num_ref_frames = list0 + list1;
            info!(num_ref_frames, "hardware limits, lowering the DPB depth");
        }

        // How many anchors a GOP contains.
        let mut gop_ref_num = (idr_period + num_bframes) / (num_bframes + 1);
        if num_bframes > 0 && idr_period % (num_bframes + 1) != 1 {
            // The forced P at the end of the GOP.
            gop_ref_num += 1;
        }

        if num_bframes == 0 {
            ref_num_list0 = num_ref_frames;
            ref_num_list1 = 0;
        } else if b_pyramid {
            ref_num_list1 = 1;
            ref_num_list0 = num_ref_frames - ref_num_list1;

            let mut b_frames = num_bframes / 2;
            let mut b_refs = 0;
            while b_frames != 0 {
                // One B reference per level, plus the two anchors.
                b_refs += 1;
                if b_refs + 2 > num_ref_frames {
                    break;
                }

                highest_pyramid_level += 1;
                b_frames /= 2;
            }

            info!(highest_pyramid_level, "b-pyramid enabled");
        } else {
            // Prefer list0; backward references cost latency. Migrate
            // references to list1 only while list0 stays dominant.
            let mut l0 = num_ref_frames - 1;
            let mut l1 = 1u32;
            while num_bframes * l1 <= 16 && l1 <= gop_ref_num && l1 < list1 && l0 / l1 > 4 {
                l0 -= 1;
                l1 += 1;
            }

            ref_num_list0 = l0.min(list0);
            ref_num_list1 = l1;
        }

        ip_period = 1 + num_bframes;

        let p_frames = gop_ref_num.saturating_sub(1);
        if num_iframes > p_frames {
            num_iframes = p_frames;
            info!(num_iframes, "too many I frame insertions, lowering");
        }

        if num_iframes > 0 {
            let total_i_frames = num_iframes + 1;
            i_period = (gop_ref_num / total_i_frames) * (num_bframes + 1);
        }
    }

    let log2_max_frame_num = log2_max_num(idr_period);
    let max_frame_num = 1 << log2_max_frame_num;
    let log2_max_pic_order_cnt = log2_max_frame_num + 1;
    let max_pic_order_cnt = 1 << log2_max_pic_order_cnt;

    let num_reorder_frames = if num_bframes == 0 {
        0
    } else if b_pyramid {
        highest_pyramid_level + 1
    } else {
        1
    };

    let mut plan = GopPlan {
        idr_period,
        ip_period,
        i_period,
        num_bframes,
        num_iframes,
        b_pyramid,
        highest_pyramid_level,
        num_ref_frames,
        ref_num_list0,
        ref_num_list1,
        num_reorder_frames,
        log2_max_frame_num,
        max_frame_num,
        log2_max_pic_order_cnt,
        max_pic_order_cnt,
        entries: Vec::with_capacity(idr_period as usize),
    };

    fill_frame_types(&mut plan);
    log_structure(&plan);

    plan
}

fn fill_frame_types(plan: &mut GopPlan) {
    let mut pyramid_info = vec![PyramidInfo::default(); plan.num_bframes as usize];
    if plan.highest_pyramid_level > 0 {
        assert!(plan.num_bframes > 0);
        set_pyramid_info(&mut pyramid_info, 0, plan.highest_pyramid_level);
    }

    let mut i_frames = plan.num_iframes;
    for i in 0..plan.idr_period {
        if i == 0 {
            plan.entries.push(GopEntry {
                slice_type: SliceType::I,
                is_reference: true,
                pyramid_level: 0,
                left_ref_poc_diff: 0,
                right_ref_poc_diff: 0,
            });
            continue;
        }

        // Intra-only stream.
        if plan.ip_period == 0 {
            plan.entries.push(GopEntry {
                slice_type: SliceType::I,
                is_reference: false,
                pyramid_level: 0,
                left_ref_poc_diff: 0,
                right_ref_poc_diff: 0,
            });
            continue;
        }

        if i % plan.ip_period != 0 {
            // The first slot after a P or the IDR.
            let info = pyramid_info[(i % plan.ip_period - 1) as usize];

            plan.entries.push(GopEntry {
                slice_type: SliceType::B,
                is_reference: info.level < plan.highest_pyramid_level,
                pyramid_level: info.level,
                left_ref_poc_diff: info.left_ref_poc_diff,
                right_ref_poc_diff: info.right_ref_poc_diff,
            });
            continue;
        }

        if plan.i_period != 0 && i % plan.i_period == 0 && i_frames > 0 {
            // Replace this P with an I.
            i_frames -= 1;
            plan.entries.push(GopEntry {
                slice_type: SliceType::I,
                is_reference: true,
                pyramid_level: 0,
                left_ref_poc_diff: 0,
                right_ref_poc_diff: 0,
            });
            continue;
        }

        plan.entries.push(GopEntry {
            slice_type: SliceType::P,
            is_reference: true,
            pyramid_level: 0,
            left_ref_poc_diff: 0,
            right_ref_poc_diff: 0,
        });
    }

    // The GOP always ends on a P.
    if plan.idr_period > 1 && plan.ip_period > 0 {
        let last = plan.entries.last_mut().unwrap();
        last.slice_type = SliceType::P;
        last.is_reference = true;
    }
}

fn log_structure(plan: &GopPlan) {
    use std::fmt::Write;

    let mut out = String::from("[ IDR");
    for entry in plan.entries.iter().skip(1) {
        write!(out, ", {}", entry.slice_type).unwrap();
        if plan.b_pyramid && entry.slice_type == SliceType::B {
            write!(
                out,
                "<L{} ({}, {})>",
                entry.pyramid_level, entry.left_ref_poc_diff, entry.right_ref_poc_diff
            )
            .unwrap();
        }

        if entry.is_reference {
            out.push_str("(ref)");
        }
    }
    out.push_str(" ]");

    debug!(
        gop_size = plan.idr_period,
        ref_num_list0 = plan.ref_num_list0,
        ref_num_list1 = plan.ref_num_list1,
        structure = %out,
        "GOP structure"
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::VideoCodec;

    fn cfg(idr_period: u32, num_bframes: u32, b_pyramid: bool, num_ref: u32) -> EncoderConfig {
        let mut cfg = EncoderConfig::new(VideoCodec::H265, 1280, 720, (30, 1));
        cfg.idr_period = idr_period;
        cfg.num_bframes = num_bframes;
        cfg.b_pyramid = b_pyramid;
        cfg.num_ref_frames = num_ref;
        cfg
    }

    fn types(plan: &GopPlan) -> Vec<SliceType> {
        plan.entries.iter().map(|e| e.slice_type).collect()
    }

    #[test]
    fn test_flat_ip() {
        let plan = plan(&cfg(33, 0, false, 1), 16, 16);

        assert_eq!(plan.ip_period, 1);
        assert_eq!(plan.ref_num_list0, 1);
        assert_eq!(plan.ref_num_list1, 0);
        assert_eq!(plan.num_reorder_frames, 0);
        assert_eq!(plan.entries.len(), 33);
        assert_eq!(plan.entries[0].slice_type, SliceType::I);
        assert!(plan.entries[1..]
            .iter()
            .all(|e| e.slice_type == SliceType::P && e.is_reference));

        // 33 frames need a 6-bit frame_num, and the POC space must not
        // collide within a GOP.
        assert_eq!(plan.log2_max_frame_num, 6);
        assert_eq!(plan.max_frame_num, 64);
        assert_eq!(plan.max_pic_order_cnt, 128);
        assert!(plan.max_pic_order_cnt > 2 * plan.idr_period);
    }

    #[test]
    fn test_pyramid_gop8() {
        let plan = plan(&cfg(8, 3, true, 3), 16, 16);

        assert_eq!(plan.ip_period, 4);
        assert!(plan.b_pyramid);
        assert_eq!(plan.highest_pyramid_level, 1);
        assert_eq!(plan.ref_num_list0, 2);
        assert_eq!(plan.ref_num_list1, 1);
        assert_eq!(plan.num_reorder_frames, 2);

        assert_eq!(
            types(&plan),
            vec![
                SliceType::I,
                SliceType::B,
                SliceType::B,
                SliceType::B,
                SliceType::P,
                SliceType::B,
                SliceType::B,
                // Forced P at the GOP end.
                SliceType::P,
            ]
        );

        // The middle B of a run of three is the level-0 reference.
        assert_eq!(plan.entries[1].pyramid_level, 1);
        assert!(!plan.entries[1].is_reference);
        assert_eq!(plan.entries[2].pyramid_level, 0);
        assert!(plan.entries[2].is_reference);
        assert_eq!(plan.entries[2].left_ref_poc_diff, -4);
        assert_eq!(plan.entries[2].right_ref_poc_diff, 4);
        assert_eq!(plan.entries[3].pyramid_level, 1);
        assert!(!plan.entries[3].is_reference);
    }

    #[test]
    fn test_intra_only() {
        let plan = plan(&cfg(4, 2, true, 3), 0, 0);

        assert_eq!(plan.ip_period, 0);
        assert_eq!(plan.num_ref_frames, 0);
        assert_eq!(plan.num_iframes, 3);
        assert_eq!(
            types(&plan),
            vec![SliceType::I, SliceType::I, SliceType::I, SliceType::I]
        );
        assert!(plan.entries[0].is_reference);
        assert!(plan.entries[1..].iter().all(|e| !e.is_reference));
    }

    #[test]
    fn test_iframe_insertion_spacing() {
        let mut cfg = cfg(30, 0, false, 1);
        cfg.num_iframes = 2;
        let plan = plan(&cfg, 16, 16);

        // gop_ref_num = 30, i_period = (30 / 3) * 1 = 10.
        assert_eq!(plan.i_period, 10);

        let i_positions: Vec<usize> = plan
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.slice_type == SliceType::I)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(i_positions, vec![0, 10, 20]);
    }

    #[test]
    fn test_bframe_clamping() {
        // Short GOPs keep anchors at both ends.
        let short_plan = plan(&cfg(4, 8, false, 3), 16, 16);
        assert_eq!(short_plan.num_bframes, 2);

        // Long GOPs cap B runs at half the GOP.
        let long_plan = plan(&cfg(17, 30, false, 3), 16, 16);
        assert_eq!(long_plan.num_bframes, 8);
    }

    #[test]
    fn test_idr_period_default_is_one_second() {
        let mut cfg = cfg(0, 0, false, 1);
        cfg.fps = (30000, 1001);
        let plan = plan(&cfg, 16, 16);
        assert_eq!(plan.idr_period, 30);
    }

    #[test]
    fn test_no_list1_support_disables_b() {
        let plan = plan(&cfg(16, 3, true, 4), 16, 0);
        assert_eq!(plan.num_bframes, 0);
        assert!(!plan.b_pyramid);
        assert!(types(&plan)[1..].iter().all(|t| *t == SliceType::P));
    }
}
