// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! Codec level selection from resolution, frame rate and bitrate.

use crate::config::Profile;
use crate::{Error, Result};

/// One row of H.264 Table A-1.
#[derive(Debug, Clone, Copy)]
pub struct H264Level {
    pub name: &'static str,
    pub level_idc: u8,
    pub max_mbps: u32,
    pub max_fs: u32,
    pub max_dpb_mbs: u32,
    pub max_br: u32,
    pub max_cpb: u32,
    pub min_cr: u32,
}

pub const H264_LEVELS: &[H264Level] = &[
    H264Level { name: "1", level_idc: 10, max_mbps: 1485, max_fs: 99, max_dpb_mbs: 396, max_br: 64, max_cpb: 175, min_cr: 2 },
    H264Level { name: "1b", level_idc: 9, max_mbps: 1485, max_fs: 99, max_dpb_mbs: 396, max_br: 128, max_cpb: 350, min_cr: 2 },
    H264Level { name: "1.1", level_idc: 11, max_mbps: 3000, max_fs: 396, max_dpb_mbs: 900, max_br: 192, max_cpb: 500, min_cr: 2 },
    H264Level { name: "1.2", level_idc: 12, max_mbps: 6000, max_fs: 396, max_dpb_mbs: 2376, max_br: 384, max_cpb: 1000, min_cr: 2 },
    H264Level { name: "1.3", level_idc: 13, max_mbps: 11880, max_fs: 396, max_dpb_mbs: 2376, max_br: 768, max_cpb: 2000, min_cr: 2 },
    H264Level { name: "2", level_idc: 20, max_mbps: 11880, max_fs: 396, max_dpb_mbs: 2376, max_br: 2000, max_cpb: 2000, min_cr: 2 },
    H264Level { name: "2.1", level_idc: 21, max_mbps: 19800, max_fs: 792, max_dpb_mbs: 4752, max_br: 4000, max_cpb: 4000, min_cr: 2 },
    H264Level { name: "2.2", level_idc: 22, max_mbps: 20250, max_fs: 1620, max_dpb_mbs: 8100, max_br: 4000, max_cpb: 4000, min_cr: 2 },
    H264Level { name: "3", level_idc: 30, max_mbps: 40500, max_fs: 1620, max_dpb_mbs: 8100, max_br: 10000, max_cpb: 10000, min_cr: 2 },
    H264Level { name: "3.1", level_idc: 31, max_mbps: 108000, max_fs: 3600, max_dpb_mbs: 18000, max_br: 14000, max_cpb: 14000, min_cr: 4 },
    H264Level { name: "3.2", level_idc: 32, max_mbps: 216000, max_fs: 5120, max_dpb_mbs: 20480, max_br: 20000, max_cpb: 20000, min_cr: 4 },
    H264Level { name: "4", level_idc: 40, max_mbps: 245760, max_fs: 8192, max_dpb_mbs: 32768, max_br: 20000, max_cpb: 25000, min_cr: 4 },
    H264Level { name: "4.1", level_idc: 41, max_mbps: 245760, max_fs: 8192, max_dpb_mbs: 32768, max_br: 50000, max_cpb: 62500, min_cr: 2 },
    H264Level { name: "4.2", level_idc: 42, max_mbps: 522240, max_fs: 8704, max_dpb_mbs: 34816, max_br: 50000, max_cpb: 62500, min_cr: 2 },
    H264Level { name: "5", level_idc: 50, max_mbps: 589824, max_fs: 22080, max_dpb_mbs: 110400, max_br: 135000, max_cpb: 135000, min_cr: 2 },
    H264Level { name: "5.1", level_idc: 51, max_mbps: 983040, max_fs: 36864, max_dpb_mbs: 184320, max_br: 240000, max_cpb: 240000, min_cr: 2 },
    H264Level { name: "5.2", level_idc: 52, max_mbps: 2073600, max_fs: 36864, max_dpb_mbs: 184320, max_br: 240000, max_cpb: 240000, min_cr: 2 },
    H264Level { name: "6", level_idc: 60, max_mbps: 4177920, max_fs: 139264, max_dpb_mbs: 696320, max_br: 240000, max_cpb: 240000, min_cr: 2 },
    H264Level { name: "6.1", level_idc: 61, max_mbps: 8355840, max_fs: 139264, max_dpb_mbs: 696320, max_br: 480000, max_cpb: 480000, min_cr: 2 },
    H264Level { name: "6.2", level_idc: 62, max_mbps: 16711680, max_fs: 139264, max_dpb_mbs: 696320, max_br: 800000, max_cpb: 800000, min_cr: 2 },
];

/// The cpbBrNalFactor of Table A-2, by profile.
fn h264_cpb_nal_factor(profile: Profile) -> u32 {
    match profile {
        Profile::High => 1500,
        _ => 1200,
    }
}

/// Picks the first H.264 level that fits the macroblock rate, frame
/// size, DPB depth and bitrate.
pub fn select_h264_level(
    mb_width: u32,
    mb_height: u32,
    fps: (u32, u32),
    num_ref_frames: u32,
    max_bitrate_bits: u32,
    cpb_length_bits: u32,
    profile: Profile,
) -> Result<&'static H264Level> {
    let cpb_factor = h264_cpb_nal_factor(profile);

    let pic_size_mbs = mb_width * mb_height;
    let max_dpb_mbs = pic_size_mbs * (num_ref_frames + 1);
    let max_mbps = (pic_size_mbs as u64 * fps.0 as u64).div_ceil(fps.1 as u64) as u32;

    for level in H264_LEVELS {
        if pic_size_mbs <= level.max_fs
            && max_dpb_mbs <= level.max_dpb_mbs
            && max_mbps <= level.max_mbps
            && (max_bitrate_bits == 0
                || max_bitrate_bits as u64 <= level.max_br as u64 * 1000 * cpb_factor as u64)
            && (cpb_length_bits == 0
                || cpb_length_bits as u64 <= level.max_cpb as u64 * 1000 * cpb_factor as u64)
        {
            return Ok(level);
        }
    }

    Err(Error::config(format!(
        "no H.264 level fits {mb_width}x{mb_height} MBs at {}/{} fps",
        fps.0, fps.1
    )))
}

/// One row of the H.265 general tier and level limits (Table A.8/A.9).
/// Bitrates are in kbit/s; a zero high-tier bitrate means the level has
/// no high tier.
#[derive(Debug, Clone, Copy)]
pub struct H265Level {
    pub name: &'static str,
    pub level_idc: u8,
    pub max_luma_ps: u32,
    pub max_cpb_tier_main: u32,
    pub max_cpb_tier_high: u32,
    pub max_slice_segments_per_picture: u32,
    pub max_tile_rows: u32,
    pub max_tile_columns: u32,
    pub max_luma_sr: u64,
    pub max_br_tier_main: u32,
    pub max_br_tier_high: u32,
    pub min_cr: u32,
}

pub const H265_LEVELS: &[H265Level] = &[
    H265Level { name: "1", level_idc: 30, max_luma_ps: 36864, max_cpb_tier_main: 350, max_cpb_tier_high: 0, max_slice_segments_per_picture: 16, max_tile_rows: 1, max_tile_columns: 1, max_luma_sr: 552960, max_br_tier_main: 128, max_br_tier_high: 0, min_cr: 2 },
    H265Level { name: "2", level_idc: 60, max_luma_ps: 122880, max_cpb_tier_main: 1500, max_cpb_tier_high: 0, max_slice_segments_per_picture: 16, max_tile_rows: 1, max_tile_columns: 1, max_luma_sr: 3686400, max_br_tier_main: 1500, max_br_tier_high: 0, min_cr: 2 },
    H265Level { name: "2.1", level_idc: 63, max_luma_ps: 245760, max_cpb_tier_main: 3000, max_cpb_tier_high: 0, max_slice_segments_per_picture: 20, max_tile_rows: 1, max_tile_columns: 1, max_luma_sr: 7372800, max_br_tier_main: 3000, max_br_tier_high: 0, min_cr: 2 },
    H265Level { name: "3", level_idc: 90, max_luma_ps: 552960, max_cpb_tier_main: 6000, max_cpb_tier_high: 0, max_slice_segments_per_picture: 30, max_tile_rows: 2, max_tile_columns: 2, max_luma_sr: 16588800, max_br_tier_main: 6000, max_br_tier_high: 0, min_cr: 2 },
    H265Level { name: "3.1", level_idc: 93, max_luma_ps: 983040, max_cpb_tier_main: 10000, max_cpb_tier_high: 0, max_slice_segments_per_picture: 40, max_tile_rows: 3, max_tile_columns: 3, max_luma_sr: 33177600, max_br_tier_main: 10000, max_br_tier_high: 0, min_cr: 2 },
    H265Level { name: "4", level_idc: 120, max_luma_ps: 2228224, max_cpb_tier_main: 12000, max_cpb_tier_high: 30000, max_slice_segments_per_picture: 75, max_tile_rows: 5, max_tile_columns: 5, max_luma_sr: 66846720, max_br_tier_main: 12000, max_br_tier_high: 30000, min_cr: 4 },
    H265Level { name: "4.1", level_idc: 123, max_luma_ps: 2228224, max_cpb_tier_main: 20000, max_cpb_tier_high: 50000, max_slice_segments_per_picture: 75, max_tile_rows: 5, max_tile_columns: 5, max_luma_sr: 133693440, max_br_tier_main: 20000, max_br_tier_high: 50000, min_cr: 4 },
    H265Level { name: "5", level_idc: 150, max_luma_ps: 8912896, max_cpb_tier_main: 25000, max_cpb_tier_high: 100000, max_slice_segments_per_picture: 200, max_tile_rows: 11, max_tile_columns: 10, max_luma_sr: 267386880, max_br_tier_main: 25000, max_br_tier_high: 100000, min_cr: 6 },
    H265Level { name: "5.1", level_idc: 153, max_luma_ps: 8912896, max_cpb_tier_main: 40000, max_cpb_tier_high: 160000, max_slice_segments_per_picture: 200, max_tile_rows: 11, max_tile_columns: 10, max_luma_sr: 534773760, max_br_tier_main: 40000, max_br_tier_high: 160000, min_cr: 8 },
    H265Level { name: "5.2", level_idc: 156, max_luma_ps: 8912896, max_cpb_tier_main: 60000, max_cpb_tier_high: 240000, max_slice_segments_per_picture: 200, max_tile_rows: 11, max_tile_columns: 10, max_luma_sr: 1069547520, max_br_tier_main: 60000, max_br_tier_high: 240000, min_cr: 8 },
    H265Level { name: "6", level_idc: 180, max_luma_ps: 35651584, max_cpb_tier_main: 60000, max_cpb_tier_high: 240000, max_slice_segments_per_picture: 600, max_tile_rows: 22, max_tile_columns: 20, max_luma_sr: 1069547520, max_br_tier_main: 60000, max_br_tier_high: 240000, min_cr: 8 },
    H265Level { name: "6.1", level_idc: 183, max_luma_ps: 35651584, max_cpb_tier_main: 120000, max_cpb_tier_high: 480000, max_slice_segments_per_picture: 600, max_tile_rows: 22, max_tile_columns: 20, max_luma_sr: 2139095040, max_br_tier_main: 120000, max_br_tier_high: 480000, min_cr: 8 },
    H265Level { name: "6.2", level_idc: 186, max_luma_ps: 35651584, max_cpb_tier_main: 240000, max_cpb_tier_high: 800000, max_slice_segments_per_picture: 600, max_tile_rows: 22, max_tile_columns: 20, max_luma_sr: 4278190080, max_br_tier_main: 240000, max_br_tier_high: 800000, min_cr: 6 },
];

/// Picks the first H.265 level whose luma picture size and sample rate
/// fit, and derives the tier flag from `max_bitrate` (kbit/s).
pub fn select_h265_level(
    luma_width: u32,
    luma_height: u32,
    fps: (u32, u32),
    max_bitrate: u32,
) -> Result<(&'static H265Level, bool)> {
    let pic_size_in_samples_y = luma_width * luma_height;
    let luma_sr = (pic_size_in_samples_y as u64 * fps.0 as u64).div_ceil(fps.1 as u64);

    let level = H265_LEVELS
        .iter()
        .find(|level| {
            pic_size_in_samples_y <= level.max_luma_ps && luma_sr <= level.max_luma_sr
        })
        .ok_or_else(|| {
            Error::config(format!(
                "no H.265 level fits {luma_width}x{luma_height} at {}/{} fps",
                fps.0, fps.1
            ))
        })?;

    let tier_flag = level.max_br_tier_high != 0 && max_bitrate > level.max_br_tier_main;

    if max_bitrate
        > if tier_flag {
            level.max_br_tier_high
        } else {
            level.max_br_tier_main
        }
    {
        tracing::debug!(
            max_bitrate,
            level = level.name,
            tier = if tier_flag { "high" } else { "main" },
            "stream bitrate exceeds the selected tier's maximum"
        );
    }

    Ok((level, tier_flag))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_h264_level_for_qcif() {
        // 176x144 is 11x9 macroblocks; a single reference fits level 1.
        let level = select_h264_level(11, 9, (15, 1), 1, 0, 0, Profile::Main).unwrap();
        assert_eq!(level.name, "1");
        assert_eq!(level.level_idc, 10);
    }

    #[test]
    fn test_h264_level_for_1080p() {
        let level = select_h264_level(120, 68, (30, 1), 3, 0, 0, Profile::High).unwrap();
        assert_eq!(level.name, "4");
    }

    #[test]
    fn test_h264_dpb_depth_pushes_level_up() {
        // 720p30 fits 3.1 with one reference; a deep DPB forces 4.
        let level = select_h264_level(80, 45, (30, 1), 1, 0, 0, Profile::High).unwrap();
        assert_eq!(level.name, "3.1");

        let level = select_h264_level(80, 45, (30, 1), 8, 0, 0, Profile::High).unwrap();
        assert_eq!(level.name, "4");
    }

    #[test]
    fn test_h264_unreachable_level() {
        assert!(select_h264_level(1000, 1000, (60, 1), 16, 0, 0, Profile::High).is_err());
    }

    #[test]
    fn test_h265_level_for_4k() {
        let (level, tier) = select_h265_level(3840, 2160, (30, 1), 0).unwrap();
        assert_eq!(level.name, "5");
        assert_eq!(level.level_idc, 150);
        assert!(!tier);
    }

    #[test]
    fn test_h265_high_tier() {
        // 4K at 30fps with a bitrate over the main-tier ceiling.
        let (level, tier) = select_h265_level(3840, 2160, (30, 1), 30_000).unwrap();
        assert_eq!(level.name, "5");
        assert!(tier);

        // Levels without a high tier never set the flag.
        let (level, tier) = select_h265_level(320, 240, (15, 1), 10_000).unwrap();
        assert_eq!(level.max_br_tier_high, 0);
        assert!(!tier);
    }
}
