// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! The H.265 encoder. Unlike H.264 this path carries the full B-frame
//! and b-pyramid machinery; references are described to the decoder
//! through short-term reference picture sets instead of MMCO.

use std::sync::Arc;

use ash::vk;
use ash::vk::native::{
    StdVideoEncodeH265PictureInfo, StdVideoEncodeH265ReferenceInfo,
    StdVideoEncodeH265ReferenceListsInfo, StdVideoEncodeH265SliceSegmentHeader,
    StdVideoEncodeH265WeightTable, StdVideoH265ChromaFormatIdc_STD_VIDEO_H265_CHROMA_FORMAT_IDC_420,
    StdVideoH265DecPicBufMgr, StdVideoH265PictureParameterSet, StdVideoH265ProfileTierLevel,
    StdVideoH265SequenceParameterSet, StdVideoH265SequenceParameterSetVui,
    StdVideoH265ShortTermRefPicSet, StdVideoH265VideoParameterSet,
};
use bytes::Bytes;
use tracing::{debug, trace};

use crate::bitstream::{BitstreamAssembler, CodecBitWriter};
use crate::config::{EncoderConfig, Profile, RateControlMode};
use crate::frame::FrameId;
use crate::gop::{self, GopPlan};
use crate::gpu::{vk_chain, DpbImagePool, GpuContext, VkHostBuffer, VkImage};
use crate::levels::{self, H265Level};
use crate::operation::OperationRecorder;
use crate::rate_control;
use crate::session::{make_video_std_version, StdHeader, VideoSession};
use crate::stats::EncodeStats;
use crate::{Error, Result, SliceType, VideoCodec};

use super::{
    drain_ready, submit_encode, CodecOps, EncodedFrame, FrameError, FrameScheduler,
    ScheduledPicture, OUTPUT_BUFFER_SIZE,
};

const STD_HEADER: StdHeader = StdHeader {
    name: c"VK_STD_vulkan_video_codec_h265_encode",
    spec_version: make_video_std_version(1, 0, 0),
};
const MIN_STD_VERSION: u32 = make_video_std_version(1, 0, 0);

vk_chain! {
    pub struct H265EncodeProfile<'a> {
        pub profile_info: vk::VideoProfileInfoKHR<'a>,
        pub usage_info: vk::VideoEncodeUsageInfoKHR<'a>,
        pub h265_profile: vk::VideoEncodeH265ProfileInfoKHR<'a>,
    }
}

vk_chain! {
    pub struct H265EncodeCapabilities<'a> {
        pub video_caps: vk::VideoCapabilitiesKHR<'a>,
        pub encode_caps: vk::VideoEncodeCapabilitiesKHR<'a>,
        pub h265_caps: vk::VideoEncodeH265CapabilitiesKHR<'a>,
    }
}

// See the matching comment in encoder/h264.rs: ash's bindgen output
// drops C #define constants, so the codec header's
// `STD_VIDEO_H265_NO_REFERENCE_PICTURE` / `_MAX_NUM_LIST_REF` macros
// are redefined locally. Values are fixed by the Vulkan video std
// header and cross-checked against the `RefPicList0`/`RefPicList1`
// array lengths ash does generate.
const STD_VIDEO_H265_NO_REFERENCE_PICTURE: u8 = 0xFF;
const STD_VIDEO_H265_MAX_NUM_LIST_REF: usize = 15;

pub(crate) struct H265Ops;

impl CodecOps for H265Ops {
    const CODEC: VideoCodec = VideoCodec::H265;
    const NO_REFERENCE_PICTURE: u8 = STD_VIDEO_H265_NO_REFERENCE_PICTURE;
    const MAX_LIST_REFS: usize = STD_VIDEO_H265_MAX_NUM_LIST_REF;
    const SUPPORTS_BFRAMES: bool = true;

    fn std_slice_type(ty: SliceType) -> u32 {
        match ty {
            SliceType::B => vk::native::StdVideoH265SliceType_STD_VIDEO_H265_SLICE_TYPE_B,
            SliceType::P => vk::native::StdVideoH265SliceType_STD_VIDEO_H265_SLICE_TYPE_P,
            SliceType::I => vk::native::StdVideoH265SliceType_STD_VIDEO_H265_SLICE_TYPE_I,
        }
    }

    fn std_pic_type(ty: SliceType, is_idr: bool) -> u32 {
        if is_idr {
            return vk::native::StdVideoH265PictureType_STD_VIDEO_H265_PICTURE_TYPE_IDR;
        }

        match ty {
            SliceType::P => vk::native::StdVideoH265PictureType_STD_VIDEO_H265_PICTURE_TYPE_P,
            SliceType::B => vk::native::StdVideoH265PictureType_STD_VIDEO_H265_PICTURE_TYPE_B,
            SliceType::I => vk::native::StdVideoH265PictureType_STD_VIDEO_H265_PICTURE_TYPE_I,
        }
    }
}

fn std_profile_idc(profile: Profile) -> u32 {
    match profile {
        Profile::Main10 => vk::native::StdVideoH265ProfileIdc_STD_VIDEO_H265_PROFILE_IDC_MAIN_10,
        _ => vk::native::StdVideoH265ProfileIdc_STD_VIDEO_H265_PROFILE_IDC_MAIN,
    }
}

fn std_level_idc(level_idc: u8) -> u32 {
    use vk::native::*;
    match level_idc {
        30 => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_1_0,
        60 => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_2_0,
        63 => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_2_1,
        90 => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_3_0,
        93 => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_3_1,
        120 => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_4_0,
        123 => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_4_1,
        150 => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_5_0,
        153 => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_5_1,
        156 => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_5_2,
        180 => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_6_0,
        183 => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_6_1,
        _ => StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_6_2,
    }
}

/// Coding-block geometry probed from the implementation's CTB and
/// transform-block support.
#[derive(Debug, Clone, Copy)]
struct BlockSizes {
    min_ctb: u32,
    max_ctb: u32,
    min_tbs: u32,
    max_tbs: u32,
}

fn probe_block_sizes(caps: &vk::VideoEncodeH265CapabilitiesKHR) -> Result<BlockSizes> {
    const CTB_SIZES: [(vk::VideoEncodeH265CtbSizeFlagsKHR, u32); 3] = [
        (vk::VideoEncodeH265CtbSizeFlagsKHR::TYPE_16, 16),
        (vk::VideoEncodeH265CtbSizeFlagsKHR::TYPE_32, 32),
        (vk::VideoEncodeH265CtbSizeFlagsKHR::TYPE_64, 64),
    ];

    const TBS_SIZES: [(vk::VideoEncodeH265TransformBlockSizeFlagsKHR, u32); 4] = [
        (vk::VideoEncodeH265TransformBlockSizeFlagsKHR::TYPE_4, 4),
        (vk::VideoEncodeH265TransformBlockSizeFlagsKHR::TYPE_8, 8),
        (vk::VideoEncodeH265TransformBlockSizeFlagsKHR::TYPE_16, 16),
        (vk::VideoEncodeH265TransformBlockSizeFlagsKHR::TYPE_32, 32),
    ];

    let ctbs: Vec<u32> = CTB_SIZES
        .iter()
        .filter(|(flag, _)| caps.ctb_sizes.contains(*flag))
        .map(|(_, size)| *size)
        .collect();
    let tbs: Vec<u32> = TBS_SIZES
        .iter()
        .filter(|(flag, _)| caps.transform_block_sizes.contains(*flag))
        .map(|(_, size)| *size)
        .collect();

    match (ctbs.first(), ctbs.last(), tbs.first(), tbs.last()) {
        (Some(min_ctb), Some(max_ctb), Some(min_tbs), Some(max_tbs)) => Ok(BlockSizes {
            min_ctb: *min_ctb,
            max_ctb: *max_ctb,
            min_tbs: *min_tbs,
            max_tbs: *max_tbs,
        }),
        _ => Err(Error::config(
            "implementation advertises no CTB or transform block sizes",
        )),
    }
}

/// The std parameter sets the session was created with, boxed so the
/// cross-struct pointers stay put.
struct H265StdParams {
    vps: StdVideoH265VideoParameterSet,
    sps: StdVideoH265SequenceParameterSet,
    pps: StdVideoH265PictureParameterSet,
    vui: StdVideoH265SequenceParameterSetVui,
    ptl: StdVideoH265ProfileTierLevel,
    pbm: StdVideoH265DecPicBufMgr,
}

// SAFETY: the pointers inside refer into the same box.
unsafe impl Send for H265StdParams {}

pub struct H265Encoder {
    gpu: Arc<GpuContext>,
    writer: Box<dyn CodecBitWriter>,
    cfg: EncoderConfig,
    pending_cfg: Option<EncoderConfig>,

    profile: H265EncodeProfile,
    session: VideoSession,
    recorder: OperationRecorder,
    scheduler: FrameScheduler,
    assembler: BitstreamAssembler,
    dpb_images: DpbImagePool,
    output_buffer: VkHostBuffer,

    std_params: Box<H265StdParams>,
    headers: Bytes,
    rc_mode: RateControlMode,
    level: &'static H265Level,
    tier_flag: bool,
    block_sizes: BlockSizes,
    max_refs: (u32, u32),
    aligned_width: u32,
    aligned_height: u32,
    first_encode_done: bool,
    stats: EncodeStats,
}

impl H265Encoder {
    pub fn new(
        gpu: Arc<GpuContext>,
        writer: Box<dyn CodecBitWriter>,
        cfg: EncoderConfig,
    ) -> Result<Self> {
        let mut profile = H265EncodeProfile::new(
            vk::VideoProfileInfoKHR::default()
                .video_codec_operation(vk::VideoCodecOperationFlagsKHR::ENCODE_H265)
                .chroma_subsampling(cfg.chroma_subsampling())
                .luma_bit_depth(cfg.component_bit_depth())
                .chroma_bit_depth(cfg.component_bit_depth()),
            vk::VideoEncodeUsageInfoKHR::default(),
            vk::VideoEncodeH265ProfileInfoKHR::default().std_profile_idc(std_profile_idc(cfg.profile)),
        );

        let mut caps = H265EncodeCapabilities::default();
        unsafe {
            gpu.video_fns
                .get_physical_device_video_capabilities(
                    gpu.pdevice,
                    &profile.profile_info,
                    caps.as_mut(),
                )
                .map_err(|result| Error::Gpu {
                    call: "vkGetPhysicalDeviceVideoCapabilitiesKHR",
                    result,
                })?;
        }

        trace!(video_caps = ?caps.video_caps, "video capabilities");
        trace!(encode_caps = ?caps.encode_caps, "encode capabilities");
        trace!(h265_caps = ?caps.h265_caps, "h265 capabilities");

        let max_refs = (
            caps.h265_caps.max_p_picture_l0_reference_count,
            caps.h265_caps.max_l1_reference_count,
        );

        let plan = gop::plan(&cfg, max_refs.0, max_refs.1);

        let block_sizes = probe_block_sizes(&caps.h265_caps)?;

        let granularity = caps.encode_caps.encode_input_picture_granularity;
        let aligned_width = cfg.width.next_multiple_of(granularity.width.max(1));
        let aligned_height = cfg.height.next_multiple_of(granularity.height.max(1));

        trace!(?block_sizes, aligned_width, aligned_height, "h265 geometry");

        let (level, tier_flag) = match cfg.level_idc {
            Some(idc) => (
                levels::H265_LEVELS
                    .iter()
                    .find(|level| level.level_idc == idc)
                    .ok_or_else(|| Error::config(format!("unknown H.265 level idc {idc}")))?,
                false,
            ),
            None => levels::select_h265_level(
                aligned_width,
                aligned_height,
                cfg.fps,
                cfg.average_bitrate / 1000,
            )?,
        };

        if caps.h265_caps.max_level_idc != 0
            && caps.h265_caps.max_level_idc < std_level_idc(level.level_idc)
        {
            return Err(Error::config(format!(
                "level {} beyond the implementation's maximum",
                level.name
            )));
        }

        debug!(
            level = level.name,
            tier = if tier_flag { "high" } else { "main" },
            "selected H.265 level"
        );

        let rc_mode = rate_control::select_mode(&cfg, &caps.encode_caps);

        let std_params = build_std_params(
            &cfg,
            &plan,
            level,
            tier_flag,
            block_sizes,
            aligned_width,
            aligned_height,
        );

        let mut recorder = OperationRecorder::new(gpu.clone());

        let session = {
            let vps = [std_params.vps];
            let sps = [std_params.sps];
            let pps = [std_params.pps];

            let add_info = vk::VideoEncodeH265SessionParametersAddInfoKHR::default()
                .std_vp_ss(&vps)
                .std_sp_ss(&sps)
                .std_pp_ss(&pps);
            let mut params_create = vk::VideoEncodeH265SessionParametersCreateInfoKHR::default()
                .max_std_vps_count(1)
                .max_std_sps_count(1)
                .max_std_pps_count(1)
                .parameters_add_info(&add_info);

            unsafe {
                VideoSession::start(
                    gpu.clone(),
                    profile.as_mut(),
                    caps.video_caps,
                    caps.encode_caps,
                    &STD_HEADER,
                    MIN_STD_VERSION,
                    aligned_width,
                    aligned_height,
                    &mut params_create,
                    &mut recorder,
                )?
            }
        };

        let separate_images = caps
            .video_caps
            .flags
            .contains(vk::VideoCapabilityFlagsKHR::SEPARATE_REFERENCE_IMAGES);

        let max_dpb_slots = caps.video_caps.max_dpb_slots as usize;
        let dpb_images = DpbImagePool::new(
            gpu.clone(),
            profile.as_mut(),
            session.dpb_format,
            aligned_width,
            aligned_height,
            plan.required_dpb_size().min(max_dpb_slots),
            separate_images,
        )?;

        let output_size = OUTPUT_BUFFER_SIZE
            .next_multiple_of(caps.video_caps.min_bitstream_buffer_size_alignment as usize);
        let output_buffer = VkHostBuffer::new(
            gpu.clone(),
            vk::BufferUsageFlags::VIDEO_ENCODE_DST_KHR,
            Some(profile.as_mut()),
            output_size,
        )?;

        let headers = unsafe {
            let mut get_info = vk::VideoEncodeH265SessionParametersGetInfoKHR::default()
                .write_std_vps(true)
                .write_std_sps(true)
                .write_std_pps(true);
            Bytes::from(session.read_session_headers(&mut get_info)?)
        };

        let scheduler = FrameScheduler::new(&cfg, plan, max_dpb_slots);
        let assembler = BitstreamAssembler::new(H265Ops::CODEC, cfg.aud, cfg.cc_insert);

        Ok(H265Encoder {
            gpu,
            writer,
            cfg,
            pending_cfg: None,
            profile,
            session,
            recorder,
            scheduler,
            assembler,
            dpb_images,
            output_buffer,
            std_params,
            headers,
            rc_mode,
            level,
            tier_flag,
            block_sizes,
            max_refs,
            aligned_width,
            aligned_height,
            first_encode_done: false,
            stats: EncodeStats::default(),
        })
    }

    pub unsafe fn push_frame(
        &mut self,
        image: Arc<VkImage>,
        system_frame_number: u64,
        captions: Option<Bytes>,
        force_keyframe: bool,
    ) -> Result<Vec<EncodedFrame>> {
        let mut out = Vec::new();

        if force_keyframe && !self.scheduler.at_gop_boundary() {
            self.scheduler.finish_gop()?;
            out.extend(self.drain()?);
        }

        self.maybe_apply_pending_config()?;

        self.scheduler
            .admit(Some(image), system_frame_number, captions, force_keyframe)?;
        out.extend(self.drain()?);

        Ok(out)
    }

    pub unsafe fn flush(&mut self) -> Result<Vec<EncodedFrame>> {
        self.scheduler.finish_gop()?;
        let out = self.drain()?;
        self.scheduler.reorder.reset();
        Ok(out)
    }

    pub fn request_config_change(&mut self, cfg: EncoderConfig) {
        self.pending_cfg = Some(cfg);
    }

    pub fn input_format(&self) -> vk::Format {
        self.session.input_format
    }

    pub fn create_input_image(&mut self) -> Result<VkImage> {
        VkImage::new(
            self.gpu.clone(),
            self.session.input_format,
            self.aligned_width,
            self.aligned_height,
            1,
            vk::ImageUsageFlags::VIDEO_ENCODE_SRC_KHR | vk::ImageUsageFlags::TRANSFER_DST,
            Some(self.profile.as_mut()),
            true,
        )
    }

    pub fn stats(&self) -> EncodeStats {
        self.stats.clone()
    }

    pub unsafe fn stop(&mut self) {
        let _ = self.recorder.wait(u64::MAX);
        self.session.stop();
    }

    unsafe fn drain(&mut self) -> Result<Vec<EncodedFrame>> {
        let Self {
            gpu,
            writer,
            cfg,
            session,
            recorder,
            scheduler,
            assembler,
            dpb_images,
            output_buffer,
            headers,
            rc_mode,
            block_sizes,
            first_encode_done,
            stats,
            ..
        } = self;

        drain_ready(scheduler, stats, |scheduler, sched| {
            encode_scheduled(
                gpu,
                session,
                recorder,
                dpb_images,
                output_buffer,
                writer.as_mut(),
                assembler,
                headers,
                cfg,
                *rc_mode,
                block_sizes.min_ctb,
                first_encode_done,
                scheduler,
                sched,
            )
        })
    }

    unsafe fn maybe_apply_pending_config(&mut self) -> Result<()> {
        if self.pending_cfg.is_none() || !self.scheduler.at_gop_boundary() {
            return Ok(());
        }

        let cfg = self.pending_cfg.take().unwrap();
        cfg.validate()?;

        if cfg.codec != self.cfg.codec
            || cfg.width != self.cfg.width
            || cfg.height != self.cfg.height
            || cfg.profile != self.cfg.profile
        {
            return Err(Error::config(
                "codec, profile and resolution changes require a new encoder",
            ));
        }

        let plan = gop::plan(&cfg, self.max_refs.0, self.max_refs.1);
        let std_params = build_std_params(
            &cfg,
            &plan,
            self.level,
            self.tier_flag,
            self.block_sizes,
            self.aligned_width,
            self.aligned_height,
        );

        {
            let vps = [std_params.vps];
            let sps = [std_params.sps];
            let pps = [std_params.pps];

            let add_info = vk::VideoEncodeH265SessionParametersAddInfoKHR::default()
                .std_vp_ss(&vps)
                .std_sp_ss(&sps)
                .std_pp_ss(&pps);
            let mut params_create = vk::VideoEncodeH265SessionParametersCreateInfoKHR::default()
                .max_std_vps_count(1)
                .max_std_sps_count(1)
                .max_std_pps_count(1)
                .parameters_add_info(&add_info);

            self.session.rebuild_parameters(&mut params_create)?;
        }

        self.headers = {
            let mut get_info = vk::VideoEncodeH265SessionParametersGetInfoKHR::default()
                .write_std_vps(true)
                .write_std_sps(true)
                .write_std_pps(true);
            Bytes::from(self.session.read_session_headers(&mut get_info)?)
        };

        let max_dpb_slots = self.session.video_caps.max_dpb_slots as usize;
        self.scheduler.replan(&cfg, plan, max_dpb_slots);
        self.assembler = BitstreamAssembler::new(H265Ops::CODEC, cfg.aud, cfg.cc_insert);
        self.rc_mode = rate_control::select_mode(&cfg, &self.session.encode_caps);
        self.std_params = std_params;
        self.first_encode_done = false;
        self.cfg = cfg;

        debug!("applied staged configuration at GOP boundary");
        Ok(())
    }
}

impl Drop for H265Encoder {
    fn drop(&mut self) {
        unsafe { self.stop() };
    }
}

fn build_std_params(
    cfg: &EncoderConfig,
    plan: &GopPlan,
    level: &H265Level,
    tier_flag: bool,
    blocks: BlockSizes,
    aligned_width: u32,
    aligned_height: u32,
) -> Box<H265StdParams> {
    let crop_right = (aligned_width - cfg.width) / 2;
    let crop_bottom = (aligned_height - cfg.height) / 2;

    let mut vui = StdVideoH265SequenceParameterSetVui {
        aspect_ratio_idc:
            vk::native::StdVideoH265AspectRatioIdc_STD_VIDEO_H265_ASPECT_RATIO_IDC_SQUARE,
        vui_num_units_in_tick: cfg.fps.1,
        vui_time_scale: cfg.fps.0,
        ..unsafe { std::mem::zeroed() }
    };
    vui.flags.set_aspect_ratio_info_present_flag(1);
    vui.flags.set_vui_timing_info_present_flag(1);

    let mut ptl = StdVideoH265ProfileTierLevel {
        general_profile_idc: std_profile_idc(cfg.profile),
        general_level_idc: std_level_idc(level.level_idc),
        ..unsafe { std::mem::zeroed() }
    };
    ptl.flags.set_general_tier_flag(tier_flag as u32);
    ptl.flags.set_general_progressive_source_flag(1);
    ptl.flags.set_general_frame_only_constraint_flag(1);

    let mut pbm: StdVideoH265DecPicBufMgr = unsafe { std::mem::zeroed() };
    pbm.max_dec_pic_buffering_minus1[0] = (plan.required_dpb_size() - 1) as u8;
    pbm.max_num_reorder_pics[0] = plan.num_reorder_frames as u8;
    pbm.max_latency_increase_plus1[0] = 0;

    let mut vps = StdVideoH265VideoParameterSet {
        vps_video_parameter_set_id: 0,
        vps_max_sub_layers_minus1: 0,
        ..unsafe { std::mem::zeroed() }
    };
    vps.flags.set_vps_temporal_id_nesting_flag(1);
    vps.flags.set_vps_sub_layer_ordering_info_present_flag(1);

    let min_cb = 8u32;
    let max_cb = blocks.max_ctb;
    let max_transform_hierarchy_depth = (blocks.max_ctb.ilog2() - blocks.min_tbs.ilog2()) as u8;

    let mut sps = StdVideoH265SequenceParameterSet {
        sps_video_parameter_set_id: 0,
        sps_seq_parameter_set_id: 0,
        chroma_format_idc: StdVideoH265ChromaFormatIdc_STD_VIDEO_H265_CHROMA_FORMAT_IDC_420,
        pic_width_in_luma_samples: aligned_width,
        pic_height_in_luma_samples: aligned_height,
        sps_max_sub_layers_minus1: 0,
        bit_depth_luma_minus8: cfg.bit_depth - 8,
        bit_depth_chroma_minus8: cfg.bit_depth - 8,
        log2_max_pic_order_cnt_lsb_minus4: (plan.log2_max_pic_order_cnt - 4) as u8,
        log2_min_luma_coding_block_size_minus3: (min_cb.ilog2() - 3) as u8,
        log2_diff_max_min_luma_coding_block_size: (max_cb.ilog2() - min_cb.ilog2()) as u8,
        log2_min_luma_transform_block_size_minus2: (blocks.min_tbs.ilog2() - 2) as u8,
        log2_diff_max_min_luma_transform_block_size: (blocks.max_tbs.ilog2()
            - blocks.min_tbs.ilog2()) as u8,
        max_transform_hierarchy_depth_inter: max_transform_hierarchy_depth,
        max_transform_hierarchy_depth_intra: max_transform_hierarchy_depth,
        conf_win_right_offset: crop_right,
        conf_win_bottom_offset: crop_bottom,
        ..unsafe { std::mem::zeroed() }
    };

    sps.flags.set_sps_temporal_id_nesting_flag(1);
    sps.flags.set_sps_sub_layer_ordering_info_present_flag(1);
    sps.flags.set_sps_temporal_mvp_enabled_flag(1);
    sps.flags.set_strong_intra_smoothing_enabled_flag(1);
    sps.flags.set_vui_parameters_present_flag(1);
    if crop_right > 0 || crop_bottom > 0 {
        sps.flags.set_conformance_window_flag(1);
    }

    let mut pps = StdVideoH265PictureParameterSet {
        pps_pic_parameter_set_id: 0,
        pps_seq_parameter_set_id: 0,
        sps_video_parameter_set_id: 0,
        num_ref_idx_l0_default_active_minus1: 0,
        num_ref_idx_l1_default_active_minus1: 0,
        ..unsafe { std::mem::zeroed() }
    };
    pps.flags.set_pps_loop_filter_across_slices_enabled_flag(1);

    let mut params = Box::new(H265StdParams {
        vps,
        sps,
        pps,
        vui,
        ptl,
        pbm,
    });

    params.vps.pDecPicBufMgr = &params.pbm;
    params.vps.pProfileTierLevel = &params.ptl;
    params.sps.pProfileTierLevel = &params.ptl;
    params.sps.pDecPicBufMgr = &params.pbm;
    params.sps.pSequenceParameterSetVui = &params.vui;

    params
}

/// Derives the short-term reference picture set from the live reference
/// set: negative pictures before the current POC, positive after, with
/// the used-by-current flags following list0/list1 membership.
fn build_short_term_ref_set(
    scheduler: &FrameScheduler,
    current_poc: i32,
    list0: &[FrameId],
    list1: &[FrameId],
) -> StdVideoH265ShortTermRefPicSet {
    let arena = &scheduler.arena;

    let mut negative: Vec<FrameId> = scheduler
        .dpb
        .references()
        .iter()
        .copied()
        .filter(|id| arena.get(*id).poc < current_poc)
        .collect();
    negative.sort_by_key(|id| std::cmp::Reverse(arena.get(*id).poc));

    let mut positive: Vec<FrameId> = scheduler
        .dpb
        .references()
        .iter()
        .copied()
        .filter(|id| arena.get(*id).poc > current_poc)
        .collect();
    positive.sort_by_key(|id| arena.get(*id).poc);

    let mut set = StdVideoH265ShortTermRefPicSet {
        num_negative_pics: negative.len() as u8,
        num_positive_pics: positive.len() as u8,
        used_by_curr_pic_s0_flag: 0,
        used_by_curr_pic_s1_flag: 0,
        ..unsafe { std::mem::zeroed() }
    };

    let mut delta_poc = 0;
    for (index, id) in negative.iter().enumerate() {
        delta_poc = (current_poc - arena.get(*id).poc) - delta_poc;
        set.delta_poc_s0_minus1[index] = (delta_poc - 1) as u16;
        if list0.contains(id) {
            set.used_by_curr_pic_s0_flag |= 1 << index;
        }
    }

    let mut delta_poc = 0;
    for (index, id) in positive.iter().enumerate() {
        delta_poc = (arena.get(*id).poc - current_poc) - delta_poc;
        set.delta_poc_s1_minus1[index] = (delta_poc - 1) as u16;
        if list1.contains(id) {
            set.used_by_curr_pic_s1_flag |= 1 << index;
        }
    }

    set
}

/// Builds the H.265 descriptor set for one scheduled frame and runs it
/// through the shared submission path.
unsafe fn encode_scheduled(
    gpu: &Arc<GpuContext>,
    session: &VideoSession,
    recorder: &mut OperationRecorder,
    dpb_images: &DpbImagePool,
    output: &VkHostBuffer,
    writer: &mut dyn CodecBitWriter,
    assembler: &mut BitstreamAssembler,
    headers: &Bytes,
    cfg: &EncoderConfig,
    rc_mode: RateControlMode,
    ctb_size: u32,
    first_encode_done: &mut bool,
    scheduler: &mut FrameScheduler,
    sched: &ScheduledPicture,
) -> Result<Bytes, FrameError> {
    let frame = scheduler.arena.get(sched.id);
    let slice_type = frame.slice_type;
    let is_idr = sched.is_idr;
    let is_reference = sched.setup_slot.is_some();
    let poc = frame.poc;
    let quality = frame.quality;
    let captions = frame.captions.clone();
    let input = frame
        .input
        .clone()
        .ok_or_else(|| FrameError::Submit("frame admitted without an input image".into()))?;

    assembler.begin_frame(writer, slice_type, is_idr, headers);
    assembler.add_captions(writer, captions.as_deref());

    let plan = &scheduler.plan;
    let bitrates = rate_control::layer_bitrates(cfg, session.encode_caps.max_bitrate);

    let mut h265_rc_layer = vk::VideoEncodeH265RateControlLayerInfoKHR::default()
        .use_min_qp(true)
        .min_qp(vk::VideoEncodeH265QpKHR {
            qp_i: cfg.min_qp as i32,
            qp_p: cfg.min_qp as i32,
            qp_b: cfg.min_qp as i32,
        })
        .use_max_qp(true)
        .max_qp(vk::VideoEncodeH265QpKHR {
            qp_i: cfg.max_qp as i32,
            qp_p: cfg.max_qp as i32,
            qp_b: cfg.max_qp as i32,
        })
        .use_max_frame_size(false);

    let rc_layers = [vk::VideoEncodeRateControlLayerInfoKHR::default()
        .average_bitrate(bitrates.average)
        .max_bitrate(bitrates.max)
        .frame_rate_numerator(cfg.fps.0)
        .frame_rate_denominator(cfg.fps.1)
        .push_next(&mut h265_rc_layer)];

    let mut h265_rc_info = vk::VideoEncodeH265RateControlInfoKHR::default()
        .gop_frame_count(plan.idr_period)
        .idr_period(plan.idr_period)
        .consecutive_b_frame_count(plan.num_bframes)
        .sub_layer_count(1)
        .flags(vk::VideoEncodeH265RateControlFlagsKHR::REGULAR_GOP);

    let mut rc_info =
        vk::VideoEncodeRateControlInfoKHR::default().rate_control_mode(rc_mode.as_vk());
    if rate_control::layer_count(rc_mode) > 0 {
        rc_info = rc_info.layers(&rc_layers).virtual_buffer_size_in_ms(1);
    }

    rc_info.p_next = <*mut _>::cast(&mut h265_rc_info);

    // One slice segment per configured slice, CTB rows split evenly.
    let weight_table: StdVideoEncodeH265WeightTable = std::mem::zeroed();

    let ctb_count = cfg.width.div_ceil(ctb_size) * cfg.height.div_ceil(ctb_size);
    let slice_headers = super::slice_unit_offsets(ctb_count, cfg.num_slices)
        .map(|slice_segment_address| {
            let mut hdr = StdVideoEncodeH265SliceSegmentHeader {
                slice_type: H265Ops::std_slice_type(slice_type),
                slice_segment_address,
                // Decoders complain about zero; five is the codec
                // maximum.
                MaxNumMergeCand: 5,
                pWeightTable: &weight_table,
                ..std::mem::zeroed()
            };
            hdr.flags
                .set_num_ref_idx_active_override_flag((slice_type != SliceType::I) as u32);
            hdr
        })
        .collect::<Vec<_>>();

    let constant_qp = if rc_mode == RateControlMode::Disabled {
        quality as i32
    } else {
        0
    };

    let nalu_entries = slice_headers
        .iter()
        .map(|hdr| {
            vk::VideoEncodeH265NaluSliceSegmentInfoKHR::default()
                .std_slice_segment_header(hdr)
                .constant_qp(constant_qp)
        })
        .collect::<Vec<_>>();

    // Reference lists as slot indices; H.265 reordering travels in the
    // list_entry arrays rather than modification opcodes.
    let mut ref_lists_info = StdVideoEncodeH265ReferenceListsInfo {
        num_ref_idx_l0_active_minus1: sched.slice_header.num_ref_idx_l0_active_minus1 as u8,
        num_ref_idx_l1_active_minus1: sched.slice_header.num_ref_idx_l1_active_minus1 as u8,
        RefPicList0: [H265Ops::NO_REFERENCE_PICTURE; 15],
        RefPicList1: [H265Ops::NO_REFERENCE_PICTURE; 15],
        ..std::mem::zeroed()
    };

    debug_assert!(sched.list0.len() + sched.list1.len() <= H265Ops::MAX_LIST_REFS);
    for (index, id) in sched.list0.iter().enumerate() {
        ref_lists_info.RefPicList0[index] = scheduler.arena.get(*id).dpb_slot_index as u8;
        ref_lists_info.list_entry_l0[index] = index as u8;
    }
    for (index, id) in sched.list1.iter().enumerate() {
        ref_lists_info.RefPicList1[index] = scheduler.arena.get(*id).dpb_slot_index as u8;
        ref_lists_info.list_entry_l1[index] = index as u8;
    }

    ref_lists_info.flags.set_ref_pic_list_modification_flag_l0(
        sched.slice_header.ref_pic_list_modification_l0.is_some() as u32,
    );
    ref_lists_info.flags.set_ref_pic_list_modification_flag_l1(
        sched.slice_header.ref_pic_list_modification_l1.is_some() as u32,
    );

    let short_term_refs = build_short_term_ref_set(scheduler, poc, &sched.list0, &sched.list1);

    let mut std_pic_info = StdVideoEncodeH265PictureInfo {
        pic_type: H265Ops::std_pic_type(slice_type, is_idr),
        sps_video_parameter_set_id: 0,
        pps_seq_parameter_set_id: 0,
        pps_pic_parameter_set_id: 0,
        PicOrderCntVal: poc,
        TemporalId: 0,
        pRefLists: &ref_lists_info,
        pShortTermRefPicSet: &short_term_refs,
        ..std::mem::zeroed()
    };
    std_pic_info.flags.set_IrapPicFlag(is_idr as u32);
    std_pic_info.flags.set_is_reference(is_reference as u32);
    if is_idr {
        std_pic_info.flags.set_pic_output_flag(1);
        std_pic_info.flags.set_no_output_of_prior_pics_flag(1);
    }

    let mut h265_pic_info = vk::VideoEncodeH265PictureInfoKHR::default()
        .nalu_slice_segment_entries(&nalu_entries)
        .std_picture_info(&std_pic_info);

    let ref_ids: Vec<_> = sched.list0.iter().chain(&sched.list1).copied().collect();

    let mut std_ref_infos = ref_ids
        .iter()
        .map(|id| {
            let reference = scheduler.arena.get(*id);
            StdVideoEncodeH265ReferenceInfo {
                pic_type: H265Ops::std_pic_type(reference.slice_type, reference.gop_index == 0),
                PicOrderCntVal: reference.poc,
                TemporalId: 0,
                ..std::mem::zeroed()
            }
        })
        .collect::<Vec<_>>();

    let mut ref_info = std_ref_infos
        .iter_mut()
        .map(|info| vk::VideoEncodeH265DpbSlotInfoKHR::default().std_reference_info(info))
        .collect::<Vec<_>>();

    let setup_std_ref_info = StdVideoEncodeH265ReferenceInfo {
        pic_type: H265Ops::std_pic_type(slice_type, is_idr),
        PicOrderCntVal: poc,
        TemporalId: 0,
        ..std::mem::zeroed()
    };
    let mut setup_info =
        vk::VideoEncodeH265DpbSlotInfoKHR::default().std_reference_info(&setup_std_ref_info);

    let ref_slot_indices: Vec<usize> = ref_ids
        .iter()
        .map(|id| scheduler.arena.get(*id).dpb_slot_index as usize)
        .collect();

    let first_encode = !*first_encode_done;
    let quality_level = rate_control::effective_quality_level(cfg, &session.encode_caps);

    submit_encode(
        gpu,
        session,
        recorder,
        dpb_images,
        output,
        &input,
        vk::Extent2D {
            width: cfg.width,
            height: cfg.height,
        },
        sched.setup_slot,
        &ref_slot_indices,
        first_encode,
        quality_level,
        rc_mode != RateControlMode::Default,
        &mut rc_info,
        &mut h265_pic_info,
        &mut setup_info,
        &mut ref_info,
    )
    .map_err(|err| FrameError::Submit(err.to_string()))?;

    *first_encode_done = true;

    recorder
        .wait(u64::MAX)
        .map_err(|err| FrameError::Submit(err.to_string()))?;

    let feedback = recorder
        .retrieve_query(0)
        .map_err(|err| FrameError::Submit(err.to_string()))?;

    if feedback.status != vk::QueryResultStatusKHR::COMPLETE.as_raw() {
        return Err(FrameError::Incomplete(feedback.status));
    }

    trace!(
        offset = feedback.offset,
        size = feedback.size,
        "encode feedback"
    );

    Ok(assembler.assemble(
        output.as_slice(),
        feedback.offset as usize,
        feedback.size as usize,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_std_params_wire_the_pointer_graph() {
        let mut cfg = EncoderConfig::new(VideoCodec::H265, 1920, 1080, (30, 1));
        cfg.num_bframes = 3;
        cfg.b_pyramid = true;
        let plan = gop::plan(&cfg, 16, 16);

        let blocks = BlockSizes {
            min_ctb: 16,
            max_ctb: 64,
            min_tbs: 4,
            max_tbs: 32,
        };
        let params = build_std_params(&cfg, &plan, &levels::H265_LEVELS[7], false, blocks, 1920, 1088);

        assert_eq!(params.sps.pProfileTierLevel, &params.ptl as *const _);
        assert_eq!(params.sps.pDecPicBufMgr, &params.pbm as *const _);
        assert_eq!(params.sps.pSequenceParameterSetVui, &params.vui as *const _);
        assert_eq!(params.vps.pProfileTierLevel, &params.ptl as *const _);

        assert_eq!(params.sps.pic_width_in_luma_samples, 1920);
        assert_eq!(params.sps.pic_height_in_luma_samples, 1088);
        assert_eq!(params.sps.conf_win_bottom_offset, 4);
        // 64 → 8 coding blocks, 32 → 4 transform blocks.
        assert_eq!(params.sps.log2_diff_max_min_luma_coding_block_size, 3);
        assert_eq!(params.sps.log2_diff_max_min_luma_transform_block_size, 3);
        assert_eq!(
            params.pbm.max_dec_pic_buffering_minus1[0],
            plan.num_ref_frames as u8
        );
        assert_eq!(params.pbm.max_num_reorder_pics[0], plan.num_reorder_frames as u8);
    }

    #[test]
    fn test_short_term_ref_set_deltas() {
        let mut cfg = EncoderConfig::new(VideoCodec::H265, 640, 480, (30, 1));
        cfg.idr_period = 8;
        cfg.num_bframes = 3;
        cfg.b_pyramid = true;
        cfg.num_ref_frames = 3;

        let plan = gop::plan(&cfg, 16, 16);
        let slots = plan.required_dpb_size();
        let mut scheduler = FrameScheduler::new(&cfg, plan, slots);

        // Build a DPB of POCs 0 and 8, then inspect a B frame at POC 4.
        let mut sched_b = None;
        'outer: for snr in 0..5 {
            scheduler.admit(None, snr, None, false).unwrap();
            while let Some(id) = scheduler.next_ready() {
                let sched = scheduler.prepare(id).unwrap();
                if scheduler.arena.get(id).poc == 4 {
                    sched_b = Some((id, sched));
                    break 'outer;
                }
                scheduler.complete(id, &sched, 100).unwrap();
            }
        }

        let (id, sched) = sched_b.expect("no B frame scheduled");
        let poc = scheduler.arena.get(id).poc;
        let set = build_short_term_ref_set(&scheduler, poc, &sched.list0, &sched.list1);

        assert_eq!(set.num_negative_pics, 1);
        assert_eq!(set.num_positive_pics, 1);
        // POC 0 is 4 behind, POC 8 is 4 ahead.
        assert_eq!(set.delta_poc_s0_minus1[0], 3);
        assert_eq!(set.delta_poc_s1_minus1[0], 3);
        assert_eq!(set.used_by_curr_pic_s0_flag, 1);
        assert_eq!(set.used_by_curr_pic_s1_flag, 1);
    }

    #[test]
    fn test_probe_block_sizes_requires_support() {
        let caps = vk::VideoEncodeH265CapabilitiesKHR::default();
        assert!(probe_block_sizes(&caps).is_err());

        let caps = vk::VideoEncodeH265CapabilitiesKHR::default()
            .ctb_sizes(
                vk::VideoEncodeH265CtbSizeFlagsKHR::TYPE_32
                    | vk::VideoEncodeH265CtbSizeFlagsKHR::TYPE_64,
            )
            .transform_block_sizes(vk::VideoEncodeH265TransformBlockSizeFlagsKHR::TYPE_4);

        let blocks = probe_block_sizes(&caps).unwrap();
        assert_eq!((blocks.min_ctb, blocks.max_ctb), (32, 64));
        assert_eq!((blocks.min_tbs, blocks.max_tbs), (4, 4));
    }
}
