// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! The H.264 encoder: capability and profile chains, SPS/PPS
//! construction, and the per-frame descriptor fill feeding the shared
//! submission path.

use std::sync::Arc;

use ash::vk;
use ash::vk::native::{
    StdVideoEncodeH264PictureInfo, StdVideoEncodeH264RefListModEntry,
    StdVideoEncodeH264RefPicMarkingEntry, StdVideoEncodeH264ReferenceInfo,
    StdVideoEncodeH264ReferenceListsInfo, StdVideoEncodeH264SliceHeader,
    StdVideoEncodeH264WeightTable, StdVideoH264ChromaFormatIdc_STD_VIDEO_H264_CHROMA_FORMAT_IDC_420,
    StdVideoH264PictureParameterSet, StdVideoH264PocType_STD_VIDEO_H264_POC_TYPE_0,
    StdVideoH264SequenceParameterSet, StdVideoH264SequenceParameterSetVui,
};
use bytes::Bytes;
use tracing::{debug, trace};

use crate::bitstream::{BitstreamAssembler, CodecBitWriter};
use crate::config::{EncoderConfig, Profile, RateControlMode};
use crate::dpb::{MmcoOp, RefListModOp};
use crate::gop::{self, GopPlan};
use crate::gpu::{vk_chain, DpbImagePool, GpuContext, VkHostBuffer, VkImage};
use crate::levels::{self, H264Level};
use crate::operation::OperationRecorder;
use crate::rate_control;
use crate::session::{make_video_std_version, StdHeader, VideoSession};
use crate::stats::EncodeStats;
use crate::{Error, Result, SliceType, VideoCodec};

use super::{
    drain_ready, submit_encode, CodecOps, EncodedFrame, FrameError, FrameScheduler,
    ScheduledPicture, OUTPUT_BUFFER_SIZE,
};

const MB_SIZE: u32 = 16;

const STD_HEADER: StdHeader = StdHeader {
    name: c"VK_STD_vulkan_video_codec_h264_encode",
    spec_version: make_video_std_version(1, 0, 0),
};
const MIN_STD_VERSION: u32 = make_video_std_version(1, 0, 0);

vk_chain! {
    pub struct H264EncodeProfile<'a> {
        pub profile_info: vk::VideoProfileInfoKHR<'a>,
        pub usage_info: vk::VideoEncodeUsageInfoKHR<'a>,
        pub h264_profile: vk::VideoEncodeH264ProfileInfoKHR<'a>,
    }
}

vk_chain! {
    pub struct H264EncodeCapabilities<'a> {
        pub video_caps: vk::VideoCapabilitiesKHR<'a>,
        pub encode_caps: vk::VideoEncodeCapabilitiesKHR<'a>,
        pub h264_caps: vk::VideoEncodeH264CapabilitiesKHR<'a>,
    }
}

// ash's bindgen output doesn't carry over C #define constants, only
// the struct/enum definitions it generates from them, so the codec
// header's `STD_VIDEO_H264_NO_REFERENCE_PICTURE` / `_MAX_NUM_LIST_REF`
// macros are redefined locally per spec guidance. Values are fixed by
// the Vulkan video std header and cross-checked against the
// `RefPicList0`/`RefPicList1` array lengths ash does generate.
const STD_VIDEO_H264_NO_REFERENCE_PICTURE: u8 = 0xFF;
const STD_VIDEO_H264_MAX_NUM_LIST_REF: usize = 32;

pub(crate) struct H264Ops;

impl CodecOps for H264Ops {
    const CODEC: VideoCodec = VideoCodec::H264;
    const NO_REFERENCE_PICTURE: u8 = STD_VIDEO_H264_NO_REFERENCE_PICTURE;
    const MAX_LIST_REFS: usize = STD_VIDEO_H264_MAX_NUM_LIST_REF;
    const SUPPORTS_BFRAMES: bool = false;

    fn std_slice_type(ty: SliceType) -> u32 {
        match ty {
            SliceType::P => vk::native::StdVideoH264SliceType_STD_VIDEO_H264_SLICE_TYPE_P,
            SliceType::B => vk::native::StdVideoH264SliceType_STD_VIDEO_H264_SLICE_TYPE_B,
            SliceType::I => vk::native::StdVideoH264SliceType_STD_VIDEO_H264_SLICE_TYPE_I,
        }
    }

    fn std_pic_type(ty: SliceType, is_idr: bool) -> u32 {
        if is_idr {
            return vk::native::StdVideoH264PictureType_STD_VIDEO_H264_PICTURE_TYPE_IDR;
        }

        match ty {
            SliceType::P => vk::native::StdVideoH264PictureType_STD_VIDEO_H264_PICTURE_TYPE_P,
            SliceType::B => vk::native::StdVideoH264PictureType_STD_VIDEO_H264_PICTURE_TYPE_B,
            SliceType::I => vk::native::StdVideoH264PictureType_STD_VIDEO_H264_PICTURE_TYPE_I,
        }
    }
}

fn std_profile_idc(profile: Profile) -> u32 {
    match profile {
        Profile::High => vk::native::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_HIGH,
        _ => vk::native::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_MAIN,
    }
}

fn std_level_idc(level_idc: u8) -> u32 {
    use vk::native::*;
    match level_idc {
        10 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_1_0,
        // 1b travels as 1.1 with constraint_set3.
        9 | 11 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_1_1,
        12 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_1_2,
        13 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_1_3,
        20 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_2_0,
        21 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_2_1,
        22 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_2_2,
        30 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_3_0,
        31 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_3_1,
        32 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_3_2,
        40 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_4_0,
        41 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_4_1,
        42 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_4_2,
        50 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_5_0,
        51 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_5_1,
        52 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_5_2,
        60 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_6_0,
        61 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_6_1,
        _ => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_6_2,
    }
}

/// The std parameter sets the session was created with, boxed so the
/// internal VUI pointer stays put.
struct H264StdParams {
    sps: StdVideoH264SequenceParameterSet,
    pps: StdVideoH264PictureParameterSet,
    vui: StdVideoH264SequenceParameterSetVui,
}

// SAFETY: the only pointer inside refers into the same box.
unsafe impl Send for H264StdParams {}

pub struct H264Encoder {
    gpu: Arc<GpuContext>,
    writer: Box<dyn CodecBitWriter>,
    cfg: EncoderConfig,
    pending_cfg: Option<EncoderConfig>,

    profile: H264EncodeProfile,
    session: VideoSession,
    recorder: OperationRecorder,
    scheduler: FrameScheduler,
    assembler: BitstreamAssembler,
    dpb_images: DpbImagePool,
    output_buffer: VkHostBuffer,

    std_params: Box<H264StdParams>,
    headers: Bytes,
    rc_mode: RateControlMode,
    level: &'static H264Level,
    max_refs: (u32, u32),
    aligned_width: u32,
    aligned_height: u32,
    first_encode_done: bool,
    stats: EncodeStats,
}

impl H264Encoder {
    pub fn new(
        gpu: Arc<GpuContext>,
        writer: Box<dyn CodecBitWriter>,
        mut cfg: EncoderConfig,
    ) -> Result<Self> {
        // B frames are not wired up for H.264.
        if !H264Ops::SUPPORTS_BFRAMES {
            cfg.num_bframes = 0;
            cfg.b_pyramid = false;
        }

        let mut profile = H264EncodeProfile::new(
            vk::VideoProfileInfoKHR::default()
                .video_codec_operation(vk::VideoCodecOperationFlagsKHR::ENCODE_H264)
                .chroma_subsampling(cfg.chroma_subsampling())
                .luma_bit_depth(cfg.component_bit_depth())
                .chroma_bit_depth(cfg.component_bit_depth()),
            vk::VideoEncodeUsageInfoKHR::default(),
            vk::VideoEncodeH264ProfileInfoKHR::default().std_profile_idc(std_profile_idc(cfg.profile)),
        );

        let mut caps = H264EncodeCapabilities::default();
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
        trace!(h264_caps = ?caps.h264_caps, "h264 capabilities");

        let max_refs = (
            caps.h264_caps.max_p_picture_l0_reference_count,
            caps.h264_caps.max_l1_reference_count,
        );

        let plan = gop::plan(&cfg, max_refs.0, max_refs.1);

        let aligned_width = cfg.width.next_multiple_of(MB_SIZE);
        let aligned_height = cfg.height.next_multiple_of(MB_SIZE);

        let level = match cfg.level_idc {
            Some(idc) => levels::H264_LEVELS
                .iter()
                .find(|level| level.level_idc == idc)
                .ok_or_else(|| Error::config(format!("unknown H.264 level idc {idc}")))?,
            None => levels::select_h264_level(
                aligned_width / MB_SIZE,
                aligned_height / MB_SIZE,
                cfg.fps,
                plan.num_ref_frames,
                0,
                0,
                cfg.profile,
            )?,
        };

        if caps.h264_caps.max_level_idc != 0
            && caps.h264_caps.max_level_idc < std_level_idc(level.level_idc)
        {
            return Err(Error::config(format!(
                "level {} beyond the implementation's maximum",
                level.name
            )));
        }

        debug!(level = level.name, "selected H.264 level");

        let rc_mode = rate_control::select_mode(&cfg, &caps.encode_caps);

        let std_params = build_std_params(&cfg, &plan, level, aligned_width, aligned_height);

        let mut recorder = OperationRecorder::new(gpu.clone());

        let session = {
            let sps = [std_params.sps];
            let pps = [std_params.pps];

            let add_info = vk::VideoEncodeH264SessionParametersAddInfoKHR::default()
                .std_sp_ss(&sps)
                .std_pp_ss(&pps);
            let mut params_create = vk::VideoEncodeH264SessionParametersCreateInfoKHR::default()
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
            let mut get_info = vk::VideoEncodeH264SessionParametersGetInfoKHR::default()
                .write_std_sps(true)
                .write_std_pps(true);
            Bytes::from(session.read_session_headers(&mut get_info)?)
        };

        let scheduler = FrameScheduler::new(&cfg, plan, max_dpb_slots);
        let assembler = BitstreamAssembler::new(H264Ops::CODEC, cfg.aud, cfg.cc_insert);

        Ok(H264Encoder {
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
            // Close the running GOP so the forced frame starts a fresh
            // one (and with it, a cleared reference set).
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
                first_encode_done,
                scheduler,
                sched,
            )
        })
    }

    /// Applies a staged configuration at a GOP boundary: re-plans the
    /// GOP, rebuilds the parameter sets, and re-arms the rate-control
    /// setup for the next (IDR) frame.
    unsafe fn maybe_apply_pending_config(&mut self) -> Result<()> {
        if self.pending_cfg.is_none() || !self.scheduler.at_gop_boundary() {
            return Ok(());
        }

        let mut cfg = self.pending_cfg.take().unwrap();
        cfg.validate()?;
        cfg.num_bframes = 0;
        cfg.b_pyramid = false;

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
            self.aligned_width,
            self.aligned_height,
        );

        {
            let sps = [std_params.sps];
            let pps = [std_params.pps];

            let add_info = vk::VideoEncodeH264SessionParametersAddInfoKHR::default()
                .std_sp_ss(&sps)
                .std_pp_ss(&pps);
            let mut params_create = vk::VideoEncodeH264SessionParametersCreateInfoKHR::default()
                .max_std_sps_count(1)
                .max_std_pps_count(1)
                .parameters_add_info(&add_info);

            self.session.rebuild_parameters(&mut params_create)?;
        }

        self.headers = {
            let mut get_info = vk::VideoEncodeH264SessionParametersGetInfoKHR::default()
                .write_std_sps(true)
                .write_std_pps(true);
            Bytes::from(self.session.read_session_headers(&mut get_info)?)
        };

        let max_dpb_slots = self.session.video_caps.max_dpb_slots as usize;
        self.scheduler.replan(&cfg, plan, max_dpb_slots);
        self.assembler = BitstreamAssembler::new(H264Ops::CODEC, cfg.aud, cfg.cc_insert);
        self.rc_mode = rate_control::select_mode(&cfg, &self.session.encode_caps);
        self.std_params = std_params;
        self.first_encode_done = false;
        self.cfg = cfg;

        debug!("applied staged configuration at GOP boundary");
        Ok(())
    }
}

impl Drop for H264Encoder {
    fn drop(&mut self) {
        unsafe { self.stop() };
    }
}

fn build_std_params(
    cfg: &EncoderConfig,
    plan: &GopPlan,
    level: &H264Level,
    aligned_width: u32,
    aligned_height: u32,
) -> Box<H264StdParams> {
    let crop_right = (aligned_width - cfg.width) / 2;
    let crop_bottom = (aligned_height - cfg.height) / 2;

    let mut vui = StdVideoH264SequenceParameterSetVui {
        // Square pixels until the caller says otherwise.
        aspect_ratio_idc: vk::native::StdVideoH264AspectRatioIdc_STD_VIDEO_H264_ASPECT_RATIO_IDC_SQUARE,
        num_units_in_tick: cfg.fps.1,
        time_scale: cfg.fps.0 * 2,
        ..unsafe { std::mem::zeroed() }
    };
    vui.flags.set_aspect_ratio_info_present_flag(1);
    vui.flags.set_timing_info_present_flag(1);

    let mut sps = StdVideoH264SequenceParameterSet {
        profile_idc: std_profile_idc(cfg.profile),
        level_idc: std_level_idc(level.level_idc),
        chroma_format_idc: StdVideoH264ChromaFormatIdc_STD_VIDEO_H264_CHROMA_FORMAT_IDC_420,
        bit_depth_luma_minus8: cfg.bit_depth - 8,
        bit_depth_chroma_minus8: cfg.bit_depth - 8,

        max_num_ref_frames: plan.num_ref_frames as u8,
        pic_order_cnt_type: StdVideoH264PocType_STD_VIDEO_H264_POC_TYPE_0,
        log2_max_frame_num_minus4: (plan.log2_max_frame_num - 4) as u8,
        log2_max_pic_order_cnt_lsb_minus4: (plan.log2_max_pic_order_cnt - 4) as u8,

        pic_width_in_mbs_minus1: aligned_width / MB_SIZE - 1,
        pic_height_in_map_units_minus1: aligned_height / MB_SIZE - 1,
        frame_crop_right_offset: crop_right,
        frame_crop_bottom_offset: crop_bottom,
        ..unsafe { std::mem::zeroed() }
    };

    sps.flags.set_frame_mbs_only_flag(1);
    sps.flags.set_direct_8x8_inference_flag(1);
    sps.flags.set_vui_parameters_present_flag(1);
    if crop_right > 0 || crop_bottom > 0 {
        sps.flags.set_frame_cropping_flag(1);
    }

    let mut pps = StdVideoH264PictureParameterSet {
        seq_parameter_set_id: 0,
        pic_parameter_set_id: 0,
        num_ref_idx_l0_default_active_minus1: 0,
        ..unsafe { std::mem::zeroed() }
    };
    pps.flags.set_entropy_coding_mode_flag(1);
    pps.flags.set_deblocking_filter_control_present_flag(1);

    let mut params = Box::new(H264StdParams { sps, pps, vui });
    params.sps.pSequenceParameterSetVui = &params.vui;

    params
}

fn std_mod_entries(ops: &[RefListModOp]) -> Vec<StdVideoEncodeH264RefListModEntry> {
    use vk::native::*;

    ops.iter()
        .filter_map(|op| match op {
            RefListModOp::ShortTermSubtract {
                abs_diff_pic_num_minus1,
            } => Some(StdVideoEncodeH264RefListModEntry {
                modification_of_pic_nums_idc:
                    StdVideoH264ModificationOfPicNumsIdc_STD_VIDEO_H264_MODIFICATION_OF_PIC_NUMS_IDC_SHORT_TERM_SUBTRACT,
                abs_diff_pic_num_minus1: *abs_diff_pic_num_minus1 as u16,
                long_term_pic_num: 0,
            }),
            RefListModOp::ShortTermAdd {
                abs_diff_pic_num_minus1,
            } => Some(StdVideoEncodeH264RefListModEntry {
                modification_of_pic_nums_idc:
                    StdVideoH264ModificationOfPicNumsIdc_STD_VIDEO_H264_MODIFICATION_OF_PIC_NUMS_IDC_SHORT_TERM_ADD,
                abs_diff_pic_num_minus1: *abs_diff_pic_num_minus1 as u16,
                long_term_pic_num: 0,
            }),
            // The driver writes the end opcode itself.
            RefListModOp::End => None,
        })
        .collect()
}

fn std_marking_entries(ops: &[MmcoOp]) -> Vec<StdVideoEncodeH264RefPicMarkingEntry> {
    use vk::native::*;

    ops.iter()
        .filter_map(|op| match op {
            MmcoOp::UnmarkShortTerm {
                difference_of_pic_nums_minus1,
            } => Some(StdVideoEncodeH264RefPicMarkingEntry {
                memory_management_control_operation:
                    StdVideoH264MemMgmtControlOp_STD_VIDEO_H264_MEM_MGMT_CONTROL_OP_UNMARK_SHORT_TERM,
                difference_of_pic_nums_minus1: *difference_of_pic_nums_minus1 as u16,
                long_term_pic_num: 0,
                long_term_frame_idx: 0,
                max_long_term_frame_idx_plus1: 0,
            }),
            MmcoOp::End => None,
        })
        .collect()
}

/// Builds the H.264 descriptor set for one scheduled frame and runs it
/// through the shared submission path, returning the assembled
/// compressed frame.
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
    first_encode_done: &mut bool,
    scheduler: &mut FrameScheduler,
    sched: &ScheduledPicture,
) -> Result<Bytes, FrameError> {
    let frame = scheduler.arena.get(sched.id);
    let slice_type = frame.slice_type;
    let is_idr = sched.is_idr;
    let is_reference = sched.setup_slot.is_some();
    let frame_num = frame.frame_num;
    let poc = frame.poc;
    let quality = frame.quality;
    let captions = frame.captions.clone();
    let input = frame
        .input
        .clone()
        .ok_or_else(|| FrameError::Submit("frame admitted without an input image".into()))?;

    assembler.begin_frame(writer, slice_type, is_idr, headers);
    assembler.add_captions(writer, captions.as_deref());

    // Rate control, passed in begin-coding (and, on the first frame, as
    // a control operation).
    let plan = &scheduler.plan;
    let bitrates = rate_control::layer_bitrates(cfg, session.encode_caps.max_bitrate);

    let mut h264_rc_layer = vk::VideoEncodeH264RateControlLayerInfoKHR::default()
        .use_min_qp(true)
        .min_qp(vk::VideoEncodeH264QpKHR {
            qp_i: cfg.min_qp as i32,
            qp_p: cfg.min_qp as i32,
            qp_b: cfg.min_qp as i32,
        })
        .use_max_qp(true)
        .max_qp(vk::VideoEncodeH264QpKHR {
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
        .push_next(&mut h264_rc_layer)];

    let mut h264_rc_info = vk::VideoEncodeH264RateControlInfoKHR::default()
        .gop_frame_count(plan.idr_period)
        .idr_period(plan.idr_period)
        .consecutive_b_frame_count(plan.num_bframes)
        .temporal_layer_count(1)
        .flags(vk::VideoEncodeH264RateControlFlagsKHR::REGULAR_GOP);

    let mut rc_info =
        vk::VideoEncodeRateControlInfoKHR::default().rate_control_mode(rc_mode.as_vk());
    if rate_control::layer_count(rc_mode) > 0 {
        rc_info = rc_info
            .layers(&rc_layers)
            .virtual_buffer_size_in_ms(1);
    }

    // No push_next on the parent struct for the codec info; wire it by
    // hand.
    rc_info.p_next = <*mut _>::cast(&mut h264_rc_info);

    // Slice headers, one per configured slice, macroblocks split
    // evenly.
    let weight_table: StdVideoEncodeH264WeightTable = std::mem::zeroed();

    let mb_count = (cfg.width.next_multiple_of(MB_SIZE) / MB_SIZE)
        * (cfg.height.next_multiple_of(MB_SIZE) / MB_SIZE);
    let slice_headers = super::slice_unit_offsets(mb_count, cfg.num_slices)
        .map(|first_mb_in_slice| {
            let mut hdr = StdVideoEncodeH264SliceHeader {
                first_mb_in_slice,
                slice_type: H264Ops::std_slice_type(slice_type),
                cabac_init_idc: 0,
                disable_deblocking_filter_idc: 0,
                slice_qp_delta: 0,
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
            vk::VideoEncodeH264NaluSliceInfoKHR::default()
                .std_slice_header(hdr)
                .constant_qp(constant_qp)
        })
        .collect::<Vec<_>>();

    // Reference lists: slot indices in list order, the modification and
    // marking operations alongside.
    let list0_mods = sched
        .slice_header
        .ref_pic_list_modification_l0
        .as_deref()
        .map(std_mod_entries)
        .unwrap_or_default();
    let list1_mods = sched
        .slice_header
        .ref_pic_list_modification_l1
        .as_deref()
        .map(std_mod_entries)
        .unwrap_or_default();
    let marking_ops = sched
        .slice_header
        .ref_pic_marking
        .as_deref()
        .map(std_marking_entries)
        .unwrap_or_default();

    let mut ref_lists_info = StdVideoEncodeH264ReferenceListsInfo {
        num_ref_idx_l0_active_minus1: sched.slice_header.num_ref_idx_l0_active_minus1 as u8,
        num_ref_idx_l1_active_minus1: sched.slice_header.num_ref_idx_l1_active_minus1 as u8,
        RefPicList0: [H264Ops::NO_REFERENCE_PICTURE; 32],
        RefPicList1: [H264Ops::NO_REFERENCE_PICTURE; 32],
        refList0ModOpCount: list0_mods.len() as u8,
        refList1ModOpCount: list1_mods.len() as u8,
        refPicMarkingOpCount: marking_ops.len() as u8,
        pRefList0ModOperations: if list0_mods.is_empty() {
            std::ptr::null()
        } else {
            list0_mods.as_ptr()
        },
        pRefList1ModOperations: if list1_mods.is_empty() {
            std::ptr::null()
        } else {
            list1_mods.as_ptr()
        },
        pRefPicMarkingOperations: if marking_ops.is_empty() {
            std::ptr::null()
        } else {
            marking_ops.as_ptr()
        },
        ..std::mem::zeroed()
    };

    ref_lists_info
        .flags
        .set_ref_pic_list_modification_flag_l0(!list0_mods.is_empty() as u32);
    ref_lists_info
        .flags
        .set_ref_pic_list_modification_flag_l1(!list1_mods.is_empty() as u32);

    debug_assert!(sched.list0.len() + sched.list1.len() <= H264Ops::MAX_LIST_REFS);
    for (index, id) in sched.list0.iter().enumerate() {
        ref_lists_info.RefPicList0[index] = scheduler.arena.get(*id).dpb_slot_index as u8;
    }
    for (index, id) in sched.list1.iter().enumerate() {
        ref_lists_info.RefPicList1[index] = scheduler.arena.get(*id).dpb_slot_index as u8;
    }

    let mut std_pic_info = StdVideoEncodeH264PictureInfo {
        seq_parameter_set_id: 0,
        pic_parameter_set_id: 0,
        idr_pic_id: sched.slice_header.idr_pic_id,
        primary_pic_type: H264Ops::std_pic_type(slice_type, is_idr),
        frame_num,
        PicOrderCnt: poc,
        temporal_id: 0,
        pRefLists: &ref_lists_info,
        ..std::mem::zeroed()
    };
    std_pic_info.flags.set_IdrPicFlag(is_idr as u32);
    std_pic_info.flags.set_is_reference(is_reference as u32);
    if !marking_ops.is_empty() {
        std_pic_info.flags.set_adaptive_ref_pic_marking_mode_flag(1);
    }

    let mut h264_pic_info = vk::VideoEncodeH264PictureInfoKHR::default()
        .nalu_slice_entries(&nalu_entries)
        .std_picture_info(&std_pic_info);

    // The decoder-side view of each reference, attached to its slot.
    let ref_ids: Vec<_> = sched.list0.iter().chain(&sched.list1).copied().collect();

    let mut std_ref_infos = ref_ids
        .iter()
        .map(|id| {
            let reference = scheduler.arena.get(*id);
            StdVideoEncodeH264ReferenceInfo {
                primary_pic_type: H264Ops::std_pic_type(
                    reference.slice_type,
                    reference.gop_index == 0,
                ),
                FrameNum: reference.frame_num,
                PicOrderCnt: reference.poc,
                temporal_id: 0,
                ..std::mem::zeroed()
            }
        })
        .collect::<Vec<_>>();

    let mut ref_info = std_ref_infos
        .iter_mut()
        .map(|info| vk::VideoEncodeH264DpbSlotInfoKHR::default().std_reference_info(info))
        .collect::<Vec<_>>();

    let setup_std_ref_info = StdVideoEncodeH264ReferenceInfo {
        primary_pic_type: H264Ops::std_pic_type(slice_type, is_idr),
        FrameNum: frame_num,
        PicOrderCnt: poc,
        temporal_id: 0,
        ..std::mem::zeroed()
    };
    let mut setup_info =
        vk::VideoEncodeH264DpbSlotInfoKHR::default().std_reference_info(&setup_std_ref_info);

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
        &mut h264_pic_info,
        &mut setup_info,
        &mut ref_info,
    )
    .map_err(|err| FrameError::Submit(err.to_string()))?;

    *first_encode_done = true;

    // Block for the result; the output buffer is reused per frame.
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
    use super::super::slice_unit_offsets;
    use super::*;

    #[test]
    fn test_slice_unit_offsets() {
        // 10 macroblocks over 3 slices: 4 + 3 + 3.
        assert_eq!(slice_unit_offsets(10, 3).collect::<Vec<_>>(), vec![0, 4, 7]);
        assert_eq!(slice_unit_offsets(9, 1).collect::<Vec<_>>(), vec![0]);
        // More slices than macroblocks degrades to one per macroblock.
        assert_eq!(slice_unit_offsets(2, 5).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_std_entries_omit_end_markers() {
        let mods = std_mod_entries(&[
            RefListModOp::ShortTermSubtract {
                abs_diff_pic_num_minus1: 1,
            },
            RefListModOp::End,
        ]);
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].abs_diff_pic_num_minus1, 1);

        let marks = std_marking_entries(&[
            MmcoOp::UnmarkShortTerm {
                difference_of_pic_nums_minus1: 2,
            },
            MmcoOp::End,
        ]);
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].difference_of_pic_nums_minus1, 2);
    }

    #[test]
    fn test_std_params_wire_the_vui() {
        let cfg = EncoderConfig::new(VideoCodec::H264, 1918, 1078, (30, 1));
        let plan = gop::plan(&cfg, 16, 16);
        let params = build_std_params(&cfg, &plan, &levels::H264_LEVELS[11], 1920, 1088);

        assert_eq!(
            params.sps.pSequenceParameterSetVui,
            &params.vui as *const _
        );
        assert_eq!(params.sps.pic_width_in_mbs_minus1, 119);
        assert_eq!(params.sps.pic_height_in_map_units_minus1, 67);
        // 4:2:0 crops are in chroma units.
        assert_eq!(params.sps.frame_crop_right_offset, 1);
        assert_eq!(params.sps.frame_crop_bottom_offset, 5);
        assert_eq!(params.sps.max_num_ref_frames, plan.num_ref_frames as u8);
    }
}
