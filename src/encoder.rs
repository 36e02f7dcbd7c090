// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! The encoder core: admission and drain logic shared by both codecs,
//! the per-frame scheduling pipeline (reorder → DPB → descriptor
//! build), and the common GPU submission path.

use std::sync::Arc;

use ash::vk;
use bytes::Bytes;
use tracing::{error, trace};

use crate::bitstream::SliceHeaderData;
use crate::config::EncoderConfig;
use crate::dpb::{self, DpbManager, Eviction};
use crate::frame::{FrameArena, FrameId, FrameRecord};
use crate::gop::GopPlan;
use crate::gpu::{DpbImagePool, GpuContext, VkHostBuffer, VkImage};
use crate::operation::OperationRecorder;
use crate::session::VideoSession;
use crate::{Error, Result, SliceType, VideoCodec};

mod h264;
mod h265;

pub use h264::H264Encoder;
pub use h265::H265Encoder;

/// The fixed ceiling for a single compressed frame; the actual staging
/// buffer is this rounded up to the bitstream alignment.
pub(crate) const OUTPUT_BUFFER_SIZE: usize = 3 * 1024 * 1024;

/// The constant set that distinguishes the two codecs inside the shared
/// core.
pub(crate) trait CodecOps {
    const CODEC: VideoCodec;
    /// The std-header sentinel that terminates reference lists.
    const NO_REFERENCE_PICTURE: u8;
    const MAX_LIST_REFS: usize;
    /// H.264 B support is not wired up; the planner clamps it away.
    const SUPPORTS_BFRAMES: bool;

    fn std_slice_type(ty: SliceType) -> u32;
    fn std_pic_type(ty: SliceType, is_idr: bool) -> u32;
}

/// A per-frame failure, reported on the output path with an empty
/// payload.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    #[error("encode submission failed: {0}")]
    Submit(String),
    #[error("encode did not complete, query status {0}")]
    Incomplete(i32),
}

/// One compressed frame, emitted in decode order.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub system_frame_number: u64,
    pub data: Bytes,
    /// Presentation timestamp in nanoseconds.
    pub pts: i64,
    /// Decode timestamp in nanoseconds; ahead of PTS by the reorder
    /// depth, and negative for the first frames of a reordered stream.
    pub dts: i64,
    pub duration: u64,
    pub sync_point: bool,
    pub error: Option<FrameError>,
}

/// Everything decided about a frame before the GPU sees it.
pub(crate) struct ScheduledPicture {
    pub id: FrameId,
    pub list0: Vec<FrameId>,
    pub list1: Vec<FrameId>,
    pub eviction: Eviction,
    pub setup_slot: Option<usize>,
    pub slice_header: SliceHeaderData,
    pub is_idr: bool,
}

pub(crate) struct OutputMeta {
    pub system_frame_number: u64,
    pub pts: i64,
    pub dts: i64,
    pub duration: u64,
    pub sync_point: bool,
    pub slice_type: SliceType,
}

/// The codec-agnostic scheduling pipeline: admission, reordering,
/// reference management, slice-header decisions and the adaptive
/// quality loop.
pub(crate) struct FrameScheduler {
    pub plan: GopPlan,
    pub arena: FrameArena,
    pub reorder: crate::reorder::ReorderEngine,
    pub dpb: DpbManager,

    input_frame_count: u64,
    output_frame_count: u64,
    frame_duration: u64,

    min_qp: u32,
    max_qp: u32,
    qp_i: u32,
    qp_p: u32,
    qp_b: u32,
    fps: (u32, u32),
    target_bitrate: u64,
    quality_bias: i64,
    used_bytes: u64,
    nb_frames: u64,
}

impl FrameScheduler {
    pub fn new(cfg: &EncoderConfig, plan: GopPlan, max_dpb_slots: usize) -> Self {
        let dpb = DpbManager::new(
            plan.num_ref_frames,
            plan.b_pyramid,
            plan.required_dpb_size().min(max_dpb_slots),
        );

        FrameScheduler {
            dpb,
            arena: FrameArena::new(),
            reorder: crate::reorder::ReorderEngine::new(),
            input_frame_count: 0,
            output_frame_count: 0,
            frame_duration: cfg.frame_duration(),
            min_qp: cfg.min_qp,
            max_qp: cfg.max_qp,
            qp_i: cfg.qp_i,
            qp_p: cfg.qp_p,
            qp_b: cfg.qp_b,
            fps: cfg.fps,
            target_bitrate: cfg.average_bitrate as u64,
            quality_bias: 0,
            used_bytes: 0,
            nb_frames: 0,
            plan,
        }
    }

    /// Swaps in a freshly planned GOP structure at a GOP boundary,
    /// keeping the stream counters.
    pub fn replan(&mut self, cfg: &EncoderConfig, plan: GopPlan, max_dpb_slots: usize) {
        self.dpb = DpbManager::new(
            plan.num_ref_frames,
            plan.b_pyramid,
            plan.required_dpb_size().min(max_dpb_slots),
        );
        self.reorder.reset();
        self.min_qp = cfg.min_qp;
        self.max_qp = cfg.max_qp;
        self.qp_i = cfg.qp_i;
        self.qp_p = cfg.qp_p;
        self.qp_b = cfg.qp_b;
        self.target_bitrate = cfg.average_bitrate as u64;
        self.plan = plan;
    }

    /// Whether the next admission starts a new GOP.
    pub fn at_gop_boundary(&self) -> bool {
        self.reorder.is_empty()
            && (self.reorder.cur_frame_index == 0
                || self.reorder.cur_frame_index >= self.plan.idr_period)
    }

    pub fn admit(
        &mut self,
        input: Option<Arc<VkImage>>,
        system_frame_number: u64,
        captions: Option<Bytes>,
        force_keyframe: bool,
    ) -> Result<FrameId> {
        let mut frame = FrameRecord::new(input, system_frame_number, self.input_frame_count);
        frame.captions = captions;
        self.input_frame_count += 1;

        let id = self.arena.insert(frame);
        self.reorder.push(
            Some(id),
            &mut self.arena,
            &mut self.dpb,
            &self.plan,
            force_keyframe,
            false,
        )?;

        Ok(id)
    }

    /// Marks end-of-stream so the remaining buffered frames drain.
    pub fn finish_gop(&mut self) -> Result<()> {
        self.reorder.push(
            None,
            &mut self.arena,
            &mut self.dpb,
            &self.plan,
            false,
            true,
        )
    }

    pub fn next_ready(&mut self) -> Option<FrameId> {
        self.reorder.pop(&mut self.arena, &self.dpb, &self.plan)
    }

    /// Runs the per-frame decisions: adaptive QP, eviction planning,
    /// slot assignment, reference lists and the slice-header contents.
    pub fn prepare(&mut self, id: FrameId) -> Result<ScheduledPicture> {
        self.adjust_quality(id);

        let frame = self.arena.get(id);
        // In an intra-only stream nothing ever reads the IDR back, so
        // it never occupies the (empty) reference set.
        let is_reference = frame.is_reference && self.plan.num_ref_frames > 0;
        let is_idr = frame.gop_index == 0;

        let eviction = if is_reference {
            self.dpb.plan_eviction(&self.arena, id)
        } else {
            Eviction::None
        };

        if let Eviction::Evict {
            victim,
            explicit: true,
        } = eviction
        {
            let victim_num = self.arena.get(victim).frame_num as i32;
            self.arena.get_mut(id).unused_reference_pic_num = victim_num;
        }

        let setup_slot = if is_reference {
            Some(self.dpb.assign_slot(&mut self.arena, id)?)
        } else {
            None
        };

        let (list0, list1) = self.dpb.build_lists(
            &self.arena,
            id,
            self.plan.ref_num_list0,
            self.plan.ref_num_list1,
        );

        if (list0.len() + list1.len()) as u32 > self.plan.num_ref_frames {
            return Err(Error::invariant("reference lists exceed the DPB depth"));
        }

        let slice_header = self.build_slice_header(id, &list0, &list1);

        Ok(ScheduledPicture {
            id,
            list0,
            list1,
            eviction,
            setup_slot,
            slice_header,
            is_idr,
        })
    }

    /// Books the finished frame: byte accounting for the quality loop,
    /// timestamps, and the DPB commit.
    pub fn complete(
        &mut self,
        id: FrameId,
        sched: &ScheduledPicture,
        output_len: usize,
    ) -> Result<OutputMeta> {
        self.used_bytes += output_len as u64;
        self.nb_frames += 1;

        let frame = self.arena.get(id);
        let duration = self.frame_duration;
        let meta = OutputMeta {
            system_frame_number: frame.system_frame_number,
            pts: frame.total_frame_count as i64 * duration as i64,
            dts: (self.output_frame_count as i64 - self.plan.num_reorder_frames as i64)
                * duration as i64,
            duration,
            sync_point: frame.sync_point,
            slice_type: frame.slice_type,
        };
        self.output_frame_count += 1;

        if frame.is_reference && self.plan.num_ref_frames > 0 {
            self.dpb.commit_reference(&mut self.arena, id, sched.eviction)?;
        } else {
            self.arena.remove(id);
        }

        Ok(meta)
    }

    /// The byte-budget feedback loop: nudge the QP up when the running
    /// bitrate overshoots the target, down when it undershoots.
    fn adjust_quality(&mut self, id: FrameId) {
        if self.nb_frames > 0 {
            let bitrate = self.used_bytes * 8 * self.fps.0 as u64
                / (self.nb_frames * self.fps.1 as u64);

            if bitrate > self.target_bitrate {
                self.quality_bias += 1;
            } else if bitrate < self.target_bitrate {
                self.quality_bias -= 1;
            }
        }

        let frame = self.arena.get_mut(id);
        let base = match frame.slice_type {
            SliceType::I => self.qp_i,
            SliceType::P => self.qp_p,
            SliceType::B => self.qp_b,
        };

        frame.quality = (base as i64 + self.quality_bias)
            .clamp(self.min_qp as i64, self.max_qp as i64) as u32;
    }

    fn build_slice_header(
        &self,
        id: FrameId,
        list0: &[FrameId],
        list1: &[FrameId],
    ) -> SliceHeaderData {
        let frame = self.arena.get(id);

        let mut header = SliceHeaderData {
            slice_type: Some(frame.slice_type),
            frame_num: frame.frame_num,
            idr_pic_id: (self.reorder.total_idr_count.wrapping_sub(1) & 0xffff) as u16,
            first_mb_in_slice: 0,
            cabac_init_idc: 0,
            disable_deblocking_filter_idc: 0,
            qp_delta: 0,
            num_ref_idx_l0_active_minus1: list0.len().saturating_sub(1) as u32,
            num_ref_idx_l1_active_minus1: list1.len().saturating_sub(1) as u32,
            ..Default::default()
        };

        header.ref_pic_list_modification_l0 =
            dpb::ref_list_modifications(&self.arena, list0, frame.frame_num, false);
        header.ref_pic_list_modification_l1 =
            dpb::ref_list_modifications(&self.arena, list1, frame.frame_num, true);

        if frame.unused_reference_pic_num >= 0 {
            debug_assert!(frame.is_reference);
            header.ref_pic_marking = Some(dpb::mmco_unmark_ops(
                frame.frame_num,
                frame.unused_reference_pic_num as u32,
            ));
        }

        header
    }
}

/// Records and submits one encode operation: ownership barriers, DPB
/// transitions, timeline dependencies, the session bind, the first-time
/// rate-control setup, the feedback query and the encode command
/// itself. The codec-specific descriptor chains come in from the
/// caller.
pub(crate) unsafe fn submit_encode(
    gpu: &Arc<GpuContext>,
    session: &VideoSession,
    recorder: &mut OperationRecorder,
    dpb_images: &DpbImagePool,
    output: &VkHostBuffer,
    input: &Arc<VkImage>,
    coded_extent: vk::Extent2D,
    setup_slot: Option<usize>,
    ref_slots: &[usize],
    first_encode: bool,
    quality_level: Option<u32>,
    apply_rc_control: bool,
    rc_info: &mut (impl vk::ExtendsVideoBeginCodingInfoKHR + vk::ExtendsVideoCodingControlInfoKHR),
    codec_pic_info: &mut impl vk::ExtendsVideoEncodeInfoKHR,
    codec_setup_info: &mut impl vk::ExtendsVideoReferenceSlotInfoKHR,
    codec_ref_info: &mut [impl vk::ExtendsVideoReferenceSlotInfoKHR],
) -> Result<()> {
    recorder.begin()?;

    // Take the input picture for reading. Images live on the encode
    // queue; no ownership transfer happens here.
    recorder.add_frame_barrier(
        input,
        vk::PipelineStageFlags2::VIDEO_ENCODE_KHR,
        vk::AccessFlags2::VIDEO_ENCODE_READ_KHR,
        vk::ImageLayout::VIDEO_ENCODE_SRC_KHR,
        vk::QUEUE_FAMILY_IGNORED,
        None,
    );

    // Referenced DPB layers stay in the DPB layout; the barrier orders
    // the reads after previous reconstruction writes.
    for slot in ref_slots {
        recorder.add_frame_barrier(
            dpb_images.image(*slot),
            vk::PipelineStageFlags2::VIDEO_ENCODE_KHR,
            vk::AccessFlags2::VIDEO_ENCODE_READ_KHR,
            vk::ImageLayout::VIDEO_ENCODE_DPB_KHR,
            vk::QUEUE_FAMILY_IGNORED,
            Some(dpb_images.base_array_layer(*slot)),
        );
    }

    if let Some(slot) = setup_slot {
        recorder.add_frame_barrier(
            dpb_images.image(slot),
            vk::PipelineStageFlags2::VIDEO_ENCODE_KHR,
            vk::AccessFlags2::VIDEO_ENCODE_WRITE_KHR | vk::AccessFlags2::VIDEO_ENCODE_READ_KHR,
            vk::ImageLayout::VIDEO_ENCODE_DPB_KHR,
            vk::QUEUE_FAMILY_IGNORED,
            Some(dpb_images.base_array_layer(slot)),
        );
    }

    recorder.record_barriers();

    // Order this submit against whoever wrote the input image and the
    // previous encodes that wrote the referenced DPB images.
    recorder.add_dependency_frame(
        input,
        vk::PipelineStageFlags2::ALL_COMMANDS,
        vk::PipelineStageFlags2::ALL_COMMANDS,
    );
    for slot in ref_slots.iter().chain(setup_slot.iter()) {
        recorder.add_dependency_frame(
            dpb_images.image(*slot),
            vk::PipelineStageFlags2::VIDEO_ENCODE_KHR,
            vk::PipelineStageFlags2::VIDEO_ENCODE_KHR,
        );
    }

    let cb = recorder.cmd();

    // Bind the session, with every slot this operation touches.
    let mut bound_resources: Vec<vk::VideoPictureResourceInfoKHR> = Vec::new();
    let mut bound_indices: Vec<i32> = Vec::new();

    for slot in ref_slots {
        bound_resources.push(dpb_images.picture_resource(*slot));
        bound_indices.push(*slot as i32);
    }
    if let Some(slot) = setup_slot {
        bound_resources.push(dpb_images.picture_resource(slot));
        // The setup slot is bound inactive until this encode activates
        // it.
        bound_indices.push(-1);
    }

    let bound_slots: Vec<vk::VideoReferenceSlotInfoKHR> = bound_resources
        .iter()
        .zip(&bound_indices)
        .map(|(resource, index)| {
            vk::VideoReferenceSlotInfoKHR::default()
                .slot_index(*index)
                .picture_resource(resource)
        })
        .collect();

    {
        let mut begin_info = vk::VideoBeginCodingInfoKHR::default()
            .video_session(session.session())
            .video_session_parameters(session.parameters())
            .reference_slots(&bound_slots);

        // The driver wants to know the current rate control once one
        // has been established; driver-default mode never sends the
        // struct at all.
        if !first_encode && apply_rc_control {
            begin_info = begin_info.push_next(rc_info);
        }

        gpu.video_fns.cmd_begin_video_coding(cb, &begin_info);
    }

    if first_encode {
        let control_info =
            vk::VideoCodingControlInfoKHR::default().flags(vk::VideoCodingControlFlagsKHR::RESET);
        gpu.video_fns.cmd_control_video_coding(cb, &control_info);

        if let Some(level) = quality_level {
            let mut quality_info =
                vk::VideoEncodeQualityLevelInfoKHR::default().quality_level(level);
            let control_info = vk::VideoCodingControlInfoKHR::default()
                .flags(vk::VideoCodingControlFlagsKHR::ENCODE_QUALITY_LEVEL)
                .push_next(&mut quality_info);
            gpu.video_fns.cmd_control_video_coding(cb, &control_info);
        }

        if apply_rc_control {
            let control_info = vk::VideoCodingControlInfoKHR::default()
                .flags(vk::VideoCodingControlFlagsKHR::ENCODE_RATE_CONTROL)
                .push_next(rc_info);
            gpu.video_fns.cmd_control_video_coding(cb, &control_info);
        }
    }

    // The slots as the encode itself sees them: references active, the
    // setup slot under its real index.
    let src_pic_resource = vk::VideoPictureResourceInfoKHR::default()
        .coded_extent(coded_extent)
        .image_view_binding(input.view);

    let ref_resources: Vec<vk::VideoPictureResourceInfoKHR> = ref_slots
        .iter()
        .map(|slot| dpb_images.picture_resource(*slot))
        .collect();
    let reference_slots: Vec<vk::VideoReferenceSlotInfoKHR> = ref_resources
        .iter()
        .zip(ref_slots)
        .zip(codec_ref_info.iter_mut())
        .map(|((resource, slot), codec_info)| {
            vk::VideoReferenceSlotInfoKHR::default()
                .slot_index(*slot as i32)
                .picture_resource(resource)
                .push_next(codec_info)
        })
        .collect();

    let setup_resource;
    let setup_reference_slot;
    if let Some(slot) = setup_slot {
        setup_resource = dpb_images.picture_resource(slot);
        setup_reference_slot = vk::VideoReferenceSlotInfoKHR::default()
            .slot_index(slot as i32)
            .picture_resource(&setup_resource)
            .push_next(codec_setup_info);
    } else {
        setup_reference_slot = vk::VideoReferenceSlotInfoKHR::default();
    }

    let mut encode_info = vk::VideoEncodeInfoKHR::default()
        .dst_buffer(output.buffer)
        .dst_buffer_offset(0)
        .dst_buffer_range(output.size as u64)
        .src_picture_resource(src_pic_resource)
        .reference_slots(&reference_slots)
        .push_next(codec_pic_info);

    if setup_slot.is_some() {
        encode_info = encode_info.setup_reference_slot(&setup_reference_slot);
    }

    recorder.begin_query(0);
    gpu.encode_fns.cmd_encode_video(cb, &encode_info);
    recorder.end_query(0);

    let end_info = vk::VideoEndCodingInfoKHR::default();
    gpu.video_fns.cmd_end_video_coding(cb, &end_info);

    // Hand the input picture back in a general layout.
    recorder.add_frame_barrier(
        input,
        vk::PipelineStageFlags2::NONE,
        vk::AccessFlags2::NONE,
        vk::ImageLayout::GENERAL,
        vk::QUEUE_FAMILY_IGNORED,
        None,
    );
    recorder.record_barriers();

    recorder.end()
}

/// A Vulkan video encoder for one stream. Frames go in in display
/// order; compressed frames come out in decode order.
pub enum VulkanEncoder {
    H264(H264Encoder),
    H265(H265Encoder),
}

impl VulkanEncoder {
    pub fn new(
        gpu: Arc<GpuContext>,
        writer: Box<dyn crate::CodecBitWriter>,
        cfg: EncoderConfig,
    ) -> Result<Self> {
        cfg.validate()?;

        match cfg.codec {
            VideoCodec::H264 => Ok(Self::H264(H264Encoder::new(gpu, writer, cfg)?)),
            VideoCodec::H265 => Ok(Self::H265(H265Encoder::new(gpu, writer, cfg)?)),
        }
    }

    /// Admits one frame and returns whatever became ready, in decode
    /// order.
    ///
    /// # Safety
    /// `image` must be a valid image on this encoder's device, and its
    /// timeline semaphore (if any) must reach its current value + 1
    /// when the producing work finishes.
    pub unsafe fn push_frame(
        &mut self,
        image: Arc<VkImage>,
        system_frame_number: u64,
        captions: Option<Bytes>,
        force_keyframe: bool,
    ) -> Result<Vec<EncodedFrame>> {
        match self {
            Self::H264(enc) => enc.push_frame(image, system_frame_number, captions, force_keyframe),
            Self::H265(enc) => enc.push_frame(image, system_frame_number, captions, force_keyframe),
        }
    }

    /// Drains every buffered frame, promoting the trailing B to P, and
    /// resets the GOP so the next frame starts at an IDR.
    ///
    /// # Safety
    /// See [`VulkanEncoder::push_frame`].
    pub unsafe fn flush(&mut self) -> Result<Vec<EncodedFrame>> {
        match self {
            Self::H264(enc) => enc.flush(),
            Self::H265(enc) => enc.flush(),
        }
    }

    /// Stages a configuration change; it takes effect at the next GOP
    /// boundary. Resolution changes require a fresh encoder.
    pub fn request_config_change(&mut self, cfg: EncoderConfig) {
        match self {
            Self::H264(enc) => enc.request_config_change(cfg),
            Self::H265(enc) => enc.request_config_change(cfg),
        }
    }

    pub fn input_format(&self) -> vk::Format {
        match self {
            Self::H264(enc) => enc.input_format(),
            Self::H265(enc) => enc.input_format(),
        }
    }

    /// Creates an image suitable as encode input for this session.
    pub fn create_input_image(&mut self) -> Result<VkImage> {
        match self {
            Self::H264(enc) => enc.create_input_image(),
            Self::H265(enc) => enc.create_input_image(),
        }
    }

    pub fn stats(&self) -> crate::stats::EncodeStats {
        match self {
            Self::H264(enc) => enc.stats(),
            Self::H265(enc) => enc.stats(),
        }
    }

    /// Tears down the session and GPU objects. Also runs on drop;
    /// calling it twice is fine.
    ///
    /// # Safety
    /// No other thread may be using this encoder's GPU objects.
    pub unsafe fn stop(&mut self) {
        match self {
            Self::H264(enc) => enc.stop(),
            Self::H265(enc) => enc.stop(),
        }
    }
}

/// First-unit offsets for `num_slices` slices over `unit_count` coding
/// units (macroblocks or CTBs), remainders spread over the leading
/// slices.
pub(crate) fn slice_unit_offsets(unit_count: u32, num_slices: u32) -> impl Iterator<Item = u32> {
    let num_slices = num_slices.clamp(1, unit_count.max(1));
    let per_slice = unit_count / num_slices;
    let remainder = unit_count % num_slices;

    (0..num_slices).map(move |i| i * per_slice + i.min(remainder))
}

/// The decode-order emission loop both codec encoders share; generic
/// over the GPU-facing encode call.
pub(crate) fn drain_ready(
    scheduler: &mut FrameScheduler,
    stats: &crate::stats::EncodeStats,
    mut encode_one: impl FnMut(&mut FrameScheduler, &ScheduledPicture) -> Result<Bytes, FrameError>,
) -> Result<Vec<EncodedFrame>> {
    let mut out = Vec::new();

    while let Some(id) = scheduler.next_ready() {
        let sched = scheduler.prepare(id)?;

        let (data, frame_error) = match encode_one(scheduler, &sched) {
            Ok(data) => (data, None),
            Err(err) => {
                // A transient GPU failure drops this frame and keeps
                // the encoder alive.
                error!(error = %err, "dropping frame after encode failure");
                (Bytes::new(), Some(err))
            }
        };

        let meta = scheduler.complete(id, &sched, data.len())?;
        stats.record_frame_size(meta.slice_type, meta.sync_point, data.len());

        trace!(
            system_frame_number = meta.system_frame_number,
            len = data.len(),
            pts = meta.pts,
            dts = meta.dts,
            "emitting frame"
        );

        out.push(EncodedFrame {
            system_frame_number: meta.system_frame_number,
            data,
            pts: meta.pts,
            dts: meta.dts,
            duration: meta.duration,
            sync_point: meta.sync_point,
            error: frame_error,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dpb::{MmcoOp, RefListModOp};
    use crate::gop;

    fn scheduler(cfg: &EncoderConfig) -> FrameScheduler {
        let plan = gop::plan(cfg, 16, 16);
        let slots = plan.required_dpb_size();
        FrameScheduler::new(cfg, plan, slots)
    }

    fn drive(scheduler: &mut FrameScheduler, count: u64) -> Vec<(ScheduledPicture, OutputMeta)> {
        let mut out = Vec::new();
        for snr in 0..count {
            scheduler.admit(None, snr, None, false).unwrap();
            drain(scheduler, &mut out);
        }
        out
    }

    fn drain(scheduler: &mut FrameScheduler, out: &mut Vec<(ScheduledPicture, OutputMeta)>) {
        while let Some(id) = scheduler.next_ready() {
            let sched = scheduler.prepare(id).unwrap();
            let meta = scheduler.complete(id, &sched, 1000).unwrap();
            out.push((sched, meta));
        }
    }

    #[test]
    fn test_i_then_p_run() {
        // Scenario: an IDR followed by 32 P frames, one reference.
        let mut cfg = EncoderConfig::new(VideoCodec::H264, 176, 144, (30, 1));
        cfg.idr_period = 33;
        cfg.num_bframes = 0;
        cfg.num_ref_frames = 1;

        let mut scheduler = scheduler(&cfg);
        let emitted = drive(&mut scheduler, 33);

        assert_eq!(emitted.len(), 33);
        assert_eq!(emitted[0].1.slice_type, SliceType::I);
        assert!(emitted[0].1.sync_point);

        for (i, (sched, meta)) in emitted.iter().enumerate() {
            assert_eq!(meta.system_frame_number, i as u64);
            assert_eq!(sched.slice_header.frame_num, i as u32);

            if i > 0 {
                assert_eq!(meta.slice_type, SliceType::P);
                // Each P predicts from its immediate predecessor, in
                // implicit order.
                assert_eq!(sched.list0.len(), 1);
                assert!(sched.list1.is_empty());
                assert!(sched.slice_header.ref_pic_list_modification_l0.is_none());
            }
        }
    }

    #[test]
    fn test_force_keyframe_starts_a_new_gop() {
        // Scenario: force-keyframe mid-GOP. The running GOP terminates,
        // the reference set is cleared, and the forced frame goes out as
        // an IDR sync point.
        let mut cfg = EncoderConfig::new(VideoCodec::H264, 320, 240, (30, 1));
        cfg.idr_period = 10;
        cfg.num_ref_frames = 2;

        let mut scheduler = scheduler(&cfg);
        let mut out = Vec::new();
        for snr in 0..5 {
            scheduler.admit(None, snr, None, false).unwrap();
            drain(&mut scheduler, &mut out);
        }
        assert_eq!(scheduler.dpb.len(), 2);

        // The encoder terminates the GOP before a forced keyframe.
        assert!(!scheduler.at_gop_boundary());
        scheduler.finish_gop().unwrap();
        drain(&mut scheduler, &mut out);
        assert!(scheduler.at_gop_boundary());

        scheduler.admit(None, 5, None, true).unwrap();
        drain(&mut scheduler, &mut out);

        let forced = &out[5];
        assert_eq!(forced.1.slice_type, SliceType::I);
        assert!(forced.1.sync_point);
        assert!(forced.0.is_idr);
        assert!(forced.0.list0.is_empty());
        assert!(forced.0.setup_slot.is_some());
        // Only the new IDR occupies the reference set.
        assert_eq!(scheduler.dpb.len(), 1);
    }

    #[test]
    fn test_pyramid_eviction_announced_in_slice_header() {
        // Scenario: a non-head B-reference eviction must surface as an
        // MMCO in the slice header.
        let mut cfg = EncoderConfig::new(VideoCodec::H265, 640, 480, (30, 1));
        cfg.idr_period = 8;
        cfg.num_bframes = 3;
        cfg.b_pyramid = true;
        cfg.num_ref_frames = 3;

        let mut scheduler = scheduler(&cfg);
        let emitted = drive(&mut scheduler, 8);

        let announcer = emitted
            .iter()
            .find(|(sched, _)| sched.slice_header.ref_pic_marking.is_some())
            .expect("no frame announced an eviction");

        // frame_num 4 unmarks frame_num 2: difference_of_pic_nums_minus1
        // = 4 - 2 - 1.
        assert_eq!(announcer.0.slice_header.frame_num, 4);
        assert_eq!(
            announcer.0.slice_header.ref_pic_marking.as_ref().unwrap(),
            &vec![
                MmcoOp::UnmarkShortTerm {
                    difference_of_pic_nums_minus1: 1
                },
                MmcoOp::End
            ]
        );
    }

    #[test]
    fn test_b_frames_get_backward_lists() {
        let mut cfg = EncoderConfig::new(VideoCodec::H265, 640, 480, (30, 1));
        cfg.idr_period = 8;
        cfg.num_bframes = 3;
        cfg.b_pyramid = true;
        cfg.num_ref_frames = 3;

        let mut scheduler = scheduler(&cfg);
        let emitted = drive(&mut scheduler, 8);

        for (sched, meta) in &emitted {
            if meta.slice_type != SliceType::B {
                continue;
            }

            assert!(!sched.list0.is_empty(), "B frame without a forward list");
            assert!(!sched.list1.is_empty(), "B frame without a backward list");
        }
    }

    #[test]
    fn test_reorder_modifications_use_end_opcode() {
        let mut cfg = EncoderConfig::new(VideoCodec::H265, 640, 480, (30, 1));
        cfg.idr_period = 8;
        cfg.num_bframes = 3;
        cfg.b_pyramid = true;
        cfg.num_ref_frames = 3;

        let mut scheduler = scheduler(&cfg);
        let emitted = drive(&mut scheduler, 8);

        for (sched, _) in &emitted {
            for ops in [
                &sched.slice_header.ref_pic_list_modification_l0,
                &sched.slice_header.ref_pic_list_modification_l1,
            ]
            .into_iter()
            .flatten()
            {
                assert_eq!(*ops.last().unwrap(), RefListModOp::End);
            }
        }
    }

    #[test]
    fn test_flush_resets_and_restarts_with_idr() {
        // Scenario: push 7 into a GOP of 16, flush, then continue.
        let mut cfg = EncoderConfig::new(VideoCodec::H265, 640, 480, (30, 1));
        cfg.idr_period = 16;
        cfg.num_bframes = 2;
        cfg.num_ref_frames = 2;

        let mut scheduler = scheduler(&cfg);
        let mut out = Vec::new();
        for snr in 0..7 {
            scheduler.admit(None, snr, None, false).unwrap();
            drain(&mut scheduler, &mut out);
        }

        scheduler.finish_gop().unwrap();
        drain(&mut scheduler, &mut out);
        assert_eq!(out.len(), 7);
        assert!(scheduler.reorder.is_empty());

        scheduler.reorder.reset();
        assert_eq!(scheduler.reorder.cur_frame_index, 0);
        assert_eq!(scheduler.reorder.cur_frame_num, 0);

        scheduler.admit(None, 7, None, false).unwrap();
        drain(&mut scheduler, &mut out);
        assert!(out[7].1.sync_point);
    }

    #[test]
    fn test_dts_trails_pts_by_reorder_depth() {
        let mut cfg = EncoderConfig::new(VideoCodec::H265, 640, 480, (30, 1));
        cfg.idr_period = 8;
        cfg.num_bframes = 1;
        cfg.num_ref_frames = 2;

        let mut scheduler = scheduler(&cfg);
        let emitted = drive(&mut scheduler, 8);

        for (_, meta) in &emitted {
            assert!(meta.dts <= meta.pts, "dts must not exceed pts");
        }

        // DTS advances by exactly one frame duration per output.
        let duration = cfg.frame_duration() as i64;
        for pair in emitted.windows(2) {
            assert_eq!(pair[1].1.dts - pair[0].1.dts, duration);
        }
    }

    #[test]
    fn test_dpb_never_exceeds_configured_depth() {
        let mut cfg = EncoderConfig::new(VideoCodec::H265, 640, 480, (30, 1));
        cfg.idr_period = 16;
        cfg.num_bframes = 3;
        cfg.b_pyramid = true;
        cfg.num_ref_frames = 3;

        let mut scheduler = scheduler(&cfg);
        for snr in 0..32 {
            scheduler.admit(None, snr, None, false).unwrap();
            let mut out = Vec::new();
            drain(&mut scheduler, &mut out);
            assert!(scheduler.dpb.len() as u32 <= scheduler.plan.num_ref_frames);
        }
    }

    #[test]
    fn test_intra_only_stream() {
        // Scenario: intra-only, every frame I, only the IDR marked as a
        // reference.
        let mut cfg = EncoderConfig::new(VideoCodec::H264, 176, 144, (15, 1));
        cfg.idr_period = 1;
        cfg.num_bframes = 0;
        cfg.num_ref_frames = 0;

        let plan = gop::plan(&cfg, 0, 0);
        assert_eq!(plan.ip_period, 0);
        let slots = plan.required_dpb_size();
        let mut scheduler = FrameScheduler::new(&cfg, plan, slots);

        let emitted = drive(&mut scheduler, 3);
        assert_eq!(emitted.len(), 3);
        for (sched, meta) in &emitted {
            assert_eq!(meta.slice_type, SliceType::I);
            assert!(meta.sync_point);
            assert!(sched.list0.is_empty() && sched.list1.is_empty());
        }
    }
}
