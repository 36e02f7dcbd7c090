// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! Vulkan video-session lifecycle: capability validation, format
//! selection, session and session-parameters objects, bound memory, the
//! encode-feedback query pool, and the initial reset round.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace};

use crate::gpu::GpuContext;
use crate::operation::OperationRecorder;
use crate::{Error, Result, VkCall};

/// The codec std-header revision the picture-building code here was
/// written against.
pub struct StdHeader {
    pub name: &'static CStr,
    pub spec_version: u32,
}

pub const fn make_video_std_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 22) | (minor << 12) | patch
}

/// Input and DPB formats this crate knows how to describe to the rest
/// of the pipeline. The first advertised format with a recognized
/// component layout wins.
fn is_recognized_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::G8_B8R8_2PLANE_420_UNORM
            | vk::Format::G8_B8_R8_3PLANE_420_UNORM
            | vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16
    )
}

pub struct VideoSession {
    gpu: Arc<GpuContext>,
    session: vk::VideoSessionKHR,
    session_memory: Vec<vk::DeviceMemory>,
    params: vk::VideoSessionParametersKHR,

    pub video_caps: vk::VideoCapabilitiesKHR<'static>,
    pub encode_caps: vk::VideoEncodeCapabilitiesKHR<'static>,
    pub input_format: vk::Format,
    pub dpb_format: vk::Format,

    started: bool,
}

impl VideoSession {
    /// Validates capabilities and creates the session, its memory, the
    /// parameters object and the feedback query pool, then runs one
    /// empty coding round with the reset flag to put the session into a
    /// defined state.
    pub unsafe fn start(
        gpu: Arc<GpuContext>,
        profile: &mut vk::VideoProfileInfoKHR,
        mut video_caps: vk::VideoCapabilitiesKHR<'static>,
        mut encode_caps: vk::VideoEncodeCapabilitiesKHR<'static>,
        std_header: &StdHeader,
        min_std_version: u32,
        width: u32,
        height: u32,
        params_create: &mut impl vk::ExtendsVideoSessionParametersCreateInfoKHR,
        recorder: &mut OperationRecorder,
    ) -> Result<Self> {
        // The caps structs arrive chained; the chains die with the
        // caller's stack frame.
        video_caps.p_next = std::ptr::null_mut();
        encode_caps.p_next = std::ptr::null_mut();

        if std_header.spec_version < min_std_version {
            return Err(Error::config(format!(
                "codec std headers {:#x} older than the supported minimum {:#x}",
                std_header.spec_version, min_std_version,
            )));
        }

        if std_header.spec_version < video_caps.std_header_version.spec_version {
            return Err(Error::config(format!(
                "the driver requires newer codec std headers ({:#x}) than this build carries ({:#x})",
                video_caps.std_header_version.spec_version, std_header.spec_version,
            )));
        }

        if video_caps.max_coded_extent.width < width || video_caps.max_coded_extent.height < height
        {
            return Err(Error::config(format!(
                "resolution too large (max {}x{})",
                video_caps.max_coded_extent.width, video_caps.max_coded_extent.height
            )));
        }

        let input_format =
            select_format(&gpu, profile, vk::ImageUsageFlags::VIDEO_ENCODE_SRC_KHR)?;
        let dpb_format = select_format(&gpu, profile, vk::ImageUsageFlags::VIDEO_ENCODE_DPB_KHR)?;

        trace!(?input_format, ?dpb_format, width, height, "session formats");

        let mut std_header_props = vk::ExtensionProperties::default();
        std_header_props.spec_version = std_header.spec_version;
        write_extension_name(&mut std_header_props, std_header.name);

        let session = {
            let create_info = vk::VideoSessionCreateInfoKHR::default()
                .queue_family_index(gpu.encode_queue.family)
                .flags(vk::VideoSessionCreateFlagsKHR::ALLOW_ENCODE_PARAMETER_OPTIMIZATIONS)
                .video_profile(profile)
                .picture_format(input_format)
                .reference_picture_format(dpb_format)
                .max_coded_extent(video_caps.max_coded_extent)
                .max_dpb_slots(video_caps.max_dpb_slots)
                .max_active_reference_pictures(video_caps.max_active_reference_pictures)
                .std_header_version(&std_header_props);

            gpu.video_fns
                .create_video_session(&create_info)
                .vk("vkCreateVideoSessionKHR")?
        };

        let session_memory = match bind_session_memory(&gpu, session) {
            Ok(memory) => memory,
            Err(err) => {
                gpu.video_fns.destroy_video_session(session);
                return Err(err);
            }
        };

        let params = {
            let create_info = vk::VideoSessionParametersCreateInfoKHR::default()
                .video_session(session)
                .push_next(params_create);

            match gpu
                .video_fns
                .create_video_session_parameters(&create_info)
                .vk("vkCreateVideoSessionParametersKHR")
            {
                Ok(params) => params,
                Err(err) => {
                    gpu.video_fns.destroy_video_session(session);
                    for memory in session_memory {
                        gpu.device.free_memory(memory, None);
                    }
                    return Err(err);
                }
            }
        };

        let mut session = VideoSession {
            gpu,
            session,
            session_memory,
            params,
            video_caps,
            encode_caps,
            input_format,
            dpb_format,
            started: true,
        };

        // The feedback query pool wants both the profile and the
        // feedback flags on its chain.
        let mut feedback_create = vk::QueryPoolVideoEncodeFeedbackCreateInfoKHR::default()
            .encode_feedback_flags(
                vk::VideoEncodeFeedbackFlagsKHR::BITSTREAM_BUFFER_OFFSET
                    | vk::VideoEncodeFeedbackFlagsKHR::BITSTREAM_BYTES_WRITTEN,
            );
        feedback_create.p_next = <*mut _>::cast(profile);

        recorder.enable_query(
            vk::QueryType::VIDEO_ENCODE_FEEDBACK_KHR,
            1,
            &mut feedback_create,
        )?;

        session.reset_coding_state(recorder)?;

        Ok(session)
    }

    pub fn session(&self) -> vk::VideoSessionKHR {
        self.session
    }

    pub fn parameters(&self) -> vk::VideoSessionParametersKHR {
        self.params
    }

    /// One empty begin/control/end round with the reset flag, flushing
    /// any prior session state on the device.
    unsafe fn reset_coding_state(&mut self, recorder: &mut OperationRecorder) -> Result<()> {
        recorder.begin()?;

        let begin_info = vk::VideoBeginCodingInfoKHR::default()
            .video_session(self.session)
            .video_session_parameters(self.params);
        let control_info = vk::VideoCodingControlInfoKHR::default()
            .flags(vk::VideoCodingControlFlagsKHR::RESET);
        let end_info = vk::VideoEndCodingInfoKHR::default();

        let cb = recorder.cmd();
        self.gpu.video_fns.cmd_begin_video_coding(cb, &begin_info);
        self.gpu.video_fns.cmd_control_video_coding(cb, &control_info);
        self.gpu.video_fns.cmd_end_video_coding(cb, &end_info);

        recorder.end()?;
        recorder.wait(u64::MAX)?;

        Ok(())
    }

    /// Swaps in a new parameters object. The session itself survives as
    /// long as the resolution is unchanged.
    pub unsafe fn rebuild_parameters(
        &mut self,
        params_create: &mut impl vk::ExtendsVideoSessionParametersCreateInfoKHR,
    ) -> Result<()> {
        let create_info = vk::VideoSessionParametersCreateInfoKHR::default()
            .video_session(self.session)
            .push_next(params_create);

        let params = self
            .gpu
            .video_fns
            .create_video_session_parameters(&create_info)
            .vk("vkCreateVideoSessionParametersKHR")?;

        self.gpu.video_fns.destroy_video_session_parameters(self.params);
        self.params = params;

        debug!("session parameters rebuilt");
        Ok(())
    }

    /// Fetches the serialized parameter sets (SPS/PPS, plus the VPS for
    /// H.265) from the driver. Two calls: sizing, then data.
    pub unsafe fn read_session_headers(
        &self,
        codec_get_info: &mut impl vk::ExtendsVideoEncodeSessionParametersGetInfoKHR,
    ) -> Result<Vec<u8>> {
        let get_info = vk::VideoEncodeSessionParametersGetInfoKHR::default()
            .video_session_parameters(self.params)
            .push_next(codec_get_info);

        let mut feedback_info = vk::VideoEncodeSessionParametersFeedbackInfoKHR::default();

        let headers = self
            .gpu
            .encode_fns
            .get_encoded_video_session_parameters(&get_info, &mut feedback_info)
            .vk("vkGetEncodedVideoSessionParametersKHR")?;

        if headers.is_empty() {
            return Err(Error::config("the driver produced no parameter sets"));
        }

        trace!(len = headers.len(), "read back session headers");
        Ok(headers)
    }

    /// Tears the session down. Safe to call more than once.
    pub unsafe fn stop(&mut self) {
        if !self.started {
            return;
        }

        // Anything still consuming the session must finish first.
        let _ = self.gpu.device.queue_wait_idle(self.gpu.encode_queue.queue);

        self.gpu.video_fns.destroy_video_session_parameters(self.params);
        self.gpu.video_fns.destroy_video_session(self.session);

        for memory in self.session_memory.drain(..) {
            self.gpu.device.free_memory(memory, None);
        }

        self.started = false;
    }
}

impl Drop for VideoSession {
    fn drop(&mut self) {
        unsafe { self.stop() };
    }
}

fn select_format(
    gpu: &GpuContext,
    profile: &mut vk::VideoProfileInfoKHR,
    usage: vk::ImageUsageFlags,
) -> Result<vk::Format> {
    let mut profile_list = crate::gpu::single_profile_list_info(profile);
    let format_info = vk::PhysicalDeviceVideoFormatInfoKHR::default()
        .image_usage(usage)
        .push_next(&mut profile_list);

    let props = unsafe {
        gpu.video_fns
            .get_physical_device_video_format_properties(gpu.pdevice, &format_info)
            .vk("vkGetPhysicalDeviceVideoFormatPropertiesKHR")?
    };

    for prop in &props {
        trace!(format = ?prop.format, ?usage, "advertised video format");
    }

    props
        .iter()
        .map(|prop| prop.format)
        .find(|format| is_recognized_format(*format))
        .ok_or_else(|| Error::config(format!("no usable format for {usage:?}")))
}

fn bind_session_memory(gpu: &GpuContext, session: vk::VideoSessionKHR) -> Result<Vec<vk::DeviceMemory>> {
    let reqs = unsafe {
        gpu.video_fns
            .get_video_session_memory_requirements(session)
            .vk("vkGetVideoSessionMemoryRequirementsKHR")?
    };

    let mut session_memory = Vec::with_capacity(reqs.len());
    let mut binds = Vec::with_capacity(reqs.len());

    for req in &reqs {
        let mem_type_index = crate::gpu::select_memory_type(
            &gpu.memory_props,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Some(req.memory_requirements.memory_type_bits),
        )
        .or_else(|| {
            crate::gpu::select_memory_type(
                &gpu.memory_props,
                vk::MemoryPropertyFlags::empty(),
                Some(req.memory_requirements.memory_type_bits),
            )
        })
        .ok_or_else(|| Error::Exhausted("no suitable memory type for the video session".into()))?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(req.memory_requirements.size)
            .memory_type_index(mem_type_index);

        let memory = unsafe {
            match gpu.device.allocate_memory(&alloc_info, None).vk("vkAllocateMemory") {
                Ok(memory) => memory,
                Err(err) => {
                    for memory in session_memory {
                        gpu.device.free_memory(memory, None);
                    }
                    return Err(err);
                }
            }
        };

        session_memory.push(memory);
        binds.push(
            vk::BindVideoSessionMemoryInfoKHR::default()
                .memory_bind_index(req.memory_bind_index)
                .memory(memory)
                .memory_size(req.memory_requirements.size),
        );
    }

    unsafe {
        if let Err(err) = gpu
            .video_fns
            .bind_video_session_memory(session, &binds)
            .vk("vkBindVideoSessionMemoryKHR")
        {
            for memory in session_memory {
                gpu.device.free_memory(memory, None);
            }
            return Err(err);
        }
    }

    Ok(session_memory)
}

fn write_extension_name(props: &mut vk::ExtensionProperties, name: &CStr) {
    let bytes = name.to_bytes_with_nul();
    debug_assert!(bytes.len() <= props.extension_name.len());
    for (dst, src) in props.extension_name.iter_mut().zip(bytes) {
        *dst = *src as std::ffi::c_char;
    }
}
