// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! Thin wrappers over the `VK_KHR_video_queue` and
//! `VK_KHR_video_encode_queue` entry points, loaded from the instance
//! the caller's GPU context carries.

use ash::khr::{video_encode_queue, video_queue};
use ash::prelude::*;
use ash::vk;

pub struct VideoQueueFns {
    handle: vk::Device,
    instance_fp: video_queue::InstanceFn,
    device_fp: video_queue::DeviceFn,
}

impl VideoQueueFns {
    pub fn load(entry: &ash::Entry, instance: &ash::Instance, device: &ash::Device) -> Self {
        let handle = device.handle();
        let loader = |name: &std::ffi::CStr| unsafe {
            std::mem::transmute(entry.get_instance_proc_addr(instance.handle(), name.as_ptr()))
        };

        Self {
            handle,
            instance_fp: video_queue::InstanceFn::load(loader),
            device_fp: video_queue::DeviceFn::load(loader),
        }
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkGetPhysicalDeviceVideoCapabilitiesKHR.html>
    pub unsafe fn get_physical_device_video_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        video_profile: &vk::VideoProfileInfoKHR,
        capabilities: &mut vk::VideoCapabilitiesKHR,
    ) -> VkResult<()> {
        (self.instance_fp.get_physical_device_video_capabilities_khr)(
            physical_device,
            video_profile,
            capabilities,
        )
        .result()
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkGetPhysicalDeviceVideoFormatPropertiesKHR.html>
    pub unsafe fn get_physical_device_video_format_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        video_format_info: &vk::PhysicalDeviceVideoFormatInfoKHR,
    ) -> VkResult<Vec<vk::VideoFormatPropertiesKHR<'_>>> {
        read_into_defaulted_vector(|count, data| {
            (self.instance_fp.get_physical_device_video_format_properties_khr)(
                physical_device,
                video_format_info,
                count,
                data,
            )
        })
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkCreateVideoSessionKHR.html>
    pub unsafe fn create_video_session(
        &self,
        create_info: &vk::VideoSessionCreateInfoKHR,
    ) -> VkResult<vk::VideoSessionKHR> {
        let mut video_session = std::mem::zeroed();
        (self.device_fp.create_video_session_khr)(
            self.handle,
            create_info,
            std::ptr::null(),
            &mut video_session,
        )
        .result_with_success(video_session)
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkDestroyVideoSessionKHR.html>
    pub unsafe fn destroy_video_session(&self, video_session: vk::VideoSessionKHR) {
        (self.device_fp.destroy_video_session_khr)(self.handle, video_session, std::ptr::null());
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkGetVideoSessionMemoryRequirementsKHR.html>
    pub unsafe fn get_video_session_memory_requirements(
        &self,
        video_session: vk::VideoSessionKHR,
    ) -> VkResult<Vec<vk::VideoSessionMemoryRequirementsKHR<'_>>> {
        read_into_defaulted_vector(|count, data| {
            (self.device_fp.get_video_session_memory_requirements_khr)(
                self.handle,
                video_session,
                count,
                data,
            )
        })
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkBindVideoSessionMemoryKHR.html>
    pub unsafe fn bind_video_session_memory(
        &self,
        video_session: vk::VideoSessionKHR,
        bind_session_memory_infos: &[vk::BindVideoSessionMemoryInfoKHR],
    ) -> VkResult<()> {
        (self.device_fp.bind_video_session_memory_khr)(
            self.handle,
            video_session,
            bind_session_memory_infos.len() as u32,
            bind_session_memory_infos.as_ptr(),
        )
        .result()
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkCreateVideoSessionParametersKHR.html>
    pub unsafe fn create_video_session_parameters(
        &self,
        create_info: &vk::VideoSessionParametersCreateInfoKHR,
    ) -> VkResult<vk::VideoSessionParametersKHR> {
        let mut video_session_parameters = std::mem::zeroed();
        (self.device_fp.create_video_session_parameters_khr)(
            self.handle,
            create_info,
            std::ptr::null(),
            &mut video_session_parameters,
        )
        .result_with_success(video_session_parameters)
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkDestroyVideoSessionParametersKHR.html>
    pub unsafe fn destroy_video_session_parameters(
        &self,
        video_session_parameters: vk::VideoSessionParametersKHR,
    ) {
        (self.device_fp.destroy_video_session_parameters_khr)(
            self.handle,
            video_session_parameters,
            std::ptr::null(),
        );
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkCmdBeginVideoCodingKHR.html>
    pub unsafe fn cmd_begin_video_coding(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::VideoBeginCodingInfoKHR,
    ) {
        (self.device_fp.cmd_begin_video_coding_khr)(command_buffer, begin_info);
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkCmdControlVideoCodingKHR.html>
    pub unsafe fn cmd_control_video_coding(
        &self,
        command_buffer: vk::CommandBuffer,
        coding_control_info: &vk::VideoCodingControlInfoKHR,
    ) {
        (self.device_fp.cmd_control_video_coding_khr)(command_buffer, coding_control_info);
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkCmdEndVideoCodingKHR.html>
    pub unsafe fn cmd_end_video_coding(
        &self,
        command_buffer: vk::CommandBuffer,
        end_coding_info: &vk::VideoEndCodingInfoKHR,
    ) {
        (self.device_fp.cmd_end_video_coding_khr)(command_buffer, end_coding_info);
    }
}

pub struct VideoEncodeQueueFns {
    handle: vk::Device,
    instance_fp: video_encode_queue::InstanceFn,
    device_fp: video_encode_queue::DeviceFn,
}

impl VideoEncodeQueueFns {
    pub fn load(entry: &ash::Entry, instance: &ash::Instance, device: &ash::Device) -> Self {
        let handle = device.handle();
        let loader = |name: &std::ffi::CStr| unsafe {
            std::mem::transmute(entry.get_instance_proc_addr(instance.handle(), name.as_ptr()))
        };

        Self {
            handle,
            instance_fp: video_encode_queue::InstanceFn::load(loader),
            device_fp: video_encode_queue::DeviceFn::load(loader),
        }
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkGetPhysicalDeviceVideoEncodeQualityLevelPropertiesKHR.html>
    pub unsafe fn get_physical_device_video_encode_quality_level_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        quality_level_info: &vk::PhysicalDeviceVideoEncodeQualityLevelInfoKHR,
        quality_level_properties: &mut vk::VideoEncodeQualityLevelPropertiesKHR,
    ) -> VkResult<()> {
        (self
            .instance_fp
            .get_physical_device_video_encode_quality_level_properties_khr)(
            physical_device,
            quality_level_info,
            quality_level_properties,
        )
        .result()
    }

    #[inline]
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkCmdEncodeVideoKHR.html>
    pub unsafe fn cmd_encode_video(
        &self,
        command_buffer: vk::CommandBuffer,
        encode_info: &vk::VideoEncodeInfoKHR,
    ) {
        (self.device_fp.cmd_encode_video_khr)(command_buffer, encode_info);
    }

    #[inline]
    /// Runs the two-call size/data protocol of
    /// <https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/vkGetEncodedVideoSessionParametersKHR.html>
    pub unsafe fn get_encoded_video_session_parameters(
        &self,
        session_parameters_info: &vk::VideoEncodeSessionParametersGetInfoKHR,
        feedback_info: &mut vk::VideoEncodeSessionParametersFeedbackInfoKHR,
    ) -> VkResult<Vec<u8>> {
        let feedback: *mut _ = feedback_info;

        let mut size = 0usize;
        (self.device_fp.get_encoded_video_session_parameters_khr)(
            self.handle,
            session_parameters_info,
            feedback,
            &mut size,
            std::ptr::null_mut(),
        )
        .result()?;

        let mut data = Vec::<u8>::with_capacity(size);
        let err_code = (self.device_fp.get_encoded_video_session_parameters_khr)(
            self.handle,
            session_parameters_info,
            feedback,
            &mut size,
            data.as_mut_ptr().cast(),
        );

        data.set_len(size);
        err_code.result_with_success(data)
    }
}

/// Repeatedly calls `f` until it stops returning `VK_INCOMPLETE`,
/// reading all available items into a vector. Items are
/// default-initialized first, which `s_type`-carrying output structs
/// require.
pub(crate) unsafe fn read_into_defaulted_vector<T: Default + Clone>(
    f: impl Fn(&mut u32, *mut T) -> vk::Result,
) -> VkResult<Vec<T>> {
    loop {
        let mut count = 0u32;
        f(&mut count, std::ptr::null_mut()).result()?;

        let mut data = vec![T::default(); count as usize];
        let err_code = f(&mut count, data.as_mut_ptr());
        if err_code != vk::Result::INCOMPLETE {
            data.truncate(count as usize);
            break err_code.result_with_success(data);
        }
    }
}
