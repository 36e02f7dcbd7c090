// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! The GPU context the encoder consumes, plus the image and buffer
//! wrappers it tracks barrier state on. Instance and device creation,
//! queue discovery and extension negotiation happen on the caller's
//! side; this crate only requires the encode queue and the video entry
//! points.

mod chain;
pub(crate) use chain::*;

pub mod timeline;
pub mod video;

use std::ffi::c_void;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::{Error, Result, VkCall};

use self::timeline::VkTimelineSemaphore;
use self::video::{VideoEncodeQueueFns, VideoQueueFns};

/// The encode queue, its command pool, and the submit serialization
/// demanded by the queue's external-synchronization rules.
pub struct GpuQueue {
    pub queue: vk::Queue,
    pub family: u32,
    pub command_pool: Mutex<vk::CommandPool>,
    pub submit_lock: Mutex<()>,
}

impl GpuQueue {
    pub fn new(device: &ash::Device, family: u32) -> Result<Self> {
        let queue = unsafe { device.get_device_queue(family, 0) };

        let command_pool = unsafe {
            let create_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

            device
                .create_command_pool(&create_info, None)
                .vk("vkCreateCommandPool")?
        };

        Ok(Self {
            queue,
            family,
            command_pool: Mutex::new(command_pool),
            submit_lock: Mutex::new(()),
        })
    }
}

/// Everything the encoder needs from the caller's Vulkan setup. The
/// device must have been created with `VK_KHR_video_queue`,
/// `VK_KHR_video_encode_queue` and the codec encode extension enabled.
pub struct GpuContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub device: ash::Device,
    pub pdevice: vk::PhysicalDevice,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    pub host_visible_mem_type_index: u32,

    pub encode_queue: GpuQueue,

    pub video_fns: VideoQueueFns,
    pub encode_fns: VideoEncodeQueueFns,

    /// `VK_KHR_synchronization2` (or 1.3 core) is usable.
    pub has_sync2: bool,
    /// `VK_KHR_timeline_semaphore` (or 1.2 core) is usable.
    pub has_timeline: bool,
}

impl GpuContext {
    pub fn new(
        entry: ash::Entry,
        instance: ash::Instance,
        device: ash::Device,
        pdevice: vk::PhysicalDevice,
        encode_family: u32,
        has_sync2: bool,
        has_timeline: bool,
    ) -> Result<Arc<Self>> {
        let memory_props = unsafe { instance.get_physical_device_memory_properties(pdevice) };

        let host_visible_mem_type_index = select_memory_type(
            &memory_props,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_CACHED
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            None,
        )
        .or_else(|| {
            select_memory_type(
                &memory_props,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                None,
            )
        })
        .ok_or_else(|| Error::config("no host visible memory type found"))?;

        let encode_queue = GpuQueue::new(&device, encode_family)?;
        let video_fns = VideoQueueFns::load(&entry, &instance, &device);
        let encode_fns = VideoEncodeQueueFns::load(&entry, &instance, &device);

        Ok(Arc::new(GpuContext {
            entry,
            instance,
            device,
            pdevice,
            memory_props,
            host_visible_mem_type_index,
            encode_queue,
            video_fns,
            encode_fns,
            has_sync2,
            has_timeline,
        }))
    }
}

/// The barrier-relevant state of an image, updated after every submit
/// that transitioned it.
#[derive(Debug, Clone, Copy)]
pub struct ImageState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
    pub queue_family: u32,
    /// Current value of the image's timeline semaphore.
    pub semaphore_value: u64,
}

impl Default for ImageState {
    fn default() -> Self {
        ImageState {
            stage: vk::PipelineStageFlags2::NONE,
            access: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::UNDEFINED,
            queue_family: vk::QUEUE_FAMILY_IGNORED,
            semaphore_value: 0,
        }
    }
}

/// A GPU image together with its tracked barrier state and, optionally,
/// the timeline semaphore guarding cross-submit access to it.
pub struct VkImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: vk::DeviceMemory,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub state: Mutex<ImageState>,
    pub timeline: Option<VkTimelineSemaphore>,
    gpu: Arc<GpuContext>,
}

impl VkImage {
    pub fn new(
        gpu: Arc<GpuContext>,
        format: vk::Format,
        width: u32,
        height: u32,
        layers: u32,
        usage: vk::ImageUsageFlags,
        profile: Option<&mut vk::VideoProfileInfoKHR>,
        with_timeline: bool,
    ) -> Result<Self> {
        let image = {
            let mut create_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(format)
                .extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(layers)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);

            let mut profile_list;
            if let Some(profile) = profile {
                profile_list = single_profile_list_info(profile);
                create_info = create_info.push_next(&mut profile_list);

                unsafe {
                    gpu.device
                        .create_image(&create_info, None)
                        .vk("vkCreateImage")?
                }
            } else {
                unsafe {
                    gpu.device
                        .create_image(&create_info, None)
                        .vk("vkCreateImage")?
                }
            }
        };

        let memory = unsafe { bind_memory_for_image(&gpu.device, &gpu.memory_props, image)? };

        let view = {
            let view_type = if layers > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            };

            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(view_type)
                .format(format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: vk::REMAINING_MIP_LEVELS,
                    base_array_layer: 0,
                    layer_count: vk::REMAINING_ARRAY_LAYERS,
                });

            unsafe {
                gpu.device
                    .create_image_view(&create_info, None)
                    .vk("vkCreateImageView")?
            }
        };

        let timeline = if with_timeline && gpu.has_timeline {
            Some(VkTimelineSemaphore::new(gpu.clone(), 0)?)
        } else {
            None
        };

        Ok(VkImage {
            image,
            view,
            memory,
            format,
            width,
            height,
            layers,
            state: Mutex::new(ImageState::default()),
            timeline,
            gpu,
        })
    }

    /// Wraps an existing image, taking ownership of its handles.
    pub fn wrap(
        gpu: Arc<GpuContext>,
        image: vk::Image,
        view: vk::ImageView,
        memory: vk::DeviceMemory,
        format: vk::Format,
        width: u32,
        height: u32,
    ) -> Self {
        VkImage {
            image,
            view,
            memory,
            format,
            width,
            height,
            layers: 1,
            state: Mutex::new(ImageState::default()),
            timeline: None,
            gpu,
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

impl Drop for VkImage {
    fn drop(&mut self) {
        unsafe {
            self.gpu.device.destroy_image_view(self.view, None);
            self.gpu.device.destroy_image(self.image, None);
            self.gpu.device.free_memory(self.memory, None);
        }
    }
}

/// A host-mapped buffer, used for the compressed output staging area.
pub struct VkHostBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub access: *mut c_void,
    pub size: usize,
    gpu: Arc<GpuContext>,
}

// SAFETY: the mapping pointer is plain host memory.
unsafe impl Send for VkHostBuffer {}

impl VkHostBuffer {
    pub fn new(
        gpu: Arc<GpuContext>,
        usage: vk::BufferUsageFlags,
        profile: Option<&mut vk::VideoProfileInfoKHR>,
        size: usize,
    ) -> Result<Self> {
        let buffer = {
            let mut create_info = vk::BufferCreateInfo::default()
                .size(size as u64)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let mut profile_list;
            if let Some(profile) = profile {
                profile_list = single_profile_list_info(profile);
                create_info = create_info.push_next(&mut profile_list);

                unsafe {
                    gpu.device
                        .create_buffer(&create_info, None)
                        .vk("vkCreateBuffer")?
                }
            } else {
                unsafe {
                    gpu.device
                        .create_buffer(&create_info, None)
                        .vk("vkCreateBuffer")?
                }
            }
        };

        let requirements = unsafe { gpu.device.get_buffer_memory_requirements(buffer) };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(gpu.host_visible_mem_type_index);

        let memory = unsafe {
            gpu.device
                .allocate_memory(&alloc_info, None)
                .vk("vkAllocateMemory")?
        };

        unsafe {
            gpu.device
                .bind_buffer_memory(buffer, memory, 0)
                .vk("vkBindBufferMemory")?
        };

        let access = unsafe {
            gpu.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .vk("vkMapMemory")?
        };

        Ok(VkHostBuffer {
            buffer,
            memory,
            access,
            size,
            gpu,
        })
    }

    /// The mapped contents, valid once the producing operation's fence
    /// has signalled.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.access as *const u8, self.size)
    }
}

impl Drop for VkHostBuffer {
    fn drop(&mut self) {
        unsafe {
            self.gpu.device.unmap_memory(self.memory);
            self.gpu.device.destroy_buffer(self.buffer, None);
            self.gpu.device.free_memory(self.memory, None);
        }
    }
}

/// The images backing the DPB slots: either one image per slot, or the
/// layers of a single array image where the implementation requires it.
pub struct DpbImagePool {
    images: Vec<Arc<VkImage>>,
    layered: bool,
    width: u32,
    height: u32,
}

impl DpbImagePool {
    pub fn new(
        gpu: Arc<GpuContext>,
        profile: &mut vk::VideoProfileInfoKHR,
        format: vk::Format,
        width: u32,
        height: u32,
        slots: usize,
        separate_images: bool,
    ) -> Result<Self> {
        let mut images = Vec::with_capacity(if separate_images { slots } else { 1 });

        if separate_images {
            for _ in 0..slots {
                images.push(Arc::new(VkImage::new(
                    gpu.clone(),
                    format,
                    width,
                    height,
                    1,
                    vk::ImageUsageFlags::VIDEO_ENCODE_DPB_KHR,
                    Some(&mut *profile),
                    true,
                )?));
            }
        } else {
            images.push(Arc::new(VkImage::new(
                gpu.clone(),
                format,
                width,
                height,
                slots as u32,
                vk::ImageUsageFlags::VIDEO_ENCODE_DPB_KHR,
                Some(profile),
                true,
            )?));
        }

        Ok(DpbImagePool {
            images,
            layered: !separate_images,
            width,
            height,
        })
    }

    pub fn image(&self, slot: usize) -> &Arc<VkImage> {
        if self.layered {
            &self.images[0]
        } else {
            &self.images[slot]
        }
    }

    pub fn base_array_layer(&self, slot: usize) -> u32 {
        if self.layered {
            slot as u32
        } else {
            0
        }
    }

    pub fn picture_resource(&self, slot: usize) -> vk::VideoPictureResourceInfoKHR<'static> {
        vk::VideoPictureResourceInfoKHR::default()
            .coded_extent(vk::Extent2D {
                width: self.width,
                height: self.height,
            })
            .base_array_layer(self.base_array_layer(slot))
            .image_view_binding(self.image(slot).view)
    }
}

pub fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    flags: vk::MemoryPropertyFlags,
    memory_type_bits: Option<u32>,
) -> Option<u32> {
    for i in 0..props.memory_type_count {
        if let Some(mask) = memory_type_bits {
            if mask & (1 << i) == 0 {
                continue;
            }
        }

        if flags.is_empty()
            || props.memory_types[i as usize]
                .property_flags
                .contains(flags)
        {
            return Some(i);
        }
    }

    None
}

pub unsafe fn bind_memory_for_image(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    image: vk::Image,
) -> Result<vk::DeviceMemory> {
    let image_memory_req = unsafe { device.get_image_memory_requirements(image) };

    let mem_type_index = select_memory_type(
        props,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        Some(image_memory_req.memory_type_bits),
    )
    .or_else(|| {
        select_memory_type(
            props,
            vk::MemoryPropertyFlags::empty(),
            Some(image_memory_req.memory_type_bits),
        )
    })
    .ok_or_else(|| {
        Error::Exhausted(format!(
            "no appropriate memory type for reqs: {image_memory_req:?}"
        ))
    })?;

    let memory = {
        let image_allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(image_memory_req.size)
            .memory_type_index(mem_type_index);

        unsafe {
            device
                .allocate_memory(&image_allocate_info, None)
                .vk("vkAllocateMemory")?
        }
    };

    unsafe {
        device
            .bind_image_memory(image, memory, 0)
            .vk("vkBindImageMemory")?;
    }

    Ok(memory)
}

pub fn allocate_command_buffer(
    device: &ash::Device,
    pool: vk::CommandPool,
) -> Result<vk::CommandBuffer> {
    let create_info = vk::CommandBufferAllocateInfo::default()
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_pool(pool)
        .command_buffer_count(1);

    let cb = unsafe {
        device
            .allocate_command_buffers(&create_info)
            .vk("vkAllocateCommandBuffers")?
            .pop()
            .unwrap()
    };

    Ok(cb)
}

pub fn create_fence(device: &ash::Device) -> Result<vk::Fence> {
    let create_info = vk::FenceCreateInfo::default();
    unsafe { device.create_fence(&create_info, None).vk("vkCreateFence") }
}

pub fn single_profile_list_info<'a>(
    profile: &'a mut vk::VideoProfileInfoKHR,
) -> vk::VideoProfileListInfoKHR<'a> {
    vk::VideoProfileListInfoKHR {
        p_profiles: <*const _>::cast(profile),
        profile_count: 1,
        ..Default::default()
    }
}
