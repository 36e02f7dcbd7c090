// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use ash::vk;
use tracing::instrument;

use crate::{Result, VkCall};

use super::GpuContext;

/// A timeline semaphore shared between the encoder and whoever produced
/// or consumes the image it guards.
#[derive(Clone)]
pub struct VkTimelineSemaphore(Arc<Inner>);

struct Inner {
    gpu: Arc<GpuContext>,
    sema: vk::Semaphore,
}

/// A specific value on a timeline.
#[derive(Clone)]
pub struct VkTimelinePoint(Arc<Inner>, u64);

impl From<VkTimelinePoint> for u64 {
    fn from(value: VkTimelinePoint) -> Self {
        value.1
    }
}

impl std::ops::Add<u64> for VkTimelinePoint {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        Self(self.0, self.1 + rhs)
    }
}

impl std::ops::Add<u64> for &VkTimelinePoint {
    type Output = VkTimelinePoint;

    fn add(self, rhs: u64) -> Self::Output {
        VkTimelinePoint(self.0.clone(), self.1 + rhs)
    }
}

impl std::ops::AddAssign<u64> for VkTimelinePoint {
    fn add_assign(&mut self, rhs: u64) {
        self.1 += rhs
    }
}

impl VkTimelineSemaphore {
    pub fn new(gpu: Arc<GpuContext>, initial_value: u64) -> Result<Self> {
        let sema = unsafe {
            gpu.device
                .create_semaphore(
                    &vk::SemaphoreCreateInfo::default().push_next(
                        &mut vk::SemaphoreTypeCreateInfo::default()
                            .semaphore_type(vk::SemaphoreType::TIMELINE)
                            .initial_value(initial_value),
                    ),
                    None,
                )
                .vk("vkCreateSemaphore")?
        };

        Ok(Self(Arc::new(Inner { gpu, sema })))
    }

    pub fn new_point(&self, value: u64) -> VkTimelinePoint {
        VkTimelinePoint(self.0.clone(), value)
    }

    pub fn as_semaphore(&self) -> vk::Semaphore {
        self.0.sema
    }
}

impl VkTimelinePoint {
    pub fn value(&self) -> u64 {
        self.1
    }

    pub fn timeline(&self) -> VkTimelineSemaphore {
        VkTimelineSemaphore(self.0.clone())
    }

    #[instrument(level = "trace", skip_all)]
    pub unsafe fn wait(&self, timeout_ns: u64) -> Result<()> {
        let device = &self.0.gpu.device;
        device
            .wait_semaphores(
                &vk::SemaphoreWaitInfo::default()
                    .semaphores(std::slice::from_ref(&self.0.sema))
                    .values(std::slice::from_ref(&self.1)),
                timeout_ns,
            )
            .vk("vkWaitSemaphores")?;

        Ok(())
    }

    #[instrument(level = "trace", skip_all)]
    pub unsafe fn signal(&self) -> Result<()> {
        let device = &self.0.gpu.device;
        device
            .signal_semaphore(
                &vk::SemaphoreSignalInfo::default()
                    .semaphore(self.0.sema)
                    .value(self.1),
            )
            .vk("vkSignalSemaphore")?;

        Ok(())
    }

    pub unsafe fn poll(&self) -> Result<bool> {
        let device = &self.0.gpu.device;
        let value = device
            .get_semaphore_counter_value(self.0.sema)
            .vk("vkGetSemaphoreCounterValue")?;
        Ok(value >= self.1)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            self.gpu.device.destroy_semaphore(self.sema, None);
        }
    }
}
