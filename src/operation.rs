// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! One GPU operation at a time: command-buffer begin/end, image
//! barriers, timeline-semaphore dependencies, the encode-feedback query
//! pool, submission and deferred cleanup.
//!
//! Fences and their command buffers land on a trash list at submit and
//! are reclaimed on [`OperationRecorder::wait`]; a timeout leaves them
//! there until the fence eventually signals.

use std::sync::Arc;

use ash::vk;
use hashbrown::HashMap;
use tracing::{instrument, trace, warn};

use crate::gpu::{allocate_command_buffer, create_fence, GpuContext, VkImage};
use crate::{Error, Result, VkCall};

/// How submits and barriers are expressed, fixed at construction from
/// the extensions the device carries. Every recorded operation is valid
/// under all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPath {
    /// `vkQueueSubmit2` and the two-struct barrier form.
    Sync2,
    /// Plain submit with split timeline wait/signal value arrays.
    Timeline,
    /// Plain submit, binary semaphores only.
    Binary,
}

struct DependencyFrame {
    image: Arc<VkImage>,
    updated: bool,
    semaphored: bool,
    dst_stage: vk::PipelineStageFlags2,
    new_access: vk::AccessFlags2,
    new_layout: vk::ImageLayout,
    new_queue_family: u32,
}

enum BarrierBatch {
    Sync2(Vec<vk::ImageMemoryBarrier2<'static>>),
    Legacy {
        barriers: Vec<vk::ImageMemoryBarrier<'static>>,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
    },
}

impl BarrierBatch {
    fn clear(&mut self) {
        match self {
            BarrierBatch::Sync2(barriers) => barriers.clear(),
            BarrierBatch::Legacy {
                barriers,
                src_stages,
                dst_stages,
            } => {
                barriers.clear();
                *src_stages = vk::PipelineStageFlags::empty();
                *dst_stages = vk::PipelineStageFlags::empty();
            }
        }
    }
}

#[derive(Clone, Copy)]
struct SemaphoreOp {
    semaphore: vk::Semaphore,
    value: u64,
    stage: vk::PipelineStageFlags2,
}

struct QueryPool {
    pool: vk::QueryPool,
    count: u32,
}

/// The result element of one `VIDEO_ENCODE_FEEDBACK` query with status.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeFeedback {
    pub offset: u32,
    pub size: u32,
    pub status: i32,
}

pub struct OperationRecorder {
    gpu: Arc<GpuContext>,
    sync: SyncPath,

    cmd_buf: Option<vk::CommandBuffer>,
    trash: Vec<(vk::Fence, vk::CommandBuffer)>,

    deps: HashMap<vk::Image, DependencyFrame>,
    wait_semaphores: Vec<SemaphoreOp>,
    signal_semaphores: Vec<SemaphoreOp>,
    barriers: BarrierBatch,

    query: Option<QueryPool>,
}

impl OperationRecorder {
    pub fn new(gpu: Arc<GpuContext>) -> Self {
        let sync = if gpu.has_sync2 {
            SyncPath::Sync2
        } else if gpu.has_timeline {
            SyncPath::Timeline
        } else {
            SyncPath::Binary
        };

        trace!(?sync, "selected synchronization path");

        let barriers = match sync {
            SyncPath::Sync2 => BarrierBatch::Sync2(Vec::new()),
            _ => BarrierBatch::Legacy {
                barriers: Vec::new(),
                src_stages: vk::PipelineStageFlags::empty(),
                dst_stages: vk::PipelineStageFlags::empty(),
            },
        };

        OperationRecorder {
            gpu,
            sync,
            cmd_buf: None,
            trash: Vec::new(),
            deps: HashMap::new(),
            wait_semaphores: Vec::new(),
            signal_semaphores: Vec::new(),
            barriers,
            query: None,
        }
    }

    /// The command buffer being recorded. Only valid between `begin`
    /// and `end`.
    pub fn cmd(&self) -> vk::CommandBuffer {
        self.cmd_buf.expect("no operation in flight")
    }

    /// Starts recording a fresh operation, waiting out a previous one
    /// that is still in flight.
    pub unsafe fn begin(&mut self) -> Result<()> {
        if self.cmd_buf.is_some() && !self.wait(u64::MAX)? {
            warn!("previous operation timed out");
        }

        let pool = self.gpu.encode_queue.command_pool.lock();
        let cb = allocate_command_buffer(&self.gpu.device, *pool)?;
        drop(pool);

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.gpu
            .device
            .begin_command_buffer(cb, &begin_info)
            .vk("vkBeginCommandBuffer")?;

        if let Some(query) = &self.query {
            self.gpu
                .device
                .cmd_reset_query_pool(cb, query.pool, 0, query.count);
        }

        self.cmd_buf = Some(cb);
        Ok(())
    }

    /// Registers the state an image will be in after this operation
    /// submits, so the tracked [`crate::gpu::ImageState`] can be fixed
    /// up automatically.
    pub fn update_frame(
        &mut self,
        image: &Arc<VkImage>,
        dst_stage: vk::PipelineStageFlags2,
        new_access: vk::AccessFlags2,
        new_layout: vk::ImageLayout,
        new_queue_family: u32,
    ) {
        let entry = self
            .deps
            .entry(image.image)
            .or_insert_with(|| DependencyFrame {
                image: image.clone(),
                updated: false,
                semaphored: false,
                dst_stage,
                new_access,
                new_layout,
                new_queue_family,
            });

        entry.updated = true;
        entry.dst_stage = dst_stage;
        entry.new_access = new_access;
        entry.new_layout = new_layout;
        entry.new_queue_family = new_queue_family;
    }

    /// Appends an image barrier moving `image` (or a single layer of it)
    /// from its tracked state into the given one, and registers the
    /// post-submit fix-up.
    pub fn add_frame_barrier(
        &mut self,
        image: &Arc<VkImage>,
        dst_stage: vk::PipelineStageFlags2,
        new_access: vk::AccessFlags2,
        new_layout: vk::ImageLayout,
        new_queue_family: u32,
        base_array_layer: Option<u32>,
    ) {
        // A pending update from this same operation supersedes the
        // tracked state.
        let (src_stage, src_access, old_layout, src_family) = match self.deps.get(&image.image) {
            Some(dep) if dep.updated => (
                dep.dst_stage,
                dep.new_access,
                dep.new_layout,
                dep.new_queue_family,
            ),
            _ => {
                let state = image.state.lock();
                (state.stage, state.access, state.layout, state.queue_family)
            }
        };

        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: base_array_layer.unwrap_or(0),
            layer_count: match base_array_layer {
                Some(_) => 1,
                None => vk::REMAINING_ARRAY_LAYERS,
            },
        };

        match &mut self.barriers {
            BarrierBatch::Sync2(barriers) => {
                barriers.push(
                    vk::ImageMemoryBarrier2::default()
                        .src_stage_mask(src_stage)
                        .src_access_mask(src_access)
                        .dst_stage_mask(dst_stage)
                        .dst_access_mask(new_access)
                        .old_layout(old_layout)
                        .new_layout(new_layout)
                        .src_queue_family_index(src_family)
                        .dst_queue_family_index(new_queue_family)
                        .image(image.image)
                        .subresource_range(subresource_range),
                );
            }
            BarrierBatch::Legacy {
                barriers,
                src_stages,
                dst_stages,
            } => {
                barriers.push(
                    vk::ImageMemoryBarrier::default()
                        .src_access_mask(truncate_access(src_access))
                        .dst_access_mask(truncate_access(new_access))
                        .old_layout(old_layout)
                        .new_layout(new_layout)
                        .src_queue_family_index(src_family)
                        .dst_queue_family_index(new_queue_family)
                        .image(image.image)
                        .subresource_range(subresource_range),
                );
                *src_stages |= truncate_stage(src_stage);
                *dst_stages |= truncate_stage(dst_stage);
            }
        }

        self.update_frame(image, dst_stage, new_access, new_layout, new_queue_family);
    }

    /// Records the accumulated barriers into the command buffer.
    pub unsafe fn record_barriers(&mut self) {
        let cb = self.cmd();

        match &mut self.barriers {
            BarrierBatch::Sync2(barriers) => {
                if barriers.is_empty() {
                    return;
                }

                self.gpu.device.cmd_pipeline_barrier2(
                    cb,
                    &vk::DependencyInfo::default().image_memory_barriers(barriers),
                );
            }
            BarrierBatch::Legacy {
                barriers,
                src_stages,
                dst_stages,
            } => {
                if barriers.is_empty() {
                    return;
                }

                let src = if src_stages.is_empty() {
                    vk::PipelineStageFlags::TOP_OF_PIPE
                } else {
                    *src_stages
                };

                self.gpu.device.cmd_pipeline_barrier(
                    cb,
                    src,
                    *dst_stages,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    barriers,
                );
            }
        }

        self.barriers.clear();
    }

    /// Adds `image` as an operation dependency: its timeline semaphore
    /// is waited on at the current value and signalled at the next one.
    /// Without timeline semaphores this is a no-op; submission order is
    /// the only cross-submit guarantee then.
    pub fn add_dependency_frame(
        &mut self,
        image: &Arc<VkImage>,
        wait_stage: vk::PipelineStageFlags2,
        signal_stage: vk::PipelineStageFlags2,
    ) {
        let Some(timeline) = &image.timeline else {
            return;
        };

        if self.sync == SyncPath::Binary {
            return;
        }

        match self.deps.get_mut(&image.image) {
            Some(dep) if dep.semaphored => return,
            Some(dep) => dep.semaphored = true,
            None => {
                self.deps.insert(
                    image.image,
                    DependencyFrame {
                        image: image.clone(),
                        updated: false,
                        semaphored: true,
                        dst_stage: vk::PipelineStageFlags2::NONE,
                        new_access: vk::AccessFlags2::NONE,
                        new_layout: vk::ImageLayout::UNDEFINED,
                        new_queue_family: vk::QUEUE_FAMILY_IGNORED,
                    },
                );
            }
        }

        let value = image.state.lock().semaphore_value;
        self.wait_semaphores.push(SemaphoreOp {
            semaphore: timeline.as_semaphore(),
            value,
            stage: wait_stage,
        });
        self.signal_semaphores.push(SemaphoreOp {
            semaphore: timeline.as_semaphore(),
            value: value + 1,
            stage: signal_stage,
        });
    }

    /// Creates the feedback query pool. `pnext` chains the
    /// codec-profile and feedback-flag structs.
    pub unsafe fn enable_query(
        &mut self,
        query_type: vk::QueryType,
        count: u32,
        pnext: &mut impl vk::ExtendsQueryPoolCreateInfo,
    ) -> Result<()> {
        if self.query.is_some() {
            return Ok(());
        }

        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(query_type)
            .query_count(count)
            .push_next(pnext);

        let pool = self
            .gpu
            .device
            .create_query_pool(&create_info, None)
            .vk("vkCreateQueryPool")?;

        self.query = Some(QueryPool { pool, count });
        Ok(())
    }

    pub unsafe fn begin_query(&self, id: u32) {
        if let Some(query) = &self.query {
            self.gpu
                .device
                .cmd_begin_query(self.cmd(), query.pool, id, vk::QueryControlFlags::empty());
        }
    }

    pub unsafe fn end_query(&self, id: u32) {
        if let Some(query) = &self.query {
            self.gpu.device.cmd_end_query(self.cmd(), query.pool, id);
        }
    }

    /// Ends recording and submits. The fence and command buffer join
    /// the trash list; dependency images get their tracked state and
    /// timeline values advanced as if the GPU already ran.
    pub unsafe fn end(&mut self) -> Result<()> {
        let cb = self.cmd();

        self.gpu
            .device
            .end_command_buffer(cb)
            .vk("vkEndCommandBuffer")?;

        let fence = create_fence(&self.gpu.device)?;

        let submit_result = {
            let _guard = self.gpu.encode_queue.submit_lock.lock();
            match self.sync {
                SyncPath::Sync2 => self.submit2(cb, fence),
                SyncPath::Timeline => self.submit1(cb, fence, true),
                SyncPath::Binary => self.submit1(cb, fence, false),
            }
        };

        if let Err(err) = submit_result {
            self.gpu.device.destroy_fence(fence, None);
            return Err(err);
        }

        self.trash.push((fence, cb));

        for dep in self.deps.values_mut() {
            if dep.updated {
                let mut state = dep.image.state.lock();
                state.stage = dep.dst_stage;
                state.access = dep.new_access;
                state.layout = dep.new_layout;
                state.queue_family = dep.new_queue_family;
            }

            if dep.semaphored {
                dep.image.state.lock().semaphore_value += 1;
            }

            dep.updated = false;
            dep.semaphored = false;
        }

        Ok(())
    }

    unsafe fn submit2(&self, cb: vk::CommandBuffer, fence: vk::Fence) -> Result<()> {
        let cb_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cb)];

        let wait_infos: Vec<vk::SemaphoreSubmitInfo> = self
            .wait_semaphores
            .iter()
            .map(|op| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(op.semaphore)
                    .value(op.value)
                    .stage_mask(op.stage)
            })
            .collect();

        let signal_infos: Vec<vk::SemaphoreSubmitInfo> = self
            .signal_semaphores
            .iter()
            .map(|op| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(op.semaphore)
                    .value(op.value)
                    .stage_mask(op.stage)
            })
            .collect();

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos)
            .command_buffer_infos(&cb_infos);

        self.gpu
            .device
            .queue_submit2(self.gpu.encode_queue.queue, &[submit_info], fence)
            .vk("vkQueueSubmit2")
    }

    unsafe fn submit1(&self, cb: vk::CommandBuffer, fence: vk::Fence, timeline: bool) -> Result<()> {
        let wait_semaphores: Vec<vk::Semaphore> =
            self.wait_semaphores.iter().map(|op| op.semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = self
            .wait_semaphores
            .iter()
            .map(|op| truncate_stage(op.stage))
            .collect();
        let signal_semaphores: Vec<vk::Semaphore> = self
            .signal_semaphores
            .iter()
            .map(|op| op.semaphore)
            .collect();

        let wait_values: Vec<u64> = self.wait_semaphores.iter().map(|op| op.value).collect();
        let signal_values: Vec<u64> = self.signal_semaphores.iter().map(|op| op.value).collect();

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let cbs = [cb];
        let mut submit_info = vk::SubmitInfo::default()
            .command_buffers(&cbs)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores);

        if timeline {
            submit_info = submit_info.push_next(&mut timeline_info);
        }

        self.gpu
            .device
            .queue_submit(self.gpu.encode_queue.queue, &[submit_info], fence)
            .vk("vkQueueSubmit")
    }

    /// Waits out the trash list and reclaims it. Returns `false` on
    /// timeout, leaving the fences and command buffers to be reclaimed
    /// by a later wait.
    #[instrument(level = "trace", skip_all)]
    pub unsafe fn wait(&mut self, timeout_ns: u64) -> Result<bool> {
        if !self.trash.is_empty() {
            let fences: Vec<vk::Fence> = self.trash.iter().map(|(fence, _)| *fence).collect();
            match self.gpu.device.wait_for_fences(&fences, true, timeout_ns) {
                Ok(()) => (),
                Err(vk::Result::TIMEOUT) => {
                    warn!("timed out waiting for the GPU; deferring cleanup");
                    return Ok(false);
                }
                Err(result) => {
                    return Err(Error::Gpu {
                        call: "vkWaitForFences",
                        result,
                    })
                }
            }

            let pool = self.gpu.encode_queue.command_pool.lock();
            for (fence, cb) in self.trash.drain(..) {
                self.gpu.device.destroy_fence(fence, None);
                self.gpu.device.free_command_buffers(*pool, &[cb]);
            }
        }

        self.discard_dependencies();
        self.cmd_buf = None;

        Ok(true)
    }

    /// Drops the per-operation dependency and semaphore arrays.
    pub fn discard_dependencies(&mut self) {
        self.deps.clear();
        self.wait_semaphores.clear();
        self.signal_semaphores.clear();
        self.barriers.clear();
    }

    /// Reads back one feedback element; `status` is only meaningful
    /// when the result status is complete.
    pub unsafe fn retrieve_query(&self, id: u32) -> Result<EncodeFeedback> {
        let Some(query) = &self.query else {
            return Err(Error::invariant("no query pool enabled"));
        };

        let mut results = [EncodeFeedback::default()];
        self.gpu
            .device
            .get_query_pool_results(
                query.pool,
                id,
                &mut results,
                vk::QueryResultFlags::WITH_STATUS_KHR,
            )
            .vk("vkGetQueryPoolResults")?;

        Ok(results[0])
    }
}

impl Drop for OperationRecorder {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.wait(u64::MAX) {
                warn!("failed to drain pending operations: {err}");
            }

            if let Some(query) = self.query.take() {
                self.gpu.device.destroy_query_pool(query.pool, None);
            }
        }
    }
}

/// The synchronization2 flag types are supersets; the legacy submit
/// path can only express the low 32 bits.
fn truncate_stage(stage: vk::PipelineStageFlags2) -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::from_raw(stage.as_raw() as u32)
}

fn truncate_access(access: vk::AccessFlags2) -> vk::AccessFlags {
    vk::AccessFlags::from_raw(access.as_raw() as u32)
}
