// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

use std::{sync::Arc, time};

use parking_lot::Mutex;

use crate::SliceType;

/// Running output statistics for one encoder instance, cheap to clone
/// and share with whoever wants to print them.
#[derive(Default, Clone)]
pub struct EncodeStats {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    start: time::Instant,
    stream_stats: TypeStats,
    keyframe_stats: TypeStats,
    p_stats: TypeStats,
    b_stats: TypeStats,
}

impl Default for Inner {
    fn default() -> Self {
        let start = time::Instant::now();

        Self {
            start,
            stream_stats: TypeStats::new(start),
            keyframe_stats: TypeStats::new(start),
            p_stats: TypeStats::new(start),
            b_stats: TypeStats::new(start),
        }
    }
}

struct TypeStats {
    start: time::Instant,
    min: usize,
    max: usize,
    total: u64,
}

impl TypeStats {
    fn new(start: time::Instant) -> Self {
        Self {
            start,
            min: 0,
            max: 0,
            total: 0,
        }
    }

    fn record_frame_size(&mut self, len: usize) {
        self.total += len as u64;

        if self.min == 0 || len < self.min {
            self.min = len;
        }

        if len > self.max {
            self.max = len;
        }
    }
}

impl std::fmt::Debug for TypeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let period = self.start.elapsed();

        let mut f = f.debug_struct("TypeStats");

        f.field("frame_min", &self.min);
        f.field("frame_max", &self.max);
        f.field("rate_mbps", &calculate_rate(period, self.total));

        f.finish()
    }
}

impl EncodeStats {
    pub fn record_frame_size(&self, slice_type: SliceType, sync_point: bool, len: usize) {
        let mut inner = self.inner.lock();

        inner.stream_stats.record_frame_size(len);
        if sync_point {
            inner.keyframe_stats.record_frame_size(len);
        } else {
            match slice_type {
                SliceType::I | SliceType::P => inner.p_stats.record_frame_size(len),
                SliceType::B => inner.b_stats.record_frame_size(len),
            }
        }
    }
}

impl std::fmt::Debug for EncodeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();

        let mut f = f.debug_struct("EncodeStats");

        f.field("duration", &inner.start.elapsed());
        f.field("totals", &inner.stream_stats);
        f.field("IDR", &inner.keyframe_stats);
        f.field("P", &inner.p_stats);
        f.field("B", &inner.b_stats);

        f.finish()
    }
}

fn calculate_rate(dur: time::Duration, total: u64) -> f32 {
    // Total is in bytes, we want mbit/s.
    let total_mbits = total as f32 / (1024.0 * 1024.0) * 8.0;
    total_mbits / dur.as_secs_f32()
}
