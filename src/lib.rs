// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! A Vulkan Video encoder core for H.264 and H.265.
//!
//! The crate takes raw GPU-resident frames in display order and produces
//! compressed frames in decode order, handling GOP scheduling, reference
//! management, Vulkan video-session orchestration and bitstream assembly
//! in between. Device discovery and NAL serialization are the caller's
//! business: the encoder consumes an opaque [`GpuContext`] and a
//! [`CodecBitWriter`].

// It's not us, it's vulkan.
#![allow(clippy::too_many_arguments)]

use ash::vk;

pub mod bitstream;
pub mod config;
mod dpb;
mod encoder;
mod frame;
mod gop;
pub mod gpu;
mod levels;
mod operation;
mod rate_control;
mod reorder;
mod session;
mod stats;

pub use bitstream::{CodecBitWriter, ParameterSets, SeiMessage, SliceHeaderData};
pub use config::{EncoderConfig, Profile, RateControlMode};
pub use encoder::{EncodedFrame, FrameError, H264Encoder, H265Encoder, VulkanEncoder};
pub use gpu::{GpuContext, GpuQueue, VkImage};
pub use stats::EncodeStats;

/// The codec an encoder instance produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

/// The slice type assigned to a frame by the GOP planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    I,
    P,
    B,
}

impl std::fmt::Display for SliceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SliceType::I => write!(f, "I"),
            SliceType::P => write!(f, "P"),
            SliceType::B => write!(f, "B"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or unsupportable configuration. Fatal for the instance;
    /// the encoder is left safe to destroy.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A Vulkan call failed. Per-frame occurrences are surfaced on the
    /// output path and the encoder keeps going.
    #[error("{call}: {result:?}")]
    Gpu {
        call: &'static str,
        result: vk::Result,
    },

    /// An internal invariant was violated. Indicates a bug; the frame
    /// fails and the encoder stops.
    #[error("encoder invariant violated: {0}")]
    Invariant(String),

    /// Out of memory or staging space. The frame fails.
    #[error("resource exhausted: {0}")]
    Exhausted(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Maps `VkResult`-returning calls onto [`Error::Gpu`], keeping the name
/// of the failing entry point.
pub(crate) trait VkCall<T> {
    fn vk(self, call: &'static str) -> Result<T>;
}

impl<T> VkCall<T> for std::result::Result<T, vk::Result> {
    fn vk(self, call: &'static str) -> Result<T> {
        self.map_err(|result| Error::Gpu { call, result })
    }
}
