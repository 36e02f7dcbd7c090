// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

use ash::vk;

use crate::{Error, Result, VideoCodec};

pub const DEFAULT_IDR_PERIOD: u32 = 30;
pub const DEFAULT_AVERAGE_BITRATE: u32 = 10_000_000;

/// The codec profile. Validity depends on the codec: H.264 accepts
/// `Main` and `High`, H.265 accepts `Main` and `Main10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Main,
    High,
    Main10,
}

/// The rate-control mode handed to the GPU implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateControlMode {
    /// Leave rate control to the driver defaults.
    #[default]
    Default,
    /// Rate control off; constant-QP encoding using the per-type QPs.
    Disabled,
    Cbr,
    Vbr,
}

impl RateControlMode {
    pub fn as_vk(&self) -> vk::VideoEncodeRateControlModeFlagsKHR {
        match self {
            RateControlMode::Default => vk::VideoEncodeRateControlModeFlagsKHR::DEFAULT,
            RateControlMode::Disabled => vk::VideoEncodeRateControlModeFlagsKHR::DISABLED,
            RateControlMode::Cbr => vk::VideoEncodeRateControlModeFlagsKHR::CBR,
            RateControlMode::Vbr => vk::VideoEncodeRateControlModeFlagsKHR::VBR,
        }
    }
}

/// Encoder configuration, immutable once the encoder has started. A
/// replacement config may be staged with
/// [`crate::VulkanEncoder::request_config_change`] and is applied at the
/// next GOP boundary.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub codec: VideoCodec,
    pub profile: Profile,
    /// Explicit level idc, or `None` to derive one from resolution and
    /// frame rate.
    pub level_idc: Option<u8>,

    /// Coded dimensions in luma samples.
    pub width: u32,
    pub height: u32,
    /// Frame rate as a rational (numerator, denominator).
    pub fps: (u32, u32),
    /// Luma/chroma bit depth, 8 or 10.
    pub bit_depth: u8,

    /// Frames between IDRs. 0 means one IDR per second.
    pub idr_period: u32,
    /// Consecutive B frames between anchors. Ignored (forced to 0) for
    /// H.264.
    pub num_bframes: u32,
    pub b_pyramid: bool,
    /// Additional I frames inserted inside a GOP.
    pub num_iframes: u32,
    /// DPB depth, both lists together.
    pub num_ref_frames: u32,

    pub rate_control: RateControlMode,
    /// Target bitrate in bits per second.
    pub average_bitrate: u32,
    /// Implementation-defined quality hint, 0 = driver default.
    pub quality_level: u32,
    pub min_qp: u32,
    pub max_qp: u32,
    pub qp_i: u32,
    pub qp_p: u32,
    pub qp_b: u32,

    pub num_slices: u32,
    /// Insert an access-unit delimiter before every frame.
    pub aud: bool,
    /// Insert CEA-708 closed captions as registered-user-data SEI.
    pub cc_insert: bool,
}

impl EncoderConfig {
    pub fn new(codec: VideoCodec, width: u32, height: u32, fps: (u32, u32)) -> Self {
        EncoderConfig {
            codec,
            profile: Profile::Main,
            level_idc: None,
            width,
            height,
            fps,
            bit_depth: 8,
            idr_period: DEFAULT_IDR_PERIOD,
            num_bframes: 0,
            b_pyramid: false,
            num_iframes: 0,
            num_ref_frames: 3,
            rate_control: RateControlMode::Default,
            average_bitrate: DEFAULT_AVERAGE_BITRATE,
            quality_level: 0,
            min_qp: 1,
            max_qp: 51,
            qp_i: 26,
            qp_p: 26,
            qp_b: 26,
            num_slices: 1,
            aud: false,
            cc_insert: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match (self.codec, self.profile) {
            (VideoCodec::H264, Profile::Main | Profile::High) => (),
            (VideoCodec::H265, Profile::Main | Profile::Main10) => (),
            (codec, profile) => {
                return Err(Error::config(format!(
                    "profile {profile:?} is not valid for {codec:?}"
                )))
            }
        }

        if self.width == 0 || self.height == 0 {
            return Err(Error::config("zero coded dimensions"));
        }

        if self.fps.0 == 0 || self.fps.1 == 0 {
            return Err(Error::config("invalid frame rate"));
        }

        if !matches!(self.bit_depth, 8 | 10) {
            return Err(Error::config(format!(
                "unsupported bit depth {}",
                self.bit_depth
            )));
        }

        if self.bit_depth == 10 && self.profile != Profile::Main10 {
            return Err(Error::config("10-bit input requires the main-10 profile"));
        }

        if self.idr_period > 1024 {
            return Err(Error::config("idr-period out of range (0..=1024)"));
        }

        if self.num_ref_frames > 15 {
            return Err(Error::config("ref-frames out of range (0..=15)"));
        }

        if self.num_slices == 0 || self.num_slices > 200 {
            return Err(Error::config("num-slices out of range (1..=200)"));
        }

        for (name, qp) in [
            ("min-qp", self.min_qp),
            ("max-qp", self.max_qp),
            ("qp-i", self.qp_i),
            ("qp-p", self.qp_p),
            ("qp-b", self.qp_b),
        ] {
            if qp > 51 {
                return Err(Error::config(format!("{name} out of range (0..=51)")));
            }
        }

        if self.min_qp > self.max_qp {
            return Err(Error::config("min-qp above max-qp"));
        }

        Ok(())
    }

    /// Frame duration in nanoseconds.
    pub fn frame_duration(&self) -> u64 {
        1_000_000_000u64 * self.fps.1 as u64 / self.fps.0 as u64
    }

    pub(crate) fn chroma_subsampling(&self) -> vk::VideoChromaSubsamplingFlagsKHR {
        // 4:2:0 is the only subsampling the input path produces.
        vk::VideoChromaSubsamplingFlagsKHR::TYPE_420
    }

    pub(crate) fn component_bit_depth(&self) -> vk::VideoComponentBitDepthFlagsKHR {
        match self.bit_depth {
            10 => vk::VideoComponentBitDepthFlagsKHR::TYPE_10,
            _ => vk::VideoComponentBitDepthFlagsKHR::TYPE_8,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_match_property_table() {
        let cfg = EncoderConfig::new(VideoCodec::H264, 1920, 1080, (30, 1));
        assert_eq!(cfg.idr_period, 30);
        assert_eq!(cfg.num_slices, 1);
        assert_eq!(cfg.min_qp, 1);
        assert_eq!(cfg.max_qp, 51);
        assert_eq!((cfg.qp_i, cfg.qp_p, cfg.qp_b), (26, 26, 26));
        assert_eq!(cfg.num_ref_frames, 3);
        assert_eq!(cfg.average_bitrate, 10_000_000);
        assert_eq!(cfg.quality_level, 0);
        assert!(!cfg.aud);
        assert!(!cfg.cc_insert);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range() {
        let mut cfg = EncoderConfig::new(VideoCodec::H264, 1280, 720, (30, 1));
        cfg.max_qp = 52;
        assert!(cfg.validate().is_err());

        let mut cfg = EncoderConfig::new(VideoCodec::H265, 1280, 720, (30, 1));
        cfg.num_ref_frames = 16;
        assert!(cfg.validate().is_err());

        let mut cfg = EncoderConfig::new(VideoCodec::H264, 1280, 720, (30, 1));
        cfg.profile = Profile::Main10;
        assert!(cfg.validate().is_err());
    }
}
