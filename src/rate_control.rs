// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! The thin layer between the configured rate-control mode and what the
//! GPU session is told at begin-coding time.

use ash::vk;
use tracing::warn;

use crate::config::{EncoderConfig, RateControlMode};

/// Bitrates for the single rate-control layer, clamped to what the
/// implementation advertises. CBR pins the peak to the average.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerBitrates {
    pub average: u64,
    pub max: u64,
}

/// How many rate-control layers each mode sends to the GPU.
pub fn layer_count(mode: RateControlMode) -> u32 {
    match mode {
        RateControlMode::Default | RateControlMode::Disabled => 0,
        RateControlMode::Cbr | RateControlMode::Vbr => 1,
    }
}

pub fn layer_bitrates(cfg: &EncoderConfig, caps_max_bitrate: u64) -> LayerBitrates {
    let average = (cfg.average_bitrate as u64).min(caps_max_bitrate);

    match cfg.rate_control {
        RateControlMode::Cbr => LayerBitrates {
            average,
            max: average,
        },
        _ => LayerBitrates {
            average,
            max: caps_max_bitrate,
        },
    }
}

/// Downgrades the configured mode to the driver defaults if the
/// implementation doesn't advertise it.
pub fn select_mode(
    cfg: &EncoderConfig,
    caps: &vk::VideoEncodeCapabilitiesKHR,
) -> RateControlMode {
    let mode = cfg.rate_control;
    if mode == RateControlMode::Default {
        return mode;
    }

    if caps.rate_control_modes.contains(mode.as_vk()) {
        mode
    } else {
        warn!(
            ?mode,
            available = ?caps.rate_control_modes,
            "rate control mode not supported, using driver defaults"
        );
        RateControlMode::Default
    }
}

/// A quality level is only forwarded when configured and within the
/// implementation's range.
pub fn effective_quality_level(
    cfg: &EncoderConfig,
    caps: &vk::VideoEncodeCapabilitiesKHR,
) -> Option<u32> {
    if cfg.quality_level != 0 && cfg.quality_level <= caps.max_quality_levels {
        Some(cfg.quality_level)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::VideoCodec;

    fn cfg(mode: RateControlMode, bitrate: u32) -> EncoderConfig {
        let mut cfg = EncoderConfig::new(VideoCodec::H264, 1280, 720, (30, 1));
        cfg.rate_control = mode;
        cfg.average_bitrate = bitrate;
        cfg
    }

    #[test]
    fn test_layer_counts() {
        assert_eq!(layer_count(RateControlMode::Default), 0);
        assert_eq!(layer_count(RateControlMode::Disabled), 0);
        assert_eq!(layer_count(RateControlMode::Cbr), 1);
        assert_eq!(layer_count(RateControlMode::Vbr), 1);
    }

    #[test]
    fn test_cbr_pins_max_to_average() {
        let rates = layer_bitrates(&cfg(RateControlMode::Cbr, 8_000_000), 40_000_000);
        assert_eq!(rates, LayerBitrates { average: 8_000_000, max: 8_000_000 });

        let rates = layer_bitrates(&cfg(RateControlMode::Vbr, 8_000_000), 40_000_000);
        assert_eq!(rates, LayerBitrates { average: 8_000_000, max: 40_000_000 });
    }

    #[test]
    fn test_average_clamped_to_caps() {
        let rates = layer_bitrates(&cfg(RateControlMode::Cbr, 90_000_000), 40_000_000);
        assert_eq!(rates.average, 40_000_000);
        assert_eq!(rates.max, 40_000_000);
    }

    #[test]
    fn test_unsupported_mode_falls_back() {
        let caps = vk::VideoEncodeCapabilitiesKHR::default()
            .rate_control_modes(vk::VideoEncodeRateControlModeFlagsKHR::VBR);

        assert_eq!(
            select_mode(&cfg(RateControlMode::Cbr, 0), &caps),
            RateControlMode::Default
        );
        assert_eq!(
            select_mode(&cfg(RateControlMode::Vbr, 0), &caps),
            RateControlMode::Vbr
        );
    }

    #[test]
    fn test_quality_level_bounds() {
        let caps = vk::VideoEncodeCapabilitiesKHR::default().max_quality_levels(4);

        let mut c = cfg(RateControlMode::Default, 0);
        assert_eq!(effective_quality_level(&c, &caps), None);
        c.quality_level = 3;
        assert_eq!(effective_quality_level(&c, &caps), Some(3));
        c.quality_level = 5;
        assert_eq!(effective_quality_level(&c, &caps), None);
    }
}
