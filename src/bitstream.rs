// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

//! Bitstream assembly: packed parameter-set/AUD/SEI headers are stitched
//! ahead of the GPU-produced slice payload, in decode order. Actual NAL
//! serialization is the caller's business, behind [`CodecBitWriter`].

use ash::vk::native::{
    StdVideoH264PictureParameterSet, StdVideoH264SequenceParameterSet,
    StdVideoH265PictureParameterSet, StdVideoH265SequenceParameterSet,
    StdVideoH265VideoParameterSet,
};
use bytes::{Bytes, BytesMut};

use crate::dpb::{MmcoOp, RefListModOp};
use crate::{SliceType, VideoCodec};

/// ITU-T T.35 country code for the United States, used by CEA-708.
const T35_COUNTRY_CODE: u8 = 181;
/// ATSC provider code.
const T35_PROVIDER_CODE: u16 = 49;
/// ATSC1 user-data type code for caption data.
const ATSC_USER_DATA_TYPE_CC: u8 = 3;

/// SEI payload type `registered_user_data_itu_t_t35`, common to both
/// codecs.
pub const SEI_REGISTERED_USER_DATA: u32 = 4;

/// The parameter sets a bit-writer serializes, borrowed from the codec
/// std-header structures the session was created with.
pub enum ParameterSets<'a> {
    H264 {
        sps: &'a StdVideoH264SequenceParameterSet,
        pps: &'a StdVideoH264PictureParameterSet,
    },
    H265 {
        vps: &'a StdVideoH265VideoParameterSet,
        sps: &'a StdVideoH265SequenceParameterSet,
        pps: &'a StdVideoH265PictureParameterSet,
    },
}

/// One SEI message, payload already laid out per its payload type.
#[derive(Debug, Clone)]
pub struct SeiMessage {
    pub payload_type: u32,
    pub payload: Bytes,
}

/// Everything a slice header carries that the core decides: the codec
/// bit-writer turns this into bits when an implementation needs
/// CPU-side slice headers.
#[derive(Debug, Clone, Default)]
pub struct SliceHeaderData {
    pub slice_type: Option<SliceType>,
    pub frame_num: u32,
    pub idr_pic_id: u16,
    pub first_mb_in_slice: u32,
    pub cabac_init_idc: u32,
    /// 0 means deblocking stays enabled.
    pub disable_deblocking_filter_idc: u32,
    pub qp_delta: i32,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,
    /// Modification operations for list0/list1, each terminated by the
    /// end opcode when present.
    pub ref_pic_list_modification_l0: Option<Vec<RefListModOp>>,
    pub ref_pic_list_modification_l1: Option<Vec<RefListModOp>>,
    /// Explicit decoded-reference marking, terminated by the end opcode
    /// when present.
    pub ref_pic_marking: Option<Vec<MmcoOp>>,
}

/// NAL emission, implemented by the integrating layer. The encoder
/// fetches SPS/PPS/VPS bytes from the session-parameters object and only
/// falls back to `write_sps`/`write_pps`/`write_vps` when an
/// implementation cannot provide them; `write_slice_header` exists for
/// drivers that require CPU-side slice headers.
pub trait CodecBitWriter {
    fn write_sps(&mut self, params: &ParameterSets) -> Bytes;
    fn write_pps(&mut self, params: &ParameterSets) -> Bytes;
    fn write_vps(&mut self, params: &ParameterSets) -> Bytes;
    /// An access-unit delimiter NAL for `primary_pic_type` (0 = I,
    /// 1 = P, 2 = B).
    fn write_aud(&mut self, primary_pic_type: u8) -> Bytes;
    /// A SEI NAL wrapping `messages`. `nal_type` is codec-specific.
    fn write_sei(&mut self, messages: &[SeiMessage], nal_type: u32) -> Bytes;
    /// A slice header, returning the packed bytes and the number of
    /// trailing bits left open.
    fn write_slice_header(
        &mut self,
        header: &SliceHeaderData,
        nal_type: u32,
        is_reference: bool,
    ) -> (Bytes, u32);
}

pub fn primary_pic_type(slice_type: SliceType) -> u8 {
    match slice_type {
        SliceType::I => 0,
        SliceType::P => 1,
        SliceType::B => 2,
    }
}

/// Lays out a CEA-708 caption blob as a `registered_user_data` SEI
/// payload: T.35 header, ATSC identifier, caption header and trailing
/// marker.
pub fn cea708_sei_message(cc_data: &[u8]) -> SeiMessage {
    let cc_count = (cc_data.len() / 3) as u8;

    let mut payload = BytesMut::with_capacity(cc_data.len() + 11);
    payload.extend_from_slice(&[T35_COUNTRY_CODE]);
    payload.extend_from_slice(&T35_PROVIDER_CODE.to_be_bytes());
    payload.extend_from_slice(b"GA94");
    payload.extend_from_slice(&[ATSC_USER_DATA_TYPE_CC]);
    // process_em_data_flag (0), process_cc_data_flag (1),
    // additional_data_flag (0), then the 5-bit cc_count.
    payload.extend_from_slice(&[(cc_count & 0x1f) | 0x40]);
    // em_data, unused.
    payload.extend_from_slice(&[0xff]);
    payload.extend_from_slice(cc_data);
    // Marker bits.
    payload.extend_from_slice(&[0xff]);

    SeiMessage {
        payload_type: SEI_REGISTERED_USER_DATA,
        payload: payload.freeze(),
    }
}

/// SEI NAL type for the prefix position, per codec.
pub fn sei_nal_type(codec: VideoCodec) -> u32 {
    match codec {
        // H.264 NAL type 6 (SEI).
        VideoCodec::H264 => 6,
        // H.265 NAL type 39 (PREFIX_SEI_NUT).
        VideoCodec::H265 => 39,
    }
}

/// Collects packed headers for the frame being encoded and splices them
/// with the GPU slice payload once the feedback query lands.
pub struct BitstreamAssembler {
    codec: VideoCodec,
    aud: bool,
    cc_insert: bool,
    prefix: BytesMut,
}

impl BitstreamAssembler {
    pub fn new(codec: VideoCodec, aud: bool, cc_insert: bool) -> Self {
        BitstreamAssembler {
            codec,
            aud,
            cc_insert,
            prefix: BytesMut::new(),
        }
    }

    /// Starts a frame, queuing the AUD and, on IDRs, the parameter-set
    /// bytes previously read back from the session.
    pub fn begin_frame(
        &mut self,
        writer: &mut dyn CodecBitWriter,
        slice_type: SliceType,
        is_idr: bool,
        session_headers: &Bytes,
    ) {
        self.prefix.clear();

        if self.aud {
            let aud = writer.write_aud(primary_pic_type(slice_type));
            self.prefix.extend_from_slice(&aud);
        }

        // Repeat the parameter sets for every IDR.
        if is_idr {
            self.prefix.extend_from_slice(session_headers);
        }
    }

    /// Appends a captions SEI if enabled and the frame carries caption
    /// metadata.
    pub fn add_captions(&mut self, writer: &mut dyn CodecBitWriter, cc_data: Option<&[u8]>) {
        if !self.cc_insert {
            return;
        }

        let Some(cc_data) = cc_data else { return };
        if cc_data.is_empty() {
            return;
        }

        let message = cea708_sei_message(cc_data);
        let sei = writer.write_sei(&[message], sei_nal_type(self.codec));
        self.prefix.extend_from_slice(&sei);
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix.len()
    }

    /// Splices the queued headers with the slice bytes the GPU wrote at
    /// `offset` in the staging buffer.
    pub fn assemble(&mut self, staging: &[u8], offset: usize, size: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(self.prefix.len() + size);
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(&staging[offset..offset + size]);
        self.prefix.clear();

        out.freeze()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// Emits recognizable placeholder NALs and records what it was asked
    /// to write.
    #[derive(Default)]
    pub struct StubWriter {
        pub slice_headers: Vec<SliceHeaderData>,
    }

    impl CodecBitWriter for StubWriter {
        fn write_sps(&mut self, _params: &ParameterSets) -> Bytes {
            Bytes::from_static(b"SPS!")
        }

        fn write_pps(&mut self, _params: &ParameterSets) -> Bytes {
            Bytes::from_static(b"PPS!")
        }

        fn write_vps(&mut self, _params: &ParameterSets) -> Bytes {
            Bytes::from_static(b"VPS!")
        }

        fn write_aud(&mut self, primary_pic_type: u8) -> Bytes {
            Bytes::copy_from_slice(&[0, 0, 0, 1, 0x09, primary_pic_type])
        }

        fn write_sei(&mut self, messages: &[SeiMessage], _nal_type: u32) -> Bytes {
            let mut out = BytesMut::from(&b"SEI"[..]);
            for message in messages {
                out.extend_from_slice(&message.payload);
            }
            out.freeze()
        }

        fn write_slice_header(
            &mut self,
            header: &SliceHeaderData,
            _nal_type: u32,
            _is_reference: bool,
        ) -> (Bytes, u32) {
            self.slice_headers.push(header.clone());
            (Bytes::from_static(b"SLICEHDR"), 0)
        }
    }

    #[test]
    fn test_cea708_payload_layout() {
        let message = cea708_sei_message(&[1, 2, 3, 4, 5, 6]);

        assert_eq!(message.payload_type, SEI_REGISTERED_USER_DATA);
        let p = &message.payload;
        assert_eq!(p[0], 181);
        assert_eq!(&p[1..3], &[0, 49]);
        assert_eq!(&p[3..7], b"GA94");
        assert_eq!(p[7], 3);
        // Two caption triplets, process_cc_data_flag set.
        assert_eq!(p[8], 0x42);
        assert_eq!(p[9], 0xff);
        assert_eq!(&p[10..16], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(p[16], 0xff);
    }

    #[test]
    fn test_idr_frames_carry_parameter_sets() {
        let mut writer = StubWriter::default();
        let mut assembler = BitstreamAssembler::new(VideoCodec::H264, false, false);
        let headers = Bytes::from_static(b"SPSPPS");

        assembler.begin_frame(&mut writer, SliceType::I, true, &headers);
        let out = assembler.assemble(b"SLICE", 0, 5);
        assert_eq!(&out[..], b"SPSPPSSLICE");

        // Non-IDR frames get the slice bytes alone.
        assembler.begin_frame(&mut writer, SliceType::P, false, &headers);
        let out = assembler.assemble(b"SLICE", 0, 5);
        assert_eq!(&out[..], b"SLICE");
    }

    #[test]
    fn test_aud_precedes_everything() {
        let mut writer = StubWriter::default();
        let mut assembler = BitstreamAssembler::new(VideoCodec::H264, true, false);
        let headers = Bytes::from_static(b"HDRS");

        assembler.begin_frame(&mut writer, SliceType::B, false, &headers);
        let out = assembler.assemble(b"XXSLICE", 2, 5);
        // primary_pic_type 2 for B.
        assert_eq!(&out[..], &[0, 0, 0, 1, 0x09, 2, b'S', b'L', b'I', b'C', b'E']);
    }

    #[test]
    fn test_captions_appended_before_slice() {
        let mut writer = StubWriter::default();
        let mut assembler = BitstreamAssembler::new(VideoCodec::H265, false, true);
        let headers = Bytes::new();

        assembler.begin_frame(&mut writer, SliceType::P, false, &headers);
        assembler.add_captions(&mut writer, Some(&[9, 9, 9]));
        let prefix_len = assembler.prefix_len();
        let out = assembler.assemble(b"SLICE", 0, 5);

        assert!(out.len() == prefix_len + 5);
        assert!(out.starts_with(b"SEI"));
        assert!(out.ends_with(b"SLICE"));

        // Disabled or absent captions add nothing.
        assembler.begin_frame(&mut writer, SliceType::P, false, &headers);
        assembler.add_captions(&mut writer, None);
        assert_eq!(assembler.prefix_len(), 0);
    }

    #[test]
    fn test_slice_header_data_round_trips_through_writer() {
        use crate::dpb::{MmcoOp, RefListModOp};

        let mut writer = StubWriter::default();
        let header = SliceHeaderData {
            slice_type: Some(SliceType::B),
            frame_num: 4,
            ref_pic_list_modification_l0: Some(vec![
                RefListModOp::ShortTermSubtract {
                    abs_diff_pic_num_minus1: 0,
                },
                RefListModOp::End,
            ]),
            ref_pic_marking: Some(vec![
                MmcoOp::UnmarkShortTerm {
                    difference_of_pic_nums_minus1: 1,
                },
                MmcoOp::End,
            ]),
            ..Default::default()
        };

        let (bytes, trailing_bits) = writer.write_slice_header(&header, 1, true);
        assert!(!bytes.is_empty());
        assert_eq!(trailing_bits, 0);

        let seen = &writer.slice_headers[0];
        assert_eq!(seen.frame_num, 4);
        assert_eq!(
            seen.ref_pic_list_modification_l0.as_ref().unwrap().last(),
            Some(&RefListModOp::End)
        );
        assert_eq!(
            seen.ref_pic_marking.as_ref().unwrap().last(),
            Some(&MmcoOp::End)
        );
    }

    #[test]
    fn test_emitted_length_matches_query_feedback() {
        // Property: emitted bytes = packed headers + feedback size.
        let mut writer = StubWriter::default();
        let mut assembler = BitstreamAssembler::new(VideoCodec::H264, true, false);
        let headers = Bytes::from_static(b"SPSPPS");

        assembler.begin_frame(&mut writer, SliceType::I, true, &headers);
        let prefix_len = assembler.prefix_len();
        let staging = b"\0\0\0\0SLICEBYTES\0\0";
        let out = assembler.assemble(staging, 4, 10);
        assert_eq!(out.len(), prefix_len + 10);
    }
}
