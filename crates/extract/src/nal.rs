use byteorder::{BigEndian, ByteOrder};

use crate::ExtractError;

/// How NAL units are delimited in the access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalFormat {
    /// `00 00 01` / `00 00 00 01` start codes, as in ITU-T H.264 Annex B.
    AnnexB,
    /// Big-endian 32-bit length before each NAL unit, as in ISO/IEC 14496-15.
    LengthPrefix,
}

/// The base codec whose elementary stream carries the enhancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    H264,
    H265,
    H266,
}

/// Number of bytes of the length prefix, `lengthSizeMinusOne` (+1) from the
/// track sample entry DecoderConfigurationRecord.
pub(crate) const LENGTH_PREFIX_SIZE: usize = 4;

const H264_NAL_SEI: u8 = 6;
const H265_NAL_PREFIX_SEI: u8 = 39;
const H266_NAL_PREFIX_SEI: u8 = 23;

/* LCEVC NAL unit types as read by an H.264 parser on bits 0..4 */
const H264_NAL_LCEVC_NON_IDR: u8 = 25;
const H264_NAL_LCEVC_IDR: u8 = 27;

/* LCEVC NAL unit types as read by an H.265 parser on bits 1..6 */
const H265_NAL_LCEVC_NON_IDR: u8 = 60;
const H265_NAL_LCEVC_IDR: u8 = 61;

/* LCEVC NAL unit type as read by an H.266 parser on bits 3..7 of the 2nd byte */
const H266_NAL_LCEVC: u8 = 31;

/* Base IDR NAL types for keyframe detection */
const H264_NAL_IDR: u8 = 5;
const H265_NAL_IDR_W_RADL: u8 = 19;
const H265_NAL_IDR_N_LP: u8 = 20;
const H265_NAL_CRA: u8 = 21;
const H266_NAL_IDR_W_RADL: u8 = 7;
const H266_NAL_IDR_N_LP: u8 = 8;
const H266_NAL_CRA: u8 = 9;
const H266_NAL_GDR: u8 = 10;

impl CodecType {
    /// NAL unit types that can carry LCEVC enhancement data for this codec.
    pub(crate) fn enhancement_nal_types(self) -> &'static [u8] {
        match self {
            CodecType::H264 => &[H264_NAL_SEI, H264_NAL_LCEVC_NON_IDR, H264_NAL_LCEVC_IDR],
            CodecType::H265 => &[H265_NAL_PREFIX_SEI, H265_NAL_LCEVC_NON_IDR, H265_NAL_LCEVC_IDR],
            CodecType::H266 => &[H266_NAL_PREFIX_SEI, H266_NAL_LCEVC],
        }
    }

    /// The NAL unit type used for LCEVC registered user data SEI messages.
    pub(crate) fn sei_nal_type(self) -> u8 {
        match self {
            CodecType::H264 => H264_NAL_SEI,
            CodecType::H265 => H265_NAL_PREFIX_SEI,
            CodecType::H266 => H266_NAL_PREFIX_SEI,
        }
    }

    /// Base codec NAL unit types that mark a random access point.
    pub(crate) fn keyframe_nal_types(self) -> &'static [u8] {
        match self {
            CodecType::H264 => &[H264_NAL_IDR],
            CodecType::H265 => &[H265_NAL_IDR_W_RADL, H265_NAL_IDR_N_LP, H265_NAL_CRA],
            CodecType::H266 => &[
                H266_NAL_IDR_W_RADL,
                H266_NAL_IDR_N_LP,
                H266_NAL_CRA,
                H266_NAL_GDR,
            ],
        }
    }

    /// Reads the NAL unit type from the header bytes starting at `header`, or
    /// 0 when the header lies outside the buffer.
    pub(crate) fn nal_unit_type(self, data: &[u8], header: usize) -> u8 {
        match self {
            CodecType::H264 => {
                if header < data.len() {
                    data[header] & 0x1f
                } else {
                    0
                }
            }
            CodecType::H265 => {
                if header < data.len() {
                    (data[header] >> 1) & 0x3f
                } else {
                    0
                }
            }
            CodecType::H266 => {
                if header + 1 < data.len() {
                    data[header + 1] >> 3
                } else {
                    0
                }
            }
        }
    }

    /// Size of the NAL unit header preceding the payload.
    pub(crate) fn nal_header_size(self, nal_type: u8) -> usize {
        match self {
            CodecType::H265 | CodecType::H266 => 2,
            CodecType::H264 => {
                if nal_type == H264_NAL_LCEVC_NON_IDR || nal_type == H264_NAL_LCEVC_IDR {
                    2
                } else {
                    1
                }
            }
        }
    }
}

/// A NAL unit of interest located within the access unit. All offsets are
/// absolute indices into the scanned buffer; `start..end` spans the delimiter
/// (start code or length prefix) as well as the unit itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NalSpan {
    pub start: usize,
    pub end: usize,
    /// Offset of the first payload byte, past the NAL unit header.
    pub payload: usize,
    pub nal_type: u8,
}

/// Walks the access unit, yielding NAL units whose type is in `nal_types`.
pub(crate) struct NalScanner<'a> {
    data: &'a [u8],
    offset: usize,
    codec: CodecType,
    format: NalFormat,
    nal_types: &'static [u8],
}

impl<'a> NalScanner<'a> {
    pub fn new(
        data: &'a [u8],
        format: NalFormat,
        codec: CodecType,
        nal_types: &'static [u8],
    ) -> Self {
        Self {
            data,
            offset: 0,
            codec,
            format,
            nal_types,
        }
    }

    pub fn next_unit(&mut self) -> Result<Option<NalSpan>, ExtractError> {
        match self.format {
            NalFormat::AnnexB => Ok(self.next_annex_b()),
            NalFormat::LengthPrefix => self.next_length_prefix(),
        }
    }

    /// Scans for the next interesting NAL unit between Annex B start codes.
    fn next_annex_b(&mut self) -> Option<NalSpan> {
        loop {
            let mut zeros = 0usize;
            let mut start = None;
            let mut header = 0usize;

            while self.offset < self.data.len() {
                let byte = self.data[self.offset];
                if byte == 0 {
                    if zeros < 3 {
                        zeros += 1;
                    }
                } else if zeros >= 2 && byte == 1 {
                    if start.is_some() {
                        // Start of the following NAL unit delimits this one.
                        self.offset -= zeros;
                        break;
                    }
                    start = Some(self.offset - zeros);
                    header = self.offset + 1;
                    zeros = 0;
                } else {
                    zeros = 0;
                }
                self.offset += 1;
            }

            let start = start?;
            let end = self.offset;
            let nal_type = self.codec.nal_unit_type(self.data, header);
            if self.nal_types.contains(&nal_type) {
                return Some(NalSpan {
                    start,
                    end,
                    payload: header + self.codec.nal_header_size(nal_type),
                    nal_type,
                });
            }
        }
    }

    /// Scans for the next interesting NAL unit, each prefixed with its
    /// big-endian 32-bit length.
    fn next_length_prefix(&mut self) -> Result<Option<NalSpan>, ExtractError> {
        while self.offset < self.data.len() {
            if self.offset + LENGTH_PREFIX_SIZE > self.data.len() {
                return Err(ExtractError::TruncatedNalUnit);
            }
            let len = BigEndian::read_u32(&self.data[self.offset..]) as usize;
            let start = self.offset;
            let end = start + LENGTH_PREFIX_SIZE + len;
            if end > self.data.len() {
                return Err(ExtractError::TruncatedNalUnit);
            }

            let header = start + LENGTH_PREFIX_SIZE;
            let nal_type = self.codec.nal_unit_type(self.data, header);
            self.offset = end;

            if self.nal_types.contains(&nal_type) {
                return Ok(Some(NalSpan {
                    start,
                    end,
                    payload: header + self.codec.nal_header_size(nal_type),
                    nal_type,
                }));
            }
        }

        Ok(None)
    }
}
