use std::ops::Range;

use crate::ExtractError;
use crate::nal::{CodecType, LENGTH_PREFIX_SIZE, NalFormat, NalScanner, NalSpan};

/// SEI payload type for registered user data, ITU-T T.35.
const SEI_PAYLOAD_TYPE_USER_DATA_REGISTERED_ITU_T_T35: u8 = 0x04;

/// Registered SEI user data ID for LCEVC.
const ITU_T35_LCEVC: [u8; 4] = [0xb4, 0x00, 0x50, 0x00];

/// The surviving portion of an access unit after enhancement data has been
/// spliced out. When the removed NAL unit was at the front of the buffer the
/// data is not moved; `offset` advances instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stripped {
    pub offset: usize,
    pub len: usize,
}

/// Result of an extract-and-remove pass over an access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extracted {
    /// Number of enhancement bytes written to the output, if any were found.
    pub enhancement: Option<usize>,
    /// Where the remaining base stream now lives within the input buffer.
    pub stripped: Stripped,
}

/// Extracts LCEVC enhancement data from a buffer containing NAL units.
///
/// Returns `Ok(Some(len))` with the number of bytes written into `out` when
/// an LCEVC payload was found, `Ok(None)` when the access unit carries no
/// LCEVC data. The input is not modified.
pub fn extract_enhancement(
    data: &[u8],
    format: NalFormat,
    codec: CodecType,
    out: &mut [u8],
) -> Result<Option<usize>, ExtractError> {
    extract_common(data, format, codec, out, None)
}

/// Extracts LCEVC enhancement data and splices every enhancement-bearing NAL
/// unit (including non-LCEVC SEI messages) out of the access unit.
pub fn extract_and_remove_enhancement(
    data: &mut [u8],
    format: NalFormat,
    codec: CodecType,
    out: &mut [u8],
) -> Result<Extracted, ExtractError> {
    let mut removed = Vec::new();
    let enhancement = extract_common(data, format, codec, out, Some(&mut removed))?;
    let stripped = remove_spans(data, &removed);
    Ok(Extracted {
        enhancement,
        stripped,
    })
}

/// As [`extract_enhancement`], gated on the access unit containing a base
/// codec random access point (IDR/CRA/GDR per codec). Without one, no
/// extraction is attempted and `Ok(None)` is returned.
pub fn extract_enhancement_if_keyframe(
    data: &[u8],
    format: NalFormat,
    codec: CodecType,
    out: &mut [u8],
) -> Result<Option<usize>, ExtractError> {
    if !has_base_keyframe(data, format, codec)? {
        return Ok(None);
    }
    extract_enhancement(data, format, codec, out)
}

/// As [`extract_and_remove_enhancement`], gated on a base keyframe.
pub fn extract_and_remove_enhancement_if_keyframe(
    data: &mut [u8],
    format: NalFormat,
    codec: CodecType,
    out: &mut [u8],
) -> Result<Extracted, ExtractError> {
    if !has_base_keyframe(data, format, codec)? {
        let len = data.len();
        return Ok(Extracted {
            enhancement: None,
            stripped: Stripped { offset: 0, len },
        });
    }
    extract_and_remove_enhancement(data, format, codec, out)
}

/// Copies `src` to `dst` while collapsing start-code emulation prevention
/// sequences (`00 00 03` becomes `00 00`). `zeros` seeds the leading-zero
/// count with zeros that precede `src`. Returns the number of bytes written.
fn unescape_into(mut zeros: u32, dst: &mut [u8], src: &[u8]) -> usize {
    let mut written = 0;
    for &byte in src {
        if byte == 0 {
            if zeros < 2 {
                zeros += 1;
            }
        } else if zeros == 2 && byte == 3 {
            // Emulation prevention byte, drop it.
            zeros = 0;
            continue;
        } else {
            zeros = 0;
        }
        dst[written] = byte;
        written += 1;
    }
    written
}

/// Common work for the extract entry points. When `removed` is given, every
/// processed NAL unit span is recorded for later removal.
fn extract_common(
    data: &[u8],
    format: NalFormat,
    codec: CodecType,
    out: &mut [u8],
    mut removed: Option<&mut Vec<Range<usize>>>,
) -> Result<Option<usize>, ExtractError> {
    let mut scanner = NalScanner::new(data, format, codec, codec.enhancement_nal_types());
    let mut out_offset = 0usize;

    while let Some(span) = scanner.next_unit()? {
        if span.nal_type == codec.sei_nal_type() {
            match parse_lcevc_sei(data, &span)? {
                Some(sei) => {
                    // The payload remainder is copied through the unescape; only
                    // the declared (unescaped) SEI size counts as output.
                    let wire = &data[sei.wire_start..span.end];
                    if out_offset + wire.len() > out.len() {
                        return Err(ExtractError::OutputOverflow {
                            needed: out_offset + wire.len(),
                            capacity: out.len(),
                        });
                    }
                    if sei.size > wire.len() {
                        return Err(ExtractError::InvalidSeiPayload);
                    }
                    // The byte before the payload (the last ITU code byte) is
                    // zero, so the emulation scan starts with one zero seen.
                    unescape_into(1, &mut out[out_offset..], wire);
                    out_offset += sei.size;
                }
                None => {
                    // Not LCEVC. Strip the SEI anyway when removing, so the
                    // base decoder never sees stale metadata.
                    if let Some(spans) = removed.as_mut() {
                        spans.push(span.start..span.end);
                    }
                    continue;
                }
            }
        } else {
            // A dedicated LCEVC NAL unit type: pass the whole unit through,
            // rewriting a length prefix into an Annex B start code.
            let size = span.end - span.start;
            if out_offset + size > out.len() {
                return Err(ExtractError::OutputOverflow {
                    needed: out_offset + size,
                    capacity: out.len(),
                });
            }
            out[out_offset..out_offset + size].copy_from_slice(&data[span.start..span.end]);
            if format == NalFormat::LengthPrefix {
                out[out_offset..out_offset + LENGTH_PREFIX_SIZE].copy_from_slice(&[0, 0, 0, 1]);
            }
            out_offset += size;
        }

        if let Some(spans) = removed.as_mut() {
            spans.push(span.start..span.end);
        }
        // Stop at the first LCEVC payload found.
        return Ok(Some(out_offset));
    }

    Ok(None)
}

struct LcevcSei {
    /// Absolute offset of the first enhancement byte (past the ITU code).
    wire_start: usize,
    /// Declared SEI payload size, minus the ITU code.
    size: usize,
}

/// Parses the SEI header of `span` and decides whether it carries LCEVC
/// registered user data. Returns `None` for any other SEI message.
fn parse_lcevc_sei(data: &[u8], span: &NalSpan) -> Result<Option<LcevcSei>, ExtractError> {
    let payload = &data[span.payload.min(span.end)..span.end];

    if payload.first() != Some(&SEI_PAYLOAD_TYPE_USER_DATA_REGISTERED_ITU_T_T35) {
        return Ok(None);
    }

    // SEI payload size, with 0xFF continuation bytes.
    let mut offset = 1usize;
    let mut sei_size = 0usize;
    while payload.get(offset) == Some(&0xff) {
        sei_size += 0xff;
        offset += 1;
    }
    sei_size += *payload.get(offset).ok_or(ExtractError::InvalidSeiPayload)? as usize;
    offset += 1;

    if payload.get(offset..offset + ITU_T35_LCEVC.len()) != Some(&ITU_T35_LCEVC[..]) {
        return Ok(None);
    }
    if sei_size < ITU_T35_LCEVC.len() {
        return Err(ExtractError::InvalidSeiPayload);
    }
    offset += ITU_T35_LCEVC.len();
    sei_size -= ITU_T35_LCEVC.len();

    Ok(Some(LcevcSei {
        wire_start: span.payload + offset,
        size: sei_size,
    }))
}

/// Edits the recorded spans out of the access unit. A span at the current
/// front of the buffer advances the virtual start instead of moving memory;
/// interior spans shuffle the tail down.
fn remove_spans(data: &mut [u8], spans: &[Range<usize>]) -> Stripped {
    let mut start = 0usize;
    let mut end = data.len();
    let mut shift = 0usize;

    for span in spans {
        let from = span.start - shift;
        let to = span.end - shift;
        debug_assert!(from >= start && to <= end);
        if from == start {
            start = to;
        } else {
            data.copy_within(to..end, from);
            end -= to - from;
            shift += to - from;
        }
    }

    Stripped {
        offset: start,
        len: end - start,
    }
}

fn has_base_keyframe(
    data: &[u8],
    format: NalFormat,
    codec: CodecType,
) -> Result<bool, ExtractError> {
    let mut scanner = NalScanner::new(data, format, codec, codec.keyframe_nal_types());
    Ok(scanner.next_unit()?.is_some())
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    fn extract(data: &[u8], format: NalFormat, codec: CodecType) -> Option<Vec<u8>> {
        let mut out = vec![0u8; 100];
        let len = extract_enhancement(data, format, codec, &mut out).expect("extract failed")?;
        out.truncate(len);
        Some(out)
    }

    #[test]
    fn empty_input() {
        assert_eq!(extract(&[], NalFormat::AnnexB, CodecType::H264), None);
        assert_eq!(
            extract(&[0, 0, 0, 0], NalFormat::AnnexB, CodecType::H264),
            None
        );
    }

    #[test]
    fn non_lcevc_nal() {
        let nalu = [
            0x00, 0x00, 0x00, 0x01, 0x01, b'p', b'a', b'y', b'l', b'o', b'a', b'd', 0x00, 0x00,
            0x01,
        ];
        assert_eq!(extract(&nalu, NalFormat::AnnexB, CodecType::H264), None);
    }

    #[test]
    fn h264_sei_annex_b() {
        let nalu = [
            0x00, 0x00, 0x01, 0x06, 0x04, 0x0b, 0xb4, 0x00, 0x50, 0x00, b'p', b'a', b'y', b'l',
            b'o', b'a', b'd', 0x00, 0x00, 0x01,
        ];
        assert_eq!(
            extract(&nalu, NalFormat::AnnexB, CodecType::H264).as_deref(),
            Some(&b"payload"[..])
        );
    }

    #[test]
    fn h264_sei_annex_b_four_byte_start_code() {
        let nalu = [
            0x00, 0x00, 0x00, 0x01, 0x06, 0x04, 0x0b, 0xb4, 0x00, 0x50, 0x00, b'p', b'a', b'y',
            b'l', b'o', b'a', b'd', 0x00, 0x00, 0x00, 0x01,
        ];
        assert_eq!(
            extract(&nalu, NalFormat::AnnexB, CodecType::H264).as_deref(),
            Some(&b"payload"[..])
        );
    }

    #[test]
    fn h264_sei_leading_garbage() {
        let nalu = [
            0xaa, 0x55, 0x00, 0x00, 0x01, 0x06, 0x04, 0x0b, 0xb4, 0x00, 0x50, 0x00, b'p', b'a',
            b'y', b'l', b'o', b'a', b'd', 0x00, 0x00, 0x01,
        ];
        assert_eq!(
            extract(&nalu, NalFormat::AnnexB, CodecType::H264).as_deref(),
            Some(&b"payload"[..])
        );
    }

    #[test]
    fn h264_sei_no_trailing_start_code() {
        let nalu = [
            0x00, 0x00, 0x00, 0x01, 0x06, 0x04, 0x0b, 0xb4, 0x00, 0x50, 0x00, b'p', b'a', b'y',
            b'l', b'o', b'a', b'd',
        ];
        assert_eq!(
            extract(&nalu, NalFormat::AnnexB, CodecType::H264).as_deref(),
            Some(&b"payload"[..])
        );
    }

    #[test]
    fn h264_sei_emulation_prevention() {
        let nalu = [
            0x00, 0x00, 0x01, 0x06, 0x04, 0x0e, 0xb4, 0x00, 0x50, 0x00, b'p', b'a', b'y', 0x00,
            0x00, 0x03, 0x01, b'l', b'o', b'a', b'd', 0x00, 0x00, 0x01,
        ];
        assert_eq!(
            extract(&nalu, NalFormat::AnnexB, CodecType::H264).as_deref(),
            Some(&b"pay\x00\x00\x01load"[..])
        );
    }

    #[test]
    fn h264_sei_length_prefix() {
        let nalu = [
            0x00, 0x00, 0x00, 0x0e, 0x06, 0x04, 0x0b, 0xb4, 0x00, 0x50, 0x00, b'p', b'a', b'y',
            b'l', b'o', b'a', b'd',
        ];
        assert_eq!(
            extract(&nalu, NalFormat::LengthPrefix, CodecType::H264).as_deref(),
            Some(&b"payload"[..])
        );
    }

    #[test]
    fn h264_lcevc_nal_annex_b() {
        let nalu = [
            0x00, 0x00, 0x01, 0x79, b'p', b'a', b'y', b'l', b'o', b'a', b'd', 0x00, 0x00, 0x01,
        ];
        assert_eq!(
            extract(&nalu, NalFormat::AnnexB, CodecType::H264).as_deref(),
            Some(&b"\x00\x00\x01\x79payload"[..])
        );
    }

    #[test]
    fn h264_lcevc_nal_length_prefix_converted_to_annex_b() {
        let nalu = [
            0x00, 0x00, 0x00, 0x08, 0x79, b'p', b'a', b'y', b'l', b'o', b'a', b'd',
        ];
        assert_eq!(
            extract(&nalu, NalFormat::LengthPrefix, CodecType::H264).as_deref(),
            Some(&b"\x00\x00\x00\x01\x79payload"[..])
        );
    }

    #[test]
    fn h265_lcevc_nal_length_prefix() {
        let nalu = [
            0x00, 0x00, 0x00, 0x08, 0x79, b'p', b'a', b'y', b'l', b'o', b'a', b'd',
        ];
        assert_eq!(
            extract(&nalu, NalFormat::LengthPrefix, CodecType::H265).as_deref(),
            Some(&b"\x00\x00\x00\x01\x79payload"[..])
        );
    }

    #[test]
    fn h264_lcevc_nal_length_prefix_trailing_empty_nal() {
        let nalu = [
            0x00, 0x00, 0x00, 0x08, 0x79, b'p', b'a', b'y', b'l', b'o', b'a', b'd', 0x00, 0x00,
            0x00, 0x00,
        ];
        assert_eq!(
            extract(&nalu, NalFormat::LengthPrefix, CodecType::H264).as_deref(),
            Some(&b"\x00\x00\x00\x01\x79payload"[..])
        );
    }

    #[test]
    fn length_prefix_overruns_buffer() {
        let nalu = [0x00, 0x00, 0x01, 0x00, 0x79, b'p'];
        let mut out = [0u8; 16];
        assert!(matches!(
            extract_enhancement(&nalu, NalFormat::LengthPrefix, CodecType::H264, &mut out),
            Err(ExtractError::TruncatedNalUnit)
        ));
    }

    #[test]
    fn output_capacity_overflow() {
        let nalu = [
            0x00, 0x00, 0x01, 0x06, 0x04, 0x0b, 0xb4, 0x00, 0x50, 0x00, b'p', b'a', b'y', b'l',
            b'o', b'a', b'd', 0x00, 0x00, 0x01,
        ];
        let mut out = [0u8; 3];
        assert!(matches!(
            extract_enhancement(&nalu, NalFormat::AnnexB, CodecType::H264, &mut out),
            Err(ExtractError::OutputOverflow { .. })
        ));
    }

    #[test]
    fn remove_sei_at_front_advances_offset() {
        let mut nalu = [
            0x00, 0x00, 0x00, 0x01, 0x06, 0x04, 0x0b, 0xb4, 0x00, 0x50, 0x00, b'p', b'a', b'y',
            b'l', b'o', b'a', b'd', 0xab, 0x00, 0x00, 0x00, 0x01,
        ];
        let mut out = [0u8; 100];
        let result =
            extract_and_remove_enhancement(&mut nalu, NalFormat::AnnexB, CodecType::H264, &mut out)
                .expect("extract failed");
        assert_eq!(result.enhancement, Some(7));
        assert_eq!(&out[..7], b"payload");
        // The SEI NAL unit runs up to the next start code (the 0xab trailing
        // byte belongs to it); the rest of the stream is reachable without a
        // copy.
        assert_eq!(result.stripped, Stripped { offset: 19, len: 4 });
        assert_eq!(&nalu[19..23], &[0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn remove_interior_sei_moves_tail_down() {
        // A non-SEI NAL first, then the LCEVC SEI, then a trailing NAL.
        let mut nalu = vec![
            0x00, 0x00, 0x01, 0x01, 0xde, 0xad, // base slice NAL
            0x00, 0x00, 0x01, 0x06, 0x04, 0x0b, 0xb4, 0x00, 0x50, 0x00, b'p', b'a', b'y', b'l',
            b'o', b'a', b'd', // LCEVC SEI
            0x00, 0x00, 0x01, 0x01, 0xbe, 0xef, // another base NAL
        ];
        let mut out = [0u8; 100];
        let result =
            extract_and_remove_enhancement(&mut nalu, NalFormat::AnnexB, CodecType::H264, &mut out)
                .expect("extract failed");
        assert_eq!(result.enhancement, Some(7));
        assert_eq!(result.stripped, Stripped { offset: 0, len: 12 });
        assert_eq!(
            &nalu[..12],
            &[0x00, 0x00, 0x01, 0x01, 0xde, 0xad, 0x00, 0x00, 0x01, 0x01, 0xbe, 0xef]
        );
    }

    #[test]
    fn remove_strips_non_lcevc_sei() {
        // A non-LCEVC SEI (payload type 0x05) followed by an LCEVC SEI.
        let mut nalu = vec![
            0x00, 0x00, 0x01, 0x06, 0x05, 0x02, 0xaa, 0xbb, // unregistered SEI
            0x00, 0x00, 0x01, 0x06, 0x04, 0x0b, 0xb4, 0x00, 0x50, 0x00, b'p', b'a', b'y', b'l',
            b'o', b'a', b'd',
        ];
        let mut out = [0u8; 100];
        let result =
            extract_and_remove_enhancement(&mut nalu, NalFormat::AnnexB, CodecType::H264, &mut out)
                .expect("extract failed");
        assert_eq!(result.enhancement, Some(7));
        // Both SEI messages are gone; nothing remains.
        assert_eq!(result.stripped.len, 0);
    }

    #[test]
    fn keyframe_gate() {
        let sei = [
            0x00, 0x00, 0x01, 0x06, 0x04, 0x0b, 0xb4, 0x00, 0x50, 0x00, b'p', b'a', b'y', b'l',
            b'o', b'a', b'd', 0x00, 0x00, 0x01,
        ];
        let mut out = [0u8; 100];
        // No IDR in the access unit: nothing is extracted.
        assert_eq!(
            extract_enhancement_if_keyframe(&sei, NalFormat::AnnexB, CodecType::H264, &mut out)
                .expect("extract failed"),
            None
        );

        // Prepend an H.264 IDR slice NAL (type 5).
        let mut with_idr = vec![0x00, 0x00, 0x01, 0x65, 0x11, 0x22];
        with_idr.extend_from_slice(&sei);
        assert_eq!(
            extract_enhancement_if_keyframe(
                &with_idr,
                NalFormat::AnnexB,
                CodecType::H264,
                &mut out
            )
            .expect("extract failed"),
            Some(7)
        );
        assert_eq!(&out[..7], b"payload");
    }

    #[test]
    fn unescape_state_machine() {
        let mut out = [0u8; 16];
        let n = unescape_into(0, &mut out, &[0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x01]);
        assert_eq!(&out[..n], &[0x00, 0x00, 0x00, 0x00, 0x01]);

        // A seeded zero participates in the first sequence.
        let n = unescape_into(2, &mut out, &[0x03, 0x42]);
        assert_eq!(&out[..n], &[0x42]);

        // `03` not preceded by two zeros is data.
        let n = unescape_into(0, &mut out, &[0x00, 0x03, 0x00]);
        assert_eq!(&out[..n], &[0x00, 0x03, 0x00]);
    }
}
