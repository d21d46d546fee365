//! Entropy decoding for LCEVC enhancement chunks.
//!
//! A coefficient chunk is either raw RLE bytes or three interleaved
//! canonical-Huffman streams: the low byte (LSB), the high byte (MSB, only
//! when the LSB flags it) and the run length of implicit zeros. The temporal
//! chunk uses two context-switched Huffman streams, and length chunks a
//! two-stream LSB/MSB split. See [`EntropyDecoder`] for the decode surface.
#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(unsafe_code)]

mod bitstream;
mod decoder;
mod huffman;


pub use self::bitstream::BitStream;
pub use self::decoder::{EntropyDecoder, EntropyDecoderType};
pub use self::huffman::{
    BITSTREAM_VERSION_ALIGN_WITH_SPEC, BITSTREAM_VERSION_CURRENT,
    BITSTREAM_VERSION_NEW_CODE_LENGTHS,
};

/// One enhancement chunk as carried by the surface descriptor: its bytes and
/// the two syntax flags that select the decode path.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub data: &'a [u8],
    /// When unset the chunk decodes as "no data".
    pub entropy_enabled: bool,
    /// Raw RLE bytes with no Huffman layer on top.
    pub rle_only: bool,
}

/// Whether a transform unit keeps the previous frame's reconstruction
/// (inter) or is rebuilt from scratch (intra).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalSignal {
    Inter = 0,
    Intra = 1,
}

#[derive(Debug, thiserror::Error)]
pub enum EntropyError {
    #[error("chunk ended inside a Huffman table header")]
    UnexpectedEnd,
    #[error("invalid Huffman table: {0}")]
    InvalidTable(&'static str),
    #[error("bits match no assigned Huffman code")]
    InvalidCode,
    #[error("decode call does not match the decoder type")]
    WrongDecoderType,
}
