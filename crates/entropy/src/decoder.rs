use crate::bitstream::BitStream;
use crate::huffman::{
    HuffError, HuffmanSingleDecoder, HuffmanTripleState, huffman_triple_decode,
    next_symbol_is_msb, next_symbol_is_rl,
};
use crate::{Chunk, EntropyError, TemporalSignal};

/// What a chunk's entropy decoder produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyDecoderType {
    /// Coefficient chunks: LSB/MSB/RL Huffman streams.
    Default,
    /// The one-bit-per-TU temporal stream.
    Temporal,
    /// Length streams (unsigned).
    SizeUnsigned,
    /// Length streams (signed).
    SizeSigned,
}

/// Temporal run-length transition table: a terminated run flips the context,
/// a continued run keeps it.
const NEXT_TEMPORAL_CONTEXT: [[u8; 2]; 2] = [
    [TemporalSignal::Intra as u8, TemporalSignal::Inter as u8],
    [TemporalSignal::Inter as u8, TemporalSignal::Intra as u8],
];

enum Streams<'a> {
    /// Not entropy coded, or an empty chunk.
    None,
    /// Raw RLE bytes, no Huffman layer.
    RleOnly { data: &'a [u8] },
    /// The default coefficient decoder.
    Triple(Box<HuffmanTripleState>),
    /// Two-stream decoders (temporal contexts, or size LSB/MSB).
    Pair(Box<[HuffmanSingleDecoder; 2]>),
}

/// Decodes one enhancement chunk. Reading past the end of the chunk is not
/// an error: decodes return `Ok(None)` once the data is exhausted.
pub struct EntropyDecoder<'a> {
    stream: BitStream<'a>,
    streams: Streams<'a>,
    decoder_type: EntropyDecoderType,
    /// Symbols consumed so far; the temporal decoders treat the first one
    /// specially.
    raw_offset: usize,
    /// Current temporal Huffman context.
    current_context: u8,
}

impl<'a> EntropyDecoder<'a> {
    pub fn new(
        chunk: &Chunk<'a>,
        decoder_type: EntropyDecoderType,
        bitstream_version: u8,
    ) -> Result<Self, EntropyError> {
        let mut decoder = EntropyDecoder {
            stream: BitStream::new(chunk.data),
            streams: Streams::None,
            decoder_type,
            raw_offset: 0,
            current_context: 0,
        };

        if !chunk.entropy_enabled || chunk.data.is_empty() {
            return Ok(decoder);
        }

        if chunk.rle_only {
            decoder.streams = Streams::RleOnly { data: chunk.data };
            return Ok(decoder);
        }

        // The Huffman tables sit at the front of the chunk; the coded data
        // follows in the same stream.
        decoder.streams = match decoder_type {
            EntropyDecoderType::Default => Streams::Triple(Box::new(
                HuffmanTripleState::initialise(&mut decoder.stream, bitstream_version)?,
            )),
            _ => Streams::Pair(Box::new([
                HuffmanSingleDecoder::initialise(&mut decoder.stream, bitstream_version)?,
                HuffmanSingleDecoder::initialise(&mut decoder.stream, bitstream_version)?,
            ])),
        };

        Ok(decoder)
    }

    /// Decodes the next coefficient: its value and the count of implicit
    /// zeros that follow it. `Ok(None)` once the chunk is exhausted.
    pub fn decode(&mut self) -> Result<Option<(i16, u32)>, EntropyError> {
        debug_assert_eq!(self.decoder_type, EntropyDecoderType::Default);

        if matches!(self.streams, Streams::RleOnly { .. }) {
            return self.decode_coefficient_rle();
        }

        match &self.streams {
            Streams::None | Streams::RleOnly { .. } => Ok(None),
            Streams::Triple(state) => match huffman_triple_decode(state, &mut self.stream) {
                Ok((value, zeros)) => Ok(Some((value, zeros))),
                Err(HuffError::NoData) => Ok(None),
                Err(HuffError::InvalidCode) => Err(EntropyError::InvalidCode),
            },
            Streams::Pair(_) => Err(EntropyError::WrongDecoderType),
        }
    }

    /// Decodes the next temporal run: the signal and how many transform
    /// units it covers.
    pub fn decode_temporal(&mut self) -> Result<Option<(TemporalSignal, u32)>, EntropyError> {
        debug_assert_eq!(self.decoder_type, EntropyDecoderType::Temporal);

        if matches!(self.streams, Streams::None) {
            return Ok(None);
        }

        let mut signal = self.current_context;

        // The first symbol is sent raw so the decoder knows the starting
        // context.
        if self.raw_offset == 0 {
            let Some(symbol) = self.next_temporal_symbol()? else {
                return Ok(None);
            };
            signal = symbol & 0x01;
        }

        let mut count: u32 = 0;
        loop {
            let Some(symbol) = self.next_temporal_symbol()? else {
                return Ok(None);
            };
            count = (count << 7) | u32::from(symbol & 0x7f);
            if symbol & 0x80 == 0 {
                break;
            }
        }

        let signal = if signal == TemporalSignal::Intra as u8 {
            TemporalSignal::Intra
        } else {
            TemporalSignal::Inter
        };
        Ok(Some((signal, count)))
    }

    /// Decodes the next size value. LSB bit 0 flags a following MSB; the
    /// signed variant broadcasts the top bit into the sign.
    pub fn decode_size(&mut self) -> Result<Option<i16>, EntropyError> {
        debug_assert!(matches!(
            self.decoder_type,
            EntropyDecoderType::SizeUnsigned | EntropyDecoderType::SizeSigned
        ));

        let Streams::Pair(decoders) = &self.streams else {
            return Ok(None);
        };

        let lsb = match decoders[0].decode(&mut self.stream) {
            Ok(symbol) => symbol,
            Err(HuffError::NoData) => return Ok(None),
            Err(HuffError::InvalidCode) => return Err(EntropyError::InvalidCode),
        };

        let size = if lsb & 0x01 != 0 {
            let msb = match decoders[1].decode(&mut self.stream) {
                Ok(symbol) => symbol,
                Err(HuffError::NoData) => return Ok(None),
                Err(HuffError::InvalidCode) => return Err(EntropyError::InvalidCode),
            };

            let value = (u16::from(msb) << 7) | u16::from(lsb >> 1);
            if self.decoder_type == EntropyDecoderType::SizeSigned {
                (((value & 0x4000) << 1) | value) as i16
            } else {
                value as i16
            }
        } else if self.decoder_type == EntropyDecoderType::SizeSigned {
            // Broadcast bit 6 into bit 7, reinterpret as a signed byte, then
            // widen.
            let value = lsb >> 1;
            (((value & 0x40) << 1) | value) as i8 as i16
        } else {
            i16::from(lsb >> 1)
        };

        Ok(Some(size))
    }

    /// Bytes of the chunk consumed so far, counting a partial trailing byte.
    pub fn consumed_bytes(&self) -> usize {
        match &self.streams {
            Streams::RleOnly { .. } => self.raw_offset,
            _ => self.stream.consumed_bytes(),
        }
    }

    fn decode_coefficient_rle(&mut self) -> Result<Option<(i16, u32)>, EntropyError> {
        let Some(symbol) = self.next_rle_symbol() else {
            return Ok(None);
        };

        let mut value: i16;
        let mut last = symbol;
        if next_symbol_is_msb(symbol) {
            let Some(msb) = self.next_rle_symbol() else {
                return Ok(None);
            };
            last = msb;
            let exp = (i32::from(msb & 0x7f) << 8) | i32::from(symbol & 0xfe);
            value = (exp - 0x4000) as i16;
        } else {
            value = i16::from(symbol & 0x7e) - 0x40;
        }
        value >>= 1;

        let mut zeros: u32 = 0;
        while next_symbol_is_rl(last) {
            let Some(symbol) = self.next_rle_symbol() else {
                return Ok(None);
            };
            last = symbol;
            zeros = (zeros << 7) | u32::from(symbol & 0x7f);
        }

        Ok(Some((value, zeros)))
    }

    fn next_rle_symbol(&mut self) -> Option<u8> {
        let Streams::RleOnly { data } = &self.streams else {
            return None;
        };
        let symbol = *data.get(self.raw_offset)?;
        self.raw_offset += 1;
        Some(symbol)
    }

    fn toggle_temporal_context(&mut self, symbol: u8) {
        if self.raw_offset == 1 {
            // The first symbol carries the initial context in bit 0.
            self.current_context = symbol & 0x01;
        } else {
            self.current_context = NEXT_TEMPORAL_CONTEXT[self.current_context as usize]
                [((symbol & 0x80) >> 7) as usize];
        }
    }

    fn next_temporal_symbol(&mut self) -> Result<Option<u8>, EntropyError> {
        let symbol = match &self.streams {
            Streams::RleOnly { data } => match data.get(self.raw_offset) {
                Some(&symbol) => symbol,
                None => return Ok(None),
            },
            Streams::Pair(decoders) => {
                if self.raw_offset == 0 {
                    match self.stream.read(8) {
                        Some(bits) => bits as u8,
                        None => return Ok(None),
                    }
                } else {
                    match decoders[self.current_context as usize].decode(&mut self.stream) {
                        Ok(symbol) => symbol,
                        Err(HuffError::NoData) => return Ok(None),
                        Err(HuffError::InvalidCode) => return Err(EntropyError::InvalidCode),
                    }
                }
            }
            _ => return Ok(None),
        };

        self.raw_offset += 1;
        self.toggle_temporal_context(symbol);
        Ok(Some(symbol))
    }
}
