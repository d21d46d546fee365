//! Canonical Huffman tables for the three-stream coefficient format.
//!
//! Each sub-stream (LSB, MSB, run-length) declares its code lengths in the
//! chunk header; canonical codes are reassigned on load. Short codes decode
//! through a small direct look-up table, longer ones through a sorted list
//! with a binary search per length class. The LSB stream additionally gets a
//! triple table that resolves an LSB symbol and its trailing run-length
//! codes in a single probe.

use crate::EntropyError;
use crate::bitstream::BitStream;

pub(crate) const MAX_NUM_SYMBOLS: usize = 256;
pub(crate) const MAX_CODE_LENGTH: u8 = 31;

/// Width of the small per-stream LUT index.
pub(crate) const SMALL_TABLE_BITS: u8 = 5;

/// Code bits held in a triple-table index, excluding leading zeros.
pub(crate) const BIG_TABLE_CODE_BITS: u8 = 6;

/// Leading-zero counts distinguished by the triple table.
pub(crate) const BIG_TABLE_MAX_LEADING_ZEROS: u8 = 7;

/// Bits to keep buffered for one triple-table probe.
pub(crate) const BIG_TABLE_READ_BITS: u8 = BIG_TABLE_CODE_BITS + BIG_TABLE_MAX_LEADING_ZEROS;

const TRIPLE_TABLE_SIZE: usize = (BIG_TABLE_MAX_LEADING_ZEROS as usize + 1) << BIG_TABLE_CODE_BITS;

/// An LSB symbol with bit 0 set is followed by an MSB symbol.
pub(crate) fn next_symbol_is_msb(symbol: u8) -> bool {
    symbol & 0x01 != 0
}

/// A symbol with bit 7 set is followed by a run-length symbol.
pub(crate) fn next_symbol_is_rl(symbol: u8) -> bool {
    symbol & 0x80 != 0
}

/// Leading zeros of `value` within a `width`-bit field.
pub(crate) fn clz_in(value: u32, width: u8) -> u8 {
    if value == 0 {
        width
    } else {
        value.leading_zeros() as u8 - (32 - width)
    }
}

/// Outcome of a single-symbol decode attempt.
pub(crate) enum HuffError {
    /// The stream ran out mid-code: not an error, the chunk is simply done.
    NoData,
    /// The bits match no assigned code.
    InvalidCode,
}

/// Bit-widths of the code-length fields, by `max_length - min_length`. Each
/// of the first three bitstream versions shipped a new row; streams older
/// than the new-code-lengths version index with +1.
const CODE_LENGTH_BIT_WIDTHS: [[i8; 32]; 3] = [
    [
        1, 1, 2, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 5, 5, 5, //
        5, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    ],
    [
        1, 1, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4, //
        5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
    ],
    [
        0, 1, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4, //
        5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
    ],
];

/// First version with the re-derived code-length widths.
pub const BITSTREAM_VERSION_NEW_CODE_LENGTHS: u8 = 1;

/// First version fully aligned with the published specification.
pub const BITSTREAM_VERSION_ALIGN_WITH_SPEC: u8 = 2;

pub const BITSTREAM_VERSION_CURRENT: u8 = BITSTREAM_VERSION_ALIGN_WITH_SPEC;

fn code_length_bit_width(mut delta: u8, bitstream_version: u8) -> Option<u8> {
    if bitstream_version < BITSTREAM_VERSION_NEW_CODE_LENGTHS {
        delta += 1;
    }
    if delta > 31 {
        // Impossible for well-formed streams: lengths are 5 bits.
        return None;
    }
    let row = bitstream_version.min(BITSTREAM_VERSION_ALIGN_WITH_SPEC) as usize;
    let width = CODE_LENGTH_BIT_WIDTHS[row][delta as usize];
    u8::try_from(width).ok()
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HuffmanEntry {
    pub symbol: u8,
    pub bits: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HuffmanListEntry {
    pub symbol: u8,
    pub bits: u8,
    pub code: u32,
}

/// Direct look-up table for codes of at most [`SMALL_TABLE_BITS`] bits.
#[derive(Debug)]
pub(crate) struct HuffmanTable {
    pub code: [HuffmanEntry; 1 << SMALL_TABLE_BITS],
}

impl Default for HuffmanTable {
    fn default() -> Self {
        Self {
            code: [HuffmanEntry::default(); 1 << SMALL_TABLE_BITS],
        }
    }
}

/// Manual-search fallback: entries sorted by length ascending then code
/// descending, with an index of where each length class begins.
#[derive(Debug, Default)]
pub(crate) struct HuffmanList {
    pub list: Vec<HuffmanListEntry>,
    pub idx_of_each_bit_size: [u16; MAX_CODE_LENGTH as usize + 1],
}

/// Per-stream decode state for the slow path.
#[derive(Debug, Default)]
pub(crate) struct HuffmanManualState {
    pub list: HuffmanList,
    pub min_code_length: u8,
    pub max_code_length: u8,
    pub single_symbol: u8,
}

impl HuffmanManualState {
    /// True for the degenerate one-symbol table, which consumes no bits.
    pub fn single_symbol(&self) -> Option<u8> {
        if self.min_code_length == 0 && self.max_code_length == 0 {
            Some(self.single_symbol)
        } else {
            None
        }
    }
}

/// LUT + list decoder for one stream.
#[derive(Debug, Default)]
pub(crate) struct HuffmanSingleDecoder {
    pub manual: HuffmanManualState,
    pub table: HuffmanTable,
}

/// One triple-table entry: an LSB symbol, the accumulated run length, and a
/// packed `contents` field (`bits << 3 | flags`). Flag 0x01 marks an
/// unresolved run-length tail, 0x02 an MSB that must follow; `bits == 0`
/// means the LSB itself did not fit.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HuffmanTriple {
    pub lsb: u8,
    pub rl: u16,
    pub contents: u8,
}

impl HuffmanTriple {
    pub fn bits(self) -> u8 {
        self.contents >> 3
    }

    pub fn lsb_overflowed(self) -> bool {
        self.bits() == 0
    }

    pub fn is_incomplete(self) -> bool {
        self.lsb_overflowed() || (self.contents & 0b11) != 0
    }

    pub fn msb_follows(self) -> bool {
        self.contents & 0x02 != 0
    }
}

/// Decode state for the default (LSB/MSB/RL) coefficient stream.
#[derive(Debug, Default)]
pub(crate) struct HuffmanTripleState {
    /// Manual states for LSB, MSB and RL, in that order.
    pub lsb: HuffmanManualState,
    pub msb: HuffmanManualState,
    pub rl: HuffmanManualState,
    pub rl_table: HuffmanTable,
    pub triple: Vec<HuffmanTriple>,
}

/// Reads the common table header and code lengths for one stream. Returns
/// the present symbols, unsorted special cases handled:
/// an empty list for the empty-table and single-symbol sentinels.
fn manual_initialise_common(
    state: &mut HuffmanManualState,
    stream: &mut BitStream<'_>,
    bitstream_version: u8,
) -> Result<Vec<HuffmanListEntry>, EntropyError> {
    state.min_code_length = stream.read(5).ok_or(EntropyError::UnexpectedEnd)? as u8;
    state.max_code_length = stream.read(5).ok_or(EntropyError::UnexpectedEnd)? as u8;

    if state.max_code_length < state.min_code_length {
        tracing::error!(
            min = state.min_code_length,
            max = state.max_code_length,
            "huffman: max code length below min"
        );
        return Err(EntropyError::InvalidTable("max code length below min"));
    }

    if state.min_code_length == MAX_CODE_LENGTH && state.max_code_length == MAX_CODE_LENGTH {
        // Sentinel: empty table.
        return Ok(Vec::new());
    }

    if state.min_code_length == 0 && state.max_code_length == 0 {
        // Sentinel: a single symbol, sent raw.
        state.single_symbol = stream.read(8).ok_or(EntropyError::UnexpectedEnd)? as u8;
        return Ok(Vec::new());
    }

    let length_bits =
        code_length_bit_width(state.max_code_length - state.min_code_length, bitstream_version)
            .ok_or_else(|| {
                tracing::error!(
                    min = state.min_code_length,
                    max = state.max_code_length,
                    "huffman: code lengths give an invalid bit width"
                );
                EntropyError::InvalidTable("bad code length bit width")
            })?;

    let mut entries = Vec::new();

    // A presence bitmap is efficient when very many symbols are in use;
    // otherwise a count plus (symbol, length) tuples.
    let use_bitmap = stream.read(1).ok_or(EntropyError::UnexpectedEnd)? != 0;
    if use_bitmap {
        for symbol in 0..MAX_NUM_SYMBOLS {
            let present = stream.read(1).ok_or(EntropyError::UnexpectedEnd)? != 0;
            if present {
                let length = stream.read(length_bits).ok_or(EntropyError::UnexpectedEnd)?;
                entries.push(HuffmanListEntry {
                    symbol: symbol as u8,
                    bits: length as u8 + state.min_code_length,
                    code: 0,
                });
            }
        }
    } else {
        let symbol_count = stream.read(5).ok_or(EntropyError::UnexpectedEnd)?;
        if symbol_count == 0 {
            return Err(EntropyError::InvalidTable("zero symbol count"));
        }
        for _ in 0..symbol_count {
            let symbol = stream.read(8).ok_or(EntropyError::UnexpectedEnd)?;
            let length = stream.read(length_bits).ok_or(EntropyError::UnexpectedEnd)?;
            entries.push(HuffmanListEntry {
                symbol: symbol as u8,
                bits: length as u8 + state.min_code_length,
                code: 0,
            });
        }
    }

    // Length ascending, then symbol descending.
    entries.sort_by(|a, b| a.bits.cmp(&b.bits).then(b.symbol.cmp(&a.symbol)));

    Ok(entries)
}

/// Assigns canonical codes, walking from the longest entry down.
fn generate_codes(entries: &mut [HuffmanListEntry], max_code_length: u8) {
    let mut current_length = max_code_length;
    let mut current_code: u32 = 0;

    for entry in entries.iter_mut().rev() {
        if entry.bits < current_length {
            current_code >>= current_length - entry.bits;
            current_length = entry.bits;
        }
        entry.code = current_code;
        current_code += 1;
    }
}

fn determine_idx_of_each_bit_size(list: &mut HuffmanList) {
    let mut bit_size = list.list[0].bits;
    for (idx, entry) in list.list.iter().enumerate() {
        if entry.bits > bit_size {
            list.idx_of_each_bit_size[bit_size as usize] = idx as u16;
            bit_size = entry.bits;
        }
    }
    list.idx_of_each_bit_size[bit_size as usize] = list.list.len() as u16;
}

/// Assigns codes and fills the small LUT; codes too long for the LUT land in
/// the manual list.
fn generate_codes_and_lut(
    entries: &mut [HuffmanListEntry],
    table: &mut HuffmanTable,
    max_code_length: u8,
) -> usize {
    table.code = [HuffmanEntry::default(); 1 << SMALL_TABLE_BITS];

    let mut current_length = max_code_length;
    let mut current_code: u32 = 0;
    let mut min_oversized_idx = entries.len();

    for idx in (0..entries.len()).rev() {
        let entry = &mut entries[idx];
        if entry.bits < current_length {
            current_code >>= current_length - entry.bits;
            current_length = entry.bits;
        }

        if entry.bits > SMALL_TABLE_BITS {
            entry.code = current_code;
            min_oversized_idx = idx;
        } else {
            let start = (current_code as usize) << (SMALL_TABLE_BITS - entry.bits);
            let end = start + (1usize << (SMALL_TABLE_BITS - entry.bits));
            for lut in &mut table.code[start..end] {
                lut.symbol = entry.symbol;
                lut.bits = entry.bits;
            }
        }

        current_code += 1;
    }

    min_oversized_idx
}

impl HuffmanSingleDecoder {
    pub fn initialise(
        stream: &mut BitStream<'_>,
        bitstream_version: u8,
    ) -> Result<Self, EntropyError> {
        let mut decoder = HuffmanSingleDecoder::default();
        let mut entries =
            manual_initialise_common(&mut decoder.manual, stream, bitstream_version)?;
        if entries.is_empty() {
            return Ok(decoder);
        }

        let oversized = generate_codes_and_lut(
            &mut entries,
            &mut decoder.table,
            decoder.manual.max_code_length,
        );
        decoder.manual.list.list = entries.split_off(oversized);
        if !decoder.manual.list.list.is_empty() {
            determine_idx_of_each_bit_size(&mut decoder.manual.list);
        }
        Ok(decoder)
    }

    /// LUT first, manual search as the fallback; single-symbol streams
    /// consume nothing.
    pub fn decode(&self, stream: &mut BitStream<'_>) -> Result<u8, HuffError> {
        if let Some(symbol) = self.manual.single_symbol() {
            return Ok(symbol);
        }
        if let Ok(symbol) = huffman_lut_decode(&self.table, stream) {
            return Ok(symbol);
        }
        huffman_manual_decode(&self.manual, stream)
    }
}

/// O(1) decode of a short code. Fails on codes absent from the LUT.
pub(crate) fn huffman_lut_decode(
    table: &HuffmanTable,
    stream: &mut BitStream<'_>,
) -> Result<u8, HuffError> {
    let lut_idx = stream.peek(SMALL_TABLE_BITS) as usize;
    let entry = table.code[lut_idx];
    if entry.bits == 0 {
        return Err(HuffError::InvalidCode);
    }
    if !stream.consume(entry.bits) {
        return Err(HuffError::NoData);
    }
    Ok(entry.symbol)
}

/// Walks the length classes, binary-searching each for the buffered code.
pub(crate) fn huffman_manual_decode(
    state: &HuffmanManualState,
    stream: &mut BitStream<'_>,
) -> Result<u8, HuffError> {
    if let Some(symbol) = state.single_symbol() {
        return Ok(symbol);
    }

    let list = &state.list;
    if list.list.is_empty() {
        return Err(HuffError::InvalidCode);
    }

    let mut bits_under_consideration = list.list[0].bits;
    let mut code = stream.peek(bits_under_consideration);

    let mut idx: u16 = 0;
    while (idx as usize) < list.list.len() {
        let mut entry = &list.list[idx as usize];
        while bits_under_consideration < entry.bits {
            bits_under_consideration += 1;
            code = stream.peek(bits_under_consideration);
        }

        // Binary search within this length class; codes descend with index.
        let mut lower_limit = idx;
        let mut upper_limit = list.idx_of_each_bit_size[bits_under_consideration as usize] - 1;
        let mut test_idx = lower_limit + (upper_limit - lower_limit + 1) / 2;
        loop {
            entry = &list.list[test_idx as usize];
            if code > entry.code {
                if test_idx == lower_limit {
                    break;
                }
                upper_limit = test_idx;
                test_idx -= (test_idx - lower_limit + 1) / 2;
                continue;
            }

            if code < entry.code {
                if test_idx == upper_limit {
                    break;
                }
                lower_limit = test_idx;
                test_idx += (upper_limit - test_idx + 1) / 2;
                continue;
            }

            if !stream.consume(entry.bits) {
                return Err(HuffError::NoData);
            }
            return Ok(entry.symbol);
        }

        idx = list.idx_of_each_bit_size[bits_under_consideration as usize];
    }

    Err(HuffError::InvalidCode)
}

impl HuffmanTripleState {
    pub fn initialise(
        stream: &mut BitStream<'_>,
        bitstream_version: u8,
    ) -> Result<Self, EntropyError> {
        let mut state = HuffmanTripleState {
            triple: vec![HuffmanTriple::default(); TRIPLE_TABLE_SIZE],
            ..HuffmanTripleState::default()
        };

        // LSB: the full code list feeds the triple table; overflow codes are
        // spilled into the manual state by the assignment pass.
        let mut lsb_list =
            manual_initialise_common(&mut state.lsb, stream, bitstream_version)?;
        generate_codes(&mut lsb_list, state.lsb.max_code_length);

        // MSB: plain manual decoder.
        let mut msb_list =
            manual_initialise_common(&mut state.msb, stream, bitstream_version)?;
        if !msb_list.is_empty() {
            generate_codes(&mut msb_list, state.msb.max_code_length);
            state.msb.list.list = msb_list;
            determine_idx_of_each_bit_size(&mut state.msb.list);
        }

        // RL: LUT plus manual list.
        let mut rl_list = manual_initialise_common(&mut state.rl, stream, bitstream_version)?;
        if !rl_list.is_empty() {
            let oversized =
                generate_codes_and_lut(&mut rl_list, &mut state.rl_table, state.rl.max_code_length);
            state.rl.list.list = rl_list.split_off(oversized);
            if !state.rl.list.list.is_empty() {
                determine_idx_of_each_bit_size(&mut state.rl.list);
            }
        }

        state.assign_triple_table(&lsb_list);

        Ok(state)
    }

    /// Populates the triple table from the full LSB code list, descending
    /// into run-length combinations where they fit.
    fn assign_triple_table(&mut self, full_lsb_list: &[HuffmanListEntry]) {
        let mut overflow_start = full_lsb_list.len();

        for (idx, lsb_entry) in full_lsb_list.iter().enumerate() {
            let leading_zeros =
                clz_in(lsb_entry.code, lsb_entry.bits).min(BIG_TABLE_MAX_LEADING_ZEROS);
            let bits_left = BIG_TABLE_CODE_BITS as i8 - (lsb_entry.bits - leading_zeros) as i8;
            if bits_left < 0 {
                overflow_start = idx;
                break;
            }

            let mut start = (lsb_entry.code as usize) << bits_left;
            start |= (leading_zeros as usize) << BIG_TABLE_CODE_BITS;
            let end = start + (1usize << bits_left);

            if next_symbol_is_msb(lsb_entry.symbol) {
                for triple in &mut self.triple[start..end] {
                    triple.lsb = lsb_entry.symbol;
                    triple.contents = (lsb_entry.bits << 3) | 0x02;
                }
                continue;
            }

            if !next_symbol_is_rl(lsb_entry.symbol) {
                for triple in &mut self.triple[start..end] {
                    triple.lsb = lsb_entry.symbol;
                    triple.contents = lsb_entry.bits << 3;
                }
                continue;
            }

            iterate_rls(
                &mut self.triple,
                &self.rl_table,
                &self.rl.list,
                start as u16,
                end as u16,
                lsb_entry.symbol,
                0,
                lsb_entry.bits,
                0,
            );
        }

        // Entries whose LSB is too long for a LUT entry fall back to the
        // manual list. Its length-class index is computed here: this subset
        // can be an unpredictable slice of the full list, because of the
        // leading-zero compression.
        if full_lsb_list.len() > overflow_start {
            self.lsb
                .list
                .list
                .extend_from_slice(&full_lsb_list[overflow_start..]);
            determine_idx_of_each_bit_size(&mut self.lsb.list);
        }
    }
}

struct RlStep {
    code: u32,
    symbol: u8,
    bits: u8,
}

/// Recursively assigns run-length continuations under one LSB code. Returns
/// the lowest table index that received a complete entry; the gap below it is
/// filled with incomplete entries carrying the partial run.
#[allow(clippy::too_many_arguments)]
fn iterate_rls(
    table: &mut [HuffmanTriple],
    rl_table: &HuffmanTable,
    rl_list: &HuffmanList,
    parent_start: u16,
    parent_end: u16,
    lsb_symbol: u8,
    rl_symbol: u16,
    code_size_in_stream: u8,
    recursion_level: u8,
) -> u16 {
    let mut lowest_validly_set = parent_end;
    // A code's size in the table is its size in the stream minus its leading
    // zeros, which sit in the top bits of the parent index.
    let code_size_in_table = code_size_in_stream - (parent_start >> BIG_TABLE_CODE_BITS) as u8;
    let bits_left = BIG_TABLE_CODE_BITS - code_size_in_table;

    if recursion_level < 2 {
        // Walk the RL LUT top-down so a too-long entry ends the scan early.
        let mut rl_idx: i32 = (1 << SMALL_TABLE_BITS) - 1;
        while rl_idx >= 0 {
            let entry = rl_table.code[rl_idx as usize];
            if entry.bits == 0 || entry.bits > bits_left {
                // Zero-bit entries are placeholders for codes that cannot
                // fit; longer entries cannot fit after this LSB.
                break;
            }
            let step = RlStep {
                code: (rl_idx as u32) >> (SMALL_TABLE_BITS - entry.bits),
                symbol: entry.symbol,
                bits: entry.bits,
            };
            lowest_validly_set = lowest_validly_set.min(iterate_rls_step(
                table,
                rl_table,
                rl_list,
                parent_start,
                lsb_symbol,
                rl_symbol,
                code_size_in_stream,
                &step,
                recursion_level,
            ));
            rl_idx -= 1 << (SMALL_TABLE_BITS - entry.bits);
        }

        // Longer RL codes can still fit behind a very short LSB; short codes
        // are the common case, so this matters.
        if bits_left > SMALL_TABLE_BITS {
            for entry in &rl_list.list {
                if entry.bits > bits_left {
                    break;
                }
                let step = RlStep {
                    code: entry.code,
                    symbol: entry.symbol,
                    bits: entry.bits,
                };
                lowest_validly_set = lowest_validly_set.min(iterate_rls_step(
                    table,
                    rl_table,
                    rl_list,
                    parent_start,
                    lsb_symbol,
                    rl_symbol,
                    code_size_in_stream,
                    &step,
                    recursion_level,
                ));
            }
        }
    }

    // Everything between the parent start and the lowest complete entry is
    // reachable only when the trailing run does not fit: mark those entries
    // incomplete so the decoder falls back for the tail.
    for triple in &mut table[parent_start as usize..lowest_validly_set as usize] {
        triple.lsb = lsb_symbol;
        triple.rl = rl_symbol;
        triple.contents = (code_size_in_stream << 3) | 0x01;
    }

    parent_start.min(lowest_validly_set)
}

/// Places one run-length code (and recursively, its continuations) under the
/// parent prefix.
#[allow(clippy::too_many_arguments)]
fn iterate_rls_step(
    table: &mut [HuffmanTriple],
    rl_table: &HuffmanTable,
    rl_list: &HuffmanList,
    parent_start: u16,
    lsb_symbol: u8,
    rl_symbol: u16,
    mut code_size_in_stream: u8,
    step: &RlStep,
    recursion_level: u8,
) -> u16 {
    let code_size_in_table = code_size_in_stream - (parent_start >> BIG_TABLE_CODE_BITS) as u8;
    let bits_left = BIG_TABLE_CODE_BITS - code_size_in_table;
    let bits_left_by_rl = bits_left - step.bits;
    let start = parent_start | ((step.code as u16) << bits_left_by_rl);
    let end = start + (1 << bits_left_by_rl);
    code_size_in_stream += step.bits;

    let combined_rl = (rl_symbol << 7) | u16::from(step.symbol & 0x7f);

    if next_symbol_is_rl(step.symbol) {
        return iterate_rls(
            table,
            rl_table,
            rl_list,
            start,
            end,
            lsb_symbol,
            combined_rl,
            code_size_in_stream,
            recursion_level + 1,
        );
    }

    for triple in &mut table[start as usize..end as usize] {
        triple.lsb = lsb_symbol;
        triple.rl = combined_rl;
        triple.contents = code_size_in_stream << 3;
    }
    start
}

/// Resolves an LSB (sign-extended) and its run length, ideally in one table
/// probe; incomplete entries fall back to the per-stream decoders.
pub(crate) fn huffman_triple_decode(
    state: &HuffmanTripleState,
    stream: &mut BitStream<'_>,
) -> Result<(i16, u32), HuffError> {
    if stream.remaining_bits() == 0 {
        return Err(HuffError::NoData);
    }

    let code = stream.peek(BIG_TABLE_READ_BITS);

    // The leading-zero count forms the top bits of the table index; 0 is a
    // valid code (always the longest), so the count is capped.
    let mut leading_zeros = clz_in(code, BIG_TABLE_READ_BITS);
    leading_zeros = leading_zeros.min(state.lsb.max_code_length);
    leading_zeros = leading_zeros.min(BIG_TABLE_MAX_LEADING_ZEROS);

    let plausibly_useful_bits = BIG_TABLE_CODE_BITS + leading_zeros;
    let mut lut_idx = (code >> (BIG_TABLE_READ_BITS - plausibly_useful_bits)) as usize;
    lut_idx |= (leading_zeros as usize) << BIG_TABLE_CODE_BITS;

    let triplet = state.triple[lut_idx];
    if !stream.consume(triplet.bits()) {
        return Err(HuffError::NoData);
    }

    // Fast case: the whole (LSB, run) pair resolved in the probe.
    if !triplet.is_incomplete() {
        let value = ((i16::from(triplet.lsb & 0x7e)) - 0x40) >> 1;
        return Ok((value, u32::from(triplet.rl)));
    }

    let mut seek_run_lengths = true;

    let lsb_symbol = if triplet.lsb_overflowed() {
        let symbol = huffman_manual_decode(&state.lsb, stream)?;
        seek_run_lengths = next_symbol_is_rl(symbol);
        symbol
    } else {
        triplet.lsb
    };

    let mut value: i16;
    if next_symbol_is_msb(lsb_symbol) {
        debug_assert!(triplet.lsb_overflowed() || triplet.msb_follows());
        let msb = huffman_manual_decode(&state.msb, stream)?;
        seek_run_lengths = next_symbol_is_rl(msb);

        let exp = (i32::from(msb & 0x7f) << 8) | i32::from(lsb_symbol & 0xfe);
        value = (exp - 0x4000) as i16;
    } else {
        value = i16::from(lsb_symbol & 0x7e) - 0x40;
    }
    value >>= 1;

    let mut zeros = u32::from(triplet.rl);
    while seek_run_lengths {
        let symbol = match huffman_lut_decode(&state.rl_table, stream) {
            Ok(symbol) => symbol,
            Err(HuffError::NoData) => return Err(HuffError::NoData),
            Err(HuffError::InvalidCode) => huffman_manual_decode(&state.rl, stream)?,
        };
        zeros = (zeros << 7) | u32::from(symbol & 0x7f);
        seek_run_lengths = next_symbol_is_rl(symbol);
    }

    Ok((value, zeros))
}
