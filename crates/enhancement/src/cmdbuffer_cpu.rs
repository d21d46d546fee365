//! The CPU apply path's command buffer: a double-ended store with commands
//! packed from the front and residual payloads from the back, plus
//! precomputed entry points so workers can apply disjoint slices in
//! parallel.
//!
//! Commands are 1, 3 or 4 bytes: a 2-bit operation and a 6-bit jump to the
//! next touched transform unit. Jump values up to 61 are inline; 62 flags a
//! following little-endian 16-bit jump and 63 a 24-bit one.

/// Grow factor applied when the two ends of the store approach each other.
const STORE_GROW_FACTOR: usize = 2;
/// Initial store capacity in bytes.
const INITIAL_CAPACITY: usize = 32768;
/// 6-bit jump value announcing a 16-bit jump.
const BIG_JUMP_SIGNAL: u32 = 62;
/// 6-bit jump value announcing a 24-bit jump.
const EXTRA_BIG_JUMP_SIGNAL: u32 = 63;
/// Largest jump that still fits the 16-bit form.
const EXTRA_BIG_JUMP: u32 = u16::MAX as u32;
/// Maximum number of entry points.
pub const MAX_ENTRY_POINTS: usize = 16;

const DDS_LAYER_COUNT: u8 = 16;

/// Residual layer ordering applied to DDS at append time, so the applier
/// reads rows of the 4x4 transform in natural raster order.
const DDS_INTERLEAVE: [usize; 16] = [0, 1, 4, 5, 2, 3, 6, 7, 8, 9, 12, 13, 10, 11, 14, 15];

/// Command operations, in the top two bits of the first command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuCmd {
    Add = 0x00,
    Set = 0x40,
    SetZero = 0x80,
    ClearAndSet = 0xc0,
}

/// A resumable position in the command stream, placed at block boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuEntryPoint {
    /// Transform-unit index the slice starts at.
    pub initial_jump: u32,
    /// Byte offset of the first command of the slice.
    pub command_offset: u32,
    /// Byte offset of the slice's residuals, from the residual end.
    pub data_offset: u32,
    /// Commands in the slice.
    pub count: u32,
}

/// The command buffer. Offsets are plain integers rather than pointers so
/// the whole store can be copied or handed to another device untouched.
#[derive(Debug)]
pub struct CmdBufferCpu {
    store: Vec<u8>,
    /// Next command byte to write, growing up from 0.
    command_offset: usize,
    /// Last written residual byte, growing down from the end.
    residual_offset: usize,
    count: u32,
    transform_size: u8,
    entry_points: Vec<CpuEntryPoint>,
}

impl CmdBufferCpu {
    /// Creates a buffer with up to `num_entry_points` parallel entry points.
    pub fn new(num_entry_points: u16) -> Option<CmdBufferCpu> {
        if num_entry_points as usize > MAX_ENTRY_POINTS {
            return None;
        }
        Some(CmdBufferCpu {
            store: vec![0; INITIAL_CAPACITY],
            command_offset: 0,
            residual_offset: INITIAL_CAPACITY - 32,
            count: 0,
            transform_size: 0,
            entry_points: vec![CpuEntryPoint::default(); num_entry_points as usize],
        })
    }

    /// Rewinds the buffer for a new frame with `transform_size` residual
    /// layers per command.
    pub fn reset(&mut self, transform_size: u8) {
        self.command_offset = 0;
        self.residual_offset = self.store.len();
        self.count = 0;
        self.transform_size = transform_size;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn transform_size(&self) -> u8 {
        self.transform_size
    }

    /// The packed command stream.
    pub fn commands(&self) -> &[u8] {
        &self.store[..self.command_offset]
    }

    /// The residuals of the `index`-th Add/Set command, newest at the lowest
    /// offset.
    pub fn residual(&self, index: u32) -> &[u8] {
        let layer_bytes = self.layer_bytes();
        let end = self.store.len() - index as usize * layer_bytes;
        &self.store[end - layer_bytes..end]
    }

    pub fn entry_points(&self) -> &[CpuEntryPoint] {
        &self.entry_points
    }

    fn layer_bytes(&self) -> usize {
        self.transform_size as usize * 2
    }

    /// Appends one command. `values` carries `transform_size` coefficients
    /// for Add and Set and is ignored otherwise; `jump` is the TU distance
    /// from the previous command.
    pub fn append(&mut self, command: CpuCmd, values: &[i16], jump: u32) {
        debug_assert!(self.transform_size > 0);

        if jump < BIG_JUMP_SIGNAL {
            self.store[self.command_offset] = command as u8 | jump as u8;
            self.command_offset += 1;
        } else if jump < EXTRA_BIG_JUMP {
            self.store[self.command_offset] = command as u8 | BIG_JUMP_SIGNAL as u8;
            self.store[self.command_offset + 1] = (jump & 0xff) as u8;
            self.store[self.command_offset + 2] = ((jump >> 8) & 0xff) as u8;
            self.command_offset += 3;
        } else {
            debug_assert!(jump < 0x0100_0000);
            self.store[self.command_offset] = command as u8 | EXTRA_BIG_JUMP_SIGNAL as u8;
            self.store[self.command_offset + 1] = (jump & 0xff) as u8;
            self.store[self.command_offset + 2] = ((jump >> 8) & 0xff) as u8;
            self.store[self.command_offset + 3] = ((jump >> 16) & 0xff) as u8;
            self.command_offset += 4;
        }

        let layer_bytes = self.layer_bytes();
        if command == CpuCmd::Add || command == CpuCmd::Set {
            self.residual_offset -= layer_bytes;
            if self.transform_size == DDS_LAYER_COUNT {
                // Reordered at the residual-generation stage; the legacy path
                // interleaved at apply time instead.
                for (dst, &src) in DDS_INTERLEAVE.iter().enumerate() {
                    let bytes = values[src].to_le_bytes();
                    self.store[self.residual_offset + dst * 2] = bytes[0];
                    self.store[self.residual_offset + dst * 2 + 1] = bytes[1];
                }
            } else {
                for (dst, value) in values[..self.transform_size as usize].iter().enumerate() {
                    let bytes = value.to_le_bytes();
                    self.store[self.residual_offset + dst * 2] = bytes[0];
                    self.store[self.residual_offset + dst * 2 + 1] = bytes[1];
                }
            }
        }

        self.count += 1;

        // Keep enough of a gap for a worst-case command plus one residual.
        if self.residual_offset - self.command_offset < layer_bytes + 5 {
            self.grow();
        }
    }

    /// Doubles the store. Commands stay put; the residual block moves to the
    /// new end.
    fn grow(&mut self) {
        let old_len = self.store.len();
        let new_len = old_len * STORE_GROW_FACTOR;
        let residual_len = old_len - self.residual_offset;

        self.store.resize(new_len, 0);
        self.store
            .copy_within(self.residual_offset..old_len, new_len - residual_len);
        self.residual_offset = new_len - residual_len;
    }

    /// Computes up to the configured number of entry points by walking the
    /// command stream, cutting only at block boundaries once the per-slice
    /// command budget is spent.
    pub fn split(&mut self) {
        let num_entry_points = self.entry_points.len();
        if num_entry_points == 0 {
            return;
        }
        let group_size = self.count / num_entry_points as u32;
        let block_shift = if self.transform_size == DDS_LAYER_COUNT { 6 } else { 8 };
        let mut split_point = group_size;

        for entry_point in &mut self.entry_points {
            *entry_point = CpuEntryPoint::default();
        }

        let mut data_offset: u32 = 0;
        let mut cmd_offset: usize = 0;
        let mut tu_index: u32 = 0;
        let mut buffer_index: usize = 0;
        let mut last_cmd_block: i64 = -1;
        let mut last_buffer_count: u32 = 0;

        let mut cmd_count: u32 = 0;
        while cmd_count < self.count {
            let command_byte = self.store[cmd_offset];
            let command = command_byte & 0xc0;
            let jump_signal = u32::from(command_byte & 0x3f);

            let (jump, cmd_increment) = if jump_signal < BIG_JUMP_SIGNAL {
                (jump_signal, 1)
            } else if jump_signal == BIG_JUMP_SIGNAL {
                (
                    u32::from(self.store[cmd_offset + 1])
                        | (u32::from(self.store[cmd_offset + 2]) << 8),
                    3,
                )
            } else {
                (
                    u32::from(self.store[cmd_offset + 1])
                        | (u32::from(self.store[cmd_offset + 2]) << 8)
                        | (u32::from(self.store[cmd_offset + 3]) << 16),
                    4,
                )
            };

            let current_block = i64::from((tu_index + jump) >> block_shift);
            if cmd_count > split_point
                && buffer_index < num_entry_points - 1
                && current_block != last_cmd_block
            {
                self.entry_points[buffer_index].count = cmd_count - last_buffer_count;
                buffer_index += 1;
                self.entry_points[buffer_index] = CpuEntryPoint {
                    initial_jump: tu_index,
                    command_offset: cmd_offset as u32,
                    data_offset: data_offset * u32::from(self.transform_size) * 2,
                    count: 0,
                };
                split_point += group_size;
                last_buffer_count = cmd_count;
            }
            last_cmd_block = current_block;

            cmd_offset += cmd_increment;
            tu_index += jump;
            if command == CpuCmd::Set as u8 || command == CpuCmd::Add as u8 {
                data_offset += 1;
            }
            cmd_count += 1;
        }
        self.entry_points[buffer_index].count = cmd_count - last_buffer_count;
    }
}
