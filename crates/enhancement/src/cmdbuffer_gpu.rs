//! The GPU apply path's command buffer: fixed-size commands addressing
//! 32x32-pixel blocks, each with a presence bitmask of the transform units
//! it touches and an offset into a residual array per operation family.
//!
//! The builder keeps one open command per operation; consecutive appends to
//! the same block index merge into it. `build` then concatenates the three
//! residual arrays (Add | Set | ClearAndSet) and rebases the command data
//! offsets, leaving a single buffer a shader can consume.

/// Initial capacity of each residual builder array, in coefficients.
const INITIAL_RESIDUAL_CAPACITY: usize = 2048;
/// Initial capacity of the command array, in commands.
const INITIAL_COMMAND_CAPACITY: usize = 256;
/// Commands address blocks with an 18-bit index.
pub const MAX_BLOCK_INDEX: u32 = (1 << 18) - 1;

const DDS_LAYER_COUNT: u8 = 16;
/// Transform units in a block: 4x4 TUs for DDS, 16x16 for DD.
const DDS_BLOCK_SIZE: u32 = 64;
const DD_BLOCK_SIZE: u32 = 256;

/// Same apply-time residual ordering as the CPU buffer uses for DDS.
const DDS_INTERLEAVE: [usize; 16] = [0, 1, 4, 5, 2, 3, 6, 7, 8, 9, 12, 13, 10, 11, 14, 15];

/// Operation families. SetZero carries no residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuOperation {
    #[default]
    Add,
    Set,
    SetZero,
    ClearAndSet,
}

/// One fixed-size command.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuCmd {
    pub operation: GpuOperation,
    /// 18-bit block index.
    pub block_index: u32,
    /// Which TUs within the block receive coefficients; one word for DDS
    /// blocks, four for DD.
    pub bitmask: [u64; 4],
    /// Leading-zero count of the first populated mask word when the command
    /// opened.
    pub bit_start: u8,
    /// TUs recorded in this command.
    pub bit_count: u16,
    /// Offset into the residual array of this command's family (rebased to
    /// the combined array by `build`).
    pub data_offset: u32,
}

/// The built buffer handed to the apply stage.
#[derive(Debug, Default)]
pub struct CmdBufferGpu {
    pub commands: Vec<GpuCmd>,
    pub residuals: Vec<i16>,
    pub layer_count: u8,
}

/// Builder state: three per-family residual arrays and the index of the
/// currently open command per family.
#[derive(Debug, Default)]
pub struct CmdBufferGpuBuilder {
    residuals_add: Vec<i16>,
    residuals_set: Vec<i16>,
    residuals_clear_and_set: Vec<i16>,
    current_add_cmd: Option<usize>,
    current_set_cmd: Option<usize>,
    current_set_zero_cmd: Option<usize>,
    current_clear_and_set_cmd: Option<usize>,
    /// Set while a ClearAndSet command is open; Add and Set appends to the
    /// same block are redirected into it.
    building_clear_and_set: bool,
}

impl CmdBufferGpu {
    pub fn new() -> (CmdBufferGpu, CmdBufferGpuBuilder) {
        let buffer = CmdBufferGpu {
            commands: Vec::with_capacity(INITIAL_COMMAND_CAPACITY),
            residuals: Vec::new(),
            layer_count: 0,
        };
        let builder = CmdBufferGpuBuilder {
            residuals_add: Vec::with_capacity(INITIAL_RESIDUAL_CAPACITY),
            residuals_set: Vec::with_capacity(INITIAL_RESIDUAL_CAPACITY),
            residuals_clear_and_set: Vec::with_capacity(INITIAL_RESIDUAL_CAPACITY),
            ..CmdBufferGpuBuilder::default()
        };
        (buffer, builder)
    }

    /// Rewinds for a new frame of `layer_count`-layer transforms.
    pub fn reset(&mut self, builder: &mut CmdBufferGpuBuilder, layer_count: u8) {
        self.commands.clear();
        self.residuals.clear();
        self.layer_count = layer_count;
        builder.residuals_add.clear();
        builder.residuals_set.clear();
        builder.residuals_clear_and_set.clear();
        builder.current_add_cmd = None;
        builder.current_set_cmd = None;
        builder.current_set_zero_cmd = None;
        builder.current_clear_and_set_cmd = None;
        builder.building_clear_and_set = false;
    }

    /// Appends one TU's worth of residuals at `tu_index` (block raster
    /// order, or plain raster when `tu_raster_order` is set).
    pub fn append(
        &mut self,
        builder: &mut CmdBufferGpuBuilder,
        operation: GpuOperation,
        residuals: &[i16],
        tu_index: u32,
        tu_raster_order: bool,
    ) -> bool {
        let dds = self.layer_count == DDS_LAYER_COUNT;
        let block_shift = if !tu_raster_order && dds { 6 } else { 8 };
        let block_index = tu_index >> block_shift;
        if block_index > MAX_BLOCK_INDEX {
            tracing::error!(block_index, "block index exceeds the 18-bit command field");
            return false;
        }

        // A ClearAndSet stays open for its block: Add and Set join it,
        // SetZero keeps its own command, and a new block closes it.
        if operation != GpuOperation::ClearAndSet && builder.building_clear_and_set {
            let current = builder
                .current_clear_and_set_cmd
                .expect("open ClearAndSet command");
            if self.commands[current].block_index == block_index {
                if operation != GpuOperation::SetZero {
                    self.append_residuals(
                        builder,
                        current,
                        GpuOperation::ClearAndSet,
                        residuals,
                        tu_index,
                        false,
                    );
                    return true;
                }
            } else {
                builder.building_clear_and_set = false;
            }
        }

        let current = match operation {
            GpuOperation::Add => builder.current_add_cmd,
            GpuOperation::Set => builder.current_set_cmd,
            GpuOperation::SetZero => builder.current_set_zero_cmd,
            GpuOperation::ClearAndSet => {
                builder.building_clear_and_set = true;
                builder.current_clear_and_set_cmd
            }
        };

        match current {
            Some(index) if self.commands[index].block_index == block_index => {
                // Merge into the open command.
                if operation != GpuOperation::ClearAndSet {
                    self.append_residuals(
                        builder,
                        index,
                        operation,
                        residuals,
                        tu_index,
                        tu_raster_order,
                    );
                }
            }
            _ => {
                let index = self.commands.len();
                self.commands.push(GpuCmd {
                    operation,
                    block_index,
                    data_offset: match operation {
                        GpuOperation::Add => builder.residuals_add.len() as u32,
                        GpuOperation::Set => builder.residuals_set.len() as u32,
                        GpuOperation::ClearAndSet => builder.residuals_clear_and_set.len() as u32,
                        GpuOperation::SetZero => 0,
                    },
                    ..GpuCmd::default()
                });
                match operation {
                    GpuOperation::Add => builder.current_add_cmd = Some(index),
                    GpuOperation::Set => builder.current_set_cmd = Some(index),
                    GpuOperation::SetZero => builder.current_set_zero_cmd = Some(index),
                    GpuOperation::ClearAndSet => builder.current_clear_and_set_cmd = Some(index),
                }
                if operation != GpuOperation::ClearAndSet {
                    self.append_residuals(
                        builder,
                        index,
                        operation,
                        residuals,
                        tu_index,
                        tu_raster_order,
                    );
                }
            }
        }

        true
    }

    /// Marks the TU in the command bitmask and copies its residuals into the
    /// family array.
    fn append_residuals(
        &mut self,
        builder: &mut CmdBufferGpuBuilder,
        command_index: usize,
        family: GpuOperation,
        residuals: &[i16],
        tu_index: u32,
        tu_raster_order: bool,
    ) {
        let dds = self.layer_count == DDS_LAYER_COUNT;
        let block_size = if dds { DDS_BLOCK_SIZE } else { DD_BLOCK_SIZE };
        let cmd = &mut self.commands[command_index];

        if !tu_raster_order && dds {
            let position = tu_index % block_size;
            cmd.bitmask[0] |= 1u64 << (block_size - 1 - position);
            if cmd.bit_count == 0 {
                cmd.bit_start = cmd.bitmask[0].leading_zeros() as u8;
            }
        } else {
            let position = if tu_raster_order {
                tu_index % DD_BLOCK_SIZE
            } else {
                tu_index % block_size
            };
            let mask_index = (position >> 6) as usize;
            cmd.bitmask[mask_index] |= 1u64 << (63 - (position % 64));
            if cmd.bit_count == 0 {
                cmd.bit_start = cmd.bitmask[mask_index].leading_zeros() as u8;
            }
        }
        cmd.bit_count += 1;

        let target = match family {
            GpuOperation::Add => &mut builder.residuals_add,
            GpuOperation::Set => &mut builder.residuals_set,
            GpuOperation::ClearAndSet => &mut builder.residuals_clear_and_set,
            GpuOperation::SetZero => return,
        };

        if dds {
            target.extend(DDS_INTERLEAVE.iter().map(|&src| residuals[src]));
        } else {
            target.extend_from_slice(&residuals[..self.layer_count as usize]);
        }
    }

    /// Concatenates the family arrays into the output residual buffer and
    /// rebases command offsets. The TU-raster path keeps the families
    /// separate (one dispatch per family), so only Add is copied.
    pub fn build(&mut self, builder: &mut CmdBufferGpuBuilder, tu_raster_order: bool) {
        let set_start = builder.residuals_add.len() as u32;
        let clear_start = set_start + builder.residuals_set.len() as u32;

        self.residuals.clear();
        self.residuals.extend_from_slice(&builder.residuals_add);

        if !tu_raster_order {
            self.residuals.extend_from_slice(&builder.residuals_set);
            self.residuals
                .extend_from_slice(&builder.residuals_clear_and_set);

            for cmd in &mut self.commands {
                match cmd.operation {
                    GpuOperation::Add | GpuOperation::SetZero => {}
                    GpuOperation::Set => cmd.data_offset += set_start,
                    GpuOperation::ClearAndSet => cmd.data_offset += clear_start,
                }
            }
        }
    }
}
