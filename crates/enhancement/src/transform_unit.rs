//! Deterministic mapping between linear transform-unit indices and pixel
//! coordinates.
//!
//! Two orderings are supported: surface raster (row-major over the whole
//! plane) and block raster (32x32-pixel blocks scanned in raster order, TUs
//! within each block in raster order, with partial blocks at the right and
//! bottom edges). A block-aligned variant maps into the padded space where
//! every block is full-size, which the GPU command buffer uses for aligned
//! parallel dispatch.

/// Temporal block size in pixels.
pub const BLOCK_SIZE: u32 = 32;
pub const BLOCK_SIZE_SHIFT: u32 = 5;

/// Outcome of an index-to-coordinates query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuCoords {
    /// The coordinates of this TU; more remain.
    Coords { x: u32, y: u32 },
    /// One past the final TU.
    Complete,
    /// The index lies beyond the plane.
    OutOfRange,
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockTraversal {
    /// TUs along one dimension of a whole block, as a shift and value.
    tu_per_block_dims_shift: u8,
    tu_per_block_dims: u8,
    /// TUs in a whole block, as a shift and value.
    tu_per_block_shift: u8,
    tu_per_block: u16,
    /// TU width/height of the partial blocks at the right and bottom edges.
    tu_per_block_row_right_edge: u32,
    tu_per_block_col_bottom_edge: u32,
    /// TUs in a partial bottom-edge block.
    tu_per_block_bottom_edge: u32,
    /// TUs in one row of blocks.
    tu_per_row: u32,
    whole_blocks_per_row: u32,
    whole_blocks_per_col: u32,
    /// First TU index of the bottom edge row of blocks.
    max_whole_block_tu: u32,
    blocks_per_row: u32,
    blocks_per_col: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockAligned {
    /// TUs per row of blocks in the padded, block-aligned space.
    tu_per_row: u32,
    /// First y coordinate of the bottom edge row of blocks.
    max_whole_block_y: u32,
}

/// Precomputed traversal descriptor for one plane at one LOQ. Pure value
/// type; all queries are const over the state.
#[derive(Debug, Clone, Copy)]
pub struct TuState {
    tu_width_shift: u8,
    num_across: u32,
    tu_total: u32,
    x_offset: u32,
    y_offset: u32,
    block: BlockTraversal,
    block_aligned: BlockAligned,
}

impl TuState {
    /// Builds the descriptor. `width` and `height` must be multiples of the
    /// TU size (2 or 4, from `tu_width_shift` in {1, 2}).
    pub fn new(
        width: u32,
        height: u32,
        x_offset: u32,
        y_offset: u32,
        tu_width_shift: u8,
    ) -> Option<TuState> {
        debug_assert!(tu_width_shift == 1 || tu_width_shift == 2);

        let tu_size = 1u32 << tu_width_shift;
        if width & (tu_size - 1) != 0 || height & (tu_size - 1) != 0 {
            return None;
        }

        let num_across = width >> tu_width_shift;
        let tu_per_block_dims_shift: u8 = if tu_width_shift == 1 { 4 } else { 3 };
        let tu_per_block_shift = tu_per_block_dims_shift << 1;

        let block = BlockTraversal {
            tu_per_block_dims_shift,
            tu_per_block_dims: 1 << tu_per_block_dims_shift,
            tu_per_block_shift,
            tu_per_block: 1 << tu_per_block_shift,
            tu_per_block_row_right_edge: (width & (BLOCK_SIZE - 1)) >> tu_width_shift,
            tu_per_block_col_bottom_edge: (height & (BLOCK_SIZE - 1)) >> tu_width_shift,
            tu_per_block_bottom_edge: ((height & (BLOCK_SIZE - 1)) >> tu_width_shift)
                << tu_per_block_dims_shift,
            tu_per_row: num_across << tu_per_block_dims_shift,
            whole_blocks_per_row: width >> BLOCK_SIZE_SHIFT,
            whole_blocks_per_col: height >> BLOCK_SIZE_SHIFT,
            max_whole_block_tu: (height >> BLOCK_SIZE_SHIFT) * (num_across << tu_per_block_dims_shift),
            blocks_per_row: (width + BLOCK_SIZE - 1) >> BLOCK_SIZE_SHIFT,
            blocks_per_col: (height + BLOCK_SIZE - 1) >> BLOCK_SIZE_SHIFT,
        };

        let block_aligned_width = (width + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1);
        let block_aligned = BlockAligned {
            tu_per_row: (block_aligned_width >> tu_width_shift) << tu_per_block_dims_shift,
            max_whole_block_y: block.whole_blocks_per_col << BLOCK_SIZE_SHIFT,
        };

        Some(TuState {
            tu_width_shift,
            num_across,
            tu_total: num_across * (height >> tu_width_shift),
            x_offset,
            y_offset,
            block,
            block_aligned,
        })
    }

    pub fn tu_total(&self) -> u32 {
        self.tu_total
    }

    pub fn block_aligned_tu_per_row(&self) -> u32 {
        self.block_aligned.tu_per_row
    }

    pub fn whole_blocks_per_col(&self) -> u32 {
        self.block.whole_blocks_per_col
    }

    /// Block-grid dimensions, counting partial edge blocks.
    pub fn block_count(&self) -> (u32, u32) {
        (self.block.blocks_per_row, self.block.blocks_per_col)
    }

    /// First y coordinate of the bottom edge row of blocks.
    pub fn max_whole_block_y(&self) -> u32 {
        self.block_aligned.max_whole_block_y
    }

    /// Index to coordinates in plain row-major order.
    pub fn coords_surface_raster(&self, tu_index: u32) -> TuCoords {
        if tu_index > self.tu_total {
            return TuCoords::OutOfRange;
        }
        if tu_index == self.tu_total {
            return TuCoords::Complete;
        }

        TuCoords::Coords {
            x: ((tu_index % self.num_across) << self.tu_width_shift) + self.x_offset,
            y: ((tu_index / self.num_across) << self.tu_width_shift) + self.y_offset,
        }
    }

    /// Index to coordinates in block raster order, honouring partial edge
    /// blocks.
    pub fn coords_block_raster(&self, tu_index: u32) -> TuCoords {
        if tu_index > self.tu_total {
            return TuCoords::OutOfRange;
        }
        if tu_index == self.tu_total {
            return TuCoords::Complete;
        }

        let block = &self.block;

        // Row of blocks this TU falls into, and the TU index within it.
        let block_row_index = tu_index / block.tu_per_row;
        let row_tu_index = tu_index - block_row_index * block.tu_per_row;

        // Column of blocks, and the TU index within that block.
        let (block_col_index, block_tu_index) = if block_row_index >= block.whole_blocks_per_col {
            // Bottom edge: blocks hold fewer TUs.
            debug_assert_eq!(block_row_index, block.whole_blocks_per_col);
            (
                row_tu_index / block.tu_per_block_bottom_edge,
                row_tu_index % block.tu_per_block_bottom_edge,
            )
        } else {
            (
                row_tu_index >> block.tu_per_block_shift,
                row_tu_index & (u32::from(block.tu_per_block) - 1),
            )
        };

        // Coordinates inside the block.
        let (tu_x, tu_y) = if block_col_index >= block.whole_blocks_per_row {
            debug_assert_eq!(block_col_index, block.whole_blocks_per_row);
            (
                block_tu_index % block.tu_per_block_row_right_edge,
                block_tu_index / block.tu_per_block_row_right_edge,
            )
        } else {
            let y = block_tu_index >> block.tu_per_block_dims_shift;
            (block_tu_index - (y << block.tu_per_block_dims_shift), y)
        };

        // Offset to the full surface and convert to pixels.
        let x = tu_x + (block_col_index << block.tu_per_block_dims_shift);
        let y = tu_y + (block_row_index << block.tu_per_block_dims_shift);

        TuCoords::Coords {
            x: (x << self.tu_width_shift) + self.x_offset,
            y: (y << self.tu_width_shift) + self.y_offset,
        }
    }

    /// Coordinates to index in plain row-major order.
    pub fn coords_surface_index(&self, x: u32, y: u32) -> u32 {
        (y >> self.tu_width_shift) * self.num_across + (x >> self.tu_width_shift)
    }

    /// Coordinates to index in the padded block-aligned space.
    pub fn coords_block_aligned_index(&self, x: u32, y: u32) -> u32 {
        debug_assert!(x >= self.x_offset);
        debug_assert!(y >= self.y_offset);

        let x = x - self.x_offset;
        let y = y - self.y_offset;
        let block_index_x = x >> BLOCK_SIZE_SHIFT;
        let block_index_y = y >> BLOCK_SIZE_SHIFT;

        // Index of the block's top-left TU; tu_per_row covers a row of
        // blocks, not a row of pixels.
        let mut index = block_index_y * self.block_aligned.tu_per_row
            + (block_index_x << self.block.tu_per_block_shift);

        index += ((y - (block_index_y * BLOCK_SIZE)) >> self.tu_width_shift)
            << self.block.tu_per_block_dims_shift;
        index += (x - (block_index_x * BLOCK_SIZE)) >> self.tu_width_shift;

        index
    }

    /// Index to coordinates over the padded block-aligned space. The caller
    /// bounds the index; coordinates past the surface edge are valid padding
    /// positions.
    pub fn coords_block_aligned_raster(&self, tu_index: u32) -> (u32, u32) {
        let block = &self.block;

        let block_row_index = tu_index / self.block_aligned.tu_per_row;
        let row_tu_index = tu_index - block_row_index * self.block_aligned.tu_per_row;

        let block_col_index = row_tu_index >> block.tu_per_block_shift;
        let block_tu_index = row_tu_index - (block_col_index << block.tu_per_block_shift);
        let tu_y = block_tu_index >> block.tu_per_block_dims_shift;
        let tu_x = block_tu_index - (tu_y << block.tu_per_block_dims_shift);

        let x = tu_x + (block_col_index << block.tu_per_block_dims_shift);
        let y = tu_y + (block_row_index << block.tu_per_block_dims_shift);

        (
            (x << self.tu_width_shift) + self.x_offset,
            (y << self.tu_width_shift) + self.y_offset,
        )
    }

    /// Block-raster index to the corresponding index in the block-aligned
    /// padded space.
    pub fn index_block_aligned(&self, tu_index: u32) -> u32 {
        let block = &self.block;
        let mut index = tu_index;

        if block.tu_per_block_row_right_edge > 0 {
            let block_row_index = tu_index / block.tu_per_row;
            index += (u32::from(block.tu_per_block)
                - block.tu_per_block_row_right_edge * u32::from(block.tu_per_block_dims))
                * block_row_index;
            if (tu_index % block.tu_per_row)
                > block.whole_blocks_per_row * u32::from(block.tu_per_block)
            {
                index += ((tu_index % block.tu_per_row) % u32::from(block.tu_per_block)
                    / block.tu_per_block_row_right_edge)
                    * (u32::from(block.tu_per_block_dims) - block.tu_per_block_row_right_edge);
            }
        }

        if block.tu_per_block_col_bottom_edge > 0 && tu_index > block.max_whole_block_tu {
            let bottom_block_tu =
                block.tu_per_block_col_bottom_edge * u32::from(block.tu_per_block_dims);
            let last_row_block_index = (tu_index - block.max_whole_block_tu) / bottom_block_tu;
            index += (u32::from(block.tu_per_block) - bottom_block_tu) * last_row_block_index;
            if last_row_block_index == block.blocks_per_row - 1
                && block.tu_per_block_row_right_edge > 0
            {
                index += ((tu_index - block.max_whole_block_tu) % bottom_block_tu
                    / block.tu_per_block_row_right_edge)
                    * (u32::from(block.tu_per_block_dims) - block.tu_per_block_row_right_edge);
            }
        }

        debug_assert!(
            index <= self.block_aligned.tu_per_row * (self.block.whole_blocks_per_col + 1)
        );

        index
    }

    /// Number of TUs in the block containing `tu_index` (block raster
    /// order), accounting for partial edge blocks.
    pub fn block_tu_count(&self, tu_index: u32) -> u32 {
        let block = &self.block;
        let right_limit = block.whole_blocks_per_row << block.tu_per_block_shift;

        let wide = if (tu_index % block.tu_per_row) >= right_limit {
            block.tu_per_block_row_right_edge
        } else {
            u32::from(block.tu_per_block_dims)
        };
        let high = if tu_index >= block.max_whole_block_tu {
            block.tu_per_block_col_bottom_edge
        } else {
            u32::from(block.tu_per_block_dims)
        };

        wide * high
    }

    /// True at the first TU of any block in block raster order.
    pub fn is_block_start(&self, tu_index: u32) -> bool {
        let block = &self.block;
        if tu_index >= block.max_whole_block_tu {
            return (tu_index - block.max_whole_block_tu) % block.tu_per_block_bottom_edge == 0;
        }
        (tu_index % block.tu_per_row) % u32::from(block.tu_per_block) == 0
    }
}
