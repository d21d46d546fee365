//! The residual machinery of the enhancement layer: deriving inverse
//! quantization parameters, walking transform units in the orders the
//! appliers expect, and packing residuals into command buffers for the CPU
//! and GPU apply paths.
#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(unsafe_code)]

pub mod cmdbuffer_cpu;
pub mod cmdbuffer_gpu;
pub mod dequant;
pub mod transform_unit;

/// Level of quality. LOQ0 is the enhancement sub-layer at output resolution,
/// LOQ1 the lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoqIndex {
    Loq0 = 0,
    Loq1 = 1,
}

/// Enhanced levels of quality.
pub const LOQ_ENHANCED_COUNT: usize = 2;

/// Maximum number of picture planes handled by the enhancement layer.
pub const MAX_PLANES: usize = 3;

/// The inverse transform in use: 2x2 directional decomposition (4 layers) or
/// 4x4 (16 layers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformType {
    DD,
    DDS,
}

impl TransformType {
    pub fn layer_count(self) -> usize {
        match self {
            TransformType::DD => 4,
            TransformType::DDS => 16,
        }
    }

    /// Transform unit width as a shift: 2x2 for DD, 4x4 for DDS.
    pub fn tu_width_shift(self) -> u8 {
        match self {
            TransformType::DD => 1,
            TransformType::DDS => 2,
        }
    }
}

/// How LOQ1 was scaled down from LOQ0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    Scale0D,
    Scale1D,
    Scale2D,
}

/// Side of the temporal buffer a transform unit draws from; inter keeps the
/// previous reconstruction, intra starts clean.
pub use lcevc_entropy::TemporalSignal;

/// Temporal types indexed in dequant tables.
pub const TEMPORAL_COUNT: usize = 2;
