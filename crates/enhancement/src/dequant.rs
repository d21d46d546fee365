//! Derivation of the per-layer inverse quantization parameters.
//!
//! All arithmetic is integer fixed point following the step-width and offset
//! formulas of the enhancement standard (section 8.5.3); divisors stay as
//! divisions because the intermediates are signed.

use crate::{
    LOQ_ENHANCED_COUNT, LoqIndex, MAX_PLANES, ScalingMode, TEMPORAL_COUNT, TemporalSignal,
    TransformType,
};

const LAYER_COUNT_DD: usize = 4;
const LAYER_COUNT_DDS: usize = 16;

pub const MIN_STEP_WIDTH: i32 = 1;
pub const MAX_STEP_WIDTH: i32 = 32767;

const QUANT_MATRIX_DEFAULT_DD_1D: [[u8; LAYER_COUNT_DD]; LOQ_ENHANCED_COUNT] =
    [[0, 2, 0, 0], [0, 3, 0, 32]];

const QUANT_MATRIX_DEFAULT_DD_2D: [[u8; LAYER_COUNT_DD]; LOQ_ENHANCED_COUNT] =
    [[32, 3, 0, 32], [0, 3, 0, 32]];

const QUANT_MATRIX_DEFAULT_DDS_1D: [[u8; LAYER_COUNT_DDS]; LOQ_ENHANCED_COUNT] = [
    [13, 26, 19, 32, 52, 1, 78, 9, 13, 26, 19, 32, 150, 91, 91, 19],
    [0, 0, 0, 2, 52, 1, 78, 9, 26, 72, 0, 3, 150, 91, 91, 19],
];

const QUANT_MATRIX_DEFAULT_DDS_2D: [[u8; LAYER_COUNT_DDS]; LOQ_ENHANCED_COUNT] = [
    [13, 26, 19, 32, 52, 1, 78, 9, 26, 72, 0, 3, 150, 91, 91, 19],
    [0, 0, 0, 2, 52, 1, 78, 9, 26, 72, 0, 3, 150, 91, 91, 19],
];

/* Constants for the step-width & offset formulas, 16-bit fixed point. */
const K_A: i32 = 39; /* 0.0006 */
const K_B: i32 = 126484; /* 1.9200 */
const K_C: i32 = 5242; /* 0.0800 */
const K_D: i32 = 99614; /* 1.5200 */
const SW_DIVISOR: i64 = 32768; /* Like a right-shift of 15, but unambiguous on signed ints */
const SW_DIVISOR_NO_DQ_OFFSET: i64 = 2147483648; /* Like a right-shift of 31 */
const QM_SCALE_MAX: i64 = 3 << 16;
/* Largest stepwidth that does not overflow the deadzone calculation. */
const DEADZONE_SW_LIMIT: i32 = 12249;

/* 1/255 as U0.16: floor((1.0 / 255.0) * (1 << 16)) */
const FP_ONE_OVER_255: u32 = 257;

/// How the signalled dequantization offset is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequantOffsetMode {
    Default,
    ConstOffset,
}

/// The 16-entry quantization matrix per enhanced LOQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantMatrix {
    values: [[u8; LAYER_COUNT_DDS]; LOQ_ENHANCED_COUNT],
}

impl QuantMatrix {
    pub fn new(values: [[u8; LAYER_COUNT_DDS]; LOQ_ENHANCED_COUNT]) -> Self {
        Self { values }
    }

    /// The signalled default matrix for the scaling mode and transform.
    pub fn default_for(loq0_scaling: ScalingMode, transform: TransformType) -> Self {
        let mut matrix = Self {
            values: [[0; LAYER_COUNT_DDS]; LOQ_ENHANCED_COUNT],
        };
        matrix.set_default(loq0_scaling, transform, LoqIndex::Loq0);
        matrix.set_default(loq0_scaling, transform, LoqIndex::Loq1);
        matrix
    }

    /// Loads the default values for one LOQ.
    pub fn set_default(
        &mut self,
        loq0_scaling: ScalingMode,
        transform: TransformType,
        index: LoqIndex,
    ) {
        let loq = index as usize;
        match transform {
            TransformType::DDS => {
                let defaults = if loq0_scaling == ScalingMode::Scale1D {
                    &QUANT_MATRIX_DEFAULT_DDS_1D
                } else {
                    &QUANT_MATRIX_DEFAULT_DDS_2D
                };
                self.values[loq] = defaults[loq];
            }
            TransformType::DD => {
                let defaults = if loq0_scaling == ScalingMode::Scale1D {
                    &QUANT_MATRIX_DEFAULT_DD_1D
                } else {
                    &QUANT_MATRIX_DEFAULT_DD_2D
                };
                self.values[loq][..LAYER_COUNT_DD].copy_from_slice(&defaults[loq]);
            }
        }
    }

    /// Copies the LOQ0 values over LOQ1, for streams that signal one matrix
    /// for both.
    pub fn duplicate_loqs(&mut self) {
        self.values[LoqIndex::Loq1 as usize] = self.values[LoqIndex::Loq0 as usize];
    }

    pub fn values(&self, index: LoqIndex) -> &[u8; LAYER_COUNT_DDS] {
        &self.values[index as usize]
    }

    pub fn values_mut(&mut self, index: LoqIndex) -> &mut [u8; LAYER_COUNT_DDS] {
        &mut self.values[index as usize]
    }
}

/// Everything the derivation needs from the parsed global configuration.
#[derive(Debug, Clone)]
pub struct DequantArgs {
    pub plane_count: usize,
    pub layer_count: usize,
    pub dequant_offset_mode: DequantOffsetMode,
    /// Signalled offset; -1 selects the no-offset formulas.
    pub dequant_offset: i32,
    pub temporal_enabled: bool,
    pub temporal_refresh: bool,
    pub temporal_step_width_modifier: u32,
    /// Frame step-widths per LOQ.
    pub step_width: [i32; LOQ_ENHANCED_COUNT],
    pub chroma_step_width_multiplier: u8,
    pub quant_matrix: QuantMatrix,
}

/// Per-(temporal, layer) parameters for one plane and LOQ. 16-aligned so the
/// apply stage can issue full-width vector loads.
#[derive(Debug, Clone, Copy, Default)]
#[repr(align(16))]
pub struct Dequant {
    pub step_width: [[i16; LAYER_COUNT_DDS]; TEMPORAL_COUNT],
    pub offset: [[i16; LAYER_COUNT_DDS]; TEMPORAL_COUNT],
}

/// All planes and LOQs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DequantParams {
    pub values: [[Dequant; MAX_PLANES]; LOQ_ENHANCED_COUNT],
}

impl DequantParams {
    pub fn get(&self, loq: LoqIndex, plane: usize) -> &Dequant {
        &self.values[loq as usize][plane]
    }
}

/// Natural log with U12.4 fixed-point precision. The integer part never
/// exceeds 10 in range (ln(32768) = 10.4) but must stay within 4 bits.
pub fn fixed_point_u12_4_ln(step_width: i32) -> f64 {
    let ln = f64::from(step_width).ln();
    let integer = ln.floor();
    debug_assert!((0.0..16.0).contains(&integer));
    let fractional = ((ln - integer) * 4096.0).floor() / 4096.0;
    integer + fractional
}

/// The temporal step-width modifier, clamped to [0, 0.5] in U0.16, applied
/// multiplicatively.
pub fn fixed_point_temporal_step_width(modifier: u32, unmodified: i16) -> i32 {
    let step_width_modifier = (modifier * FP_ONE_OVER_255).min(1 << 15);
    let multiplier = (1u32 << 16) - step_width_modifier;
    let floored = (multiplier * unmodified as u32) >> 16;
    (floored as i32).clamp(MIN_STEP_WIDTH, MAX_STEP_WIDTH)
}

fn dequant_offset_actual(
    layer_sw: i32,
    master_sw: i32,
    dequant_offset: i32,
    mode: DequantOffsetMode,
) -> i32 {
    if dequant_offset == -1 || dequant_offset == 0 {
        return 0;
    }

    let log_layer_sw = (-f64::from(K_C) * fixed_point_u12_4_ln(layer_sw)) as i64;
    let log_master_sw = (f64::from(K_C) * fixed_point_u12_4_ln(master_sw)) as i64;

    let offset = match mode {
        DequantOffsetMode::Default => i64::from(dequant_offset) << 11,
        DequantOffsetMode::ConstOffset => i64::from(dequant_offset) << 9,
    };

    (((log_layer_sw + offset + log_master_sw) * i64::from(layer_sw)) >> 16) as i32
}

fn step_width_modifier(
    layer_sw: i32,
    dequant_offset_actual: i32,
    offset: i32,
    mode: DequantOffsetMode,
) -> i32 {
    if offset == -1 {
        let log_by_layer_sw = (f64::from(K_D) - f64::from(K_C) * fixed_point_u12_4_ln(layer_sw)) as i64;
        let pow = log_by_layer_sw * i64::from(layer_sw) * i64::from(layer_sw);
        return (pow / SW_DIVISOR_NO_DQ_OFFSET) as i32;
    }

    match mode {
        DequantOffsetMode::Default => {
            ((i64::from(dequant_offset_actual) * i64::from(layer_sw)) / SW_DIVISOR) as i32
        }
        DequantOffsetMode::ConstOffset => 0,
    }
}

fn deadzone_width(master_sw: i32, layer_sw: i32) -> i32 {
    if master_sw <= 16 {
        return master_sw >> 1;
    }

    if layer_sw > DEADZONE_SW_LIMIT {
        return i32::MAX;
    }

    (((1 << 16) - ((K_A * layer_sw + K_B) >> 1)) * layer_sw) >> 16
}

fn applied_dequant_offset(
    dequant_offset_actual: i32,
    deadzone: i32,
    offset: i32,
    mode: DequantOffsetMode,
) -> i16 {
    if offset == -1 || mode == DequantOffsetMode::Default {
        return (-deadzone) as i16;
    }
    (dequant_offset_actual - deadzone) as i16
}

fn apply_chroma_multiplier(step_width: i32, multiplier: u8) -> i32 {
    ((step_width * i32::from(multiplier)) >> 6).clamp(MIN_STEP_WIDTH, MAX_STEP_WIDTH)
}

fn loq_step_width(args: &DequantArgs, plane: usize, loq: LoqIndex) -> i32 {
    if plane > 0 && loq == LoqIndex::Loq0 {
        apply_chroma_multiplier(
            args.step_width[loq as usize],
            args.chroma_step_width_multiplier,
        )
    } else {
        args.step_width[loq as usize]
    }
}

fn calculate_plane_loq(args: &DequantArgs, plane: usize, loq: LoqIndex) -> Dequant {
    let quant_matrix = args.quant_matrix.values(loq);
    let loq_sw = loq_step_width(args, plane, loq);
    let mut out = Dequant::default();

    for temporal in 0..TEMPORAL_COUNT {
        let mut temporal_sw = loq_sw;

        // The inter case at LOQ0 gets a reduced step-width while temporal
        // prediction is running.
        if temporal == TemporalSignal::Inter as usize
            && loq == LoqIndex::Loq0
            && args.temporal_enabled
            && !args.temporal_refresh
        {
            temporal_sw = fixed_point_temporal_step_width(
                args.temporal_step_width_modifier,
                temporal_sw as i16,
            );
        }

        for layer in 0..args.layer_count {
            // The scaled quantization matrix, qm_p in the standard, rounded
            // up and clamped to range. Safe in i64: layer_qm and temporal_sw
            // are at most 17 and 16 bits.
            let mut layer_qm = i64::from(quant_matrix[layer]);
            layer_qm *= i64::from(temporal_sw);
            layer_qm += 1 << 16;
            layer_qm = layer_qm.clamp(0, QM_SCALE_MAX);
            layer_qm *= i64::from(temporal_sw);
            layer_qm >>= 16;

            let mut layer_sw =
                layer_qm.clamp(i64::from(MIN_STEP_WIDTH), i64::from(MAX_STEP_WIDTH)) as i32;

            let offset_actual = dequant_offset_actual(
                layer_sw,
                temporal_sw,
                args.dequant_offset,
                args.dequant_offset_mode,
            );
            let modifier = step_width_modifier(
                layer_sw,
                offset_actual,
                args.dequant_offset,
                args.dequant_offset_mode,
            );

            layer_sw = (layer_sw + modifier).clamp(MIN_STEP_WIDTH, MAX_STEP_WIDTH);
            // Safe: clamped to MAX_STEP_WIDTH, which is i16::MAX.
            out.step_width[temporal][layer] = layer_sw as i16;

            let deadzone = deadzone_width(temporal_sw, layer_sw);
            out.offset[temporal][layer] = applied_dequant_offset(
                offset_actual,
                deadzone,
                args.dequant_offset,
                args.dequant_offset_mode,
            );
        }
    }

    out
}

/// Derives the dequantization parameters for every plane and enhanced LOQ.
pub fn calculate(args: &DequantArgs) -> DequantParams {
    let mut params = DequantParams::default();

    for plane in 0..args.plane_count.min(MAX_PLANES) {
        for (loq_idx, loq) in [LoqIndex::Loq0, LoqIndex::Loq1].into_iter().enumerate() {
            params.values[loq_idx][plane] = calculate_plane_loq(args, plane, loq);
        }
    }

    params
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    fn base_args() -> DequantArgs {
        DequantArgs {
            plane_count: 1,
            layer_count: 16,
            dequant_offset_mode: DequantOffsetMode::Default,
            dequant_offset: -1,
            temporal_enabled: false,
            temporal_refresh: false,
            temporal_step_width_modifier: 0,
            step_width: [1000, 1000],
            chroma_step_width_multiplier: 64,
            quant_matrix: QuantMatrix::new([[0; 16]; 2]),
        }
    }

    #[test]
    fn zero_matrix_passes_step_width_through() {
        // With a zero quantization matrix the layer step-width equals the
        // frame step-width; the no-offset modifier then nudges it up.
        let params = calculate(&base_args());
        let dequant = params.get(LoqIndex::Loq0, 0);
        for temporal in 0..TEMPORAL_COUNT {
            for layer in 0..16 {
                assert_eq!(dequant.step_width[temporal][layer], 1029);
                assert_eq!(dequant.offset[temporal][layer], 280);
            }
        }
    }

    #[test]
    fn chroma_multiplier_scales_loq0_only() {
        let mut args = base_args();
        args.plane_count = 2;
        args.chroma_step_width_multiplier = 128;
        let params = calculate(&args);

        // Luma is untouched.
        assert_eq!(params.get(LoqIndex::Loq0, 0).step_width[0][0], 1029);
        // Chroma at LOQ0 runs at (1000 * 128) >> 6 = 2000.
        assert_eq!(params.get(LoqIndex::Loq0, 1).step_width[0][0], 2111);
        assert_eq!(params.get(LoqIndex::Loq0, 1).offset[0][0], 1253);
        // Chroma at LOQ1 is not scaled.
        assert_eq!(params.get(LoqIndex::Loq1, 1).step_width[0][0], 1029);
    }

    #[test]
    fn temporal_modifier_reduces_inter_step_width() {
        let mut args = base_args();
        args.temporal_enabled = true;
        args.temporal_step_width_modifier = 128;
        let params = calculate(&args);
        let dequant = params.get(LoqIndex::Loq0, 0);

        // modifier 128 * 257 clamps to 0.5 in U0.16: inter runs at half the
        // step-width.
        assert_eq!(dequant.step_width[TemporalSignal::Inter as usize][0], 507);
        assert_eq!(dequant.offset[TemporalSignal::Inter as usize][0], 59);
        // Intra is unaffected, as is everything at LOQ1.
        assert_eq!(dequant.step_width[TemporalSignal::Intra as usize][0], 1029);
        assert_eq!(params.get(LoqIndex::Loq1, 0).step_width[0][0], 1029);

        // A refresh frame suspends the modifier.
        args.temporal_refresh = true;
        let params = calculate(&args);
        assert_eq!(
            params.get(LoqIndex::Loq0, 0).step_width[TemporalSignal::Inter as usize][0],
            1029
        );
    }

    #[test]
    fn small_step_width_uses_half_deadzone() {
        let mut args = base_args();
        args.step_width = [10, 10];
        let params = calculate(&args);
        let dequant = params.get(LoqIndex::Loq0, 0);
        assert_eq!(dequant.step_width[0][0], 10);
        assert_eq!(dequant.offset[0][0], -5);
    }

    #[test]
    fn const_offset_mode() {
        let mut args = base_args();
        args.dequant_offset = 50;
        args.dequant_offset_mode = DequantOffsetMode::ConstOffset;
        let params = calculate(&args);
        let dequant = params.get(LoqIndex::Loq0, 0);

        // The ln terms cancel when layer and master step-widths agree:
        // offsetActual = (50 << 9) * 1000 >> 16 = 390; no modifier.
        assert_eq!(dequant.step_width[0][0], 1000);
        assert_eq!(dequant.offset[0][0], 390 + 263);
    }

    #[test]
    fn default_offset_mode() {
        let mut args = base_args();
        args.dequant_offset = 50;
        args.dequant_offset_mode = DequantOffsetMode::Default;
        let params = calculate(&args);
        let dequant = params.get(LoqIndex::Loq0, 0);

        // offsetActual = (50 << 11) * 1000 >> 16 = 1562;
        // modifier = 1562 * 1000 / 32768 = 47.
        assert_eq!(dequant.step_width[0][0], 1047);
        assert_eq!(dequant.offset[0][0], 290);
    }

    #[test]
    fn quant_matrix_scales_layers() {
        let mut args = base_args();
        let mut values = [[0u8; 16]; 2];
        values[0][3] = 32; // one layer quantized harder at LOQ0
        args.quant_matrix = QuantMatrix::new(values);
        let params = calculate(&args);
        let dequant = params.get(LoqIndex::Loq0, 0);

        // qm_p = (32 * 1000 + 65536) * 1000 >> 16 = 1488; the no-offset
        // modifier then lifts it to 1551.
        assert_eq!(dequant.step_width[0][3], 1551);
        assert_eq!(dequant.offset[0][3], 662);
        assert_eq!(dequant.step_width[0][0], 1029);
    }

    #[test]
    fn default_matrices_match_scaling_and_transform() {
        let dds_2d = QuantMatrix::default_for(ScalingMode::Scale2D, TransformType::DDS);
        assert_eq!(dds_2d.values(LoqIndex::Loq0)[8], 26);

        let dds_1d = QuantMatrix::default_for(ScalingMode::Scale1D, TransformType::DDS);
        assert_eq!(dds_1d.values(LoqIndex::Loq0)[8], 13);

        let dd = QuantMatrix::default_for(ScalingMode::Scale2D, TransformType::DD);
        assert_eq!(&dd.values(LoqIndex::Loq0)[..4], &[32, 3, 0, 32]);

        let mut matrix = dds_2d;
        matrix.values_mut(LoqIndex::Loq0)[0] = 99;
        matrix.duplicate_loqs();
        assert_eq!(matrix.values(LoqIndex::Loq1)[0], 99);
    }
}
