//! Orthonormal 8x8 block DCT.
//!
//! `rustdct` computes the unnormalized DCT-II, `X_k = sum x_n cos(pi k (2n + 1) / 2N)`,
//! and the DCT-III with a halved DC term. The scale factors below turn that pair
//! into the orthonormal transform (`norm='ortho'` in scipy terms), so the
//! transform preserves energy and `inverse(forward(x)) == x`.

use std::sync::Arc;

use rustdct::{DctPlanner, TransformType2And3};

/// Edge length of a transform block.
pub const BLOCK_SIZE: usize = 8;

/// Number of samples in a block.
pub const BLOCK_AREA: usize = BLOCK_SIZE * BLOCK_SIZE;

/// A square block, row-major.
pub type Block = [f64; BLOCK_AREA];

/// Forward/inverse orthonormal 2D DCT on [`BLOCK_SIZE`] square blocks.
///
/// Cheap to clone; the planned 1D transform is shared.
#[derive(Clone)]
pub struct BlockTransform {
    dct: Arc<dyn TransformType2And3<f64>>,
    dc_scale: f64,
    ac_scale: f64,
}

impl std::fmt::Debug for BlockTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockTransform")
            .field("block_size", &BLOCK_SIZE)
            .finish_non_exhaustive()
    }
}

impl Default for BlockTransform {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(PartialEq, Debug, Copy, Clone)]
enum Direction {
    Row,
    Column,
}

impl BlockTransform {
    /// Plan the 1D transforms.
    #[must_use]
    pub fn new() -> Self {
        let mut planner = DctPlanner::<f64>::new();
        #[allow(clippy::cast_precision_loss)]
        let n = BLOCK_SIZE as f64;
        Self {
            dct: planner.plan_dct2(BLOCK_SIZE),
            dc_scale: (1.0 / n).sqrt(),
            ac_scale: (2.0 / n).sqrt(),
        }
    }

    /// Transform a spatial block into frequency coefficients.
    #[must_use]
    pub fn forward(&self, block: &Block) -> Block {
        let mut out = *block;
        self.apply(&mut out, Direction::Row, true);
        self.apply(&mut out, Direction::Column, true);
        out
    }

    /// Transform frequency coefficients back into a spatial block.
    #[must_use]
    pub fn inverse(&self, coefficients: &Block) -> Block {
        let mut out = *coefficients;
        self.apply(&mut out, Direction::Row, false);
        self.apply(&mut out, Direction::Column, false);
        out
    }

    /// Run the 1D transform along every row or every column, in place.
    fn apply(&self, data: &mut Block, direction: Direction, forward: bool) {
        let (step, skip_mult) = match direction {
            Direction::Row => (1, BLOCK_SIZE),
            Direction::Column => (BLOCK_SIZE, 1),
        };
        let mut tmp = [0.0_f64; BLOCK_SIZE];

        for i in 0..BLOCK_SIZE {
            for (k, value) in tmp.iter_mut().enumerate() {
                *value = data[i * skip_mult + k * step];
            }

            if forward {
                self.dct.process_dct2(&mut tmp);
                tmp[0] *= self.dc_scale;
                for value in &mut tmp[1..] {
                    *value *= self.ac_scale;
                }
            } else {
                // DCT-III halves the DC input, so it is pre-scaled by 2/sqrt(N).
                tmp[0] *= 2.0 * self.dc_scale;
                for value in &mut tmp[1..] {
                    *value *= self.ac_scale;
                }
                self.dct.process_dct3(&mut tmp);
            }

            for (k, value) in tmp.iter().enumerate() {
                data[i * skip_mult + k * step] = *value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_equal(a: &[f64], b: &[f64], max_error: f64) {
        assert_eq!(a.len(), b.len(), "a and b are not equal length");
        for (i, (av, bv)) in a.iter().zip(b.iter()).enumerate() {
            let delta = (av - bv).abs();
            assert!(
                delta <= max_error,
                "index {i}: {av} vs {bv}, delta {delta} exceeded allowed {max_error}"
            );
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn sample_block() -> Block {
        let mut block = [0.0; BLOCK_AREA];
        for (i, v) in block.iter_mut().enumerate() {
            *v = ((i * 37 + 11) % 23) as f64 / 23.0 - 0.3;
        }
        block
    }

    #[test]
    fn round_trip_restores_block() {
        let t = BlockTransform::new();
        let block = sample_block();
        let restored = t.inverse(&t.forward(&block));
        approx_equal(&block, &restored, 1e-6);
    }

    #[test]
    fn constant_block_has_only_dc() {
        let t = BlockTransform::new();
        let block = [0.5; BLOCK_AREA];
        let coeffs = t.forward(&block);
        // Orthonormal DC of a constant block is N * value.
        assert!((coeffs[0] - 4.0).abs() < 1e-9, "DC was {}", coeffs[0]);
        for c in &coeffs[1..] {
            assert!(c.abs() < 1e-9, "AC coefficient {c} should vanish");
        }
    }

    #[test]
    fn transform_preserves_energy() {
        let t = BlockTransform::new();
        let block = sample_block();
        let coeffs = t.forward(&block);
        let e_spatial: f64 = block.iter().map(|v| v * v).sum();
        let e_freq: f64 = coeffs.iter().map(|v| v * v).sum();
        assert!(
            (e_spatial - e_freq).abs() < 1e-9,
            "energy {e_spatial} vs {e_freq}"
        );
    }

    #[test]
    fn single_coefficient_inverts_to_basis_function() {
        let t = BlockTransform::new();
        let mut coeffs = [0.0; BLOCK_AREA];
        coeffs[2 * BLOCK_SIZE + 3] = 1.0;
        let spatial = t.inverse(&coeffs);
        let back = t.forward(&spatial);
        approx_equal(&coeffs, &back, 1e-9);
        let norm: f64 = spatial.iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-9, "basis norm {norm}");
    }
}
