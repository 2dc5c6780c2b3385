//! Block split of the dense crossbar matrix.

use nalgebra::{SMatrix, SVector};

use crate::circuit::DenseMatrix;
use crate::elements::NUM_M0_SLOTS;

/// An 8-wide signal bus (M0 outputs, M0 inputs, M1 bus, multiplier inputs).
pub type Vector8 = SVector<f64, 8>;

/// One 8x8 block of the crossbar matrix.
pub type Block8 = SMatrix<f64, 8, 8>;

/// The crossbar matrix as four 8x8 blocks.
///
/// Rows are crossbar inputs, columns crossbar outputs:
/// ```text
///              M0 out (0..8)   M1 bus (8..16)
/// M0 in  (0..8)      D               C
/// Mul in (8..16)     B               A
/// ```
/// The M1 bus carries the four multiplier outputs, two unused outputs
/// and the two constant crosslanes.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMatrix {
    /// M1 bus -> multiplier inputs
    pub a: Block8,
    /// M0 outputs -> multiplier inputs
    pub b: Block8,
    /// M1 bus -> M0 inputs
    pub c: Block8,
    /// M0 outputs -> M0 inputs
    pub d: Block8,
}

impl BlockMatrix {
    /// Split a dense crossbar matrix.
    pub fn from_dense(matrix: &DenseMatrix) -> Self {
        const N: usize = NUM_M0_SLOTS;
        Self {
            a: matrix.fixed_view::<8, 8>(N, N).into_owned(),
            b: matrix.fixed_view::<8, 8>(N, 0).into_owned(),
            c: matrix.fixed_view::<8, 8>(0, N).into_owned(),
            d: matrix.fixed_view::<8, 8>(0, 0).into_owned(),
        }
    }

    /// Reassemble the dense matrix.
    pub fn to_dense(&self) -> DenseMatrix {
        const N: usize = NUM_M0_SLOTS;
        let mut matrix = DenseMatrix::zeros();
        matrix.fixed_view_mut::<8, 8>(N, N).copy_from(&self.a);
        matrix.fixed_view_mut::<8, 8>(N, 0).copy_from(&self.b);
        matrix.fixed_view_mut::<8, 8>(0, N).copy_from(&self.c);
        matrix.fixed_view_mut::<8, 8>(0, 0).copy_from(&self.d);
        matrix
    }

    /// `Min = A·Mout + B·Iout`
    pub fn multiplier_inputs(&self, mout: &Vector8, iout: &Vector8) -> Vector8 {
        self.a * mout + self.b * iout
    }

    /// `Iin = C·Mout + D·Iout`
    pub fn m0_inputs(&self, mout: &Vector8, iout: &Vector8) -> Vector8 {
        self.c * mout + self.d * iout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_positions() {
        let mut dense = DenseMatrix::zeros();
        dense[(9, 10)] = 1.0; // multiplier 1 output -> multiplier 0 input b
        dense[(8, 3)] = 2.0; // M0 3 -> multiplier 0 input a
        dense[(2, 15)] = 3.0; // constant -> M0 2
        dense[(1, 0)] = 4.0; // M0 0 -> M0 1

        let blocks = BlockMatrix::from_dense(&dense);
        assert_eq!(blocks.a[(1, 2)], 1.0);
        assert_eq!(blocks.b[(0, 3)], 2.0);
        assert_eq!(blocks.c[(2, 7)], 3.0);
        assert_eq!(blocks.d[(1, 0)], 4.0);
        assert_eq!(blocks.to_dense(), dense);
    }

    #[test]
    fn test_bus_products() {
        let mut dense = DenseMatrix::zeros();
        dense[(8, 0)] = 0.5;
        dense[(0, 8)] = -2.0;
        let blocks = BlockMatrix::from_dense(&dense);

        let iout = Vector8::from_element(1.0);
        let mout = Vector8::from_element(3.0);
        assert_eq!(blocks.multiplier_inputs(&mout, &iout)[0], 0.5);
        assert_eq!(blocks.m0_inputs(&mout, &iout)[0], -6.0);
    }
}
