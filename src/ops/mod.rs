//! Operator entry points
//!
//! Each operator validates shapes up front (nothing is recorded on a
//! contract violation), builds its constant block, and issues one blocking
//! dispatch. Outputs are passed in already shaped; on success their image
//! (or buffer, for the copy operators) holds the result and is marked
//! authoritative.

pub mod arithmetic;
pub mod conv;
pub mod copy;
pub mod matmul;
pub mod pool;
pub mod reduction;

pub use arithmetic::{add, add_scalar, clamp, mul_scalar};
pub use conv::{
    conv2d, conv2d_depthwise, conv2d_nogroup, conv2d_with_host_weights, Bias, Conv2dParams,
    Conv2dPrepacked, ConvKind,
};
pub use copy::{cat, cat_output_shape, reshape_copy};
pub use matmul::{addmm, mm};
pub use pool::{adaptive_avg_pool2d, max_pool2d, upsample_nearest2d, Pool2dParams};
pub use reduction::mean;

use crate::ensure_contract;
use crate::error::Result;

/// `actual` must equal `expected`.
pub(crate) fn expect_shape(op: &str, what: &str, actual: &[usize], expected: &[usize]) -> Result<()> {
    ensure_contract!(
        actual == expected,
        "{}: {} has shape {:?}, expected {:?}",
        op,
        what,
        actual,
        expected
    );
    Ok(())
}

/// `shape` must have exactly `rank` dims.
pub(crate) fn expect_rank(op: &str, what: &str, shape: &[usize], rank: usize) -> Result<()> {
    ensure_contract!(
        shape.len() == rank,
        "{}: {} must be {}-D, got shape {:?}",
        op,
        what,
        rank,
        shape
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_helpers() {
        assert!(expect_shape("add", "output", &[1, 2], &[1, 2]).is_ok());
        let err = expect_shape("add", "output", &[1, 2], &[2, 1]).unwrap_err();
        assert!(err.to_string().contains("add: output has shape [1, 2]"));

        assert!(expect_rank("mm", "m1", &[3, 4], 2).is_ok());
        assert!(expect_rank("mm", "m1", &[3, 4, 5], 2)
            .unwrap_err()
            .is_contract_violation());
    }
}
