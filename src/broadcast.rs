use burn::{prelude::Backend, tensor::Tensor};

/// Expands a column vector `[n]` and a row vector `[m]` into two `[n, m]` matrices so they
/// can be combined element-wise, e.g. to compare every ground truth box with every anchor.
///
/// ```text
///  col = [a, b]    row = [x, y, z]
///
///  [[a, a, a],     [[x, y, z],
///   [b, b, b]]      [x, y, z]]
/// ```
pub fn pairwise<B: Backend>(
    col: Tensor<B, 1>,
    row: Tensor<B, 1>,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let [n] = col.dims();
    let [m] = row.dims();

    (
        col.reshape([n, 1]).expand([n, m]),
        row.reshape([1, m]).expand([n, m]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    #[test]
    pub fn test_pairwise() {
        let device = &NdArrayDevice::default();
        type B = NdArray<f32>;

        let col = Tensor::<B, 1>::from_floats([1.0, 2.0], device);
        let row = Tensor::<B, 1>::from_floats([4.0, 5.0, 6.0], device);

        let (a, b) = pairwise(col, row);

        let expected_a = Tensor::<B, 2>::from_floats([[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]], device);
        let expected_b = Tensor::<B, 2>::from_floats([[4.0, 5.0, 6.0], [4.0, 5.0, 6.0]], device);

        a.into_data().assert_eq(&expected_a.into_data(), true);
        b.into_data().assert_eq(&expected_b.into_data(), true);
    }
}
