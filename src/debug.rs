use num::Float;

// Helper function for comparing floats
pub fn assert_approx_eq<F>(a: &F, b: &F, epsilon: F)
where
    F: Float + std::fmt::Display + std::fmt::Debug,
{
    assert!(
        (*a - *b).abs() <= epsilon,
        "Values differ: {:?} vs {:?} (tolerance: {:?})",
        *a,
        *b,
        epsilon
    );
}

/// Element-wise [`assert_approx_eq`] over two slices of equal length.
pub fn assert_all_approx_eq<F>(a: &[F], b: &[F], epsilon: F)
where
    F: Float + std::fmt::Display + std::fmt::Debug,
{
    assert_eq!(a.len(), b.len(), "length differs: {} vs {}", a.len(), b.len());
    a.iter()
        .zip(b)
        .for_each(|(x, y)| assert_approx_eq(x, y, epsilon));
}
