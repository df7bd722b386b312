use itertools::izip;
use multiversion::multiversion;

/// `log(sum(exp(values)))`, shifted by the maximum to avoid overflow.
pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&val| (val - max).exp()).sum();
    max + sum.ln()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());

    let mut result = 0f64;
    for (val1, val2) in a.iter().zip(b) {
        result = val1.mul_add(*val2, result);
    }
    result
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());

    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    let n = x.len();
    assert!(y.len() == n);

    izip!(x, y).for_each(|(x, y)| {
        *y = a.mul_add(*x, *y);
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn sub_out(x: &[f64], y: &[f64], out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = x - y;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn check_log_sum_exp(values in proptest::collection::vec(-50f64..50f64, 1..20)) {
            let expected = values.iter().map(|val| val.exp()).sum::<f64>().ln();
            prop_assert!((log_sum_exp(&values) - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn check_log_sum_exp_limits() {
        assert_eq!(
            log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]),
            f64::NEG_INFINITY
        );
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY, 2.]), 2.);
        assert_relative_eq!(log_sum_exp(&[1000., 1000.]), 1000. + 2f64.ln(), epsilon = 1e-12);
        assert!(log_sum_exp(&[f64::NAN, 1.]).is_nan());
    }

    #[test]
    fn check_vector_ops() {
        let a = [1., 2., 3., 4., 5.];
        let b = [0.5, -1., 2., 0., 1.];
        assert_relative_eq!(vector_dot(&a, &b), 9.5, epsilon = 1e-12);
        assert_relative_eq!(squared_distance(&a, &b), 0.25 + 9. + 1. + 16. + 16., epsilon = 1e-12);

        let mut y = b;
        axpy(&a, &mut y, 2.);
        assert_eq!(y, [2.5, 3., 8., 8., 11.]);

        let mut out = [0f64; 5];
        sub_out(&a, &b, &mut out);
        assert_eq!(out, [0.5, 3., 1., 4., 4.]);
    }
}
